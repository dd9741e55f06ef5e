use postcard::{from_bytes, to_stdvec};
use serde::{Deserialize, Serialize};
use sled::transaction::{ConflictableTransactionError, TransactionError, Transactional};
use sled::{Db, Tree};

use crate::shared::crypto::{hash_data, CommitRoot, Hash, HashBlock};
use crate::shared::dc_repr::Metadata;

use super::DCServerError;

fn open_tree(db: &Db, prefix: u8, dc_name: &Hash) -> Result<Tree, sled::Error> {
    let mut name = [0; 40]; // multiple of 8 for good luck
    name[0] = prefix;
    name[8..].copy_from_slice(dc_name);
    db.open_tree(name)
}

// first write wins
fn insert_if_absent(tree: &Tree, key: &[u8], value: Vec<u8>) -> Result<bool, sled::Error> {
    Ok(tree.compare_and_swap(key, None::<&[u8]>, Some(value))?.is_ok())
}

// key: datacapsule hash
// value: datacapsule metadata
#[derive(Clone)]
pub struct MetaStorage(Tree);
impl MetaStorage {
    pub fn new(db: &Db) -> Result<Self, sled::Error> {
        Ok(Self(db.open_tree(b"M")?))
    }

    /// Returns false if the capsule already existed.
    pub fn store(&self, dc_name: &Hash, dc: &Metadata) -> Result<bool, DCServerError> {
        Ok(insert_if_absent(&self.0, dc_name, to_stdvec(dc)?)?)
    }

    pub fn get(&self, dc_name: &Hash) -> Result<Option<Metadata>, DCServerError> {
        Ok(match self.0.get(dc_name)? {
            Some(d) => Some(from_bytes(&d)?),
            None => None,
        })
    }

    pub fn contains(&self, dc_name: &Hash) -> Result<bool, DCServerError> {
        Ok(self.0.contains_key(dc_name)?)
    }
}

// key: record hash
// value: encrypted record data
#[derive(Clone)]
pub struct DataStorage(Tree);
impl DataStorage {
    pub fn new(db: &Db, dc_name: &Hash) -> Result<Self, sled::Error> {
        Ok(Self(open_tree(db, b'D', dc_name)?))
    }

    pub fn store(&self, record_name: &Hash, record_data: &[u8]) -> Result<(), DCServerError> {
        if hash_data(record_data) != *record_name {
            return Err(DCServerError::PayloadHashMismatch);
        }
        self.0.insert(record_name, record_data)?;
        Ok(())
    }

    pub fn get(&self, record_name: &Hash) -> Result<Option<Vec<u8>>, DCServerError> {
        Ok(self.0.get(record_name)?.map(|d| d.to_vec()))
    }

    pub fn contains(&self, record_name: &Hash) -> Result<bool, DCServerError> {
        Ok(self.0.contains_key(record_name)?)
    }
}

fn record_entry(sequence_number: u64, parent: &Hash) -> Vec<u8> {
    let mut data = Vec::with_capacity(40);
    data.extend_from_slice(&sequence_number.to_le_bytes());
    data.extend_from_slice(parent);
    data
}

// key: record hash
// value: {sequence_number, parent}
#[derive(Clone)]
pub struct RecordStorage(Tree);
impl RecordStorage {
    pub fn new(db: &Db, dc_name: &Hash) -> Result<Self, sled::Error> {
        Ok(Self(open_tree(db, b'R', dc_name)?))
    }

    pub fn get(&self, record_name: &Hash) -> Result<Option<(u64, Hash)>, DCServerError> {
        let d = match self.0.get(record_name)? {
            Some(d) => d,
            None => return Ok(None),
        };
        if d.len() != 40 {
            return Err(DCServerError::Other("corrupt record entry".into()));
        }
        let (a, b) = d.split_at(8);
        let mut sn = [0; 8];
        sn.copy_from_slice(a);
        let mut parent = [0; 32];
        parent.copy_from_slice(b);
        Ok(Some((u64::from_le_bytes(sn), parent)))
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct StoredNode {
    pub parent: Option<Hash>,
    pub sequence_number: u64,
    /// Depth of the commit tree, set only on a commit's root block.
    pub root_depth: Option<u8>,
    pub children: HashBlock,
}

// key: node hash
// value: StoredNode
#[derive(Clone)]
pub struct NodeStorage(Tree);
impl NodeStorage {
    pub fn new(db: &Db, dc_name: &Hash) -> Result<Self, sled::Error> {
        Ok(Self(open_tree(db, b'N', dc_name)?))
    }

    pub fn get(&self, node_name: &Hash) -> Result<Option<StoredNode>, DCServerError> {
        Ok(match self.0.get(node_name)? {
            Some(d) => Some(from_bytes(&d)?),
            None => None,
        })
    }
}

// key: big-endian seqno, so iteration order is sequence order
// value: commit root
#[derive(Clone)]
pub struct SequenceStorage(Tree);
impl SequenceStorage {
    pub fn new(db: &Db, dc_name: &Hash) -> Result<Self, sled::Error> {
        Ok(Self(open_tree(db, b'S', dc_name)?))
    }

    pub fn get(&self, sequence_number: u64) -> Result<Option<CommitRoot>, DCServerError> {
        Ok(match self.0.get(sequence_number.to_be_bytes())? {
            Some(d) => Some(from_bytes(&d)?),
            None => None,
        })
    }

    pub fn last(&self) -> Result<Option<CommitRoot>, DCServerError> {
        Ok(match self.0.last()? {
            Some((_, v)) => Some(from_bytes(&v)?),
            None => None,
        })
    }
}

/// Everything one commit adds to the log.
pub struct CommitWrite<'a> {
    pub root: &'a CommitRoot,
    /// (record, parent block)
    pub records: Vec<(Hash, Hash)>,
    pub nodes: Vec<(Hash, StoredNode)>,
    /// The previous commit's root and the block that now points at it.
    pub link: Option<(Hash, Hash)>,
}

fn abort<E: Into<DCServerError>>(e: E) -> ConflictableTransactionError<DCServerError> {
    ConflictableTransactionError::Abort(e.into())
}

/// Writes a sealed commit in one transaction across the record, node and
/// sequence trees. Records and nodes keep whatever a previous commit already
/// stored for them; a node's parent link is only ever set once.
pub fn write_commit(
    records: &RecordStorage,
    nodes: &NodeStorage,
    sequence: &SequenceStorage,
    commit: &CommitWrite<'_>,
) -> Result<(), DCServerError> {
    let seq = commit.root.sequence_number;
    let record_values: Vec<(Hash, Vec<u8>)> = commit
        .records
        .iter()
        .map(|(name, parent)| (*name, record_entry(seq, parent)))
        .collect();
    let mut node_values = Vec::with_capacity(commit.nodes.len());
    for (name, node) in &commit.nodes {
        node_values.push((*name, to_stdvec(node)?));
    }
    let root_value = to_stdvec(commit.root)?;

    let res = (&records.0, &nodes.0, &sequence.0).transaction(|(rt, nt, st)| {
        for (name, value) in &record_values {
            if rt.get(name)?.is_none() {
                rt.insert(&name[..], value.clone())?;
            }
        }
        for (name, value) in &node_values {
            if nt.get(name)?.is_none() {
                nt.insert(&name[..], value.clone())?;
            }
        }
        if let Some((prev, parent)) = &commit.link {
            let raw = nt.get(prev)?.ok_or_else(|| {
                abort(DCServerError::NotFound(format!("node {:02x?}", &prev[..4])))
            })?;
            let mut node: StoredNode = from_bytes(&raw).map_err(abort)?;
            if node.parent.is_none() {
                node.parent = Some(*parent);
                nt.insert(&prev[..], to_stdvec(&node).map_err(abort)?)?;
            }
        }
        // the sequence entry makes the commit visible
        st.insert(&seq.to_be_bytes()[..], root_value.clone())?;
        Ok::<_, ConflictableTransactionError<DCServerError>>(())
    });
    match res {
        Ok(()) => Ok(()),
        Err(TransactionError::Abort(e)) => Err(e),
        Err(TransactionError::Storage(e)) => Err(e.into()),
    }
}
