//! The hash-chain log of one datacapsule: sealing commits, looking things up
//! by sequence number, and building proofs for readers.

use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
};

use sled::Db;
use tokio::sync::watch;

use crate::shared::config::{FANOUT, MAX_MESSAGE_LEN};
use crate::shared::crypto::{sign, CommitRoot, Hash, PrivateKey, PublicKey, Signature, NULL_HASH};
use crate::shared::dc_repr::ProofElement;
use crate::shared::merkle::seal;
use crate::shared::readstate::ReadState;

use super::storage::{
    write_commit, CommitWrite, DataStorage, NodeStorage, RecordStorage, SequenceStorage, StoredNode,
};
use super::DCServerError;

fn short(h: &Hash) -> String {
    h[..4].iter().map(|b| format!("{:02x}", b)).collect()
}

/// Where a proof stops climbing.
pub enum Anchor<'a> {
    /// Stop at the first hash the reader already trusts, or at the commit
    /// root sealing the record. The reader's trust state is mirrored here and
    /// updated exactly as the reader will update its own.
    Nearest(&'a mut ReadState),
    /// Climb through every later commit up to the given tip.
    Tip,
}

/// Blocks a single proof may carry and still fit in one message, leaving
/// room for the commit root and framing.
pub const MAX_PROOF_BLOCKS: usize = MAX_MESSAGE_LEN / (FANOUT * 32 + 1) - 2;

#[derive(Clone)]
pub struct ChainStorage {
    data: DataStorage,
    records: RecordStorage,
    nodes: NodeStorage,
    sequence: SequenceStorage,
    max_proof_blocks: usize,
}

impl ChainStorage {
    pub fn open(db: &Db, dc_name: &Hash) -> Result<Self, DCServerError> {
        Ok(Self {
            data: DataStorage::new(db, dc_name)?,
            records: RecordStorage::new(db, dc_name)?,
            nodes: NodeStorage::new(db, dc_name)?,
            sequence: SequenceStorage::new(db, dc_name)?,
            max_proof_blocks: MAX_PROOF_BLOCKS,
        })
    }

    pub fn with_max_proof_blocks(mut self, max_proof_blocks: usize) -> Self {
        self.max_proof_blocks = max_proof_blocks;
        self
    }

    pub fn store_data_block(&self, hash: &Hash, data: &[u8]) -> Result<(), DCServerError> {
        self.data.store(hash, data)
    }

    pub fn load_data_block(&self, hash: &Hash) -> Result<Vec<u8>, DCServerError> {
        self.data
            .get(hash)?
            .ok_or_else(|| DCServerError::NotFound(format!("data {}", short(hash))))
    }

    pub fn tip(&self) -> Result<Option<CommitRoot>, DCServerError> {
        self.sequence.last()
    }

    pub fn commit_at(&self, sequence_number: u64) -> Result<CommitRoot, DCServerError> {
        self.sequence
            .get(sequence_number)?
            .ok_or_else(|| DCServerError::NotFound(format!("commit {}", sequence_number)))
    }

    pub fn sequence_root(&self, sequence_number: u64) -> Result<Option<CommitRoot>, DCServerError> {
        self.sequence.get(sequence_number)
    }

    /// Sequence number of the commit that sealed a record or hash block.
    /// Only commits up to `tip` count.
    pub fn sequence_of(&self, name: &Hash, tip: u64) -> Result<u64, DCServerError> {
        let seq = match self.records.get(name)? {
            Some((seq, _)) => Some(seq),
            None => self.nodes.get(name)?.map(|n| n.sequence_number),
        };
        match seq {
            Some(s) if s <= tip => Ok(s),
            _ => Err(DCServerError::NotFound(format!("name {}", short(name)))),
        }
    }

    /// The bottom row of commit `sequence_number`'s tree, in order. For every
    /// commit but the first, the leading entry is the previous commit's
    /// blockhash rather than a record.
    pub fn leaves_of(&self, sequence_number: u64) -> Result<Vec<Hash>, DCServerError> {
        let root = self.commit_at(sequence_number)?;
        let mut depth = self
            .node(&root.blockhash)?
            .root_depth
            .ok_or_else(|| DCServerError::Other(format!("commit {} has no root", sequence_number)))?;

        let mut level = vec![root.blockhash];
        while depth > 0 {
            let mut next_level = Vec::with_capacity(level.len() * FANOUT);
            for h in &level {
                let node = self.node(h)?;
                next_level.extend(node.children.iter().filter(|c| **c != NULL_HASH));
            }
            level = next_level;
            depth -= 1;
        }
        Ok(level)
    }

    fn node(&self, name: &Hash) -> Result<StoredNode, DCServerError> {
        self.nodes
            .get(name)?
            .ok_or_else(|| DCServerError::NotFound(format!("node {}", short(name))))
    }

    /// Seals `hashes` under the writer's commit root and returns the
    /// server's co-signature over it. Must not run concurrently with another
    /// commit to the same capsule (see [`CapsuleLog::commit`]).
    ///
    /// Resending an already accepted commit returns a fresh co-signature
    /// without changing anything.
    pub fn seal_commit(
        &self,
        writer_key: &PublicKey,
        server_key: &PrivateKey,
        root: &CommitRoot,
        hashes: &[Hash],
    ) -> Result<Signature, DCServerError> {
        if hashes.is_empty() {
            return Err(DCServerError::BadRequest("empty commit".into()));
        }
        if !root.verify(writer_key) {
            return Err(DCServerError::SignatureInvalid);
        }

        let tip = self.tip()?;
        let tip_seq = tip.as_ref().map_or(0, |t| t.sequence_number);
        if let Some(existing) = self.sequence.get(root.sequence_number)? {
            if existing.blockhash == root.blockhash {
                return Ok(sign(&root.signed.hash, server_key)?);
            }
            return Err(DCServerError::SequenceConflict { tip: tip_seq });
        }
        if root.sequence_number != tip_seq + 1 {
            return Err(DCServerError::SequenceConflict { tip: tip_seq });
        }

        for h in hashes {
            if !self.data.contains(h)? {
                return Err(DCServerError::NotFound(format!("record {}", short(h))));
            }
        }
        let previous = tip.as_ref().map(|t| &t.blockhash);
        let tree = seal(previous, hashes)
            .ok_or_else(|| DCServerError::BadRequest("empty commit".into()))?;
        if tree.root != root.blockhash {
            return Err(DCServerError::PayloadHashMismatch);
        }

        let seq = root.sequence_number;
        let commit = CommitWrite {
            root,
            records: tree.records.iter().map(|r| (r.name, r.parent)).collect(),
            nodes: tree
                .nodes
                .iter()
                .map(|n| {
                    let stored = StoredNode {
                        parent: n.parent,
                        sequence_number: seq,
                        root_depth: (n.name == tree.root).then_some(tree.depth),
                        children: n.children,
                    };
                    (n.name, stored)
                })
                .collect(),
            link: previous.copied().zip(tree.link_parent),
        };
        write_commit(&self.records, &self.nodes, &self.sequence, &commit)?;

        tracing::debug!(
            "sealed commit {} ({} records, depth {})",
            seq,
            hashes.len(),
            tree.depth
        );
        Ok(sign(&root.signed.hash, server_key)?)
    }

    /// Builds the proof elements for record `name` as seen at `tip`:
    /// optionally a commit root, then hash blocks from the top down, then
    /// the record data if `with_data` is set.
    pub fn build_proof(
        &self,
        name: &Hash,
        tip: &CommitRoot,
        anchor: Anchor<'_>,
        with_data: bool,
    ) -> Result<Vec<ProofElement>, DCServerError> {
        // every committed record should have a parent
        let mut parent = match self.records.get(name)? {
            Some((seq, p)) if seq <= tip.sequence_number => p,
            _ => return Err(DCServerError::NotFound(format!("record {}", short(name)))),
        };
        // load before touching the mirror, so a failure leaves it alone
        let data = if with_data {
            Some(self.load_data_block(name)?)
        } else {
            None
        };

        let mut blocks = Vec::new();
        let mut root = None;
        match anchor {
            Anchor::Nearest(read_state) => {
                let mut hash = *name;
                // go up the chain (modifying hash and parent)
                while !read_state.contains(&hash) {
                    let parent_node = self.node(&parent)?;
                    blocks.push(parent_node.children);
                    if parent_node.root_depth.is_some() {
                        if !read_state.contains(&parent) {
                            root = Some(self.commit_at(parent_node.sequence_number)?);
                        }
                        break;
                    }
                    hash = parent;
                    parent = parent_node.parent.ok_or_else(|| {
                        DCServerError::Other(format!("dangling node {}", short(&hash)))
                    })?;
                }
                blocks.reverse();

                // add proof to read_state the same way the client does
                if let Some(r) = &root {
                    read_state.add_signed_root(&r.blockhash);
                }
                for b in &blocks {
                    read_state.add_proven_block(b);
                }
            }
            Anchor::Tip => {
                let mut curr = parent;
                loop {
                    if blocks.len() >= self.max_proof_blocks {
                        return Err(DCServerError::BadRequest(format!(
                            "proof for {} needs more than {} blocks",
                            short(name),
                            self.max_proof_blocks
                        )));
                    }
                    let node = self.node(&curr)?;
                    blocks.push(node.children);
                    if curr == tip.blockhash {
                        break;
                    }
                    curr = node.parent.ok_or_else(|| {
                        DCServerError::Other(format!("node {} unlinked below tip", short(&curr)))
                    })?;
                }
                blocks.reverse();
                root = Some(tip.clone());
            }
        }

        let mut proof = Vec::with_capacity(blocks.len() + 2);
        proof.extend(root.map(ProofElement::Root));
        proof.extend(blocks.into_iter().map(ProofElement::Block));
        proof.extend(data.map(ProofElement::Data));
        Ok(proof)
    }
}

/// Per-capsule state shared by all connections.
pub struct CapsuleLog {
    commit_lock: tokio::sync::Mutex<()>,
    tip: watch::Sender<u64>,
}

impl CapsuleLog {
    /// Serializes commits to this capsule and publishes the new tip.
    pub async fn commit(
        &self,
        storage: &ChainStorage,
        writer_key: &PublicKey,
        server_key: &PrivateKey,
        root: &CommitRoot,
        hashes: &[Hash],
    ) -> Result<Signature, DCServerError> {
        let _guard = self.commit_lock.lock().await;
        let signature = storage.seal_commit(writer_key, server_key, root, hashes)?;
        let seq = root.sequence_number;
        self.tip.send_if_modified(|t| {
            if seq > *t {
                *t = seq;
                true
            } else {
                false
            }
        });
        Ok(signature)
    }

    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.tip.subscribe()
    }

    /// Connections currently following the tip.
    pub fn subscriber_count(&self) -> usize {
        self.tip.receiver_count()
    }
}

#[derive(Clone, Default)]
pub struct CapsuleRegistry(Arc<Mutex<HashMap<Hash, Arc<CapsuleLog>>>>);

impl CapsuleRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(
        &self,
        dc_name: &Hash,
        storage: &ChainStorage,
    ) -> Result<Arc<CapsuleLog>, DCServerError> {
        let mut logs = self
            .0
            .lock()
            .map_err(|_| DCServerError::Other("capsule registry poisoned".into()))?;
        if let Some(log) = logs.get(dc_name) {
            return Ok(log.clone());
        }
        let tip = storage.tip()?.map_or(0, |t| t.sequence_number);
        let (tip, _) = watch::channel(tip);
        let log = Arc::new(CapsuleLog {
            commit_lock: tokio::sync::Mutex::new(()),
            tip,
        });
        logs.insert(*dc_name, log.clone());
        Ok(log)
    }
}
