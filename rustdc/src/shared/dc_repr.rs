use serde::{Deserialize, Serialize};

use crate::shared::crypto::{hash_dc_metadata, CommitRoot, Hash, HashBlock, Signature};

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct Metadata {
    pub creator_pub_key: Vec<u8>,
    pub writer_pub_key: Vec<u8>,
    pub description: String,
    pub signature: Signature, // creator's signature over the capsule name
}

impl Metadata {
    /// The capsule's name.
    pub fn name(&self) -> Hash {
        hash_dc_metadata(&self.creator_pub_key, &self.writer_pub_key, &self.description)
    }
}

/// One element of a proof-and-data stream. Streams are ordered outermost
/// first: an optional root, the blocks leading down, then the record.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub enum ProofElement {
    Root(CommitRoot),
    Block(HashBlock),
    Data(Vec<u8>), // encrypted record
}
