use crate::shared::{
    config::CACHE_SIZE,
    crypto::{Hash, HashBlock, NULL_BLOCK, NULL_HASH},
};

/// Hashes a reader has already verified in this session.
///
/// Direct-mapped: a newer hash may evict an older one that lands in the
/// same slot, which only ever loses trust. Eviction is deterministic, so
/// the server can keep an exact mirror of a reader's cache and skip
/// re-sending what the reader already trusts.
pub struct TrustCache {
    slots: Vec<Hash>,
    occupied: usize,
}

fn cache_index(hash: &Hash) -> usize {
    let index = (hash[0] as usize)
        | ((hash[1] as usize) << 8)
        | ((hash[2] as usize) << 16)
        | ((hash[3] as usize) << 24);
    index % CACHE_SIZE
}

impl TrustCache {
    pub fn new() -> Self {
        Self {
            slots: vec![NULL_HASH; CACHE_SIZE],
            occupied: 0,
        }
    }

    pub fn insert(&mut self, hash: &Hash) {
        if *hash == NULL_HASH {
            return;
        }
        let slot = &mut self.slots[cache_index(hash)];
        if *slot == NULL_HASH {
            self.occupied += 1;
        }
        *slot = *hash;
    }

    pub fn contains(&self, hash: &Hash) -> bool {
        *hash != NULL_HASH && self.slots[cache_index(hash)] == *hash
    }

    pub fn clear(&mut self) {
        self.slots.fill(NULL_HASH);
        self.occupied = 0;
    }

    pub fn len(&self) -> usize {
        self.occupied
    }

    pub fn is_empty(&self) -> bool {
        self.occupied == 0
    }
}

impl Default for TrustCache {
    fn default() -> Self {
        Self::new()
    }
}

/// Per-connection trust anchor: the most recently verified fanout-wide hash
/// set (`last_rcvd_hashes`) plus everything verified before it.
pub struct ReadState {
    cache: TrustCache,
    last_rcvd_hashes: HashBlock,
}

impl ReadState {
    pub fn new() -> ReadState {
        ReadState {
            cache: TrustCache::new(),
            last_rcvd_hashes: NULL_BLOCK,
        }
    }

    /// Drops all accumulated trust. `last_rcvd_hashes` goes back to the
    /// all-zero sentinel.
    pub fn clear(&mut self) {
        self.cache.clear();
        self.last_rcvd_hashes = NULL_BLOCK;
    }

    pub fn is_empty(&self) -> bool {
        self.cache.is_empty() && self.last_rcvd_hashes == NULL_BLOCK
    }

    pub fn contains(&self, hash: &Hash) -> bool {
        if *hash == NULL_HASH {
            return false;
        }
        self.last_rcvd_hashes.contains(hash) || self.cache.contains(hash)
    }

    pub fn last_rcvd_hashes(&self) -> &HashBlock {
        &self.last_rcvd_hashes
    }

    pub fn cache(&self) -> &TrustCache {
        &self.cache
    }

    /// Called once a commit root's signature has been checked.
    pub fn add_signed_root(&mut self, blockhash: &Hash) {
        self.retire_frontier();
        self.last_rcvd_hashes = NULL_BLOCK;
        self.last_rcvd_hashes[0] = *blockhash;
    }

    /// Called once a block's hash has been found in the trusted set.
    pub fn add_proven_block(&mut self, block: &HashBlock) {
        self.retire_frontier();
        self.last_rcvd_hashes = *block;
    }

    fn retire_frontier(&mut self) {
        for h in &self.last_rcvd_hashes {
            self.cache.insert(h);
        }
    }
}

impl Default for ReadState {
    fn default() -> Self {
        Self::new()
    }
}
