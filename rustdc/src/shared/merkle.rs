use crate::shared::config::FANOUT;
use crate::shared::crypto::{hash_block, Hash, HashBlock, NULL_BLOCK};

pub struct TreeNode {
    pub name: Hash,
    pub parent: Option<Hash>,
    pub children: HashBlock,
}

pub struct RecordBlock {
    pub name: Hash,
    pub parent: Hash,
}

/// Everything produced by sealing one commit.
pub struct SealedTree {
    pub records: Vec<RecordBlock>,
    /// Bottom level first, root last.
    pub nodes: Vec<TreeNode>,
    /// The block that now references the previous commit's root.
    pub link_parent: Option<Hash>,
    pub root: Hash,
    pub depth: u8,
}

/// Seals `[previous] ++ hashes` into a FANOUT-ary tree of hash blocks,
/// one block per FANOUT entries on each level, until a single block is left.
/// The previous commit's blockhash (if any) goes in the first slot, which is
/// what chains commits together.
///
/// Returns `None` when there is nothing to seal.
pub fn seal(previous: Option<&Hash>, hashes: &[Hash]) -> Option<SealedTree> {
    let mut current_layer: Vec<Hash> = previous.into_iter().chain(hashes).copied().collect();
    if current_layer.is_empty() {
        return None;
    }

    let mut records = Vec::with_capacity(hashes.len());
    let mut nodes: Vec<TreeNode> = Vec::new();
    let mut link_parent = None;
    let mut depth = 0;
    loop {
        let blocks: Vec<HashBlock> = current_layer
            .chunks(FANOUT)
            .map(|chunk| {
                let mut block = NULL_BLOCK;
                block[..chunk.len()].copy_from_slice(chunk);
                block
            })
            .collect();
        let next_layer: Vec<Hash> = blocks.iter().map(hash_block).collect();

        if depth == 0 {
            for (i, h) in current_layer.iter().enumerate() {
                let parent = next_layer[i / FANOUT];
                if i == 0 && previous.is_some() {
                    link_parent = Some(parent);
                } else {
                    records.push(RecordBlock { name: *h, parent });
                }
            }
        } else {
            let start_idx = nodes.len() - current_layer.len();
            for (i, node) in nodes[start_idx..].iter_mut().enumerate() {
                node.parent = Some(next_layer[i / FANOUT]);
            }
        }

        for (name, children) in next_layer.iter().zip(blocks) {
            nodes.push(TreeNode {
                name: *name,
                parent: None,
                children,
            });
        }
        current_layer = next_layer;
        depth += 1;

        if current_layer.len() == 1 {
            break;
        }
    }

    Some(SealedTree {
        records,
        nodes,
        link_parent,
        root: current_layer[0],
        depth,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shared::crypto::{hash_data, NULL_HASH};

    fn leaves(n: usize) -> Vec<Hash> {
        (0..n).map(|i| hash_data(&i.to_le_bytes())).collect()
    }

    #[test]
    fn nothing_to_seal() {
        assert!(seal(None, &[]).is_none());
    }

    #[test]
    fn two_records_fit_one_block() {
        let a = hash_data(b"a");
        let b = hash_data(b"b");
        let tree = seal(None, &[a, b]).unwrap();
        assert_eq!(tree.depth, 1);
        assert_eq!(tree.nodes.len(), 1);
        let block = &tree.nodes[0].children;
        assert_eq!(block[0], a);
        assert_eq!(block[1], b);
        assert!(block[2..].iter().all(|h| *h == NULL_HASH));
        assert_eq!(tree.root, hash_block(block));
        assert!(tree.records.iter().all(|r| r.parent == tree.root));
        assert!(tree.link_parent.is_none());
    }

    #[test]
    fn previous_root_takes_first_slot() {
        let prev = hash_data(b"previous");
        let tree = seal(Some(&prev), &leaves(3)).unwrap();
        assert_eq!(tree.nodes[0].children[0], prev);
        assert_eq!(tree.link_parent, Some(tree.root));
        assert_eq!(tree.records.len(), 3);
    }

    #[test]
    fn overflow_builds_second_level() {
        let hashes = leaves(FANOUT + 1);
        let tree = seal(None, &hashes).unwrap();
        assert_eq!(tree.depth, 2);
        // two bottom blocks plus the root
        assert_eq!(tree.nodes.len(), 3);
        let root = tree.nodes.last().unwrap();
        assert_eq!(root.name, tree.root);
        assert!(root.parent.is_none());
        assert_eq!(root.children[0], tree.nodes[0].name);
        assert_eq!(root.children[1], tree.nodes[1].name);
        assert_eq!(tree.nodes[0].parent, Some(tree.root));
        assert_eq!(tree.records[FANOUT].parent, tree.nodes[1].name);
    }

    #[test]
    fn every_record_reachable_from_root() {
        let hashes = leaves(FANOUT * FANOUT + 3);
        let tree = seal(Some(&hash_data(b"p")), &hashes).unwrap();
        for r in &tree.records {
            let mut curr = r.parent;
            let mut steps = 0;
            while curr != tree.root {
                let node = tree.nodes.iter().find(|n| n.name == curr).unwrap();
                curr = node.parent.unwrap();
                steps += 1;
            }
            assert_eq!(steps, tree.depth as usize - 1);
        }
    }
}
