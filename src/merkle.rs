use crate::types::{sha256_hex, Hash, EMPTY_HASH};

/// Which side of the running hash a proof sibling sits on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
    Left,
    Right,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProofStep {
    pub sibling: Hash,
    pub side: Side,
}

/// A fully materialized tree; `levels[0]` are the leaf hashes, padded when odd.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MerkleTree {
    levels: Vec<Vec<Hash>>,
    leaf_count: usize,
}

fn hash_pair(left: &str, right: &str) -> Hash {
    let mut joined = String::with_capacity(left.len() + right.len());
    joined.push_str(left);
    joined.push_str(right);
    sha256_hex(joined)
}

impl MerkleTree {
    pub fn build<I, L>(leaves: I) -> Self
    where
        I: IntoIterator<Item = L>,
        L: AsRef<[u8]>,
    {
        let mut level: Vec<Hash> = leaves.into_iter().map(sha256_hex).collect();
        let leaf_count = level.len();
        if level.is_empty() {
            return MerkleTree {
                levels: Vec::new(),
                leaf_count,
            };
        }

        let mut levels = Vec::new();
        while level.len() > 1 {
            if level.len() % 2 == 1 {
                let last = level[level.len() - 1].clone();
                level.push(last);
            }
            let next = level
                .chunks(2)
                .map(|pair| hash_pair(&pair[0], &pair[1]))
                .collect();
            levels.push(level);
            level = next;
        }
        levels.push(level);
        MerkleTree { levels, leaf_count }
    }

    pub fn root(&self) -> Hash {
        self.levels
            .last()
            .and_then(|top| top.first())
            .cloned()
            .unwrap_or_else(|| EMPTY_HASH.to_string())
    }

    /// Number of leaves the tree was built from (without padding).
    pub fn leaf_count(&self) -> usize {
        self.leaf_count
    }

    /// Inclusion proof for the leaf at `index`, bottom-up.
    pub fn proof(&self, index: usize) -> Option<Vec<ProofStep>> {
        if index >= self.leaf_count() {
            return None;
        }
        let mut steps = Vec::new();
        let mut position = index;
        for level in &self.levels[..self.levels.len() - 1] {
            let (sibling, side) = if position % 2 == 0 {
                (position + 1, Side::Right)
            } else {
                (position - 1, Side::Left)
            };
            steps.push(ProofStep {
                sibling: level.get(sibling)?.clone(),
                side,
            });
            position /= 2;
        }
        Some(steps)
    }
}

/// Build a tree from ordered leaves.
pub fn build_merkle_tree<I, L>(leaves: I) -> MerkleTree
where
    I: IntoIterator<Item = L>,
    L: AsRef<[u8]>,
{
    MerkleTree::build(leaves)
}

pub fn merkle_root<I, L>(leaves: I) -> Hash
where
    I: IntoIterator<Item = L>,
    L: AsRef<[u8]>,
{
    MerkleTree::build(leaves).root()
}

/// Check that `leaf` is included under `root` following `proof`.
pub fn verify_proof(leaf: impl AsRef<[u8]>, proof: &[ProofStep], root: &str) -> bool {
    let mut running = sha256_hex(leaf);
    for step in proof {
        running = match step.side {
            Side::Left => hash_pair(&step.sibling, &running),
            Side::Right => hash_pair(&running, &step.sibling),
        };
    }
    running == root
}
