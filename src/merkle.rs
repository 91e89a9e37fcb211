use serde::{Deserialize, Serialize};

use crate::hashing::{Digest, hash_pair};

/// Which side of the running hash a sibling is placed on when recombining.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Side {
    Left,
    Right,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProofStep {
    pub sibling: Digest,
    pub side: Side,
}

/// Binary hash tree over an ordered sequence of leaf hashes.
///
/// Stored as levels, leaves first. Every level with an odd number of nodes
/// has its last node duplicated before pairing, so each stored level (except
/// the root level) has even length and every parent has exactly two children.
/// The tree is never mutated after `build`.
#[derive(Debug, Clone)]
pub struct MerkleTree {
    levels: Vec<Vec<Digest>>,
    leaf_count: usize,
}

impl MerkleTree {
    pub fn build(leaves: &[Digest]) -> Self {
        let leaf_count = leaves.len();
        if leaves.is_empty() {
            return Self { levels: Vec::new(), leaf_count };
        }

        let mut levels = Vec::new();
        let mut current = leaves.to_vec();
        loop {
            if current.len() % 2 == 1 {
                let last = current[current.len() - 1];
                current.push(last);
            }
            let parents: Vec<Digest> = current
                .chunks_exact(2)
                .map(|pair| hash_pair(&pair[0], &pair[1]))
                .collect();
            levels.push(current);
            if parents.len() == 1 {
                levels.push(parents);
                break;
            }
            current = parents;
        }
        Self { levels, leaf_count }
    }

    pub fn root_hash(&self) -> Option<Digest> {
        self.levels.last().map(|root| root[0])
    }

    pub fn leaf_count(&self) -> usize {
        self.leaf_count
    }

    pub fn is_empty(&self) -> bool {
        self.leaf_count == 0
    }

    /// Sibling path from `leaf` up to the root, or `None` if the leaf is not
    /// in the tree. For a repeated leaf the first occurrence is proven.
    pub fn prove(&self, leaf: &Digest) -> Option<Vec<ProofStep>> {
        let leaves = self.levels.first()?;
        let mut index = leaves[..self.leaf_count].iter().position(|l| l == leaf)?;

        let mut proof = Vec::with_capacity(self.levels.len() - 1);
        for level in &self.levels[..self.levels.len() - 1] {
            let (sibling, side) = if index % 2 == 0 {
                (level[index + 1], Side::Right)
            } else {
                (level[index - 1], Side::Left)
            };
            proof.push(ProofStep { sibling, side });
            index /= 2;
        }
        Some(proof)
    }
}

/// Fold `proof` over `leaf` and compare with `root`. Needs no tree.
pub fn verify_proof(leaf: &Digest, proof: &[ProofStep], root: &Digest) -> bool {
    let computed = proof.iter().fold(*leaf, |current, step| match step.side {
        Side::Right => hash_pair(&current, &step.sibling),
        Side::Left => hash_pair(&step.sibling, &current),
    });
    computed == *root
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hashing::hash_bytes;

    fn leaves(labels: &[&str]) -> Vec<Digest> {
        labels.iter().map(|l| hash_bytes(l.as_bytes())).collect()
    }

    fn numbered(n: usize) -> Vec<Digest> {
        (0..n).map(|i| hash_bytes(format!("leaf-{i}").as_bytes())).collect()
    }

    #[test]
    fn empty_tree_has_no_root() {
        let tree = MerkleTree::build(&[]);
        assert!(tree.is_empty());
        assert_eq!(tree.root_hash(), None);
        assert!(tree.prove(&hash_bytes(b"a")).is_none());
    }

    #[test]
    fn single_leaf_is_paired_with_itself() {
        let l = leaves(&["a"]);
        let tree = MerkleTree::build(&l);
        assert_eq!(tree.root_hash(), Some(hash_pair(&l[0], &l[0])));
        let proof = tree.prove(&l[0]).unwrap();
        assert_eq!(proof, vec![ProofStep { sibling: l[0], side: Side::Right }]);
    }

    #[test]
    fn every_leaf_verifies_against_root() {
        for n in 1..=17 {
            let l = numbered(n);
            let tree = MerkleTree::build(&l);
            let root = tree.root_hash().unwrap();
            for leaf in &l {
                let proof = tree.prove(leaf).unwrap();
                assert!(verify_proof(leaf, &proof, &root), "n={n}");
            }
        }
    }

    #[test]
    fn odd_count_matches_explicit_duplicate() {
        let three = MerkleTree::build(&leaves(&["a", "b", "c"]));
        let four = MerkleTree::build(&leaves(&["a", "b", "c", "c"]));
        assert_eq!(three.root_hash(), four.root_hash());
        assert_eq!(three.leaf_count(), 3);
    }

    #[test]
    fn odd_interior_level_is_padded() {
        // 5 leaves -> 6 -> 3 parents (odd) -> 4 -> 2 -> 1
        let l = numbered(5);
        let tree = MerkleTree::build(&l);
        let p01 = hash_pair(&l[0], &l[1]);
        let p23 = hash_pair(&l[2], &l[3]);
        let p44 = hash_pair(&l[4], &l[4]);
        let expected = hash_pair(&hash_pair(&p01, &p23), &hash_pair(&p44, &p44));
        assert_eq!(tree.root_hash(), Some(expected));
    }

    #[test]
    fn build_is_deterministic_and_order_sensitive() {
        let l = leaves(&["a", "b", "c", "d"]);
        assert_eq!(MerkleTree::build(&l).root_hash(), MerkleTree::build(&l).root_hash());
        let swapped = leaves(&["b", "a", "c", "d"]);
        assert_ne!(MerkleTree::build(&l).root_hash(), MerkleTree::build(&swapped).root_hash());
    }

    #[test]
    fn tampered_proof_or_root_fails() {
        let l = numbered(6);
        let tree = MerkleTree::build(&l);
        let root = tree.root_hash().unwrap();
        let mut proof = tree.prove(&l[3]).unwrap();

        assert!(!verify_proof(&l[3], &proof, &hash_bytes(b"other root")));
        assert!(!verify_proof(&hash_bytes(b"stranger"), &proof, &root));

        proof[0].side = match proof[0].side {
            Side::Left => Side::Right,
            Side::Right => Side::Left,
        };
        assert!(!verify_proof(&l[3], &proof, &root));
    }

    #[test]
    fn unknown_leaf_has_no_proof() {
        let tree = MerkleTree::build(&numbered(4));
        assert!(tree.prove(&hash_bytes(b"missing")).is_none());
    }

    #[test]
    fn proof_serializes_with_lowercase_side() {
        let step = ProofStep { sibling: hash_bytes(b"s"), side: Side::Left };
        let json = serde_json::to_value(&step).unwrap();
        assert_eq!(json["side"], "left");
    }
}
