//! Read-only queries over a built [`MerkleTree`].
use crate::{error::Error, hash::HexHash};

use super::MerkleTree;

fn non_empty(
    hashes: Vec<HexHash>,
    what: &'static str,
) -> Result<Vec<HexHash>, Error> {
    if hashes.is_empty() {
        return Err(Error::Query(what));
    }
    Ok(hashes)
}

impl MerkleTree {
    /// Pre-order walk from `start`. Children of a node are only visited
    /// when `visit` returns true for it.
    fn preorder(&self, start: usize, mut visit: impl FnMut(usize) -> bool) {
        let mut stack = vec![start];

        while let Some(idx) = stack.pop() {
            if !visit(idx) {
                continue;
            }
            let node = &self.nodes[idx];
            stack.extend(node.right);
            stack.extend(node.left);
        }
    }

    /// Leaf indices under `idx`, left to right.
    fn leaves_under(&self, idx: usize) -> Vec<usize> {
        let mut leaves = vec![];
        self.preorder(idx, |i| {
            if self.nodes[i].is_leaf() {
                leaves.push(i);
                return false;
            }
            true
        });
        leaves
    }

    /// Expected hash of every node in level order.
    pub fn all_hashes(&self) -> Result<Vec<HexHash>, Error> {
        let hashes = self
            .level_order()
            .into_iter()
            .map(|i| self.nodes[i].expected)
            .collect();
        non_empty(hashes, "tree has no nodes")
    }

    /// Hashes of the chunks whose bytes match the manifest, in chunk order.
    pub fn completed_chunks(&self) -> Result<Vec<HexHash>, Error> {
        let hashes = self
            .leaves_under(self.root)
            .into_iter()
            .map(|i| &self.nodes[i])
            .filter(|n| n.is_complete())
            .map(|n| n.computed)
            .collect();
        non_empty(hashes, "no chunk is complete")
    }

    /// The completion frontier: every maximal subtree that matches the
    /// manifest contributes its top hash, every leaf that doesn't match
    /// contributes its expected hash.
    pub fn min_hashes(&self) -> Result<Vec<HexHash>, Error> {
        let mut hashes = vec![];
        self.preorder(self.root, |i| {
            let node = &self.nodes[i];
            if node.is_complete() || node.is_leaf() {
                hashes.push(node.expected);
                return false;
            }
            true
        });
        non_empty(hashes, "tree has no nodes")
    }

    /// Chunk indices covered by every node whose expected hash is `hash`.
    pub fn chunks_of(&self, hash: &HexHash) -> Result<Vec<usize>, Error> {
        if !hash.is_set() {
            return Err(Error::Query("hash is unset"));
        }

        let mut matched = vec![];
        self.preorder(self.root, |i| {
            if self.nodes[i].expected == *hash {
                matched.push(i);
                return false;
            }
            true
        });

        let chunks: Vec<usize> = matched
            .into_iter()
            .flat_map(|i| self.leaves_under(i))
            .filter_map(|i| self.nodes[i].chunk)
            .collect();

        if chunks.is_empty() {
            return Err(Error::Query("hash is not part of the tree"));
        }
        Ok(chunks)
    }

    /// Expected hashes of the chunks under the node with `hash`.
    pub fn hashes_of(&self, hash: &HexHash) -> Result<Vec<HexHash>, Error> {
        let hashes = self
            .chunks_of(hash)?
            .into_iter()
            .map(|chunk| self.nodes[chunk].expected)
            .collect();
        non_empty(hashes, "hash is not part of the tree")
    }

    /// Chunk indices whose bytes don't match the manifest yet.
    pub fn missing_chunks(&self) -> Vec<usize> {
        self.nodes[..self.leaves]
            .iter()
            .filter(|n| !n.is_complete())
            .filter_map(|n| n.chunk)
            .collect()
    }
}
