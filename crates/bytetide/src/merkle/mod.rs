//! Merkle tree over the chunks of a package.
//!
//! Nodes live in a single arena, leaves first and in chunk order, followed
//! by internal nodes in the order they were created. Children and parents
//! are indices into the arena.
mod query;

use std::{
    collections::VecDeque,
    fs::File,
    io::{Read, Seek, SeekFrom},
    path::Path,
};

use rayon::prelude::*;
use tracing::debug;

use crate::{
    error::Error,
    hash::HexHash,
    manifest::{Chunk, Manifest},
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MerkleNode {
    /// Hash the manifest says this node should have.
    pub expected: HexHash,
    /// Hash derived from the bytes currently on disk.
    pub computed: HexHash,
    pub left: Option<usize>,
    pub right: Option<usize>,
    pub parent: Option<usize>,
    /// Index of the chunk, only leaves have one.
    pub chunk: Option<usize>,
}

impl MerkleNode {
    pub fn is_leaf(&self) -> bool {
        self.chunk.is_some()
    }

    /// The bytes under this node match what the manifest expects.
    pub fn is_complete(&self) -> bool {
        self.expected == self.computed
    }
}

#[derive(Debug, Clone)]
pub struct MerkleTree {
    nodes: Vec<MerkleNode>,
    root: usize,
    leaves: usize,
}

impl MerkleTree {
    /// Hash every chunk of `path` and assemble the tree, annotating it with
    /// the manifest's expected hashes.
    ///
    /// Chunks are hashed in parallel, one contiguous range per worker. The
    /// first failing range aborts the build.
    ///
    /// # Errors
    ///
    /// [`Error::InvalidInput`] when the manifest has no chunks,
    /// [`Error::FileOpen`] when the file can't be opened and [`Error::Io`]
    /// when a chunk can't be read in full.
    pub fn build(manifest: &Manifest, path: &Path) -> Result<Self, Error> {
        if manifest.chunks.is_empty() {
            return Err(Error::InvalidInput("package has no chunks".into()));
        }

        let leaves = hash_chunks(&manifest.chunks, path)?;
        let tree = Self::assemble(&manifest.chunks, leaves, &manifest.hashes);

        debug!(
            "built tree for {} with {} nodes, complete: {}",
            manifest.ident,
            tree.len(),
            tree.is_complete()
        );

        Ok(tree)
    }

    fn assemble(
        chunks: &[Chunk],
        computed: Vec<HexHash>,
        expected: &[HexHash],
    ) -> Self {
        let mut nodes: Vec<MerkleNode> = computed
            .into_iter()
            .zip(chunks)
            .enumerate()
            .map(|(i, (computed, chunk))| MerkleNode {
                expected: chunk.hash,
                computed,
                left: None,
                right: None,
                parent: None,
                chunk: Some(i),
            })
            .collect();

        let leaves = nodes.len();
        let mut level: Vec<usize> = (0..leaves).collect();

        while level.len() > 1 {
            let mut next = Vec::with_capacity(level.len().div_ceil(2));

            for pair in level.chunks(2) {
                match *pair {
                    [left, right] => {
                        let idx = nodes.len();
                        let computed = HexHash::of_children(
                            &nodes[left].computed,
                            &nodes[right].computed,
                        );
                        nodes.push(MerkleNode {
                            expected: HexHash::UNSET,
                            computed,
                            left: Some(left),
                            right: Some(right),
                            parent: None,
                            chunk: None,
                        });
                        nodes[left].parent = Some(idx);
                        nodes[right].parent = Some(idx);
                        next.push(idx);
                    }
                    // odd node out, carried up as is
                    _ => next.push(pair[0]),
                }
            }

            level = next;
        }

        let mut tree = Self { root: level[0], nodes, leaves };

        for (idx, hash) in tree.level_order().into_iter().zip(expected) {
            tree.nodes[idx].expected = *hash;
        }

        tree
    }

    /// Node indices in breadth-first order from the root.
    pub fn level_order(&self) -> Vec<usize> {
        let mut order = Vec::with_capacity(self.nodes.len());
        let mut queue = VecDeque::from([self.root]);

        while let Some(idx) = queue.pop_front() {
            order.push(idx);
            let node = &self.nodes[idx];
            queue.extend(node.left);
            queue.extend(node.right);
        }

        order
    }

    pub fn root(&self) -> &MerkleNode {
        &self.nodes[self.root]
    }

    /// Whether the whole package matches its manifest.
    pub fn is_complete(&self) -> bool {
        self.root().is_complete()
    }

    pub fn node(&self, idx: usize) -> Option<&MerkleNode> {
        self.nodes.get(idx)
    }

    /// The leaf of chunk `idx`. Leaves occupy the start of the arena.
    pub fn leaf(&self, idx: usize) -> Option<&MerkleNode> {
        self.nodes[..self.leaves].get(idx)
    }

    /// Total number of nodes, leaves included.
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn leaves(&self) -> usize {
        self.leaves
    }
}

fn hash_chunks(chunks: &[Chunk], path: &Path) -> Result<Vec<HexHash>, Error> {
    // surface a missing file once instead of once per worker
    File::open(path).map_err(|_| Error::FileOpen(path.to_path_buf()))?;

    let workers = rayon::current_num_threads().max(1);
    let span = chunks.len().div_ceil(workers).max(1);

    let ranges = chunks
        .par_chunks(span)
        .map(|range| hash_range(range, path))
        .collect::<Result<Vec<_>, Error>>()?;

    Ok(ranges.into_iter().flatten().collect())
}

fn hash_range(range: &[Chunk], path: &Path) -> Result<Vec<HexHash>, Error> {
    let mut file =
        File::open(path).map_err(|_| Error::FileOpen(path.to_path_buf()))?;
    let mut buf = Vec::new();
    let mut hashes = Vec::with_capacity(range.len());

    for chunk in range {
        buf.resize(chunk.size as usize, 0);
        file.seek(SeekFrom::Start(chunk.offset as u64))?;
        file.read_exact(&mut buf)?;
        hashes.push(HexHash::digest(&buf));
    }

    Ok(hashes)
}
