//! ByteTide is a library to distribute files between peers in verified
//! chunks.
//!
//! A package is described by a [`manifest::Manifest`]: the file's chunks and
//! the expected hashes of a [`merkle::MerkleTree`] built over them. Nodes
//! connect over TCP, handshake with ACP/ACK and exchange REQ/RES frames
//! ([`wire`]) to fill in the chunks that the tree reports as missing.
pub mod command;
pub mod config;
pub mod error;
pub mod hash;
pub mod manifest;
pub mod merkle;
pub mod node;
pub mod peer;
pub mod store;
pub mod wire;
