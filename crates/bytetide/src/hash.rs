//! Hash values as they appear in manifests, Merkle trees and on the wire:
//! 64 lowercase hex characters of a SHA-256 digest.
use std::{fmt, str::FromStr};

use sha2::{Digest, Sha256};

use crate::error::Error;

/// Length in bytes of a hex encoded SHA-256 digest.
pub const HASH_LEN: usize = 64;

/// A SHA-256 digest in its 64 character hex form.
///
/// Comparison is an exact byte comparison of the 64 characters.
/// [`HexHash::UNSET`] stands for an expected hash that was never supplied,
/// it is not valid hex and so never equals a computed digest.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct HexHash([u8; HASH_LEN]);

impl Default for HexHash {
    fn default() -> Self {
        Self::UNSET
    }
}

impl HexHash {
    pub const UNSET: HexHash = HexHash([0u8; HASH_LEN]);

    /// Hash arbitrary bytes.
    pub fn digest(data: &[u8]) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(data);
        let encoded = hex::encode(hasher.finalize());

        let mut buf = [0u8; HASH_LEN];
        buf.copy_from_slice(encoded.as_bytes());
        Self(buf)
    }

    /// Hash of an internal node, the digest of both children's hex text
    /// concatenated.
    pub fn of_children(left: &HexHash, right: &HexHash) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(left.0);
        hasher.update(right.0);
        let encoded = hex::encode(hasher.finalize());

        let mut buf = [0u8; HASH_LEN];
        buf.copy_from_slice(encoded.as_bytes());
        Self(buf)
    }

    /// Wrap raw bytes read from a frame, the caller validated them.
    pub(crate) fn from_raw(raw: [u8; HASH_LEN]) -> Self {
        Self(raw)
    }

    pub fn as_bytes(&self) -> &[u8; HASH_LEN] {
        &self.0
    }

    pub fn is_set(&self) -> bool {
        self.0 != [0u8; HASH_LEN]
    }

    pub fn as_str(&self) -> &str {
        std::str::from_utf8(&self.0)
            .unwrap_or_default()
            .trim_end_matches('\0')
    }
}

impl FromStr for HexHash {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.len() != HASH_LEN || !s.bytes().all(|b| b.is_ascii_hexdigit()) {
            return Err(Error::InvalidInput(format!(
                "expected {HASH_LEN} hex characters, got {s:?}"
            )));
        }
        let mut buf = [0u8; HASH_LEN];
        buf.copy_from_slice(s.as_bytes());
        Ok(Self(buf))
    }
}

impl fmt::Display for HexHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl fmt::Debug for HexHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_set() {
            write!(f, "HexHash({})", self.as_str())
        } else {
            f.write_str("HexHash(unset)")
        }
    }
}
