//! Package manifests: the text description of a file, its chunks and the
//! level-order expected hashes of its Merkle tree.
//!
//! ```text
//! ident:<identifier>
//! filename:<file name>
//! size:<total bytes>
//! nhashes:<n>
//! hashes:
//!     <64 hex> ... (n tokens)
//! nchunks:<m>
//! chunks:
//!     <64 hex>,<offset>,<size> ... (m records)
//! ```
use std::{
    path::{Path, PathBuf},
    str::{FromStr, Lines},
};

use tokio::fs::{self, OpenOptions};
use tracing::debug;

use crate::{error::Error, hash::HexHash};

pub const IDENT_MAX: usize = 1024;
pub const FILENAME_MAX: usize = 256;

/// A contiguous byte range of the package file with its expected hash.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Chunk {
    pub hash: HexHash,
    pub offset: u32,
    pub size: u32,
}

/// A parsed package manifest.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Manifest {
    pub ident: String,
    pub filename: String,
    pub size: u64,
    /// Expected hashes of the tree in level order, root first.
    pub hashes: Vec<HexHash>,
    pub chunks: Vec<Chunk>,
}

/// Outcome of [`Manifest::file_check`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileCheck {
    Exists,
    Created,
}

impl std::fmt::Display for FileCheck {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FileCheck::Exists => f.write_str("File Exists"),
            FileCheck::Created => f.write_str("File Created"),
        }
    }
}

fn parse_error(msg: impl Into<String>) -> Error {
    Error::ManifestParse(msg.into())
}

fn set_once<T>(slot: &mut Option<T>, value: T, key: &str) -> Result<(), Error> {
    if slot.is_some() {
        return Err(parse_error(format!("duplicate field `{key}`")));
    }
    *slot = Some(value);
    Ok(())
}

fn parse_number<T: FromStr>(value: &str, key: &str) -> Result<T, Error> {
    value
        .trim()
        .parse()
        .map_err(|_| parse_error(format!("`{key}` is not a number: {value:?}")))
}

/// Collect exactly `n` whitespace separated tokens, starting with the rest of
/// the current line and continuing on the following lines.
fn take_tokens<'a>(
    first: &'a str,
    lines: &mut Lines<'a>,
    n: usize,
    key: &str,
) -> Result<Vec<&'a str>, Error> {
    let mut tokens: Vec<&str> = first.split_whitespace().collect();

    while tokens.len() < n {
        let Some(line) = lines.next() else {
            return Err(parse_error(format!(
                "`{key}` expected {n} entries, found {}",
                tokens.len()
            )));
        };
        tokens.extend(line.split_whitespace());
    }

    if tokens.len() > n {
        return Err(parse_error(format!(
            "`{key}` expected {n} entries, found more"
        )));
    }

    Ok(tokens)
}

fn parse_hash(token: &str) -> Result<HexHash, Error> {
    token
        .parse()
        .map_err(|_| parse_error(format!("invalid hash {token:?}")))
}

fn parse_chunk(record: &str) -> Result<Chunk, Error> {
    let mut parts = record.split(',');
    let (Some(hash), Some(offset), Some(size), None) =
        (parts.next(), parts.next(), parts.next(), parts.next())
    else {
        return Err(parse_error(format!("invalid chunk record {record:?}")));
    };

    let chunk = Chunk {
        hash: parse_hash(hash)?,
        offset: parse_number(offset, "chunks")?,
        size: parse_number(size, "chunks")?,
    };

    if chunk.size == 0 {
        return Err(parse_error(format!("chunk {} has size 0", chunk.hash)));
    }

    Ok(chunk)
}

impl Manifest {
    /// Read and parse the manifest at `path`.
    pub async fn load(path: impl AsRef<Path>) -> Result<Self, Error> {
        let path = path.as_ref();
        let text = fs::read_to_string(path)
            .await
            .map_err(|_| Error::FileOpen(path.to_path_buf()))?;
        Self::parse(&text)
    }

    /// Parse the text form of a manifest.
    ///
    /// Every field is required and may appear only once. Lines with an
    /// unknown key are skipped.
    pub fn parse(text: &str) -> Result<Self, Error> {
        let mut ident: Option<String> = None;
        let mut filename: Option<String> = None;
        let mut size: Option<u64> = None;
        let mut nhashes: Option<usize> = None;
        let mut hashes: Option<Vec<HexHash>> = None;
        let mut nchunks: Option<usize> = None;
        let mut chunks: Option<Vec<Chunk>> = None;

        let mut lines = text.lines();

        while let Some(line) = lines.next() {
            let Some((key, value)) = line.split_once(':') else {
                continue;
            };

            match key.trim() {
                "ident" => set_once(&mut ident, value.trim().to_owned(), key)?,
                "filename" => {
                    set_once(&mut filename, value.trim().to_owned(), key)?
                }
                "size" => set_once(&mut size, parse_number(value, key)?, key)?,
                "nhashes" => {
                    set_once(&mut nhashes, parse_number(value, key)?, key)?
                }
                "nchunks" => {
                    set_once(&mut nchunks, parse_number(value, key)?, key)?
                }
                "hashes" => {
                    let n = nhashes
                        .ok_or_else(|| parse_error("`hashes` before `nhashes`"))?;
                    let parsed = take_tokens(value, &mut lines, n, "hashes")?
                        .into_iter()
                        .map(parse_hash)
                        .collect::<Result<Vec<_>, _>>()?;
                    set_once(&mut hashes, parsed, "hashes")?;
                }
                "chunks" => {
                    let n = nchunks
                        .ok_or_else(|| parse_error("`chunks` before `nchunks`"))?;
                    let parsed = take_tokens(value, &mut lines, n, "chunks")?
                        .into_iter()
                        .map(parse_chunk)
                        .collect::<Result<Vec<_>, _>>()?;
                    set_once(&mut chunks, parsed, "chunks")?;
                }
                _ => {}
            }
        }

        let missing = |key: &str| parse_error(format!("missing field `{key}`"));

        let manifest = Manifest {
            ident: ident.ok_or_else(|| missing("ident"))?,
            filename: filename.ok_or_else(|| missing("filename"))?,
            size: size.ok_or_else(|| missing("size"))?,
            hashes: hashes.ok_or_else(|| missing("hashes"))?,
            chunks: chunks.ok_or_else(|| missing("chunks"))?,
        };

        manifest.validate()?;

        Ok(manifest)
    }

    fn validate(&self) -> Result<(), Error> {
        if self.ident.is_empty() || self.ident.len() > IDENT_MAX {
            return Err(parse_error("`ident` must be 1..=1024 bytes"));
        }
        if self.filename.is_empty() || self.filename.len() > FILENAME_MAX {
            return Err(parse_error("`filename` must be 1..=256 bytes"));
        }
        if self.size == 0 {
            return Err(parse_error("`size` must be positive"));
        }
        if self.hashes.is_empty() {
            return Err(parse_error("`nhashes` must be positive"));
        }
        if self.chunks.is_empty() {
            return Err(parse_error("`nchunks` must be positive"));
        }
        Ok(())
    }

    /// Find a chunk by its expected hash.
    pub fn chunk(&self, hash: &HexHash) -> Option<&Chunk> {
        self.chunks.iter().find(|c| c.hash == *hash)
    }

    /// Path of the package file inside `directory`.
    pub fn resolve(&self, directory: impl AsRef<Path>) -> PathBuf {
        directory.as_ref().join(&self.filename)
    }

    /// Make sure the package file exists, creating a zero-filled file of
    /// the declared size when it doesn't.
    pub async fn file_check(
        &self,
        path: impl AsRef<Path>,
    ) -> Result<FileCheck, Error> {
        let path = path.as_ref();

        if fs::try_exists(path).await.unwrap_or(false) {
            return Ok(FileCheck::Exists);
        }

        let file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(path)
            .await
            .map_err(|_| Error::FileOpen(path.to_path_buf()))?;

        file.set_len(self.size).await?;

        debug!("created {path:?} with {} bytes", self.size);

        Ok(FileCheck::Created)
    }
}
