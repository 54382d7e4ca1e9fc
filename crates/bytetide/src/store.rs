//! Packages managed by a node, and the file I/O done on their behalf.
use std::{
    io::SeekFrom,
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
};

use hashbrown::HashMap;
use tokio::{
    fs::{File, OpenOptions},
    io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt},
    sync::RwLock,
    task::spawn_blocking,
};
use tracing::{debug, info};

use crate::{
    error::Error,
    hash::HexHash,
    manifest::{Chunk, Manifest},
    merkle::MerkleTree,
};

/// Shortest identifier prefix accepted by [`PackageStore::remove`].
pub const IDENT_PREFIX_MIN: usize = 20;

/// Stable key of a package in a [`PackageStore`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PackageHandle(u64);

/// A managed package: its manifest, where its file lives and the tree
/// computed from that file.
#[derive(Debug)]
pub struct Package {
    pub handle: PackageHandle,
    pub manifest: Manifest,
    pub path: PathBuf,
    pub tree: MerkleTree,
}

impl Package {
    pub fn ident(&self) -> &str {
        &self.manifest.ident
    }

    pub fn chunk(&self, hash: &HexHash) -> Option<&Chunk> {
        self.manifest.chunk(hash)
    }

    pub fn is_complete(&self) -> bool {
        self.tree.is_complete()
    }
}

/// Table of packages, shared by the command layer and every peer handler.
///
/// Packages are immutable once inserted, a rebuilt tree replaces the whole
/// [`Package`] under the same handle so lookups in flight keep a consistent
/// view.
#[derive(Debug, Default)]
pub struct PackageStore {
    packages: RwLock<HashMap<PackageHandle, Arc<Package>>>,
    next_handle: AtomicU64,
}

/// Build a tree off the async runtime.
async fn build_tree(
    manifest: Manifest,
    path: PathBuf,
) -> Result<(Manifest, PathBuf, MerkleTree), Error> {
    spawn_blocking(move || -> Result<_, Error> {
        let tree = MerkleTree::build(&manifest, &path)?;
        Ok((manifest, path, tree))
    })
    .await?
}

impl PackageStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build the tree of `manifest` over the file at `path` and start
    /// managing it.
    ///
    /// # Errors
    ///
    /// The build errors of [`MerkleTree::build`], or
    /// [`Error::PackageExists`] when the identifier is already managed.
    /// Nothing changes in the store on error.
    pub async fn add(
        &self,
        manifest: Manifest,
        path: PathBuf,
    ) -> Result<Arc<Package>, Error> {
        if self.lookup_by_identifier(&manifest.ident).await.is_some() {
            return Err(Error::PackageExists);
        }

        let (manifest, path, tree) = build_tree(manifest, path).await?;

        let mut packages = self.packages.write().await;

        if packages.values().any(|p| p.manifest.ident == manifest.ident) {
            return Err(Error::PackageExists);
        }

        let handle =
            PackageHandle(self.next_handle.fetch_add(1, Ordering::Relaxed));
        let package = Arc::new(Package { handle, manifest, path, tree });
        packages.insert(handle, package.clone());

        info!(
            "managing {} at {:?}, complete: {}",
            package.ident(),
            package.path,
            package.is_complete()
        );

        Ok(package)
    }

    /// Stop managing the first package whose identifier starts with
    /// `prefix`.
    pub async fn remove(&self, prefix: &str) -> Result<Arc<Package>, Error> {
        if prefix.len() < IDENT_PREFIX_MIN {
            return Err(Error::InvalidInput(format!(
                "identifier prefix must have at least {IDENT_PREFIX_MIN} characters"
            )));
        }

        let mut packages = self.packages.write().await;

        let handle = packages
            .values()
            .filter(|p| p.manifest.ident.starts_with(prefix))
            .map(|p| p.handle)
            .min()
            .ok_or(Error::PackageNotFound)?;

        let package = packages.remove(&handle).ok_or(Error::PackageNotFound)?;
        debug!("removed package {}", package.ident());

        Ok(package)
    }

    pub async fn get(&self, handle: PackageHandle) -> Option<Arc<Package>> {
        self.packages.read().await.get(&handle).cloned()
    }

    pub async fn lookup_by_identifier(&self, ident: &str) -> Option<Arc<Package>> {
        self.packages
            .read()
            .await
            .values()
            .find(|p| p.manifest.ident == ident)
            .cloned()
    }

    pub async fn lookup_chunk(
        &self,
        handle: PackageHandle,
        hash: &HexHash,
    ) -> Option<Chunk> {
        self.get(handle).await?.chunk(hash).cloned()
    }

    /// Every package, in the order they were added.
    pub async fn list(&self) -> Vec<Arc<Package>> {
        let mut list: Vec<_> =
            self.packages.read().await.values().cloned().collect();
        list.sort_by_key(|p| p.handle);
        list
    }

    pub async fn len(&self) -> usize {
        self.packages.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.packages.read().await.is_empty()
    }

    /// Rebuild the tree of a package from the bytes currently on disk.
    pub async fn refresh(
        &self,
        handle: PackageHandle,
    ) -> Result<Arc<Package>, Error> {
        let old = self.get(handle).await.ok_or(Error::PackageNotFound)?;

        let (manifest, path, tree) =
            build_tree(old.manifest.clone(), old.path.clone()).await?;
        let package = Arc::new(Package { handle, manifest, path, tree });

        let mut packages = self.packages.write().await;
        // removed while we were hashing
        let slot = packages.get_mut(&handle).ok_or(Error::PackageNotFound)?;
        *slot = package.clone();

        Ok(package)
    }
}

/// Open a package file for reading, or for reading and writing. Never
/// creates the file.
pub async fn open_file(
    path: impl AsRef<Path>,
    write: bool,
) -> Result<File, Error> {
    let path = path.as_ref();

    OpenOptions::new()
        .read(true)
        .write(write)
        .open(path)
        .await
        .map_err(|_| Error::FileOpen(path.to_path_buf()))
}

/// Fill `buf` from the current position of `file`, stopping early only at
/// end of file.
pub async fn read_full(file: &mut File, buf: &mut [u8]) -> Result<usize, Error> {
    let mut filled = 0;

    while filled < buf.len() {
        let read = file.read(&mut buf[filled..]).await?;
        if read == 0 {
            break;
        }
        filled += read;
    }

    Ok(filled)
}

/// Write `data` at `offset` of an existing file.
pub async fn write_at(
    path: impl AsRef<Path>,
    offset: u32,
    data: &[u8],
) -> Result<(), Error> {
    let mut file = open_file(path, true).await?;
    file.seek(SeekFrom::Start(offset as u64)).await?;
    file.write_all(data).await?;
    file.flush().await?;
    Ok(())
}
