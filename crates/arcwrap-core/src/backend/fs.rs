use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tempfile::NamedTempFile;
use tracing::debug;

use super::{Backend, StorageError, StorageResult};
use crate::car::read_car;
use crate::codec::{ContentId, IdentifierUrl};

/// Filesystem-backed block store.
///
/// Layout: `<root>/blocks/<cid>`. Files are stored as raw blocks; published
/// containers are unpacked and every block stored under its own CID.
#[derive(Debug, Clone)]
pub struct FsBackend {
    blocks_dir: PathBuf,
}

impl FsBackend {
    /// Create a new `FsBackend` rooted at `root`. Creates `root/blocks/` if needed.
    pub fn new(root: impl AsRef<Path>) -> StorageResult<Self> {
        let blocks_dir = root.as_ref().join("blocks");
        fs::create_dir_all(&blocks_dir)?;
        Ok(Self { blocks_dir })
    }

    fn block_path(&self, cid: &ContentId) -> PathBuf {
        self.blocks_dir.join(cid.to_string())
    }

    fn resolve(&self, url: &str) -> StorageResult<PathBuf> {
        let cid = IdentifierUrl::parse(url)
            .map_err(|e| StorageError::InvalidIdentifier(e.to_string()))?
            .cid();
        Ok(self.block_path(&cid))
    }

    /// Store a block under `cid`; a no-op when it already exists.
    fn put_block(&self, cid: &ContentId, data: &[u8]) -> StorageResult<()> {
        let path = self.block_path(cid);
        if path.exists() {
            return Ok(());
        }
        // Atomic write: write to temp file in the same directory, then rename.
        let mut tmp = NamedTempFile::new_in(&self.blocks_dir)?;
        tmp.write_all(data)?;
        tmp.persist(&path).map_err(|e| e.error)?;
        debug!(cid = %cid.short(), bytes = data.len(), "stored block");
        Ok(())
    }

    async fn blocking<T, F>(&self, f: F) -> StorageResult<T>
    where
        T: Send + 'static,
        F: FnOnce(FsBackend) -> StorageResult<T> + Send + 'static,
    {
        let this = self.clone();
        tokio::task::spawn_blocking(move || f(this))
            .await
            .map_err(|e| StorageError::Io(std::io::Error::other(e)))?
    }
}

fn not_found(url: &str) -> impl FnOnce(std::io::Error) -> StorageError + '_ {
    move |e| {
        if e.kind() == std::io::ErrorKind::NotFound {
            StorageError::NotFound {
                url: url.to_string(),
            }
        } else {
            StorageError::Io(e)
        }
    }
}

#[async_trait]
impl Backend for FsBackend {
    async fn store(&self, name: &str, data: &[u8]) -> StorageResult<String> {
        let cid = ContentId::hash_raw(data);
        let data = data.to_vec();
        self.blocking(move |backend| backend.put_block(&cid, &data)).await?;
        debug!(file = %name, cid = %cid, "stored file");
        Ok(cid.to_url())
    }

    async fn size_of(&self, url: &str) -> StorageResult<u64> {
        let path = self.resolve(url)?;
        let meta = tokio::fs::metadata(&path).await.map_err(not_found(url))?;
        Ok(meta.len())
    }

    async fn fetch_raw(&self, url: &str) -> StorageResult<Vec<u8>> {
        let path = self.resolve(url)?;
        tokio::fs::read(&path).await.map_err(not_found(url))
    }

    async fn publish_container(&self, car: &[u8]) -> StorageResult<Vec<String>> {
        let contents = read_car(car).map_err(|e| StorageError::Rejected(e.to_string()))?;
        for root in &contents.roots {
            if contents.block(root).is_none() {
                return Err(StorageError::Rejected(format!(
                    "root {root} is not present in the container"
                )));
            }
        }
        let roots = contents.roots.clone();
        self.blocking(move |backend| {
            for block in &contents.blocks {
                backend.put_block(&block.cid(), block.bytes())?;
            }
            Ok(())
        })
        .await?;
        Ok(roots.iter().map(|r| format!("{}/", r.to_url())).collect())
    }
}
