use crate::error::{NormalizationError, Result};
use crate::parser::content_hash;
use async_trait::async_trait;
use log::warn;
use parking_lot::RwLock;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::io::{BufReader, Cursor, Read};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

const COPY_CHUNK: usize = 64 * 1024;

/// Content address of a stored blob: the lowercase hex SHA-256 of its bytes.
pub type BlobId = String;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredBlob {
    pub id: BlobId,
    pub byte_len: u64,
}

/// Content-addressable storage for raw uploads.
#[async_trait]
pub trait BlobStore: Send + Sync {
    async fn put(&self, bytes: Vec<u8>) -> Result<BlobId>;

    /// Copies `reader` into the store while hashing it, holding at most one chunk in
    /// memory beyond what the store itself keeps. Fails once more than `limit` bytes
    /// have been read, leaving nothing stored.
    async fn put_stream(
        &self,
        reader: &mut (dyn AsyncRead + Unpin + Send),
        limit: u64,
    ) -> Result<StoredBlob>;

    async fn get(&self, id: &str) -> Result<Vec<u8>>;

    /// Blocking reader over a stored blob, for parsing on the blocking pool.
    fn reader(&self, id: &str) -> Result<Box<dyn Read + Send>>;

    async fn contains(&self, id: &str) -> Result<bool>;
}

async fn copy_hashed<W>(
    reader: &mut (dyn AsyncRead + Unpin + Send),
    writer: &mut W,
    limit: u64,
) -> Result<StoredBlob>
where
    W: AsyncWrite + Unpin + Send,
{
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; COPY_CHUNK];
    let mut byte_len = 0u64;
    loop {
        let n = reader.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        byte_len += n as u64;
        if byte_len > limit {
            return Err(NormalizationError::ValidationError(format!(
                "upload exceeds the {} byte limit",
                limit
            )));
        }
        hasher.update(&buf[..n]);
        writer.write_all(&buf[..n]).await?;
    }
    writer.flush().await?;
    Ok(StoredBlob {
        id: format!("{:x}", hasher.finalize()),
        byte_len,
    })
}

#[derive(Clone, Default)]
pub struct InMemoryBlobStore {
    blobs: Arc<RwLock<HashMap<BlobId, Arc<[u8]>>>>,
}

impl InMemoryBlobStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.blobs.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.blobs.read().is_empty()
    }

    fn insert(&self, id: &str, bytes: Vec<u8>) {
        self.blobs
            .write()
            .entry(id.to_string())
            .or_insert_with(|| Arc::from(bytes));
    }
}

#[async_trait]
impl BlobStore for InMemoryBlobStore {
    async fn put(&self, bytes: Vec<u8>) -> Result<BlobId> {
        let id = content_hash(&bytes);
        self.insert(&id, bytes);
        Ok(id)
    }

    async fn put_stream(
        &self,
        reader: &mut (dyn AsyncRead + Unpin + Send),
        limit: u64,
    ) -> Result<StoredBlob> {
        let mut bytes = Vec::new();
        let blob = copy_hashed(reader, &mut bytes, limit).await?;
        self.insert(&blob.id, bytes);
        Ok(blob)
    }

    async fn get(&self, id: &str) -> Result<Vec<u8>> {
        self.blobs
            .read()
            .get(id)
            .map(|b| b.to_vec())
            .ok_or_else(|| NormalizationError::not_found("blob", id))
    }

    fn reader(&self, id: &str) -> Result<Box<dyn Read + Send>> {
        let bytes = self
            .blobs
            .read()
            .get(id)
            .cloned()
            .ok_or_else(|| NormalizationError::not_found("blob", id))?;
        Ok(Box::new(Cursor::new(bytes)))
    }

    async fn contains(&self, id: &str) -> Result<bool> {
        Ok(self.blobs.read().contains_key(id))
    }
}

/// Stores each blob as `<root>/<hash>`.
#[derive(Debug, Clone)]
pub struct FsBlobStore {
    root: PathBuf,
}

/// Removes a partially written upload unless it was renamed into place.
struct TempBlob {
    path: PathBuf,
    keep: bool,
}

impl Drop for TempBlob {
    fn drop(&mut self) {
        if self.keep {
            return;
        }
        if let Err(e) = std::fs::remove_file(&self.path) {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!("Could not remove temporary blob {}: {}", self.path.display(), e);
            }
        }
    }
}

impl FsBlobStore {
    pub async fn open(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        tokio::fs::create_dir_all(&root).await?;
        Ok(Self { root })
    }

    fn path_for(&self, id: &str) -> Result<PathBuf> {
        if id.len() != 64 || !id.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(NormalizationError::ValidationError(format!(
                "invalid blob id: {}",
                id
            )));
        }
        Ok(self.root.join(id))
    }

    fn temp_blob(&self) -> TempBlob {
        TempBlob {
            path: self
                .root
                .join(format!("upload-{}.tmp", uuid::Uuid::new_v4().simple())),
            keep: false,
        }
    }

    async fn commit(&self, mut temp: TempBlob, id: &str) -> Result<()> {
        let path = self.path_for(id)?;
        if tokio::fs::try_exists(&path).await? {
            return Ok(());
        }
        tokio::fs::rename(&temp.path, &path).await?;
        temp.keep = true;
        Ok(())
    }
}

#[async_trait]
impl BlobStore for FsBlobStore {
    async fn put(&self, bytes: Vec<u8>) -> Result<BlobId> {
        let id = content_hash(&bytes);
        if tokio::fs::try_exists(self.path_for(&id)?).await? {
            return Ok(id);
        }

        // Written under a temp name so a crash never leaves a truncated blob under its hash.
        let temp = self.temp_blob();
        tokio::fs::write(&temp.path, &bytes).await?;
        self.commit(temp, &id).await?;
        Ok(id)
    }

    async fn put_stream(
        &self,
        reader: &mut (dyn AsyncRead + Unpin + Send),
        limit: u64,
    ) -> Result<StoredBlob> {
        let temp = self.temp_blob();
        let mut file = tokio::fs::File::create(&temp.path).await?;
        let blob = copy_hashed(reader, &mut file, limit).await?;
        file.sync_all().await?;
        drop(file);

        self.commit(temp, &blob.id).await?;
        Ok(blob)
    }

    async fn get(&self, id: &str) -> Result<Vec<u8>> {
        let path = self.path_for(id)?;
        match tokio::fs::read(&path).await {
            Ok(bytes) => Ok(bytes),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(NormalizationError::not_found("blob", id))
            }
            Err(e) => Err(e.into()),
        }
    }

    fn reader(&self, id: &str) -> Result<Box<dyn Read + Send>> {
        let path = self.path_for(id)?;
        match std::fs::File::open(&path) {
            Ok(file) => Ok(Box::new(BufReader::new(file))),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(NormalizationError::not_found("blob", id))
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn contains(&self, id: &str) -> Result<bool> {
        let path = self.path_for(id)?;
        Ok(tokio::fs::try_exists(&path).await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn read_all(mut reader: Box<dyn Read + Send>) -> Vec<u8> {
        let mut out = Vec::new();
        reader.read_to_end(&mut out).unwrap();
        out
    }

    #[tokio::test]
    async fn test_in_memory_put_is_content_addressed() {
        let store = InMemoryBlobStore::new();
        let a = store.put(b"hello".to_vec()).await.unwrap();
        let b = store.put(b"hello".to_vec()).await.unwrap();
        assert_eq!(a, b);
        assert_eq!(store.len(), 1);
        assert_eq!(store.get(&a).await.unwrap(), b"hello".to_vec());
        assert!(matches!(
            store.get("missing").await,
            Err(NormalizationError::NotFound { .. })
        ));
    }

    #[tokio::test]
    async fn test_in_memory_stream_matches_put() {
        let store = InMemoryBlobStore::new();
        let bytes: Vec<u8> = (0..200_000u32).map(|i| (i % 251) as u8).collect();

        let blob = store.put_stream(&mut bytes.as_slice(), 1 << 20).await.unwrap();
        assert_eq!(blob.id, content_hash(&bytes));
        assert_eq!(blob.byte_len, bytes.len() as u64);
        assert_eq!(store.put(bytes.clone()).await.unwrap(), blob.id);
        assert_eq!(store.len(), 1);
        assert_eq!(read_all(store.reader(&blob.id).unwrap()), bytes);
    }

    #[tokio::test]
    async fn test_stream_over_limit_stores_nothing() {
        let store = InMemoryBlobStore::new();
        let err = store
            .put_stream(&mut &b"0123456789abcdef"[..], 8)
            .await
            .unwrap_err();
        assert!(matches!(err, NormalizationError::ValidationError(_)));
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn test_fs_store_round_trip() {
        let dir = std::env::temp_dir().join(format!("fsb-blobs-{}", uuid::Uuid::new_v4()));
        let store = FsBlobStore::open(&dir).await.unwrap();

        let id = store.put(b"a;b\n1;2\n".to_vec()).await.unwrap();
        assert!(store.contains(&id).await.unwrap());
        assert_eq!(store.get(&id).await.unwrap(), b"a;b\n1;2\n".to_vec());
        assert!(store.get("../etc/passwd").await.is_err());

        tokio::fs::remove_dir_all(&dir).await.unwrap();
    }

    #[tokio::test]
    async fn test_fs_stream_leaves_only_the_blob() {
        let dir = std::env::temp_dir().join(format!("fsb-blobs-{}", uuid::Uuid::new_v4()));
        let store = FsBlobStore::open(&dir).await.unwrap();
        let bytes = b"conta;valor\n1.01;10,00\n".to_vec();

        let blob = store.put_stream(&mut bytes.as_slice(), 1024).await.unwrap();
        let again = store.put_stream(&mut bytes.as_slice(), 1024).await.unwrap();
        assert_eq!(blob, again);
        assert_eq!(read_all(store.reader(&blob.id).unwrap()), bytes);

        assert!(store.put_stream(&mut bytes.as_slice(), 4).await.is_err());

        let names: Vec<String> = std::fs::read_dir(&dir)
            .unwrap()
            .map(|entry| entry.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names, vec![blob.id.clone()]);

        tokio::fs::remove_dir_all(&dir).await.unwrap();
    }
}
