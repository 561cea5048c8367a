use std::collections::BTreeMap;
use std::fmt::Display;
use std::future::Future;
use std::io;
use std::path::{Component, Path, PathBuf};
use std::pin::Pin;
use std::sync::{
    atomic::{AtomicBool, Ordering},
    RwLock,
};
use std::time::Duration;

use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use sha2::Sha256;
use tokio::fs;
use tracing::debug;

/// Result type for storage operations.
pub type StorageResult<T> = Result<T, StorageError>;

/// Boxed future type for storage operations, enabling object safety.
pub type StorageFuture<'a, T> = Pin<Box<dyn Future<Output = StorageResult<T>> + Send + 'a>>;

/// Errors that can occur during storage operations.
#[derive(Debug)]
pub enum StorageError {
    /// No object is stored under the key.
    NotFound(String),
    /// The key cannot be mapped onto the backend.
    InvalidKey(String),
    /// An I/O error occurred.
    Io(io::Error),
    /// A storage engine error occurred.
    EngineError(String),
}

impl Display for StorageError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StorageError::NotFound(key) => write!(f, "Object not found: {key}"),
            StorageError::InvalidKey(key) => write!(f, "Invalid key: {key}"),
            StorageError::Io(e) => write!(f, "I/O error: {e}"),
            StorageError::EngineError(msg) => write!(f, "Storage error: {msg}"),
        }
    }
}

impl std::error::Error for StorageError {}

/// Joins a prefix and an identifier into a store key, ignoring leading and
/// trailing slashes on the prefix.
///
/// ```rust
/// assert_eq!(mailrelay_utils::blob_key("/email/", "abc"), "email/abc");
/// assert_eq!(mailrelay_utils::blob_key("", "abc"), "abc");
/// ```
pub fn blob_key(prefix: &str, id: &str) -> String {
    let prefix = prefix.trim_matches('/');
    if prefix.is_empty() {
        id.to_string()
    } else {
        format!("{prefix}/{id}")
    }
}

/// A stored object as returned by [`BlobStore::list`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlobEntry {
    pub key: String,
    pub last_modified: Option<DateTime<Utc>>,
}

/// Trait for flat key/value blob stores.
///
/// There are no transactions and no locking, concurrent writers to the
/// same key resolve as last write wins.
pub trait BlobStore: Send + Sync {
    /// Fetches the object stored under `key`.
    fn get<'a>(&'a self, key: &'a str) -> StorageFuture<'a, Vec<u8>>;

    /// Stores `data` under `key`, replacing any previous object.
    fn put<'a>(&'a self, key: &'a str, data: Vec<u8>) -> StorageFuture<'a, ()>;

    /// Copies the object at `src` to `dst`.
    fn copy<'a>(&'a self, src: &'a str, dst: &'a str) -> StorageFuture<'a, ()>;

    /// Deletes the object stored under `key`.
    fn delete<'a>(&'a self, key: &'a str) -> StorageFuture<'a, ()>;

    /// Lists the objects directly under `prefix`.
    fn list<'a>(&'a self, prefix: &'a str) -> StorageFuture<'a, Vec<BlobEntry>>;

    /// Returns a URL granting read access to `key` for `ttl`.
    fn presign<'a>(&'a self, key: &'a str, ttl: Duration) -> StorageFuture<'a, String>;

    /// Returns the name of this store.
    fn name(&self) -> &str;
}

fn expiry(ttl: Duration) -> i64 {
    let ttl = chrono::Duration::from_std(ttl).unwrap_or(chrono::Duration::zero());
    (Utc::now() + ttl).timestamp()
}

/// Signs presigned URLs so that whoever serves them can enforce the
/// expiry.
///
/// The signature is the lower-case hex HMAC-SHA-256 of `{key}\n{expires}`,
/// `key` without leading slashes and `expires` in unix seconds.
#[derive(Clone)]
pub struct UrlSigner {
    secret: Vec<u8>,
}

impl std::fmt::Debug for UrlSigner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UrlSigner").finish_non_exhaustive()
    }
}

impl UrlSigner {
    pub fn new(secret: impl Into<Vec<u8>>) -> Self {
        Self {
            secret: secret.into(),
        }
    }

    fn mac(&self, key: &str, expires: i64) -> StorageResult<Hmac<Sha256>> {
        let mut mac = Hmac::<Sha256>::new_from_slice(&self.secret)
            .map_err(|e| StorageError::EngineError(format!("signing key: {e}")))?;
        mac.update(key.trim_start_matches('/').as_bytes());
        mac.update(b"\n");
        mac.update(expires.to_string().as_bytes());
        Ok(mac)
    }

    /// Returns the signature granting access to `key` until `expires`.
    pub fn sign(&self, key: &str, expires: i64) -> StorageResult<String> {
        Ok(hex::encode(self.mac(key, expires)?.finalize().into_bytes()))
    }

    /// Checks a signature against the current time.
    pub fn verify(&self, key: &str, expires: i64, signature: &str) -> bool {
        self.verify_at(key, expires, signature, Utc::now().timestamp())
    }

    /// Checks that `signature` was issued for `key` and `expires`, and
    /// that `now` is not past `expires`.
    pub fn verify_at(&self, key: &str, expires: i64, signature: &str, now: i64) -> bool {
        if now > expires {
            return false;
        }
        let Ok(signature) = hex::decode(signature) else {
            return false;
        };
        self.mac(key, expires)
            .is_ok_and(|mac| mac.verify_slice(&signature).is_ok())
    }

    /// Appends `expires` and its signature as query to `url`.
    fn query(&self, url: String, key: &str, expires: i64) -> StorageResult<String> {
        let signature = self.sign(key, expires)?;
        Ok(format!("{url}?expires={expires}&signature={signature}"))
    }
}

/// Filesystem-based blob store.
///
/// Every key maps onto a file below the base path: `{base_path}/{key}`.
#[derive(Debug, Clone)]
pub struct FileBlobStore {
    /// Base path for stored objects.
    base_path: PathBuf,

    /// Public location the base path is served from, used for presigning.
    public_url: Option<String>,

    /// Signer for presigned URLs, without one the URLs carry no signature.
    signer: Option<UrlSigner>,
}

impl FileBlobStore {
    /// Creates a new FileBlobStore rooted at the given base path.
    pub fn new(base_path: PathBuf) -> Self {
        Self {
            base_path,
            public_url: None,
            signer: None,
        }
    }

    /// Points presigned URLs at `public_url` instead of the local path.
    pub fn with_public_url(mut self, public_url: String) -> Self {
        self.public_url = Some(public_url);
        self
    }

    /// Signs presigned URLs with `signer`.
    pub fn with_signer(mut self, signer: UrlSigner) -> Self {
        self.signer = Some(signer);
        self
    }

    /// Returns the path of the object stored under `key`, refusing keys
    /// that would escape the base path.
    fn object_path(&self, key: &str) -> StorageResult<PathBuf> {
        let relative = Path::new(key.trim_start_matches('/'));
        let valid = relative
            .components()
            .all(|c| matches!(c, Component::Normal(_)));
        if key.is_empty() || !valid {
            return Err(StorageError::InvalidKey(key.to_string()));
        }
        Ok(self.base_path.join(relative))
    }

    fn map_io(key: &str, e: io::Error) -> StorageError {
        if e.kind() == io::ErrorKind::NotFound {
            StorageError::NotFound(key.to_string())
        } else {
            StorageError::Io(e)
        }
    }

    async fn write(&self, key: &str, data: &[u8]) -> StorageResult<()> {
        let path = self.object_path(key)?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await.map_err(StorageError::Io)?;
        }
        fs::write(&path, data).await.map_err(StorageError::Io)?;
        debug!(key = %key, size = data.len(), "Stored object to filesystem");
        Ok(())
    }
}

impl BlobStore for FileBlobStore {
    fn get<'a>(&'a self, key: &'a str) -> StorageFuture<'a, Vec<u8>> {
        Box::pin(async move {
            let path = self.object_path(key)?;
            fs::read(path).await.map_err(|e| Self::map_io(key, e))
        })
    }

    fn put<'a>(&'a self, key: &'a str, data: Vec<u8>) -> StorageFuture<'a, ()> {
        Box::pin(async move { self.write(key, &data).await })
    }

    fn copy<'a>(&'a self, src: &'a str, dst: &'a str) -> StorageFuture<'a, ()> {
        Box::pin(async move {
            let data = self.get(src).await?;
            self.write(dst, &data).await
        })
    }

    fn delete<'a>(&'a self, key: &'a str) -> StorageFuture<'a, ()> {
        Box::pin(async move {
            let path = self.object_path(key)?;
            fs::remove_file(path)
                .await
                .map_err(|e| Self::map_io(key, e))
        })
    }

    fn list<'a>(&'a self, prefix: &'a str) -> StorageFuture<'a, Vec<BlobEntry>> {
        Box::pin(async move {
            let dir = self.object_path(prefix)?;

            // Return empty list if directory doesn't exist
            if !fs::try_exists(&dir).await.map_err(StorageError::Io)? {
                return Ok(Vec::new());
            }

            let mut entries = Vec::new();
            let mut read_dir = fs::read_dir(&dir).await.map_err(StorageError::Io)?;
            while let Some(entry) = read_dir.next_entry().await.map_err(StorageError::Io)? {
                let metadata = entry.metadata().await.map_err(StorageError::Io)?;
                if !metadata.is_file() {
                    continue;
                }
                let name = entry.file_name().to_string_lossy().to_string();
                entries.push(BlobEntry {
                    key: blob_key(prefix, &name),
                    last_modified: metadata.modified().ok().map(DateTime::<Utc>::from),
                });
            }
            entries.sort_by(|a, b| a.key.cmp(&b.key));
            Ok(entries)
        })
    }

    fn presign<'a>(&'a self, key: &'a str, ttl: Duration) -> StorageFuture<'a, String> {
        Box::pin(async move {
            let path = self.object_path(key)?;
            let expires = expiry(ttl);
            let url = match &self.public_url {
                Some(base) => format!(
                    "{}/{}",
                    base.trim_end_matches('/'),
                    key.trim_start_matches('/')
                ),
                None => format!("file://{}", path.display()),
            };
            match &self.signer {
                Some(signer) => signer.query(url, key, expires),
                None => Ok(format!("{url}?expires={expires}")),
            }
        })
    }

    fn name(&self) -> &str {
        "file"
    }
}

/// In-memory blob store.
///
/// Stores objects in a sorted map keyed by the normalized key.
/// Useful for testing and development, its presigned URLs are not signed.
#[derive(Debug, Default)]
pub struct MemoryBlobStore {
    objects: RwLock<BTreeMap<String, (Vec<u8>, DateTime<Utc>)>>,
    read_only: AtomicBool,
}

impl MemoryBlobStore {
    /// Creates a new empty MemoryBlobStore.
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes every later write fail, reads keep working.
    pub fn set_read_only(&self, read_only: bool) {
        self.read_only.store(read_only, Ordering::SeqCst);
    }

    /// Returns the number of stored objects.
    pub fn len(&self) -> usize {
        self.objects.read().map(|o| o.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns whether an object is stored under `key`.
    pub fn contains(&self, key: &str) -> bool {
        self.objects
            .read()
            .map(|o| o.contains_key(Self::normalize(key)))
            .unwrap_or(false)
    }

    /// Returns every stored key below `prefix`, nested ones included.
    pub fn keys(&self, prefix: &str) -> Vec<String> {
        let prefix = blob_key(prefix, "");
        self.objects
            .read()
            .map(|o| o.keys().filter(|k| k.starts_with(&prefix)).cloned().collect())
            .unwrap_or_default()
    }

    fn normalize(key: &str) -> &str {
        key.trim_start_matches('/')
    }

    fn poisoned() -> StorageError {
        StorageError::EngineError("memory store lock poisoned".to_string())
    }

    fn read(&self, key: &str) -> StorageResult<Vec<u8>> {
        let objects = self.objects.read().map_err(|_| Self::poisoned())?;
        objects
            .get(Self::normalize(key))
            .map(|(data, _)| data.clone())
            .ok_or_else(|| StorageError::NotFound(key.to_string()))
    }

    fn write(&self, key: &str, data: Vec<u8>) -> StorageResult<()> {
        if self.read_only.load(Ordering::SeqCst) {
            return Err(StorageError::EngineError(format!(
                "memory store is read-only: {key}"
            )));
        }
        let mut objects = self.objects.write().map_err(|_| Self::poisoned())?;
        objects.insert(Self::normalize(key).to_string(), (data, Utc::now()));
        Ok(())
    }
}

impl BlobStore for MemoryBlobStore {
    fn get<'a>(&'a self, key: &'a str) -> StorageFuture<'a, Vec<u8>> {
        Box::pin(async move { self.read(key) })
    }

    fn put<'a>(&'a self, key: &'a str, data: Vec<u8>) -> StorageFuture<'a, ()> {
        Box::pin(async move { self.write(key, data) })
    }

    fn copy<'a>(&'a self, src: &'a str, dst: &'a str) -> StorageFuture<'a, ()> {
        Box::pin(async move {
            let data = self.read(src)?;
            self.write(dst, data)
        })
    }

    fn delete<'a>(&'a self, key: &'a str) -> StorageFuture<'a, ()> {
        Box::pin(async move {
            if self.read_only.load(Ordering::SeqCst) {
                return Err(StorageError::EngineError(format!(
                    "memory store is read-only: {key}"
                )));
            }
            let mut objects = self.objects.write().map_err(|_| Self::poisoned())?;
            objects
                .remove(Self::normalize(key))
                .map(|_| ())
                .ok_or_else(|| StorageError::NotFound(key.to_string()))
        })
    }

    fn list<'a>(&'a self, prefix: &'a str) -> StorageFuture<'a, Vec<BlobEntry>> {
        Box::pin(async move {
            let dir = blob_key(prefix, "");
            let objects = self.objects.read().map_err(|_| Self::poisoned())?;
            Ok(objects
                .iter()
                .filter(|(k, _)| {
                    k.strip_prefix(&dir)
                        .is_some_and(|rest| !rest.is_empty() && !rest.contains('/'))
                })
                .map(|(k, (_, modified))| BlobEntry {
                    key: k.clone(),
                    last_modified: Some(*modified),
                })
                .collect())
        })
    }

    fn presign<'a>(&'a self, key: &'a str, ttl: Duration) -> StorageFuture<'a, String> {
        Box::pin(async move {
            Ok(format!(
                "memory://{}?expires={}",
                Self::normalize(key),
                expiry(ttl)
            ))
        })
    }

    fn name(&self) -> &str {
        "memory"
    }
}
