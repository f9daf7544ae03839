//! Content-addressable store: a direct projection of keys onto files below a
//! root directory. There is no index; every call resolves the key's
//! [`PathKey`] again.

use std::{
    io,
    path::{Component, Path, PathBuf},
};

use thiserror::Error;
use tokio::{
    fs::File,
    io::{AsyncRead, AsyncWrite, AsyncWriteExt},
};
use tracing::debug;

use crate::{
    crypto::{CryptoError, Encrypter},
    paths::{PathKey, PathTransform, hashed_path_transform},
};

/// Root used when none is configured.
pub const DEFAULT_ROOT: &str = "hoard_storage";

pub type StoreResult<T> = Result<T, StoreError>;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("invalid path for key '{0}': must be relative and without '..'")]
    InvalidPath(String),
    #[error("key '{0}' not found")]
    NotFound(String),
    #[error(transparent)]
    Crypto(#[from] CryptoError),
    #[error(transparent)]
    Io(#[from] io::Error),
}

#[derive(Debug, Clone)]
pub struct StoreOpts {
    pub root: PathBuf,
    pub path_transform: PathTransform,
}

impl Default for StoreOpts {
    fn default() -> Self {
        Self {
            root: PathBuf::from(DEFAULT_ROOT),
            path_transform: hashed_path_transform,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Store {
    root: PathBuf,
    path_transform: PathTransform,
}

impl Store {
    pub fn new(opts: StoreOpts) -> Self {
        let root = if opts.root.as_os_str().is_empty() {
            PathBuf::from(DEFAULT_ROOT)
        } else {
            opts.root
        };
        Store {
            root,
            path_transform: opts.path_transform,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn path_key(&self, key: &str) -> PathKey {
        (self.path_transform)(key)
    }

    /// Absolute location of the file holding `key`.
    pub fn full_path(&self, key: &str) -> StoreResult<PathBuf> {
        let relative = self.path_key(key).full_path();
        let is_safe = relative
            .components()
            .all(|component| matches!(component, Component::Normal(_)));
        if !is_safe || relative.as_os_str().is_empty() {
            return Err(StoreError::InvalidPath(key.to_owned()));
        }
        Ok(self.root.join(relative))
    }

    /// Copies `reader` verbatim into the file for `key`, replacing any
    /// previous content. A failed write may leave a truncated file behind.
    pub async fn write<R>(&self, key: &str, reader: &mut R) -> StoreResult<u64>
    where
        R: AsyncRead + Unpin + ?Sized,
    {
        let (path, mut file) = self.create(key).await?;
        let n = tokio::io::copy(reader, &mut file).await?;
        file.flush().await?;
        debug!("wrote {n} bytes to {}", path.display());
        Ok(n)
    }

    /// Encrypts `reader` into the file for `key`. Returns the bytes written,
    /// nonce included.
    pub async fn write_encrypted(
        &self,
        key: &str,
        encrypter: &dyn Encrypter,
        reader: &mut (dyn AsyncRead + Send + Unpin),
    ) -> StoreResult<u64> {
        let (path, mut file) = self.create(key).await?;
        let n = encrypter.encrypt(reader, &mut file).await?;
        debug!("wrote {n} encrypted bytes to {}", path.display());
        Ok(n)
    }

    /// Opens the file for `key`. Returns its size and the open handle.
    pub async fn read(&self, key: &str) -> StoreResult<(u64, File)> {
        let path = self.full_path(key)?;
        let file = File::open(&path).await.map_err(|err| not_found(key, err))?;
        let size = file.metadata().await?.len();
        Ok((size, file))
    }

    /// Decrypts the file for `key` into `writer`. Returns the plaintext size.
    pub async fn read_decrypted(
        &self,
        key: &str,
        encrypter: &dyn Encrypter,
        writer: &mut (dyn AsyncWrite + Send + Unpin),
    ) -> StoreResult<u64> {
        let (_, mut file) = self.read(key).await?;
        Ok(encrypter.decrypt(&mut file, writer).await?)
    }

    /// Best-effort check; a concurrent write or delete may change the answer
    /// right after it was given.
    pub async fn exists(&self, key: &str) -> bool {
        match self.full_path(key) {
            Ok(path) => tokio::fs::try_exists(path).await.unwrap_or(false),
            Err(_) => false,
        }
    }

    pub async fn size(&self, key: &str) -> StoreResult<u64> {
        let path = self.full_path(key)?;
        let metadata = tokio::fs::metadata(&path)
            .await
            .map_err(|err| not_found(key, err))?;
        Ok(metadata.len())
    }

    /// Removes the whole first-segment directory of `key`. With hashed paths
    /// this also drops any other key sharing that prefix.
    pub async fn delete(&self, key: &str) -> StoreResult<()> {
        // validates the key
        self.full_path(key)?;
        let path_key = self.path_key(key);
        let root = self.root.join(path_key.root_path());
        remove_dir_all_if_exists(&root).await?;
        debug!("deleted {} ({})", path_key.file_name, root.display());
        Ok(())
    }

    /// Removes every stored file.
    pub async fn clear(&self) -> StoreResult<()> {
        remove_dir_all_if_exists(&self.root).await?;
        Ok(())
    }

    async fn create(&self, key: &str) -> StoreResult<(PathBuf, File)> {
        let path = self.full_path(key)?;
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let file = File::create(&path).await?;
        Ok((path, file))
    }
}

fn not_found(key: &str, err: io::Error) -> StoreError {
    if err.kind() == io::ErrorKind::NotFound {
        StoreError::NotFound(key.to_owned())
    } else {
        StoreError::Io(err)
    }
}

async fn remove_dir_all_if_exists(path: &Path) -> io::Result<()> {
    match tokio::fs::remove_dir_all(path).await {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(err) => Err(err),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{crypto::DefaultEncrypter, paths::plain_path_transform};
    use tokio::io::AsyncReadExt;

    fn new_store(root: &Path) -> Store {
        Store::new(StoreOpts {
            root: root.to_path_buf(),
            path_transform: hashed_path_transform,
        })
    }

    async fn read_all(store: &Store, key: &str) -> Vec<u8> {
        let (size, mut file) = store.read(key).await.unwrap();
        let mut buf = Vec::new();
        file.read_to_end(&mut buf).await.unwrap();
        assert_eq!(size, buf.len() as u64);
        buf
    }

    #[tokio::test]
    async fn test_write_read_delete() {
        let temp_dir = tempfile::tempdir().unwrap();
        let store = new_store(temp_dir.path());
        let key = "test_file_path";

        let written = store.write(key, &mut &b"some bytes"[..]).await.unwrap();
        assert_eq!(written, 10);
        assert!(store.exists(key).await);
        assert_eq!(read_all(&store, key).await, b"some bytes");
        assert_eq!(store.size(key).await.unwrap(), 10);

        store.delete(key).await.unwrap();
        assert!(!store.exists(key).await);
        let root = temp_dir.path().join(store.path_key(key).root_path());
        assert!(!root.exists());
    }

    #[tokio::test]
    async fn test_file_lives_at_path_key() {
        let temp_dir = tempfile::tempdir().unwrap();
        let store = new_store(temp_dir.path());

        store.write("hello", &mut &b"x"[..]).await.unwrap();
        let expected = temp_dir
            .path()
            .join(hashed_path_transform("hello").full_path());
        assert!(expected.is_file());
        assert_eq!(store.full_path("hello").unwrap(), expected);
    }

    #[tokio::test]
    async fn test_overwrite_truncates() {
        let temp_dir = tempfile::tempdir().unwrap();
        let store = new_store(temp_dir.path());

        store.write("k", &mut &b"a long first value"[..]).await.unwrap();
        store.write("k", &mut &b"short"[..]).await.unwrap();
        assert_eq!(read_all(&store, "k").await, b"short");
    }

    #[tokio::test]
    async fn test_encrypted_roundtrip() {
        let temp_dir = tempfile::tempdir().unwrap();
        let store = new_store(temp_dir.path());
        let encrypter = DefaultEncrypter::generate();
        let data = b"hello world, at rest";

        let written = store
            .write_encrypted("secret", &encrypter, &mut &data[..])
            .await
            .unwrap();
        assert_eq!(written, (data.len() + 16) as u64);

        let on_disk = read_all(&store, "secret").await;
        assert_eq!(on_disk.len(), data.len() + 16);
        assert_ne!(&on_disk[16..], data.as_slice());

        let mut out = Vec::new();
        let n = store
            .read_decrypted("secret", &encrypter, &mut out)
            .await
            .unwrap();
        assert_eq!(n, data.len() as u64);
        assert_eq!(out, data);
    }

    #[tokio::test]
    async fn test_missing_key() {
        let temp_dir = tempfile::tempdir().unwrap();
        let store = new_store(temp_dir.path());

        assert!(!store.exists("nope").await);
        assert!(matches!(
            store.read("nope").await,
            Err(StoreError::NotFound(key)) if key == "nope"
        ));
        assert!(matches!(
            store.size("nope").await,
            Err(StoreError::NotFound(_))
        ));
        store.delete("nope").await.unwrap();
    }

    #[tokio::test]
    async fn test_clear() {
        let temp_dir = tempfile::tempdir().unwrap();
        let root = temp_dir.path().join("root");
        let store = new_store(&root);

        store.write("a", &mut &b"1"[..]).await.unwrap();
        store.write("b", &mut &b"2"[..]).await.unwrap();
        store.clear().await.unwrap();
        assert!(!store.exists("a").await);
        assert!(!store.exists("b").await);
        assert!(!root.exists());

        // clearing an already missing root is fine
        store.clear().await.unwrap();
    }

    #[tokio::test]
    async fn test_plain_transform_rejects_escaping_keys() {
        let temp_dir = tempfile::tempdir().unwrap();
        let store = Store::new(StoreOpts {
            root: temp_dir.path().to_path_buf(),
            path_transform: plain_path_transform,
        });

        for key in ["../evil", "/etc/passwd", ""] {
            assert!(matches!(
                store.write(key, &mut &b"x"[..]).await,
                Err(StoreError::InvalidPath(_))
            ));
            assert!(!store.exists(key).await);
        }

        store.write("plain", &mut &b"ok"[..]).await.unwrap();
        assert!(temp_dir.path().join("plain/plain").is_file());
    }

    #[test]
    fn test_default_root() {
        let store = Store::new(StoreOpts {
            root: PathBuf::new(),
            path_transform: hashed_path_transform,
        });
        assert_eq!(store.root(), Path::new(DEFAULT_ROOT));
    }
}
