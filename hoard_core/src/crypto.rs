//! Encryption engine for content at rest and in transit.
//!
//! Every encryption draws a fresh random nonce and writes it in front of the
//! ciphertext, so the on-disk and on-wire format is `nonce || ciphertext`.
//! Any RustCrypto stream cipher implementing `KeyIvInit + StreamCipher` can be
//! plugged in; AES-256 in CTR mode is the default.

use std::{fmt, marker::PhantomData};

use async_trait::async_trait;
use ctr::cipher::{KeyIvInit, StreamCipher};
use rand::RngCore;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use zeroize::Zeroizing;

/// Length of keys produced by [`generate_key`].
pub const KEY_LEN: usize = 32;

/// Size of the chunks read from the plaintext/ciphertext source.
pub const BUFFER_SIZE: usize = 32 * 1024;

/// AES-256 in big-endian 128 bit counter mode.
pub type Aes256Ctr = ctr::Ctr128BE<aes::Aes256>;

/// Encrypter used by file servers unless configured otherwise.
pub type DefaultEncrypter = StreamEncrypter<Aes256Ctr>;

/// XChaCha20 with a 24 byte nonce prefix.
pub type XChaChaEncrypter = StreamEncrypter<chacha20::XChaCha20>;

/// Errors that can occur during cryptographic operations.
#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("invalid key length: expected {expected} bytes, got {actual}")]
    InvalidKeyLength { expected: usize, actual: usize },
    #[error("ciphertext too short: expected a {0} byte nonce prefix")]
    Truncated(usize),
    #[error("keystream exhausted")]
    KeystreamExhausted,
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Generate a random 32-byte symmetric key.
pub fn generate_key() -> [u8; KEY_LEN] {
    let mut key = [0u8; KEY_LEN];
    rand::rng().fill_bytes(&mut key);
    key
}

/// Encrypt everything readable from `src` into `dst` with cipher `C`.
///
/// Writes the nonce first, then the ciphertext chunk by chunk as it is
/// produced. Returns the number of bytes written to `dst`, nonce included.
pub async fn encrypt<C, R, W>(key: &[u8], src: &mut R, dst: &mut W) -> Result<u64, CryptoError>
where
    C: KeyIvInit + StreamCipher + Send,
    R: AsyncRead + Unpin + ?Sized,
    W: AsyncWrite + Unpin + ?Sized,
{
    check_key_len::<C>(key)?;

    let mut nonce = vec![0u8; C::iv_size()];
    rand::rng().fill_bytes(&mut nonce);
    let mut cipher = new_cipher::<C>(key, &nonce)?;

    dst.write_all(&nonce).await?;
    let mut total = nonce.len() as u64;

    let mut buf = vec![0u8; BUFFER_SIZE];
    loop {
        let n = src.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        cipher
            .try_apply_keystream(&mut buf[..n])
            .map_err(|_| CryptoError::KeystreamExhausted)?;
        dst.write_all(&buf[..n]).await?;
        total += n as u64;
    }
    dst.flush().await?;

    Ok(total)
}

/// Decrypt a `nonce || ciphertext` stream from `src` into `dst` with cipher `C`.
///
/// Returns the number of plaintext bytes written. A wrong key is not
/// detectable here; it yields garbage plaintext.
pub async fn decrypt<C, R, W>(key: &[u8], src: &mut R, dst: &mut W) -> Result<u64, CryptoError>
where
    C: KeyIvInit + StreamCipher + Send,
    R: AsyncRead + Unpin + ?Sized,
    W: AsyncWrite + Unpin + ?Sized,
{
    check_key_len::<C>(key)?;

    let mut nonce = vec![0u8; C::iv_size()];
    src.read_exact(&mut nonce).await.map_err(|err| {
        if err.kind() == std::io::ErrorKind::UnexpectedEof {
            CryptoError::Truncated(nonce.len())
        } else {
            CryptoError::Io(err)
        }
    })?;
    let mut cipher = new_cipher::<C>(key, &nonce)?;

    let mut total = 0u64;
    let mut buf = vec![0u8; BUFFER_SIZE];
    loop {
        let n = src.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        cipher
            .try_apply_keystream(&mut buf[..n])
            .map_err(|_| CryptoError::KeystreamExhausted)?;
        dst.write_all(&buf[..n]).await?;
        total += n as u64;
    }
    dst.flush().await?;

    Ok(total)
}

fn check_key_len<C: KeyIvInit>(key: &[u8]) -> Result<(), CryptoError> {
    if key.len() != C::key_size() {
        return Err(CryptoError::InvalidKeyLength {
            expected: C::key_size(),
            actual: key.len(),
        });
    }
    Ok(())
}

fn new_cipher<C: KeyIvInit>(key: &[u8], nonce: &[u8]) -> Result<C, CryptoError> {
    C::new_from_slices(key, nonce).map_err(|_| CryptoError::InvalidKeyLength {
        expected: C::key_size(),
        actual: key.len(),
    })
}

/// A symmetric key bound to an encryption scheme.
///
/// This is the extension point for alternative schemes (e.g. one that appends
/// an authentication tag): the file server only talks to this trait.
#[async_trait]
pub trait Encrypter: fmt::Debug + Send + Sync + 'static {
    /// The key used for every encrypt/decrypt call.
    fn key(&self) -> &[u8];

    /// Number of bytes `encrypt` adds in front of the ciphertext.
    fn nonce_len(&self) -> usize;

    async fn encrypt(
        &self,
        src: &mut (dyn AsyncRead + Send + Unpin),
        dst: &mut (dyn AsyncWrite + Send + Unpin),
    ) -> Result<u64, CryptoError>;

    async fn decrypt(
        &self,
        src: &mut (dyn AsyncRead + Send + Unpin),
        dst: &mut (dyn AsyncWrite + Send + Unpin),
    ) -> Result<u64, CryptoError>;
}

/// [`Encrypter`] for any IV-prefixed stream cipher.
pub struct StreamEncrypter<C> {
    key: Zeroizing<Vec<u8>>,
    _cipher: PhantomData<fn() -> C>,
}

impl<C: KeyIvInit> StreamEncrypter<C> {
    /// Use `key`, which must match the cipher's key size.
    pub fn new(key: &[u8]) -> Result<Self, CryptoError> {
        check_key_len::<C>(key)?;
        Ok(Self {
            key: Zeroizing::new(key.to_vec()),
            _cipher: PhantomData,
        })
    }

    /// Use `key` if it has the right length, otherwise a freshly generated key.
    pub fn new_or_generate(key: Option<&[u8]>) -> Self {
        match key.map(Self::new) {
            Some(Ok(encrypter)) => encrypter,
            Some(Err(err)) => {
                tracing::warn!("ignoring supplied key ({err}), generating a new one");
                Self::generate()
            }
            None => Self::generate(),
        }
    }

    /// Use a freshly generated random key.
    pub fn generate() -> Self {
        let mut key = Zeroizing::new(vec![0u8; C::key_size()]);
        rand::rng().fill_bytes(&mut key);
        Self {
            key,
            _cipher: PhantomData,
        }
    }
}

impl<C> fmt::Debug for StreamEncrypter<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StreamEncrypter")
            .field("cipher", &std::any::type_name::<C>())
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl<C> Encrypter for StreamEncrypter<C>
where
    C: KeyIvInit + StreamCipher + Send + 'static,
{
    fn key(&self) -> &[u8] {
        &self.key
    }

    fn nonce_len(&self) -> usize {
        C::iv_size()
    }

    async fn encrypt(
        &self,
        src: &mut (dyn AsyncRead + Send + Unpin),
        dst: &mut (dyn AsyncWrite + Send + Unpin),
    ) -> Result<u64, CryptoError> {
        encrypt::<C, _, _>(&self.key, src, dst).await
    }

    async fn decrypt(
        &self,
        src: &mut (dyn AsyncRead + Send + Unpin),
        dst: &mut (dyn AsyncWrite + Send + Unpin),
    ) -> Result<u64, CryptoError> {
        decrypt::<C, _, _>(&self.key, src, dst).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn seal(encrypter: &dyn Encrypter, plaintext: &[u8]) -> Vec<u8> {
        let mut out = Vec::new();
        encrypter
            .encrypt(&mut &plaintext[..], &mut out)
            .await
            .unwrap();
        out
    }

    async fn open(encrypter: &dyn Encrypter, ciphertext: &[u8]) -> Vec<u8> {
        let mut out = Vec::new();
        encrypter
            .decrypt(&mut &ciphertext[..], &mut out)
            .await
            .unwrap();
        out
    }

    #[test]
    fn test_generate_key() {
        let a = generate_key();
        let b = generate_key();
        assert_eq!(a.len(), KEY_LEN);
        assert_ne!(a, b);
    }

    #[tokio::test]
    async fn test_roundtrip() {
        let encrypter = DefaultEncrypter::generate();
        let plaintext = b"test aes encrypt!";

        let ciphertext = seal(&encrypter, plaintext).await;
        assert_eq!(ciphertext.len(), plaintext.len() + 16);
        assert_ne!(&ciphertext[16..], plaintext.as_slice());

        assert_eq!(open(&encrypter, &ciphertext).await, plaintext);
    }

    #[tokio::test]
    async fn test_roundtrip_multiple_chunks() {
        let encrypter = DefaultEncrypter::generate();
        let plaintext: Vec<u8> = (0..BUFFER_SIZE * 3 + 17).map(|i| (i % 251) as u8).collect();

        let ciphertext = seal(&encrypter, &plaintext).await;
        assert_eq!(open(&encrypter, &ciphertext).await, plaintext);
    }

    #[tokio::test]
    async fn test_empty_plaintext() {
        let encrypter = DefaultEncrypter::generate();
        let ciphertext = seal(&encrypter, b"").await;
        assert_eq!(ciphertext.len(), encrypter.nonce_len());
        assert!(open(&encrypter, &ciphertext).await.is_empty());
    }

    #[tokio::test]
    async fn test_fresh_nonce_per_call() {
        let encrypter = DefaultEncrypter::generate();
        let first = seal(&encrypter, b"same plaintext").await;
        let second = seal(&encrypter, b"same plaintext").await;
        assert_ne!(first, second);
        assert_ne!(first[..16], second[..16]);
    }

    #[tokio::test]
    async fn test_byte_counts() {
        let encrypter = DefaultEncrypter::generate();
        let mut ciphertext = Vec::new();
        let written = encrypter
            .encrypt(&mut &b"hello world"[..], &mut ciphertext)
            .await
            .unwrap();
        assert_eq!(written, 11 + 16);

        let mut plaintext = Vec::new();
        let read = encrypter
            .decrypt(&mut &ciphertext[..], &mut plaintext)
            .await
            .unwrap();
        assert_eq!(read, 11);
    }

    #[tokio::test]
    async fn test_wrong_key_yields_garbage() {
        let encrypter = DefaultEncrypter::generate();
        let other = DefaultEncrypter::generate();
        let ciphertext = seal(&encrypter, b"attack at dawn").await;
        assert_ne!(open(&other, &ciphertext).await, b"attack at dawn");
    }

    #[tokio::test]
    async fn test_truncated_nonce() {
        let encrypter = DefaultEncrypter::generate();
        let mut out = Vec::new();
        let err = encrypter
            .decrypt(&mut &[1u8, 2, 3][..], &mut out)
            .await
            .unwrap_err();
        assert!(matches!(err, CryptoError::Truncated(16)));
    }

    #[tokio::test]
    async fn test_xchacha20_roundtrip() {
        let encrypter = XChaChaEncrypter::generate();
        assert_eq!(encrypter.nonce_len(), 24);
        let ciphertext = seal(&encrypter, b"Hello, hoard!").await;
        assert_eq!(ciphertext.len(), 13 + 24);
        assert_eq!(open(&encrypter, &ciphertext).await, b"Hello, hoard!");
    }

    #[test]
    fn test_invalid_key_length() {
        let result = DefaultEncrypter::new(&[0u8; 16]);
        assert!(matches!(
            result,
            Err(CryptoError::InvalidKeyLength {
                expected: 32,
                actual: 16
            })
        ));
    }

    #[test]
    fn test_new_or_generate() {
        let key = hex::decode("984eb1fdd6e12dfcf5bf0a8c71c3cb65d7d4506b392bf2f56051cc025ad37a6d")
            .unwrap();
        assert_eq!(DefaultEncrypter::new_or_generate(Some(key.as_slice())).key(), key);

        let generated = DefaultEncrypter::new_or_generate(Some(&[1u8, 2, 3][..]));
        assert_eq!(generated.key().len(), 32);
        assert_eq!(DefaultEncrypter::new_or_generate(None).key().len(), 32);
    }
}
