//! Core hoard types shared by all hoard crates.
//!
//! - `crypto`: the encryption engine (`Encrypter`, `StreamEncrypter`,
//!   AES-256-CTR by default). Stored and transmitted content is always
//!   `nonce || ciphertext`.
//! - `paths`: deterministic mapping of logical keys to sharded paths.
//! - `store`: the content-addressable local store built on both.

pub mod crypto;
pub mod paths;
pub mod store;

pub use crypto::{DefaultEncrypter, Encrypter, StreamEncrypter, XChaChaEncrypter, generate_key};
pub use paths::{PathKey, PathTransform, hashed_path_transform, plain_path_transform};
pub use store::{Store, StoreError, StoreOpts, StoreResult};
