//! Mapping of logical keys to sharded filesystem paths.

use std::path::PathBuf;

/// Number of hex characters per directory segment of a hashed path.
pub const PATH_BLOCK_SIZE: usize = 5;

/// A deterministic location for a logical key below a store root.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PathKey {
    /// Directory part, segments joined with `/`.
    pub path_name: String,
    pub file_name: String,
}

impl PathKey {
    /// The first directory segment; deleting it removes the key.
    pub fn root_path(&self) -> &str {
        self.path_name
            .split('/')
            .next()
            .unwrap_or(self.path_name.as_str())
    }

    pub fn segments(&self) -> impl Iterator<Item = &str> {
        self.path_name.split('/').filter(|s| !s.is_empty())
    }

    /// Directory segments followed by the file name.
    pub fn full_path(&self) -> PathBuf {
        let mut path: PathBuf = self.segments().collect();
        path.push(&self.file_name);
        path
    }
}

/// Maps a logical key to its [`PathKey`].
pub type PathTransform = fn(&str) -> PathKey;

/// Hashes the key with BLAKE3 and splits the hex digest into
/// [`PATH_BLOCK_SIZE`] character directories; the full digest is the file name.
pub fn hashed_path_transform(key: &str) -> PathKey {
    let digest = blake3::hash(key.as_bytes()).to_hex();
    let hex = digest.as_str();

    let segments: Vec<&str> = (0..hex.len() / PATH_BLOCK_SIZE)
        .map(|i| &hex[i * PATH_BLOCK_SIZE..(i + 1) * PATH_BLOCK_SIZE])
        .collect();

    PathKey {
        path_name: segments.join("/"),
        file_name: hex.to_owned(),
    }
}

/// Uses the key itself as directory and file name.
pub fn plain_path_transform(key: &str) -> PathKey {
    PathKey {
        path_name: key.to_owned(),
        file_name: key.to_owned(),
    }
}
