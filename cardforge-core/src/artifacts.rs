//! On-disk store for generated art and finished composites.
//!
//! `<root>/<seq:06>/art.png`, `composite.png`, `composite.json`

use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;

use crate::composite::CompositeArtifact;
use crate::hashing::sha256_hex;
use crate::model::Seq;

#[derive(Debug, Error)]
pub enum ArtifactError {
    #[error("I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Artifact {path} does not match recorded hash")]
    HashMismatch { path: PathBuf },

    #[error("Serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}

#[derive(Debug, Clone)]
pub struct ArtifactStore {
    root: PathBuf,
}

impl ArtifactStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn item_dir(&self, seq: Seq) -> PathBuf {
        self.root.join(format!("{:06}", seq))
    }

    pub fn art_path(&self, seq: Seq) -> PathBuf {
        self.item_dir(seq).join("art.png")
    }

    pub fn composite_path(&self, seq: Seq) -> PathBuf {
        self.item_dir(seq).join("composite.png")
    }

    pub fn manifest_path(&self, seq: Seq) -> PathBuf {
        self.item_dir(seq).join("composite.json")
    }

    /// Store art and return its hash.
    pub fn write_art(&self, seq: Seq, bytes: &[u8]) -> Result<String, ArtifactError> {
        self.write_atomic(&self.art_path(seq), bytes)?;
        Ok(sha256_hex(bytes))
    }

    /// Read art, checking it against the hash recorded in the ledger.
    pub fn read_art(&self, seq: Seq, expected_hash: &str) -> Result<Vec<u8>, ArtifactError> {
        read_verified(&self.art_path(seq), expected_hash)
    }

    pub fn write_composite(&self, seq: Seq, composite: &CompositeArtifact) -> Result<(), ArtifactError> {
        self.write_atomic(&self.composite_path(seq), &composite.raster)?;
        let manifest = serde_json::to_vec_pretty(&composite.manifest)?;
        self.write_atomic(&self.manifest_path(seq), &manifest)
    }

    pub fn read_composite(&self, seq: Seq, expected_hash: &str) -> Result<Vec<u8>, ArtifactError> {
        read_verified(&self.composite_path(seq), expected_hash)
    }

    fn write_atomic(&self, path: &Path, bytes: &[u8]) -> Result<(), ArtifactError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(io_err(parent))?;
        }
        let mut tmp = path.as_os_str().to_owned();
        tmp.push(".tmp");
        let tmp = PathBuf::from(tmp);
        fs::write(&tmp, bytes).map_err(io_err(&tmp))?;
        fs::rename(&tmp, path).map_err(io_err(path))?;
        Ok(())
    }
}

fn io_err(path: &Path) -> impl FnOnce(std::io::Error) -> ArtifactError + '_ {
    move |source| ArtifactError::Io {
        path: path.to_path_buf(),
        source,
    }
}

fn read_verified(path: &Path, expected_hash: &str) -> Result<Vec<u8>, ArtifactError> {
    let bytes = fs::read(path).map_err(io_err(path))?;
    if sha256_hex(&bytes) != expected_hash {
        return Err(ArtifactError::HashMismatch {
            path: path.to_path_buf(),
        });
    }
    Ok(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_art_round_trip_verifies_hash() {
        let dir = tempfile::tempdir().unwrap();
        let store = ArtifactStore::new(dir.path());
        let hash = store.write_art(7, b"pixels").unwrap();
        assert_eq!(store.read_art(7, &hash).unwrap(), b"pixels");
        assert!(store.art_path(7).ends_with("000007/art.png"));
    }

    #[test]
    fn test_tampered_art_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let store = ArtifactStore::new(dir.path());
        let hash = store.write_art(1, b"pixels").unwrap();
        fs::write(store.art_path(1), b"other").unwrap();
        assert!(matches!(
            store.read_art(1, &hash),
            Err(ArtifactError::HashMismatch { .. })
        ));
    }
}
