//! Idle file generation and storage.
//!
//! Idle file `i` is stored as `files/<i>.idle` in the idle directory: its
//! labels concatenated in order. Files are written to a temporary name and
//! renamed so a crash never leaves a truncated file under a real index.

use std::fs;
use std::path::{Path, PathBuf};

use tracing::debug;

use crate::hash::{Digest, derive_label, label_seed};
use crate::merkle::MerkleTree;
use crate::{PoisError, Result};

const FILES_DIR: &str = "files";
const IDLE_EXT: &str = "idle";

/// Labels of idle file `index`, each derived from its predecessor and its halving ancestor.
pub fn compute_labels(seed: &[u8; 32], index: i64, chunk_size: usize, chunks: usize) -> Vec<Vec<u8>> {
    let mut labels: Vec<Vec<u8>> = Vec::with_capacity(chunks);
    for c in 0..chunks {
        let label = if c == 0 {
            derive_label(seed, index, c, None, None, chunk_size)
        } else {
            derive_label(
                seed,
                index,
                c,
                Some(&labels[c - 1]),
                Some(&labels[c / 2]),
                chunk_size,
            )
        };
        labels.push(label);
    }
    labels
}

/// Directory of generated idle files.
#[derive(Debug, Clone)]
pub struct IdleStore {
    files: PathBuf,
    seed: [u8; 32],
    chunk_size: usize,
    chunks: usize,
}

impl IdleStore {
    pub fn open(dir: &Path, miner_id: &[u8], chunk_size: usize, chunks: usize) -> Result<Self> {
        if chunk_size == 0 || chunks == 0 {
            return Err(PoisError::InvalidParams(format!(
                "chunk_size {chunk_size} and chunks {chunks} must be non-zero"
            )));
        }
        let files = dir.join(FILES_DIR);
        fs::create_dir_all(&files)?;
        Ok(Self {
            files,
            seed: label_seed(miner_id),
            chunk_size,
            chunks,
        })
    }

    pub fn seed(&self) -> &[u8; 32] {
        &self.seed
    }

    pub fn chunks(&self) -> usize {
        self.chunks
    }

    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    fn path(&self, index: i64) -> PathBuf {
        self.files.join(format!("{index}.{IDLE_EXT}"))
    }

    /// Generate and store idle file `index`, returning its Merkle root.
    pub fn generate(&self, index: i64) -> Result<Digest> {
        let labels = compute_labels(&self.seed, index, self.chunk_size, self.chunks);
        let root = MerkleTree::from_labels(&labels)?.root();

        let tmp = self.files.join(format!("{index}.{IDLE_EXT}.tmp"));
        fs::write(&tmp, labels.concat())?;
        fs::rename(&tmp, self.path(index))?;

        debug!(index, root = %hex::encode(root), "Idle file generated");
        Ok(root)
    }

    /// Read the labels of idle file `index`.
    pub fn labels(&self, index: i64) -> Result<Vec<Vec<u8>>> {
        let bytes = fs::read(self.path(index))?;
        if bytes.len() != self.chunk_size * self.chunks {
            return Err(PoisError::CorruptIdleFile { index });
        }
        Ok(bytes.chunks(self.chunk_size).map(<[u8]>::to_vec).collect())
    }

    /// Labels and Merkle tree of idle file `index`, checked against `root`.
    pub fn open_file(&self, index: i64, root: &[u8]) -> Result<(Vec<Vec<u8>>, MerkleTree)> {
        let labels = self.labels(index)?;
        let tree = MerkleTree::from_labels(&labels)?;
        if tree.root().as_slice() != root {
            return Err(PoisError::CorruptIdleFile { index });
        }
        Ok((labels, tree))
    }

    /// Remove idle file `index`; missing files are not an error.
    pub fn remove(&self, index: i64) -> Result<bool> {
        match fs::remove_file(self.path(index)) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    /// Indices of idle files present on disk, ascending.
    pub fn indices(&self) -> Result<Vec<i64>> {
        let mut out = Vec::new();
        for entry in fs::read_dir(&self.files)? {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some(IDLE_EXT) {
                continue;
            }
            if let Some(index) = path
                .file_stem()
                .and_then(|s| s.to_str())
                .and_then(|s| s.parse::<i64>().ok())
            {
                out.push(index);
            }
        }
        out.sort_unstable();
        Ok(out)
    }
}
