//! Tags and the tag files cached next to fragments.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tempfile::NamedTempFile;

use crate::Result;

const TAG_EXT: &str = "tag";

/// Tag body: fragment name, random base `u` and per-block authenticators, all decimal.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct T {
    pub name: String,
    pub u: String,
    pub phi: Vec<String>,
}

/// A fragment tag with the TEE's attestation.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tag {
    pub t: T,
    /// Hex SHA-256 over the phi values
    pub phi_hash: String,
    /// Hex RSA signature over the tag
    pub attest: String,
}

impl Tag {
    /// Hash over the phi values, in order.
    pub fn compute_phi_hash(phi: &[String]) -> String {
        let mut hasher = Sha256::new();
        for value in phi {
            hasher.update(value.as_bytes());
        }
        hex::encode(hasher.finalize())
    }

    /// Whether `phi_hash` matches the phi values carried.
    pub fn phi_hash_matches(&self) -> bool {
        Self::compute_phi_hash(&self.t.phi) == self.phi_hash
    }
}

/// Tag file stored as `<fragment>.tag`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TagFile {
    pub tag: Tag,
    pub u_sig: Vec<u8>,
    pub signature: Vec<u8>,
    pub fragment_name: String,
    pub tee_account_id: Vec<u8>,
    /// Fragment position within its segment
    pub index: u16,
}

impl TagFile {
    /// Tag file path of a fragment.
    pub fn path_for(fragment: &Path) -> PathBuf {
        let mut name = fragment.as_os_str().to_owned();
        name.push(".");
        name.push(TAG_EXT);
        PathBuf::from(name)
    }

    /// Load a tag file; unreadable or undecodable files are errors.
    pub fn load(path: &Path) -> Result<Self> {
        let bytes = fs::read(path)?;
        Ok(serde_json::from_slice(&bytes)?)
    }

    /// Atomically replace the tag file. Each save writes its own temporary
    /// file in the target directory, so concurrent saves never interleave.
    pub fn save(&self, path: &Path) -> Result<()> {
        let bytes = serde_json::to_vec(self)?;
        let dir = path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or(Path::new("."));
        let mut tmp = NamedTempFile::new_in(dir)?;
        tmp.write_all(&bytes)?;
        tmp.persist(path).map_err(|e| e.error)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Podr2Error;

    fn sample() -> TagFile {
        let phi = vec!["11".to_string(), "22".to_string()];
        TagFile {
            tag: Tag {
                phi_hash: Tag::compute_phi_hash(&phi),
                t: T {
                    name: "frag".to_string(),
                    u: "5".to_string(),
                    phi,
                },
                attest: "00".to_string(),
            },
            u_sig: vec![1, 2],
            signature: vec![3; 64],
            fragment_name: "frag".to_string(),
            tee_account_id: vec![9; 32],
            index: 2,
        }
    }

    #[test]
    fn test_path_for_appends_extension() {
        assert_eq!(
            TagFile::path_for(Path::new("/data/file/abc")),
            PathBuf::from("/data/file/abc.tag")
        );
    }

    #[test]
    fn test_save_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = TagFile::path_for(&dir.path().join("frag"));
        let file = sample();
        file.save(&path).unwrap();
        assert_eq!(TagFile::load(&path).unwrap(), file);
    }

    #[test]
    fn test_concurrent_saves_leave_one_whole_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = TagFile::path_for(&dir.path().join("frag"));

        std::thread::scope(|scope| {
            for index in 0..8u16 {
                let path = &path;
                scope.spawn(move || {
                    let mut file = sample();
                    file.index = index;
                    file.save(path).unwrap();
                });
            }
        });

        let saved = TagFile::load(&path).unwrap();
        assert!(saved.index < 8);
        assert_eq!(saved, TagFile { index: saved.index, ..sample() });
        let leftovers = fs::read_dir(dir.path()).unwrap().count();
        assert_eq!(leftovers, 1);
    }

    #[test]
    fn test_corrupt_file_is_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("frag.tag");
        fs::write(&path, b"{\"tag\": ").unwrap();
        assert!(matches!(TagFile::load(&path), Err(Podr2Error::Json(_))));
        assert!(matches!(
            TagFile::load(&dir.path().join("missing.tag")),
            Err(Podr2Error::Io(_))
        ));
    }

    #[test]
    fn test_phi_hash_matches() {
        let mut file = sample();
        assert!(file.tag.phi_hash_matches());
        file.tag.t.phi[0] = "12".to_string();
        assert!(!file.tag.phi_hash_matches());
    }
}
