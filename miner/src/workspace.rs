//! On-disk layout of the miner's data directory.
//!
//! ```text
//! <root>/
//!   keypair.bin
//!   records/            proof record store (sled)
//!   idle/               idle files and accumulator status
//!   files/<fid>/<fragment>       stored fragments
//!   files/<fid>/<fragment>.tag   cached PoDR2 tags
//! ```

use std::io;
use std::path::{Path, PathBuf};

use podr2::TagFile;

const RECORDS_DIR: &str = "records";
const IDLE_DIR: &str = "idle";
const FILES_DIR: &str = "files";

#[derive(Debug, Clone)]
pub struct Workspace {
    root: PathBuf,
}

impl Workspace {
    /// Create the directory tree under `root` if missing.
    pub fn create(root: &Path) -> io::Result<Self> {
        for dir in [IDLE_DIR, FILES_DIR] {
            std::fs::create_dir_all(root.join(dir))?;
        }
        Ok(Self {
            root: root.to_path_buf(),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn record_db(&self) -> PathBuf {
        self.root.join(RECORDS_DIR)
    }

    pub fn idle_dir(&self) -> PathBuf {
        self.root.join(IDLE_DIR)
    }

    pub fn file_dir(&self, fid: &str) -> PathBuf {
        self.root.join(FILES_DIR).join(fid)
    }

    pub fn fragment_path(&self, fid: &str, fragment: &str) -> PathBuf {
        self.file_dir(fid).join(fragment)
    }

    pub fn tag_path(&self, fid: &str, fragment: &str) -> PathBuf {
        TagFile::path_for(&self.fragment_path(fid, fragment))
    }

    /// Ids of the files held locally, sorted.
    pub fn list_files(&self) -> io::Result<Vec<String>> {
        let mut fids = Vec::new();
        for entry in std::fs::read_dir(self.root.join(FILES_DIR))? {
            let entry = entry?;
            if entry.file_type()?.is_dir()
                && let Some(name) = entry.file_name().to_str()
            {
                fids.push(name.to_string());
            }
        }
        fids.sort();
        Ok(fids)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_layout() {
        let dir = TempDir::new().unwrap();
        let ws = Workspace::create(dir.path()).unwrap();
        assert!(ws.idle_dir().is_dir());
        assert_eq!(
            ws.tag_path("fid1", "frag1"),
            dir.path().join("files").join("fid1").join("frag1.tag")
        );
    }

    #[test]
    fn test_list_files_skips_plain_files() {
        let dir = TempDir::new().unwrap();
        let ws = Workspace::create(dir.path()).unwrap();
        std::fs::create_dir_all(ws.file_dir("b")).unwrap();
        std::fs::create_dir_all(ws.file_dir("a")).unwrap();
        std::fs::write(dir.path().join("files").join("stray"), b"x").unwrap();
        assert_eq!(ws.list_files().unwrap(), vec!["a".to_string(), "b".to_string()]);
    }
}
