//! Minimal filesystem seam used by the durable stores.
//!
//! Only the primitives the stores need are exposed, which keeps fault
//! injection in tests small. `rename` must be atomic within a directory.

use std::fs;
use std::io::{self, Write};
use std::path::Path;

pub trait Filesystem {
    fn read(&self, path: &Path) -> io::Result<Vec<u8>>;
    /// Create or truncate `path`, write `contents`, and flush them to stable storage.
    fn write_synced(&self, path: &Path, contents: &[u8]) -> io::Result<()>;
    fn rename(&self, from: &Path, to: &Path) -> io::Result<()>;
    fn create_dir_all(&self, path: &Path) -> io::Result<()>;
}

/// The real filesystem.
#[derive(Debug, Clone, Copy, Default)]
pub struct OsFilesystem;

impl Filesystem for OsFilesystem {
    fn read(&self, path: &Path) -> io::Result<Vec<u8>> {
        fs::read(path)
    }

    fn write_synced(&self, path: &Path, contents: &[u8]) -> io::Result<()> {
        let mut file = fs::File::create(path)?;
        file.write_all(contents)?;
        file.sync_all()
    }

    fn rename(&self, from: &Path, to: &Path) -> io::Result<()> {
        fs::rename(from, to)
    }

    fn create_dir_all(&self, path: &Path) -> io::Result<()> {
        fs::create_dir_all(path)
    }
}
