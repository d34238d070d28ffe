//! A directory-backed blob store with atomic per-blob writes.
//!
//! One file per page plus a small set of named artifacts. Every write lands
//! in a temporary file, is synced, and is renamed over the target, so a blob
//! is either the old image or the new one. Torn writes across *different*
//! blobs remain possible; closing that gap is the double-write buffer's job.

use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use crate::PageId;

/// Artifact holding the serialized B+Tree index.
pub const INDEX_ARTIFACT: &str = "index";
/// Artifact holding the redo log record sequence.
pub const REDO_LOG_ARTIFACT: &str = "redo_log";
/// Artifact holding the staged double-write batch.
pub const DWB_ARTIFACT: &str = "dwb";

const PAGE_PREFIX: &str = "page-";

#[derive(Debug)]
pub struct DiskStore {
    root: PathBuf,
}

impl DiskStore {
    pub fn open(root: impl AsRef<Path>) -> io::Result<Self> {
        let root = root.as_ref().to_path_buf();
        fs::create_dir_all(&root)?;
        Ok(Self { root })
    }

    pub fn read_page(&self, page_id: PageId) -> io::Result<Option<Vec<u8>>> {
        self.read_blob(&page_file_name(page_id))
    }

    pub fn write_page(&self, page_id: PageId, bytes: &[u8]) -> io::Result<()> {
        self.write_blob(&page_file_name(page_id), bytes)
    }

    pub fn read_artifact(&self, name: &str) -> io::Result<Option<Vec<u8>>> {
        self.read_blob(name)
    }

    pub fn write_artifact(&self, name: &str, bytes: &[u8]) -> io::Result<()> {
        self.write_blob(name, bytes)
    }

    /// Durability barrier: on return, all prior writes survive process loss.
    pub fn flush(&self) -> io::Result<()> {
        File::open(&self.root)?.sync_all()
    }

    /// All page ids present in the store, ascending.
    pub fn enumerate(&self) -> io::Result<Vec<PageId>> {
        let mut page_ids = Vec::new();
        for entry in fs::read_dir(&self.root)? {
            let entry = entry?;
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            if let Some(id) = name.strip_prefix(PAGE_PREFIX) {
                if let Ok(id) = id.parse::<PageId>() {
                    page_ids.push(id);
                }
            }
        }
        page_ids.sort_unstable();
        Ok(page_ids)
    }

    fn read_blob(&self, file_name: &str) -> io::Result<Option<Vec<u8>>> {
        match fs::read(self.root.join(file_name)) {
            Ok(bytes) => Ok(Some(bytes)),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err),
        }
    }

    fn write_blob(&self, file_name: &str, bytes: &[u8]) -> io::Result<()> {
        let target = self.root.join(file_name);
        let tmp = self.root.join(format!("{file_name}.tmp"));
        let mut file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&tmp)?;
        file.write_all(bytes)?;
        file.sync_all()?;
        fs::rename(&tmp, &target)
    }
}

fn page_file_name(page_id: PageId) -> String {
    format!("{PAGE_PREFIX}{page_id}")
}
