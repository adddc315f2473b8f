use std::fs::{self, OpenOptions};
use std::io::BufWriter;
use std::path::{Path, PathBuf};
use tracing::debug;

use crate::error::Result;
use crate::types::BboxTable;

/// Writes per-page markup and bbox tables under `pages/` and `bboxes/`.
#[derive(Debug, Clone)]
pub struct SnapshotWriter {
    pages_dir: PathBuf,
    bboxes_dir: PathBuf,
}

/// File name of the markup saved for `page_index`; also the value replay
/// events use to refer to that page.
pub fn page_file_name(page_index: u64) -> String {
    format!("page-{page_index}-0.html")
}

pub fn bboxes_file_name(page_index: u64) -> String {
    format!("bboxes-{page_index}.json")
}

impl SnapshotWriter {
    pub fn new(pages_dir: impl Into<PathBuf>, bboxes_dir: impl Into<PathBuf>) -> Self {
        Self {
            pages_dir: pages_dir.into(),
            bboxes_dir: bboxes_dir.into(),
        }
    }

    /// Creates both directories and removes snapshots left by an earlier
    /// session.
    pub fn reset(&self) -> Result<()> {
        for dir in [&self.pages_dir, &self.bboxes_dir] {
            fs::create_dir_all(dir)?;
            for entry in fs::read_dir(dir)? {
                let path = entry?.path();
                if path.is_file() {
                    fs::remove_file(&path)?;
                }
            }
        }
        Ok(())
    }

    pub fn save(&self, page_index: u64, markup: &str, bboxes: &BboxTable) -> Result<()> {
        let html_path = self.page_path(page_index);
        fs::write(&html_path, markup)?;

        let file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(self.bboxes_path(page_index))?;
        serde_json::to_writer(BufWriter::new(file), bboxes)?;

        debug!(page_index, elements = bboxes.len(), "snapshot saved");
        Ok(())
    }

    pub fn page_path(&self, page_index: u64) -> PathBuf {
        self.pages_dir.join(page_file_name(page_index))
    }

    pub fn bboxes_path(&self, page_index: u64) -> PathBuf {
        self.bboxes_dir.join(bboxes_file_name(page_index))
    }

    /// A snapshot is complete only when both halves exist.
    pub fn is_complete(&self, page_index: u64) -> bool {
        exists(&self.page_path(page_index)) && exists(&self.bboxes_path(page_index))
    }
}

fn exists(path: &Path) -> bool {
    path.is_file()
}
