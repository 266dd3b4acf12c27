//! Image pool shared by all jobs.
//!
//! Entries are proxies: admission checks only the shape of the path, and the
//! pixels are read lazily by the export pipeline. A file that disappears or
//! cannot be decoded therefore shows up as a failed export record rather than
//! an admission error.

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, warn};
use uuid::Uuid;

/// A pool image.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ImagePoolEntry {
    pub image_id: String,
    /// Absolute source path.
    pub source_path: PathBuf,
    pub added_at: DateTime<Utc>,
}

/// A path that was not admitted.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PoolFailure {
    pub path: PathBuf,
    pub reason: String,
}

/// Result of [`ImagePool::add`].
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PoolAddReport {
    /// Ids of newly added entries, in input order.
    pub added: Vec<String>,
    /// Ids of entries that already existed for a given path.
    pub duplicates: Vec<String>,
    pub failures: Vec<PoolFailure>,
}

impl PoolAddReport {
    pub fn count_added(&self) -> usize {
        self.added.len()
    }

    /// Every id the input resolved to, new or existing.
    pub fn image_ids(&self) -> impl Iterator<Item = &String> {
        self.added.iter().chain(self.duplicates.iter())
    }
}

#[derive(Default)]
struct PoolState {
    entries: HashMap<String, Arc<ImagePoolEntry>>,
    by_path: HashMap<PathBuf, String>,
}

/// Deduplicating registry of source images.
#[derive(Default)]
pub struct ImagePool {
    state: RwLock<PoolState>,
}

impl ImagePool {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds paths, deduplicating by absolute path. Never fails as a whole.
    pub fn add<I, P>(&self, paths: I) -> PoolAddReport
    where
        I: IntoIterator<Item = P>,
        P: AsRef<Path>,
    {
        let mut report = PoolAddReport::default();
        let mut state = self.state.write();

        for path in paths {
            let path = path.as_ref();
            let absolute = match validate(path) {
                Ok(absolute) => absolute,
                Err(reason) => {
                    warn!(path = %path.display(), reason = %reason, "Image rejected by pool");
                    report.failures.push(PoolFailure {
                        path: path.to_path_buf(),
                        reason,
                    });
                    continue;
                }
            };

            if let Some(existing) = state.by_path.get(&absolute) {
                report.duplicates.push(existing.clone());
                continue;
            }

            let image_id = Uuid::new_v4().to_string();
            let entry = Arc::new(ImagePoolEntry {
                image_id: image_id.clone(),
                source_path: absolute.clone(),
                added_at: Utc::now(),
            });
            state.by_path.insert(absolute, image_id.clone());
            state.entries.insert(image_id.clone(), entry);
            report.added.push(image_id);
        }

        debug!(
            added = report.added.len(),
            duplicates = report.duplicates.len(),
            failures = report.failures.len(),
            pool_size = state.entries.len(),
            "Images added to pool"
        );
        report
    }

    pub fn get(&self, image_id: &str) -> Option<Arc<ImagePoolEntry>> {
        self.state.read().entries.get(image_id).cloned()
    }

    pub fn contains(&self, image_id: &str) -> bool {
        self.state.read().entries.contains_key(image_id)
    }

    /// Removes an entry. Returns false if it was not present.
    pub fn remove(&self, image_id: &str) -> bool {
        let mut state = self.state.write();
        match state.entries.remove(image_id) {
            Some(entry) => {
                state.by_path.remove(&entry.source_path);
                true
            }
            None => false,
        }
    }

    pub fn len(&self) -> usize {
        self.state.read().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl std::fmt::Debug for ImagePool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ImagePool").field("entries", &self.len()).finish()
    }
}

fn validate(path: &Path) -> Result<PathBuf, String> {
    if path.as_os_str().is_empty() {
        return Err("empty path".to_string());
    }
    if path.file_stem().is_none() {
        return Err("path has no file name".to_string());
    }
    if path.is_dir() {
        return Err("path is a directory".to_string());
    }
    std::path::absolute(path).map_err(|e| e.to_string())
}
