//! File-backed transcript storage
//!
//! Each project's transcript lives at `<base_dir>/<project_id>.json`. Appends
//! are a read-modify-write of the whole document, serialized per project and
//! made visible through a write to a temporary file followed by a rename.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::{Arc, Mutex};

use tokio::sync::Mutex as AsyncMutex;
use tracing::{debug, warn};

use super::{TranscriptDocument, TranscriptError};
use crate::metrics::TRANSCRIPT_APPENDS;

/// What to do when an existing transcript cannot be parsed
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum CorruptPolicy {
    /// Rename the damaged file aside and start a fresh document
    #[default]
    Archive,
    /// Refuse the append with `TranscriptError::Corrupt`
    Fail,
    /// Overwrite the damaged file with a fresh document
    Discard,
}

impl FromStr for CorruptPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "archive" => Ok(Self::Archive),
            "fail" => Ok(Self::Fail),
            "discard" => Ok(Self::Discard),
            other => Err(format!(
                "unknown corrupt policy '{}' (expected archive, fail or discard)",
                other
            )),
        }
    }
}

/// Result of a successful append
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppendOutcome {
    /// Cells added by this append (1 or 2)
    pub cells_appended: usize,
    /// Cells in the document after the append
    pub total_cells: usize,
    /// Where a corrupt predecessor was moved, if one was archived
    pub archived: Option<PathBuf>,
}

/// Per-project transcript storage
pub struct TranscriptStore {
    base_dir: PathBuf,
    policy: CorruptPolicy,
    locks: Mutex<HashMap<String, Arc<AsyncMutex<()>>>>,
}

impl TranscriptStore {
    /// Create a store rooted at `base_dir`, creating the directory if needed
    pub fn new(base_dir: impl Into<PathBuf>, policy: CorruptPolicy) -> Result<Self, TranscriptError> {
        let base_dir = base_dir.into();
        std::fs::create_dir_all(&base_dir).map_err(|source| TranscriptError::Io {
            path: base_dir.clone(),
            source,
        })?;
        Ok(Self {
            base_dir,
            policy,
            locks: Mutex::new(HashMap::new()),
        })
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    pub fn policy(&self) -> CorruptPolicy {
        self.policy
    }

    /// File path of a project's transcript
    pub fn path(&self, project_id: &str) -> Result<PathBuf, TranscriptError> {
        validate_project_id(project_id)?;
        Ok(self.base_dir.join(format!("{}.json", project_id)))
    }

    /// Write an empty document for the project unless one already exists
    pub async fn ensure_exists(&self, project_id: &str) -> Result<PathBuf, TranscriptError> {
        let path = self.path(project_id)?;
        let lock = self.lock_for(project_id);
        let _guard = lock.lock().await;

        let exists = tokio::fs::try_exists(&path)
            .await
            .map_err(|source| TranscriptError::Io {
                path: path.clone(),
                source,
            })?;
        if !exists {
            write_document(&path, &TranscriptDocument::default()).await?;
            debug!(project_id = %project_id, path = %path.display(), "Created transcript");
        }
        Ok(path)
    }

    /// Read a project's transcript; an absent file reads as an empty document
    pub async fn load(&self, project_id: &str) -> Result<TranscriptDocument, TranscriptError> {
        let path = self.path(project_id)?;
        match read_document(&path).await? {
            Some(doc) => Ok(doc),
            None => Ok(TranscriptDocument::default()),
        }
    }

    /// Record one execution: a code cell, then a note cell if there is output or an error
    pub async fn append(
        &self,
        project_id: &str,
        code: &str,
        output: &str,
        error: Option<&str>,
    ) -> Result<AppendOutcome, TranscriptError> {
        let result = self.append_inner(project_id, code, output, error).await;
        let status = match &result {
            Ok(outcome) if outcome.archived.is_some() => "archived",
            Ok(_) => "ok",
            Err(_) => "error",
        };
        TRANSCRIPT_APPENDS.with_label_values(&[status]).inc();
        result
    }

    async fn append_inner(
        &self,
        project_id: &str,
        code: &str,
        output: &str,
        error: Option<&str>,
    ) -> Result<AppendOutcome, TranscriptError> {
        let path = self.path(project_id)?;
        let lock = self.lock_for(project_id);
        let _guard = lock.lock().await;

        let mut archived = None;
        let mut doc = match read_document(&path).await {
            Ok(Some(doc)) => doc,
            Ok(None) => TranscriptDocument::default(),
            Err(TranscriptError::Corrupt { path, source }) => match self.policy {
                CorruptPolicy::Fail => return Err(TranscriptError::Corrupt { path, source }),
                CorruptPolicy::Discard => {
                    warn!(
                        project_id = %project_id,
                        error = %source,
                        "Transcript unreadable, starting a new one"
                    );
                    TranscriptDocument::default()
                }
                CorruptPolicy::Archive => {
                    let target = archive_path(&path);
                    tokio::fs::rename(&path, &target)
                        .await
                        .map_err(|source| TranscriptError::Io {
                            path: path.clone(),
                            source,
                        })?;
                    warn!(
                        project_id = %project_id,
                        error = %source,
                        archived = %target.display(),
                        "Transcript unreadable, archived it and started a new one"
                    );
                    archived = Some(target);
                    TranscriptDocument::default()
                }
            },
            Err(e) => return Err(e),
        };

        let cells_appended = doc.record(code, output, error);
        write_document(&path, &doc).await?;

        debug!(
            project_id = %project_id,
            cells_appended,
            total_cells = doc.cells.len(),
            "Appended to transcript"
        );

        Ok(AppendOutcome {
            cells_appended,
            total_cells: doc.cells.len(),
            archived,
        })
    }

    fn lock_for(&self, project_id: &str) -> Arc<AsyncMutex<()>> {
        let mut locks = self.locks.lock().unwrap_or_else(|e| e.into_inner());
        Arc::clone(locks.entry(project_id.to_string()).or_default())
    }
}

fn validate_project_id(project_id: &str) -> Result<(), TranscriptError> {
    let invalid = project_id.is_empty()
        || project_id == "."
        || project_id.contains("..")
        || project_id.contains(['/', '\\', '\0']);
    if invalid {
        return Err(TranscriptError::InvalidProjectId(project_id.to_string()));
    }
    Ok(())
}

fn archive_path(path: &Path) -> PathBuf {
    let stamp = chrono::Utc::now().format("%Y%m%dT%H%M%S%.3fZ");
    let mut name = path.as_os_str().to_os_string();
    name.push(format!(".corrupt-{}", stamp));
    PathBuf::from(name)
}

async fn read_document(path: &Path) -> Result<Option<TranscriptDocument>, TranscriptError> {
    let bytes = match tokio::fs::read(path).await {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(source) => {
            return Err(TranscriptError::Io {
                path: path.to_path_buf(),
                source,
            })
        }
    };
    serde_json::from_slice(&bytes)
        .map(Some)
        .map_err(|source| TranscriptError::Corrupt {
            path: path.to_path_buf(),
            source,
        })
}

async fn write_document(path: &Path, doc: &TranscriptDocument) -> Result<(), TranscriptError> {
    let json = serde_json::to_vec_pretty(doc)?;
    let mut tmp = path.as_os_str().to_os_string();
    tmp.push(".tmp");
    let tmp = PathBuf::from(tmp);

    tokio::fs::write(&tmp, json)
        .await
        .map_err(|source| TranscriptError::Io {
            path: tmp.clone(),
            source,
        })?;
    tokio::fs::rename(&tmp, path)
        .await
        .map_err(|source| TranscriptError::Io {
            path: path.to_path_buf(),
            source,
        })
}
