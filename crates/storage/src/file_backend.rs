//! File-based storage backend: one JSON document per key path.
//!
//! `["message", "ses_1", "msg_1"]` lives at `<root>/message/ses_1/msg_1.json`.
//! Writes go to a temporary sibling first and are renamed into place, so a
//! reader sees either the previous document or the new one.
//!
//! Default location: `~/.corvid/storage`

use async_trait::async_trait;
use corvid_core::error::StorageError;
use corvid_core::storage::Storage;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

pub struct FileStorage {
    root: PathBuf,
}

impl FileStorage {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        debug!(root = %root.display(), "File storage opened");
        Self { root }
    }

    /// Default path: `~/.corvid/storage`
    pub fn default_path() -> PathBuf {
        let home = std::env::var("HOME")
            .or_else(|_| std::env::var("USERPROFILE"))
            .unwrap_or_else(|_| ".".to_string());
        PathBuf::from(home).join(".corvid").join("storage")
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path_for(&self, key: &[&str]) -> Result<PathBuf, StorageError> {
        let mut path = self.root.clone();
        for segment in key {
            if segment.is_empty() || segment.contains(['/', '\\']) || *segment == ".." || *segment == "." {
                return Err(StorageError::Io {
                    key: key.join("/"),
                    reason: format!("invalid key segment '{segment}'"),
                });
            }
            path.push(segment);
        }
        path.set_extension("json");
        Ok(path)
    }
}

fn io_err(key: &[&str], e: std::io::Error) -> StorageError {
    StorageError::Io {
        key: key.join("/"),
        reason: e.to_string(),
    }
}

#[async_trait]
impl Storage for FileStorage {
    fn name(&self) -> &str {
        "file"
    }

    async fn read(&self, key: &[&str]) -> Result<serde_json::Value, StorageError> {
        let path = self.path_for(key)?;
        let content = match tokio::fs::read_to_string(&path).await {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(StorageError::NotFound(key.join("/")));
            }
            Err(e) => return Err(io_err(key, e)),
        };
        serde_json::from_str(&content).map_err(|e| StorageError::Corrupt {
            key: key.join("/"),
            reason: e.to_string(),
        })
    }

    async fn write(&self, key: &[&str], value: serde_json::Value) -> Result<(), StorageError> {
        let path = self.path_for(key)?;
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await.map_err(|e| io_err(key, e))?;
        }
        let body = serde_json::to_vec_pretty(&value).map_err(|e| StorageError::Corrupt {
            key: key.join("/"),
            reason: e.to_string(),
        })?;
        let tmp = path.with_extension(format!("json.{}.tmp", uuid::Uuid::new_v4().simple()));
        tokio::fs::write(&tmp, body).await.map_err(|e| io_err(key, e))?;
        if let Err(e) = tokio::fs::rename(&tmp, &path).await {
            let _ = tokio::fs::remove_file(&tmp).await;
            return Err(io_err(key, e));
        }
        Ok(())
    }

    async fn remove(&self, key: &[&str]) -> Result<(), StorageError> {
        let path = self.path_for(key)?;
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(io_err(key, e)),
        }
    }

    async fn list(&self, prefix: &[&str]) -> Result<Vec<Vec<String>>, StorageError> {
        let mut dir = self.root.clone();
        for segment in prefix {
            dir.push(segment);
        }
        let base: Vec<String> = prefix.iter().map(|s| s.to_string()).collect();
        let mut out = Vec::new();
        let mut stack = vec![(dir, base)];

        while let Some((dir, key)) = stack.pop() {
            let mut entries = match tokio::fs::read_dir(&dir).await {
                Ok(entries) => entries,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
                Err(e) => return Err(io_err(prefix, e)),
            };
            while let Some(entry) = entries.next_entry().await.map_err(|e| io_err(prefix, e))? {
                let name = entry.file_name().to_string_lossy().to_string();
                let file_type = entry.file_type().await.map_err(|e| io_err(prefix, e))?;
                if file_type.is_dir() {
                    let mut child = key.clone();
                    child.push(name);
                    stack.push((entry.path(), child));
                } else if let Some(stem) = name.strip_suffix(".json") {
                    let mut child = key.clone();
                    child.push(stem.to_string());
                    out.push(child);
                } else if !name.ends_with(".tmp") {
                    warn!(file = %entry.path().display(), "Ignoring unexpected file in storage");
                }
            }
        }

        out.sort();
        Ok(out)
    }
}
