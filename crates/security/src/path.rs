//! Path validation for file-touching tools.
//!
//! Relative paths resolve against the session's working directory. The
//! resolved path must not climb out with `..`, must not fall under a
//! forbidden prefix, and must sit under one of the allowed roots when any
//! are configured.

use std::path::{Path, PathBuf};

/// Error returned when path validation fails.
#[derive(Debug, thiserror::Error)]
pub enum PathValidationError {
    #[error("Path '{path}' is outside allowed roots")]
    OutsideAllowedRoots { path: String },

    #[error("Path '{path}' matches forbidden pattern '{pattern}'")]
    ForbiddenPath { path: String, pattern: String },

    #[error("Path traversal detected in '{path}'")]
    PathTraversal { path: String },

    #[error("Failed to canonicalize path '{path}': {reason}")]
    CanonicalizeFailed { path: String, reason: String },
}

/// The file-access rules one workspace runs under.
#[derive(Debug, Clone, Default)]
pub struct PathPolicy {
    pub allowed_roots: Vec<String>,
    pub forbidden_paths: Vec<String>,
}

impl PathPolicy {
    pub fn new(allowed_roots: Vec<String>, forbidden_paths: Vec<String>) -> Self {
        Self {
            allowed_roots,
            forbidden_paths,
        }
    }

    /// Resolve `raw` against `cwd` and validate the result.
    pub fn resolve(&self, cwd: &Path, raw: &str) -> Result<PathBuf, PathValidationError> {
        let candidate = Path::new(raw);
        let joined = if candidate.is_absolute() {
            candidate.to_path_buf()
        } else {
            cwd.join(candidate)
        };
        validate_path(
            &joined.to_string_lossy(),
            &self.allowed_roots,
            &self.forbidden_paths,
        )
    }
}

/// Validate that a path is safe to access and return its canonical form.
///
/// Files that do not exist yet are resolved through their parent directory.
pub fn validate_path(
    path: &str,
    allowed_roots: &[String],
    forbidden_paths: &[String],
) -> Result<PathBuf, PathValidationError> {
    let slashed = path.replace('\\', "/");
    if slashed.split('/').any(|segment| segment == "..") {
        return Err(PathValidationError::PathTraversal { path: path.into() });
    }

    let resolved = canonical(Path::new(path)).map_err(|reason| PathValidationError::CanonicalizeFailed {
        path: path.into(),
        reason,
    })?;
    let key = comparable(&resolved.to_string_lossy());

    if let Some(pattern) = forbidden_paths
        .iter()
        .find(|pattern| key.starts_with(&comparable(&expand_tilde(pattern))))
    {
        return Err(PathValidationError::ForbiddenPath {
            path: path.into(),
            pattern: pattern.clone(),
        });
    }

    let inside = allowed_roots.is_empty()
        || allowed_roots
            .iter()
            .any(|root| key.starts_with(&comparable(&expand_tilde(root))));
    if !inside {
        return Err(PathValidationError::OutsideAllowedRoots { path: path.into() });
    }

    Ok(resolved)
}

fn canonical(path: &Path) -> Result<PathBuf, String> {
    if path.exists() {
        return path.canonicalize().map_err(|e| e.to_string());
    }
    match (path.parent(), path.file_name()) {
        (Some(parent), Some(name)) if parent.exists() => parent
            .canonicalize()
            .map(|p| p.join(name))
            .map_err(|e| format!("parent: {e}")),
        _ => Ok(path.to_path_buf()),
    }
}

/// Lower-cased, forward-slashed, without the Windows `\\?\` prefix.
fn comparable(path: &str) -> String {
    let lowered = path.replace('\\', "/").to_lowercase();
    lowered
        .strip_prefix("//?/")
        .map(str::to_string)
        .unwrap_or(lowered)
}

fn expand_tilde(path: &str) -> String {
    if (path == "~" || path.starts_with("~/"))
        && let Some(home) = home_dir()
    {
        return path.replacen('~', &home, 1);
    }
    path.to_string()
}

fn home_dir() -> Option<String> {
    #[cfg(target_os = "windows")]
    {
        std::env::var("USERPROFILE").ok()
    }
    #[cfg(not(target_os = "windows"))]
    {
        std::env::var("HOME").ok()
    }
}
