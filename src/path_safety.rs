//! Path validation for agent-produced file references and client uploads.
//!
//! Agent `::file::` signals name paths relative to the session's working
//! directory, and uploaded media is written under a per-session directory.
//! Both must stay inside their root: `..` traversal and symlink escapes are
//! rejected.

use std::path::{Component, Path, PathBuf};

use crate::{AppError, Result};

/// Validate that `candidate` resides within `root`.
///
/// Returns the resolved absolute path on success.
///
/// # Errors
///
/// Returns `AppError::PathViolation` if the root cannot be canonicalized,
/// the candidate is absolute, `..` segments climb above the root, or an
/// existing path resolves (through symlinks) outside the root.
pub fn validate_path(root: &Path, candidate: impl AsRef<Path>) -> Result<PathBuf> {
    let root = root
        .canonicalize()
        .map_err(|err| AppError::PathViolation(format!("root directory invalid: {err}")))?;

    let mut normalized = PathBuf::new();
    for component in candidate.as_ref().components() {
        match component {
            Component::ParentDir => {
                if !normalized.pop() {
                    return Err(AppError::PathViolation(
                        "path attempts to escape root directory".into(),
                    ));
                }
            }
            Component::CurDir => {}
            Component::RootDir | Component::Prefix(_) => {
                return Err(AppError::PathViolation(
                    "absolute paths are not allowed".into(),
                ));
            }
            Component::Normal(part) => normalized.push(part),
        }
    }

    if normalized.as_os_str().is_empty() {
        return Err(AppError::PathViolation("path is empty".into()));
    }

    let absolute = root.join(normalized);
    if absolute.exists() {
        let canonical = absolute
            .canonicalize()
            .map_err(|err| AppError::PathViolation(format!("cannot resolve path: {err}")))?;
        if !canonical.starts_with(&root) {
            return Err(AppError::PathViolation(
                "symlink target escapes root directory".into(),
            ));
        }
        Ok(canonical)
    } else {
        Ok(absolute)
    }
}

/// Reduce a client-supplied file name to a safe single path segment.
///
/// Directory parts are dropped and anything outside `[A-Za-z0-9._-]` becomes
/// `_`. Names that end up empty or all dots fall back to `upload.bin`.
#[must_use]
pub fn sanitize_file_name(name: &str) -> String {
    let base = name
        .rsplit(['/', '\\'])
        .next()
        .unwrap_or_default()
        .trim();
    let cleaned: String = base
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-') {
                c
            } else {
                '_'
            }
        })
        .take(128)
        .collect();
    if cleaned.chars().all(|c| c == '.') {
        "upload.bin".to_owned()
    } else {
        cleaned
    }
}
