//! Client media uploads and the stdin payloads that announce them.

use std::path::{Path, PathBuf};

use base64::Engine as _;
use serde_json::json;
use tracing::debug;

use crate::path_safety::{sanitize_file_name, validate_path};
use crate::{AppError, Result};

/// Largest decoded upload accepted.
pub const MAX_UPLOAD_BYTES: usize = 12 * 1024 * 1024;

/// Decode and store an upload under `<upload_root>/<session_id>/`.
///
/// Returns the absolute path written.
///
/// # Errors
///
/// - `AppError::Protocol` for invalid base64 or an oversized payload.
/// - `AppError::PathViolation` if the sanitized target escapes the root.
/// - `AppError::Io` if the directory or file cannot be written.
pub async fn store_upload(
    upload_root: &Path,
    session_id: &str,
    file_name: &str,
    data_b64: &str,
) -> Result<PathBuf> {
    let data = base64::engine::general_purpose::STANDARD
        .decode(data_b64.trim())
        .map_err(|err| AppError::Protocol(format!("media upload base64 invalid: {err}")))?;
    if data.len() > MAX_UPLOAD_BYTES {
        return Err(AppError::Protocol(format!(
            "media upload exceeds {MAX_UPLOAD_BYTES} bytes"
        )));
    }

    tokio::fs::create_dir_all(upload_root).await?;
    let relative = Path::new(&sanitize_file_name(session_id)).join(sanitize_file_name(file_name));
    let target = validate_path(upload_root, &relative)?;
    if let Some(parent) = target.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    tokio::fs::write(&target, &data).await?;
    debug!(session_id, path = %target.display(), bytes = data.len(), "media upload stored");
    Ok(target)
}

/// Stdin line announcing a stored upload.
#[must_use]
pub fn media_upload_line(
    path: &Path,
    content_type: &str,
    file_name: &str,
    context: Option<&str>,
    correlation_id: Option<&str>,
) -> String {
    json!({
        "type": "media_upload",
        "path": path.display().to_string(),
        "content_type": content_type,
        "file_name": file_name,
        "context": context,
        "correlation_id": correlation_id,
    })
    .to_string()
}

/// Stdin line requesting a script run.
#[must_use]
pub fn script_request_line(
    path: &str,
    script_type: &str,
    context: Option<&str>,
    correlation_id: Option<&str>,
) -> String {
    json!({
        "type": "script_request",
        "path": path,
        "script_type": script_type,
        "context": context,
        "correlation_id": correlation_id,
    })
    .to_string()
}

/// Text as written to stdin, tagged with the request context when present.
#[must_use]
pub fn text_line(text: &str, context: Option<&str>) -> String {
    match context.map(str::trim).filter(|c| !c.is_empty()) {
        Some(ctx) => format!("[{ctx}] {text}"),
        None => text.to_owned(),
    }
}
