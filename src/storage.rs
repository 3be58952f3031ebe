//! Cover image storage on the local filesystem.

use crate::config::StorageConfig;
use crate::error::{AppError, Result};
use image::ImageFormat;
use std::path::{Path, PathBuf};

/// Filesystem store for uploaded covers.
#[derive(Debug, Clone)]
pub struct FileStorage {
    root: PathBuf,
    max_bytes: usize,
}

impl FileStorage {
    /// Create a store rooted at the configured covers directory.
    pub fn new(config: &StorageConfig) -> Self {
        Self {
            root: config.covers_dir.clone(),
            max_bytes: config.max_cover_bytes,
        }
    }

    /// Validate and store a cover under `users/<owner_id>/`, returning its path.
    pub fn save_cover(&self, owner_id: &str, bytes: &[u8]) -> Result<PathBuf> {
        if bytes.is_empty() {
            return Err(AppError::Validation("Cover file is empty".to_string()));
        }
        if bytes.len() > self.max_bytes {
            return Err(AppError::Validation(format!(
                "Cover exceeds {} bytes",
                self.max_bytes
            )));
        }
        if owner_id.is_empty() || !owner_id.chars().all(|c| c.is_ascii_alphanumeric() || c == '-') {
            return Err(AppError::Validation("Invalid owner id".to_string()));
        }

        let format = detect_format(bytes)?;
        image::load_from_memory_with_format(bytes, format)
            .map_err(|e| AppError::Validation(format!("Cover is not a valid image: {}", e)))?;

        let dir = self.root.join("users").join(owner_id);
        std::fs::create_dir_all(&dir)?;

        let extension = format.extensions_str().first().copied().unwrap_or("img");
        let suffix = uuid::Uuid::new_v4().simple().to_string();
        let file_name = format!(
            "{}-{}.{}",
            chrono::Utc::now().timestamp_millis(),
            &suffix[..8],
            extension
        );
        let path = dir.join(file_name);

        std::fs::write(&path, bytes)?;
        tracing::info!(path = %path.display(), size = bytes.len(), "Cover stored");
        Ok(path)
    }

    /// Read a stored file; `None` if it no longer exists.
    pub fn read_file(&self, path: &Path) -> Result<Option<Vec<u8>>> {
        match std::fs::read(path) {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::warn!(path = %path.display(), "Stored file missing");
                Ok(None)
            }
            Err(e) => Err(e.into()),
        }
    }
}

/// Accepts JPEG, PNG and WebP.
fn detect_format(bytes: &[u8]) -> Result<ImageFormat> {
    match image::guess_format(bytes) {
        Ok(format @ (ImageFormat::Jpeg | ImageFormat::Png | ImageFormat::WebP)) => Ok(format),
        Ok(other) => Err(AppError::Validation(format!(
            "Unsupported cover format: {:?}",
            other
        ))),
        Err(_) => Err(AppError::Validation(
            "Cover is not a recognised image".to_string(),
        )),
    }
}

/// MIME type for a stored cover, from its extension.
pub fn content_type_for(path: &Path) -> &'static str {
    path.extension()
        .and_then(|ext| ext.to_str())
        .and_then(ImageFormat::from_extension)
        .map(|format| format.to_mime_type())
        .unwrap_or("application/octet-stream")
}
