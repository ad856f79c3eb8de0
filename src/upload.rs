use std::{
    io,
    path::{Path, PathBuf},
};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum UploadError {
    #[error("Failed to create staging directory {0:?}: {1}")]
    CreateDir(PathBuf, io::Error),
    #[error("Failed to write staged upload {0:?}: {1}")]
    Write(PathBuf, io::Error),
}

/// Accepts `filename` iff it has a dot and the suffix after the last dot,
/// lowercased, is one of `allowed`.
///
/// This only looks at the name. Content is checked later when the image
/// decoder guesses the format from the bytes.
pub fn allowed_file<S: AsRef<str>>(filename: &str, allowed: &[S]) -> bool {
    match filename.rsplit_once('.') {
        Some((_, extension)) => {
            let extension = extension.to_lowercase();
            allowed.iter().any(|a| a.as_ref() == extension)
        }
        None => false,
    }
}

/// Reduces a client supplied filename to something safe to join onto a
/// directory: ASCII only, no path separators, only `[A-Za-z0-9_.-]`, and no
/// leading or trailing dots or underscores. May return an empty string.
pub fn secure_filename(filename: &str) -> String {
    let spaced: String = filename
        .chars()
        .filter(char::is_ascii)
        .map(|c| if c == '/' || c == '\\' { ' ' } else { c })
        .collect();

    let joined = spaced.split_whitespace().collect::<Vec<_>>().join("_");

    let cleaned: String = joined
        .chars()
        .filter(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-'))
        .collect();

    cleaned.trim_matches(|c| c == '.' || c == '_').to_string()
}

fn request_token() -> String {
    format!("{:016x}", rand::random::<u64>())
}

#[derive(Debug, Clone)]
pub struct UploadStager {
    staging_dir: PathBuf,
}

impl UploadStager {
    pub fn new(staging_dir: impl Into<PathBuf>) -> Self {
        Self {
            staging_dir: staging_dir.into(),
        }
    }

    /// Writes `data` into the staging directory under a request-unique name
    /// and returns a handle that removes the file when dropped.
    pub async fn stage(&self, filename: &str, data: &[u8]) -> Result<StagedUpload, UploadError> {
        tokio::fs::create_dir_all(&self.staging_dir)
            .await
            .map_err(|e| UploadError::CreateDir(self.staging_dir.clone(), e))?;

        let token = request_token();
        let sanitized = secure_filename(filename);
        let staged_name = if sanitized.is_empty() {
            token
        } else {
            format!("{}_{}", token, sanitized)
        };
        let path = self.staging_dir.join(staged_name);

        tokio::fs::write(&path, data)
            .await
            .map_err(|e| UploadError::Write(path.clone(), e))?;

        tracing::debug!("Staged {} bytes at {:?}", data.len(), path);

        Ok(StagedUpload { path })
    }
}

/// A file in the staging directory, deleted on drop.
#[derive(Debug)]
pub struct StagedUpload {
    path: PathBuf,
}

impl StagedUpload {
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for StagedUpload {
    fn drop(&mut self) {
        match std::fs::remove_file(&self.path) {
            Ok(()) => tracing::debug!("Removed staged upload {:?}", self.path),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => tracing::warn!("Failed to remove staged upload {:?}: {}", self.path, e),
        }
    }
}
