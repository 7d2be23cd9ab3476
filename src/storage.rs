//
// storage.rs
// MedImg-Pipeline
//
// Safe file store for uploaded scans: bounded chunked streaming, path sanitization, content-hash
// naming and run-directory provisioning.
//
// Thales Matheus Mendonça Santos - November 2025

use std::fs;
use std::path::{Path, PathBuf};

use chrono::Utc;
use sha2::{Digest, Sha256};
use tokio::fs::File;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tracing::{debug, warn};

use crate::error::{IngestError, ResourceError};
use crate::format;

/// Uploads are read in chunks of this size so large volumes never sit fully in memory.
pub const UPLOAD_CHUNK_SIZE: usize = 4096;

#[derive(Clone)]
pub struct FileStore {
    root: PathBuf,
    max_upload_bytes: u64,
}

/// A file that made it to disk intact.
#[derive(Debug, Clone)]
pub struct StoredUpload {
    pub filename: String,
    pub path: PathBuf,
    pub size: u64,
}

impl FileStore {
    pub fn new(root: impl AsRef<Path>, max_upload_bytes: u64) -> Result<Self, ResourceError> {
        let root = root.as_ref().to_path_buf();
        // Create the upload directory eagerly so subsequent saves do not fail at runtime.
        fs::create_dir_all(&root).map_err(|source| ResourceError::CreateDir {
            path: root.clone(),
            source,
        })?;
        Ok(Self {
            root,
            max_upload_bytes,
        })
    }

    /// Start streaming an upload. The original name must carry a DICOM or NIFTI suffix.
    pub async fn begin_upload(&self, original_name: Option<&str>) -> Result<UploadWriter, IngestError> {
        let original = original_name.unwrap_or_default();
        if !format::detect(original).is_known() {
            return Err(IngestError::Rejected(format!(
                "Invalid file type '{}'. Please upload DICOM (.dcm) or NIFTI (.nii, .nii.gz) files",
                original
            )));
        }

        let suffix = format::extension(original);
        let stem = Some(format::base_name(
            Path::new(original)
                .file_name()
                .and_then(|n| n.to_str())
                .unwrap_or_default(),
        ))
        .map(|s| sanitize_filename(&s))
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| "medical_image".to_string());

        let partial = self.root.join(format!(
            ".upload-{}-{}.part",
            stem,
            Utc::now().format("%Y%m%d%H%M%S%6f")
        ));
        let file = File::create(&partial)
            .await
            .map_err(|source| ResourceError::Write {
                path: partial.clone(),
                source,
            })?;

        Ok(UploadWriter {
            root: self.root.clone(),
            stem,
            suffix,
            partial,
            file: Some(file),
            hasher: Sha256::new(),
            written: 0,
            limit: self.max_upload_bytes,
        })
    }

    /// Store everything an async reader yields, consuming it in fixed-size chunks.
    pub async fn save_reader<R: AsyncRead + Unpin>(
        &self,
        original_name: Option<&str>,
        mut reader: R,
    ) -> Result<StoredUpload, IngestError> {
        let mut writer = self.begin_upload(original_name).await?;
        let mut buf = vec![0u8; UPLOAD_CHUNK_SIZE];
        loop {
            let n = match reader.read(&mut buf).await {
                Ok(0) => break,
                Ok(n) => n,
                Err(source) => {
                    writer.abort().await;
                    return Err(ResourceError::Read {
                        path: PathBuf::from(original_name.unwrap_or_default()),
                        source,
                    }
                    .into());
                }
            };
            writer.write_chunk(&buf[..n]).await?;
        }
        writer.finish().await
    }

    pub fn resolve(&self, name: &str) -> Result<PathBuf, ResourceError> {
        let candidate = self.root.join(name);
        let canonical_root = self
            .root
            .canonicalize()
            .unwrap_or_else(|_| self.root.clone());
        let canonical = candidate
            .canonicalize()
            .map_err(|source| ResourceError::Read {
                path: candidate.clone(),
                source,
            })?;
        // Guard against path traversal by enforcing the canonical root prefix.
        if !canonical.starts_with(&canonical_root) {
            return Err(ResourceError::OutsideRoot { path: candidate });
        }
        Ok(canonical)
    }

    /// Delete a stored file, e.g. an upload that failed validation.
    pub fn remove(&self, path: &Path) -> Result<(), ResourceError> {
        match fs::remove_file(path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(source) => Err(ResourceError::Remove {
                path: path.to_path_buf(),
                source,
            }),
        }
    }
}

/// Incremental writer for one upload. Dropping it without `finish` leaves a `.part` file; call
/// `abort` to discard it.
pub struct UploadWriter {
    root: PathBuf,
    stem: String,
    suffix: String,
    partial: PathBuf,
    file: Option<File>,
    hasher: Sha256,
    written: u64,
    limit: u64,
}

impl UploadWriter {
    pub async fn write_chunk(&mut self, chunk: &[u8]) -> Result<(), IngestError> {
        if self.written + chunk.len() as u64 > self.limit {
            let limit = self.limit;
            self.abort().await;
            return Err(IngestError::Rejected(format!(
                "File too large. Maximum size is {}MB.",
                limit / (1024 * 1024)
            )));
        }

        let Some(file) = self.file.as_mut() else {
            return Err(IngestError::Rejected("upload already closed".to_string()));
        };
        if let Err(source) = file.write_all(chunk).await {
            let path = self.partial.clone();
            self.abort().await;
            return Err(ResourceError::Write { path, source }.into());
        }
        self.hasher.update(chunk);
        self.written += chunk.len() as u64;
        Ok(())
    }

    /// Flush, then move the partial file to `<stem>-<hash12><suffix>`.
    pub async fn finish(mut self) -> Result<StoredUpload, IngestError> {
        let Some(mut file) = self.file.take() else {
            return Err(IngestError::Rejected("upload already closed".to_string()));
        };
        if self.written == 0 {
            drop(file);
            let _ = tokio::fs::remove_file(&self.partial).await;
            return Err(IngestError::Rejected("File is empty".to_string()));
        }
        file.flush().await.map_err(|source| ResourceError::Write {
            path: self.partial.clone(),
            source,
        })?;
        drop(file);

        let hash = hex::encode(self.hasher.clone().finalize());
        let filename = format!("{}-{}{}", self.stem, &hash[..12], self.suffix);
        let path = self.root.join(&filename);
        tokio::fs::rename(&self.partial, &path)
            .await
            .map_err(|source| ResourceError::Write {
                path: path.clone(),
                source,
            })?;

        debug!(%filename, size = self.written, "upload stored");
        Ok(StoredUpload {
            filename,
            path,
            size: self.written,
        })
    }

    pub async fn abort(&mut self) {
        self.file.take();
        if let Err(e) = tokio::fs::remove_file(&self.partial).await {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!(path = ?self.partial, error = %e, "failed to discard partial upload");
            }
        }
    }
}

/// Create a fresh `<prefix>_<timestamp>` directory under `root`. Concurrent callers never share
/// a directory: a numeric suffix is appended when the timestamped name is already taken.
pub fn provision_run_dir(root: &Path, prefix: &str) -> Result<PathBuf, ResourceError> {
    fs::create_dir_all(root).map_err(|source| ResourceError::CreateDir {
        path: root.to_path_buf(),
        source,
    })?;

    let stamp = Utc::now().format("%Y%m%d_%H%M%S_%6f").to_string();
    let mut attempt = 0u32;
    loop {
        let name = if attempt == 0 {
            format!("{}_{}", prefix, stamp)
        } else {
            format!("{}_{}_{}", prefix, stamp, attempt)
        };
        let dir = root.join(name);
        match fs::create_dir(&dir) {
            Ok(()) => return Ok(dir),
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => attempt += 1,
            Err(source) => return Err(ResourceError::CreateDir { path: dir, source }),
        }
    }
}

fn sanitize_filename(input: &str) -> String {
    // Keep only ASCII word characters and a few safe separators to avoid filesystem surprises.
    input
        .chars()
        .filter(|c| c.is_ascii_alphanumeric() || *c == '-' || *c == '_')
        .collect()
}
