//! RAW file loader
//!
//! Byte provider that re-reads a file from disk each time a worker picks up
//! the request, so edits on disk between request and processing are seen.

use crate::error::SourceError;
use crate::pipeline::ByteProvider;
use async_trait::async_trait;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

/// Supported RAW file extensions (common formats)
pub const RAW_EXTENSIONS: [&str; 16] = [
    "nef", "dng", "cr2", "cr3", "arw", "raf", "orf", "rw2", "pef", "srw", "erf", "kdc", "dcr",
    "mos", "raw", "rwl",
];

/// Regular images the codec can render directly
pub const IMAGE_EXTENSIONS: [&str; 5] = ["jpg", "jpeg", "png", "tif", "tiff"];

/// Check whether a path looks like something the pipeline can render
pub fn is_supported(path: &Path) -> bool {
    path.extension()
        .map(|ext| ext.to_string_lossy().to_lowercase())
        .is_some_and(|ext| {
            RAW_EXTENSIONS.contains(&ext.as_str()) || IMAGE_EXTENSIONS.contains(&ext.as_str())
        })
}

/// Source bytes of a file on disk
#[derive(Debug, Clone)]
pub struct FileSource {
    path: PathBuf,
}

impl FileSource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl ByteProvider for FileSource {
    async fn read(&self) -> Result<Vec<u8>, SourceError> {
        match tokio::fs::read(&self.path).await {
            Ok(bytes) => Ok(bytes),
            Err(e) if e.kind() == ErrorKind::NotFound => {
                Err(SourceError::NotFound(self.path.display().to_string()))
            }
            Err(e) => Err(SourceError::Io(e)),
        }
    }
}
