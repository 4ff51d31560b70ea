//! Upload of processed artifacts and reclamation of local disk space.

mod blob;

use crate::error::{CleanupError, PublishError};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;
use tracing::{error, info, warn};

pub use blob::{AzureBlobStore, StorageAccount};

/// Object storage holding published artifacts
#[async_trait]
pub trait BlobStore: Send + Sync {
    /// Upload the file at `local_path` as `blob_name`, replacing any existing blob
    async fn put_file(&self, local_path: &Path, blob_name: &str) -> Result<(), PublishError>;
}

/// What a cleanup pass managed to remove
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CleanupReport {
    pub image_removed: bool,
    pub workdir_removed: bool,
    pub errors: Vec<String>,
}

impl CleanupReport {
    pub fn is_clean(&self) -> bool {
        self.image_removed && self.workdir_removed && self.errors.is_empty()
    }
}

/// Uploads artifacts and removes their local inputs afterwards
#[derive(Clone)]
pub struct ArtifactPublisher {
    store: Arc<dyn BlobStore>,
}

impl ArtifactPublisher {
    pub fn new(store: Arc<dyn BlobStore>) -> Self {
        Self { store }
    }

    pub async fn publish(&self, local_path: &Path, blob_name: &str) -> Result<(), PublishError> {
        if let Err(source) = tokio::fs::metadata(local_path).await {
            return Err(PublishError::Open {
                path: local_path.to_path_buf(),
                source,
            });
        }

        info!("Uploading {} as blob {}", local_path.display(), blob_name);
        self.store.put_file(local_path, blob_name).await?;
        info!("Uploaded blob {}", blob_name);
        Ok(())
    }

    /// Remove the raw capture and the working directory. Each removal is attempted
    /// regardless of the other; failures end up in the report.
    pub async fn cleanup(&self, raw_image: &Path, work_dir: &Path) -> CleanupReport {
        let mut report = CleanupReport::default();

        match tokio::fs::remove_file(raw_image).await {
            Ok(()) => report.image_removed = true,
            Err(source) => {
                let e = CleanupError::RemoveImage {
                    path: raw_image.to_path_buf(),
                    source,
                };
                warn!("{}", e);
                report.errors.push(e.to_string());
            }
        }

        match tokio::fs::remove_dir_all(work_dir).await {
            Ok(()) => report.workdir_removed = true,
            Err(source) => {
                let e = CleanupError::RemoveDirectory {
                    path: work_dir.to_path_buf(),
                    source,
                };
                warn!("{}", e);
                report.errors.push(e.to_string());
            }
        }

        if report.is_clean() {
            info!("Deleted {} and {}", raw_image.display(), work_dir.display());
        } else {
            error!(
                "Cleanup incomplete for {}: {} error(s)",
                work_dir.display(),
                report.errors.len()
            );
        }

        report
    }
}
