//! Whole-config checksum sidecars
//!
//! One file per output tag holding the canonical config hash of the last
//! build that completed with its whole chain present locally. External
//! tools read these to decide whether a running container is current.

use crate::error::{ImgdepsError, ImgdepsResult};
use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::debug;

/// Sidecar store under `<cache_dir>/checksums`
#[derive(Debug, Clone)]
pub struct ChecksumStore {
    dir: PathBuf,
}

impl ChecksumStore {
    pub fn new(cache_dir: &Path) -> Self {
        Self {
            dir: cache_dir.join("checksums"),
        }
    }

    /// Sidecar path for `image_name:image_tag`
    pub fn path_for(&self, target: &str) -> PathBuf {
        let (name, tag) = target.rsplit_once(':').unwrap_or((target, "latest"));
        let safe_name: String = name
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '.' { c } else { '_' })
            .collect();
        self.dir.join(format!("{safe_name}__{tag}.sha256"))
    }

    /// Stored checksum, if any
    pub async fn read(&self, target: &str) -> Option<String> {
        fs::read_to_string(self.path_for(target))
            .await
            .ok()
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
    }

    /// Whether the stored checksum equals `checksum`
    pub async fn matches(&self, target: &str, checksum: &str) -> bool {
        self.read(target).await.as_deref() == Some(checksum)
    }

    pub async fn write(&self, target: &str, checksum: &str) -> ImgdepsResult<()> {
        fs::create_dir_all(&self.dir)
            .await
            .map_err(|e| ImgdepsError::io(format!("creating {}", self.dir.display()), e))?;
        let path = self.path_for(target);
        fs::write(&path, format!("{checksum}\n"))
            .await
            .map_err(|e| ImgdepsError::io(format!("writing {}", path.display()), e))?;
        debug!("Wrote checksum sidecar {}", path.display());
        Ok(())
    }

    /// Drop the sidecar so the next build cannot fast-skip
    pub async fn remove(&self, target: &str) -> ImgdepsResult<()> {
        let path = self.path_for(target);
        match fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(ImgdepsError::io(format!("removing {}", path.display()), e)),
        }
    }
}
