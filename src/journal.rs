//! Build journal
//!
//! Writes JSON lines to `~/.local/state/imgdeps/journal.log`: one event per
//! build start, completion, failure and eviction run. Enabled by default,
//! switched off with `general.journal = false`.

use crate::config::{Config, ConfigManager};
use chrono::Utc;
use std::path::PathBuf;
use tokio::fs::OpenOptions;
use tokio::io::AsyncWriteExt;
use tracing::warn;

/// Event names
pub mod events {
    pub const BUILD_STARTED: &str = "build.started";
    pub const BUILD_COMPLETED: &str = "build.completed";
    pub const BUILD_FAILED: &str = "build.failed";
    pub const LAYERS_EVICTED: &str = "layers.evicted";
}

/// Append-only JSON lines journal
#[derive(Debug, Clone)]
pub struct Journal {
    enabled: bool,
    path: PathBuf,
}

impl Journal {
    pub fn new(config: &Config) -> Self {
        Self {
            enabled: config.general.journal,
            path: ConfigManager::journal_path(),
        }
    }

    /// Journal at an explicit path
    pub fn at(path: PathBuf) -> Self {
        Self {
            enabled: true,
            path,
        }
    }

    /// A journal that drops everything
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            path: PathBuf::new(),
        }
    }

    /// Append an event. IO failures are logged and otherwise ignored.
    pub async fn log(&self, event: &str, data: &serde_json::Value) {
        if !self.enabled {
            return;
        }

        let entry = serde_json::json!({
            "timestamp": Utc::now().to_rfc3339(),
            "event": event,
            "data": data,
        });

        let mut line = match serde_json::to_string(&entry) {
            Ok(s) => s,
            Err(e) => {
                warn!("Failed to serialize journal event: {}", e);
                return;
            }
        };
        line.push('\n');

        if let Err(e) = self.append(&line).await {
            warn!("Failed to write build journal: {}", e);
        }
    }

    async fn append(&self, line: &str) -> std::io::Result<()> {
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await?;

        file.write_all(line.as_bytes()).await?;
        file.flush().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn writes_json_line() {
        let dir = TempDir::new().unwrap();
        let journal = Journal::at(dir.path().join("journal.log"));

        journal
            .log(
                events::BUILD_COMPLETED,
                &serde_json::json!({"target": "app:latest", "built": 2}),
            )
            .await;

        let content = tokio::fs::read_to_string(&journal.path).await.unwrap();
        let parsed: serde_json::Value = serde_json::from_str(content.trim()).unwrap();

        assert_eq!(parsed["event"], "build.completed");
        assert_eq!(parsed["data"]["target"], "app:latest");
        assert!(parsed["timestamp"].is_string());
    }

    #[tokio::test]
    async fn appends_multiple_lines() {
        let dir = TempDir::new().unwrap();
        let journal = Journal::at(dir.path().join("nested").join("journal.log"));

        journal.log(events::BUILD_STARTED, &serde_json::json!({})).await;
        journal.log(events::BUILD_FAILED, &serde_json::json!({})).await;

        let content = tokio::fs::read_to_string(&journal.path).await.unwrap();
        assert_eq!(content.trim().lines().count(), 2);
    }

    #[tokio::test]
    async fn skips_when_disabled() {
        let dir = TempDir::new().unwrap();
        let journal = Journal {
            enabled: false,
            path: dir.path().join("journal.log"),
        };

        journal.log(events::LAYERS_EVICTED, &serde_json::json!({})).await;

        assert!(!journal.path.exists());
    }
}
