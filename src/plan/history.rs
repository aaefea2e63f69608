//! Per-tag build history
//!
//! Remembers, for each output tag, the stage execution order and stage
//! hashes of the last successful build, plus a short list of recent build
//! records. Stage change frequency over those records feeds the stage
//! shift policy.

use crate::error::{ImgdepsError, ImgdepsResult};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::{debug, warn};
use uuid::Uuid;

/// History file name inside the cache directory
pub const HISTORY_FILE: &str = "history.json";

/// Build records kept per tag
pub const MAX_RECORDS: usize = 10;

/// Stages changing in more than half of recent builds are treated as changed
pub const FREQUENT_CHANGE_RATIO: f64 = 0.5;

/// One completed build
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BuildRecord {
    pub id: Uuid,
    pub finished_at: DateTime<Utc>,
    pub checksum: String,
    pub reused: usize,
    pub built: usize,
    /// Stages whose hash differed from the previous build
    #[serde(default)]
    pub changed_stages: Vec<String>,
}

/// Everything remembered about one output tag
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TagHistory {
    #[serde(default)]
    pub stage_order: Vec<String>,
    #[serde(default)]
    pub stage_hashes: BTreeMap<String, String>,
    #[serde(default)]
    pub builds: Vec<BuildRecord>,
}

impl TagHistory {
    /// Share of recent builds in which each stage changed
    pub fn change_frequency(&self) -> BTreeMap<String, f64> {
        let recent: Vec<&BuildRecord> = self.builds.iter().rev().take(MAX_RECORDS).collect();
        let mut counts: BTreeMap<String, usize> = BTreeMap::new();
        for record in &recent {
            for stage in &record.changed_stages {
                *counts.entry(stage.clone()).or_default() += 1;
            }
        }
        counts
            .into_iter()
            .map(|(stage, n)| (stage, n as f64 / recent.len() as f64))
            .collect()
    }
}

/// History for every tag, stored as one JSON document
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BuildHistory {
    #[serde(default)]
    tags: BTreeMap<String, TagHistory>,
}

impl BuildHistory {
    pub fn path_in(cache_dir: &Path) -> PathBuf {
        cache_dir.join(HISTORY_FILE)
    }

    /// Load history; a missing or unreadable file yields empty history
    pub async fn load(path: &Path) -> Self {
        let content = match fs::read_to_string(path).await {
            Ok(content) => content,
            Err(_) => return Self::default(),
        };
        match serde_json::from_str(&content) {
            Ok(history) => history,
            Err(e) => {
                warn!("Ignoring unreadable build history {}: {}", path.display(), e);
                Self::default()
            }
        }
    }

    /// Save atomically
    pub async fn save(&self, path: &Path) -> ImgdepsResult<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .await
                .map_err(|e| ImgdepsError::io(format!("creating {}", parent.display()), e))?;
        }
        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, serde_json::to_string_pretty(self)?)
            .await
            .map_err(|e| ImgdepsError::io(format!("writing {}", tmp.display()), e))?;
        fs::rename(&tmp, path)
            .await
            .map_err(|e| ImgdepsError::io(format!("replacing {}", path.display()), e))?;
        Ok(())
    }

    pub fn tag(&self, tag: &str) -> Option<&TagHistory> {
        self.tags.get(tag)
    }

    /// Stages whose hash changed since the last successful build of `tag`
    pub fn changed_since_last(
        &self,
        tag: &str,
        current: &BTreeMap<String, String>,
    ) -> BTreeSet<String> {
        let Some(history) = self.tags.get(tag) else {
            return BTreeSet::new();
        };
        if history.stage_hashes.is_empty() {
            return BTreeSet::new();
        }
        current
            .iter()
            .filter(|(name, hash)| history.stage_hashes.get(*name) != Some(*hash))
            .map(|(name, _)| name.clone())
            .collect()
    }

    /// Stages to move to the end: changed now, or changing frequently
    pub fn stages_to_shift(
        &self,
        tag: &str,
        current: &BTreeMap<String, String>,
    ) -> BTreeSet<String> {
        let mut shifted = self.changed_since_last(tag, current);
        if let Some(history) = self.tags.get(tag) {
            for (stage, ratio) in history.change_frequency() {
                if ratio > FREQUENT_CHANGE_RATIO && current.contains_key(&stage) {
                    debug!("Stage {} changes often ({:.0}%)", stage, ratio * 100.0);
                    shifted.insert(stage);
                }
            }
        }
        shifted
    }

    /// Record a successful build: new stage order and hashes, plus a bounded record
    pub fn record_success(
        &mut self,
        tag: &str,
        stage_order: Vec<String>,
        stage_hashes: BTreeMap<String, String>,
        mut record: BuildRecord,
    ) {
        let changed = self.changed_since_last(tag, &stage_hashes);
        record.changed_stages = changed.into_iter().collect();

        let entry = self.tags.entry(tag.to_string()).or_default();
        entry.stage_order = stage_order;
        entry.stage_hashes = stage_hashes;
        entry.builds.push(record);
        if entry.builds.len() > MAX_RECORDS {
            let excess = entry.builds.len() - MAX_RECORDS;
            entry.builds.drain(..excess);
        }
    }
}

impl BuildRecord {
    pub fn new(checksum: impl Into<String>, reused: usize, built: usize) -> Self {
        Self {
            id: Uuid::new_v4(),
            finished_at: Utc::now(),
            checksum: checksum.into(),
            reused,
            built,
            changed_stages: Vec::new(),
        }
    }
}
