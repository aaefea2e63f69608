//! Persistent cache index
//!
//! The index is one JSON document under the cache directory holding every
//! built layer node, the logical dependency graph and the tracked chains.
//!
//! # Lifecycle
//!
//! | Step | What happens |
//! |------|--------------|
//! | load | Missing file = empty index. An unreadable or inconsistent file is moved aside. |
//! | snapshot | Readers (scorer, planner) work on a cloned [`IndexState`]. |
//! | mutate + commit | Only the build's main task mutates; each change is saved atomically. |

use crate::error::{ImgdepsError, ImgdepsResult};
use crate::hasher::{digest_parts, short};
use crate::layer::LayerKind;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::{debug, info, warn};

/// Index file name inside the cache directory
pub const INDEX_FILE: &str = "index.json";

const INDEX_VERSION: u32 = 1;

/// Lifecycle state of a layer node
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeStatus {
    /// Referenced by a tracked chain
    Active,
    /// No tracked chain references it; eligible for eviction by age
    Stale,
    /// Removed from the index (only seen in eviction results)
    Evicted,
}

/// One built layer on one parent
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LayerNode {
    pub id: String,
    pub logical_id: String,
    pub content_hash: String,
    pub parent: Option<String>,
    pub image_ref: String,
    pub created_at: DateTime<Utc>,
    pub last_used: DateTime<Utc>,
    pub size_bytes: u64,
    pub status: NodeStatus,
}

impl LayerNode {
    /// A freshly built node
    pub fn new(
        logical_id: impl Into<String>,
        content_hash: impl Into<String>,
        parent: Option<&str>,
        image_ref: impl Into<String>,
        size_bytes: u64,
    ) -> Self {
        let logical_id = logical_id.into();
        let content_hash = content_hash.into();
        let now = Utc::now();
        Self {
            id: Self::node_id(&logical_id, &content_hash, parent),
            logical_id,
            content_hash,
            parent: parent.map(str::to_string),
            image_ref: image_ref.into(),
            created_at: now,
            last_used: now,
            size_bytes,
            status: NodeStatus::Active,
        }
    }

    /// Node identity: logical id, content hash and parent node id
    pub fn node_id(logical_id: &str, content_hash: &str, parent: Option<&str>) -> String {
        digest_parts(&[logical_id, content_hash, parent.unwrap_or("")])
    }

    pub fn kind(&self) -> Option<LayerKind> {
        LayerKind::from_logical_id(&self.logical_id)
    }

    /// Whether the node was last used more than `age` ago
    pub fn unused_for(&self, age: Duration, now: DateTime<Utc>) -> bool {
        now.signed_duration_since(self.last_used) > age
    }
}

/// The chain currently tracked for an output tag
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LayerChain {
    pub tag: String,
    /// Node ids from base to tip
    pub nodes: Vec<String>,
    /// Logical ids, parallel to `nodes`
    pub logical_ids: Vec<String>,
    /// Logical ids kept in the chain although no longer declared
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub retained: Vec<String>,
    pub updated_at: DateTime<Utc>,
}

impl LayerChain {
    pub fn tip(&self) -> Option<&str> {
        self.nodes.last().map(String::as_str)
    }
}

/// Point-in-time index contents. This is also the persisted document.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct IndexState {
    #[serde(default)]
    pub version: u32,
    /// node id -> node
    #[serde(default)]
    pub layers: BTreeMap<String, LayerNode>,
    /// logical id -> parent logical ids
    #[serde(default)]
    pub dependency_graph: BTreeMap<String, BTreeSet<String>>,
    /// tag -> chain
    #[serde(default)]
    pub layer_chains: BTreeMap<String, LayerChain>,
}

impl IndexState {
    pub fn get(&self, id: &str) -> Option<&LayerNode> {
        self.layers.get(id)
    }

    /// Most recently used live node for a logical id
    pub fn lookup(&self, logical_id: &str) -> Option<&LayerNode> {
        self.layers
            .values()
            .filter(|n| n.logical_id == logical_id && n.status != NodeStatus::Evicted)
            .max_by(|a, b| a.last_used.cmp(&b.last_used).then_with(|| b.id.cmp(&a.id)))
    }

    /// The node for `logical_id` built directly on `parent`, if any.
    /// With `content_hash` set, only an exact content match counts.
    pub fn lookup_child(
        &self,
        parent: Option<&str>,
        logical_id: &str,
        content_hash: Option<&str>,
    ) -> Option<&LayerNode> {
        if let Some(hash) = content_hash {
            return self
                .layers
                .get(&LayerNode::node_id(logical_id, hash, parent))
                .filter(|n| n.status != NodeStatus::Evicted);
        }
        self.layers
            .values()
            .filter(|n| {
                n.logical_id == logical_id
                    && n.parent.as_deref() == parent
                    && n.status != NodeStatus::Evicted
            })
            .max_by(|a, b| a.last_used.cmp(&b.last_used).then_with(|| b.id.cmp(&a.id)))
    }

    pub fn chains(&self) -> Vec<&LayerChain> {
        self.layer_chains.values().collect()
    }

    pub fn chain(&self, tag: &str) -> Option<&LayerChain> {
        self.layer_chains.get(tag)
    }

    /// Direct children of a node
    pub fn children(&self, id: &str) -> Vec<&LayerNode> {
        self.layers
            .values()
            .filter(|n| n.parent.as_deref() == Some(id))
            .collect()
    }

    /// Node ids from the root down to `id` inclusive.
    /// `None` if a link is missing or the walk loops.
    pub fn ancestry(&self, id: &str) -> Option<Vec<String>> {
        let mut path = Vec::new();
        let mut current = Some(id.to_string());
        while let Some(node_id) = current {
            if path.len() > self.layers.len() || path.contains(&node_id) {
                return None;
            }
            let node = self.layers.get(&node_id)?;
            current = node.parent.clone();
            path.push(node_id);
        }
        path.reverse();
        Some(path)
    }

    /// Every node referenced by a tracked chain, plus all of their ancestors
    pub fn protected(&self) -> HashSet<String> {
        let mut protected = HashSet::new();
        for chain in self.layer_chains.values() {
            for id in &chain.nodes {
                if let Some(path) = self.ancestry(id) {
                    protected.extend(path);
                } else {
                    protected.insert(id.clone());
                }
            }
        }
        protected
    }

    /// Stale nodes that `evict` would remove, leaves first
    pub fn eviction_plan(&self, older_than: Duration, now: DateTime<Utc>) -> Vec<String> {
        let protected = self.protected();
        let mut remaining: BTreeMap<&str, &LayerNode> =
            self.layers.iter().map(|(k, v)| (k.as_str(), v)).collect();
        let mut evicted = Vec::new();

        loop {
            let parents: HashSet<&str> = remaining
                .values()
                .filter_map(|n| n.parent.as_deref())
                .collect();
            let round: Vec<String> = remaining
                .values()
                .filter(|n| {
                    !protected.contains(&n.id)
                        && !parents.contains(n.id.as_str())
                        && n.unused_for(older_than, now)
                })
                .map(|n| n.id.clone())
                .collect();
            if round.is_empty() {
                break;
            }
            for id in round {
                remaining.remove(id.as_str());
                evicted.push(id);
            }
        }
        evicted
    }

    /// Consistency check run on load
    fn validate(&self) -> Result<(), String> {
        for (key, node) in &self.layers {
            if key != &node.id {
                return Err(format!("node key {key} does not match id {}", node.id));
            }
            if let Some(parent) = &node.parent {
                if !self.layers.contains_key(parent) {
                    return Err(format!("node {key} has missing parent {parent}"));
                }
            }
            if self.ancestry(key).is_none() {
                return Err(format!("node {key} is its own ancestor"));
            }
        }
        for (tag, chain) in &self.layer_chains {
            for id in &chain.nodes {
                if !self.layers.contains_key(id) {
                    return Err(format!("chain {tag} references missing node {id}"));
                }
            }
        }
        Ok(())
    }

    fn rebuild_dependency_graph(&mut self) {
        let mut graph: BTreeMap<String, BTreeSet<String>> = BTreeMap::new();
        for node in self.layers.values() {
            let entry = graph.entry(node.logical_id.clone()).or_default();
            if let Some(parent) = node.parent.as_ref().and_then(|p| self.layers.get(p)) {
                entry.insert(parent.logical_id.clone());
            }
        }
        self.dependency_graph = graph;
    }
}

/// The cache index aggregate
#[derive(Debug)]
pub struct CacheIndex {
    path: PathBuf,
    state: IndexState,
    recovered: bool,
}

impl CacheIndex {
    /// An empty index that will be saved at `path`
    pub fn empty(path: PathBuf) -> Self {
        Self {
            path,
            state: IndexState {
                version: INDEX_VERSION,
                ..Default::default()
            },
            recovered: false,
        }
    }

    /// Index path for a cache directory
    pub fn path_in(cache_dir: &Path) -> PathBuf {
        cache_dir.join(INDEX_FILE)
    }

    /// Load the index, recovering from corruption by starting empty
    pub async fn load(path: PathBuf) -> ImgdepsResult<Self> {
        if !path.exists() {
            debug!("No cache index at {}, starting empty", path.display());
            return Ok(Self::empty(path));
        }

        let content = fs::read_to_string(&path)
            .await
            .map_err(|e| ImgdepsError::io(format!("reading {}", path.display()), e));

        let parsed = content.and_then(|text| {
            let state: IndexState =
                serde_json::from_str(&text).map_err(|e| ImgdepsError::CacheCorruption {
                    path: path.clone(),
                    reason: e.to_string(),
                })?;
            state.validate().map_err(|reason| ImgdepsError::CacheCorruption {
                path: path.clone(),
                reason,
            })?;
            Ok(state)
        });

        match parsed {
            Ok(state) => Ok(Self {
                path,
                state,
                recovered: false,
            }),
            Err(err) => {
                let backup = path.with_extension(format!(
                    "json.corrupt-{}",
                    Utc::now().format("%Y%m%d%H%M%S")
                ));
                warn!(
                    "{}; moving it to {} and starting with an empty cache",
                    err,
                    backup.display()
                );
                if let Err(e) = fs::rename(&path, &backup).await {
                    warn!("Could not move corrupt index aside: {}", e);
                }
                let mut index = Self::empty(path);
                index.recovered = true;
                Ok(index)
            }
        }
    }

    /// Whether `load` discarded a corrupt index
    pub fn recovered_from_corruption(&self) -> bool {
        self.recovered
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read access to the current state
    pub fn state(&self) -> &IndexState {
        &self.state
    }

    /// Owned point-in-time copy for readers
    pub fn snapshot(&self) -> IndexState {
        self.state.clone()
    }

    pub fn lookup(&self, logical_id: &str) -> Option<&LayerNode> {
        self.state.lookup(logical_id)
    }

    pub fn chains(&self) -> Vec<&LayerChain> {
        self.state.chains()
    }

    /// Insert a built node. Re-recording an existing id refreshes its
    /// image reference and usage instead of duplicating it.
    pub fn record(&mut self, node: LayerNode) -> ImgdepsResult<()> {
        if let Some(parent) = &node.parent {
            let ancestry = self.state.ancestry(parent).ok_or_else(|| {
                ImgdepsError::Internal(format!(
                    "cannot record {}: parent {} is not in the index",
                    node.logical_id, parent
                ))
            })?;
            if ancestry.contains(&node.id) {
                return Err(ImgdepsError::Internal(format!(
                    "cannot record {}: node would be its own ancestor",
                    node.logical_id
                )));
            }
        }

        if let Some(parent) = node.parent.as_ref().and_then(|p| self.state.layers.get(p)) {
            let parent_logical = parent.logical_id.clone();
            self.state
                .dependency_graph
                .entry(node.logical_id.clone())
                .or_default()
                .insert(parent_logical);
        } else {
            self.state
                .dependency_graph
                .entry(node.logical_id.clone())
                .or_default();
        }

        match self.state.layers.get_mut(&node.id) {
            Some(existing) => {
                existing.image_ref = node.image_ref;
                existing.size_bytes = node.size_bytes;
                existing.last_used = node.last_used;
                existing.status = NodeStatus::Active;
            }
            None => {
                debug!("Recorded {} ({})", node.logical_id, short(&node.id));
                self.state.layers.insert(node.id.clone(), node);
            }
        }
        Ok(())
    }

    /// Bump last-used for a reused node
    pub fn mark_used(&mut self, id: &str) {
        if let Some(node) = self.state.layers.get_mut(id) {
            node.last_used = Utc::now();
            node.status = NodeStatus::Active;
        }
    }

    /// Point `tag` at a chain of recorded nodes
    pub fn track_chain(&mut self, tag: &str, nodes: Vec<String>) -> ImgdepsResult<()> {
        self.track_chain_retaining(tag, nodes, Vec::new())
    }

    /// Like [`track_chain`](Self::track_chain), remembering which logical
    /// ids are undeclared extras kept from the previous chain
    pub fn track_chain_retaining(
        &mut self,
        tag: &str,
        nodes: Vec<String>,
        retained: Vec<String>,
    ) -> ImgdepsResult<()> {
        let mut logical_ids = Vec::with_capacity(nodes.len());
        for id in &nodes {
            let node = self.state.layers.get(id).ok_or_else(|| {
                ImgdepsError::Internal(format!("chain {tag} references unknown node {id}"))
            })?;
            logical_ids.push(node.logical_id.clone());
        }
        self.state.layer_chains.insert(
            tag.to_string(),
            LayerChain {
                tag: tag.to_string(),
                nodes,
                logical_ids,
                retained,
                updated_at: Utc::now(),
            },
        );
        self.refresh_status();
        Ok(())
    }

    /// Recompute Active/Stale from tracked chains
    pub fn refresh_status(&mut self) {
        let protected = self.state.protected();
        for node in self.state.layers.values_mut() {
            node.status = if protected.contains(&node.id) {
                NodeStatus::Active
            } else {
                NodeStatus::Stale
            };
        }
    }

    /// Remove stale nodes unused for longer than `older_than`.
    /// Returns the removed nodes (status `Evicted`) so their artifacts can be reclaimed.
    pub fn evict(&mut self, older_than: Duration) -> Vec<LayerNode> {
        self.refresh_status();
        let plan = self.state.eviction_plan(older_than, Utc::now());
        let mut removed = Vec::with_capacity(plan.len());
        for id in plan {
            if let Some(mut node) = self.state.layers.remove(&id) {
                node.status = NodeStatus::Evicted;
                removed.push(node);
            }
        }
        if !removed.is_empty() {
            self.state.rebuild_dependency_graph();
            info!("Evicted {} layer node(s)", removed.len());
        }
        removed
    }

    /// Persist atomically (temp file + rename)
    pub async fn commit(&self) -> ImgdepsResult<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)
                .await
                .map_err(|e| ImgdepsError::io(format!("creating {}", parent.display()), e))?;
        }
        let content = serde_json::to_string_pretty(&self.state)?;
        let tmp = self.path.with_extension("json.tmp");
        fs::write(&tmp, content)
            .await
            .map_err(|e| ImgdepsError::io(format!("writing {}", tmp.display()), e))?;
        fs::rename(&tmp, &self.path)
            .await
            .map_err(|e| ImgdepsError::io(format!("replacing {}", self.path.display()), e))?;
        Ok(())
    }
}
