//! Multi-tier artifact storage for layer images
//!
//! Tiers are checked in priority order: the engine's local image store,
//! then a shared directory of image archives, then a registry. A hit in a
//! lower tier is promoted into the local store before use.

use crate::config::{Config, PushPolicy};
use crate::error::{ImgdepsError, ImgdepsResult};
use crate::orchestration::ContainerRuntime;
use async_trait::async_trait;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Storage tier, in lookup priority order
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Tier {
    Local,
    SharedStore,
    Registry,
}

impl fmt::Display for Tier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Local => write!(f, "local"),
            Self::SharedStore => write!(f, "shared-store"),
            Self::Registry => write!(f, "registry"),
        }
    }
}

/// A place layer images can be kept
///
/// Keys are local image references (`localhost/imgdeps-layer:<id>`).
#[async_trait]
pub trait TierBackend: Send + Sync {
    fn tier(&self) -> Tier;

    /// Whether the tier holds the image
    async fn contains(&self, image_ref: &str) -> ImgdepsResult<bool>;

    /// Materialize the image into the local engine store.
    /// `Ok(false)` when the tier does not have it.
    async fn get(&self, image_ref: &str) -> ImgdepsResult<bool>;

    /// Copy a local image into this tier
    async fn put(&self, image_ref: &str) -> ImgdepsResult<()>;

    /// Drop the image from this tier
    async fn remove(&self, image_ref: &str) -> ImgdepsResult<()>;
}

/// The engine's own image store
pub struct EngineTier {
    runtime: Arc<dyn ContainerRuntime>,
}

impl EngineTier {
    pub fn new(runtime: Arc<dyn ContainerRuntime>) -> Self {
        Self { runtime }
    }
}

#[async_trait]
impl TierBackend for EngineTier {
    fn tier(&self) -> Tier {
        Tier::Local
    }

    async fn contains(&self, image_ref: &str) -> ImgdepsResult<bool> {
        self.runtime.image_exists(image_ref).await
    }

    async fn get(&self, image_ref: &str) -> ImgdepsResult<bool> {
        self.contains(image_ref).await
    }

    async fn put(&self, _image_ref: &str) -> ImgdepsResult<()> {
        Ok(())
    }

    async fn remove(&self, image_ref: &str) -> ImgdepsResult<()> {
        self.runtime.remove_image(image_ref).await
    }
}

/// A directory of `save`d image archives, typically a shared mount
pub struct DirectoryTier {
    dir: PathBuf,
    runtime: Arc<dyn ContainerRuntime>,
}

impl DirectoryTier {
    pub fn new(dir: PathBuf, runtime: Arc<dyn ContainerRuntime>) -> Self {
        Self { dir, runtime }
    }

    /// Archive path for an image ref
    pub fn archive_path(&self, image_ref: &str) -> PathBuf {
        let name: String = image_ref
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '.' { c } else { '_' })
            .collect();
        self.dir.join(format!("{name}.tar"))
    }
}

#[async_trait]
impl TierBackend for DirectoryTier {
    fn tier(&self) -> Tier {
        Tier::SharedStore
    }

    async fn contains(&self, image_ref: &str) -> ImgdepsResult<bool> {
        Ok(self.archive_path(image_ref).exists())
    }

    async fn get(&self, image_ref: &str) -> ImgdepsResult<bool> {
        let archive = self.archive_path(image_ref);
        if !archive.exists() {
            return Ok(false);
        }
        debug!("Loading {} from {}", image_ref, archive.display());
        self.runtime.load_image(&archive).await?;
        Ok(true)
    }

    async fn put(&self, image_ref: &str) -> ImgdepsResult<()> {
        tokio::fs::create_dir_all(&self.dir)
            .await
            .map_err(|e| ImgdepsError::io(format!("creating {}", self.dir.display()), e))?;
        let archive = self.archive_path(image_ref);
        if archive.exists() {
            return Ok(());
        }
        // Write beside the final name so readers never see a partial archive
        let tmp = archive.with_extension(format!("tar.{}.tmp", uuid::Uuid::new_v4()));
        self.runtime.save_image(image_ref, &tmp).await?;
        tokio::fs::rename(&tmp, &archive)
            .await
            .map_err(|e| ImgdepsError::io(format!("replacing {}", archive.display()), e))?;
        Ok(())
    }

    async fn remove(&self, image_ref: &str) -> ImgdepsResult<()> {
        let archive = self.archive_path(image_ref);
        match tokio::fs::remove_file(&archive).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(ImgdepsError::io(format!("removing {}", archive.display()), e)),
        }
    }
}

/// A registry reached through the engine's push and pull
pub struct RegistryTier {
    registry: String,
    runtime: Arc<dyn ContainerRuntime>,
}

impl RegistryTier {
    pub fn new(registry: impl Into<String>, runtime: Arc<dyn ContainerRuntime>) -> Self {
        Self {
            registry: registry.into().trim_end_matches('/').to_string(),
            runtime,
        }
    }

    /// Remote reference for a local layer ref
    pub fn remote_ref(&self, image_ref: &str) -> String {
        let name = image_ref.rsplit('/').next().unwrap_or(image_ref);
        format!("{}/{}", self.registry, name)
    }
}

fn is_not_found(err: &ImgdepsError) -> bool {
    match err {
        ImgdepsError::CommandExecution { stderr, .. } => {
            let lower = stderr.to_lowercase();
            lower.contains("manifest unknown")
                || lower.contains("not found")
                || lower.contains("does not exist")
        }
        ImgdepsError::ImageNotFound(_) => true,
        _ => false,
    }
}

#[async_trait]
impl TierBackend for RegistryTier {
    fn tier(&self) -> Tier {
        Tier::Registry
    }

    async fn contains(&self, image_ref: &str) -> ImgdepsResult<bool> {
        let remote = self.remote_ref(image_ref);
        self.runtime.image_exists(&remote).await
    }

    async fn get(&self, image_ref: &str) -> ImgdepsResult<bool> {
        let remote = self.remote_ref(image_ref);
        match self.runtime.pull(&remote).await {
            Ok(()) => {}
            Err(e) if is_not_found(&e) => return Ok(false),
            Err(e) => return Err(e),
        }
        self.runtime.tag_image(&remote, image_ref).await?;
        Ok(true)
    }

    async fn put(&self, image_ref: &str) -> ImgdepsResult<()> {
        let remote = self.remote_ref(image_ref);
        self.runtime.tag_image(image_ref, &remote).await?;
        self.runtime.push_image(&remote).await
    }

    async fn remove(&self, image_ref: &str) -> ImgdepsResult<()> {
        // Registry deletion is not exposed by the engine CLI; drop the local alias only
        let remote = self.remote_ref(image_ref);
        self.runtime.remove_image(&remote).await
    }
}

/// Result of a tiered lookup
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lookup {
    /// Present locally, found in (and if needed promoted from) this tier
    Hit(Tier),
    Miss,
}

/// Local store plus optional remote tiers
pub struct TieredCache {
    local: Box<dyn TierBackend>,
    remotes: Vec<Box<dyn TierBackend>>,
    push: PushPolicy,
}

impl TieredCache {
    pub fn new(local: Box<dyn TierBackend>, push: PushPolicy) -> Self {
        Self {
            local,
            remotes: Vec::new(),
            push,
        }
    }

    /// Add a lower-priority tier
    pub fn with_tier(mut self, tier: Box<dyn TierBackend>) -> Self {
        self.remotes.push(tier);
        self.remotes.sort_by_key(|t| t.tier());
        self
    }

    /// Tiers configured in `[cache]`
    pub fn from_config(config: &Config, runtime: Arc<dyn ContainerRuntime>) -> Self {
        let mut cache = Self::new(Box::new(EngineTier::new(runtime.clone())), config.cache.push);
        if let Some(dir) = &config.cache.shared_store {
            cache = cache.with_tier(Box::new(DirectoryTier::new(dir.clone(), runtime.clone())));
        }
        if let Some(registry) = config.cache.registry.as_deref().filter(|r| !r.is_empty()) {
            cache = cache.with_tier(Box::new(RegistryTier::new(registry, runtime)));
        }
        cache
    }

    /// Configured tiers, highest priority first
    pub fn tiers(&self) -> Vec<Tier> {
        std::iter::once(self.local.tier())
            .chain(self.remotes.iter().map(|t| t.tier()))
            .collect()
    }

    /// Whether the image is in the local store
    pub async fn is_local(&self, image_ref: &str) -> ImgdepsResult<bool> {
        self.local.contains(image_ref).await
    }

    /// Make sure `image_ref` is in the local store, promoting from the
    /// first lower tier that has it. A failed promotion is logged and the
    /// next tier is tried.
    pub async fn ensure_local(&self, image_ref: &str) -> ImgdepsResult<Lookup> {
        if self.local.contains(image_ref).await? {
            return Ok(Lookup::Hit(Tier::Local));
        }
        for tier in &self.remotes {
            match tier.get(image_ref).await {
                Ok(true) => {
                    info!("Promoted {} from {}", image_ref, tier.tier());
                    return Ok(Lookup::Hit(tier.tier()));
                }
                Ok(false) => {}
                Err(e) => {
                    let err = ImgdepsError::CachePromotion {
                        key: image_ref.to_string(),
                        tier: tier.tier().to_string(),
                        reason: e.to_string(),
                    };
                    warn!("{}", err);
                }
            }
        }
        Ok(Lookup::Miss)
    }

    /// Push images to the remote tiers if the policy allows it for this outcome
    pub async fn publish(&self, image_refs: &[String], succeeded: bool) -> Vec<ImgdepsError> {
        let allowed = match self.push {
            PushPolicy::Always => true,
            PushPolicy::OnSuccess => succeeded,
            PushPolicy::Manual => false,
        };
        if !allowed {
            return Vec::new();
        }
        self.push_all(image_refs).await
    }

    /// Push images to every remote tier regardless of policy.
    /// Returns the failures; a failed push never undoes a build.
    pub async fn push_all(&self, image_refs: &[String]) -> Vec<ImgdepsError> {
        let mut errors = Vec::new();
        for tier in &self.remotes {
            for image_ref in image_refs {
                if let Err(e) = tier.put(image_ref).await {
                    warn!("Failed to publish {} to {}: {}", image_ref, tier.tier(), e);
                    errors.push(e);
                }
            }
        }
        errors
    }

    /// Reclaim an evicted layer from the local store and the shared store.
    /// Registry copies are left alone.
    pub async fn reclaim(&self, image_ref: &str) -> ImgdepsResult<()> {
        self.local.remove(image_ref).await?;
        for tier in self.remotes.iter().filter(|t| t.tier() == Tier::SharedStore) {
            tier.remove(image_ref).await?;
        }
        Ok(())
    }
}
