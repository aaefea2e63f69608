//! Container runtime abstraction
//!
//! Provides a trait for the image operations imgdeps needs, so the engine
//! CLI (podman or docker) can be swapped, and faked in tests.

use crate::error::ImgdepsResult;
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::path::Path;

/// Abstract container engine interface
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// Check if the engine is installed and responding
    async fn is_available(&self) -> ImgdepsResult<bool>;

    /// Check if an image exists in the local store
    async fn image_exists(&self, image: &str) -> ImgdepsResult<bool>;

    /// Pull an image from a registry
    async fn pull(&self, image: &str) -> ImgdepsResult<()>;

    /// Build `context_dir/Containerfile` as `tag`, streaming output lines
    async fn build_image(
        &self,
        context_dir: &Path,
        tag: &str,
        build_args: &BTreeMap<String, String>,
        on_output: &(dyn Fn(String) + Send + Sync),
    ) -> ImgdepsResult<()>;

    /// Write an image to an archive file
    async fn save_image(&self, image: &str, archive: &Path) -> ImgdepsResult<()>;

    /// Load an archive into the local store
    async fn load_image(&self, archive: &Path) -> ImgdepsResult<()>;

    /// Add a tag to an existing image
    async fn tag_image(&self, source: &str, target: &str) -> ImgdepsResult<()>;

    /// Push an image to its registry
    async fn push_image(&self, image: &str) -> ImgdepsResult<()>;

    /// Remove an image from the local store (missing images are not an error)
    async fn remove_image(&self, image: &str) -> ImgdepsResult<()>;

    /// Image size in bytes
    async fn image_size(&self, image: &str) -> ImgdepsResult<u64>;

    /// Get the human-readable runtime name for display
    fn runtime_name(&self) -> &'static str;
}
