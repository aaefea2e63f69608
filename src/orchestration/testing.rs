//! In-memory runtime and builder used by unit tests

use crate::error::{BuildFailureKind, ImgdepsError, ImgdepsResult};
use crate::orchestration::builder::{BuildFailure, BuildRequest, BuiltImage, ImageBuilder};
use crate::orchestration::runtime::ContainerRuntime;
use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::Path;
use std::sync::Mutex;
use std::time::Duration;

/// Runtime whose image store is a set of refs. Archives contain the ref as text.
#[derive(Default)]
pub struct FakeRuntime {
    pub images: Mutex<HashSet<String>>,
    pub pushed: Mutex<Vec<String>>,
    pub registry: Mutex<HashSet<String>>,
}

impl FakeRuntime {
    pub fn with_images(images: &[&str]) -> Self {
        let runtime = Self::default();
        runtime
            .images
            .lock()
            .unwrap()
            .extend(images.iter().map(|s| s.to_string()));
        runtime
    }

    pub fn has(&self, image: &str) -> bool {
        self.images.lock().unwrap().contains(image)
    }

    pub fn drop_image(&self, image: &str) {
        self.images.lock().unwrap().remove(image);
    }
}

#[async_trait]
impl ContainerRuntime for FakeRuntime {
    async fn is_available(&self) -> ImgdepsResult<bool> {
        Ok(true)
    }

    async fn image_exists(&self, image: &str) -> ImgdepsResult<bool> {
        Ok(self.has(image))
    }

    async fn pull(&self, image: &str) -> ImgdepsResult<()> {
        if self.registry.lock().unwrap().contains(image) {
            self.images.lock().unwrap().insert(image.to_string());
            Ok(())
        } else {
            Err(ImgdepsError::command_exec(
                "podman pull",
                format!("{image}: manifest unknown"),
            ))
        }
    }

    async fn build_image(
        &self,
        _context_dir: &Path,
        tag: &str,
        _build_args: &BTreeMap<String, String>,
        on_output: &(dyn Fn(String) + Send + Sync),
    ) -> ImgdepsResult<()> {
        on_output(format!("STEP 1/1: FROM {tag}"));
        self.images.lock().unwrap().insert(tag.to_string());
        Ok(())
    }

    async fn save_image(&self, image: &str, archive: &Path) -> ImgdepsResult<()> {
        if !self.has(image) {
            return Err(ImgdepsError::ImageNotFound(image.to_string()));
        }
        std::fs::write(archive, image).map_err(|e| ImgdepsError::io("writing archive", e))
    }

    async fn load_image(&self, archive: &Path) -> ImgdepsResult<()> {
        let image =
            std::fs::read_to_string(archive).map_err(|e| ImgdepsError::io("reading archive", e))?;
        self.images.lock().unwrap().insert(image);
        Ok(())
    }

    async fn tag_image(&self, source: &str, target: &str) -> ImgdepsResult<()> {
        if !self.has(source) {
            return Err(ImgdepsError::ImageNotFound(source.to_string()));
        }
        self.images.lock().unwrap().insert(target.to_string());
        Ok(())
    }

    async fn push_image(&self, image: &str) -> ImgdepsResult<()> {
        self.pushed.lock().unwrap().push(image.to_string());
        self.registry.lock().unwrap().insert(image.to_string());
        Ok(())
    }

    async fn remove_image(&self, image: &str) -> ImgdepsResult<()> {
        self.drop_image(image);
        Ok(())
    }

    async fn image_size(&self, _image: &str) -> ImgdepsResult<u64> {
        Ok(4096)
    }

    fn runtime_name(&self) -> &'static str {
        "Fake"
    }
}

/// Builder that records every request and materializes images in a `FakeRuntime`
pub struct FakeBuilder {
    pub runtime: std::sync::Arc<FakeRuntime>,
    pub builds: Mutex<Vec<(String, Option<String>)>>,
    /// logical id -> failure to report (every attempt)
    pub failures: Mutex<HashMap<String, BuildFailureKind>>,
    /// logical id -> number of transient failures before success
    pub flaky: Mutex<HashMap<String, u32>>,
    /// logical id -> time each attempt takes
    pub delays: Mutex<HashMap<String, Duration>>,
    /// logical ids reported as built without an image landing in the runtime
    pub discarded: Mutex<HashSet<String>>,
}

impl FakeBuilder {
    pub fn new(runtime: std::sync::Arc<FakeRuntime>) -> Self {
        Self {
            runtime,
            builds: Mutex::new(Vec::new()),
            failures: Mutex::new(HashMap::new()),
            flaky: Mutex::new(HashMap::new()),
            delays: Mutex::new(HashMap::new()),
            discarded: Mutex::new(HashSet::new()),
        }
    }

    /// Logical ids built, in order
    pub fn built(&self) -> Vec<String> {
        self.builds.lock().unwrap().iter().map(|(l, _)| l.clone()).collect()
    }

    /// Count of build attempts for a logical id
    pub fn attempts(&self, logical_id: &str) -> usize {
        self.builds
            .lock()
            .unwrap()
            .iter()
            .filter(|(l, _)| l == logical_id)
            .count()
    }

    /// Parent image used by the last build of a logical id
    pub fn parent_of(&self, logical_id: &str) -> Option<String> {
        self.builds
            .lock()
            .unwrap()
            .iter()
            .rev()
            .find(|(l, _)| l == logical_id)
            .and_then(|(_, p)| p.clone())
    }

    pub fn fail(&self, logical_id: &str, kind: BuildFailureKind) {
        self.failures.lock().unwrap().insert(logical_id.to_string(), kind);
    }

    pub fn flake(&self, logical_id: &str, times: u32) {
        self.flaky.lock().unwrap().insert(logical_id.to_string(), times);
    }

    pub fn slow(&self, logical_id: &str, delay: Duration) {
        self.delays.lock().unwrap().insert(logical_id.to_string(), delay);
    }

    pub fn discard_output(&self, logical_id: &str, discard: bool) {
        let mut discarded = self.discarded.lock().unwrap();
        if discard {
            discarded.insert(logical_id.to_string());
        } else {
            discarded.remove(logical_id);
        }
    }

    pub fn reset(&self) {
        self.builds.lock().unwrap().clear();
    }
}

#[async_trait]
impl ImageBuilder for FakeBuilder {
    async fn build(&self, request: &BuildRequest) -> Result<BuiltImage, BuildFailure> {
        let logical_id = request.layer.logical_id();
        self.builds
            .lock()
            .unwrap()
            .push((logical_id.clone(), request.parent_image.clone()));

        let delay = self.delays.lock().unwrap().get(&logical_id).copied();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        if let Some(kind) = self.failures.lock().unwrap().get(&logical_id) {
            return Err(BuildFailure {
                kind: *kind,
                message: format!("{logical_id} failed"),
            });
        }
        {
            let mut flaky = self.flaky.lock().unwrap();
            if let Some(left) = flaky.get_mut(&logical_id) {
                if *left > 0 {
                    *left -= 1;
                    return Err(BuildFailure {
                        kind: BuildFailureKind::Transient,
                        message: "Temporary failure resolving 'deb.debian.org'".to_string(),
                    });
                }
            }
        }

        if !self.discarded.lock().unwrap().contains(&logical_id) {
            self.runtime
                .images
                .lock()
                .unwrap()
                .insert(request.image_ref.clone());
        }
        Ok(BuiltImage {
            image_ref: request.image_ref.clone(),
            size_bytes: 4096,
        })
    }
}
