//! Runtime factory
//!
//! Picks the engine CLI named in the settings and checks it responds.

use crate::config::Config;
use crate::error::{ImgdepsError, ImgdepsResult};
use crate::orchestration::native::{EngineBinary, NativeRuntime};
use crate::orchestration::runtime::ContainerRuntime;
use std::sync::Arc;
use tracing::debug;

/// Create the container runtime selected by `engine.binary`
///
/// # Returns
/// * `Ok(Arc<dyn ContainerRuntime>)` - shared by the builder and the cache tiers
/// * `Err` - unknown engine name, or the engine CLI is not installed
pub async fn create_runtime(config: &Config) -> ImgdepsResult<Arc<dyn ContainerRuntime>> {
    let binary = EngineBinary::parse(&config.engine.binary).ok_or_else(|| {
        ImgdepsError::EngineUnavailable(format!(
            "unsupported engine '{}' (expected podman or docker)",
            config.engine.binary
        ))
    })?;

    let runtime = NativeRuntime::new(binary);
    if !runtime.is_available().await? {
        return Err(ImgdepsError::EngineUnavailable(format!(
            "'{}' is not installed or not on PATH",
            binary.command()
        )));
    }
    debug!("Using {} engine", runtime.runtime_name());
    Ok(Arc::new(runtime))
}
