//! CLI command implementations

pub mod build;
pub mod clean;
pub mod export;
pub mod init;
pub mod layers;
pub mod plan;
pub mod push;

pub use build::execute as build;
pub use clean::execute as clean;
pub use export::execute as export;
pub use init::execute as init;
pub use layers::execute as layers;
pub use plan::execute as plan;
pub use push::execute as push;

use crate::cache::CacheIndex;
use crate::config::{self, Config};
use crate::error::{ImgdepsError, ImgdepsResult};
use crate::hasher::ContentHasher;
use crate::layer::{resolve, Declaration, ResolvedDeclaration};
use std::path::Path;

/// Load and resolve a declaration file. Script paths resolve against its directory.
pub(crate) async fn load_declaration(
    path: &Path,
    config: &Config,
) -> ImgdepsResult<(Declaration, ResolvedDeclaration)> {
    let decl = Declaration::load(path).await?;
    let base_dir = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or(Path::new("."));
    let hasher = ContentHasher::with_extra(&config.cache.ignore_keys);
    let resolved = resolve(&decl, base_dir, &hasher)?;
    Ok((decl, resolved))
}

/// Read-only view of the cache index
pub(crate) async fn read_index(config: &Config) -> ImgdepsResult<CacheIndex> {
    CacheIndex::load(CacheIndex::path_in(&config::cache_dir(config))).await
}

/// Tracked chain for `target`, as `(logical id, image ref)` pairs from base to tip
pub(crate) fn chain_images(
    index: &CacheIndex,
    target: &str,
) -> ImgdepsResult<Vec<(String, String)>> {
    let chain = index
        .state()
        .chain(target)
        .ok_or_else(|| ImgdepsError::ChainNotFound(target.to_string()))?;
    chain
        .nodes
        .iter()
        .map(|id| {
            index
                .state()
                .get(id)
                .map(|n| (n.logical_id.clone(), n.image_ref.clone()))
                .ok_or_else(|| {
                    ImgdepsError::Internal(format!("chain {target} references missing node {id}"))
                })
        })
        .collect()
}
