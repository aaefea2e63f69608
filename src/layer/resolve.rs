//! Desired-state resolution
//!
//! Turns a parsed [`Declaration`] into the ordered list of [`LayerSpec`]s
//! and the stage graph. Validation happens here, before anything touches
//! the cache or the engine.

use crate::error::{ImgdepsError, ImgdepsResult};
use crate::hasher::{self, ContentHasher};
use crate::layer::declaration::Declaration;
use crate::layer::spec::{LayerContent, LayerKind, LayerSpec, STAGE_PREFIX};
use crate::layer::stage::StageGraph;
use serde_json::json;
use std::collections::HashSet;
use std::path::Path;
use tracing::{debug, info};

/// Output of the resolver
#[derive(Debug, Clone)]
pub struct ResolvedDeclaration {
    /// Output tag, `image_name:image_tag`
    pub target: String,
    /// Ordered layers; config layers form the tail
    pub layers: Vec<LayerSpec>,
    pub stages: StageGraph,
    /// Whole-config checksum for fast-skip
    pub checksum: String,
    /// Concurrent pre-warm builds
    pub parallel: usize,
    /// Days before unreferenced layers are evicted after a build; 0 disables
    pub cleanup_age: u32,
}

impl ResolvedDeclaration {
    /// Layers that take part in reuse (everything except config)
    pub fn reusable(&self) -> impl Iterator<Item = &LayerSpec> {
        self.layers.iter().filter(|l| l.policy().scored)
    }

    /// Config layers, in declared order
    pub fn config_layers(&self) -> impl Iterator<Item = &LayerSpec> {
        self.layers.iter().filter(|l| l.policy().always_rebuild)
    }

    /// Logical ids of reusable layers, in order
    pub fn reusable_ids(&self) -> Vec<String> {
        self.reusable().map(LayerSpec::logical_id).collect()
    }

    /// Re-arrange stage layers into `order`, leaving other layers in place
    pub fn reorder_stages(&mut self, order: &[String]) {
        let positions: Vec<usize> = self
            .layers
            .iter()
            .enumerate()
            .filter(|(_, l)| l.stage_name().is_some())
            .map(|(i, _)| i)
            .collect();
        let mut stage_layers: Vec<LayerSpec> =
            positions.iter().map(|&i| self.layers[i].clone()).collect();
        stage_layers.sort_by_key(|l| {
            l.stage_name()
                .and_then(|name| order.iter().position(|o| o == name))
                .unwrap_or(usize::MAX)
        });
        for (slot, layer) in positions.into_iter().zip(stage_layers) {
            self.layers[slot] = layer;
        }
        for (i, layer) in self.layers.iter_mut().enumerate() {
            layer.declared_order = i;
        }
    }
}

/// Resolve a declaration into ordered layer specs.
///
/// `base_dir` anchors relative script file paths (normally the directory
/// holding the declaration).
pub fn resolve(
    decl: &Declaration,
    base_dir: &Path,
    hasher: &ContentHasher,
) -> ImgdepsResult<ResolvedDeclaration> {
    if decl.image_name.trim().is_empty() {
        return Err(ImgdepsError::validation("image_name must not be empty"));
    }
    let opt = &decl.optimization;
    if opt.max_layers == 0 {
        return Err(ImgdepsError::validation(
            "optimization.max_layers must be at least 1",
        ));
    }

    let base = decl
        .layers
        .base
        .as_deref()
        .filter(|b| !b.trim().is_empty())
        .ok_or_else(|| ImgdepsError::validation("layers.base is required"))?;

    let mut pending: Vec<(LayerKind, String, LayerContent)> = Vec::new();
    pending.push((
        LayerKind::Base,
        base.to_string(),
        LayerContent::Image {
            reference: base.to_string(),
            env: decl.env.clone(),
        },
    ));

    for package in &decl.layers.apt {
        if package.trim().is_empty() {
            return Err(ImgdepsError::validation("empty apt package name"));
        }
    }

    let stages = StageGraph::new(decl.stages.clone())?;

    // Layer budget: fold trailing apt packages into synthetic batches
    let fixed = 1
        + decl.layers.apt_batch.len()
        + decl.layers.scripts.len()
        + decl.stages.len()
        + decl.layers.config.len();
    let (plain, folded) = fold_packages(&decl.layers.apt, fixed, opt.max_layers, opt.batch_size)?;
    if !folded.is_empty() {
        info!(
            "Folded {} apt packages into {} batch layer(s) to stay within max_layers={}",
            folded.iter().map(Vec::len).sum::<usize>(),
            folded.len(),
            opt.max_layers
        );
    }

    for package in plain {
        pending.push((
            LayerKind::Apt,
            package.clone(),
            LayerContent::Package {
                name: package.clone(),
            },
        ));
    }
    for members in folded {
        let (name, names) = batch_identity(None, &members)?;
        pending.push((LayerKind::AptBatch, name, LayerContent::Packages { names }));
    }

    for batch in &decl.layers.apt_batch {
        let (name, names) = batch_identity(batch.name.as_deref(), &batch.packages)?;
        pending.push((LayerKind::AptBatch, name, LayerContent::Packages { names }));
    }

    for script in &decl.layers.scripts {
        require_name("script", &script.name)?;
        let content = match (&script.commands, &script.file) {
            (Some(_), Some(_)) => {
                return Err(ImgdepsError::validation(format!(
                    "script '{}' declares both commands and file",
                    script.name
                )))
            }
            (None, None) => {
                return Err(ImgdepsError::validation(format!(
                    "script '{}' declares neither commands nor file",
                    script.name
                )))
            }
            (Some(commands), None) => LayerContent::Inline {
                commands: commands.clone(),
                env: script.env.clone(),
            },
            (None, Some(file)) => LayerContent::File {
                path: base_dir.join(file),
                env: script.env.clone(),
            },
        };
        pending.push((LayerKind::Script, script.name.clone(), content));
    }

    for name in stages.topological_order() {
        if let Some(stage) = stages.get(&name) {
            let mut dependencies = stage.dependencies.clone();
            dependencies.sort();
            pending.push((
                LayerKind::Script,
                format!("{STAGE_PREFIX}{name}"),
                LayerContent::Stage {
                    commands: stage.commands.clone(),
                    dependencies,
                },
            ));
        }
    }

    for config in &decl.layers.config {
        require_name("config", &config.name)?;
        if config.commands.is_empty() {
            return Err(ImgdepsError::validation(format!(
                "config layer '{}' has no commands",
                config.name
            )));
        }
        pending.push((
            LayerKind::Config,
            config.name.clone(),
            LayerContent::Commands {
                commands: config.commands.clone(),
                env: config.env.clone(),
            },
        ));
    }

    if pending.len() > opt.max_layers {
        return Err(ImgdepsError::validation(format!(
            "{} layers exceed optimization.max_layers={} even after batching",
            pending.len(),
            opt.max_layers
        )));
    }

    let mut seen = HashSet::new();
    let mut layers = Vec::with_capacity(pending.len());
    for (order, (kind, name, content)) in pending.into_iter().enumerate() {
        let content_hash = hasher.digest(&content)?;
        let spec = LayerSpec {
            kind,
            name,
            content,
            declared_order: order,
            content_hash,
        };
        if !seen.insert(spec.logical_id()) {
            return Err(ImgdepsError::validation(format!(
                "duplicate layer '{}'",
                spec.logical_id()
            )));
        }
        layers.push(spec);
    }

    let target = decl.target();
    let checksum = config_checksum(&target, &layers, hasher)?;
    debug!("Resolved {} layers for {}", layers.len(), target);

    Ok(ResolvedDeclaration {
        target,
        layers,
        stages,
        checksum,
        parallel: opt.parallel.max(1),
        cleanup_age: opt.cleanup_age,
    })
}

fn require_name(kind: &str, name: &str) -> ImgdepsResult<()> {
    if name.trim().is_empty() {
        return Err(ImgdepsError::validation(format!("{kind} layer with empty name")));
    }
    Ok(())
}

/// Name and sorted member list of a batch. Unnamed batches are named
/// after a digest of their membership.
fn batch_identity(name: Option<&str>, packages: &[String]) -> ImgdepsResult<(String, Vec<String>)> {
    if packages.is_empty() {
        return Err(ImgdepsError::validation(format!(
            "apt_batch '{}' has no packages",
            name.unwrap_or("<unnamed>")
        )));
    }
    let mut names = packages.to_vec();
    names.sort();
    names.dedup();
    let name = match name {
        Some(n) if !n.trim().is_empty() => n.to_string(),
        _ => {
            let members: Vec<&str> = names.iter().map(String::as_str).collect();
            format!("pkgs-{}", hasher::short(&hasher::digest_parts(&members)))
        }
    };
    Ok((name, names))
}

/// Split `packages` into (kept as single layers, folded batches) so the
/// total fits `max_layers`. Only the tail of the list is folded.
fn fold_packages(
    packages: &[String],
    fixed: usize,
    max_layers: usize,
    batch_size: usize,
) -> ImgdepsResult<(Vec<String>, Vec<Vec<String>>)> {
    let total = fixed + packages.len();
    if total <= max_layers {
        return Ok((packages.to_vec(), vec![]));
    }
    if batch_size < 2 {
        return Err(ImgdepsError::validation(format!(
            "{total} layers exceed optimization.max_layers={max_layers} \
             and batch_size < 2 prevents batching"
        )));
    }
    let excess = total - max_layers;
    for k in 1..=packages.len() {
        let saved = k - k.div_ceil(batch_size);
        if saved >= excess {
            let split = packages.len() - k;
            let folded = packages[split..]
                .chunks(batch_size)
                .map(<[String]>::to_vec)
                .collect();
            return Ok((packages[..split].to_vec(), folded));
        }
    }
    // Nothing left to fold; the caller reports the budget violation
    let folded = packages.chunks(batch_size).map(<[String]>::to_vec).collect();
    Ok((vec![], folded))
}

/// Whole-config checksum: target plus each layer's identity and hash, in order
pub fn config_checksum(
    target: &str,
    layers: &[LayerSpec],
    hasher: &ContentHasher,
) -> ImgdepsResult<String> {
    let entries: Vec<_> = layers
        .iter()
        .map(|l| json!([l.logical_id(), l.content_hash]))
        .collect();
    hasher.digest(&json!({"target": target, "layers": entries}))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layer::declaration::Declaration;

    fn parse(yaml: &str) -> Declaration {
        Declaration::parse(yaml, false).unwrap()
    }

    fn resolve_yaml(yaml: &str) -> ImgdepsResult<ResolvedDeclaration> {
        resolve(&parse(yaml), Path::new("/decl"), &ContentHasher::default())
    }

    #[test]
    fn orders_layers_by_category() {
        let resolved = resolve_yaml(
            r#"
image_name: app
layers:
  base: debian:12
  config:
    - name: locale
      commands: ["echo LANG=C.UTF-8 > /etc/default/locale"]
  scripts:
    - name: setup
      file: scripts/setup.sh
  apt: [curl, git]
  apt_batch:
    - name: editors
      packages: [vim, nano]
stages:
  - name: build
    commands: ["make"]
"#,
        )
        .unwrap();

        let ids: Vec<String> = resolved.layers.iter().map(|l| l.logical_id()).collect();
        assert_eq!(
            ids,
            vec![
                "base:debian:12",
                "apt:curl",
                "apt:git",
                "apt_batch:editors",
                "script:setup",
                "script:stage.build",
                "config:locale",
            ]
        );
        match &resolved.layers[4].content {
            LayerContent::File { path, .. } => {
                assert_eq!(path, Path::new("/decl/scripts/setup.sh"))
            }
            other => panic!("unexpected content {other:?}"),
        }
        assert_eq!(resolved.config_layers().count(), 1);
        assert_eq!(resolved.reusable().count(), 6);
    }

    #[test]
    fn script_with_both_commands_and_file_is_rejected() {
        let err = resolve_yaml(
            r#"
image_name: app
layers:
  base: debian:12
  scripts:
    - name: setup
      commands: ["true"]
      file: setup.sh
"#,
        )
        .unwrap_err();
        assert!(matches!(err, ImgdepsError::ConfigValidation(_)));
        assert!(err.to_string().contains("both"));
    }

    #[test]
    fn script_with_neither_commands_nor_file_is_rejected() {
        let err = resolve_yaml(
            r#"
image_name: app
layers:
  base: debian:12
  scripts:
    - name: setup
"#,
        )
        .unwrap_err();
        assert!(err.to_string().contains("neither"));
    }

    #[test]
    fn missing_base_is_rejected() {
        let err = resolve_yaml("image_name: app\nlayers:\n  apt: [curl]\n").unwrap_err();
        assert!(err.to_string().contains("layers.base"));
    }

    #[test]
    fn cyclic_stages_are_rejected() {
        let err = resolve_yaml(
            r#"
image_name: app
layers:
  base: debian:12
stages:
  - name: a
    dependencies: [b]
  - name: b
    dependencies: [a]
"#,
        )
        .unwrap_err();
        assert!(matches!(err, ImgdepsError::ConfigValidation(_)));
    }

    #[test]
    fn duplicate_package_is_rejected() {
        let err = resolve_yaml("image_name: app\nlayers:\n  base: debian:12\n  apt: [curl, curl]\n")
            .unwrap_err();
        assert!(err.to_string().contains("duplicate layer 'apt:curl'"));
    }

    #[test]
    fn batch_identity_comes_from_membership() {
        let batch = |packages: &str| {
            resolve_yaml(&format!(
                "image_name: app\nlayers:\n  base: debian:12\n  \
                 apt_batch:\n    - packages: [{packages}]\n"
            ))
            .unwrap()
        };
        let a = batch("vim, less");
        let b = batch("less, vim");
        let c = batch("less, vim, jq");
        assert_eq!(a.layers[1].logical_id(), b.layers[1].logical_id());
        assert_eq!(a.layers[1].content_hash, b.layers[1].content_hash);
        assert_ne!(a.layers[1].logical_id(), c.layers[1].logical_id());
        assert!(a.layers[1].name.starts_with("pkgs-"));
    }

    #[test]
    fn folds_trailing_packages_to_fit_budget() {
        let resolved = resolve_yaml(
            r#"
image_name: app
layers:
  base: debian:12
  apt: [a, b, c, d, e, f]
optimization:
  max_layers: 4
  batch_size: 3
"#,
        )
        .unwrap();
        let ids: Vec<String> = resolved.layers.iter().map(|l| l.logical_id()).collect();
        assert_eq!(ids.len(), 4);
        assert_eq!(ids[0], "base:debian:12");
        assert_eq!(ids[1], "apt:a");
        assert!(ids[2].starts_with("apt_batch:pkgs-"));
        assert!(ids[3].starts_with("apt_batch:pkgs-"));
    }

    #[test]
    fn budget_violation_without_packages_is_rejected() {
        let err = resolve_yaml(
            r#"
image_name: app
layers:
  base: debian:12
  config:
    - name: a
      commands: ["true"]
    - name: b
      commands: ["true"]
optimization:
  max_layers: 2
"#,
        )
        .unwrap_err();
        assert!(err.to_string().contains("max_layers"));
    }

    #[test]
    fn proxy_env_does_not_change_identity() {
        let plain = resolve_yaml("image_name: app\nlayers:\n  base: debian:12\n").unwrap();
        let proxied = resolve_yaml(
            "image_name: app\nenv:\n  https_proxy: http://proxy:3128\nlayers:\n  base: debian:12\n",
        )
        .unwrap();
        assert_eq!(plain.checksum, proxied.checksum);
        assert_eq!(plain.layers[0].content_hash, proxied.layers[0].content_hash);
    }

    #[test]
    fn reorder_stages_keeps_other_layers_in_place() {
        let mut resolved = resolve_yaml(
            r#"
image_name: app
layers:
  base: debian:12
  config:
    - name: motd
      commands: ["true"]
stages:
  - name: one
  - name: two
"#,
        )
        .unwrap();
        resolved.reorder_stages(&["two".to_string(), "one".to_string()]);
        let ids: Vec<String> = resolved.layers.iter().map(|l| l.logical_id()).collect();
        assert_eq!(
            ids,
            vec!["base:debian:12", "script:stage.two", "script:stage.one", "config:motd"]
        );
        assert_eq!(resolved.layers[1].declared_order, 1);
    }
}
