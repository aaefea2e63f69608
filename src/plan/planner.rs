//! Build planning
//!
//! Given the resolved layers and a snapshot of the cache index, decides
//! for every layer whether it is reused or built, and which independent
//! siblings are worth pre-warming. Planning never touches the engine.

use crate::cache::{IndexState, LayerNode, NodeStatus};
use crate::hasher::ContentHasher;
use crate::layer::{LayerKind, LayerSpec, ResolvedDeclaration};
use crate::plan::history::BuildHistory;
use crate::reuse::{rank_chains, select_best, ChainScore};
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet, HashSet};
use tracing::debug;

/// What to do for one position of the output chain
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum PlanStep {
    /// Use an existing node as-is
    Reuse {
        #[serde(skip)]
        layer: LayerSpec,
        logical_id: String,
        node_id: String,
        image_ref: String,
    },
    /// Keep an extra layer of the selected chain that is no longer declared
    Retain {
        logical_id: String,
        node_id: String,
        image_ref: String,
    },
    /// Build the layer on the previous step
    Build {
        #[serde(skip)]
        layer: LayerSpec,
        logical_id: String,
    },
}

impl PlanStep {
    fn reuse(layer: &LayerSpec, node: &LayerNode) -> Self {
        Self::Reuse {
            layer: layer.clone(),
            logical_id: layer.logical_id(),
            node_id: node.id.clone(),
            image_ref: node.image_ref.clone(),
        }
    }

    fn retain(node: &LayerNode) -> Self {
        Self::Retain {
            logical_id: node.logical_id.clone(),
            node_id: node.id.clone(),
            image_ref: node.image_ref.clone(),
        }
    }

    fn build(layer: &LayerSpec) -> Self {
        Self::Build {
            layer: layer.clone(),
            logical_id: layer.logical_id(),
        }
    }

    pub fn logical_id(&self) -> &str {
        match self {
            Self::Reuse { logical_id, .. }
            | Self::Retain { logical_id, .. }
            | Self::Build { logical_id, .. } => logical_id,
        }
    }

    pub fn action(&self) -> &'static str {
        match self {
            Self::Reuse { .. } => "reuse",
            Self::Retain { .. } => "retain",
            Self::Build { .. } => "build",
        }
    }
}

/// Stage order and change set for this run
#[derive(Debug, Clone, Default, Serialize)]
pub struct StageShift {
    pub order: Vec<String>,
    pub hashes: BTreeMap<String, String>,
    /// Stages whose definition changed since the last successful build
    pub changed: BTreeSet<String>,
    /// Stages moved to the end (changed, or changing often)
    pub shifted: BTreeSet<String>,
}

/// The plan for one build
#[derive(Debug, Clone, Serialize)]
pub struct BuildPlan {
    pub target: String,
    pub checksum: String,
    /// Tag of the chain the plan builds on
    pub base_chain: Option<String>,
    pub scores: Vec<ChainScore>,
    pub steps: Vec<PlanStep>,
    /// Node the first fresh build goes on, and pre-warm siblings share
    pub divergence_parent: Option<String>,
    /// Apt layers built as siblings on the divergence parent
    #[serde(skip)]
    pub prewarm: Vec<LayerSpec>,
    pub stages: StageShift,
}

impl BuildPlan {
    pub fn reuse_count(&self) -> usize {
        self.count("reuse")
    }

    pub fn build_count(&self) -> usize {
        self.count("build")
    }

    pub fn retain_count(&self) -> usize {
        self.count("retain")
    }

    fn count(&self, action: &str) -> usize {
        self.steps.iter().filter(|s| s.action() == action).count()
    }

    /// Logical ids of retained extras, for the tracked chain
    pub fn retained_ids(&self) -> Vec<String> {
        self.steps
            .iter()
            .filter(|s| matches!(s, PlanStep::Retain { .. }))
            .map(|s| s.logical_id().to_string())
            .collect()
    }

    /// Logical ids of the pre-warm siblings
    pub fn prewarm_ids(&self) -> Vec<String> {
        self.prewarm.iter().map(LayerSpec::logical_id).collect()
    }
}

#[derive(Debug, Clone, Default)]
pub struct PlanOptions {
    /// Build everything, ignoring the cache
    pub force: bool,
}

/// Reorder stage layers by the shift policy and report what changed
pub fn apply_stage_shift(
    resolved: &mut ResolvedDeclaration,
    history: &BuildHistory,
    hasher: &ContentHasher,
) -> StageShift {
    if resolved.stages.is_empty() {
        return StageShift::default();
    }
    let hashes = resolved.stages.stage_hashes(hasher);
    let changed = history.changed_since_last(&resolved.target, &hashes);
    let shifted = history.stages_to_shift(&resolved.target, &hashes);
    let previous = history
        .tag(&resolved.target)
        .map(|t| t.stage_order.as_slice())
        .filter(|order| !order.is_empty());
    let order = resolved.stages.shifted_order(previous, &shifted);
    resolved.reorder_stages(&order);
    debug!("Stage order: {:?} (shifted: {:?})", order, shifted);
    StageShift {
        order,
        hashes,
        changed,
        shifted,
    }
}

fn stage_changed(layer: &LayerSpec, stages: &StageShift) -> bool {
    layer
        .stage_name()
        .map(|name| stages.changed.contains(name))
        .unwrap_or(false)
}

/// Whether a cached node can stand in for a desired layer
fn accepts(layer: &LayerSpec, node: &LayerNode, stages: &StageShift) -> bool {
    node.logical_id == layer.logical_id()
        && node.status != NodeStatus::Evicted
        && (!layer.policy().match_content || node.content_hash == layer.content_hash)
        && !stage_changed(layer, stages)
}

fn content_key(layer: &LayerSpec) -> Option<&str> {
    layer
        .policy()
        .match_content
        .then_some(layer.content_hash.as_str())
}

/// Plan a build against a point-in-time index snapshot
pub fn plan(
    resolved: &ResolvedDeclaration,
    snapshot: &IndexState,
    stages: StageShift,
    options: &PlanOptions,
) -> BuildPlan {
    let desired: Vec<&LayerSpec> = resolved.reusable().collect();
    let desired_ids = resolved.reusable_ids();
    let scores = rank_chains(snapshot, &desired_ids);
    let selected = if options.force {
        None
    } else {
        select_best(snapshot, &desired_ids)
    };

    let mut steps = Vec::with_capacity(resolved.layers.len());
    let mut tip: Option<String> = None;
    let mut position = 0;

    if let Some(chain) = selected {
        let chain_nodes: Vec<&LayerNode> = chain
            .nodes
            .iter()
            .filter_map(|id| snapshot.get(id))
            .filter(|n| n.kind() != Some(LayerKind::Config))
            .collect();

        let wanted: HashSet<&str> = desired_ids.iter().map(String::as_str).collect();
        let mut walked = 0;

        // Positional prefix match; extras retained by an earlier build are stepped over
        while walked < chain_nodes.len() {
            let node = chain_nodes[walked];
            if node.parent != tip {
                break;
            }
            if position < desired.len() && accepts(desired[position], node, &stages) {
                steps.push(PlanStep::reuse(desired[position], node));
                position += 1;
            } else if chain.retained.contains(&node.logical_id)
                && !wanted.contains(node.logical_id.as_str())
            {
                steps.push(PlanStep::retain(node));
            } else {
                break;
            }
            tip = Some(node.id.clone());
            walked += 1;
        }

        // Extras are kept when nothing after the divergence is still wanted
        let rest = &chain_nodes[walked..];
        if !rest.is_empty() && rest.iter().all(|n| !wanted.contains(n.logical_id.as_str())) {
            for node in rest {
                if node.parent != tip {
                    break;
                }
                steps.push(PlanStep::retain(node));
                tip = Some(node.id.clone());
            }
        }
        debug!("Building on chain {} (prefix of {} layer(s) reused)", chain.tag, position);
    }

    let divergence_parent = tip.clone();
    let mut prewarm = Vec::new();
    let mut built_any = false;

    for layer in &desired[position..] {
        let existing = if options.force || stage_changed(layer, &stages) {
            None
        } else {
            snapshot.lookup_child(tip.as_deref(), &layer.logical_id(), content_key(layer))
        };
        match existing {
            Some(node) => {
                steps.push(PlanStep::reuse(layer, node));
                tip = Some(node.id.clone());
            }
            None => {
                let sibling_exists = divergence_parent.as_deref().is_some_and(|parent| {
                    snapshot
                        .lookup_child(Some(parent), &layer.logical_id(), Some(&layer.content_hash))
                        .is_some()
                });
                if built_any
                    && !options.force
                    && resolved.parallel > 1
                    && layer.policy().prewarm
                    && divergence_parent.is_some()
                    && !sibling_exists
                {
                    prewarm.push((*layer).clone());
                }
                built_any = true;
                steps.push(PlanStep::build(layer));
                tip = Some(LayerNode::node_id(
                    &layer.logical_id(),
                    &layer.content_hash,
                    tip.as_deref(),
                ));
            }
        }
    }

    for layer in resolved.config_layers() {
        steps.push(PlanStep::build(layer));
    }

    BuildPlan {
        target: resolved.target.clone(),
        checksum: resolved.checksum.clone(),
        base_chain: selected.map(|c| c.tag.clone()),
        scores,
        steps,
        divergence_parent,
        prewarm,
        stages,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::CacheIndex;
    use crate::layer::{resolve, Declaration};
    use crate::orchestration::BuildRequest;
    use std::path::{Path, PathBuf};

    fn resolved(yaml: &str) -> ResolvedDeclaration {
        let decl = Declaration::parse(yaml, false).unwrap();
        resolve(&decl, Path::new("/decl"), &ContentHasher::default()).unwrap()
    }

    fn apt_decl(tag: &str, packages: &[&str], parallel: usize) -> ResolvedDeclaration {
        resolved(&format!(
            concat!(
                "image_name: app\nimage_tag: {tag}\n",
                "layers:\n  base: debian:12\n  apt: [{packages}]\n",
                "optimization:\n  parallel: {parallel}\n",
            ),
            tag = tag,
            packages = packages.join(", "),
            parallel = parallel,
        ))
    }

    /// Record every layer as built on the previous one and track the chain
    fn seed(index: &mut CacheIndex, resolved: &ResolvedDeclaration) {
        let mut parent: Option<String> = None;
        let mut nodes = Vec::new();
        for layer in &resolved.layers {
            let id =
                LayerNode::node_id(&layer.logical_id(), &layer.content_hash, parent.as_deref());
            let node = LayerNode::new(
                layer.logical_id(),
                layer.content_hash.clone(),
                parent.as_deref(),
                BuildRequest::image_ref_for(&id),
                1,
            );
            index.record(node).unwrap();
            nodes.push(id.clone());
            parent = Some(id);
        }
        index.track_chain(&resolved.target, nodes).unwrap();
    }

    fn actions(plan: &BuildPlan) -> Vec<(String, &'static str)> {
        plan.steps
            .iter()
            .map(|s| (s.logical_id().to_string(), s.action()))
            .collect()
    }

    #[test]
    fn empty_cache_builds_everything() {
        let r = apt_decl("v1", &["curl", "git"], 4);
        let index = CacheIndex::empty(PathBuf::from("/tmp/index.json"));
        let plan = plan(&r, &index.snapshot(), StageShift::default(), &PlanOptions::default());
        assert_eq!(plan.build_count(), 3);
        assert!(plan.base_chain.is_none());
        assert!(plan.prewarm.is_empty());
    }

    #[test]
    fn removal_rebuilds_only_what_followed() {
        let before = apt_decl("latest", &["curl", "git", "wget", "vim"], 1);
        let mut index = CacheIndex::empty(PathBuf::from("/tmp/index.json"));
        seed(&mut index, &before);

        let after = apt_decl("latest", &["curl", "git", "vim"], 1);
        let plan = plan(&after, &index.snapshot(), StageShift::default(), &PlanOptions::default());
        assert_eq!(
            actions(&plan),
            vec![
                ("base:debian:12".to_string(), "reuse"),
                ("apt:curl".to_string(), "reuse"),
                ("apt:git".to_string(), "reuse"),
                ("apt:vim".to_string(), "build"),
            ]
        );
        let git = index.state().lookup("apt:git").unwrap().id.clone();
        assert_eq!(plan.divergence_parent.as_deref(), Some(git.as_str()));
    }

    #[test]
    fn trailing_extras_are_retained() {
        let before = apt_decl("latest", &["curl", "git", "wget"], 1);
        let mut index = CacheIndex::empty(PathBuf::from("/tmp/index.json"));
        seed(&mut index, &before);

        let after = apt_decl("latest", &["curl", "git", "jq"], 1);
        let plan = plan(&after, &index.snapshot(), StageShift::default(), &PlanOptions::default());
        assert_eq!(
            actions(&plan),
            vec![
                ("base:debian:12".to_string(), "reuse"),
                ("apt:curl".to_string(), "reuse"),
                ("apt:git".to_string(), "reuse"),
                ("apt:wget".to_string(), "retain"),
                ("apt:jq".to_string(), "build"),
            ]
        );
    }

    #[test]
    fn retained_extras_are_stepped_over_next_time() {
        let before = apt_decl("latest", &["curl", "git", "wget"], 1);
        let mut index = CacheIndex::empty(PathBuf::from("/tmp/index.json"));
        seed(&mut index, &before);

        let after = apt_decl("latest", &["curl", "git", "jq"], 1);
        let wget = index.state().lookup("apt:wget").unwrap().id.clone();
        let jq = &after.layers[3];
        let jq_node =
            LayerNode::new(jq.logical_id(), jq.content_hash.clone(), Some(&wget), "jq", 1);
        let jq_id = jq_node.id.clone();
        index.record(jq_node).unwrap();
        let mut nodes = index.state().chain("app:latest").unwrap().nodes.clone();
        nodes.push(jq_id);
        index
            .track_chain_retaining("app:latest", nodes, vec!["apt:wget".to_string()])
            .unwrap();

        let plan = plan(&after, &index.snapshot(), StageShift::default(), &PlanOptions::default());
        assert_eq!(plan.build_count(), 0);
        assert_eq!(plan.retained_ids(), vec!["apt:wget"]);
        assert_eq!(plan.steps.last().unwrap().logical_id(), "apt:jq");
    }

    #[test]
    fn identical_declaration_reuses_everything() {
        let r = apt_decl("latest", &["curl", "git"], 4);
        let mut index = CacheIndex::empty(PathBuf::from("/tmp/index.json"));
        seed(&mut index, &r);
        let plan = plan(&r, &index.snapshot(), StageShift::default(), &PlanOptions::default());
        assert_eq!(plan.reuse_count(), 3);
        assert_eq!(plan.build_count(), 0);
    }

    #[test]
    fn force_builds_everything() {
        let r = apt_decl("latest", &["curl"], 4);
        let mut index = CacheIndex::empty(PathBuf::from("/tmp/index.json"));
        seed(&mut index, &r);
        let plan = plan(&r, &index.snapshot(), StageShift::default(), &PlanOptions { force: true });
        assert_eq!(plan.build_count(), 2);
        assert_eq!(plan.reuse_count(), 0);
    }

    #[test]
    fn config_layers_always_build() {
        let yaml = concat!(
            "image_name: app\nlayers:\n  base: debian:12\n  apt: [curl]\n",
            "  config:\n    - name: motd\n      commands: [\"echo hi > /etc/motd\"]\n",
        );
        let r = resolved(yaml);
        let mut index = CacheIndex::empty(PathBuf::from("/tmp/index.json"));
        seed(&mut index, &r);
        let plan = plan(&r, &index.snapshot(), StageShift::default(), &PlanOptions::default());
        assert_eq!(
            actions(&plan),
            vec![
                ("base:debian:12".to_string(), "reuse"),
                ("apt:curl".to_string(), "reuse"),
                ("config:motd".to_string(), "build"),
            ]
        );
    }

    #[test]
    fn prewarm_siblings_after_first_build() {
        let before = apt_decl("latest", &["curl"], 4);
        let mut index = CacheIndex::empty(PathBuf::from("/tmp/index.json"));
        seed(&mut index, &before);

        let after = apt_decl("latest", &["curl", "git", "vim", "jq"], 4);
        let plan = plan(&after, &index.snapshot(), StageShift::default(), &PlanOptions::default());
        assert_eq!(plan.build_count(), 3);
        assert_eq!(plan.prewarm_ids(), vec!["apt:vim", "apt:jq"]);

        let serial = apt_decl("latest", &["curl", "git", "vim", "jq"], 1);
        let plan = super::plan(
            &serial,
            &index.snapshot(),
            StageShift::default(),
            &PlanOptions::default(),
        );
        assert!(plan.prewarm.is_empty());
    }

    #[test]
    fn changed_stage_is_rebuilt_even_though_scripts_match_by_name() {
        let yaml = |cmd: &str| {
            format!(
                concat!(
                    "image_name: app\nlayers:\n  base: debian:12\n",
                    "stages:\n  - name: deps\n    commands: [\"{cmd}\"]\n",
                ),
                cmd = cmd
            )
        };
        let before = resolved(&yaml("make deps"));
        let mut index = CacheIndex::empty(PathBuf::from("/tmp/index.json"));
        seed(&mut index, &before);

        let mut after = resolved(&yaml("make deps V=2"));
        let mut history = BuildHistory::default();
        history.record_success(
            &before.target,
            vec!["deps".to_string()],
            before.stages.stage_hashes(&ContentHasher::default()),
            crate::plan::history::BuildRecord::new("sum", 0, 2),
        );
        let shift = apply_stage_shift(&mut after, &history, &ContentHasher::default());
        assert!(shift.changed.contains("deps"));

        let plan = plan(&after, &index.snapshot(), shift, &PlanOptions::default());
        assert_eq!(
            actions(&plan),
            vec![
                ("base:debian:12".to_string(), "reuse"),
                ("script:stage.deps".to_string(), "build"),
            ]
        );
    }

    #[test]
    fn shifted_stage_moves_to_end() {
        let yaml = |b: &str| {
            format!(
                concat!(
                    "image_name: app\nlayers:\n  base: debian:12\n",
                    "stages:\n  - name: a\n    commands: [\"{b}\"]\n  - name: b\n  - name: c\n",
                ),
                b = b
            )
        };
        let before = resolved(&yaml("one"));
        let mut history = BuildHistory::default();
        history.record_success(
            &before.target,
            vec!["a".into(), "b".into(), "c".into()],
            before.stages.stage_hashes(&ContentHasher::default()),
            crate::plan::history::BuildRecord::new("sum", 0, 4),
        );

        let mut after = resolved(&yaml("two"));
        let shift = apply_stage_shift(&mut after, &history, &ContentHasher::default());
        assert_eq!(shift.order, vec!["b", "c", "a"]);
        let ids: Vec<String> = after.layers.iter().map(|l| l.logical_id()).collect();
        assert_eq!(
            ids,
            vec!["base:debian:12", "script:stage.b", "script:stage.c", "script:stage.a"]
        );
    }
}
