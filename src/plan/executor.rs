//! Plan execution
//!
//! Runs a [`BuildPlan`] against the engine. The main task walks the chain
//! in order and is the only writer of the cache index; pre-warm siblings
//! run concurrently in a [`JoinSet`] bounded by a semaphore, and their
//! results are recorded by the main task as they arrive.
//!
//! Failed builds are retried with exponential backoff unless the builder
//! reports a permanent failure. A failure on the chain halts the rest of
//! the plan; pre-warm builds that have not started yet are skipped.

use crate::cache::{
    CacheIndex, CacheLock, ChecksumStore, LayerNode, Lookup, Tier, TieredCache,
};
use crate::config::{self, Config};
use crate::error::{BuildFailureKind, ImgdepsError, ImgdepsResult};
use crate::hasher::{short, ContentHasher};
use crate::journal::{events, Journal};
use crate::layer::{LayerKind, LayerSpec, ResolvedDeclaration};
use crate::orchestration::{BuildFailure, BuildRequest, BuiltImage, ContainerRuntime, ImageBuilder};
use crate::plan::history::{BuildHistory, BuildRecord};
use crate::plan::planner::{apply_stage_shift, plan, BuildPlan, PlanOptions, PlanStep};
use serde::Serialize;
use serde_json::json;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

/// Proxy variables passed through from the host when `inherit_proxy` is set
pub const PROXY_VARS: &[&str] = &[
    "http_proxy",
    "https_proxy",
    "ftp_proxy",
    "socks_proxy",
    "no_proxy",
    "all_proxy",
];

/// Build args for a declaration: its `env`, plus host proxy settings.
/// None of these take part in layer identity.
pub fn build_args(env: &BTreeMap<String, String>, inherit_proxy: bool) -> BTreeMap<String, String> {
    let mut args = env.clone();
    if inherit_proxy {
        for var in PROXY_VARS {
            for key in [var.to_string(), var.to_uppercase()] {
                if let Ok(value) = std::env::var(&key) {
                    if !value.is_empty() {
                        args.entry(key).or_insert(value);
                    }
                }
            }
        }
    }
    args
}

/// Retry settings for one layer build
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub retries: u32,
    pub backoff: Duration,
    pub timeout: Duration,
}

impl RetryPolicy {
    pub fn from_config(config: &Config) -> Self {
        Self {
            retries: config.build.retries,
            backoff: Duration::from_millis(config.build.backoff_ms),
            timeout: Duration::from_secs(config.build.layer_timeout_secs.max(1)),
        }
    }

    /// Delay before retry number `attempt` (1-based)
    fn delay(&self, attempt: u32) -> Duration {
        self.backoff.saturating_mul(2u32.saturating_pow(attempt.saturating_sub(1)))
    }
}

/// Build one layer, retrying transient failures and timeouts
pub async fn build_with_retry(
    builder: &dyn ImageBuilder,
    request: &BuildRequest,
    policy: RetryPolicy,
) -> ImgdepsResult<BuiltImage> {
    let logical_id = request.layer.logical_id();
    let mut attempt = 0;
    loop {
        attempt += 1;
        let outcome = match tokio::time::timeout(policy.timeout, builder.build(request)).await {
            Ok(result) => result,
            Err(_) => Err(BuildFailure {
                kind: BuildFailureKind::Timeout,
                message: format!("no result after {}s", policy.timeout.as_secs()),
            }),
        };
        match outcome {
            Ok(built) => return Ok(built),
            Err(failure)
                if failure.kind != BuildFailureKind::Permanent && attempt <= policy.retries =>
            {
                let delay = policy.delay(attempt);
                warn!(
                    "{} failed ({}), retrying in {}ms: {}",
                    logical_id,
                    failure.kind,
                    delay.as_millis(),
                    failure.message
                );
                tokio::time::sleep(delay).await;
            }
            Err(failure) => {
                return Err(ImgdepsError::LayerBuild {
                    layer: logical_id,
                    kind: failure.kind,
                    attempts: attempt,
                    message: failure.message,
                })
            }
        }
    }
}

/// Plan a declaration against the cache in `cache_dir` without building
/// or taking the lock. Also reports whether the fast-skip checksum matches.
pub async fn preview(
    cache_dir: &Path,
    hasher: &ContentHasher,
    mut resolved: ResolvedDeclaration,
) -> ImgdepsResult<(BuildPlan, bool)> {
    let index = CacheIndex::load(CacheIndex::path_in(cache_dir)).await?;
    let history = BuildHistory::load(&BuildHistory::path_in(cache_dir)).await;
    let up_to_date = ChecksumStore::new(cache_dir)
        .matches(&resolved.target, &resolved.checksum)
        .await;
    let stages = apply_stage_shift(&mut resolved, &history, hasher);
    let plan = plan(&resolved, &index.snapshot(), stages, &PlanOptions::default());
    Ok((plan, up_to_date))
}

/// Evict stale nodes unused for `older_than_days` and reclaim their
/// images. The caller holds the cache lock. Returns the removed nodes.
pub async fn evict_stale(
    index: &mut CacheIndex,
    cache: &TieredCache,
    journal: &Journal,
    older_than_days: u32,
) -> ImgdepsResult<Vec<LayerNode>> {
    let removed = index.evict(chrono::Duration::days(older_than_days as i64));
    if removed.is_empty() {
        return Ok(removed);
    }
    index.commit().await?;
    for node in &removed {
        if let Err(e) = cache.reclaim(&node.image_ref).await {
            warn!("Could not reclaim {}: {}", node.image_ref, e);
        }
    }
    journal
        .log(
            events::LAYERS_EVICTED,
            &json!({
                "count": removed.len(),
                "older_than_days": older_than_days,
                "layers": removed.iter().map(|n| &n.logical_id).collect::<Vec<_>>(),
            }),
        )
        .await;
    Ok(removed)
}

/// Progress notifications for the CLI
#[derive(Debug, Clone)]
pub enum ExecEvent {
    Planned { reuse: usize, build: usize, prewarm: usize },
    Reused { logical_id: String, tier: Tier },
    Retained { logical_id: String },
    Building { logical_id: String },
    Built { logical_id: String },
    Prewarmed { logical_id: String },
    Dropped { logical_id: String },
}

type EventSink = Arc<dyn Fn(ExecEvent) + Send + Sync>;

#[derive(Debug, Clone, Default)]
pub struct BuildOptions {
    pub force: bool,
    pub break_lock: bool,
}

/// What a build did
#[derive(Debug, Clone, Default, Serialize)]
pub struct BuildReport {
    pub target: String,
    pub fast_skipped: bool,
    pub reused: usize,
    pub retained: usize,
    pub built: usize,
    pub config_rebuilt: usize,
    pub prewarmed: usize,
    pub promoted: usize,
    pub evicted: usize,
    pub tip_image: Option<String>,
    pub recovered_index: bool,
}

/// Current end of the chain being assembled
#[derive(Debug, Clone)]
struct Tip {
    node_id: String,
    image_ref: String,
}

/// Outcome of one pre-warm task
enum Prewarm {
    Built(LayerSpec, String, BuiltImage),
    Skipped(String),
    Failed(String, ImgdepsError),
}

/// Drives builds against one cache directory
pub struct Executor {
    cache_dir: PathBuf,
    hasher: ContentHasher,
    retry: RetryPolicy,
    lock_stale: chrono::Duration,
    builder: Arc<dyn ImageBuilder>,
    runtime: Arc<dyn ContainerRuntime>,
    cache: TieredCache,
    journal: Journal,
    on_event: EventSink,
}

impl Executor {
    pub fn new(
        config: &Config,
        builder: Arc<dyn ImageBuilder>,
        runtime: Arc<dyn ContainerRuntime>,
        cache: TieredCache,
    ) -> Self {
        Self {
            cache_dir: config::cache_dir(config),
            hasher: ContentHasher::with_extra(&config.cache.ignore_keys),
            retry: RetryPolicy::from_config(config),
            lock_stale: chrono::Duration::seconds(config.cache.lock_stale_secs as i64),
            builder,
            runtime,
            cache,
            journal: Journal::new(config),
            on_event: Arc::new(|_| {}),
        }
    }

    pub fn with_journal(mut self, journal: Journal) -> Self {
        self.journal = journal;
        self
    }

    pub fn with_events(mut self, on_event: EventSink) -> Self {
        self.on_event = on_event;
        self
    }

    fn emit(&self, event: ExecEvent) {
        (self.on_event)(event);
    }

    /// Build the declaration, reusing cached layers where possible
    pub async fn run(
        &self,
        mut resolved: ResolvedDeclaration,
        build_args: BTreeMap<String, String>,
        options: &BuildOptions,
    ) -> ImgdepsResult<BuildReport> {
        let checksums = ChecksumStore::new(&self.cache_dir);
        let mut report = BuildReport {
            target: resolved.target.clone(),
            ..Default::default()
        };

        if !options.force && checksums.matches(&resolved.target, &resolved.checksum).await {
            info!("{} is up to date", resolved.target);
            report.fast_skipped = true;
            return Ok(report);
        }

        let lock = CacheLock::acquire(&self.cache_dir, self.lock_stale, options.break_lock).await?;
        let mut index = CacheIndex::load(CacheIndex::path_in(&self.cache_dir)).await?;
        report.recovered_index = index.recovered_from_corruption();

        let history_path = BuildHistory::path_in(&self.cache_dir);
        let mut history = BuildHistory::load(&history_path).await;
        let stages = apply_stage_shift(&mut resolved, &history, &self.hasher);
        let plan = plan(
            &resolved,
            &index.snapshot(),
            stages,
            &PlanOptions { force: options.force },
        );
        info!(
            "Plan for {}: {} reused, {} to build, {} pre-warm",
            plan.target,
            plan.reuse_count(),
            plan.build_count(),
            plan.prewarm.len()
        );
        self.emit(ExecEvent::Planned {
            reuse: plan.reuse_count(),
            build: plan.build_count(),
            prewarm: plan.prewarm.len(),
        });
        self.journal
            .log(
                events::BUILD_STARTED,
                &json!({
                    "target": plan.target,
                    "checksum": plan.checksum,
                    "base_chain": plan.base_chain,
                    "reuse": plan.reuse_count(),
                    "build": plan.build_count(),
                    "force": options.force,
                }),
            )
            .await;

        let outcome = self
            .execute(&plan, &mut index, &build_args, resolved.parallel, &mut report)
            .await;

        let pushed: Vec<String> = match &outcome {
            Ok(published) | Err((_, published)) => published.clone(),
        };
        let errors = self.cache.publish(&pushed, outcome.is_ok()).await;
        if !errors.is_empty() {
            warn!("{} layer(s) could not be published", errors.len());
        }

        if let Err((err, _)) = outcome {
            self.journal
                .log(
                    events::BUILD_FAILED,
                    &json!({"target": plan.target, "error": err.to_string()}),
                )
                .await;
            drop(lock);
            return Err(err);
        }

        // The sidecar is only written once the whole chain is present locally
        let chain_complete = self.chain_is_local(&index, &plan.target).await?;
        if chain_complete {
            if let Some(tip) = &report.tip_image {
                self.runtime.tag_image(tip, &plan.target).await?;
            }
            checksums.write(&plan.target, &plan.checksum).await?;
        } else {
            warn!("Chain for {} is not fully present locally; not recording checksum", plan.target);
            checksums.remove(&plan.target).await?;
        }

        history.record_success(
            &plan.target,
            plan.stages.order.clone(),
            plan.stages.hashes.clone(),
            BuildRecord::new(plan.checksum.clone(), report.reused, report.built),
        );
        history.save(&history_path).await?;

        if resolved.cleanup_age > 0 {
            let evicted =
                evict_stale(&mut index, &self.cache, &self.journal, resolved.cleanup_age).await?;
            report.evicted = evicted.len();
        }

        self.journal
            .log(
                events::BUILD_COMPLETED,
                &json!({
                    "target": plan.target,
                    "reused": report.reused,
                    "retained": report.retained,
                    "built": report.built,
                    "config_rebuilt": report.config_rebuilt,
                    "prewarmed": report.prewarmed,
                    "tip": report.tip_image,
                }),
            )
            .await;
        drop(lock);
        Ok(report)
    }

    /// Walk the plan. On success returns the images to publish; on
    /// failure the error plus whatever was built before it.
    async fn execute(
        &self,
        plan: &BuildPlan,
        index: &mut CacheIndex,
        build_args: &BTreeMap<String, String>,
        parallel: usize,
        report: &mut BuildReport,
    ) -> Result<Vec<String>, (ImgdepsError, Vec<String>)> {
        let semaphore = Arc::new(Semaphore::new(parallel.max(1)));
        let halted = Arc::new(AtomicBool::new(false));
        let mut prewarm: JoinSet<Prewarm> = JoinSet::new();
        let mut prewarm_started = plan.prewarm.is_empty();

        let mut published = Vec::new();
        let mut chain: Vec<String> = Vec::new();
        let mut retained: Vec<String> = Vec::new();
        let mut tip: Option<Tip> = None;

        for step in &plan.steps {
            let at_divergence =
                tip.as_ref().map(|t| &t.node_id) == plan.divergence_parent.as_ref();
            if !prewarm_started && at_divergence {
                if let Some(parent) = &tip {
                    self.spawn_prewarm(&mut prewarm, plan, parent, build_args, &semaphore, &halted);
                }
                prewarm_started = true;
            }

            let result = match step {
                PlanStep::Reuse {
                    layer,
                    node_id,
                    image_ref,
                    ..
                } => {
                    let candidate = Some((node_id, image_ref));
                    self.reuse_or_build(
                        index,
                        layer,
                        candidate,
                        tip.as_ref(),
                        build_args,
                        &semaphore,
                        report,
                    )
                    .await
                }
                PlanStep::Retain {
                    logical_id,
                    node_id,
                    image_ref,
                } => {
                    let kept = self
                        .retain(index, logical_id, node_id, image_ref, tip.as_ref(), report)
                        .await;
                    match kept {
                        Ok(Some(next)) => {
                            retained.push(logical_id.clone());
                            Ok((next, None))
                        }
                        Ok(None) => {
                            let published = &mut published;
                            self.drain_prewarm(&mut prewarm, index, plan, report, published, false)
                                .await;
                            continue;
                        }
                        Err(e) => Err(e),
                    }
                }
                PlanStep::Build { layer, .. } => {
                    self.reuse_or_build(
                        index,
                        layer,
                        None,
                        tip.as_ref(),
                        build_args,
                        &semaphore,
                        report,
                    )
                    .await
                }
            };

            match result {
                Ok((next, built)) => {
                    if let Some(image) = built {
                        published.push(image);
                    }
                    chain.push(next.node_id.clone());
                    tip = Some(next);
                    if let Err(e) = index.commit().await {
                        halted.store(true, Ordering::SeqCst);
                        self.finish_prewarm(&mut prewarm, index, plan, report, &mut published)
                            .await;
                        return Err((e, published));
                    }
                }
                Err(e) => {
                    halted.store(true, Ordering::SeqCst);
                    self.finish_prewarm(&mut prewarm, index, plan, report, &mut published).await;
                    if let Err(save_err) = index.commit().await {
                        warn!("Could not save layers built before the failure: {}", save_err);
                    }
                    return Err((e, published));
                }
            }

            self.drain_prewarm(&mut prewarm, index, plan, report, &mut published, false).await;
        }

        self.finish_prewarm(&mut prewarm, index, plan, report, &mut published).await;

        index
            .track_chain_retaining(&plan.target, chain, retained)
            .map_err(|e| (e, published.clone()))?;
        index.commit().await.map_err(|e| (e, published.clone()))?;
        report.tip_image = tip.map(|t| t.image_ref);
        Ok(published)
    }

    /// Reuse `candidate` if its image can be made local, otherwise build.
    /// Returns the new tip and, for fresh non-config builds, the image to publish.
    #[allow(clippy::too_many_arguments)]
    async fn reuse_or_build(
        &self,
        index: &mut CacheIndex,
        layer: &LayerSpec,
        candidate: Option<(&String, &String)>,
        tip: Option<&Tip>,
        build_args: &BTreeMap<String, String>,
        semaphore: &Semaphore,
        report: &mut BuildReport,
    ) -> ImgdepsResult<(Tip, Option<String>)> {
        let parent_id = tip.map(|t| t.node_id.as_str());
        let logical_id = layer.logical_id();

        // The candidate must sit on the current tip; an earlier rebuild may have moved it
        let candidate = candidate.filter(|(id, _)| {
            index.state().get(id).map(|n| n.parent.as_deref()) == Some(parent_id)
        });

        if let Some((node_id, image_ref)) = candidate {
            match self.cache.ensure_local(image_ref).await? {
                Lookup::Hit(tier) => {
                    index.mark_used(node_id);
                    report.reused += 1;
                    if tier != Tier::Local {
                        report.promoted += 1;
                    }
                    debug!("Reusing {} ({})", logical_id, short(node_id));
                    self.emit(ExecEvent::Reused {
                        logical_id,
                        tier,
                    });
                    return Ok((
                        Tip {
                            node_id: node_id.clone(),
                            image_ref: image_ref.clone(),
                        },
                        None,
                    ));
                }
                Lookup::Miss => {
                    warn!("Image for {} is gone from every tier; rebuilding", logical_id);
                }
            }
        }

        let node_id = LayerNode::node_id(&logical_id, &layer.content_hash, parent_id);
        let request = BuildRequest {
            layer: layer.clone(),
            parent_image: tip.map(|t| t.image_ref.clone()),
            parent_node: tip.map(|t| t.node_id.clone()),
            image_ref: BuildRequest::image_ref_for(&node_id),
            node_id,
            build_args: build_args.clone(),
        };

        self.emit(ExecEvent::Building {
            logical_id: logical_id.clone(),
        });
        let built = {
            let _permit = semaphore
                .acquire()
                .await
                .map_err(|e| ImgdepsError::Internal(format!("build slots closed: {e}")))?;
            build_with_retry(self.builder.as_ref(), &request, self.retry).await?
        };

        let node = LayerNode::new(
            logical_id.clone(),
            layer.content_hash.clone(),
            parent_id,
            built.image_ref.clone(),
            built.size_bytes,
        );
        let next = Tip {
            node_id: node.id.clone(),
            image_ref: node.image_ref.clone(),
        };
        index.record(node)?;

        let is_config = layer.kind == LayerKind::Config;
        if is_config {
            report.config_rebuilt += 1;
        } else {
            report.built += 1;
        }
        info!("Built {}", logical_id);
        self.emit(ExecEvent::Built { logical_id });
        Ok((next, (!is_config).then_some(built.image_ref)))
    }

    /// Keep an undeclared extra. `None` when its image is lost; it is then dropped.
    async fn retain(
        &self,
        index: &mut CacheIndex,
        logical_id: &str,
        node_id: &str,
        image_ref: &str,
        tip: Option<&Tip>,
        report: &mut BuildReport,
    ) -> ImgdepsResult<Option<Tip>> {
        let parent_id = tip.map(|t| t.node_id.as_str());
        let on_tip = index.state().get(node_id).map(|n| n.parent.as_deref()) == Some(parent_id);
        if on_tip {
            if let Lookup::Hit(_) = self.cache.ensure_local(image_ref).await? {
                index.mark_used(node_id);
                report.retained += 1;
                self.emit(ExecEvent::Retained {
                    logical_id: logical_id.to_string(),
                });
                return Ok(Some(Tip {
                    node_id: node_id.to_string(),
                    image_ref: image_ref.to_string(),
                }));
            }
        }
        warn!("Dropping undeclared layer {} from the chain", logical_id);
        self.emit(ExecEvent::Dropped {
            logical_id: logical_id.to_string(),
        });
        Ok(None)
    }

    fn spawn_prewarm(
        &self,
        tasks: &mut JoinSet<Prewarm>,
        plan: &BuildPlan,
        parent: &Tip,
        build_args: &BTreeMap<String, String>,
        semaphore: &Arc<Semaphore>,
        halted: &Arc<AtomicBool>,
    ) {
        for layer in &plan.prewarm {
            let node_id =
                LayerNode::node_id(&layer.logical_id(), &layer.content_hash, Some(&parent.node_id));
            let request = BuildRequest {
                layer: layer.clone(),
                parent_image: Some(parent.image_ref.clone()),
                parent_node: Some(parent.node_id.clone()),
                image_ref: BuildRequest::image_ref_for(&node_id),
                node_id,
                build_args: build_args.clone(),
            };
            let builder = Arc::clone(&self.builder);
            let semaphore = Arc::clone(semaphore);
            let halted = Arc::clone(halted);
            let retry = self.retry;
            let parent_id = parent.node_id.clone();
            tasks.spawn(async move {
                let logical_id = request.layer.logical_id();
                let _permit = match semaphore.acquire_owned().await {
                    Ok(permit) => permit,
                    Err(_) => return Prewarm::Skipped(logical_id),
                };
                if halted.load(Ordering::SeqCst) {
                    return Prewarm::Skipped(logical_id);
                }
                match build_with_retry(builder.as_ref(), &request, retry).await {
                    Ok(built) => Prewarm::Built(request.layer, parent_id, built),
                    Err(e) => Prewarm::Failed(logical_id, e),
                }
            });
        }
    }

    /// Record finished pre-warm tasks; with `wait`, block until all are done
    async fn drain_prewarm(
        &self,
        tasks: &mut JoinSet<Prewarm>,
        index: &mut CacheIndex,
        plan: &BuildPlan,
        report: &mut BuildReport,
        published: &mut Vec<String>,
        wait: bool,
    ) {
        loop {
            let joined = if wait {
                tasks.join_next().await
            } else {
                tasks.try_join_next()
            };
            let Some(joined) = joined else { break };
            match joined {
                Ok(Prewarm::Built(layer, parent_id, built)) => {
                    let node = LayerNode::new(
                        layer.logical_id(),
                        layer.content_hash.clone(),
                        Some(&parent_id),
                        built.image_ref.clone(),
                        built.size_bytes,
                    );
                    match index.record(node) {
                        Ok(()) => {
                            report.prewarmed += 1;
                            published.push(built.image_ref);
                            self.emit(ExecEvent::Prewarmed {
                                logical_id: layer.logical_id(),
                            });
                        }
                        Err(e) => {
                            warn!("Could not record pre-warmed {}: {}", layer.logical_id(), e)
                        }
                    }
                }
                Ok(Prewarm::Skipped(logical_id)) => debug!("Skipped pre-warm of {}", logical_id),
                Ok(Prewarm::Failed(logical_id, e)) => {
                    warn!("Pre-warm of {} for {} failed: {}", logical_id, plan.target, e)
                }
                Err(e) => warn!("Pre-warm task panicked: {}", e),
            }
        }
    }

    async fn finish_prewarm(
        &self,
        tasks: &mut JoinSet<Prewarm>,
        index: &mut CacheIndex,
        plan: &BuildPlan,
        report: &mut BuildReport,
        published: &mut Vec<String>,
    ) {
        self.drain_prewarm(tasks, index, plan, report, published, true).await;
    }

    async fn chain_is_local(&self, index: &CacheIndex, target: &str) -> ImgdepsResult<bool> {
        let Some(chain) = index.state().chain(target) else {
            return Ok(false);
        };
        for id in &chain.nodes {
            let Some(node) = index.state().get(id) else {
                return Ok(false);
            };
            if !self.cache.is_local(&node.image_ref).await? {
                return Ok(false);
            }
        }
        Ok(true)
    }
}
