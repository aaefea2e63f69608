//! Single-layer image builder
//!
//! Each planned build produces exactly one image `FROM` its parent. The
//! builder writes a Containerfile and a `run.sh` into a fresh context
//! directory, invokes the engine, and reports failures with a kind so the
//! executor can decide whether to retry.

use crate::error::{BuildFailureKind, ImgdepsError};
use crate::hasher::short;
use crate::layer::{LayerContent, LayerSpec};
use crate::orchestration::runtime::ContainerRuntime;
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::fmt;
use std::io::ErrorKind;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, trace, warn};

/// Local repository that holds layer images
pub const LAYER_REPOSITORY: &str = "localhost/imgdeps-layer";

/// Label keys written on every layer image
pub mod labels {
    pub const LOGICAL_ID: &str = "io.imgdeps.logical-id";
    pub const CONTENT_HASH: &str = "io.imgdeps.content-hash";
    pub const NODE_ID: &str = "io.imgdeps.node-id";
    pub const PARENT: &str = "io.imgdeps.parent";
}

/// Output lines that indicate a network or mirror hiccup
const TRANSIENT_PATTERNS: &[&str] = &[
    "temporary failure resolving",
    "could not resolve",
    "connection timed out",
    "connection reset",
    "connection refused",
    "i/o timeout",
    "tls handshake timeout",
    "503 service unavailable",
    "502 bad gateway",
    "hash sum mismatch",
    "unable to fetch some archives",
    "too many requests",
];

/// One layer to build
#[derive(Debug, Clone)]
pub struct BuildRequest {
    pub layer: LayerSpec,
    /// Image to build `FROM`; `None` only for the base layer
    pub parent_image: Option<String>,
    /// Parent node id, for labels
    pub parent_node: Option<String>,
    /// Node id the result will be recorded under
    pub node_id: String,
    /// Tag to give the result
    pub image_ref: String,
    /// Build args (declaration env, inherited proxies)
    pub build_args: BTreeMap<String, String>,
}

impl BuildRequest {
    /// Local image ref for a node
    pub fn image_ref_for(node_id: &str) -> String {
        format!("{LAYER_REPOSITORY}:{}", short(node_id))
    }
}

/// A successfully built layer image
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuiltImage {
    pub image_ref: String,
    pub size_bytes: u64,
}

/// A failed build attempt
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildFailure {
    pub kind: BuildFailureKind,
    pub message: String,
}

impl fmt::Display for BuildFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} failure: {}", self.kind, self.message)
    }
}

/// Builds one layer image on top of a parent image
#[async_trait]
pub trait ImageBuilder: Send + Sync {
    async fn build(&self, request: &BuildRequest) -> Result<BuiltImage, BuildFailure>;
}

/// Classify an engine error by its output
pub fn classify_failure(err: &ImgdepsError) -> BuildFailureKind {
    match err {
        ImgdepsError::CommandExecution { stderr, .. } => {
            let lower = stderr.to_lowercase();
            if TRANSIENT_PATTERNS.iter().any(|p| lower.contains(p)) {
                BuildFailureKind::Transient
            } else {
                BuildFailureKind::Permanent
            }
        }
        ImgdepsError::Io { .. } => BuildFailureKind::Transient,
        _ => BuildFailureKind::Permanent,
    }
}

/// Labels attached to a built layer image
pub fn layer_labels(request: &BuildRequest) -> BTreeMap<&'static str, String> {
    let mut map = BTreeMap::new();
    map.insert(labels::LOGICAL_ID, request.layer.logical_id());
    map.insert(labels::CONTENT_HASH, request.layer.content_hash.clone());
    map.insert(labels::NODE_ID, request.node_id.clone());
    map.insert(labels::PARENT, request.parent_node.clone().unwrap_or_default());
    map
}

/// [`ImageBuilder`] backed by a [`ContainerRuntime`]
pub struct LayerBuilder {
    runtime: Arc<dyn ContainerRuntime>,
    builds_dir: PathBuf,
    preserve_build_dirs: bool,
    on_output: Arc<dyn Fn(String) + Send + Sync>,
}

impl LayerBuilder {
    pub fn new(runtime: Arc<dyn ContainerRuntime>, builds_dir: PathBuf) -> Self {
        Self {
            runtime,
            builds_dir,
            preserve_build_dirs: false,
            on_output: Arc::new(|line| trace!("{}", line)),
        }
    }

    /// Keep generated contexts after the build
    pub fn preserve_build_dirs(mut self, preserve: bool) -> Self {
        self.preserve_build_dirs = preserve;
        self
    }

    /// Receive engine output lines (progress display)
    pub fn with_output(mut self, on_output: Arc<dyn Fn(String) + Send + Sync>) -> Self {
        self.on_output = on_output;
        self
    }

    /// Write Containerfile and run.sh into a new context directory
    async fn prepare_context(&self, request: &BuildRequest) -> Result<BuildContext, BuildFailure> {
        let script = match &request.layer.content {
            LayerContent::File { path, .. } => {
                let body = tokio::fs::read_to_string(path).await.map_err(|e| BuildFailure {
                    kind: BuildFailureKind::Permanent,
                    message: format!("reading script {}: {}", path.display(), e),
                })?;
                Some(body)
            }
            other => run_script(other),
        };

        let dir = self.builds_dir.join(uuid::Uuid::new_v4().to_string());
        tokio::fs::create_dir_all(&dir)
            .await
            .map_err(|e| transient(format!("creating {}: {}", dir.display(), e)))?;
        let context = BuildContext {
            dir,
            preserve: self.preserve_build_dirs,
        };
        let dir = &context.dir;

        if let Some(body) = &script {
            tokio::fs::write(dir.join("run.sh"), body)
                .await
                .map_err(|e| transient(format!("writing run.sh: {}", e)))?;
        }

        let containerfile = generate_containerfile(request, script.is_some());
        tokio::fs::write(dir.join("Containerfile"), containerfile)
            .await
            .map_err(|e| transient(format!("writing Containerfile: {}", e)))?;
        Ok(context)
    }
}

/// Generated build context; removed when dropped unless preserved,
/// including when a timed-out build future is dropped mid-build
struct BuildContext {
    dir: PathBuf,
    preserve: bool,
}

impl Drop for BuildContext {
    fn drop(&mut self) {
        if self.preserve {
            return;
        }
        if let Err(e) = std::fs::remove_dir_all(&self.dir) {
            if e.kind() != ErrorKind::NotFound {
                warn!("Failed to remove build context {}: {}", self.dir.display(), e);
            }
        }
    }
}

#[async_trait]
impl ImageBuilder for LayerBuilder {
    async fn build(&self, request: &BuildRequest) -> Result<BuiltImage, BuildFailure> {
        let context = self.prepare_context(request).await?;
        debug!(
            "Building {} on {}",
            request.layer.logical_id(),
            request.parent_image.as_deref().unwrap_or("<scratch>")
        );

        let result = self
            .runtime
            .build_image(
                &context.dir,
                &request.image_ref,
                &request.build_args,
                &*self.on_output,
            )
            .await;
        drop(context);

        if let Err(err) = result {
            return Err(BuildFailure {
                kind: classify_failure(&err),
                message: err.to_string(),
            });
        }

        let size_bytes = self.runtime.image_size(&request.image_ref).await.unwrap_or(0);
        Ok(BuiltImage {
            image_ref: request.image_ref.clone(),
            size_bytes,
        })
    }
}

fn transient(message: String) -> BuildFailure {
    BuildFailure {
        kind: BuildFailureKind::Transient,
        message,
    }
}

/// Shell script for a layer, `None` for layers without a RUN step
fn run_script(content: &LayerContent) -> Option<String> {
    let lines: Vec<String> = match content {
        LayerContent::Image { .. } | LayerContent::File { .. } => return None,
        LayerContent::Package { name } => apt_install(std::slice::from_ref(name)),
        LayerContent::Packages { names } => apt_install(names),
        LayerContent::Inline { commands, .. }
        | LayerContent::Stage { commands, .. }
        | LayerContent::Commands { commands, .. } => commands.clone(),
    };
    let mut script = String::from("#!/bin/sh\nset -e\n");
    for line in lines {
        script.push_str(&line);
        script.push('\n');
    }
    Some(script)
}

fn apt_install(packages: &[String]) -> Vec<String> {
    vec![
        "apt-get update".to_string(),
        format!(
            "DEBIAN_FRONTEND=noninteractive apt-get install -y --no-install-recommends {}",
            packages.join(" ")
        ),
        "rm -rf /var/lib/apt/lists/*".to_string(),
    ]
}

/// Per-layer env for ARG lines
fn layer_env(content: &LayerContent) -> Option<&BTreeMap<String, String>> {
    match content {
        LayerContent::Inline { env, .. }
        | LayerContent::File { env, .. }
        | LayerContent::Commands { env, .. } => Some(env),
        _ => None,
    }
}

/// Generate the Containerfile for one layer
fn generate_containerfile(request: &BuildRequest, has_script: bool) -> String {
    let mut lines = Vec::new();

    let from = match (&request.layer.content, &request.parent_image) {
        (_, Some(parent)) => parent.clone(),
        (LayerContent::Image { reference, .. }, None) => reference.clone(),
        (_, None) => "scratch".to_string(),
    };
    lines.push(format!("FROM {}", from));

    // Build args declared so --build-arg values reach RUN; proxies are predefined
    for key in request.build_args.keys() {
        if !is_predefined_arg(key) {
            lines.push(format!("ARG {}", key));
        }
    }
    if let Some(env) = layer_env(&request.layer.content) {
        for (key, value) in env {
            lines.push(format!("ARG {}={}", key, dockerfile_quote(value)));
        }
    }

    if has_script {
        lines.push("USER root".to_string());
        lines.push("COPY run.sh /tmp/imgdeps-run.sh".to_string());
        lines.push("RUN sh /tmp/imgdeps-run.sh && rm -f /tmp/imgdeps-run.sh".to_string());
    }

    let labels: Vec<String> = layer_labels(request)
        .into_iter()
        .map(|(k, v)| format!("{}={}", k, dockerfile_quote(&v)))
        .collect();
    lines.push(format!("LABEL {}", labels.join(" ")));

    let mut out = lines.join("\n");
    out.push('\n');
    out
}

fn is_predefined_arg(key: &str) -> bool {
    matches!(
        key.to_ascii_lowercase().as_str(),
        "http_proxy" | "https_proxy" | "ftp_proxy" | "no_proxy" | "all_proxy"
    )
}

/// Quote a value for use in a Containerfile instruction
fn dockerfile_quote(value: &str) -> String {
    let escaped = value
        .replace('\\', "\\\\")
        .replace('"', "\\\"")
        .replace('$', "\\$")
        .replace('\n', "\\n");
    format!("\"{}\"", escaped)
}
