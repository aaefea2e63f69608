//! Build declaration file format
//!
//! A declaration describes one output image: a base, package installs,
//! scripts, stages and configuration edits. It is read from YAML or JSON
//! (by extension) and every struct denies unknown fields, so a misspelled
//! or unsupported layer category fails at the parse boundary.

use crate::error::{ImgdepsError, ImgdepsResult};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

/// Root of a declaration file
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Declaration {
    /// Output image repository name
    pub image_name: String,

    /// Output image tag
    #[serde(default = "default_tag")]
    pub image_tag: String,

    /// Layer lists per category
    pub layers: LayerDeclarations,

    /// Layer budget and parallelism
    #[serde(default)]
    pub optimization: Optimization,

    /// Named stages with explicit dependencies
    #[serde(default)]
    pub stages: Vec<StageDeclaration>,

    /// Environment passed to every RUN step (build args, not hashed when ignore-listed)
    #[serde(default)]
    pub env: BTreeMap<String, String>,

    /// Forward the invoking shell's proxy variables into builds
    #[serde(default = "default_true")]
    pub inherit_proxy: bool,
}

fn default_tag() -> String {
    "latest".to_string()
}

fn default_true() -> bool {
    true
}

/// Per-category layer lists
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LayerDeclarations {
    /// Base image reference, e.g. `ubuntu:22.04`
    pub base: Option<String>,

    /// One layer per package, in declared order
    #[serde(default)]
    pub apt: Vec<String>,

    /// One layer per batch of packages
    #[serde(default)]
    pub apt_batch: Vec<AptBatchDeclaration>,

    /// Script layers
    #[serde(default)]
    pub scripts: Vec<ScriptDeclaration>,

    /// Configuration layers, always rebuilt on top of the chain
    #[serde(default)]
    pub config: Vec<ConfigDeclaration>,
}

/// A group of packages installed in a single layer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AptBatchDeclaration {
    /// Explicit batch name; synthesized from members when absent
    pub name: Option<String>,
    pub packages: Vec<String>,
}

/// A script layer: inline commands or a file, never both
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ScriptDeclaration {
    pub name: String,
    pub commands: Option<Vec<String>>,
    pub file: Option<PathBuf>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
}

/// A configuration edit layer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ConfigDeclaration {
    pub name: String,
    pub commands: Vec<String>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
}

/// A named stage
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StageDeclaration {
    pub name: String,
    #[serde(default)]
    pub dependencies: Vec<String>,
    #[serde(default)]
    pub commands: Vec<String>,
}

/// Layer budget and parallelism
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Optimization {
    /// Maximum number of layers in the output chain
    pub max_layers: usize,

    /// Packages per synthetic batch when folding to fit `max_layers`
    pub batch_size: usize,

    /// Concurrent pre-warm builds
    pub parallel: usize,

    /// Days after which unreferenced layers may be evicted
    pub cleanup_age: u32,
}

impl Default for Optimization {
    fn default() -> Self {
        Self {
            max_layers: 100,
            batch_size: 5,
            parallel: 4,
            cleanup_age: 30,
        }
    }
}

impl Declaration {
    /// Output tag, `image_name:image_tag`
    pub fn target(&self) -> String {
        format!("{}:{}", self.image_name, self.image_tag)
    }

    /// Parse from a string, YAML unless `json` is set
    pub fn parse(content: &str, json: bool) -> ImgdepsResult<Self> {
        if json {
            serde_json::from_str(content).map_err(|e| ImgdepsError::validation(e.to_string()))
        } else {
            serde_yaml::from_str(content).map_err(|e| ImgdepsError::validation(e.to_string()))
        }
    }

    /// Load a declaration file; `.json` is JSON, anything else YAML
    pub async fn load(path: &Path) -> ImgdepsResult<Self> {
        if !path.exists() {
            return Err(ImgdepsError::DeclarationNotFound(path.to_path_buf()));
        }
        let content = tokio::fs::read_to_string(path)
            .await
            .map_err(|e| ImgdepsError::io(format!("reading {}", path.display()), e))?;
        let json = path
            .extension()
            .is_some_and(|ext| ext.eq_ignore_ascii_case("json"));
        Self::parse(&content, json)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
image_name: devbox
image_tag: "1.0"
layers:
  base: ubuntu:22.04
  apt: [curl, git]
  apt_batch:
    - packages: [vim, less]
  scripts:
    - name: rustup
      commands: ["curl -sSf https://sh.rustup.rs | sh -s -- -y"]
  config:
    - name: motd
      commands: ["echo hi > /etc/motd"]
optimization:
  parallel: 2
stages:
  - name: toolchain
    commands: ["make toolchain"]
  - name: app
    dependencies: [toolchain]
    commands: ["make app"]
"#;

    #[test]
    fn parses_yaml() {
        let decl = Declaration::parse(SAMPLE, false).unwrap();
        assert_eq!(decl.target(), "devbox:1.0");
        assert_eq!(decl.layers.base.as_deref(), Some("ubuntu:22.04"));
        assert_eq!(decl.layers.apt, vec!["curl", "git"]);
        assert_eq!(decl.layers.apt_batch[0].packages, vec!["vim", "less"]);
        assert_eq!(decl.optimization.parallel, 2);
        assert_eq!(decl.optimization.batch_size, 5);
        assert_eq!(decl.stages[1].dependencies, vec!["toolchain"]);
        assert!(decl.inherit_proxy);
    }

    #[test]
    fn parses_json() {
        let json = r#"{"image_name": "x", "layers": {"base": "alpine:3", "apt": ["curl"]}}"#;
        let decl = Declaration::parse(json, true).unwrap();
        assert_eq!(decl.image_tag, "latest");
        assert_eq!(decl.layers.apt, vec!["curl"]);
    }

    #[test]
    fn unknown_layer_category_is_rejected() {
        let yaml = "image_name: x\nlayers:\n  base: alpine:3\n  yum: [curl]\n";
        let err = Declaration::parse(yaml, false).unwrap_err();
        assert!(matches!(err, ImgdepsError::ConfigValidation(_)));
        assert!(err.to_string().contains("yum"));
    }

    #[tokio::test]
    async fn load_missing_file() {
        let err = Declaration::load(Path::new("/nonexistent/imgdeps.yaml"))
            .await
            .unwrap_err();
        assert!(matches!(err, ImgdepsError::DeclarationNotFound(_)));
    }
}
