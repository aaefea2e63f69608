//! Typed layer specifications
//!
//! A `LayerSpec` is one desired layer: its kind, declared name, content
//! and the content hash. Reuse behaviour per kind is a lookup in
//! [`ReusePolicy::for_kind`] rather than branching at call sites.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;

/// Layer category
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LayerKind {
    Base,
    Apt,
    AptBatch,
    Script,
    Config,
}

impl LayerKind {
    /// Prefix used in logical ids
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Base => "base",
            Self::Apt => "apt",
            Self::AptBatch => "apt_batch",
            Self::Script => "script",
            Self::Config => "config",
        }
    }

    /// Parse the kind prefix of a logical id
    pub fn from_logical_id(logical_id: &str) -> Option<Self> {
        let prefix = logical_id.split_once(':')?.0;
        match prefix {
            "base" => Some(Self::Base),
            "apt" => Some(Self::Apt),
            "apt_batch" => Some(Self::AptBatch),
            "script" => Some(Self::Script),
            "config" => Some(Self::Config),
            _ => None,
        }
    }

    /// Reuse policy for this kind
    pub fn policy(&self) -> ReusePolicy {
        ReusePolicy::for_kind(*self)
    }
}

impl fmt::Display for LayerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How the planner treats a kind of layer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReusePolicy {
    /// Counted by the reuse scorer
    pub scored: bool,
    /// A cached node is reused only if its content hash matches.
    /// Scripts are opaque by name and skip this check.
    pub match_content: bool,
    /// Never reused, rebuilt on every run
    pub always_rebuild: bool,
    /// May be built early as an independent sibling to warm the cache
    pub prewarm: bool,
}

const POLICIES: [(LayerKind, ReusePolicy); 5] = [
    (
        LayerKind::Base,
        ReusePolicy {
            scored: true,
            match_content: true,
            always_rebuild: false,
            prewarm: false,
        },
    ),
    (
        LayerKind::Apt,
        ReusePolicy {
            scored: true,
            match_content: true,
            always_rebuild: false,
            prewarm: true,
        },
    ),
    (
        LayerKind::AptBatch,
        ReusePolicy {
            scored: true,
            match_content: true,
            always_rebuild: false,
            prewarm: true,
        },
    ),
    (
        LayerKind::Script,
        ReusePolicy {
            scored: true,
            match_content: false,
            always_rebuild: false,
            prewarm: false,
        },
    ),
    (
        LayerKind::Config,
        ReusePolicy {
            scored: false,
            match_content: false,
            always_rebuild: true,
            prewarm: false,
        },
    ),
];

impl ReusePolicy {
    pub fn for_kind(kind: LayerKind) -> Self {
        POLICIES
            .iter()
            .find(|(k, _)| *k == kind)
            .map(|(_, policy)| *policy)
            .unwrap_or(POLICIES[4].1)
    }
}

/// Kind-specific layer content. This is what gets hashed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum LayerContent {
    /// Base image plus the declaration-wide environment
    Image {
        reference: String,
        env: BTreeMap<String, String>,
    },
    /// A single package
    Package { name: String },
    /// A batch of packages, sorted
    Packages { names: Vec<String> },
    /// Inline script commands
    Inline {
        commands: Vec<String>,
        env: BTreeMap<String, String>,
    },
    /// Script file copied into the build context
    File {
        path: PathBuf,
        env: BTreeMap<String, String>,
    },
    /// A stage's commands and declared dependencies
    Stage {
        commands: Vec<String>,
        dependencies: Vec<String>,
    },
    /// Configuration commands
    Commands {
        commands: Vec<String>,
        env: BTreeMap<String, String>,
    },
}

/// One desired layer
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LayerSpec {
    pub kind: LayerKind,
    pub name: String,
    pub content: LayerContent,
    /// Position in the resolved order
    pub declared_order: usize,
    /// Full digest of the canonicalized content
    pub content_hash: String,
}

impl LayerSpec {
    /// Stable identity, `{kind}:{name}`
    pub fn logical_id(&self) -> String {
        format!("{}:{}", self.kind, self.name)
    }

    pub fn policy(&self) -> ReusePolicy {
        self.kind.policy()
    }

    /// Stage name for stage layers
    pub fn stage_name(&self) -> Option<&str> {
        match self.content {
            LayerContent::Stage { .. } => self.name.strip_prefix(STAGE_PREFIX),
            _ => None,
        }
    }
}

/// Stage layers are script layers named `stage.<name>`
pub const STAGE_PREFIX: &str = "stage.";
