//! Desired-state layer model
//!
//! A declaration file is parsed into [`Declaration`], validated and
//! resolved into an ordered list of typed [`LayerSpec`]s plus a stage
//! graph. Nothing in this module touches the cache or the engine.

pub mod declaration;
pub mod resolve;
pub mod spec;
pub mod stage;

pub use declaration::Declaration;
pub use resolve::{resolve, ResolvedDeclaration};
pub use spec::{LayerContent, LayerKind, LayerSpec, ReusePolicy};
pub use stage::StageGraph;
