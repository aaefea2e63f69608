//! imgdeps - incremental container image layer builder
//!
//! Builds an image as a chain of single-purpose layers, remembers every
//! built layer in a content-addressed cache index, and on the next build
//! reuses the longest unchanged prefix of the best matching chain.

pub mod cache;
pub mod cli;
pub mod config;
pub mod error;
pub mod hasher;
pub mod journal;
pub mod layer;
pub mod orchestration;
pub mod plan;
pub mod reuse;
pub mod ui;

pub use error::{ImgdepsError, ImgdepsResult};
