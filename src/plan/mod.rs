//! Build planning and execution
//!
//! [`planner`] decides reuse versus build for each layer against a cache
//! snapshot, [`executor`] carries the plan out under the cache lock, and
//! [`history`] remembers stage hashes between builds.

pub mod executor;
pub mod history;
pub mod planner;

pub use executor::{
    build_args, build_with_retry, evict_stale, preview, BuildOptions, BuildReport, ExecEvent,
    Executor, RetryPolicy,
};
pub use history::{BuildHistory, BuildRecord, TagHistory};
pub use planner::{apply_stage_shift, plan, BuildPlan, PlanOptions, PlanStep, StageShift};
