//! Terminal output for the CLI
//!
//! Uses `cliclack` for framing and prompts and `indicatif` for the build
//! progress bar, with plain `[OK]`/`[WARN]` lines in CI and nothing but
//! the JSON document in machine mode.
//!
//! ```rust,ignore
//! use imgdeps::ui::{self, UiContext, BuildProgress};
//!
//! let ctx = UiContext::detect();
//! ui::intro(&ctx, "Build app:latest");
//! let progress = BuildProgress::new(&ctx, "app:latest");
//! // executor.with_events(...) forwards ExecEvents to progress.on_event
//! progress.finish();
//! ui::outro_success(&ctx, "Built 2 layers, reused 5");
//! ```

mod context;
mod output;
mod progress;
mod prompts;
mod theme;

pub use context::UiContext;
pub use output::{
    format_size, intro, key_value, layer_step, outro_success, outro_warn, remark, section,
    step_info, step_ok, step_ok_detail, step_warn, step_warn_hint,
};
pub use progress::{BuildProgress, TaskSpinner};
pub use prompts::confirm;
pub use theme::{init_theme, ImgdepsTheme};
