//! Progress indicators with CI fallback

use super::context::UiContext;
use super::output::layer_step;
use crate::plan::ExecEvent;
use console::style;
use indicatif::{ProgressBar, ProgressStyle};

/// A task spinner with CI fallback
pub struct TaskSpinner {
    spinner: Option<cliclack::ProgressBar>,
    interactive: bool,
    machine: bool,
}

impl TaskSpinner {
    pub fn new(ctx: &UiContext) -> Self {
        Self {
            spinner: None,
            interactive: ctx.use_fancy_output(),
            machine: ctx.is_machine(),
        }
    }

    pub fn start(&mut self, message: &str) {
        if self.interactive {
            let spinner = cliclack::spinner();
            spinner.start(message);
            self.spinner = Some(spinner);
        } else if !self.machine {
            println!("{} {}", style("...").dim(), message);
        }
    }

    pub fn stop(&mut self, message: &str) {
        if let Some(spinner) = self.spinner.take() {
            spinner.stop(message);
        } else if !self.machine {
            println!("{} {}", style("[OK]").green(), message);
        }
    }

    pub fn stop_error(&mut self, message: &str) {
        if let Some(spinner) = self.spinner.take() {
            spinner.error(message);
        } else if !self.machine {
            println!("{} {}", style("[FAIL]").red(), message);
        }
    }
}

/// Progress of one chain build.
///
/// Advances on executor events. In interactive mode an indicatif bar
/// shows the layer being built and the engine's current `STEP N/M` line;
/// otherwise each layer is printed once as it resolves.
pub struct BuildProgress {
    bar: Option<ProgressBar>,
    ctx: UiContext,
}

impl BuildProgress {
    pub fn new(ctx: &UiContext, target: &str) -> Self {
        let bar = if ctx.use_fancy_output() {
            let bar = ProgressBar::new(0);
            if let Ok(template) = ProgressStyle::default_bar().template(
                "  {spinner:.blue} {prefix}  {bar:20.blue/dim} {pos}/{len} \
                 {msg:.dim}  {elapsed:.dim}",
            ) {
                bar.set_style(template.tick_chars("⠋⠙⠹⠸⠼⠴⠦⠧⠇⠏ ").progress_chars("━╸─"));
            }
            bar.set_prefix(target.to_string());
            bar.enable_steady_tick(std::time::Duration::from_millis(120));
            Some(bar)
        } else {
            None
        };
        Self {
            bar,
            ctx: ctx.clone(),
        }
    }

    pub fn on_event(&self, event: &ExecEvent) {
        match event {
            ExecEvent::Planned {
                reuse,
                build,
                prewarm,
            } => {
                if let Some(bar) = &self.bar {
                    bar.set_length((reuse + build) as u64);
                } else {
                    layer_step(
                        &self.ctx,
                        "plan",
                        &format!("{} reuse, {} build, {} pre-warm", reuse, build, prewarm),
                        None,
                    );
                }
            }
            ExecEvent::Reused { logical_id, tier } => {
                self.advance("reuse", logical_id, Some(&tier.to_string()))
            }
            ExecEvent::Retained { logical_id } => self.advance("retain", logical_id, None),
            ExecEvent::Built { logical_id } => self.advance("build", logical_id, None),
            ExecEvent::Building { logical_id } => {
                if let Some(bar) = &self.bar {
                    bar.set_message(format!("building {}", logical_id));
                }
            }
            ExecEvent::Prewarmed { logical_id } => self.note("prewarm", logical_id),
            ExecEvent::Dropped { logical_id } => self.note("drop", logical_id),
        }
    }

    /// Engine output line; only `STEP N/M:` lines are shown
    pub fn on_line(&self, line: String) {
        if let (Some(bar), Some((n, total, instruction))) = (&self.bar, parse_step_line(&line)) {
            bar.set_message(format!("{}/{} {}", n, total, truncate(instruction, 50)));
        }
    }

    pub fn finish(&self) {
        if let Some(bar) = &self.bar {
            bar.disable_steady_tick();
            bar.finish_and_clear();
        }
    }

    fn advance(&self, action: &str, logical_id: &str, detail: Option<&str>) {
        match &self.bar {
            Some(bar) => {
                bar.inc(1);
                bar.println(format!("  {:<8} {}", action, logical_id));
            }
            None => layer_step(&self.ctx, action, logical_id, detail),
        }
    }

    fn note(&self, action: &str, logical_id: &str) {
        match &self.bar {
            Some(bar) => bar.println(format!("  {:<8} {}", action, logical_id)),
            None => layer_step(&self.ctx, action, logical_id, None),
        }
    }
}

fn truncate(s: &str, max: usize) -> String {
    if s.chars().count() > max {
        let cut: String = s.chars().take(max.saturating_sub(3)).collect();
        format!("{}...", cut)
    } else {
        s.to_string()
    }
}

/// Parse an engine build step line: `STEP N/M: INSTRUCTION args...`
fn parse_step_line(line: &str) -> Option<(u64, u64, &str)> {
    let rest = line.strip_prefix("STEP ")?;
    let slash = rest.find('/')?;
    let colon = rest.find(':')?;
    if colon <= slash {
        return None;
    }
    let n: u64 = rest[..slash].parse().ok()?;
    let total: u64 = rest[slash + 1..colon].parse().ok()?;
    Some((n, total, rest[colon + 1..].trim()))
}
