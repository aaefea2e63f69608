//! Build command - build an image from a declaration

use super::load_declaration;
use crate::cache::TieredCache;
use crate::cli::args::BuildArgs;
use crate::config::{Config, ConfigManager};
use crate::error::ImgdepsResult;
use crate::orchestration::{create_runtime, LayerBuilder};
use crate::plan::{self, BuildOptions, BuildReport, Executor};
use crate::ui::{self, BuildProgress, UiContext};
use std::sync::Arc;

/// Execute the build command
pub async fn execute(args: BuildArgs, config: &Config) -> ImgdepsResult<()> {
    let ctx = UiContext::detect().with_machine_output(args.json);
    let (decl, resolved) = load_declaration(&args.declaration, config).await?;

    let mut build_args = plan::build_args(&decl.env, decl.inherit_proxy);
    build_args.extend(args.build_args);

    let runtime = create_runtime(config).await?;
    ui::intro(&ctx, &format!("Build {}", resolved.target));

    let progress = Arc::new(BuildProgress::new(&ctx, &resolved.target));
    let lines = Arc::clone(&progress);
    let builder = LayerBuilder::new(Arc::clone(&runtime), ConfigManager::builds_dir())
        .preserve_build_dirs(config.engine.preserve_build_dirs)
        .with_output(Arc::new(move |line| lines.on_line(line)));
    let events = Arc::clone(&progress);
    let cache = TieredCache::from_config(config, Arc::clone(&runtime));
    let executor = Executor::new(config, Arc::new(builder), runtime, cache)
        .with_events(Arc::new(move |event| events.on_event(&event)));

    let options = BuildOptions {
        force: args.force,
        break_lock: args.break_lock,
    };
    let outcome = executor.run(resolved, build_args, &options).await;
    progress.finish();
    let report = outcome?;

    if args.json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        print_summary(&ctx, &report);
    }
    Ok(())
}

fn print_summary(ctx: &UiContext, report: &BuildReport) {
    if report.recovered_index {
        ui::step_warn_hint(
            ctx,
            "Cache index was unreadable and started empty",
            "the old file was kept next to it",
        );
    }
    if report.fast_skipped {
        ui::outro_success(ctx, &format!("{} is up to date", report.target));
        return;
    }

    ui::key_value(ctx, "reused", &report.reused.to_string());
    ui::key_value(ctx, "built", &report.built.to_string());
    if report.retained > 0 {
        ui::key_value(ctx, "retained", &report.retained.to_string());
    }
    if report.config_rebuilt > 0 {
        ui::key_value(ctx, "config", &report.config_rebuilt.to_string());
    }
    if report.prewarmed > 0 {
        ui::key_value(ctx, "pre-warmed", &report.prewarmed.to_string());
    }
    if report.promoted > 0 {
        ui::key_value(ctx, "promoted", &report.promoted.to_string());
    }
    if report.evicted > 0 {
        ui::key_value(ctx, "evicted", &report.evicted.to_string());
    }
    ui::outro_success(ctx, &format!("Built {}", report.target));
}
