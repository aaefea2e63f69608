//! Plan command - show what a build would reuse and rebuild

use super::load_declaration;
use crate::cli::args::{OutputFormat, PlanArgs};
use crate::config::{self, Config};
use crate::error::ImgdepsResult;
use crate::hasher::{short, ContentHasher};
use crate::plan::{preview, BuildPlan, PlanStep};
use crate::ui::{self, UiContext};
use console::style;
use serde::Serialize;

#[derive(Serialize)]
struct PlanOutput<'a> {
    up_to_date: bool,
    plan: &'a BuildPlan,
    prewarm: Vec<String>,
}

/// Execute the plan command
pub async fn execute(args: PlanArgs, config: &Config) -> ImgdepsResult<()> {
    let (_, resolved) = load_declaration(&args.declaration, config).await?;
    let hasher = ContentHasher::with_extra(&config.cache.ignore_keys);
    let (plan, up_to_date) = preview(&config::cache_dir(config), &hasher, resolved).await?;

    match args.format {
        OutputFormat::Json => {
            let output = PlanOutput {
                up_to_date,
                prewarm: plan.prewarm_ids(),
                plan: &plan,
            };
            println!("{}", serde_json::to_string_pretty(&output)?);
        }
        OutputFormat::Plain => {
            for step in &plan.steps {
                println!("{} {}", step.action(), step.logical_id());
            }
        }
        OutputFormat::Table => print_table(&plan, up_to_date),
    }
    Ok(())
}

fn print_table(plan: &BuildPlan, up_to_date: bool) {
    let ctx = UiContext::detect();
    ui::intro(&ctx, &format!("Plan for {}", plan.target));

    if up_to_date {
        ui::step_ok(&ctx, "Checksum matches the last build; `build` will skip");
    }

    if !plan.scores.is_empty() {
        ui::section(&ctx, "Candidate chains");
        println!(
            "  {:<30} {:>7} {:>7} {:>5} {:>10}",
            style("TAG").bold(),
            style("MATCHED").bold(),
            style("MISSING").bold(),
            style("EXTRA").bold(),
            style("SCORE").bold()
        );
        for score in &plan.scores {
            let marker = if plan.base_chain.as_deref() == Some(score.tag.as_str()) {
                "*"
            } else {
                " "
            };
            println!(
                "{} {:<30} {:>7} {:>7} {:>5} {:>10.2}",
                marker, score.tag, score.matched, score.missing, score.extra, score.score
            );
        }
    }

    ui::section(&ctx, "Steps");
    for step in &plan.steps {
        let detail = match step {
            PlanStep::Reuse { node_id, .. } | PlanStep::Retain { node_id, .. } => {
                Some(short(node_id).to_string())
            }
            PlanStep::Build { .. } => None,
        };
        ui::layer_step(&ctx, step.action(), step.logical_id(), detail.as_deref());
    }
    for logical_id in plan.prewarm_ids() {
        ui::layer_step(&ctx, "prewarm", &logical_id, Some("sibling"));
    }

    if !plan.stages.shifted.is_empty() {
        let shifted: Vec<&str> = plan.stages.shifted.iter().map(String::as_str).collect();
        ui::remark(&ctx, &format!("Stages moved last: {}", shifted.join(", ")));
    }

    println!();
    println!(
        "{} reused, {} retained, {} to build",
        plan.reuse_count(),
        plan.retain_count(),
        plan.build_count()
    );
}
