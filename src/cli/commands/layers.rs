//! Layers command - show the cached layer tree

use super::read_index;
use crate::cache::{IndexState, LayerNode, NodeStatus};
use crate::cli::args::{LayersArgs, OutputFormat};
use crate::config::Config;
use crate::error::{ImgdepsError, ImgdepsResult};
use crate::hasher::short;
use crate::ui::{self, UiContext};
use console::style;
use std::collections::{BTreeMap, HashSet};

/// Execute the layers command
pub async fn execute(args: LayersArgs, config: &Config) -> ImgdepsResult<()> {
    let index = read_index(config).await?;
    let state = index.state();

    let visible: Option<HashSet<String>> = match &args.tag {
        Some(tag) => {
            let chain = state
                .chain(tag)
                .ok_or_else(|| ImgdepsError::ChainNotFound(tag.clone()))?;
            Some(chain.nodes.iter().cloned().collect())
        }
        None => None,
    };
    let shown = |node: &LayerNode| visible.as_ref().is_none_or(|v| v.contains(&node.id));

    match args.format {
        OutputFormat::Json => {
            let nodes: Vec<&LayerNode> = state.layers.values().filter(|&n| shown(n)).collect();
            let chains: Vec<_> = state
                .chains()
                .into_iter()
                .filter(|c| args.tag.as_ref().is_none_or(|t| t == &c.tag))
                .collect();
            let doc = serde_json::json!({ "layers": nodes, "layer_chains": chains });
            println!("{}", serde_json::to_string_pretty(&doc)?);
        }
        OutputFormat::Plain => {
            for node in state.layers.values().filter(|&n| shown(n)) {
                println!("{} {}", short(&node.id), node.logical_id);
            }
        }
        OutputFormat::Table => {
            let ctx = UiContext::detect();
            ui::intro(&ctx, "Cached layers");
            if state.layers.is_empty() {
                ui::step_info(&ctx, "The cache is empty");
                return Ok(());
            }
            let tips = tip_tags(state);
            for line in render_tree(state, &shown, &tips) {
                println!("{}", line);
            }
            println!();
            println!(
                "{} layer(s), {} tracked chain(s)",
                state.layers.len(),
                state.layer_chains.len()
            );
        }
    }
    Ok(())
}

/// node id -> tags whose chain ends there
fn tip_tags(state: &IndexState) -> BTreeMap<String, Vec<String>> {
    let mut tips: BTreeMap<String, Vec<String>> = BTreeMap::new();
    for chain in state.chains() {
        if let Some(tip) = chain.tip() {
            tips.entry(tip.to_string()).or_default().push(chain.tag.clone());
        }
    }
    tips
}

/// Indented parent/child tree, roots and siblings sorted by logical id
fn render_tree(
    state: &IndexState,
    shown: &dyn Fn(&LayerNode) -> bool,
    tips: &BTreeMap<String, Vec<String>>,
) -> Vec<String> {
    let mut roots: Vec<&LayerNode> = state
        .layers
        .values()
        .filter(|&n| n.parent.is_none() && shown(n))
        .collect();
    roots.sort_by(|a, b| a.logical_id.cmp(&b.logical_id));

    let mut lines = Vec::new();
    for root in roots {
        walk(state, root, 0, shown, tips, &mut lines);
    }
    lines
}

fn walk(
    state: &IndexState,
    node: &LayerNode,
    depth: usize,
    shown: &dyn Fn(&LayerNode) -> bool,
    tips: &BTreeMap<String, Vec<String>>,
    lines: &mut Vec<String>,
) {
    let status = match node.status {
        NodeStatus::Active => style("active").green(),
        NodeStatus::Stale => style("stale").yellow(),
        NodeStatus::Evicted => style("evicted").dim(),
    };
    let tags = tips
        .get(&node.id)
        .map(|t| format!(" {}", style(format!("<- {}", t.join(", "))).cyan()))
        .unwrap_or_default();
    let branch = match depth {
        0 => String::new(),
        d => format!("{}└─ ", "   ".repeat(d - 1)),
    };
    lines.push(format!(
        "{}{} {} {} {} {}{}",
        branch,
        node.logical_id,
        style(short(&node.id)).dim(),
        ui::format_size(node.size_bytes),
        node.last_used.format("%Y-%m-%d"),
        status,
        tags
    ));

    let mut children: Vec<&LayerNode> = state
        .children(&node.id)
        .into_iter()
        .filter(|&n| shown(n))
        .collect();
    children.sort_by(|a, b| a.logical_id.cmp(&b.logical_id));
    for child in children {
        walk(state, child, depth + 1, shown, tips, lines);
    }
}
