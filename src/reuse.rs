//! Reuse scoring
//!
//! Picks the tracked chain that best covers the desired layers. Only
//! logical ids are compared; content is checked later by the planner.
//!
//! ```text
//! score = 100 * matched - 50 * missing - 0.01 * extra  (+10000 if nothing is missing)
//! ```

use crate::cache::{IndexState, LayerChain};
use crate::layer::LayerKind;
use serde::Serialize;
use std::cmp::Ordering;
use std::collections::HashSet;

const MATCH_WEIGHT: f64 = 100.0;
const MISSING_PENALTY: f64 = 50.0;
const EXTRA_PENALTY: f64 = 0.01;
const FULL_COVERAGE_BONUS: f64 = 10_000.0;

/// Score of one chain against the desired layers
#[derive(Debug, Clone, Serialize)]
pub struct ChainScore {
    pub tag: String,
    pub matched: usize,
    pub missing: usize,
    pub extra: usize,
    pub score: f64,
    #[serde(skip)]
    updated_at: chrono::DateTime<chrono::Utc>,
}

fn is_config(logical_id: &str) -> bool {
    LayerKind::from_logical_id(logical_id) == Some(LayerKind::Config)
}

/// Raw score for the given overlap counts
pub fn score(matched: usize, missing: usize, extra: usize) -> f64 {
    let mut total = MATCH_WEIGHT * matched as f64
        - MISSING_PENALTY * missing as f64
        - EXTRA_PENALTY * extra as f64;
    if missing == 0 {
        total += FULL_COVERAGE_BONUS;
    }
    total
}

/// Score one chain. Config layers on either side are ignored.
pub fn score_chain(desired: &[String], chain: &LayerChain) -> ChainScore {
    let wanted: HashSet<&str> = desired
        .iter()
        .map(String::as_str)
        .filter(|id| !is_config(id))
        .collect();
    let have: HashSet<&str> = chain
        .logical_ids
        .iter()
        .map(String::as_str)
        .filter(|id| !is_config(id))
        .collect();

    let matched = wanted.intersection(&have).count();
    let missing = wanted.difference(&have).count();
    let extra = have.difference(&wanted).count();
    ChainScore {
        tag: chain.tag.clone(),
        matched,
        missing,
        extra,
        score: score(matched, missing, extra),
        updated_at: chain.updated_at,
    }
}

/// Best first: higher score, fewer extras, most recently updated, smallest tag
fn rank(a: &ChainScore, b: &ChainScore) -> Ordering {
    b.score
        .partial_cmp(&a.score)
        .unwrap_or(Ordering::Equal)
        .then_with(|| a.extra.cmp(&b.extra))
        .then_with(|| b.updated_at.cmp(&a.updated_at))
        .then_with(|| a.tag.cmp(&b.tag))
}

/// Every chain in the snapshot, ranked best first
pub fn rank_chains(snapshot: &IndexState, desired: &[String]) -> Vec<ChainScore> {
    let mut scores: Vec<ChainScore> = snapshot
        .chains()
        .into_iter()
        .map(|chain| score_chain(desired, chain))
        .collect();
    scores.sort_by(rank);
    scores
}

/// The best chain to build from, if any chain shares at least one layer
pub fn select_best<'a>(snapshot: &'a IndexState, desired: &[String]) -> Option<&'a LayerChain> {
    rank_chains(snapshot, desired)
        .into_iter()
        .find(|s| s.matched > 0)
        .and_then(|s| snapshot.chain(&s.tag))
}
