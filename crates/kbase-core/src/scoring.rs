//! Fetch breadth, distance-to-score conversion, and candidate merging.
//!
//! # Fetch breadth
//!
//! Retrieving only `k` neighbours under-recalls once a source filter or a
//! large corpus is involved, so the engine first retrieves `fetch_k`
//! candidates and ranks down to `k`:
//!
//! ```text
//! global:  fetch_k = max(k × global_multiplier,
//!                        clamp(⌊rows × global_ratio⌋, min_fetch_k, max_fetch_k))
//! scoped:  fetch_k = max(k × filtered_multiplier, min_fetch_k)
//! ```
//!
//! Both are additionally floored at `10 × k`.
//!
//! # Scoring
//!
//! `score = clamp01(1 / (1 + d))`: 1 at `d = 0`, strictly decreasing,
//! asymptotic to 0.

use std::collections::HashMap;

use crate::models::Neighbor;

/// Lower bound on fetch breadth relative to `k`.
pub const MIN_BREADTH_FACTOR: usize = 10;

/// Fetch-breadth tuning, decoupled from application config.
#[derive(Debug, Clone)]
pub struct FetchParams {
    pub global_multiplier: usize,
    pub global_ratio: f64,
    pub min_fetch_k: usize,
    pub max_fetch_k: usize,
    pub filtered_multiplier: usize,
}

impl Default for FetchParams {
    fn default() -> Self {
        Self {
            global_multiplier: 10,
            global_ratio: 0.05,
            min_fetch_k: 50,
            max_fetch_k: 400,
            filtered_multiplier: 20,
        }
    }
}

/// Number of nearest neighbours to retrieve before filtering and ranking.
pub fn fetch_k(k: usize, total_rows: usize, scoped: bool, params: &FetchParams) -> usize {
    let k = k.max(1);
    let breadth = if scoped {
        k.saturating_mul(params.filtered_multiplier)
            .max(params.min_fetch_k)
    } else {
        let proportional = (total_rows as f64 * params.global_ratio).floor() as usize;
        let upper = params.max_fetch_k.max(params.min_fetch_k);
        let bounded = proportional.clamp(params.min_fetch_k, upper);
        k.saturating_mul(params.global_multiplier).max(bounded)
    };
    breadth.max(k.saturating_mul(MIN_BREADTH_FACTOR))
}

/// Convert a distance to a similarity in `[0, 1]`.
pub fn distance_to_score(distance: f32) -> f64 {
    let d = distance as f64;
    if d.is_nan() {
        return 0.0;
    }
    (1.0 / (1.0 + d.max(0.0))).clamp(0.0, 1.0)
}

/// Pseudo-score for the `index`-th of `total` rank-ordered results.
pub fn rank_score(index: usize, total: usize) -> f64 {
    if total == 0 {
        return 0.0;
    }
    (1.0 - index as f64 / total as f64).clamp(0.0, 1.0)
}

/// Union per-variant results, keeping the lowest-distance occurrence of each
/// exact chunk text, sorted by ascending distance and truncated to `limit`.
pub fn merge_variants(results: Vec<Vec<Neighbor>>, limit: usize) -> Vec<Neighbor> {
    let mut best: HashMap<String, Neighbor> = HashMap::new();
    for n in results.into_iter().flatten() {
        match best.get(&n.row.text) {
            Some(existing) if existing.distance <= n.distance => {}
            _ => {
                best.insert(n.row.text.clone(), n);
            }
        }
    }
    let mut merged: Vec<Neighbor> = best.into_values().collect();
    merged.sort_by(|a, b| {
        a.distance
            .partial_cmp(&b.distance)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then(a.row.row_id.cmp(&b.row.row_id))
    });
    merged.truncate(limit);
    merged
}
