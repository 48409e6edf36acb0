//! Gather phase: combine per-shard results into one ranked response.

use std::cmp::Ordering;
use std::collections::{BTreeMap, HashMap};
use std::time::Duration;

use shardwise_common::search::{
    Hit, MergeWarning, MergedResult, ShardResult, TermBucket, TotalHits, TotalHitsRelation,
};
use shardwise_common::types::ShardId;
use shardwise_planner::plan::QueryPlan;

/// BM25 inverse document frequency.
pub fn bm25_idf(doc_count: u64, doc_freq: u64) -> f64 {
    let n = doc_count as f64;
    let df = doc_freq.min(doc_count) as f64;
    (1.0 + (n - df + 0.5) / (df + 0.5)).ln()
}

/// Score order: descending, NaN last, then id and index ascending.
pub fn compare_hits(a: &Hit, b: &Hit) -> Ordering {
    let by_score = match (a.score.is_nan(), b.score.is_nan()) {
        (true, true) => Ordering::Equal,
        (true, false) => Ordering::Greater,
        (false, true) => Ordering::Less,
        (false, false) => b.score.partial_cmp(&a.score).unwrap_or(Ordering::Equal),
    };
    by_score
        .then_with(|| a.id.cmp(&b.id))
        .then_with(|| a.index.cmp(&b.index))
}

/// Stateless merger. Output depends only on the plan and the results.
#[derive(Debug, Clone, Copy, Default)]
pub struct ResultMerger;

impl ResultMerger {
    pub fn merge(plan: &QueryPlan, results: &[ShardResult], took: Duration) -> MergedResult {
        let ok: Vec<&ShardResult> = results.iter().filter(|r| r.is_ok()).collect();
        let failed_shards: Vec<ShardId> = results
            .iter()
            .filter(|r| !r.is_ok())
            .map(|r| r.shard_id)
            .collect();
        let mut warnings = Vec::new();
        if plan.safety_override {
            warnings.push(MergeWarning::SafetyOverride);
        }
        if !failed_shards.is_empty() {
            warnings.push(MergeWarning::PartialResult {
                shards_queried: results.len(),
                shards_failed: failed_shards.len(),
                failed_shards: failed_shards.clone(),
            });
        }

        let factors = normalization_factors(&ok);
        let contributing = ok.iter().filter(|r| !r.hits.is_empty()).count();
        if factors.is_none() && contributing > 1 {
            warnings.push(MergeWarning::ScoresNotNormalized);
        }

        // Dedup by (index, id), keeping the highest score.
        let mut merged: Vec<Hit> = Vec::new();
        let mut seen: HashMap<(String, String), usize> = HashMap::new();
        let mut duplicates = 0usize;
        for (pos, shard) in ok.iter().enumerate() {
            let factor = factors.as_ref().map_or(1.0, |f| f[pos]);
            for hit in &shard.hits {
                let mut hit = hit.clone();
                hit.score *= factor;
                match seen.get(&(hit.index.clone(), hit.id.clone())) {
                    Some(&existing) => {
                        duplicates += 1;
                        if compare_hits(&hit, &merged[existing]) == Ordering::Less {
                            merged[existing] = hit;
                        }
                    }
                    None => {
                        seen.insert((hit.index.clone(), hit.id.clone()), merged.len());
                        merged.push(hit);
                    }
                }
            }
        }
        if duplicates > 0 {
            tracing::warn!(index = %plan.index, duplicates, "duplicate hits across shards removed");
            warnings.push(MergeWarning::DuplicateHitsRemoved { count: duplicates });
        }

        merged.sort_by(compare_hits);
        let hits: Vec<Hit> = merged.into_iter().skip(plan.from).take(plan.size).collect();

        let total = ok.iter().map(|r| r.total_hits).sum();
        let total_hits = TotalHits {
            value: total,
            relation: if failed_shards.is_empty() {
                TotalHitsRelation::Exact
            } else {
                TotalHitsRelation::LowerBound
            },
        };

        let buckets = match &plan.terms_agg {
            Some(agg) => merge_buckets(&ok, agg.size),
            None => Vec::new(),
        };

        tracing::debug!(
            index = %plan.index,
            hits = hits.len(),
            total_hits = total,
            shards = results.len(),
            failed = failed_shards.len(),
            normalized = factors.is_some(),
            "results merged"
        );

        MergedResult {
            hits,
            total_hits,
            buckets,
            shards_queried: results.len(),
            shards_failed: failed_shards.len(),
            failed_shards,
            warnings,
            took,
        }
    }
}

/// Per-shard score multipliers `idf(global) / idf(local)`, or `None` when
/// some successful shard did not report term statistics.
fn normalization_factors(ok: &[&ShardResult]) -> Option<Vec<f64>> {
    if ok.len() < 2 {
        return None;
    }
    let stats: Vec<_> = ok.iter().map(|r| r.term_stats).collect::<Option<Vec<_>>>()?;
    let global_docs: u64 = stats.iter().map(|s| s.doc_count).sum();
    let global_freq: u64 = stats.iter().map(|s| s.doc_freq).sum();
    let global_idf = bm25_idf(global_docs, global_freq);
    Some(
        stats
            .iter()
            .map(|s| {
                let local_idf = bm25_idf(s.doc_count, s.doc_freq);
                if local_idf > 0.0 && local_idf.is_finite() {
                    global_idf / local_idf
                } else {
                    1.0
                }
            })
            .collect(),
    )
}

fn merge_buckets(ok: &[&ShardResult], size: usize) -> Vec<TermBucket> {
    let mut counts: BTreeMap<&str, u64> = BTreeMap::new();
    for r in ok {
        for b in &r.buckets {
            *counts.entry(b.key.as_str()).or_insert(0) += b.doc_count;
        }
    }
    let mut buckets: Vec<TermBucket> = counts
        .into_iter()
        .map(|(key, doc_count)| TermBucket {
            key: key.to_string(),
            doc_count,
        })
        .collect();
    buckets.sort_by(|a, b| b.doc_count.cmp(&a.doc_count).then_with(|| a.key.cmp(&b.key)));
    buckets.truncate(size);
    buckets
}
