use std::collections::HashMap;

/// Fuse ranked `(id, score)` lists with Reciprocal Rank Fusion.
///
/// Each id at 0-based rank `r` in a list contributes `1 / (k + r + 1)` to
/// its accumulator. The output is accumulator-descending, truncated to
/// `top_n`. Ties break by insertion order: the id seen earliest (first list,
/// then second, ...) wins.
pub fn reciprocal_rank_fusion(
    results_lists: &[Vec<(i64, f32)>],
    k: usize,
    top_n: usize,
) -> Vec<(i64, f32)> {
    let mut accumulator: HashMap<i64, f32> = HashMap::new();
    let mut first_seen: HashMap<i64, usize> = HashMap::new();
    let mut order: Vec<i64> = Vec::new();

    for ranked_list in results_lists {
        for (rank, &(doc_id, _score)) in ranked_list.iter().enumerate() {
            *accumulator.entry(doc_id).or_insert(0.0) += 1.0 / (k + rank + 1) as f32;
            first_seen.entry(doc_id).or_insert_with(|| {
                order.push(doc_id);
                order.len() - 1
            });
        }
    }

    let mut fused: Vec<(i64, f32)> = order
        .into_iter()
        .map(|doc_id| (doc_id, accumulator[&doc_id]))
        .collect();
    fused.sort_by(|a, b| {
        b.1.partial_cmp(&a.1)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then(first_seen[&a.0].cmp(&first_seen[&b.0]))
    });
    fused.truncate(top_n);
    fused
}
