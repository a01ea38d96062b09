use std::collections::BTreeMap;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};
use tokio::sync::Semaphore;

use crate::artifacts;
use crate::cache::EmbeddingCache;
use crate::config::HermesConfig;
use crate::dense::DenseIndex;
use crate::error::{HermesError, Result};
use crate::fusion::reciprocal_rank_fusion;
use crate::models::{BiEncoder, CrossEncoder};
use crate::schemas::{
    round2, round4, RetrievalMode, SearchRequest, SearchResponse, SearchResultItem, StatsResponse,
};
use crate::sparse::SparseIndex;
use crate::store::MetadataStore;

/// Transient per-query candidate. Produced by retrieval, mutated only by the
/// reranker, consumed by projection.
#[derive(Debug, Clone)]
struct Candidate {
    chunk_id: i64,
    retrieval_score: f32,
    retrieval_rank: usize,
    rerank_score: Option<f32>,
}

/// Everything `reload` swaps in one step: store handle, both indices, the
/// row -> chunk-id mapping and the query-embedding cache. In-flight requests
/// keep the snapshot they cloned at entry.
struct PipelineState {
    store: MetadataStore,
    dense: DenseIndex,
    sparse: Option<SparseIndex>,
    row_map: Vec<i64>,
    cache: EmbeddingCache,
}

impl PipelineState {
    fn load(config: &HermesConfig) -> Result<Self> {
        let dir = &config.artifacts_dir;
        let db_path = dir.join(artifacts::METADATA_DB);
        if !db_path.exists() {
            return Err(HermesError::IndexMissing(db_path));
        }
        let dense_path = dir.join(artifacts::DENSE_INDEX);
        if !dense_path.exists() {
            return Err(HermesError::IndexMissing(dense_path));
        }

        let store = MetadataStore::open(&db_path)?;
        let dense = DenseIndex::load(&dense_path, &config.index)?;

        let sparse_path = dir.join(artifacts::SPARSE_INDEX);
        let sparse = if sparse_path.exists() {
            Some(SparseIndex::load(&sparse_path)?)
        } else {
            tracing::warn!(
                path = %sparse_path.display(),
                "sparse index missing; hybrid mode degrades to dense-only"
            );
            None
        };

        let row_map = store.all_chunk_ids()?;
        let cache = EmbeddingCache::new(config.embed.query_cache_size);

        tracing::info!(n_chunks = row_map.len(), "search_pipeline_ready");
        Ok(Self {
            store,
            dense,
            sparse,
            row_map,
            cache,
        })
    }
}

/// Loads artifacts and executes the multi-stage query pipeline:
/// embed (cached) -> retrieve -> filter -> rerank (bounded, with timeout) ->
/// project. Safe to share across concurrent requests.
pub struct SearchPipeline {
    config: HermesConfig,
    biencoder: Arc<dyn BiEncoder>,
    crossencoder: Arc<dyn CrossEncoder>,
    state: RwLock<Arc<PipelineState>>,
    rerank_pool: Arc<Semaphore>,
}

impl std::fmt::Debug for SearchPipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SearchPipeline")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl SearchPipeline {
    pub fn open(
        config: HermesConfig,
        biencoder: Arc<dyn BiEncoder>,
        crossencoder: Arc<dyn CrossEncoder>,
    ) -> Result<Self> {
        let state = PipelineState::load(&config)?;
        let workers = config.search.rerank_workers.max(1);
        Ok(Self {
            config,
            biencoder,
            crossencoder,
            state: RwLock::new(Arc::new(state)),
            rerank_pool: Arc::new(Semaphore::new(workers)),
        })
    }

    /// Re-open the metadata store and indices and reset the embedding cache,
    /// swapping the whole state atomically.
    pub fn reload(&self) -> Result<()> {
        let fresh = PipelineState::load(&self.config)?;
        *self.state.write().expect("pipeline state lock poisoned") = Arc::new(fresh);
        tracing::info!("pipeline_reloaded");
        Ok(())
    }

    fn snapshot(&self) -> Arc<PipelineState> {
        Arc::clone(&self.state.read().expect("pipeline state lock poisoned"))
    }

    /// `(hits, misses, hit_rate)` of the query-embedding cache.
    pub fn cache_stats(&self) -> (u64, u64, f64) {
        let state = self.snapshot();
        (state.cache.hits(), state.cache.misses(), state.cache.hit_rate())
    }

    pub fn stats(&self) -> Result<StatsResponse> {
        let state = self.snapshot();
        Ok(StatsResponse {
            index_size: state.dense.ntotal(),
            n_chunks: state.store.count()?,
            biencoder_model: self.biencoder.model_id().to_string(),
            crossencoder_model: self.crossencoder.model_id().to_string(),
            retrieval_mode: self.config.search.retrieval_mode,
            cache_hit_rate: (state.cache.hit_rate() * 10_000.0).round() / 10_000.0,
            cache_hits: state.cache.hits(),
            cache_misses: state.cache.misses(),
        })
    }

    pub async fn search(&self, request: &SearchRequest) -> Result<SearchResponse> {
        request.validate()?;
        let state = self.snapshot();
        let request_id: String = uuid::Uuid::new_v4().simple().to_string()[..12].to_string();
        let mut timings: BTreeMap<String, f64> = BTreeMap::new();

        let requested = request
            .retrieval_mode
            .unwrap_or(self.config.search.retrieval_mode);
        // Hybrid without a sparse artifact degrades to dense-only; the
        // response reports the mode that actually ran.
        let mode = if requested == RetrievalMode::Hybrid && state.sparse.is_none() {
            tracing::warn!(request_id = %request_id, "hybrid requested without sparse index; using dense");
            RetrievalMode::Dense
        } else {
            requested
        };

        // 1. Embed the query (cache by exact text).
        let t0 = Instant::now();
        let query_vec = self.embed_query(&state, &request.query)?;
        timings.insert("embed_query_ms".into(), round2(ms_since(t0)));

        // 2. Retrieve.
        let t1 = Instant::now();
        let mut candidates =
            self.retrieve(&state, &request.query, &query_vec, request.top_k_retrieve, mode);
        timings.insert("retrieval_ms".into(), round2(ms_since(t1)));

        // 3. Filter.
        if request.filter_language.is_some() || request.filter_path_prefix.is_some() {
            candidates = apply_filters(
                &state,
                candidates,
                request.filter_language.as_deref(),
                request.filter_path_prefix.as_deref(),
            )?;
        }
        let total_candidates = candidates.len();

        // 4. Rerank the bounded prefix with a wall-clock deadline.
        let mut rerank_skipped = false;
        let t2 = Instant::now();
        let max_rerank = self.config.search.max_rerank_candidates;
        if !candidates.is_empty() {
            let split = max_rerank.min(candidates.len());
            let tail = candidates.split_off(split);
            match self.rerank_with_timeout(&state, &request.query, &mut candidates).await {
                Ok(()) => {}
                Err(HermesError::RerankTimeout) => {
                    tracing::warn!(request_id = %request_id, "rerank_timeout");
                    rerank_skipped = true;
                }
                Err(other) => return Err(other),
            }
            candidates.extend(tail);
        }
        timings.insert("rerank_ms".into(), round2(ms_since(t2)));

        // 5. Project.
        candidates.truncate(request.top_k_rerank);
        let results = build_results(&state, &candidates, request.return_snippets)?;

        timings.insert("total_ms".into(), round2(ms_since(t0)));

        Ok(SearchResponse {
            request_id,
            query: request.query.clone(),
            retrieval_mode: mode,
            results,
            timings_ms: timings,
            rerank_skipped,
            total_candidates,
        })
    }

    fn embed_query(&self, state: &PipelineState, query: &str) -> Result<Vec<f32>> {
        if let Some(cached) = state.cache.get(query) {
            return Ok(cached);
        }
        let vector = self.biencoder.encode_query(query)?;
        state.cache.put(query, vector.clone());
        Ok(vector)
    }

    fn retrieve(
        &self,
        state: &PipelineState,
        query: &str,
        query_vec: &[f32],
        top_k: usize,
        mode: RetrievalMode,
    ) -> Vec<Candidate> {
        match mode {
            RetrievalMode::Dense => {
                let (scores, rows) = state.dense.search(query_vec, top_k);
                translate_rows(&scores, &rows, &state.row_map)
            }
            RetrievalMode::Sparse => match &state.sparse {
                Some(sparse) => {
                    let (scores, rows) = sparse.search(query, top_k);
                    translate_rows(&scores, &rows, &state.row_map)
                }
                None => Vec::new(),
            },
            RetrievalMode::Hybrid => {
                let dense = {
                    let (scores, rows) = state.dense.search(query_vec, top_k);
                    translate_rows(&scores, &rows, &state.row_map)
                };
                let sparse = match &state.sparse {
                    Some(index) => {
                        let (scores, rows) = index.search(query, top_k);
                        translate_rows(&scores, &rows, &state.row_map)
                    }
                    None => Vec::new(),
                };
                let dense_pairs: Vec<(i64, f32)> =
                    dense.iter().map(|c| (c.chunk_id, c.retrieval_score)).collect();
                let sparse_pairs: Vec<(i64, f32)> =
                    sparse.iter().map(|c| (c.chunk_id, c.retrieval_score)).collect();
                let fused = reciprocal_rank_fusion(
                    &[dense_pairs, sparse_pairs],
                    self.config.search.rrf_k,
                    top_k,
                );
                fused
                    .into_iter()
                    .enumerate()
                    .map(|(rank, (chunk_id, score))| Candidate {
                        chunk_id,
                        retrieval_score: score,
                        retrieval_rank: rank + 1,
                        rerank_score: None,
                    })
                    .collect()
            }
        }
    }

    /// Score the slice on a pooled background worker; on deadline expiry the
    /// future is abandoned (the worker finishes and its result is dropped).
    async fn rerank_with_timeout(
        &self,
        state: &PipelineState,
        query: &str,
        slice: &mut Vec<Candidate>,
    ) -> Result<()> {
        let ids: Vec<i64> = slice.iter().map(|c| c.chunk_id).collect();
        let records = state.store.get_chunks_by_ids(&ids)?;
        let text_by_id: HashMap<i64, String> = records
            .into_iter()
            .map(|r| (r.chunk_id, r.code_text))
            .collect();

        // Keep scoring aligned with the candidates that actually have text.
        let mut scored_positions = Vec::with_capacity(slice.len());
        let mut texts = Vec::with_capacity(slice.len());
        for (position, candidate) in slice.iter().enumerate() {
            if let Some(text) = text_by_id.get(&candidate.chunk_id) {
                scored_positions.push(position);
                texts.push(text.clone());
            }
        }
        if texts.is_empty() {
            return Ok(());
        }

        let permit = Arc::clone(&self.rerank_pool)
            .acquire_owned()
            .await
            .expect("rerank pool closed");
        let crossencoder = Arc::clone(&self.crossencoder);
        let query = query.to_string();
        let handle = tokio::task::spawn_blocking(move || {
            let _permit = permit;
            crossencoder.score_pairs(&query, &texts)
        });

        let deadline = Duration::from_secs_f64(self.config.search.rerank_timeout_seconds);
        let scores = match tokio::time::timeout(deadline, handle).await {
            Err(_elapsed) => return Err(HermesError::RerankTimeout),
            Ok(Err(join_error)) => {
                return Err(HermesError::Model(format!("rerank worker died: {join_error}")))
            }
            Ok(Ok(result)) => result?,
        };

        for (position, score) in scored_positions.into_iter().zip(scores) {
            slice[position].rerank_score = Some(score);
        }
        slice.sort_by(|a, b| {
            b.rerank_score
                .unwrap_or(0.0)
                .partial_cmp(&a.rerank_score.unwrap_or(0.0))
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        Ok(())
    }
}

/// Translate index rows to chunk ids via the row mapping, silently skipping
/// negative or out-of-range rows. Ranks are 1-based and contiguous over the
/// surviving candidates.
fn translate_rows(scores: &[f32], rows: &[i64], row_map: &[i64]) -> Vec<Candidate> {
    rows.iter()
        .zip(scores.iter())
        .filter_map(|(&row, &score)| {
            if row < 0 {
                return None;
            }
            row_map.get(row as usize).map(|&chunk_id| (chunk_id, score))
        })
        .enumerate()
        .map(|(rank, (chunk_id, retrieval_score))| Candidate {
            chunk_id,
            retrieval_score,
            retrieval_rank: rank + 1,
            rerank_score: None,
        })
        .collect()
}

/// Drop candidates whose metadata does not match the requested language or
/// path prefix. Order is preserved; `retrieval_rank` keeps its value.
fn apply_filters(
    state: &PipelineState,
    candidates: Vec<Candidate>,
    language: Option<&str>,
    path_prefix: Option<&str>,
) -> Result<Vec<Candidate>> {
    let ids: Vec<i64> = candidates.iter().map(|c| c.chunk_id).collect();
    let records = state.store.get_chunks_by_ids(&ids)?;
    let by_id: HashMap<i64, (String, String)> = records
        .into_iter()
        .map(|r| (r.chunk_id, (r.language, r.file_path)))
        .collect();

    Ok(candidates
        .into_iter()
        .filter(|candidate| {
            let Some((chunk_language, file_path)) = by_id.get(&candidate.chunk_id) else {
                return false;
            };
            if let Some(wanted) = language {
                if chunk_language != wanted {
                    return false;
                }
            }
            if let Some(prefix) = path_prefix {
                if !file_path.starts_with(prefix) {
                    return false;
                }
            }
            true
        })
        .collect())
}

fn build_results(
    state: &PipelineState,
    candidates: &[Candidate],
    return_snippets: bool,
) -> Result<Vec<SearchResultItem>> {
    let ids: Vec<i64> = candidates.iter().map(|c| c.chunk_id).collect();
    let records = state.store.get_chunks_by_ids(&ids)?;
    let by_id: HashMap<i64, crate::store::ChunkRecord> =
        records.into_iter().map(|r| (r.chunk_id, r)).collect();

    let mut results = Vec::with_capacity(candidates.len());
    for candidate in candidates {
        let Some(record) = by_id.get(&candidate.chunk_id) else {
            continue;
        };
        results.push(SearchResultItem {
            chunk_id: candidate.chunk_id,
            file_path: record.file_path.clone(),
            language: record.language.clone(),
            start_line: record.start_line,
            end_line: record.end_line,
            symbol_name: record.symbol_name.clone(),
            code_snippet: return_snippets.then(|| record.code_text.clone()),
            retrieval_rank: candidate.retrieval_rank,
            retrieval_score: round4(candidate.retrieval_score),
            rerank_score: candidate.rerank_score.map(round4),
            final_rank: results.len() + 1,
        });
    }
    Ok(results)
}

fn ms_since(start: Instant) -> f64 {
    start.elapsed().as_secs_f64() * 1000.0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn translate_rows_skips_sentinels_and_out_of_range() {
        let row_map = vec![100, 101, 102];
        let scores = vec![0.9, 0.8, 0.7, 0.6];
        let rows = vec![2, -1, 0, 7];

        let candidates = translate_rows(&scores, &rows, &row_map);
        assert_eq!(candidates.len(), 2);
        assert_eq!(candidates[0].chunk_id, 102);
        assert_eq!(candidates[0].retrieval_rank, 1);
        assert_eq!(candidates[1].chunk_id, 100);
        assert_eq!(candidates[1].retrieval_rank, 2);
    }

    #[test]
    fn translate_rows_ranks_are_contiguous_from_one() {
        let row_map: Vec<i64> = (10..20).collect();
        let scores: Vec<f32> = (0..5).map(|i| 1.0 - i as f32 * 0.1).collect();
        let rows: Vec<i64> = vec![0, 1, 2, 3, 4];
        let candidates = translate_rows(&scores, &rows, &row_map);
        let ranks: Vec<usize> = candidates.iter().map(|c| c.retrieval_rank).collect();
        assert_eq!(ranks, vec![1, 2, 3, 4, 5]);
    }
}
