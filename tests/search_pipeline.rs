use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::path::Path;
use std::sync::Arc;

use hermes::artifacts;
use hermes::config::HermesConfig;
use hermes::error::{HermesError, Result};
use hermes::indexer::build_index;
use hermes::models::{l2_normalize, BiEncoder, CrossEncoder, LexicalReranker};
use hermes::pipeline::SearchPipeline;
use hermes::schemas::{RetrievalMode, SearchRequest};
use hermes::sparse::tokenize;
use hermes::store::MetadataStore;

/// Deterministic bag-of-tokens embedder: token-overlapping texts get high
/// cosine similarity, disjoint texts score near zero. Keeps the pipeline
/// tests hermetic (no model downloads).
struct HashBagEncoder {
    dim: usize,
}

impl HashBagEncoder {
    fn new() -> Self {
        Self { dim: 64 }
    }

    fn embed(&self, text: &str) -> Vec<f32> {
        let mut v = vec![0f32; self.dim];
        for token in tokenize(text) {
            let mut hasher = DefaultHasher::new();
            token.hash(&mut hasher);
            v[(hasher.finish() as usize) % self.dim] += 1.0;
        }
        l2_normalize(v)
    }
}

impl BiEncoder for HashBagEncoder {
    fn encode_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        Ok(texts.iter().map(|t| self.embed(t)).collect())
    }

    fn encode_query(&self, text: &str) -> Result<Vec<f32>> {
        Ok(self.embed(text))
    }

    fn dim(&self) -> usize {
        self.dim
    }

    fn model_id(&self) -> &str {
        "hash-bag-test"
    }
}

/// Cross-encoder that always overruns the rerank deadline.
struct SlowReranker;

impl CrossEncoder for SlowReranker {
    fn score_pairs(&self, _query: &str, texts: &[String]) -> Result<Vec<f32>> {
        std::thread::sleep(std::time::Duration::from_millis(200));
        Ok(vec![0.0; texts.len()])
    }

    fn model_id(&self) -> &str {
        "slow-test"
    }
}

/// Cross-encoder that fails outright (not a timeout).
struct BrokenReranker;

impl CrossEncoder for BrokenReranker {
    fn score_pairs(&self, _query: &str, _texts: &[String]) -> Result<Vec<f32>> {
        Err(HermesError::Model("cross-encoder exploded".into()))
    }

    fn model_id(&self) -> &str {
        "broken-test"
    }
}

fn write(root: &Path, rel: &str, content: &str) {
    let path = root.join(rel);
    std::fs::create_dir_all(path.parent().unwrap()).unwrap();
    std::fs::write(path, content).unwrap();
}

fn mixed_repo(root: &Path) {
    write(
        root,
        "src/bmi.py",
        "def calculate_bmi(weight, height):\n    \"Return body mass index.\"\n    return weight / (height ** 2)\n\n\ndef render_greeting(name):\n    \"Format a friendly greeting banner.\"\n    return f\"hello {name}\"\n",
    );
    write(
        root,
        "web/session.ts",
        "export function openSession(token) {\n  return store.create(token);\n}\n\nexport function closeSession(id) {\n  return store.drop(id);\n}\n",
    );
}

fn config_for(artifacts_dir: &Path) -> HermesConfig {
    let mut config = HermesConfig::default();
    config.artifacts_dir = artifacts_dir.to_path_buf();
    config.chunking.min_chars = 10;
    config
}

/// Index `repo` into a fresh artifacts dir and open a pipeline over it.
fn indexed_pipeline(
    repo: &Path,
    artifacts_dir: &Path,
    crossencoder: Arc<dyn CrossEncoder>,
    tweak: impl FnOnce(&mut HermesConfig),
) -> SearchPipeline {
    let mut config = config_for(artifacts_dir);
    tweak(&mut config);
    let encoder = HashBagEncoder::new();
    build_index(repo, &config, &encoder).unwrap();
    SearchPipeline::open(config, Arc::new(HashBagEncoder::new()), crossencoder).unwrap()
}

#[tokio::test]
async fn docstring_query_returns_its_function_first() {
    let repo = tempfile::tempdir().unwrap();
    let out = tempfile::tempdir().unwrap();
    mixed_repo(repo.path());
    let pipeline = indexed_pipeline(repo.path(), out.path(), Arc::new(LexicalReranker), |_| {});

    let mut request = SearchRequest::new("Return body mass index.");
    request.retrieval_mode = Some(RetrievalMode::Dense);
    request.top_k_rerank = 1;

    let response = pipeline.search(&request).await.unwrap();
    assert_eq!(response.retrieval_mode, RetrievalMode::Dense);
    assert_eq!(response.results.len(), 1);
    let top = &response.results[0];
    assert_eq!(top.final_rank, 1);
    assert_eq!(top.symbol_name, "calculate_bmi");
    assert_eq!(top.file_path, "src/bmi.py");
    assert!(top.code_snippet.as_ref().unwrap().contains("body mass index"));
}

#[tokio::test]
async fn dense_ranks_are_contiguous_and_ids_exist() {
    let repo = tempfile::tempdir().unwrap();
    let out = tempfile::tempdir().unwrap();
    mixed_repo(repo.path());
    let pipeline = indexed_pipeline(repo.path(), out.path(), Arc::new(LexicalReranker), |_| {});

    let mut request = SearchRequest::new("session token store");
    request.retrieval_mode = Some(RetrievalMode::Dense);

    let response = pipeline.search(&request).await.unwrap();
    assert!(!response.results.is_empty());

    let store = MetadataStore::open(&out.path().join(artifacts::METADATA_DB)).unwrap();
    let mut seen = std::collections::HashSet::new();
    for item in &response.results {
        assert!(seen.insert(item.retrieval_rank), "duplicate retrieval rank");
        assert!(store.get_chunk(item.chunk_id).unwrap().is_some());
    }
    let mut ranks: Vec<usize> = response.results.iter().map(|r| r.retrieval_rank).collect();
    ranks.sort_unstable();
    assert_eq!(ranks, (1..=response.results.len()).collect::<Vec<_>>());
}

#[tokio::test]
async fn sparse_and_hybrid_modes_return_results() {
    let repo = tempfile::tempdir().unwrap();
    let out = tempfile::tempdir().unwrap();
    mixed_repo(repo.path());
    let pipeline = indexed_pipeline(repo.path(), out.path(), Arc::new(LexicalReranker), |_| {});

    let mut request = SearchRequest::new("openSession token");
    request.retrieval_mode = Some(RetrievalMode::Sparse);
    let sparse = pipeline.search(&request).await.unwrap();
    assert!(!sparse.results.is_empty());
    assert_eq!(sparse.results[0].file_path, "web/session.ts");

    request.retrieval_mode = Some(RetrievalMode::Hybrid);
    let hybrid = pipeline.search(&request).await.unwrap();
    assert_eq!(hybrid.retrieval_mode, RetrievalMode::Hybrid);
    assert!(!hybrid.results.is_empty());
}

#[tokio::test]
async fn successful_rerank_sorts_prefix_by_score() {
    let repo = tempfile::tempdir().unwrap();
    let out = tempfile::tempdir().unwrap();
    mixed_repo(repo.path());
    let pipeline = indexed_pipeline(repo.path(), out.path(), Arc::new(LexicalReranker), |_| {});

    let mut request = SearchRequest::new("friendly greeting banner");
    request.retrieval_mode = Some(RetrievalMode::Hybrid);

    let response = pipeline.search(&request).await.unwrap();
    assert!(!response.rerank_skipped);
    assert!(!response.results.is_empty());
    assert_eq!(response.results[0].symbol_name, "render_greeting");

    let scores: Vec<f32> = response
        .results
        .iter()
        .filter_map(|r| r.rerank_score)
        .collect();
    for pair in scores.windows(2) {
        assert!(pair[0] >= pair[1], "rerank scores must be descending");
    }
}

#[tokio::test]
async fn rerank_timeout_degrades_to_retrieval_order() {
    let repo = tempfile::tempdir().unwrap();
    let out = tempfile::tempdir().unwrap();
    mixed_repo(repo.path());
    let pipeline = indexed_pipeline(repo.path(), out.path(), Arc::new(SlowReranker), |config| {
        config.search.rerank_timeout_seconds = 0.001;
    });

    let response = pipeline
        .search(&SearchRequest::new("session store token"))
        .await
        .unwrap();

    assert!(response.rerank_skipped);
    // Order is the pre-rerank order and no candidate carries a rerank score.
    for (i, item) in response.results.iter().enumerate() {
        assert_eq!(item.retrieval_rank, i + 1);
        assert!(item.rerank_score.is_none());
    }
    assert!(response.timings_ms.contains_key("rerank_ms"));
}

#[tokio::test]
async fn broken_cross_encoder_propagates_as_model_error() {
    let repo = tempfile::tempdir().unwrap();
    let out = tempfile::tempdir().unwrap();
    mixed_repo(repo.path());
    let pipeline = indexed_pipeline(repo.path(), out.path(), Arc::new(BrokenReranker), |_| {});

    let err = pipeline
        .search(&SearchRequest::new("session store token"))
        .await
        .unwrap_err();
    assert!(matches!(err, HermesError::Model(_)));
}

#[tokio::test]
async fn language_filter_excludes_other_languages() {
    let repo = tempfile::tempdir().unwrap();
    let out = tempfile::tempdir().unwrap();
    mixed_repo(repo.path());
    let pipeline = indexed_pipeline(repo.path(), out.path(), Arc::new(LexicalReranker), |_| {});

    let unfiltered = pipeline
        .search(&SearchRequest::new("function definition"))
        .await
        .unwrap();

    let mut request = SearchRequest::new("function definition");
    request.filter_language = Some("python".to_string());
    let filtered = pipeline.search(&request).await.unwrap();

    for item in &filtered.results {
        assert_eq!(item.language, "python");
    }
    assert!(filtered.total_candidates <= unfiltered.total_candidates);

    let mut request = SearchRequest::new("function definition");
    request.filter_path_prefix = Some("web/".to_string());
    let by_path = pipeline.search(&request).await.unwrap();
    for item in &by_path.results {
        assert!(item.file_path.starts_with("web/"));
    }
}

#[tokio::test]
async fn repeated_query_hits_the_embedding_cache() {
    let repo = tempfile::tempdir().unwrap();
    let out = tempfile::tempdir().unwrap();
    mixed_repo(repo.path());
    let pipeline = indexed_pipeline(repo.path(), out.path(), Arc::new(LexicalReranker), |_| {});

    let request = SearchRequest::new("calculate body mass index");
    let first = pipeline.search(&request).await.unwrap();
    assert_eq!(pipeline.cache_stats(), (0, 1, 0.0));

    let second = pipeline.search(&request).await.unwrap();
    let (hits, misses, hit_rate) = pipeline.cache_stats();
    assert_eq!((hits, misses), (1, 1));
    assert_eq!(hit_rate, 0.5);

    // Identical embedding -> identical ranking.
    let first_ids: Vec<i64> = first.results.iter().map(|r| r.chunk_id).collect();
    let second_ids: Vec<i64> = second.results.iter().map(|r| r.chunk_id).collect();
    assert_eq!(first_ids, second_ids);
}

#[tokio::test]
async fn reload_resets_cache_and_keeps_serving() {
    let repo = tempfile::tempdir().unwrap();
    let out = tempfile::tempdir().unwrap();
    mixed_repo(repo.path());
    let pipeline = indexed_pipeline(repo.path(), out.path(), Arc::new(LexicalReranker), |_| {});

    let request = SearchRequest::new("calculate body mass index");
    pipeline.search(&request).await.unwrap();
    pipeline.search(&request).await.unwrap();

    pipeline.reload().unwrap();
    assert_eq!(pipeline.cache_stats(), (0, 0, 0.0));

    let after = pipeline.search(&request).await.unwrap();
    assert!(!after.results.is_empty());
    assert_eq!(pipeline.cache_stats(), (0, 1, 0.0));
}

#[tokio::test]
async fn hybrid_degrades_to_dense_without_sparse_artifact() {
    let repo = tempfile::tempdir().unwrap();
    let out = tempfile::tempdir().unwrap();
    mixed_repo(repo.path());
    let pipeline = indexed_pipeline(repo.path(), out.path(), Arc::new(LexicalReranker), |_| {});

    std::fs::remove_file(out.path().join(artifacts::SPARSE_INDEX)).unwrap();
    pipeline.reload().unwrap();

    let mut request = SearchRequest::new("calculate body mass index");
    request.retrieval_mode = Some(RetrievalMode::Hybrid);
    let response = pipeline.search(&request).await.unwrap();
    assert_eq!(response.retrieval_mode, RetrievalMode::Dense);
    assert!(!response.results.is_empty());

    // Sparse mode with no artifact returns an empty result set, not an error.
    request.retrieval_mode = Some(RetrievalMode::Sparse);
    let sparse = pipeline.search(&request).await.unwrap();
    assert!(sparse.results.is_empty());
    assert_eq!(sparse.total_candidates, 0);
    assert!(sparse.timings_ms.contains_key("total_ms"));
}

#[tokio::test]
async fn missing_artifacts_fail_with_index_missing() {
    let out = tempfile::tempdir().unwrap();
    let config = config_for(out.path());
    let err = SearchPipeline::open(
        config,
        Arc::new(HashBagEncoder::new()),
        Arc::new(LexicalReranker),
    )
    .unwrap_err();
    assert!(matches!(err, HermesError::IndexMissing(_)));
}

#[tokio::test]
async fn invalid_requests_are_rejected() {
    let repo = tempfile::tempdir().unwrap();
    let out = tempfile::tempdir().unwrap();
    mixed_repo(repo.path());
    let pipeline = indexed_pipeline(repo.path(), out.path(), Arc::new(LexicalReranker), |_| {});

    let err = pipeline.search(&SearchRequest::new("  ")).await.unwrap_err();
    assert!(matches!(err, HermesError::Validation(_)));

    let mut request = SearchRequest::new("ok");
    request.top_k_retrieve = 100_000;
    let err = pipeline.search(&request).await.unwrap_err();
    assert!(matches!(err, HermesError::Validation(_)));
}

#[tokio::test]
async fn response_carries_request_metadata_and_timings() {
    let repo = tempfile::tempdir().unwrap();
    let out = tempfile::tempdir().unwrap();
    mixed_repo(repo.path());
    let pipeline = indexed_pipeline(repo.path(), out.path(), Arc::new(LexicalReranker), |_| {});

    let mut request = SearchRequest::new("greeting banner");
    request.return_snippets = false;
    let response = pipeline.search(&request).await.unwrap();

    assert_eq!(response.request_id.len(), 12);
    assert!(response.request_id.chars().all(|c| c.is_ascii_hexdigit()));
    assert_eq!(response.query, "greeting banner");
    for key in ["embed_query_ms", "retrieval_ms", "rerank_ms", "total_ms"] {
        assert!(response.timings_ms.contains_key(key), "missing timing {key}");
    }
    for item in &response.results {
        assert!(item.code_snippet.is_none());
    }
}

#[tokio::test]
async fn stats_reflect_store_and_cache() {
    let repo = tempfile::tempdir().unwrap();
    let out = tempfile::tempdir().unwrap();
    mixed_repo(repo.path());
    let pipeline = indexed_pipeline(repo.path(), out.path(), Arc::new(LexicalReranker), |_| {});

    pipeline.search(&SearchRequest::new("session")).await.unwrap();
    let stats = pipeline.stats().unwrap();

    assert!(stats.index_size > 0);
    assert_eq!(stats.index_size, stats.n_chunks);
    assert_eq!(stats.biencoder_model, "hash-bag-test");
    assert_eq!(stats.crossencoder_model, "lexical-overlap");
    assert_eq!(stats.cache_misses, 1);
}

#[tokio::test]
async fn concurrent_searches_share_one_pipeline() {
    let repo = tempfile::tempdir().unwrap();
    let out = tempfile::tempdir().unwrap();
    mixed_repo(repo.path());
    let pipeline = Arc::new(indexed_pipeline(
        repo.path(),
        out.path(),
        Arc::new(LexicalReranker),
        |_| {},
    ));

    let mut handles = Vec::new();
    for i in 0..8 {
        let pipeline = Arc::clone(&pipeline);
        handles.push(tokio::spawn(async move {
            let query = if i % 2 == 0 {
                "body mass index"
            } else {
                "session token"
            };
            pipeline.search(&SearchRequest::new(query)).await
        }));
    }
    for handle in handles {
        let response = handle.await.unwrap().unwrap();
        assert!(!response.results.is_empty());
    }
}
