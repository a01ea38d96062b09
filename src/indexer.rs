use serde::Serialize;
use std::path::Path;
use std::sync::{Mutex, OnceLock};
use std::time::Instant;

use crate::artifacts;
use crate::chunker::{chunk_source, Chunk};
use crate::config::HermesConfig;
use crate::dense::{DenseIndex, EmbeddingMatrix};
use crate::error::{HermesError, Result};
use crate::models::BiEncoder;
use crate::scanner::{scan_repository, ScannedFile};
use crate::sparse::SparseIndex;
use crate::store::MetadataStore;

/// Outcome of a full index build.
#[derive(Debug, Clone, Serialize)]
pub struct IndexSummary {
    pub n_files: usize,
    pub n_chunks: usize,
    pub embedding_dim: usize,
    pub biencoder_model: String,
    pub time_chunk_s: f64,
    pub time_embed_s: f64,
    pub time_total_s: f64,
    pub chunks_per_sec: f64,
}

/// Run the offline pipeline: scan -> chunk -> store -> embed -> build and
/// publish artifacts.
pub fn build_index(
    repo_path: &Path,
    config: &HermesConfig,
    encoder: &dyn BiEncoder,
) -> Result<IndexSummary> {
    build_index_with_progress(repo_path, config, encoder, |_| {})
}

/// Same as [`build_index`], invoking `on_file` after each file is chunked.
///
/// Artifacts are staged as `*.tmp` and renamed into place only after every
/// build step has completed, so a query service reading the directory never
/// sees a partially written set.
pub fn build_index_with_progress(
    repo_path: &Path,
    config: &HermesConfig,
    encoder: &dyn BiEncoder,
    mut on_file: impl FnMut(&ScannedFile),
) -> Result<IndexSummary> {
    let artifacts_dir = &config.artifacts_dir;
    std::fs::create_dir_all(artifacts_dir)?;
    let t0 = Instant::now();

    // 1. Scan.
    tracing::info!(repo = %repo_path.display(), "phase_scan");
    let files = scan_repository(repo_path)?;
    if files.is_empty() {
        return Err(HermesError::IndexBuildEmpty(format!(
            "no indexable files found in {}",
            repo_path.display()
        )));
    }

    // 2-3. Read and chunk, in scan order.
    tracing::info!(n_files = files.len(), "phase_chunk");
    let mut all_chunks: Vec<Chunk> = Vec::new();
    for file in &files {
        let source = match std::fs::read(&file.abs_path) {
            Ok(bytes) => String::from_utf8_lossy(&bytes).into_owned(),
            Err(e) => {
                tracing::warn!(file = %file.rel_path, error = %e, "read_failed");
                continue;
            }
        };
        all_chunks.extend(chunk_source(
            &source,
            &file.rel_path,
            file.language,
            &config.chunking,
        ));
        on_file(file);
    }
    if all_chunks.is_empty() {
        return Err(HermesError::IndexBuildEmpty(
            "chunking produced zero chunks".into(),
        ));
    }
    tracing::info!(n_chunks = all_chunks.len(), "chunking_complete");
    let t_chunk = Instant::now();

    // 4. Insert chunks; this fixes the row -> chunk-id mapping.
    let staged_db = artifacts::staged(artifacts_dir, artifacts::METADATA_DB);
    remove_stale(&staged_db);
    let store = MetadataStore::open(&staged_db)?;
    let chunk_ids = store.insert_chunks(&all_chunks)?;
    tracing::info!(n_chunks = chunk_ids.len(), "metadata_stored");

    // 5. Embed in ascending-id order (identical to insertion order).
    tracing::info!("phase_embed");
    let texts: Vec<String> = all_chunks.iter().map(|c| c.code_text.clone()).collect();
    let rows = encoder.encode_batch(&texts)?;
    let matrix = EmbeddingMatrix::from_rows(rows)?;
    let embedding_dim = matrix.dim;
    let t_embed = Instant::now();

    // 6-7. Dense index plus the raw matrix side artifact.
    tracing::info!("phase_dense_build");
    artifacts::write_npy(
        &artifacts::staged(artifacts_dir, artifacts::EMBEDDINGS_NPY),
        &matrix,
    )?;
    let dense = DenseIndex::build(&config.index, matrix);
    dense.save(&artifacts::staged(artifacts_dir, artifacts::DENSE_INDEX))?;

    // 8. Sparse index over the same text order.
    let sparse = SparseIndex::build(&texts);
    sparse.save(&artifacts::staged(artifacts_dir, artifacts::SPARSE_INDEX))?;

    // 9. Make the whole set visible at once.
    store.close();
    artifacts::publish(
        artifacts_dir,
        &[
            artifacts::METADATA_DB,
            artifacts::DENSE_INDEX,
            artifacts::EMBEDDINGS_NPY,
            artifacts::SPARSE_INDEX,
        ],
    )?;

    let total_s = t0.elapsed().as_secs_f64();
    let summary = IndexSummary {
        n_files: files.len(),
        n_chunks: all_chunks.len(),
        embedding_dim,
        biencoder_model: encoder.model_id().to_string(),
        time_chunk_s: round2(t_chunk.duration_since(t0).as_secs_f64()),
        time_embed_s: round2(t_embed.duration_since(t_chunk).as_secs_f64()),
        time_total_s: round2(total_s),
        chunks_per_sec: round1(all_chunks.len() as f64 / total_s.max(f64::EPSILON)),
    };
    tracing::info!(
        n_files = summary.n_files,
        n_chunks = summary.n_chunks,
        embedding_dim = summary.embedding_dim,
        time_total_s = summary.time_total_s,
        "indexing_complete"
    );
    Ok(summary)
}

fn remove_stale(path: &Path) {
    // Leftovers from a crashed build; WAL side files included.
    let _ = std::fs::remove_file(path);
    let _ = std::fs::remove_file(path.with_extension("tmp-wal"));
    let _ = std::fs::remove_file(path.with_extension("tmp-shm"));
}

fn round2(v: f64) -> f64 {
    (v * 100.0).round() / 100.0
}

fn round1(v: f64) -> f64 {
    (v * 10.0).round() / 10.0
}

// ---------------------------------------------------------------------------
// Indexing-status tracker
// ---------------------------------------------------------------------------

/// Process-wide indexing state, used by service layers to report progress.
/// Terminal states are `Done`, `Error` and `Idle`.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "state", rename_all = "lowercase")]
pub enum IndexingStatus {
    Idle,
    Indexing { repo_path: String },
    Done { summary: IndexSummary },
    Error { message: String },
}

fn status_cell() -> &'static Mutex<IndexingStatus> {
    static STATUS: OnceLock<Mutex<IndexingStatus>> = OnceLock::new();
    STATUS.get_or_init(|| Mutex::new(IndexingStatus::Idle))
}

/// Snapshot of the current indexing state.
pub fn indexing_status() -> IndexingStatus {
    status_cell().lock().expect("status lock poisoned").clone()
}

/// Claim the tracker for a build. Returns `false` when an indexing run is
/// already in flight.
pub fn begin_indexing(repo_path: &Path) -> bool {
    let mut status = status_cell().lock().expect("status lock poisoned");
    if matches!(*status, IndexingStatus::Indexing { .. }) {
        return false;
    }
    *status = IndexingStatus::Indexing {
        repo_path: repo_path.display().to_string(),
    };
    true
}

pub fn finish_indexing(summary: IndexSummary) {
    let mut status = status_cell().lock().expect("status lock poisoned");
    *status = IndexingStatus::Done { summary };
}

pub fn fail_indexing(message: String) {
    let mut status = status_cell().lock().expect("status lock poisoned");
    *status = IndexingStatus::Error { message };
}

pub fn reset_indexing() {
    let mut status = status_cell().lock().expect("status lock poisoned");
    *status = IndexingStatus::Idle;
}
