use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::error::{HermesError, Result};
use crate::schemas::RetrievalMode;

/// Controls how source files are split into searchable chunks.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ChunkingConfig {
    /// Maximum characters per chunk before the line-window split kicks in.
    pub max_chars: usize,
    /// Lines of overlap between consecutive window chunks.
    pub overlap_lines: usize,
    /// Chunks whose stripped text is shorter than this are discarded.
    pub min_chars: usize,
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self {
            max_chars: 1500,
            overlap_lines: 3,
            min_chars: 50,
        }
    }
}

/// Bi-encoder and cross-encoder model settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EmbedConfig {
    /// HuggingFace repo id for the static bi-encoder model.
    pub biencoder_model: String,
    pub biencoder_batch_size: usize,
    pub biencoder_max_length: usize,

    pub crossencoder_model: String,
    pub crossencoder_batch_size: usize,
    pub crossencoder_max_length: usize,

    /// Capacity of the LRU cache for query embeddings.
    pub query_cache_size: usize,
}

impl Default for EmbedConfig {
    fn default() -> Self {
        Self {
            biencoder_model: "minishlab/potion-retrieval-32M".to_string(),
            biencoder_batch_size: 64,
            biencoder_max_length: 512,
            crossencoder_model: "lexical-overlap".to_string(),
            crossencoder_batch_size: 16,
            crossencoder_max_length: 512,
            query_cache_size: 1024,
        }
    }
}

/// Dense (vector) index settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IndexConfig {
    /// Cells probed per query when the inverted-file layout is active.
    pub faiss_nprobe: usize,
    /// Opt in to the inverted-file layout for large corpora. Flat (exact)
    /// search is used unless this is set and the corpus is big enough.
    pub faiss_use_ivf: bool,
    /// Number of coarse cells for the inverted-file layout.
    pub faiss_ivf_nlist: usize,
}

impl Default for IndexConfig {
    fn default() -> Self {
        Self {
            faiss_nprobe: 8,
            faiss_use_ivf: false,
            faiss_ivf_nlist: 100,
        }
    }
}

/// Search pipeline defaults.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SearchConfig {
    /// Candidates taken from the retrieval stage.
    pub top_k_retrieve: usize,
    /// Final results after reranking.
    pub top_k_rerank: usize,
    /// Cap on candidates handed to the cross-encoder.
    pub max_rerank_candidates: usize,
    /// Wall-clock budget for the rerank stage; on expiry the response keeps
    /// retrieval order and sets `rerank_skipped`.
    pub rerank_timeout_seconds: f64,
    pub retrieval_mode: RetrievalMode,
    /// RRF constant; higher flattens the weighting across ranks.
    pub rrf_k: usize,
    /// Background workers available to the rerank stage.
    pub rerank_workers: usize,
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            top_k_retrieve: 100,
            top_k_rerank: 10,
            max_rerank_candidates: 50,
            rerank_timeout_seconds: 10.0,
            retrieval_mode: RetrievalMode::Dense,
            rrf_k: 60,
            rerank_workers: 2,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HermesConfig {
    /// Where the four index artifacts live.
    pub artifacts_dir: PathBuf,
    pub chunking: ChunkingConfig,
    pub embed: EmbedConfig,
    pub index: IndexConfig,
    pub search: SearchConfig,
}

impl Default for HermesConfig {
    fn default() -> Self {
        Self {
            artifacts_dir: PathBuf::from("artifacts"),
            chunking: ChunkingConfig::default(),
            embed: EmbedConfig::default(),
            index: IndexConfig::default(),
            search: SearchConfig::default(),
        }
    }
}

impl HermesConfig {
    /// Reject values that would otherwise fail deep inside a request.
    pub fn validate(&self) -> Result<()> {
        fn bad(msg: impl Into<String>) -> HermesError {
            HermesError::ConfigInvalid(msg.into())
        }
        if self.chunking.max_chars == 0 {
            return Err(bad("chunking.max_chars must be positive"));
        }
        if self.chunking.min_chars > self.chunking.max_chars {
            return Err(bad("chunking.min_chars cannot exceed chunking.max_chars"));
        }
        if self.embed.query_cache_size == 0 {
            return Err(bad("embed.query_cache_size must be positive"));
        }
        if self.index.faiss_ivf_nlist == 0 || self.index.faiss_nprobe == 0 {
            return Err(bad(
                "index.faiss_ivf_nlist and index.faiss_nprobe must be positive",
            ));
        }
        if !(1..=1000).contains(&self.search.top_k_retrieve) {
            return Err(bad("search.top_k_retrieve must be in 1..=1000"));
        }
        if !(1..=200).contains(&self.search.top_k_rerank) {
            return Err(bad("search.top_k_rerank must be in 1..=200"));
        }
        if self.search.max_rerank_candidates == 0 {
            return Err(bad("search.max_rerank_candidates must be positive"));
        }
        if self.search.rerank_timeout_seconds <= 0.0 {
            return Err(bad("search.rerank_timeout_seconds must be positive"));
        }
        if self.search.rrf_k == 0 {
            return Err(bad("search.rrf_k must be positive"));
        }
        if self.search.rerank_workers == 0 {
            return Err(bad("search.rerank_workers must be at least 1"));
        }
        Ok(())
    }
}

/// Load configuration: defaults, then an optional JSON file, then `HERMES_*`
/// environment variables. Unknown keys in the file are ignored.
pub fn load_config(config_file: Option<&Path>) -> Result<HermesConfig> {
    let mut config = match config_file {
        Some(path) => {
            let text = std::fs::read_to_string(path)?;
            serde_json::from_str::<HermesConfig>(&text)
                .map_err(|e| HermesError::ConfigInvalid(format!("{}: {e}", path.display())))?
        }
        None => HermesConfig::default(),
    };
    apply_env_overrides(&mut config);
    config.validate()?;
    Ok(config)
}

fn apply_env_overrides(config: &mut HermesConfig) {
    fn env_str(key: &str) -> Option<String> {
        std::env::var(key).ok().filter(|v| !v.trim().is_empty())
    }
    fn env_usize(key: &str, slot: &mut usize) {
        if let Some(v) = env_str(key).and_then(|v| v.parse().ok()) {
            *slot = v;
        }
    }
    fn env_f64(key: &str, slot: &mut f64) {
        if let Some(v) = env_str(key).and_then(|v| v.parse().ok()) {
            *slot = v;
        }
    }
    fn env_bool(key: &str, slot: &mut bool) {
        if let Some(v) = env_str(key) {
            match v.to_ascii_lowercase().as_str() {
                "1" | "true" | "yes" => *slot = true,
                "0" | "false" | "no" => *slot = false,
                _ => {}
            }
        }
    }

    if let Some(dir) = env_str("HERMES_ARTIFACTS_DIR") {
        config.artifacts_dir = PathBuf::from(dir);
    }

    env_usize("HERMES_CHUNK_MAX_CHARS", &mut config.chunking.max_chars);
    env_usize("HERMES_CHUNK_OVERLAP_LINES", &mut config.chunking.overlap_lines);
    env_usize("HERMES_CHUNK_MIN_CHARS", &mut config.chunking.min_chars);

    if let Some(model) = env_str("HERMES_EMBED_BIENCODER_MODEL") {
        config.embed.biencoder_model = model;
    }
    env_usize("HERMES_EMBED_BIENCODER_BATCH_SIZE", &mut config.embed.biencoder_batch_size);
    env_usize("HERMES_EMBED_BIENCODER_MAX_LENGTH", &mut config.embed.biencoder_max_length);
    if let Some(model) = env_str("HERMES_EMBED_CROSSENCODER_MODEL") {
        config.embed.crossencoder_model = model;
    }
    env_usize("HERMES_EMBED_CROSSENCODER_BATCH_SIZE", &mut config.embed.crossencoder_batch_size);
    env_usize("HERMES_EMBED_CROSSENCODER_MAX_LENGTH", &mut config.embed.crossencoder_max_length);
    env_usize("HERMES_EMBED_QUERY_CACHE_SIZE", &mut config.embed.query_cache_size);

    env_usize("HERMES_INDEX_FAISS_NPROBE", &mut config.index.faiss_nprobe);
    env_bool("HERMES_INDEX_FAISS_USE_IVF", &mut config.index.faiss_use_ivf);
    env_usize("HERMES_INDEX_FAISS_IVF_NLIST", &mut config.index.faiss_ivf_nlist);

    env_usize("HERMES_SEARCH_TOP_K_RETRIEVE", &mut config.search.top_k_retrieve);
    env_usize("HERMES_SEARCH_TOP_K_RERANK", &mut config.search.top_k_rerank);
    env_usize("HERMES_SEARCH_MAX_RERANK_CANDIDATES", &mut config.search.max_rerank_candidates);
    env_f64("HERMES_SEARCH_RERANK_TIMEOUT_SECONDS", &mut config.search.rerank_timeout_seconds);
    env_usize("HERMES_SEARCH_RRF_K", &mut config.search.rrf_k);
    env_usize("HERMES_SEARCH_RERANK_WORKERS", &mut config.search.rerank_workers);
    if let Some(mode) = env_str("HERMES_SEARCH_RETRIEVAL_MODE") {
        if let Ok(parsed) = mode.parse::<RetrievalMode>() {
            config.search.retrieval_mode = parsed;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let config = HermesConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.chunking.max_chars, 1500);
        assert_eq!(config.search.rrf_k, 60);
        assert_eq!(config.search.retrieval_mode, RetrievalMode::Dense);
    }

    #[test]
    fn file_with_unknown_keys_is_accepted() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("hermes.json");
        std::fs::write(
            &path,
            r#"{"artifacts_dir": "out", "search": {"top_k_rerank": 5, "mystery_knob": true}}"#,
        )
        .unwrap();

        let config = load_config(Some(&path)).unwrap();
        assert_eq!(config.artifacts_dir, PathBuf::from("out"));
        assert_eq!(config.search.top_k_rerank, 5);
        // Untouched sections keep their defaults.
        assert_eq!(config.chunking.min_chars, 50);
    }

    #[test]
    fn out_of_range_values_are_rejected_at_load() {
        let mut config = HermesConfig::default();
        config.search.top_k_retrieve = 5000;
        assert!(matches!(
            config.validate(),
            Err(HermesError::ConfigInvalid(_))
        ));

        let mut config = HermesConfig::default();
        config.search.rerank_timeout_seconds = 0.0;
        assert!(config.validate().is_err());

        let mut config = HermesConfig::default();
        config.chunking.min_chars = 9000;
        assert!(config.validate().is_err());
    }
}
