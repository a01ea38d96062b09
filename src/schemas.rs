use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::str::FromStr;

use crate::error::{HermesError, Result};

/// Retrieval strategy for the first pipeline stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum RetrievalMode {
    #[default]
    Dense,
    Sparse,
    Hybrid,
}

impl RetrievalMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            RetrievalMode::Dense => "dense",
            RetrievalMode::Sparse => "sparse",
            RetrievalMode::Hybrid => "hybrid",
        }
    }
}

impl FromStr for RetrievalMode {
    type Err = HermesError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "dense" => Ok(RetrievalMode::Dense),
            "sparse" => Ok(RetrievalMode::Sparse),
            "hybrid" => Ok(RetrievalMode::Hybrid),
            other => Err(HermesError::Validation(format!(
                "unknown retrieval_mode: {other:?} (expected dense, sparse or hybrid)"
            ))),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchRequest {
    pub query: String,
    #[serde(default = "default_top_k_retrieve")]
    pub top_k_retrieve: usize,
    #[serde(default = "default_top_k_rerank")]
    pub top_k_rerank: usize,
    /// `None` means "use the server default".
    #[serde(default)]
    pub retrieval_mode: Option<RetrievalMode>,
    #[serde(default)]
    pub filter_language: Option<String>,
    #[serde(default)]
    pub filter_path_prefix: Option<String>,
    #[serde(default = "default_true")]
    pub return_snippets: bool,
}

fn default_top_k_retrieve() -> usize {
    100
}

fn default_top_k_rerank() -> usize {
    10
}

fn default_true() -> bool {
    true
}

impl SearchRequest {
    pub fn new(query: impl Into<String>) -> Self {
        Self {
            query: query.into(),
            top_k_retrieve: default_top_k_retrieve(),
            top_k_rerank: default_top_k_rerank(),
            retrieval_mode: None,
            filter_language: None,
            filter_path_prefix: None,
            return_snippets: true,
        }
    }

    /// Range checks mirrored from the service boundary schema.
    pub fn validate(&self) -> Result<()> {
        if self.query.trim().is_empty() {
            return Err(HermesError::Validation("query must not be empty".into()));
        }
        if !(1..=1000).contains(&self.top_k_retrieve) {
            return Err(HermesError::Validation(
                "top_k_retrieve must be in 1..=1000".into(),
            ));
        }
        if !(1..=200).contains(&self.top_k_rerank) {
            return Err(HermesError::Validation(
                "top_k_rerank must be in 1..=200".into(),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchResultItem {
    pub chunk_id: i64,
    pub file_path: String,
    pub language: String,
    pub start_line: u32,
    pub end_line: u32,
    pub symbol_name: String,
    /// `None` iff the request set `return_snippets = false`.
    pub code_snippet: Option<String>,
    pub retrieval_rank: usize,
    pub retrieval_score: f32,
    pub rerank_score: Option<f32>,
    pub final_rank: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchResponse {
    pub request_id: String,
    pub query: String,
    pub retrieval_mode: RetrievalMode,
    pub results: Vec<SearchResultItem>,
    pub timings_ms: BTreeMap<String, f64>,
    pub rerank_skipped: bool,
    /// Candidate count after filtering, before truncation to `top_k_rerank`.
    pub total_candidates: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatsResponse {
    pub index_size: usize,
    pub n_chunks: usize,
    pub biencoder_model: String,
    pub crossencoder_model: String,
    pub retrieval_mode: RetrievalMode,
    pub cache_hit_rate: f64,
    pub cache_hits: u64,
    pub cache_misses: u64,
}

/// Round to two decimals for the timings map.
pub fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

/// Round to four decimals for reported scores.
pub fn round4(value: f32) -> f32 {
    (value * 10_000.0).round() / 10_000.0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_defaults_apply_on_deserialise() {
        let req: SearchRequest = serde_json::from_str(r#"{"query": "parse config"}"#).unwrap();
        assert_eq!(req.top_k_retrieve, 100);
        assert_eq!(req.top_k_rerank, 10);
        assert!(req.retrieval_mode.is_none());
        assert!(req.return_snippets);
        assert!(req.validate().is_ok());
    }

    #[test]
    fn request_range_validation() {
        let mut req = SearchRequest::new("q");
        req.top_k_retrieve = 0;
        assert!(req.validate().is_err());

        let mut req = SearchRequest::new("q");
        req.top_k_rerank = 500;
        assert!(req.validate().is_err());

        let req = SearchRequest::new("   ");
        assert!(req.validate().is_err());
    }

    #[test]
    fn retrieval_mode_wire_format_is_lowercase() {
        assert_eq!(serde_json::to_string(&RetrievalMode::Hybrid).unwrap(), "\"hybrid\"");
        let mode: RetrievalMode = serde_json::from_str("\"sparse\"").unwrap();
        assert_eq!(mode, RetrievalMode::Sparse);
        assert!("both".parse::<RetrievalMode>().is_err());
    }

    #[test]
    fn rounding_helpers() {
        assert_eq!(round2(12.3456), 12.35);
        assert_eq!(round4(0.123456), 0.1235);
        assert_eq!(round2(0.0), 0.0);
    }
}
