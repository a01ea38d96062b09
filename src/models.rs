use model2vec_rs::model::StaticModel;

use crate::error::{HermesError, Result};
use crate::sparse::tokenize;

/// Embedding capability: one unit-normalised vector per text.
///
/// Batch size and sequence truncation are implementation-internal.
pub trait BiEncoder: Send + Sync {
    fn encode_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>>;
    fn encode_query(&self, text: &str) -> Result<Vec<f32>>;
    fn dim(&self) -> usize;
    fn model_id(&self) -> &str;
}

/// Reranking capability: relevance score per (query, passage) pair, higher
/// is more relevant. Must be callable from the rerank worker.
pub trait CrossEncoder: Send + Sync {
    fn score_pairs(&self, query: &str, texts: &[String]) -> Result<Vec<f32>>;
    fn model_id(&self) -> &str;
}

pub fn l2_normalize(mut vector: Vec<f32>) -> Vec<f32> {
    let norm = vector.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm > 0.0 {
        for x in vector.iter_mut() {
            *x /= norm;
        }
    }
    vector
}

/// Bi-encoder backed by a Model2Vec static embedding model pulled from the
/// HuggingFace Hub. Documents are encoded with a `passage:` prefix and
/// queries with a `query:` prefix, matching the retrieval models this is
/// used with.
pub struct StaticModelEncoder {
    model: StaticModel,
    model_id: String,
    dim: usize,
}

impl StaticModelEncoder {
    pub fn load(model_id: &str) -> Result<Self> {
        tracing::info!(model = model_id, "loading_biencoder");
        let model = StaticModel::from_pretrained(model_id, None, None, None)
            .map_err(|e| HermesError::Model(format!("load {model_id}: {e}")))?;
        let dim = model.encode_single("dimension probe").len();
        if dim == 0 {
            return Err(HermesError::Model(format!(
                "{model_id} produced an empty embedding"
            )));
        }
        Ok(Self {
            model,
            model_id: model_id.to_string(),
            dim,
        })
    }
}

impl BiEncoder for StaticModelEncoder {
    fn encode_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        texts
            .iter()
            .map(|text| {
                let vector = self.model.encode_single(&format!("passage: {text}"));
                if vector.len() != self.dim {
                    return Err(HermesError::Model(format!(
                        "embedding dim drifted: expected {}, got {}",
                        self.dim,
                        vector.len()
                    )));
                }
                Ok(l2_normalize(vector))
            })
            .collect()
    }

    fn encode_query(&self, text: &str) -> Result<Vec<f32>> {
        let vector = self.model.encode_single(&format!("query: {text}"));
        if vector.len() != self.dim {
            return Err(HermesError::Model(format!(
                "embedding dim drifted: expected {}, got {}",
                self.dim,
                vector.len()
            )));
        }
        Ok(l2_normalize(vector))
    }

    fn dim(&self) -> usize {
        self.dim
    }

    fn model_id(&self) -> &str {
        &self.model_id
    }
}

/// Deterministic token-overlap reranker; the built-in stand-in for a neural
/// cross-encoder. Scores are query-token coverage plus a small density term
/// so shorter, denser passages win ties.
pub struct LexicalReranker;

pub const LEXICAL_RERANKER_ID: &str = "lexical-overlap";

impl CrossEncoder for LexicalReranker {
    fn score_pairs(&self, query: &str, texts: &[String]) -> Result<Vec<f32>> {
        let query_tokens = tokenize(query);
        if query_tokens.is_empty() {
            return Ok(vec![0.0; texts.len()]);
        }
        let unique_query: std::collections::HashSet<&str> =
            query_tokens.iter().map(String::as_str).collect();

        Ok(texts
            .iter()
            .map(|text| {
                let doc_tokens = tokenize(text);
                if doc_tokens.is_empty() {
                    return 0.0;
                }
                let doc_set: std::collections::HashSet<&str> =
                    doc_tokens.iter().map(String::as_str).collect();
                let matched = unique_query.intersection(&doc_set).count() as f32;
                let coverage = matched / unique_query.len() as f32;
                let occurrences = doc_tokens
                    .iter()
                    .filter(|t| unique_query.contains(t.as_str()))
                    .count() as f32;
                coverage + 0.1 * occurrences / doc_tokens.len() as f32
            })
            .collect())
    }

    fn model_id(&self) -> &str {
        LEXICAL_RERANKER_ID
    }
}
