use rayon::prelude::*;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::sync::OnceLock;

use crate::error::{HermesError, Result};

// Okapi BM25 parameters. Negative IDF values (terms in most documents) are
// floored at `eps` times the mean positive IDF so they still contribute.
const BM25_K1: f32 = 1.5;
const BM25_B: f32 = 0.75;
const BM25_EPSILON: f32 = 0.25;

fn alnum_runs_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"[a-zA-Z]+|[0-9]+").unwrap())
}

fn camel_boundary_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"([a-z])([A-Z])").unwrap())
}

/// Code tokeniser: maximal ASCII letter/digit runs, split on camelCase
/// boundaries, lowercased; single-character tokens are dropped.
pub fn tokenize(text: &str) -> Vec<String> {
    let mut tokens = Vec::new();
    for run in alnum_runs_regex().find_iter(text) {
        let expanded = camel_boundary_regex().replace_all(run.as_str(), "$1 $2");
        for part in expanded.split(' ') {
            if part.len() > 1 {
                tokens.push(part.to_lowercase());
            }
        }
    }
    tokens
}

/// Per-term statistics derived from the tokenised corpus.
struct Bm25Ranker {
    /// term -> idf (with the epsilon floor applied)
    idf: HashMap<String, f32>,
    /// one term-frequency map per document, in row order
    doc_freqs: Vec<HashMap<String, u32>>,
    doc_lens: Vec<f32>,
    avgdl: f32,
}

impl Bm25Ranker {
    fn from_corpus(corpus: &[Vec<String>]) -> Self {
        let n_docs = corpus.len();
        let mut doc_freqs = Vec::with_capacity(n_docs);
        let mut doc_lens = Vec::with_capacity(n_docs);
        let mut df: HashMap<String, u32> = HashMap::new();

        for tokens in corpus {
            let mut freqs: HashMap<String, u32> = HashMap::new();
            for token in tokens {
                *freqs.entry(token.clone()).or_insert(0) += 1;
            }
            for term in freqs.keys() {
                *df.entry(term.clone()).or_insert(0) += 1;
            }
            doc_lens.push(tokens.len() as f32);
            doc_freqs.push(freqs);
        }

        let avgdl = if n_docs > 0 {
            doc_lens.iter().sum::<f32>() / n_docs as f32
        } else {
            0.0
        };

        // Raw Okapi IDF can go negative for very common terms; floor those
        // at eps * mean idf. Terms are visited in sorted order so the mean
        // is bit-identical between a fresh build and an artifact reload.
        let mut terms: Vec<(&String, &u32)> = df.iter().collect();
        terms.sort_by(|a, b| a.0.cmp(b.0));

        let mut idf: HashMap<String, f32> = HashMap::with_capacity(df.len());
        let mut idf_sum = 0f32;
        let mut negatives: Vec<String> = Vec::new();
        for (term, freq) in terms {
            let value = ((n_docs as f32 - *freq as f32 + 0.5) / (*freq as f32 + 0.5)).ln();
            idf_sum += value;
            if value < 0.0 {
                negatives.push(term.clone());
            }
            idf.insert(term.clone(), value);
        }
        let average_idf = if idf.is_empty() {
            0.0
        } else {
            idf_sum / idf.len() as f32
        };
        let floor = BM25_EPSILON * average_idf;
        for term in negatives {
            idf.insert(term, floor);
        }

        Self {
            idf,
            doc_freqs,
            doc_lens,
            avgdl,
        }
    }

    fn score(&self, query_tokens: &[String], doc: usize) -> f32 {
        let freqs = &self.doc_freqs[doc];
        let len_norm = 1.0 - BM25_B + BM25_B * self.doc_lens[doc] / self.avgdl.max(f32::EPSILON);
        let mut score = 0f32;
        for token in query_tokens {
            let Some(&tf) = freqs.get(token) else { continue };
            let Some(&idf) = self.idf.get(token) else { continue };
            let tf = tf as f32;
            score += idf * (tf * (BM25_K1 + 1.0)) / (tf + BM25_K1 * len_norm);
        }
        score
    }
}

#[derive(Serialize, Deserialize)]
struct SparseArtifact {
    corpus_tokens: Vec<Vec<String>>,
}

/// BM25 sparse index over tokenised chunk text. Row ids refer to the same
/// row mapping as the dense index.
pub struct SparseIndex {
    corpus_tokens: Vec<Vec<String>>,
    ranker: Bm25Ranker,
}

impl SparseIndex {
    /// Tokenise each document once and derive the ranker.
    pub fn build(texts: &[String]) -> Self {
        let corpus_tokens: Vec<Vec<String>> =
            texts.par_iter().map(|t| tokenize(t)).collect();
        let ranker = Bm25Ranker::from_corpus(&corpus_tokens);
        tracing::info!(n_docs = texts.len(), "sparse_index_built");
        Self {
            corpus_tokens,
            ranker,
        }
    }

    pub fn n_docs(&self) -> usize {
        self.corpus_tokens.len()
    }

    /// Score every document against the query, returning the top
    /// `min(k, n)` rows score-descending; ties break by ascending row id.
    pub fn search(&self, query: &str, k: usize) -> (Vec<f32>, Vec<i64>) {
        let n = self.corpus_tokens.len();
        if n == 0 || k == 0 {
            return (Vec::new(), Vec::new());
        }
        let query_tokens = tokenize(query);

        let mut scored: Vec<(f32, usize)> = (0..n)
            .into_par_iter()
            .map(|doc| (self.ranker.score(&query_tokens, doc), doc))
            .collect();
        scored.sort_by(|a, b| {
            b.0.partial_cmp(&a.0)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then(a.1.cmp(&b.1))
        });
        scored.truncate(k);

        let scores = scored.iter().map(|&(s, _)| s).collect();
        let rows = scored.iter().map(|&(_, d)| d as i64).collect();
        (scores, rows)
    }

    /// Persist the tokenised corpus; the ranker is rebuilt on load.
    pub fn save(&self, path: &Path) -> Result<()> {
        let artifact = SparseArtifact {
            corpus_tokens: self.corpus_tokens.clone(),
        };
        let text = serde_json::to_string(&artifact)
            .map_err(|e| HermesError::Io(std::io::Error::other(e)))?;
        std::fs::write(path, text)?;
        tracing::info!(path = %path.display(), "sparse_index_saved");
        Ok(())
    }

    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        let artifact: SparseArtifact = serde_json::from_str(&text).map_err(|e| {
            HermesError::Io(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                format!("{}: {e}", path.display()),
            ))
        })?;
        let ranker = Bm25Ranker::from_corpus(&artifact.corpus_tokens);
        tracing::info!(
            path = %path.display(),
            n_docs = artifact.corpus_tokens.len(),
            "sparse_index_loaded"
        );
        Ok(Self {
            corpus_tokens: artifact.corpus_tokens,
            ranker,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tokeniser_splits_camel_case_and_drops_short_tokens() {
        let tokens = tokenize("getUserById(id: u32) -> UserRecord");
        assert_eq!(
            tokens,
            vec!["get", "user", "by", "id", "id", "32", "user", "record"]
        );
    }

    #[test]
    fn tokeniser_separates_letters_and_digits() {
        assert_eq!(tokenize("sha256sum v2"), vec!["sha", "256", "sum"]);
        assert!(tokenize("a b c _ !").is_empty());
    }

    fn corpus() -> Vec<String> {
        vec![
            "fn get_user_by_id(id: i32) -> User".to_string(),
            "fn delete_user(id: i32) -> Result<()>".to_string(),
            "struct DatabaseConnection { pool: Pool }".to_string(),
            "fn render_template(name: &str) -> String".to_string(),
        ]
    }

    #[test]
    fn relevant_document_ranks_first() {
        let index = SparseIndex::build(&corpus());
        let (scores, rows) = index.search("database connection pool", 4);
        assert_eq!(rows[0], 2);
        assert!(scores[0] > 0.0);
        for pair in scores.windows(2) {
            assert!(pair[0] >= pair[1]);
        }
    }

    #[test]
    fn result_length_is_min_k_n() {
        let index = SparseIndex::build(&corpus());
        let (scores, rows) = index.search("user", 100);
        assert_eq!(scores.len(), 4);
        assert_eq!(rows.len(), 4);

        let (scores, rows) = index.search("user", 2);
        assert_eq!(scores.len(), 2);
        assert_eq!(rows.len(), 2);
    }

    #[test]
    fn ties_break_by_ascending_row_id() {
        let texts = vec![
            "alpha beta gamma".to_string(),
            "alpha beta gamma".to_string(),
            "unrelated words entirely".to_string(),
        ];
        let index = SparseIndex::build(&texts);
        let (scores, rows) = index.search("alpha beta", 3);
        assert_eq!(scores[0], scores[1]);
        assert_eq!(&rows[..2], &[0, 1]);
    }

    #[test]
    fn save_load_round_trip_gives_identical_scores() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sparse_index.json");

        let index = SparseIndex::build(&corpus());
        let (scores_before, rows_before) = index.search("delete user", 4);
        index.save(&path).unwrap();

        let loaded = SparseIndex::load(&path).unwrap();
        assert_eq!(loaded.n_docs(), 4);
        let (scores_after, rows_after) = loaded.search("delete user", 4);
        assert_eq!(rows_before, rows_after);
        assert_eq!(scores_before, scores_after);
    }

    #[test]
    fn artifact_shape_is_corpus_tokens_object() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sparse_index.json");
        SparseIndex::build(&["camelCase token".to_string()])
            .save(&path)
            .unwrap();

        let raw: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(
            raw["corpus_tokens"],
            serde_json::json!([["camel", "case", "token"]])
        );
    }

    #[test]
    fn empty_corpus_searches_empty() {
        let index = SparseIndex::build(&[]);
        let (scores, rows) = index.search("anything", 10);
        assert!(scores.is_empty());
        assert!(rows.is_empty());
    }
}
