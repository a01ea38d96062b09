use rayon::prelude::*;
use std::io::Write;
use std::path::Path;

use crate::config::IndexConfig;
use crate::error::{HermesError, Result};

/// A dense `[n x dim]` row-major f32 matrix of unit vectors.
#[derive(Debug, Clone, PartialEq)]
pub struct EmbeddingMatrix {
    pub data: Vec<f32>,
    pub n: usize,
    pub dim: usize,
}

impl EmbeddingMatrix {
    pub fn from_rows(rows: Vec<Vec<f32>>) -> Result<Self> {
        let n = rows.len();
        let dim = rows.first().map(|r| r.len()).unwrap_or(0);
        if dim == 0 {
            return Err(HermesError::Model(
                "bi-encoder returned zero-dimensional embeddings".into(),
            ));
        }
        let mut data = Vec::with_capacity(n * dim);
        for row in &rows {
            if row.len() != dim {
                return Err(HermesError::Model(format!(
                    "ragged embedding batch: expected dim {dim}, got {}",
                    row.len()
                )));
            }
            data.extend_from_slice(row);
        }
        Ok(Self { data, n, dim })
    }

    pub fn row(&self, i: usize) -> &[f32] {
        &self.data[i * self.dim..(i + 1) * self.dim]
    }
}

fn dot(a: &[f32], b: &[f32]) -> f32 {
    a.iter().zip(b.iter()).map(|(x, y)| x * y).sum()
}

/// Inverted-file layout: coarse centroids plus per-cell row lists. Only the
/// probed cells are scanned at query time.
#[derive(Debug, Clone)]
struct IvfLayout {
    nlist: usize,
    nprobe: usize,
    centroids: Vec<f32>,
    cells: Vec<Vec<u32>>,
}

/// Inner-product index over L2-normalised vectors (cosine as dot product).
///
/// Flat (exact) by default; the inverted-file layout is used only when
/// explicitly enabled and the corpus exceeds `nlist * 40` rows. Row index is
/// the id; the caller owns the row -> chunk-id mapping.
pub struct DenseIndex {
    matrix: EmbeddingMatrix,
    ivf: Option<IvfLayout>,
}

const ARTIFACT_MAGIC: &[u8; 4] = b"HMDI";
const ARTIFACT_VERSION: u32 = 1;
const KIND_FLAT: u8 = 0;
const KIND_IVF: u8 = 1;
const KMEANS_ITERATIONS: usize = 10;

impl DenseIndex {
    /// Build from an embedding matrix, choosing flat vs inverted-file.
    pub fn build(config: &IndexConfig, matrix: EmbeddingMatrix) -> Self {
        let use_ivf = config.faiss_use_ivf && matrix.n > config.faiss_ivf_nlist * 40;
        tracing::info!(
            n_vectors = matrix.n,
            dim = matrix.dim,
            use_ivf,
            "building_dense_index"
        );

        let ivf = use_ivf.then(|| {
            let nlist = config.faiss_ivf_nlist;
            let centroids = train_centroids(&matrix, nlist);
            let cells = assign_cells(&matrix, &centroids, nlist);
            IvfLayout {
                nlist,
                nprobe: config.faiss_nprobe,
                centroids,
                cells,
            }
        });

        Self { matrix, ivf }
    }

    pub fn ntotal(&self) -> usize {
        self.matrix.n
    }

    pub fn dim(&self) -> usize {
        self.matrix.dim
    }

    /// Top-k rows by inner product, score-descending with ties broken by
    /// ascending row id. Returns at most `min(k, ntotal)` entries; no
    /// negative sentinels are produced.
    pub fn search(&self, query: &[f32], k: usize) -> (Vec<f32>, Vec<i64>) {
        if self.matrix.n == 0 || k == 0 || query.len() != self.matrix.dim {
            return (Vec::new(), Vec::new());
        }

        let scored: Vec<(f32, u32)> = match &self.ivf {
            None => (0..self.matrix.n)
                .into_par_iter()
                .map(|row| (dot(query, self.matrix.row(row)), row as u32))
                .collect(),
            Some(ivf) => {
                let mut cell_scores: Vec<(f32, usize)> = (0..ivf.nlist)
                    .map(|c| {
                        let centroid = &ivf.centroids[c * self.matrix.dim..(c + 1) * self.matrix.dim];
                        (dot(query, centroid), c)
                    })
                    .collect();
                cell_scores
                    .sort_unstable_by(|a, b| b.0.partial_cmp(&a.0).unwrap_or(std::cmp::Ordering::Equal));

                cell_scores
                    .iter()
                    .take(ivf.nprobe.max(1))
                    .flat_map(|&(_, c)| ivf.cells[c].iter().copied())
                    .collect::<Vec<u32>>()
                    .into_par_iter()
                    .map(|row| (dot(query, self.matrix.row(row as usize)), row))
                    .collect()
            }
        };

        top_k(scored, k)
    }

    /// Persist as a self-contained binary artifact.
    pub fn save(&self, path: &Path) -> Result<()> {
        let mut buf: Vec<u8> = Vec::with_capacity(16 + self.matrix.data.len() * 4);
        buf.extend_from_slice(ARTIFACT_MAGIC);
        buf.extend_from_slice(&ARTIFACT_VERSION.to_le_bytes());
        buf.push(if self.ivf.is_some() { KIND_IVF } else { KIND_FLAT });
        buf.extend_from_slice(&(self.matrix.dim as u32).to_le_bytes());
        buf.extend_from_slice(&(self.matrix.n as u64).to_le_bytes());
        for value in &self.matrix.data {
            buf.extend_from_slice(&value.to_le_bytes());
        }

        if let Some(ivf) = &self.ivf {
            buf.extend_from_slice(&(ivf.nlist as u32).to_le_bytes());
            buf.extend_from_slice(&(ivf.nprobe as u32).to_le_bytes());
            for value in &ivf.centroids {
                buf.extend_from_slice(&value.to_le_bytes());
            }
            for cell in &ivf.cells {
                buf.extend_from_slice(&(cell.len() as u32).to_le_bytes());
                for row in cell {
                    buf.extend_from_slice(&row.to_le_bytes());
                }
            }
        }

        let mut file = std::fs::File::create(path)?;
        file.write_all(&buf)?;
        file.sync_all()?;
        tracing::info!(path = %path.display(), total = self.matrix.n, "dense_index_saved");
        Ok(())
    }

    /// Load a saved artifact. For the inverted-file layout, `nprobe` is
    /// re-applied from the current configuration.
    pub fn load(path: &Path, config: &IndexConfig) -> Result<Self> {
        let bytes = std::fs::read(path)?;
        let mut reader = ByteReader::new(&bytes, path);

        let magic = reader.take(4)?;
        if magic != ARTIFACT_MAGIC {
            return Err(corrupt(path, "bad magic"));
        }
        let version = reader.u32()?;
        if version != ARTIFACT_VERSION {
            return Err(corrupt(path, "unsupported version"));
        }
        let kind = reader.u8()?;
        let dim = reader.u32()? as usize;
        let n = reader.u64()? as usize;
        let data = reader.f32s(n * dim)?;
        let matrix = EmbeddingMatrix { data, n, dim };

        let ivf = match kind {
            KIND_FLAT => None,
            KIND_IVF => {
                let nlist = reader.u32()? as usize;
                let _saved_nprobe = reader.u32()?;
                let centroids = reader.f32s(nlist * dim)?;
                let mut cells = Vec::with_capacity(nlist);
                for _ in 0..nlist {
                    let len = reader.u32()? as usize;
                    let mut cell = Vec::with_capacity(len);
                    for _ in 0..len {
                        cell.push(reader.u32()?);
                    }
                    cells.push(cell);
                }
                Some(IvfLayout {
                    nlist,
                    nprobe: config.faiss_nprobe,
                    centroids,
                    cells,
                })
            }
            _ => return Err(corrupt(path, "unknown index kind")),
        };

        tracing::info!(path = %path.display(), total = n, "dense_index_loaded");
        Ok(Self { matrix, ivf })
    }
}

fn top_k(mut scored: Vec<(f32, u32)>, k: usize) -> (Vec<f32>, Vec<i64>) {
    scored.sort_unstable_by(|a, b| {
        b.0.partial_cmp(&a.0)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then(a.1.cmp(&b.1))
    });
    scored.truncate(k);
    let scores = scored.iter().map(|&(s, _)| s).collect();
    let rows = scored.iter().map(|&(_, r)| r as i64).collect();
    (scores, rows)
}

/// Lloyd iterations with deterministic init (evenly spaced rows). Centroids
/// are re-normalised each round so assignment stays an inner-product argmax.
fn train_centroids(matrix: &EmbeddingMatrix, nlist: usize) -> Vec<f32> {
    let dim = matrix.dim;
    let mut centroids = Vec::with_capacity(nlist * dim);
    for c in 0..nlist {
        let row = c * matrix.n / nlist;
        centroids.extend_from_slice(matrix.row(row));
    }

    for _ in 0..KMEANS_ITERATIONS {
        let assignments: Vec<usize> = (0..matrix.n)
            .into_par_iter()
            .map(|row| nearest_centroid(matrix.row(row), &centroids, dim))
            .collect();

        let mut sums = vec![0f32; nlist * dim];
        let mut counts = vec![0usize; nlist];
        for (row, &cell) in assignments.iter().enumerate() {
            counts[cell] += 1;
            let src = matrix.row(row);
            let dst = &mut sums[cell * dim..(cell + 1) * dim];
            for (d, v) in dst.iter_mut().zip(src) {
                *d += v;
            }
        }

        for cell in 0..nlist {
            if counts[cell] == 0 {
                continue; // empty cell keeps its previous centroid
            }
            let slot = &mut sums[cell * dim..(cell + 1) * dim];
            let norm = slot.iter().map(|v| v * v).sum::<f32>().sqrt();
            if norm > 0.0 {
                for v in slot.iter_mut() {
                    *v /= norm;
                }
                centroids[cell * dim..(cell + 1) * dim].copy_from_slice(slot);
            }
        }
    }

    centroids
}

fn nearest_centroid(row: &[f32], centroids: &[f32], dim: usize) -> usize {
    let mut best = 0usize;
    let mut best_score = f32::NEG_INFINITY;
    for (c, centroid) in centroids.chunks_exact(dim).enumerate() {
        let score = dot(row, centroid);
        if score > best_score {
            best_score = score;
            best = c;
        }
    }
    best
}

fn assign_cells(matrix: &EmbeddingMatrix, centroids: &[f32], nlist: usize) -> Vec<Vec<u32>> {
    let dim = matrix.dim;
    let mut cells: Vec<Vec<u32>> = vec![Vec::new(); nlist];
    for row in 0..matrix.n {
        let cell = nearest_centroid(matrix.row(row), centroids, dim);
        cells[cell].push(row as u32);
    }
    cells
}

fn corrupt(path: &Path, what: &str) -> HermesError {
    HermesError::Io(std::io::Error::new(
        std::io::ErrorKind::InvalidData,
        format!("{}: {what}", path.display()),
    ))
}

struct ByteReader<'a> {
    bytes: &'a [u8],
    pos: usize,
    path: &'a Path,
}

impl<'a> ByteReader<'a> {
    fn new(bytes: &'a [u8], path: &'a Path) -> Self {
        Self { bytes, pos: 0, path }
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        if self.pos + n > self.bytes.len() {
            return Err(corrupt(self.path, "truncated artifact"));
        }
        let slice = &self.bytes[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    fn u8(&mut self) -> Result<u8> {
        Ok(self.take(1)?[0])
    }

    fn u32(&mut self) -> Result<u32> {
        let b = self.take(4)?;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn u64(&mut self) -> Result<u64> {
        let b = self.take(8)?;
        Ok(u64::from_le_bytes([b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7]]))
    }

    fn f32s(&mut self, count: usize) -> Result<Vec<f32>> {
        let bytes = self.take(count * 4)?;
        Ok(bytes
            .chunks_exact(4)
            .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
            .collect())
    }
}
