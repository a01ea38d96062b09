use regex::Regex;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use crate::dense::EmbeddingMatrix;
use crate::error::{HermesError, Result};

/// The four files that make up one artifacts set.
pub const METADATA_DB: &str = "metadata.db";
pub const DENSE_INDEX: &str = "faiss.index";
pub const EMBEDDINGS_NPY: &str = "embeddings.npy";
pub const SPARSE_INDEX: &str = "sparse_index.json";

/// Staging path for an artifact while the indexer is still running.
/// Staged files are renamed into place only once every artifact is built,
/// so a concurrent query service never observes a partial set.
pub fn staged(dir: &Path, name: &str) -> PathBuf {
    dir.join(format!("{name}.tmp"))
}

/// Rename every staged artifact to its final name.
pub fn publish(dir: &Path, names: &[&str]) -> Result<()> {
    for name in names {
        std::fs::rename(staged(dir, name), dir.join(name))?;
    }
    Ok(())
}

const NPY_MAGIC: &[u8] = b"\x93NUMPY";

/// Write an `[n x d]` f32 matrix as an NPY v1.0 file (`<f4`, C order).
pub fn write_npy(path: &Path, matrix: &EmbeddingMatrix) -> Result<()> {
    let header_body = format!(
        "{{'descr': '<f4', 'fortran_order': False, 'shape': ({}, {}), }}",
        matrix.n, matrix.dim
    );
    // Pad so magic + version + length field + header is a multiple of 64,
    // with a trailing newline.
    let prefix_len = NPY_MAGIC.len() + 2 + 2;
    let unpadded = prefix_len + header_body.len() + 1;
    let padding = (64 - unpadded % 64) % 64;
    let header = format!("{header_body}{}\n", " ".repeat(padding));

    let mut file = std::fs::File::create(path)?;
    file.write_all(NPY_MAGIC)?;
    file.write_all(&[0x01, 0x00])?;
    file.write_all(&(header.len() as u16).to_le_bytes())?;
    file.write_all(header.as_bytes())?;
    let mut data = Vec::with_capacity(matrix.data.len() * 4);
    for value in &matrix.data {
        data.extend_from_slice(&value.to_le_bytes());
    }
    file.write_all(&data)?;
    file.sync_all()?;
    Ok(())
}

fn npy_shape_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"'shape':\s*\((\d+),\s*(\d+)\)").unwrap())
}

fn invalid(path: &Path, what: &str) -> HermesError {
    HermesError::Io(std::io::Error::new(
        std::io::ErrorKind::InvalidData,
        format!("{}: {what}", path.display()),
    ))
}

/// Read a 2-D `<f4` C-order NPY file back into a matrix.
pub fn read_npy(path: &Path) -> Result<EmbeddingMatrix> {
    let bytes = std::fs::read(path)?;
    if bytes.len() < 10 || &bytes[..6] != NPY_MAGIC {
        return Err(invalid(path, "not an NPY file"));
    }
    if bytes[6] != 0x01 {
        return Err(invalid(path, "unsupported NPY version"));
    }
    let header_len = u16::from_le_bytes([bytes[8], bytes[9]]) as usize;
    let data_start = 10 + header_len;
    if bytes.len() < data_start {
        return Err(invalid(path, "truncated NPY header"));
    }
    let header = String::from_utf8_lossy(&bytes[10..data_start]);
    if !header.contains("'<f4'") {
        return Err(invalid(path, "expected little-endian f32 data"));
    }
    if header.contains("'fortran_order': True") {
        return Err(invalid(path, "fortran order is not supported"));
    }
    let caps = npy_shape_regex()
        .captures(&header)
        .ok_or_else(|| invalid(path, "missing 2-D shape"))?;
    let n: usize = caps[1].parse().map_err(|_| invalid(path, "bad shape"))?;
    let dim: usize = caps[2].parse().map_err(|_| invalid(path, "bad shape"))?;

    let payload = &bytes[data_start..];
    if payload.len() != n * dim * 4 {
        return Err(invalid(path, "payload size does not match shape"));
    }
    let data: Vec<f32> = payload
        .chunks_exact(4)
        .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
        .collect();
    Ok(EmbeddingMatrix { data, n, dim })
}
