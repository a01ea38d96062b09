use ignore::WalkBuilder;
use std::path::{Path, PathBuf};

use crate::error::Result;
use crate::language::{detect_language, is_code_language};

/// Directory names that are always pruned, anywhere in the tree. Names
/// starting with `.` are pruned as well.
const SKIP_DIRS: &[&str] = &[
    ".git",
    "node_modules",
    "__pycache__",
    "venv",
    ".venv",
    "dist",
    "build",
    "vendor",
    "third_party",
    "artifacts",
    "reports",
];

/// Files larger than this are skipped; keeps generated bundles and data
/// blobs out of the index.
pub const MAX_FILE_BYTES: u64 = 1_048_576; // 1 MiB

/// A source file discovered in the repository.
#[derive(Debug, Clone)]
pub struct ScannedFile {
    pub abs_path: PathBuf,
    /// Repository-relative, forward-slash normalised.
    pub rel_path: String,
    pub language: &'static str,
    pub size_bytes: u64,
}

fn should_skip_dir(name: &str) -> bool {
    name.starts_with('.') || SKIP_DIRS.contains(&name)
}

/// Recursively scan `repo_root` and return indexable source files.
///
/// Output order is filesystem order and differs across platforms; callers
/// must not rely on it. Deterministic ordering is established later when the
/// metadata store assigns chunk ids in insertion order.
pub fn scan_repository(repo_root: &Path) -> Result<Vec<ScannedFile>> {
    let repo_root = repo_root.canonicalize()?;

    let walker = WalkBuilder::new(&repo_root)
        .standard_filters(false)
        .filter_entry(|entry| {
            if entry.depth() == 0 {
                return true;
            }
            let is_dir = entry.file_type().map(|ft| ft.is_dir()).unwrap_or(false);
            if !is_dir {
                return true;
            }
            let name = entry.file_name().to_string_lossy();
            !should_skip_dir(&name)
        })
        .build();

    let mut results = Vec::new();
    for item in walker {
        let entry = match item {
            Ok(entry) => entry,
            Err(_) => continue,
        };
        if !entry.file_type().map(|ft| ft.is_file()).unwrap_or(false) {
            continue;
        }

        let abs_path = entry.into_path();
        let Some(language) = detect_language(&abs_path) else {
            continue;
        };
        if !is_code_language(language) {
            continue;
        }

        let size_bytes = match std::fs::metadata(&abs_path) {
            Ok(meta) => meta.len(),
            Err(_) => continue,
        };
        if size_bytes == 0 || size_bytes > MAX_FILE_BYTES {
            continue;
        }

        let rel_path = match abs_path.strip_prefix(&repo_root) {
            Ok(rel) => rel.to_string_lossy().replace('\\', "/"),
            Err(_) => continue,
        };

        results.push(ScannedFile {
            abs_path,
            rel_path,
            language,
            size_bytes,
        });
    }

    tracing::info!(
        repo = %repo_root.display(),
        files_found = results.len(),
        "repo_scan_complete"
    );
    Ok(results)
}
