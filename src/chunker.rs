use regex::Regex;
use std::sync::OnceLock;
use tree_sitter::{Node, Parser};

use crate::config::ChunkingConfig;

/// A contiguous block of source code extracted from a file.
///
/// `start_line`/`end_line` are 1-indexed and inclusive; `code_text` is the
/// exact substring of the source with line breaks preserved.
#[derive(Debug, Clone, PartialEq)]
pub struct Chunk {
    pub file_path: String,
    pub language: String,
    pub start_line: u32,
    pub end_line: u32,
    pub code_text: String,
    /// Best-effort function/class name; empty when unknown.
    pub symbol_name: String,
}

/// Interface every language chunker implements. Chunkers share nothing but
/// this signature.
pub trait ChunkFile {
    fn chunk_file(&self, source: &str, file_path: &str, language: &str) -> Vec<Chunk>;
}

/// Resolve the chunker for a language; unknown languages get the heuristic
/// line-window chunker.
pub fn chunker_for(language: &str, config: &ChunkingConfig) -> Box<dyn ChunkFile> {
    match language {
        "python" => Box::new(PythonChunker::new(config)),
        "javascript" | "typescript" => Box::new(JsChunker::new(config)),
        _ => Box::new(HeuristicChunker::new(config)),
    }
}

pub fn chunk_source(
    source: &str,
    file_path: &str,
    language: &str,
    config: &ChunkingConfig,
) -> Vec<Chunk> {
    chunker_for(language, config).chunk_file(source, file_path, language)
}

/// Split into lines keeping the terminators, so concatenation reproduces the
/// original text exactly.
fn source_lines(source: &str) -> Vec<&str> {
    source.split_inclusive('\n').collect()
}

fn window_lines(max_chars: usize) -> usize {
    (max_chars / 80).max(10)
}

fn stripped_len(text: &str) -> usize {
    text.trim().len()
}

// ---------------------------------------------------------------------------
// Shared line-window procedure
// ---------------------------------------------------------------------------

fn block_hint_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(
            r"^(?:func |fn |def |class |public |private |protected |interface |struct |impl |module )",
        )
        .unwrap()
    })
}

/// Sliding line window with overlap, cutting at block-hint lines when one is
/// found in the back half of the window.
///
/// `base_line` is the 1-indexed file line of `lines[0]`. With
/// `part_symbol = Some(name)` the emitted chunks are named
/// `"<name>::part<k>"` (the split-large path); with `None` they carry no
/// symbol (the heuristic fallback).
fn line_window_chunks(
    lines: &[&str],
    file_path: &str,
    language: &str,
    config: &ChunkingConfig,
    base_line: u32,
    part_symbol: Option<&str>,
) -> Vec<Chunk> {
    let mut chunks = Vec::new();
    if lines.is_empty() {
        return chunks;
    }

    let max_lines = window_lines(config.max_chars);
    let overlap = config.overlap_lines;
    let hint = block_hint_regex();

    let mut i = 0usize;
    let mut part = 0usize;
    while i < lines.len() {
        let window_end = (i + max_lines).min(lines.len());
        let mut break_at = window_end;

        // Prefer a structural boundary in the back half of the window.
        let scan_floor = i + max_lines / 2;
        for j in (scan_floor..window_end).rev() {
            if j < lines.len() && hint.is_match(lines[j]) {
                break_at = j;
                break;
            }
        }

        let text: String = lines[i..break_at].concat();
        if stripped_len(&text) >= config.min_chars {
            let symbol_name = match part_symbol {
                Some(parent) => format!("{parent}::part{part}"),
                None => String::new(),
            };
            chunks.push(Chunk {
                file_path: file_path.to_string(),
                language: language.to_string(),
                start_line: base_line + i as u32,
                end_line: base_line + break_at as u32 - 1,
                code_text: text,
                symbol_name,
            });
        }
        part += 1;

        if break_at >= lines.len() {
            break;
        }
        i = break_at.saturating_sub(overlap).max(i + 1);
    }

    chunks
}

// ---------------------------------------------------------------------------
// Heuristic (fallback) chunker
// ---------------------------------------------------------------------------

/// Fixed-size line windows with overlap; works for any language.
pub struct HeuristicChunker {
    config: ChunkingConfig,
}

impl HeuristicChunker {
    pub fn new(config: &ChunkingConfig) -> Self {
        Self {
            config: config.clone(),
        }
    }
}

impl ChunkFile for HeuristicChunker {
    fn chunk_file(&self, source: &str, file_path: &str, language: &str) -> Vec<Chunk> {
        let lines = source_lines(source);
        line_window_chunks(&lines, file_path, language, &self.config, 1, None)
    }
}

// ---------------------------------------------------------------------------
// Python chunker (AST boundaries)
// ---------------------------------------------------------------------------

/// Splits Python files at top-level def/class boundaries. Falls back to the
/// heuristic chunker when the file does not parse or has no top-level
/// definitions.
pub struct PythonChunker {
    config: ChunkingConfig,
}

impl PythonChunker {
    pub fn new(config: &ChunkingConfig) -> Self {
        Self {
            config: config.clone(),
        }
    }

    fn fallback(&self, source: &str, file_path: &str, language: &str) -> Vec<Chunk> {
        tracing::debug!(file = file_path, "ast_parse_failed_fallback");
        HeuristicChunker::new(&self.config).chunk_file(source, file_path, language)
    }
}

/// The node that defines a chunk: for decorated definitions, the inner
/// def/class (decorators are left to the preamble/previous chunk, matching
/// line-number semantics of plain definitions).
fn definition_node(node: Node<'_>) -> Option<Node<'_>> {
    match node.kind() {
        "function_definition" | "class_definition" => Some(node),
        "decorated_definition" => node.child_by_field_name("definition"),
        _ => None,
    }
}

fn definition_name(node: Node<'_>, source: &str) -> String {
    node.child_by_field_name("name")
        .and_then(|n| n.utf8_text(source.as_bytes()).ok())
        .unwrap_or_default()
        .to_string()
}

impl ChunkFile for PythonChunker {
    fn chunk_file(&self, source: &str, file_path: &str, language: &str) -> Vec<Chunk> {
        let mut parser = Parser::new();
        if parser.set_language(&tree_sitter_python::language()).is_err() {
            return self.fallback(source, file_path, language);
        }
        let Some(tree) = parser.parse(source, None) else {
            return self.fallback(source, file_path, language);
        };
        let root = tree.root_node();
        if root.has_error() {
            return self.fallback(source, file_path, language);
        }

        let mut cursor = root.walk();
        let defs: Vec<Node<'_>> = root
            .named_children(&mut cursor)
            .filter_map(definition_node)
            .collect();
        if defs.is_empty() {
            return self.fallback(source, file_path, language);
        }

        let lines = source_lines(source);
        let mut chunks = Vec::new();

        // Module preamble: imports and constants before the first definition.
        let first_def_row = defs[0].start_position().row;
        if first_def_row > 0 {
            let preamble: String = lines[..first_def_row.min(lines.len())].concat();
            if stripped_len(&preamble) >= self.config.min_chars {
                chunks.push(Chunk {
                    file_path: file_path.to_string(),
                    language: language.to_string(),
                    start_line: 1,
                    end_line: first_def_row as u32,
                    code_text: preamble,
                    symbol_name: "<module>".to_string(),
                });
            }
        }

        for def in defs {
            let start_row = def.start_position().row;
            let end_row = def.end_position().row.min(lines.len().saturating_sub(1));
            if start_row > end_row || start_row >= lines.len() {
                continue;
            }
            let block = &lines[start_row..=end_row];
            let text: String = block.concat();
            let name = definition_name(def, source);

            if text.len() > self.config.max_chars {
                chunks.extend(line_window_chunks(
                    block,
                    file_path,
                    language,
                    &self.config,
                    start_row as u32 + 1,
                    Some(&name),
                ));
            } else if stripped_len(&text) >= self.config.min_chars {
                chunks.push(Chunk {
                    file_path: file_path.to_string(),
                    language: language.to_string(),
                    start_line: start_row as u32 + 1,
                    end_line: end_row as u32 + 1,
                    code_text: text,
                    symbol_name: name,
                });
            }
        }

        chunks
    }
}

// ---------------------------------------------------------------------------
// JavaScript / TypeScript chunker (regex boundaries)
// ---------------------------------------------------------------------------

fn js_block_start_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(
            r"^(?:export\s+)?(?:default\s+)?(?:(?:async\s+)?function\s+\w+|class\s+\w+|const\s+\w+\s*=\s*(?:async\s*)?\()",
        )
        .unwrap()
    })
}

fn js_symbol_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?:function|class|const|let|var)\s+(\w+)").unwrap())
}

/// Regex-scans for top-level function/class/const blocks. Falls back when
/// fewer than two boundaries are found.
pub struct JsChunker {
    config: ChunkingConfig,
}

impl JsChunker {
    pub fn new(config: &ChunkingConfig) -> Self {
        Self {
            config: config.clone(),
        }
    }

    /// 0-indexed line numbers where blocks start; line 0 is always one.
    fn find_boundaries(lines: &[&str]) -> Vec<usize> {
        let re = js_block_start_regex();
        let mut bounds = vec![0];
        for (i, line) in lines.iter().enumerate().skip(1) {
            if re.is_match(line) {
                bounds.push(i);
            }
        }
        bounds
    }

    fn extract_symbol(line: &str) -> String {
        js_symbol_regex()
            .captures(line)
            .and_then(|c| c.get(1))
            .map(|m| m.as_str().to_string())
            .unwrap_or_default()
    }
}

impl ChunkFile for JsChunker {
    fn chunk_file(&self, source: &str, file_path: &str, language: &str) -> Vec<Chunk> {
        let lines = source_lines(source);
        let boundaries = Self::find_boundaries(&lines);

        if boundaries.len() < 2 {
            return HeuristicChunker::new(&self.config).chunk_file(source, file_path, language);
        }

        let mut chunks = Vec::new();
        for (idx, &start) in boundaries.iter().enumerate() {
            let end_excl = boundaries
                .get(idx + 1)
                .copied()
                .unwrap_or(lines.len());
            if start >= end_excl {
                continue;
            }
            let block = &lines[start..end_excl];
            let text: String = block.concat();
            if stripped_len(&text) < self.config.min_chars {
                continue;
            }

            let symbol = Self::extract_symbol(lines[start].trim_start());

            if text.len() > self.config.max_chars {
                chunks.extend(line_window_chunks(
                    block,
                    file_path,
                    language,
                    &self.config,
                    start as u32 + 1,
                    Some(&symbol),
                ));
            } else {
                chunks.push(Chunk {
                    file_path: file_path.to_string(),
                    language: language.to_string(),
                    start_line: start as u32 + 1,
                    end_line: end_excl as u32,
                    code_text: text,
                    symbol_name: symbol,
                });
            }
        }

        chunks
    }
}
