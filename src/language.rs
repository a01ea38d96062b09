use std::path::Path;

/// Map a file extension (case-insensitive) to a language tag.
///
/// The tag set is closed: code languages plus a handful of config/doc tags
/// that are recognised but excluded from indexing (see [`is_code_language`]).
pub fn detect_language(path: &Path) -> Option<&'static str> {
    let ext = path
        .extension()
        .map(|e| e.to_string_lossy().to_lowercase())?;
    let lang = match ext.as_str() {
        "py" | "pyi" => "python",
        "js" | "jsx" => "javascript",
        "ts" | "tsx" => "typescript",
        "java" => "java",
        "go" => "go",
        "rs" => "rust",
        "c" | "h" => "c",
        "cpp" | "cc" | "hpp" => "cpp",
        "cs" => "csharp",
        "rb" => "ruby",
        "php" => "php",
        "swift" => "swift",
        "kt" => "kotlin",
        "scala" => "scala",
        "r" => "r",
        "sh" | "bash" | "zsh" => "shell",
        "lua" => "lua",
        "sql" => "sql",
        "md" => "markdown",
        "yaml" | "yml" => "yaml",
        "json" => "json",
        "toml" => "toml",
        "xml" => "xml",
        "html" => "html",
        "css" => "css",
        "scss" => "scss",
        _ => return None,
    };
    Some(lang)
}

/// Languages whose content is indexed. Config and doc formats are detected
/// but skipped by the scanner.
pub fn is_code_language(lang: &str) -> bool {
    matches!(
        lang,
        "python"
            | "javascript"
            | "typescript"
            | "java"
            | "go"
            | "rust"
            | "c"
            | "cpp"
            | "csharp"
            | "ruby"
            | "php"
            | "swift"
            | "kotlin"
            | "scala"
            | "lua"
            | "shell"
            | "r"
    )
}
