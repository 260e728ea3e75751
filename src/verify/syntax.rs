//! Syntax validation of phase output.
//!
//! Source files are parsed with tree-sitter; data files with their serde
//! parsers. Files with unrecognised extensions are skipped.

use std::path::Path;
use walkdir::WalkDir;

use super::CheckOutcome;

const CHECK: &str = "syntax_check";

/// Languages the syntax gate understands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceLanguage {
    Python,
    JavaScript,
    Rust,
    Bash,
    Json,
    Yaml,
    Toml,
}

impl SourceLanguage {
    pub fn from_path(path: &Path) -> Option<Self> {
        let ext = path.extension()?.to_str()?.to_ascii_lowercase();
        match ext.as_str() {
            "py" => Some(Self::Python),
            "js" | "mjs" | "cjs" => Some(Self::JavaScript),
            "rs" => Some(Self::Rust),
            "sh" | "bash" => Some(Self::Bash),
            "json" => Some(Self::Json),
            "yaml" | "yml" => Some(Self::Yaml),
            "toml" => Some(Self::Toml),
            _ => None,
        }
    }

    fn tree_sitter_language(&self) -> Option<tree_sitter::Language> {
        match self {
            Self::Python => Some(tree_sitter_python::LANGUAGE.into()),
            Self::JavaScript => Some(tree_sitter_javascript::LANGUAGE.into()),
            Self::Rust => Some(tree_sitter_rust::LANGUAGE.into()),
            Self::Bash => Some(tree_sitter_bash::LANGUAGE.into()),
            Self::Json | Self::Yaml | Self::Toml => None,
        }
    }
}

/// Parse `source` and describe the first syntax error, if any.
pub fn check_source(language: SourceLanguage, source: &str) -> Result<(), String> {
    match language {
        SourceLanguage::Json => serde_json::from_str::<serde_json::Value>(source)
            .map(|_| ())
            .map_err(|e| format!("line {}, column {}: {}", e.line(), e.column(), e)),
        SourceLanguage::Yaml => serde_yaml::from_str::<serde_yaml::Value>(source)
            .map(|_| ())
            .map_err(|e| e.to_string()),
        SourceLanguage::Toml => toml::from_str::<toml::Table>(source)
            .map(|_| ())
            .map_err(|e| e.message().to_string()),
        _ => {
            let Some(grammar) = language.tree_sitter_language() else {
                return Ok(());
            };
            let mut parser = tree_sitter::Parser::new();
            parser
                .set_language(&grammar)
                .map_err(|e| format!("failed to load grammar: {}", e))?;
            let tree = parser
                .parse(source, None)
                .ok_or_else(|| "parser produced no tree".to_string())?;
            let root = tree.root_node();
            if !root.has_error() {
                return Ok(());
            }
            Err(match first_error(root) {
                Some((row, col, missing)) if missing => {
                    format!("line {}, column {}: missing token", row + 1, col + 1)
                }
                Some((row, col, _)) => {
                    format!("line {}, column {}: unexpected input", row + 1, col + 1)
                }
                None => "syntax error".to_string(),
            })
        }
    }
}

/// Depth-first search for the first ERROR or MISSING node.
fn first_error(node: tree_sitter::Node) -> Option<(usize, usize, bool)> {
    if node.is_error() || node.is_missing() {
        let pos = node.start_position();
        return Some((pos.row, pos.column, node.is_missing()));
    }
    let mut cursor = node.walk();
    for child in node.children(&mut cursor) {
        if child.has_error()
            && let Some(found) = first_error(child)
        {
            return Some(found);
        }
    }
    None
}

/// Check every recognised file under `output_dir`, one outcome per file.
pub fn check_tree(output_dir: &Path) -> Vec<CheckOutcome> {
    let mut outcomes = Vec::new();

    let walker = WalkDir::new(output_dir)
        .sort_by_file_name()
        .into_iter()
        .filter_entry(|e| e.depth() == 0 || !e.file_name().to_string_lossy().starts_with('.'));

    for entry in walker.filter_map(|e| e.ok()) {
        if !entry.file_type().is_file() {
            continue;
        }
        let path = entry.path();
        let Some(language) = SourceLanguage::from_path(path) else {
            continue;
        };
        let rel = path
            .strip_prefix(output_dir)
            .unwrap_or(path)
            .display()
            .to_string();

        let outcome = match std::fs::read(path) {
            Err(e) => CheckOutcome::fail(CHECK, Some(rel), format!("unreadable: {}", e)),
            Ok(bytes) => match String::from_utf8(bytes) {
                Err(_) => CheckOutcome::fail(CHECK, Some(rel), "not valid UTF-8"),
                Ok(source) => match check_source(language, &source) {
                    Ok(()) => CheckOutcome::pass(CHECK, Some(rel), "parses"),
                    Err(message) => CheckOutcome::fail(CHECK, Some(rel), message),
                },
            },
        };
        outcomes.push(outcome);
    }

    if outcomes.is_empty() {
        outcomes.push(CheckOutcome::pass(CHECK, None, "no source files to check"));
    }
    outcomes
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    #[test]
    fn test_language_detection() {
        assert_eq!(
            SourceLanguage::from_path(Path::new("a/b.py")),
            Some(SourceLanguage::Python)
        );
        assert_eq!(
            SourceLanguage::from_path(Path::new("x.YML")),
            Some(SourceLanguage::Yaml)
        );
        assert_eq!(SourceLanguage::from_path(Path::new("README.md")), None);
        assert_eq!(SourceLanguage::from_path(Path::new("Makefile")), None);
    }

    #[test]
    fn test_tree_sitter_languages() {
        assert!(check_source(SourceLanguage::Python, "def f(x):\n    return x\n").is_ok());
        assert!(check_source(SourceLanguage::Python, "def f(:\n").is_err());
        assert!(check_source(SourceLanguage::JavaScript, "const a = () => 1;\n").is_ok());
        assert!(check_source(SourceLanguage::JavaScript, "function (\n").is_err());
        assert!(check_source(SourceLanguage::Rust, "fn main() { let x = 1; }\n").is_ok());
        assert!(check_source(SourceLanguage::Rust, "fn main() { let x = ; }\n").is_err());
        assert!(check_source(SourceLanguage::Bash, "echo hi\nif true; then echo ok; fi\n").is_ok());
    }

    #[test]
    fn test_error_location_is_reported() {
        let err = check_source(SourceLanguage::Python, "x = 1\ny = (\n").unwrap_err();
        assert!(err.starts_with("line "), "{err}");
    }

    #[test]
    fn test_data_formats() {
        assert!(check_source(SourceLanguage::Json, "{\"a\": [1, 2]}").is_ok());
        assert!(check_source(SourceLanguage::Json, "{\"a\": }").is_err());
        assert!(check_source(SourceLanguage::Yaml, "a:\n  - 1\n").is_ok());
        assert!(check_source(SourceLanguage::Yaml, "a: [1, 2\n").is_err());
        assert!(check_source(SourceLanguage::Toml, "[s]\nk = 1\n").is_ok());
        assert!(check_source(SourceLanguage::Toml, "k = = 1\n").is_err());
    }

    #[test]
    fn test_check_tree_reports_each_file() {
        let dir = tempdir().unwrap();
        fs::create_dir_all(dir.path().join("new/pkg")).unwrap();
        fs::create_dir_all(dir.path().join(".git")).unwrap();
        fs::write(dir.path().join("new/pkg/good.py"), "x = 1\n").unwrap();
        fs::write(dir.path().join("new/bad.json"), "{").unwrap();
        fs::write(dir.path().join("new/notes.md"), "# not code").unwrap();
        fs::write(dir.path().join(".git/config.toml"), "= broken").unwrap();

        let outcomes = check_tree(dir.path());
        assert_eq!(outcomes.len(), 2);
        let bad = outcomes.iter().find(|o| !o.passed).unwrap();
        assert_eq!(bad.subject.as_deref(), Some("new/bad.json"));
    }

    #[test]
    fn test_empty_tree_passes() {
        let dir = tempdir().unwrap();
        let outcomes = check_tree(dir.path());
        assert_eq!(outcomes.len(), 1);
        assert!(outcomes[0].passed);
    }
}
