//! Heuristic strategy objects used by the execution engine: test-versus-
//! implementation classification, build-error severity, per-language file
//! naming and build manifest provisioning.
//!
//! The heuristics sit behind traits so callers can swap them without
//! touching the loop.

use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

// ---------------------------------------------------------------------------
// File kind
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FileKind {
    Test,
    Implementation,
}

pub trait FileClassifier: Send + Sync {
    /// Decide what a generation request produces. `explicit` is a caller
    /// supplied hint (`"test"` / `"implementation"`) that wins when present.
    fn classify(&self, description: &str, requirements: &str, explicit: Option<&str>) -> FileKind;

    fn is_test_path(&self, path: &Path) -> bool;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct HeuristicFileClassifier;

const TEST_PHRASES: &[&str] = &[
    "unit test",
    "unit-test",
    "test file",
    "test case",
    "test suite",
    "tests for",
    "test for ",
    "write tests",
    "write a test",
    "add tests",
    "table-driven test",
    "_test.",
    ".test.",
    ".spec.",
    "test_",
];

impl FileClassifier for HeuristicFileClassifier {
    fn classify(&self, description: &str, requirements: &str, explicit: Option<&str>) -> FileKind {
        if let Some(hint) = explicit {
            match hint.trim().to_ascii_lowercase().as_str() {
                "test" | "tests" => return FileKind::Test,
                "implementation" | "impl" | "source" => return FileKind::Implementation,
                _ => {}
            }
        }
        let text = format!("{description}\n{requirements}").to_lowercase();
        if TEST_PHRASES.iter().any(|p| text.contains(p)) {
            FileKind::Test
        } else {
            FileKind::Implementation
        }
    }

    fn is_test_path(&self, path: &Path) -> bool {
        let name = path
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or_default()
            .to_lowercase();
        let in_tests_dir = path
            .components()
            .any(|c| matches!(c.as_os_str().to_str(), Some("tests" | "test" | "__tests__")));
        in_tests_dir
            || name.starts_with("test_")
            || name.contains("_test.")
            || name.contains(".test.")
            || name.contains(".spec.")
    }
}

// ---------------------------------------------------------------------------
// Language and file naming
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Language {
    #[default]
    Go,
    Python,
    JavaScript,
    TypeScript,
    Rust,
}

impl Language {
    pub fn as_str(&self) -> &'static str {
        match self {
            Language::Go => "go",
            Language::Python => "python",
            Language::JavaScript => "javascript",
            Language::TypeScript => "typescript",
            Language::Rust => "rust",
        }
    }

    /// Parse an explicit language argument.
    pub fn from_hint(hint: &str) -> Option<Self> {
        match hint.trim().to_ascii_lowercase().as_str() {
            "go" | "golang" => Some(Language::Go),
            "python" | "py" | "python3" => Some(Language::Python),
            "javascript" | "js" | "node" => Some(Language::JavaScript),
            "typescript" | "ts" => Some(Language::TypeScript),
            "rust" | "rs" => Some(Language::Rust),
            _ => None,
        }
    }

    /// Guess the language from free text (task description, prompt).
    pub fn detect(text: &str) -> Option<Self> {
        let lower = text.to_lowercase();
        let words: BTreeSet<&str> = lower
            .split(|c: char| !c.is_ascii_alphanumeric())
            .filter(|w| !w.is_empty())
            .collect();
        [
            (&["golang", "go"][..], Language::Go),
            (&["python", "py", "pytest"][..], Language::Python),
            (&["typescript", "ts"][..], Language::TypeScript),
            (&["javascript", "js", "node", "nodejs", "jest"][..], Language::JavaScript),
            (&["rust", "cargo", "rs"][..], Language::Rust),
        ]
        .into_iter()
        .find(|(keys, _)| keys.iter().any(|k| words.contains(k)))
        .map(|(_, lang)| lang)
    }

    /// File name, relative to the project directory, for generated code.
    pub fn file_name(&self, kind: FileKind) -> &'static str {
        match (self, kind) {
            (Language::Go, FileKind::Implementation) => "main.go",
            (Language::Go, FileKind::Test) => "main_test.go",
            (Language::Python, FileKind::Implementation) => "main.py",
            (Language::Python, FileKind::Test) => "test_main.py",
            (Language::JavaScript, FileKind::Implementation) => "index.js",
            (Language::JavaScript, FileKind::Test) => "index.test.js",
            (Language::TypeScript, FileKind::Implementation) => "index.ts",
            (Language::TypeScript, FileKind::Test) => "index.test.ts",
            (Language::Rust, FileKind::Implementation) => "src/main.rs",
            (Language::Rust, FileKind::Test) => "tests/main_test.rs",
        }
    }

    /// Build manifest file name and minimal contents, if the toolchain
    /// needs one.
    pub fn manifest(&self, project_name: &str) -> Option<(&'static str, String)> {
        let name = sanitize_module_name(project_name);
        match self {
            Language::Go => Some(("go.mod", format!("module {name}\n\ngo 1.21\n"))),
            Language::JavaScript | Language::TypeScript => Some((
                "package.json",
                format!(
                    "{{\n  \"name\": \"{name}\",\n  \"version\": \"0.1.0\",\n  \"private\": true\n}}\n"
                ),
            )),
            Language::Rust => Some((
                "Cargo.toml",
                format!(
                    "[package]\nname = \"{name}\"\nversion = \"0.1.0\"\nedition = \"2021\"\n\n[dependencies]\n"
                ),
            )),
            Language::Python => None,
        }
    }
}

impl fmt::Display for Language {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

fn sanitize_module_name(raw: &str) -> String {
    let name: String = raw
        .to_lowercase()
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '-' })
        .collect();
    let name = name.trim_matches('-');
    if name.is_empty() || name.starts_with(|c: char| c.is_ascii_digit()) {
        format!("app-{name}").trim_end_matches('-').to_string()
    } else {
        name.to_string()
    }
}

/// Write a minimal build manifest into `dir` unless one already exists.
/// Returns the path written, if any.
pub async fn provision_manifest(dir: &Path, language: Language) -> std::io::Result<Option<PathBuf>> {
    let project = dir
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("app");
    let Some((file, contents)) = language.manifest(project) else {
        return Ok(None);
    };
    let path = dir.join(file);
    if tokio::fs::try_exists(&path).await? {
        return Ok(None);
    }
    tokio::fs::create_dir_all(dir).await?;
    tokio::fs::write(&path, contents).await?;
    debug!(path = %path.display(), "provisioned build manifest");
    Ok(Some(path))
}

// ---------------------------------------------------------------------------
// Build results
// ---------------------------------------------------------------------------

/// One compiler diagnostic from the build collaborator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BuildDiagnostic {
    #[serde(default)]
    pub file: String,
    #[serde(default)]
    pub line: u32,
    #[serde(default)]
    pub column: u32,
    #[serde(default)]
    pub message: String,
    #[serde(default, rename = "type")]
    pub error_type: String,
}

impl fmt::Display for BuildDiagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.file.is_empty(), self.line) {
            (true, _) => f.write_str(&self.message),
            (false, 0) => write!(f, "{}: {}", self.file, self.message),
            (false, line) => write!(f, "{}:{}: {}", self.file, line, self.message),
        }
    }
}

/// The build-result contract:
/// `{"success", "error_count", "errors": [{file, line, column, message, type}], "output"}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BuildReport {
    pub success: bool,
    #[serde(default)]
    pub error_count: usize,
    #[serde(default)]
    pub errors: Vec<BuildDiagnostic>,
    #[serde(default)]
    pub output: String,
}

impl BuildReport {
    /// Read a report from a tool's structured output, falling back to its
    /// text. Text that is not a report is treated as a failed build whose
    /// only diagnostic information is the raw text.
    pub fn from_tool_output(structured: Option<&Value>, text: &str) -> Self {
        let parsed = structured
            .cloned()
            .or_else(|| serde_json::from_str::<Value>(text).ok())
            .and_then(|v| Self::from_value(&v));
        parsed.unwrap_or_else(|| BuildReport {
            success: false,
            error_count: 0,
            errors: Vec::new(),
            output: text.to_string(),
        })
    }

    fn from_value(value: &Value) -> Option<Self> {
        let success = value.get("success")?.as_bool()?;
        let errors = value
            .get("errors")
            .and_then(|e| serde_json::from_value::<Vec<BuildDiagnostic>>(e.clone()).ok())
            .unwrap_or_default();
        let error_count = value
            .get("error_count")
            .and_then(Value::as_u64)
            .map(|n| n as usize)
            .unwrap_or(errors.len());
        let output = value
            .get("output")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        Some(BuildReport {
            success,
            error_count,
            errors,
            output,
        })
    }

    /// Human-readable error list; the raw output when no structured errors
    /// were reported.
    pub fn error_text(&self) -> String {
        if self.errors.is_empty() {
            return self.output.trim().to_string();
        }
        self.errors
            .iter()
            .map(|e| e.to_string())
            .collect::<Vec<_>>()
            .join("\n")
    }

    /// Distinct files named by diagnostics, first-seen order.
    pub fn affected_files(&self) -> Vec<String> {
        let mut seen = Vec::new();
        for e in &self.errors {
            if !e.file.is_empty() && !seen.contains(&e.file) {
                seen.push(e.file.clone());
            }
        }
        seen
    }
}

// ---------------------------------------------------------------------------
// Error severity
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BuildSeverity {
    /// Local to one file and cheap to fix in place.
    Simple,
    /// Needs a dedicated fix task.
    Complex,
}

impl fmt::Display for BuildSeverity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            BuildSeverity::Simple => "simple",
            BuildSeverity::Complex => "complex",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorAssessment {
    pub severity: BuildSeverity,
    pub error_type: String,
    pub affected_files: usize,
    pub error_count: usize,
    pub suggestion: String,
}

pub trait ErrorClassifier: Send + Sync {
    fn classify(&self, report: &BuildReport) -> ErrorAssessment;
}

/// Simple when the failure touches at most one file, stays under
/// `max_simple_errors`, and mentions nothing that points outside the file
/// (missing modules, linker failures, import cycles).
#[derive(Debug, Clone)]
pub struct HeuristicErrorClassifier {
    pub max_simple_errors: usize,
}

impl Default for HeuristicErrorClassifier {
    fn default() -> Self {
        Self {
            max_simple_errors: 3,
        }
    }
}

const COMPLEX_MARKERS: &[&str] = &[
    "import cycle",
    "cannot find package",
    "no required module",
    "module not found",
    "cannot find module",
    "no module named",
    "unresolved import",
    "undefined reference",
    "linker",
    "permission denied",
    "no such file",
];

const SUGGESTIONS: &[(&str, &str)] = &[
    ("undefined", "Define or import the missing identifier."),
    ("not declared", "Declare the identifier before use."),
    ("unused", "Remove the unused import or variable."),
    ("declared and not used", "Remove or use the unused variable."),
    ("mismatched types", "Convert the operands to matching types."),
    ("cannot use", "Fix the type of the value passed or assigned."),
    ("expected", "Fix the syntax error at the reported line."),
    ("syntax", "Fix the syntax error at the reported line."),
    ("missing return", "Add the missing return statement."),
    ("cannot find package", "Add the missing dependency to the build manifest."),
    ("module", "Add the missing dependency to the build manifest."),
];

impl ErrorClassifier for HeuristicErrorClassifier {
    fn classify(&self, report: &BuildReport) -> ErrorAssessment {
        let affected_files = report.affected_files().len();
        let error_count = report
            .error_count
            .max(report.errors.len())
            .max(usize::from(!report.output.trim().is_empty()));

        let text = report.error_text().to_lowercase();
        let external = COMPLEX_MARKERS.iter().any(|m| text.contains(m));
        let severity = if external || affected_files > 1 || error_count > self.max_simple_errors {
            BuildSeverity::Complex
        } else {
            BuildSeverity::Simple
        };

        let error_type = dominant_type(&report.errors).unwrap_or_else(|| "build_error".to_string());
        let first = report
            .errors
            .first()
            .map(|e| e.message.to_lowercase())
            .unwrap_or(text);
        let suggestion = SUGGESTIONS
            .iter()
            .find(|(needle, _)| first.contains(needle))
            .map(|(_, s)| s.to_string())
            .unwrap_or_else(|| "Fix the reported compiler errors.".to_string());

        ErrorAssessment {
            severity,
            error_type,
            affected_files,
            error_count,
            suggestion,
        }
    }
}

fn dominant_type(errors: &[BuildDiagnostic]) -> Option<String> {
    let mut counts: HashMap<&str, usize> = HashMap::new();
    for e in errors.iter().filter(|e| !e.error_type.is_empty()) {
        *counts.entry(e.error_type.as_str()).or_default() += 1;
    }
    counts
        .into_iter()
        .max_by(|a, b| a.1.cmp(&b.1).then_with(|| b.0.cmp(a.0)))
        .map(|(t, _)| t.to_string())
}
