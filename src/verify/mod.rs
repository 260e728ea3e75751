//! Verification Engine: evaluates a phase's quality gate against its output.
//!
//! Gate types (composable, each producing independent check outcomes):
//! - `file_existence` - see [`files`]
//! - `syntax_check` - see [`syntax`]
//! - `tests_pass` - see [`test_suite`]
//! - `structural_document` - see [`document`]
//!
//! The engine never retries and never mutates the output it inspects.

pub mod document;
pub mod files;
pub mod syntax;
pub mod test_suite;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::config::VerificationSettings;
use crate::project::{FileKind, GateCheck, PhaseSpec, Project};

/// Result of one individual check.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckOutcome {
    /// Gate type that produced this check.
    pub check: String,
    pub passed: bool,
    pub message: String,
    /// File or command the check was about, when there is one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subject: Option<String>,
}

impl CheckOutcome {
    pub fn pass(check: &str, subject: Option<String>, message: impl Into<String>) -> Self {
        Self {
            check: check.to_string(),
            passed: true,
            message: message.into(),
            subject,
        }
    }

    pub fn fail(check: &str, subject: Option<String>, message: impl Into<String>) -> Self {
        Self {
            check: check.to_string(),
            passed: false,
            message: message.into(),
            subject,
        }
    }
}

/// Outcome of evaluating a phase's quality gate once. Never mutated after creation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QualityGateResult {
    /// Gate types evaluated, in manifest order.
    pub gates: Vec<String>,
    pub passed: bool,
    pub checks: Vec<CheckOutcome>,
    pub evaluated_at: DateTime<Utc>,
}

impl QualityGateResult {
    pub fn from_checks(gates: Vec<String>, checks: Vec<CheckOutcome>) -> Self {
        let passed = checks.iter().all(|c| c.passed);
        Self {
            gates,
            passed,
            checks,
            evaluated_at: Utc::now(),
        }
    }

    pub fn failures(&self) -> impl Iterator<Item = &CheckOutcome> {
        self.checks.iter().filter(|c| !c.passed)
    }

    /// One-line description of the failed checks.
    pub fn summary(&self) -> String {
        if self.passed {
            return format!("{} checks passed", self.checks.len());
        }
        let failed: Vec<String> = self
            .failures()
            .map(|c| match &c.subject {
                Some(subject) => format!("{} ({})", c.check, subject),
                None => c.check.clone(),
            })
            .collect();
        format!("{} failed: {}", failed.len(), failed.join(", "))
    }
}

/// Evaluates quality gates with configured defaults.
#[derive(Debug, Clone)]
pub struct Verifier {
    defaults: VerificationSettings,
}

impl Verifier {
    pub fn new(defaults: VerificationSettings) -> Self {
        Self { defaults }
    }

    /// Evaluate every gate declared on `phase` against `output_dir`.
    ///
    /// A phase without gates passes with no checks.
    pub async fn verify(
        &self,
        project: &Project,
        phase: &PhaseSpec,
        output_dir: &Path,
    ) -> QualityGateResult {
        let mut gates = Vec::new();
        let mut checks = Vec::new();

        for gate in &phase.quality_gate {
            gates.push(gate.name().to_string());
            match gate {
                GateCheck::FileExistence => {
                    let expected = project.expected_files(phase);
                    checks.extend(files::check_file_existence(output_dir, &expected));
                }
                GateCheck::SyntaxCheck => {
                    checks.extend(syntax::check_tree(output_dir));
                }
                GateCheck::TestsPass {
                    command,
                    timeout_secs,
                } => {
                    let argv = command
                        .as_ref()
                        .unwrap_or(&self.defaults.test_command);
                    let timeout = Duration::from_secs(
                        timeout_secs.unwrap_or(self.defaults.test_timeout_secs),
                    );
                    checks.push(test_suite::run_tests(argv, output_dir, timeout).await);
                }
                GateCheck::StructuralDocument {
                    path,
                    required_sections,
                    min_acceptance_items,
                } => {
                    let sections = required_sections
                        .as_ref()
                        .unwrap_or(&self.defaults.required_sections);
                    let min_items =
                        min_acceptance_items.unwrap_or(self.defaults.min_acceptance_items);
                    let documents = self.documents_for(project, phase, path.as_deref());
                    if documents.is_empty() {
                        checks.push(CheckOutcome::fail(
                            gate.name(),
                            None,
                            "no document declared for this phase",
                        ));
                    }
                    for doc in documents {
                        let found = files::locate(output_dir, Path::new(&doc), FileKind::Docs);
                        checks.extend(document::check_document(
                            found.as_ref().map(|f| f.path.as_path()),
                            &doc,
                            sections,
                            min_items,
                        ));
                    }
                }
            }
        }

        let result = QualityGateResult::from_checks(gates, checks);
        tracing::info!(
            phase = %phase.id,
            passed = result.passed,
            checks = result.checks.len(),
            "Quality gate evaluated"
        );
        result
    }

    /// Documents to check: the explicit path, else the manifest docs for the phase.
    fn documents_for(&self, project: &Project, phase: &PhaseSpec, path: Option<&str>) -> Vec<String> {
        if let Some(path) = path {
            return vec![path.to_string()];
        }
        project
            .expected_files(phase)
            .into_iter()
            .filter(|f| f.kind == FileKind::Docs)
            .map(|f| f.path.to_string_lossy().into_owned())
            .collect()
    }
}
