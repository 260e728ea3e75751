//! Instruction and feedback documents handed to the agent.
//!
//! Feedback from a failed verification is the only information that
//! crosses from one attempt to the next.

use std::fmt::Write;
use std::path::Path;

use crate::project::{FileKind, PhaseSpec, Project};
use crate::verify::QualityGateResult;

/// Render the structured feedback for a failed gate.
pub fn render_feedback(phase_id: &str, attempt: u32, result: &QualityGateResult) -> String {
    let mut out = String::new();
    let _ = writeln!(
        out,
        "# Verification feedback: phase `{}`, attempt {}\n",
        phase_id, attempt
    );
    let _ = writeln!(
        out,
        "The quality gate ({}) rejected this attempt. Fix every failed check below.\n",
        result.gates.join(", ")
    );
    let _ = writeln!(out, "## Failed checks\n");
    for check in result.failures() {
        match &check.subject {
            Some(subject) => {
                let _ = writeln!(out, "- **{}** `{}`: {}", check.check, subject, check.message);
            }
            None => {
                let _ = writeln!(out, "- **{}**: {}", check.check, check.message);
            }
        }
    }

    let passed: Vec<_> = result.checks.iter().filter(|c| c.passed).collect();
    if !passed.is_empty() {
        let _ = writeln!(out, "\n## Passing checks (keep these passing)\n");
        for check in passed {
            match &check.subject {
                Some(subject) => {
                    let _ = writeln!(out, "- {} `{}`", check.check, subject);
                }
                None => {
                    let _ = writeln!(out, "- {}", check.check);
                }
            }
        }
    }
    out
}

/// Everything the instruction document refers to for one attempt.
pub struct InstructionContext<'a> {
    pub project: &'a Project,
    pub phase: &'a PhaseSpec,
    pub attempt: u32,
    pub body: Option<&'a str>,
    pub marker_path: &'a Path,
    /// Feedback from the previous failed verification, with its file location.
    pub feedback: Option<(&'a Path, &'a str)>,
}

/// Render the instruction document for one attempt.
pub fn render_instructions(ctx: &InstructionContext<'_>) -> String {
    let mut out = String::new();
    let _ = writeln!(
        out,
        "# Phase `{}` ({}), attempt {}\n",
        ctx.phase.id,
        ctx.phase.phase_type.as_str(),
        ctx.attempt
    );

    match ctx.body {
        Some(body) => {
            let _ = writeln!(out, "{}\n", body.trim_end());
        }
        None => {
            let _ = writeln!(
                out,
                "Carry out the {} phase `{}` of project `{}`.\n",
                ctx.phase.phase_type.as_str(),
                ctx.phase.id,
                ctx.project.name
            );
        }
    }

    let _ = writeln!(out, "## Output\n");
    let _ = writeln!(
        out,
        "Your working directory is the phase output directory. Put created files under `new/` and modified files under `modified/`, using project-relative paths.\n"
    );
    let expected = ctx.project.expected_files(ctx.phase);
    if !expected.is_empty() {
        let _ = writeln!(out, "Expected files:\n");
        for file in expected {
            let partition = match file.kind {
                FileKind::Modify => "modified/",
                FileKind::Create | FileKind::Docs => "new/",
            };
            let _ = writeln!(out, "- `{}{}`", partition, file.path.display());
        }
        out.push('\n');
    }

    let _ = writeln!(out, "## Completion\n");
    let _ = writeln!(
        out,
        "When the work is finished, create the file named by `$EVOLVE_COMPLETION_MARKER` (`{}`).",
        ctx.marker_path.display()
    );

    if let Some((path, feedback)) = ctx.feedback {
        let _ = writeln!(out, "\n## Feedback from the previous attempt\n");
        let _ = writeln!(out, "Also saved at `{}`.\n", path.display());
        out.push_str(feedback);
    }
    out
}
