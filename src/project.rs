//! Project manifest model and loading.
//!
//! This module provides:
//! - `ProjectManifest`, the on-disk `project.yaml` / `project.json` format
//! - `Project`, a validated manifest with phases resolved into a fixed order
//! - `PhaseLayout`, the filesystem layout of one phase's workspace
//! - `ProjectState`, the persisted project lifecycle status

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};

use crate::errors::ManifestError;
use crate::sanitize::{reject_shell_metacharacters, validate_identifier, validate_relative_path};
use crate::util::{read_json, write_json_atomic};

/// Manifest file names searched for, in order, when loading a project directory.
pub const MANIFEST_FILE_NAMES: &[&str] = &["project.yaml", "project.yml", "project.json"];

/// The closed set of phase types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PhaseType {
    Development,
    Test,
    Deploy,
    Verification,
    Documentation,
    Meeting,
}

impl PhaseType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Development => "development",
            Self::Test => "test",
            Self::Deploy => "deploy",
            Self::Verification => "verification",
            Self::Documentation => "documentation",
            Self::Meeting => "meeting",
        }
    }
}

/// One composable quality-gate check.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum GateCheck {
    /// Every manifest file expected from the phase exists in its output.
    FileExistence,
    /// Every recognised source file in the output parses.
    SyntaxCheck,
    /// The test-runner command exits zero.
    TestsPass {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        command: Option<Vec<String>>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        timeout_secs: Option<u64>,
    },
    /// A markdown document has the required sections and acceptance items.
    StructuralDocument {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        path: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        required_sections: Option<Vec<String>>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        min_acceptance_items: Option<usize>,
    },
}

impl GateCheck {
    pub fn name(&self) -> &'static str {
        match self {
            Self::FileExistence => "file_existence",
            Self::SyntaxCheck => "syntax_check",
            Self::TestsPass { .. } => "tests_pass",
            Self::StructuralDocument { .. } => "structural_document",
        }
    }

    fn from_name(name: &str) -> Option<Self> {
        match name.trim().replace('-', "_").as_str() {
            "file_existence" | "files_exist" => Some(Self::FileExistence),
            "syntax_check" | "syntax" => Some(Self::SyntaxCheck),
            "tests_pass" | "tests" => Some(Self::TestsPass {
                command: None,
                timeout_secs: None,
            }),
            "structural_document" | "structural_document_valid" => {
                Some(Self::StructuralDocument {
                    path: None,
                    required_sections: None,
                    min_acceptance_items: None,
                })
            }
            _ => None,
        }
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum GateCheckRepr {
    Name(String),
    Full(GateCheck),
}

#[derive(Deserialize)]
#[serde(untagged)]
enum GateSpecRepr {
    Many(Vec<GateCheckRepr>),
    One(GateCheckRepr),
}

/// Accepts `quality_gate: tests_pass`, a list of names, full objects, or a mix.
fn deserialize_gates<'de, D>(deserializer: D) -> Result<Vec<GateCheck>, D::Error>
where
    D: Deserializer<'de>,
{
    let repr = Option::<GateSpecRepr>::deserialize(deserializer)?;
    let items = match repr {
        None => return Ok(Vec::new()),
        Some(GateSpecRepr::One(item)) => vec![item],
        Some(GateSpecRepr::Many(items)) => items,
    };
    items
        .into_iter()
        .map(|item| match item {
            GateCheckRepr::Full(check) => Ok(check),
            GateCheckRepr::Name(name) => GateCheck::from_name(&name).ok_or_else(|| {
                serde::de::Error::custom(format!("unknown quality gate type '{}'", name))
            }),
        })
        .collect()
}

/// Declaration of one phase in the manifest.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PhaseSpec {
    pub id: String,
    #[serde(rename = "type")]
    pub phase_type: PhaseType,
    /// Instruction document, relative to the project root.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub instruction: Option<String>,
    #[serde(default, deserialize_with = "deserialize_gates")]
    pub quality_gate: Vec<GateCheck>,
    #[serde(default)]
    pub depends_on: Vec<String>,
}

/// A file expected from a phase: bare path, or scoped to one phase.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FileEntry {
    Path(String),
    Scoped { path: String, phase: String },
}

impl FileEntry {
    pub fn path(&self) -> &str {
        match self {
            Self::Path(p) => p,
            Self::Scoped { path, .. } => path,
        }
    }

    pub fn phase(&self) -> Option<&str> {
        match self {
            Self::Path(_) => None,
            Self::Scoped { phase, .. } => Some(phase),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FileManifest {
    #[serde(default)]
    pub create: Vec<FileEntry>,
    #[serde(default)]
    pub modify: Vec<FileEntry>,
    #[serde(default)]
    pub docs: Vec<FileEntry>,
}

/// The raw manifest document.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProjectManifest {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    pub phases: Vec<PhaseSpec>,
    #[serde(default)]
    pub files: FileManifest,
    /// Other projects that must be integrated before this one deploys.
    #[serde(default)]
    pub depends_on: Vec<String>,
}

/// Which manifest list an expected file came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FileKind {
    Create,
    Modify,
    Docs,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExpectedFile {
    pub path: PathBuf,
    pub kind: FileKind,
}

/// A validated project with its phases in execution order.
#[derive(Debug, Clone)]
pub struct Project {
    pub name: String,
    pub root: PathBuf,
    pub manifest_path: PathBuf,
    pub phases: Vec<PhaseSpec>,
    pub files: FileManifest,
    pub depends_on: Vec<String>,
}

impl Project {
    /// Load a project from a manifest file or a directory containing one.
    pub fn load(path: &Path) -> Result<Self, ManifestError> {
        let manifest_path = find_manifest(path)?;
        let content =
            std::fs::read_to_string(&manifest_path).map_err(|source| ManifestError::Read {
                path: manifest_path.clone(),
                source,
            })?;
        let manifest = parse_manifest(&manifest_path, &content)?;
        let root = manifest_path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."));
        Self::from_manifest(root, manifest_path, manifest)
    }

    /// Validate a parsed manifest and fix its phase order.
    pub fn from_manifest(
        root: PathBuf,
        manifest_path: PathBuf,
        manifest: ProjectManifest,
    ) -> Result<Self, ManifestError> {
        let name = match manifest.name.clone() {
            Some(name) => name,
            None => root
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default(),
        };
        validate_identifier("project name", &name)?;
        for dep in &manifest.depends_on {
            validate_identifier("project dependency", dep)?;
        }

        validate_phases(&manifest)?;
        validate_files(&manifest)?;
        let phases = resolve_order(&manifest.phases)?;

        Ok(Self {
            name,
            root,
            manifest_path,
            phases,
            files: manifest.files,
            depends_on: manifest.depends_on,
        })
    }

    pub fn phase(&self, id: &str) -> Option<&PhaseSpec> {
        self.phases.iter().find(|p| p.id == id)
    }

    pub fn phase_index(&self, id: &str) -> Option<usize> {
        self.phases.iter().position(|p| p.id == id)
    }

    pub fn layout(&self, phase_id: &str) -> PhaseLayout {
        PhaseLayout::new(&self.root, phase_id)
    }

    /// Files the given phase is expected to produce.
    ///
    /// Scoped entries apply only to their phase. Bare `create`/`modify`
    /// entries apply to every phase; bare `docs` entries apply to
    /// documentation phases.
    pub fn expected_files(&self, phase: &PhaseSpec) -> Vec<ExpectedFile> {
        let mut out = Vec::new();
        let lists = [
            (FileKind::Create, &self.files.create),
            (FileKind::Modify, &self.files.modify),
            (FileKind::Docs, &self.files.docs),
        ];
        for (kind, entries) in lists {
            for entry in entries {
                let applies = match entry.phase() {
                    Some(scope) => scope == phase.id,
                    None => {
                        kind != FileKind::Docs || phase.phase_type == PhaseType::Documentation
                    }
                };
                if applies {
                    // Paths were validated at load time.
                    out.push(ExpectedFile {
                        path: PathBuf::from(entry.path()),
                        kind,
                    });
                }
            }
        }
        out
    }

    /// Resolve the instruction document for a phase, if one is declared.
    pub fn instruction_text(&self, phase: &PhaseSpec) -> Result<Option<String>> {
        let Some(rel) = &phase.instruction else {
            return Ok(None);
        };
        let path = self.root.join(rel);
        let text = std::fs::read_to_string(&path)
            .with_context(|| format!("Failed to read instruction document {}", path.display()))?;
        Ok(Some(text))
    }
}

fn find_manifest(path: &Path) -> Result<PathBuf, ManifestError> {
    if path.is_file() {
        return Ok(path.to_path_buf());
    }
    if path.is_dir() {
        for name in MANIFEST_FILE_NAMES {
            let candidate = path.join(name);
            if candidate.is_file() {
                return Ok(candidate);
            }
        }
    }
    Err(ManifestError::NotFound {
        path: path.to_path_buf(),
    })
}

fn parse_manifest(path: &Path, content: &str) -> Result<ProjectManifest, ManifestError> {
    let is_json = path.extension().is_some_and(|e| e == "json");
    let parsed = if is_json {
        serde_json::from_str(content).map_err(|e| e.to_string())
    } else {
        serde_yaml::from_str(content).map_err(|e| e.to_string())
    };
    parsed.map_err(|message| ManifestError::Parse {
        path: path.to_path_buf(),
        message,
    })
}

fn validate_phases(manifest: &ProjectManifest) -> Result<(), ManifestError> {
    if manifest.phases.is_empty() {
        return Err(ManifestError::NoPhases);
    }

    let mut seen = HashSet::new();
    for phase in &manifest.phases {
        validate_identifier("phase id", &phase.id)?;
        if !seen.insert(phase.id.as_str()) {
            return Err(ManifestError::DuplicatePhase {
                id: phase.id.clone(),
            });
        }
        if let Some(instruction) = &phase.instruction {
            validate_relative_path("instruction path", instruction)?;
        }
        for gate in &phase.quality_gate {
            validate_gate(phase, gate)?;
        }
    }

    for phase in &manifest.phases {
        for dep in &phase.depends_on {
            if !seen.contains(dep.as_str()) {
                return Err(ManifestError::UnknownDependency {
                    phase: phase.id.clone(),
                    dependency: dep.clone(),
                });
            }
        }
    }
    Ok(())
}

fn validate_gate(phase: &PhaseSpec, gate: &GateCheck) -> Result<(), ManifestError> {
    match gate {
        GateCheck::TestsPass {
            command: Some(argv),
            ..
        } => {
            if argv.is_empty() {
                return Err(ManifestError::InvalidGate {
                    phase: phase.id.clone(),
                    message: "tests_pass command is empty".to_string(),
                });
            }
            for arg in argv {
                reject_shell_metacharacters("test command", arg)?;
            }
        }
        GateCheck::StructuralDocument {
            path: Some(path), ..
        } => {
            validate_relative_path("document path", path)?;
        }
        _ => {}
    }
    Ok(())
}

fn validate_files(manifest: &ProjectManifest) -> Result<(), ManifestError> {
    let phase_ids: HashSet<&str> = manifest.phases.iter().map(|p| p.id.as_str()).collect();
    let files = &manifest.files;
    for entry in files.create.iter().chain(&files.modify).chain(&files.docs) {
        validate_relative_path("manifest path", entry.path())?;
        if let Some(scope) = entry.phase()
            && !phase_ids.contains(scope)
        {
            return Err(ManifestError::UnknownPhaseScope {
                path: entry.path().to_string(),
                phase: scope.to_string(),
            });
        }
    }
    Ok(())
}

/// Resolve phase dependencies into a total order with Kahn's algorithm.
///
/// Among phases whose dependencies are satisfied, declaration order wins,
/// so a manifest without `depends_on` runs exactly as written.
fn resolve_order(phases: &[PhaseSpec]) -> Result<Vec<PhaseSpec>, ManifestError> {
    let index: HashMap<&str, usize> = phases
        .iter()
        .enumerate()
        .map(|(i, p)| (p.id.as_str(), i))
        .collect();

    let mut in_degree: Vec<usize> = phases.iter().map(|p| p.depends_on.len()).collect();
    let mut dependents: Vec<Vec<usize>> = vec![Vec::new(); phases.len()];
    for (i, phase) in phases.iter().enumerate() {
        for dep in &phase.depends_on {
            dependents[index[dep.as_str()]].push(i);
        }
    }

    let mut ready: Vec<usize> = (0..phases.len()).filter(|&i| in_degree[i] == 0).collect();
    let mut order = Vec::with_capacity(phases.len());

    while !ready.is_empty() {
        ready.sort_unstable();
        let next = ready.remove(0);
        order.push(next);
        for &dependent in &dependents[next] {
            in_degree[dependent] -= 1;
            if in_degree[dependent] == 0 {
                ready.push(dependent);
            }
        }
    }

    if order.len() != phases.len() {
        let phases_in_cycle = in_degree
            .iter()
            .enumerate()
            .filter(|&(_, deg)| *deg > 0)
            .map(|(i, _)| phases[i].id.clone())
            .collect();
        return Err(ManifestError::DependencyCycle {
            phases: phases_in_cycle,
        });
    }

    Ok(order.into_iter().map(|i| phases[i].clone()).collect())
}

/// Filesystem layout of one phase.
///
/// ```text
/// <project>/phases/<id>/
///     output/new/...        files the agent created
///     output/modified/...   files the agent modified
///     attempts/<n>/instructions.md
///     attempts/<n>/feedback.md
///     <completion marker>
/// ```
#[derive(Debug, Clone)]
pub struct PhaseLayout {
    phase_dir: PathBuf,
}

impl PhaseLayout {
    pub fn new(project_root: &Path, phase_id: &str) -> Self {
        Self {
            phase_dir: project_root.join("phases").join(phase_id),
        }
    }

    pub fn phase_dir(&self) -> &Path {
        &self.phase_dir
    }

    pub fn output_dir(&self) -> PathBuf {
        self.phase_dir.join("output")
    }

    pub fn new_dir(&self) -> PathBuf {
        self.output_dir().join("new")
    }

    pub fn modified_dir(&self) -> PathBuf {
        self.output_dir().join("modified")
    }

    pub fn attempt_dir(&self, attempt: u32) -> PathBuf {
        self.phase_dir.join("attempts").join(attempt.to_string())
    }

    pub fn instructions_path(&self, attempt: u32) -> PathBuf {
        self.attempt_dir(attempt).join("instructions.md")
    }

    pub fn feedback_path(&self, attempt: u32) -> PathBuf {
        self.attempt_dir(attempt).join("feedback.md")
    }

    pub fn marker_path(&self, marker: &str) -> PathBuf {
        self.phase_dir.join(marker)
    }

    pub fn ensure(&self) -> Result<()> {
        for dir in [self.new_dir(), self.modified_dir()] {
            std::fs::create_dir_all(&dir)
                .with_context(|| format!("Failed to create {}", dir.display()))?;
        }
        Ok(())
    }
}

/// Lifecycle status of a project.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ProjectStatus {
    #[default]
    Draft,
    Running,
    Ready,
    Deployed,
    Validated,
    Integrated,
    Archived,
    Escalated,
    Cancelled,
    Failed,
    RolledBack,
}

/// Persisted at `<project>/.evolve/project-state.json`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProjectState {
    pub status: ProjectStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_job_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,
}

impl ProjectState {
    pub fn path(project_root: &Path) -> PathBuf {
        project_root.join(".evolve").join("project-state.json")
    }

    pub fn load(project_root: &Path) -> Result<Self> {
        Ok(read_json(&Self::path(project_root))?.unwrap_or_default())
    }

    /// Record a status transition, keeping the previous job reference when `job_id` is `None`.
    pub fn set(project_root: &Path, status: ProjectStatus, job_id: Option<&str>) -> Result<Self> {
        let mut state = Self::load(project_root)?;
        state.status = status;
        if let Some(id) = job_id {
            state.last_job_id = Some(id.to_string());
        }
        state.updated_at = Some(Utc::now());
        write_json_atomic(&Self::path(project_root), &state)?;
        Ok(state)
    }
}

/// Retire a project: copy its manifest and final job record under
/// `archive_dir` and mark it archived. Nothing is deleted.
pub fn archive_project(
    project: &Project,
    archive_dir: &Path,
    job_record: Option<&Path>,
) -> Result<PathBuf> {
    let stamp = Utc::now().format("%Y%m%dT%H%M%SZ");
    let dest = archive_dir.join(format!("{}-{}", project.name, stamp));
    std::fs::create_dir_all(&dest)
        .with_context(|| format!("Failed to create {}", dest.display()))?;

    let manifest_name = project
        .manifest_path
        .file_name()
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("project.yaml"));
    std::fs::copy(&project.manifest_path, dest.join(manifest_name))
        .with_context(|| format!("Failed to archive {}", project.manifest_path.display()))?;

    if let Some(job) = job_record.filter(|p| p.exists()) {
        std::fs::copy(job, dest.join("job.json"))
            .with_context(|| format!("Failed to archive {}", job.display()))?;
    }

    ProjectState::set(&project.root, ProjectStatus::Archived, None)?;
    tracing::info!(project = %project.name, archive = %dest.display(), "Project archived");
    Ok(dest)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::SecurityViolation;
    use std::fs;
    use tempfile::tempdir;

    fn load_yaml(yaml: &str) -> Result<Project, ManifestError> {
        let dir = tempdir().unwrap();
        let root = dir.path().join("demo");
        fs::create_dir_all(&root).unwrap();
        fs::write(root.join("project.yaml"), yaml).unwrap();
        Project::load(&root)
    }

    #[test]
    fn test_load_yaml_manifest() {
        let project = load_yaml(
            r#"
phases:
  - id: design
    type: documentation
    quality_gate: structural_document
  - id: build
    type: development
    quality_gate: [file_existence, syntax_check]
  - id: verify
    type: test
    quality_gate:
      type: tests_pass
      command: ["pytest", "-q"]
files:
  create: [src/app.py]
  modify:
    - path: README.md
      phase: build
  docs: [docs/proposal.md]
depends_on: [base-lib]
"#,
        )
        .unwrap();

        assert_eq!(project.name, "demo");
        let ids: Vec<&str> = project.phases.iter().map(|p| p.id.as_str()).collect();
        assert_eq!(ids, vec!["design", "build", "verify"]);
        assert_eq!(project.phases[1].quality_gate.len(), 2);
        assert_eq!(
            project.phases[2].quality_gate[0],
            GateCheck::TestsPass {
                command: Some(vec!["pytest".into(), "-q".into()]),
                timeout_secs: None,
            }
        );
        assert_eq!(project.depends_on, vec!["base-lib"]);
    }

    #[test]
    fn test_load_json_manifest() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("project.json");
        fs::write(
            &path,
            r#"{"name": "api", "phases": [{"id": "p1", "type": "development"}]}"#,
        )
        .unwrap();
        let project = Project::load(&path).unwrap();
        assert_eq!(project.name, "api");
        assert!(project.phases[0].quality_gate.is_empty());
    }

    #[test]
    fn test_missing_manifest() {
        let dir = tempdir().unwrap();
        assert!(matches!(
            Project::load(dir.path()),
            Err(ManifestError::NotFound { .. })
        ));
    }

    #[test]
    fn test_malformed_manifest_is_fatal() {
        let err = load_yaml("phases: [[[").unwrap_err();
        assert!(matches!(err, ManifestError::Parse { .. }));
        let err = load_yaml("phases:\n  - id: a\n    type: unknown_kind\n").unwrap_err();
        assert!(matches!(err, ManifestError::Parse { .. }));
        let err = load_yaml("phases: []\n").unwrap_err();
        assert!(matches!(err, ManifestError::NoPhases));
    }

    #[test]
    fn test_unknown_gate_name_is_rejected() {
        let err = load_yaml("phases:\n  - id: a\n    type: test\n    quality_gate: vibes\n")
            .unwrap_err();
        assert!(matches!(err, ManifestError::Parse { .. }));
    }

    #[test]
    fn test_dependencies_resolve_to_stable_order() {
        let project = load_yaml(
            r#"
phases:
  - id: c
    type: test
    depends_on: [b]
  - id: a
    type: development
  - id: b
    type: development
    depends_on: [a]
  - id: d
    type: documentation
"#,
        )
        .unwrap();
        let ids: Vec<&str> = project.phases.iter().map(|p| p.id.as_str()).collect();
        assert_eq!(ids, vec!["a", "b", "c", "d"]);
    }

    #[test]
    fn test_cycle_is_fatal() {
        let err = load_yaml(
            r#"
phases:
  - id: a
    type: development
    depends_on: [b]
  - id: b
    type: development
    depends_on: [a]
  - id: c
    type: test
"#,
        )
        .unwrap_err();
        match err {
            ManifestError::DependencyCycle { phases } => {
                assert_eq!(phases, vec!["a".to_string(), "b".to_string()]);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_unknown_dependency_and_duplicates() {
        let err = load_yaml("phases:\n  - id: a\n    type: test\n    depends_on: [zzz]\n")
            .unwrap_err();
        assert!(matches!(err, ManifestError::UnknownDependency { .. }));

        let err = load_yaml("phases:\n  - id: a\n    type: test\n  - id: a\n    type: test\n")
            .unwrap_err();
        assert!(matches!(err, ManifestError::DuplicatePhase { .. }));
    }

    #[test]
    fn test_hostile_manifest_values_are_security_violations() {
        let err = load_yaml("phases:\n  - id: ../escape\n    type: test\n").unwrap_err();
        assert!(matches!(
            err,
            ManifestError::Security(SecurityViolation::PathTraversal { .. })
        ));

        let err = load_yaml(
            "phases:\n  - id: a\n    type: test\nfiles:\n  create: [../../etc/passwd]\n",
        )
        .unwrap_err();
        assert_eq!(err.category(), crate::errors::FailureCategory::Security);

        let err = load_yaml(
            "phases:\n  - id: a\n    type: test\n    quality_gate:\n      type: tests_pass\n      command: [\"sh\", \"-c\", \"rm -rf /; echo\"]\n",
        )
        .unwrap_err();
        assert!(matches!(
            err,
            ManifestError::Security(SecurityViolation::ShellMetacharacters { .. })
        ));
    }

    #[test]
    fn test_scope_to_unknown_phase() {
        let err = load_yaml(
            "phases:\n  - id: a\n    type: test\nfiles:\n  create:\n    - path: x.py\n      phase: nope\n",
        )
        .unwrap_err();
        assert!(matches!(err, ManifestError::UnknownPhaseScope { .. }));
    }

    #[test]
    fn test_expected_files_respect_scope_and_docs_rule() {
        let project = load_yaml(
            r#"
phases:
  - id: build
    type: development
  - id: docs
    type: documentation
files:
  create:
    - a.py
    - path: b.py
      phase: docs
  modify: [c.py]
  docs: [guide.md]
"#,
        )
        .unwrap();

        let build = project.phase("build").unwrap();
        let expected = project.expected_files(build);
        assert_eq!(
            expected,
            vec![
                ExpectedFile {
                    path: "a.py".into(),
                    kind: FileKind::Create
                },
                ExpectedFile {
                    path: "c.py".into(),
                    kind: FileKind::Modify
                },
            ]
        );

        let docs = project.phase("docs").unwrap();
        let kinds: Vec<FileKind> = project.expected_files(docs).iter().map(|f| f.kind).collect();
        assert_eq!(
            kinds,
            vec![
                FileKind::Create,
                FileKind::Create,
                FileKind::Modify,
                FileKind::Docs
            ]
        );
    }

    #[test]
    fn test_phase_layout_paths() {
        let layout = PhaseLayout::new(Path::new("/p"), "build");
        assert_eq!(layout.new_dir(), PathBuf::from("/p/phases/build/output/new"));
        assert_eq!(
            layout.modified_dir(),
            PathBuf::from("/p/phases/build/output/modified")
        );
        assert_eq!(
            layout.feedback_path(2),
            PathBuf::from("/p/phases/build/attempts/2/feedback.md")
        );
        assert_eq!(
            layout.marker_path(".phase-complete"),
            PathBuf::from("/p/phases/build/.phase-complete")
        );
    }

    #[test]
    fn test_project_state_and_archive() {
        let dir = tempdir().unwrap();
        let root = dir.path().join("demo");
        fs::create_dir_all(&root).unwrap();
        fs::write(
            root.join("project.yaml"),
            "phases:\n  - id: a\n    type: test\n",
        )
        .unwrap();
        let project = Project::load(&root).unwrap();

        assert_eq!(ProjectState::load(&root).unwrap().status, ProjectStatus::Draft);
        ProjectState::set(&root, ProjectStatus::Ready, Some("job-1")).unwrap();
        let state = ProjectState::load(&root).unwrap();
        assert_eq!(state.status, ProjectStatus::Ready);
        assert_eq!(state.last_job_id.as_deref(), Some("job-1"));

        let archive = dir.path().join("archive");
        let dest = archive_project(&project, &archive, None).unwrap();
        assert!(dest.join("project.yaml").exists());
        assert!(root.join("project.yaml").exists());
        let state = ProjectState::load(&root).unwrap();
        assert_eq!(state.status, ProjectStatus::Archived);
        assert_eq!(state.last_job_id.as_deref(), Some("job-1"));
    }
}
