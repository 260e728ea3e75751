//! Shared fixtures: fake agents, project manifests, git environments.

#![allow(dead_code)]

use std::fs;
use std::path::{Path, PathBuf};

use tempfile::TempDir;

/// Three phases; `impl` only passes its test gate from the second attempt
/// on, unless `AGENT_MODE=broken`, in which case it never does.
pub const THREE_PHASES: &str = r#"name: demo
phases:
  - id: design
    type: documentation
    quality_gate: file_existence
  - id: impl
    type: development
    depends_on: [design]
    quality_gate:
      - file_existence
      - type: tests_pass
        command: ["sh", "-c", "test -f new/fixed.txt"]
  - id: docs
    type: documentation
    depends_on: [impl]
    quality_gate: [file_existence, syntax_check]
files:
  create:
    - path: design.txt
      phase: design
    - path: impl.txt
      phase: impl
    - path: docs.txt
      phase: docs
"#;

/// Emits stream-json lines, writes `new/<phase>.txt`, then the marker.
pub const AGENT_SCRIPT: &str = r#"#!/bin/sh
echo '{"type":"assistant","message":{"content":[{"type":"text","text":"working on '"$EVOLVE_PHASE_ID"'"}]}}'
echo '{"type":"tool_use","name":"Write","input":{"file_path":"new/'"$EVOLVE_PHASE_ID"'.txt"}}'
mkdir -p new
echo "$EVOLVE_PHASE_ID attempt $EVOLVE_ATTEMPT" > "new/$EVOLVE_PHASE_ID.txt"
if [ "$EVOLVE_PHASE_ID" = "impl" ] && [ "$EVOLVE_ATTEMPT" -ge 2 ] && [ "$AGENT_MODE" != "broken" ]; then
  echo fixed > new/fixed.txt
fi
echo 'not json at all'
echo '{"type":"result","is_error":false,"duration_ms":12,"total_cost_usd":0.01}'
touch "$EVOLVE_COMPLETION_MARKER"
"#;

pub struct Workspace {
    pub dir: TempDir,
}

impl Workspace {
    pub fn new() -> Self {
        let ws = Self {
            dir: TempDir::new().unwrap(),
        };
        fs::create_dir_all(ws.projects_root()).unwrap();
        fs::create_dir_all(ws.state_dir()).unwrap();
        fs::write(ws.agent_script(), AGENT_SCRIPT).unwrap();
        ws
    }

    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    pub fn state_dir(&self) -> PathBuf {
        self.path().join(".evolve")
    }

    pub fn projects_root(&self) -> PathBuf {
        self.path().join("projects")
    }

    pub fn agent_script(&self) -> PathBuf {
        self.path().join("agent.sh")
    }

    pub fn project(&self, name: &str) -> PathBuf {
        self.projects_root().join(name)
    }

    /// Write `project.yaml` for a project under the projects root.
    pub fn add_project(&self, name: &str, manifest: &str) -> PathBuf {
        let root = self.project(name);
        fs::create_dir_all(&root).unwrap();
        fs::write(root.join("project.yaml"), manifest).unwrap();
        root
    }

    /// Write `evolve.toml` pointing the agent at the fake script.
    pub fn write_config(&self, extra: &str) {
        let toml = format!(
            r#"[agent]
command = "sh"
args = ["{script}"]
timeout_secs = 30

[retry]
max_retries = 3

[session]
lock_timeout_ms = 2000

[server]
projects_root = "{projects}"

{extra}
"#,
            script = self.agent_script().display(),
            projects = self.projects_root().display(),
        );
        fs::write(self.state_dir().join("evolve.toml"), toml).unwrap();
    }

    /// Create test and production git environments seeded with one commit.
    pub fn add_environments(&self) -> (PathBuf, PathBuf) {
        let production = self.path().join("envs/production");
        let test = self.path().join("envs/test");
        init_repo(&production, &[("README.md", "production\n")]);
        init_repo(&test, &[("README.md", "stale test env\n")]);
        (test, production)
    }

    pub fn environments_toml(&self) -> String {
        format!(
            r#"[verification]
test_command = ["sh", "-c", "test -f impl.txt && test -f fixed.txt"]
test_timeout_secs = 30

[environments.test]
path = "{test}"

[environments.production]
path = "{production}"
"#,
            test = self.path().join("envs/test").display(),
            production = self.path().join("envs/production").display(),
        )
    }
}

/// `git init` plus one commit of `files`. Returns the commit id.
pub fn init_repo(path: &Path, files: &[(&str, &str)]) -> String {
    fs::create_dir_all(path).unwrap();
    let repo = git2::Repository::init(path).unwrap();
    for (rel, content) in files {
        let file = path.join(rel);
        fs::create_dir_all(file.parent().unwrap()).unwrap();
        fs::write(file, content).unwrap();
    }
    let mut index = repo.index().unwrap();
    index
        .add_all(["*"].iter(), git2::IndexAddOption::DEFAULT, None)
        .unwrap();
    index.write().unwrap();
    let tree_id = index.write_tree().unwrap();
    let tree = repo.find_tree(tree_id).unwrap();
    let sig = git2::Signature::now("fixture", "fixture@localhost").unwrap();
    repo.commit(Some("HEAD"), &sig, &sig, "initial", &tree, &[])
        .unwrap()
        .to_string()
}

pub fn head_of(path: &Path) -> String {
    let repo = git2::Repository::open(path).unwrap();
    repo.head().unwrap().peel_to_commit().unwrap().id().to_string()
}
