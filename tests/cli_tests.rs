//! CLI tests: drive the `evolve` binary against fake shell agents.

mod common;

use assert_cmd::Command;
use assert_cmd::cargo::cargo_bin_cmd;
use predicates::prelude::*;
use std::fs;

use common::{THREE_PHASES, Workspace, head_of};

fn evolve(ws: &Workspace) -> Command {
    let mut cmd = cargo_bin_cmd!("evolve");
    cmd.current_dir(ws.path())
        .env("EVOLVE_STATE_DIR", ws.state_dir())
        .env_remove("EVOLVE_AGENT_CMD")
        .env_remove("EVOLVE_MAX_RETRIES")
        .env_remove("EVOLVE_PHASE_TIMEOUT_SECS")
        .env_remove("AGENT_MODE");
    cmd
}

/// Pull the job id out of `Started job <id>`.
fn started_job_id(stdout: &[u8]) -> String {
    String::from_utf8_lossy(stdout)
        .lines()
        .find_map(|l| l.strip_prefix("Started job ").map(|s| s.trim().to_string()))
        .expect("job id in output")
}

mod cli_basics {
    use super::*;

    #[test]
    fn test_help() {
        let ws = Workspace::new();
        evolve(&ws)
            .arg("--help")
            .assert()
            .success()
            .stdout(predicate::str::contains("evolution"));
    }

    #[test]
    fn test_version() {
        let ws = Workspace::new();
        evolve(&ws).arg("--version").assert().success();
    }

    #[test]
    fn test_config_init_then_show() {
        let ws = Workspace::new();
        evolve(&ws)
            .args(["config", "init"])
            .assert()
            .success()
            .stdout(predicate::str::contains("Created"));
        assert!(ws.state_dir().join("evolve.toml").exists());

        evolve(&ws)
            .args(["config", "show"])
            .assert()
            .success()
            .stdout(predicate::str::contains("max_retries = 3"));
    }

    #[test]
    fn test_status_with_no_jobs() {
        let ws = Workspace::new();
        ws.write_config("");
        evolve(&ws)
            .arg("status")
            .assert()
            .success()
            .stdout(predicate::str::contains("No jobs recorded"));
    }

    #[test]
    fn test_unknown_job_fails() {
        let ws = Workspace::new();
        ws.write_config("");
        evolve(&ws)
            .args(["status", "does-not-exist"])
            .assert()
            .failure()
            .stderr(predicate::str::contains("not found"));
    }
}

mod jobs {
    use super::*;

    #[test]
    fn test_run_retries_until_gate_passes() {
        let ws = Workspace::new();
        ws.write_config("");
        let root = ws.add_project("demo", THREE_PHASES);

        let output = evolve(&ws)
            .args(["run", "projects/demo"])
            .assert()
            .success()
            .stdout(predicate::str::contains("completed"))
            .stdout(predicate::str::contains("attempt 1 failed (verification)"))
            .get_output()
            .stdout
            .clone();
        let job_id = started_job_id(&output);

        let status = evolve(&ws)
            .args(["status", &job_id, "--json"])
            .assert()
            .success()
            .get_output()
            .stdout
            .clone();
        let job: serde_json::Value = serde_json::from_slice(&status).unwrap();
        assert_eq!(job["status"], "completed");
        let attempts: Vec<usize> = job["phases"]
            .as_array()
            .unwrap()
            .iter()
            .map(|p| p["attempts"].as_array().unwrap().len())
            .collect();
        assert_eq!(attempts, vec![1, 2, 1]);
        assert!(job["usage"]["output_lines"].as_u64().unwrap() > 0);

        assert!(root.join("phases/impl/output/new/fixed.txt").exists());
        assert!(root.join("phases/impl/attempts/1/feedback.md").exists());
        let state = fs::read_to_string(root.join(".evolve/project-state.json")).unwrap();
        assert!(state.contains("\"ready\""));
    }

    #[test]
    fn test_run_json_streams_ndjson() {
        let ws = Workspace::new();
        ws.write_config("");
        ws.add_project("demo", THREE_PHASES);

        let output = evolve(&ws)
            .args(["run", "projects/demo", "--json"])
            .assert()
            .success()
            .get_output()
            .stdout
            .clone();
        let types: Vec<String> = String::from_utf8_lossy(&output)
            .lines()
            .map(|l| {
                let v: serde_json::Value = serde_json::from_str(l).unwrap();
                v["type"].as_str().unwrap().to_string()
            })
            .collect();
        assert_eq!(types.first().map(String::as_str), Some("job_started"));
        assert_eq!(types.last().map(String::as_str), Some("job_complete"));
        assert_eq!(types.iter().filter(|t| *t == "phase_complete").count(), 3);
        assert_eq!(types.iter().filter(|t| *t == "attempt_failed").count(), 1);
    }

    #[test]
    fn test_escalation_resolve_and_resume() {
        let ws = Workspace::new();
        ws.write_config("");
        ws.add_project("demo", THREE_PHASES);

        let output = evolve(&ws)
            .args(["run", "projects/demo"])
            .env("AGENT_MODE", "broken")
            .assert()
            .failure()
            .stdout(predicate::str::contains("Escalated:"))
            .stderr(predicate::str::contains("escalated"))
            .get_output()
            .stdout
            .clone();
        let job_id = started_job_id(&output);

        evolve(&ws)
            .args(["escalations", "list", "--open"])
            .assert()
            .success()
            .stdout(predicate::str::contains(format!("{} / impl", job_id)))
            .stdout(predicate::str::contains("attempt 3 [verification]"));

        // An open escalation blocks resumption.
        evolve(&ws)
            .args(["resume", &job_id])
            .assert()
            .failure()
            .stderr(predicate::str::contains("still open"));

        evolve(&ws)
            .args(["escalations", "resolve", &job_id, "impl", "--note", "fixed upstream"])
            .assert()
            .success();

        evolve(&ws)
            .args(["resume", &job_id])
            .assert()
            .success()
            .stdout(predicate::str::contains("impl (attempt 4)"));

        let status = evolve(&ws)
            .args(["status", &job_id, "--json"])
            .assert()
            .success()
            .get_output()
            .stdout
            .clone();
        let job: serde_json::Value = serde_json::from_slice(&status).unwrap();
        assert_eq!(job["status"], "completed");
        assert_eq!(job["phases"][0]["attempts"].as_array().unwrap().len(), 1);
        assert_eq!(job["phases"][1]["attempts"].as_array().unwrap().len(), 4);
    }

    #[test]
    fn test_run_rejects_invalid_manifest() {
        let ws = Workspace::new();
        ws.write_config("");
        ws.add_project(
            "cyclic",
            "phases:\n  - id: a\n    type: development\n    depends_on: [b]\n  - id: b\n    type: development\n    depends_on: [a]\n",
        );
        evolve(&ws)
            .args(["run", "projects/cyclic"])
            .assert()
            .failure()
            .stderr(predicate::str::contains("Circular"));
        evolve(&ws)
            .arg("status")
            .assert()
            .success()
            .stdout(predicate::str::contains("No jobs recorded"));
    }

    #[test]
    fn test_archive_after_completion() {
        let ws = Workspace::new();
        ws.write_config("");
        let root = ws.add_project("demo", THREE_PHASES);
        evolve(&ws).args(["run", "projects/demo", "-q"]).assert().success();

        evolve(&ws)
            .args(["archive", "projects/demo"])
            .assert()
            .success()
            .stdout(predicate::str::contains("Archived demo"));

        let archived: Vec<_> = fs::read_dir(ws.state_dir().join("archive"))
            .unwrap()
            .map(|e| e.unwrap().path())
            .collect();
        assert_eq!(archived.len(), 1);
        assert!(archived[0].join("project.yaml").exists());
        assert!(archived[0].join("job.json").exists());
        assert!(root.join("project.yaml").exists());
    }
}

mod evolution {
    use super::*;

    #[test]
    fn test_promotion_through_cli() {
        let ws = Workspace::new();
        let (test_env, production) = ws.add_environments();
        ws.write_config(&ws.environments_toml());
        ws.add_project("demo", THREE_PHASES);
        let production_before = head_of(&production);

        evolve(&ws)
            .args(["evolution", "deploy", "demo"])
            .assert()
            .failure()
            .stderr(predicate::str::contains("its job must complete first"));

        evolve(&ws).args(["run", "projects/demo", "-q"]).assert().success();

        evolve(&ws)
            .args(["evolution", "deploy", "demo"])
            .assert()
            .success()
            .stdout(predicate::str::contains("deployed"));
        assert!(test_env.join("impl.txt").exists());
        assert_eq!(head_of(&production), production_before);

        evolve(&ws)
            .args(["evolution", "validate", "demo"])
            .assert()
            .success()
            .stdout(predicate::str::contains("validated"));

        evolve(&ws)
            .args(["evolution", "integrate", "demo"])
            .assert()
            .success()
            .stdout(predicate::str::contains("integrated"));
        assert!(production.join("impl.txt").exists());
        assert_ne!(head_of(&production), production_before);

        evolve(&ws)
            .args(["evolution", "status", "demo"])
            .assert()
            .success()
            .stdout(predicate::str::contains("stage integrated"));
    }
}

mod sessions {
    use super::*;

    #[test]
    fn test_session_open_is_idempotent_per_correlation_id() {
        let ws = Workspace::new();
        ws.write_config("");
        evolve(&ws)
            .args(["session", "open", "--correlation-id", "Chat 42", "hello"])
            .assert()
            .success()
            .stdout(predicate::str::contains("Created session"));
        evolve(&ws)
            .args(["session", "open", "--correlation-id", "Chat 42", "again"])
            .assert()
            .success()
            .stdout(predicate::str::contains("Continued session"))
            .stdout(predicate::str::contains("2 message(s)"));
    }

    #[test]
    fn test_session_rejects_hostile_id() {
        let ws = Workspace::new();
        ws.write_config("");
        evolve(&ws)
            .args(["session", "show", "../../etc/passwd"])
            .assert()
            .failure();
    }
}
