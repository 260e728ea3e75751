//! Test-suite gate: run the configured test command and capture the result.
//!
//! The command is an argv list executed directly, never through a shell.

use std::path::Path;
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;

use super::CheckOutcome;
use crate::util::tail_chars;

const CHECK: &str = "tests_pass";
const SUMMARY_CHARS: usize = 600;

/// Run `argv` in `cwd` and report pass/fail with an output summary.
pub async fn run_tests(argv: &[String], cwd: &Path, timeout: Duration) -> CheckOutcome {
    let Some((program, args)) = argv.split_first() else {
        return CheckOutcome::fail(CHECK, None, "no test command configured");
    };
    let subject = Some(argv.join(" "));

    let child = Command::new(program)
        .args(args)
        .current_dir(cwd)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn();
    let child = match child {
        Ok(child) => child,
        Err(e) => {
            return CheckOutcome::fail(
                CHECK,
                subject,
                format!("failed to start test command: {}", e),
            );
        }
    };

    let output = match tokio::time::timeout(timeout, child.wait_with_output()).await {
        Ok(Ok(output)) => output,
        Ok(Err(e)) => {
            return CheckOutcome::fail(CHECK, subject, format!("test command failed: {}", e));
        }
        Err(_) => {
            return CheckOutcome::fail(
                CHECK,
                subject,
                format!("test command timed out after {}s", timeout.as_secs()),
            );
        }
    };

    let summary = summarize(&output.stdout, &output.stderr);
    let code = output
        .status
        .code()
        .map(|c| c.to_string())
        .unwrap_or_else(|| "signal".to_string());
    if output.status.success() {
        CheckOutcome::pass(CHECK, subject, format!("exit code {}{}", code, summary))
    } else {
        CheckOutcome::fail(CHECK, subject, format!("exit code {}{}", code, summary))
    }
}

fn summarize(stdout: &[u8], stderr: &[u8]) -> String {
    let mut combined = String::from_utf8_lossy(stdout).trim().to_string();
    let err = String::from_utf8_lossy(stderr);
    if !err.trim().is_empty() {
        if !combined.is_empty() {
            combined.push('\n');
        }
        combined.push_str(err.trim());
    }
    if combined.is_empty() {
        String::new()
    } else {
        format!(": {}", tail_chars(&combined, SUMMARY_CHARS))
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn argv(parts: &[&str]) -> Vec<String> {
        parts.iter().map(|s| s.to_string()).collect()
    }

    #[tokio::test]
    async fn test_passing_command() {
        let dir = tempdir().unwrap();
        let outcome = run_tests(
            &argv(&["sh", "-c", "echo '3 passed'"]),
            dir.path(),
            Duration::from_secs(10),
        )
        .await;
        assert!(outcome.passed);
        assert_eq!(outcome.message, "exit code 0: 3 passed");
    }

    #[tokio::test]
    async fn test_failing_command_captures_summary() {
        let dir = tempdir().unwrap();
        let outcome = run_tests(
            &argv(&["sh", "-c", "echo '1 failed' >&2; exit 1"]),
            dir.path(),
            Duration::from_secs(10),
        )
        .await;
        assert!(!outcome.passed);
        assert!(outcome.message.starts_with("exit code 1"));
        assert!(outcome.message.contains("1 failed"));
    }

    #[tokio::test]
    async fn test_runs_in_given_directory() {
        let dir = tempdir().unwrap();
        std::fs::write(dir.path().join("marker.txt"), "fixed").unwrap();
        let outcome = run_tests(
            &argv(&["grep", "-q", "fixed", "marker.txt"]),
            dir.path(),
            Duration::from_secs(10),
        )
        .await;
        assert!(outcome.passed, "{:?}", outcome);
    }

    #[tokio::test]
    async fn test_timeout() {
        let dir = tempdir().unwrap();
        let outcome = run_tests(
            &argv(&["sleep", "30"]),
            dir.path(),
            Duration::from_millis(200),
        )
        .await;
        assert!(!outcome.passed);
        assert!(outcome.message.contains("timed out"));
    }

    #[tokio::test]
    async fn test_missing_program_and_empty_command() {
        let dir = tempdir().unwrap();
        let outcome = run_tests(
            &argv(&["/nonexistent/test-runner"]),
            dir.path(),
            Duration::from_secs(5),
        )
        .await;
        assert!(!outcome.passed);
        assert!(outcome.message.starts_with("failed to start"));

        let outcome = run_tests(&[], dir.path(), Duration::from_secs(5)).await;
        assert!(!outcome.passed);
    }
}
