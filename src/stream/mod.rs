//! Event models for agent output and the job live stream.
//!
//! `StreamEvent` is what the coding agent writes to stdout, one JSON object
//! per line. Each line is classified into an [`AgentEvent`]; lines that do
//! not parse become `AgentEvent::Unknown` and are only ever observed, never
//! used to decide pipeline progress.
//!
//! `JobEvent` is what the job engine emits on its live stream.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::controller::PhaseStatus;
use crate::errors::FailureCategory;
use crate::orchestrator::job::{FailureReport, JobStatus};

/// Events from the agent's stream-json output format.
#[derive(Debug, Deserialize)]
#[serde(tag = "type")]
pub enum StreamEvent {
    #[serde(rename = "assistant")]
    Assistant {
        message: AssistantMessage,
        #[serde(default)]
        session_id: String,
    },

    #[serde(rename = "user")]
    User {
        #[serde(default)]
        tool_use_result: Option<ToolUseResult>,
    },

    #[serde(rename = "result")]
    Result {
        #[serde(default)]
        subtype: String,
        #[serde(default)]
        result: Option<String>,
        #[serde(default)]
        is_error: bool,
        #[serde(default)]
        duration_ms: Option<u64>,
        #[serde(default)]
        total_cost_usd: Option<f64>,
    },

    #[serde(rename = "system")]
    System {
        #[serde(default)]
        subtype: String,
    },

    /// Flat form emitted by simpler agents.
    #[serde(rename = "tool_use")]
    ToolUse {
        name: String,
        #[serde(default)]
        input: Value,
    },

    /// Flat form emitted by simpler agents.
    #[serde(rename = "text")]
    Text { text: String },
}

#[derive(Debug, Deserialize)]
pub struct AssistantMessage {
    #[serde(default)]
    pub content: Vec<ContentBlock>,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type")]
pub enum ContentBlock {
    #[serde(rename = "tool_use")]
    ToolUse {
        name: String,
        input: Value,
        #[serde(default)]
        id: String,
    },

    #[serde(rename = "text")]
    Text { text: String },

    #[serde(other)]
    Other,
}

#[derive(Debug, Deserialize)]
pub struct ToolUseResult {
    #[serde(default)]
    pub file: Option<FileInfo>,
}

#[derive(Debug, Deserialize)]
pub struct FileInfo {
    #[serde(rename = "filePath")]
    pub file_path: String,
}

/// One classified line of agent output.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "class", rename_all = "snake_case")]
pub enum AgentEvent {
    ToolUse {
        name: String,
        description: String,
    },
    Text {
        text: String,
    },
    Result {
        is_error: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        duration_ms: Option<u64>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        cost_usd: Option<f64>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        text: Option<String>,
    },
    /// Anything that could not be classified. Observability only.
    Unknown {
        line: String,
    },
}

/// Classify one stdout line into zero or more agent events.
///
/// Blank lines yield nothing. An assistant message may carry several
/// content blocks and yields one event per block.
pub fn classify_line(line: &str) -> Vec<AgentEvent> {
    let trimmed = line.trim();
    if trimmed.is_empty() {
        return Vec::new();
    }

    let Ok(event) = serde_json::from_str::<StreamEvent>(trimmed) else {
        return vec![AgentEvent::Unknown {
            line: trimmed.to_string(),
        }];
    };

    match event {
        StreamEvent::Assistant { message, .. } => message
            .content
            .into_iter()
            .filter_map(|block| match block {
                ContentBlock::ToolUse { name, input, .. } => Some(AgentEvent::ToolUse {
                    description: describe_tool_use(&name, &input),
                    name,
                }),
                ContentBlock::Text { text } => Some(AgentEvent::Text { text }),
                ContentBlock::Other => None,
            })
            .collect(),
        StreamEvent::ToolUse { name, input } => vec![AgentEvent::ToolUse {
            description: describe_tool_use(&name, &input),
            name,
        }],
        StreamEvent::Text { text } => vec![AgentEvent::Text { text }],
        StreamEvent::Result {
            result,
            is_error,
            duration_ms,
            total_cost_usd,
            ..
        } => vec![AgentEvent::Result {
            is_error,
            duration_ms,
            cost_usd: total_cost_usd,
            text: result,
        }],
        StreamEvent::User { tool_use_result } => match tool_use_result.and_then(|r| r.file) {
            Some(file) => vec![AgentEvent::Text {
                text: format!("Wrote: {}", shorten_path(&file.file_path)),
            }],
            None => Vec::new(),
        },
        StreamEvent::System { .. } => Vec::new(),
    }
}

/// Extract a human-readable description from a tool use event
pub fn describe_tool_use(name: &str, input: &Value) -> String {
    let file_path = || {
        input
            .get("file_path")
            .and_then(|v| v.as_str())
            .map(shorten_path)
            .unwrap_or_else(|| "file".to_string())
    };
    match name {
        "Read" => format!("Reading: {}", file_path()),
        "Write" => format!("Creating: {}", file_path()),
        "Edit" => format!("Editing: {}", file_path()),
        "Bash" => {
            let cmd = input
                .get("command")
                .and_then(|v| v.as_str())
                .map(|s| truncate_str(s, 40))
                .unwrap_or_else(|| "command".to_string());
            format!("Running: {}", cmd)
        }
        "Glob" => {
            let pattern = input.get("pattern").and_then(|v| v.as_str()).unwrap_or("*");
            format!("Searching: {}", pattern)
        }
        "Grep" => {
            let pattern = input
                .get("pattern")
                .and_then(|v| v.as_str())
                .map(|s| truncate_str(s, 30))
                .unwrap_or_else(|| "pattern".to_string());
            format!("Grep: {}", pattern)
        }
        _ => name.to_string(),
    }
}

/// Shorten a file path to just the last 2 components
fn shorten_path(path: &str) -> String {
    let parts: Vec<&str> = path.split('/').collect();
    if parts.len() <= 2 {
        path.to_string()
    } else {
        parts[parts.len() - 2..].join("/")
    }
}

/// Truncate a string with ellipsis, respecting char boundaries
fn truncate_str(s: &str, max_len: usize) -> String {
    if s.chars().count() <= max_len {
        s.to_string()
    } else {
        let head: String = s.chars().take(max_len.saturating_sub(3)).collect();
        format!("{}...", head)
    }
}

/// One entry of a job's live stream and event log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum JobEvent {
    JobStarted {
        job_id: String,
        project: String,
        phases: Vec<String>,
    },
    PhaseStart {
        phase_id: String,
        index: usize,
        attempt: u32,
    },
    PhaseStatus {
        phase_id: String,
        status: PhaseStatus,
    },
    OutputLine {
        phase_id: String,
        attempt: u32,
        event: AgentEvent,
    },
    AttemptFailed {
        phase_id: String,
        attempt: u32,
        category: FailureCategory,
        summary: String,
    },
    PhaseComplete {
        phase_id: String,
        status: PhaseStatus,
        attempts: u32,
    },
    Escalated {
        phase_id: String,
        attempts: u32,
    },
    JobComplete {
        job_id: String,
        status: JobStatus,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        failure: Option<FailureReport>,
    },
}

impl JobEvent {
    /// Boundary events change persisted job status; output lines do not.
    pub fn is_boundary(&self) -> bool {
        !matches!(self, Self::OutputLine { .. })
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::JobComplete { .. })
    }
}
