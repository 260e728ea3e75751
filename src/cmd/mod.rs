//! CLI command implementations.
//!
//! Each submodule owns one or more related `Commands` variants:
//!
//! | Module          | Commands handled                          |
//! |-----------------|-------------------------------------------|
//! | `run`           | `Run`, `Resume`                           |
//! | `jobs`          | `Status`, `Cancel`                        |
//! | `escalations`   | `Escalations`                             |
//! | `evolution`     | `Evolution`                               |
//! | `session`       | `Session`                                 |
//! | `project`       | `Archive`                                 |
//! | `config`        | `Config`                                  |
//! | `serve`         | `Serve`                                   |

pub mod config;
pub mod escalations;
pub mod evolution;
pub mod jobs;
pub mod project;
pub mod run;
pub mod serve;
pub mod session;

pub use config::cmd_config;
pub use escalations::cmd_escalations;
pub use evolution::cmd_evolution;
pub use jobs::{cmd_cancel, cmd_status};
pub use project::cmd_archive;
pub use run::{OutputMode, cmd_resume, cmd_run};
pub use serve::cmd_serve;
pub use session::cmd_session;

/// Snake-case label of a serde enum value, as it appears in JSON.
pub(crate) fn label<T: serde::Serialize>(value: &T) -> String {
    match serde_json::to_value(value) {
        Ok(serde_json::Value::String(s)) => s,
        Ok(other) => other.to_string(),
        Err(_) => "unknown".to_string(),
    }
}
