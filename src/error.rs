//! Typed failures surfaced by the control core.
//!
//! Discovery and cycle failures are fatal to a cycle and carry everything needed to
//! troubleshoot the external engine. Apply failures keep the path that was being written.

use std::path::PathBuf;
use thiserror::Error;

/// Shown verbatim when no tier of the resolver finds the engine.
pub const ENGINE_NOT_FOUND_MESSAGE: &str =
    "good-night CLI not found. Install it with `pip install good-night` and try again.";

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ResolveError {
    #[error("{}", ENGINE_NOT_FOUND_MESSAGE)]
    NotFound,
}

/// Why a cycle ended in `Failed`.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CycleFailure {
    #[error("{}", ENGINE_NOT_FOUND_MESSAGE)]
    EngineNotFound,

    #[error("failed to launch `{invocation}`: {error}")]
    Launch { invocation: String, error: String },

    #[error("`{invocation}` exited with {}\n\n{output}", exit_label(*.exit_code))]
    NonZeroExit {
        invocation: String,
        /// `None` when the process was terminated by a signal.
        exit_code: Option<i32>,
        output: String,
    },

    #[error("`{invocation}` did not finish within {}\n\n{output}", humantime::format_duration(*.limit))]
    Timeout {
        invocation: String,
        limit: std::time::Duration,
        output: String,
    },
}

fn exit_label(code: Option<i32>) -> String {
    match code {
        Some(c) => format!("exit code {c}"),
        None => "no exit code (terminated by signal)".to_string(),
    }
}

#[derive(Debug, Error)]
pub enum ApplyError {
    #[error("no pending resolution with id {0}")]
    UnknownAction(uuid::Uuid),

    #[error("{action}: skill name {name:?} does not make a usable directory name")]
    InvalidSkillName { action: String, name: String },

    #[error("{action}: failed to write {}: {source}", .path.display())]
    Io {
        action: String,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}
