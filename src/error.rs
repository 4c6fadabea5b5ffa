//! Error type shared by every pipeline stage.

use std::io;
use std::path::PathBuf;

use thiserror::Error;

use crate::core::models::PipelineState;

pub type PipelineResult<T> = std::result::Result<T, PipelineError>;

#[derive(Debug, Error)]
pub enum PipelineError {
    /// Missing device, image or privilege. Raised before anything is touched.
    #[error("{0}")]
    Validation(String),

    /// A conflicting mount exists and unmounting was refused.
    #[error("{0}")]
    Conflict(String),

    /// An external program exited unsuccessfully.
    #[error("command `{program}` failed ({}): {}", describe_exit(*code), stderr.trim())]
    Command {
        program: String,
        args: Vec<String>,
        code: Option<i32>,
        stderr: String,
    },

    #[error("{op} {}: {source}", path.display())]
    Io {
        op: &'static str,
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("run cancelled before {0}")]
    Cancelled(PipelineState),

    #[error("background task failed: {0}")]
    Task(String),
}

impl PipelineError {
    pub fn io(op: &'static str, path: impl Into<PathBuf>, source: io::Error) -> Self {
        Self::Io {
            op,
            path: path.into(),
            source,
        }
    }
}

impl From<tokio::task::JoinError> for PipelineError {
    fn from(err: tokio::task::JoinError) -> Self {
        Self::Task(err.to_string())
    }
}

fn describe_exit(code: Option<i32>) -> String {
    match code {
        Some(code) => format!("exit status {}", code),
        None => "terminated by signal".to_string(),
    }
}
