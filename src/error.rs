//! Error types for gpg-task
//!
//! The taxonomy follows the life of a task:
//! - spawn failures (missing executable, exec failure) are fatal and never retried
//! - channel I/O failures abort the task and carry the context gathered so far
//! - malformed status lines are logged and skipped, so [`Error::Protocol`] is only
//!   produced by the strict parsing helpers
//! - unanswered prompts kill the child and name the prompt that was left open
//! - a lost helper connection is reported separately from anything gpg said;
//!   failures on the helper's side come back as the variant they would have
//!   been locally
//!
//! A non-zero gpg exit code is *not* an error. It is reported in
//! [`TaskResult`](crate::TaskResult) together with the decoded status codes.

use crate::status::StatusKeyword;
use crate::task::{PromptContext, TaskState};
use std::path::PathBuf;
use thiserror::Error;

/// Result type alias for gpg-task operations
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for gpg-task
#[derive(Debug, Error)]
pub enum Error {
    /// Configuration error with context about which setting is invalid
    #[error("configuration error: {message}")]
    Config {
        /// Human-readable error message describing the configuration issue
        message: String,
        /// The configuration key that caused the error (e.g., "status_fd")
        key: Option<String>,
    },

    /// The gpg executable could not be located
    #[error("executable not found: {0}")]
    ExecutableNotFound(String),

    /// Process creation failed (fork/exec, pipe setup)
    #[error("failed to spawn {}: {reason}", program.display())]
    Spawn {
        /// The program that was being launched
        program: PathBuf,
        /// Why the launch failed
        reason: String,
    },

    /// I/O error outside of a running task's channels
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A data channel of a running task failed
    #[error("{channel} channel failed: {source}")]
    Pipe {
        /// Logical channel name ("stdin", "status", "command", ...)
        channel: &'static str,
        /// The underlying I/O error
        #[source]
        source: std::io::Error,
        /// What the task had seen before the failure
        context: Box<FailureContext>,
    },

    /// Malformed status line
    #[error("malformed status line: {0}")]
    Protocol(String),

    /// Neither the delegate nor the task order could answer a prompt
    #[error("no answer for {keyword} prompt {prompt:?}")]
    PromptUnanswered {
        /// The request keyword (GET_LINE, GET_BOOL, GET_HIDDEN)
        keyword: StatusKeyword,
        /// The prompt identifier gpg sent (e.g. "passphrase.enter")
        prompt: String,
        /// Hints that were active when the prompt arrived
        context: Box<PromptContext>,
    },

    /// A prompt answer that cannot be sent as a single command line
    #[error("invalid prompt answer: {0}")]
    InvalidAnswer(String),

    /// The privilege separation channel was lost or could not be reached
    #[error("privilege separation helper unavailable: {0}")]
    HelperUnavailable(String),

    /// The helper was reached but could not carry out the run, for a reason
    /// with no closer match among these variants
    #[error("helper failed the run: {0}")]
    HelperFailed(String),

    /// Operation not allowed in the task's current state
    #[error("cannot {operation} a task in state {state}")]
    InvalidState {
        /// The operation that was attempted
        operation: &'static str,
        /// The state that prevents it
        state: TaskState,
    },

    /// Serialization error (helper wire protocol, configuration)
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Keyring watching error
    #[error("keyring watch error: {0}")]
    Watch(String),

    /// Operation not supported on this platform or transport
    #[error("not supported: {0}")]
    NotSupported(String),
}

/// Context captured when a running task fails on one of its channels
///
/// Lets the caller decide whether a fresh task is worth trying (for example,
/// asking for the passphrase again) without re-parsing anything.
#[derive(Debug, Clone, Default)]
pub struct FailureContext {
    /// Raw name of the last status keyword received before the failure
    pub last_keyword: Option<String>,
    /// Exit code, if the child had already exited
    pub exit_code: Option<i32>,
    /// Raw status bytes received so far
    pub status: Vec<u8>,
    /// Stderr bytes received so far
    pub err: Vec<u8>,
    /// Prompt hints gathered before the failure, for seeding a retry
    pub prompt_context: PromptContext,
}

impl Error {
    /// Wrap a channel I/O error with the task context
    pub(crate) fn pipe(channel: &'static str, source: std::io::Error, context: FailureContext) -> Self {
        Self::Pipe {
            channel,
            source,
            context: Box::new(context),
        }
    }

    /// Whether starting a fresh task could plausibly succeed
    ///
    /// Only transient transport problems qualify. Spawn failures, unanswered
    /// prompts and configuration errors need a change on the caller's side first.
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Io(e) | Error::Pipe { source: e, .. } => matches!(
                e.kind(),
                std::io::ErrorKind::Interrupted
                    | std::io::ErrorKind::WouldBlock
                    | std::io::ErrorKind::TimedOut
            ),
            Error::HelperUnavailable(_) => true,
            Error::Config { .. }
            | Error::ExecutableNotFound(_)
            | Error::Spawn { .. }
            | Error::Protocol(_)
            | Error::PromptUnanswered { .. }
            | Error::InvalidAnswer(_)
            | Error::HelperFailed(_)
            | Error::InvalidState { .. }
            | Error::Serialization(_)
            | Error::Watch(_)
            | Error::NotSupported(_) => false,
        }
    }
}
