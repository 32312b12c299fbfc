//! Messages exchanged with a privilege separation helper
//!
//! One JSON object per line. The client opens a connection per run, sends a
//! single [`ClientMessage::Launch`], streams stdin as [`ClientMessage::Input`]
//! chunks closed by [`ClientMessage::InputEnd`], and reads [`HelperMessage`]s
//! until `Finished` or `Failed`, answering every status message that asks for
//! a reply. Output arrives as [`HelperMessage::Output`] chunks just before
//! `Finished`. Byte payloads are base64 encoded.

use crate::error::{Error, FailureContext};
use crate::status::{StatusEvent, StatusKeyword};
use crate::task::{PromptContext, TaskOutcome};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Largest raw payload carried by one data message
pub const DATA_CHUNK_SIZE: usize = 64 * 1024;

/// What the helper should run
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LaunchRequest {
    /// gpg arguments, without descriptor arguments (the helper adds those)
    pub arguments: Vec<String>,
    /// Total stdin length, when every input declares one
    pub input_len: Option<u64>,
    /// Whether to collect attribute data
    pub read_attributes: bool,
    /// Deadline enforced by the helper
    pub timeout: Option<Duration>,
}

/// Which buffer an [`HelperMessage::Output`] chunk belongs to
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutputChannel {
    /// gpg's stdout
    Stdout,
    /// gpg's stderr
    Stderr,
    /// Raw status channel bytes
    Status,
    /// Attribute channel bytes
    Attributes,
}

/// How the helper's run ended
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteExit {
    /// How the run ended on the helper side
    pub outcome: TaskOutcome,
    /// gpg's exit code
    pub exit_code: Option<i32>,
}

/// Why a run failed on the helper side
///
/// Mirrors the [`Error`] variants a run can produce, so the client reports
/// the same error it would have got running gpg itself.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RemoteFailure {
    /// No gpg executable on the helper's side
    ExecutableNotFound {
        /// What was looked for
        name: String,
    },
    /// gpg could not be started
    Spawn {
        /// Program the helper tried to run
        program: PathBuf,
        /// Why it failed
        reason: String,
    },
    /// A prompt went unanswered
    PromptUnanswered {
        /// Request keyword
        keyword: StatusKeyword,
        /// Prompt identifier
        prompt: String,
        /// Hints at the time of the prompt
        context: PromptContext,
    },
    /// An answer could not be sent as one line
    InvalidAnswer {
        /// What was wrong with it
        message: String,
    },
    /// A data channel failed
    Pipe {
        /// Logical channel name
        channel: String,
        /// The I/O error, as text
        message: String,
        /// Exit code, if gpg had already exited
        exit_code: Option<i32>,
        /// Last status keyword the helper saw
        last_keyword: Option<String>,
    },
    /// The helper's configuration was rejected
    Config {
        /// What is wrong
        message: String,
        /// Offending key
        key: Option<String>,
    },
    /// The helper cannot run gpg on its platform
    NotSupported {
        /// Details
        message: String,
    },
    /// Anything else
    Other {
        /// Details
        message: String,
    },
}

impl From<&Error> for RemoteFailure {
    fn from(error: &Error) -> Self {
        match error {
            Error::ExecutableNotFound(name) => RemoteFailure::ExecutableNotFound { name: name.clone() },
            Error::Spawn { program, reason } => RemoteFailure::Spawn {
                program: program.clone(),
                reason: reason.clone(),
            },
            Error::PromptUnanswered {
                keyword,
                prompt,
                context,
            } => RemoteFailure::PromptUnanswered {
                keyword: *keyword,
                prompt: prompt.clone(),
                context: (**context).clone(),
            },
            Error::InvalidAnswer(message) => RemoteFailure::InvalidAnswer {
                message: message.clone(),
            },
            Error::Pipe {
                channel,
                source,
                context,
            } => RemoteFailure::Pipe {
                channel: channel.to_string(),
                message: source.to_string(),
                exit_code: context.exit_code,
                last_keyword: context.last_keyword.clone(),
            },
            Error::Config { message, key } => RemoteFailure::Config {
                message: message.clone(),
                key: key.clone(),
            },
            Error::NotSupported(message) => RemoteFailure::NotSupported {
                message: message.clone(),
            },
            other => RemoteFailure::Other {
                message: other.to_string(),
            },
        }
    }
}

impl RemoteFailure {
    /// The error the client reports; `context` is what the client saw itself
    pub fn into_error(self, context: FailureContext) -> Error {
        match self {
            RemoteFailure::ExecutableNotFound { name } => Error::ExecutableNotFound(name),
            RemoteFailure::Spawn { program, reason } => Error::Spawn { program, reason },
            RemoteFailure::PromptUnanswered {
                keyword,
                prompt,
                context,
            } => Error::PromptUnanswered {
                keyword,
                prompt,
                context: Box::new(context),
            },
            RemoteFailure::InvalidAnswer { message } => Error::InvalidAnswer(message),
            RemoteFailure::Pipe {
                channel,
                message,
                exit_code,
                last_keyword,
            } => Error::pipe(
                channel_name(&channel),
                std::io::Error::other(message),
                FailureContext {
                    exit_code: exit_code.or(context.exit_code),
                    last_keyword: last_keyword.or(context.last_keyword),
                    ..context
                },
            ),
            RemoteFailure::Config { message, key } => Error::Config { message, key },
            RemoteFailure::NotSupported { message } => Error::NotSupported(message),
            RemoteFailure::Other { message } => Error::HelperFailed(message),
        }
    }
}

fn channel_name(channel: &str) -> &'static str {
    match channel {
        "stdin" => "stdin",
        "stdout" => "stdout",
        "stderr" => "stderr",
        "status" => "status",
        "command" => "command",
        "attribute" => "attribute",
        _ => "helper",
    }
}

/// Client to helper
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    /// Start a run
    Launch(LaunchRequest),
    /// Next piece of gpg's stdin
    Input {
        /// Raw bytes
        #[serde(with = "base64_bytes")]
        data: Vec<u8>,
    },
    /// No more stdin
    InputEnd,
    /// Answer to the last status message that needed a reply
    Respond {
        /// Newline-terminated answer line
        #[serde(with = "base64_bytes")]
        answer: Vec<u8>,
    },
    /// Kill the running gpg
    Cancel,
    /// Connection test
    Ping,
}

/// Helper to client
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum HelperMessage {
    /// A status event, forwarded in emission order
    Status {
        /// The event
        event: StatusEvent,
        /// Whether gpg is blocked waiting for a [`ClientMessage::Respond`]
        needs_reply: bool,
    },
    /// Stdin progress on the helper side
    Progress {
        /// Bytes processed
        processed: u64,
        /// Bytes expected, if known
        total: Option<u64>,
    },
    /// A piece of collected output
    Output {
        /// Buffer the bytes belong to
        channel: OutputChannel,
        /// Raw bytes
        #[serde(with = "base64_bytes")]
        data: Vec<u8>,
    },
    /// The run ended; all output was sent before this
    Finished(RemoteExit),
    /// The run could not be carried out
    Failed(RemoteFailure),
    /// Reply to [`ClientMessage::Ping`]
    Pong,
}

/// Serde adapter writing `Vec<u8>` as a base64 string
mod base64_bytes {
    use base64::{Engine as _, engine::general_purpose::STANDARD};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Vec<u8>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let text = String::deserialize(deserializer)?;
        STANDARD.decode(text).map_err(serde::de::Error::custom)
    }
}

// unwrap/expect are acceptable in tests for concise failure-on-error assertions
#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn messages_are_tagged_json_objects() {
        let json = serde_json::to_string(&ClientMessage::Cancel).unwrap();
        assert_eq!(json, r#"{"type":"cancel"}"#);

        let json = serde_json::to_value(HelperMessage::Status {
            event: StatusEvent::new("GET_HIDDEN", "passphrase.enter"),
            needs_reply: true,
        })
        .unwrap();
        assert_eq!(json["type"], "status");
        assert_eq!(json["event"]["keyword"], "GET_HIDDEN");
        assert_eq!(json["event"]["value"], "passphrase.enter");
        assert_eq!(json["needs_reply"], true);
    }

    #[test]
    fn data_travels_as_base64() {
        let json = serde_json::to_value(ClientMessage::Input {
            data: vec![0, 255, 10],
        })
        .unwrap();
        assert_eq!(json["data"], "AP8K");

        let line = r#"{"type":"output","channel":"stderr","data":"aGk="}"#;
        match serde_json::from_str::<HelperMessage>(line).unwrap() {
            HelperMessage::Output { channel, data } => {
                assert_eq!(channel, OutputChannel::Stderr);
                assert_eq!(data, b"hi");
            }
            other => panic!("expected Output, got {other:?}"),
        }
        assert!(serde_json::from_str::<HelperMessage>(
            r#"{"type":"output","channel":"stdout","data":"not base64!"}"#
        )
        .is_err());
    }

    #[test]
    fn a_full_chunk_stays_well_inside_the_frame_limit() {
        let line = serde_json::to_string(&HelperMessage::Output {
            channel: OutputChannel::Stdout,
            data: vec![0xAB; DATA_CHUNK_SIZE],
        })
        .unwrap();
        assert!(line.len() < crate::config::MIN_FRAME_LEN / 2);
        assert!(!line.contains('\n'));
    }

    #[test]
    fn launch_request_survives_the_wire() {
        let request = LaunchRequest {
            arguments: vec!["--decrypt".to_string()],
            input_len: Some(3),
            read_attributes: true,
            timeout: Some(Duration::from_secs(30)),
        };
        let line = serde_json::to_string(&ClientMessage::Launch(request.clone())).unwrap();
        let parsed: ClientMessage = serde_json::from_str(&line).unwrap();
        assert_eq!(parsed, ClientMessage::Launch(request));
    }

    #[test]
    fn failures_keep_their_kind_across_the_wire() {
        let spawn = Error::Spawn {
            program: PathBuf::from("/nonexistent/gpg"),
            reason: "No such file or directory".to_string(),
        };
        let line = serde_json::to_string(&HelperMessage::Failed(RemoteFailure::from(&spawn))).unwrap();
        assert!(line.contains(r#""kind":"spawn""#));
        let HelperMessage::Failed(failure) = serde_json::from_str(&line).unwrap() else {
            panic!("expected Failed");
        };
        match failure.into_error(FailureContext::default()) {
            Error::Spawn { program, .. } => assert_eq!(program, PathBuf::from("/nonexistent/gpg")),
            other => panic!("expected Spawn, got {other:?}"),
        }

        let pipe = Error::pipe(
            "stdin",
            std::io::Error::from(std::io::ErrorKind::NotFound),
            FailureContext {
                exit_code: Some(2),
                ..Default::default()
            },
        );
        let rebuilt = RemoteFailure::from(&pipe).into_error(FailureContext::default());
        match rebuilt {
            Error::Pipe { channel, context, .. } => {
                assert_eq!(channel, "stdin");
                assert_eq!(context.exit_code, Some(2));
            }
            other => panic!("expected Pipe, got {other:?}"),
        }

        let other = RemoteFailure::from(&Error::Watch("inotify limit".to_string()));
        let rebuilt = other.into_error(FailureContext::default());
        assert!(matches!(rebuilt, Error::HelperFailed(_)));
        assert!(!rebuilt.is_retryable());
    }
}
