//! Caller hooks into a running task

use super::result::TaskResult;
use crate::error::{Error, Result};
use crate::status::{StatusEvent, StatusKeyword};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// Key and user the next passphrase prompt is about (`USERID_HINT`)
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserIdHint {
    /// Long key ID
    pub key_id: String,
    /// User ID text
    pub user_id: String,
}

impl UserIdHint {
    pub(crate) fn from_event(event: &StatusEvent) -> Self {
        Self {
            key_id: event.arg(0).unwrap_or_default().to_string(),
            user_id: event.rest_after(1).to_string(),
        }
    }
}

/// Details of the last `NEED_PASSPHRASE`, `NEED_PASSPHRASE_SYM` or
/// `NEED_PASSPHRASE_PIN` event
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PassphraseRequest {
    /// Which of the three events this came from
    pub keyword: StatusKeyword,
    /// Raw arguments of the event
    pub args: Vec<String>,
}

impl PassphraseRequest {
    pub(crate) fn from_event(event: &StatusEvent) -> Self {
        Self {
            keyword: event.keyword,
            args: event.args().map(str::to_string).collect(),
        }
    }

    /// Long ID of the primary key (`NEED_PASSPHRASE` only)
    pub fn main_key_id(&self) -> Option<&str> {
        self.key_arg(0)
    }

    /// Long ID of the (sub)key actually used (`NEED_PASSPHRASE` only)
    pub fn key_id(&self) -> Option<&str> {
        self.key_arg(1)
    }

    /// Whether this is a symmetric passphrase request
    pub fn is_symmetric(&self) -> bool {
        self.keyword == StatusKeyword::NeedPassphraseSym
    }

    /// Whether this asks for a smartcard PIN
    pub fn is_pin(&self) -> bool {
        self.keyword == StatusKeyword::NeedPassphrasePin
    }

    fn key_arg(&self, index: usize) -> Option<&str> {
        (self.keyword == StatusKeyword::NeedPassphrase)
            .then(|| self.args.get(index).map(String::as_str))
            .flatten()
    }
}

/// Hints gathered from the status stream that describe the pending prompt
///
/// Each hint persists until a newer event of the same kind replaces it.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PromptContext {
    /// Last `USERID_HINT`
    pub last_user_id_hint: Option<UserIdHint>,
    /// Last passphrase request
    pub last_need_passphrase: Option<PassphraseRequest>,
}

/// A request for input from gpg
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PromptRequest {
    /// `GET_LINE`, `GET_BOOL` or `GET_HIDDEN`
    pub keyword: StatusKeyword,
    /// Prompt identifier, e.g. `passphrase.enter` or `keygen.name`
    pub prompt: String,
    /// Hints active when the prompt arrived
    pub context: PromptContext,
}

/// The answer to a prompt
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Answer {
    /// A line of text
    Text(String),
    /// `y` or `n`
    Bool(bool),
    /// Raw bytes, sent as-is
    Bytes(Vec<u8>),
}

impl Answer {
    /// Bytes written to the command channel; always newline-terminated
    ///
    /// # Errors
    ///
    /// [`Error::InvalidAnswer`] if the answer spans more than one line, since
    /// gpg would read the remainder as answers to later prompts.
    pub fn into_line(self) -> Result<Vec<u8>> {
        let mut line = match self {
            Answer::Text(text) => text.into_bytes(),
            Answer::Bool(true) => b"y".to_vec(),
            Answer::Bool(false) => b"n".to_vec(),
            Answer::Bytes(bytes) => bytes,
        };
        if line.last() == Some(&b'\n') {
            line.pop();
        }
        if line.iter().any(|b| matches!(b, b'\n' | b'\r')) {
            return Err(Error::InvalidAnswer(
                "answer contains a line break".to_string(),
            ));
        }
        line.push(b'\n');
        Ok(line)
    }
}

impl From<String> for Answer {
    fn from(text: String) -> Self {
        Answer::Text(text)
    }
}

impl From<&str> for Answer {
    fn from(text: &str) -> Self {
        Answer::Text(text.to_string())
    }
}

/// Optional callbacks for a task
///
/// All methods have no-op defaults. `answer_prompt` is consulted before the
/// task's [`TaskOrder`](crate::TaskOrder); returning `None` falls through to
/// the order. Hooks run on the task's dispatch path, so a slow hook delays
/// the processing of later status events (but never the data pumps).
#[async_trait]
pub trait TaskDelegate: Send + Sync {
    /// Called with the final argument list just before the process starts
    fn will_start(&self, _arguments: &[String]) {}

    /// Answer a `GET_LINE`, `GET_BOOL` or `GET_HIDDEN` request
    async fn answer_prompt(&self, _request: &PromptRequest) -> Option<Answer> {
        None
    }

    /// Called for every status event, in the order gpg emitted them
    fn status(&self, _event: &StatusEvent) {}

    /// Called once with the finished result
    fn did_terminate(&self, _result: &TaskResult) {}
}
