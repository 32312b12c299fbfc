//! Line parser for the status channel

use super::escape::unescape_value;
use super::keyword::StatusKeyword;
use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use tracing::warn;

/// Literal prefix of every status line
pub const STATUS_PREFIX: &str = "[GNUPG:] ";

/// One parsed status line
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusEvent {
    /// Keyword from the closed vocabulary
    pub keyword: StatusKeyword,
    /// The keyword exactly as gpg sent it
    pub name: String,
    /// Everything after the keyword, with `%XX` escapes decoded
    pub value: String,
}

impl StatusEvent {
    /// Build an event from a raw keyword and an already-decoded value
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        let name = name.into();
        Self {
            keyword: StatusKeyword::from_name(&name),
            name,
            value: value.into(),
        }
    }

    /// Whitespace-separated arguments of the value
    pub fn args(&self) -> impl Iterator<Item = &str> {
        self.value.split_whitespace()
    }

    /// The argument at `index`, if present
    pub fn arg(&self, index: usize) -> Option<&str> {
        self.args().nth(index)
    }

    /// The value with the first `skip` arguments removed
    ///
    /// Used for events whose last field is free text, such as the user ID in
    /// `USERID_HINT <keyid> <user id>`.
    pub fn rest_after(&self, skip: usize) -> &str {
        let mut rest = self.value.trim_start();
        for _ in 0..skip {
            match rest.find(char::is_whitespace) {
                Some(pos) => rest = rest[pos..].trim_start(),
                None => return "",
            }
        }
        rest
    }
}

/// Parse a single line (without its terminating newline)
///
/// Returns `Ok(None)` for blank lines and [`Error::Protocol`] for lines that do
/// not carry the status prefix.
pub fn parse_status_line(line: &[u8]) -> Result<Option<StatusEvent>> {
    let line = line.strip_suffix(b"\r").unwrap_or(line);
    if line.iter().all(u8::is_ascii_whitespace) {
        return Ok(None);
    }

    let text = String::from_utf8_lossy(line);
    let Some(body) = text.strip_prefix(STATUS_PREFIX) else {
        return Err(Error::Protocol(format!("missing status prefix: {text:?}")));
    };

    let body = body.trim_start();
    // One separator; anything after it belongs to the value
    let (name, value) = match body.char_indices().find(|(_, c)| c.is_whitespace()) {
        Some((pos, sep)) => (&body[..pos], &body[pos + sep.len_utf8()..]),
        None => (body, ""),
    };
    if name.is_empty() {
        return Err(Error::Protocol(format!("missing keyword: {text:?}")));
    }

    Ok(Some(StatusEvent::new(name, unescape_value(value))))
}

/// Incremental status stream parser
///
/// Feed it bytes as they arrive; an incomplete trailing line is kept until the
/// next call, so splitting the stream at arbitrary byte boundaries yields the
/// same events as feeding it whole.
#[derive(Debug, Default)]
pub struct StatusParser {
    pending: Vec<u8>,
    malformed: usize,
}

impl StatusParser {
    /// Create an empty parser
    pub fn new() -> Self {
        Self::default()
    }

    /// Consume bytes and return the events completed by them
    pub fn feed(&mut self, bytes: &[u8]) -> Vec<StatusEvent> {
        self.pending.extend_from_slice(bytes);

        let mut events = Vec::new();
        let mut consumed = 0;
        while let Some(pos) = self.pending[consumed..].iter().position(|&b| b == b'\n') {
            let end = consumed + pos;
            match parse_status_line(&self.pending[consumed..end]) {
                Ok(Some(event)) => events.push(event),
                Ok(None) => {}
                Err(e) => {
                    self.malformed += 1;
                    warn!(error = %e, "skipping status line");
                }
            }
            consumed = end + 1;
        }
        self.pending.drain(..consumed);

        events
    }

    /// Flush a trailing line that was never terminated
    pub fn finish(&mut self) -> Vec<StatusEvent> {
        if self.pending.is_empty() {
            return Vec::new();
        }
        self.pending.push(b'\n');
        self.feed(&[])
    }

    /// Bytes buffered while waiting for the end of a line
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    /// Number of lines skipped because they were malformed
    pub fn malformed_lines(&self) -> usize {
        self.malformed
    }
}
