//! The snapshot produced when a task ends

use super::delegate::PromptContext;
use crate::status::{ErrorCode, StatusEvent, StatusKeyword};
use serde::{Deserialize, Serialize};
use std::borrow::Cow;
use std::collections::BTreeMap;
use tracing::warn;

/// Arguments of every event, grouped by raw keyword name, in arrival order
pub type StatusDict = BTreeMap<String, Vec<Vec<String>>>;

/// How a task ended
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskOutcome {
    /// The process exited on its own (with any exit code)
    Finished,
    /// The caller cancelled the task
    Cancelled,
    /// The task's deadline passed
    TimedOut,
}

/// One attribute packet (photo ID) announced by an `ATTRIBUTE` event
///
/// `ATTRIBUTE <fpr> <octets> <type> <index> <count> <created> <expires> <flags>`.
/// The packets are concatenated on the attribute channel in announcement
/// order; `offset` locates this one in [`TaskResult::attributes`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AttributeSegment {
    /// Fingerprint of the key the attribute belongs to
    pub fingerprint: String,
    /// Byte offset into the attribute data
    pub offset: usize,
    /// Length in bytes
    pub length: usize,
    /// Attribute subpacket type (1 = image)
    pub kind: u32,
    /// Index of this subpacket within the attribute packet (1-based)
    pub index: u32,
    /// Number of subpackets in the packet
    pub count: u32,
    /// Creation timestamp (seconds since the epoch, 0 if unknown)
    pub created: u64,
    /// Expiration timestamp (0 for none)
    pub expires: u64,
    /// Bit flags: 0x01 primary, 0x02 revoked, 0x04 expired
    pub flags: u32,
}

impl AttributeSegment {
    /// Whether this is the primary user attribute
    pub fn is_primary(&self) -> bool {
        self.flags & 0x01 != 0
    }

    /// Whether the attribute was revoked
    pub fn is_revoked(&self) -> bool {
        self.flags & 0x02 != 0
    }

    /// Whether the attribute expired
    pub fn is_expired(&self) -> bool {
        self.flags & 0x04 != 0
    }
}

/// Everything a finished task produced
#[derive(Clone, Debug)]
pub struct TaskResult {
    /// How the task ended
    pub outcome: TaskOutcome,
    /// Exit code, when the process was reaped (`128 + N` after signal `N`)
    pub exit_code: Option<i32>,
    /// Bytes read from stdout
    pub out: Vec<u8>,
    /// Bytes read from stderr
    pub err: Vec<u8>,
    /// Raw status channel bytes, including lines that failed to parse
    pub status: Vec<u8>,
    /// Raw attribute channel bytes
    pub attributes: Vec<u8>,
    /// Parsed status events in arrival order
    pub events: Vec<StatusEvent>,
    /// Event arguments grouped by keyword name
    pub status_dict: StatusDict,
    /// Error codes reported on the status channel, deduplicated, first seen first
    pub error_codes: Vec<ErrorCode>,
    /// Prompt hints as they stood when the task ended
    pub prompt_context: PromptContext,
    /// An output channel was still held open by a descendant of gpg and was
    /// abandoned; its buffer holds what arrived before that
    pub truncated: bool,
}

impl TaskResult {
    /// An empty result for a task that never produced anything
    pub(crate) fn empty(outcome: TaskOutcome) -> Self {
        Self {
            outcome,
            exit_code: None,
            out: Vec::new(),
            err: Vec::new(),
            status: Vec::new(),
            attributes: Vec::new(),
            events: Vec::new(),
            status_dict: StatusDict::new(),
            error_codes: Vec::new(),
            prompt_context: PromptContext::default(),
            truncated: false,
        }
    }

    /// Finished with exit code 0
    pub fn is_success(&self) -> bool {
        self.outcome == TaskOutcome::Finished && self.exit_code == Some(0)
    }

    /// Stdout as text
    pub fn out_text(&self) -> Cow<'_, str> {
        String::from_utf8_lossy(&self.out)
    }

    /// Stderr as text
    pub fn err_text(&self) -> Cow<'_, str> {
        String::from_utf8_lossy(&self.err)
    }

    /// Raw status output as text
    pub fn status_text(&self) -> Cow<'_, str> {
        String::from_utf8_lossy(&self.status)
    }

    /// Whether gpg reported `code`
    pub fn has_error(&self, code: ErrorCode) -> bool {
        self.error_codes.contains(&code)
    }

    /// Events carrying `keyword`
    pub fn events_for(&self, keyword: StatusKeyword) -> impl Iterator<Item = &StatusEvent> {
        self.events.iter().filter(move |e| e.keyword == keyword)
    }

    /// Attribute packets in announcement order
    ///
    /// Events with unparsable sizes are skipped; offsets only count the
    /// segments that parsed. Layout stops at the first length that would
    /// run past the address space, since nothing after it can be located.
    pub fn attribute_segments(&self) -> Vec<AttributeSegment> {
        let mut offset = 0usize;
        let mut segments = Vec::new();
        for event in self.events_for(StatusKeyword::Attribute) {
            let Some(length) = event.arg(1).and_then(|n| n.parse::<usize>().ok()) else {
                continue;
            };
            let Some(next) = offset.checked_add(length) else {
                warn!(length, offset, "attribute length overflows the data offset");
                break;
            };
            let small = |i: usize| -> u32 { event.arg(i).and_then(|n| n.parse().ok()).unwrap_or(0) };
            let timestamp = |i: usize| -> u64 { event.arg(i).and_then(|n| n.parse().ok()).unwrap_or(0) };
            segments.push(AttributeSegment {
                fingerprint: event.arg(0).unwrap_or_default().to_string(),
                offset,
                length,
                kind: small(2),
                index: small(3),
                count: small(4),
                created: timestamp(5),
                expires: timestamp(6),
                flags: small(7),
            });
            offset = next;
        }
        segments
    }

    /// The bytes of one attribute packet, if the channel delivered them
    pub fn attribute_data(&self, segment: &AttributeSegment) -> Option<&[u8]> {
        self.attributes
            .get(segment.offset..segment.offset.checked_add(segment.length)?)
    }
}
