//! Progress accounting
//!
//! Two measures are tracked: bytes written to the child's stdin, and the
//! counters gpg reports in `PROGRESS` status events (one counter per logical
//! stream, keyed by the event's `what` field). Reported progress is the larger
//! of the two, so callers get movement whether gpg reads from stdin or from
//! files named on the command line.

use crate::status::StatusEvent;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

/// A progress sample
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Progress {
    /// Bytes processed so far
    pub processed: u64,
    /// Total bytes expected, when every input declared its length
    pub total: Option<u64>,
}

impl Progress {
    /// Completed fraction in `0.0..=1.0`, when the total is known and non-zero
    pub fn fraction(&self) -> Option<f64> {
        match self.total {
            Some(total) if total > 0 => Some((self.processed as f64 / total as f64).min(1.0)),
            _ => None,
        }
    }
}

/// Callback receiving progress samples
pub type ProgressHandler = Arc<dyn Fn(Progress) + Send + Sync>;

pub(crate) struct ProgressTracker {
    total: Option<u64>,
    written: AtomicU64,
    streams: Mutex<HashMap<String, u64>>,
    handler: Option<ProgressHandler>,
}

impl ProgressTracker {
    pub(crate) fn new(total: Option<u64>, handler: Option<ProgressHandler>) -> Self {
        Self {
            total,
            written: AtomicU64::new(0),
            streams: Mutex::new(HashMap::new()),
            handler,
        }
    }

    /// Bytes were written to stdin
    pub(crate) fn record_written(&self, bytes: u64) {
        self.written.fetch_add(bytes, Ordering::Relaxed);
        self.emit();
    }

    /// A remote run reported its own processed count
    pub(crate) fn record_remote(&self, processed: u64) {
        self.written.fetch_max(processed, Ordering::Relaxed);
        self.emit();
    }

    /// `PROGRESS <what> <char> <cur> <total> [<units>]`
    pub(crate) fn record_status(&self, event: &StatusEvent) {
        let (Some(what), Some(current)) = (
            event.arg(0),
            event.arg(2).and_then(|cur| cur.parse::<u64>().ok()),
        ) else {
            return;
        };
        {
            let mut streams = self.streams.lock().unwrap_or_else(|e| e.into_inner());
            streams.insert(what.to_string(), current);
        }
        self.emit();
    }

    pub(crate) fn current(&self) -> Progress {
        let reported: u64 = {
            let streams = self.streams.lock().unwrap_or_else(|e| e.into_inner());
            streams.values().sum()
        };
        Progress {
            processed: self.written.load(Ordering::Relaxed).max(reported),
            total: self.total,
        }
    }

    fn emit(&self) {
        if let Some(handler) = &self.handler {
            handler(self.current());
        }
    }
}
