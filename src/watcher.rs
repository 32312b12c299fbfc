//! Keyring change notification
//!
//! Watches GnuPG home directories and reports changes to keyring files.
//! gpg rewrites a keyring through several renames and writes, so raw
//! filesystem events are gathered until the directory has been quiet for
//! `latency` and then reported as a single [`KeyringEvent`]. Continuous churn
//! cannot hold a batch back longer than `max_delay`.
//!
//! Changes made by this process (for example a key import through a
//! [`GpgTask`](crate::GpgTask)) can be announced with
//! [`LocalChangeHandle::note`]; batches made up only of such changes are not
//! reported.
//!
//! The event loop runs until its [`CancellationToken`] is cancelled, flushing
//! any pending batch on the way out. Directories can be added and removed
//! while it runs through a [`WatcherControl`].
//!
//! # Example
//!
//! ```no_run
//! use gpg_task::config::WatcherConfig;
//! use gpg_task::watcher::{KeyringEvent, KeyringWatcher};
//! use tokio_util::sync::CancellationToken;
//!
//! # async fn example() -> gpg_task::Result<()> {
//! let watcher = KeyringWatcher::new(WatcherConfig::default())?;
//! let mut events = watcher.subscribe();
//! let control = watcher.control();
//! let shutdown = CancellationToken::new();
//! tokio::spawn(watcher.run(shutdown.clone()));
//!
//! control.add_path("/srv/shared-keyring").await?;
//! while let Ok(KeyringEvent::KeysChanged { paths }) = events.recv().await {
//!     println!("keyring changed: {paths:?}");
//! }
//! shutdown.cancel();
//! # Ok(())
//! # }
//! ```

use crate::config::WatcherConfig;
use crate::error::{Error, Result};
use notify::{
    Config as NotifyConfig, Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher,
};
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;
use tokio_stream::{Stream, StreamExt};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

const EVENT_CAPACITY: usize = 16;

const KEYRING_FILES: &[&str] = &["pubring.kbx", "pubring.gpg", "secring.gpg", "trustdb.gpg"];
const PRIVATE_KEYS_DIR: &str = "private-keys-v1.d";

/// Notification sent to subscribers
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum KeyringEvent {
    /// One or more keyring files changed
    KeysChanged {
        /// Changed files, deduplicated and sorted
        paths: Vec<PathBuf>,
    },
}

/// Whether `path` is a file gpg keeps keys or trust in
pub fn is_keyring_file(path: &Path) -> bool {
    let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
        return false;
    };
    if KEYRING_FILES.contains(&name) {
        return true;
    }
    path.parent()
        .and_then(Path::file_name)
        .is_some_and(|dir| dir == PRIVATE_KEYS_DIR)
        && name.ends_with(".key")
}

/// Batches changes until they settle
///
/// Pure state machine driven by explicit timestamps; [`KeyringWatcher`] feeds
/// it from filesystem events.
#[derive(Debug)]
pub struct Debouncer {
    latency: Duration,
    max_delay: Duration,
    self_change_window: Duration,
    pending: BTreeSet<PathBuf>,
    first_change: Option<Instant>,
    last_change: Option<Instant>,
    last_local_change: Option<Instant>,
    all_local: bool,
}

impl Debouncer {
    /// A debouncer with the timings from `config`
    pub fn new(config: &WatcherConfig) -> Self {
        Self {
            latency: config.latency,
            max_delay: config.max_delay,
            self_change_window: config.self_change_window,
            pending: BTreeSet::new(),
            first_change: None,
            last_change: None,
            last_local_change: None,
            all_local: true,
        }
    }

    /// Record a change to `path` seen at `at`
    pub fn push(&mut self, path: PathBuf, at: Instant) {
        let local = self
            .last_local_change
            .is_some_and(|noted| at.saturating_duration_since(noted) <= self.self_change_window);
        self.all_local &= local;
        self.first_change.get_or_insert(at);
        self.last_change = Some(at);
        self.pending.insert(path);
    }

    /// Record that this process changed the keyring at `at`
    pub fn note_local_change(&mut self, at: Instant) {
        self.last_local_change = Some(at);
    }

    /// When the pending batch is due, if there is one
    pub fn deadline(&self) -> Option<Instant> {
        let quiet = self.last_change? + self.latency;
        let forced = self.first_change? + self.max_delay;
        Some(quiet.min(forced))
    }

    /// Take the pending batch if it is due at `now`
    ///
    /// Returns `None` when nothing is due or when the whole batch was caused
    /// by this process.
    pub fn poll(&mut self, now: Instant) -> Option<KeyringEvent> {
        if self.deadline()? > now {
            return None;
        }
        let paths: Vec<PathBuf> = std::mem::take(&mut self.pending).into_iter().collect();
        let local = self.all_local;
        self.first_change = None;
        self.last_change = None;
        self.all_local = true;

        if local {
            debug!(count = paths.len(), "suppressing keyring changes made by this process");
            return None;
        }
        Some(KeyringEvent::KeysChanged { paths })
    }

    /// Whether changes are waiting
    pub fn has_pending(&self) -> bool {
        !self.pending.is_empty()
    }
}

/// Lets other parts of the process announce their own keyring changes
#[derive(Clone, Debug, Default)]
pub struct LocalChangeHandle {
    last: Arc<Mutex<Option<Instant>>>,
}

impl LocalChangeHandle {
    /// Mark a keyring change made by this process, now
    pub fn note(&self) {
        let mut last = self.last.lock().unwrap_or_else(|e| e.into_inner());
        *last = Some(Instant::now());
    }

    fn last(&self) -> Option<Instant> {
        *self.last.lock().unwrap_or_else(|e| e.into_inner())
    }
}

enum Command {
    Add(PathBuf, oneshot::Sender<Result<()>>),
    Remove(PathBuf, oneshot::Sender<Result<()>>),
}

/// Changes the watched directories of a running [`KeyringWatcher`]
#[derive(Clone, Debug)]
pub struct WatcherControl {
    commands: mpsc::UnboundedSender<Command>,
}

impl WatcherControl {
    /// Start watching another directory
    ///
    /// # Errors
    ///
    /// [`Error::Watch`] if the directory cannot be watched or the watcher
    /// has stopped.
    pub async fn add_path(&self, path: impl Into<PathBuf>) -> Result<()> {
        let path = path.into();
        self.request(|reply| Command::Add(path, reply)).await
    }

    /// Stop watching a directory
    ///
    /// # Errors
    ///
    /// [`Error::Watch`] if the directory was not being watched or the
    /// watcher has stopped.
    pub async fn remove_path(&self, path: impl Into<PathBuf>) -> Result<()> {
        let path = path.into();
        self.request(|reply| Command::Remove(path, reply)).await
    }

    async fn request(&self, command: impl FnOnce(oneshot::Sender<Result<()>>) -> Command) -> Result<()> {
        let (reply, answer) = oneshot::channel();
        self.commands
            .send(command(reply))
            .map_err(|_| Error::Watch("keyring watcher has stopped".to_string()))?;
        answer
            .await
            .map_err(|_| Error::Watch("keyring watcher has stopped".to_string()))?
    }
}

impl std::fmt::Debug for Command {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Command::Add(path, _) => f.debug_tuple("Add").field(path).finish(),
            Command::Remove(path, _) => f.debug_tuple("Remove").field(path).finish(),
        }
    }
}

/// Watches keyring directories and broadcasts debounced changes
pub struct KeyringWatcher {
    /// Filesystem watcher instance
    watcher: RecommendedWatcher,

    /// Channel for receiving filesystem events
    rx: mpsc::UnboundedReceiver<notify::Result<Event>>,

    events: broadcast::Sender<KeyringEvent>,
    local_changes: LocalChangeHandle,
    config: WatcherConfig,
    watched: Vec<PathBuf>,
    commands_tx: mpsc::UnboundedSender<Command>,
    commands: mpsc::UnboundedReceiver<Command>,
}

impl KeyringWatcher {
    /// Create a watcher and start watching the configured paths
    ///
    /// Configured paths that do not exist yet are skipped with a warning.
    ///
    /// # Errors
    ///
    /// [`Error::Config`] for invalid timings, [`Error::Watch`] if the
    /// filesystem watcher cannot be initialized.
    pub fn new(config: WatcherConfig) -> Result<Self> {
        config.validate()?;
        let (tx, rx) = mpsc::unbounded_channel();

        let watcher = RecommendedWatcher::new(
            move |res| {
                if let Err(e) = tx.send(res) {
                    error!("Failed to send filesystem event: {}", e);
                }
            },
            NotifyConfig::default(),
        )
        .map_err(|e| Error::Watch(e.to_string()))?;

        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let (commands_tx, commands) = mpsc::unbounded_channel();
        let mut this = Self {
            watcher,
            rx,
            events,
            local_changes: LocalChangeHandle::default(),
            config,
            watched: Vec::new(),
            commands_tx,
            commands,
        };

        for path in this.config.paths.clone() {
            if !path.exists() {
                warn!(path = %path.display(), "keyring directory does not exist, not watching");
                continue;
            }
            this.add_path(&path)?;
        }
        Ok(this)
    }

    /// Start watching another directory
    ///
    /// # Errors
    ///
    /// [`Error::Watch`] if the directory cannot be watched.
    pub fn add_path(&mut self, path: &Path) -> Result<()> {
        if self.watched.iter().any(|p| p == path) {
            return Ok(());
        }
        let mode = if self.config.recursive {
            RecursiveMode::Recursive
        } else {
            RecursiveMode::NonRecursive
        };
        self.watcher
            .watch(path, mode)
            .map_err(|e| Error::Watch(format!("Failed to watch {}: {}", path.display(), e)))?;
        info!(path = %path.display(), "watching keyring directory");
        self.watched.push(path.to_path_buf());
        Ok(())
    }

    /// Stop watching a directory
    ///
    /// # Errors
    ///
    /// [`Error::Watch`] if the directory was not being watched.
    pub fn remove_path(&mut self, path: &Path) -> Result<()> {
        self.watcher
            .unwatch(path)
            .map_err(|e| Error::Watch(format!("Failed to unwatch {}: {}", path.display(), e)))?;
        self.watched.retain(|p| p != path);
        info!(path = %path.display(), "stopped watching keyring directory");
        Ok(())
    }

    /// Directories currently watched
    pub fn watched_paths(&self) -> &[PathBuf] {
        &self.watched
    }

    /// Receive keyring events
    pub fn subscribe(&self) -> broadcast::Receiver<KeyringEvent> {
        self.events.subscribe()
    }

    /// Keyring events as a stream; a subscriber that falls behind skips the
    /// events it missed
    pub fn stream(&self) -> impl Stream<Item = KeyringEvent> + Send + 'static {
        BroadcastStream::new(self.events.subscribe()).filter_map(|result| match result {
            Ok(event) => Some(event),
            Err(BroadcastStreamRecvError::Lagged(skipped)) => {
                warn!(skipped, "keyring subscriber lagged");
                None
            }
        })
    }

    /// A handle for changing the watched directories once [`run`](Self::run)
    /// owns the watcher
    pub fn control(&self) -> WatcherControl {
        WatcherControl {
            commands: self.commands_tx.clone(),
        }
    }

    /// A handle for announcing changes made by this process
    pub fn local_change_handle(&self) -> LocalChangeHandle {
        self.local_changes.clone()
    }

    /// Mark a keyring change made by this process, now
    pub fn note_local_change(&self) {
        self.local_changes.note();
    }

    /// Run the event loop until `shutdown` is cancelled
    ///
    /// Should be spawned as a tokio task. A pending batch is flushed before
    /// returning, without waiting for it to settle.
    pub async fn run(mut self, shutdown: CancellationToken) {
        info!("keyring watcher started");
        let mut debouncer = Debouncer::new(&self.config);

        loop {
            let deadline = debouncer.deadline();
            let due = async {
                match deadline {
                    Some(at) => tokio::time::sleep_until(tokio::time::Instant::from_std(at)).await,
                    None => std::future::pending().await,
                }
            };

            tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                Some(command) = self.commands.recv() => self.apply(command),
                received = self.rx.recv() => match received {
                    Some(Ok(event)) => {
                        if let Some(at) = self.local_changes.last() {
                            debouncer.note_local_change(at);
                        }
                        self.handle_event(event, &mut debouncer);
                    }
                    Some(Err(e)) => error!(error = %e, "keyring watch error"),
                    None => break,
                },
                _ = due => self.publish(debouncer.poll(Instant::now())),
            }
        }

        if debouncer.has_pending() {
            let flushed = debouncer.poll(Instant::now() + self.config.max_delay);
            self.publish(flushed);
        }
        info!("keyring watcher stopped");
    }

    fn apply(&mut self, command: Command) {
        debug!(?command, "keyring watcher command");
        let (result, reply) = match command {
            Command::Add(path, reply) => (self.add_path(&path), reply),
            Command::Remove(path, reply) => (self.remove_path(&path), reply),
        };
        if let Err(e) = &result {
            warn!(error = %e, "keyring watcher command failed");
        }
        let _ = reply.send(result);
    }

    fn handle_event(&self, event: Event, debouncer: &mut Debouncer) {
        if !matches!(
            event.kind,
            EventKind::Create(_) | EventKind::Modify(_) | EventKind::Remove(_)
        ) {
            return;
        }
        let now = Instant::now();
        for path in event.paths.into_iter().filter(|p| is_keyring_file(p)) {
            debug!(path = %path.display(), kind = ?event.kind, "keyring file changed");
            debouncer.push(path, now);
        }
    }

    fn publish(&self, event: Option<KeyringEvent>) {
        let Some(event) = event else {
            return;
        };
        info!(?event, "keyring changed");
        if self.events.send(event).is_err() {
            debug!("no subscribers for keyring event");
        }
    }
}
