//! Configuration types for gpg-task

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::{collections::HashMap, path::PathBuf, time::Duration};

/// How gpg is located and launched
///
/// Shared by every task created from the same [`GpgContext`](crate::GpgContext).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TaskConfig {
    /// Explicit path to the gpg executable (auto-detected if None)
    #[serde(default)]
    pub gpg_path: Option<PathBuf>,

    /// Executable names tried during auto-detection, in order (default: gpg, gpg2)
    #[serde(default = "default_executable_names")]
    pub executable_names: Vec<String>,

    /// Directories searched before PATH during auto-detection
    #[serde(default = "default_search_paths")]
    pub search_paths: Vec<PathBuf>,

    /// Whether to search PATH if no explicit path is set (default: true)
    #[serde(default = "default_true")]
    pub search_path: bool,

    /// Arguments placed before every task's own arguments
    #[serde(default = "default_arguments")]
    pub default_arguments: Vec<String>,

    /// Add `--status-fd`/`--command-fd`/`--attribute-fd` automatically (default: true)
    ///
    /// Turning this off is only useful for running tools other than gpg
    /// through the engine.
    #[serde(default = "default_true")]
    pub inject_descriptor_arguments: bool,

    /// Descriptor number of the status channel in the child (default: 3)
    #[serde(default = "default_status_fd")]
    pub status_fd: i32,

    /// Descriptor number of the attribute channel in the child (default: 4)
    #[serde(default = "default_attribute_fd")]
    pub attribute_fd: i32,

    /// Descriptor number of the command channel in the child (default: 5)
    #[serde(default = "default_command_fd")]
    pub command_fd: i32,

    /// Pass `--batch` unless a task overrides it (default: false)
    #[serde(default)]
    pub batch_mode: bool,

    /// Deadline for every task unless overridden (None = no deadline)
    #[serde(default, with = "optional_duration_serde")]
    pub timeout: Option<Duration>,

    /// Extra environment variables (e.g. GNUPGHOME)
    #[serde(default)]
    pub environment: HashMap<String, String>,

    /// Start gpg with an empty environment plus `environment` (default: false)
    #[serde(default)]
    pub clear_environment: bool,

    /// Working directory for gpg (default: inherited)
    #[serde(default)]
    pub working_dir: Option<PathBuf>,

    /// How long output pumps may keep draining after gpg exited, in milliseconds (default: 2000)
    ///
    /// A descendant that inherited a pipe (gpg-agent started on demand, for
    /// instance) can keep it open indefinitely; pumps still running after this
    /// grace period are abandoned.
    #[serde(default = "default_pump_grace", with = "duration_millis_serde")]
    pub pump_grace: Duration,
}

impl Default for TaskConfig {
    fn default() -> Self {
        Self {
            gpg_path: None,
            executable_names: default_executable_names(),
            search_paths: default_search_paths(),
            search_path: true,
            default_arguments: default_arguments(),
            inject_descriptor_arguments: true,
            status_fd: default_status_fd(),
            attribute_fd: default_attribute_fd(),
            command_fd: default_command_fd(),
            batch_mode: false,
            timeout: None,
            environment: HashMap::new(),
            clear_environment: false,
            working_dir: None,
            pump_grace: default_pump_grace(),
        }
    }
}

impl TaskConfig {
    /// Config that runs gpg with `GNUPGHOME` pointing at `home`
    pub fn with_home(home: impl Into<PathBuf>) -> Self {
        let mut config = Self::default();
        config.environment.insert(
            "GNUPGHOME".to_string(),
            home.into().to_string_lossy().into_owned(),
        );
        config
    }

    /// Check descriptor numbers, executable names and the timeout
    ///
    /// # Errors
    ///
    /// [`Error::Config`](crate::Error::Config) naming the offending key.
    pub fn validate(&self) -> Result<()> {
        if self.gpg_path.is_none() && self.executable_names.iter().all(|n| n.trim().is_empty()) {
            return Err(config_error(
                "at least one executable name is required when gpg_path is not set",
                "executable_names",
            ));
        }
        for (key, fd) in [
            ("status_fd", self.status_fd),
            ("attribute_fd", self.attribute_fd),
            ("command_fd", self.command_fd),
        ] {
            if fd <= 2 {
                return Err(config_error(
                    format!("{key} must be greater than 2, got {fd}"),
                    key,
                ));
            }
        }
        if self.status_fd == self.attribute_fd
            || self.status_fd == self.command_fd
            || self.attribute_fd == self.command_fd
        {
            return Err(config_error(
                format!(
                    "descriptor numbers must be distinct (status {}, attribute {}, command {})",
                    self.status_fd, self.attribute_fd, self.command_fd
                ),
                "status_fd",
            ));
        }
        if self.timeout == Some(Duration::ZERO) {
            return Err(config_error("timeout must be positive", "timeout"));
        }
        Ok(())
    }
}

/// Smallest frame limit that still fits one encoded data chunk
pub const MIN_FRAME_LEN: usize = 256 * 1024;

/// Privilege separation helper connection
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct HelperConfig {
    /// Unix socket the helper listens on
    #[serde(default = "default_socket_path")]
    pub socket_path: PathBuf,

    /// Timeout for connecting to the helper (default: 5 seconds)
    #[serde(default = "default_connect_timeout", with = "duration_serde")]
    pub connect_timeout: Duration,

    /// Largest accepted protocol line in bytes (default: 4 MiB)
    ///
    /// Data travels in chunks well below [`MIN_FRAME_LEN`], so this only
    /// bounds status lines and prompt answers.
    #[serde(default = "default_max_frame_len")]
    pub max_frame_len: usize,
}

impl Default for HelperConfig {
    fn default() -> Self {
        Self {
            socket_path: default_socket_path(),
            connect_timeout: default_connect_timeout(),
            max_frame_len: default_max_frame_len(),
        }
    }
}

/// Keyring change notifications
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct WatcherConfig {
    /// Directories to watch (default: the GnuPG home directory)
    #[serde(default = "default_watch_paths")]
    pub paths: Vec<PathBuf>,

    /// Watch subdirectories too, needed for private-keys-v1.d (default: true)
    #[serde(default = "default_true")]
    pub recursive: bool,

    /// Quiet period before a batch of changes is reported, in milliseconds (default: 1000)
    #[serde(default = "default_latency", with = "duration_millis_serde")]
    pub latency: Duration,

    /// Longest a batch may be held back during continuous changes, in milliseconds (default: 10000)
    #[serde(default = "default_watch_max_delay", with = "duration_millis_serde")]
    pub max_delay: Duration,

    /// Changes this close to a locally noted change are ours, in milliseconds (default: 2000)
    #[serde(default = "default_self_change_window", with = "duration_millis_serde")]
    pub self_change_window: Duration,
}

impl Default for WatcherConfig {
    fn default() -> Self {
        Self {
            paths: default_watch_paths(),
            recursive: true,
            latency: default_latency(),
            max_delay: default_watch_max_delay(),
            self_change_window: default_self_change_window(),
        }
    }
}

impl WatcherConfig {
    pub(crate) fn validate(&self) -> Result<()> {
        if self.latency.is_zero() {
            return Err(config_error("latency must be positive", "latency"));
        }
        if self.max_delay < self.latency {
            return Err(config_error(
                format!(
                    "max_delay ({:?}) must not be shorter than latency ({:?})",
                    self.max_delay, self.latency
                ),
                "max_delay",
            ));
        }
        Ok(())
    }
}

/// Top-level configuration
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct Config {
    /// Launch settings for gpg
    #[serde(default)]
    pub task: TaskConfig,

    /// Helper connection settings
    #[serde(default)]
    pub helper: HelperConfig,

    /// Keyring watcher settings
    #[serde(default)]
    pub watcher: WatcherConfig,
}

impl Config {
    /// Check settings that serde cannot
    ///
    /// # Errors
    ///
    /// [`Error::Config`] naming the offending key.
    pub fn validate(&self) -> Result<()> {
        self.task.validate()?;
        if self.helper.max_frame_len < MIN_FRAME_LEN {
            return Err(config_error(
                format!("max_frame_len must be at least {MIN_FRAME_LEN} bytes"),
                "max_frame_len",
            ));
        }
        self.watcher.validate()
    }

    /// Parse and validate a JSON configuration
    pub fn from_json(json: &str) -> Result<Self> {
        let config: Config = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }
}

/// The GnuPG home directory: `$GNUPGHOME`, else `~/.gnupg`
pub fn default_gnupg_home() -> Option<PathBuf> {
    if let Some(home) = std::env::var_os("GNUPGHOME").filter(|h| !h.is_empty()) {
        return Some(PathBuf::from(home));
    }
    std::env::var_os("HOME")
        .filter(|h| !h.is_empty())
        .map(|h| PathBuf::from(h).join(".gnupg"))
}

fn config_error(message: impl Into<String>, key: &str) -> Error {
    Error::Config {
        message: message.into(),
        key: Some(key.to_string()),
    }
}

fn default_true() -> bool {
    true
}

fn default_executable_names() -> Vec<String> {
    vec!["gpg".to_string(), "gpg2".to_string()]
}

fn default_search_paths() -> Vec<PathBuf> {
    [
        "/usr/local/MacGPG2/bin",
        "/opt/homebrew/bin",
        "/usr/local/bin",
        "/usr/bin",
    ]
    .iter()
    .map(PathBuf::from)
    .collect()
}

fn default_arguments() -> Vec<String> {
    [
        "--no-greeting",
        "--no-tty",
        "--with-colons",
        "--fixed-list-mode",
        "--utf8-strings",
        "--display-charset",
        "utf-8",
        "--exit-on-status-write-error",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

fn default_status_fd() -> i32 {
    3
}

fn default_attribute_fd() -> i32 {
    4
}

fn default_command_fd() -> i32 {
    5
}

fn default_pump_grace() -> Duration {
    Duration::from_millis(2000)
}

fn default_socket_path() -> PathBuf {
    std::env::temp_dir().join("gpg-task-helper.sock")
}

fn default_connect_timeout() -> Duration {
    Duration::from_secs(5)
}

fn default_max_frame_len() -> usize {
    4 * 1024 * 1024
}

fn default_watch_paths() -> Vec<PathBuf> {
    default_gnupg_home().into_iter().collect()
}

fn default_latency() -> Duration {
    Duration::from_millis(1000)
}

fn default_watch_max_delay() -> Duration {
    Duration::from_millis(10_000)
}

fn default_self_change_window() -> Duration {
    Duration::from_millis(2000)
}

// Duration serialization helper
mod duration_serde {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(duration.as_secs())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let secs = u64::deserialize(deserializer)?;
        Ok(Duration::from_secs(secs))
    }
}

// Millisecond variant for sub-second settings
mod duration_millis_serde {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(duration.as_millis() as u64)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}

// Optional Duration serialization helper
mod optional_duration_serde {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Option<Duration>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match duration {
            Some(d) => serializer.serialize_some(&d.as_secs()),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<Duration>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let secs = Option::<u64>::deserialize(deserializer)?;
        Ok(secs.map(Duration::from_secs))
    }
}

// unwrap/expect are acceptable in tests for concise failure-on-error assertions
#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let config = Config::default();
        config.validate().expect("default config must validate");
        assert_eq!(config.task.status_fd, 3);
        assert_eq!(config.task.attribute_fd, 4);
        assert_eq!(config.task.command_fd, 5);
        assert!(config.task.inject_descriptor_arguments);
        assert_eq!(config.task.timeout, None);
    }

    #[test]
    fn empty_json_yields_defaults() {
        let config = Config::from_json("{}").expect("empty object is a valid config");
        assert_eq!(config.task.executable_names, vec!["gpg", "gpg2"]);
        assert_eq!(config.task.pump_grace, Duration::from_millis(2000));
        assert_eq!(config.watcher.latency, Duration::from_millis(1000));
        assert_eq!(config.helper.connect_timeout, Duration::from_secs(5));
    }

    #[test]
    fn partial_json_overrides_selected_fields() {
        let json = r#"{
            "task": {"gpg_path": "/opt/gnupg/bin/gpg", "timeout": 30, "status_fd": 7},
            "watcher": {"latency": 250, "max_delay": 500}
        }"#;
        let config = Config::from_json(json).unwrap();
        assert_eq!(config.task.gpg_path, Some(PathBuf::from("/opt/gnupg/bin/gpg")));
        assert_eq!(config.task.timeout, Some(Duration::from_secs(30)));
        assert_eq!(config.task.status_fd, 7);
        assert_eq!(config.task.command_fd, 5);
        assert_eq!(config.watcher.latency, Duration::from_millis(250));
    }

    #[test]
    fn millisecond_durations_serialize_as_integers() {
        let json = serde_json::to_value(WatcherConfig::default()).unwrap();
        assert_eq!(json["latency"], 1000);
        assert_eq!(json["max_delay"], 10_000);
        let json = serde_json::to_value(TaskConfig::default()).unwrap();
        assert_eq!(json["pump_grace"], 2000);
        assert!(json["timeout"].is_null());
    }

    #[test]
    fn rejects_standard_or_duplicate_descriptors() {
        let mut config = Config::default();
        config.task.command_fd = 1;
        match config.validate() {
            Err(Error::Config { key, .. }) => assert_eq!(key.as_deref(), Some("command_fd")),
            other => panic!("expected Config error, got {other:?}"),
        }

        let mut config = Config::default();
        config.task.attribute_fd = config.task.status_fd;
        assert!(matches!(config.validate(), Err(Error::Config { .. })));
    }

    #[test]
    fn rejects_inverted_watcher_delays() {
        let mut config = Config::default();
        config.watcher.max_delay = Duration::from_millis(10);
        match config.validate() {
            Err(Error::Config { key, .. }) => assert_eq!(key.as_deref(), Some("max_delay")),
            other => panic!("expected Config error, got {other:?}"),
        }
    }

    #[test]
    fn rejects_missing_executable_names() {
        let mut config = Config::default();
        config.task.executable_names.clear();
        assert!(config.validate().is_err());
        config.task.gpg_path = Some(PathBuf::from("/usr/bin/gpg"));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn frame_limit_must_fit_a_data_chunk() {
        let mut config = Config::default();
        config.helper.max_frame_len = MIN_FRAME_LEN - 1;
        match config.validate() {
            Err(Error::Config { key, .. }) => assert_eq!(key.as_deref(), Some("max_frame_len")),
            other => panic!("expected Config error, got {other:?}"),
        }
    }

    #[test]
    fn with_home_sets_gnupghome() {
        let config = TaskConfig::with_home("/tmp/keys");
        assert_eq!(
            config.environment.get("GNUPGHOME").map(String::as_str),
            Some("/tmp/keys")
        );
    }

    #[test]
    fn type_errors_are_reported() {
        assert!(matches!(
            Config::from_json(r#"{"task": {"timeout": "soon"}}"#),
            Err(Error::Serialization(_))
        ));
    }
}
