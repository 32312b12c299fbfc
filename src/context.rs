//! Shared setup for building tasks

use crate::config::TaskConfig;
use crate::error::Result;
use crate::helper::PrivilegeSeparationChannel;
use crate::task::{GpgTask, locate};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::info;

/// Configuration, executable and helper channel shared by a group of tasks
///
/// Build one per GnuPG home (or per application) and hand it to whatever
/// needs to run gpg. Cloning is cheap.
#[derive(Clone)]
pub struct GpgContext {
    config: Arc<TaskConfig>,
    gpg_path: Option<PathBuf>,
    channel: Option<Arc<dyn PrivilegeSeparationChannel>>,
}

impl GpgContext {
    /// Resolve the gpg executable once and share it between tasks
    ///
    /// # Errors
    ///
    /// [`Error::ExecutableNotFound`](crate::Error::ExecutableNotFound) if no
    /// executable matches the configuration.
    pub fn new(config: TaskConfig) -> Result<Self> {
        config.validate()?;
        let gpg_path = locate::resolve(&config)?;
        info!(path = %gpg_path.display(), "using gpg executable");
        Ok(Self {
            config: Arc::new(config),
            gpg_path: Some(gpg_path),
            channel: None,
        })
    }

    /// A context whose tasks run through a privilege separation helper
    ///
    /// The executable is resolved on the helper's side.
    ///
    /// # Errors
    ///
    /// [`Error::Config`](crate::Error::Config) if the configuration is invalid.
    pub fn sandboxed(config: TaskConfig, channel: Arc<dyn PrivilegeSeparationChannel>) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            config: Arc::new(config),
            gpg_path: None,
            channel: Some(channel),
        })
    }

    /// A new task without arguments
    pub fn task(&self) -> GpgTask {
        GpgTask::from_parts(self.config.clone(), self.gpg_path.clone(), self.channel.clone())
    }

    /// A new task with arguments and batch mode set
    pub fn task_with_arguments<I, S>(&self, arguments: I, batch_mode: bool) -> GpgTask
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.task().with_command(arguments, batch_mode)
    }

    /// Resolved executable; `None` for sandboxed contexts
    pub fn gpg_path(&self) -> Option<&Path> {
        self.gpg_path.as_deref()
    }

    /// Shared task configuration
    pub fn config(&self) -> &TaskConfig {
        &self.config
    }

    /// Whether tasks go through a helper
    pub fn is_sandboxed(&self) -> bool {
        self.channel.is_some()
    }
}

impl fmt::Debug for GpgContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GpgContext")
            .field("gpg_path", &self.gpg_path)
            .field("channel", &self.channel.as_ref().map(|c| c.name().to_string()))
            .finish_non_exhaustive()
    }
}

// unwrap/expect are acceptable in tests for concise failure-on-error assertions
#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::error::Error;
    use std::os::unix::fs::PermissionsExt;

    #[test]
    fn resolves_the_executable_once() {
        let dir = tempfile::tempdir().unwrap();
        let gpg = dir.path().join("gpg");
        std::fs::write(&gpg, "#!/bin/sh\nexit 0\n").unwrap();
        std::fs::set_permissions(&gpg, std::fs::Permissions::from_mode(0o755)).unwrap();

        let context = GpgContext::new(TaskConfig {
            gpg_path: Some(gpg.clone()),
            ..TaskConfig::default()
        })
        .unwrap();
        assert_eq!(context.gpg_path(), Some(gpg.as_path()));
        assert!(!context.is_sandboxed());

        let task = context.task_with_arguments(["--list-keys"], true);
        let line = task.command_line();
        assert!(line.ends_with(&["--batch".to_string(), "--list-keys".to_string()]));
    }

    #[test]
    fn missing_executable_fails_early() {
        let err = GpgContext::new(TaskConfig {
            gpg_path: None,
            executable_names: vec!["gpg-task-no-such-binary".to_string()],
            search_paths: Vec::new(),
            search_path: false,
            ..TaskConfig::default()
        })
        .unwrap_err();
        assert!(matches!(err, Error::ExecutableNotFound(_)));
    }

    #[test]
    fn invalid_descriptors_are_rejected_up_front() {
        let err = GpgContext::new(TaskConfig {
            gpg_path: Some(PathBuf::from("/bin/sh")),
            status_fd: 5,
            command_fd: 5,
            ..TaskConfig::default()
        })
        .unwrap_err();
        assert!(matches!(err, Error::Config { .. }));
    }
}
