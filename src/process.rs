//! Child process handle with auxiliary descriptor channels
//!
//! gpg talks on more than the three standard streams: the status protocol,
//! prompt answers and attribute data each travel over their own descriptor,
//! selected on the command line (`--status-fd 3`, `--command-fd 5`, ...).
//! [`ProcessHandle`] spawns the child with those descriptors already in place
//! and hands out the parent ends as async pipes.
//!
//! Every descriptor the handle owns is closed when the handle (or the taken
//! pipe end) is dropped, and a child that is still running when the handle is
//! dropped is killed.

use crate::error::{Error, Result};
use std::collections::HashMap;
use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use tokio::process::{Child, ChildStderr, ChildStdin, ChildStdout, Command};
use tracing::debug;

#[cfg(unix)]
use tokio::net::unix::pipe;

/// Which end of an auxiliary pipe the parent keeps
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ChannelDirection {
    /// The child writes, the parent reads (status, attribute data)
    ParentReads,
    /// The parent writes, the child reads (command answers)
    ParentWrites,
}

/// An extra pipe inherited by the child under a fixed descriptor number
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AuxChannel {
    /// Name used to take the parent end after spawning
    pub name: String,
    /// Descriptor number inside the child (must be greater than 2)
    pub fd: i32,
    /// Which side the parent keeps
    pub direction: ChannelDirection,
}

impl AuxChannel {
    /// A channel the child writes to
    pub fn output(name: impl Into<String>, fd: i32) -> Self {
        Self {
            name: name.into(),
            fd,
            direction: ChannelDirection::ParentReads,
        }
    }

    /// A channel the child reads from
    pub fn input(name: impl Into<String>, fd: i32) -> Self {
        Self {
            name: name.into(),
            fd,
            direction: ChannelDirection::ParentWrites,
        }
    }
}

/// Everything needed to launch a child; environment and working directory
/// are snapshotted here and never re-read after spawning
#[derive(Clone, Debug, Default)]
pub struct SpawnSpec {
    /// Executable to run
    pub program: PathBuf,
    /// Arguments, passed through untouched
    pub args: Vec<String>,
    /// Extra environment variables
    pub env: Vec<(String, String)>,
    /// Start from an empty environment instead of inheriting the parent's
    pub env_clear: bool,
    /// Working directory of the child
    pub working_dir: Option<PathBuf>,
    /// Auxiliary pipes
    pub aux: Vec<AuxChannel>,
}

impl SpawnSpec {
    /// Spec for `program` with no arguments
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            ..Default::default()
        }
    }

    fn validate(&self) -> Result<()> {
        let mut seen: Vec<(i32, String)> = Vec::with_capacity(self.aux.len());
        for channel in &self.aux {
            if channel.fd <= 2 {
                return Err(Error::Config {
                    message: format!(
                        "auxiliary channel {} cannot use standard descriptor {}",
                        channel.name, channel.fd
                    ),
                    key: Some(channel.name.clone()),
                });
            }
            if seen
                .iter()
                .any(|(fd, name)| *fd == channel.fd || name == &channel.name)
            {
                return Err(Error::Config {
                    message: format!(
                        "auxiliary channel {} reuses descriptor {} or its name",
                        channel.name, channel.fd
                    ),
                    key: Some(channel.name.clone()),
                });
            }
            seen.push((channel.fd, channel.name.clone()));
        }
        Ok(())
    }
}

/// Lifecycle of a spawned child
///
/// A [`SpawnSpec`] is the not-yet-started form; a handle only exists once the
/// child is running. Terminal states never change again.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ProcessState {
    /// The child is running (or exited but has not been reaped)
    Running,
    /// The child exited on its own
    Completed(i32),
    /// The child was killed through [`ProcessHandle::terminate`]
    Cancelled,
    /// Waiting for the child failed
    Failed(String),
}

impl ProcessState {
    /// Whether the state can no longer change
    pub fn is_terminal(&self) -> bool {
        !matches!(self, ProcessState::Running)
    }
}

/// A running child process and the parent ends of its pipes
#[derive(Debug)]
pub struct ProcessHandle {
    child: Child,
    program: PathBuf,
    pid: Option<u32>,
    state: ProcessState,
    exit_status: Option<ExitStatus>,
    terminate_requested: bool,
    #[cfg(unix)]
    aux_readers: HashMap<String, pipe::Receiver>,
    #[cfg(unix)]
    aux_writers: HashMap<String, pipe::Sender>,
}

impl ProcessHandle {
    /// Spawn a child according to `spec`
    ///
    /// Must be called from within a Tokio runtime. Standard streams are always
    /// piped.
    ///
    /// # Errors
    ///
    /// [`Error::Spawn`] if the executable is missing or cannot be executed, or
    /// if a pipe cannot be created; [`Error::Config`] for invalid channel
    /// layouts.
    pub fn spawn(spec: SpawnSpec) -> Result<Self> {
        spec.validate()?;

        let mut command = Command::new(&spec.program);
        command
            .args(&spec.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if spec.env_clear {
            command.env_clear();
        }
        command.envs(spec.env.iter().map(|(k, v)| (k.as_str(), v.as_str())));
        if let Some(dir) = &spec.working_dir {
            command.current_dir(dir);
        }

        #[cfg(unix)]
        {
            let spawn_error = |reason: String| Error::Spawn {
                program: spec.program.clone(),
                reason,
            };
            let aux = unix::prepare(&mut command, &spec.aux)
                .map_err(|e| spawn_error(format!("failed to create pipes: {}", e)))?;
            let child = command
                .spawn()
                .map_err(|e| spawn_error(e.to_string()))?;
            // The child holds its own copies now
            drop(aux.child_ends);

            let pid = child.id();
            debug!(?pid, program = %spec.program.display(), "spawned child process");
            Ok(Self {
                child,
                program: spec.program,
                pid,
                state: ProcessState::Running,
                exit_status: None,
                terminate_requested: false,
                aux_readers: aux.readers,
                aux_writers: aux.writers,
            })
        }

        #[cfg(not(unix))]
        {
            if !spec.aux.is_empty() {
                return Err(Error::NotSupported(
                    "auxiliary descriptor channels require a unix platform".to_string(),
                ));
            }
            let child = command.spawn().map_err(|e| Error::Spawn {
                program: spec.program.clone(),
                reason: e.to_string(),
            })?;
            let pid = child.id();
            Ok(Self {
                child,
                program: spec.program,
                pid,
                state: ProcessState::Running,
                exit_status: None,
                terminate_requested: false,
            })
        }
    }

    /// OS process id, while the child has not been reaped
    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// The executable this handle launched
    pub fn program(&self) -> &std::path::Path {
        &self.program
    }

    /// Current lifecycle state
    pub fn state(&self) -> &ProcessState {
        &self.state
    }

    /// Take the parent end of the child's stdin
    pub fn take_stdin(&mut self) -> Option<ChildStdin> {
        self.child.stdin.take()
    }

    /// Take the parent end of the child's stdout
    pub fn take_stdout(&mut self) -> Option<ChildStdout> {
        self.child.stdout.take()
    }

    /// Take the parent end of the child's stderr
    pub fn take_stderr(&mut self) -> Option<ChildStderr> {
        self.child.stderr.take()
    }

    /// Take the readable end of an auxiliary output channel
    #[cfg(unix)]
    pub fn take_aux_reader(&mut self, name: &str) -> Option<pipe::Receiver> {
        self.aux_readers.remove(name)
    }

    /// Take the writable end of an auxiliary input channel
    #[cfg(unix)]
    pub fn take_aux_writer(&mut self, name: &str) -> Option<pipe::Sender> {
        self.aux_writers.remove(name)
    }

    /// Wait for the child to exit
    ///
    /// Cancel safe. Once the child has been reaped the stored status is
    /// returned again on later calls.
    pub async fn wait(&mut self) -> Result<ExitStatus> {
        if let Some(status) = self.exit_status {
            return Ok(status);
        }

        match self.child.wait().await {
            Ok(status) => {
                self.exit_status = Some(status);
                self.close_aux();
                self.state = if self.terminate_requested {
                    ProcessState::Cancelled
                } else {
                    ProcessState::Completed(exit_code(status))
                };
                debug!(pid = ?self.pid, ?status, "child process exited");
                Ok(status)
            }
            Err(e) => {
                self.state = ProcessState::Failed(e.to_string());
                self.close_aux();
                Err(Error::Io(e))
            }
        }
    }

    /// Kill the child and reap it
    ///
    /// Idempotent: a child that already exited (or was already killed) is left
    /// alone.
    pub async fn terminate(&mut self) -> Result<()> {
        if self.exit_status.is_none() && !self.state.is_terminal() {
            self.terminate_requested = true;
            match self.child.start_kill() {
                Ok(()) => debug!(pid = ?self.pid, "sent kill signal to child"),
                // Already reaped by someone else
                Err(e) if e.kind() == std::io::ErrorKind::InvalidInput => {}
                Err(e) => return Err(Error::Io(e)),
            }
            self.wait().await?;
        }
        self.close_aux();
        Ok(())
    }

    /// Exit code once the child has been reaped
    pub fn exit_code(&self) -> Option<i32> {
        self.exit_status.map(exit_code)
    }

    fn close_aux(&mut self) {
        #[cfg(unix)]
        {
            self.aux_readers.clear();
            self.aux_writers.clear();
        }
    }
}

/// Exit code of a finished process; death by signal N maps to `128 + N`
pub fn exit_code(status: ExitStatus) -> i32 {
    if let Some(code) = status.code() {
        return code;
    }
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(signal) = status.signal() {
            return 128 + signal;
        }
    }
    -1
}

#[cfg(unix)]
mod unix {
    use super::{AuxChannel, ChannelDirection};
    use std::collections::HashMap;
    use std::fs::File;
    use std::io;
    use std::os::fd::{AsRawFd, OwnedFd, RawFd};
    use tokio::net::unix::pipe;
    use tokio::process::Command;

    pub(super) struct PreparedChannels {
        pub(super) readers: HashMap<String, pipe::Receiver>,
        pub(super) writers: HashMap<String, pipe::Sender>,
        pub(super) child_ends: Vec<OwnedFd>,
    }

    /// Create one pipe per channel and arrange for the child ends to land on
    /// their target descriptors between fork and exec
    pub(super) fn prepare(command: &mut Command, channels: &[AuxChannel]) -> io::Result<PreparedChannels> {
        let mut prepared = PreparedChannels {
            readers: HashMap::new(),
            writers: HashMap::new(),
            child_ends: Vec::with_capacity(channels.len()),
        };
        if channels.is_empty() {
            return Ok(prepared);
        }

        let mut remaps: Vec<(RawFd, RawFd)> = Vec::with_capacity(channels.len());
        for channel in channels {
            // Both ends are created close-on-exec; only the remapped copy survives exec
            let (read_end, write_end) = io::pipe()?;
            let child_end: OwnedFd = match channel.direction {
                ChannelDirection::ParentReads => {
                    let receiver = pipe::Receiver::from_file(File::from(OwnedFd::from(read_end)))?;
                    prepared.readers.insert(channel.name.clone(), receiver);
                    write_end.into()
                }
                ChannelDirection::ParentWrites => {
                    let sender = pipe::Sender::from_file(File::from(OwnedFd::from(write_end)))?;
                    prepared.writers.insert(channel.name.clone(), sender);
                    read_end.into()
                }
            };
            remaps.push((child_end.as_raw_fd(), channel.fd));
            prepared.child_ends.push(child_end);
        }

        let floor = remaps.iter().map(|(_, target)| *target).max().unwrap_or(2) + 1;
        let mut staged: Vec<RawFd> = vec![-1; remaps.len()];

        // SAFETY: the closure runs in the forked child before exec. It only calls
        // async-signal-safe functions (fcntl, dup2) and does not allocate: `staged`
        // is preallocated and written in place.
        unsafe {
            command.pre_exec(move || remap_descriptors(&remaps, &mut staged, floor));
        }

        Ok(prepared)
    }

    /// Move every source above `floor` first so that a source sitting on
    /// another channel's target number is not clobbered, then dup onto the
    /// targets. `dup2` clears close-on-exec on the target; the staged copies
    /// keep it and disappear at exec.
    fn remap_descriptors(remaps: &[(RawFd, RawFd)], staged: &mut [RawFd], floor: RawFd) -> io::Result<()> {
        for (slot, (source, _)) in staged.iter_mut().zip(remaps) {
            // SAFETY: `source` is an open descriptor inherited from the parent
            let fd = unsafe { libc::fcntl(*source, libc::F_DUPFD_CLOEXEC, floor) };
            if fd < 0 {
                return Err(io::Error::last_os_error());
            }
            *slot = fd;
        }
        for (staged_fd, (_, target)) in staged.iter().zip(remaps) {
            // SAFETY: both descriptors are valid; dup2 atomically replaces `target`
            if unsafe { libc::dup2(*staged_fd, *target) } < 0 {
                return Err(io::Error::last_os_error());
            }
        }
        Ok(())
    }
}

// unwrap/expect are acceptable in tests for concise failure-on-error assertions
#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    fn sh(script: &str) -> SpawnSpec {
        let mut spec = SpawnSpec::new("/bin/sh");
        spec.args = vec!["-c".to_string(), script.to_string()];
        spec
    }

    #[tokio::test]
    async fn missing_executable_is_a_spawn_error() {
        let err = ProcessHandle::spawn(SpawnSpec::new("/nonexistent/path/to/gpg")).unwrap_err();
        match err {
            Error::Spawn { program, .. } => {
                assert_eq!(program, PathBuf::from("/nonexistent/path/to/gpg"))
            }
            other => panic!("expected Spawn error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn rejects_standard_descriptor_numbers() {
        let mut spec = sh("true");
        spec.aux.push(AuxChannel::output("status", 2));
        assert!(matches!(
            ProcessHandle::spawn(spec),
            Err(Error::Config { .. })
        ));

        let mut spec = sh("true");
        spec.aux.push(AuxChannel::output("status", 3));
        spec.aux.push(AuxChannel::input("command", 3));
        assert!(matches!(
            ProcessHandle::spawn(spec),
            Err(Error::Config { .. })
        ));
    }

    #[tokio::test]
    async fn standard_streams_and_exit_code() {
        let mut handle = ProcessHandle::spawn(sh("read line; echo \"got $line\"; echo oops >&2; exit 7")).unwrap();
        let mut stdin = handle.take_stdin().unwrap();
        stdin.write_all(b"hello\n").await.unwrap();
        drop(stdin);

        let mut out = String::new();
        handle.take_stdout().unwrap().read_to_string(&mut out).await.unwrap();
        let mut err = String::new();
        handle.take_stderr().unwrap().read_to_string(&mut err).await.unwrap();

        let status = handle.wait().await.unwrap();
        assert_eq!(status.code(), Some(7));
        assert_eq!(out, "got hello\n");
        assert_eq!(err, "oops\n");
        assert_eq!(handle.state(), &ProcessState::Completed(7));
        assert_eq!(handle.exit_code(), Some(7));
    }

    #[tokio::test]
    async fn auxiliary_channels_land_on_their_descriptors() {
        let mut spec = sh("read answer <&5; echo \"[GNUPG:] GOT_IT $answer\" >&3");
        spec.aux.push(AuxChannel::output("status", 3));
        spec.aux.push(AuxChannel::input("command", 5));
        let mut handle = ProcessHandle::spawn(spec).unwrap();

        let mut command = handle.take_aux_writer("command").unwrap();
        command.write_all(b"yes\n").await.unwrap();
        drop(command);

        let mut status = String::new();
        handle
            .take_aux_reader("status")
            .unwrap()
            .read_to_string(&mut status)
            .await
            .unwrap();
        assert_eq!(status, "[GNUPG:] GOT_IT yes\n");
        assert!(handle.wait().await.unwrap().success());
        assert!(handle.take_aux_reader("status").is_none());
    }

    #[tokio::test]
    async fn terminate_kills_and_is_idempotent() {
        let mut handle = ProcessHandle::spawn(sh("exec sleep 30")).unwrap();
        assert_eq!(handle.state(), &ProcessState::Running);

        tokio::time::timeout(Duration::from_secs(5), handle.terminate())
            .await
            .expect("terminate should not hang")
            .unwrap();
        assert_eq!(handle.state(), &ProcessState::Cancelled);
        assert_eq!(handle.exit_code(), Some(128 + libc::SIGKILL));

        handle.terminate().await.unwrap();
        assert_eq!(handle.state(), &ProcessState::Cancelled);
    }

    #[tokio::test]
    async fn terminate_after_exit_keeps_completed_state() {
        let mut handle = ProcessHandle::spawn(sh("exit 0")).unwrap();
        handle.wait().await.unwrap();
        handle.terminate().await.unwrap();
        assert_eq!(handle.state(), &ProcessState::Completed(0));
    }

    #[tokio::test]
    async fn environment_and_working_directory_are_applied() {
        let dir = tempfile::tempdir().unwrap();
        let mut spec = sh("printf '%s:%s' \"$GNUPGHOME\" \"$(pwd -P)\"");
        spec.env.push(("GNUPGHOME".to_string(), "/tmp/home".to_string()));
        spec.working_dir = Some(dir.path().to_path_buf());
        let mut handle = ProcessHandle::spawn(spec).unwrap();

        let mut out = String::new();
        handle.take_stdout().unwrap().read_to_string(&mut out).await.unwrap();
        handle.wait().await.unwrap();

        let canonical = std::fs::canonicalize(dir.path()).unwrap();
        assert_eq!(out, format!("/tmp/home:{}", canonical.display()));
    }
}
