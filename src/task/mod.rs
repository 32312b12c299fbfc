//! The gpg task engine
//!
//! A [`GpgTask`] runs one gpg invocation: it spawns the process (or asks a
//! privilege separation helper to), feeds stdin, collects stdout, stderr and
//! attribute data, and drives the status channel, answering prompts from a
//! [`TaskDelegate`] or a [`TaskOrder`]. Every channel is pumped by its own
//! Tokio task, so no amount of output on one channel can stall another.
//!
//! ```no_run
//! use gpg_task::{GpgTask, TaskConfig, TaskOrder};
//!
//! # #[tokio::main]
//! # async fn main() -> gpg_task::Result<()> {
//! let mut task = GpgTask::with_arguments(TaskConfig::default(), ["--gen-key"], true);
//! let mut order = TaskOrder::new();
//! order.add_cmd("Alice", "keygen.name");
//! order.add_cmd("alice@example.org", "keygen.email");
//! task.set_order(order)?;
//!
//! let result = task.start().await?;
//! if !result.is_success() {
//!     eprintln!("gpg failed ({:?}): {}", result.error_codes, result.err_text());
//! }
//! # Ok(())
//! # }
//! ```

mod delegate;
mod dispatch;
mod input;
#[cfg(unix)]
mod local;
pub(crate) mod locate;
mod progress;
mod remote;
mod result;

pub use delegate::{Answer, PassphraseRequest, PromptContext, PromptRequest, TaskDelegate, UserIdHint};
pub use input::InputSource;
pub use locate::find_executable;
pub use progress::{Progress, ProgressHandler};
pub use result::{AttributeSegment, StatusDict, TaskOutcome, TaskResult};

use crate::config::TaskConfig;
use crate::error::{Error, Result};
use crate::helper::PrivilegeSeparationChannel;
use crate::order::TaskOrder;
use dispatch::Dispatcher;
use progress::ProgressTracker;
use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Lifecycle of a task
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TaskState {
    /// Accepting arguments and inputs
    Configured,
    /// Resolving the executable and preparing inputs
    Starting,
    /// The process is running
    Running,
    /// The process exited on its own
    Finished,
    /// Stopped by [`CancelHandle::cancel`]
    Cancelled,
    /// Stopped by its deadline
    TimedOut,
    /// `start` returned an error
    Failed,
}

impl fmt::Display for TaskState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TaskState::Configured => "configured",
            TaskState::Starting => "starting",
            TaskState::Running => "running",
            TaskState::Finished => "finished",
            TaskState::Cancelled => "cancelled",
            TaskState::TimedOut => "timed out",
            TaskState::Failed => "failed",
        };
        f.write_str(name)
    }
}

impl From<TaskOutcome> for TaskState {
    fn from(outcome: TaskOutcome) -> Self {
        match outcome {
            TaskOutcome::Finished => TaskState::Finished,
            TaskOutcome::Cancelled => TaskState::Cancelled,
            TaskOutcome::TimedOut => TaskState::TimedOut,
        }
    }
}

/// Cancels a task from anywhere
///
/// Cloneable and `Send + Sync`. Cancelling before `start` makes `start`
/// return a cancelled result without spawning anything; cancelling a running
/// task kills the process and `start` returns promptly.
#[derive(Clone, Debug)]
pub struct CancelHandle {
    token: CancellationToken,
}

impl CancelHandle {
    /// Request cancellation; idempotent
    pub fn cancel(&self) {
        self.token.cancel();
    }

    /// Whether cancellation was requested
    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }
}

/// One gpg invocation
pub struct GpgTask {
    config: Arc<TaskConfig>,
    gpg_path: Option<PathBuf>,
    channel: Option<Arc<dyn PrivilegeSeparationChannel>>,
    arguments: Vec<String>,
    apply_defaults: bool,
    batch_mode: bool,
    read_attributes: bool,
    timeout: Option<Duration>,
    inputs: Vec<InputSource>,
    order: Option<TaskOrder>,
    delegate: Option<Arc<dyn TaskDelegate>>,
    progress_handler: Option<ProgressHandler>,
    user_info: HashMap<String, String>,
    prompt_context: PromptContext,
    cancel: CancellationToken,
    state: TaskState,
}

impl GpgTask {
    /// A task with no arguments yet
    pub fn new(config: TaskConfig) -> Self {
        Self::from_parts(Arc::new(config), None, None)
    }

    /// A task with arguments and batch mode set
    pub fn with_arguments<I, S>(config: TaskConfig, arguments: I, batch_mode: bool) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::new(config).with_command(arguments, batch_mode)
    }

    /// Set the arguments and batch mode of a task that was just built
    pub(crate) fn with_command<I, S>(mut self, arguments: I, batch_mode: bool) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.arguments.extend(arguments.into_iter().map(Into::into));
        self.batch_mode = batch_mode;
        self
    }

    pub(crate) fn from_parts(
        config: Arc<TaskConfig>,
        gpg_path: Option<PathBuf>,
        channel: Option<Arc<dyn PrivilegeSeparationChannel>>,
    ) -> Self {
        Self {
            batch_mode: config.batch_mode,
            timeout: config.timeout,
            config,
            gpg_path,
            channel,
            arguments: Vec::new(),
            apply_defaults: true,
            read_attributes: false,
            inputs: Vec::new(),
            order: None,
            delegate: None,
            progress_handler: None,
            user_info: HashMap::new(),
            prompt_context: PromptContext::default(),
            cancel: CancellationToken::new(),
            state: TaskState::Configured,
        }
    }

    /// Current lifecycle state
    pub fn state(&self) -> TaskState {
        self.state
    }

    /// The task's own arguments (without defaults)
    pub fn arguments(&self) -> &[String] {
        &self.arguments
    }

    /// Append one argument
    ///
    /// # Errors
    ///
    /// [`Error::InvalidState`] once the task was started.
    pub fn add_argument(&mut self, argument: impl Into<String>) -> Result<()> {
        self.ensure_configured("add arguments to")?;
        self.arguments.push(argument.into());
        Ok(())
    }

    /// Append several arguments
    pub fn add_arguments<I, S>(&mut self, arguments: I) -> Result<()>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.ensure_configured("add arguments to")?;
        self.arguments.extend(arguments.into_iter().map(Into::into));
        Ok(())
    }

    /// Queue input for stdin; inputs are written in the order they were added
    pub fn add_input(&mut self, input: InputSource) -> Result<()> {
        self.ensure_configured("add input to")?;
        self.inputs.push(input);
        Ok(())
    }

    /// Queue bytes for stdin
    pub fn add_input_bytes(&mut self, bytes: impl Into<Vec<u8>>) -> Result<()> {
        self.add_input(InputSource::Bytes(bytes.into()))
    }

    /// Queue text for stdin
    pub fn add_input_text(&mut self, text: impl Into<String>) -> Result<()> {
        self.add_input(InputSource::from(text.into()))
    }

    /// Queue a file's contents for stdin
    pub fn add_input_file(&mut self, path: impl Into<PathBuf>) -> Result<()> {
        self.add_input(InputSource::File(path.into()))
    }

    /// Scripted prompt answers, consulted after the delegate
    ///
    /// # Errors
    ///
    /// Like every setter below, [`Error::InvalidState`] once the task was started.
    pub fn set_order(&mut self, order: TaskOrder) -> Result<()> {
        self.ensure_configured("set the order of")?;
        self.order = Some(order);
        Ok(())
    }

    /// Caller hooks
    pub fn set_delegate(&mut self, delegate: Arc<dyn TaskDelegate>) -> Result<()> {
        self.ensure_configured("set the delegate of")?;
        self.delegate = Some(delegate);
        Ok(())
    }

    /// Receive progress samples while the task runs
    pub fn set_progress_handler(&mut self, handler: impl Fn(Progress) + Send + Sync + 'static) -> Result<()> {
        self.ensure_configured("set the progress handler of")?;
        self.progress_handler = Some(Arc::new(handler));
        Ok(())
    }

    /// Collect attribute data (photo IDs) from the attribute channel
    pub fn set_read_attributes(&mut self, read_attributes: bool) -> Result<()> {
        self.ensure_configured("change attribute reading of")?;
        self.read_attributes = read_attributes;
        Ok(())
    }

    /// Pass `--batch`
    pub fn set_batch_mode(&mut self, batch_mode: bool) -> Result<()> {
        self.ensure_configured("change batch mode of")?;
        self.batch_mode = batch_mode;
        Ok(())
    }

    /// Give up after `timeout`; the process is killed and the result is
    /// [`TaskOutcome::TimedOut`]
    pub fn set_timeout(&mut self, timeout: Duration) -> Result<()> {
        self.ensure_configured("set the timeout of")?;
        self.timeout = Some(timeout);
        Ok(())
    }

    /// Carry hints over from an earlier attempt
    ///
    /// When a passphrase was rejected and the operation is retried with a
    /// fresh task, the new task's first prompt already knows which key and
    /// user it is about. Pass [`TaskResult::prompt_context`] (or the context
    /// of a [`Error::PromptUnanswered`]) from the previous run.
    pub fn set_prompt_context(&mut self, context: PromptContext) -> Result<()> {
        self.ensure_configured("seed the prompt context of")?;
        self.prompt_context = context;
        Ok(())
    }

    /// Attach caller data to the task
    pub fn set_user_info(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.user_info.insert(key.into(), value.into());
    }

    /// Caller data attached with [`set_user_info`](Self::set_user_info)
    pub fn user_info(&self) -> &HashMap<String, String> {
        &self.user_info
    }

    /// Leave out the configured default arguments and `--batch`
    ///
    /// Used when the arguments were already assembled elsewhere.
    pub(crate) fn set_apply_defaults(&mut self, apply_defaults: bool) {
        self.apply_defaults = apply_defaults;
    }

    /// A handle that cancels this task
    pub fn cancel_handle(&self) -> CancelHandle {
        CancelHandle {
            token: self.cancel.clone(),
        }
    }

    /// Cancel the task
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Arguments as they will be passed, minus the descriptor arguments
    pub fn command_line(&self) -> Vec<String> {
        let mut arguments = Vec::new();
        if self.apply_defaults {
            arguments.extend(self.config.default_arguments.iter().cloned());
            if self.batch_mode {
                arguments.push("--batch".to_string());
            }
        }
        arguments.extend(self.arguments.iter().cloned());
        arguments
    }

    /// Run the task to completion
    ///
    /// A non-zero exit code is not an error; inspect the returned
    /// [`TaskResult`]. Cancellation and timeouts also return `Ok`, with the
    /// corresponding [`TaskOutcome`].
    ///
    /// # Errors
    ///
    /// - [`Error::InvalidState`] if the task was already started
    /// - [`Error::ExecutableNotFound`] / [`Error::Spawn`] if gpg cannot be launched
    /// - [`Error::PromptUnanswered`] if gpg asked something nobody answered
    /// - [`Error::Pipe`] if a data channel failed
    /// - [`Error::HelperUnavailable`] if the helper connection was lost
    pub async fn start(&mut self) -> Result<TaskResult> {
        self.ensure_configured("start")?;
        self.state = TaskState::Starting;

        let outcome = self.execute().await;
        self.state = match &outcome {
            Ok(result) => result.outcome.into(),
            Err(_) => TaskState::Failed,
        };
        if let (Ok(result), Some(delegate)) = (&outcome, &self.delegate) {
            delegate.did_terminate(result);
        }
        outcome
    }

    async fn execute(&mut self) -> Result<TaskResult> {
        self.config.validate()?;
        let arguments = self.command_line();
        let inputs = std::mem::take(&mut self.inputs);
        let total = input::total_len(input::length_probes(&inputs)).await;
        let progress = Arc::new(ProgressTracker::new(total, self.progress_handler.clone()));
        let mut dispatcher = Dispatcher::new(self.order.take(), self.delegate.clone(), progress.clone());
        dispatcher.seed_context(std::mem::take(&mut self.prompt_context));

        if self.cancel.is_cancelled() {
            debug!("task cancelled before it started");
            return Ok(dispatcher.into_result(TaskOutcome::Cancelled));
        }

        if let Some(delegate) = &self.delegate {
            delegate.will_start(&arguments);
        }

        if let Some(channel) = self.channel.clone() {
            self.state = TaskState::Running;
            let launch = remote::RemoteLaunch {
                channel,
                arguments,
                inputs,
                read_attributes: self.read_attributes,
                timeout: self.timeout,
                cancel: self.cancel.clone(),
                progress,
            };
            return remote::run(launch, dispatcher).await;
        }

        self.run_local(arguments, inputs, progress, dispatcher).await
    }

    #[cfg(unix)]
    async fn run_local(
        &mut self,
        arguments: Vec<String>,
        inputs: Vec<InputSource>,
        progress: Arc<ProgressTracker>,
        dispatcher: Dispatcher,
    ) -> Result<TaskResult> {
        let program = match &self.gpg_path {
            Some(path) => path.clone(),
            None => locate::resolve(&self.config)?,
        };
        self.state = TaskState::Running;
        let run = local::LocalRun {
            config: self.config.clone(),
            program,
            arguments,
            inputs,
            read_attributes: self.read_attributes,
            timeout: self.timeout,
            cancel: self.cancel.clone(),
            progress,
        };
        local::run(run, dispatcher).await
    }

    #[cfg(not(unix))]
    async fn run_local(
        &mut self,
        _arguments: Vec<String>,
        _inputs: Vec<InputSource>,
        _progress: Arc<ProgressTracker>,
        _dispatcher: Dispatcher,
    ) -> Result<TaskResult> {
        Err(Error::NotSupported(
            "running gpg locally requires a unix platform".to_string(),
        ))
    }

    fn ensure_configured(&self, operation: &'static str) -> Result<()> {
        if self.state == TaskState::Configured {
            Ok(())
        } else {
            Err(Error::InvalidState {
                operation,
                state: self.state,
            })
        }
    }
}

impl fmt::Debug for GpgTask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GpgTask")
            .field("state", &self.state)
            .field("arguments", &self.arguments)
            .field("batch_mode", &self.batch_mode)
            .field("read_attributes", &self.read_attributes)
            .field("timeout", &self.timeout)
            .field("inputs", &self.inputs.len())
            .field("remote", &self.channel.as_ref().map(|c| c.name().to_string()))
            .finish_non_exhaustive()
    }
}
