//! The seam between a task and a process that is allowed to spawn gpg

use super::protocol::{HelperMessage, LaunchRequest};
use crate::error::Result;
use crate::task::InputSource;
use async_trait::async_trait;

/// A way to run gpg in another, more privileged process
///
/// A sandboxed caller cannot spawn gpg itself. Instead a task hands the
/// prepared arguments and input to a channel, receives the status stream
/// back, answers prompts through it and finally gets the collected output.
/// Prompt answering, task orders and result assembly stay on the caller's
/// side, so a task behaves the same whether it runs locally or remotely.
///
/// # Examples
///
/// ```no_run
/// use gpg_task::helper::SocketChannel;
/// use gpg_task::{GpgContext, TaskConfig};
/// use std::sync::Arc;
///
/// # #[tokio::main]
/// # async fn main() -> Result<(), Box<dyn std::error::Error>> {
/// let channel = SocketChannel::new("/run/user/1000/gpg-task-helper.sock");
/// channel.ping().await?;
///
/// let context = GpgContext::sandboxed(TaskConfig::default(), Arc::new(channel))?;
/// let mut task = context.task_with_arguments(["--list-keys"], false);
/// let result = task.start().await?;
/// println!("{}", result.out_text());
/// # Ok(())
/// # }
/// ```
#[async_trait]
pub trait PrivilegeSeparationChannel: Send + Sync {
    /// Start a run on the other side
    ///
    /// `input` is streamed to gpg's stdin in order while the run proceeds.
    ///
    /// # Errors
    ///
    /// [`Error::HelperUnavailable`](crate::Error::HelperUnavailable) if the
    /// helper cannot be reached.
    async fn launch(&self, request: LaunchRequest, input: Vec<InputSource>) -> Result<Box<dyn RemoteRun>>;

    /// Name of this channel for logging
    fn name(&self) -> &str;
}

/// One run in progress on a helper
#[async_trait]
pub trait RemoteRun: Send {
    /// Next message from the helper; `None` once the connection closed
    ///
    /// Also reports failures of the input stream, such as an unreadable file.
    async fn next_message(&mut self) -> Result<Option<HelperMessage>>;

    /// Answer the status message that needed a reply
    async fn respond(&mut self, answer: Vec<u8>) -> Result<()>;

    /// Ask the helper to kill gpg
    async fn cancel(&mut self) -> Result<()>;
}
