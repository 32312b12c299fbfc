//! The privileged side of the helper protocol
//!
//! A [`HelperServer`] accepts connections on a Unix socket and runs one gpg
//! task per connection. The client keeps full control of the run: status
//! events are forwarded as they arrive, prompts are sent back to the client
//! and gpg waits until the client's answer comes in.
//!
//! Only processes running as the helper's own user may connect. The socket
//! is created with mode `0600` inside a `0700` directory, and every accepted
//! connection has its peer credentials checked.

use super::protocol::{
    ClientMessage, DATA_CHUNK_SIZE, HelperMessage, LaunchRequest, OutputChannel, RemoteExit, RemoteFailure,
};
use super::socket::{LineFramed, recv_line, send_line};
use crate::config::{HelperConfig, TaskConfig};
use crate::error::{Error, Result};
use crate::status::StatusEvent;
use crate::task::{Answer, CancelHandle, GpgTask, InputSource, PromptRequest, TaskDelegate, TaskResult};
use async_trait::async_trait;
use bytes::Bytes;
use std::io;
use std::os::unix::fs::{DirBuilderExt, FileTypeExt, PermissionsExt};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinHandle;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tokio_util::codec::{Framed, LinesCodec};
use tokio_util::io::StreamReader;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

const SOCKET_MODE: u32 = 0o600;
const DIRECTORY_MODE: u32 = 0o700;

/// Runs gpg on behalf of sandboxed clients
#[derive(Clone, Debug)]
pub struct HelperServer {
    config: Arc<TaskConfig>,
    gpg_path: Option<PathBuf>,
    max_frame_len: usize,
    allowed_uid: u32,
}

impl HelperServer {
    /// A server running tasks with `config`, accepting clients of the
    /// current user
    pub fn new(config: TaskConfig, helper: &HelperConfig) -> Self {
        Self {
            config: Arc::new(config),
            gpg_path: None,
            max_frame_len: helper.max_frame_len,
            allowed_uid: effective_uid(),
        }
    }

    /// Use this executable instead of searching for one
    pub fn with_gpg_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.gpg_path = Some(path.into());
        self
    }

    /// Accept clients running as `uid` instead of the current user
    pub fn with_allowed_uid(mut self, uid: u32) -> Self {
        self.allowed_uid = uid;
        self
    }

    /// Bind a listener at `path`
    ///
    /// A missing parent directory is created with mode `0700`. A stale
    /// socket left at `path` is replaced; any other file is left alone.
    ///
    /// # Errors
    ///
    /// [`Error::Config`] if `path` exists and is not a socket,
    /// [`Error::Io`] if the socket cannot be bound or restricted.
    pub fn bind(path: &Path) -> Result<UnixListener> {
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
            && !parent.exists()
        {
            std::fs::DirBuilder::new()
                .recursive(true)
                .mode(DIRECTORY_MODE)
                .create(parent)?;
        }
        match std::fs::symlink_metadata(path) {
            Ok(metadata) if metadata.file_type().is_socket() => {
                std::fs::remove_file(path)?;
                debug!(path = %path.display(), "removed stale socket");
            }
            Ok(_) => {
                return Err(Error::Config {
                    message: format!("{} exists and is not a socket", path.display()),
                    key: Some("helper.socket_path".to_string()),
                });
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        let listener = UnixListener::bind(path)?;
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(SOCKET_MODE))?;
        Ok(listener)
    }

    /// Accept connections until `shutdown` is cancelled
    ///
    /// Runs in progress when shutdown is requested are cancelled.
    pub async fn serve(self, listener: UnixListener, shutdown: CancellationToken) -> Result<()> {
        let server = Arc::new(self);
        info!(allowed_uid = server.allowed_uid, "helper accepting connections");

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("helper shutting down");
                    return Ok(());
                }
                accepted = listener.accept() => {
                    let (stream, _) = match accepted {
                        Ok(conn) => conn,
                        Err(e) => {
                            warn!(error = %e, "failed to accept connection");
                            continue;
                        }
                    };
                    if !server.peer_allowed(&stream) {
                        continue;
                    }
                    let server = server.clone();
                    let shutdown = shutdown.child_token();
                    tokio::spawn(async move {
                        if let Err(e) = server.handle_connection(stream, shutdown).await {
                            warn!(error = %e, "helper connection ended with an error");
                        }
                    });
                }
            }
        }
    }

    fn peer_allowed(&self, stream: &UnixStream) -> bool {
        match stream.peer_cred() {
            Ok(cred) if cred.uid() == self.allowed_uid => true,
            Ok(cred) => {
                warn!(uid = cred.uid(), pid = ?cred.pid(), "rejecting connection from another user");
                false
            }
            Err(e) => {
                warn!(error = %e, "cannot read peer credentials, rejecting connection");
                false
            }
        }
    }

    async fn handle_connection(&self, stream: UnixStream, shutdown: CancellationToken) -> Result<()> {
        let mut framed = Framed::new(stream, LinesCodec::new_with_max_length(self.max_frame_len));

        let request = loop {
            match recv_line::<_, ClientMessage>(&mut framed).await? {
                Some(ClientMessage::Ping) => send_line(&mut framed, &HelperMessage::Pong).await?,
                Some(ClientMessage::Launch(request)) => break request,
                Some(other) => debug!(message = ?other, "ignoring message before launch"),
                None => return Ok(()),
            }
        };

        info!(arguments = ?request.arguments, "launching gpg for client");
        let (outgoing_tx, outgoing) = mpsc::unbounded_channel();
        let (answers_tx, answers) = mpsc::unbounded_channel();
        // Unbounded so the relay never stops reading answers while gpg is
        // not consuming stdin
        let (input_tx, input) = mpsc::unbounded_channel();
        let task = match self.build_task(request, outgoing_tx, answers, input) {
            Ok(task) => task,
            Err(e) => {
                warn!(error = %e, "rejecting launch request");
                return send_line(&mut framed, &HelperMessage::Failed(RemoteFailure::from(&e))).await;
            }
        };
        let cancel = task.cancel_handle();
        let run = tokio::spawn(async move {
            let mut task = task;
            task.start().await
        });

        let relay = Relay {
            framed,
            outgoing,
            answers: answers_tx,
            input: Some(input_tx),
        };
        relay.run(run, cancel, shutdown).await
    }

    fn build_task(
        &self,
        request: LaunchRequest,
        outgoing: mpsc::UnboundedSender<HelperMessage>,
        answers: mpsc::UnboundedReceiver<Vec<u8>>,
        input: mpsc::UnboundedReceiver<io::Result<Bytes>>,
    ) -> Result<GpgTask> {
        let LaunchRequest {
            arguments,
            input_len,
            read_attributes,
            timeout,
        } = request;

        let mut task = GpgTask::from_parts(self.config.clone(), self.gpg_path.clone(), None);
        // The client already applied its defaults
        task.set_apply_defaults(false);
        task.add_arguments(arguments)?;
        let stdin = StreamReader::new(UnboundedReceiverStream::new(input));
        task.add_input(InputSource::reader(stdin, input_len))?;
        task.set_read_attributes(read_attributes)?;
        if let Some(timeout) = timeout {
            task.set_timeout(timeout)?;
        }

        let progress_tx = outgoing.clone();
        task.set_progress_handler(move |progress| {
            let _ = progress_tx.send(HelperMessage::Progress {
                processed: progress.processed,
                total: progress.total,
            });
        })?;
        task.set_delegate(Arc::new(ForwardingDelegate {
            outgoing,
            answers: Mutex::new(answers),
        }))?;
        Ok(task)
    }
}

fn effective_uid() -> u32 {
    // SAFETY: geteuid has no preconditions and cannot fail
    unsafe { libc::geteuid() }
}

/// Moves messages between the client connection and a running task
struct Relay {
    framed: LineFramed,
    outgoing: mpsc::UnboundedReceiver<HelperMessage>,
    answers: mpsc::UnboundedSender<Vec<u8>>,
    input: Option<mpsc::UnboundedSender<io::Result<Bytes>>>,
}

impl Relay {
    async fn run(
        mut self,
        mut run: JoinHandle<Result<TaskResult>>,
        cancel: CancelHandle,
        shutdown: CancellationToken,
    ) -> Result<()> {
        let mut connected = true;

        let joined = loop {
            tokio::select! {
                biased;
                Some(message) = self.outgoing.recv() => {
                    if connected && let Err(e) = send_line(&mut self.framed, &message).await {
                        warn!(error = %e, "client went away, cancelling gpg");
                        connected = false;
                        self.disconnect(&cancel);
                    }
                }
                _ = shutdown.cancelled(), if !cancel.is_cancelled() => cancel.cancel(),
                incoming = recv_line::<_, ClientMessage>(&mut self.framed), if connected => match incoming {
                    Ok(Some(ClientMessage::Input { data })) => self.feed(data),
                    Ok(Some(ClientMessage::InputEnd)) => {
                        debug!("client finished sending input");
                        self.input = None;
                    }
                    Ok(Some(ClientMessage::Respond { answer })) => {
                        if self.answers.send(answer).is_err() {
                            debug!("answer arrived after the task stopped asking");
                        }
                    }
                    Ok(Some(ClientMessage::Cancel)) => {
                        info!("client cancelled the run");
                        cancel.cancel();
                    }
                    Ok(Some(ClientMessage::Ping)) => {
                        send_line(&mut self.framed, &HelperMessage::Pong).await?;
                    }
                    Ok(Some(ClientMessage::Launch(_))) => {
                        warn!("ignoring second launch on one connection");
                    }
                    Ok(None) => {
                        info!("client disconnected, cancelling gpg");
                        connected = false;
                        self.disconnect(&cancel);
                    }
                    Err(e) => {
                        warn!(error = %e, "unusable message from client, cancelling gpg");
                        connected = false;
                        self.disconnect(&cancel);
                    }
                },
                joined = &mut run => break joined,
            }
        };

        if !connected {
            return Ok(());
        }
        while let Ok(message) = self.outgoing.try_recv() {
            send_line(&mut self.framed, &message).await?;
        }
        match joined {
            Ok(Ok(result)) => self.finish(result).await,
            Ok(Err(e)) => {
                send_line(&mut self.framed, &HelperMessage::Failed(RemoteFailure::from(&e))).await
            }
            Err(e) => {
                error!(error = %e, "gpg task panicked");
                let failed = RemoteFailure::Other {
                    message: "gpg task aborted".to_string(),
                };
                send_line(&mut self.framed, &HelperMessage::Failed(failed)).await
            }
        }
    }

    fn feed(&mut self, data: Vec<u8>) {
        match &self.input {
            Some(input) => {
                if input.send(Ok(Bytes::from(data))).is_err() {
                    debug!("gpg stopped reading stdin");
                }
            }
            None => warn!("ignoring input after its end"),
        }
    }

    fn disconnect(&mut self, cancel: &CancelHandle) {
        if let Some(input) = self.input.take() {
            let _ = input.send(Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "client disconnected before the end of input",
            )));
        }
        cancel.cancel();
    }

    /// Send the collected buffers, then the exit
    async fn finish(&mut self, result: TaskResult) -> Result<()> {
        let exit = RemoteExit {
            outcome: result.outcome,
            exit_code: result.exit_code,
        };
        let buffers = [
            (OutputChannel::Stdout, result.out),
            (OutputChannel::Stderr, result.err),
            (OutputChannel::Status, result.status),
            (OutputChannel::Attributes, result.attributes),
        ];
        for (channel, bytes) in buffers {
            for chunk in bytes.chunks(DATA_CHUNK_SIZE) {
                let message = HelperMessage::Output {
                    channel,
                    data: chunk.to_vec(),
                };
                send_line(&mut self.framed, &message).await?;
            }
        }
        send_line(&mut self.framed, &HelperMessage::Finished(exit)).await
    }
}

/// Sends status to the client and waits for its prompt answers
struct ForwardingDelegate {
    outgoing: mpsc::UnboundedSender<HelperMessage>,
    answers: Mutex<mpsc::UnboundedReceiver<Vec<u8>>>,
}

#[async_trait]
impl TaskDelegate for ForwardingDelegate {
    fn status(&self, event: &StatusEvent) {
        // Prompts go out from answer_prompt, flagged as needing a reply
        if event.keyword.is_prompt() {
            return;
        }
        let _ = self.outgoing.send(HelperMessage::Status {
            event: event.clone(),
            needs_reply: false,
        });
    }

    async fn answer_prompt(&self, request: &PromptRequest) -> Option<Answer> {
        let event = StatusEvent::new(request.keyword.as_str(), request.prompt.clone());
        self.outgoing
            .send(HelperMessage::Status {
                event,
                needs_reply: true,
            })
            .ok()?;
        let answer = self.answers.lock().await.recv().await?;
        Some(Answer::Bytes(answer))
    }
}

/// Serve until SIGTERM or SIGINT (Ctrl+C elsewhere), then stop accepting
/// and cancel running tasks
///
/// # Errors
///
/// Whatever [`HelperServer::serve`] returns.
pub async fn run_with_shutdown(server: HelperServer, listener: UnixListener) -> Result<()> {
    let shutdown = CancellationToken::new();
    let trigger = shutdown.clone();
    tokio::spawn(async move {
        wait_for_signal().await;
        trigger.cancel();
    });
    server.serve(listener, shutdown).await
}

async fn wait_for_signal() {
    use tokio::signal::unix::{SignalKind, signal};

    // Signal registration may fail in restricted environments
    match (signal(SignalKind::terminate()), signal(SignalKind::interrupt())) {
        (Ok(mut sigterm), Ok(mut sigint)) => {
            tokio::select! {
                _ = sigterm.recv() => info!("Received SIGTERM signal"),
                _ = sigint.recv() => info!("Received SIGINT signal (Ctrl+C)"),
            }
        }
        (Ok(mut only), Err(_)) | (Err(_), Ok(mut only)) => {
            only.recv().await;
            info!("Received termination signal");
        }
        (Err(e), Err(_)) => {
            error!(error = %e, "Could not register any signal handlers, using ctrl_c fallback");
            tokio::signal::ctrl_c().await.ok();
        }
    }
}
