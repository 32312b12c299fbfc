//! Unix socket transport for the helper protocol
//!
//! Newline-delimited JSON over a [`UnixStream`], framed with
//! [`LinesCodec`]. Every run uses its own connection. While a run is in
//! progress the connection is split: a writer task streams stdin and sends
//! answers, while the task reads helper messages from the other half.

use super::protocol::{ClientMessage, DATA_CHUNK_SIZE, HelperMessage, LaunchRequest};
use super::traits::{PrivilegeSeparationChannel, RemoteRun};
use crate::config::HelperConfig;
use crate::error::{Error, FailureContext, Result};
use crate::task::InputSource;
use async_trait::async_trait;
use futures::stream::{SplitSink, SplitStream};
use futures::{Sink, SinkExt, Stream, StreamExt};
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::io::AsyncReadExt;
use tokio::net::UnixStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::codec::{Framed, LinesCodec, LinesCodecError};
use tracing::{debug, warn};

pub(crate) type LineFramed = Framed<UnixStream, LinesCodec>;

/// Input chunks read ahead of the socket
const INPUT_QUEUE: usize = 4;

/// How long a cancel may take to reach the helper
const CANCEL_FLUSH: Duration = Duration::from_secs(2);

/// Channel to a helper listening on a Unix socket
#[derive(Clone, Debug)]
pub struct SocketChannel {
    path: PathBuf,
    connect_timeout: Duration,
    max_frame_len: usize,
}

impl SocketChannel {
    /// Channel to the helper at `path`, with default limits
    pub fn new(path: impl Into<PathBuf>) -> Self {
        let defaults = HelperConfig::default();
        Self {
            path: path.into(),
            connect_timeout: defaults.connect_timeout,
            max_frame_len: defaults.max_frame_len,
        }
    }

    /// Channel built from a helper configuration
    pub fn from_config(config: &HelperConfig) -> Self {
        Self {
            path: config.socket_path.clone(),
            connect_timeout: config.connect_timeout,
            max_frame_len: config.max_frame_len,
        }
    }

    /// Socket path
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Check that a helper answers on the socket
    ///
    /// # Errors
    ///
    /// [`Error::HelperUnavailable`] if the socket cannot be reached or the
    /// helper replies with anything but a pong.
    pub async fn ping(&self) -> Result<()> {
        let mut framed = self.connect().await?;
        send_line(&mut framed, &ClientMessage::Ping).await?;
        match recv_line::<_, HelperMessage>(&mut framed).await? {
            Some(HelperMessage::Pong) => Ok(()),
            Some(other) => Err(Error::HelperUnavailable(format!(
                "unexpected reply to ping: {other:?}"
            ))),
            None => Err(Error::HelperUnavailable(
                "connection closed before pong".to_string(),
            )),
        }
    }

    async fn connect(&self) -> Result<LineFramed> {
        let stream = tokio::time::timeout(self.connect_timeout, UnixStream::connect(&self.path))
            .await
            .map_err(|_| {
                Error::HelperUnavailable(format!(
                    "timed out connecting to {}",
                    self.path.display()
                ))
            })?
            .map_err(|e| {
                Error::HelperUnavailable(format!("cannot connect to {}: {e}", self.path.display()))
            })?;
        debug!(path = %self.path.display(), "connected to helper");
        Ok(Framed::new(
            stream,
            LinesCodec::new_with_max_length(self.max_frame_len),
        ))
    }
}

#[async_trait]
impl PrivilegeSeparationChannel for SocketChannel {
    async fn launch(&self, request: LaunchRequest, input: Vec<InputSource>) -> Result<Box<dyn RemoteRun>> {
        let mut framed = self.connect().await?;
        send_line(&mut framed, &ClientMessage::Launch(request)).await?;

        let (sink, incoming) = framed.split();
        let (control, control_rx) = mpsc::unbounded_channel();
        let (chunks, chunks_rx) = mpsc::channel(INPUT_QUEUE);
        let reader = tokio::spawn(read_inputs(input, chunks));
        let writer = tokio::spawn(write_messages(sink, control_rx, chunks_rx));
        Ok(Box::new(SocketRun {
            incoming,
            control: Some(control),
            writer,
            writer_done: false,
            reader,
        }))
    }

    fn name(&self) -> &str {
        "unix-socket"
    }
}

/// A run on the other end of a socket connection
struct SocketRun {
    incoming: SplitStream<LineFramed>,
    control: Option<mpsc::UnboundedSender<ClientMessage>>,
    writer: JoinHandle<Result<()>>,
    writer_done: bool,
    reader: JoinHandle<()>,
}

impl SocketRun {
    fn send(&self, message: ClientMessage) -> Result<()> {
        self.control
            .as_ref()
            .and_then(|control| control.send(message).ok())
            .ok_or_else(|| Error::HelperUnavailable("connection writer stopped".to_string()))
    }
}

#[async_trait]
impl RemoteRun for SocketRun {
    async fn next_message(&mut self) -> Result<Option<HelperMessage>> {
        loop {
            tokio::select! {
                biased;
                written = &mut self.writer, if !self.writer_done => {
                    self.writer_done = true;
                    match written {
                        Ok(Ok(())) => continue,
                        Ok(Err(e)) => return Err(e),
                        Err(e) => {
                            return Err(Error::HelperUnavailable(format!("connection writer stopped: {e}")));
                        }
                    }
                }
                received = recv_line(&mut self.incoming) => return received,
            }
        }
    }

    async fn respond(&mut self, answer: Vec<u8>) -> Result<()> {
        self.send(ClientMessage::Respond { answer })
    }

    async fn cancel(&mut self) -> Result<()> {
        self.send(ClientMessage::Cancel)?;
        // Closing the queue lets the writer flush the cancel and stop
        self.control = None;
        if !self.writer_done {
            self.writer_done = true;
            match tokio::time::timeout(CANCEL_FLUSH, &mut self.writer).await {
                Ok(Ok(written)) => written?,
                Ok(Err(e)) => return Err(Error::HelperUnavailable(format!("connection writer stopped: {e}"))),
                Err(_) => warn!("cancel could not be delivered to the helper in time"),
            }
        }
        Ok(())
    }
}

impl Drop for SocketRun {
    fn drop(&mut self) {
        self.reader.abort();
        self.writer.abort();
    }
}

/// Read every input in order, in chunks small enough for one message
async fn read_inputs(inputs: Vec<InputSource>, chunks: mpsc::Sender<io::Result<Vec<u8>>>) {
    for input in inputs {
        let mut reader = match input.open().await {
            Ok(reader) => reader,
            Err(e) => {
                let _ = chunks.send(Err(e)).await;
                return;
            }
        };
        loop {
            let mut buf = vec![0u8; DATA_CHUNK_SIZE];
            match reader.read(&mut buf).await {
                Ok(0) => break,
                Ok(n) => {
                    buf.truncate(n);
                    if chunks.send(Ok(buf)).await.is_err() {
                        return;
                    }
                }
                Err(e) => {
                    let _ = chunks.send(Err(e)).await;
                    return;
                }
            }
        }
    }
}

/// Send queued control messages and stdin chunks until the queue closes
///
/// Control messages go first, so an answer is never stuck behind input
/// that gpg is not reading yet.
async fn write_messages(
    mut sink: SplitSink<LineFramed, String>,
    mut control: mpsc::UnboundedReceiver<ClientMessage>,
    mut chunks: mpsc::Receiver<io::Result<Vec<u8>>>,
) -> Result<()> {
    let mut input_open = true;
    loop {
        let message = tokio::select! {
            biased;
            message = control.recv() => match message {
                Some(message) => message,
                None => return Ok(()),
            },
            chunk = chunks.recv(), if input_open => match chunk {
                Some(Ok(data)) => ClientMessage::Input { data },
                Some(Err(e)) => {
                    if let Err(cancel_err) = send_line(&mut sink, &ClientMessage::Cancel).await {
                        debug!(error = %cancel_err, "helper gone before cancel was sent");
                    }
                    return Err(Error::pipe("stdin", e, FailureContext::default()));
                }
                None => {
                    input_open = false;
                    ClientMessage::InputEnd
                }
            },
        };
        send_line(&mut sink, &message).await?;
    }
}

fn transport_error(e: LinesCodecError) -> Error {
    match e {
        LinesCodecError::MaxLineLengthExceeded => {
            Error::Protocol("helper message exceeds the frame limit".to_string())
        }
        LinesCodecError::Io(e) => Error::HelperUnavailable(e.to_string()),
    }
}

/// Serialize `message` as one line and flush it
pub(crate) async fn send_line<S, T>(sink: &mut S, message: &T) -> Result<()>
where
    S: Sink<String, Error = LinesCodecError> + Unpin,
    T: Serialize,
{
    let line = serde_json::to_string(message)?;
    sink.send(line).await.map_err(transport_error)
}

/// Next line, decoded; `None` once the peer closed the connection
pub(crate) async fn recv_line<S, T>(stream: &mut S) -> Result<Option<T>>
where
    S: Stream<Item = std::result::Result<String, LinesCodecError>> + Unpin,
    T: DeserializeOwned,
{
    match stream.next().await {
        Some(Ok(line)) => serde_json::from_str(&line)
            .map(Some)
            .map_err(|e| Error::Protocol(format!("undecodable message: {e}"))),
        Some(Err(e)) => Err(transport_error(e)),
        None => Ok(None),
    }
}
