//! Running gpg as a child of this process

use super::dispatch::Dispatcher;
use super::input::{InputSource, write_inputs};
use super::progress::ProgressTracker;
use super::result::{TaskOutcome, TaskResult};
use crate::config::TaskConfig;
use crate::error::{Error, Result};
use crate::process::{AuxChannel, ProcessHandle, SpawnSpec};
use crate::status::StatusParser;
use std::io;
use std::path::PathBuf;
use std::process::ExitStatus;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::net::unix::pipe;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

const STATUS: &str = "status";
const COMMAND: &str = "command";
const ATTRIBUTE: &str = "attribute";

const STATUS_READ_SIZE: usize = 8 * 1024;
const PUMP_READ_SIZE: usize = 64 * 1024;

/// Everything a local run needs, detached from the task that configured it
pub(super) struct LocalRun {
    pub(super) config: Arc<TaskConfig>,
    pub(super) program: PathBuf,
    pub(super) arguments: Vec<String>,
    pub(super) inputs: Vec<InputSource>,
    pub(super) read_attributes: bool,
    pub(super) timeout: Option<Duration>,
    pub(super) cancel: CancellationToken,
    pub(super) progress: Arc<ProgressTracker>,
}

/// `--status-fd 3 --command-fd 5 [--attribute-fd 4]`
fn descriptor_arguments(config: &TaskConfig, read_attributes: bool) -> Vec<String> {
    let mut args = vec![
        "--status-fd".to_string(),
        config.status_fd.to_string(),
        "--command-fd".to_string(),
        config.command_fd.to_string(),
    ];
    if read_attributes {
        args.push("--attribute-fd".to_string());
        args.push(config.attribute_fd.to_string());
    }
    args
}

enum Ending {
    Exited,
    Cancelled,
    TimedOut,
    Failed(Error),
}

pub(super) async fn run(run: LocalRun, mut dispatcher: Dispatcher) -> Result<TaskResult> {
    let LocalRun {
        config,
        program,
        arguments,
        inputs,
        read_attributes,
        timeout,
        cancel,
        progress,
    } = run;

    let mut spec = SpawnSpec::new(&program);
    if config.inject_descriptor_arguments {
        spec.args = descriptor_arguments(&config, read_attributes);
    }
    spec.args.extend(arguments);
    spec.env = config
        .environment
        .iter()
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect();
    spec.env_clear = config.clear_environment;
    spec.working_dir = config.working_dir.clone();
    spec.aux = vec![
        AuxChannel::output(STATUS, config.status_fd),
        AuxChannel::input(COMMAND, config.command_fd),
    ];
    if read_attributes {
        spec.aux.push(AuxChannel::output(ATTRIBUTE, config.attribute_fd));
    }

    let deadline_at = timeout.map(|t| tokio::time::Instant::now() + t);
    let deadline = async move {
        match deadline_at {
            Some(at) => tokio::time::sleep_until(at).await,
            None => std::future::pending().await,
        }
    };

    let mut process = ProcessHandle::spawn(spec)?;
    let pid = process.pid();
    info!(?pid, program = %program.display(), "gpg started");

    let missing = |channel: &str| Error::Spawn {
        program: program.clone(),
        reason: format!("{channel} pipe was not set up"),
    };
    let stdin = process.take_stdin().ok_or_else(|| missing("stdin"))?;
    let stdout = process.take_stdout().ok_or_else(|| missing("stdout"))?;
    let stderr = process.take_stderr().ok_or_else(|| missing("stderr"))?;
    let status = process.take_aux_reader(STATUS).ok_or_else(|| missing(STATUS))?;
    let command = process.take_aux_writer(COMMAND).ok_or_else(|| missing(COMMAND))?;
    let attribute = process.take_aux_reader(ATTRIBUTE);

    // Each channel gets its own pump so that a full pipe on one side can
    // never stall another
    let writer = tokio::spawn(write_inputs(stdin, inputs, progress));
    let out_buf = Drained::default();
    let err_buf = Drained::default();
    let attr_buf = Drained::default();
    let out_pump = tokio::spawn(drain(stdout, out_buf.clone()));
    let err_pump = tokio::spawn(drain(stderr, err_buf.clone()));
    let attr_pump = attribute.map(|reader| tokio::spawn(drain(reader, attr_buf.clone())));

    let mut raw_status = Vec::new();
    let ending = {
        let drive = drive_status(
            &mut process,
            status,
            command,
            &mut dispatcher,
            &mut raw_status,
            config.pump_grace,
        );
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Ending::Cancelled,
            _ = deadline => Ending::TimedOut,
            driven = drive => match driven {
                Ok(_) => Ending::Exited,
                Err(e) => Ending::Failed(e),
            },
        }
    };

    let outcome = match ending {
        Ending::Exited => TaskOutcome::Finished,
        Ending::Cancelled => {
            info!(?pid, "gpg task cancelled");
            TaskOutcome::Cancelled
        }
        Ending::TimedOut => {
            warn!(?pid, ?timeout, "gpg task timed out");
            TaskOutcome::TimedOut
        }
        Ending::Failed(e) => {
            warn!(?pid, error = %e, "gpg task failed; killing process");
            if let Err(kill_err) = process.terminate().await {
                warn!(?pid, error = %kill_err, "failed to kill gpg");
            }
            writer.abort();
            out_pump.abort();
            err_pump.abort();
            if let Some(pump) = attr_pump {
                pump.abort();
            }
            return Err(e);
        }
    };
    if outcome != TaskOutcome::Finished
        && let Err(e) = process.terminate().await
    {
        warn!(?pid, error = %e, "failed to kill gpg");
    }
    let exit_code = process.exit_code();

    let grace = config.pump_grace;
    let written = join_pump("stdin", writer, grace).await;
    let out_done = join_pump("stdout", out_pump, grace).await;
    let err_done = join_pump("stderr", err_pump, grace).await;
    let attr_done = match attr_pump {
        Some(pump) => join_pump(ATTRIBUTE, pump, grace).await,
        None => Ok(Some(())),
    };
    let truncated = [&out_done, &err_done, &attr_done]
        .iter()
        .any(|done| matches!(done, Ok(None)));

    let finished = outcome == TaskOutcome::Finished;
    let failure_context = |err: &[u8]| dispatcher.failure_context(exit_code, &raw_status, err);
    let err = err_buf.take().await;
    if let Err(e) = err_done
        && finished
    {
        return Err(Error::pipe("stderr", e, failure_context(&err)));
    }
    match written {
        Ok(_) => {}
        Err(e) if !finished => debug!(error = %e, "stdin writer stopped by termination"),
        Err(e) if e.kind() == io::ErrorKind::BrokenPipe && exit_code != Some(0) => {
            warn!(?exit_code, "gpg stopped reading its input before exiting");
        }
        Err(e) => return Err(Error::pipe("stdin", e, failure_context(&err))),
    }
    if let Err(e) = out_done
        && finished
    {
        return Err(Error::pipe("stdout", e, failure_context(&err)));
    }
    if let Err(e) = attr_done
        && finished
    {
        return Err(Error::pipe(ATTRIBUTE, e, failure_context(&err)));
    }

    info!(?pid, ?exit_code, ?outcome, "gpg task ended");

    let mut result = dispatcher.into_result(outcome);
    result.exit_code = exit_code;
    result.out = out_buf.take().await;
    result.err = err;
    result.status = raw_status;
    result.attributes = attr_buf.take().await;
    result.truncated = truncated;
    Ok(result)
}

/// Read status lines and answer prompts until gpg has exited and the status
/// channel is closed
async fn drive_status(
    process: &mut ProcessHandle,
    mut status: pipe::Receiver,
    mut command: pipe::Sender,
    dispatcher: &mut Dispatcher,
    raw: &mut Vec<u8>,
    grace: Duration,
) -> Result<ExitStatus> {
    let mut parser = StatusParser::new();
    let mut buf = vec![0u8; STATUS_READ_SIZE];
    let mut open = true;
    let mut exit: Option<ExitStatus> = None;

    loop {
        if let Some(exit) = exit
            && !open
        {
            return Ok(exit);
        }

        tokio::select! {
            read = status.read(&mut buf), if open => {
                let n = match read {
                    Ok(n) => n,
                    Err(e) => {
                        let context = dispatcher.failure_context(process.exit_code(), raw, &[]);
                        return Err(Error::pipe(STATUS, e, context));
                    }
                };
                let events = if n == 0 {
                    open = false;
                    parser.finish()
                } else {
                    raw.extend_from_slice(&buf[..n]);
                    parser.feed(&buf[..n])
                };
                for event in events {
                    if let Some(answer) = dispatcher.handle(event).await? {
                        send_answer(&mut command, &answer, dispatcher, process, raw).await?;
                    }
                }
            }
            waited = process.wait(), if exit.is_none() => {
                exit = Some(waited?);
            }
            _ = tokio::time::sleep(grace), if exit.is_some() && open => {
                warn!("status channel still open after gpg exited; a descendant may hold it");
                open = false;
                for event in parser.finish() {
                    dispatcher.handle(event).await?;
                }
            }
        }
    }
}

async fn send_answer(
    command: &mut pipe::Sender,
    answer: &[u8],
    dispatcher: &Dispatcher,
    process: &ProcessHandle,
    raw: &[u8],
) -> Result<()> {
    let written = async {
        command.write_all(answer).await?;
        command.flush().await
    }
    .await;
    match written {
        Ok(()) => Ok(()),
        // gpg died after asking; the exit is picked up by the drive loop
        Err(e) if e.kind() == io::ErrorKind::BrokenPipe => {
            warn!("gpg closed the command channel before the answer was sent");
            Ok(())
        }
        Err(e) => Err(Error::pipe(
            COMMAND,
            e,
            dispatcher.failure_context(process.exit_code(), raw, &[]),
        )),
    }
}

/// Bytes a pump has read so far, still there if the pump is abandoned
#[derive(Clone, Default)]
struct Drained(Arc<Mutex<Vec<u8>>>);

impl Drained {
    async fn take(&self) -> Vec<u8> {
        std::mem::take(&mut *self.0.lock().await)
    }
}

async fn drain<R: AsyncRead + Unpin>(mut reader: R, sink: Drained) -> io::Result<()> {
    let mut buf = vec![0u8; PUMP_READ_SIZE];
    loop {
        let n = reader.read(&mut buf).await?;
        if n == 0 {
            return Ok(());
        }
        sink.0.lock().await.extend_from_slice(&buf[..n]);
    }
}

/// Join a pump, giving up after `grace`
///
/// `Ok(None)` means the pump was abandoned because something still held its
/// pipe open. Aborting only happens at an await point, so nothing a pump
/// already stored is lost.
async fn join_pump<T>(channel: &str, pump: JoinHandle<io::Result<T>>, grace: Duration) -> io::Result<Option<T>> {
    let abort = pump.abort_handle();
    match tokio::time::timeout(grace, pump).await {
        Ok(Ok(result)) => result.map(Some),
        Ok(Err(join_err)) => Err(io::Error::other(join_err)),
        Err(_) => {
            abort.abort();
            warn!(channel, "pump still running after gpg ended; abandoning it");
            Ok(None)
        }
    }
}
