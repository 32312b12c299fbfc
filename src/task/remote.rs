//! Running gpg through a privilege separation channel

use super::dispatch::Dispatcher;
use super::input::{self, InputSource};
use super::progress::ProgressTracker;
use super::result::{TaskOutcome, TaskResult};
use crate::error::{Error, Result};
use crate::helper::{HelperMessage, LaunchRequest, OutputChannel, PrivilegeSeparationChannel, RemoteExit, RemoteRun};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub(super) struct RemoteLaunch {
    pub(super) channel: Arc<dyn PrivilegeSeparationChannel>,
    pub(super) arguments: Vec<String>,
    pub(super) inputs: Vec<InputSource>,
    pub(super) read_attributes: bool,
    pub(super) timeout: Option<Duration>,
    pub(super) cancel: CancellationToken,
    pub(super) progress: Arc<ProgressTracker>,
}

/// Output chunks received so far
#[derive(Default)]
struct Collected {
    out: Vec<u8>,
    err: Vec<u8>,
    status: Vec<u8>,
    attributes: Vec<u8>,
}

impl Collected {
    fn append(&mut self, channel: OutputChannel, data: Vec<u8>) {
        let buffer = match channel {
            OutputChannel::Stdout => &mut self.out,
            OutputChannel::Stderr => &mut self.err,
            OutputChannel::Status => &mut self.status,
            OutputChannel::Attributes => &mut self.attributes,
        };
        buffer.extend_from_slice(&data);
    }

    fn fill(self, result: &mut TaskResult) {
        result.out = self.out;
        result.err = self.err;
        result.status = self.status;
        result.attributes = self.attributes;
    }
}

enum Ending {
    Done(RemoteExit),
    Cancelled,
    TimedOut,
    Failed(Error),
}

pub(super) async fn run(launch: RemoteLaunch, mut dispatcher: Dispatcher) -> Result<TaskResult> {
    let RemoteLaunch {
        channel,
        arguments,
        inputs,
        read_attributes,
        timeout,
        cancel,
        progress,
    } = launch;

    let deadline_at = timeout.map(|t| tokio::time::Instant::now() + t);
    let request = LaunchRequest {
        arguments,
        input_len: input::total_len(input::length_probes(&inputs)).await,
        read_attributes,
        // The deadline is enforced here, where cancellation is observed too
        timeout: None,
    };

    info!(channel = channel.name(), "launching gpg through helper");
    let mut remote = channel.launch(request, inputs).await?;

    let deadline = async move {
        match deadline_at {
            Some(at) => tokio::time::sleep_until(at).await,
            None => std::future::pending().await,
        }
    };
    let mut collected = Collected::default();
    let ending = {
        let drive = drive(remote.as_mut(), &mut dispatcher, &progress, &mut collected);
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Ending::Cancelled,
            _ = deadline => Ending::TimedOut,
            driven = drive => match driven {
                Ok(exit) => Ending::Done(exit),
                Err(e) => Ending::Failed(e),
            },
        }
    };

    let outcome = match ending {
        Ending::Done(exit) => {
            info!(channel = channel.name(), exit_code = ?exit.exit_code, "remote gpg task ended");
            let mut result = dispatcher.into_result(exit.outcome);
            result.exit_code = exit.exit_code;
            collected.fill(&mut result);
            return Ok(result);
        }
        Ending::Failed(e) => {
            if let Err(cancel_err) = remote.cancel().await {
                debug!(error = %cancel_err, "helper gone before cancel was sent");
            }
            return Err(e);
        }
        Ending::Cancelled => TaskOutcome::Cancelled,
        Ending::TimedOut => {
            warn!(channel = channel.name(), ?timeout, "remote gpg task timed out");
            TaskOutcome::TimedOut
        }
    };

    if let Err(e) = remote.cancel().await {
        debug!(error = %e, "helper gone before cancel was sent");
    }
    let mut result = dispatcher.into_result(outcome);
    collected.fill(&mut result);
    Ok(result)
}

async fn drive(
    remote: &mut dyn RemoteRun,
    dispatcher: &mut Dispatcher,
    progress: &ProgressTracker,
    collected: &mut Collected,
) -> Result<RemoteExit> {
    loop {
        match remote.next_message().await? {
            Some(HelperMessage::Status { event, needs_reply }) => {
                let answer = dispatcher.handle(event).await?;
                if needs_reply {
                    remote.respond(answer.unwrap_or_else(|| b"\n".to_vec())).await?;
                }
            }
            Some(HelperMessage::Progress { processed, .. }) => progress.record_remote(processed),
            Some(HelperMessage::Output { channel, data }) => collected.append(channel, data),
            Some(HelperMessage::Finished(exit)) => return Ok(exit),
            Some(HelperMessage::Failed(failure)) => {
                warn!(?failure, "helper could not carry out the run");
                let context = dispatcher.failure_context(None, &collected.status, &collected.err);
                return Err(failure.into_error(context));
            }
            Some(HelperMessage::Pong) => debug!("ignoring stray pong"),
            None => {
                return Err(Error::HelperUnavailable(
                    "connection closed before the run finished".to_string(),
                ));
            }
        }
    }
}

// unwrap/expect are acceptable in tests for concise failure-on-error assertions
#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;
    use crate::helper::RemoteFailure;
    use crate::order::TaskOrder;
    use crate::status::{StatusEvent, StatusKeyword};
    use crate::task::PromptContext;
    use async_trait::async_trait;
    use std::collections::VecDeque;
    use std::sync::Mutex;
    use tokio::io::AsyncReadExt;

    /// Replays scripted helper messages and records what the task sent back
    struct ScriptedRun {
        messages: VecDeque<HelperMessage>,
        responses: Arc<Mutex<Vec<Vec<u8>>>>,
        cancelled: Arc<Mutex<bool>>,
    }

    #[async_trait]
    impl RemoteRun for ScriptedRun {
        async fn next_message(&mut self) -> Result<Option<HelperMessage>> {
            Ok(self.messages.pop_front())
        }

        async fn respond(&mut self, answer: Vec<u8>) -> Result<()> {
            self.responses.lock().unwrap().push(answer);
            Ok(())
        }

        async fn cancel(&mut self) -> Result<()> {
            *self.cancelled.lock().unwrap() = true;
            Ok(())
        }
    }

    struct ScriptedChannel {
        messages: Mutex<Option<Vec<HelperMessage>>>,
        requests: Mutex<Vec<LaunchRequest>>,
        stdin: Mutex<Vec<u8>>,
        responses: Arc<Mutex<Vec<Vec<u8>>>>,
        cancelled: Arc<Mutex<bool>>,
    }

    impl ScriptedChannel {
        fn new(messages: Vec<HelperMessage>) -> Arc<Self> {
            Arc::new(Self {
                messages: Mutex::new(Some(messages)),
                requests: Mutex::new(Vec::new()),
                stdin: Mutex::new(Vec::new()),
                responses: Arc::default(),
                cancelled: Arc::default(),
            })
        }
    }

    #[async_trait]
    impl PrivilegeSeparationChannel for ScriptedChannel {
        async fn launch(&self, request: LaunchRequest, input: Vec<InputSource>) -> Result<Box<dyn RemoteRun>> {
            self.requests.lock().unwrap().push(request);
            let mut stdin = Vec::new();
            for source in input {
                source.open().await.unwrap().read_to_end(&mut stdin).await.unwrap();
            }
            self.stdin.lock().unwrap().extend(stdin);
            let messages = self.messages.lock().unwrap().take().unwrap_or_default();
            Ok(Box::new(ScriptedRun {
                messages: messages.into(),
                responses: self.responses.clone(),
                cancelled: self.cancelled.clone(),
            }))
        }

        fn name(&self) -> &str {
            "scripted"
        }
    }

    fn status(name: &str, value: &str, needs_reply: bool) -> HelperMessage {
        HelperMessage::Status {
            event: StatusEvent::new(name, value),
            needs_reply,
        }
    }

    fn output(channel: OutputChannel, data: &[u8]) -> HelperMessage {
        HelperMessage::Output {
            channel,
            data: data.to_vec(),
        }
    }

    fn launch(channel: Arc<ScriptedChannel>, inputs: Vec<InputSource>) -> RemoteLaunch {
        RemoteLaunch {
            channel,
            arguments: vec!["--gen-key".to_string()],
            inputs,
            read_attributes: false,
            timeout: None,
            cancel: CancellationToken::new(),
            progress: Arc::new(ProgressTracker::new(None, None)),
        }
    }

    fn dispatcher() -> Dispatcher {
        Dispatcher::new(None, None, Arc::new(ProgressTracker::new(None, None)))
    }

    #[tokio::test]
    async fn prompts_are_answered_on_this_side() {
        let channel = ScriptedChannel::new(vec![
            status("GET_LINE", "keygen.name", true),
            status("KEY_CREATED", "P ABCDEF", false),
            output(OutputChannel::Stdout, b"do"),
            output(OutputChannel::Status, b"[GNUPG:] KEY_CREATED P ABCDEF\n"),
            output(OutputChannel::Stdout, b"ne"),
            HelperMessage::Finished(RemoteExit {
                outcome: TaskOutcome::Finished,
                exit_code: Some(0),
            }),
        ]);
        let mut order = TaskOrder::new();
        order.add_cmd("Alice", "keygen.name");
        let progress = Arc::new(ProgressTracker::new(None, None));
        let dispatcher = Dispatcher::new(Some(order), None, progress);

        let result = run(
            launch(
                channel.clone(),
                vec![
                    InputSource::from(b"abc".as_slice()),
                    InputSource::reader(&b"def"[..], None),
                ],
            ),
            dispatcher,
        )
        .await
        .unwrap();

        assert_eq!(result.exit_code, Some(0));
        assert_eq!(result.out, b"done");
        assert_eq!(result.status, b"[GNUPG:] KEY_CREATED P ABCDEF\n");
        assert_eq!(result.events.len(), 2);
        assert_eq!(*channel.responses.lock().unwrap(), vec![b"Alice\n".to_vec()]);
        assert_eq!(*channel.stdin.lock().unwrap(), b"abcdef");
        let requests = channel.requests.lock().unwrap();
        assert_eq!(requests[0].arguments, vec!["--gen-key"]);
        assert_eq!(requests[0].input_len, None);
    }

    #[tokio::test]
    async fn declared_input_length_is_sent_ahead() {
        let channel = ScriptedChannel::new(vec![HelperMessage::Finished(RemoteExit {
            outcome: TaskOutcome::Finished,
            exit_code: Some(0),
        })]);
        run(
            launch(
                channel.clone(),
                vec![InputSource::from(b"abc".as_slice()), InputSource::from(b"de".to_vec())],
            ),
            dispatcher(),
        )
        .await
        .unwrap();
        assert_eq!(channel.requests.lock().unwrap()[0].input_len, Some(5));
    }

    #[tokio::test]
    async fn disconnect_is_helper_unavailable() {
        let channel = ScriptedChannel::new(vec![status("NODATA", "1", false)]);
        let err = run(launch(channel.clone(), Vec::new()), dispatcher())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::HelperUnavailable(_)));
        assert!(err.is_retryable());
        assert!(*channel.cancelled.lock().unwrap());
    }

    #[tokio::test]
    async fn unanswered_remote_prompt_cancels_the_run() {
        let channel = ScriptedChannel::new(vec![status("GET_HIDDEN", "passphrase.enter", true)]);
        let err = run(launch(channel.clone(), Vec::new()), dispatcher())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::PromptUnanswered { .. }));
        assert!(*channel.cancelled.lock().unwrap());
        assert!(channel.responses.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn helper_failures_keep_their_kind() {
        let channel = ScriptedChannel::new(vec![HelperMessage::Failed(RemoteFailure::ExecutableNotFound {
            name: "gpg".to_string(),
        })]);
        let err = run(launch(channel, Vec::new()), dispatcher()).await.unwrap_err();
        assert!(matches!(err, Error::ExecutableNotFound(ref name) if name == "gpg"));
        assert!(!err.is_retryable());

        let channel = ScriptedChannel::new(vec![
            status("NEED_PASSPHRASE", "AAAA BBBB 1 0", false),
            output(OutputChannel::Stderr, b"gpg: decryption failed"),
            HelperMessage::Failed(RemoteFailure::PromptUnanswered {
                keyword: StatusKeyword::GetHidden,
                prompt: "passphrase.enter".to_string(),
                context: PromptContext::default(),
            }),
        ]);
        let err = run(launch(channel, Vec::new()), dispatcher()).await.unwrap_err();
        match err {
            Error::PromptUnanswered { keyword, prompt, .. } => {
                assert_eq!(keyword, StatusKeyword::GetHidden);
                assert_eq!(prompt, "passphrase.enter");
            }
            other => panic!("expected PromptUnanswered, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn remote_pipe_failures_carry_what_this_side_saw() {
        let channel = ScriptedChannel::new(vec![
            status("BEGIN_DECRYPTION", "", false),
            output(OutputChannel::Stderr, b"gpg: read error"),
            HelperMessage::Failed(RemoteFailure::Pipe {
                channel: "stdout".to_string(),
                message: "broken pipe".to_string(),
                exit_code: None,
                last_keyword: None,
            }),
        ]);
        let err = run(launch(channel, Vec::new()), dispatcher()).await.unwrap_err();
        match err {
            Error::Pipe { channel, context, .. } => {
                assert_eq!(channel, "stdout");
                assert_eq!(context.last_keyword.as_deref(), Some("BEGIN_DECRYPTION"));
                assert_eq!(context.err, b"gpg: read error");
            }
            other => panic!("expected Pipe, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn unexpected_helper_errors_are_not_retried() {
        let channel = ScriptedChannel::new(vec![HelperMessage::Failed(RemoteFailure::Other {
            message: "keyring locked".to_string(),
        })]);
        let err = run(launch(channel, Vec::new()), dispatcher()).await.unwrap_err();
        match &err {
            Error::HelperFailed(message) => assert!(message.contains("keyring locked")),
            other => panic!("expected HelperFailed, got {other:?}"),
        }
        assert!(!err.is_retryable());
    }
}
