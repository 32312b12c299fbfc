//! Status event dispatch
//!
//! Every event passes through [`Dispatcher::handle`] in arrival order. It is
//! the only place that touches the prompt context, the task order cursor and
//! the recorded status, so none of them need locking.

use super::delegate::{Answer, PassphraseRequest, PromptContext, PromptRequest, TaskDelegate, UserIdHint};
use super::progress::ProgressTracker;
use super::result::{StatusDict, TaskOutcome, TaskResult};
use crate::error::{Error, FailureContext, Result};
use crate::order::TaskOrder;
use crate::status::{ErrorCode, StatusEvent, StatusKeyword};
use std::sync::Arc;
use tracing::debug;

pub(crate) struct Dispatcher {
    order: Option<TaskOrder>,
    delegate: Option<Arc<dyn TaskDelegate>>,
    progress: Arc<ProgressTracker>,
    context: PromptContext,
    events: Vec<StatusEvent>,
    status_dict: StatusDict,
    error_codes: Vec<ErrorCode>,
}

impl Dispatcher {
    pub(crate) fn new(
        order: Option<TaskOrder>,
        delegate: Option<Arc<dyn TaskDelegate>>,
        progress: Arc<ProgressTracker>,
    ) -> Self {
        Self {
            order,
            delegate,
            progress,
            context: PromptContext::default(),
            events: Vec::new(),
            status_dict: StatusDict::new(),
            error_codes: Vec::new(),
        }
    }

    /// Record an event and, for prompts, produce the line to send back
    ///
    /// Returns [`Error::PromptUnanswered`] when neither the delegate nor the
    /// order has an answer.
    pub(crate) async fn handle(&mut self, event: StatusEvent) -> Result<Option<Vec<u8>>> {
        debug!(keyword = %event.name, value = %event.value, "status event");

        match event.keyword {
            StatusKeyword::UserIdHint => {
                self.context.last_user_id_hint = Some(UserIdHint::from_event(&event));
            }
            keyword if keyword.is_passphrase_request() => {
                self.context.last_need_passphrase = Some(PassphraseRequest::from_event(&event));
            }
            StatusKeyword::Progress => self.progress.record_status(&event),
            _ => {}
        }

        if let Some(code) = ErrorCode::from_event(&event)
            && !self.error_codes.contains(&code)
        {
            self.error_codes.push(code);
        }
        self.status_dict
            .entry(event.name.clone())
            .or_default()
            .push(event.args().map(str::to_string).collect());

        if let Some(delegate) = &self.delegate {
            delegate.status(&event);
        }

        let reply = if event.keyword.is_prompt() {
            Some(self.answer(&event).await?)
        } else {
            None
        };
        self.events.push(event);
        Ok(reply)
    }

    async fn answer(&mut self, event: &StatusEvent) -> Result<Vec<u8>> {
        let prompt = event.arg(0).unwrap_or_default().to_string();
        let request = PromptRequest {
            keyword: event.keyword,
            prompt,
            context: self.context.clone(),
        };

        let mut answer = match &self.delegate {
            Some(delegate) => delegate.answer_prompt(&request).await,
            None => None,
        };
        if answer.is_none()
            && let Some(order) = self.order.as_mut()
        {
            answer = order
                .cmd_for_prompt(&request.prompt, request.keyword)
                .map(Answer::Text);
        }

        match answer {
            Some(answer) => {
                // Hidden answers are passphrases; never log them
                debug!(keyword = %request.keyword, prompt = %request.prompt, "answering prompt");
                answer.into_line()
            }
            None => Err(Error::PromptUnanswered {
                keyword: request.keyword,
                prompt: request.prompt,
                context: Box::new(request.context),
            }),
        }
    }

    /// Start from the hints of an earlier attempt
    pub(crate) fn seed_context(&mut self, context: PromptContext) {
        self.context = context;
    }

    /// Name of the last event seen, for failure reports
    pub(crate) fn last_keyword(&self) -> Option<String> {
        self.events.last().map(|e| e.name.clone())
    }

    /// What a channel failure should carry back to the caller
    pub(crate) fn failure_context(&self, exit_code: Option<i32>, status: &[u8], err: &[u8]) -> FailureContext {
        FailureContext {
            last_keyword: self.last_keyword(),
            exit_code,
            status: status.to_vec(),
            err: err.to_vec(),
            prompt_context: self.context.clone(),
        }
    }

    pub(crate) fn into_result(self, outcome: TaskOutcome) -> TaskResult {
        TaskResult {
            events: self.events,
            status_dict: self.status_dict,
            error_codes: self.error_codes,
            prompt_context: self.context,
            ..TaskResult::empty(outcome)
        }
    }
}

// unwrap/expect are acceptable in tests for concise failure-on-error assertions
#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::Mutex;

    fn dispatcher(order: Option<TaskOrder>, delegate: Option<Arc<dyn TaskDelegate>>) -> Dispatcher {
        Dispatcher::new(order, delegate, Arc::new(ProgressTracker::new(None, None)))
    }

    #[derive(Default)]
    struct Recorder {
        seen: Mutex<Vec<String>>,
        requests: Mutex<Vec<PromptRequest>>,
        passphrase: Option<String>,
    }

    #[async_trait]
    impl TaskDelegate for Recorder {
        async fn answer_prompt(&self, request: &PromptRequest) -> Option<Answer> {
            self.requests.lock().unwrap().push(request.clone());
            if request.keyword == StatusKeyword::GetHidden {
                self.passphrase.clone().map(Answer::Text)
            } else {
                None
            }
        }

        fn status(&self, event: &StatusEvent) {
            self.seen.lock().unwrap().push(event.name.clone());
        }
    }

    #[tokio::test]
    async fn records_events_codes_and_dict() {
        let mut dispatcher = dispatcher(None, None);
        for (name, value) in [
            ("NEED_PASSPHRASE", "AAAA BBBB 1 0"),
            ("BAD_PASSPHRASE", "AAAA"),
            ("BAD_PASSPHRASE", "AAAA"),
            ("ERROR", "pkdecrypt_failed 11"),
            ("FUTURE_THING", "x y"),
        ] {
            assert_eq!(dispatcher.handle(StatusEvent::new(name, value)).await.unwrap(), None);
        }
        assert_eq!(dispatcher.last_keyword().as_deref(), Some("FUTURE_THING"));

        let result = dispatcher.into_result(TaskOutcome::Finished);
        assert_eq!(result.events.len(), 5);
        assert_eq!(result.error_codes, vec![ErrorCode::BadPassphrase]);
        assert_eq!(result.status_dict["BAD_PASSPHRASE"].len(), 2);
        assert_eq!(result.status_dict["FUTURE_THING"][0], vec!["x", "y"]);
        assert!(result.prompt_context.last_need_passphrase.is_some());
    }

    #[tokio::test]
    async fn delegate_answers_first_and_sees_context() {
        let recorder = Arc::new(Recorder {
            passphrase: Some("hunter2".to_string()),
            ..Default::default()
        });
        let mut order = TaskOrder::new();
        order.add_cmd("from-order", "passphrase.enter");
        let mut dispatcher = dispatcher(Some(order), Some(recorder.clone()));

        dispatcher
            .handle(StatusEvent::new("USERID_HINT", "AAAA Alice <a@example.org>"))
            .await
            .unwrap();
        dispatcher
            .handle(StatusEvent::new("NEED_PASSPHRASE", "AAAA AAAA 1 0"))
            .await
            .unwrap();
        let reply = dispatcher
            .handle(StatusEvent::new("GET_HIDDEN", "passphrase.enter"))
            .await
            .unwrap();
        assert_eq!(reply, Some(b"hunter2\n".to_vec()));

        let requests = recorder.requests.lock().unwrap();
        let hint = requests[0].context.last_user_id_hint.as_ref().unwrap();
        assert_eq!(hint.user_id, "Alice <a@example.org>");
        assert_eq!(
            *recorder.seen.lock().unwrap(),
            vec!["USERID_HINT", "NEED_PASSPHRASE", "GET_HIDDEN"]
        );
    }

    #[tokio::test]
    async fn order_answers_when_the_delegate_declines() {
        let mut order = TaskOrder::new();
        order.add_cmd("Alice", "keygen.name");
        let mut dispatcher = dispatcher(Some(order), Some(Arc::new(Recorder::default())));
        let reply = dispatcher
            .handle(StatusEvent::new("GET_LINE", "keygen.name"))
            .await
            .unwrap();
        assert_eq!(reply, Some(b"Alice\n".to_vec()));
    }

    #[tokio::test]
    async fn unanswered_prompt_is_an_error_with_context() {
        let mut dispatcher = dispatcher(Some(TaskOrder::new()), None);
        dispatcher
            .handle(StatusEvent::new("USERID_HINT", "AAAA Bob"))
            .await
            .unwrap();
        let err = dispatcher
            .handle(StatusEvent::new("GET_LINE", "keygen.email"))
            .await
            .unwrap_err();
        match err {
            Error::PromptUnanswered {
                keyword,
                prompt,
                context,
            } => {
                assert_eq!(keyword, StatusKeyword::GetLine);
                assert_eq!(prompt, "keygen.email");
                assert_eq!(context.last_user_id_hint.unwrap().key_id, "AAAA");
            }
            other => panic!("expected PromptUnanswered, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn hints_persist_until_replaced() {
        let mut dispatcher = dispatcher(Some(TaskOrder::yes_to_all()), None);
        dispatcher
            .handle(StatusEvent::new("USERID_HINT", "AAAA First"))
            .await
            .unwrap();
        dispatcher
            .handle(StatusEvent::new("GET_BOOL", "untrusted_key.override"))
            .await
            .unwrap();
        dispatcher
            .handle(StatusEvent::new("GOODSIG", "AAAA First"))
            .await
            .unwrap();
        let result = dispatcher.into_result(TaskOutcome::Finished);
        assert_eq!(
            result.prompt_context.last_user_id_hint.unwrap().user_id,
            "First"
        );
    }

    #[tokio::test]
    async fn seeded_context_reaches_the_first_prompt_and_failures() {
        let recorder = Arc::new(Recorder::default());
        let mut dispatcher = dispatcher(None, Some(recorder.clone()));
        dispatcher.seed_context(PromptContext {
            last_user_id_hint: Some(UserIdHint {
                key_id: "AAAA".to_string(),
                user_id: "Alice".to_string(),
            }),
            last_need_passphrase: None,
        });

        let failure = dispatcher.failure_context(Some(2), b"raw", b"oops");
        assert_eq!(failure.prompt_context.last_user_id_hint.as_ref().unwrap().key_id, "AAAA");
        assert_eq!(failure.exit_code, Some(2));
        assert_eq!(failure.err, b"oops");

        let err = dispatcher
            .handle(StatusEvent::new("GET_HIDDEN", "passphrase.enter"))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::PromptUnanswered { .. }));
        let requests = recorder.requests.lock().unwrap();
        assert_eq!(
            requests[0].context.last_user_id_hint.as_ref().unwrap().user_id,
            "Alice"
        );
    }

    #[tokio::test]
    async fn multi_line_answers_fail_the_prompt() {
        let recorder = Arc::new(Recorder {
            passphrase: Some("one\ntwo".to_string()),
            ..Default::default()
        });
        let mut dispatcher = dispatcher(None, Some(recorder));
        let err = dispatcher
            .handle(StatusEvent::new("GET_HIDDEN", "passphrase.enter"))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InvalidAnswer(_)));
    }
}
