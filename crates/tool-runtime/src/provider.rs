use crate::tool::{ToolCall, ToolDefinition, ToolResult};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Returned by providers that keep no searchable history.
pub const HISTORY_NOT_IMPLEMENTED: &str = "Not implemented";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
    /// Result for a pending tool call; carries `call_id`.
    Tool,
}

/// A message added to a provider thread.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub call_id: Option<String>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub is_error: bool,
}

impl Message {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
            call_id: None,
            is_error: false,
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
            call_id: None,
            is_error: false,
        }
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: content.into(),
            call_id: None,
            is_error: false,
        }
    }

    pub fn tool_result(result: ToolResult) -> Self {
        Self {
            role: Role::Tool,
            content: result.content,
            call_id: Some(result.tool_call_id),
            is_error: result.is_error,
        }
    }
}

/// Outcome of one model turn.
#[derive(Debug, Clone, PartialEq)]
pub enum TurnResult {
    /// The model answered; the turn is over.
    Final(Message),
    /// The model wants these tools run. Every id must be answered before a
    /// new user message is accepted.
    ToolCalls(Vec<ToolCall>),
    /// The response could not be interpreted. The provider has already told
    /// the model what was wrong; the caller just spends the iteration.
    Invalid { reason: String },
}

/// Inclusive time window for history search. Open ends are unbounded.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeRange {
    pub start: Option<DateTime<Utc>>,
    pub end: Option<DateTime<Utc>>,
}

impl TimeRange {
    pub fn contains(&self, at: DateTime<Utc>) -> bool {
        self.start.map_or(true, |s| at >= s) && self.end.map_or(true, |e| at <= e)
    }
}

/// Thread-based conversation service the orchestrator drives.
#[async_trait]
pub trait ConversationProvider: Send + Sync {
    /// Open a thread primed with `instructions` and the available tools.
    async fn create_thread(
        &self,
        instructions: &str,
        tools: &[ToolDefinition],
    ) -> Result<String, ProviderError>;

    /// Append a message. Must fail with `PendingCalls` for a user message
    /// while tool calls are unanswered.
    async fn add_message(&self, thread_id: &str, message: Message) -> Result<(), ProviderError>;

    /// Run the model over the thread.
    async fn execute_turn(&self, thread_id: &str) -> Result<TurnResult, ProviderError>;

    async fn remove_thread(&self, thread_id: &str) -> Result<(), ProviderError>;

    /// Best-effort search over the thread's history.
    async fn search_history(
        &self,
        _thread_id: &str,
        _text: Option<&str>,
        _range: Option<TimeRange>,
    ) -> Result<String, ProviderError> {
        Ok(HISTORY_NOT_IMPLEMENTED.to_string())
    }

    /// Provider name for logging/debugging (e.g., "text-protocol", "mock")
    fn provider_name(&self) -> &str;
}

#[derive(Debug, thiserror::Error)]
pub enum ProviderError {
    #[error("Invalid response: {0}")]
    InvalidResponse(String),
    #[error("Unknown thread: {0}")]
    UnknownThread(String),
    #[error("Thread {thread_id} has {pending} unanswered tool call(s)")]
    PendingCalls { thread_id: String, pending: usize },
    #[error("No pending tool call with id {0}")]
    UnknownCall(String),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Scripted provider for exercising the orchestrator without a model.
#[cfg(any(test, feature = "test-utils"))]
pub mod mock {
    use super::*;
    use std::collections::{HashMap, HashSet, VecDeque};
    use std::sync::{Arc, Mutex};
    use tokio::sync::Notify;

    #[derive(Default)]
    struct MockState {
        turns: VecDeque<Result<TurnResult, ProviderError>>,
        outstanding: Vec<String>,
        rejected_results: HashSet<String>,
        resolutions: HashMap<String, usize>,
        messages: Vec<Message>,
        executed: usize,
        threads_created: usize,
        removed: Vec<String>,
    }

    /// Returns queued turn results in order and enforces the pending-call
    /// contract the way a real provider would.
    #[derive(Default)]
    pub struct MockProvider {
        state: Mutex<MockState>,
        gate: Mutex<Option<Arc<Notify>>>,
    }

    impl MockProvider {
        pub fn new() -> Self {
            Self::default()
        }

        /// Queue a result for a future `execute_turn`.
        pub fn queue_turn(&self, turn: TurnResult) {
            self.state.lock().unwrap().turns.push_back(Ok(turn));
        }

        /// Make a future `execute_turn` fail with `error`.
        pub fn queue_error(&self, error: ProviderError) {
            self.state.lock().unwrap().turns.push_back(Err(error));
        }

        /// Refuse the first result delivered for `call_id`, leaving it
        /// outstanding.
        pub fn reject_result_once(&self, call_id: &str) {
            self.state
                .lock()
                .unwrap()
                .rejected_results
                .insert(call_id.to_string());
        }

        /// Queue a final answer.
        pub fn queue_text(&self, text: &str) {
            self.queue_turn(TurnResult::Final(Message::assistant(text)));
        }

        /// Queue a batch of tool calls.
        pub fn queue_calls(&self, calls: Vec<ToolCall>) {
            self.queue_turn(TurnResult::ToolCalls(calls));
        }

        /// Make every `execute_turn` wait for a permit on `gate` first.
        pub fn hold_turns(&self, gate: Arc<Notify>) {
            *self.gate.lock().unwrap() = Some(gate);
        }

        /// How many results were delivered for `call_id`.
        pub fn resolutions(&self, call_id: &str) -> usize {
            self.state
                .lock()
                .unwrap()
                .resolutions
                .get(call_id)
                .copied()
                .unwrap_or(0)
        }

        pub fn outstanding(&self) -> Vec<String> {
            self.state.lock().unwrap().outstanding.clone()
        }

        pub fn messages(&self) -> Vec<Message> {
            self.state.lock().unwrap().messages.clone()
        }

        pub fn executed_turns(&self) -> usize {
            self.state.lock().unwrap().executed
        }

        pub fn threads_created(&self) -> usize {
            self.state.lock().unwrap().threads_created
        }

        pub fn removed_threads(&self) -> Vec<String> {
            self.state.lock().unwrap().removed.clone()
        }
    }

    #[async_trait]
    impl ConversationProvider for MockProvider {
        async fn create_thread(
            &self,
            _instructions: &str,
            _tools: &[ToolDefinition],
        ) -> Result<String, ProviderError> {
            let mut state = self.state.lock().unwrap();
            state.threads_created += 1;
            Ok(format!("thread_{}", state.threads_created))
        }

        async fn add_message(&self, thread_id: &str, message: Message) -> Result<(), ProviderError> {
            let mut state = self.state.lock().unwrap();
            match (&message.role, &message.call_id) {
                (Role::User, _) if !state.outstanding.is_empty() => {
                    return Err(ProviderError::PendingCalls {
                        thread_id: thread_id.to_string(),
                        pending: state.outstanding.len(),
                    });
                }
                (Role::Tool, Some(id)) if state.rejected_results.remove(id) => {
                    return Err(ProviderError::Other(anyhow::anyhow!(
                        "result for {id} was not accepted"
                    )));
                }
                (Role::Tool, Some(id)) => {
                    let Some(pos) = state.outstanding.iter().position(|o| o == id) else {
                        return Err(ProviderError::UnknownCall(id.clone()));
                    };
                    state.outstanding.remove(pos);
                    *state.resolutions.entry(id.clone()).or_insert(0) += 1;
                }
                _ => {}
            }
            state.messages.push(message);
            Ok(())
        }

        async fn execute_turn(&self, _thread_id: &str) -> Result<TurnResult, ProviderError> {
            let gate = self.gate.lock().unwrap().clone();
            if let Some(gate) = gate {
                gate.notified().await;
            }
            let mut state = self.state.lock().unwrap();
            state.executed += 1;
            let turn = match state.turns.pop_front() {
                Some(turn) => turn?,
                None => TurnResult::Final(Message::assistant("")),
            };
            if let TurnResult::ToolCalls(calls) = &turn {
                let ids: Vec<String> = calls.iter().map(|c| c.id.clone()).collect();
                state.outstanding.extend(ids);
            }
            Ok(turn)
        }

        async fn remove_thread(&self, thread_id: &str) -> Result<(), ProviderError> {
            self.state.lock().unwrap().removed.push(thread_id.to_string());
            Ok(())
        }

        fn provider_name(&self) -> &str {
            "mock"
        }
    }
}

#[cfg(test)]
mod tests {
    use super::mock::MockProvider;
    use super::*;
    use crate::tool::NamedArg;
    use chrono::Duration;

    #[test]
    fn test_message_serialization_skips_empty_fields() {
        let json = serde_json::to_value(Message::user("hi")).unwrap();
        assert_eq!(json, serde_json::json!({"role": "user", "content": "hi"}));

        let result = Message::tool_result(ToolResult::error("call_1", "boom"));
        let json = serde_json::to_value(&result).unwrap();
        assert_eq!(json["role"], "tool");
        assert_eq!(json["call_id"], "call_1");
        assert_eq!(json["is_error"], true);
        let roundtrip: Message = serde_json::from_value(json).unwrap();
        assert_eq!(roundtrip, result);
    }

    #[test]
    fn test_time_range_bounds() {
        let now = Utc::now();
        let range = TimeRange {
            start: Some(now - Duration::minutes(5)),
            end: Some(now),
        };
        assert!(range.contains(now));
        assert!(range.contains(now - Duration::minutes(5)));
        assert!(!range.contains(now + Duration::seconds(1)));
        assert!(TimeRange::default().contains(now));
    }

    #[tokio::test]
    async fn test_mock_rejects_user_message_while_calls_pending() {
        let provider = MockProvider::new();
        provider.queue_calls(vec![ToolCall {
            id: "call_1".to_string(),
            name: "echo".to_string(),
            arguments: vec![NamedArg::new("message", "hi")],
        }]);
        let thread = provider.create_thread("", &[]).await.unwrap();
        provider.execute_turn(&thread).await.unwrap();

        let err = provider
            .add_message(&thread, Message::user("next"))
            .await
            .unwrap_err();
        assert!(matches!(err, ProviderError::PendingCalls { pending: 1, .. }));

        provider
            .add_message(&thread, Message::tool_result(ToolResult::success("call_1", "hi")))
            .await
            .unwrap();
        provider.add_message(&thread, Message::user("next")).await.unwrap();
        assert_eq!(provider.resolutions("call_1"), 1);
    }

    #[tokio::test]
    async fn test_mock_rejects_result_for_unknown_call() {
        let provider = MockProvider::new();
        let err = provider
            .add_message("t", Message::tool_result(ToolResult::success("nope", "")))
            .await
            .unwrap_err();
        assert!(matches!(err, ProviderError::UnknownCall(id) if id == "nope"));
    }

    #[tokio::test]
    async fn test_default_history_search() {
        let provider = MockProvider::new();
        let out = provider.search_history("t", Some("x"), None).await.unwrap();
        assert_eq!(out, HISTORY_NOT_IMPLEMENTED);
    }
}
