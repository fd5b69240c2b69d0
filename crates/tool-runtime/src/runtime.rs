use indexmap::IndexMap;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::{Notify, OnceCell};
use tracing::{debug, info, warn};

use chatloop_core::OrchestratorConfig;

use crate::provider::{ConversationProvider, Message, ProviderError, TimeRange, TurnResult};
use crate::registry::{CatalogError, ToolSet};
use crate::tool::{ToolCall, ToolDefinition, ToolResult};
use crate::view::ToolCatalogView;

/// Returned by a prompt that was stopped by `cancel()` or a forced prompt.
pub const INTERRUPTED: &str = "Process was interrupted";
/// Result delivered for calls still pending when `cancel()` runs.
pub const CANCELLED_REASON: &str = "Tool call cancelled by user";
/// Result delivered for calls still pending when a forced prompt takes over.
pub const SUPERSEDED_REASON: &str = "Tool call superseded by a new prompt";
/// Result delivered for calls never dispatched before the loop ended.
pub const UNRESOLVED_REASON: &str = "Tool call was not executed before the turn ended";

/// Per-call options for [`Orchestrator::prompt_with`].
#[derive(Debug, Clone, Copy, Default)]
pub struct PromptOptions {
    /// Overrides the configured iteration budget.
    pub iteration_limit: Option<usize>,
    /// Stop any running prompt and take over once it has released the lock.
    pub force: bool,
}

/// A tool call issued by the provider and not yet answered.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingCall {
    pub id: String,
    pub tool: String,
}

#[derive(Debug, Default)]
struct LoopState {
    busy: bool,
    cancel_requested: bool,
    closed: bool,
    /// Bumped by every acquisition and every forced takeover.
    epoch: u64,
    /// call id -> tool name, in issue order.
    pending: IndexMap<String, String>,
    /// Batches drained by `cancel()` or a takeover whose results are still
    /// being delivered.
    resolving: usize,
}

enum LoopExit {
    Final(String),
    Interrupted,
    Exhausted,
}

/// Drives one conversation: prompt → model turn → tool dispatch → ... → answer.
///
/// At most one prompt runs at a time. `cancel()` is cooperative: it is
/// observed between iterations and between dispatches of one batch.
pub struct Orchestrator {
    provider: Arc<dyn ConversationProvider>,
    tools: Arc<ToolCatalogView>,
    instructions: String,
    max_iterations: usize,
    thread: OnceCell<String>,
    state: Mutex<LoopState>,
    released: Notify,
    resolved: Notify,
}

/// Clears the busy flag when a prompt ends, however it ends.
struct LoopGuard<'a> {
    orchestrator: &'a Orchestrator,
}

impl Drop for LoopGuard<'_> {
    fn drop(&mut self) {
        self.orchestrator.state().busy = false;
        self.orchestrator.released.notify_waiters();
    }
}

/// Marks one drained batch as in flight until its delivery finishes or is
/// dropped.
struct ResolvingGuard<'a> {
    orchestrator: &'a Orchestrator,
}

impl Drop for ResolvingGuard<'_> {
    fn drop(&mut self) {
        let remaining = {
            let mut state = self.orchestrator.state();
            state.resolving = state.resolving.saturating_sub(1);
            state.resolving
        };
        if remaining == 0 {
            self.orchestrator.resolved.notify_waiters();
        }
    }
}

impl Orchestrator {
    pub fn new(provider: Arc<dyn ConversationProvider>, tools: ToolCatalogView) -> Self {
        let defaults = OrchestratorConfig::default();
        Self {
            provider,
            tools: Arc::new(tools),
            instructions: defaults.instructions,
            max_iterations: defaults.max_iterations,
            thread: OnceCell::new(),
            state: Mutex::new(LoopState::default()),
            released: Notify::new(),
            resolved: Notify::new(),
        }
    }

    /// Orchestrator over the view of a tool set instance.
    pub fn for_tool_set<T: ToolSet>(
        provider: Arc<dyn ConversationProvider>,
        instance: Arc<T>,
    ) -> Result<Self, OrchestratorError> {
        Ok(Self::new(provider, ToolCatalogView::of(instance)?))
    }

    pub fn with_instructions(mut self, instructions: impl Into<String>) -> Self {
        self.instructions = instructions.into();
        self
    }

    pub fn with_max_iterations(mut self, max: usize) -> Self {
        self.max_iterations = max;
        self
    }

    pub fn with_config(mut self, config: &OrchestratorConfig) -> Self {
        self.max_iterations = config.max_iterations;
        self.instructions = config.instructions.clone();
        self
    }

    fn state(&self) -> MutexGuard<'_, LoopState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn is_busy(&self) -> bool {
        self.state().busy
    }

    pub fn pending_calls(&self) -> Vec<PendingCall> {
        self.state()
            .pending
            .iter()
            .map(|(id, tool)| PendingCall {
                id: id.clone(),
                tool: tool.clone(),
            })
            .collect()
    }

    pub fn tool_definitions(&self) -> Vec<ToolDefinition> {
        self.tools.definitions()
    }

    /// Run one user turn with the configured iteration budget.
    pub async fn prompt(&self, input: &str) -> Result<String, OrchestratorError> {
        self.prompt_with(input, PromptOptions::default()).await
    }

    /// Run one user turn.
    ///
    /// Returns the model's final text, or [`INTERRUPTED`] when cancelled.
    /// Fails with `Busy` if another prompt holds the conversation and with
    /// `TooManyAttempts` when the budget runs out before a final answer.
    pub async fn prompt_with(
        &self,
        input: &str,
        options: PromptOptions,
    ) -> Result<String, OrchestratorError> {
        let limit = options.iteration_limit.unwrap_or(self.max_iterations);
        if options.force {
            self.supersede().await;
        }

        let (epoch, stale, _guard) = self.acquire()?;
        debug!(epoch, limit, "Prompt acquired conversation");

        let thread = self
            .thread
            .get_or_try_init(|| async {
                self.provider
                    .create_thread(&self.instructions, &self.tools.definitions())
                    .await
            })
            .await?;

        self.wait_for_resolutions().await;

        // Left behind only by a prompt future dropped mid-batch.
        if !stale.is_empty() {
            warn!(count = stale.len(), "Resolving calls left by an abandoned prompt");
            self.resolve_all(thread, stale, UNRESOLVED_REASON).await;
        }

        self.provider.add_message(thread, Message::user(input)).await?;

        let outcome = self.run_loop(thread, epoch, limit).await;

        let leftovers = self.drain_pending();
        if !leftovers.is_empty() {
            debug!(count = leftovers.len(), "Resolving undispatched calls");
            self.resolve_all(thread, leftovers, UNRESOLVED_REASON).await;
        }
        self.wait_for_resolutions().await;

        match outcome? {
            LoopExit::Final(text) => {
                info!(provider = self.provider.provider_name(), "Prompt complete");
                Ok(text)
            }
            LoopExit::Interrupted => {
                info!("Prompt interrupted");
                Ok(INTERRUPTED.to_string())
            }
            LoopExit::Exhausted => {
                info!(limit, "Prompt exhausted its iteration budget");
                Err(OrchestratorError::TooManyAttempts(limit))
            }
        }
    }

    /// Stop the running prompt at its next checkpoint.
    ///
    /// Every pending call is answered with [`CANCELLED_REASON`]. The running
    /// prompt does not return until those answers are delivered. With
    /// nothing running this only clears an empty table.
    pub async fn cancel(&self) {
        let (drained, _resolving) = {
            let mut state = self.state();
            state.cancel_requested = true;
            state.resolving += 1;
            let drained = state.pending.drain(..).collect::<Vec<_>>();
            (drained, ResolvingGuard { orchestrator: self })
        };
        info!(pending = drained.len(), "Cancellation requested");
        if let Some(thread) = self.thread.get() {
            self.resolve_all(thread, drained, CANCELLED_REASON).await;
        }
    }

    /// Search the conversation history through the provider.
    pub async fn search_history(
        &self,
        text: Option<&str>,
        range: Option<TimeRange>,
    ) -> Result<String, OrchestratorError> {
        match self.thread.get() {
            Some(thread) => Ok(self.provider.search_history(thread, text, range).await?),
            None => Ok(String::new()),
        }
    }

    /// Remove the provider thread. Later prompts fail with `Closed`.
    pub async fn close(&self) -> Result<(), OrchestratorError> {
        {
            let mut state = self.state();
            if state.busy {
                return Err(OrchestratorError::Busy);
            }
            state.closed = true;
        }
        if let Some(thread) = self.thread.get() {
            self.provider.remove_thread(thread).await?;
            info!(thread = %thread, "Conversation closed");
        }
        Ok(())
    }

    fn acquire(&self) -> Result<(u64, Vec<(String, String)>, LoopGuard<'_>), OrchestratorError> {
        let mut state = self.state();
        if state.closed {
            return Err(OrchestratorError::Closed);
        }
        if state.busy {
            return Err(OrchestratorError::Busy);
        }
        state.busy = true;
        state.cancel_requested = false;
        state.epoch += 1;
        let stale = state.pending.drain(..).collect();
        Ok((state.epoch, stale, LoopGuard { orchestrator: self }))
    }

    /// Answer pending calls, stop the running prompt and wait until it has
    /// released the conversation.
    async fn supersede(&self) {
        let (drained, resolving) = {
            let mut state = self.state();
            if !state.busy {
                return;
            }
            state.cancel_requested = true;
            state.epoch += 1;
            state.resolving += 1;
            let drained = state.pending.drain(..).collect::<Vec<_>>();
            (drained, ResolvingGuard { orchestrator: self })
        };
        info!(pending = drained.len(), "Forced prompt superseding a running one");
        if let Some(thread) = self.thread.get() {
            self.resolve_all(thread, drained, SUPERSEDED_REASON).await;
        }
        drop(resolving);

        loop {
            let released = self.released.notified();
            tokio::pin!(released);
            released.as_mut().enable();
            if !self.state().busy {
                return;
            }
            released.await;
        }
    }

    /// Wait until no drained batch is still being answered.
    async fn wait_for_resolutions(&self) {
        loop {
            let resolved = self.resolved.notified();
            tokio::pin!(resolved);
            resolved.as_mut().enable();
            if self.state().resolving == 0 {
                return;
            }
            resolved.await;
        }
    }

    fn should_stop(&self, epoch: u64) -> bool {
        let state = self.state();
        state.cancel_requested || state.epoch != epoch
    }

    fn drain_pending(&self) -> Vec<(String, String)> {
        self.state().pending.drain(..).collect()
    }

    /// Remove `id` from the pending table; whoever removes it delivers it.
    fn take_pending(&self, id: &str) -> bool {
        self.state().pending.shift_remove(id).is_some()
    }

    async fn run_loop(
        &self,
        thread: &str,
        epoch: u64,
        limit: usize,
    ) -> Result<LoopExit, OrchestratorError> {
        for iteration in 0..limit {
            if self.should_stop(epoch) {
                return Ok(LoopExit::Interrupted);
            }
            debug!(iteration, "Starting orchestrator iteration");

            match self.provider.execute_turn(thread).await? {
                TurnResult::Final(message) => return Ok(LoopExit::Final(message.content)),
                TurnResult::ToolCalls(calls) => {
                    self.dispatch_batch(thread, epoch, calls).await?;
                }
                TurnResult::Invalid { reason } => {
                    warn!(iteration, reason = %reason, "Model response rejected by provider");
                }
            }
        }

        if self.should_stop(epoch) {
            Ok(LoopExit::Interrupted)
        } else {
            Ok(LoopExit::Exhausted)
        }
    }

    async fn dispatch_batch(
        &self,
        thread: &str,
        epoch: u64,
        calls: Vec<ToolCall>,
    ) -> Result<(), OrchestratorError> {
        {
            let mut state = self.state();
            for call in &calls {
                state.pending.insert(call.id.clone(), call.name.clone());
            }
        }
        info!(count = calls.len(), "Executing tool calls");

        for call in calls {
            if self.should_stop(epoch) {
                debug!(call = %call.id, "Cancellation observed mid-batch");
                break;
            }
            debug!(call = %call.id, tool = %call.name, "Dispatching tool call");
            let result = match self.tools.invoke(&call.name, &call.arguments).await {
                Ok(content) => ToolResult::success(call.id.clone(), content),
                Err(e) => {
                    warn!(tool = %call.name, error = %e, "Tool call failed");
                    ToolResult::error(call.id.clone(), e.to_string())
                }
            };
            if self.take_pending(&call.id) {
                if let Err(e) = self
                    .provider
                    .add_message(thread, Message::tool_result(result))
                    .await
                {
                    // Still unanswered as far as the provider knows.
                    self.state().pending.insert(call.id, call.name);
                    return Err(e.into());
                }
            } else {
                debug!(call = %call.id, "Discarding result for an already resolved call");
            }
        }
        Ok(())
    }

    async fn resolve_all(&self, thread: &str, calls: Vec<(String, String)>, reason: &str) {
        for (id, tool) in calls {
            let message = Message::tool_result(ToolResult::error(id.clone(), reason));
            if let Err(e) = self.provider.add_message(thread, message).await {
                warn!(call = %id, tool = %tool, error = %e, "Failed to resolve pending call");
            }
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum OrchestratorError {
    #[error("A prompt is already running on this conversation")]
    Busy,
    #[error("No final answer after {0} iteration(s)")]
    TooManyAttempts(usize),
    #[error("Conversation is closed")]
    Closed,
    #[error("Catalog error: {0}")]
    Catalog(#[from] CatalogError),
    #[error("Provider error: {0}")]
    Provider(#[from] ProviderError),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::mock::MockProvider;
    use crate::provider::HISTORY_NOT_IMPLEMENTED;
    use crate::registry::{Registration, ToolCatalog};
    use crate::tool::{NamedArg, ToolArgs, ToolError};
    use crate::view::NOT_CALLABLE;

    struct Notes;

    impl ToolSet for Notes {
        fn register_tools(catalog: &mut ToolCatalog<Self>) -> Result<(), CatalogError> {
            catalog
                .register(
                    Registration::new("echo", "Echo a message").param("message", "string"),
                    |_notes, args: ToolArgs| {
                        Box::pin(async move { Ok(args.string(0)?.to_string()) })
                    },
                )?
                .register(
                    Registration::new("fail", "Always fails"),
                    |_notes, _args| {
                        Box::pin(async move {
                            Err::<String, _>(ToolError::ExecutionFailed("disk full".to_string()))
                        })
                    },
                )?
                .register(
                    Registration::new("stall", "Never finishes"),
                    |_notes, _args| {
                        Box::pin(async move {
                            std::future::pending::<()>().await;
                            Ok::<String, ToolError>(String::new())
                        })
                    },
                )?;
            Ok(())
        }
    }

    fn call(id: &str, name: &str, arguments: Vec<NamedArg>) -> ToolCall {
        ToolCall {
            id: id.to_string(),
            name: name.to_string(),
            arguments,
        }
    }

    fn setup() -> (Orchestrator, Arc<MockProvider>) {
        let provider = Arc::new(MockProvider::new());
        let orchestrator = Orchestrator::for_tool_set(
            provider.clone() as Arc<dyn ConversationProvider>,
            Arc::new(Notes),
        )
        .unwrap();
        (orchestrator, provider)
    }

    #[tokio::test]
    async fn test_simple_text_response() {
        let (orchestrator, provider) = setup();
        provider.queue_text("Hello, I'm an AI assistant!");

        let answer = orchestrator.prompt("Hello").await.unwrap();

        assert_eq!(answer, "Hello, I'm an AI assistant!");
        assert_eq!(provider.messages(), vec![Message::user("Hello")]);
        assert!(!orchestrator.is_busy());
    }

    #[tokio::test]
    async fn test_tool_call_and_response() {
        let (orchestrator, provider) = setup();
        provider.queue_calls(vec![call(
            "call_1",
            "echo",
            vec![NamedArg::new("message", "test")],
        )]);
        provider.queue_text("Done!");

        let answer = orchestrator.prompt("Echo test").await.unwrap();

        assert_eq!(answer, "Done!");
        assert_eq!(provider.resolutions("call_1"), 1);
        let messages = provider.messages();
        assert_eq!(
            messages[1],
            Message::tool_result(ToolResult::success("call_1", "test"))
        );
        assert!(orchestrator.pending_calls().is_empty());
    }

    #[tokio::test]
    async fn test_unknown_tool_and_failures_become_results() {
        let (orchestrator, provider) = setup();
        provider.queue_calls(vec![
            call("c1", "teleport", vec![]),
            call("c2", "echo", vec![]),
            call("c3", "fail", vec![]),
        ]);
        provider.queue_text("ok");

        orchestrator.prompt("go").await.unwrap();

        let messages = provider.messages();
        assert_eq!(messages[1].content, NOT_CALLABLE);
        assert!(!messages[1].is_error);
        assert!(messages[2].is_error);
        assert!(messages[2].content.contains("Missing argument"));
        assert!(messages[3].is_error);
        assert!(messages[3].content.contains("disk full"));
    }

    #[tokio::test]
    async fn test_too_many_attempts_resolves_every_call_once() {
        let (orchestrator, provider) = setup();
        for turn in 0..3 {
            provider.queue_calls(vec![
                call(&format!("t{turn}_a"), "echo", vec![NamedArg::new("message", "a")]),
                call(&format!("t{turn}_b"), "echo", vec![NamedArg::new("message", "b")]),
            ]);
        }

        let err = orchestrator
            .prompt_with(
                "loop forever",
                PromptOptions {
                    iteration_limit: Some(3),
                    force: false,
                },
            )
            .await
            .unwrap_err();

        assert!(matches!(err, OrchestratorError::TooManyAttempts(3)));
        for turn in 0..3 {
            assert_eq!(provider.resolutions(&format!("t{turn}_a")), 1);
            assert_eq!(provider.resolutions(&format!("t{turn}_b")), 1);
        }
        assert!(provider.outstanding().is_empty());
        assert!(!orchestrator.is_busy());
    }

    #[tokio::test]
    async fn test_invalid_turn_spends_an_iteration() {
        let (orchestrator, provider) = setup();
        provider.queue_turn(TurnResult::Invalid {
            reason: "garbled".to_string(),
        });
        provider.queue_text("recovered");

        assert_eq!(orchestrator.prompt("hi").await.unwrap(), "recovered");
        assert_eq!(provider.executed_turns(), 2);

        provider.queue_turn(TurnResult::Invalid {
            reason: "garbled".to_string(),
        });
        let err = orchestrator
            .prompt_with(
                "again",
                PromptOptions {
                    iteration_limit: Some(1),
                    force: false,
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, OrchestratorError::TooManyAttempts(1)));
    }

    #[tokio::test]
    async fn test_cancel_when_idle_does_not_affect_next_prompt() {
        let (orchestrator, provider) = setup();
        orchestrator.cancel().await;
        provider.queue_text("still works");

        assert_eq!(orchestrator.prompt("hi").await.unwrap(), "still works");
    }

    #[tokio::test]
    async fn test_abandoned_prompt_calls_resolved_by_next_prompt() {
        let (orchestrator, provider) = setup();
        provider.queue_calls(vec![
            call("s1", "stall", vec![]),
            call("s2", "echo", vec![NamedArg::new("message", "later")]),
        ]);
        provider.queue_text("fresh start");

        let abandoned = tokio::time::timeout(
            std::time::Duration::from_millis(20),
            orchestrator.prompt("hang"),
        )
        .await;
        assert!(abandoned.is_err());
        assert!(!orchestrator.is_busy());
        assert_eq!(orchestrator.pending_calls().len(), 2);
        assert_eq!(provider.outstanding(), vec!["s1".to_string(), "s2".to_string()]);

        assert_eq!(orchestrator.prompt("next").await.unwrap(), "fresh start");

        assert_eq!(provider.resolutions("s1"), 1);
        assert_eq!(provider.resolutions("s2"), 1);
        assert!(provider.outstanding().is_empty());
        let messages = provider.messages();
        assert_eq!(messages[1].call_id.as_deref(), Some("s1"));
        assert_eq!(messages[1].content, UNRESOLVED_REASON);
        assert_eq!(messages[2].call_id.as_deref(), Some("s2"));
        assert_eq!(messages[2].content, UNRESOLVED_REASON);
        assert_eq!(messages[3], Message::user("next"));
    }

    #[tokio::test]
    async fn test_failed_delivery_releases_and_resolves_remaining_calls() {
        let (orchestrator, provider) = setup();
        provider.queue_calls(vec![
            call("e1", "echo", vec![NamedArg::new("message", "a")]),
            call("e2", "echo", vec![NamedArg::new("message", "b")]),
        ]);
        provider.reject_result_once("e1");

        let err = orchestrator.prompt("go").await.unwrap_err();

        assert!(matches!(err, OrchestratorError::Provider(ProviderError::Other(_))));
        assert!(!orchestrator.is_busy());
        assert!(orchestrator.pending_calls().is_empty());
        assert!(provider.outstanding().is_empty());
        assert_eq!(provider.resolutions("e1"), 1);
        assert_eq!(provider.resolutions("e2"), 1);

        provider.queue_text("recovered");
        assert_eq!(orchestrator.prompt("again").await.unwrap(), "recovered");
    }

    #[tokio::test]
    async fn test_failed_turn_releases_conversation() {
        let (orchestrator, provider) = setup();
        provider.queue_error(ProviderError::InvalidResponse("model offline".to_string()));

        let err = orchestrator.prompt("hi").await.unwrap_err();

        assert!(matches!(
            err,
            OrchestratorError::Provider(ProviderError::InvalidResponse(_))
        ));
        assert!(!orchestrator.is_busy());
        assert!(provider.outstanding().is_empty());

        provider.queue_text("back online");
        assert_eq!(orchestrator.prompt("hi again").await.unwrap(), "back online");
    }

    #[tokio::test]
    async fn test_thread_created_once() {
        let (orchestrator, provider) = setup();
        provider.queue_text("one");
        provider.queue_text("two");

        orchestrator.prompt("a").await.unwrap();
        orchestrator.prompt("b").await.unwrap();

        assert_eq!(provider.threads_created(), 1);
    }

    #[tokio::test]
    async fn test_close_removes_thread() {
        let (orchestrator, provider) = setup();
        provider.queue_text("bye");
        orchestrator.prompt("a").await.unwrap();

        assert_eq!(
            orchestrator.search_history(Some("a"), None).await.unwrap(),
            HISTORY_NOT_IMPLEMENTED
        );

        orchestrator.close().await.unwrap();
        assert_eq!(provider.removed_threads(), vec!["thread_1".to_string()]);
        assert!(matches!(
            orchestrator.prompt("again").await,
            Err(OrchestratorError::Closed)
        ));
    }

    #[test]
    fn test_with_config() {
        let provider = Arc::new(MockProvider::new());
        let config = OrchestratorConfig {
            max_iterations: 3,
            instructions: "Answer in French.".to_string(),
        };
        let orchestrator = Orchestrator::new(provider, ToolCatalogView::default())
            .with_config(&config);
        assert_eq!(orchestrator.max_iterations, 3);
        assert_eq!(orchestrator.instructions, "Answer in French.");
        assert!(orchestrator.tool_definitions().is_empty());
    }
}
