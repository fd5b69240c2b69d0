//! Bridge adapter: drives a plain completion model through the text protocol.
//!
//! `CompletionModel` is the minimal non-streaming interface (messages in,
//! text out). `TextProtocolProvider` wraps one into a `ConversationProvider`
//! by keeping the thread history itself, teaching the model the `TARGET`
//! convention in the system prompt and parsing each response into either a
//! final answer or a single tool call.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};
use tracing::{debug, warn};

use chatloop_core::ModelConfig;

use crate::conversation::Conversation;
use crate::protocol::{
    parse_call_expression, split_preamble_target_body, unwrap_fence, ERROR_PREFIX,
    RESULT_PREFIX, SYSTEM_CHANNEL, TARGET_KEYWORD, USER_CHANNEL,
};
use crate::provider::{ConversationProvider, Message, ProviderError, Role, TimeRange, TurnResult};
use crate::tool::{NamedArg, ToolCall, ToolDefinition};

/// Minimal non-streaming LLM interface.
#[async_trait]
pub trait CompletionModel: Send + Sync {
    /// Send a chat completion request and return the assistant's response text.
    async fn complete(
        &self,
        messages: Vec<Message>,
        temperature: f32,
        max_tokens: u32,
    ) -> Result<String, ProviderError>;
}

struct ThreadState {
    conversation: Conversation,
    tools: Vec<ToolDefinition>,
    outstanding: Vec<String>,
}

impl ThreadState {
    fn feedback(&mut self, reason: &str) {
        self.conversation
            .push(Message::user(format!("{ERROR_PREFIX} {reason}")));
    }
}

/// Wraps a `CompletionModel` into a `ConversationProvider`.
pub struct TextProtocolProvider {
    model: Box<dyn CompletionModel>,
    name: String,
    temperature: f32,
    max_tokens: u32,
    threads: Mutex<HashMap<String, ThreadState>>,
}

impl TextProtocolProvider {
    pub fn new(model: Box<dyn CompletionModel>, name: impl Into<String>) -> Self {
        let defaults = ModelConfig::default();
        Self {
            model,
            name: name.into(),
            temperature: defaults.temperature,
            max_tokens: defaults.max_tokens,
            threads: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_config(mut self, config: &ModelConfig) -> Self {
        self.temperature = config.temperature;
        self.max_tokens = config.max_tokens;
        self
    }

    fn threads(&self) -> MutexGuard<'_, HashMap<String, ThreadState>> {
        self.threads.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Turn one model response into a turn result, recording feedback on the
    /// thread when the response cannot be used.
    fn interpret(thread: &mut ThreadState, response: &str) -> TurnResult {
        let parts = split_preamble_target_body(response);
        match parts.target.as_deref() {
            None | Some(USER_CHANNEL) => {
                TurnResult::Final(Message::assistant(unwrap_fence(&parts.body)))
            }
            Some(SYSTEM_CHANNEL) => match Self::build_call(thread, &parts.body) {
                Ok(call) => {
                    thread.outstanding.push(call.id.clone());
                    TurnResult::ToolCalls(vec![call])
                }
                Err(reason) => {
                    thread.feedback(&reason);
                    TurnResult::Invalid { reason }
                }
            },
            Some(other) => {
                let reason = format!(
                    "unknown target `{other}`; use `{TARGET_KEYWORD} {USER_CHANNEL}` or `{TARGET_KEYWORD} {SYSTEM_CHANNEL}`"
                );
                thread.feedback(&reason);
                TurnResult::Invalid { reason }
            }
        }
    }

    fn build_call(thread: &ThreadState, body: &str) -> Result<ToolCall, String> {
        let parsed = parse_call_expression(&unwrap_fence(body)).map_err(|e| e.to_string())?;

        let arguments = match thread.tools.iter().find(|t| t.name == parsed.name) {
            Some(def) => {
                if parsed.arguments.len() > def.parameters.len() {
                    return Err(format!(
                        "`{}` takes {} argument(s) but {} were given",
                        def.name,
                        def.parameters.len(),
                        parsed.arguments.len()
                    ));
                }
                def.parameters
                    .iter()
                    .zip(parsed.arguments)
                    .map(|(p, v)| NamedArg::new(p.name.clone(), v))
                    .collect()
            }
            // Passed through so dispatch answers for the unknown name.
            None => parsed
                .arguments
                .into_iter()
                .enumerate()
                .map(|(i, v)| NamedArg::new(format!("arg{i}"), v))
                .collect(),
        };

        Ok(ToolCall {
            id: format!("call_{}", uuid::Uuid::new_v4().simple()),
            name: parsed.name,
            arguments,
        })
    }
}

/// System prompt teaching the text protocol.
pub fn render_instructions(instructions: &str, tools: &[ToolDefinition]) -> String {
    let mut prompt = String::new();
    if !instructions.trim().is_empty() {
        prompt.push_str(instructions.trim());
        prompt.push_str("\n\n");
    }
    prompt.push_str(&format!(
        "Begin every reply with a line naming who it is for:\n\
         {TARGET_KEYWORD} {USER_CHANNEL} - the rest of the reply is your answer to the user.\n\
         {TARGET_KEYWORD} {SYSTEM_CHANNEL} - the rest of the reply is exactly one tool call.\n\
         \n\
         A tool call looks like name(arg1, arg2). Arguments are JSON literals. \
         Put multi-line text in backticks instead of quotes, for example:\n\
         write_file(\"notes.md\", `first line\nsecond line`)\n\
         \n\
         Tool output comes back on a line starting with {RESULT_PREFIX}; \
         failures and malformed replies start with {ERROR_PREFIX}.\n"
    ));
    if tools.is_empty() {
        prompt.push_str("\nNo tools are available.");
    } else {
        prompt.push_str("\nAvailable tools:");
        for tool in tools {
            prompt.push_str(&format!("\n- {tool}"));
        }
    }
    prompt
}

#[async_trait]
impl ConversationProvider for TextProtocolProvider {
    async fn create_thread(
        &self,
        instructions: &str,
        tools: &[ToolDefinition],
    ) -> Result<String, ProviderError> {
        let id = uuid::Uuid::new_v4().to_string();
        let conversation =
            Conversation::new().with_system_prompt(render_instructions(instructions, tools));
        self.threads().insert(
            id.clone(),
            ThreadState {
                conversation,
                tools: tools.to_vec(),
                outstanding: Vec::new(),
            },
        );
        debug!(thread = %id, tools = tools.len(), "Created text-protocol thread");
        Ok(id)
    }

    async fn add_message(&self, thread_id: &str, message: Message) -> Result<(), ProviderError> {
        let mut threads = self.threads();
        let thread = threads
            .get_mut(thread_id)
            .ok_or_else(|| ProviderError::UnknownThread(thread_id.to_string()))?;

        match message.role {
            Role::User if !thread.outstanding.is_empty() => Err(ProviderError::PendingCalls {
                thread_id: thread_id.to_string(),
                pending: thread.outstanding.len(),
            }),
            Role::Tool => {
                let id = message.call_id.as_deref().unwrap_or_default();
                let pos = thread
                    .outstanding
                    .iter()
                    .position(|o| o == id)
                    .ok_or_else(|| ProviderError::UnknownCall(id.to_string()))?;
                thread.outstanding.remove(pos);
                let prefix = if message.is_error { ERROR_PREFIX } else { RESULT_PREFIX };
                thread
                    .conversation
                    .push(Message::user(format!("{prefix} {}", message.content)));
                Ok(())
            }
            _ => {
                thread.conversation.push(message);
                Ok(())
            }
        }
    }

    async fn execute_turn(&self, thread_id: &str) -> Result<TurnResult, ProviderError> {
        let messages = {
            let threads = self.threads();
            let thread = threads
                .get(thread_id)
                .ok_or_else(|| ProviderError::UnknownThread(thread_id.to_string()))?;
            if !thread.outstanding.is_empty() {
                return Err(ProviderError::PendingCalls {
                    thread_id: thread_id.to_string(),
                    pending: thread.outstanding.len(),
                });
            }
            thread.conversation.messages()
        };

        let response = self
            .model
            .complete(messages, self.temperature, self.max_tokens)
            .await?;

        let mut threads = self.threads();
        let thread = threads
            .get_mut(thread_id)
            .ok_or_else(|| ProviderError::UnknownThread(thread_id.to_string()))?;
        thread.conversation.push(Message::assistant(response.clone()));

        let turn = Self::interpret(thread, &response);
        match &turn {
            TurnResult::Final(_) => debug!(thread = %thread_id, "Model answered"),
            TurnResult::ToolCalls(calls) => {
                debug!(thread = %thread_id, tool = %calls[0].name, "Model requested a tool")
            }
            TurnResult::Invalid { reason } => {
                warn!(thread = %thread_id, reason = %reason, "Unusable model response")
            }
        }
        Ok(turn)
    }

    async fn remove_thread(&self, thread_id: &str) -> Result<(), ProviderError> {
        self.threads()
            .remove(thread_id)
            .map(|_| ())
            .ok_or_else(|| ProviderError::UnknownThread(thread_id.to_string()))
    }

    async fn search_history(
        &self,
        thread_id: &str,
        text: Option<&str>,
        range: Option<TimeRange>,
    ) -> Result<String, ProviderError> {
        let threads = self.threads();
        let thread = threads
            .get(thread_id)
            .ok_or_else(|| ProviderError::UnknownThread(thread_id.to_string()))?;
        Ok(thread.conversation.render_search(text, range))
    }

    fn provider_name(&self) -> &str {
        &self.name
    }
}
