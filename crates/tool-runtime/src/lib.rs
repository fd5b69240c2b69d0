pub mod tool;
pub mod registry;
pub mod view;
pub mod protocol;
pub mod provider;
pub mod conversation;
pub mod bridge;
pub mod runtime;

pub use tool::{
    Callable, FnTool, NamedArg, ParamType, ParameterSpec, ToolArgs, ToolCall, ToolDefinition,
    ToolError, ToolResult,
};
pub use registry::{catalog_for, CatalogError, Registration, ToolCatalog, ToolFn, ToolSet};
pub use view::{DispatchError, ToolCatalogView, NOT_CALLABLE};
pub use protocol::{
    fenced_content, parse_call_expression, split_preamble_target_body, unwrap_fence, ParsedCall,
    ProtocolError, TargetBody,
};
pub use provider::{ConversationProvider, Message, ProviderError, Role, TimeRange, TurnResult};
pub use conversation::Conversation;
pub use bridge::{CompletionModel, TextProtocolProvider};
pub use runtime::{Orchestrator, OrchestratorError, PendingCall, PromptOptions, INTERRUPTED};
