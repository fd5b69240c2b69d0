use async_trait::async_trait;
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::fmt;
use std::future::Future;

use crate::registry::{CatalogError, Registration};

/// Primitive types allowed at the dispatch boundary.
///
/// Anything richer cannot be expressed both as a JSON Schema property and as a
/// literal in the textual call syntax, so registration rejects it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ParamType {
    String,
    Number,
    Boolean,
}

impl ParamType {
    /// Resolve a declared type name. Accepts the schema spelling plus the
    /// common Rust/Python aliases.
    pub fn from_declared(declared: &str) -> Option<Self> {
        match declared.trim() {
            "string" | "str" | "String" | "&str" => Some(Self::String),
            "number" | "int" | "float" | "integer" | "i32" | "i64" | "u32" | "u64" | "usize"
            | "f32" | "f64" => Some(Self::Number),
            "boolean" | "bool" => Some(Self::Boolean),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::String => "string",
            Self::Number => "number",
            Self::Boolean => "boolean",
        }
    }

    /// Whether a decoded argument value has this type.
    pub fn accepts(&self, value: &Value) -> bool {
        match self {
            Self::String => value.is_string(),
            Self::Number => value.is_number(),
            Self::Boolean => value.is_boolean(),
        }
    }
}

impl fmt::Display for ParamType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One declared parameter of a tool.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParameterSpec {
    pub name: String,
    #[serde(rename = "type")]
    pub param_type: ParamType,
    /// Default as written in the source, documentation only. Never applied
    /// by the dispatcher.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub default: Option<String>,
}

impl ParameterSpec {
    pub fn new(name: impl Into<String>, param_type: ParamType) -> Self {
        Self {
            name: name.into(),
            param_type,
            default: None,
        }
    }

    pub fn with_default(mut self, default: impl Into<String>) -> Self {
        self.default = Some(default.into());
        self
    }
}

/// Describes a tool's interface for LLM consumption.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolDefinition {
    /// Unique tool name within a catalog view (e.g., "write_file")
    pub name: String,
    /// Human-readable description for the LLM
    pub description: String,
    /// Declared parameters, in call order
    pub parameters: Vec<ParameterSpec>,
}

impl ToolDefinition {
    /// JSON Schema for providers with native structured tool calling.
    pub fn input_schema(&self) -> Value {
        let mut properties = Map::new();
        let mut required = Vec::new();
        for param in &self.parameters {
            let mut property = json!({ "type": param.param_type.as_str() });
            match &param.default {
                Some(default) => {
                    property["default"] = Value::String(default.clone());
                }
                None => required.push(Value::String(param.name.clone())),
            }
            properties.insert(param.name.clone(), property);
        }
        json!({
            "type": "object",
            "properties": properties,
            "required": required,
        })
    }

    /// Call signature shown to models using the text protocol,
    /// e.g. `write_file(path: string, append: boolean = false)`.
    pub fn signature(&self) -> String {
        let params: Vec<String> = self
            .parameters
            .iter()
            .map(|p| match &p.default {
                Some(default) => format!("{}: {} = {}", p.name, p.param_type, default),
                None => format!("{}: {}", p.name, p.param_type),
            })
            .collect();
        format!("{}({})", self.name, params.join(", "))
    }

    /// Position of a declared parameter.
    pub fn position_of(&self, parameter: &str) -> Option<usize> {
        self.parameters.iter().position(|p| p.name == parameter)
    }
}

impl fmt::Display for ToolDefinition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} - {}", self.signature(), self.description)
    }
}

/// One `{name, value}` argument as reported by a provider.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NamedArg {
    pub name: String,
    pub value: Value,
}

impl NamedArg {
    pub fn new(name: impl Into<String>, value: impl Into<Value>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
        }
    }
}

/// Represents an LLM requesting execution of a tool.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    /// Unique ID for this invocation (used to match results)
    pub id: String,
    /// Tool name to execute
    pub name: String,
    /// Arguments by name; order carries no meaning
    pub arguments: Vec<NamedArg>,
}

/// Result of executing a tool, sent back to the LLM.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolResult {
    /// Must match the ToolCall id
    pub tool_call_id: String,
    pub content: String,
    pub is_error: bool,
}

impl ToolResult {
    pub fn success(tool_call_id: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            tool_call_id: tool_call_id.into(),
            content: content.into(),
            is_error: false,
        }
    }

    pub fn error(tool_call_id: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            tool_call_id: tool_call_id.into(),
            content: content.into(),
            is_error: true,
        }
    }
}

/// Arguments handed to a tool implementation, already in declared order and
/// type-checked against the declared primitive types.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ToolArgs(Vec<Value>);

impl ToolArgs {
    pub fn new(values: Vec<Value>) -> Self {
        Self(values)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&Value> {
        self.0.get(index)
    }

    pub fn values(&self) -> &[Value] {
        &self.0
    }

    pub fn into_inner(self) -> Vec<Value> {
        self.0
    }

    fn require(&self, index: usize) -> Result<&Value, ToolError> {
        self.0
            .get(index)
            .ok_or_else(|| ToolError::InvalidInput(format!("missing argument at position {index}")))
    }

    pub fn string(&self, index: usize) -> Result<&str, ToolError> {
        self.require(index)?
            .as_str()
            .ok_or_else(|| ToolError::InvalidInput(format!("argument {index} is not a string")))
    }

    pub fn number(&self, index: usize) -> Result<f64, ToolError> {
        self.require(index)?
            .as_f64()
            .ok_or_else(|| ToolError::InvalidInput(format!("argument {index} is not a number")))
    }

    /// Integer view of a numeric argument; fractional values are rejected.
    pub fn integer(&self, index: usize) -> Result<i64, ToolError> {
        let value = self.require(index)?;
        if let Some(i) = value.as_i64() {
            return Ok(i);
        }
        match value.as_f64() {
            Some(f) if f.fract() == 0.0 && f.is_finite() => Ok(f as i64),
            _ => Err(ToolError::InvalidInput(format!(
                "argument {index} is not an integer"
            ))),
        }
    }

    pub fn boolean(&self, index: usize) -> Result<bool, ToolError> {
        self.require(index)?
            .as_bool()
            .ok_or_else(|| ToolError::InvalidInput(format!("argument {index} is not a boolean")))
    }
}

/// A tool bound to its receiver, ready to be invoked.
///
/// Catalog views hold these type-erased; `BoundTool` (catalog entries) and
/// `FnTool` (additional descriptors) are the two implementations.
#[async_trait]
pub trait Callable: Send + Sync {
    fn definition(&self) -> &ToolDefinition;

    /// Invoke with positional arguments in declared order.
    async fn invoke(&self, args: ToolArgs) -> Result<String, ToolError>;
}

#[derive(Debug, thiserror::Error)]
pub enum ToolError {
    #[error("Invalid input: {0}")]
    InvalidInput(String),
    #[error("Execution failed: {0}")]
    ExecutionFailed(String),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

type BoxedToolFn =
    Box<dyn Fn(ToolArgs) -> BoxFuture<'static, Result<String, ToolError>> + Send + Sync>;

/// A descriptor backed by a closure rather than a method on a tool set.
///
/// Used for capabilities added to a view at runtime, such as delegating a
/// question to a secondary knowledge source.
pub struct FnTool {
    definition: ToolDefinition,
    func: BoxedToolFn,
}

impl FnTool {
    pub fn new<F, Fut>(registration: Registration, func: F) -> Result<Self, CatalogError>
    where
        F: Fn(ToolArgs) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<String, ToolError>> + Send + 'static,
    {
        Ok(Self {
            definition: registration.into_definition()?,
            func: Box::new(move |args| -> BoxFuture<'static, Result<String, ToolError>> {
                Box::pin(func(args))
            }),
        })
    }
}

#[async_trait]
impl Callable for FnTool {
    fn definition(&self) -> &ToolDefinition {
        &self.definition
    }

    async fn invoke(&self, args: ToolArgs) -> Result<String, ToolError> {
        (self.func)(args).await
    }
}

impl fmt::Debug for FnTool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FnTool")
            .field("definition", &self.definition)
            .finish_non_exhaustive()
    }
}
