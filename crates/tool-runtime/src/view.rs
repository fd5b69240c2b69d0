//! Instance-bound, merged view over a tool set and everything it embeds.

use indexmap::map::Entry;
use indexmap::IndexMap;
use serde_json::Value;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::registry::{catalog_for, CatalogError, ToolSet};
use crate::tool::{Callable, NamedArg, ToolArgs, ToolDefinition, ToolError};

/// Result text for a call naming a tool the view does not contain.
pub const NOT_CALLABLE: &str = "Not implemented or not callable";

/// Read-only set of callables visible to one agent.
///
/// Precedence on name collisions: the tool set's own tools, then its
/// additional tools, then nested views in the order given. Shadowed entries
/// are dropped without error.
#[derive(Clone, Default)]
pub struct ToolCatalogView {
    tools: IndexMap<String, Arc<dyn Callable>>,
}

impl ToolCatalogView {
    /// Build the view of `instance`: its type's catalog bound to `instance`,
    /// merged with its additional tools and nested child views.
    pub fn of<T: ToolSet>(instance: Arc<T>) -> Result<Self, CatalogError> {
        let catalog = catalog_for::<T>()?;
        let own = catalog.bind(&instance);
        let additional = instance.additional_tools();
        let nested = instance.nested()?;
        Ok(Self::merge(own, additional, nested))
    }

    /// A flat view over loose callables (first occurrence of a name wins).
    pub fn from_tools(tools: impl IntoIterator<Item = Arc<dyn Callable>>) -> Self {
        Self::merge(tools, Vec::new(), Vec::new())
    }

    fn merge(
        own: impl IntoIterator<Item = Arc<dyn Callable>>,
        additional: impl IntoIterator<Item = Arc<dyn Callable>>,
        nested: Vec<ToolCatalogView>,
    ) -> Self {
        let mut view = Self::default();
        for tool in own {
            view.insert_if_absent(tool, "own");
        }
        for tool in additional {
            view.insert_if_absent(tool, "additional");
        }
        for child in nested {
            for (_, tool) in child.tools {
                view.insert_if_absent(tool, "nested");
            }
        }
        view
    }

    fn insert_if_absent(&mut self, tool: Arc<dyn Callable>, layer: &'static str) {
        match self.tools.entry(tool.definition().name.clone()) {
            Entry::Occupied(entry) => {
                debug!(tool = %entry.key(), layer, "tool shadowed by higher-precedence entry");
            }
            Entry::Vacant(entry) => {
                entry.insert(tool);
            }
        }
    }

    pub fn get(&self, name: &str) -> Option<&Arc<dyn Callable>> {
        self.tools.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.tools.contains_key(name)
    }

    pub fn names(&self) -> Vec<&str> {
        self.tools.keys().map(String::as_str).collect()
    }

    /// Definitions in view order, for sending to the provider.
    pub fn definitions(&self) -> Vec<ToolDefinition> {
        self.tools.values().map(|t| t.definition().clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    /// Dispatch one call.
    ///
    /// An unknown tool yields `Ok(NOT_CALLABLE)` so the model can recover.
    /// Arguments are matched to declared parameters by name; the order they
    /// arrive in is irrelevant. No defaults are applied.
    pub async fn invoke(&self, name: &str, arguments: &[NamedArg]) -> Result<String, DispatchError> {
        let Some(tool) = self.tools.get(name) else {
            warn!(tool = name, "call to unknown tool");
            return Ok(NOT_CALLABLE.to_string());
        };
        let args = bind_arguments(tool.definition(), arguments)?;
        tool.invoke(args).await.map_err(|source| DispatchError::Tool {
            tool: name.to_string(),
            source,
        })
    }
}

impl fmt::Debug for ToolCatalogView {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ToolCatalogView")
            .field("tools", &self.names())
            .finish()
    }
}

/// Re-derive positional arguments from named ones using the declared order.
fn bind_arguments(
    definition: &ToolDefinition,
    arguments: &[NamedArg],
) -> Result<ToolArgs, DispatchError> {
    let mut slots: Vec<Option<Value>> = vec![None; definition.parameters.len()];
    for arg in arguments {
        let position =
            definition
                .position_of(&arg.name)
                .ok_or_else(|| DispatchError::UnknownArgument {
                    tool: definition.name.clone(),
                    argument: arg.name.clone(),
                })?;
        let param = &definition.parameters[position];
        if !param.param_type.accepts(&arg.value) {
            return Err(DispatchError::TypeMismatch {
                tool: definition.name.clone(),
                argument: arg.name.clone(),
                expected: param.param_type.as_str(),
            });
        }
        if slots[position].replace(arg.value.clone()).is_some() {
            return Err(DispatchError::DuplicateArgument {
                tool: definition.name.clone(),
                argument: arg.name.clone(),
            });
        }
    }

    let mut values = Vec::with_capacity(slots.len());
    for (slot, param) in slots.into_iter().zip(&definition.parameters) {
        match slot {
            Some(value) => values.push(value),
            None => {
                return Err(DispatchError::MissingArgument {
                    tool: definition.name.clone(),
                    argument: param.name.clone(),
                })
            }
        }
    }
    Ok(ToolArgs::new(values))
}

#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    #[error("Unknown argument '{argument}' for tool '{tool}'")]
    UnknownArgument { tool: String, argument: String },
    #[error("Missing argument '{argument}' for tool '{tool}'")]
    MissingArgument { tool: String, argument: String },
    #[error("Argument '{argument}' given twice for tool '{tool}'")]
    DuplicateArgument { tool: String, argument: String },
    #[error("Argument '{argument}' of tool '{tool}' must be a {expected}")]
    TypeMismatch {
        tool: String,
        argument: String,
        expected: &'static str,
    },
    #[error("Tool '{tool}' failed: {source}")]
    Tool {
        tool: String,
        #[source]
        source: ToolError,
    },
}
