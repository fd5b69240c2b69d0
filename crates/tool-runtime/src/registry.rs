use crate::tool::{Callable, ParamType, ParameterSpec, ToolArgs, ToolDefinition, ToolError};
use async_trait::async_trait;
use futures::future::BoxFuture;
use indexmap::IndexMap;
use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, OnceLock};
use tracing::debug;

use crate::view::ToolCatalogView;

/// Unbound tool implementation. The receiver is passed explicitly at dispatch
/// time, so a descriptor never captures the instance it was registered from.
pub type ToolFn<T> = fn(Arc<T>, ToolArgs) -> BoxFuture<'static, Result<String, ToolError>>;

/// Declarative registration of one tool: wire name, description and an
/// explicit parameter schema.
#[derive(Debug, Clone)]
pub struct Registration {
    name: String,
    description: String,
    parameters: Vec<DeclaredParameter>,
}

#[derive(Debug, Clone)]
struct DeclaredParameter {
    name: String,
    declared_type: String,
    default: Option<String>,
}

impl Registration {
    pub fn new(name: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            parameters: Vec::new(),
        }
    }

    /// Declare the next parameter. `declared_type` is checked when the
    /// registration is turned into a definition.
    pub fn param(mut self, name: impl Into<String>, declared_type: impl Into<String>) -> Self {
        self.parameters.push(DeclaredParameter {
            name: name.into(),
            declared_type: declared_type.into(),
            default: None,
        });
        self
    }

    /// Declare a parameter with a default. The default is kept as source text
    /// for schemas; callers must still pass the argument.
    pub fn param_with_default(
        mut self,
        name: impl Into<String>,
        declared_type: impl Into<String>,
        default: impl Into<String>,
    ) -> Self {
        self.parameters.push(DeclaredParameter {
            name: name.into(),
            declared_type: declared_type.into(),
            default: Some(default.into()),
        });
        self
    }

    /// Replace the declared parameters with an already-typed schema.
    pub fn with_schema(mut self, schema: Vec<ParameterSpec>) -> Self {
        self.parameters = schema
            .into_iter()
            .map(|param| DeclaredParameter {
                name: param.name,
                declared_type: param.param_type.as_str().to_string(),
                default: param.default,
            })
            .collect();
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Validate the declared schema and build the definition.
    pub fn into_definition(self) -> Result<ToolDefinition, CatalogError> {
        let mut parameters: Vec<ParameterSpec> = Vec::with_capacity(self.parameters.len());
        for declared in self.parameters {
            let param_type = ParamType::from_declared(&declared.declared_type).ok_or_else(|| {
                CatalogError::UnsupportedParameterType {
                    tool: self.name.clone(),
                    parameter: declared.name.clone(),
                    declared: declared.declared_type.clone(),
                }
            })?;
            if parameters.iter().any(|p| p.name == declared.name) {
                return Err(CatalogError::DuplicateParameter {
                    tool: self.name.clone(),
                    parameter: declared.name,
                });
            }
            parameters.push(ParameterSpec {
                name: declared.name,
                param_type,
                default: declared.default,
            });
        }
        Ok(ToolDefinition {
            name: self.name,
            description: self.description,
            parameters,
        })
    }
}

/// A registered tool: its definition plus the unbound implementation.
pub struct CallableDescriptor<T> {
    definition: ToolDefinition,
    func: ToolFn<T>,
}

impl<T> CallableDescriptor<T> {
    pub fn definition(&self) -> &ToolDefinition {
        &self.definition
    }
}

impl<T> Clone for CallableDescriptor<T> {
    fn clone(&self) -> Self {
        Self {
            definition: self.definition.clone(),
            func: self.func,
        }
    }
}

/// A descriptor bound to a concrete receiver.
pub struct BoundTool<T> {
    descriptor: CallableDescriptor<T>,
    receiver: Arc<T>,
}

#[async_trait]
impl<T: Send + Sync + 'static> Callable for BoundTool<T> {
    fn definition(&self) -> &ToolDefinition {
        &self.descriptor.definition
    }

    async fn invoke(&self, args: ToolArgs) -> Result<String, ToolError> {
        (self.descriptor.func)(Arc::clone(&self.receiver), args).await
    }
}

/// The tools one type exposes, keyed by name in registration order.
/// Immutable once built; shared by every instance of `T`.
pub struct ToolCatalog<T> {
    entries: IndexMap<String, CallableDescriptor<T>>,
}

impl<T: Send + Sync + 'static> ToolCatalog<T> {
    pub fn new() -> Self {
        Self {
            entries: IndexMap::new(),
        }
    }

    /// Register a tool. Returns error if the name is already registered or the
    /// schema declares an unsupported type.
    pub fn register(
        &mut self,
        registration: Registration,
        func: ToolFn<T>,
    ) -> Result<&mut Self, CatalogError> {
        let definition = registration.into_definition()?;
        if self.entries.contains_key(&definition.name) {
            return Err(CatalogError::DuplicateName(definition.name));
        }
        debug!(tool = %definition.name, params = definition.parameters.len(), "registered tool");
        self.entries
            .insert(definition.name.clone(), CallableDescriptor { definition, func });
        Ok(self)
    }

    /// Look up a descriptor by name.
    pub fn get(&self, name: &str) -> Option<&CallableDescriptor<T>> {
        self.entries.get(name)
    }

    /// All definitions, in registration order.
    pub fn definitions(&self) -> Vec<ToolDefinition> {
        self.entries.values().map(|d| d.definition.clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Bind every descriptor to `receiver`.
    pub fn bind(&self, receiver: &Arc<T>) -> Vec<Arc<dyn Callable>> {
        self.entries
            .values()
            .map(|descriptor| {
                Arc::new(BoundTool {
                    descriptor: descriptor.clone(),
                    receiver: Arc::clone(receiver),
                }) as Arc<dyn Callable>
            })
            .collect()
    }
}

impl<T: Send + Sync + 'static> Default for ToolCatalog<T> {
    fn default() -> Self {
        Self::new()
    }
}

/// A type exposing tools to the model.
///
/// `register_tools` runs once per type; the resulting catalog is cached and
/// shared by all instances. `additional_tools` and `nested` are per-instance
/// and consulted each time a view is built.
pub trait ToolSet: Send + Sync + Sized + 'static {
    fn register_tools(catalog: &mut ToolCatalog<Self>) -> Result<(), CatalogError>;

    /// Descriptors added at runtime (e.g. a synthetic delegation capability).
    fn additional_tools(&self) -> Vec<Arc<dyn Callable>> {
        Vec::new()
    }

    /// Views of embedded child tool sets. Build each from the child's own
    /// `Arc` so its entries stay bound to the child.
    fn nested(&self) -> Result<Vec<ToolCatalogView>, CatalogError> {
        Ok(Vec::new())
    }
}

type CatalogCache = Mutex<HashMap<TypeId, Arc<dyn Any + Send + Sync>>>;

fn catalog_cache() -> &'static CatalogCache {
    static CATALOGS: OnceLock<CatalogCache> = OnceLock::new();
    CATALOGS.get_or_init(|| Mutex::new(HashMap::new()))
}

/// The shared catalog of `T`, built on first use.
pub fn catalog_for<T: ToolSet>() -> Result<Arc<ToolCatalog<T>>, CatalogError> {
    let key = TypeId::of::<T>();
    let cached = catalog_cache()
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
        .get(&key)
        .cloned();
    if let Some(catalog) = cached.and_then(|c| c.downcast::<ToolCatalog<T>>().ok()) {
        return Ok(catalog);
    }

    // Built outside the lock: registration may itself resolve other catalogs.
    let mut catalog = ToolCatalog::new();
    T::register_tools(&mut catalog)?;
    debug!(
        tool_set = std::any::type_name::<T>(),
        tools = catalog.len(),
        "built tool catalog"
    );

    let mut cache = catalog_cache()
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner());
    let entry = cache
        .entry(key)
        .or_insert_with(|| Arc::new(catalog) as Arc<dyn Any + Send + Sync>);
    Arc::clone(entry)
        .downcast::<ToolCatalog<T>>()
        .map_err(|_| CatalogError::CacheCorrupted(std::any::type_name::<T>()))
}

#[derive(Debug, thiserror::Error)]
pub enum CatalogError {
    #[error("Tool with name '{0}' is already registered")]
    DuplicateName(String),
    #[error("Unsupported type '{declared}' for parameter '{parameter}' of tool '{tool}' (expected string, number or boolean)")]
    UnsupportedParameterType {
        tool: String,
        parameter: String,
        declared: String,
    },
    #[error("Parameter '{parameter}' declared twice on tool '{tool}'")]
    DuplicateParameter { tool: String, parameter: String },
    #[error("Catalog cache holds a foreign entry for {0}")]
    CacheCorrupted(&'static str),
}
