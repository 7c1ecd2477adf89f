//! Capability bindings and the per-run execution context.
//!
//! Bindings are assembled by the host, then frozen once when the sandbox
//! is built: after that they are only reachable through shared references
//! and every run sees the very same values. Backends that materialize
//! bindings inside an interpreter must keep them immutable there as well
//! (the JavaScript backend deep-freezes them).
//!
//! Anything that needs per-run mutable state is declared as a
//! [`Capability::PerRun`] factory and instantiated fresh for every run.

use std::any::Any;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;

use serde_json::{Map, Value};

use super::cancel::CancelSignal;
use super::outcome::LogSink;
use crate::error::{ConfigError, ScriptError};

/// Names the sandbox injects itself; bindings may not shadow them.
pub const RESERVED_NAMES: &[&str] = &["payload", "console", "globalThis", "undefined"];

/// Prefix reserved for sandbox internals inside interpreters.
pub const INTERNAL_PREFIX: &str = "__sb";

pub type HostObject = Arc<dyn Any + Send + Sync>;
pub type InstanceFactory = Arc<dyn Fn() -> Box<dyn Any + Send + Sync> + Send + Sync>;

/// A value exposed to scripts under a name.
#[derive(Clone)]
pub enum Capability {
    /// Plain data, visible read-only.
    Data(Value),
    /// Script-language source evaluating to a library object or function.
    Module(String),
    /// Host-side service usable by native routines (e.g. an HTTP client).
    Host(HostObject),
    /// Stateful helper instantiated fresh for each run.
    PerRun(InstanceFactory),
}

impl fmt::Debug for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Capability::Data(value) => f.debug_tuple("Data").field(value).finish(),
            Capability::Module(source) => f
                .debug_tuple("Module")
                .field(&format!("{} bytes", source.len()))
                .finish(),
            Capability::Host(_) => f.write_str("Host(..)"),
            Capability::PerRun(_) => f.write_str("PerRun(..)"),
        }
    }
}

// ── Bindings ─────────────────────────────────────────────

/// Host-provided capability bindings, still open for additions.
#[derive(Debug, Clone, Default)]
pub struct Bindings {
    entries: BTreeMap<String, Capability>,
}

impl Bindings {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, name: impl Into<String>, capability: Capability) {
        self.entries.insert(name.into(), capability);
    }

    pub fn data(mut self, name: impl Into<String>, value: Value) -> Self {
        self.insert(name, Capability::Data(value));
        self
    }

    pub fn module(mut self, name: impl Into<String>, source: impl Into<String>) -> Self {
        self.insert(name, Capability::Module(source.into()));
        self
    }

    pub fn host<T: Any + Send + Sync>(mut self, name: impl Into<String>, object: T) -> Self {
        self.insert(name, Capability::Host(Arc::new(object)));
        self
    }

    pub fn per_run<T, F>(mut self, name: impl Into<String>, factory: F) -> Self
    where
        T: Any + Send + Sync,
        F: Fn() -> T + Send + Sync + 'static,
    {
        let factory: InstanceFactory =
            Arc::new(move || Box::new(factory()) as Box<dyn Any + Send + Sync>);
        self.insert(name, Capability::PerRun(factory));
        self
    }

    /// Adds every binding of `other`, which wins on name clashes.
    pub fn merge(mut self, other: Bindings) -> Self {
        self.entries.extend(other.entries);
        self
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Validates names and seals the bindings for sharing across runs.
    pub fn freeze(self) -> Result<FrozenBindings, ConfigError> {
        for name in self.entries.keys() {
            validate_name(name)?;
        }
        Ok(FrozenBindings {
            entries: Arc::new(self.entries),
        })
    }
}

pub(crate) fn validate_name(name: &str) -> Result<(), ConfigError> {
    let mut chars = name.chars();
    let valid_start = chars
        .next()
        .is_some_and(|c| c.is_ascii_alphabetic() || c == '_' || c == '$');
    let valid_rest = chars.all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '$');
    if !valid_start || !valid_rest {
        return Err(ConfigError::InvalidBindingName(name.to_string()));
    }
    if RESERVED_NAMES.contains(&name) || name.starts_with(INTERNAL_PREFIX) {
        return Err(ConfigError::ReservedBindingName(name.to_string()));
    }
    Ok(())
}

/// Immutable bindings shared by every run of a sandbox.
#[derive(Debug, Clone)]
pub struct FrozenBindings {
    entries: Arc<BTreeMap<String, Capability>>,
}

impl FrozenBindings {
    pub fn get(&self, name: &str) -> Option<&Capability> {
        self.entries.get(name)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Capability)> {
        self.entries.iter().map(|(name, cap)| (name.as_str(), cap))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Whether `other` is the very same frozen set (not just equal).
    pub fn same_as(&self, other: &FrozenBindings) -> bool {
        Arc::ptr_eq(&self.entries, &other.entries)
    }
}

// ── Execution context ────────────────────────────────────

/// Everything a backend gets for one run.
///
/// The payload is owned by the run and freely mutable; bindings are shared
/// and read-only; per-run instances are private to this context.
pub struct ExecutionContext {
    bindings: FrozenBindings,
    instances: HashMap<String, Box<dyn Any + Send + Sync>>,
    payload: Value,
    logs: LogSink,
    cancel: CancelSignal,
}

impl ExecutionContext {
    pub fn bindings(&self) -> &FrozenBindings {
        &self.bindings
    }

    pub fn data(&self, name: &str) -> Option<&Value> {
        match self.bindings.get(name)? {
            Capability::Data(value) => Some(value),
            _ => None,
        }
    }

    /// Typed access to a host capability.
    pub fn host<T: Any + Send + Sync>(&self, name: &str) -> Option<&T> {
        match self.bindings.get(name)? {
            Capability::Host(object) => object.downcast_ref::<T>(),
            _ => None,
        }
    }

    /// Typed access to this run's own instance of a per-run capability.
    pub fn instance_mut<T: Any + Send + Sync>(&mut self, name: &str) -> Option<&mut T> {
        self.instances.get_mut(name)?.downcast_mut::<T>()
    }

    pub fn payload(&self) -> &Value {
        &self.payload
    }

    pub fn payload_mut(&mut self) -> &mut Value {
        &mut self.payload
    }

    pub fn logs(&self) -> &LogSink {
        &self.logs
    }

    pub fn cancel_signal(&self) -> &CancelSignal {
        &self.cancel
    }

    /// Resolves when the orchestrator asks this run to stop.
    pub async fn cancelled(&self) {
        self.cancel.cancelled().await;
    }
}

impl fmt::Debug for ExecutionContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExecutionContext")
            .field("bindings", &self.bindings.len())
            .field("instances", &self.instances.keys().collect::<Vec<_>>())
            .field("payload", &self.payload)
            .field("logs", &self.logs.len())
            .finish()
    }
}

/// Assembles per-run contexts from a sandbox's frozen bindings.
#[derive(Debug, Clone)]
pub struct ContextBuilder {
    bindings: FrozenBindings,
}

impl ContextBuilder {
    pub fn new(bindings: FrozenBindings) -> Self {
        Self { bindings }
    }

    pub fn bindings(&self) -> &FrozenBindings {
        &self.bindings
    }

    /// Builds the context for one run.
    ///
    /// The payload must be a JSON object (its fields are what scripts
    /// read); `null` stands for an empty payload.
    pub fn build(
        &self,
        payload: Value,
        logs: LogSink,
        cancel: CancelSignal,
    ) -> Result<ExecutionContext, ScriptError> {
        let payload = match payload {
            Value::Null => Value::Object(Map::new()),
            Value::Object(fields) => Value::Object(fields),
            other => {
                return Err(ScriptError::named(
                    "TypeError",
                    format!("payload must be an object, got {}", json_type_name(&other)),
                ));
            }
        };

        let instances = self
            .bindings
            .iter()
            .filter_map(|(name, cap)| match cap {
                Capability::PerRun(factory) => Some((name.to_string(), factory())),
                _ => None,
            })
            .collect();

        Ok(ExecutionContext {
            bindings: self.bindings.clone(),
            instances,
            payload,
            logs,
            cancel,
        })
    }
}

fn json_type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
