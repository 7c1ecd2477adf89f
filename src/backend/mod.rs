//! `Backend` trait, the abstraction over script interpreters.
//!
//! The orchestrator only ever talks to this trait, so interpreters are
//! interchangeable:
//! - **js**: JavaScript on `boa_engine`, a fresh realm per run
//! - **native**: host-registered async routines, fully cancellable

pub mod js;
pub mod native;

use std::any::Any;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use crate::error::{CompileError, ScriptError};
use crate::sandbox::ExecutionContext;

pub use js::JsBackend;
pub use native::{NativeBackend, Routine};

/// Backend-specific runnable unit, compiled once per sandbox.
#[derive(Clone)]
pub struct CompiledScript {
    backend: &'static str,
    unit: Arc<dyn Any + Send + Sync>,
}

impl CompiledScript {
    pub fn new<T: Any + Send + Sync>(backend: &'static str, unit: T) -> Self {
        Self {
            backend,
            unit: Arc::new(unit),
        }
    }

    /// Name of the backend that produced this unit.
    pub fn backend(&self) -> &'static str {
        self.backend
    }

    pub fn downcast_ref<T: Any + Send + Sync>(&self) -> Option<&T> {
        self.unit.downcast_ref::<T>()
    }
}

impl fmt::Debug for CompiledScript {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CompiledScript")
            .field("backend", &self.backend)
            .finish_non_exhaustive()
    }
}

/// An interpreter able to run untrusted scripts in isolation.
///
/// `execute` must honor the context's [`CancelSignal`](crate::CancelSignal):
/// when it fires, stop as soon as possible and call `acknowledge()` only if
/// the in-flight work was really interrupted. Console output goes to the
/// context's log sink.
#[async_trait]
pub trait Backend: Send + Sync {
    /// Short identifier, e.g. `"js"`.
    fn name(&self) -> &'static str;

    /// Turns source text into a reusable unit. Must not block for long.
    fn compile(&self, source: &str) -> Result<CompiledScript, CompileError>;

    /// Runs `script` against `context`, returning the settled value.
    async fn execute(
        &self,
        script: &CompiledScript,
        context: ExecutionContext,
    ) -> Result<Value, ScriptError>;
}

/// Rejects a unit compiled by some other backend.
pub(crate) fn unit_for<'a, T: Any + Send + Sync>(
    backend: &'static str,
    script: &'a CompiledScript,
) -> Result<&'a T, ScriptError> {
    script.downcast_ref::<T>().ok_or_else(|| {
        ScriptError::new(format!(
            "script was compiled by the '{}' backend, cannot run on '{backend}'",
            script.backend()
        ))
    })
}
