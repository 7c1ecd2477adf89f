//! Native backend: scripts are async routines registered by the host.
//!
//! The source text of a sandbox names the routine to run. Routines own
//! their [`ExecutionContext`] for the duration of the run, so they can
//! mutate the payload, log, use host capabilities and watch for
//! cancellation. Since a routine is a Rust future, interrupting it is
//! always possible: on cancellation the future is dropped and the
//! interruption acknowledged.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use futures::future::BoxFuture;
use serde_json::Value;
use tracing::debug;

use super::{unit_for, Backend, CompiledScript};
use crate::error::{CompileError, ScriptError};
use crate::sandbox::ExecutionContext;

const NAME: &str = "native";

/// An async script body.
pub trait Routine: Send + Sync {
    fn call(&self, context: ExecutionContext) -> BoxFuture<'static, Result<Value, ScriptError>>;
}

impl<F, Fut> Routine for F
where
    F: Fn(ExecutionContext) -> Fut + Send + Sync,
    Fut: Future<Output = Result<Value, ScriptError>> + Send + 'static,
{
    fn call(&self, context: ExecutionContext) -> BoxFuture<'static, Result<Value, ScriptError>> {
        Box::pin(self(context))
    }
}

#[derive(Default, Clone)]
pub struct NativeBackend {
    routines: HashMap<String, Arc<dyn Routine>>,
}

impl NativeBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `routine` under `name`, replacing any previous one.
    pub fn register(mut self, name: impl Into<String>, routine: impl Routine + 'static) -> Self {
        self.routines.insert(name.into(), Arc::new(routine));
        self
    }

    pub fn routine_names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.routines.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }
}

#[async_trait]
impl Backend for NativeBackend {
    fn name(&self) -> &'static str {
        NAME
    }

    fn compile(&self, source: &str) -> Result<CompiledScript, CompileError> {
        let name = source.trim();
        let routine = self
            .routines
            .get(name)
            .ok_or_else(|| CompileError::new(format!("unknown routine '{name}'")))?;
        Ok(CompiledScript::new(NAME, Arc::clone(routine)))
    }

    async fn execute(
        &self,
        script: &CompiledScript,
        context: ExecutionContext,
    ) -> Result<Value, ScriptError> {
        let routine = Arc::clone(unit_for::<Arc<dyn Routine>>(NAME, script)?);
        let signal = context.cancel_signal().clone();
        let mut run = routine.call(context);

        // Routine first: one that watches for cancellation gets to finish
        // its own cleanup (and logging) before being dropped.
        let result = tokio::select! {
            biased;
            result = &mut run => result,
            _ = signal.cancelled() => {
                debug!("Native routine dropped on cancellation");
                Err(ScriptError::named("CancelError", "Script cancelled"))
            }
        };
        drop(run);

        if signal.is_cancelled() {
            signal.acknowledge();
        }
        result
    }
}
