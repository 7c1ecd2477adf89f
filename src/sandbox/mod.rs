//! Execution sandbox: runs one untrusted script against many payloads.
//!
//! A [`Sandbox`] is built once per script: bindings are frozen and the
//! source compiled up front, then every run gets its own context, log sink
//! and cancellation signal. Runs are raced against the per-run timeout
//! (and, inside a batch, the batch deadline); whatever happens, the caller
//! gets a [`RunOutcome`] back, never an error.
//!
//! Lifecycle of a run: building → executing → resolved | rejected |
//! timed out. All three end states are terminal.

pub mod batch;
pub mod cancel;
pub mod context;
pub mod outcome;

use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::backend::{Backend, CompiledScript};
use crate::config::{SandboxOptions, MAX_SOURCE_LEN};
use crate::error::{CompileError, ConfigError};

pub use cancel::CancelSignal;
pub use context::{Bindings, Capability, ContextBuilder, ExecutionContext, FrozenBindings};
pub use outcome::{
    BatchOutcome, ErrorKind, ErrorOrigin, LogLevel, LogRecord, LogSink, RunError, RunOutcome,
    TimeoutScope,
};

/// How long a timed-out run may take to acknowledge cancellation before
/// it is abandoned.
pub const CANCEL_GRACE: Duration = Duration::from_millis(50);

/// One script, its frozen bindings and its timing policy.
pub struct Sandbox {
    options: SandboxOptions,
    builder: ContextBuilder,
    backend: Arc<dyn Backend>,
    compiled: Result<CompiledScript, CompileError>,
}

impl Sandbox {
    /// Freezes `bindings`, validates `options` and compiles `source`.
    ///
    /// Only invalid configuration fails here. A script that does not
    /// compile still yields a sandbox; each of its runs reports the
    /// compile error as its outcome.
    pub fn new(
        source: impl Into<String>,
        bindings: Bindings,
        options: SandboxOptions,
        backend: Arc<dyn Backend>,
    ) -> Result<Self, ConfigError> {
        let source = source.into();
        if source.len() > MAX_SOURCE_LEN {
            return Err(ConfigError::SourceTooLarge {
                max: MAX_SOURCE_LEN,
                actual: source.len(),
            });
        }
        options.validate()?;
        let frozen = bindings.freeze()?;

        let compiled = backend.compile(&source);
        match &compiled {
            Ok(_) => debug!(
                "Compiled {} bytes for '{}' backend ({} bindings)",
                source.len(),
                backend.name(),
                frozen.len()
            ),
            Err(e) => warn!("Script does not compile on '{}' backend: {e}", backend.name()),
        }

        Ok(Self {
            options,
            builder: ContextBuilder::new(frozen),
            backend,
            compiled,
        })
    }

    pub fn options(&self) -> &SandboxOptions {
        &self.options
    }

    pub fn backend_name(&self) -> &'static str {
        self.backend.name()
    }

    pub fn bindings(&self) -> &FrozenBindings {
        self.builder.bindings()
    }

    /// The compile error every run will report, if any.
    pub fn compile_error(&self) -> Option<&CompileError> {
        self.compiled.as_ref().err()
    }

    /// Runs the script once against `payload`. Never retried.
    pub async fn run_one(&self, payload: Value) -> RunOutcome {
        self.run(payload, None).await
    }

    /// Single run, optionally bound to a batch deadline token.
    pub(crate) async fn run(&self, payload: Value, batch: Option<&CancellationToken>) -> RunOutcome {
        let span = info_span!("run", run_id = %Uuid::new_v4(), backend = self.backend.name());
        self.execute(payload, batch).instrument(span).await
    }

    async fn execute(&self, payload: Value, batch: Option<&CancellationToken>) -> RunOutcome {
        let logs = LogSink::new();

        let script = match &self.compiled {
            Ok(script) => script,
            Err(e) => return RunOutcome::failure(logs.snapshot(), RunError::compile(e)),
        };

        let cancel = match batch {
            Some(token) => CancelSignal::child_of(token),
            None => CancelSignal::new(),
        };
        let context = match self.builder.build(payload, logs.clone(), cancel.clone()) {
            Ok(context) => context,
            Err(e) => {
                warn!("Cannot build execution context: {e}");
                let error = RunError {
                    kind: ErrorKind::Internal,
                    message: format!("cannot build execution context: {}", e.message),
                    name: e.name,
                };
                return RunOutcome::failure(logs.snapshot(), error);
            }
        };

        let mut execution = self.backend.execute(script, context);
        let deadline = tokio::time::sleep(self.options.timeout);
        tokio::pin!(deadline);
        let batch_deadline = async {
            match batch {
                Some(token) => token.cancelled().await,
                None => std::future::pending().await,
            }
        };
        tokio::pin!(batch_deadline);

        // Deadlines first: a backend that noticed the batch cancellation on
        // its own must still be reported as timed out.
        let scope = tokio::select! {
            biased;
            _ = &mut deadline => TimeoutScope::Run,
            _ = &mut batch_deadline => TimeoutScope::Batch,
            settled = &mut execution => {
                if cancel.is_cancelled() {
                    TimeoutScope::Batch
                } else {
                    return match settled {
                        Ok(value) => RunOutcome::success(logs.snapshot(), value),
                        Err(e) => {
                            debug!("Script failed: {e}");
                            RunOutcome::failure(logs.snapshot(), RunError::script(e))
                        }
                    };
                }
            }
        };

        cancel.cancel();
        if tokio::time::timeout(CANCEL_GRACE, &mut execution).await.is_err() {
            debug!("Execution still running after {CANCEL_GRACE:?} grace, dropping it");
        }
        drop(execution);

        let acknowledged = cancel.is_acknowledged();
        if acknowledged {
            info!("Script timed out ({scope:?}), cancellation acknowledged");
        } else {
            warn!("Script timed out ({scope:?}), in-flight work abandoned");
        }
        RunOutcome::failure(logs.snapshot(), RunError::timed_out(scope, acknowledged))
    }
}

impl std::fmt::Debug for Sandbox {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Sandbox")
            .field("options", &self.options)
            .field("backend", &self.backend.name())
            .field("bindings", &self.builder.bindings().len())
            .field("compiled", &self.compiled.is_ok())
            .finish()
    }
}
