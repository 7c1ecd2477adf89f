//! Sandboxed execution of untrusted scripts.
//!
//! A [`Sandbox`] pairs one script with a set of frozen capability
//! [`Bindings`] and runs it against payloads, alone or in batches, under a
//! per-run timeout, an optional batch deadline and a concurrency cap. Every
//! run ends in a [`RunOutcome`] carrying the captured console logs and
//! either a result or a classified [`RunError`].
//!
//! Script execution is delegated to a [`Backend`]: [`JsBackend`] evaluates
//! JavaScript in an embedded engine, [`NativeBackend`] runs async Rust
//! routines registered by the host.

pub mod backend;
pub mod capabilities;
pub mod config;
pub mod error;
pub mod sandbox;

pub use backend::{Backend, CompiledScript, JsBackend, NativeBackend, Routine};
pub use config::{Config, DurationSpec, SandboxOptions, DEFAULT_TIMEOUT};
pub use error::{CompileError, ConfigError, ScriptError};
pub use sandbox::{
    BatchOutcome, Bindings, CancelSignal, Capability, ErrorKind, ErrorOrigin, ExecutionContext,
    LogLevel, LogRecord, RunError, RunOutcome, Sandbox, TimeoutScope,
};
