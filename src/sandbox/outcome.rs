//! Outcome model: what a run produced, uniformly shaped.
//!
//! Every run ends in a [`RunOutcome`] carrying the console records it
//! emitted plus exactly one of a result value or a [`RunError`]. Timeouts,
//! compile failures and script exceptions all land in the same shape so
//! callers never have to catch anything.

use std::fmt;
use std::sync::{Arc, Mutex};

use serde::Serialize;
use serde_json::Value;

use crate::error::{CompileError, ScriptError};

// ── Log records ──────────────────────────────────────────

/// Console method a record was emitted with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Log,
    Info,
    Debug,
    Warn,
    Error,
}

impl LogLevel {
    pub const ALL: [LogLevel; 5] = [
        LogLevel::Log,
        LogLevel::Info,
        LogLevel::Debug,
        LogLevel::Warn,
        LogLevel::Error,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Log => "log",
            LogLevel::Info => "info",
            LogLevel::Debug => "debug",
            LogLevel::Warn => "warn",
            LogLevel::Error => "error",
        }
    }

    pub fn parse(level: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|l| l.as_str() == level)
    }
}

/// One console call made by a script.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LogRecord {
    pub level: LogLevel,
    pub data: Vec<Value>,
}

impl LogRecord {
    pub fn new(level: LogLevel, data: Vec<Value>) -> Self {
        Self { level, data }
    }
}

/// Append-only, per-run collector of console records.
///
/// Clones share the same buffer. A sink is created for each run and never
/// handed to another one.
#[derive(Debug, Clone, Default)]
pub struct LogSink {
    records: Arc<Mutex<Vec<LogRecord>>>,
}

impl LogSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, level: LogLevel, data: Vec<Value>) {
        self.lock().push(LogRecord::new(level, data));
    }

    pub fn log(&self, data: Vec<Value>) {
        self.push(LogLevel::Log, data);
    }

    pub fn info(&self, data: Vec<Value>) {
        self.push(LogLevel::Info, data);
    }

    pub fn debug(&self, data: Vec<Value>) {
        self.push(LogLevel::Debug, data);
    }

    pub fn warn(&self, data: Vec<Value>) {
        self.push(LogLevel::Warn, data);
    }

    pub fn error(&self, data: Vec<Value>) {
        self.push(LogLevel::Error, data);
    }

    pub fn extend(&self, records: impl IntoIterator<Item = LogRecord>) {
        self.lock().extend(records);
    }

    /// Copy of the records collected so far, in call order.
    pub fn snapshot(&self) -> Vec<LogRecord> {
        self.lock().clone()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<LogRecord>> {
        // Records are append-only, a poisoned buffer is still consistent.
        self.records.lock().unwrap_or_else(|e| e.into_inner())
    }
}

// ── Failure descriptor ───────────────────────────────────

/// Where a failure came from.
///
/// `Script` failures are the author's bug and should be shown to them;
/// `Sandbox` failures are infrastructure and may justify retrying the
/// surrounding workflow (never the script itself).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorOrigin {
    Script,
    Sandbox,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Source could not be compiled.
    Compile,
    /// The script threw or its asynchronous result rejected.
    Script,
    /// The time budget elapsed; in-flight work was abandoned.
    Timeout,
    /// The time budget elapsed and the backend confirmed the interruption.
    Cancelled,
    /// The batch deadline passed before this item was started.
    NotStarted,
    /// The sandbox itself failed (e.g. a backend worker crashed).
    Internal,
}

impl ErrorKind {
    pub fn origin(&self) -> ErrorOrigin {
        match self {
            ErrorKind::Script => ErrorOrigin::Script,
            _ => ErrorOrigin::Sandbox,
        }
    }
}

/// Which budget a timeout was charged against.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeoutScope {
    Run,
    Batch,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RunError {
    pub kind: ErrorKind,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

impl RunError {
    pub fn compile(err: &CompileError) -> Self {
        Self {
            kind: ErrorKind::Compile,
            message: err.message.clone(),
            name: Some("CompileError".to_string()),
        }
    }

    pub fn script(err: ScriptError) -> Self {
        Self {
            kind: ErrorKind::Script,
            message: err.message,
            name: err.name,
        }
    }

    pub fn timed_out(scope: TimeoutScope, cancelled: bool) -> Self {
        let mut message = if cancelled {
            "Script timed out and cancelled".to_string()
        } else {
            "Script timed out".to_string()
        };
        if scope == TimeoutScope::Batch {
            message.push_str(" (batch deadline exceeded)");
        }
        Self {
            kind: if cancelled {
                ErrorKind::Cancelled
            } else {
                ErrorKind::Timeout
            },
            message,
            name: None,
        }
    }

    pub fn not_started() -> Self {
        Self {
            kind: ErrorKind::NotStarted,
            message: "Script not started: batch deadline exceeded".to_string(),
            name: None,
        }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self {
            kind: ErrorKind::Internal,
            message: message.into(),
            name: None,
        }
    }

    pub fn origin(&self) -> ErrorOrigin {
        self.kind.origin()
    }

    /// True for both plain and acknowledged-cancellation timeouts.
    pub fn is_timeout(&self) -> bool {
        matches!(self.kind, ErrorKind::Timeout | ErrorKind::Cancelled)
    }
}

impl fmt::Display for RunError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.name {
            Some(name) => write!(f, "{name}: {}", self.message),
            None => f.write_str(&self.message),
        }
    }
}

// ── Outcomes ─────────────────────────────────────────────

/// How one run ended.
///
/// Exactly one of [`result`](Self::result) and [`error`](Self::error) is
/// populated; the constructors are the only way to build one.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RunOutcome {
    logs: Vec<LogRecord>,
    #[serde(skip_serializing_if = "Option::is_none")]
    result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<RunError>,
}

impl RunOutcome {
    /// A settled run. `undefined`-like results are carried as `Value::Null`.
    pub fn success(logs: Vec<LogRecord>, result: Value) -> Self {
        Self {
            logs,
            result: Some(result),
            error: None,
        }
    }

    pub fn failure(logs: Vec<LogRecord>, error: RunError) -> Self {
        Self {
            logs,
            result: None,
            error: Some(error),
        }
    }

    pub fn logs(&self) -> &[LogRecord] {
        &self.logs
    }

    pub fn result(&self) -> Option<&Value> {
        self.result.as_ref()
    }

    pub fn error(&self) -> Option<&RunError> {
        self.error.as_ref()
    }

    pub fn is_success(&self) -> bool {
        self.error.is_none()
    }

    pub fn into_parts(self) -> (Vec<LogRecord>, Result<Value, RunError>) {
        let result = match (self.result, self.error) {
            (_, Some(error)) => Err(error),
            (Some(value), None) => Ok(value),
            (None, None) => Ok(Value::Null),
        };
        (self.logs, result)
    }
}

/// Outcomes of a batch, index-aligned with the input payloads.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(transparent)]
pub struct BatchOutcome {
    outcomes: Vec<RunOutcome>,
}

impl BatchOutcome {
    pub(crate) fn new(outcomes: Vec<RunOutcome>) -> Self {
        Self { outcomes }
    }

    pub fn len(&self) -> usize {
        self.outcomes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.outcomes.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&RunOutcome> {
        self.outcomes.get(index)
    }

    pub fn iter(&self) -> std::slice::Iter<'_, RunOutcome> {
        self.outcomes.iter()
    }

    pub fn succeeded(&self) -> usize {
        self.outcomes.iter().filter(|o| o.is_success()).count()
    }

    pub fn into_vec(self) -> Vec<RunOutcome> {
        self.outcomes
    }
}

impl std::ops::Index<usize> for BatchOutcome {
    type Output = RunOutcome;

    fn index(&self, index: usize) -> &RunOutcome {
        &self.outcomes[index]
    }
}

impl IntoIterator for BatchOutcome {
    type Item = RunOutcome;
    type IntoIter = std::vec::IntoIter<RunOutcome>;

    fn into_iter(self) -> Self::IntoIter {
        self.outcomes.into_iter()
    }
}

impl<'a> IntoIterator for &'a BatchOutcome {
    type Item = &'a RunOutcome;
    type IntoIter = std::slice::Iter<'a, RunOutcome>;

    fn into_iter(self) -> Self::IntoIter {
        self.outcomes.iter()
    }
}
