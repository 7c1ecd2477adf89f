//! JavaScript backend built on `boa_engine`.
//!
//! Every run gets a brand new realm, so nothing a script does (including
//! monkey-patching `Promise` or `Object.prototype`) survives into another
//! run. Inside the realm:
//! - bindings are installed as non-writable globals and deep-frozen;
//! - `console.log/info/debug/warn/error` write straight into the run's
//!   log sink, so records survive a run that is later abandoned;
//! - `setTimeout`/`clearTimeout` are backed by tokio timers, HTTP client
//!   bindings become `get`/`post` functions returning promises, and
//!   `onCancel(fn)` registers hooks run when the run is cancelled;
//! - the script body becomes a `Function` taking `payload` (plus any
//!   configured payload aliases), and its return value goes through
//!   `Promise.resolve`, so sync and async scripts settle the same way;
//! - boa runtime limits stop endless loops and runaway recursion.
//!
//! boa is synchronous and `!Send`, so each run owns a blocking worker
//! thread. The worker posts host requests (timers, HTTP) to the async side
//! of [`JsBackend::execute`], which performs them on the caller's runtime
//! and feeds completions back. Cancellation between two turns drops every
//! pending operation, runs the `onCancel` hooks and is acknowledged. A
//! worker stuck in synchronous code cannot be interrupted: it is abandoned
//! and finishes on its own, bounded by the runtime limits.
//!
//! boa function objects belong to the realm that created them, so the
//! compiled unit is the validated parameter list and body; each run
//! instantiates it in its own realm.

use std::collections::HashMap;
use std::sync::mpsc as std_mpsc;
use std::time::Duration;

use async_trait::async_trait;
use boa_engine::object::{JsObject, ObjectInitializer};
use boa_engine::vm::RuntimeLimits;
use boa_engine::{
    Context, JsArgs, JsNativeError, JsResult, JsString, JsValue, NativeFunction, Source,
};
use boa_gc::{empty_trace, Finalize, Trace};
use futures::future::{AbortHandle, Abortable, BoxFuture};
use futures::stream::FuturesUnordered;
use futures::StreamExt;
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use super::{unit_for, Backend, CompiledScript};
use crate::capabilities::HttpClient;
use crate::config::JsConfig;
use crate::error::{CompileError, ScriptError};
use crate::sandbox::context::{validate_name, Capability};
use crate::sandbox::{ExecutionContext, LogLevel, LogSink};

const NAME: &str = "js";

/// Builds the in-realm runtime from the host object. Evaluates to a
/// function; nothing it defines is reachable by name from scripts except
/// the globals it installs.
const PRELUDE: &str = r#"
(function (host) {
  var pending = {};
  var nextId = 0;
  var cancelHooks = [];
  var outcome = { state: "pending" };

  var snapshot = function (value) {
    try {
      var text = JSON.stringify(value);
      return text === undefined ? null : JSON.parse(text);
    } catch (e) {
      return String(value);
    }
  };
  var freeze = function (value) {
    if (value === null || (typeof value !== "object" && typeof value !== "function")) {
      return value;
    }
    if (Object.isFrozen(value)) {
      return value;
    }
    Object.freeze(value);
    Object.getOwnPropertyNames(value).forEach(function (key) {
      var desc = Object.getOwnPropertyDescriptor(value, key);
      if (desc && "value" in desc) {
        freeze(desc.value);
      }
    });
    return value;
  };
  var describe = function (error) {
    try {
      if (error !== null && typeof error === "object") {
        return {
          name: error.name === undefined ? null : String(error.name),
          message: error.message === undefined ? String(error) : String(error.message)
        };
      }
      return { name: null, message: String(error) };
    } catch (e) {
      return { name: null, message: "unprintable error" };
    }
  };
  var install = function (name, value, enumerable) {
    Object.defineProperty(globalThis, name, {
      value: value, writable: false, enumerable: enumerable, configurable: false
    });
  };

  var console = {};
  ["log", "info", "debug", "warn", "error"].forEach(function (level) {
    console[level] = function () {
      var data = [];
      for (var i = 0; i < arguments.length; i++) {
        data.push(snapshot(arguments[i]));
      }
      host.log(level, JSON.stringify(data));
    };
  });
  install("console", freeze(console), false);

  install("setTimeout", function (fn, ms) {
    if (typeof fn !== "function") {
      throw new TypeError("setTimeout callback must be a function");
    }
    var id = ++nextId;
    pending[id] = { kind: "timer", fn: fn, args: Array.prototype.slice.call(arguments, 2) };
    host.timer(id, Number(ms) || 0);
    return id;
  }, false);
  install("clearTimeout", function (id) {
    if (pending[id] && pending[id].kind === "timer") {
      delete pending[id];
      host.clear(id);
    }
  }, false);
  install("onCancel", function (fn) {
    if (typeof fn !== "function") {
      throw new TypeError("onCancel hook must be a function");
    }
    cancelHooks.push(fn);
  }, false);

  var request = function (binding, method, url, body) {
    return new Promise(function (resolve, reject) {
      var id = ++nextId;
      pending[id] = { kind: "request", resolve: resolve, reject: reject };
      var text = body === undefined ? "null" : JSON.stringify(body);
      host.http(id, binding, method, String(url), text === undefined ? "null" : text);
    });
  };

  return {
    bind: function (name, value) {
      install(name, freeze(value), true);
    },
    http: function (name) {
      install(name, freeze({
        get: function (url) { return request(name, "GET", url); },
        post: function (url, body) { return request(name, "POST", url, body); }
      }), true);
    },
    start: function (fn, payloadText, aliasesText) {
      var payload = JSON.parse(payloadText);
      var args = [payload];
      JSON.parse(aliasesText).forEach(function (alias) { args.push(payload[alias]); });
      var result;
      try {
        result = Promise.resolve(fn.apply(undefined, args));
      } catch (error) {
        result = Promise.reject(error);
      }
      result.then(
        function (value) { outcome = { state: "resolved", value: snapshot(value) }; },
        function (error) { outcome = { state: "rejected", error: describe(error) }; }
      );
    },
    state: function () {
      return JSON.stringify(outcome);
    },
    deliver: function (id, ok, text) {
      var entry = pending[id];
      if (!entry) {
        return;
      }
      delete pending[id];
      var value = JSON.parse(text);
      if (entry.kind === "timer") {
        try {
          entry.fn.apply(undefined, entry.args);
        } catch (error) {
          if (outcome.state === "pending") {
            outcome = { state: "rejected", error: describe(error) };
          }
        }
      } else if (ok) {
        entry.resolve(value);
      } else {
        var error = new Error(value.message);
        error.name = value.name || "Error";
        entry.reject(error);
      }
    },
    cancel: function () {
      pending = {};
      for (var i = 0; i < cancelHooks.length; i++) {
        try {
          cancelHooks[i]();
        } catch (e) {
          console.error("onCancel hook failed: " + String(e));
        }
      }
    }
  };
})
"#;

/// A validated script: `Function` parameters and body.
#[derive(Debug, Clone)]
struct JsScript {
    params: Vec<String>,
    body: String,
}

impl JsScript {
    /// Creates the script function in `context` without running it.
    ///
    /// The body goes through the `Function` constructor, so it can never
    /// close the function early and run at top level.
    fn instantiate(&self, context: &mut Context) -> JsResult<JsObject> {
        let mut args: Vec<JsValue> = self
            .params
            .iter()
            .map(|param| JsString::from(param.as_str()).into())
            .collect();
        args.push(JsString::from(self.body.as_str()).into());
        let constructor = context.intrinsics().constructors().function().constructor();
        constructor.construct(&args, None, context)
    }

    fn aliases(&self) -> &[String] {
        self.params.get(1..).unwrap_or_default()
    }
}

/// JavaScript backend; one fresh boa realm per run.
#[derive(Debug, Clone)]
pub struct JsBackend {
    limits: JsConfig,
    payload_aliases: Vec<String>,
}

impl Default for JsBackend {
    fn default() -> Self {
        Self::new(JsConfig::default())
    }
}

impl JsBackend {
    pub fn new(limits: JsConfig) -> Self {
        Self {
            limits,
            payload_aliases: Vec::new(),
        }
    }

    /// Exposes these payload fields as local variables of the script.
    ///
    /// Names that are not plain identifiers, or that repeat, are dropped
    /// with a warning.
    pub fn with_payload_aliases<I, S>(mut self, aliases: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut accepted: Vec<String> = Vec::new();
        for alias in aliases.into_iter().map(Into::into) {
            if let Err(e) = validate_name(&alias) {
                warn!("Ignoring payload alias: {e}");
            } else if alias == "payload" || accepted.contains(&alias) {
                warn!("Ignoring duplicate payload alias '{alias}'");
            } else {
                accepted.push(alias);
            }
        }
        self.payload_aliases = accepted;
        self
    }

    pub fn payload_aliases(&self) -> &[String] {
        &self.payload_aliases
    }

    fn new_realm(&self) -> Context {
        let mut context = Context::default();
        let mut limits = RuntimeLimits::default();
        limits.set_loop_iteration_limit(self.limits.loop_iteration_limit);
        limits.set_recursion_limit(self.limits.recursion_limit);
        context.set_runtime_limits(limits);
        context
    }
}

// ── Worker protocol ──────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum HttpMethod {
    Get,
    Post,
}

/// Host work requested by a running script.
#[derive(Debug)]
enum HostRequest {
    Timer {
        id: u64,
        delay: Duration,
    },
    Clear {
        id: u64,
    },
    Http {
        id: u64,
        binding: String,
        method: HttpMethod,
        url: String,
        body: Value,
    },
}

/// Worker → async side.
#[derive(Debug)]
enum WorkerEvent {
    Request(HostRequest),
    Settled(Result<Value, ScriptError>),
    Cancelled,
}

/// Async side → worker.
#[derive(Debug)]
enum HostEvent {
    Completed {
        id: u64,
        outcome: Result<Value, ScriptError>,
    },
    Cancel,
}

/// Everything a worker needs to run one script.
struct JsJob {
    script: JsScript,
    bindings: String,
    payload: String,
}

/// State shared with the native functions of the realm.
#[derive(Clone, Finalize)]
struct HostLink {
    logs: LogSink,
    events: mpsc::UnboundedSender<WorkerEvent>,
}

// SAFETY: holds no garbage-collected values.
unsafe impl Trace for HostLink {
    empty_trace!();
}

impl HostLink {
    fn request(&self, request: HostRequest) {
        // A closed channel means the run was abandoned.
        let _ = self.events.send(WorkerEvent::Request(request));
    }
}

#[derive(Debug, Deserialize)]
#[serde(tag = "state", rename_all = "lowercase")]
enum ReportOutcome {
    Pending,
    Resolved {
        #[serde(default)]
        value: Value,
    },
    Rejected {
        error: ReportError,
    },
}

#[derive(Debug, Deserialize)]
struct ReportError {
    name: Option<String>,
    message: String,
}

/// Splits "ReferenceError: x is not defined" into name and message.
fn script_error(text: &str) -> ScriptError {
    match text.split_once(": ") {
        Some((name, message))
            if name.ends_with("Error") && name.chars().all(|c| c.is_ascii_alphanumeric()) =>
        {
            ScriptError::named(name, message)
        }
        _ => ScriptError::new(text),
    }
}

fn string_arg(args: &[JsValue], index: usize, context: &mut Context) -> JsResult<String> {
    Ok(args
        .get_or_undefined(index)
        .to_string(context)?
        .to_std_string_escaped())
}

fn id_arg(args: &[JsValue], index: usize, context: &mut Context) -> JsResult<u64> {
    let id = args.get_or_undefined(index).to_number(context)?;
    Ok(if id.is_finite() && id > 0.0 { id as u64 } else { 0 })
}

/// The native half of the runtime: log, timer and HTTP entry points.
fn host_object(context: &mut Context, link: &HostLink) -> JsObject {
    let log = NativeFunction::from_copy_closure_with_captures(
        |_this, args, link, context| {
            let level = string_arg(args, 0, context)?;
            let data = string_arg(args, 1, context)?;
            let level = LogLevel::parse(&level).unwrap_or(LogLevel::Log);
            link.logs.push(level, serde_json::from_str(&data).unwrap_or_default());
            Ok(JsValue::undefined())
        },
        link.clone(),
    );
    let timer = NativeFunction::from_copy_closure_with_captures(
        |_this, args, link, context| {
            let id = id_arg(args, 0, context)?;
            let ms = args.get_or_undefined(1).to_number(context)?;
            let delay = if ms.is_finite() && ms > 0.0 {
                Duration::from_millis(ms as u64)
            } else {
                Duration::ZERO
            };
            link.request(HostRequest::Timer { id, delay });
            Ok(JsValue::undefined())
        },
        link.clone(),
    );
    let clear = NativeFunction::from_copy_closure_with_captures(
        |_this, args, link, context| {
            let id = id_arg(args, 0, context)?;
            link.request(HostRequest::Clear { id });
            Ok(JsValue::undefined())
        },
        link.clone(),
    );
    let http = NativeFunction::from_copy_closure_with_captures(
        |_this, args, link, context| {
            let id = id_arg(args, 0, context)?;
            let binding = string_arg(args, 1, context)?;
            let method = match string_arg(args, 2, context)?.as_str() {
                "POST" => HttpMethod::Post,
                _ => HttpMethod::Get,
            };
            let url = string_arg(args, 3, context)?;
            let body = serde_json::from_str(&string_arg(args, 4, context)?).unwrap_or(Value::Null);
            link.request(HostRequest::Http {
                id,
                binding,
                method,
                url,
                body,
            });
            Ok(JsValue::undefined())
        },
        link.clone(),
    );

    ObjectInitializer::new(context)
        .function(log, JsString::from("log"), 2)
        .function(timer, JsString::from("timer"), 2)
        .function(clear, JsString::from("clear"), 1)
        .function(http, JsString::from("http"), 5)
        .build()
}

fn call_function(function: &JsValue, args: &[JsValue], context: &mut Context) -> JsResult<JsValue> {
    match function.as_callable() {
        Some(function) => function.call(&JsValue::undefined(), args, context),
        None => Err(JsNativeError::typ()
            .with_message("sandbox runtime member is not a function")
            .into()),
    }
}

/// Handle on the in-realm runtime returned by the prelude.
struct Runtime {
    object: JsObject,
}

impl Runtime {
    fn boot(context: &mut Context, link: &HostLink) -> JsResult<Self> {
        let factory = context.eval(Source::from_bytes(PRELUDE))?;
        let host = host_object(context, link);
        let object = call_function(&factory, &[host.into()], context)?;
        match object.as_object() {
            Some(object) => Ok(Self {
                object: object.clone(),
            }),
            None => Err(JsNativeError::typ()
                .with_message("sandbox runtime did not initialize")
                .into()),
        }
    }

    fn member(&self, name: &str, context: &mut Context) -> JsResult<JsValue> {
        self.object.get(JsString::from(name), context)
    }

    fn call(&self, name: &str, args: &[JsValue], context: &mut Context) -> JsResult<JsValue> {
        let function = self.member(name, context)?;
        call_function(&function, args, context)
    }

    fn state(&self, context: &mut Context) -> Result<ReportOutcome, ScriptError> {
        let value = self
            .call("state", &[], context)
            .map_err(|e| ScriptError::new(format!("cannot read script outcome: {e}")))?;
        let text = value
            .as_string()
            .map(|s| s.to_std_string_escaped())
            .ok_or_else(|| ScriptError::new("script outcome is not a string"))?;
        serde_json::from_str(&text)
            .map_err(|e| ScriptError::new(format!("cannot parse script outcome: {e}")))
    }

    fn deliver(
        &self,
        id: u64,
        outcome: Result<Value, ScriptError>,
        context: &mut Context,
    ) -> JsResult<JsValue> {
        let (ok, text) = match outcome {
            Ok(value) => (true, value.to_string()),
            Err(e) => (false, json!({ "name": e.name, "message": e.message }).to_string()),
        };
        let args = [
            JsValue::from(id as f64),
            JsValue::from(ok),
            JsString::from(text.as_str()).into(),
        ];
        self.call("deliver", &args, context)
    }
}

/// Renders a function installing the bindings through the runtime's
/// `bind(name, value)` and `http(name)`.
fn render_bindings(context: &ExecutionContext) -> String {
    let mut out = String::from("(function (bind, http) {\n");
    for (name, capability) in context.bindings().iter() {
        match capability {
            Capability::Data(value) => out.push_str(&format!("  bind(\"{name}\", {value});\n")),
            Capability::Module(source) => {
                out.push_str(&format!("  bind(\"{name}\", (\n{source}\n));\n"))
            }
            Capability::Host(object) if object.downcast_ref::<HttpClient>().is_some() => {
                out.push_str(&format!("  http(\"{name}\");\n"))
            }
            Capability::Host(_) | Capability::PerRun(_) => {
                debug!("Binding '{name}' is host-only, not exposed to JavaScript");
            }
        }
    }
    out.push_str("})");
    out
}

impl JsBackend {
    /// Boots the runtime, installs bindings and calls the script.
    fn start(
        &self,
        context: &mut Context,
        job: &JsJob,
        link: &HostLink,
    ) -> Result<Runtime, ScriptError> {
        let runtime = Runtime::boot(context, link)
            .map_err(|e| ScriptError::new(format!("sandbox prelude failed: {e}")))?;

        let installer = context
            .eval(Source::from_bytes(&job.bindings))
            .and_then(|installer| {
                let bind = runtime.member("bind", context)?;
                let http = runtime.member("http", context)?;
                call_function(&installer, &[bind, http], context)
            });
        if let Err(e) = installer {
            return Err(ScriptError::new(format!("cannot install bindings: {e}")));
        }

        let function = job
            .script
            .instantiate(context)
            .map_err(|e| script_error(&e.to_string()))?;
        let aliases = serde_json::to_string(job.script.aliases()).unwrap_or_else(|_| "[]".into());
        let args: [JsValue; 3] = [
            function.into(),
            JsString::from(job.payload.as_str()).into(),
            JsString::from(aliases.as_str()).into(),
        ];
        // Uncatchable failures (runtime limits) surface here.
        runtime
            .call("start", &args, context)
            .map_err(|e| script_error(&e.to_string()))?;
        Ok(runtime)
    }

    /// Runs one job on the current (blocking) thread, turn by turn, until
    /// it settles, is cancelled or is abandoned.
    fn run_worker(&self, job: JsJob, link: HostLink, inbox: std_mpsc::Receiver<HostEvent>) {
        let events = link.events.clone();
        let settle = |result: Result<Value, ScriptError>| {
            let _ = events.send(WorkerEvent::Settled(result));
        };

        let mut context = self.new_realm();
        let runtime = match self.start(&mut context, &job, &link) {
            Ok(runtime) => runtime,
            Err(e) => return settle(Err(e)),
        };

        loop {
            let _ = context.run_jobs();
            match runtime.state(&mut context) {
                Ok(ReportOutcome::Pending) => {}
                Ok(ReportOutcome::Resolved { value }) => return settle(Ok(value)),
                Ok(ReportOutcome::Rejected { error }) => {
                    return settle(Err(ScriptError {
                        name: error.name,
                        message: error.message,
                    }))
                }
                Err(e) => return settle(Err(e)),
            }

            match inbox.recv() {
                Ok(HostEvent::Completed { id, outcome }) => {
                    if let Err(e) = runtime.deliver(id, outcome, &mut context) {
                        return settle(Err(script_error(&e.to_string())));
                    }
                }
                Ok(HostEvent::Cancel) => {
                    if let Err(e) = runtime.call("cancel", &[], &mut context) {
                        debug!("Cancel hooks failed: {e}");
                    }
                    let _ = context.run_jobs();
                    let _ = events.send(WorkerEvent::Cancelled);
                    return;
                }
                Err(_) => {
                    debug!("Run abandoned, stopping JavaScript worker");
                    return;
                }
            }
        }
    }
}

type HostOp = Abortable<BoxFuture<'static, (u64, Result<Value, ScriptError>)>>;

/// Starts the host work behind `request` (or cancels it for `Clear`).
fn dispatch(
    request: HostRequest,
    context: &ExecutionContext,
    ops: &mut FuturesUnordered<HostOp>,
    handles: &mut HashMap<u64, AbortHandle>,
) {
    let (id, op): (u64, BoxFuture<'static, (u64, Result<Value, ScriptError>)>) = match request {
        HostRequest::Clear { id } => {
            if let Some(handle) = handles.remove(&id) {
                handle.abort();
            }
            return;
        }
        HostRequest::Timer { id, delay } => (
            id,
            Box::pin(async move {
                tokio::time::sleep(delay).await;
                (id, Ok(Value::Null))
            }),
        ),
        HostRequest::Http {
            id,
            binding,
            method,
            url,
            body,
        } => {
            let client = context.host::<HttpClient>(&binding).cloned();
            (
                id,
                Box::pin(async move {
                    let result = match client {
                        Some(client) => match method {
                            HttpMethod::Get => client.get_json(&url).await,
                            HttpMethod::Post => client.post_json(&url, &body).await,
                        },
                        None => Err(ScriptError::named(
                            "HttpError",
                            format!("'{binding}' is not an HTTP binding"),
                        )),
                    };
                    (id, result)
                }),
            )
        }
    };
    let (handle, registration) = AbortHandle::new_pair();
    handles.insert(id, handle);
    ops.push(Abortable::new(op, registration));
}

#[async_trait]
impl Backend for JsBackend {
    fn name(&self) -> &'static str {
        NAME
    }

    fn compile(&self, source: &str) -> Result<CompiledScript, CompileError> {
        let mut params = vec!["payload".to_string()];
        params.extend(self.payload_aliases.iter().cloned());
        let script = JsScript {
            params,
            body: source.to_string(),
        };
        // Creating the function parses the body without running it.
        let mut context = self.new_realm();
        script
            .instantiate(&mut context)
            .map_err(|e| CompileError::new(e.to_string()))?;
        Ok(CompiledScript::new(NAME, script))
    }

    async fn execute(
        &self,
        script: &CompiledScript,
        context: ExecutionContext,
    ) -> Result<Value, ScriptError> {
        let unit = unit_for::<JsScript>(NAME, script)?;
        let job = JsJob {
            script: unit.clone(),
            bindings: render_bindings(&context),
            payload: context.payload().to_string(),
        };

        let (events_tx, mut events) = mpsc::unbounded_channel();
        let (inbox_tx, inbox) = std_mpsc::channel();
        let link = HostLink {
            logs: context.logs().clone(),
            events: events_tx,
        };
        let backend = self.clone();
        let mut worker = tokio::task::spawn_blocking(move || backend.run_worker(job, link, inbox));

        let signal = context.cancel_signal().clone();
        let mut ops: FuturesUnordered<HostOp> = FuturesUnordered::new();
        let mut handles: HashMap<u64, AbortHandle> = HashMap::new();
        let mut cancel_sent = false;

        loop {
            tokio::select! {
                event = events.recv() => match event {
                    Some(WorkerEvent::Request(request)) => {
                        dispatch(request, &context, &mut ops, &mut handles);
                    }
                    Some(WorkerEvent::Settled(result)) => return result,
                    Some(WorkerEvent::Cancelled) => {
                        signal.acknowledge();
                        return Err(ScriptError::named("CancelError", "Script cancelled"));
                    }
                    None => {
                        return Err(match (&mut worker).await {
                            Ok(()) => ScriptError::new("script worker stopped without an outcome"),
                            Err(e) => ScriptError::new(format!("script worker failed: {e}")),
                        });
                    }
                },
                Some(done) = ops.next(), if !ops.is_empty() => {
                    if let Ok((id, outcome)) = done {
                        handles.remove(&id);
                        let _ = inbox_tx.send(HostEvent::Completed { id, outcome });
                    }
                }
                _ = signal.cancelled(), if !cancel_sent => {
                    cancel_sent = true;
                    debug!("Cancelling JavaScript run, dropping {} pending operations", ops.len());
                    ops.clear();
                    handles.clear();
                    let _ = inbox_tx.send(HostEvent::Cancel);
                }
            }
        }
    }
}
