//! JavaScript modules on an embedded QuickJS runtime.
//!
//! QuickJS runtimes are not thread-safe, so each loaded module gets its own
//! runtime thread. Calls are sent to it over a channel and settle through a
//! oneshot, which makes every JavaScript call a deferred result.
//!
//! Scripts see the helpers the module ecosystem expects:
//! `fetchv2(url, headers, method, body)` and `fetch(url, options)`, both
//! resolving to `{status, ok, headers, text(), json()}`, and `console.log`,
//! `console.warn`, and `console.error` routed to the logging sink. Host
//! fetches block the runtime thread, not the tokio workers.

use std::collections::{HashMap, HashSet};
use std::sync::mpsc as std_mpsc;
use std::sync::{Arc, Mutex, PoisonError};
use std::thread;

use rquickjs::{CatchResultExt, Context, Ctx, Function, Runtime};
use serde_json::{Value, json};
use tokio::runtime::Handle;
use tokio::sync::oneshot;
use tracing::{debug, warn};

use super::{
    EntryPoint, Environment, HostServices, Module, OnFulfilled, OnRejected, ScriptEngine,
    ScriptError, ScriptValue, Thenable,
};
use crate::download::RequestHeaders;
use crate::logging::Severity;

const PRELUDE: &str = r#"
var console = {
    log: function () { __host_log("info", Array.prototype.map.call(arguments, String).join(" ")); },
    warn: function () { __host_log("warning", Array.prototype.map.call(arguments, String).join(" ")); },
    error: function () { __host_log("error", Array.prototype.map.call(arguments, String).join(" ")); }
};

function fetchv2(url, headers, method, body) {
    var payload = body === undefined ? null : body;
    var raw = JSON.parse(__host_fetch(
        String(method || "GET"),
        String(url),
        JSON.stringify(headers || {}),
        JSON.stringify(payload)
    ));
    if (!raw.ok) {
        return Promise.reject(new Error(raw.error));
    }
    return Promise.resolve({
        status: raw.status,
        ok: raw.status >= 200 && raw.status < 300,
        headers: raw.headers,
        text: function () { return Promise.resolve(raw.body); },
        json: function () { return Promise.resolve(JSON.parse(raw.body)); }
    });
}

function fetch(url, options) {
    options = options || {};
    return fetchv2(url, options.headers, options.method, options.body);
}

var __settled = {};

function __invoke(id, name, argsJson) {
    var args = JSON.parse(argsJson);
    Promise.resolve()
        .then(function () { return globalThis[name].apply(null, args); })
        .then(
            function (value) {
                __settled[id] = JSON.stringify({ ok: true, value: value === undefined ? null : value });
            },
            function (error) {
                var message = error && error.message ? error.message : String(error);
                __settled[id] = JSON.stringify({ ok: false, error: message });
            }
        );
}

function __take(id) {
    var result = __settled[id];
    delete __settled[id];
    return result;
}

function __functions() {
    return JSON.stringify(Object.getOwnPropertyNames(globalThis).filter(function (key) {
        return typeof globalThis[key] === "function" && key.indexOf("__") !== 0;
    }));
}
"#;

type Settlement = Result<Value, String>;

enum Command {
    Call {
        name: String,
        args: Vec<Value>,
        reply: oneshot::Sender<Settlement>,
    },
}

/// Engine evaluating module scripts as JavaScript.
#[derive(Debug, Default)]
pub struct QuickJsEngine;

impl QuickJsEngine {
    #[must_use]
    pub fn new() -> Self {
        Self
    }
}

impl ScriptEngine for QuickJsEngine {
    fn load(&self, module: &Module, host: HostServices) -> Result<Arc<dyn Environment>, ScriptError> {
        let handle = Handle::try_current()
            .map_err(|_| ScriptError::invalid("the QuickJS engine needs a tokio runtime"))?;
        let (commands, inbox) = std_mpsc::channel::<Command>();
        let (ready_tx, ready_rx) = std_mpsc::channel::<Result<HashSet<String>, String>>();
        let script = module.script.clone();

        thread::Builder::new()
            .name(format!("quickjs-{}", module.id))
            .spawn(move || runtime_thread(&script, &host, &handle, &inbox, &ready_tx))
            .map_err(|e| ScriptError::invalid(format!("could not start script thread: {e}")))?;

        let functions = ready_rx
            .recv()
            .map_err(|_| ScriptError::invalid("script thread exited during load"))?
            .map_err(ScriptError::invalid)?;
        debug!(module = %module.id, functions = functions.len(), "JavaScript module evaluated");

        Ok(Arc::new(QuickJsEnvironment {
            functions,
            commands: Mutex::new(commands),
        }))
    }
}

struct QuickJsEnvironment {
    functions: HashSet<String>,
    commands: Mutex<std_mpsc::Sender<Command>>,
}

impl Environment for QuickJsEnvironment {
    fn lookup(&self, name: &str) -> Option<Arc<dyn EntryPoint>> {
        if !self.functions.contains(name) {
            return None;
        }
        let commands = self
            .commands
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        Some(Arc::new(QuickJsEntryPoint {
            name: name.to_string(),
            commands: Mutex::new(commands),
        }))
    }
}

struct QuickJsEntryPoint {
    name: String,
    commands: Mutex<std_mpsc::Sender<Command>>,
}

impl EntryPoint for QuickJsEntryPoint {
    fn name(&self) -> &str {
        &self.name
    }

    fn call(&self, args: Vec<Value>) -> Result<ScriptValue, ScriptError> {
        let (reply, settled) = oneshot::channel();
        self.commands
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .send(Command::Call {
                name: self.name.clone(),
                args,
                reply,
            })
            .map_err(|_| ScriptError::exception(&self.name, "script thread has stopped"))?;
        Ok(ScriptValue::Deferred(Box::new(PendingCall { settled })))
    }
}

/// Settles when the runtime thread reports the call's outcome.
struct PendingCall {
    settled: oneshot::Receiver<Settlement>,
}

impl Thenable for PendingCall {
    fn then(self: Box<Self>, on_fulfilled: OnFulfilled, on_rejected: OnRejected) {
        tokio::spawn(async move {
            match self.settled.await {
                Ok(Ok(value)) => on_fulfilled(value),
                Ok(Err(message)) => on_rejected(message),
                // The thread dropped the call; the watchdog reports it.
                Err(_) => {}
            }
        });
    }
}

fn runtime_thread(
    script: &str,
    host: &HostServices,
    handle: &Handle,
    inbox: &std_mpsc::Receiver<Command>,
    ready: &std_mpsc::Sender<Result<HashSet<String>, String>>,
) {
    let setup = Runtime::new()
        .and_then(|runtime| Context::full(&runtime).map(|context| (runtime, context)))
        .map_err(|e| e.to_string());
    let (runtime, context) = match setup {
        Ok(pair) => pair,
        Err(e) => {
            let _ = ready.send(Err(format!("could not create JavaScript runtime: {e}")));
            return;
        }
    };

    let loaded = context.with(|ctx| -> Result<HashSet<String>, String> {
        install_host_functions(&ctx, host, handle)?;
        eval_void(&ctx, PRELUDE)?;
        eval_void(&ctx, script)?;
        let names: String = ctx
            .eval("__functions()")
            .catch(&ctx)
            .map_err(|e| e.to_string())?;
        serde_json::from_str(&names).map_err(|e| e.to_string())
    });
    let loaded_ok = loaded.is_ok();
    if ready.send(loaded).is_err() || !loaded_ok {
        return;
    }

    let mut next_id: i32 = 0;
    let mut pending: HashMap<i32, oneshot::Sender<Settlement>> = HashMap::new();

    while let Ok(Command::Call { name, args, reply }) = inbox.recv() {
        next_id = next_id.wrapping_add(1);
        let id = next_id;
        let args_json = Value::Array(args).to_string();
        let started = context.with(|ctx| {
            ctx.globals()
                .get::<_, Function>("__invoke")
                .and_then(|invoke| invoke.call::<_, ()>((id, name.as_str(), args_json.as_str())))
                .catch(&ctx)
                .map_err(|e| e.to_string())
        });
        if let Err(message) = started {
            let _ = reply.send(Err(message));
            continue;
        }
        pending.insert(id, reply);

        drain_jobs(&runtime);
        settle_ready(&context, &mut pending);
    }
    debug!(pending = pending.len(), "script thread stopping");
}

fn drain_jobs(runtime: &Runtime) {
    loop {
        match runtime.execute_pending_job() {
            Ok(true) => {}
            Ok(false) => break,
            Err(_) => warn!("uncaught exception in script job"),
        }
    }
}

/// Delivers every call whose promise has settled.
fn settle_ready(context: &Context, pending: &mut HashMap<i32, oneshot::Sender<Settlement>>) {
    let ids: Vec<i32> = pending.keys().copied().collect();
    for id in ids {
        let raw: Option<String> = context.with(|ctx| {
            ctx.globals()
                .get::<_, Function>("__take")
                .and_then(|take| take.call::<_, Option<String>>((id,)))
                .ok()
                .flatten()
        });
        let Some(raw) = raw else { continue };
        let Some(reply) = pending.remove(&id) else {
            continue;
        };
        let _ = reply.send(parse_settlement(&raw));
    }
}

fn parse_settlement(raw: &str) -> Settlement {
    let envelope: Value = serde_json::from_str(raw).map_err(|e| e.to_string())?;
    if envelope["ok"].as_bool().unwrap_or(false) {
        Ok(envelope["value"].clone())
    } else {
        Err(envelope["error"]
            .as_str()
            .unwrap_or("unknown script error")
            .to_string())
    }
}

fn eval_void(ctx: &Ctx<'_>, source: &str) -> Result<(), String> {
    ctx.eval::<(), _>(source)
        .catch(ctx)
        .map_err(|e| e.to_string())
}

fn install_host_functions(ctx: &Ctx<'_>, host: &HostServices, handle: &Handle) -> Result<(), String> {
    let globals = ctx.globals();

    let sink = Arc::clone(&host.sink);
    let log = Function::new(ctx.clone(), move |level: String, message: String| {
        let severity = match level.as_str() {
            "error" => Severity::Error,
            "warning" => Severity::Warning,
            "debug" => Severity::Debug,
            _ => Severity::Info,
        };
        sink.log(&message, severity);
    })
    .map_err(|e| e.to_string())?;
    globals.set("__host_log", log).map_err(|e| e.to_string())?;

    let http = host.http.clone();
    let handle = handle.clone();
    let fetch = Function::new(
        ctx.clone(),
        move |method: String, url: String, headers: String, body: String| -> String {
            host_fetch(&http, &handle, &method, &url, &headers, &body).to_string()
        },
    )
    .map_err(|e| e.to_string())?;
    globals.set("__host_fetch", fetch).map_err(|e| e.to_string())?;
    Ok(())
}

fn host_fetch(
    http: &crate::download::HttpClient,
    handle: &Handle,
    method: &str,
    url: &str,
    headers_json: &str,
    body_json: &str,
) -> Value {
    let headers: RequestHeaders = match serde_json::from_str::<Value>(headers_json) {
        Ok(Value::Object(map)) => map
            .into_iter()
            .map(|(name, value)| {
                let value = match value {
                    Value::String(s) => s,
                    other => other.to_string(),
                };
                (name, value)
            })
            .collect(),
        _ => RequestHeaders::new(),
    };
    let body = match serde_json::from_str::<Value>(body_json) {
        Ok(Value::Null) | Err(_) => None,
        Ok(Value::String(s)) => Some(s),
        Ok(other) => Some(other.to_string()),
    };

    match handle.block_on(http.fetch_response(method, url, &headers, body)) {
        Ok(response) => json!({
            "ok": true,
            "status": response.status,
            "headers": response.headers,
            "body": response.body,
        }),
        Err(e) => json!({ "ok": false, "error": e.to_string() }),
    }
}
