//! Engine for modules written as Rust closures.
//!
//! A [`NativeModule`] is registered under a script key; loading a
//! [`Module`] whose script text equals that key produces its environment.
//! Built-in modules and tests use this engine.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use serde_json::Value;

use super::{
    EntryPoint, Environment, HostServices, Module, OnFulfilled, OnRejected, ScriptEngine,
    ScriptError, ScriptValue, Thenable,
};

/// A native entrypoint body. Receives the call arguments and the host services.
pub type NativeFn =
    Arc<dyn Fn(Vec<Value>, &HostServices) -> Result<ScriptValue, ScriptError> + Send + Sync>;

/// Function table of a native module.
#[derive(Clone, Default)]
pub struct NativeModule {
    functions: HashMap<String, NativeFn>,
    load_error: Option<String>,
}

impl std::fmt::Debug for NativeModule {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut names: Vec<&String> = self.functions.keys().collect();
        names.sort();
        f.debug_struct("NativeModule")
            .field("functions", &names)
            .field("load_error", &self.load_error)
            .finish()
    }
}

impl NativeModule {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Defines entrypoint `name`.
    #[must_use]
    pub fn function<F>(mut self, name: &str, body: F) -> Self
    where
        F: Fn(Vec<Value>, &HostServices) -> Result<ScriptValue, ScriptError>
            + Send
            + Sync
            + 'static,
    {
        self.functions.insert(name.to_string(), Arc::new(body));
        self
    }

    /// A module whose evaluation raises `message`.
    #[must_use]
    pub fn raising(message: impl Into<String>) -> Self {
        Self {
            functions: HashMap::new(),
            load_error: Some(message.into()),
        }
    }
}

/// Engine resolving scripts against registered [`NativeModule`]s.
#[derive(Debug, Default)]
pub struct NativeEngine {
    modules: RwLock<HashMap<String, NativeModule>>,
}

impl NativeEngine {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `module` under `script_key`, replacing any previous one.
    pub fn register(&self, script_key: impl Into<String>, module: NativeModule) {
        if let Ok(mut modules) = self.modules.write() {
            modules.insert(script_key.into(), module);
        }
    }
}

impl ScriptEngine for NativeEngine {
    fn load(&self, module: &Module, host: HostServices) -> Result<Arc<dyn Environment>, ScriptError> {
        let modules = self
            .modules
            .read()
            .map_err(|_| ScriptError::invalid("native module table is poisoned"))?;
        let native = modules.get(&module.script).ok_or_else(|| {
            ScriptError::invalid(format!("no native module registered for '{}'", module.id))
        })?;
        if let Some(message) = &native.load_error {
            return Err(ScriptError::invalid(message.clone()));
        }
        Ok(Arc::new(NativeEnvironment {
            functions: native.functions.clone(),
            host,
        }))
    }
}

struct NativeEnvironment {
    functions: HashMap<String, NativeFn>,
    host: HostServices,
}

impl Environment for NativeEnvironment {
    fn lookup(&self, name: &str) -> Option<Arc<dyn EntryPoint>> {
        let body = self.functions.get(name)?;
        Some(Arc::new(NativeEntryPoint {
            name: name.to_string(),
            body: Arc::clone(body),
            host: Some(self.host.clone()),
        }))
    }
}

/// An entrypoint backed by a Rust closure.
pub struct NativeEntryPoint {
    name: String,
    body: NativeFn,
    host: Option<HostServices>,
}

impl NativeEntryPoint {
    /// Builds a free-standing entrypoint without host services.
    pub fn from_fn<F>(name: &str, body: F) -> Self
    where
        F: Fn(Vec<Value>) -> Result<ScriptValue, ScriptError> + Send + Sync + 'static,
    {
        Self {
            name: name.to_string(),
            body: Arc::new(move |args, _| body(args)),
            host: None,
        }
    }
}

impl EntryPoint for NativeEntryPoint {
    fn name(&self) -> &str {
        &self.name
    }

    fn call(&self, args: Vec<Value>) -> Result<ScriptValue, ScriptError> {
        let host = self.host.clone().unwrap_or_else(|| HostServices {
            http: crate::download::HttpClient::new(),
            sink: crate::logging::default_sink(),
        });
        (self.body)(args, &host)
    }
}

type SettleFn = Box<dyn FnOnce(OnFulfilled, OnRejected) + Send>;

/// Ready-made [`Thenable`]s for native modules.
pub struct Deferred {
    settle: SettleFn,
}

impl Thenable for Deferred {
    fn then(self: Box<Self>, on_fulfilled: OnFulfilled, on_rejected: OnRejected) {
        (self.settle)(on_fulfilled, on_rejected);
    }
}

impl Deferred {
    fn boxed(settle: impl FnOnce(OnFulfilled, OnRejected) + Send + 'static) -> Box<dyn Thenable> {
        Box::new(Self {
            settle: Box::new(settle),
        })
    }

    /// Settles with the output of `future`, run on the tokio runtime.
    pub fn from_future<F>(future: F) -> Box<dyn Thenable>
    where
        F: Future<Output = Result<Value, String>> + Send + 'static,
    {
        Self::boxed(move |on_fulfilled, on_rejected| {
            tokio::spawn(async move {
                match future.await {
                    Ok(value) => on_fulfilled(value),
                    Err(message) => on_rejected(message),
                }
            });
        })
    }

    /// Fulfils immediately.
    #[must_use]
    pub fn resolved(value: Value) -> Box<dyn Thenable> {
        Self::boxed(move |on_fulfilled, _| on_fulfilled(value))
    }

    /// Rejects immediately.
    pub fn rejected(message: impl Into<String>) -> Box<dyn Thenable> {
        let message = message.into();
        Self::boxed(move |_, on_rejected| on_rejected(message))
    }

    /// Fulfils with `value` after `delay`.
    #[must_use]
    pub fn after(delay: Duration, value: Value) -> Box<dyn Thenable> {
        Self::from_future(async move {
            tokio::time::sleep(delay).await;
            Ok(value)
        })
    }

    /// Never settles.
    #[must_use]
    pub fn never() -> Box<dyn Thenable> {
        Self::boxed(|_, _| {})
    }

    /// Calls the success continuation twice, as a misbehaving module might.
    #[must_use]
    pub fn settles_twice(first: Value, second: Value) -> Box<dyn Thenable> {
        Self::boxed(move |on_fulfilled, _| {
            on_fulfilled(first);
            on_fulfilled(second);
        })
    }
}
