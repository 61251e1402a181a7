//! Remote function table.
//!
//! Payloads name a function; workers resolve that name here and invoke the
//! handler with the decoded arguments. The same table can be used on the
//! caller's side to run a call locally.

pub mod builtin;

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::payload::{ENCODING_VERSION, Payload, ResultBinding};

/// A registered function.
pub type Handler = Arc<dyn Fn(&mut Invocation) -> Result<serde_json::Value, CallError> + Send + Sync>;

/// Registry of callable functions, indexed by name.
#[derive(Clone, Default)]
pub struct FunctionRegistry {
    functions: BTreeMap<String, Handler>,
}

impl FunctionRegistry {
    /// Create an empty registry.
    pub fn empty() -> Self {
        Self::default()
    }

    /// Register `handler` under `name`, replacing any previous definition.
    pub fn register<F>(&mut self, name: impl Into<String>, handler: F) -> &mut Self
    where
        F: Fn(&mut Invocation) -> Result<serde_json::Value, CallError> + Send + Sync + 'static,
    {
        self.functions.insert(name.into(), Arc::new(handler));
        self
    }

    pub fn contains(&self, name: &str) -> bool {
        self.functions.contains_key(name)
    }

    /// Registered names, sorted.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.functions.keys().map(String::as_str)
    }

    /// Resolve and run the payload's function, then apply its result binding.
    pub fn invoke(&self, payload: &Payload) -> Result<serde_json::Value, CallError> {
        if payload.version != ENCODING_VERSION {
            return Err(CallError::new(format!(
                "unsupported payload encoding version {} (expected {ENCODING_VERSION})",
                payload.version
            )));
        }
        let handler = self.functions.get(&payload.function).ok_or_else(|| {
            CallError::new(format!("function `{}` is not registered", payload.function))
        })?;

        let mut invocation = Invocation {
            args: payload.args.clone(),
            kwargs: payload.kwargs.clone(),
            bindings: serde_json::Map::new(),
        };
        let returned = handler(&mut invocation)?;

        match &payload.result {
            ResultBinding::Return => Ok(returned),
            ResultBinding::Slot { name } => invocation.bindings.remove(name).ok_or_else(|| {
                CallError::new(format!("result slot `{name}` was never assigned"))
            }),
        }
    }
}

/// Arguments and output bindings of one call.
#[derive(Debug, Clone, Default)]
pub struct Invocation {
    pub args: Vec<serde_json::Value>,
    pub kwargs: serde_json::Map<String, serde_json::Value>,
    bindings: serde_json::Map<String, serde_json::Value>,
}

impl Invocation {
    pub fn new(
        args: Vec<serde_json::Value>,
        kwargs: serde_json::Map<String, serde_json::Value>,
    ) -> Self {
        Self {
            args,
            kwargs,
            bindings: serde_json::Map::new(),
        }
    }

    /// Argument at `index`, or the keyword argument `name`.
    pub fn arg<T: DeserializeOwned>(&self, index: usize, name: &str) -> Result<T, CallError> {
        let raw = self
            .args
            .get(index)
            .or_else(|| self.kwargs.get(name))
            .ok_or_else(|| CallError::new(format!("missing required argument `{name}`")))?;
        decode(name, raw)
    }

    /// Like [`Invocation::arg`], falling back to `default` when absent.
    pub fn arg_or<T: DeserializeOwned>(
        &self,
        index: usize,
        name: &str,
        default: T,
    ) -> Result<T, CallError> {
        match self.args.get(index).or_else(|| self.kwargs.get(name)) {
            Some(raw) => decode(name, raw),
            None => Ok(default),
        }
    }

    /// Assign an output binding.
    pub fn bind<T: Serialize>(&mut self, name: impl Into<String>, value: &T) -> Result<(), CallError> {
        let name = name.into();
        let value = serde_json::to_value(value)
            .map_err(|e| CallError::new(format!("cannot bind `{name}`: {e}")))?;
        self.bindings.insert(name, value);
        Ok(())
    }
}

fn decode<T: DeserializeOwned>(name: &str, raw: &serde_json::Value) -> Result<T, CallError> {
    serde_json::from_value(raw.clone())
        .map_err(|e| CallError::new(format!("argument `{name}` has the wrong type: {e}")))
}

/// Error raised by a function. Becomes the outcome's `error` and `trace`.
#[derive(Debug, Clone)]
pub struct CallError {
    pub message: String,
    pub trace: Option<String>,
}

impl CallError {
    /// Create an error, capturing a backtrace of the raising site.
    pub fn new(message: impl Into<String>) -> Self {
        let message = message.into();
        let backtrace = std::backtrace::Backtrace::force_capture();
        Self {
            trace: Some(format!("Error: {message}\n{backtrace}")),
            message,
        }
    }
}

impl std::fmt::Display for CallError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for CallError {}
