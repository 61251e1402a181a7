//! Payload builder.
//!
//! Turns a reference to a registered function plus positional and keyword
//! arguments into a self-contained [`Payload`]: the function identifier,
//! arguments encoded as JSON values under a versioned encoding, the declared
//! result binding, and the dependency manifest of the defining crate.
//!
//! Payloads name a function in the worker's function table; they never carry
//! code. This is a pre-registered remote procedure call, not code shipping.

pub mod manifest;

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::registry::FunctionRegistry;

pub use manifest::{DependencyManifest, discover_manifest};

/// Version of the argument encoding. Bumped on any incompatible change.
pub const ENCODING_VERSION: u32 = 1;

/// The executable unit shipped to a worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Payload {
    pub version: u32,
    /// Identifier resolved against the worker's function table.
    pub function: String,
    #[serde(default)]
    pub args: Vec<serde_json::Value>,
    #[serde(default)]
    pub kwargs: serde_json::Map<String, serde_json::Value>,
    #[serde(default)]
    pub result: ResultBinding,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub requirements: Option<DependencyManifest>,
}

/// How the outcome's return value is extracted from an execution.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ResultBinding {
    /// The function's return value is bound to the output slot.
    #[default]
    Return,
    /// The function must assign the named binding; an unassigned slot fails.
    Slot { name: String },
}

/// Reference to a registered function, optionally with the source file it was
/// defined in (used to discover the dependency manifest).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FunctionRef {
    pub name: String,
    pub defined_in: Option<PathBuf>,
}

impl FunctionRef {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            defined_in: None,
        }
    }

    pub fn defined_in(mut self, path: impl Into<PathBuf>) -> Self {
        self.defined_in = Some(path.into());
        self
    }
}

/// Build a [`FunctionRef`] located at the calling crate's manifest directory.
/// Works the same inside a workspace member, where `file!()` would be
/// relative to the workspace root.
#[macro_export]
macro_rules! function_ref {
    ($name:expr) => {
        $crate::payload::FunctionRef::new($name).defined_in(env!("CARGO_MANIFEST_DIR"))
    };
}

/// Builder for payloads. Argument encoding errors are deferred to `build`.
pub struct PayloadBuilder {
    function: FunctionRef,
    args: Vec<serde_json::Value>,
    kwargs: serde_json::Map<String, serde_json::Value>,
    result: ResultBinding,
    error: Option<Error>,
}

impl PayloadBuilder {
    pub fn new(function: FunctionRef) -> Self {
        Self {
            function,
            args: Vec::new(),
            kwargs: serde_json::Map::new(),
            result: ResultBinding::Return,
            error: None,
        }
    }

    /// Append a positional argument.
    pub fn arg<T: Serialize + ?Sized>(mut self, value: &T) -> Self {
        let position = self.args.len().to_string();
        match encode_argument(&position, value) {
            Ok(v) => self.args.push(v),
            Err(e) => {
                self.error.get_or_insert(e);
            }
        }
        self
    }

    /// Set a keyword argument.
    pub fn kwarg<T: Serialize + ?Sized>(mut self, name: impl Into<String>, value: &T) -> Self {
        let name = name.into();
        match encode_argument(&name, value) {
            Ok(v) => {
                self.kwargs.insert(name, v);
            }
            Err(e) => {
                self.error.get_or_insert(e);
            }
        }
        self
    }

    /// Declare that the function assigns its result to the named slot.
    pub fn bind_result(mut self, slot: impl Into<String>) -> Self {
        self.result = ResultBinding::Slot { name: slot.into() };
        self
    }

    /// Finish the payload.
    ///
    /// # Errors
    ///
    /// `SourceUnavailable` if the function reference is empty or malformed,
    /// `UnserializableArgument` if any argument failed to encode.
    pub fn build(self) -> Result<Payload> {
        if let Some(e) = self.error {
            return Err(e);
        }
        let name = normalize_name(&self.function.name)?;
        let requirements = self
            .function
            .defined_in
            .as_deref()
            .and_then(discover_manifest);

        Ok(Payload {
            version: ENCODING_VERSION,
            function: name,
            args: self.args,
            kwargs: self.kwargs,
            result: self.result,
            requirements,
        })
    }

    /// Finish the payload, also checking the function exists in `registry`.
    pub fn build_for(self, registry: &FunctionRegistry) -> Result<Payload> {
        let payload = self.build()?;
        if !registry.contains(&payload.function) {
            return Err(Error::SourceUnavailable(format!(
                "function `{}` has no registered definition",
                payload.function
            )));
        }
        Ok(payload)
    }
}

/// Encode one argument under the fixed JSON encoding.
pub fn encode_argument<T: Serialize + ?Sized>(
    position: &str,
    value: &T,
) -> Result<serde_json::Value> {
    serde_json::to_value(value).map_err(|e| Error::UnserializableArgument {
        position: position.to_string(),
        reason: e.to_string(),
    })
}

fn normalize_name(raw: &str) -> Result<String> {
    let name = raw.trim();
    let valid = !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | ':' | '-'));
    if valid {
        Ok(name.to_string())
    } else {
        Err(Error::SourceUnavailable(format!(
            "`{raw}` is not a function identifier"
        )))
    }
}
