//! Child side of process isolation, and the outcome-line protocol.
//!
//! The worker re-executes the `roam` binary in `exec` mode. The child reads
//! one payload (from `ROAM_PAYLOAD` or stdin), invokes the function, lets the
//! function write freely to stdout, and finally prints exactly one line
//! starting with [`OUTCOME_MARKER`] followed by the outcome JSON.

use std::io::{Read, Write};
use std::panic::AssertUnwindSafe;
use std::process::ExitCode;
use std::sync::Mutex;

use crate::model::{FailureKind, Outcome};
use crate::payload::Payload;
use crate::registry::FunctionRegistry;

/// Prefix of the structured outcome line.
pub const OUTCOME_MARKER: &str = "__ROAM_OUTCOME__ ";

/// Environment variable that carries the payload when stdin is unavailable
/// (orchestrated sandboxes).
pub const PAYLOAD_ENV: &str = "ROAM_PAYLOAD";

static LAST_PANIC: Mutex<Option<String>> = Mutex::new(None);

/// Entry point of `roam exec`.
pub fn run(registry: &FunctionRegistry) -> ExitCode {
    let outcome = match read_payload() {
        Ok(payload) => execute(registry, &payload),
        Err(e) => Outcome::failure(FailureKind::Infrastructure, format!("cannot read payload: {e}")),
    };

    let line = match serde_json::to_string(&outcome) {
        Ok(json) => json,
        Err(e) => {
            // Return values are JSON already; this only trips on exotic floats.
            let fallback = Outcome::failure(FailureKind::UserError, format!("cannot encode outcome: {e}"));
            serde_json::to_string(&fallback).unwrap_or_default()
        }
    };

    let mut stdout = std::io::stdout().lock();
    let written = writeln!(stdout).and_then(|_| writeln!(stdout, "{OUTCOME_MARKER}{line}"));
    if written.and_then(|_| stdout.flush()).is_err() {
        return ExitCode::from(3);
    }
    ExitCode::SUCCESS
}

fn read_payload() -> Result<Payload, String> {
    let raw = match std::env::var(PAYLOAD_ENV) {
        Ok(raw) => raw,
        Err(_) => {
            let mut buf = String::new();
            std::io::stdin()
                .read_to_string(&mut buf)
                .map_err(|e| e.to_string())?;
            buf
        }
    };
    serde_json::from_str(&raw).map_err(|e| e.to_string())
}

/// Run the payload in this process, converting errors and panics to data.
pub fn execute(registry: &FunctionRegistry, payload: &Payload) -> Outcome {
    std::panic::set_hook(Box::new(|info| {
        let backtrace = std::backtrace::Backtrace::force_capture();
        let mut last = LAST_PANIC.lock().unwrap_or_else(|e| e.into_inner());
        *last = Some(format!("{info}\n{backtrace}"));
    }));

    let result = std::panic::catch_unwind(AssertUnwindSafe(|| registry.invoke(payload)));
    let _ = std::panic::take_hook();

    match result {
        Ok(Ok(value)) => Outcome::success(value),
        Ok(Err(e)) => {
            let mut outcome = Outcome::failure(FailureKind::UserError, e.message);
            outcome.trace = e.trace;
            outcome
        }
        Err(panic) => {
            let message = panic
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| panic.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "function panicked".to_string());
            let trace = LAST_PANIC
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .take()
                .unwrap_or_else(|| message.clone());
            Outcome::failure(FailureKind::UserError, format!("panicked: {message}")).with_trace(trace)
        }
    }
}

/// Split a child's stdout into the function's own output and the outcome.
///
/// Returns None when no parseable outcome line is present.
pub fn parse_output(stdout: &str) -> Option<(String, Outcome)> {
    let start = if stdout.starts_with(OUTCOME_MARKER) {
        0
    } else {
        stdout.rfind(&format!("\n{OUTCOME_MARKER}"))? + 1
    };
    let line = stdout[start + OUTCOME_MARKER.len()..].lines().next()?;
    let outcome: Outcome = serde_json::from_str(line).ok()?;

    // The child writes one newline of its own before the marker line.
    let user = &stdout[..start];
    let user = user.strip_suffix('\n').unwrap_or(user);
    Some((user.to_string(), outcome))
}
