//! Standard function table shipped with the `roam` binary.

use std::time::Duration;

use serde_json::{Value, json};

use super::{CallError, FunctionRegistry, Invocation};

/// The functions every stock worker can run.
pub fn standard() -> FunctionRegistry {
    let mut registry = FunctionRegistry::empty();
    registry
        .register("add_numbers", |_| Ok(json!(1 + 1)))
        .register("multiply", multiply)
        .register("greet", greet)
        .register("divide", divide)
        .register("fibonacci", fibonacci)
        .register("sleep", sleep)
        .register("print_then_fail", print_then_fail)
        .register("describe", describe);
    registry
}

fn number(inv: &Invocation, index: usize, name: &str) -> Result<Value, CallError> {
    let v: Value = inv.arg(index, name)?;
    if v.is_number() {
        Ok(v)
    } else {
        Err(CallError::new(format!("argument `{name}` must be a number, got {v}")))
    }
}

fn multiply(inv: &mut Invocation) -> Result<Value, CallError> {
    let a = number(inv, 0, "a")?;
    let b = number(inv, 1, "b")?;
    if let (Some(x), Some(y)) = (a.as_i64(), b.as_i64()) {
        if let Some(product) = x.checked_mul(y) {
            return Ok(json!(product));
        }
    }
    let x = a.as_f64().unwrap_or_default();
    let y = b.as_f64().unwrap_or_default();
    Ok(json!(x * y))
}

fn greet(inv: &mut Invocation) -> Result<Value, CallError> {
    let name: String = inv.arg(0, "name")?;
    let greeting: String = inv.arg_or(1, "greeting", "Hello".to_string())?;
    Ok(json!(format!("{greeting}, {name}!")))
}

fn divide(inv: &mut Invocation) -> Result<Value, CallError> {
    let a = number(inv, 0, "a")?.as_f64().unwrap_or_default();
    let b = number(inv, 1, "b")?.as_f64().unwrap_or_default();
    if b == 0.0 {
        return Err(CallError::new("division by zero"));
    }
    Ok(json!(a / b))
}

fn fibonacci(inv: &mut Invocation) -> Result<Value, CallError> {
    let n: u64 = inv.arg(0, "n")?;
    if n <= 1 {
        return Ok(json!(n));
    }
    let (mut a, mut b) = (0u64, 1u64);
    for _ in 2..=n {
        let next = a
            .checked_add(b)
            .ok_or_else(|| CallError::new(format!("fibonacci({n}) overflows u64")))?;
        a = b;
        b = next;
    }
    Ok(json!(b))
}

fn sleep(inv: &mut Invocation) -> Result<Value, CallError> {
    let seconds: f64 = inv.arg(0, "seconds")?;
    if !seconds.is_finite() || seconds < 0.0 {
        return Err(CallError::new("seconds must be a non-negative number"));
    }
    println!("sleeping for {seconds}s");
    std::thread::sleep(Duration::from_secs_f64(seconds));
    Ok(json!(seconds))
}

fn print_then_fail(inv: &mut Invocation) -> Result<Value, CallError> {
    let message: String = inv.arg(0, "message")?;
    println!("about to fail: {message}");
    Err(CallError::new(message))
}

/// Binds `mean` and `max` of a list of numbers. Pair with a slot result binding.
fn describe(inv: &mut Invocation) -> Result<Value, CallError> {
    let values: Vec<f64> = inv.arg(0, "values")?;
    if values.is_empty() {
        return Err(CallError::new("values must not be empty"));
    }
    let mean = values.iter().sum::<f64>() / values.len() as f64;
    let max = values.iter().copied().fold(f64::NEG_INFINITY, f64::max);
    inv.bind("mean", &mean)?;
    inv.bind("max", &max)?;
    Ok(Value::Null)
}
