//! QuickJS evaluation of script bodies.

use std::sync::{Arc, Mutex};

use rquickjs::{Context, Ctx, Function, Object, Runtime, Value, convert::Coerced};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::script::Parameter;

/// Global name of the output sink handed to every script
pub const OUTPUT_SINK: &str = "out";

/// Names a parameter may not shadow
pub const RESERVED_VARIABLES: &[&str] = &[OUTPUT_SINK];

/// Captured output and final value of one evaluation.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Evaluation {
    pub output: String,
    #[serde(default)]
    pub terminal_value: serde_json::Value,
}

/// Resource limits for a single evaluation
#[derive(Debug, Clone)]
pub struct EvalLimits {
    pub max_memory_mb: usize,
    pub max_script_size_bytes: usize,
}

impl Default for EvalLimits {
    fn default() -> Self {
        Self {
            max_memory_mb: 64,
            max_script_size_bytes: 1_000_000,
        }
    }
}

/// Evaluate with default limits.
pub fn evaluate(body: &str, parameters: &[Parameter]) -> Result<Evaluation, String> {
    evaluate_with_limits(body, parameters, &EvalLimits::default())
}

/// Run `body` in a fresh runtime.
///
/// The body is wrapped in a function so a top-level `return` yields the terminal value.
/// Each parameter becomes a string global, and `out.print`/`out.println` append to the
/// captured output. On failure the error message is returned, with whatever was printed
/// before the failure appended.
pub fn evaluate_with_limits(
    body: &str,
    parameters: &[Parameter],
    limits: &EvalLimits,
) -> Result<Evaluation, String> {
    if body.len() > limits.max_script_size_bytes {
        return Err(format!(
            "Script too large: {} bytes (max: {})",
            body.len(),
            limits.max_script_size_bytes
        ));
    }

    let rt = Runtime::new().map_err(|e| format!("Runtime creation error: {}", e))?;
    rt.set_memory_limit(limits.max_memory_mb * 1024 * 1024);
    let context = Context::full(&rt).map_err(|e| format!("Context creation error: {}", e))?;

    let output = Arc::new(Mutex::new(String::new()));
    let wrapped = format!("(function(){{\n{}\n}})()", body);

    let result = context.with(|ctx| -> Result<serde_json::Value, String> {
        install_globals(&ctx, parameters, &output).map_err(|e| describe_error(&ctx, e))?;
        let value: Value = ctx
            .eval(wrapped.as_str())
            .map_err(|e| describe_error(&ctx, e))?;
        to_json(&ctx, value).map_err(|e| describe_error(&ctx, e))
    });

    let output = output.lock().map(|o| o.clone()).unwrap_or_default();
    match result {
        Ok(terminal_value) => {
            debug!("Script evaluated, {} byte(s) of output", output.len());
            Ok(Evaluation {
                output,
                terminal_value,
            })
        }
        Err(message) if output.is_empty() => Err(message),
        Err(message) => Err(format!("{}\n{}", message, output)),
    }
}

fn install_globals<'js>(
    ctx: &Ctx<'js>,
    parameters: &[Parameter],
    output: &Arc<Mutex<String>>,
) -> Result<(), rquickjs::Error> {
    let global = ctx.globals();

    for parameter in parameters {
        if RESERVED_VARIABLES.contains(&parameter.name.as_str()) {
            warn!("Skipping parameter {} named like a reserved variable", parameter.name);
            if let Ok(mut out) = output.lock() {
                out.push_str(&format!(
                    "Skipping parameter {} because its name is a reserved variable\n",
                    parameter.name
                ));
            }
            continue;
        }
        global.set(parameter.name.as_str(), parameter.value.as_str())?;
    }

    let sink = Object::new(ctx.clone())?;

    let out_println = Arc::clone(output);
    let println = Function::new(
        ctx.clone(),
        move |_c: Ctx<'_>, msg: Coerced<String>| -> Result<(), rquickjs::Error> {
            if let Ok(mut out) = out_println.lock() {
                out.push_str(&msg.0);
                out.push('\n');
            }
            Ok(())
        },
    )?;
    sink.set("println", println)?;

    let out_print = Arc::clone(output);
    let print = Function::new(
        ctx.clone(),
        move |_c: Ctx<'_>, msg: Coerced<String>| -> Result<(), rquickjs::Error> {
            if let Ok(mut out) = out_print.lock() {
                out.push_str(&msg.0);
            }
            Ok(())
        },
    )?;
    sink.set("print", print)?;

    global.set(OUTPUT_SINK, sink)?;
    Ok(())
}

fn to_json<'js>(ctx: &Ctx<'js>, value: Value<'js>) -> Result<serde_json::Value, rquickjs::Error> {
    if value.is_undefined() || value.is_null() {
        return Ok(serde_json::Value::Null);
    }
    if let Some(b) = value.as_bool() {
        return Ok(serde_json::Value::Bool(b));
    }
    if let Some(i) = value.as_int() {
        return Ok(serde_json::Value::from(i));
    }
    if let Some(f) = value.as_float() {
        return Ok(number_to_json(f));
    }
    if let Some(s) = value.as_string() {
        return Ok(serde_json::Value::String(s.to_string()?));
    }

    // everything else goes through JSON.stringify; functions and symbols come back undefined
    let json: Object = ctx.globals().get("JSON")?;
    let stringify: Function = json.get("stringify")?;
    let text: Option<String> = stringify.call((value,))?;
    Ok(text
        .and_then(|t| serde_json::from_str(&t).ok())
        .unwrap_or(serde_json::Value::Null))
}

fn number_to_json(f: f64) -> serde_json::Value {
    if f.fract() == 0.0 && f.abs() < i64::MAX as f64 {
        serde_json::Value::from(f as i64)
    } else {
        serde_json::Number::from_f64(f)
            .map(serde_json::Value::Number)
            .unwrap_or(serde_json::Value::Null)
    }
}

fn describe_error(ctx: &Ctx<'_>, err: rquickjs::Error) -> String {
    if !matches!(err, rquickjs::Error::Exception) {
        return format!("JavaScript execution error: {}", err);
    }
    let thrown = ctx.catch();
    if let Some(exception) = thrown.as_exception() {
        let message = exception.message().unwrap_or_default();
        return match exception.stack() {
            Some(stack) if !stack.is_empty() => format!("Error: {}\n{}", message, stack),
            _ => format!("Error: {}", message),
        };
    }
    if let Some(s) = thrown.as_string().and_then(|s| s.to_string().ok()) {
        return format!("Uncaught: {}", s);
    }
    "Uncaught JavaScript exception".to_string()
}
