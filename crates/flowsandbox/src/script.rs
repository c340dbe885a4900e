//! Capability-scoped Lua evaluation.
//!
//! A script only sees the `table`, `string`, `math` and `utf8` libraries plus
//! the bindings injected by the caller: the whole input map as `inputs`, and
//! each top-level key as a global of its own unless that name is taken.
//! `print` is captured into the returned log lines. Whatever the script leaves
//! in the global `output` table becomes the result.

use crate::Bindings;
use mlua::{HookTriggers, Lua, LuaOptions, LuaSerdeExt, StdLib, Value, Variadic};
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Instant;

pub const OUTPUT_BINDING: &str = "output";
pub const INPUTS_BINDING: &str = "inputs";

const HOOK_INSTRUCTIONS: u32 = 1000;
const REMOVED_GLOBALS: [&str; 4] = ["dofile", "loadfile", "load", "require"];

#[derive(Debug, Clone, Default)]
pub struct ScriptOptions {
    pub deadline: Option<Instant>,
    /// Set to abort the script at the next hook check
    pub interrupt: Option<Arc<AtomicBool>>,
    pub memory_limit: Option<usize>,
    /// Also write printed lines to stdout
    pub echo: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ScriptOutcome {
    pub output: Bindings,
    pub logs: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    Error,
    Interrupted,
    DeadlineExceeded,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ScriptFailure {
    pub kind: FailureKind,
    pub message: String,
    pub traceback: Option<String>,
    pub logs: Vec<String>,
}

/// Evaluate `code` against `bindings`. Blocking; run it off the async executor.
pub fn evaluate(
    code: &str,
    bindings: &Bindings,
    options: &ScriptOptions,
) -> Result<ScriptOutcome, ScriptFailure> {
    let logs = Arc::new(Mutex::new(Vec::new()));
    let stopped = Arc::new(Mutex::new(None));

    let result = execute(code, bindings, options, &logs, &stopped);
    let logs = std::mem::take(&mut *logs.lock().unwrap_or_else(PoisonError::into_inner));

    match result {
        Ok(output) => Ok(ScriptOutcome { output, logs }),
        Err(err) => {
            let (message, traceback) = describe(&err);
            let kind = stopped
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .unwrap_or(FailureKind::Error);
            Err(ScriptFailure {
                kind,
                message,
                traceback,
                logs,
            })
        }
    }
}

fn execute(
    code: &str,
    bindings: &Bindings,
    options: &ScriptOptions,
    logs: &Arc<Mutex<Vec<String>>>,
    stopped: &Arc<Mutex<Option<FailureKind>>>,
) -> mlua::Result<Bindings> {
    let lua = Lua::new_with(
        StdLib::TABLE | StdLib::STRING | StdLib::MATH | StdLib::UTF8,
        LuaOptions::default(),
    )?;
    if let Some(limit) = options.memory_limit {
        lua.set_memory_limit(limit)?;
    }

    let globals = lua.globals();
    for name in REMOVED_GLOBALS {
        globals.set(name, Value::Nil)?;
    }

    let sink = logs.clone();
    let echo = options.echo;
    let print = lua.create_function(move |_, args: Variadic<Value>| {
        let line = args.iter().map(display).collect::<Vec<_>>().join("\t");
        if echo {
            println!("{}", line);
        }
        sink.lock().unwrap_or_else(PoisonError::into_inner).push(line);
        Ok(())
    })?;
    globals.set("print", print)?;

    globals.set(INPUTS_BINDING, lua.to_value(bindings)?)?;
    for (key, value) in bindings {
        if !globals.contains_key(key.as_str())? {
            globals.set(key.as_str(), lua.to_value(value)?)?;
        }
    }
    globals.set(OUTPUT_BINDING, lua.create_table()?)?;

    if options.deadline.is_some() || options.interrupt.is_some() {
        let deadline = options.deadline;
        let interrupt = options.interrupt.clone();
        let stopped = stopped.clone();
        lua.set_hook(
            HookTriggers::new().every_nth_instruction(HOOK_INSTRUCTIONS),
            move |_, _| {
                let reason = if interrupt
                    .as_ref()
                    .is_some_and(|flag| flag.load(Ordering::Relaxed))
                {
                    Some((FailureKind::Interrupted, "script interrupted"))
                } else if deadline.is_some_and(|at| Instant::now() >= at) {
                    Some((FailureKind::DeadlineExceeded, "script exceeded its time limit"))
                } else {
                    None
                };
                match reason {
                    Some((kind, message)) => {
                        *stopped.lock().unwrap_or_else(PoisonError::into_inner) = Some(kind);
                        Err(mlua::Error::runtime(message))
                    }
                    None => Ok(()),
                }
            },
        );
    }

    lua.load(code).set_name("code").exec()?;
    lua.remove_hook();

    let output: Value = globals.get(OUTPUT_BINDING)?;
    ensure_finite(&output, OUTPUT_BINDING, &mut HashSet::new())?;
    let output: serde_json::Value = lua.from_value(output)?;
    Ok(into_bindings(output))
}

/// JSON has no NaN or infinity, so a float such as `1 / 0` would silently turn
/// into null. Reject it with the path of the offending value instead.
fn ensure_finite(value: &Value, path: &str, seen: &mut HashSet<usize>) -> mlua::Result<()> {
    match value {
        Value::Number(n) if !n.is_finite() => Err(mlua::Error::runtime(format!(
            "non-finite number {} in {} (division by zero?)",
            n, path
        ))),
        Value::Table(table) => {
            if !seen.insert(table.to_pointer() as usize) {
                return Ok(());
            }
            for pair in table.clone().pairs::<Value, Value>() {
                let (key, item) = pair?;
                ensure_finite(&item, &format!("{}.{}", path, display(&key)), seen)?;
            }
            Ok(())
        }
        _ => Ok(()),
    }
}

fn into_bindings(value: serde_json::Value) -> Bindings {
    match value {
        serde_json::Value::Object(map) => map,
        serde_json::Value::Null => Bindings::new(),
        serde_json::Value::Array(items) if items.is_empty() => Bindings::new(),
        other => {
            let mut map = Bindings::new();
            map.insert("result".to_string(), other);
            map
        }
    }
}

fn display(value: &Value) -> String {
    match value {
        Value::Nil => "nil".to_string(),
        Value::String(s) => s.to_string_lossy().into_owned(),
        other => other
            .to_string()
            .unwrap_or_else(|_| format!("<{}>", other.type_name())),
    }
}

/// Split an mlua error into a message and an optional traceback
fn describe(err: &mlua::Error) -> (String, Option<String>) {
    match err {
        mlua::Error::CallbackError { traceback, cause } => {
            let (message, _) = describe(cause);
            (message, Some(traceback.clone()))
        }
        mlua::Error::RuntimeError(msg) | mlua::Error::MemoryError(msg) => split_traceback(msg),
        mlua::Error::SyntaxError { message, .. } => split_traceback(message),
        other => split_traceback(&other.to_string()),
    }
}

fn split_traceback(text: &str) -> (String, Option<String>) {
    match text.find("\nstack traceback:") {
        Some(at) => (text[..at].to_string(), Some(text[at + 1..].to_string())),
        None => (text.to_string(), None),
    }
}
