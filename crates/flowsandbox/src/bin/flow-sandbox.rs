//! Sandbox worker: reads one request from stdin, evaluates it, and prints the
//! result frame after the request's marker.

use flowsandbox::protocol::{self, SandboxRequest, WorkerReport};
use flowsandbox::script::{self, ScriptOptions};
use std::io::{Read, Write};
use std::process::ExitCode;

fn main() -> ExitCode {
    let mut raw = String::new();
    if let Err(err) = std::io::stdin().read_to_string(&mut raw) {
        eprintln!("flow-sandbox: failed to read request: {}", err);
        return ExitCode::from(2);
    }

    let request: SandboxRequest = match serde_json::from_str(&raw) {
        Ok(request) => request,
        Err(err) => {
            eprintln!("flow-sandbox: invalid request: {}", err);
            return ExitCode::from(2);
        }
    };

    let options = ScriptOptions {
        memory_limit: request.memory_limit,
        echo: true,
        ..ScriptOptions::default()
    };
    let report = match script::evaluate(&request.code, &request.bindings, &options) {
        Ok(outcome) => WorkerReport::success(outcome.output, outcome.logs),
        Err(failure) => WorkerReport::failure(failure.message, failure.traceback, failure.logs),
    };

    let frame = match protocol::encode_report(&request.marker, &report) {
        Ok(frame) => frame,
        Err(err) => {
            eprintln!("flow-sandbox: failed to encode result: {}", err);
            return ExitCode::from(2);
        }
    };

    let mut stdout = std::io::stdout().lock();
    if stdout
        .write_all(frame.as_bytes())
        .and_then(|_| stdout.flush())
        .is_err()
    {
        return ExitCode::from(2);
    }
    ExitCode::SUCCESS
}
