// crates/flowsandbox/tests/runner_test.rs

use flowsandbox::{
    run_inline, Bindings, SandboxConfig, SandboxError, SandboxId, SandboxLimits, SandboxRunner,
    SandboxStatus,
};
use serde_json::json;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

fn init_tracing() {
    use tracing_subscriber::{fmt, EnvFilter};
    let _ = fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("debug")))
        .with_test_writer()
        .try_init();
}

fn runner() -> SandboxRunner {
    SandboxRunner::new(SandboxConfig::default().with_worker(env!("CARGO_BIN_EXE_flow-sandbox")))
}

fn limits() -> SandboxLimits {
    SandboxLimits::default()
        .with_timeout(Duration::from_secs(20))
        .with_grace(Duration::from_millis(500))
}

#[cfg(unix)]
fn process_gone(pid: u32) -> bool {
    use nix::sys::signal::kill;
    use nix::unistd::Pid;
    matches!(
        kill(Pid::from_raw(pid as i32), None),
        Err(nix::errno::Errno::ESRCH)
    )
}

#[tokio::test]
async fn test_successful_run_returns_output_and_logs() {
    init_tracing();
    let mut bindings = Bindings::new();
    bindings.insert("value".to_string(), json!(21));

    let result = runner()
        .run("print('doubling')\noutput.result = inputs.value * 2", &bindings, &limits())
        .await
        .unwrap();

    assert_eq!(result.status, SandboxStatus::Success, "{:?}", result);
    assert_eq!(result.output["result"], json!(42));
    assert_eq!(result.logs, vec!["doubling".to_string()]);
    assert_eq!(result.stdout, "doubling");
    assert_eq!(result.exit_code, Some(0));
}

#[tokio::test]
async fn test_script_error_is_reported() {
    let mut bindings = Bindings::new();
    bindings.insert("value".to_string(), json!(10));

    let result = runner()
        .run("output.x = inputs.value // 0", &bindings, &limits())
        .await
        .unwrap();

    assert_eq!(result.status, SandboxStatus::Error);
    let error = result.error.unwrap_or_default();
    assert!(error.contains("n//0"), "error: {}", error);
}

#[tokio::test]
async fn test_float_division_by_zero_is_a_script_error() {
    let mut bindings = Bindings::new();
    bindings.insert("value".to_string(), json!(10));

    let result = runner()
        .run("output.x = inputs.value / 0", &bindings, &limits())
        .await
        .unwrap();

    assert_eq!(result.status, SandboxStatus::Error);
    assert!(result.reported);
    assert!(result.output.is_empty());
    let error = result.error.unwrap_or_default();
    assert!(error.contains("non-finite"), "error: {}", error);
}

#[tokio::test]
async fn test_timeout_terminates_process() {
    init_tracing();
    let limits = SandboxLimits::default()
        .with_timeout(Duration::from_millis(300))
        .with_grace(Duration::from_millis(500));

    let started = Instant::now();
    let result = runner()
        .run("while true do end", &Bindings::new(), &limits)
        .await
        .unwrap();

    assert_eq!(result.status, SandboxStatus::Timeout);
    assert!(result.output.is_empty());
    assert!(started.elapsed() < Duration::from_secs(5));

    #[cfg(unix)]
    assert!(process_gone(result.pid.unwrap()));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_cancel_by_id_waits_for_process_exit() {
    init_tracing();
    let runner = Arc::new(runner());
    let id = SandboxId::new_v4();

    let task = {
        let runner = runner.clone();
        tokio::spawn(async move {
            runner
                .run_with_id(id, "while true do end", &Bindings::new(), &limits(), CancellationToken::new())
                .await
        })
    };

    let pid = loop {
        if let Some(pid) = runner.pid(&id) {
            break pid;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    };

    assert!(runner.cancel(&id).await);
    assert!(!runner.is_running(&id));

    #[cfg(unix)]
    assert!(process_gone(pid));
    #[cfg(not(unix))]
    let _ = pid;

    let result = task.await.unwrap();
    assert!(matches!(result, Err(SandboxError::Cancelled)));
    assert!(!runner.cancel(&id).await);
}

#[tokio::test]
async fn test_caller_token_cancels_run() {
    let runner = runner();
    let token = CancellationToken::new();
    let trigger = token.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(200)).await;
        trigger.cancel();
    });

    let result = runner
        .run_with_id(SandboxId::new_v4(), "while true do end", &Bindings::new(), &limits(), token)
        .await;
    assert!(matches!(result, Err(SandboxError::Cancelled)));
    assert!(runner.running().is_empty());
}

#[tokio::test]
async fn test_output_limit() {
    let limits = limits().with_max_output(1024);
    let result = runner()
        .run("for i = 1, 100000 do print('xxxxxxxxxxxxxxxxxxxxxxxxxxxxxxxxx') end", &Bindings::new(), &limits)
        .await
        .unwrap();

    assert_eq!(result.status, SandboxStatus::Error);
    assert!(result.error.unwrap_or_default().contains("Output exceeded"));
}

#[cfg(unix)]
#[tokio::test]
async fn test_missing_marker_attaches_raw_streams() {
    let runner = SandboxRunner::new(SandboxConfig::default().with_worker("/bin/cat"));
    let result = runner
        .run("output.x = 1", &Bindings::new(), &limits())
        .await
        .unwrap();

    assert_eq!(result.status, SandboxStatus::Error);
    assert!(result.error.unwrap_or_default().contains("No execution result found"));
    // cat echoes the request back, marker included, but no report follows it
    assert!(result.stdout.contains("output.x = 1"));
}

#[tokio::test]
async fn test_missing_worker_is_spawn_error() {
    let runner = SandboxRunner::new(SandboxConfig::default().with_worker("/nonexistent/flow-sandbox"));
    let result = runner.run("output.x = 1", &Bindings::new(), &limits()).await;
    assert!(matches!(result, Err(SandboxError::Spawn { .. })));
}

#[tokio::test]
async fn test_inline_run_captures_logs() {
    let result = run_inline(
        "print('inline')\noutput.ok = true",
        &Bindings::new(),
        &limits(),
        &CancellationToken::new(),
    )
    .await
    .unwrap();

    assert_eq!(result.status, SandboxStatus::Success);
    assert_eq!(result.logs, vec!["inline".to_string()]);
    assert_eq!(result.output["ok"], json!(true));
}

#[tokio::test]
async fn test_inline_timeout_and_cancel() {
    let short = SandboxLimits::default().with_timeout(Duration::from_millis(200));
    let result = run_inline("while true do end", &Bindings::new(), &short, &CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(result.status, SandboxStatus::Timeout);

    let token = CancellationToken::new();
    let trigger = token.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(100)).await;
        trigger.cancel();
    });
    let result = run_inline("while true do end", &Bindings::new(), &limits(), &token).await;
    assert!(matches!(result, Err(SandboxError::Cancelled)));
}
