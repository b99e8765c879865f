//! Tests for server process supervision.
//!
//! Uses ordinary shell processes in place of database servers, so these run
//! without a container runtime.

#![cfg(unix)]

use std::time::{Duration, Instant};

use dbtest::supervisor::{Exit, LaunchSpec, Supervisor};
use dbtest::{CrashPolicy, DriverError, ErrorKind};
use dbtest_test_utils::init_tracing;

/// Set in the re-executed test binary that hosts the abort-policy crash.
const ABORT_CHILD_ENV: &str = "DBTEST_ABORT_POLICY_CHILD";

fn sh(label: &str, script: &str) -> LaunchSpec {
    LaunchSpec::new(label, "sh").args(["-c", script])
}

// ===========================================================================
// Expected shutdown
// ===========================================================================

#[tokio::test]
async fn stop_terminates_process_within_grace_period() {
    init_tracing();
    let mut sup = Supervisor::launch(sh("sleeper", "exec sleep 30"), CrashPolicy::Report).unwrap();
    assert!(sup.is_running());
    assert!(sup.check().is_ok());

    let started = Instant::now();
    sup.stop(Duration::from_secs(5)).await.unwrap();
    assert!(started.elapsed() < Duration::from_secs(5));
    assert!(!sup.is_running());
    assert_eq!(sup.wait_exit().await, Some(Exit::Expected));
}

#[tokio::test]
async fn stop_twice_is_a_noop() {
    init_tracing();
    let mut sup = Supervisor::launch(sh("sleeper", "exec sleep 30"), CrashPolicy::Report).unwrap();
    sup.stop(Duration::from_secs(5)).await.unwrap();

    let started = Instant::now();
    sup.stop(Duration::from_secs(5)).await.unwrap();
    assert!(started.elapsed() < Duration::from_millis(100));
}

#[tokio::test]
async fn stop_times_out_when_process_ignores_interrupt() {
    init_tracing();
    let mut sup = Supervisor::launch(
        sh("stubborn", "trap '' INT; while true; do sleep 1; done"),
        CrashPolicy::Report,
    )
    .unwrap();
    // Give the shell time to install its trap.
    tokio::time::sleep(Duration::from_millis(200)).await;

    let err = sup.stop(Duration::from_millis(500)).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Timeout);
    assert!(
        err.to_string().contains("timeout waiting for stubborn process to die"),
        "unexpected message: {err}"
    );

    // Terminal after the timeout.
    sup.stop(Duration::from_millis(500)).await.unwrap();
}

// ===========================================================================
// Unexpected death
// ===========================================================================

#[tokio::test]
async fn unexpected_exit_is_reported_with_output() {
    init_tracing();
    let spec = sh("crasher", "echo booting; echo 'fatal: disk full' >&2; exit 3")
        .probe("echo sibling-listing");
    let mut sup = Supervisor::launch(spec, CrashPolicy::Report).unwrap();

    let exit = tokio::time::timeout(Duration::from_secs(5), sup.wait_exit())
        .await
        .expect("monitor should observe the exit");
    let Some(Exit::Crashed(report)) = exit else {
        panic!("expected a crash, got {exit:?}");
    };
    assert_eq!(report.label, "crasher");
    assert!(report.output.contains("booting"), "output: {}", report.output);
    assert!(report.output.contains("fatal: disk full"), "output: {}", report.output);
    assert!(report.status.contains('3'), "status: {}", report.status);
    assert!(report.siblings.contains("sibling-listing"));

    let err = sup.check().unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Crash);

    // Stopping a crashed process reports the crash once, then is a no-op.
    let err = sup.stop(Duration::from_secs(1)).await.unwrap_err();
    assert!(matches!(err, DriverError::Crashed(_)));
    sup.stop(Duration::from_secs(1)).await.unwrap();
}

#[tokio::test]
async fn crash_is_not_masked_by_stop_during_output_drain() {
    init_tracing();
    // The backgrounded sleep keeps the output pipes open after the shell
    // exits, so the monitor is still draining when stop() arrives.
    let mut sup = Supervisor::launch(
        sh("leaky-crasher", "(sleep 3) & echo dying; exit 3"),
        CrashPolicy::Report,
    )
    .unwrap();
    tokio::time::sleep(Duration::from_millis(300)).await;

    let report = match sup.stop(Duration::from_secs(5)).await {
        Err(DriverError::Crashed(report)) => report,
        other => panic!("expected the crash to be reported, got {other:?}"),
    };
    assert_eq!(report.label, "leaky-crasher");
    assert!(report.status.contains('3'), "status: {}", report.status);
    assert!(matches!(sup.wait_exit().await, Some(Exit::Crashed(_))));
}

#[tokio::test]
async fn external_kill_is_detected_promptly() {
    init_tracing();
    let mut sup = Supervisor::launch(sh("victim", "exec sleep 30"), CrashPolicy::Report).unwrap();
    let pid = libc::pid_t::try_from(sup.pid()).unwrap();

    // SAFETY: signalling our own child process.
    let ret = unsafe { libc::kill(pid, libc::SIGKILL) };
    assert_eq!(ret, 0);

    let exit = tokio::time::timeout(Duration::from_secs(2), sup.wait_exit())
        .await
        .expect("crash must be observed within the deadline");
    assert!(matches!(exit, Some(Exit::Crashed(_))), "got {exit:?}");
    assert!(!sup.is_running());
    assert_eq!(sup.check().unwrap_err().kind(), ErrorKind::Crash);
}

// ===========================================================================
// Launch failures
// ===========================================================================

#[tokio::test]
async fn missing_program_is_a_launch_error() {
    init_tracing();
    let spec = LaunchSpec::new("ghost", "dbtest-definitely-not-a-real-binary");
    let err = Supervisor::launch(spec, CrashPolicy::Report).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Launch);
    assert!(err.to_string().contains("dbtest-definitely-not-a-real-binary"));
}

#[tokio::test]
async fn output_is_captured_while_running() {
    init_tracing();
    let mut sup = Supervisor::launch(
        sh("chatty", "echo ready; exec sleep 30"),
        CrashPolicy::Report,
    )
    .unwrap();

    let deadline = Instant::now() + Duration::from_secs(5);
    while !sup.output().contains("ready") {
        assert!(Instant::now() < deadline, "output never captured");
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    sup.stop(Duration::from_secs(5)).await.unwrap();
}

// ===========================================================================
// Abort policy
// ===========================================================================

/// Runs only inside the re-executed binary started by
/// `crash_under_abort_policy_aborts_the_process`.
#[tokio::test]
async fn abort_policy_child() {
    if std::env::var_os(ABORT_CHILD_ENV).is_none() {
        return;
    }
    let _sup = Supervisor::launch(
        sh("doomed", "echo last words; exit 7"),
        CrashPolicy::Abort,
    )
    .unwrap();
    tokio::time::sleep(Duration::from_secs(10)).await;
    panic!("process survived a crash under CrashPolicy::Abort");
}

#[test]
fn crash_under_abort_policy_aborts_the_process() {
    use std::os::unix::process::ExitStatusExt;

    let out = std::process::Command::new(std::env::current_exe().unwrap())
        .args(["abort_policy_child", "--exact", "--nocapture", "--test-threads=1"])
        .env(ABORT_CHILD_ENV, "1")
        .output()
        .unwrap();
    let stderr = String::from_utf8_lossy(&out.stderr);

    assert_eq!(
        out.status.signal(),
        Some(libc::SIGABRT),
        "status: {:?}, stderr: {stderr}",
        out.status
    );
    assert!(stderr.contains("doomed died unexpectedly; aborting"), "stderr: {stderr}");
    assert!(stderr.contains("last words"), "stderr: {stderr}");
}
