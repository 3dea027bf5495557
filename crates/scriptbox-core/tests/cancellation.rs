//! Cooperative cancellation and wall-clock budgets.

use std::time::{Duration, Instant};

use scriptbox_core::{
    EngineConfig, EngineError, ExecutionResult, FaultKind, ScriptSubmission, SessionId,
    SessionManager, SessionState,
};

const GUARD: Duration = Duration::from_secs(10);

fn manager() -> SessionManager {
    SessionManager::new(EngineConfig::default()).unwrap()
}

async fn finish(mgr: &SessionManager, id: SessionId) -> ExecutionResult {
    tokio::time::timeout(GUARD, mgr.await_result(id))
        .await
        .expect("cancellation was not honored in time")
        .unwrap()
}

#[tokio::test(flavor = "multi_thread")]
async fn test_cancel_infinite_loop() {
    let mgr = manager();
    let handle = mgr
        .submit(ScriptSubmission::new("A", "while true do end"))
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(20)).await;
    mgr.cancel(handle.id).unwrap();

    let result = finish(&mgr, handle.id).await;
    assert_eq!(result.state, SessionState::Cancelled);
    assert!(result.fault.is_none());

    let snapshot = mgr.query(handle.id).unwrap();
    assert!(snapshot.cancel_requested);
    assert!(snapshot.output_closed);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_no_chunks_after_cancellation_is_honored() {
    let mgr = manager();
    let handle = mgr
        .submit(ScriptSubmission::new(
            "A",
            "local i = 0\nwhile true do i = i + 1\nprint(i) end",
        ))
        .await
        .unwrap();
    let mut stream = mgr.subscribe(handle.id).unwrap();

    let mut seen = Vec::new();
    while seen.len() < 10 {
        let chunk = tokio::time::timeout(GUARD, stream.next_chunk())
            .await
            .unwrap()
            .expect("stream ended early");
        seen.push(chunk);
    }
    mgr.cancel(handle.id).unwrap();
    let result = finish(&mgr, handle.id).await;
    assert_eq!(result.state, SessionState::Cancelled);

    // The stream is finite: whatever was buffered drains, then it ends.
    while let Some(chunk) = tokio::time::timeout(GUARD, stream.next_chunk()).await.unwrap() {
        seen.push(chunk);
    }
    for (i, chunk) in seen.iter().enumerate() {
        assert_eq!(chunk.seq, i as u64);
        assert_eq!(chunk.text, format!("{}\n", i + 1));
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn test_pcall_cannot_swallow_cancellation() {
    let mgr = manager();
    let src = "while true do pcall(function() while true do end end) end";
    let handle = mgr.submit(ScriptSubmission::new("A", src)).await.unwrap();
    tokio::time::sleep(Duration::from_millis(20)).await;
    mgr.cancel(handle.id).unwrap();
    assert_eq!(finish(&mgr, handle.id).await.state, SessionState::Cancelled);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_cancel_interrupts_sleep() {
    let mgr = manager();
    let handle = mgr
        .submit(ScriptSubmission::new("A", "time.sleep(60)"))
        .await
        .unwrap();
    let started = Instant::now();
    mgr.cancel(handle.id).unwrap();
    assert_eq!(finish(&mgr, handle.id).await.state, SessionState::Cancelled);
    assert!(started.elapsed() < Duration::from_secs(5));
}

#[tokio::test(flavor = "multi_thread")]
async fn test_cancel_is_idempotent() {
    let mgr = manager();
    let handle = mgr
        .submit(ScriptSubmission::new("A", "while true do end"))
        .await
        .unwrap();
    mgr.cancel(handle.id).unwrap();
    mgr.cancel(handle.id).unwrap();
    let result = finish(&mgr, handle.id).await;
    assert_eq!(result.state, SessionState::Cancelled);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_cancel_after_terminal_is_unknown_session() {
    let mgr = manager();
    let handle = mgr
        .submit(ScriptSubmission::new("A", "print('done')"))
        .await
        .unwrap();
    finish(&mgr, handle.id).await;
    assert!(matches!(
        mgr.cancel(handle.id),
        Err(EngineError::UnknownSession(id)) if id == handle.id
    ));
    // The result is untouched.
    assert_eq!(
        mgr.await_result(handle.id).await.unwrap().state,
        SessionState::Succeeded
    );
}

#[tokio::test(flavor = "multi_thread")]
async fn test_submission_timeout() {
    let mgr = manager();
    let submission =
        ScriptSubmission::new("A", "while true do end").with_timeout(Duration::from_millis(100));
    let handle = mgr.submit(submission).await.unwrap();
    let result = finish(&mgr, handle.id).await;
    assert_eq!(result.state, SessionState::TimedOut);
    assert_eq!(result.termination_kind(), Some(FaultKind::TimedOut));
    assert!(result.duration_ms >= 100);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_manual_cancel_wins_over_later_timeout() {
    let mgr = manager();
    let submission = ScriptSubmission::new("A", "while true do pcall(time.sleep, 1) end")
        .with_timeout(Duration::from_millis(300));
    let handle = mgr.submit(submission).await.unwrap();
    mgr.cancel(handle.id).unwrap();
    assert_eq!(finish(&mgr, handle.id).await.state, SessionState::Cancelled);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_fast_script_beats_timeout() {
    let mgr = manager();
    let submission =
        ScriptSubmission::new("A", "print('quick')").with_timeout(Duration::from_secs(5));
    let handle = mgr.submit(submission).await.unwrap();
    assert_eq!(finish(&mgr, handle.id).await.state, SessionState::Succeeded);
}
