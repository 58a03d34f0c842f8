//! Integration tests for the job bridge against an in-memory backend.

mod common;

use std::time::Duration;

use assert_matches::assert_matches;
use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use comfyrun_comfyui::backend::{BackendError, BackendStatus};
use comfyrun_comfyui::bridge::{BridgeSettings, JobBridge, SUCCESS_MESSAGE};
use comfyrun_core::artifact::{Artifact, ArtifactDelivery, ArtifactPayload};
use comfyrun_core::invocation::InvocationResult;
use common::MockBackend;
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;

fn settings() -> BridgeSettings {
    BridgeSettings {
        poll_interval: Duration::from_millis(100),
        max_poll_interval: Duration::from_millis(500),
        job_timeout: Duration::from_secs(10),
        submit_timeout: Duration::from_secs(5),
        submit_retry_delay: Duration::from_millis(500),
        max_poll_retries: 3,
        delivery: ArtifactDelivery::Inline,
    }
}

fn two_node_request() -> Value {
    json!({"input": {"workflow": {"1": {"op": "load"}, "2": {"op": "sample"}}}})
}

async fn run(bridge: &JobBridge<MockBackend>, payload: Value) -> InvocationResult {
    bridge.run(payload, &CancellationToken::new()).await
}

fn error_message(result: &InvocationResult) -> &str {
    match result {
        InvocationResult::Error { message } => message,
        other => panic!("Expected error result, got {other:?}"),
    }
}

// ---------------------------------------------------------------------------
// Test: invalid workflows never reach the backend
// ---------------------------------------------------------------------------

#[tokio::test]
async fn invalid_workflows_are_rejected_without_backend_calls() {
    let bridge = JobBridge::new(MockBackend::new(), settings());

    let cases = [
        (json!({"input": {}}), "No workflow provided in input"),
        (json!({}), "No workflow provided in input"),
        (json!({"input": {"workflow": null}}), "No workflow provided in input"),
        (json!({"input": {"workflow": {}}}), "at least one node"),
        (json!({"input": {"workflow": [1, 2]}}), "JSON object"),
        (json!({"input": {"workflow": {"1": {}}, "timeout_secs": 0}}), "timeout_secs"),
    ];

    for (payload, expected) in cases {
        let result = run(&bridge, payload).await;
        let message = error_message(&result);
        assert!(message.starts_with("Validation failed"), "{message}");
        assert!(message.contains(expected), "{message}");
    }

    assert_eq!(bridge.backend().total_calls(), 0);
}

// ---------------------------------------------------------------------------
// Test: the documented two-node scenario
// ---------------------------------------------------------------------------

#[tokio::test]
async fn two_node_workflow_returns_single_png_artifact() {
    let png = b"\x89PNG\r\n\x1a\nfake";
    let backend = MockBackend::new().with_output("ComfyUI_00001_.png", Some("image/png"), png);
    let bridge = JobBridge::new(backend, settings());

    let result = run(&bridge, two_node_request()).await;

    let job_id = match &result {
        InvocationResult::Success { job_id, .. } => job_id.clone(),
        other => panic!("Expected success, got {other:?}"),
    };
    assert_eq!(
        serde_json::to_value(&result).unwrap(),
        json!({
            "status": "success",
            "message": SUCCESS_MESSAGE,
            "workflow_nodes": 2,
            "job_id": job_id,
            "artifacts": [{"kind": "image/png", "data": STANDARD.encode(png)}]
        })
    );
    assert_eq!(bridge.backend().submit_calls(), 1);
}

// ---------------------------------------------------------------------------
// Test: progress through running states, artifacts in backend order
// ---------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn succeeds_after_several_polls_with_ordered_artifacts() {
    let backend = MockBackend::new()
        .with_statuses(vec![
            Ok(BackendStatus::Pending),
            Ok(BackendStatus::Running),
            Ok(BackendStatus::Running),
            Ok(BackendStatus::Succeeded),
        ])
        .with_output("b.png", Some("image/png"), b"second-node")
        .with_output("a.webp", None, b"first-node")
        .with_output("clip.mp4", Some("application/octet-stream"), b"video");
    let bridge = JobBridge::new(backend, settings());

    let result = run(&bridge, two_node_request()).await;

    let InvocationResult::Success { artifacts, .. } = result else {
        panic!("Expected success, got {result:?}");
    };
    assert_eq!(
        artifacts,
        vec![
            Artifact::inline("image/png", STANDARD.encode("second-node")),
            Artifact::inline("image/webp", STANDARD.encode("first-node")),
            Artifact::inline("video/mp4", STANDARD.encode("video")),
        ]
    );
    assert_eq!(bridge.backend().status_calls(), 4);
    assert_eq!(bridge.backend().fetch_calls(), 3);
}

// ---------------------------------------------------------------------------
// Test: reference delivery skips fetching
// ---------------------------------------------------------------------------

#[tokio::test]
async fn reference_delivery_returns_urls() {
    let backend = MockBackend::new().with_output("out.png", Some("image/png"), b"png");
    let bridge = JobBridge::new(
        backend,
        BridgeSettings {
            delivery: ArtifactDelivery::Reference,
            ..settings()
        },
    );

    let result = run(&bridge, two_node_request()).await;

    let InvocationResult::Success { artifacts, .. } = result else {
        panic!("Expected success, got {result:?}");
    };
    assert_eq!(artifacts.len(), 1);
    assert_eq!(artifacts[0].kind, "image/png");
    assert_matches!(
        &artifacts[0].payload,
        ArtifactPayload::Ref(url) if url == "mock://view/out.png"
    );
    assert_eq!(bridge.backend().fetch_calls(), 0);
}

// ---------------------------------------------------------------------------
// Test: stuck job times out
// ---------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn stuck_job_times_out_and_is_cancelled() {
    let backend = MockBackend::new().with_statuses(vec![Ok(BackendStatus::Running)]);
    let bridge = JobBridge::new(backend, settings());
    let payload = json!({
        "input": {"workflow": {"1": {"op": "load"}}, "timeout_secs": 2}
    });

    let started = tokio::time::Instant::now();
    let result = run(&bridge, payload).await;
    let elapsed = started.elapsed();

    let message = error_message(&result);
    assert!(message.starts_with("Timed out"), "{message}");
    assert!(elapsed >= Duration::from_secs(2), "{elapsed:?}");
    assert!(
        elapsed <= Duration::from_secs(2) + Duration::from_millis(500),
        "{elapsed:?}"
    );
    assert_eq!(bridge.backend().cancel_calls(), 1);
}

// ---------------------------------------------------------------------------
// Test: a single failed fetch fails the whole invocation
// ---------------------------------------------------------------------------

#[tokio::test]
async fn one_failed_fetch_fails_invocation() {
    let backend = MockBackend::new()
        .with_output("a.png", Some("image/png"), b"a")
        .with_failing_output("b.png", BackendError::Unreachable("connection reset".into()))
        .with_output("c.png", Some("image/png"), b"c");
    let bridge = JobBridge::new(backend, settings());

    let result = run(&bridge, two_node_request()).await;

    let message = error_message(&result);
    assert!(message.starts_with("Artifact collection failed"), "{message}");
    assert!(message.contains("b.png"), "{message}");
    assert!(serde_json::to_value(&result).unwrap().get("artifacts").is_none());
}

#[tokio::test]
async fn empty_output_body_is_corrupt() {
    let backend = MockBackend::new().with_output("a.png", Some("image/png"), b"");
    let bridge = JobBridge::new(backend, settings());

    let result = run(&bridge, two_node_request()).await;

    assert!(error_message(&result).contains("corrupt output"));
}

#[tokio::test]
async fn malformed_output_listing_is_corrupt() {
    let backend = MockBackend::new()
        .with_outputs_error(BackendError::Malformed(
            "output entry of node 9 has no filename".into(),
        ));
    let bridge = JobBridge::new(backend, settings());

    let result = run(&bridge, two_node_request()).await;

    let message = error_message(&result);
    assert!(message.contains("corrupt output"), "{message}");
    assert!(message.contains("no filename"), "{message}");
}

// ---------------------------------------------------------------------------
// Test: concurrent invocations stay independent
// ---------------------------------------------------------------------------

#[tokio::test]
async fn concurrent_identical_invocations_get_distinct_jobs() {
    let backend = MockBackend::new()
        .with_statuses(vec![Ok(BackendStatus::Running), Ok(BackendStatus::Succeeded)])
        .with_output("out.png", Some("image/png"), b"png");
    let bridge = JobBridge::new(backend, settings());

    let (first, second) = tokio::join!(
        run(&bridge, two_node_request()),
        run(&bridge, two_node_request())
    );

    let (
        InvocationResult::Success {
            job_id: first_id,
            artifacts: first_artifacts,
            ..
        },
        InvocationResult::Success {
            job_id: second_id,
            artifacts: second_artifacts,
            ..
        },
    ) = (first, second)
    else {
        panic!("Expected two successes");
    };

    assert_ne!(first_id, second_id);
    assert_eq!(first_artifacts.len(), 1);
    assert_eq!(second_artifacts.len(), 1);
    assert_eq!(bridge.backend().submit_calls(), 2);
}

// ---------------------------------------------------------------------------
// Test: backend-reported failures
// ---------------------------------------------------------------------------

#[tokio::test]
async fn backend_failure_is_reported_with_reason() {
    let backend = MockBackend::new().with_statuses(vec![Ok(BackendStatus::Failed(
        "KSampler (node 3): CUDA out of memory".into(),
    ))]);
    let bridge = JobBridge::new(backend, settings());

    let result = run(&bridge, two_node_request()).await;

    let message = error_message(&result);
    assert!(message.contains("failed on backend"), "{message}");
    assert!(message.contains("CUDA out of memory"), "{message}");
    assert_eq!(bridge.backend().fetch_calls(), 0);
}

#[tokio::test]
async fn vanished_job_is_a_backend_failure() {
    let backend = MockBackend::new().with_statuses(vec![Ok(BackendStatus::Unknown)]);
    let bridge = JobBridge::new(backend, settings());

    let result = run(&bridge, two_node_request()).await;

    assert!(error_message(&result).contains("job not found on backend"));
}

// ---------------------------------------------------------------------------
// Test: transient status failures
// ---------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn transient_poll_failures_within_limit_are_tolerated() {
    let flaky = || Err(BackendError::Unreachable("connection refused".into()));
    let backend = MockBackend::new().with_statuses(vec![
        flaky(),
        flaky(),
        flaky(),
        Ok(BackendStatus::Succeeded),
    ]);
    let bridge = JobBridge::new(backend, settings());

    let result = run(&bridge, two_node_request()).await;

    assert!(result.is_success(), "{result:?}");
    assert_eq!(bridge.backend().status_calls(), 4);
}

#[tokio::test(start_paused = true)]
async fn poll_failures_beyond_limit_fail_invocation() {
    let backend = MockBackend::new()
        .with_statuses(vec![Err(BackendError::Unreachable("connection refused".into()))]);
    let bridge = JobBridge::new(backend, settings());

    let result = run(&bridge, two_node_request()).await;

    let message = error_message(&result);
    assert!(message.starts_with("Status polling failed"), "{message}");
    assert!(message.contains("after 4 attempts"), "{message}");
    assert_eq!(bridge.backend().status_calls(), 4);
}

// ---------------------------------------------------------------------------
// Test: submission retry
// ---------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn unreachable_submission_is_retried_once() {
    let backend = MockBackend::new()
        .with_submit_failures(vec![BackendError::Unreachable("connection refused".into())]);
    let bridge = JobBridge::new(backend, settings());

    let result = run(&bridge, two_node_request()).await;

    assert!(result.is_success(), "{result:?}");
    assert_eq!(bridge.backend().submit_calls(), 2);
}

#[tokio::test(start_paused = true)]
async fn submission_that_landed_is_adopted_not_resubmitted() {
    let backend = MockBackend::new()
        .with_submit_failures(vec![BackendError::Unreachable("reply lost".into())])
        .landing_failed_submissions();
    let bridge = JobBridge::new(backend, settings());

    let result = run(&bridge, two_node_request()).await;

    assert!(result.is_success(), "{result:?}");
    assert_eq!(bridge.backend().submit_calls(), 1);
}

#[tokio::test(start_paused = true)]
async fn second_unreachable_submission_gives_up() {
    let unreachable = || BackendError::Unreachable("connection refused".into());
    let backend = MockBackend::new().with_submit_failures(vec![unreachable(), unreachable()]);
    let bridge = JobBridge::new(backend, settings());

    let result = run(&bridge, two_node_request()).await;

    let message = error_message(&result);
    assert!(message.starts_with("Submission failed: backend unreachable"), "{message}");
    assert_eq!(bridge.backend().submit_calls(), 2);
}

#[tokio::test(start_paused = true)]
async fn submission_timeout_counts_as_unreachable_and_is_retried() {
    let backend = MockBackend::new().with_hanging_submits(1);
    let bridge = JobBridge::new(backend, settings());

    let started = tokio::time::Instant::now();
    let result = run(&bridge, two_node_request()).await;

    assert!(result.is_success(), "{result:?}");
    assert_eq!(bridge.backend().submit_calls(), 2);
    assert!(started.elapsed() >= settings().submit_timeout);
}

#[tokio::test(start_paused = true)]
async fn repeated_submission_timeout_gives_up() {
    let backend = MockBackend::new().with_hanging_submits(2);
    let bridge = JobBridge::new(backend, settings());

    let result = run(&bridge, two_node_request()).await;

    assert_eq!(
        error_message(&result),
        "Submission failed: backend unreachable: no acknowledgement within 5s"
    );
    assert_eq!(bridge.backend().submit_calls(), 2);
}

#[tokio::test]
async fn malformed_acknowledgement_is_not_retried() {
    let backend = MockBackend::new()
        .with_submit_failures(vec![BackendError::Malformed("missing prompt_id".into())]);
    let bridge = JobBridge::new(backend, settings());

    let result = run(&bridge, two_node_request()).await;

    assert_eq!(
        error_message(&result),
        "Submission failed: malformed acknowledgement: missing prompt_id"
    );
    assert_eq!(bridge.backend().submit_calls(), 1);
    assert_eq!(bridge.backend().status_calls(), 0);
}

#[tokio::test]
async fn rejected_submission_is_not_retried() {
    let backend = MockBackend::new().with_submit_failures(vec![BackendError::Rejected(
        "HTTP 400: Prompt outputs failed validation".into(),
    )]);
    let bridge = JobBridge::new(backend, settings());

    let result = run(&bridge, two_node_request()).await;

    let message = error_message(&result);
    assert!(message.starts_with("Submission failed: rejected by backend"), "{message}");
    assert!(message.contains("Prompt outputs failed validation"), "{message}");
    assert_eq!(bridge.backend().submit_calls(), 1);
    assert_eq!(bridge.backend().status_calls(), 0);
}

// ---------------------------------------------------------------------------
// Test: cancellation
// ---------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn cancellation_stops_polling_and_cancels_backend_job() {
    let backend = MockBackend::new().with_statuses(vec![Ok(BackendStatus::Running)]);
    let bridge = JobBridge::new(backend, settings());
    let cancel = CancellationToken::new();

    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_secs(1)).await;
        trigger.cancel();
    });

    let started = tokio::time::Instant::now();
    let result = bridge.run(two_node_request(), &cancel).await;

    let message = error_message(&result);
    assert!(message.starts_with("Cancelled: job"), "{message}");
    assert!(started.elapsed() < Duration::from_secs(2));
    assert_eq!(bridge.backend().cancel_calls(), 1);
    assert_eq!(bridge.backend().cancelled_jobs().len(), 1);
}

/// Fire `cancel` after `delay` of (paused) runtime time.
fn cancel_after(cancel: &CancellationToken, delay: Duration) {
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(delay).await;
        trigger.cancel();
    });
}

#[tokio::test(start_paused = true)]
async fn cancellation_during_submit_retry_delay() {
    let backend = MockBackend::new()
        .with_submit_failures(vec![BackendError::Unreachable("connection refused".into())]);
    let bridge = JobBridge::new(backend, settings());
    let cancel = CancellationToken::new();
    cancel_after(&cancel, Duration::from_millis(100));

    let result = bridge.run(two_node_request(), &cancel).await;

    assert_eq!(
        error_message(&result),
        "Cancelled: invocation cancelled before submission"
    );
    assert_eq!(bridge.backend().submit_calls(), 1);
    assert_eq!(bridge.backend().cancel_calls(), 1);
}

#[tokio::test]
async fn already_cancelled_invocation_never_reaches_backend() {
    let bridge = JobBridge::new(MockBackend::new(), settings());
    let cancel = CancellationToken::new();
    cancel.cancel();

    let result = bridge.run(two_node_request(), &cancel).await;

    assert_eq!(
        error_message(&result),
        "Cancelled: invocation cancelled before submission"
    );
    assert_eq!(bridge.backend().total_calls(), 0);
}

#[tokio::test(start_paused = true)]
async fn cancellation_interrupts_unacknowledged_submission() {
    let backend = MockBackend::new().with_hanging_submits(1);
    let bridge = JobBridge::new(backend, settings());
    let cancel = CancellationToken::new();
    cancel_after(&cancel, Duration::from_secs(1));

    let started = tokio::time::Instant::now();
    let result = bridge.run(two_node_request(), &cancel).await;

    assert_eq!(
        error_message(&result),
        "Cancelled: invocation cancelled before submission"
    );
    assert!(started.elapsed() < settings().submit_timeout);
    assert_eq!(bridge.backend().submit_calls(), 1);
    assert_eq!(bridge.backend().cancel_calls(), 1);
}

#[tokio::test(start_paused = true)]
async fn cancellation_stops_artifact_downloads() {
    let backend = MockBackend::new()
        .with_output("a.png", Some("image/png"), b"png")
        .with_hanging_fetches();
    let bridge = JobBridge::new(backend, settings());
    let cancel = CancellationToken::new();
    cancel_after(&cancel, Duration::from_secs(1));

    let started = tokio::time::Instant::now();
    let result = bridge.run(two_node_request(), &cancel).await;

    let message = error_message(&result);
    assert!(message.starts_with("Cancelled: job"), "{message}");
    assert!(started.elapsed() < Duration::from_secs(2));
    assert_eq!(bridge.backend().fetch_calls(), 1);
}

// ---------------------------------------------------------------------------
// Test: oversized overrides
// ---------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn maximal_timeout_override_still_completes() {
    let bridge = JobBridge::new(MockBackend::new(), settings());
    let payload = json!({
        "input": {
            "workflow": {"1": {}},
            "timeout_secs": u64::MAX,
            "poll_interval_ms": u64::MAX,
            "submit_timeout_secs": u64::MAX,
        }
    });

    let result = run(&bridge, payload).await;

    assert!(result.is_success(), "{result:?}");
}
