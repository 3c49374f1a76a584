//! Integration tests for the HTTP surface, the event pipeline and the daemon
//! lifecycle, driven against real artifact directories.

use std::fs::File;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use axum::body::Body;
use axum::http::{Request, StatusCode};
use axum::response::Response;
use http_body_util::BodyExt;
use ralph_core::{ArtifactLayout, Config};
use ralphd::server::{create_router, AppContext};
use ralphd::store::{ArtifactStore, LocalStore};
use ralphd::terminal::{PtyDimensions, TerminalMultiplexer, TmuxAttachSpawner};
use ralphd::watch::{ChangeKind, IncrementalReconciler};
use ralphd::{Daemon, DaemonConfig};
use serde_json::Value;
use tempfile::TempDir;
use tower::ServiceExt;

fn create_test_app() -> (axum::Router, Arc<AppContext>, TempDir) {
    let dir = TempDir::new().unwrap();
    let store: Arc<dyn ArtifactStore> = Arc::new(LocalStore::new(dir.path()));
    let terminals = TerminalMultiplexer::new(
        Arc::new(TmuxAttachSpawner::local("tmux")),
        PtyDimensions::default(),
    );
    let ctx = Arc::new(AppContext::new(Config::default(), store, terminals));
    let router = create_router(Arc::clone(&ctx));
    (router, ctx, dir)
}

async fn body_to_json(response: Response) -> Value {
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    serde_json::from_slice(&bytes).unwrap()
}

async fn get_json(app: &axum::Router, uri: &str) -> (StatusCode, Value) {
    let response: Response = app
        .clone()
        .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
        .await
        .unwrap();
    let status = response.status();
    (status, body_to_json(response).await)
}

async fn next_frame(body: &mut Body) -> String {
    let frame = tokio::time::timeout(Duration::from_secs(2), body.frame())
        .await
        .expect("no frame within timeout")
        .unwrap()
        .unwrap();
    String::from_utf8(frame.into_data().unwrap().to_vec()).unwrap()
}

fn set_age(path: &std::path::Path, age: Duration) {
    let file = File::options().write(true).open(path).unwrap();
    file.set_modified(SystemTime::now() - age).unwrap();
}

/// Spec plus `logs` iteration logs, the newest `age` old.
fn write_fresh(layout: &ArtifactLayout, task: &str, max: u32, logs: u32, age: Duration) {
    std::fs::write(
        layout.spec_path(task),
        format!("---\nmax_iterations: {max}\n---\nDo {task}.\n"),
    )
    .unwrap();
    std::fs::create_dir_all(layout.logs_dir(task)).unwrap();
    for n in 1..=logs {
        let path = layout.iteration_log_path(task, n);
        std::fs::write(&path, "log").unwrap();
        set_age(&path, age + Duration::from_secs(u64::from(logs - n)));
    }
}

fn find<'a>(loops: &'a [Value], task_id: &str) -> &'a Value {
    loops
        .iter()
        .find(|l| l["task_id"] == task_id)
        .unwrap_or_else(|| panic!("missing loop {task_id}"))
}

// --- Snapshot ---

#[tokio::test]
async fn loop_listing_reconciles_mixed_artifacts() {
    let (app, _, dir) = create_test_app();
    let layout = ArtifactLayout::new(dir.path());

    // Persistent state wins over logs for the same task.
    std::fs::write(
        layout.state_path("both"),
        "---\niteration: 2\nmax_iterations: 5\n---\nBoth.\n",
    )
    .unwrap();
    write_fresh(&layout, "both", 5, 4, Duration::from_secs(5));

    write_fresh(&layout, "live", 10, 3, Duration::from_secs(30));
    write_fresh(&layout, "idle", 10, 3, Duration::from_secs(600));
    write_fresh(&layout, "capped", 10, 10, Duration::from_secs(600));

    // A broken steering artifact for one task hides nothing else.
    std::fs::write(layout.state_path("x"), "---\niteration: 1\n---\n").unwrap();
    std::fs::write(layout.steering_path("x"), "## Context\nno question here\n").unwrap();
    std::fs::write(layout.state_path("y"), "---\niteration: 1\n---\n").unwrap();

    let (status, json) = get_json(&app, "/loops").await;
    assert_eq!(status, StatusCode::OK);
    let loops = json["loops"].as_array().unwrap();

    let mut ids: Vec<&str> = loops.iter().map(|l| l["task_id"].as_str().unwrap()).collect();
    ids.sort_unstable();
    assert_eq!(ids, vec!["both", "capped", "idle", "live", "x", "y"]);

    let both = find(loops, "both");
    assert_eq!(both["loop_type"], "persistent");
    assert_eq!(both["iteration"], 2);

    let live = find(loops, "live");
    assert_eq!(live["loop_type"], "fresh");
    assert_eq!(live["iteration"], 3);
    assert_eq!(live["status"], "running");

    assert_eq!(find(loops, "idle")["status"], "completed");
    assert_eq!(find(loops, "capped")["status"], "max_reached");
    assert_eq!(find(loops, "x")["steering_status"], "none");
}

#[tokio::test]
async fn loop_detail_and_records() {
    let (app, _, dir) = create_test_app();
    let layout = ArtifactLayout::new(dir.path());
    std::fs::write(
        layout.state_path("t"),
        "---\niteration: 1\nmax_iterations: 3\n---\n",
    )
    .unwrap();
    std::fs::write(
        layout.spec_path("t"),
        "---\nmax_iterations: 3\n---\nRefactor the parser.\n",
    )
    .unwrap();
    std::fs::write(layout.progress_path("t"), "# Progress\n\n- tokenizer done\n").unwrap();
    std::fs::write(
        layout.summary_path("t"),
        "---\noutcome: success\n---\nAll green.\n",
    )
    .unwrap();

    let (status, json) = get_json(&app, "/loops/t").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["loop"]["max_iterations"], 3);

    let (_, spec) = get_json(&app, "/loops/t/spec").await;
    assert_eq!(spec["max_iterations"], 3);
    assert_eq!(spec["summary"], "Refactor the parser.");

    let (_, progress) = get_json(&app, "/loops/t/progress").await;
    assert_eq!(progress["summary"], "tokenizer done");

    let (_, summary) = get_json(&app, "/loops/t/summary").await;
    assert_eq!(summary["outcome"], "success");
}

// --- Event pipeline ---

#[tokio::test]
async fn state_changes_stream_over_sse() {
    let (app, ctx, dir) = create_test_app();
    let layout = ArtifactLayout::new(dir.path());
    let mut tracker = IncrementalReconciler::new(ctx.reconciler.clone(), ctx.bus.clone());
    tracker.prime().await.unwrap();

    let response: Response = app
        .oneshot(
            Request::builder()
                .uri("/events?task_id=p")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let mut body = response.into_body();

    let path = layout.state_path("p");
    std::fs::write(&path, "---\niteration: 1\nmax_iterations: 4\n---\n").unwrap();
    tracker.handle_change(&path, ChangeKind::Added).await;
    let frame = next_frame(&mut body).await;
    assert!(frame.contains("event: loop_updated"), "{frame}");
    assert!(frame.contains(r#""iteration":1"#), "{frame}");

    std::fs::remove_file(&path).unwrap();
    tracker.handle_change(&path, ChangeKind::Removed).await;
    tracker.handle_change(&path, ChangeKind::Removed).await;
    let frame = next_frame(&mut body).await;
    assert!(frame.contains("event: loop_removed"), "{frame}");

    // A new state artifact brings the loop back.
    std::fs::write(&path, "---\niteration: 2\n---\n").unwrap();
    tracker.handle_change(&path, ChangeKind::Added).await;
    let frame = next_frame(&mut body).await;
    assert!(frame.contains("event: loop_updated"), "{frame}");
    assert!(frame.contains(r#""iteration":2"#), "{frame}");
}

#[tokio::test]
async fn answering_steering_publishes_update() {
    let (app, ctx, dir) = create_test_app();
    let layout = ArtifactLayout::new(dir.path());
    let mut tracker = IncrementalReconciler::new(ctx.reconciler.clone(), ctx.bus.clone());
    let mut rx = ctx.bus.subscribe();

    std::fs::write(layout.state_path("s"), "---\niteration: 1\n---\n").unwrap();
    let steering = layout.steering_path("s");
    std::fs::write(
        &steering,
        "---\nstatus: pending\n---\n## Question\nShip it?\n\n## Response\n_Awaiting response..._\n",
    )
    .unwrap();

    let response: Response = app
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/loops/s/steering/answer")
                .header("content-type", "application/json")
                .body(Body::from(r#"{"response":"ship it"}"#))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NO_CONTENT);

    tracker.handle_change(&steering, ChangeKind::Changed).await;
    let first = rx.recv().await.unwrap();
    let second = rx.recv().await.unwrap();
    let first = serde_json::to_value(&first).unwrap();
    let second = serde_json::to_value(&second).unwrap();
    assert_eq!(first["type"], "steering_updated");
    assert_eq!(first["payload"]["response"], "ship it");
    assert_eq!(second["type"], "loop_updated");
    assert_eq!(second["payload"]["steering_status"], "answered");
}

// --- Daemon lifecycle ---

#[tokio::test]
async fn daemon_runs_until_shutdown() {
    let dir = TempDir::new().unwrap();
    let daemon = Arc::new(
        Daemon::new(DaemonConfig {
            port: 0,
            workspace: dir.path().to_path_buf(),
            config: Config::default(),
        })
        .unwrap(),
    );

    let runner = Arc::clone(&daemon);
    let handle = tokio::spawn(async move { runner.run().await });

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(dir.path().join(".claude").is_dir());

    daemon.shutdown().await;
    let result = tokio::time::timeout(Duration::from_secs(5), handle)
        .await
        .expect("daemon did not stop")
        .unwrap();
    assert!(result.is_ok());
    assert!(daemon.is_shutdown());
}
