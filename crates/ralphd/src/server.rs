//! HTTP surface for ralphd.
//!
//! Local-only REST API over loop records, an SSE feed of typed loop events,
//! and a WebSocket for terminal streaming plus per-task event rooms.

use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    extract::{Query, State},
    http::StatusCode,
    response::{
        sse::{Event as SseEvent, KeepAlive, Sse},
        IntoResponse,
    },
    routing::{get, post},
    Json, Router,
};
use futures_util::{
    stream::{self, Stream},
    StreamExt,
};
use ralph_core::{Config, LoopEvent};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::bus::EventBus;
use crate::handlers;
use crate::reconciler::LoopReconciler;
use crate::store::ArtifactStore;
use crate::terminal::TerminalMultiplexer;

/// Everything request handlers need, built once by the daemon.
#[derive(Debug)]
pub struct AppContext {
    pub config: Config,
    pub store: Arc<dyn ArtifactStore>,
    pub reconciler: LoopReconciler,
    pub bus: EventBus,
    pub terminals: TerminalMultiplexer,
    /// Fired once on daemon shutdown; ends long-lived streams.
    pub shutdown: CancellationToken,
}

impl AppContext {
    pub fn new(config: Config, store: Arc<dyn ArtifactStore>, terminals: TerminalMultiplexer) -> Self {
        let reconciler = LoopReconciler::new(Arc::clone(&store), config.stale_after());
        let bus = EventBus::new(config.event_capacity);
        Self {
            config,
            store,
            reconciler,
            bus,
            terminals,
            shutdown: CancellationToken::new(),
        }
    }
}

/// Create the HTTP router with all endpoints.
pub fn create_router(ctx: Arc<AppContext>) -> Router {
    Router::new()
        .route("/loops", get(handlers::loops::list_loops))
        .route("/loops/{id}", get(handlers::loops::get_loop))
        .route("/loops/{id}/spec", get(handlers::loops::get_spec))
        .route("/loops/{id}/progress", get(handlers::loops::get_progress))
        .route("/loops/{id}/steering", get(handlers::loops::get_steering))
        .route(
            "/loops/{id}/steering/answer",
            post(handlers::loops::answer_steering),
        )
        .route("/loops/{id}/summary", get(handlers::loops::get_summary))
        .route("/loops/{id}/cancel", post(handlers::loops::cancel_loop))
        .route("/events", get(stream_events))
        .route("/terminal", get(handlers::terminal::terminal_socket))
        .route("/health", get(health_check))
        .layer(TraceLayer::new_for_http())
        .with_state(ctx)
}

/// Serve until the context's shutdown token fires.
pub async fn start_server(ctx: Arc<AppContext>, port: u16) -> std::io::Result<()> {
    let cancel = ctx.shutdown.clone();
    let router = create_router(ctx);

    let addr = SocketAddr::from(([127, 0, 0, 1], port));
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!("HTTP server listening on http://{}", addr);

    axum::serve(listener, router)
        .with_graceful_shutdown(async move { cancel.cancelled().await })
        .await
}

// --- Request/Response types ---

/// Error response body.
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
}

pub type ApiError = (StatusCode, Json<ErrorResponse>);

pub fn api_error(status: StatusCode, error: impl Into<String>) -> ApiError {
    (
        status,
        Json(ErrorResponse {
            error: error.into(),
        }),
    )
}

async fn health_check() -> impl IntoResponse {
    Json(serde_json::json!({"status": "ok"}))
}

// --- SSE ---

/// Query params for GET /events.
#[derive(Debug, Deserialize, Default)]
pub struct StreamEventsQuery {
    /// Only deliver events for this task.
    #[serde(default)]
    pub task_id: Option<String>,
}

fn to_sse(event: &LoopEvent) -> SseEvent {
    let json = event.to_json().unwrap_or_default();
    SseEvent::default().event(event.kind().as_str()).data(json)
}

/// GET /events - live loop events (SSE).
async fn stream_events(
    State(ctx): State<Arc<AppContext>>,
    Query(query): Query<StreamEventsQuery>,
) -> Sse<impl Stream<Item = Result<SseEvent, Infallible>>> {
    let subscription = ctx.bus.subscribe_filtered(query.task_id);
    let shutdown = ctx.shutdown.clone().cancelled_owned();
    info!(task_id = ?subscription.task_id(), "event stream opened");

    let stream = stream::unfold(subscription, |mut subscription| async move {
        let event = subscription.recv().await?;
        Some((event, subscription))
    })
    .map(|event| Ok(to_sse(&event)))
    .take_until(shutdown);

    Sse::new(stream).keep_alive(KeepAlive::default())
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::store::LocalStore;
    use crate::terminal::{PtyDimensions, TmuxAttachSpawner};
    use axum::body::Body;
    use axum::http::Request;
    use axum::response::Response;
    use http_body_util::BodyExt;
    use std::time::Duration;
    use tempfile::TempDir;
    use tower::ServiceExt;

    pub(crate) fn create_test_app() -> (Router, Arc<AppContext>, TempDir) {
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

    async fn next_frame(body: &mut Body) -> String {
        let frame = tokio::time::timeout(Duration::from_secs(2), body.frame())
            .await
            .expect("no frame within timeout")
            .unwrap()
            .unwrap();
        String::from_utf8(frame.into_data().unwrap().to_vec()).unwrap()
    }

    #[tokio::test]
    async fn health_check_returns_ok() {
        let (app, _, _dir) = create_test_app();

        let response: Response = app
            .oneshot(
                Request::builder()
                    .uri("/health")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let body = response.into_body().collect().await.unwrap().to_bytes();
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json["status"], "ok");
    }

    #[tokio::test]
    async fn event_stream_delivers_published_events() {
        let (app, ctx, _dir) = create_test_app();

        let response: Response = app
            .oneshot(
                Request::builder()
                    .uri("/events")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers().get("content-type").unwrap(),
            "text/event-stream"
        );

        assert_eq!(ctx.bus.observer_count(), 1);
        ctx.bus.publish(LoopEvent::removed("t1"));

        let mut body = response.into_body();
        let frame = next_frame(&mut body).await;
        assert!(frame.contains("event: loop_removed"));
        assert!(frame.contains(r#""task_id":"t1""#));
    }

    #[tokio::test]
    async fn event_stream_filters_by_task() {
        let (app, ctx, _dir) = create_test_app();

        let response: Response = app
            .oneshot(
                Request::builder()
                    .uri("/events?task_id=wanted")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        ctx.bus.publish(LoopEvent::removed("other"));
        ctx.bus.publish(LoopEvent::removed("wanted"));

        let mut body = response.into_body();
        let frame = next_frame(&mut body).await;
        assert!(frame.contains("wanted"));
        assert!(!frame.contains("other"));
    }

    #[tokio::test]
    async fn unknown_route_is_404() {
        let (app, _, _dir) = create_test_app();
        let response: Response = app
            .oneshot(Request::builder().uri("/runs").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }
}
