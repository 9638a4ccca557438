use std::sync::Arc;
use std::sync::atomic::Ordering;

use axum::extract::State;
use axum::extract::ws::WebSocketUpgrade;
use axum::http::{HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use droidmirror_protocol::{
    InputEvent, MirrorConfig, Point, SessionPhase, StartSessionRequest, StartSessionResponse,
};
use serde_json::json;
use tower_http::limit::RequestBodyLimitLayer;
use tower_http::services::ServeDir;

use crate::broadcast::StreamMetrics;
use crate::device;
use crate::session::{SessionController, SessionError};
use crate::viewer;

/// WebSocket path viewers connect to for the video units.
pub const VIEWER_PATH: &str = "/ws/video";

/// Shared application state.
pub struct AppState {
    pub config: MirrorConfig,
    pub controller: Arc<SessionController>,
    pub metrics: Arc<StreamMetrics>,
    pub started_at: std::time::Instant,
}

impl IntoResponse for SessionError {
    fn into_response(self) -> Response {
        let status = match &self {
            SessionError::AlreadyActive | SessionError::NotActive => StatusCode::CONFLICT,
            SessionError::Launch(_) | SessionError::Transport(_) | SessionError::Device(_) => {
                StatusCode::BAD_GATEWAY
            }
            SessionError::Cancelled | SessionError::Io(_) | SessionError::Task(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };
        (status, Json(json!({ "error": self.to_string() }))).into_response()
    }
}

/// Middleware that adds security headers to every response.
async fn security_headers(
    request: axum::http::Request<axum::body::Body>,
    next: axum::middleware::Next,
) -> axum::response::Response {
    let mut response = next.run(request).await;
    let headers = response.headers_mut();

    headers.insert(
        "x-content-type-options",
        HeaderValue::from_static("nosniff"),
    );
    headers.insert("x-frame-options", HeaderValue::from_static("DENY"));
    headers.insert("referrer-policy", HeaderValue::from_static("no-referrer"));
    headers.insert(
        "content-security-policy",
        HeaderValue::from_static(
            "default-src 'self'; script-src 'self'; style-src 'self' 'unsafe-inline'; \
             connect-src 'self' ws: wss:; img-src 'self' data:; media-src 'self' blob:",
        ),
    );

    response
}

/// Build the Axum router with all routes.
pub fn build_router(state: Arc<AppState>) -> Router {
    let api = Router::new()
        .route("/api/devices", get(list_devices))
        .route(
            "/api/session",
            get(session_status).post(start_session).delete(stop_session),
        )
        .route("/api/session/map", post(map_point))
        .route("/api/session/input", post(inject_input))
        .route("/api/health", get(health_check))
        .route("/metrics", get(metrics))
        .route(VIEWER_PATH, get(viewer_ws_upgrade))
        .layer(RequestBodyLimitLayer::new(65_536)) // 64KB max request body
        .with_state(Arc::clone(&state));

    // The web player
    let serve_dir = ServeDir::new(&state.config.server.web_root);

    api.fallback_service(serve_dir)
        .layer(axum::middleware::from_fn(security_headers))
}

/// GET /api/devices
async fn list_devices(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    match device::list_devices(state.controller.adb()).await {
        Ok(devices) => Json(devices).into_response(),
        Err(e) => {
            tracing::warn!("Failed to list devices: {e}");
            SessionError::Device(e).into_response()
        }
    }
}

/// POST /api/session
///
/// Start mirroring. Omitted encoder settings come from `[video]`.
async fn start_session(
    State(state): State<Arc<AppState>>,
    Json(req): Json<StartSessionRequest>,
) -> impl IntoResponse {
    let device_id = req.device_id.trim();
    if device_id.is_empty() {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({ "error": "device_id is required" })),
        )
            .into_response();
    }

    let params = req.encoding(&state.config.video);
    match state.controller.start_session(device_id, params).await {
        Ok(session) => Json(StartSessionResponse {
            transport_endpoint: session.transport_endpoint.to_string(),
            session_token: session.token,
            viewer_path: VIEWER_PATH.to_string(),
        })
        .into_response(),
        Err(e) => {
            tracing::warn!(device_id, "Failed to start session: {e}");
            e.into_response()
        }
    }
}

/// DELETE /api/session
async fn stop_session(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let stopped = state.controller.stop_session().await;
    Json(json!({ "stopped": stopped }))
}

/// GET /api/session
async fn session_status(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(state.controller.status())
}

/// POST /api/session/map
async fn map_point(
    State(state): State<Arc<AppState>>,
    Json(point): Json<Point>,
) -> impl IntoResponse {
    let (x, y) = state.controller.map_point(point.x, point.y);
    Json(Point { x, y })
}

/// POST /api/session/input
async fn inject_input(
    State(state): State<Arc<AppState>>,
    Json(event): Json<InputEvent>,
) -> impl IntoResponse {
    match state.controller.inject_input(&event).await {
        Ok(()) => StatusCode::NO_CONTENT.into_response(),
        Err(e) => e.into_response(),
    }
}

/// GET /api/health
async fn health_check(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "uptime_secs": state.started_at.elapsed().as_secs(),
        "session": state.controller.phase(),
    }))
}

/// GET /metrics - Prometheus-compatible metrics endpoint
async fn metrics(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let session_active = u8::from(state.controller.phase() == SessionPhase::Active);
    let active_viewers = state.controller.broadcaster().viewer_count();
    let uptime_secs = state.started_at.elapsed().as_secs();
    let units_broadcast = state.metrics.units_broadcast.load(Ordering::Relaxed);
    let viewers_dropped = state.metrics.viewers_dropped.load(Ordering::Relaxed);
    let corrupt_frames = state.metrics.corrupt_frames.load(Ordering::Relaxed);

    let body = format!(
        "# HELP droidmirror_session_active Whether a mirroring session is active\n\
         # TYPE droidmirror_session_active gauge\n\
         droidmirror_session_active {session_active}\n\
         \n\
         # HELP droidmirror_active_viewers Connected viewers\n\
         # TYPE droidmirror_active_viewers gauge\n\
         droidmirror_active_viewers {active_viewers}\n\
         \n\
         # HELP droidmirror_uptime_seconds Server uptime in seconds\n\
         # TYPE droidmirror_uptime_seconds gauge\n\
         droidmirror_uptime_seconds {uptime_secs}\n\
         \n\
         # HELP droidmirror_units_broadcast_total Video units fanned out to viewers\n\
         # TYPE droidmirror_units_broadcast_total counter\n\
         droidmirror_units_broadcast_total {units_broadcast}\n\
         \n\
         # HELP droidmirror_viewers_dropped_total Viewers disconnected for falling behind\n\
         # TYPE droidmirror_viewers_dropped_total counter\n\
         droidmirror_viewers_dropped_total {viewers_dropped}\n\
         \n\
         # HELP droidmirror_corrupt_frames_total Frame headers rejected as corrupt\n\
         # TYPE droidmirror_corrupt_frames_total counter\n\
         droidmirror_corrupt_frames_total {corrupt_frames}\n"
    );

    (
        [(
            axum::http::header::CONTENT_TYPE,
            "text/plain; version=0.0.4; charset=utf-8",
        )],
        body,
    )
        .into_response()
}

/// GET /ws/video - WebSocket upgrade for a viewer
async fn viewer_ws_upgrade(
    State(state): State<Arc<AppState>>,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    // Subscribe before the upgrade so the viewer is counted immediately and
    // a stopped session is reported as a plain HTTP error.
    let viewer = match state.controller.subscribe_viewer() {
        Ok(v) => v,
        Err(e) => return e.into_response(),
    };
    let controller = Arc::clone(&state.controller);
    ws.on_upgrade(move |socket| viewer::handle_viewer_ws(socket, viewer, controller))
        .into_response()
}

#[cfg(test)]
mod tests {
    use super::*;

    // These use `tower::ServiceExt::oneshot` to send requests through the axum
    // router without starting a real HTTP server.

    use axum::body::Body;
    use axum::http::Request;
    use droidmirror_protocol::{encode_frame, EncodingParams, StreamMetadata, VideoConfig};
    use futures_util::StreamExt;
    use http_body_util::BodyExt;
    use tokio::io::AsyncWriteExt;
    use tower::ServiceExt;

    use crate::adb::testing::FakeAdb;

    /// Build a test `AppState` backed by a fake adb.
    fn test_app_state(adb: &Arc<FakeAdb>) -> Arc<AppState> {
        let mut config: MirrorConfig = toml::from_str("").expect("default config");
        config.agent.settle_ms = 0;
        config.transport.video_port = 0;
        let metrics = Arc::new(StreamMetrics::default());
        let controller = SessionController::new(&config, adb.clone(), Arc::clone(&metrics));
        Arc::new(AppState {
            config,
            controller,
            metrics,
            started_at: std::time::Instant::now(),
        })
    }

    /// Helper: parse a response body as `serde_json::Value`.
    async fn body_json(response: axum::response::Response<Body>) -> serde_json::Value {
        let bytes = response
            .into_body()
            .collect()
            .await
            .expect("failed to read response body")
            .to_bytes();
        serde_json::from_slice(&bytes).expect("response body is not valid JSON")
    }

    fn json_request(method: &str, uri: &str, body: serde_json::Value) -> Request<Body> {
        Request::builder()
            .method(method)
            .uri(uri)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    fn empty_request(method: &str, uri: &str) -> Request<Body> {
        Request::builder()
            .method(method)
            .uri(uri)
            .body(Body::empty())
            .unwrap()
    }

    fn default_params() -> EncodingParams {
        EncodingParams::from(&VideoConfig::default())
    }

    async fn serve(state: Arc<AppState>) -> std::net::SocketAddr {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, build_router(state)).await.unwrap();
        });
        addr
    }

    #[tokio::test]
    async fn health_returns_ok() {
        let adb = Arc::new(FakeAdb::new());
        let app = build_router(test_app_state(&adb));

        let response = app.oneshot(empty_request("GET", "/api/health")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers().get("x-content-type-options").unwrap(),
            "nosniff"
        );

        let json = body_json(response).await;
        assert_eq!(json["status"], "ok");
        assert_eq!(json["session"], "idle");
    }

    #[tokio::test]
    async fn devices_are_listed() {
        let adb = Arc::new(FakeAdb::new());
        adb.reply(
            "devices -l",
            "List of devices attached\nR58M123 device usb:1-1 model:SM_G973F transport_id:1",
        );
        let app = build_router(test_app_state(&adb));

        let response = app.oneshot(empty_request("GET", "/api/devices")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let json = body_json(response).await;
        assert_eq!(json[0]["serial"], "R58M123");
        assert_eq!(json[0]["model"], "SM G973F");
        assert_eq!(json[0]["is_wireless"], false);
    }

    #[tokio::test]
    async fn devices_adb_failure_is_bad_gateway() {
        let adb = Arc::new(FakeAdb::new());
        adb.fail("devices", "cannot connect to daemon");
        let app = build_router(test_app_state(&adb));

        let response = app.oneshot(empty_request("GET", "/api/devices")).await.unwrap();
        assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
        let json = body_json(response).await;
        assert!(json["error"].as_str().unwrap().contains("cannot connect"));
    }

    #[tokio::test]
    async fn idle_status_and_stop() {
        let adb = Arc::new(FakeAdb::new());
        let app = build_router(test_app_state(&adb));

        let response = app
            .clone()
            .oneshot(empty_request("GET", "/api/session"))
            .await
            .unwrap();
        let json = body_json(response).await;
        assert_eq!(json["phase"], "idle");
        assert_eq!(json["active"], false);
        assert_eq!(json["viewers"], 0);

        let response = app
            .oneshot(empty_request("DELETE", "/api/session"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_json(response).await["stopped"], false);
    }

    #[tokio::test]
    async fn start_requires_device_id() {
        let adb = Arc::new(FakeAdb::new());
        let app = build_router(test_app_state(&adb));
        let response = app
            .oneshot(json_request("POST", "/api/session", json!({ "device_id": "  " })))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert!(adb.calls().is_empty());
    }

    #[tokio::test]
    async fn start_conflict_and_stop() {
        let adb = Arc::new(FakeAdb::new());
        let state = test_app_state(&adb);
        let app = build_router(Arc::clone(&state));

        let response = app
            .clone()
            .oneshot(json_request(
                "POST",
                "/api/session",
                json!({ "device_id": "R58M123", "max_fps": 30 }),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let json = body_json(response).await;
        assert_eq!(json["viewer_path"], "/ws/video");
        assert!(json["session_token"].as_u64().unwrap() <= 0x7FFF_FFFF);
        assert!(json["transport_endpoint"].as_str().unwrap().starts_with("127.0.0.1:"));
        assert_eq!(adb.calls_starting_with("-s R58M123 push"), 1);

        let response = app
            .clone()
            .oneshot(json_request(
                "POST",
                "/api/session",
                json!({ "device_id": "other" }),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::CONFLICT);
        assert!(body_json(response).await["error"].is_string());

        let response = app
            .oneshot(empty_request("DELETE", "/api/session"))
            .await
            .unwrap();
        assert_eq!(body_json(response).await["stopped"], true);
        assert_eq!(state.controller.phase(), SessionPhase::Idle);
    }

    #[tokio::test]
    async fn agent_failure_is_bad_gateway() {
        let adb = Arc::new(FakeAdb::new());
        adb.set_agent_script("echo 'Aborted: version mismatch' >&2; exit 1");
        let app = build_router(test_app_state(&adb));

        let response = app
            .oneshot(json_request("POST", "/api/session", json!({ "device_id": "X" })))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
        let json = body_json(response).await;
        assert!(json["error"].as_str().unwrap().contains("version mismatch"));
    }

    #[tokio::test]
    async fn map_is_identity_without_session() {
        let adb = Arc::new(FakeAdb::new());
        let app = build_router(test_app_state(&adb));
        let response = app
            .oneshot(json_request("POST", "/api/session/map", json!({ "x": 12, "y": 34 })))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_json(response).await, json!({ "x": 12, "y": 34 }));
    }

    #[tokio::test]
    async fn input_needs_active_session() {
        let adb = Arc::new(FakeAdb::new());
        let app = build_router(test_app_state(&adb));
        let response = app
            .oneshot(json_request(
                "POST",
                "/api/session/input",
                json!({ "type": "tap", "x": 1, "y": 2 }),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::CONFLICT);
    }

    #[tokio::test]
    async fn input_is_forwarded_when_active() {
        let adb = Arc::new(FakeAdb::new());
        let state = test_app_state(&adb);
        let app = build_router(Arc::clone(&state));
        state
            .controller
            .start_session("X", default_params())
            .await
            .unwrap();

        let response = app
            .oneshot(json_request(
                "POST",
                "/api/session/input",
                json!({ "type": "key", "keycode": 3 }),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NO_CONTENT);
        assert_eq!(adb.calls_starting_with("-s X shell input keyevent 3"), 1);
        state.controller.stop_session().await;
    }

    #[tokio::test]
    async fn metrics_endpoint_returns_prometheus_format() {
        let adb = Arc::new(FakeAdb::new());
        let state = test_app_state(&adb);
        state.metrics.units_broadcast.store(42, Ordering::Relaxed);
        state.metrics.corrupt_frames.store(2, Ordering::Relaxed);
        let app = build_router(state);

        let response = app.oneshot(empty_request("GET", "/metrics")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let content_type = response
            .headers()
            .get("content-type")
            .expect("missing content-type")
            .to_str()
            .unwrap();
        assert_eq!(content_type, "text/plain; version=0.0.4; charset=utf-8");

        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        let body = std::str::from_utf8(&bytes).unwrap();
        assert!(body.contains("# TYPE droidmirror_session_active gauge"));
        assert!(body.contains("droidmirror_session_active 0"));
        assert!(body.contains("droidmirror_active_viewers 0"));
        assert!(body.contains("# TYPE droidmirror_units_broadcast_total counter"));
        assert!(body.contains("droidmirror_units_broadcast_total 42"));
        assert!(body.contains("droidmirror_viewers_dropped_total 0"));
        assert!(body.contains("droidmirror_corrupt_frames_total 2"));
    }

    #[tokio::test]
    async fn viewer_rejected_without_session() {
        let adb = Arc::new(FakeAdb::new());
        let addr = serve(test_app_state(&adb)).await;

        match tokio_tungstenite::connect_async(format!("ws://{addr}/ws/video")).await {
            Err(tokio_tungstenite::tungstenite::Error::Http(response)) => {
                assert_eq!(response.status().as_u16(), 409);
            }
            Err(e) => panic!("expected HTTP 409, got {e}"),
            Ok(_) => panic!("expected HTTP 409, got a WebSocket"),
        }
    }

    #[tokio::test]
    async fn viewer_receives_binary_units() {
        let adb = Arc::new(FakeAdb::new());
        let state = test_app_state(&adb);
        let addr = serve(Arc::clone(&state)).await;

        let session = state
            .controller
            .start_session("X", default_params())
            .await
            .unwrap();

        let (mut ws, _) = tokio_tungstenite::connect_async(format!("ws://{addr}/ws/video"))
            .await
            .unwrap();
        assert_eq!(state.controller.status().viewers, 1);

        let mut agent = tokio::net::TcpStream::connect(session.transport_endpoint)
            .await
            .unwrap();
        let meta = StreamMetadata {
            device_name: "Pixel".to_string(),
            codec_id: 0x6832_3634,
            width: 720,
            height: 1600,
        };
        agent.write_all(&meta.serialize()).await.unwrap();
        agent
            .write_all(&encode_frame(0, b"unit-0"))
            .await
            .unwrap();
        agent
            .write_all(&encode_frame(1, b"unit-1"))
            .await
            .unwrap();

        for expected in [&b"unit-0"[..], &b"unit-1"[..]] {
            let msg = ws.next().await.unwrap().unwrap();
            assert!(msg.is_binary());
            assert_eq!(&msg.into_data()[..], expected);
        }

        state.controller.stop_session().await;
        // The socket closes once the session is gone.
        loop {
            match ws.next().await {
                Some(Ok(msg)) if msg.is_close() => break,
                Some(Ok(_)) => continue,
                Some(Err(_)) | None => break,
            }
        }
    }
}
