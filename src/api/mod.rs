//! HTTP/JSON control API
//!
//! Small admin surface over the path manager and the protocol servers.
//! Mutating endpoints validate the full resulting configuration before
//! committing, then hand the reload to the core on a separate task:
//! applying it may restart this very listener, so the commit never runs
//! on the handler that received it.

use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use axum::routing::{get, post};
use axum::Router;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::conf::{Conf, PathConf};
use crate::path::PathManagerHandle;
use crate::session::hls::HlsServer;
use crate::session::rtmp::RtmpServer;
use crate::session::rtsp::RtspServer;
use crate::session::webrtc::WebRtcServer;

/// The protocol servers the API can reach. Every server exposes the same
/// capability set (list connections, list sessions, kick); a `None` slot
/// answers 404, like a route that was never registered.
#[derive(Clone, Default)]
pub struct ServerSet {
    pub rtsp: Option<Arc<RtspServer>>,
    pub rtsps: Option<Arc<RtspServer>>,
    pub rtmp: Option<Arc<RtmpServer>>,
    pub rtmps: Option<Arc<RtmpServer>>,
    pub webrtc: Option<Arc<WebRtcServer>>,
    pub hls: Option<Arc<HlsServer>>,
}

pub struct ApiState {
    conf: Mutex<Conf>,
    path_manager: PathManagerHandle,
    servers: ServerSet,
    reload_tx: mpsc::UnboundedSender<Conf>,
}

impl ApiState {
    pub fn new(
        conf: Conf,
        path_manager: PathManagerHandle,
        servers: ServerSet,
        reload_tx: mpsc::UnboundedSender<Conf>,
    ) -> Arc<Self> {
        Arc::new(Self {
            conf: Mutex::new(conf),
            path_manager,
            servers,
            reload_tx,
        })
    }

    /// Replace the configuration shown by `config/get` after an external
    /// reload (SIGHUP).
    pub fn set_conf(&self, conf: Conf) {
        *self.conf.lock().unwrap() = conf;
    }

    /// Validate-and-commit shared by every mutating endpoint.
    fn commit(&self, new_conf: Conf) {
        *self.conf.lock().unwrap() = new_conf.clone();
        // the reload may tear down the API listener itself; it runs on
        // the core's task, never on this handler
        let _ = self.reload_tx.send(new_conf);
    }
}

pub fn router(state: Arc<ApiState>) -> Router {
    Router::new()
        .route("/v1/config/get", get(config_get))
        .route("/v1/config/set", post(config_set))
        .route("/v1/config/paths/add/*name", post(config_paths_add))
        .route("/v1/config/paths/edit/*name", post(config_paths_edit))
        .route("/v1/config/paths/remove/*name", post(config_paths_remove))
        .route("/v1/paths/list", get(paths_list))
        .route("/v1/rtspconns/list", get(rtsp_conns_list))
        .route("/v1/rtspsessions/list", get(rtsp_sessions_list))
        .route("/v1/rtspsessions/kick/:id", post(rtsp_sessions_kick))
        .route("/v1/rtspsconns/list", get(rtsps_conns_list))
        .route("/v1/rtspssessions/list", get(rtsps_sessions_list))
        .route("/v1/rtspssessions/kick/:id", post(rtsps_sessions_kick))
        .route("/v1/rtmpconns/list", get(rtmp_conns_list))
        .route("/v1/rtmpconns/kick/:id", post(rtmp_conns_kick))
        .route("/v1/rtmpsconns/list", get(rtmps_conns_list))
        .route("/v1/rtmpsconns/kick/:id", post(rtmps_conns_kick))
        .route("/v1/webrtcconns/list", get(webrtc_conns_list))
        .route("/v1/webrtcconns/kick/:id", post(webrtc_conns_kick))
        .route("/v1/hlsmuxers/list", get(hls_muxers_list))
        .with_state(state)
}

/// Bind and serve until cancelled.
pub async fn serve(
    address: SocketAddr,
    state: Arc<ApiState>,
    cancel: CancellationToken,
) -> std::io::Result<()> {
    let listener = tokio::net::TcpListener::bind(address).await?;
    tracing::info!(addr = %address, "API listener opened");
    axum::serve(listener, router(state))
        .with_graceful_shutdown(cancel.cancelled_owned())
        .await
}

fn bad_request() -> Response {
    StatusCode::BAD_REQUEST.into_response()
}

fn not_found() -> Response {
    StatusCode::NOT_FOUND.into_response()
}

fn items<T: serde::Serialize>(items: Vec<T>) -> Response {
    Json(serde_json::json!({ "items": items })).into_response()
}

async fn config_get(State(state): State<Arc<ApiState>>) -> Response {
    let conf = state.conf.lock().unwrap().clone();
    Json(conf).into_response()
}

async fn config_set(
    State(state): State<Arc<ApiState>>,
    Json(patch): Json<serde_json::Value>,
) -> Response {
    let current = state.conf.lock().unwrap().clone();
    match current.patched(&patch) {
        Ok(new_conf) => {
            state.commit(new_conf);
            StatusCode::OK.into_response()
        }
        Err(err) => {
            tracing::debug!(error = %err, "config set rejected");
            bad_request()
        }
    }
}

async fn config_paths_add(
    State(state): State<Arc<ApiState>>,
    Path(name): Path<String>,
    Json(patch): Json<serde_json::Value>,
) -> Response {
    let current = state.conf.lock().unwrap().clone();
    if current.paths.contains(&name) {
        return bad_request();
    }
    let path_conf = match Conf::patched_path(&PathConf::default(), &patch) {
        Ok(conf) => conf,
        Err(_) => return bad_request(),
    };
    let mut new_conf = current;
    new_conf.paths.insert(name, path_conf);
    if new_conf.check().is_err() {
        return bad_request();
    }
    state.commit(new_conf);
    StatusCode::OK.into_response()
}

async fn config_paths_edit(
    State(state): State<Arc<ApiState>>,
    Path(name): Path<String>,
    Json(patch): Json<serde_json::Value>,
) -> Response {
    let current = state.conf.lock().unwrap().clone();
    let base = match current.paths.get(&name) {
        Some(conf) => conf.clone(),
        None => return bad_request(),
    };
    let path_conf = match Conf::patched_path(&base, &patch) {
        Ok(conf) => conf,
        Err(_) => return bad_request(),
    };
    let mut new_conf = current;
    new_conf.paths.insert(name, path_conf);
    if new_conf.check().is_err() {
        return bad_request();
    }
    state.commit(new_conf);
    StatusCode::OK.into_response()
}

async fn config_paths_remove(
    State(state): State<Arc<ApiState>>,
    Path(name): Path<String>,
) -> Response {
    let mut new_conf = state.conf.lock().unwrap().clone();
    if new_conf.paths.remove(&name).is_none() {
        return bad_request();
    }
    if new_conf.check().is_err() {
        return bad_request();
    }
    state.commit(new_conf);
    StatusCode::OK.into_response()
}

async fn paths_list(State(state): State<Arc<ApiState>>) -> Response {
    items(state.path_manager.paths_list().await)
}

async fn rtsp_conns_list(State(state): State<Arc<ApiState>>) -> Response {
    match &state.servers.rtsp {
        Some(server) => items(server.api_conns_list()),
        None => not_found(),
    }
}

async fn rtsp_sessions_list(State(state): State<Arc<ApiState>>) -> Response {
    match &state.servers.rtsp {
        Some(server) => items(server.api_sessions_list()),
        None => not_found(),
    }
}

async fn rtsp_sessions_kick(
    State(state): State<Arc<ApiState>>,
    Path(id): Path<String>,
) -> Response {
    match &state.servers.rtsp {
        Some(server) if server.api_session_kick(&id) => StatusCode::OK.into_response(),
        Some(_) => not_found(),
        None => not_found(),
    }
}

async fn rtsps_conns_list(State(state): State<Arc<ApiState>>) -> Response {
    match &state.servers.rtsps {
        Some(server) => items(server.api_conns_list()),
        None => not_found(),
    }
}

async fn rtsps_sessions_list(State(state): State<Arc<ApiState>>) -> Response {
    match &state.servers.rtsps {
        Some(server) => items(server.api_sessions_list()),
        None => not_found(),
    }
}

async fn rtsps_sessions_kick(
    State(state): State<Arc<ApiState>>,
    Path(id): Path<String>,
) -> Response {
    match &state.servers.rtsps {
        Some(server) if server.api_session_kick(&id) => StatusCode::OK.into_response(),
        _ => not_found(),
    }
}

async fn rtmp_conns_list(State(state): State<Arc<ApiState>>) -> Response {
    match &state.servers.rtmp {
        Some(server) => items(server.api_conns_list()),
        None => not_found(),
    }
}

async fn rtmp_conns_kick(
    State(state): State<Arc<ApiState>>,
    Path(id): Path<String>,
) -> Response {
    match &state.servers.rtmp {
        Some(server) if server.api_conn_kick(&id) => StatusCode::OK.into_response(),
        _ => not_found(),
    }
}

async fn rtmps_conns_list(State(state): State<Arc<ApiState>>) -> Response {
    match &state.servers.rtmps {
        Some(server) => items(server.api_conns_list()),
        None => not_found(),
    }
}

async fn rtmps_conns_kick(
    State(state): State<Arc<ApiState>>,
    Path(id): Path<String>,
) -> Response {
    match &state.servers.rtmps {
        Some(server) if server.api_conn_kick(&id) => StatusCode::OK.into_response(),
        _ => not_found(),
    }
}

async fn webrtc_conns_list(State(state): State<Arc<ApiState>>) -> Response {
    match &state.servers.webrtc {
        Some(server) => items(server.api_conns_list()),
        None => not_found(),
    }
}

async fn webrtc_conns_kick(
    State(state): State<Arc<ApiState>>,
    Path(id): Path<String>,
) -> Response {
    match &state.servers.webrtc {
        Some(server) if server.api_conn_kick(&id) => StatusCode::OK.into_response(),
        _ => not_found(),
    }
}

async fn hls_muxers_list(State(state): State<Arc<ApiState>>) -> Response {
    match &state.servers.hls {
        Some(server) => items(server.api_muxers_list()),
        None => not_found(),
    }
}

#[cfg(test)]
mod tests {
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use http_body_util::BodyExt;
    use tower::ServiceExt;

    use super::*;

    fn test_state() -> (Arc<ApiState>, mpsc::UnboundedReceiver<Conf>) {
        let conf = Conf::default();
        let path_manager =
            PathManagerHandle::spawn(conf.clone(), CancellationToken::new());
        let (reload_tx, reload_rx) = mpsc::unbounded_channel();
        let state = ApiState::new(conf, path_manager, ServerSet::default(), reload_tx);
        (state, reload_rx)
    }

    async fn body_json(response: axum::response::Response) -> serde_json::Value {
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        serde_json::from_slice(&bytes).unwrap()
    }

    fn post_json(uri: &str, body: serde_json::Value) -> Request<Body> {
        Request::post(uri)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    #[tokio::test]
    async fn test_config_get_set_roundtrip() {
        let (state, mut reload_rx) = test_state();
        let app = router(Arc::clone(&state));

        let response = app
            .clone()
            .oneshot(Request::get("/v1/config/get").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let document = body_json(response).await;

        // set(get()) is the identity
        let response = app
            .clone()
            .oneshot(post_json("/v1/config/set", document.clone()))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let reloaded = reload_rx.recv().await.unwrap();
        assert_eq!(serde_json::to_value(&reloaded).unwrap(), document);
    }

    #[tokio::test]
    async fn test_config_set_rejects_invalid() {
        let (state, mut reload_rx) = test_state();
        let app = router(state);

        let response = app
            .oneshot(post_json(
                "/v1/config/set",
                serde_json::json!({"logLevel": "noisy"}),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert!(reload_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_paths_add_then_remove_restores_config() {
        let (state, mut reload_rx) = test_state();
        let app = router(Arc::clone(&state));

        let before = serde_json::to_value(&*state.conf.lock().unwrap()).unwrap();

        let response = app
            .clone()
            .oneshot(post_json(
                "/v1/config/paths/add/live/cam1",
                serde_json::json!({"overridePublisher": true}),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let added = reload_rx.recv().await.unwrap();
        assert!(added.paths.get("live/cam1").unwrap().override_publisher);

        // duplicate add is rejected
        let response = app
            .clone()
            .oneshot(post_json(
                "/v1/config/paths/add/live/cam1",
                serde_json::json!({}),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        let response = app
            .clone()
            .oneshot(
                Request::post("/v1/config/paths/remove/live/cam1")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let after = reload_rx.recv().await.unwrap();
        assert_eq!(serde_json::to_value(&after).unwrap(), before);
    }

    #[tokio::test]
    async fn test_paths_edit_requires_existing() {
        let (state, _reload_rx) = test_state();
        let app = router(state);

        let response = app
            .oneshot(post_json(
                "/v1/config/paths/edit/missing",
                serde_json::json!({"readUser": "bob", "readPass": "pw"}),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_absent_server_is_not_found() {
        let (state, _reload_rx) = test_state();
        let app = router(state);

        let response = app
            .clone()
            .oneshot(
                Request::get("/v1/rtspconns/list")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);

        let response = app
            .oneshot(
                Request::post("/v1/rtmpconns/kick/xyz")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_unknown_endpoint_is_not_found() {
        let (state, _reload_rx) = test_state();
        let app = router(state);

        let response = app
            .oneshot(Request::get("/v1/nope").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_paths_list() {
        let (state, _reload_rx) = test_state();
        let app = router(state);

        let response = app
            .oneshot(Request::get("/v1/paths/list").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert!(body["items"].as_array().unwrap().is_empty());
    }
}
