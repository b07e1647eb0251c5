//! HTTP transport for the RPC surface.
//!
//! Unary methods are served from `POST /rpc`. Streaming methods use
//! `POST /rpc/stream`, which answers with server-sent events: one `item`
//! event per stream item and a final `response` event. Closing the event
//! stream cancels the call.

use async_trait::async_trait;
use axum::{
    extract::{rejection::JsonRejection, State},
    http::{header, StatusCode},
    response::{
        sse::{Event, KeepAlive, Sse},
        IntoResponse, Response,
    },
    routing::{get, post},
    Json, Router,
};
use futures::Stream;
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::{mpsc, oneshot};
use tokio_stream::wrappers::ReceiverStream;
use tokio_stream::StreamExt;
use tokio_util::sync::CancellationToken;
use tower::ServiceBuilder;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::rpc::protocol::{
    error_codes, methods, JsonRpcError, JsonRpcRequest, JsonRpcResponse, RequestId,
};
use crate::rpc::server::{CallSink, RpcServer};
use crate::rpc::transport::Transport;

/// Events buffered per event stream before the call waits.
const EVENT_BUFFER: usize = 16;

/// HTTP server state.
#[derive(Clone)]
pub struct HttpState {
    server: Arc<RpcServer>,
}

/// JSON-RPC over HTTP.
pub struct HttpTransport {
    listener: TcpListener,
}

impl HttpTransport {
    pub async fn bind(addr: SocketAddr) -> Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        Ok(Self { listener })
    }
}

#[async_trait]
impl Transport for HttpTransport {
    fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    async fn serve(
        self: Box<Self>,
        server: Arc<RpcServer>,
        shutdown: CancellationToken,
    ) -> Result<()> {
        info!("Serving HTTP on {}", self.local_addr()?);
        axum::serve(self.listener, router(server))
            .with_graceful_shutdown(shutdown.cancelled_owned())
            .await?;
        info!("HTTP server stopped");
        Ok(())
    }
}

/// Build the router for `server`.
pub fn router(server: Arc<RpcServer>) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/metrics", get(metrics))
        .route("/rpc", post(rpc))
        .route("/rpc/stream", post(rpc_stream))
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(CorsLayer::new().allow_origin(Any).allow_methods(Any).allow_headers(Any)),
        )
        .with_state(HttpState { server })
}

/// Health check endpoint.
async fn health_check(State(state): State<HttpState>) -> impl IntoResponse {
    let daemon = state.server.daemon();
    Json(json!({
        "status": if daemon.is_shutting_down() { "stopping" } else { "ok" },
        "version": crate::VERSION,
        "registered": daemon.is_registered(),
    }))
}

/// Prometheus metrics endpoint.
async fn metrics(State(state): State<HttpState>) -> impl IntoResponse {
    (
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        state.server.daemon().metrics().to_prometheus(),
    )
}

fn bad_request(rejection: JsonRejection) -> Response {
    let error = JsonRpcError::new(error_codes::PARSE_ERROR, rejection.body_text());
    (
        StatusCode::BAD_REQUEST,
        Json(JsonRpcResponse::failure(RequestId::Null, error)),
    )
        .into_response()
}

/// Sink for a call answered by a single HTTP response.
struct UnarySink {
    response: Mutex<Option<oneshot::Sender<JsonRpcResponse>>>,
}

#[async_trait]
impl CallSink for UnarySink {
    async fn item(&self, _item: Value) -> Result<()> {
        Err(Error::Protocol("unary calls cannot stream".to_string()))
    }

    async fn respond(&self, response: JsonRpcResponse) {
        let sender = self.response.lock().take();
        if let Some(sender) = sender {
            let _ = sender.send(response);
        }
    }
}

/// Unary call endpoint.
async fn rpc(
    State(state): State<HttpState>,
    body: std::result::Result<Json<JsonRpcRequest>, JsonRejection>,
) -> Response {
    let req = match body {
        Ok(Json(req)) => req,
        Err(rejection) => return bad_request(rejection),
    };

    if methods::is_streaming(&req.method) {
        let error = JsonRpcError::new(
            error_codes::INVALID_REQUEST,
            format!("{} streams its results, use /rpc/stream", req.method),
        );
        return Json(JsonRpcResponse::failure(req.id, error)).into_response();
    }

    let id = req.id.clone();
    let (sender, receiver) = oneshot::channel();
    let sink = UnarySink {
        response: Mutex::new(Some(sender)),
    };

    // The call runs to completion even if the client disconnects.
    let server = Arc::clone(&state.server);
    tokio::spawn(async move {
        server
            .handle_request(req, &sink, CancellationToken::new())
            .await;
    });

    match receiver.await {
        Ok(response) => Json(response).into_response(),
        Err(_) => {
            warn!("Call {} ended without a response", id);
            let error = JsonRpcError::new(error_codes::INTERNAL_ERROR, "call ended without a response");
            Json(JsonRpcResponse::failure(id, error)).into_response()
        }
    }
}

/// Sink feeding one event stream.
struct EventSink {
    events: mpsc::Sender<Event>,
}

#[async_trait]
impl CallSink for EventSink {
    async fn item(&self, item: Value) -> Result<()> {
        let event = Event::default()
            .event("item")
            .json_data(item)
            .map_err(|e| Error::Internal(e.to_string()))?;
        self.events.send(event).await.map_err(|_| Error::Cancelled)
    }

    async fn respond(&self, response: JsonRpcResponse) {
        let event = match Event::default().event("response").json_data(&response) {
            Ok(event) => event,
            Err(e) => {
                warn!("Failed to encode response to {}: {}", response.id, e);
                return;
            }
        };
        if self.events.send(event).await.is_err() {
            debug!("Event stream closed before response to {} was sent", response.id);
        }
    }
}

/// Streaming call endpoint.
async fn rpc_stream(
    State(state): State<HttpState>,
    body: std::result::Result<Json<JsonRpcRequest>, JsonRejection>,
) -> std::result::Result<Sse<impl Stream<Item = std::result::Result<Event, Infallible>>>, Response>
{
    let Json(req) = body.map_err(bad_request)?;

    let (events, receiver) = mpsc::channel(EVENT_BUFFER);
    let sink = EventSink { events };
    let server = Arc::clone(&state.server);

    tokio::spawn(async move {
        let cancel = CancellationToken::new();
        let call = server.handle_request(req, &sink, cancel.clone());
        tokio::pin!(call);

        let disconnected = tokio::select! {
            () = &mut call => false,
            () = sink.events.closed() => true,
        };
        if disconnected {
            debug!("Event stream closed by client, cancelling call");
            cancel.cancel();
            call.await;
        }
    });

    let stream = ReceiverStream::new(receiver).map(Ok);
    Ok(Sse::new(stream).keep_alive(KeepAlive::default()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::daemon::test_support::{sample_issue, MockBehaviour, MockFactory};
    use crate::daemon::{ConnectedDaemon, RegistrationDefaults};
    use crate::metrics::Metrics;
    use axum::body::{to_bytes, Body};
    use axum::http::Request;
    use std::path::PathBuf;
    use tower::ServiceExt;

    fn app(behaviour: MockBehaviour) -> (Router, Arc<RpcServer>) {
        let daemon = Arc::new(ConnectedDaemon::new(
            MockFactory::new(behaviour),
            RegistrationDefaults {
                home: PathBuf::from("/tmp/lint-daemon-test"),
                languages: vec!["js".to_string()],
            },
            Metrics::new(),
        ));
        let server = Arc::new(RpcServer::new(daemon));
        (router(Arc::clone(&server)), server)
    }

    fn post_json(uri: &str, body: Value) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri(uri)
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    async fn body_text(response: Response) -> String {
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    async fn call(app: &Router, id: i64, method: &str, params: Value) -> Value {
        let request = post_json(
            "/rpc",
            json!({"jsonrpc": "2.0", "id": id, "method": method, "params": params}),
        );
        let response = app.clone().oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        serde_json::from_str(&body_text(response).await).unwrap()
    }

    #[tokio::test]
    async fn test_health() {
        let (app, _) = app(MockBehaviour::default());
        let request = Request::builder().uri("/health").body(Body::empty()).unwrap();
        let response = app.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let body: Value = serde_json::from_str(&body_text(response).await).unwrap();
        assert_eq!(body["status"], "ok");
        assert_eq!(body["version"], crate::VERSION);
        assert_eq!(body["registered"], false);
    }

    #[tokio::test]
    async fn test_unary_rpc() {
        let (app, _) = app(MockBehaviour::default());

        let response = call(&app, 1, "getStatus", Value::Null).await;
        assert_eq!(response["error"]["code"], error_codes::PRECONDITION_FAILED);

        let response = call(&app, 2, "register", json!({"storageId": "s1"})).await;
        assert_eq!(response["result"], json!({}));

        let response = call(&app, 3, "getStatus", Value::Null).await;
        assert_eq!(response["id"], 3);
        assert_eq!(response["result"]["state"], "NEVER_UPDATED");
    }

    #[tokio::test]
    async fn test_streaming_method_rejected_on_unary_endpoint() {
        let (app, _) = app(MockBehaviour::default());
        let response = call(&app, 1, "streamLogs", Value::Null).await;
        assert_eq!(response["error"]["code"], error_codes::INVALID_REQUEST);
    }

    #[tokio::test]
    async fn test_malformed_body() {
        let (app, _) = app(MockBehaviour::default());
        let request = Request::builder()
            .method("POST")
            .uri("/rpc")
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from("{ not json"))
            .unwrap();
        let response = app.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        let body: Value = serde_json::from_str(&body_text(response).await).unwrap();
        assert_eq!(body["id"], Value::Null);
        assert_eq!(body["error"]["code"], error_codes::PARSE_ERROR);
    }

    #[tokio::test]
    async fn test_analyze_as_event_stream() {
        let (app, _) = app(MockBehaviour {
            issues: vec![sample_issue("js:S1", 1), sample_issue("js:S2", 2)],
            ..Default::default()
        });
        call(&app, 1, "register", json!({"storageId": "s1"})).await;
        call(&app, 2, "update", json!({"hostUrl": "http://localhost:9000"})).await;

        let request = post_json(
            "/rpc/stream",
            json!({
                "jsonrpc": "2.0", "id": 3, "method": "analyze",
                "params": {"baseDir": "/work", "files": [{"path": "a.js"}]}
            }),
        );
        let response = app.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let text = body_text(response).await;
        assert_eq!(text.matches("event: item").count(), 2);
        let first = text.find("js:S1").unwrap();
        let second = text.find("js:S2").unwrap();
        let done = text.find("event: response").unwrap();
        assert!(first < second && second < done);
        assert!(text.contains(r#""result":null"#));
    }

    #[tokio::test]
    async fn test_metrics_endpoint() {
        let (app, _) = app(MockBehaviour::default());
        call(&app, 1, "ping", Value::Null).await;

        let request = Request::builder().uri("/metrics").body(Body::empty()).unwrap();
        let response = app.oneshot(request).await.unwrap();
        let text = body_text(response).await;
        assert!(text.contains("lint_daemon_requests_total 1"));
    }

    #[tokio::test]
    async fn test_shutdown_over_http() {
        let (app, server) = app(MockBehaviour::default());
        let response = call(&app, 9, "shutdown", Value::Null).await;
        assert_eq!(response["result"], json!({}));
        assert!(server.daemon().is_shutting_down());

        let response = call(&app, 10, "ping", Value::Null).await;
        assert_eq!(response["error"]["code"], error_codes::PRECONDITION_FAILED);
    }
}
