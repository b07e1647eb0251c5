//! Transport layer implementations.
//!
//! The TCP transport speaks newline-delimited JSON-RPC. Each connection may
//! carry any number of concurrent calls; their stream items and responses
//! are interleaved on the connection's single writer.

use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use futures::{SinkExt, StreamExt};
use serde_json::Value;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinSet;
use tokio_util::codec::{FramedRead, FramedWrite, LinesCodec};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use crate::error::{Error, Result};
use crate::rpc::protocol::{
    error_codes, methods, CancelledParams, JsonRpcError, JsonRpcNotification, JsonRpcRequest,
    JsonRpcResponse, RequestId, StreamItem,
};
use crate::rpc::server::{CallSink, RpcServer};

/// Longest accepted request line.
const MAX_LINE_LENGTH: usize = 16 * 1024 * 1024;

/// Messages queued per connection before writers wait.
const OUTBOUND_BUFFER: usize = 64;

/// How long in-flight connections may take to finish after shutdown.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(30);

/// A message that can be sent or received.
#[derive(Debug, Clone)]
pub enum Message {
    Request(JsonRpcRequest),
    Response(JsonRpcResponse),
    Notification(JsonRpcNotification),
}

impl Message {
    /// Parse one line as a request, else as a notification.
    pub fn parse(line: &str) -> Result<Self> {
        let value: Value = serde_json::from_str(line)?;
        if value.get("method").is_none() {
            return serde_json::from_value(value)
                .map(Message::Response)
                .map_err(|e| Error::Protocol(e.to_string()));
        }
        if value.get("id").is_some() {
            serde_json::from_value(value)
                .map(Message::Request)
                .map_err(|e| Error::Protocol(e.to_string()))
        } else {
            serde_json::from_value(value)
                .map(Message::Notification)
                .map_err(|e| Error::Protocol(e.to_string()))
        }
    }

    pub fn to_json(&self) -> Result<String> {
        let json = match self {
            Message::Request(req) => serde_json::to_string(req),
            Message::Response(res) => serde_json::to_string(res),
            Message::Notification(notif) => serde_json::to_string(notif),
        };
        Ok(json?)
    }
}

/// A way of exposing the RPC server to clients.
#[async_trait]
pub trait Transport: Send {
    /// Address clients connect to.
    fn local_addr(&self) -> Result<SocketAddr>;

    /// Serve until `shutdown` fires and in-flight calls have drained.
    async fn serve(self: Box<Self>, server: Arc<RpcServer>, shutdown: CancellationToken)
        -> Result<()>;
}

/// Newline-delimited JSON-RPC over TCP.
pub struct TcpTransport {
    listener: TcpListener,
}

impl TcpTransport {
    pub async fn bind(addr: SocketAddr) -> Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        Ok(Self { listener })
    }
}

#[async_trait]
impl Transport for TcpTransport {
    fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    async fn serve(
        self: Box<Self>,
        server: Arc<RpcServer>,
        shutdown: CancellationToken,
    ) -> Result<()> {
        let mut connections = JoinSet::new();

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        debug!("Accepted connection from {}", peer);
                        let connection = Connection::new(Arc::clone(&server), shutdown.clone());
                        connections.spawn(connection.run(stream, peer));
                    }
                    Err(e) => warn!("Failed to accept connection: {}", e),
                },
                Some(finished) = connections.join_next(), if !connections.is_empty() => {
                    if let Err(e) = finished {
                        error!("Connection task failed: {}", e);
                    }
                }
            }
        }

        // Refuse new connections while the open ones finish.
        drop(self.listener);
        info!("Stopped accepting connections, {} still open", connections.len());

        let drain = async { while connections.join_next().await.is_some() {} };
        if tokio::time::timeout(DRAIN_TIMEOUT, drain).await.is_err() {
            warn!("Connections did not finish within {:?}, aborting", DRAIN_TIMEOUT);
            connections.abort_all();
        }
        Ok(())
    }
}

/// A message queued for the connection writer.
struct Outbound {
    message: Message,
    /// Fired once the message has been flushed.
    written: Option<oneshot::Sender<()>>,
}

/// Sink writing one call's output to its connection.
struct ConnectionSink {
    request_id: RequestId,
    outbound: mpsc::Sender<Outbound>,
}

#[async_trait]
impl CallSink for ConnectionSink {
    async fn item(&self, item: Value) -> Result<()> {
        let params = serde_json::to_value(StreamItem {
            request_id: self.request_id.clone(),
            item,
        })?;
        let notification = JsonRpcNotification::new(methods::STREAM_ITEM, Some(params));

        self.outbound
            .send(Outbound {
                message: Message::Notification(notification),
                written: None,
            })
            .await
            .map_err(|_| Error::Cancelled)
    }

    async fn respond(&self, response: JsonRpcResponse) {
        let (written, flushed) = oneshot::channel();
        let queued = self
            .outbound
            .send(Outbound {
                message: Message::Response(response),
                written: Some(written),
            })
            .await;

        if queued.is_err() || flushed.await.is_err() {
            debug!("Connection closed before response to {} was written", self.request_id);
        }
    }
}

/// State of one client connection.
struct Connection {
    server: Arc<RpcServer>,
    shutdown: CancellationToken,
    /// Cancelled when the peer goes away.
    closed: CancellationToken,
    active: Arc<DashMap<RequestId, CancellationToken>>,
}

impl Connection {
    fn new(server: Arc<RpcServer>, shutdown: CancellationToken) -> Self {
        Self {
            server,
            shutdown,
            closed: CancellationToken::new(),
            active: Arc::new(DashMap::new()),
        }
    }

    async fn run(self, stream: TcpStream, peer: SocketAddr) {
        let (read_half, write_half) = stream.into_split();
        let mut lines = FramedRead::new(read_half, LinesCodec::new_with_max_length(MAX_LINE_LENGTH));
        let (outbound, outbound_rx) = mpsc::channel(OUTBOUND_BUFFER);
        let writer = tokio::spawn(write_loop(
            FramedWrite::new(write_half, LinesCodec::new()),
            outbound_rx,
        ));
        let mut calls = JoinSet::new();

        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                line = lines.next() => match line {
                    Some(Ok(line)) => self.handle_line(&line, &outbound, &mut calls),
                    Some(Err(e)) => {
                        warn!("Failed to read from {}: {}", peer, e);
                        self.closed.cancel();
                        break;
                    }
                    None => {
                        debug!("Connection from {} closed", peer);
                        self.closed.cancel();
                        break;
                    }
                },
                Some(finished) = calls.join_next(), if !calls.is_empty() => {
                    if let Err(e) = finished {
                        error!("Call task failed: {}", e);
                    }
                }
            }
        }

        // Let accepted calls finish; their responses are still written.
        while let Some(finished) = calls.join_next().await {
            if let Err(e) = finished {
                error!("Call task failed: {}", e);
            }
        }
        drop(outbound);
        if let Err(e) = writer.await {
            error!("Writer task for {} failed: {}", peer, e);
        }
        debug!("Connection from {} finished", peer);
    }

    fn handle_line(
        &self,
        line: &str,
        outbound: &mpsc::Sender<Outbound>,
        calls: &mut JoinSet<()>,
    ) {
        let line = line.trim();
        if line.is_empty() {
            return;
        }
        trace!("Received: {}", line);

        match Message::parse(line) {
            Ok(Message::Request(req)) => {
                let token = self.closed.child_token();
                match self.active.entry(req.id.clone()) {
                    Entry::Occupied(_) => {
                        warn!("Rejecting request {}: id already in flight", req.id);
                        let error = JsonRpcError::new(
                            error_codes::INVALID_REQUEST,
                            format!("Request id {} is already in flight", req.id),
                        );
                        reply(JsonRpcResponse::failure(req.id, error), outbound, calls);
                        return;
                    }
                    Entry::Vacant(entry) => {
                        entry.insert(token.clone());
                    }
                }

                let sink = ConnectionSink {
                    request_id: req.id.clone(),
                    outbound: outbound.clone(),
                };
                let server = Arc::clone(&self.server);
                let active = Arc::clone(&self.active);
                calls.spawn(async move {
                    let id = req.id.clone();
                    server.handle_request(req, &sink, token).await;
                    active.remove(&id);
                });
            }
            Ok(Message::Notification(notif)) => self.handle_notification(notif),
            Ok(Message::Response(_)) => warn!("Received unexpected response"),
            Err(e) => {
                warn!("Failed to parse message: {}", e);
                if let Some(response) = rejection(line, &e) {
                    reply(response, outbound, calls);
                }
            }
        }
    }

    fn handle_notification(&self, notif: JsonRpcNotification) {
        if notif.method != methods::CANCELLED {
            debug!("Unknown notification: {}", notif.method);
            return;
        }

        let Some(params) = notif.params else {
            return;
        };
        match serde_json::from_value::<CancelledParams>(params) {
            Ok(cancel) => {
                if let Some(token) = self.active.get(&cancel.request_id) {
                    info!("Cancelling request: {}", cancel.request_id);
                    token.cancel();
                }
            }
            Err(e) => warn!("Invalid cancellation: {}", e),
        }
    }
}

/// Error response for a line that is not a valid message. Messages without
/// an id get none.
fn rejection(line: &str, err: &Error) -> Option<JsonRpcResponse> {
    if let Error::Json(_) = err {
        let error = JsonRpcError::new(error_codes::PARSE_ERROR, format!("Parse error: {}", err));
        return Some(JsonRpcResponse::failure(RequestId::Null, error));
    }

    let value: Value = serde_json::from_str(line).ok()?;
    let id = match value.get("id") {
        Some(id) => serde_json::from_value(id.clone()).unwrap_or(RequestId::Null),
        None if !value.is_object() => RequestId::Null,
        None => return None,
    };
    let error = JsonRpcError::new(
        error_codes::INVALID_REQUEST,
        format!("Invalid request: {}", err),
    );
    Some(JsonRpcResponse::failure(id, error))
}

/// Queue a response that belongs to no running call.
fn reply(response: JsonRpcResponse, outbound: &mpsc::Sender<Outbound>, calls: &mut JoinSet<()>) {
    let outbound = outbound.clone();
    calls.spawn(async move {
        let queued = outbound
            .send(Outbound {
                message: Message::Response(response),
                written: None,
            })
            .await;
        if queued.is_err() {
            debug!("Connection closed before error response was queued");
        }
    });
}

async fn write_loop(
    mut sink: FramedWrite<OwnedWriteHalf, LinesCodec>,
    mut outbound: mpsc::Receiver<Outbound>,
) {
    while let Some(Outbound { message, written }) = outbound.recv().await {
        let json = match message.to_json() {
            Ok(json) => json,
            Err(e) => {
                error!("Error serializing message: {}", e);
                continue;
            }
        };

        trace!("Sending: {}", json);
        if let Err(e) = sink.send(json).await {
            debug!("Error writing to connection: {}", e);
            break;
        }
        if let Some(written) = written {
            let _ = written.send(());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::daemon::test_support::{sample_issue, MockBehaviour, MockFactory};
    use crate::daemon::{ConnectedDaemon, RegistrationDefaults};
    use crate::metrics::Metrics;
    use crate::rpc::protocol::error_codes;
    use serde_json::json;
    use std::collections::HashMap;
    use std::path::PathBuf;
    use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
    use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};

    struct TestClient {
        reader: tokio::io::Lines<BufReader<OwnedReadHalf>>,
        writer: OwnedWriteHalf,
    }

    impl TestClient {
        async fn connect(addr: SocketAddr) -> Self {
            let stream = TcpStream::connect(addr).await.unwrap();
            let (read, write) = stream.into_split();
            Self {
                reader: BufReader::new(read).lines(),
                writer: write,
            }
        }

        async fn send(&mut self, message: Value) {
            let mut line = message.to_string();
            line.push('\n');
            self.writer.write_all(line.as_bytes()).await.unwrap();
        }

        async fn next(&mut self) -> Value {
            let line = tokio::time::timeout(Duration::from_secs(5), self.reader.next_line())
                .await
                .unwrap()
                .unwrap()
                .unwrap();
            serde_json::from_str(&line).unwrap()
        }

        async fn call(&mut self, id: i64, method: &str, params: Value) -> Value {
            self.call_with_id(json!(id), method, params).await
        }

        async fn call_with_id(&mut self, id: Value, method: &str, params: Value) -> Value {
            self.send(json!({"jsonrpc": "2.0", "id": id, "method": method, "params": params}))
                .await;
            self.next().await
        }
    }

    async fn start(behaviour: MockBehaviour) -> (SocketAddr, CancellationToken, tokio::task::JoinHandle<Result<()>>) {
        let daemon = Arc::new(ConnectedDaemon::new(
            MockFactory::new(behaviour),
            RegistrationDefaults {
                home: PathBuf::from("/tmp/lint-daemon-test"),
                languages: vec!["js".to_string()],
            },
            Metrics::new(),
        ));
        let shutdown = daemon.shutdown_token();
        let server = Arc::new(RpcServer::new(daemon));

        let transport = TcpTransport::bind("127.0.0.1:0".parse().unwrap()).await.unwrap();
        let addr = transport.local_addr().unwrap();
        let handle = tokio::spawn(Box::new(transport).serve(server, shutdown.clone()));
        (addr, shutdown, handle)
    }

    #[test]
    fn test_message_parsing() {
        let req = Message::parse(r#"{"jsonrpc":"2.0","id":1,"method":"ping"}"#).unwrap();
        assert!(matches!(req, Message::Request(r) if r.method == "ping"));

        let notif = Message::parse(
            r#"{"jsonrpc":"2.0","method":"notifications/cancelled","params":{"requestId":1}}"#,
        )
        .unwrap();
        assert!(matches!(notif, Message::Notification(_)));

        let res = Message::parse(r#"{"jsonrpc":"2.0","id":1,"result":{}}"#).unwrap();
        assert!(matches!(res, Message::Response(_)));

        assert!(Message::parse("{ not json").is_err());
    }

    #[test]
    fn test_rejection_of_invalid_messages() {
        let reject = |line: &str| Message::parse(line).err().and_then(|e| rejection(line, &e));

        let response = reject("{ not json").unwrap();
        assert_eq!(response.id, RequestId::Null);
        assert_eq!(response.error.unwrap().code, error_codes::PARSE_ERROR);

        let response = reject(r#"{"id":"a","method":"ping"}"#).unwrap();
        assert_eq!(response.id, RequestId::String("a".to_string()));
        assert_eq!(response.error.unwrap().code, error_codes::INVALID_REQUEST);

        let response = reject(r#"{"jsonrpc":"2.0","id":{},"method":"ping"}"#).unwrap();
        assert_eq!(response.id, RequestId::Null);

        // Invalid notifications get no answer.
        assert!(reject(r#"{"jsonrpc":"2.0","method":7}"#).is_none());
    }

    #[tokio::test]
    async fn test_unary_calls_over_tcp() {
        let (addr, _shutdown, _handle) = start(MockBehaviour::default()).await;
        let mut client = TestClient::connect(addr).await;

        let response = client.call(1, "getStatus", Value::Null).await;
        assert_eq!(response["error"]["code"], error_codes::PRECONDITION_FAILED);

        let response = client.call(2, "register", json!({"storageId": "s1"})).await;
        assert_eq!(response["id"], 2);
        assert_eq!(response["result"], json!({}));

        let response = client.call(3, "getStatus", Value::Null).await;
        assert_eq!(response["result"]["state"], "NEVER_UPDATED");
    }

    #[tokio::test]
    async fn test_malformed_lines_are_answered() {
        let (addr, _shutdown, _handle) = start(MockBehaviour::default()).await;
        let mut client = TestClient::connect(addr).await;

        client.writer.write_all(b"this is not json\n\n").await.unwrap();
        client.send(json!({"id": 1, "method": "ping"})).await;
        client.send(json!({"jsonrpc": "2.0", "id": 2, "method": 42})).await;
        client.send(json!({"jsonrpc": "2.0", "id": 3, "method": "ping"})).await;

        let mut responses = HashMap::new();
        for _ in 0..4 {
            let response = client.next().await;
            responses.insert(response["id"].to_string(), response);
        }

        assert_eq!(responses["null"]["error"]["code"], error_codes::PARSE_ERROR);
        assert_eq!(responses["1"]["error"]["code"], error_codes::INVALID_REQUEST);
        assert_eq!(responses["2"]["error"]["code"], error_codes::INVALID_REQUEST);
        assert_eq!(responses["3"]["result"], json!({}));
    }

    #[tokio::test]
    async fn test_rejects_id_already_in_flight() {
        let (addr, _shutdown, _handle) = start(MockBehaviour::default()).await;
        let mut client = TestClient::connect(addr).await;

        client
            .send(json!({"jsonrpc": "2.0", "id": "x", "method": "streamLogs"}))
            .await;
        tokio::time::sleep(Duration::from_millis(20)).await;

        let response = client.call_with_id(json!("x"), "ping", Value::Null).await;
        assert_eq!(response["error"]["code"], error_codes::INVALID_REQUEST);

        // The log stream is still cancellable under its own id.
        client
            .send(json!({
                "jsonrpc": "2.0", "method": "notifications/cancelled",
                "params": {"requestId": "x"}
            }))
            .await;
        let done = client.next().await;
        assert_eq!(done["id"], "x");
        assert_eq!(done["result"], Value::Null);
    }

    #[tokio::test]
    async fn test_analyze_streams_over_tcp() {
        let (addr, _shutdown, _handle) = start(MockBehaviour {
            issues: vec![sample_issue("js:S1", 1), sample_issue("js:S2", 2)],
            ..Default::default()
        })
        .await;
        let mut client = TestClient::connect(addr).await;

        client.call(1, "register", json!({"storageId": "s1"})).await;
        client
            .call(2, "update", json!({"hostUrl": "http://localhost:9000", "token": "t"}))
            .await;

        client
            .send(json!({
                "jsonrpc": "2.0", "id": 3, "method": "analyze",
                "params": {"baseDir": "/work", "files": [{"path": "a.js", "userTag": "x"}]}
            }))
            .await;

        let first = client.next().await;
        assert_eq!(first["method"], "stream/item");
        assert_eq!(first["params"]["requestId"], 3);
        assert_eq!(first["params"]["item"]["ruleKey"], "js:S1");

        let second = client.next().await;
        assert_eq!(second["params"]["item"]["ruleKey"], "js:S2");

        let done = client.next().await;
        assert_eq!(done["id"], 3);
        assert!(done.as_object().unwrap().contains_key("result"));
        assert_eq!(done["result"], Value::Null);
        assert!(done.get("error").is_none());
    }

    #[tokio::test]
    async fn test_cancel_log_stream() {
        let (addr, _shutdown, _handle) = start(MockBehaviour::default()).await;
        let mut client = TestClient::connect(addr).await;

        client
            .send(json!({"jsonrpc": "2.0", "id": "logs", "method": "streamLogs"}))
            .await;
        tokio::time::sleep(Duration::from_millis(20)).await;
        client
            .send(json!({
                "jsonrpc": "2.0", "method": "notifications/cancelled",
                "params": {"requestId": "logs"}
            }))
            .await;

        let done = client.next().await;
        assert_eq!(done["id"], "logs");
        assert_eq!(done["result"], Value::Null);
    }

    #[tokio::test]
    async fn test_shutdown_acks_then_refuses_connections() {
        let (addr, shutdown, handle) = start(MockBehaviour::default()).await;
        let mut client = TestClient::connect(addr).await;

        let ack = client.call(1, "shutdown", Value::Null).await;
        assert_eq!(ack["id"], 1);
        assert_eq!(ack["result"], json!({}));

        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert!(shutdown.is_cancelled());
        assert!(TcpStream::connect(addr).await.is_err());
    }
}
