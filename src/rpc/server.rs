//! Request dispatch for the daemon's RPC surface.
//!
//! Transports hand each request to [`RpcServer::handle_request`] together
//! with a [`CallSink`]. Streaming methods push items through the sink while
//! the call runs; every call ends with exactly one response.

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde_json::{json, Value};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::daemon::ConnectedDaemon;
use crate::error::{Error, Result};
use crate::metrics::{Metrics, Timer};
use crate::rpc::protocol::{self as wire, methods, JsonRpcError, JsonRpcRequest, JsonRpcResponse};

/// Outbound side of one call.
#[async_trait]
pub trait CallSink: Send + Sync {
    /// Send one stream item. An error means the caller is gone.
    async fn item(&self, item: Value) -> Result<()>;

    /// Send the final response, returning once it has been written.
    async fn respond(&self, response: JsonRpcResponse);
}

/// Dispatches requests to the daemon.
pub struct RpcServer {
    daemon: Arc<ConnectedDaemon>,
    metrics: Arc<Metrics>,
}

impl RpcServer {
    pub fn new(daemon: Arc<ConnectedDaemon>) -> Self {
        let metrics = Arc::clone(daemon.metrics());
        Self { daemon, metrics }
    }

    pub fn daemon(&self) -> &Arc<ConnectedDaemon> {
        &self.daemon
    }

    /// Serve one request. `cancel` fires when the caller cancels the call or
    /// goes away.
    pub async fn handle_request(
        &self,
        req: JsonRpcRequest,
        sink: &dyn CallSink,
        cancel: CancellationToken,
    ) {
        debug!("Handling request: {} (id: {})", req.method, req.id);
        self.metrics.inc_requests();
        let timer = Timer::start();

        if req.method == methods::SHUTDOWN {
            // The acknowledgement is written before shutdown is signalled.
            self.metrics.inc_success();
            let ack = JsonRpcResponse::success(req.id, json!({}));
            self.daemon.shutdown(sink.respond(ack)).await;
            return;
        }

        let result = if self.daemon.is_shutting_down() {
            Err(Error::ShuttingDown)
        } else {
            self.dispatch(&req, sink, &cancel).await
        };
        self.metrics.observe_request(&timer);

        let response = match result {
            Ok(value) => {
                self.metrics.inc_success();
                JsonRpcResponse::success(req.id, value)
            }
            Err(e) => {
                self.metrics.inc_failed();
                debug!("Request {} ({}) failed: {}", req.id, req.method, e);
                JsonRpcResponse::failure(req.id, JsonRpcError::from(&e))
            }
        };
        sink.respond(response).await;
    }

    async fn dispatch(
        &self,
        req: &JsonRpcRequest,
        sink: &dyn CallSink,
        cancel: &CancellationToken,
    ) -> Result<Value> {
        let params = req.params.clone();

        match req.method.as_str() {
            methods::PING => Ok(json!({})),
            methods::REGISTER => {
                self.daemon.register(parse_params(params)?).await?;
                Ok(json!({}))
            }
            methods::ANALYZE => self.handle_analyze(parse_params(params)?, sink, cancel).await,
            methods::STREAM_LOGS => self.handle_stream_logs(sink, cancel).await,
            methods::UPDATE => {
                self.daemon.update(parse_params(params)?).await?;
                Ok(json!({}))
            }
            methods::UPDATE_PROJECT | methods::UPDATE_MODULE => {
                self.daemon.update_project(parse_params(params)?).await?;
                Ok(json!({}))
            }
            methods::GET_STATUS | methods::GET_STATE => {
                Ok(serde_json::to_value(self.daemon.get_status().await?)?)
            }
            methods::GET_RULE_DETAIL | methods::GET_RULE_DETAILS => {
                let details = self.daemon.get_rule_detail(parse_params(params)?).await?;
                Ok(serde_json::to_value(details)?)
            }
            other => Err(Error::MethodNotFound(other.to_string())),
        }
    }

    /// Run an analysis while forwarding its issues to the caller.
    async fn handle_analyze(
        &self,
        req: wire::ConnectedAnalysisReq,
        sink: &dyn CallSink,
        cancel: &CancellationToken,
    ) -> Result<Value> {
        let _stream = self.metrics.stream_guard();
        let (tx, mut rx) = mpsc::channel::<wire::Issue>(1);

        // Dropping `rx` makes the engine side discard the remaining issues.
        let forward = async move {
            loop {
                let issue = tokio::select! {
                    biased;
                    _ = cancel.cancelled() => {
                        debug!("Analysis cancelled by caller, no longer forwarding issues");
                        break;
                    }
                    issue = rx.recv() => match issue {
                        Some(issue) => issue,
                        None => break,
                    },
                };

                let item = match serde_json::to_value(&issue) {
                    Ok(item) => item,
                    Err(e) => {
                        warn!("Failed to serialize issue: {}", e);
                        continue;
                    }
                };
                if sink.item(item).await.is_err() {
                    debug!("Caller went away, no longer forwarding issues");
                    break;
                }
            }
        };

        let (result, ()) = tokio::join!(self.daemon.analyze(req, tx), forward);
        result?;

        if cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }
        Ok(Value::Null)
    }

    /// Forward engine logs until the caller leaves, is displaced, or the
    /// daemon shuts down.
    async fn handle_stream_logs(
        &self,
        sink: &dyn CallSink,
        cancel: &CancellationToken,
    ) -> Result<Value> {
        let mut subscription = self.daemon.stream_logs()?;
        let _stream = self.metrics.stream_guard();
        let shutdown = self.daemon.shutdown_token();

        loop {
            let event = tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                _ = shutdown.cancelled() => break,
                event = subscription.recv() => match event {
                    Some(event) => event,
                    None => break,
                },
            };

            if sink.item(serde_json::to_value(&event)?).await.is_err() {
                break;
            }
        }

        debug!("Log stream {} ended", subscription.id());
        Ok(Value::Null)
    }
}

/// Deserialize request params; absent params mean defaults.
fn parse_params<T: DeserializeOwned + Default>(params: Option<Value>) -> Result<T> {
    match params {
        None | Some(Value::Null) => Ok(T::default()),
        Some(value) => serde_json::from_value(value).map_err(|e| Error::InvalidParams(e.to_string())),
    }
}
