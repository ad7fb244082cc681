//! RPC server implementation.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use serde_json::value::RawValue;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, instrument, warn};

use crate::channel::{Channel, ChannelReceiver, ChannelSender};
use crate::error::{ChannelError, Error, Result};
use crate::handler::{Assigner, Context, into_error_object};
use crate::observer::RpcObserver;
use crate::protocol::{
    ErrorObject, Id, Message, Request, Response, context, decode_frame, encode_frame, to_params,
};

/// Name of the built-in introspection method.
pub const SERVER_INFO_METHOD: &str = "rpc.serverInfo";

/// Prefix reserved for built-in methods. Assigner entries using it are
/// never served.
pub const RESERVED_PREFIX: &str = "rpc.";

/// Configuration for the RPC server.
#[derive(Clone)]
pub struct ServerConfig {
    /// Maximum number of handlers running at once on one connection.
    pub concurrency: usize,
    /// Accept messages in the legacy envelope without a version tag.
    pub allow_v1: bool,
    /// Unwrap the context envelope from every request's params.
    pub decode_context: bool,
    /// Do not serve the built-in `rpc.serverInfo` method.
    pub disable_builtin: bool,
    /// Sees every request received and response sent.
    pub observer: Option<Arc<dyn RpcObserver>>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            concurrency: num_cpus::get().max(1),
            allow_v1: false,
            decode_context: false,
            disable_builtin: false,
            observer: None,
        }
    }
}

impl fmt::Debug for ServerConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServerConfig")
            .field("concurrency", &self.concurrency)
            .field("allow_v1", &self.allow_v1)
            .field("decode_context", &self.decode_context)
            .field("disable_builtin", &self.disable_builtin)
            .field("observer", &self.observer.is_some())
            .finish()
    }
}

/// Builder for creating RPC servers.
#[derive(Debug, Default)]
pub struct ServerBuilder {
    config: ServerConfig,
}

impl ServerBuilder {
    /// Create a new server builder.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the handler concurrency bound (at least 1).
    #[must_use]
    pub const fn concurrency(mut self, concurrency: usize) -> Self {
        self.config.concurrency = if concurrency == 0 { 1 } else { concurrency };
        self
    }

    /// Accept the legacy envelope.
    #[must_use]
    pub const fn allow_v1(mut self, enabled: bool) -> Self {
        self.config.allow_v1 = enabled;
        self
    }

    /// Unwrap the context envelope from request params.
    #[must_use]
    pub const fn decode_context(mut self, enabled: bool) -> Self {
        self.config.decode_context = enabled;
        self
    }

    /// Turn off the built-in introspection method.
    #[must_use]
    pub const fn disable_builtin(mut self, disabled: bool) -> Self {
        self.config.disable_builtin = disabled;
        self
    }

    /// Attach an observer.
    #[must_use]
    pub fn observer(mut self, observer: Arc<dyn RpcObserver>) -> Self {
        self.config.observer = Some(observer);
        self
    }

    /// Build the server around `assigner`.
    #[must_use]
    pub fn build(self, assigner: impl Assigner) -> RpcServer {
        RpcServer::new(assigner, self.config)
    }
}

/// Traffic counters for one connection.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Metrics {
    /// Calls received (items with an id).
    pub requests: u64,
    /// Notifications received.
    pub notifications: u64,
    /// Error responses sent.
    pub errors: u64,
}

/// Result of the built-in `rpc.serverInfo` method.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerInfo {
    /// Registered method names, sorted, without built-ins.
    pub methods: Vec<String>,
    /// When the connection's loop started.
    pub start_time: DateTime<Utc>,
    /// Counters so far.
    pub metrics: Metrics,
}

/// A method registry ready to be bound to channels.
///
/// One server may serve any number of channels; each [`RpcServer::start`]
/// runs an independent loop.
#[derive(Clone)]
pub struct RpcServer {
    assigner: Arc<dyn Assigner>,
    config: ServerConfig,
}

impl RpcServer {
    /// Create a new server builder.
    #[must_use]
    pub fn builder() -> ServerBuilder {
        ServerBuilder::new()
    }

    /// Create a new RPC server.
    pub fn new(assigner: impl Assigner, config: ServerConfig) -> Self {
        Self {
            assigner: Arc::new(assigner),
            config,
        }
    }

    /// Starts serving `channel` on a background task.
    ///
    /// Must be called within a Tokio runtime.
    #[must_use]
    pub fn start(&self, channel: Channel) -> ServerHandle {
        let (writer, receiver) = channel.split();

        let mut methods: Vec<String> = self
            .assigner
            .names()
            .into_iter()
            .filter(|name| !name.starts_with(RESERVED_PREFIX))
            .collect();
        methods.sort();
        methods.dedup();

        let shared = Arc::new(Shared {
            assigner: Arc::clone(&self.assigner),
            config: self.config.clone(),
            writer: tokio::sync::Mutex::new(writer),
            semaphore: Arc::new(Semaphore::new(self.config.concurrency.max(1))),
            frame_slots: Arc::new(Semaphore::new(self.config.concurrency.max(1))),
            shutdown: CancellationToken::new(),
            tracker: TaskTracker::new(),
            stopped: AtomicBool::new(false),
            methods,
            start_time: Utc::now(),
            requests: AtomicU64::new(0),
            notifications: AtomicU64::new(0),
            errors: AtomicU64::new(0),
        });

        let task = tokio::spawn(serve(Arc::clone(&shared), receiver));
        ServerHandle { shared, task }
    }
}

impl fmt::Debug for RpcServer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RpcServer")
            .field("methods", &self.assigner.names())
            .field("config", &self.config)
            .finish()
    }
}

/// Handle to a running server loop.
pub struct ServerHandle {
    shared: Arc<Shared>,
    task: JoinHandle<Result<()>>,
}

impl ServerHandle {
    /// Requests graceful shutdown.
    ///
    /// No further frames are read. Handlers already dispatched run to
    /// completion and their replies are written, then the channel is closed.
    /// Handlers can observe the request through [`Context::cancelled`].
    pub fn stop(&self) {
        if !self.shared.shutdown.is_cancelled() {
            info!("RPC server stop requested");
        }
        self.shared.shutdown.cancel();
    }

    /// Waits for the loop to end.
    ///
    /// # Errors
    ///
    /// Returns the channel error that ended the loop, if one did.
    pub async fn wait(self) -> Result<()> {
        match self.task.await {
            Ok(result) => result,
            Err(e) => {
                error!("Server task failed: {}", e);
                Err(Error::ServerStopped)
            }
        }
    }

    /// Pushes a notification to the client.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ServerStopped`] once the loop has ended, or an error
    /// if `params` cannot be serialized.
    #[instrument(skip(self, params))]
    pub async fn notify<P: Serialize + ?Sized>(&self, method: &str, params: &P) -> Result<()> {
        let notification = Request::notification(method, to_params(params)?);
        let frame = encode_frame(&[notification], false)?;

        if self.shared.stopped.load(Ordering::Acquire) {
            return Err(Error::ServerStopped);
        }
        self.shared.write(frame).await.map_err(|e| {
            if self.shared.stopped.load(Ordering::Acquire) {
                Error::ServerStopped
            } else {
                Error::Channel(e)
            }
        })
    }

    /// The same information `rpc.serverInfo` returns.
    #[must_use]
    pub fn info(&self) -> ServerInfo {
        self.shared.info()
    }

    /// Whether the loop has ended.
    #[must_use]
    pub fn is_stopped(&self) -> bool {
        self.shared.stopped.load(Ordering::Acquire)
    }
}

impl fmt::Debug for ServerHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServerHandle")
            .field("stopped", &self.is_stopped())
            .finish_non_exhaustive()
    }
}

struct Shared {
    assigner: Arc<dyn Assigner>,
    config: ServerConfig,
    writer: tokio::sync::Mutex<Box<dyn ChannelSender>>,
    semaphore: Arc<Semaphore>,
    /// Frames decoded or dispatched but not yet answered.
    frame_slots: Arc<Semaphore>,
    shutdown: CancellationToken,
    tracker: TaskTracker,
    stopped: AtomicBool,
    methods: Vec<String>,
    start_time: DateTime<Utc>,
    requests: AtomicU64,
    notifications: AtomicU64,
    errors: AtomicU64,
}

impl Shared {
    fn info(&self) -> ServerInfo {
        ServerInfo {
            methods: self.methods.clone(),
            start_time: self.start_time,
            metrics: Metrics {
                requests: self.requests.load(Ordering::Relaxed),
                notifications: self.notifications.load(Ordering::Relaxed),
                errors: self.errors.load(Ordering::Relaxed),
            },
        }
    }

    async fn write(&self, frame: Bytes) -> std::result::Result<(), ChannelError> {
        let mut writer = self.writer.lock().await;
        writer.send(frame).await
    }

    /// Decodes one frame, runs its items concurrently and writes the replies
    /// as one frame.
    async fn handle_frame(self: Arc<Self>, payload: Bytes) {
        let decoded = match decode_frame(&payload, self.config.allow_v1) {
            Ok(decoded) => decoded,
            Err(e) => {
                warn!("Dropping malformed frame: {}", e);
                return;
            }
        };
        if decoded.items.is_empty() {
            warn!("Dropping empty batch");
            return;
        }

        let mut replies = Vec::new();
        let mut calls = Vec::new();
        for item in decoded.items {
            match item {
                Message::Request(request) => calls.push(self.run(request)),
                Message::Response(response) => {
                    warn!("Dropping unexpected response {}", response.id());
                }
                Message::Invalid(rejected) => match rejected.id {
                    Some(id) => replies.push(Response::failure(id, rejected.error)),
                    None => warn!("Dropping invalid message without id: {}", rejected.error),
                },
            }
        }
        replies.extend(join_all(calls).await.into_iter().flatten());

        if replies.is_empty() {
            return;
        }

        let errors = replies.iter().filter(|reply| reply.is_error()).count();
        self.errors
            .fetch_add(u64::try_from(errors).unwrap_or(u64::MAX), Ordering::Relaxed);
        if let Some(observer) = &self.config.observer {
            for reply in &replies {
                observer.on_response(reply);
            }
        }

        let frame = match encode_frame(&replies, decoded.batch) {
            Ok(frame) => frame,
            Err(e) => {
                error!("Failed to encode replies: {}", e);
                return;
            }
        };
        debug!("Writing {} replies", replies.len());
        if let Err(e) = self.write(frame).await {
            error!("Failed to write replies: {}", e);
        }
    }

    /// Runs one request. Returns the reply, or `None` for a notification.
    async fn run(&self, request: Request) -> Option<Response> {
        if let Some(observer) = &self.config.observer {
            observer.on_request(&request);
        }

        let (id, method, params) = request.into_parts();
        let counter = if id.is_some() {
            &self.requests
        } else {
            &self.notifications
        };
        counter.fetch_add(1, Ordering::Relaxed);

        let outcome = self.invoke(id.clone(), &method, params).await;
        match (id, outcome) {
            (Some(id), Ok(result)) => Some(Response::success(id, result)),
            (Some(id), Err(error)) => Some(Response::failure(id, error)),
            (None, Ok(_)) => None,
            (None, Err(error)) => {
                debug!("Notification {} failed: {}", method, error);
                None
            }
        }
    }

    async fn invoke(
        &self,
        id: Option<Id>,
        method: &str,
        params: Option<Box<RawValue>>,
    ) -> std::result::Result<Box<RawValue>, ErrorObject> {
        if method == SERVER_INFO_METHOD && !self.config.disable_builtin {
            return serde_json::value::to_raw_value(&self.info())
                .map_err(|e| ErrorObject::internal(e.to_string()));
        }
        if method.starts_with(RESERVED_PREFIX) {
            return Err(ErrorObject::method_not_found(method));
        }
        let handler = self
            .assigner
            .assign(method)
            .ok_or_else(|| ErrorObject::method_not_found(method))?;

        let mut ctx = Context::new(id, method, self.shutdown.child_token());
        let params = if self.config.decode_context {
            let unwrapped =
                context::decode(params.as_deref()).map_err(ErrorObject::invalid_params)?;
            if let Some(deadline) = unwrapped.deadline {
                ctx = ctx.with_deadline(deadline);
            }
            unwrapped.payload
        } else {
            params
        };

        let permit = Arc::clone(&self.semaphore)
            .acquire_owned()
            .await
            .map_err(|_| ErrorObject::internal("server is stopping"))?;

        // The handler runs on its own task so a panic is contained there.
        let task = tokio::spawn(async move {
            let _permit = permit;
            handler.handle(ctx, params).await
        });

        match task.await {
            Ok(Ok(result)) => Ok(result),
            Ok(Err(err)) => Err(into_error_object(err)),
            Err(e) if e.is_panic() => {
                error!("Handler for {} panicked", method);
                Err(ErrorObject::internal(format!("handler for {method} panicked")))
            }
            Err(e) => Err(ErrorObject::internal(e.to_string())),
        }
    }
}

async fn serve(shared: Arc<Shared>, mut receiver: Box<dyn ChannelReceiver>) -> Result<()> {
    info!("RPC server started with {} methods", shared.methods.len());

    let result = loop {
        // Reading stops while every slot is busy, so a flooding peer is
        // held back by the channel instead of piling up tasks here.
        let slot = tokio::select! {
            biased;
            () = shared.shutdown.cancelled() => break Ok(()),
            slot = Arc::clone(&shared.frame_slots).acquire_owned() => match slot {
                Ok(slot) => slot,
                Err(_) => break Ok(()),
            },
        };

        let frame = tokio::select! {
            biased;
            () = shared.shutdown.cancelled() => break Ok(()),
            frame = receiver.recv() => frame,
        };

        match frame {
            Ok(Some(payload)) => {
                debug!("Received frame of {} bytes", payload.len());
                let frame_shared = Arc::clone(&shared);
                shared.tracker.spawn(async move {
                    let _slot = slot;
                    frame_shared.handle_frame(payload).await;
                });
            }
            Ok(None) => {
                debug!("Client closed the channel");
                break Ok(());
            }
            Err(e) => {
                error!("Server channel failed: {}", e);
                break Err(Error::Channel(e));
            }
        }
    };

    shared.tracker.close();
    shared.tracker.wait().await;

    shared.stopped.store(true, Ordering::Release);
    if let Err(e) = shared.writer.lock().await.close().await {
        debug!("Error closing channel: {}", e);
    }

    info!("RPC server stopped");
    result
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::channel::memory;
    use crate::handler::{MethodMap, handler_fn};
    use crate::observer::testing::Recorder;
    use crate::protocol::{FrameCodec, Framing};
    use serde_json::json;

    fn methods() -> MethodMap {
        MethodMap::new()
            .with(
                "Len",
                handler_fn(|_ctx, (text,): (String,)| async move { anyhow::Ok(text.len()) }),
            )
            .with(
                "Fail",
                handler_fn(|_ctx, (): ()| async move {
                    Err::<(), _>(anyhow::Error::new(ErrorObject::new(-32001, "nope")))
                }),
            )
            .with(
                "Boom",
                handler_fn(|_ctx, (): ()| async move {
                    if true {
                        panic!("handler exploded");
                    }
                    anyhow::Ok(())
                }),
            )
            .with(
                "rpc.hidden",
                handler_fn(|_ctx, (): ()| async move { anyhow::Ok(()) }),
            )
    }

    async fn send(client: &mut Channel, value: &serde_json::Value) {
        client
            .send(Bytes::from(serde_json::to_vec(value).unwrap()))
            .await
            .unwrap();
    }

    async fn send_text(client: &mut Channel, text: &str) {
        client.send(Bytes::from(text.to_string())).await.unwrap();
    }

    async fn recv(client: &mut Channel) -> serde_json::Value {
        let frame = tokio::time::timeout(Duration::from_secs(5), client.recv())
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        serde_json::from_slice(&frame).unwrap()
    }

    async fn assert_silent(client: &mut Channel) {
        let quiet = tokio::time::timeout(Duration::from_millis(50), client.recv()).await;
        assert!(quiet.is_err(), "unexpected frame: {quiet:?}");
    }

    #[tokio::test]
    async fn test_unknown_method_echoes_raw_id() {
        let _ = tracing_subscriber::fmt::try_init();
        let (mut client, server_end) = memory::pair(8);
        let _handle = RpcServer::new(methods(), ServerConfig::default()).start(server_end);

        send_text(&mut client, r#"{"jsonrpc":"2.0","id":1.50,"method":"Nope"}"#).await;
        let frame = client.recv().await.unwrap().unwrap();
        let text = std::str::from_utf8(&frame).unwrap();
        assert!(text.contains(r#""id":1.50"#), "{text}");
        assert!(text.contains("-32601"));
    }

    #[tokio::test]
    async fn test_notifications_never_reply() {
        let (mut client, server_end) = memory::pair(8);
        let _handle = RpcServer::new(methods(), ServerConfig::default()).start(server_end);

        send(&mut client, &json!({"jsonrpc": "2.0", "method": "Fail"})).await;
        send(&mut client, &json!({"jsonrpc": "2.0", "method": "Missing"})).await;
        send(
            &mut client,
            &json!([
                {"jsonrpc": "2.0", "method": "Len", "params": ["x"]},
                {"jsonrpc": "2.0", "method": "Fail"},
            ]),
        )
        .await;
        assert_silent(&mut client).await;
    }

    #[tokio::test]
    async fn test_batch_replies_only_for_calls() {
        let (mut client, server_end) = memory::pair(8);
        let _handle = RpcServer::new(methods(), ServerConfig::default()).start(server_end);

        send(
            &mut client,
            &json!([
                {"jsonrpc": "2.0", "id": 1, "method": "Len", "params": ["abcd"]},
                {"jsonrpc": "2.0", "method": "Len", "params": ["z"]},
                {"jsonrpc": "2.0", "id": "two", "method": "Missing"},
                {"jsonrpc": "2.0", "id": 3, "method": 7},
            ]),
        )
        .await;

        let replies = recv(&mut client).await;
        let replies = replies.as_array().unwrap();
        assert_eq!(replies.len(), 3);
        let by_id = |id: serde_json::Value| {
            replies.iter().find(|r| r["id"] == id).unwrap().clone()
        };
        assert_eq!(by_id(json!(1))["result"], 4);
        assert_eq!(by_id(json!("two"))["error"]["code"], -32601);
        assert_eq!(by_id(json!(3))["error"]["code"], -32600);
    }

    #[tokio::test]
    async fn test_empty_batch_is_dropped() {
        let (mut client, server_end) = memory::pair(8);
        let _handle = RpcServer::new(methods(), ServerConfig::default()).start(server_end);

        send_text(&mut client, "[]").await;
        assert_silent(&mut client).await;

        send(
            &mut client,
            &json!({"jsonrpc": "2.0", "id": 1, "method": "Len", "params": ["still"]}),
        )
        .await;
        assert_eq!(recv(&mut client).await["result"], 5);
    }

    #[tokio::test]
    async fn test_single_item_batch_replies_as_array() {
        let (mut client, server_end) = memory::pair(8);
        let _handle = RpcServer::new(methods(), ServerConfig::default()).start(server_end);

        let batch = json!([{"jsonrpc": "2.0", "id": 1, "method": "Len", "params": ["ab"]}]);
        send(&mut client, &batch).await;
        assert_eq!(
            recv(&mut client).await,
            json!([{"jsonrpc": "2.0", "id": 1, "result": 2}])
        );
    }

    #[tokio::test]
    async fn test_handler_errors_and_panics() {
        let (mut client, server_end) = memory::pair(8);
        let _handle = RpcServer::new(methods(), ServerConfig::default()).start(server_end);

        send(&mut client, &json!({"jsonrpc": "2.0", "id": 1, "method": "Fail"})).await;
        assert_eq!(
            recv(&mut client).await["error"],
            json!({"code": -32001, "message": "nope"})
        );

        send(&mut client, &json!({"jsonrpc": "2.0", "id": 2, "method": "Boom"})).await;
        assert_eq!(recv(&mut client).await["error"]["code"], -32603);

        let call = json!({"jsonrpc": "2.0", "id": 3, "method": "Len", "params": ["ok"]});
        send(&mut client, &call).await;
        assert_eq!(recv(&mut client).await["result"], 2);

        let call = json!({"jsonrpc": "2.0", "id": 4, "method": "Len", "params": [1]});
        send(&mut client, &call).await;
        assert_eq!(recv(&mut client).await["error"]["code"], -32602);
    }

    #[tokio::test]
    async fn test_server_info_and_reserved_prefix() {
        let (mut client, server_end) = memory::pair(8);
        let handle = RpcServer::new(methods(), ServerConfig::default()).start(server_end);

        send(&mut client, &json!({"jsonrpc": "2.0", "id": 1, "method": "rpc.serverInfo"})).await;
        let reply = recv(&mut client).await;
        let info: ServerInfo = serde_json::from_value(reply["result"].clone()).unwrap();
        assert_eq!(info.methods, ["Boom", "Fail", "Len"]);
        assert_eq!(info.metrics.requests, 1);

        send(&mut client, &json!({"jsonrpc": "2.0", "id": 2, "method": "rpc.hidden"})).await;
        assert_eq!(recv(&mut client).await["error"]["code"], -32601);

        let local = handle.info();
        assert_eq!(local.metrics.requests, 2);
        assert_eq!(local.metrics.errors, 1);
    }

    #[tokio::test]
    async fn test_builtin_can_be_disabled() {
        let (mut client, server_end) = memory::pair(8);
        let _handle = RpcServer::builder()
            .disable_builtin(true)
            .build(methods())
            .start(server_end);

        send(&mut client, &json!({"jsonrpc": "2.0", "id": 1, "method": "rpc.serverInfo"})).await;
        assert_eq!(recv(&mut client).await["error"]["code"], -32601);
    }

    #[tokio::test]
    async fn test_v1_envelope_gated() {
        let v1 = json!({"method": "Len", "params": ["abc"], "id": 5});

        let (mut client, server_end) = memory::pair(8);
        let _strict = RpcServer::new(methods(), ServerConfig::default()).start(server_end);
        send(&mut client, &v1).await;
        assert_eq!(recv(&mut client).await["error"]["code"], -32600);

        let (mut client, server_end) = memory::pair(8);
        let _lenient = RpcServer::builder().allow_v1(true).build(methods()).start(server_end);
        send(&mut client, &v1).await;
        assert_eq!(
            recv(&mut client).await,
            json!({"jsonrpc": "2.0", "id": 5, "result": 3})
        );
    }

    #[tokio::test]
    async fn test_bad_context_envelope_is_invalid_params() {
        let (mut client, server_end) = memory::pair(8);
        let _handle = RpcServer::builder().decode_context(true).build(methods()).start(server_end);

        let unwrapped = json!({"jsonrpc": "2.0", "id": 1, "method": "Len", "params": ["raw"]});
        send(&mut client, &unwrapped).await;
        assert_eq!(recv(&mut client).await["error"]["code"], -32602);

        send(
            &mut client,
            &json!({
                "jsonrpc": "2.0",
                "id": 2,
                "method": "Len",
                "params": {"payload": ["wrapped"]},
            }),
        )
        .await;
        assert_eq!(recv(&mut client).await["result"], 7);
    }

    #[tokio::test]
    async fn test_observer_sees_traffic() {
        let recorder = Arc::new(Recorder::default());
        let (mut client, server_end) = memory::pair(8);
        let _handle = RpcServer::builder()
            .observer(recorder.clone())
            .build(methods())
            .start(server_end);

        let call = json!({"jsonrpc": "2.0", "id": 9, "method": "Len", "params": ["a"]});
        send(&mut client, &call).await;
        recv(&mut client).await;

        assert_eq!(*recorder.requests.lock(), ["Len"]);
        assert_eq!(*recorder.responses.lock(), ["9"]);
    }

    #[tokio::test]
    async fn test_stop_closes_channel_and_blocks_notify() {
        let (mut client, server_end) = memory::pair(8);
        let handle = RpcServer::new(methods(), ServerConfig::default()).start(server_end);

        handle.notify("hello", &["world"]).await.unwrap();
        assert_eq!(
            recv(&mut client).await,
            json!({"jsonrpc": "2.0", "method": "hello", "params": ["world"]})
        );

        handle.stop();
        while !handle.is_stopped() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert!(matches!(handle.notify("late", &()).await, Err(Error::ServerStopped)));
        assert!(client.recv().await.unwrap().is_none());
        handle.wait().await.unwrap();
    }

    #[tokio::test]
    async fn test_busy_server_stops_reading() {
        let _ = tracing_subscriber::fmt::try_init();
        let (gate_tx, gate_rx) = flume::unbounded::<()>();
        let methods = MethodMap::new().with(
            "Wait",
            handler_fn(move |_ctx, (): ()| {
                let gate = gate_rx.clone();
                async move {
                    let _ = gate.recv_async().await;
                    anyhow::Ok(())
                }
            }),
        );
        let (mut client, server_end) = memory::pair(1);
        let _handle = RpcServer::builder().concurrency(1).build(methods).start(server_end);

        let call = |id: u64| json!({"jsonrpc": "2.0", "id": id, "method": "Wait"});
        // The first frame occupies the only slot; the second stays queued.
        send(&mut client, &call(1)).await;
        tokio::time::sleep(Duration::from_millis(20)).await;
        send(&mut client, &call(2)).await;

        let third = Bytes::from(serde_json::to_vec(&call(3)).unwrap());
        let blocked =
            tokio::time::timeout(Duration::from_millis(100), client.send(third.clone())).await;
        assert!(blocked.is_err(), "server kept reading while busy");

        for _ in 0..3 {
            gate_tx.send(()).unwrap();
        }
        assert_eq!(recv(&mut client).await["id"], 1);
        client.send(third).await.unwrap();
        assert_eq!(recv(&mut client).await["id"], 2);
        assert_eq!(recv(&mut client).await["id"], 3);
    }

    #[tokio::test]
    async fn test_read_error_ends_loop() {
        let (mut raw, peer) = tokio::io::duplex(1024);
        let channel = Channel::from_stream(peer, FrameCodec::new(Framing::Header));
        let handle = RpcServer::new(methods(), ServerConfig::default()).start(channel);

        tokio::io::AsyncWriteExt::write_all(&mut raw, b"Content-Length: ten\r\n\r\n")
            .await
            .unwrap();

        let result = handle.wait().await;
        assert!(matches!(
            result,
            Err(Error::Channel(ChannelError::InvalidFrame(_)))
        ));
    }
}
