//! RPC client implementation.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::value::RawValue;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use crate::channel::{Channel, ChannelReceiver, ChannelSender};
use crate::error::{ChannelError, Error, Result};
use crate::observer::RpcObserver;
use crate::protocol::context::{self, time_until};
use crate::protocol::{
    ErrorObject, Id, Message, Request, Response, decode_frame, encode_frame, to_params,
};

/// Callback invoked with notifications pushed by the server.
pub type NotifyCallback = Arc<dyn Fn(Request) + Send + Sync>;

/// How long `close` waits for buffered frames to reach a slow peer.
const CLOSE_FLUSH_TIMEOUT: Duration = Duration::from_secs(5);

/// Type alias for the slot a pending call's outcome is delivered to.
type ResponseSender = oneshot::Sender<Result<Response>>;

/// Configuration for the RPC client.
#[derive(Clone, Default)]
pub struct ClientConfig {
    /// Wrap every request's params in the context envelope so the server
    /// sees the caller's deadline.
    pub propagate_context: bool,
    /// Sees every request sent and response received by this client.
    pub observer: Option<Arc<dyn RpcObserver>>,
    /// Receives notifications pushed by the server. Without one they are
    /// logged and discarded.
    pub on_notify: Option<NotifyCallback>,
}

impl fmt::Debug for ClientConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientConfig")
            .field("propagate_context", &self.propagate_context)
            .field("observer", &self.observer.is_some())
            .field("on_notify", &self.on_notify.is_some())
            .finish()
    }
}

/// Builder for creating RPC clients.
#[derive(Debug, Default)]
pub struct ClientBuilder {
    config: ClientConfig,
}

impl ClientBuilder {
    /// Create a new client builder.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Propagate call deadlines to the server in the context envelope.
    #[must_use]
    pub const fn propagate_context(mut self, enabled: bool) -> Self {
        self.config.propagate_context = enabled;
        self
    }

    /// Attach an observer.
    #[must_use]
    pub fn observer(mut self, observer: Arc<dyn RpcObserver>) -> Self {
        self.config.observer = Some(observer);
        self
    }

    /// Handle notifications pushed by the server.
    #[must_use]
    pub fn on_notify(mut self, callback: impl Fn(Request) + Send + Sync + 'static) -> Self {
        self.config.on_notify = Some(Arc::new(callback));
        self
    }

    /// Build the client over `channel` and start its reader task.
    ///
    /// Must be called within a Tokio runtime.
    #[must_use]
    pub fn build(self, channel: Channel) -> RpcClient {
        RpcClient::with_config(channel, self.config)
    }
}

/// Per-call cancellation: an optional deadline and an optional token.
#[derive(Clone, Debug, Default)]
pub struct CallContext {
    deadline: Option<DateTime<Utc>>,
    cancel: Option<CancellationToken>,
}

impl CallContext {
    /// A context that never expires.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Give up at `deadline`.
    #[must_use]
    pub const fn with_deadline(mut self, deadline: DateTime<Utc>) -> Self {
        self.deadline = Some(deadline);
        self
    }

    /// Give up after `timeout` from now.
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.deadline = chrono::Duration::from_std(timeout)
            .ok()
            .and_then(|timeout| Utc::now().checked_add_signed(timeout));
        self
    }

    /// Give up when `token` is cancelled.
    #[must_use]
    pub fn with_cancel(mut self, token: CancellationToken) -> Self {
        self.cancel = Some(token);
        self
    }

    /// The deadline, if any.
    #[must_use]
    pub const fn deadline(&self) -> Option<DateTime<Utc>> {
        self.deadline
    }

    fn check(&self) -> Result<()> {
        if self.cancel.as_ref().is_some_and(CancellationToken::is_cancelled) {
            return Err(Error::Cancelled);
        }
        if self.deadline.is_some_and(|deadline| deadline <= Utc::now()) {
            return Err(Error::DeadlineExceeded);
        }
        Ok(())
    }
}

/// One entry of a batch: a call, or a notification that gets no reply.
#[derive(Clone, Debug)]
pub struct CallSpec {
    method: String,
    params: Option<Box<RawValue>>,
    notification: bool,
}

impl CallSpec {
    /// A call whose reply will be waited for.
    ///
    /// # Errors
    ///
    /// Returns an error if `params` cannot be serialized.
    pub fn call<P: Serialize + ?Sized>(method: impl Into<String>, params: &P) -> Result<Self> {
        Ok(Self::raw(method, to_params(params)?))
    }

    /// A notification: sent, never replied to, excluded from the wait set.
    ///
    /// # Errors
    ///
    /// Returns an error if `params` cannot be serialized.
    pub fn notify<P: Serialize + ?Sized>(method: impl Into<String>, params: &P) -> Result<Self> {
        Ok(Self::raw(method, to_params(params)?).fire_and_forget())
    }

    /// A call with pre-encoded parameters.
    pub fn raw(method: impl Into<String>, params: Option<Box<RawValue>>) -> Self {
        Self {
            method: method.into(),
            params,
            notification: false,
        }
    }

    /// Turns this entry into a notification.
    #[must_use]
    pub const fn fire_and_forget(mut self) -> Self {
        self.notification = true;
        self
    }

    /// The method name.
    #[must_use]
    pub fn method(&self) -> &str {
        &self.method
    }

    /// Whether this entry is a notification.
    #[must_use]
    pub const fn is_notification(&self) -> bool {
        self.notification
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Open,
    Closing,
    Closed,
}

struct Inner {
    writer: tokio::sync::Mutex<Box<dyn ChannelSender>>,
    pending: DashMap<Id, ResponseSender>,
    next_id: AtomicU64,
    state: RwLock<State>,
    failure: Mutex<Option<ChannelError>>,
    reader: Mutex<Option<JoinHandle<()>>>,
    shutdown: CancellationToken,
    config: ClientConfig,
}

impl Inner {
    /// Moves an open client to closing and fails every pending call.
    /// Returns false if the client was already closing.
    fn begin_closing(&self, failure: Option<ChannelError>) -> bool {
        {
            let mut state = self.state.write();
            if *state != State::Open {
                return false;
            }
            *state = State::Closing;
        }

        if let Some(failure) = failure {
            *self.failure.lock() = Some(failure);
        }
        self.shutdown.cancel();

        let ids: Vec<Id> = self.pending.iter().map(|entry| entry.key().clone()).collect();
        let count = ids.len();
        for id in ids {
            if let Some((_, tx)) = self.pending.remove(&id) {
                let _ = tx.send(Err(Error::ClientClosed));
            }
        }
        debug!("Client closing, failed {} pending calls", count);
        true
    }

    fn remove_pending(&self, ids: &[Id]) {
        for id in ids {
            self.pending.remove(id);
        }
    }

    fn complete(&self, response: Response) {
        if let Some(observer) = &self.config.observer {
            observer.on_response(&response);
        }

        match self.pending.remove(response.id()) {
            Some((_, tx)) => {
                debug!(
                    "Completed call {} (pending: {})",
                    response.id(),
                    self.pending.len()
                );
                let _ = tx.send(Ok(response));
            }
            None => warn!("Dropping response with unknown id {}", response.id()),
        }
    }

    async fn write(&self, frame: Bytes) -> Result<()> {
        let mut writer = self.writer.lock().await;
        tokio::select! {
            () = self.shutdown.cancelled() => Err(Error::ClientClosed),
            result = writer.send(frame) => result.map_err(Error::from),
        }
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

/// JSON-RPC client over one channel.
///
/// Cloning is cheap and every clone shares the same connection.
#[derive(Clone)]
pub struct RpcClient {
    inner: Arc<Inner>,
}

impl RpcClient {
    /// Create a new client builder.
    #[must_use]
    pub fn builder() -> ClientBuilder {
        ClientBuilder::new()
    }

    /// Creates a client with the default configuration.
    ///
    /// Must be called within a Tokio runtime.
    #[must_use]
    pub fn new(channel: Channel) -> Self {
        Self::with_config(channel, ClientConfig::default())
    }

    /// Creates a client and starts its reader task.
    ///
    /// Must be called within a Tokio runtime.
    #[must_use]
    pub fn with_config(channel: Channel, config: ClientConfig) -> Self {
        let (writer, receiver) = channel.split();
        let inner = Arc::new(Inner {
            writer: tokio::sync::Mutex::new(writer),
            pending: DashMap::new(),
            next_id: AtomicU64::new(1),
            state: RwLock::new(State::Open),
            failure: Mutex::new(None),
            reader: Mutex::new(None),
            shutdown: CancellationToken::new(),
            config,
        });

        let handle = tokio::spawn(read_loop(
            Arc::downgrade(&inner),
            receiver,
            inner.shutdown.clone(),
        ));
        *inner.reader.lock() = Some(handle);

        Self { inner }
    }

    /// Sends one call and waits for its response.
    ///
    /// An error response is returned as `Ok`; see [`Response::decode`].
    ///
    /// # Errors
    ///
    /// Returns [`Error::ClientClosed`] if the client closes first, or an
    /// error if the request cannot be encoded or written.
    #[instrument(skip(self, params))]
    pub async fn call<P: Serialize + ?Sized>(&self, method: &str, params: &P) -> Result<Response> {
        self.call_with(&CallContext::default(), method, params).await
    }

    /// Sends one call under `ctx` and waits for its response.
    ///
    /// # Errors
    ///
    /// Besides the errors of [`RpcClient::call`], returns
    /// [`Error::Cancelled`] or [`Error::DeadlineExceeded`] when `ctx` ends
    /// first. The pending entry is removed either way.
    #[instrument(skip(self, ctx, params))]
    pub async fn call_with<P: Serialize + ?Sized>(
        &self,
        ctx: &CallContext,
        method: &str,
        params: &P,
    ) -> Result<Response> {
        let batch = self.batch(ctx, vec![CallSpec::call(method, params)?]).await?;
        batch
            .wait()
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| Error::Protocol("call resolved without a response".to_string()))
    }

    /// Sends one call and decodes its result.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Rpc`] for an error response, in addition to the
    /// errors of [`RpcClient::call`].
    pub async fn call_result<T, P>(&self, method: &str, params: &P) -> Result<T>
    where
        T: DeserializeOwned,
        P: Serialize + ?Sized,
    {
        self.call(method, params).await?.decode()
    }

    /// Sends entries as one frame and returns a handle for their responses.
    ///
    /// # Errors
    ///
    /// Returns an error if the client is closed or the frame cannot be
    /// written.
    pub async fn send(&self, specs: Vec<CallSpec>) -> Result<Batch> {
        self.batch(&CallContext::default(), specs).await
    }

    /// Sends a notification. Returns once the frame is written.
    ///
    /// # Errors
    ///
    /// Returns an error if the client is closed or the write fails.
    #[instrument(skip(self, params))]
    pub async fn notify<P: Serialize + ?Sized>(&self, method: &str, params: &P) -> Result<()> {
        self.batch(&CallContext::default(), vec![CallSpec::notify(method, params)?])
            .await
            .map(drop)
    }

    /// Sends entries as one frame under `ctx`.
    ///
    /// Each call gets a fresh id and a pending entry before the frame is
    /// written; notifications get neither. A single entry is written as a
    /// plain object, several as a JSON array, and none writes nothing.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ClientClosed`] if the client is not open,
    /// [`Error::Cancelled`] or [`Error::DeadlineExceeded`] if `ctx` has
    /// already ended, or the write error.
    #[instrument(skip_all, fields(entries = specs.len()))]
    pub async fn batch(&self, ctx: &CallContext, specs: Vec<CallSpec>) -> Result<Batch> {
        ctx.check()?;

        let inner = &self.inner;
        let mut batch = Batch {
            ids: Vec::new(),
            receivers: Vec::new(),
            deadline: ctx.deadline,
            cancel: ctx.cancel.clone(),
            client: Arc::downgrade(inner),
        };
        if specs.is_empty() {
            return Ok(batch);
        }

        // Id assignment, registration and the write happen under the writer
        // lock so ids reach the wire in issue order.
        let mut writer = inner.writer.lock().await;

        let mut requests = Vec::with_capacity(specs.len());
        for spec in specs {
            let params = if inner.config.propagate_context {
                Some(context::encode(ctx.deadline, spec.params.as_deref())?)
            } else {
                spec.params
            };

            if spec.notification {
                requests.push(Request::notification(spec.method, params));
            } else {
                let id = Id::number(inner.next_id.fetch_add(1, Ordering::Relaxed));
                batch.ids.push(id.clone());
                requests.push(Request::new(id, spec.method, params));
            }
        }
        let frame = encode_frame(&requests, requests.len() > 1)?;

        {
            let state = inner.state.read();
            if *state != State::Open {
                return Err(Error::ClientClosed);
            }
            for id in &batch.ids {
                let (tx, rx) = oneshot::channel();
                inner.pending.insert(id.clone(), tx);
                batch.receivers.push(rx);
            }
        }

        if let Some(observer) = &inner.config.observer {
            for request in &requests {
                observer.on_request(request);
            }
        }

        debug!(
            "Sending {} entries, {} awaiting replies (pending: {})",
            requests.len(),
            batch.ids.len(),
            inner.pending.len()
        );

        // A peer that stops reading must not keep close() waiting on the lock.
        let written = tokio::select! {
            () = inner.shutdown.cancelled() => Err(Error::ClientClosed),
            result = writer.send(frame) => result.map_err(Error::Channel),
        };
        drop(writer);

        if let Err(e) = written {
            inner.remove_pending(&batch.ids);
            batch.ids.clear();
            if let Error::Channel(failure) = &e {
                error!("Failed to write request frame: {}", failure);
                inner.begin_closing(None);
            }
            return Err(e);
        }

        Ok(batch)
    }

    /// Closes the client.
    ///
    /// New calls fail with [`Error::ClientClosed`]; so does every call still
    /// pending. The channel's write side is closed and the reader stopped.
    ///
    /// # Errors
    ///
    /// Returns the channel error that ended the reader, if one did.
    #[instrument(skip(self))]
    pub async fn close(&self) -> Result<()> {
        if self.inner.begin_closing(None) {
            info!("Closing RPC client");
        }

        let closed = tokio::time::timeout(CLOSE_FLUSH_TIMEOUT, async {
            self.inner.writer.lock().await.close().await
        })
        .await;
        match closed {
            Ok(Ok(())) => {}
            Ok(Err(e)) => debug!("Error closing channel: {}", e),
            Err(_) => warn!("Peer stopped reading; closing without flushing"),
        }

        let reader = self.inner.reader.lock().take();
        if let Some(reader) = reader {
            if let Err(e) = reader.await {
                warn!("Client reader task failed: {}", e);
            }
        }

        *self.inner.state.write() = State::Closed;

        match self.inner.failure.lock().take() {
            Some(failure) => Err(Error::Channel(failure)),
            None => Ok(()),
        }
    }

    /// Whether the client has stopped accepting calls.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        *self.inner.state.read() != State::Open
    }

    /// Number of calls awaiting a response.
    #[must_use]
    pub fn pending_count(&self) -> usize {
        self.inner.pending.len()
    }
}

impl fmt::Debug for RpcClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RpcClient")
            .field("state", &*self.inner.state.read())
            .field("pending", &self.inner.pending.len())
            .finish_non_exhaustive()
    }
}

/// Handle to the responses of one [`RpcClient::batch`].
///
/// Dropping it without waiting abandons the calls: their pending entries are
/// removed and late responses are discarded.
pub struct Batch {
    ids: Vec<Id>,
    receivers: Vec<oneshot::Receiver<Result<Response>>>,
    deadline: Option<DateTime<Utc>>,
    cancel: Option<CancellationToken>,
    client: Weak<Inner>,
}

impl Batch {
    /// Ids assigned to the calls, in submission order.
    #[must_use]
    pub fn ids(&self) -> &[Id] {
        &self.ids
    }

    /// Number of responses this handle waits for.
    #[must_use]
    pub fn len(&self) -> usize {
        self.ids.len()
    }

    /// Whether the batch holds only notifications.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    /// Waits for every response, returned in submission order.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ClientClosed`] if the client closes first, and
    /// [`Error::Cancelled`] or [`Error::DeadlineExceeded`] if the batch's
    /// context ends first.
    pub async fn wait(mut self) -> Result<Vec<Response>> {
        let receivers = std::mem::take(&mut self.receivers);
        let collect = async move {
            let mut responses = Vec::with_capacity(receivers.len());
            for rx in receivers {
                responses.push(rx.await.map_err(|_| Error::ClientClosed)??);
            }
            Ok(responses)
        };

        tokio::select! {
            biased;
            result = collect => result,
            () = cancelled(self.cancel.clone()) => Err(Error::Cancelled),
            () = expired(self.deadline) => Err(Error::DeadlineExceeded),
        }
    }
}

impl Drop for Batch {
    fn drop(&mut self) {
        if let Some(inner) = self.client.upgrade() {
            inner.remove_pending(&self.ids);
        }
    }
}

impl fmt::Debug for Batch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Batch")
            .field("ids", &self.ids)
            .field("deadline", &self.deadline)
            .finish_non_exhaustive()
    }
}

async fn cancelled(token: Option<CancellationToken>) {
    match token {
        Some(token) => token.cancelled().await,
        None => std::future::pending().await,
    }
}

async fn expired(deadline: Option<DateTime<Utc>>) {
    match deadline {
        Some(deadline) => tokio::time::sleep(time_until(deadline)).await,
        None => std::future::pending().await,
    }
}

async fn read_loop(
    client: Weak<Inner>,
    mut receiver: Box<dyn ChannelReceiver>,
    shutdown: CancellationToken,
) {
    loop {
        let frame = tokio::select! {
            () = shutdown.cancelled() => break,
            frame = receiver.recv() => frame,
        };

        let Some(inner) = client.upgrade() else {
            break;
        };

        match frame {
            Ok(Some(payload)) => dispatch(&inner, &payload),
            Ok(None) => {
                debug!("Server closed the channel");
                inner.begin_closing(None);
                break;
            }
            Err(e) => {
                error!("Client channel failed: {}", e);
                inner.begin_closing(Some(e));
                break;
            }
        }
    }
    debug!("Client reader stopped");
}

fn dispatch(inner: &Arc<Inner>, payload: &[u8]) {
    let decoded = match decode_frame(payload, true) {
        Ok(decoded) => decoded,
        Err(e) => {
            warn!("Dropping undecodable frame: {}", e);
            return;
        }
    };

    for item in decoded.items {
        match item {
            Message::Response(response) => inner.complete(response),
            Message::Request(request) => on_inbound_request(inner, request),
            Message::Invalid(rejected) => {
                warn!("Dropping invalid message (id {:?}): {}", rejected.id, rejected.error);
            }
        }
    }
}

fn on_inbound_request(inner: &Arc<Inner>, request: Request) {
    if let Some(observer) = &inner.config.observer {
        observer.on_request(&request);
    }

    let Some(id) = request.id().cloned() else {
        match &inner.config.on_notify {
            Some(callback) => callback(request),
            None => debug!("Ignoring notification {}", request.method()),
        }
        return;
    };

    // A client serves no methods. The reply goes out on its own task so the
    // reader never waits behind an issuer holding the writer.
    warn!("Rejecting server call {} ({})", request.method(), id);
    let reply = Response::failure(id, ErrorObject::method_not_found(request.method()));
    let inner = Arc::clone(inner);
    tokio::spawn(async move {
        let frame = match encode_frame(&[reply], false) {
            Ok(frame) => frame,
            Err(e) => {
                error!("Failed to encode reply: {}", e);
                return;
            }
        };
        if let Err(e) = inner.write(frame).await {
            debug!("Failed to reject server call: {}", e);
        }
    });
}
