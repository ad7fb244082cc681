//! Method handlers and the registries that resolve them by name.

use std::collections::BTreeMap;
use std::fmt;
use std::future::Future;
use std::marker::PhantomData;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::value::RawValue;
use tokio_util::sync::CancellationToken;

use crate::error::Error;
use crate::protocol::context::time_until;
use crate::protocol::{ErrorObject, Id};

/// Handles calls to one method.
///
/// Returning an [`ErrorObject`] (directly or through [`Error::Rpc`]) sends it
/// to the caller unchanged. Any other error is reported as an internal error
/// carrying the error's message.
#[async_trait]
pub trait Handler: Send + Sync + 'static {
    /// Handles one call or notification.
    async fn handle(
        &self,
        ctx: Context,
        params: Option<Box<RawValue>>,
    ) -> anyhow::Result<Box<RawValue>>;
}

/// Resolves method names to handlers.
///
/// Resolution happens once per inbound call, possibly from several dispatch
/// tasks at once.
pub trait Assigner: Send + Sync + 'static {
    /// Looks up the handler for `method`.
    fn assign(&self, method: &str) -> Option<Arc<dyn Handler>>;

    /// Every method name this assigner resolves.
    fn names(&self) -> Vec<String>;
}

/// What a handler knows about the call it is serving.
#[derive(Clone)]
pub struct Context {
    id: Option<Id>,
    method: Arc<str>,
    deadline: Option<DateTime<Utc>>,
    cancel: CancellationToken,
}

impl Context {
    pub(crate) fn new(id: Option<Id>, method: &str, cancel: CancellationToken) -> Self {
        Self {
            id,
            method: Arc::from(method),
            deadline: None,
            cancel,
        }
    }

    /// Narrows the deadline; an existing earlier deadline is kept.
    #[must_use]
    pub(crate) fn with_deadline(mut self, deadline: DateTime<Utc>) -> Self {
        self.deadline = Some(self.deadline.map_or(deadline, |current| current.min(deadline)));
        self
    }

    /// The request id, `None` for notifications.
    #[must_use]
    pub const fn id(&self) -> Option<&Id> {
        self.id.as_ref()
    }

    /// The method name as the caller sent it.
    #[must_use]
    pub fn method(&self) -> &str {
        &self.method
    }

    /// Whether the caller expects no reply.
    #[must_use]
    pub const fn is_notification(&self) -> bool {
        self.id.is_none()
    }

    /// The caller's propagated deadline, if any.
    #[must_use]
    pub const fn deadline(&self) -> Option<DateTime<Utc>> {
        self.deadline
    }

    /// Whether the server is stopping or the deadline has passed.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled() || self.deadline.is_some_and(|deadline| deadline <= Utc::now())
    }

    /// Resolves when the server stops or the deadline passes.
    ///
    /// Cancellation is advisory: the server does not abort a handler that
    /// ignores it.
    pub async fn cancelled(&self) {
        match self.deadline {
            Some(deadline) => {
                tokio::select! {
                    () = self.cancel.cancelled() => {}
                    () = tokio::time::sleep(time_until(deadline)) => {}
                }
            }
            None => self.cancel.cancelled().await,
        }
    }
}

impl fmt::Debug for Context {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Context")
            .field("id", &self.id)
            .field("method", &self.method)
            .field("deadline", &self.deadline)
            .finish_non_exhaustive()
    }
}

/// Converts a handler failure into the error sent to the caller.
pub(crate) fn into_error_object(err: anyhow::Error) -> ErrorObject {
    let err = match err.downcast::<ErrorObject>() {
        Ok(obj) => return obj,
        Err(err) => err,
    };
    match err.downcast::<Error>() {
        Ok(Error::Rpc(obj)) => obj,
        Ok(other) => ErrorObject::internal(other.to_string()),
        Err(err) => ErrorObject::internal(err.to_string()),
    }
}

/// A fixed table of method names.
#[derive(Clone, Default)]
pub struct MethodMap {
    methods: BTreeMap<String, Arc<dyn Handler>>,
}

impl MethodMap {
    /// Creates an empty map.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a method, replacing any earlier handler with the same name.
    #[must_use]
    pub fn with(mut self, name: impl Into<String>, handler: impl Handler) -> Self {
        self.insert(name, handler);
        self
    }

    /// Adds a method in place.
    pub fn insert(&mut self, name: impl Into<String>, handler: impl Handler) {
        self.methods.insert(name.into(), Arc::new(handler));
    }

    /// Number of methods.
    #[must_use]
    pub fn len(&self) -> usize {
        self.methods.len()
    }

    /// Whether the map has no methods.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.methods.is_empty()
    }
}

impl Assigner for MethodMap {
    fn assign(&self, method: &str) -> Option<Arc<dyn Handler>> {
        self.methods.get(method).cloned()
    }

    fn names(&self) -> Vec<String> {
        self.methods.keys().cloned().collect()
    }
}

impl fmt::Debug for MethodMap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.methods.keys()).finish()
    }
}

/// Groups method maps under service names, resolving `"Service.Method"`.
///
/// The name is split at its first `.`, so method names inside a service may
/// themselves contain dots.
#[derive(Clone, Debug, Default)]
pub struct ServiceMap {
    services: BTreeMap<String, MethodMap>,
}

impl ServiceMap {
    /// Creates an empty service map.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a service, replacing any earlier one with the same name.
    #[must_use]
    pub fn with_service(mut self, name: impl Into<String>, methods: MethodMap) -> Self {
        self.services.insert(name.into(), methods);
        self
    }
}

impl Assigner for ServiceMap {
    fn assign(&self, method: &str) -> Option<Arc<dyn Handler>> {
        let (service, method) = method.split_once('.')?;
        self.services.get(service)?.assign(method)
    }

    fn names(&self) -> Vec<String> {
        self.services
            .iter()
            .flat_map(|(service, methods)| {
                methods
                    .names()
                    .into_iter()
                    .map(move |method| format!("{service}.{method}"))
            })
            .collect()
    }
}

/// Adapts an async function over typed parameters into a [`Handler`].
///
/// Parameters that do not decode as `P` are rejected with `InvalidParams`
/// before `f` runs. Absent parameters decode as JSON `null`.
pub fn handler_fn<F, Fut, P, R>(f: F) -> FnHandler<F, P, R>
where
    F: Fn(Context, P) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<R>> + Send + 'static,
    P: DeserializeOwned + Send + 'static,
    R: Serialize + Send + 'static,
{
    FnHandler {
        f,
        _marker: PhantomData,
    }
}

/// Handler returned by [`handler_fn`].
pub struct FnHandler<F, P, R> {
    f: F,
    _marker: PhantomData<fn(P) -> R>,
}

#[async_trait]
impl<F, Fut, P, R> Handler for FnHandler<F, P, R>
where
    F: Fn(Context, P) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<R>> + Send + 'static,
    P: DeserializeOwned + Send + 'static,
    R: Serialize + Send + 'static,
{
    async fn handle(
        &self,
        ctx: Context,
        params: Option<Box<RawValue>>,
    ) -> anyhow::Result<Box<RawValue>> {
        let text = params.as_deref().map_or("null", RawValue::get);
        let params: P = serde_json::from_str(text).map_err(ErrorObject::invalid_params)?;
        let result = (self.f)(ctx, params).await?;
        Ok(serde_json::value::to_raw_value(&result)?)
    }
}
