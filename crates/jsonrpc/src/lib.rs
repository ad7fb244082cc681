//! JSON-RPC 2.0 engine over arbitrary byte streams.
//!
//! This crate serves methods and calls remote ones over any ordered,
//! reliable duplex stream: a TCP socket, a pipe, or an in-process pair.
//!
//! # Features
//!
//! - **Framings**: raw JSON values, newline-delimited, LSP-style
//!   `Content-Length` headers, or varint length prefixes
//! - **Client**: concurrent calls correlated by id, batches, notifications,
//!   per-call deadlines and cancellation
//! - **Server**: concurrent dispatch with a configurable bound, batch
//!   replies, handler panic containment, built-in `rpc.serverInfo`
//! - **Context propagation**: caller deadlines travel with the request
//! - **Legacy envelope**: optional acceptance of version-less messages
//!
//! # Example
//!
//! ```no_run
//! use proven_jsonrpc::{MethodMap, RpcClient, RpcServer, ServerConfig, handler_fn, memory};
//!
//! async fn example() -> proven_jsonrpc::Result<()> {
//!     let methods = MethodMap::new().with(
//!         "Len",
//!         handler_fn(|_ctx, (text,): (String,)| async move { anyhow::Ok(text.len()) }),
//!     );
//!
//!     let (client_end, server_end) = memory::pair(16);
//!     let server = RpcServer::new(methods, ServerConfig::default()).start(server_end);
//!     let client = RpcClient::new(client_end);
//!
//!     let len: usize = client.call_result("Len", &["hello"]).await?;
//!     assert_eq!(len, 5);
//!
//!     client.close().await?;
//!     server.wait().await
//! }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]
#![allow(clippy::module_name_repetitions)]

pub mod channel;
pub mod error;
pub mod handler;
pub mod observer;
pub mod protocol;
pub mod transport;

// Re-export commonly used types
pub use channel::{Channel, ChannelReceiver, ChannelSender, memory};
pub use error::{ChannelError, Error, Result};
pub use handler::{Assigner, Context, Handler, MethodMap, ServiceMap, handler_fn};
pub use observer::RpcObserver;
pub use protocol::{Code, ErrorObject, FrameCodec, Framing, Id, Request, Response};
pub use transport::{
    Batch, CallContext, CallSpec, ClientBuilder, ClientConfig, RpcClient, RpcServer,
    ServerBuilder, ServerConfig, ServerHandle, ServerInfo,
};

// Re-export dependencies that are part of our public API
pub use bytes::Bytes;
pub use serde_json::value::RawValue;
pub use tokio_util::sync::CancellationToken;
