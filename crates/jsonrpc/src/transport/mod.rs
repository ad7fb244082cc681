//! Client and server engines.
//!
//! Both sides own one [`Channel`](crate::channel::Channel), split into a
//! mutex-guarded write half and a reader task.

pub mod client;
pub mod server;

pub use client::{
    Batch, CallContext, CallSpec, ClientBuilder, ClientConfig, NotifyCallback, RpcClient,
};
pub use server::{
    Metrics, RESERVED_PREFIX, RpcServer, SERVER_INFO_METHOD, ServerBuilder, ServerConfig,
    ServerHandle, ServerInfo,
};
