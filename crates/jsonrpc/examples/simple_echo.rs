//! Simple echo server/client example.
//!
//! Serves an `Echo` service over a local TCP socket using
//! `Content-Length` framing, then calls it from a client on the same process.

use async_trait::async_trait;
use proven_jsonrpc::{
    Channel, Context, ErrorObject, FrameCodec, Framing, Handler, MethodMap, RawValue, Result,
    RpcClient, RpcServer, ServerConfig, ServiceMap,
};
use serde::{Deserialize, Serialize};
use tokio::net::{TcpListener, TcpStream};

/// Echo request message.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct EchoRequest {
    message: String,
}

/// Echo response message.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct EchoResponse {
    message: String,
    received_at: chrono::DateTime<chrono::Utc>,
}

/// Echo service handler.
struct EchoHandler;

#[async_trait]
impl Handler for EchoHandler {
    async fn handle(
        &self,
        ctx: Context,
        params: Option<Box<RawValue>>,
    ) -> anyhow::Result<Box<RawValue>> {
        let Some(params) = params else {
            return Err(ErrorObject::invalid_params("missing request").into());
        };
        let request: EchoRequest =
            serde_json::from_str(params.get()).map_err(ErrorObject::invalid_params)?;

        println!("Received {} request: {}", ctx.method(), request.message);

        let response = EchoResponse {
            message: request.message,
            received_at: chrono::Utc::now(),
        };
        Ok(serde_json::value::to_raw_value(&response)?)
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let listener = TcpListener::bind("127.0.0.1:0")
        .await
        .map_err(proven_jsonrpc::ChannelError::from)?;
    let addr = listener
        .local_addr()
        .map_err(proven_jsonrpc::ChannelError::from)?;
    println!("Echo server listening on {addr}");

    let services =
        ServiceMap::new().with_service("Echo", MethodMap::new().with("Say", EchoHandler));
    let server = RpcServer::new(services, ServerConfig::default());

    tokio::spawn(async move {
        while let Ok((stream, peer)) = listener.accept().await {
            println!("Accepted connection from {peer}");
            let channel = Channel::from_stream(stream, FrameCodec::new(Framing::Header));
            let handle = server.start(channel);
            tokio::spawn(async move {
                if let Err(e) = handle.wait().await {
                    eprintln!("Connection from {peer} failed: {e}");
                }
            });
        }
    });

    let stream = TcpStream::connect(addr)
        .await
        .map_err(proven_jsonrpc::ChannelError::from)?;
    let client = RpcClient::new(Channel::from_stream(stream, FrameCodec::new(Framing::Header)));

    let response: EchoResponse = client
        .call_result(
            "Echo.Say",
            &EchoRequest {
                message: "Hello, JSON-RPC!".to_string(),
            },
        )
        .await?;
    println!(
        "Got echo: {} (received at {})",
        response.message, response.received_at
    );

    client.close().await
}
