//! Protocol layer: the JSON-RPC message model, its legacy translation, the
//! context envelope and the stream framings.

pub mod context;
pub mod framing;
pub mod legacy;
pub mod message;

pub use framing::{FrameCodec, Framing, MAX_FRAME_SIZE};
pub use message::{
    Code, Decoded, ErrorObject, Id, Message, Rejected, Request, Response, VERSION, decode_frame,
    encode_frame, to_params,
};
