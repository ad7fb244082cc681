//! Message framing for the wire protocol.
//!
//! Each framing turns a byte stream into opaque payloads and back. None of
//! them looks inside a payload beyond what is needed to find its end.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::de::IgnoredAny;
use tokio_util::codec::{Decoder, Encoder};

use crate::error::ChannelError;

/// Maximum frame size (10MB by default).
pub const MAX_FRAME_SIZE: usize = 10 * 1024 * 1024;

/// Upper bound on a header block for [`Framing::Header`].
const MAX_HEADER_SIZE: usize = 8 * 1024;

/// Longest unsigned LEB128 encoding of a `u64`.
const MAX_VARINT_LEN: usize = 10;

/// How payloads are delimited on the byte stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Framing {
    /// One JSON value after another with no delimiter.
    Raw,
    /// Each payload terminated by a newline.
    Line,
    /// LSP-style `Content-Length` header block before each payload.
    #[default]
    Header,
    /// Unsigned varint length prefix before each payload.
    Varint,
}

impl Framing {
    const fn is_text(self) -> bool {
        matches!(self, Self::Raw | Self::Line | Self::Header)
    }
}

/// Codec for encoding/decoding frames under one [`Framing`].
#[derive(Debug, Clone)]
pub struct FrameCodec {
    framing: Framing,
    max_frame_size: usize,
    content_type: Option<String>,
    /// Bytes of the buffer already scanned for a newline.
    line_scanned: usize,
    /// Content length of a header block already consumed.
    pending_length: Option<usize>,
}

impl FrameCodec {
    /// Create a new frame codec.
    #[must_use]
    pub const fn new(framing: Framing) -> Self {
        Self {
            framing,
            max_frame_size: MAX_FRAME_SIZE,
            content_type: None,
            line_scanned: 0,
            pending_length: None,
        }
    }

    /// Create a codec with custom max frame size.
    #[must_use]
    pub const fn with_max_frame_size(mut self, size: usize) -> Self {
        self.max_frame_size = size;
        self
    }

    /// Emit a `Content-Type` header with [`Framing::Header`]. Inbound
    /// `Content-Type` headers are always ignored.
    #[must_use]
    pub fn with_content_type(mut self, content_type: impl Into<String>) -> Self {
        self.content_type = Some(content_type.into());
        self
    }

    /// The framing this codec implements.
    #[must_use]
    pub const fn framing(&self) -> Framing {
        self.framing
    }

    fn check_size(&self, size: usize) -> Result<(), ChannelError> {
        if size > self.max_frame_size {
            return Err(ChannelError::FrameTooLarge {
                size,
                max: self.max_frame_size,
            });
        }
        Ok(())
    }

    fn decode_raw(&mut self, buf: &mut BytesMut) -> Result<Option<Bytes>, ChannelError> {
        let Some(start) = buf.iter().position(|b| !b.is_ascii_whitespace()) else {
            buf.clear();
            return Ok(None);
        };
        buf.advance(start);

        let end = {
            let mut values =
                serde_json::Deserializer::from_slice(&buf[..]).into_iter::<IgnoredAny>();
            match values.next() {
                Some(Ok(_)) => Some(values.byte_offset()),
                Some(Err(e)) if e.is_eof() => None,
                Some(Err(e)) => return Err(ChannelError::InvalidFrame(e.to_string())),
                None => None,
            }
        };

        match end {
            Some(end) => {
                self.check_size(end)?;
                Ok(Some(buf.split_to(end).freeze()))
            }
            None => {
                self.check_size(buf.len())?;
                Ok(None)
            }
        }
    }

    fn decode_line(&mut self, buf: &mut BytesMut) -> Result<Option<Bytes>, ChannelError> {
        loop {
            let from = self.line_scanned.min(buf.len());
            let Some(offset) = buf[from..].iter().position(|b| *b == b'\n') else {
                self.line_scanned = buf.len();
                self.check_size(buf.len())?;
                return Ok(None);
            };

            let newline = from + offset;
            self.line_scanned = 0;
            let mut line = buf.split_to(newline + 1);
            line.truncate(newline);
            if line.last() == Some(&b'\r') {
                line.truncate(newline - 1);
            }
            if line.is_empty() {
                continue;
            }
            self.check_size(line.len())?;
            return Ok(Some(line.freeze()));
        }
    }

    fn decode_header(&mut self, buf: &mut BytesMut) -> Result<Option<Bytes>, ChannelError> {
        let length = match self.pending_length {
            Some(length) => length,
            None => match parse_header_block(buf)? {
                Some(length) => {
                    self.check_size(length)?;
                    self.pending_length = Some(length);
                    length
                }
                None => return Ok(None),
            },
        };

        if buf.len() < length {
            buf.reserve(length - buf.len());
            return Ok(None);
        }

        self.pending_length = None;
        Ok(Some(buf.split_to(length).freeze()))
    }

    fn decode_varint(&mut self, buf: &mut BytesMut) -> Result<Option<Bytes>, ChannelError> {
        let Some(last) = buf
            .iter()
            .take(MAX_VARINT_LEN)
            .position(|b| b & 0x80 == 0)
        else {
            if buf.len() >= MAX_VARINT_LEN {
                return Err(ChannelError::InvalidFrame(
                    "length prefix exceeds 10 bytes".to_string(),
                ));
            }
            return Ok(None);
        };

        let mut prefix = &buf[..=last];
        let length = prost::encoding::decode_varint(&mut prefix)
            .map_err(|e| ChannelError::InvalidFrame(format!("bad length prefix: {e}")))?;
        let length = usize::try_from(length).map_err(|_| ChannelError::FrameTooLarge {
            size: usize::MAX,
            max: self.max_frame_size,
        })?;
        self.check_size(length)?;

        let frame_len = last + 1 + length;
        if buf.len() < frame_len {
            buf.reserve(frame_len - buf.len());
            return Ok(None);
        }

        buf.advance(last + 1);
        Ok(Some(buf.split_to(length).freeze()))
    }
}

/// Consumes one header block from `buf` and returns its content length, or
/// `None` if the block is not complete yet. Blank lines before the block are
/// skipped.
fn parse_header_block(buf: &mut BytesMut) -> Result<Option<usize>, ChannelError> {
    let mut lines = Vec::new();
    let mut offset = 0;

    loop {
        let Some(newline) = buf[offset..].iter().position(|b| *b == b'\n') else {
            if buf.len() > MAX_HEADER_SIZE {
                return Err(ChannelError::InvalidFrame(
                    "header block too large".to_string(),
                ));
            }
            return Ok(None);
        };

        let line = &buf[offset..offset + newline];
        let line = line.strip_suffix(b"\r").unwrap_or(line);
        offset += newline + 1;

        if line.is_empty() {
            if lines.is_empty() {
                continue;
            }
            break;
        }
        lines.push(line.to_vec());
    }

    let mut content_length = None;
    for line in &lines {
        let line = std::str::from_utf8(line)
            .map_err(|_| ChannelError::InvalidFrame("header is not UTF-8".to_string()))?;
        let (name, value) = line
            .split_once(':')
            .ok_or_else(|| ChannelError::InvalidFrame(format!("malformed header line: {line}")))?;
        if name.trim().eq_ignore_ascii_case("content-length") {
            let length = value.trim().parse::<usize>().map_err(|_| {
                ChannelError::InvalidFrame(format!("invalid Content-Length: {}", value.trim()))
            })?;
            content_length = Some(length);
        }
    }

    let length = content_length
        .ok_or_else(|| ChannelError::InvalidFrame("missing Content-Length".to_string()))?;
    buf.advance(offset);
    Ok(Some(length))
}

impl Decoder for FrameCodec {
    type Item = Bytes;
    type Error = ChannelError;

    fn decode(&mut self, buf: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        match self.framing {
            Framing::Raw => self.decode_raw(buf),
            Framing::Line => self.decode_line(buf),
            Framing::Header => self.decode_header(buf),
            Framing::Varint => self.decode_varint(buf),
        }
    }

    fn decode_eof(&mut self, buf: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if let Some(frame) = self.decode(buf)? {
            return Ok(Some(frame));
        }

        let only_whitespace = self.framing.is_text() && buf.iter().all(u8::is_ascii_whitespace);
        let idle = self.pending_length.is_none() && (buf.is_empty() || only_whitespace);
        if idle {
            buf.clear();
            self.line_scanned = 0;
            Ok(None)
        } else {
            Err(ChannelError::InvalidFrame(
                "stream ended inside a frame".to_string(),
            ))
        }
    }
}

impl Encoder<Bytes> for FrameCodec {
    type Error = ChannelError;

    fn encode(&mut self, payload: Bytes, buf: &mut BytesMut) -> Result<(), Self::Error> {
        let payload_len = payload.len();
        self.check_size(payload_len)?;

        match self.framing {
            Framing::Raw => {
                buf.reserve(payload_len);
                buf.put(payload);
            }
            Framing::Line => {
                if payload.contains(&b'\n') {
                    return Err(ChannelError::InvalidFrame(
                        "payload contains a newline".to_string(),
                    ));
                }
                buf.reserve(payload_len + 1);
                buf.put(payload);
                buf.put_u8(b'\n');
            }
            Framing::Header => {
                let mut header = format!("Content-Length: {payload_len}\r\n");
                if let Some(content_type) = &self.content_type {
                    header.push_str("Content-Type: ");
                    header.push_str(content_type);
                    header.push_str("\r\n");
                }
                header.push_str("\r\n");
                buf.reserve(header.len() + payload_len);
                buf.put_slice(header.as_bytes());
                buf.put(payload);
            }
            Framing::Varint => {
                buf.reserve(MAX_VARINT_LEN + payload_len);
                prost::encoding::encode_varint(payload_len as u64, buf);
                buf.put(payload);
            }
        }

        Ok(())
    }
}
