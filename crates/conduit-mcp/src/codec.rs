// SPDX-License-Identifier: Apache-2.0
//! C1 — framed JSON-RPC codec.
//!
//! One JSON-RPC 2.0 message is one UTF-8 line terminated by `\n`. This module
//! classifies a decoded line into a [`Frame`] and provides a
//! [`tokio_util::codec::Decoder`]/[`tokio_util::codec::Encoder`] pair so the
//! transport layer can drive it with `FramedRead`/`FramedWrite` the way the
//! rest of the stack uses `tokio_util::codec`.

use bytes::{Buf, BytesMut};
use serde_json::Value;
use tokio_util::codec::{Decoder, Encoder, LinesCodec, LinesCodecError};

use crate::error::McpError;

/// A line exceeding this many bytes is rejected with `OversizedFrame` before
/// any JSON parsing is attempted. Large enough to carry big tool results.
pub const MAX_FRAME_BYTES: usize = 16 * 1024 * 1024;

/// One decoded JSON-RPC 2.0 message, classified by shape.
#[derive(Debug, Clone)]
pub enum Frame {
    Request {
        id: Value,
        method: String,
        params: Value,
    },
    Response {
        id: Value,
        result: Option<Value>,
        error: Option<Value>,
    },
    Notification {
        method: String,
        params: Value,
    },
}

impl Frame {
    /// Classify a parsed JSON value as request / response / notification.
    ///
    /// Any shape that matches none of these (missing `method` on a message
    /// without `id`, or a bare object with neither `method` nor `result`/
    /// `error`) is treated as malformed.
    fn classify(v: Value) -> Result<Frame, McpError> {
        let obj = v
            .as_object()
            .ok_or_else(|| McpError::MalformedFrame("top-level JSON value is not an object".into()))?;

        if let Some(id) = obj.get("id").cloned() {
            if let Some(method) = obj.get("method").and_then(Value::as_str) {
                return Ok(Frame::Request {
                    id,
                    method: method.to_string(),
                    params: obj.get("params").cloned().unwrap_or(Value::Null),
                });
            }
            return Ok(Frame::Response {
                id,
                result: obj.get("result").cloned(),
                error: obj.get("error").cloned(),
            });
        }

        let method = obj
            .get("method")
            .and_then(Value::as_str)
            .ok_or_else(|| McpError::MalformedFrame("message has neither id nor method".into()))?;
        Ok(Frame::Notification {
            method: method.to_string(),
            params: obj.get("params").cloned().unwrap_or(Value::Null),
        })
    }

    pub fn request(id: Value, method: impl Into<String>, params: Value) -> Self {
        Frame::Request { id, method: method.into(), params }
    }

    pub fn to_json(&self) -> Value {
        match self {
            Frame::Request { id, method, params } => serde_json::json!({
                "jsonrpc": "2.0", "id": id, "method": method, "params": params,
            }),
            Frame::Response { id, result, error } => {
                let mut v = serde_json::json!({ "jsonrpc": "2.0", "id": id });
                let map = v.as_object_mut().unwrap();
                if let Some(r) = result {
                    map.insert("result".into(), r.clone());
                } else if let Some(e) = error {
                    map.insert("error".into(), e.clone());
                }
                v
            }
            Frame::Notification { method, params } => serde_json::json!({
                "jsonrpc": "2.0", "method": method, "params": params,
            }),
        }
    }
}

/// Decodes/encodes [`Frame`]s over a line-delimited byte stream, enforcing
/// the oversized-frame ceiling ahead of the inner [`LinesCodec`].
pub struct JsonRpcCodec {
    lines: LinesCodec,
}

impl JsonRpcCodec {
    pub fn new() -> Self {
        Self { lines: LinesCodec::new_with_max_length(MAX_FRAME_BYTES) }
    }
}

impl Default for JsonRpcCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl Decoder for JsonRpcCodec {
    type Item = Frame;
    type Error = McpError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Frame>, McpError> {
        let line = match self.lines.decode(src) {
            Ok(Some(l)) => l,
            Ok(None) => return Ok(None),
            Err(LinesCodecError::MaxLineLengthExceeded) => {
                return Err(McpError::OversizedFrame {
                    size: src.remaining(),
                    ceiling: MAX_FRAME_BYTES,
                })
            }
            Err(LinesCodecError::Io(e)) => return Err(McpError::MalformedFrame(e.to_string())),
        };
        if line.trim().is_empty() {
            // Blank keep-alive lines are skipped, not surfaced as frames.
            return self.decode(src);
        }
        let value: Value = serde_json::from_str(&line)
            .map_err(|e| McpError::MalformedFrame(format!("invalid JSON: {e}")))?;
        Frame::classify(value).map(Some)
    }
}

impl Encoder<Frame> for JsonRpcCodec {
    type Error = McpError;

    fn encode(&mut self, item: Frame, dst: &mut BytesMut) -> Result<(), McpError> {
        let line = serde_json::to_string(&item.to_json())
            .map_err(|e| McpError::MalformedFrame(e.to_string()))?;
        if line.len() > MAX_FRAME_BYTES {
            return Err(McpError::OversizedFrame { size: line.len(), ceiling: MAX_FRAME_BYTES });
        }
        dst.extend_from_slice(line.as_bytes());
        dst.extend_from_slice(b"\n");
        Ok(())
    }
}
