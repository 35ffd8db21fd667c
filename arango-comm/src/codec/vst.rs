//! VelocyStream 1.1 framing.
//!
//! Every message is split into one or more chunks, each prefixed with a 24 byte little endian header:
//!
//! | field          | size | notes                                                  |
//! |----------------|------|--------------------------------------------------------|
//! | chunk_length   | u32  | length of the chunk including this header             |
//! | chunk_x        | u32  | `(count << 1) \| 1` on the first chunk, `index << 1` otherwise |
//! | message_id     | u64  |                                                        |
//! | message_length | u64  | length of the whole message across all chunks          |
//!
//! Chunks of different messages may be interleaved on the wire.

use super::{CodecReadError, CodecWriteError, MAX_MESSAGE_LENGTH};
use crate::config::ContentType;
use crate::request::{ArangoRequest, ArangoResponse};
use crate::vpack::{self, Value};
use anyhow::{anyhow, Result};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::collections::{BTreeMap, HashMap};
use tokio_util::codec::{Decoder, Encoder};

pub const HANDSHAKE: &[u8] = b"VST/1.1\r\n\r\n";
pub const CHUNK_HEADER_LEN: usize = 24;

const MESSAGE_TYPE_REQUEST: i64 = 1;
const MESSAGE_TYPE_RESPONSE: i64 = 2;

/// A complete VST message, the payload is the velocypack header followed by the body.
#[derive(Debug, Clone, PartialEq)]
pub struct VstMessage {
    pub message_id: u64,
    pub payload: Bytes,
}

pub struct VstEncoder {
    chunk_size: usize,
}

impl VstEncoder {
    /// `chunk_size` is the maximum payload carried by a single chunk.
    pub fn new(chunk_size: usize) -> Self {
        VstEncoder {
            chunk_size: chunk_size.max(1),
        }
    }
}

impl Encoder<VstMessage> for VstEncoder {
    type Error = CodecWriteError;

    fn encode(&mut self, message: VstMessage, dst: &mut BytesMut) -> Result<(), CodecWriteError> {
        let message_length = message.payload.len();
        let count = message_length.div_ceil(self.chunk_size).max(1);
        if count > (u32::MAX >> 1) as usize {
            return Err(CodecWriteError::Encoder(anyhow!(
                "message {} of {message_length} bytes needs too many chunks",
                message.message_id
            )));
        }

        dst.reserve(message_length + count * CHUNK_HEADER_LEN);
        for index in 0..count {
            let start = index * self.chunk_size;
            let end = (start + self.chunk_size).min(message_length);
            let chunk = &message.payload[start..end];
            let chunk_x = if index == 0 {
                ((count as u32) << 1) | 1
            } else {
                (index as u32) << 1
            };
            dst.put_u32_le((CHUNK_HEADER_LEN + chunk.len()) as u32);
            dst.put_u32_le(chunk_x);
            dst.put_u64_le(message.message_id);
            dst.put_u64_le(message_length as u64);
            dst.put_slice(chunk);
        }
        Ok(())
    }
}

#[derive(Default)]
struct PartialMessage {
    /// Known once the first chunk has arrived.
    count: Option<usize>,
    message_length: usize,
    received: usize,
    chunks: BTreeMap<usize, Bytes>,
}

impl PartialMessage {
    fn is_complete(&self) -> bool {
        self.count == Some(self.chunks.len())
    }

    fn assemble(self) -> Result<Bytes> {
        let mut payload = BytesMut::with_capacity(self.message_length);
        for chunk in self.chunks.into_values() {
            payload.extend_from_slice(&chunk);
        }
        if payload.len() != self.message_length {
            return Err(anyhow!(
                "reassembled message has {} bytes but its chunks declared {}",
                payload.len(),
                self.message_length
            ));
        }
        Ok(payload.freeze())
    }
}

/// Reassembles chunks into complete messages, keyed by message id.
#[derive(Default)]
pub struct VstDecoder {
    partial: HashMap<u64, PartialMessage>,
}

impl VstDecoder {
    pub fn new() -> Self {
        VstDecoder::default()
    }
}

impl Decoder for VstDecoder {
    type Item = VstMessage;
    type Error = CodecReadError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<VstMessage>, CodecReadError> {
        loop {
            if src.len() < CHUNK_HEADER_LEN {
                return Ok(None);
            }
            let chunk_length = u32::from_le_bytes([src[0], src[1], src[2], src[3]]) as usize;
            if chunk_length < CHUNK_HEADER_LEN {
                return Err(CodecReadError::Parser(anyhow!(
                    "chunk length {chunk_length} is smaller than the chunk header"
                )));
            }
            if chunk_length > CHUNK_HEADER_LEN + MAX_MESSAGE_LENGTH {
                return Err(CodecReadError::Parser(anyhow!(
                    "chunk length {chunk_length} exceeds the maximum message length {MAX_MESSAGE_LENGTH}"
                )));
            }
            if src.len() < chunk_length {
                src.reserve(chunk_length - src.len());
                return Ok(None);
            }

            let mut chunk = src.split_to(chunk_length);
            let _ = chunk.get_u32_le();
            let chunk_x = chunk.get_u32_le() as usize;
            let message_id = chunk.get_u64_le();
            let message_length = chunk.get_u64_le();
            if message_length > MAX_MESSAGE_LENGTH as u64 {
                return Err(CodecReadError::Parser(anyhow!(
                    "message {message_id} declared {message_length} bytes, more than the maximum message length {MAX_MESSAGE_LENGTH}"
                )));
            }
            let message_length = message_length as usize;
            let body = chunk.freeze();

            let first = chunk_x & 1 == 1;
            if first && chunk_x >> 1 == 1 && !self.partial.contains_key(&message_id) {
                if body.len() != message_length {
                    return Err(CodecReadError::Parser(anyhow!(
                        "single chunk message {message_id} carries {} bytes but declared {message_length}",
                        body.len()
                    )));
                }
                tracing::trace!("received single chunk VST message {message_id}");
                return Ok(Some(VstMessage {
                    message_id,
                    payload: body,
                }));
            }

            let partial = self.partial.entry(message_id).or_default();
            if partial.chunks.is_empty() {
                partial.message_length = message_length;
            } else if partial.message_length != message_length {
                return Err(CodecReadError::Parser(anyhow!(
                    "chunks of message {message_id} declared both {} and {message_length} bytes",
                    partial.message_length
                )));
            }
            partial.received += body.len();
            if partial.received > partial.message_length {
                return Err(CodecReadError::Parser(anyhow!(
                    "message {message_id} declared {} bytes but its chunks carry more",
                    partial.message_length
                )));
            }
            let index = if first {
                partial.count = Some(chunk_x >> 1);
                0
            } else {
                chunk_x >> 1
            };
            if partial.chunks.insert(index, body).is_some() {
                return Err(CodecReadError::Parser(anyhow!(
                    "received chunk {index} of message {message_id} twice"
                )));
            }
            if let Some(count) = partial.count {
                if partial.chunks.len() > count {
                    return Err(CodecReadError::Parser(anyhow!(
                        "message {message_id} declared {count} chunks but more were received"
                    )));
                }
            }

            if partial.is_complete() {
                if let Some(partial) = self.partial.remove(&message_id) {
                    let payload = partial.assemble().map_err(CodecReadError::Parser)?;
                    tracing::trace!("reassembled VST message {message_id} of {} bytes", payload.len());
                    return Ok(Some(VstMessage {
                        message_id,
                        payload,
                    }));
                }
            }
        }
    }
}

/// Builds the payload of a request message: the velocypack request header followed by the opaque body.
pub fn encode_request(request: &ArangoRequest, content_type: ContentType) -> Bytes {
    let mut meta: Vec<(String, Value)> = request
        .header_params
        .iter()
        .map(|(key, value)| (key.clone(), Value::from(value.as_str())))
        .collect();
    for name in ["content-type", "accept"] {
        if !request.header_params.contains_key(name) {
            meta.push((name.to_owned(), Value::from(content_type.mime_type())));
        }
    }

    let header = Value::Array(vec![
        Value::Int(1),
        Value::Int(MESSAGE_TYPE_REQUEST),
        Value::from(request.database.as_str()),
        Value::Int(request.request_type.vst_code()),
        Value::from(request.path.as_str()),
        Value::Object(
            request
                .query_params
                .iter()
                .map(|(key, value)| (key.clone(), Value::from(value.as_str())))
                .collect(),
        ),
        Value::Object(meta),
    ]);

    let mut payload = BytesMut::new();
    vpack::encode_into(&header, &mut payload);
    payload.extend_from_slice(&request.body);
    payload.freeze()
}

/// Splits a response message into its velocypack header and body.
pub fn decode_response(payload: &Bytes) -> Result<ArangoResponse> {
    let (header, header_len) = vpack::decode(payload)?;
    let fields = header
        .as_array()
        .ok_or_else(|| anyhow!("VST response header must be an array but was {header:?}"))?;

    let version = fields
        .first()
        .and_then(Value::as_u64)
        .ok_or_else(|| anyhow!("VST response header is missing its version"))?;
    match fields.get(1).and_then(Value::as_u64) {
        Some(message_type) if message_type as i64 == MESSAGE_TYPE_RESPONSE => {}
        message_type => {
            return Err(anyhow!(
                "VST response header has message type {message_type:?}, expected {MESSAGE_TYPE_RESPONSE}"
            ))
        }
    }
    let response_code = fields
        .get(2)
        .and_then(Value::as_u64)
        .and_then(|code| u16::try_from(code).ok())
        .ok_or_else(|| anyhow!("VST response header is missing its response code"))?;

    let mut meta = BTreeMap::new();
    if let Some(Value::Object(entries)) = fields.get(3) {
        for (key, value) in entries {
            let value = match value {
                Value::String(value) => value.clone(),
                Value::Int(value) => value.to_string(),
                Value::UInt(value) => value.to_string(),
                Value::Bool(value) => value.to_string(),
                _ => continue,
            };
            meta.insert(key.to_ascii_lowercase(), value);
        }
    }

    Ok(ArangoResponse {
        version: version as u8,
        response_code,
        meta,
        body: payload.slice(header_len..),
    })
}
