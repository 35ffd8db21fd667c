//! HTTP/1.1 framing for the client side of a keep-alive connection.
//!
//! Responses are matched to requests in order, so the encoder hands the method of every request it writes to the decoder.
//! The decoder needs it to know that a response to a HEAD request has no body regardless of its content-length.

use super::{CodecReadError, CodecWriteError, MAX_MESSAGE_LENGTH};
use crate::config::ContentType;
use crate::host::HostDescription;
use crate::request::{ArangoRequest, ArangoResponse, RequestType};
use anyhow::{anyhow, Result};
use bytes::{Buf, Bytes, BytesMut};
use http::{header, HeaderName, HeaderValue, Method, Request};
use std::collections::BTreeMap;
use std::sync::mpsc;
use tokio_util::codec::{Decoder, Encoder};

const MAX_HEADERS: usize = 64;

pub fn build_codec() -> (HttpDecoder, HttpEncoder) {
    let (tx, rx) = mpsc::channel();
    (
        HttpDecoder {
            request_method_rx: rx,
            state: State::ParsingResponse,
        },
        HttpEncoder {
            request_method_tx: tx,
        },
    )
}

fn method(request_type: RequestType) -> Method {
    match request_type {
        RequestType::Delete => Method::DELETE,
        RequestType::Get => Method::GET,
        RequestType::Post => Method::POST,
        RequestType::Put => Method::PUT,
        RequestType::Head => Method::HEAD,
        RequestType::Patch => Method::PATCH,
        RequestType::Options => Method::OPTIONS,
    }
}

fn is_unreserved(byte: u8) -> bool {
    byte.is_ascii_alphanumeric() || matches!(byte, b'-' | b'.' | b'_' | b'~')
}

/// Percent encodes everything but RFC 3986 unreserved characters.
/// When `keep_slash` is set `/` is also left as is so that paths keep their segments.
fn percent_encode(value: &str, keep_slash: bool, dst: &mut String) {
    for byte in value.bytes() {
        if is_unreserved(byte) || (keep_slash && byte == b'/') {
            dst.push(byte as char);
        } else {
            dst.push_str(&format!("%{byte:02X}"));
        }
    }
}

/// The request target of an ArangoDB request, `/_db/<database><path>?<query>`.
pub fn request_target(request: &ArangoRequest) -> String {
    let mut target = String::from("/_db/");
    percent_encode(&request.database, false, &mut target);
    if !request.path.starts_with('/') {
        target.push('/');
    }
    percent_encode(&request.path, true, &mut target);
    for (i, (key, value)) in request.query_params.iter().enumerate() {
        target.push(if i == 0 { '?' } else { '&' });
        percent_encode(key, false, &mut target);
        target.push('=');
        percent_encode(value, false, &mut target);
    }
    target
}

/// Converts an [`ArangoRequest`] into the HTTP request written on the wire.
pub fn build_request(
    request: &ArangoRequest,
    host: &HostDescription,
    content_type: ContentType,
    authorization: Option<&str>,
) -> Result<Request<Bytes>> {
    let mut builder = Request::builder()
        .method(method(request.request_type))
        .uri(request_target(request))
        .header(header::HOST, host.to_string())
        .header(header::CONTENT_LENGTH, request.body.len())
        .header(header::CONTENT_TYPE, content_type.mime_type())
        .header(header::ACCEPT, content_type.mime_type());
    if let Some(authorization) = authorization {
        builder = builder.header(header::AUTHORIZATION, authorization);
    }
    let mut http_request = builder.body(request.body.clone())?;

    let headers = http_request.headers_mut();
    for (key, value) in &request.header_params {
        headers.insert(
            HeaderName::from_bytes(key.as_bytes())?,
            HeaderValue::from_str(value)?,
        );
    }
    Ok(http_request)
}

pub struct HttpEncoder {
    request_method_tx: mpsc::Sender<Method>,
}

impl Encoder<Request<Bytes>> for HttpEncoder {
    type Error = CodecWriteError;

    fn encode(&mut self, request: Request<Bytes>, dst: &mut BytesMut) -> Result<(), CodecWriteError> {
        let start = dst.len();
        let (parts, body) = request.into_parts();
        self.request_method_tx
            .send(parts.method.clone())
            .map_err(|_| CodecWriteError::Encoder(anyhow!("http decoder half was lost")))?;

        dst.extend_from_slice(parts.method.as_str().as_bytes());
        dst.extend_from_slice(b" ");
        dst.extend_from_slice(parts.uri.to_string().as_bytes());
        dst.extend_from_slice(b" HTTP/1.1\r\n");
        for (k, v) in &parts.headers {
            dst.extend_from_slice(k.as_str().as_bytes());
            dst.extend_from_slice(b": ");
            dst.extend_from_slice(v.as_bytes());
            dst.extend_from_slice(b"\r\n");
        }
        dst.extend_from_slice(b"\r\n");
        dst.extend_from_slice(&body);

        tracing::trace!(
            "outgoing HTTP request:\n{}",
            pretty_hex::pretty_hex(&&dst[start..])
        );
        Ok(())
    }
}

#[derive(Debug)]
enum State {
    ParsingResponse,
    ReadingBody(ArangoResponse, usize),
}

pub struct HttpDecoder {
    request_method_rx: mpsc::Receiver<Method>,
    state: State,
}

impl HttpDecoder {
    /// Returns the parsed head with an empty body and the length of the body still to be read.
    fn decode_head(&self, src: &mut BytesMut) -> Result<Option<(ArangoResponse, usize)>> {
        let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
        let mut response = httparse::Response::new(&mut headers);

        let body_start = match response.parse(src)? {
            httparse::Status::Complete(body_start) => body_start,
            httparse::Status::Partial => return Ok(None),
        };
        match response.version {
            Some(1) => (),
            version => {
                return Err(anyhow!(
                    "HTTP version: {version:?} unsupported. Requires HTTP/1.1"
                ))
            }
        }
        let response_code = response
            .code
            .ok_or_else(|| anyhow!("HTTP response is missing its status code"))?;

        let mut meta: BTreeMap<String, String> = BTreeMap::new();
        for header in response.headers.iter() {
            let name = header.name.to_ascii_lowercase();
            let value = String::from_utf8_lossy(header.value).into_owned();
            meta.entry(name)
                .and_modify(|existing| {
                    existing.push_str(", ");
                    existing.push_str(&value);
                })
                .or_insert(value);
        }

        if meta
            .get(header::TRANSFER_ENCODING.as_str())
            .is_some_and(|encoding| encoding.contains("chunked"))
        {
            return Err(anyhow!("chunked transfer encoding is not supported"));
        }
        let content_length = match meta.get(header::CONTENT_LENGTH.as_str()) {
            Some(content_length) => match atoi::atoi(content_length.as_bytes()) {
                Some(content_length) => content_length,
                None => return Err(anyhow!("content-length header invalid")),
            },
            None => 0,
        };
        if content_length > MAX_MESSAGE_LENGTH {
            return Err(anyhow!(
                "content-length {content_length} exceeds the maximum message length {MAX_MESSAGE_LENGTH}"
            ));
        }

        src.advance(body_start);
        Ok(Some((
            ArangoResponse {
                version: 1,
                response_code,
                meta,
                body: Bytes::new(),
            },
            content_length,
        )))
    }
}

impl Decoder for HttpDecoder {
    type Item = ArangoResponse;
    type Error = CodecReadError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<ArangoResponse>, CodecReadError> {
        loop {
            match std::mem::replace(&mut self.state, State::ParsingResponse) {
                State::ParsingResponse => {
                    if src.is_empty() {
                        return Ok(None);
                    }
                    match self.decode_head(src).map_err(CodecReadError::Parser)? {
                        Some((response, content_length)) => {
                            let method = self.request_method_rx.try_recv().map_err(|_| {
                                CodecReadError::Parser(anyhow!(
                                    "received an HTTP response with no outstanding request"
                                ))
                            })?;
                            if method == Method::HEAD {
                                return Ok(Some(response));
                            }
                            self.state = State::ReadingBody(response, content_length);
                        }
                        None => return Ok(None),
                    }
                }
                State::ReadingBody(mut response, content_length) => {
                    if src.len() < content_length {
                        src.reserve(content_length - src.len());
                        self.state = State::ReadingBody(response, content_length);
                        return Ok(None);
                    }
                    response.body = src.split_to(content_length).freeze();
                    tracing::trace!(
                        "incoming HTTP response {} with {} byte body",
                        response.response_code,
                        content_length
                    );
                    return Ok(Some(response));
                }
            }
        }
    }
}
