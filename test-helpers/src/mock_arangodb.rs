//! An in-process ArangoDB stand-in that speaks just enough VelocyStream and HTTP to exercise the communication layer.
//!
//! Every response carries an `x-mock-host` header naming the server that produced it.

use anyhow::{anyhow, bail, Context, Result};
use arango_comm::auth::AuthenticationMethod;
use arango_comm::codec::vst::{VstDecoder, VstEncoder, VstMessage, HANDSHAKE};
use arango_comm::config::ArangoProtocol;
use arango_comm::host::HostDescription;
use arango_comm::vpack::{self, Value};
use bytes::{Buf, Bytes, BytesMut};
use futures::{SinkExt, StreamExt};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::codec::{FramedRead, FramedWrite};

pub const MOCK_HOST_HEADER: &str = "x-mock-host";

/// A request as seen by the mock server.
#[derive(Debug, Clone)]
pub struct RecordedRequest {
    pub database: String,
    pub method: String,
    pub path: String,
    pub headers: BTreeMap<String, String>,
    pub body: Bytes,
}

impl RecordedRequest {
    pub fn is_dirty_read(&self) -> bool {
        self.headers
            .get("x-arango-allow-dirty-read")
            .is_some_and(|value| value == "true")
    }
}

struct Response {
    code: u16,
    meta: Vec<(String, String)>,
    body: Bytes,
}

struct State {
    host: HostDescription,
    authentication: Option<AuthenticationMethod>,
    leader: AtomicBool,
    leader_endpoint: Mutex<Option<HostDescription>>,
    endpoints: Mutex<Vec<HostDescription>>,
    delay: Mutex<Duration>,
    stalled: AtomicBool,
    stopped: AtomicBool,
    connections: AtomicUsize,
    requests: Mutex<Vec<RecordedRequest>>,
    cut_tx: watch::Sender<u64>,
}

impl State {
    fn respond(&self, request: RecordedRequest) -> Response {
        let wants_json = request
            .headers
            .get("accept")
            .is_some_and(|accept| accept.contains("json"));
        let is_leader = self.leader.load(Ordering::SeqCst);

        let response = match request.path.as_str() {
            "/_admin/server/availability" => Response {
                code: if is_leader { 200 } else { 503 },
                meta: vec![],
                body: Bytes::new(),
            },
            "/_api/version" => Response {
                code: 200,
                meta: vec![],
                body: Bytes::from_static(br#"{"server":"arango","version":"3.11.0","license":"community"}"#),
            },
            "/_api/cluster/endpoints" => {
                let endpoints: Vec<String> = self
                    .endpoints
                    .lock()
                    .unwrap()
                    .iter()
                    .map(|host| format!("tcp://{host}"))
                    .collect();
                let body = if wants_json {
                    serde_json::to_vec(&serde_json::json!({
                        "error": false,
                        "code": 200,
                        "endpoints": endpoints
                            .iter()
                            .map(|endpoint| serde_json::json!({ "endpoint": endpoint }))
                            .collect::<Vec<_>>(),
                    }))
                    .unwrap()
                    .into()
                } else {
                    vpack::encode(&Value::Object(vec![
                        ("error".to_owned(), Value::Bool(false)),
                        ("code".to_owned(), Value::Int(200)),
                        (
                            "endpoints".to_owned(),
                            Value::Array(
                                endpoints
                                    .into_iter()
                                    .map(|endpoint| {
                                        Value::Object(vec![("endpoint".to_owned(), Value::from(endpoint))])
                                    })
                                    .collect(),
                            ),
                        ),
                    ]))
                };
                Response {
                    code: 200,
                    meta: vec![],
                    body,
                }
            }
            _ if !is_leader && !request.is_dirty_read() => Response {
                code: 503,
                meta: self
                    .leader_endpoint
                    .lock()
                    .unwrap()
                    .iter()
                    .map(|leader| ("x-arango-endpoint".to_owned(), format!("tcp://{leader}")))
                    .collect(),
                body: Bytes::new(),
            },
            path => Response {
                code: 200,
                meta: vec![("x-mock-path".to_owned(), path.to_owned())],
                body: request.body.clone(),
            },
        };
        self.requests.lock().unwrap().push(request);

        let mut meta = response.meta;
        meta.push((MOCK_HOST_HEADER.to_owned(), self.host.to_string()));
        Response { meta, ..response }
    }

    fn check_basic_credentials(&self, user: &str, password: &str) -> bool {
        match &self.authentication {
            Some(AuthenticationMethod::Basic {
                user: expected_user,
                password: expected_password,
            }) => user == expected_user && password == expected_password,
            _ => false,
        }
    }

    fn check_jwt(&self, token: &str) -> bool {
        matches!(&self.authentication, Some(AuthenticationMethod::Jwt { jwt, .. }) if jwt == token)
    }
}

/// A running mock server, it is stopped when dropped.
pub struct MockArangoDb {
    state: Arc<State>,
    protocol: ArangoProtocol,
    accept_task: JoinHandle<()>,
}

impl MockArangoDb {
    pub async fn start(protocol: ArangoProtocol) -> MockArangoDb {
        MockArangoDb::start_with(protocol, None, true).await
    }

    pub async fn start_with(
        protocol: ArangoProtocol,
        authentication: Option<AuthenticationMethod>,
        leader: bool,
    ) -> MockArangoDb {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let (cut_tx, _) = watch::channel(0);
        let state = Arc::new(State {
            host: HostDescription::new("127.0.0.1", port),
            authentication,
            leader: AtomicBool::new(leader),
            leader_endpoint: Mutex::new(None),
            endpoints: Mutex::new(vec![]),
            delay: Mutex::new(Duration::ZERO),
            stalled: AtomicBool::new(false),
            stopped: AtomicBool::new(false),
            connections: AtomicUsize::new(0),
            requests: Mutex::new(vec![]),
            cut_tx,
        });

        let accept_state = state.clone();
        let accept_task = tokio::spawn(async move {
            loop {
                let Ok((stream, _)) = listener.accept().await else {
                    return;
                };
                if accept_state.stopped.load(Ordering::SeqCst) {
                    return;
                }
                stream.set_nodelay(true).ok();
                accept_state.connections.fetch_add(1, Ordering::SeqCst);
                let state = accept_state.clone();
                let cut_rx = state.cut_tx.subscribe();
                tokio::spawn(async move {
                    let result = match protocol {
                        ArangoProtocol::Vst => serve_vst(stream, state, cut_rx).await,
                        ArangoProtocol::Http => serve_http(stream, state, cut_rx).await,
                    };
                    if let Err(err) = result {
                        tracing::debug!("mock connection ended with error: {err:?}");
                    }
                });
            }
        });

        MockArangoDb {
            state,
            protocol,
            accept_task,
        }
    }

    pub fn host(&self) -> HostDescription {
        self.state.host.clone()
    }

    pub fn protocol(&self) -> ArangoProtocol {
        self.protocol
    }

    pub fn set_leader(&self, leader: bool) {
        self.state.leader.store(leader, Ordering::SeqCst);
    }

    /// The leader named in the `x-arango-endpoint` header of 503 responses sent while this server is a follower.
    pub fn set_leader_endpoint(&self, leader: Option<HostDescription>) {
        *self.state.leader_endpoint.lock().unwrap() = leader;
    }

    pub fn set_endpoints(&self, endpoints: Vec<HostDescription>) {
        *self.state.endpoints.lock().unwrap() = endpoints;
    }

    pub fn set_delay(&self, delay: Duration) {
        *self.state.delay.lock().unwrap() = delay;
    }

    /// While stalled requests are accepted but never answered.
    pub fn set_stalled(&self, stalled: bool) {
        self.state.stalled.store(stalled, Ordering::SeqCst);
    }

    /// Closes every open connection from the server side.
    pub fn cut_connections(&self) {
        self.state.cut_tx.send_modify(|generation| *generation += 1);
    }

    /// Stops accepting connections and closes the open ones.
    pub fn stop(&self) {
        self.state.stopped.store(true, Ordering::SeqCst);
        self.accept_task.abort();
        self.cut_connections();
    }

    pub fn connection_count(&self) -> usize {
        self.state.connections.load(Ordering::SeqCst)
    }

    pub fn recorded_requests(&self) -> Vec<RecordedRequest> {
        self.state.requests.lock().unwrap().clone()
    }

    /// Requests other than the administrative ones sent by the communication layer itself.
    pub fn user_requests(&self) -> Vec<RecordedRequest> {
        self.recorded_requests()
            .into_iter()
            .filter(|request| {
                !matches!(
                    request.path.as_str(),
                    "/_admin/server/availability" | "/_api/version" | "/_api/cluster/endpoints"
                )
            })
            .collect()
    }
}

impl Drop for MockArangoDb {
    fn drop(&mut self) {
        self.stop();
    }
}

async fn serve_vst(
    stream: TcpStream,
    state: Arc<State>,
    mut cut_rx: watch::Receiver<u64>,
) -> Result<()> {
    let (mut read, write) = stream.into_split();
    let mut handshake = [0u8; HANDSHAKE.len()];
    read.read_exact(&mut handshake).await?;
    if handshake != HANDSHAKE {
        bail!("unexpected VST handshake {handshake:?}");
    }

    let (tx, mut rx) = mpsc::unbounded_channel::<VstMessage>();
    let writer_task = tokio::spawn(async move {
        let mut writer = FramedWrite::new(write, VstEncoder::new(1024));
        while let Some(message) = rx.recv().await {
            if writer.send(message).await.is_err() {
                return;
            }
        }
    });
    let _abort_writer = AbortOnDrop(writer_task);

    let mut reader = FramedRead::new(read, VstDecoder::new());
    let mut authenticated = state.authentication.is_none();
    loop {
        let message = tokio::select! {
            biased;
            _ = cut_rx.changed() => return Ok(()),
            message = reader.next() => match message {
                Some(message) => message.map_err(|err| anyhow!("{err:?}"))?,
                None => return Ok(()),
            }
        };

        let (header, header_len) = vpack::decode(&message.payload)?;
        let fields = header
            .as_array()
            .ok_or_else(|| anyhow!("VST header is not an array"))?;
        if fields.get(1).and_then(Value::as_u64) == Some(1000) {
            let accepted = match fields.get(2).and_then(Value::as_str) {
                Some("plain") => state.check_basic_credentials(
                    fields.get(3).and_then(Value::as_str).unwrap_or_default(),
                    fields.get(4).and_then(Value::as_str).unwrap_or_default(),
                ),
                Some("jwt") => state.check_jwt(fields.get(3).and_then(Value::as_str).unwrap_or_default()),
                _ => false,
            };
            authenticated = accepted;
            let code = if accepted { 200 } else { 401 };
            tx.send(vst_response(message.message_id, code, &[], &Bytes::new()))
                .ok();
            continue;
        }

        let request = RecordedRequest {
            database: fields
                .get(2)
                .and_then(Value::as_str)
                .context("VST request is missing its database")?
                .to_owned(),
            method: match fields.get(3).and_then(Value::as_u64) {
                Some(0) => "DELETE",
                Some(1) => "GET",
                Some(2) => "POST",
                Some(3) => "PUT",
                Some(4) => "HEAD",
                Some(5) => "PATCH",
                Some(6) => "OPTIONS",
                other => bail!("unknown VST request type {other:?}"),
            }
            .to_owned(),
            path: fields
                .get(4)
                .and_then(Value::as_str)
                .context("VST request is missing its path")?
                .to_owned(),
            headers: fields
                .get(6)
                .and_then(Value::as_object)
                .unwrap_or_default()
                .iter()
                .filter_map(|(key, value)| Some((key.to_ascii_lowercase(), value.as_str()?.to_owned())))
                .collect(),
            body: message.payload.slice(header_len..),
        };

        if !authenticated {
            tx.send(vst_response(message.message_id, 401, &[], &Bytes::new()))
                .ok();
            continue;
        }
        if state.stalled.load(Ordering::SeqCst) {
            state.requests.lock().unwrap().push(request);
            continue;
        }

        let response = state.respond(request);
        let delay = *state.delay.lock().unwrap();
        let tx = tx.clone();
        let message_id = message.message_id;
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            tx.send(vst_response(message_id, response.code, &response.meta, &response.body))
                .ok();
        });
    }
}

fn vst_response(message_id: u64, code: u16, meta: &[(String, String)], body: &Bytes) -> VstMessage {
    let header = Value::Array(vec![
        Value::Int(1),
        Value::Int(2),
        Value::Int(code as i64),
        Value::Object(
            meta.iter()
                .map(|(key, value)| (key.clone(), Value::from(value.as_str())))
                .collect(),
        ),
    ]);
    let mut payload = BytesMut::new();
    vpack::encode_into(&header, &mut payload);
    payload.extend_from_slice(body);
    VstMessage {
        message_id,
        payload: payload.freeze(),
    }
}

async fn serve_http(
    stream: TcpStream,
    state: Arc<State>,
    mut cut_rx: watch::Receiver<u64>,
) -> Result<()> {
    let (mut read, mut write) = stream.into_split();
    let mut buffer = BytesMut::with_capacity(4096);
    loop {
        while let Some(request) = parse_http_request(&mut buffer)? {
            let authorized = match &state.authentication {
                None => true,
                Some(expected) => {
                    request.headers.get("authorization").map(String::as_str)
                        == Some(expected.http_authorization_header().as_str())
                }
            };
            if !authorized {
                write.write_all(&http_response(401, &[], &Bytes::new())).await?;
                continue;
            }
            if state.stalled.load(Ordering::SeqCst) {
                state.requests.lock().unwrap().push(request);
                continue;
            }
            let is_head = request.method == "HEAD";
            let response = state.respond(request);
            let delay = *state.delay.lock().unwrap();
            tokio::select! {
                biased;
                _ = cut_rx.changed() => return Ok(()),
                _ = tokio::time::sleep(delay) => {}
            }
            let mut encoded = http_response(response.code, &response.meta, &response.body);
            if is_head {
                encoded.truncate(encoded.len() - response.body.len());
            }
            write.write_all(&encoded).await?;
        }

        tokio::select! {
            biased;
            _ = cut_rx.changed() => return Ok(()),
            read_len = read.read_buf(&mut buffer) => {
                if read_len? == 0 {
                    return Ok(());
                }
            }
        }
    }
}

fn parse_http_request(buffer: &mut BytesMut) -> Result<Option<RecordedRequest>> {
    let mut headers = [httparse::EMPTY_HEADER; 64];
    let mut request = httparse::Request::new(&mut headers);
    let body_start = match request.parse(buffer)? {
        httparse::Status::Complete(body_start) => body_start,
        httparse::Status::Partial => return Ok(None),
    };

    let headers: BTreeMap<String, String> = request
        .headers
        .iter()
        .map(|header| {
            (
                header.name.to_ascii_lowercase(),
                String::from_utf8_lossy(header.value).into_owned(),
            )
        })
        .collect();
    let content_length: usize = headers
        .get("content-length")
        .map(|length| length.parse())
        .transpose()?
        .unwrap_or(0);
    if buffer.len() < body_start + content_length {
        return Ok(None);
    }

    let method = request.method.context("missing method")?.to_owned();
    let target = request.path.context("missing path")?;
    let target = target.split_once('?').map_or(target, |(path, _)| path);
    let (database, path) = target
        .strip_prefix("/_db/")
        .and_then(|rest| rest.split_once('/'))
        .map(|(database, path)| (database.to_owned(), format!("/{path}")))
        .unwrap_or_else(|| ("_system".to_owned(), target.to_owned()));

    buffer.advance(body_start);
    let body = buffer.split_to(content_length).freeze();
    Ok(Some(RecordedRequest {
        database,
        method,
        path,
        headers,
        body,
    }))
}

fn http_response(code: u16, meta: &[(String, String)], body: &Bytes) -> Vec<u8> {
    let mut response = format!("HTTP/1.1 {code} Mock\r\ncontent-length: {}\r\n", body.len());
    for (key, value) in meta {
        response.push_str(&format!("{key}: {value}\r\n"));
    }
    response.push_str("\r\n");
    let mut response = response.into_bytes();
    response.extend_from_slice(body);
    response
}

struct AbortOnDrop(JoinHandle<()>);

impl Drop for AbortOnDrop {
    fn drop(&mut self) {
        self.0.abort();
    }
}
