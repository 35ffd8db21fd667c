use super::{read_error, write_error, Outgoing, Session, SessionHandle};
use crate::auth::AuthenticationMethod;
use crate::codec::http::{build_codec, HttpDecoder, HttpEncoder};
use crate::config::ConnectionConfig;
use crate::error::ConnectionError;
use crate::host::HostDescription;
use crate::request::{ArangoRequest, RequestType, SYSTEM_DATABASE};
use crate::tcp;
use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::{mpsc, watch};
use tokio_util::codec::{FramedRead, FramedWrite};
use tracing::Instrument;

type OutgoingRequest = (u64, ::http::Request<Bytes>);

/// Opens an HTTP/1.1 keep-alive session.
/// When credentials are configured they are verified up front so that a bad password fails the connect rather than the first request.
pub(super) async fn connect(
    host: &HostDescription,
    config: &ConnectionConfig,
    authentication: Option<&AuthenticationMethod>,
    next_message_id: &AtomicU64,
) -> Result<Session, ConnectionError> {
    let stream = tcp::tcp_stream(config.connect_timeout, host)
        .await
        .map_err(|err| ConnectionError::Connect(Arc::new(err)))?;
    let (read, write) = stream.into_split();
    let (decoder, encoder) = build_codec();

    let (out_tx, out_rx) = mpsc::unbounded_channel();
    let (session, handle, shutdown_rx) = Session::new(
        host.clone(),
        Outgoing::Http {
            tx: out_tx,
            content_type: config.content_type,
            authorization: authentication.map(AuthenticationMethod::http_authorization_header),
        },
    );

    // responses arrive in request order, the writer tells the reader which message id comes next
    let (in_flight_tx, in_flight_rx) = mpsc::unbounded_channel();
    tokio::spawn(
        reader_task(
            FramedRead::new(read, decoder),
            in_flight_rx,
            handle.clone(),
            shutdown_rx.clone(),
        )
        .in_current_span(),
    );
    tokio::spawn(
        writer_task(
            FramedWrite::new(write, encoder),
            out_rx,
            in_flight_tx,
            handle,
            shutdown_rx,
        )
        .in_current_span(),
    );

    if let Some(authentication) = authentication {
        let probe = ArangoRequest::new(SYSTEM_DATABASE, RequestType::Get, "/_api/version");
        let message_id = next_message_id.fetch_add(1, Ordering::Relaxed);
        let response = session.execute(message_id, &probe, config.timeout).await?;
        if response.response_code == 401 {
            tracing::warn!(
                "authentication as {:?} was rejected with response code {}",
                authentication.user(),
                response.response_code
            );
            session.close();
            return Err(ConnectionError::Authentication {
                host: host.clone(),
                response_code: response.response_code,
            });
        }
        tracing::debug!("authenticated as {:?}", authentication.user());
    }

    tracing::debug!("HTTP session established");
    Ok(session)
}

async fn reader_task(
    mut reader: FramedRead<OwnedReadHalf, HttpDecoder>,
    mut in_flight_rx: mpsc::UnboundedReceiver<u64>,
    handle: SessionHandle,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            biased;
            _ = shutdown_rx.changed() => return,
            result = reader.next() => match result {
                Some(Ok(response)) => match in_flight_rx.try_recv() {
                    Ok(message_id) => handle.resolve(message_id, response),
                    Err(_) => {
                        handle.fail(ConnectionError::MessageDecode(Arc::new(anyhow::anyhow!(
                            "received an HTTP response with no outstanding request"
                        ))));
                        return;
                    }
                },
                Some(Err(err)) => {
                    handle.fail(read_error(err));
                    return;
                }
                None => {
                    handle.fail(ConnectionError::OtherSideClosed);
                    return;
                }
            }
        }
    }
}

async fn writer_task(
    mut writer: FramedWrite<OwnedWriteHalf, HttpEncoder>,
    mut out_rx: mpsc::UnboundedReceiver<OutgoingRequest>,
    in_flight_tx: mpsc::UnboundedSender<u64>,
    handle: SessionHandle,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            biased;
            _ = shutdown_rx.changed() => return,
            request = out_rx.recv() => match request {
                Some((message_id, request)) => {
                    // registered before writing so the reader can never see a response first
                    if in_flight_tx.send(message_id).is_err() {
                        return;
                    }
                    if let Err(err) = writer.send(request).await {
                        handle.fail(write_error(err));
                        return;
                    }
                }
                None => return,
            }
        }
    }
}
