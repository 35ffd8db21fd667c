use super::{read_error, write_error, Outgoing, Session, SessionHandle};
use crate::auth::AuthenticationMethod;
use crate::codec::vst::{self, VstDecoder, VstEncoder, VstMessage, HANDSHAKE};
use crate::config::ConnectionConfig;
use crate::error::ConnectionError;
use crate::host::HostDescription;
use crate::tcp;
use futures::{SinkExt, StreamExt};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::{mpsc, watch};
use tokio_util::codec::{FramedRead, FramedWrite};
use tracing::Instrument;

/// Opens a VelocyStream session: connect, send the protocol handshake and authenticate if credentials are configured.
pub(super) async fn connect(
    host: &HostDescription,
    config: &ConnectionConfig,
    authentication: Option<&AuthenticationMethod>,
    next_message_id: &AtomicU64,
) -> Result<Session, ConnectionError> {
    let stream = tcp::tcp_stream(config.connect_timeout, host)
        .await
        .map_err(|err| ConnectionError::Connect(Arc::new(err)))?;
    let (read, mut write) = stream.into_split();
    write.write_all(HANDSHAKE).await?;

    let (out_tx, out_rx) = mpsc::unbounded_channel();
    let (session, handle, shutdown_rx) = Session::new(
        host.clone(),
        Outgoing::Vst {
            tx: out_tx.clone(),
            content_type: config.content_type,
        },
    );

    tokio::spawn(
        reader_task(
            FramedRead::new(read, VstDecoder::new()),
            handle.clone(),
            shutdown_rx.clone(),
        )
        .in_current_span(),
    );
    tokio::spawn(
        writer_task(
            FramedWrite::new(write, VstEncoder::new(config.chunk_size)),
            out_rx,
            handle,
            shutdown_rx,
        )
        .in_current_span(),
    );

    if let Some(authentication) = authentication {
        let message_id = next_message_id.fetch_add(1, Ordering::Relaxed);
        let pending = session.store.add_request(message_id)?;
        out_tx
            .send(VstMessage {
                message_id,
                payload: authentication.vst_authentication_message(),
            })
            .map_err(|_| ConnectionError::OtherSideClosed)?;

        let response = tokio::time::timeout(config.timeout, pending)
            .await
            .map_err(|_| ConnectionError::Timeout(config.timeout))??;
        if response.response_code != 200 {
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

    tracing::debug!("VST session established");
    Ok(session)
}

async fn reader_task(
    mut reader: FramedRead<OwnedReadHalf, VstDecoder>,
    handle: SessionHandle,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            biased;
            _ = shutdown_rx.changed() => {
                // the session was closed or dropped, this task is no longer needed
                return;
            }
            result = reader.next() => match result {
                Some(Ok(message)) => match vst::decode_response(&message.payload) {
                    Ok(response) => handle.resolve(message.message_id, response),
                    Err(err) => {
                        handle.fail(ConnectionError::MessageDecode(Arc::new(err)));
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
    mut writer: FramedWrite<OwnedWriteHalf, VstEncoder>,
    mut out_rx: mpsc::UnboundedReceiver<VstMessage>,
    handle: SessionHandle,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            biased;
            _ = shutdown_rx.changed() => return,
            message = out_rx.recv() => match message {
                Some(message) => {
                    if let Err(err) = writer.send(message).await {
                        handle.fail(write_error(err));
                        return;
                    }
                }
                // the session is no longer sending requests
                None => return,
            }
        }
    }
}
