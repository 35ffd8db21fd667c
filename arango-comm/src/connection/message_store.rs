use crate::error::ConnectionError;
use crate::request::ArangoResponse;
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::task::{Context, Poll};
use tokio::sync::oneshot;

pub type ResponseResult = Result<ArangoResponse, ConnectionError>;

#[derive(Default)]
struct State {
    pending: HashMap<u64, oneshot::Sender<ResponseResult>>,
    /// Once set every outstanding and future request fails with this error.
    cleared: Option<ConnectionError>,
}

/// Correlates message ids with the requests waiting for their response.
///
/// Invariants:
/// * a message id is outstanding from `add_request` until it is resolved, cancelled or the store is cleared
/// * an outstanding message id can not be added again
/// * every entry is completed at most once
#[derive(Clone, Default)]
pub struct MessageStore {
    state: Arc<Mutex<State>>,
}

impl MessageStore {
    pub fn new() -> Self {
        MessageStore::default()
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        // the state is consistent after every statement, so a panic while holding the lock leaves nothing half done
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Registers a request that expects a response with `message_id`.
    pub fn add_request(&self, message_id: u64) -> Result<PendingResponse, ConnectionError> {
        let mut state = self.lock();
        if let Some(cause) = &state.cleared {
            return Err(cause.clone());
        }
        if state
            .pending
            .get(&message_id)
            .is_some_and(|tx| !tx.is_closed())
        {
            return Err(ConnectionError::DuplicateMessageId(message_id));
        }
        let (tx, rx) = oneshot::channel();
        state.pending.insert(message_id, tx);
        Ok(PendingResponse {
            message_id,
            rx,
            store: Arc::downgrade(&self.state),
        })
    }

    /// Completes the request waiting on `message_id`.
    /// Responses nobody is waiting for, e.g. because the request timed out, are dropped.
    pub fn resolve(&self, message_id: u64, response: ArangoResponse) {
        let tx = self.lock().pending.remove(&message_id);
        match tx {
            Some(tx) => {
                if tx.send(Ok(response)).is_err() {
                    tracing::debug!("dropping response to message {message_id}, the request was cancelled");
                }
            }
            None => tracing::debug!("dropping response to unknown message {message_id}"),
        }
    }

    /// Removes the request waiting on `message_id` without completing it.
    /// Returns false if there was no such request.
    pub fn cancel(&self, message_id: u64) -> bool {
        self.lock().pending.remove(&message_id).is_some()
    }

    /// Fails every outstanding request with `cause` and rejects all future requests with it.
    pub fn clear(&self, cause: ConnectionError) {
        let pending = {
            let mut state = self.lock();
            if state.cleared.is_none() {
                state.cleared = Some(cause.clone());
            }
            std::mem::take(&mut state.pending)
        };
        if !pending.is_empty() {
            tracing::debug!(
                "failing {} outstanding requests with: {cause}",
                pending.len()
            );
        }
        for (_, tx) in pending {
            tx.send(Err(cause.clone())).ok();
        }
    }

    pub fn is_cleared(&self) -> bool {
        self.lock().cleared.is_some()
    }

    pub fn len(&self) -> usize {
        self.lock().pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// The eventual response to a request registered in a [`MessageStore`].
///
/// Dropping it cancels the request, a response that arrives later is discarded.
pub struct PendingResponse {
    message_id: u64,
    rx: oneshot::Receiver<ResponseResult>,
    store: Weak<Mutex<State>>,
}

impl PendingResponse {
    pub fn message_id(&self) -> u64 {
        self.message_id
    }
}

impl Future for PendingResponse {
    type Output = ResponseResult;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<ResponseResult> {
        // the sender is only ever dropped without sending when the entry was cancelled
        Pin::new(&mut self.rx)
            .poll(cx)
            .map(|result| result.unwrap_or(Err(ConnectionError::Closed)))
    }
}

impl Drop for PendingResponse {
    fn drop(&mut self) {
        self.rx.close();
        if let Some(state) = self.store.upgrade() {
            let mut state = state.lock().unwrap_or_else(PoisonError::into_inner);
            // only remove our own entry, the id may have been reused after we were completed
            if state
                .pending
                .get(&self.message_id)
                .is_some_and(|tx| tx.is_closed())
            {
                state.pending.remove(&self.message_id);
            }
        }
    }
}
