use crate::host::HostDescription;
use std::sync::Arc;
use std::time::Duration;

/// An error raised by a single connection.
///
/// Cheap to clone so that a single transport failure can be handed to every request that was in flight.
#[derive(thiserror::Error, Debug, Clone)]
pub enum ConnectionError {
    #[error("The other side of this connection closed the connection")]
    OtherSideClosed,
    #[error("The connection was closed locally")]
    Closed,
    #[error("Message decode error {0:#}")]
    MessageDecode(Arc<anyhow::Error>),
    #[error("Message encode error {0:#}")]
    MessageEncode(Arc<anyhow::Error>),
    #[error("IO error {0}")]
    Io(Arc<std::io::Error>),
    #[error("No response was received within {0:?}")]
    Timeout(Duration),
    #[error("Failed to connect {0:#}")]
    Connect(Arc<anyhow::Error>),
    #[error("Authentication against {host} was rejected with response code {response_code}")]
    Authentication {
        host: HostDescription,
        response_code: u16,
    },
    #[error("Message id {0} is already in use by an outstanding request")]
    DuplicateMessageId(u64),
    #[error("The host is not the leader of the active failover deployment")]
    NotLeader,
}

impl ConnectionError {
    /// Transient errors are caused by the transport or the remote host and may succeed when retried on another connection.
    /// Authentication and usage errors never are.
    pub fn is_transient(&self) -> bool {
        match self {
            ConnectionError::OtherSideClosed
            | ConnectionError::Closed
            | ConnectionError::MessageDecode(_)
            | ConnectionError::Io(_)
            | ConnectionError::Timeout(_)
            | ConnectionError::Connect(_)
            | ConnectionError::NotLeader => true,
            ConnectionError::MessageEncode(_)
            | ConnectionError::Authentication { .. }
            | ConnectionError::DuplicateMessageId(_) => false,
        }
    }
}

impl From<std::io::Error> for ConnectionError {
    fn from(err: std::io::Error) -> Self {
        match err.kind() {
            std::io::ErrorKind::BrokenPipe
            | std::io::ErrorKind::ConnectionReset
            | std::io::ErrorKind::UnexpectedEof => ConnectionError::OtherSideClosed,
            _ => ConnectionError::Io(Arc::new(err)),
        }
    }
}

/// A failed attempt against a specific host.
#[derive(Debug, Clone)]
pub struct HostFailure {
    pub host: HostDescription,
    pub error: ConnectionError,
}

pub fn bullet_list_of_host_failures<'a, I: Iterator<Item = &'a HostFailure>>(failures: I) -> String {
    let mut host_errors = String::new();
    for HostFailure { host, error } in failures {
        host_errors.push_str(&format!("\n* {host}:\n    - {error}"));
    }
    host_errors
}

#[derive(thiserror::Error, Debug)]
pub enum CommunicationError {
    #[error("No hosts were available to serve the request, attempts failed with:{}", bullet_list_of_host_failures(.failures.iter()))]
    NoHostsAvailable { failures: Vec<HostFailure> },
    #[error("The host {0} required by the current conversation is not available")]
    HostNotAvailable(HostDescription),
    #[error(transparent)]
    Connection(#[from] ConnectionError),
    #[error("A conversation is already bound to the current task")]
    ConversationAlreadyBound,
    #[error("The conversation can only be released by the task or thread that required it")]
    ConversationOwnership,
    #[error("The communication has been closed")]
    Closed,
    #[error("Invalid configuration {0:#}")]
    Config(anyhow::Error),
}

impl CommunicationError {
    pub fn no_hosts_available(failures: Vec<HostFailure>) -> Self {
        CommunicationError::NoHostsAvailable { failures }
    }

    /// The error that caused the most recent failed attempt, if any.
    pub fn last_cause(&self) -> Option<&ConnectionError> {
        match self {
            CommunicationError::NoHostsAvailable { failures } => {
                failures.last().map(|failure| &failure.error)
            }
            CommunicationError::Connection(err) => Some(err),
            _ => None,
        }
    }
}
