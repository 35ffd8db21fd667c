//! Use to establish a TCP connection to an ArangoDB server

use crate::host::HostDescription;
use anyhow::{anyhow, Context, Result};
use std::time::Duration;
use tokio::{net::TcpStream, time::timeout};

pub async fn tcp_stream(connect_timeout: Duration, destination: &HostDescription) -> Result<TcpStream> {
    let stream = timeout(connect_timeout, TcpStream::connect(destination.socket_address()))
        .await
        .map_err(|_| {
            anyhow!(
                "destination {destination} did not respond to connection attempt within {connect_timeout:?}"
            )
        })?
        .with_context(|| format!("Failed to connect to destination {destination}"))?;
    // requests are small and latency sensitive
    stream
        .set_nodelay(true)
        .with_context(|| format!("Failed to set TCP_NODELAY on connection to {destination}"))?;
    Ok(stream)
}

#[cfg(test)]
mod test {
    use super::*;

    #[tokio::test]
    async fn connect_refused() {
        // bind then drop to find a port that nothing listens on
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let err = tcp_stream(Duration::from_secs(1), &HostDescription::new("127.0.0.1", port))
            .await
            .unwrap_err();
        assert_eq!(
            err.to_string(),
            format!("Failed to connect to destination 127.0.0.1:{port}")
        );
    }

    #[tokio::test]
    async fn connect_succeeds() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let stream = tcp_stream(Duration::from_secs(1), &HostDescription::new("127.0.0.1", port))
            .await
            .unwrap();
        assert!(stream.nodelay().unwrap());
    }
}
