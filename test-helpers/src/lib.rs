pub mod mock_arangodb;
pub mod test_tracing;

use anyhow::{bail, Result};
use arango_comm::host::HostDescription;
use std::time::Duration;

/// A host that nothing listens on.
///
/// The port is taken from a listener that is dropped straight away, so connecting to it is refused.
pub fn unreachable_host() -> HostDescription {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let port = listener.local_addr().unwrap().port();
    HostDescription::new("127.0.0.1", port)
}

/// Polls `condition` until it holds, giving up after roughly five seconds.
pub async fn wait_for(mut condition: impl FnMut() -> bool) -> Result<()> {
    let mut tries = 0;
    while !condition() {
        tokio::time::sleep(Duration::from_millis(20)).await;
        if tries > 250 {
            bail!("Ran out of retries waiting for the condition to hold");
        }
        tries += 1;
    }
    Ok(())
}
