use super::pool::HostPool;
use crate::connection::ArangoConnection;
use crate::error::{CommunicationError, ConnectionError, HostFailure};
use crate::host::HostDescription;
use crate::observability;
use crate::request::{ArangoRequest, RequestType, SYSTEM_DATABASE};
use arc_swap::ArcSwapOption;
use futures::stream::FuturesUnordered;
use futures::StreamExt;
use std::collections::HashSet;
use std::sync::Arc;

/// Answers 200 on the leader and 503 on followers.
pub const AVAILABILITY_PATH: &str = "/_admin/server/availability";

/// Tracks which host of an active failover deployment is the leader.
pub struct ActiveFailoverPool {
    hosts: HostPool,
    leader: ArcSwapOption<HostDescription>,
}

impl ActiveFailoverPool {
    pub fn new(hosts: HostPool) -> Self {
        ActiveFailoverPool {
            hosts,
            leader: ArcSwapOption::empty(),
        }
    }

    pub fn host_pool(&self) -> &HostPool {
        &self.hosts
    }

    pub fn leader(&self) -> Option<HostDescription> {
        self.leader.load().as_deref().cloned()
    }

    /// Returns true if the leader changed.
    pub fn set_leader(&self, leader: HostDescription) -> bool {
        let previous = self.leader.swap(Some(Arc::new(leader.clone())));
        let changed = previous.as_deref() != Some(&leader);
        if changed {
            match previous {
                Some(previous) => {
                    tracing::info!("leader changed from {previous} to {leader}");
                    observability::leader_changes().increment(1);
                }
                None => tracing::info!("leader is {leader}"),
            }
        }
        changed
    }

    /// Forgets the leader, requests will fail until it is detected again.
    pub fn clear_leader(&self) {
        if self.leader.swap(None).is_some() {
            tracing::debug!("leader unknown, it will be detected again");
        }
    }

    /// Ordinary requests go to the leader, dirty reads rotate across every host.
    pub fn select(
        &self,
        dirty_read: bool,
        excluded: &HashSet<HostDescription>,
    ) -> Option<Arc<ArangoConnection>> {
        if dirty_read {
            self.hosts.select(|host| !excluded.contains(host))
        } else {
            let leader = self.leader.load_full()?;
            self.hosts.connection_to(&leader)
        }
    }

    /// Probes every host and makes the first one reporting itself available the leader.
    pub async fn detect_leader(&self) -> Result<HostDescription, CommunicationError> {
        let request = ArangoRequest::new(SYSTEM_DATABASE, RequestType::Get, AVAILABILITY_PATH);
        let mut probes: FuturesUnordered<_> = self
            .hosts
            .snapshot()
            .iter()
            .filter_map(|entry| {
                let host = entry.host.clone();
                let connection = self.hosts.connection_to(&host)?;
                let request = &request;
                Some(async move { (host, connection.execute(request).await) })
            })
            .collect();

        let mut failures = vec![];
        while let Some((host, result)) = probes.next().await {
            match result {
                Ok(response) if response.response_code == 200 => {
                    self.set_leader(host.clone());
                    return Ok(host);
                }
                Ok(response) => {
                    tracing::debug!("{host} is a follower, availability probe answered {}", response.response_code);
                }
                Err(error) => failures.push(HostFailure { host, error }),
            }
        }
        self.clear_leader();
        if failures.is_empty() {
            // every host answered but none of them leads, the deployment is mid failover
            failures = self
                .hosts
                .hosts()
                .into_iter()
                .map(|host| HostFailure {
                    host,
                    error: ConnectionError::NotLeader,
                })
                .collect();
        }
        Err(CommunicationError::no_hosts_available(failures))
    }

    /// Follows a follower's redirect to the current leader, connecting to it if it is not part of the pool yet.
    pub async fn follow_leader(&self, leader: HostDescription) -> Result<(), ConnectionError> {
        if !self.hosts.contains(&leader) {
            let entry = self.hosts.connect_host(leader.clone()).await?;
            self.hosts.insert(vec![entry]);
        }
        self.set_leader(leader);
        Ok(())
    }
}
