use super::active_failover::ActiveFailoverPool;
use super::conversation::Conversation;
use crate::config::Topology;
use crate::connection::{ArangoConnection, ConnectionFactory, ConnectionState};
use crate::error::{CommunicationError, ConnectionError, HostFailure};
use crate::host::HostDescription;
use arc_swap::ArcSwap;
use futures::future::join_all;
use itertools::Itertools;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// The connections to a single host.
#[derive(Debug)]
pub struct HostConnections {
    pub host: HostDescription,
    pub connections: Vec<Arc<ArangoConnection>>,
}

/// The set of hosts the communication talks to and their connections.
///
/// Membership is published as an immutable snapshot, selecting a connection never blocks on a lock.
pub struct HostPool {
    factory: ConnectionFactory,
    connections_per_host: usize,
    hosts: ArcSwap<Vec<Arc<HostConnections>>>,
    rotation: AtomicUsize,
}

impl HostPool {
    pub fn new(factory: ConnectionFactory, connections_per_host: usize) -> Self {
        HostPool {
            factory,
            connections_per_host,
            hosts: ArcSwap::from_pointee(vec![]),
            rotation: AtomicUsize::new(0),
        }
    }

    pub fn factory(&self) -> &ConnectionFactory {
        &self.factory
    }

    pub fn snapshot(&self) -> Arc<Vec<Arc<HostConnections>>> {
        self.hosts.load_full()
    }

    pub fn hosts(&self) -> Vec<HostDescription> {
        self.hosts
            .load()
            .iter()
            .map(|entry| entry.host.clone())
            .collect()
    }

    pub fn contains(&self, host: &HostDescription) -> bool {
        self.hosts.load().iter().any(|entry| &entry.host == host)
    }

    pub fn connections_by_host(&self) -> HashMap<HostDescription, Vec<Arc<ArangoConnection>>> {
        self.hosts
            .load()
            .iter()
            .map(|entry| (entry.host.clone(), entry.connections.clone()))
            .collect()
    }

    /// Opens every connection to `host`.
    /// Fails if the first connection can not be established, the remaining ones connect on first use if they fail.
    pub async fn connect_host(
        &self,
        host: HostDescription,
    ) -> Result<HostConnections, ConnectionError> {
        let first = self.factory.create(host.clone()).await?;
        let mut connections = vec![first];
        for _ in 1..self.connections_per_host {
            let connection = self.factory.build(host.clone());
            if let Err(err) = connection.connect().await {
                tracing::warn!("failed to open an additional connection to {host}, it will be retried on use: {err}");
            }
            connections.push(connection);
        }
        Ok(HostConnections { host, connections })
    }

    /// Adds connected hosts to the pool, hosts that are already present keep their existing connections.
    pub fn insert(&self, new_hosts: Vec<HostConnections>) {
        let new_hosts: Vec<Arc<HostConnections>> = new_hosts.into_iter().map(Arc::new).collect();
        let previous = self.hosts.rcu(|current| {
            let mut next: Vec<Arc<HostConnections>> = current.iter().cloned().collect();
            for entry in &new_hosts {
                if !next.iter().any(|existing| existing.host == entry.host) {
                    next.push(entry.clone());
                }
            }
            next
        });
        // a concurrent insert won the race for these hosts
        for entry in &new_hosts {
            if previous.iter().any(|existing| existing.host == entry.host) {
                close_host(entry);
            }
        }
    }

    /// Makes the pool contain exactly `hosts`.
    /// New hosts are connected, hosts that vanished have their connections closed and
    /// hosts that remain keep their connections so that conversations pinned to them survive.
    pub async fn reconcile(&self, hosts: &[HostDescription]) -> Vec<HostFailure> {
        let target: HashSet<&HostDescription> = hosts.iter().collect();
        let current = self.hosts();
        let added: Vec<HostDescription> = hosts
            .iter()
            .filter(|host| !current.contains(host))
            .unique()
            .cloned()
            .collect();

        let mut failures = vec![];
        let mut connected = vec![];
        let results = join_all(added.into_iter().map(|host| async move {
            let result = self.connect_host(host.clone()).await;
            (host, result)
        }))
        .await;
        for (host, result) in results {
            match result {
                Ok(entry) => connected.push(entry),
                Err(error) => failures.push(HostFailure { host, error }),
            }
        }

        let removed: Vec<Arc<HostConnections>> = {
            let previous = self.hosts.rcu(|current| {
                current
                    .iter()
                    .filter(|entry| target.contains(&entry.host))
                    .cloned()
                    .collect::<Vec<_>>()
            });
            previous
                .iter()
                .filter(|entry| !target.contains(&entry.host))
                .cloned()
                .collect()
        };
        for entry in &removed {
            tracing::info!("host {} is no longer part of the deployment, closing its connections", entry.host);
            close_host(entry);
        }

        if !connected.is_empty() {
            tracing::info!(
                "host {} joined the deployment",
                connected.iter().map(|entry| &entry.host).join(", ")
            );
            self.insert(connected);
        }
        failures
    }

    /// The next connection in rotation among the hosts accepted by `filter`.
    /// Connected connections are preferred, a disconnected one is only returned when nothing is connected
    /// and will reconnect when it is used.
    pub fn select(&self, filter: impl Fn(&HostDescription) -> bool) -> Option<Arc<ArangoConnection>> {
        let hosts = self.hosts.load();
        let candidates: Vec<&Arc<ArangoConnection>> = hosts
            .iter()
            .filter(|entry| filter(&entry.host))
            .flat_map(|entry| entry.connections.iter())
            .collect();
        self.rotate(&candidates)
    }

    /// The next connection to `host` in rotation, preferring connected ones.
    pub fn connection_to(&self, host: &HostDescription) -> Option<Arc<ArangoConnection>> {
        self.select(|candidate| candidate == host)
    }

    /// The host a new conversation is pinned to, the next in rotation preferring hosts with a live connection.
    pub fn next_host(&self) -> Option<HostDescription> {
        self.select(|_| true)
            .map(|connection| connection.host().clone())
    }

    fn rotate(&self, candidates: &[&Arc<ArangoConnection>]) -> Option<Arc<ArangoConnection>> {
        if candidates.is_empty() {
            return None;
        }
        let start = self.rotation.fetch_add(1, Ordering::Relaxed);
        let ordered = (0..candidates.len()).map(|i| candidates[(start + i) % candidates.len()]);
        ordered
            .clone()
            .find(|connection| connection.is_connected())
            .or_else(|| ordered.clone().find(|connection| connection.state() != ConnectionState::Closed))
            .cloned()
    }

    pub fn close(&self) {
        let hosts = self.hosts.swap(Arc::new(vec![]));
        for entry in hosts.iter() {
            close_host(entry);
        }
    }
}

fn close_host(entry: &HostConnections) {
    for connection in &entry.connections {
        connection.close();
    }
}

/// Routes requests to connections according to the deployment topology.
pub enum ConnectionPool {
    /// Single server and cluster deployments, every host can serve every request.
    RoundRobin(HostPool),
    /// Only the leader serves requests, followers only serve dirty reads.
    ActiveFailover(ActiveFailoverPool),
}

impl ConnectionPool {
    pub fn new(topology: Topology, factory: ConnectionFactory, connections_per_host: usize) -> Self {
        let hosts = HostPool::new(factory, connections_per_host);
        match topology {
            Topology::SingleServer | Topology::Cluster => ConnectionPool::RoundRobin(hosts),
            Topology::ActiveFailover => ConnectionPool::ActiveFailover(ActiveFailoverPool::new(hosts)),
        }
    }

    pub fn host_pool(&self) -> &HostPool {
        match self {
            ConnectionPool::RoundRobin(hosts) => hosts,
            ConnectionPool::ActiveFailover(pool) => pool.host_pool(),
        }
    }

    pub fn hosts(&self) -> Vec<HostDescription> {
        self.host_pool().hosts()
    }

    pub fn connections_by_host(&self) -> HashMap<HostDescription, Vec<Arc<ArangoConnection>>> {
        self.host_pool().connections_by_host()
    }

    pub fn leader(&self) -> Option<HostDescription> {
        match self {
            ConnectionPool::RoundRobin(_) => None,
            ConnectionPool::ActiveFailover(pool) => pool.leader(),
        }
    }

    /// Picks the connection for a request.
    ///
    /// Returns `Ok(None)` when no connection is usable, hosts in `excluded` already failed this request.
    /// A required conversation whose host is unusable fails with [`CommunicationError::HostNotAvailable`].
    pub fn select(
        &self,
        conversation: Option<&Conversation>,
        dirty_read: bool,
        excluded: &HashSet<HostDescription>,
    ) -> Result<Option<Arc<ArangoConnection>>, CommunicationError> {
        if let Some(conversation) = conversation {
            let host = conversation.host();
            if conversation.is_required() {
                return match self.host_pool().connection_to(host) {
                    Some(connection) if !excluded.contains(host) => Ok(Some(connection)),
                    _ => Err(CommunicationError::HostNotAvailable(host.clone())),
                };
            }
            if !excluded.contains(host) {
                if let Some(connection) = self.host_pool().connection_to(host) {
                    return Ok(Some(connection));
                }
            }
        }

        Ok(match self {
            ConnectionPool::RoundRobin(hosts) => hosts.select(|host| !excluded.contains(host)),
            ConnectionPool::ActiveFailover(pool) => pool.select(dirty_read, excluded),
        })
    }

    /// The host a new conversation is pinned to.
    pub fn conversation_host(&self) -> Option<HostDescription> {
        match self {
            ConnectionPool::RoundRobin(hosts) => hosts.next_host(),
            ConnectionPool::ActiveFailover(pool) => pool.leader(),
        }
    }

    pub fn close(&self) {
        self.host_pool().close();
    }
}
