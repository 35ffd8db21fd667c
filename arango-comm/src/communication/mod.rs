//! The entry point of the crate, routes requests across the hosts of a deployment.

use crate::config::CommunicationConfig;
use crate::connection::ConnectionFactory;
use crate::error::{bullet_list_of_host_failures, CommunicationError, ConnectionError, HostFailure};
use crate::host::HostDescription;
use crate::request::{ArangoRequest, ArangoResponse, ALLOW_DIRTY_READ_HEADER, LEADER_ENDPOINT_HEADER};
use anyhow::anyhow;
use conversation::{Conversation, ConversationGuard, ConversationLevel, ConversationManager};
use futures::future::join_all;
use itertools::Itertools;
use pool::{ConnectionPool, HostConnections};
use rand::Rng;
use std::borrow::Cow;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::watch;
use tracing::Instrument;

pub mod active_failover;
pub mod conversation;
pub mod endpoints;
pub mod pool;

struct Inner {
    config: CommunicationConfig,
    pool: ConnectionPool,
    conversations: Arc<ConversationManager>,
    closed: AtomicBool,
    shutdown_tx: watch::Sender<bool>,
}

/// Executes requests against an ArangoDB deployment.
///
/// Cheap to clone, every clone shares the same connections.
#[derive(Clone)]
pub struct ArangoCommunication {
    inner: Arc<Inner>,
}

impl ArangoCommunication {
    /// Connects to every configured host, acquires the host list and detects the leader as configured.
    pub async fn create(config: CommunicationConfig) -> Result<Self, CommunicationError> {
        config.validate().map_err(CommunicationError::Config)?;
        let factory = ConnectionFactory::new(
            config.connection_config(),
            config.authentication.clone(),
        );
        let pool = ConnectionPool::new(config.topology, factory, config.connections_per_host);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let communication = ArangoCommunication {
            inner: Arc::new(Inner {
                config,
                pool,
                conversations: ConversationManager::new(),
                closed: AtomicBool::new(false),
                shutdown_tx,
            }),
        };

        if let Err(err) = communication.bootstrap().await {
            communication.close();
            return Err(err);
        }

        if communication.inner.config.acquire_host_list {
            tokio::spawn(
                refresh_host_list_task(Arc::downgrade(&communication.inner), shutdown_rx)
                    .in_current_span(),
            );
        }
        Ok(communication)
    }

    async fn bootstrap(&self) -> Result<(), CommunicationError> {
        let config = &self.inner.config;
        let mut pending: Vec<HostDescription> = config.hosts.iter().unique().cloned().collect();
        let mut failures: Vec<HostFailure> = vec![];

        for round in 0..=config.retries {
            if round > 0 {
                let backoff = Duration::from_millis(rand::rng().random_range(50..250));
                tracing::debug!("retrying {} unreachable hosts in {backoff:?}", pending.len());
                tokio::time::sleep(backoff).await;
            }

            let pool = self.inner.pool.host_pool();
            let results = join_all(pending.iter().map(|host| async move {
                (host.clone(), pool.connect_host(host.clone()).await)
            }))
            .await;

            let mut connected: Vec<HostConnections> = vec![];
            pending.clear();
            failures.clear();
            for (host, result) in results {
                match result {
                    Ok(entry) => connected.push(entry),
                    Err(error @ ConnectionError::Authentication { .. }) => {
                        self.inner.pool.host_pool().insert(connected);
                        return Err(error.into());
                    }
                    Err(error) => {
                        pending.push(host.clone());
                        failures.push(HostFailure { host, error });
                    }
                }
            }
            pool.insert(connected);
            // the retry rounds only matter while nothing is reachable
            if pending.is_empty() || !pool.hosts().is_empty() {
                break;
            }
        }

        if self.inner.pool.hosts().is_empty() {
            return Err(CommunicationError::no_hosts_available(failures));
        }
        if !failures.is_empty() {
            tracing::warn!(
                "A successful connection to a host was made but attempts to connect to these hosts failed:{}",
                bullet_list_of_host_failures(failures.iter())
            );
        }

        if config.acquire_host_list {
            if let Err(err) = self.refresh_host_list().await {
                tracing::warn!("failed to acquire the host list, continuing with the configured hosts: {err:#}");
            }
        }

        if let ConnectionPool::ActiveFailover(pool) = &self.inner.pool {
            if pool.leader().is_none() {
                pool.detect_leader().await?;
            }
        }
        Ok(())
    }

    /// Fetches the current host list from the deployment and makes the pool match it.
    pub async fn refresh_host_list(&self) -> anyhow::Result<()> {
        self.inner.refresh_host_list().await
    }

    /// Sends `request`, retrying transient failures on other hosts until the retry budget is used up.
    pub async fn execute(&self, request: &ArangoRequest) -> Result<ArangoResponse, CommunicationError> {
        let inner = &self.inner;
        if inner.closed.load(Ordering::Acquire) {
            return Err(CommunicationError::Closed);
        }

        let conversation = request
            .conversation
            .clone()
            .or_else(|| inner.conversations.current());
        let dirty_read = request.allow_dirty_read
            || (inner.config.dirty_reads && request.request_type.is_read());
        let request = if dirty_read {
            let mut request = request.clone();
            request
                .header_params
                .insert(ALLOW_DIRTY_READ_HEADER.to_owned(), "true".to_owned());
            Cow::Owned(request)
        } else {
            Cow::Borrowed(request)
        };

        let mut excluded: HashSet<HostDescription> = HashSet::new();
        let mut failures: Vec<HostFailure> = vec![];
        for attempt in 0..=inner.config.retries {
            if inner.closed.load(Ordering::Acquire) {
                return Err(CommunicationError::Closed);
            }
            let Some(connection) = inner
                .select_connection(conversation.as_ref(), dirty_read, &mut excluded)
                .await?
            else {
                break;
            };
            let host = connection.host().clone();

            match connection.execute(&request).await {
                Ok(response) => {
                    if let (ConnectionPool::ActiveFailover(pool), false) = (&inner.pool, dirty_read) {
                        if let Some(leader) = redirected_leader(&response) {
                            failures.push(HostFailure {
                                host: host.clone(),
                                error: ConnectionError::NotLeader,
                            });
                            if conversation.as_ref().is_some_and(Conversation::is_required) {
                                return Err(CommunicationError::HostNotAvailable(host));
                            }
                            // a conversation pinned to a follower falls back to the leader for this request
                            excluded.insert(host.clone());
                            if leader == host {
                                tracing::debug!("{host} redirected to itself, detecting the leader again");
                                pool.clear_leader();
                            } else {
                                tracing::debug!("{host} is not the leader, following redirect to {leader}");
                                if let Err(error) = pool.follow_leader(leader.clone()).await {
                                    failures.push(HostFailure { host: leader, error });
                                }
                            }
                            continue;
                        }
                    }
                    return Ok(response);
                }
                Err(error) if !error.is_transient() => return Err(error.into()),
                Err(error) => {
                    tracing::debug!("attempt {} against {host} failed: {error}", attempt + 1);
                    if conversation.as_ref().is_some_and(Conversation::is_required) {
                        return Err(CommunicationError::HostNotAvailable(host));
                    }
                    if let ConnectionPool::ActiveFailover(pool) = &inner.pool {
                        if pool.leader().as_ref() == Some(&host) {
                            pool.clear_leader();
                        }
                    }
                    excluded.insert(host.clone());
                    failures.push(HostFailure { host, error });
                }
            }
        }
        Err(CommunicationError::no_hosts_available(failures))
    }

    /// Pins every request of the calling task to a single host until the returned guard is released.
    pub async fn require_conversation(
        &self,
        level: ConversationLevel,
    ) -> Result<ConversationGuard, CommunicationError> {
        let inner = &self.inner;
        if inner.closed.load(Ordering::Acquire) {
            return Err(CommunicationError::Closed);
        }
        let host = match inner.pool.conversation_host() {
            Some(host) => host,
            None => match &inner.pool {
                ConnectionPool::ActiveFailover(pool) => pool.detect_leader().await?,
                ConnectionPool::RoundRobin(_) => {
                    return Err(CommunicationError::no_hosts_available(vec![]))
                }
            },
        };
        inner
            .conversations
            .bind(Conversation::new(host, level))
    }

    pub fn conversation_manager(&self) -> &Arc<ConversationManager> {
        &self.inner.conversations
    }

    pub fn connection_pool(&self) -> &ConnectionPool {
        &self.inner.pool
    }

    pub fn config(&self) -> &CommunicationConfig {
        &self.inner.config
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    /// Stops background tasks and closes every connection. Closing twice does nothing.
    pub fn close(&self) {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.inner.shutdown_tx.send(true).ok();
        self.inner.pool.close();
        tracing::debug!("communication closed");
    }
}

impl std::fmt::Debug for ArangoCommunication {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ArangoCommunication")
            .field("topology", &self.inner.config.topology)
            .field("hosts", &self.inner.pool.hosts())
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl Inner {
    async fn select_connection(
        &self,
        conversation: Option<&Conversation>,
        dirty_read: bool,
        excluded: &mut HashSet<HostDescription>,
    ) -> Result<Option<Arc<crate::connection::ArangoConnection>>, CommunicationError> {
        if let Some(connection) = self.pool.select(conversation, dirty_read, excluded)? {
            return Ok(Some(connection));
        }
        if !excluded.is_empty() {
            // every candidate failed once, start over
            excluded.clear();
            if let Some(connection) = self.pool.select(conversation, dirty_read, excluded)? {
                return Ok(Some(connection));
            }
        }
        if let (ConnectionPool::ActiveFailover(pool), false) = (&self.pool, dirty_read) {
            if pool.detect_leader().await.is_ok() {
                return self.pool.select(conversation, dirty_read, excluded);
            }
        }
        Ok(None)
    }

    async fn refresh_host_list(&self) -> anyhow::Result<()> {
        // any host can answer, an active failover leader may not be known yet
        let connection = self
            .pool
            .host_pool()
            .select(|_| true)
            .ok_or_else(|| anyhow!("no connection available to acquire the host list"))?;
        let response = connection.execute(&endpoints::endpoints_request()).await?;
        let hosts = endpoints::parse_endpoints(&response, self.config.content_type)?;

        let failures = self.pool.host_pool().reconcile(&hosts).await;
        if !failures.is_empty() {
            tracing::warn!(
                "failed to connect to hosts from the acquired host list, they will be retried on the next refresh:{}",
                bullet_list_of_host_failures(failures.iter())
            );
        }

        if let ConnectionPool::ActiveFailover(pool) = &self.pool {
            let leader_vanished = pool
                .leader()
                .is_some_and(|leader| !self.pool.host_pool().contains(&leader));
            if leader_vanished || pool.leader().is_none() {
                pool.detect_leader().await?;
            }
        }
        Ok(())
    }
}

/// A follower of an active failover deployment answers 503 and names the leader.
fn redirected_leader(response: &ArangoResponse) -> Option<HostDescription> {
    if response.response_code != 503 {
        return None;
    }
    let endpoint = response.header(LEADER_ENDPOINT_HEADER)?;
    match HostDescription::from_endpoint(endpoint) {
        Ok(leader) => Some(leader),
        Err(err) => {
            tracing::warn!("ignoring invalid leader endpoint {endpoint:?}: {err:#}");
            None
        }
    }
}

async fn refresh_host_list_task(inner: Weak<Inner>, mut shutdown_rx: watch::Receiver<bool>) {
    let interval = match inner.upgrade() {
        Some(inner) => inner.config.acquire_host_list_interval(),
        None => return,
    };
    loop {
        tokio::select! {
            biased;
            _ = shutdown_rx.changed() => return,
            _ = tokio::time::sleep(interval) => {}
        }
        // the communication was dropped without being closed
        let Some(inner) = inner.upgrade() else {
            return;
        };
        if let Err(err) = inner.refresh_host_list().await {
            tracing::warn!("failed to refresh the host list: {err:#}");
        }
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        self.shutdown_tx.send(true).ok();
        self.pool.close();
    }
}
