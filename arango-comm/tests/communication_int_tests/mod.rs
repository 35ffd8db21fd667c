use crate::{document_request, read_request};
use arango_comm::auth::AuthenticationMethod;
use arango_comm::communication::conversation::ConversationLevel;
use arango_comm::communication::ArangoCommunication;
use arango_comm::config::{ArangoProtocol, CommunicationConfig, ContentType, Topology};
use arango_comm::error::{CommunicationError, ConnectionError};
use arango_comm::host::HostDescription;
use futures::future::join_all;
use pretty_assertions::assert_eq;
use rstest::rstest;
use std::time::Duration;
use test_helpers::mock_arangodb::{MockArangoDb, MOCK_HOST_HEADER};
use test_helpers::test_tracing::setup_tracing_subscriber_for_test;
use test_helpers::unreachable_host;

pub fn config(mocks: &[&MockArangoDb], topology: Topology) -> CommunicationConfig {
    let mut config = CommunicationConfig::new(mocks.iter().map(|mock| mock.host()).collect(), topology);
    config.protocol = mocks[0].protocol();
    config.timeout_ms = 2000;
    config.retries = 3;
    config
}

fn served_by(mock: &MockArangoDb) -> usize {
    mock.user_requests().len()
}

#[rstest]
#[case::vst(ArangoProtocol::Vst)]
#[case::http(ArangoProtocol::Http)]
#[tokio::test]
async fn round_robin_across_hosts(#[case] protocol: ArangoProtocol) {
    setup_tracing_subscriber_for_test();
    let a = MockArangoDb::start(protocol).await;
    let b = MockArangoDb::start(protocol).await;
    let c = MockArangoDb::start(protocol).await;
    let communication = ArangoCommunication::create(config(&[&a, &b, &c], Topology::Cluster))
        .await
        .unwrap();
    assert_eq!(communication.connection_pool().hosts().len(), 3);

    for _ in 0..9 {
        let response = communication.execute(&document_request("{}")).await.unwrap();
        assert_eq!(response.response_code, 200);
    }
    assert_eq!(served_by(&a), 3);
    assert_eq!(served_by(&b), 3);
    assert_eq!(served_by(&c), 3);

    communication.close();
}

#[rstest]
#[case::single_server(Topology::SingleServer)]
#[case::cluster(Topology::Cluster)]
#[case::active_failover(Topology::ActiveFailover)]
#[tokio::test]
async fn fail_fast_after_close(#[case] topology: Topology) {
    setup_tracing_subscriber_for_test();
    let mock = MockArangoDb::start(ArangoProtocol::Vst).await;
    let communication = ArangoCommunication::create(config(&[&mock], topology))
        .await
        .unwrap();
    let connections = communication.connection_pool().connections_by_host();

    communication.close();
    communication.close();
    assert!(communication.is_closed());
    assert!(communication.connection_pool().hosts().is_empty());
    for connection in connections.values().flatten() {
        assert!(!connection.is_connected());
    }

    assert!(matches!(
        communication.execute(&read_request()).await,
        Err(CommunicationError::Closed)
    ));
    assert!(matches!(
        communication
            .require_conversation(ConversationLevel::Preferred)
            .await,
        Err(CommunicationError::Closed)
    ));
    assert_eq!(served_by(&mock), 0);
}

#[tokio::test]
async fn clones_share_the_closed_state() {
    setup_tracing_subscriber_for_test();
    let mock = MockArangoDb::start(ArangoProtocol::Vst).await;
    let communication = ArangoCommunication::create(config(&[&mock], Topology::SingleServer))
        .await
        .unwrap();
    let clone = communication.clone();
    assert_eq!(clone.execute(&read_request()).await.unwrap().response_code, 200);

    communication.close();
    assert!(matches!(
        clone.execute(&read_request()).await,
        Err(CommunicationError::Closed)
    ));
}

#[tokio::test]
async fn bootstrap_without_reachable_hosts() {
    setup_tracing_subscriber_for_test();
    let mut config = CommunicationConfig::new(vec![unreachable_host()], Topology::SingleServer);
    config.retries = 0;
    config.timeout_ms = 1000;

    let err = ArangoCommunication::create(config).await.unwrap_err();
    match &err {
        CommunicationError::NoHostsAvailable { failures } => {
            assert_eq!(failures.len(), 1);
            assert!(matches!(failures[0].error, ConnectionError::Connect(_)));
        }
        err => panic!("unexpected error {err:?}"),
    }
}

#[tokio::test]
async fn bootstrap_skips_unreachable_hosts() {
    setup_tracing_subscriber_for_test();
    let mock = MockArangoDb::start(ArangoProtocol::Vst).await;
    let mut config = config(&[&mock], Topology::Cluster);
    config.hosts.push(unreachable_host());
    config.hosts.push(mock.host());
    config.retries = 1;

    let communication = ArangoCommunication::create(config).await.unwrap();
    assert_eq!(communication.connection_pool().hosts(), vec![mock.host()]);
    assert_eq!(communication.execute(&read_request()).await.unwrap().response_code, 200);
}

#[tokio::test]
async fn bootstrap_stops_retrying_once_a_host_is_reachable() {
    setup_tracing_subscriber_for_test();
    let mock = MockArangoDb::start(ArangoProtocol::Vst).await;
    let mut config = config(&[&mock], Topology::Cluster);
    config.hosts.insert(0, unreachable_host());
    // every retry round backs off at least 50ms, so 40 rounds would take over 2s
    config.retries = 40;

    let start = std::time::Instant::now();
    let communication = ArangoCommunication::create(config).await.unwrap();
    assert!(start.elapsed() < Duration::from_secs(1), "{:?}", start.elapsed());
    assert_eq!(communication.connection_pool().hosts(), vec![mock.host()]);
}

#[tokio::test]
async fn bootstrap_authentication_rejected() {
    setup_tracing_subscriber_for_test();
    let mock = MockArangoDb::start_with(
        ArangoProtocol::Vst,
        Some(AuthenticationMethod::basic("root", "secret")),
        true,
    )
    .await;
    let mut config = config(&[&mock], Topology::SingleServer);
    config.authentication = Some(AuthenticationMethod::basic("root", "guess"));

    assert!(matches!(
        ArangoCommunication::create(config).await,
        Err(CommunicationError::Connection(ConnectionError::Authentication {
            response_code: 401,
            ..
        }))
    ));
}

#[tokio::test]
async fn retries_on_another_host() {
    setup_tracing_subscriber_for_test();
    let a = MockArangoDb::start(ArangoProtocol::Vst).await;
    let b = MockArangoDb::start(ArangoProtocol::Vst).await;
    let communication = ArangoCommunication::create(config(&[&a, &b], Topology::Cluster))
        .await
        .unwrap();

    a.stop();
    for _ in 0..6 {
        let response = communication.execute(&read_request()).await.unwrap();
        assert_eq!(response.header(MOCK_HOST_HEADER), Some(b.host().to_string().as_str()));
    }
    assert_eq!(served_by(&a), 0);
    assert_eq!(served_by(&b), 6);
}

#[tokio::test]
async fn retries_exhausted() {
    setup_tracing_subscriber_for_test();
    let mock = MockArangoDb::start(ArangoProtocol::Vst).await;
    let mut config = config(&[&mock], Topology::SingleServer);
    config.timeout_ms = 200;
    config.retries = 1;
    let communication = ArangoCommunication::create(config).await.unwrap();

    mock.set_stalled(true);
    let err = communication.execute(&read_request()).await.unwrap_err();
    match &err {
        CommunicationError::NoHostsAvailable { failures } => assert_eq!(failures.len(), 2),
        err => panic!("unexpected error {err:?}"),
    }
    assert!(matches!(err.last_cause(), Some(ConnectionError::Timeout(_))));
}

#[tokio::test]
async fn dirty_read_header() {
    setup_tracing_subscriber_for_test();
    let mock = MockArangoDb::start(ArangoProtocol::Vst).await;
    let mut config = config(&[&mock], Topology::SingleServer);
    config.dirty_reads = true;
    let communication = ArangoCommunication::create(config).await.unwrap();

    communication.execute(&read_request()).await.unwrap();
    communication.execute(&document_request("{}")).await.unwrap();
    communication
        .execute(&document_request("{}").with_dirty_read(true))
        .await
        .unwrap();

    let dirty: Vec<bool> = mock
        .user_requests()
        .iter()
        .map(|request| request.is_dirty_read())
        .collect();
    assert_eq!(dirty, vec![true, false, true]);
}

#[tokio::test]
async fn concurrent_requests_across_hosts() {
    setup_tracing_subscriber_for_test();
    let a = MockArangoDb::start(ArangoProtocol::Vst).await;
    let b = MockArangoDb::start(ArangoProtocol::Vst).await;
    let mut config = config(&[&a, &b], Topology::Cluster);
    config.connections_per_host = 2;
    let communication = ArangoCommunication::create(config).await.unwrap();
    assert!(communication
        .connection_pool()
        .connections_by_host()
        .values()
        .all(|connections| connections.len() == 2));

    let handles: Vec<_> = (0..40)
        .map(|i| {
            let communication = communication.clone();
            tokio::spawn(async move {
                let body = format!("order {i}");
                let response = communication
                    .execute(&document_request("").with_body(body.clone()))
                    .await
                    .unwrap();
                assert_eq!(response.body, body.as_bytes());
            })
        })
        .collect();
    for result in join_all(handles).await {
        result.unwrap();
    }
    assert_eq!(served_by(&a), 20);
    assert_eq!(served_by(&b), 20);
}

#[tokio::test]
async fn required_conversation() {
    setup_tracing_subscriber_for_test();
    let a = MockArangoDb::start(ArangoProtocol::Vst).await;
    let b = MockArangoDb::start(ArangoProtocol::Vst).await;
    let communication = ArangoCommunication::create(config(&[&a, &b], Topology::Cluster))
        .await
        .unwrap();

    let guard = communication
        .require_conversation(ConversationLevel::Required)
        .await
        .unwrap();
    let host = guard.conversation().host().clone();
    for _ in 0..6 {
        let response = communication.execute(&read_request()).await.unwrap();
        assert_eq!(response.header(MOCK_HOST_HEADER), Some(host.to_string().as_str()));
    }

    assert!(matches!(
        communication
            .require_conversation(ConversationLevel::Preferred)
            .await,
        Err(CommunicationError::ConversationAlreadyBound)
    ));

    let (pinned, other) = if host == a.host() { (&a, &b) } else { (&b, &a) };
    pinned.stop();
    assert!(matches!(
        communication.execute(&read_request()).await,
        Err(CommunicationError::HostNotAvailable(unavailable)) if unavailable == host
    ));
    assert_eq!(served_by(other), 0);

    guard.release().unwrap();
    guard.release().unwrap();
    assert!(communication.conversation_manager().is_empty());
    let response = communication.execute(&read_request()).await.unwrap();
    assert_eq!(response.header(MOCK_HOST_HEADER), Some(other.host().to_string().as_str()));
}

#[tokio::test]
async fn preferred_conversation_falls_back() {
    setup_tracing_subscriber_for_test();
    let a = MockArangoDb::start(ArangoProtocol::Vst).await;
    let b = MockArangoDb::start(ArangoProtocol::Vst).await;
    let communication = ArangoCommunication::create(config(&[&a, &b], Topology::Cluster))
        .await
        .unwrap();

    let guard = communication
        .require_conversation(ConversationLevel::Preferred)
        .await
        .unwrap();
    let host = guard.conversation().host().clone();
    let (pinned, other) = if host == a.host() { (&a, &b) } else { (&b, &a) };

    pinned.stop();
    let response = communication.execute(&read_request()).await.unwrap();
    assert_eq!(response.header(MOCK_HOST_HEADER), Some(other.host().to_string().as_str()));
    guard.release().unwrap();
}

#[tokio::test]
async fn conversation_released_by_another_task() {
    setup_tracing_subscriber_for_test();
    let mock = MockArangoDb::start(ArangoProtocol::Vst).await;
    let communication = ArangoCommunication::create(config(&[&mock], Topology::SingleServer))
        .await
        .unwrap();

    let guard = communication
        .require_conversation(ConversationLevel::Required)
        .await
        .unwrap();
    let (guard, result) = tokio::spawn(async move {
        let result = guard.release();
        (guard, result)
    })
    .await
    .unwrap();
    assert!(matches!(result, Err(CommunicationError::ConversationOwnership)));
    assert_eq!(communication.conversation_manager().len(), 1);

    guard.release().unwrap();
    assert!(communication.conversation_manager().is_empty());
}

#[tokio::test]
async fn explicit_conversation_on_request() {
    setup_tracing_subscriber_for_test();
    let a = MockArangoDb::start(ArangoProtocol::Vst).await;
    let b = MockArangoDb::start(ArangoProtocol::Vst).await;
    let communication = ArangoCommunication::create(config(&[&a, &b], Topology::Cluster))
        .await
        .unwrap();

    let conversation = arango_comm::communication::conversation::Conversation::new(
        b.host(),
        ConversationLevel::Required,
    );
    for _ in 0..4 {
        communication
            .execute(&read_request().with_conversation(conversation.clone()))
            .await
            .unwrap();
    }
    assert_eq!(served_by(&a), 0);
    assert_eq!(served_by(&b), 4);
}

#[rstest]
#[case::vst_vpack(ArangoProtocol::Vst, ContentType::Vpack)]
#[case::http_json(ArangoProtocol::Http, ContentType::Json)]
#[tokio::test]
async fn host_list_acquisition(#[case] protocol: ArangoProtocol, #[case] content_type: ContentType) {
    setup_tracing_subscriber_for_test();
    let a = MockArangoDb::start(protocol).await;
    let b = MockArangoDb::start(protocol).await;
    for mock in [&a, &b] {
        mock.set_endpoints(vec![a.host(), b.host()]);
    }

    let mut config = config(&[&a], Topology::Cluster);
    config.content_type = content_type;
    config.acquire_host_list = true;
    let communication = ArangoCommunication::create(config).await.unwrap();
    let mut hosts = communication.connection_pool().hosts();
    hosts.sort_by_key(HostDescription::port);
    let mut expected = vec![a.host(), b.host()];
    expected.sort_by_key(HostDescription::port);
    assert_eq!(hosts, expected);

    for mock in [&a, &b] {
        mock.set_endpoints(vec![b.host()]);
    }
    communication.refresh_host_list().await.unwrap();
    assert_eq!(communication.connection_pool().hosts(), vec![b.host()]);

    for _ in 0..4 {
        communication.execute(&read_request()).await.unwrap();
    }
    assert_eq!(served_by(&a), 0);
    assert_eq!(served_by(&b), 4);
}

#[tokio::test]
async fn periodic_host_list_refresh() {
    setup_tracing_subscriber_for_test();
    let a = MockArangoDb::start(ArangoProtocol::Vst).await;
    let b = MockArangoDb::start(ArangoProtocol::Vst).await;
    a.set_endpoints(vec![a.host()]);

    let mut config = config(&[&a], Topology::Cluster);
    config.acquire_host_list = true;
    config.acquire_host_list_interval_ms = 50;
    let communication = ArangoCommunication::create(config).await.unwrap();
    assert_eq!(communication.connection_pool().hosts(), vec![a.host()]);

    a.set_endpoints(vec![a.host(), b.host()]);
    b.set_endpoints(vec![a.host(), b.host()]);
    test_helpers::wait_for(|| communication.connection_pool().hosts().len() == 2)
        .await
        .unwrap();

    communication.close();
    tokio::time::sleep(Duration::from_millis(50)).await;
    let requests = a.recorded_requests().len();
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(a.recorded_requests().len(), requests);
}
