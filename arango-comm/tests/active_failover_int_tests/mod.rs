use crate::communication_int_tests::config;
use crate::{document_request, read_request};
use arango_comm::communication::conversation::ConversationLevel;
use arango_comm::communication::ArangoCommunication;
use arango_comm::config::{ArangoProtocol, Topology};
use arango_comm::error::{CommunicationError, ConnectionError};
use pretty_assertions::assert_eq;
use rstest::rstest;
use test_helpers::mock_arangodb::{MockArangoDb, MOCK_HOST_HEADER};
use test_helpers::test_tracing::setup_tracing_subscriber_for_test;

struct Deployment {
    a: MockArangoDb,
    b: MockArangoDb,
    c: MockArangoDb,
}

/// Three hosts with `b` as the leader.
async fn deployment(protocol: ArangoProtocol) -> Deployment {
    Deployment {
        a: MockArangoDb::start_with(protocol, None, false).await,
        b: MockArangoDb::start_with(protocol, None, true).await,
        c: MockArangoDb::start_with(protocol, None, false).await,
    }
}

impl Deployment {
    async fn communication(&self) -> ArangoCommunication {
        ArangoCommunication::create(config(&[&self.a, &self.b, &self.c], Topology::ActiveFailover))
            .await
            .unwrap()
    }

    fn served(&self) -> [usize; 3] {
        [&self.a, &self.b, &self.c].map(|mock| mock.user_requests().len())
    }
}

#[rstest]
#[case::vst(ArangoProtocol::Vst)]
#[case::http(ArangoProtocol::Http)]
#[tokio::test]
async fn requests_go_to_the_leader(#[case] protocol: ArangoProtocol) {
    setup_tracing_subscriber_for_test();
    let deployment = deployment(protocol).await;
    let communication = deployment.communication().await;
    assert_eq!(communication.connection_pool().leader(), Some(deployment.b.host()));

    for _ in 0..10 {
        let response = communication.execute(&document_request("{}")).await.unwrap();
        assert_eq!(response.response_code, 200);
    }
    assert_eq!(deployment.served(), [0, 10, 0]);
}

#[tokio::test]
async fn dirty_reads_rotate_across_every_host() {
    setup_tracing_subscriber_for_test();
    let deployment = deployment(ArangoProtocol::Vst).await;
    let communication = deployment.communication().await;

    for _ in 0..30 {
        let response = communication
            .execute(&read_request().with_dirty_read(true))
            .await
            .unwrap();
        assert_eq!(response.response_code, 200);
    }
    assert_eq!(deployment.served(), [10, 10, 10]);
    assert!([&deployment.a, &deployment.b, &deployment.c]
        .iter()
        .flat_map(|mock| mock.user_requests())
        .all(|request| request.is_dirty_read()));
}

#[tokio::test]
async fn follows_leader_redirect() {
    setup_tracing_subscriber_for_test();
    let deployment = deployment(ArangoProtocol::Vst).await;
    let communication = deployment.communication().await;

    deployment.b.set_leader(false);
    deployment.b.set_leader_endpoint(Some(deployment.a.host()));
    deployment.a.set_leader(true);

    let response = communication.execute(&document_request("{}")).await.unwrap();
    assert_eq!(response.response_code, 200);
    assert_eq!(
        response.header(MOCK_HOST_HEADER),
        Some(deployment.a.host().to_string().as_str())
    );
    assert_eq!(communication.connection_pool().leader(), Some(deployment.a.host()));
    assert_eq!(deployment.served(), [1, 1, 0]);

    communication.execute(&document_request("{}")).await.unwrap();
    assert_eq!(deployment.served(), [2, 1, 0]);
}

#[tokio::test]
async fn redirect_to_itself_detects_the_leader_again() {
    setup_tracing_subscriber_for_test();
    let deployment = deployment(ArangoProtocol::Vst).await;
    let communication = deployment.communication().await;

    deployment.b.set_leader(false);
    deployment.b.set_leader_endpoint(Some(deployment.b.host()));
    deployment.c.set_leader(true);

    let response = communication.execute(&document_request("{}")).await.unwrap();
    assert_eq!(
        response.header(MOCK_HOST_HEADER),
        Some(deployment.c.host().to_string().as_str())
    );
    assert_eq!(communication.connection_pool().leader(), Some(deployment.c.host()));
    assert_eq!(deployment.served(), [0, 1, 1]);
}

#[tokio::test]
async fn redirect_to_itself_without_a_leader_reports_the_host() {
    setup_tracing_subscriber_for_test();
    let deployment = deployment(ArangoProtocol::Vst).await;
    let communication = deployment.communication().await;

    deployment.b.set_leader(false);
    deployment.b.set_leader_endpoint(Some(deployment.b.host()));

    let err = communication.execute(&document_request("{}")).await.unwrap_err();
    match &err {
        CommunicationError::NoHostsAvailable { failures } => assert!(!failures.is_empty()),
        err => panic!("unexpected error {err:?}"),
    }
    assert!(matches!(err.last_cause(), Some(ConnectionError::NotLeader)));
    assert_eq!(deployment.served(), [0, 1, 0]);
}

#[tokio::test]
async fn preferred_conversation_on_a_demoted_leader_falls_back_to_the_new_leader() {
    setup_tracing_subscriber_for_test();
    let deployment = deployment(ArangoProtocol::Vst).await;
    let communication = deployment.communication().await;
    let guard = communication
        .require_conversation(ConversationLevel::Preferred)
        .await
        .unwrap();
    assert_eq!(guard.conversation().host(), &deployment.b.host());

    deployment.b.set_leader(false);
    deployment.b.set_leader_endpoint(Some(deployment.a.host()));
    deployment.a.set_leader(true);

    let response = communication.execute(&document_request("{}")).await.unwrap();
    assert_eq!(
        response.header(MOCK_HOST_HEADER),
        Some(deployment.a.host().to_string().as_str())
    );
    assert_eq!(communication.connection_pool().leader(), Some(deployment.a.host()));
    assert_eq!(deployment.served(), [1, 1, 0]);
    guard.release().unwrap();
}

#[tokio::test]
async fn required_conversation_on_a_demoted_leader_is_not_available() {
    setup_tracing_subscriber_for_test();
    let deployment = deployment(ArangoProtocol::Vst).await;
    let communication = deployment.communication().await;
    let guard = communication
        .require_conversation(ConversationLevel::Required)
        .await
        .unwrap();

    deployment.b.set_leader(false);
    deployment.b.set_leader_endpoint(Some(deployment.a.host()));
    deployment.a.set_leader(true);

    let err = communication.execute(&document_request("{}")).await.unwrap_err();
    assert!(
        matches!(&err, CommunicationError::HostNotAvailable(host) if host == &deployment.b.host()),
        "{err:?}"
    );
    assert_eq!(deployment.served(), [0, 1, 0]);
    guard.release().unwrap();
}

#[tokio::test]
async fn detects_a_new_leader_when_the_leader_goes_down() {
    setup_tracing_subscriber_for_test();
    let deployment = deployment(ArangoProtocol::Vst).await;
    let communication = deployment.communication().await;
    communication.execute(&document_request("{}")).await.unwrap();

    deployment.b.stop();
    deployment.c.set_leader(true);

    let response = communication.execute(&document_request("{}")).await.unwrap();
    assert_eq!(response.response_code, 200);
    assert_eq!(communication.connection_pool().leader(), Some(deployment.c.host()));
    assert_eq!(deployment.served(), [0, 1, 1]);
}

#[tokio::test]
async fn bootstrap_without_a_leader() {
    setup_tracing_subscriber_for_test();
    let a = MockArangoDb::start_with(ArangoProtocol::Vst, None, false).await;
    let b = MockArangoDb::start_with(ArangoProtocol::Vst, None, false).await;

    let err = ArangoCommunication::create(config(&[&a, &b], Topology::ActiveFailover))
        .await
        .unwrap_err();
    match err {
        CommunicationError::NoHostsAvailable { failures } => assert_eq!(failures.len(), 2),
        err => panic!("unexpected error {err:?}"),
    }
}

#[tokio::test]
async fn conversation_is_pinned_to_the_leader() {
    setup_tracing_subscriber_for_test();
    let deployment = deployment(ArangoProtocol::Vst).await;
    let communication = deployment.communication().await;

    let guard = communication
        .require_conversation(ConversationLevel::Required)
        .await
        .unwrap();
    assert_eq!(guard.conversation().host(), &deployment.b.host());
    for _ in 0..3 {
        communication.execute(&read_request().with_dirty_read(true)).await.unwrap();
    }
    assert_eq!(deployment.served(), [0, 3, 0]);
    guard.release().unwrap();
}
