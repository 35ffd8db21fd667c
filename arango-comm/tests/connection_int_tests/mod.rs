use crate::{document_request, read_request};
use arango_comm::auth::AuthenticationMethod;
use arango_comm::config::{ArangoProtocol, ConnectionConfig};
use arango_comm::connection::{ConnectionFactory, ConnectionState};
use arango_comm::error::ConnectionError;
use futures::future::join_all;
use pretty_assertions::assert_eq;
use rstest::rstest;
use std::time::Duration;
use test_helpers::mock_arangodb::{MockArangoDb, MOCK_HOST_HEADER};
use test_helpers::test_tracing::setup_tracing_subscriber_for_test;
use test_helpers::{unreachable_host, wait_for};

fn factory(protocol: ArangoProtocol, authentication: Option<AuthenticationMethod>) -> ConnectionFactory {
    ConnectionFactory::new(
        ConnectionConfig {
            protocol,
            timeout: Duration::from_secs(2),
            connect_timeout: Duration::from_secs(2),
            ..ConnectionConfig::default()
        },
        authentication,
    )
}

#[rstest]
#[case::vst(ArangoProtocol::Vst)]
#[case::http(ArangoProtocol::Http)]
#[tokio::test]
async fn round_trip(#[case] protocol: ArangoProtocol) {
    setup_tracing_subscriber_for_test();
    let mock = MockArangoDb::start(protocol).await;
    let connection = factory(protocol, None).create(mock.host()).await.unwrap();
    assert!(connection.is_connected());

    let response = connection
        .execute(&document_request(r#"{"item":"apple"}"#).with_query_param("waitForSync", "true"))
        .await
        .unwrap();
    assert_eq!(response.response_code, 200);
    assert_eq!(&response.body[..], br#"{"item":"apple"}"#);
    assert_eq!(response.header("x-mock-path"), Some("/_api/document/orders"));
    assert_eq!(response.header(MOCK_HOST_HEADER), Some(mock.host().to_string().as_str()));

    let recorded = mock.user_requests();
    assert_eq!(recorded.len(), 1);
    assert_eq!(recorded[0].database, "shop");
    assert_eq!(recorded[0].method, "POST");
}

#[rstest]
#[case::vst(ArangoProtocol::Vst)]
#[case::http(ArangoProtocol::Http)]
#[tokio::test(flavor = "multi_thread")]
async fn concurrent_requests_share_a_connection(#[case] protocol: ArangoProtocol) {
    setup_tracing_subscriber_for_test();
    let mock = MockArangoDb::start(protocol).await;
    mock.set_delay(Duration::from_millis(5));
    let connection = factory(protocol, None).create(mock.host()).await.unwrap();

    let bodies: Vec<String> = (0..50).map(|i| format!("order {i}")).collect();
    let responses = join_all(bodies.iter().map(|body| {
        let connection = connection.clone();
        let request = document_request("").with_body(body.clone());
        async move { connection.execute(&request).await }
    }))
    .await;

    for (body, response) in bodies.iter().zip(responses) {
        assert_eq!(response.unwrap().body, body.as_bytes());
    }
    assert_eq!(mock.connection_count(), 1);
}

#[tokio::test]
async fn vst_messages_larger_than_a_chunk() {
    setup_tracing_subscriber_for_test();
    let mock = MockArangoDb::start(ArangoProtocol::Vst).await;
    let factory = ConnectionFactory::new(
        ConnectionConfig {
            chunk_size: 100,
            ..ConnectionConfig::default()
        },
        None,
    );
    let connection = factory.create(mock.host()).await.unwrap();

    let body = "0123456789".repeat(1000);
    let response = connection
        .execute(&document_request("").with_body(body.clone()))
        .await
        .unwrap();
    assert_eq!(response.body, body.as_bytes());
}

#[rstest]
#[case::vst(ArangoProtocol::Vst)]
#[case::http(ArangoProtocol::Http)]
#[tokio::test]
async fn authentication(#[case] protocol: ArangoProtocol) {
    setup_tracing_subscriber_for_test();
    let mock = MockArangoDb::start_with(
        protocol,
        Some(AuthenticationMethod::basic("root", "secret")),
        true,
    )
    .await;

    let accepted = factory(protocol, Some(AuthenticationMethod::basic("root", "secret")))
        .create(mock.host())
        .await
        .unwrap();
    assert_eq!(accepted.execute(&read_request()).await.unwrap().response_code, 200);

    let rejected = factory(protocol, Some(AuthenticationMethod::basic("root", "wrong")))
        .create(mock.host())
        .await
        .unwrap_err();
    assert!(matches!(
        rejected,
        ConnectionError::Authentication {
            response_code: 401,
            ..
        }
    ));
    assert!(!rejected.is_transient());
}

#[tokio::test]
async fn vst_jwt_authentication() {
    setup_tracing_subscriber_for_test();
    let mock = MockArangoDb::start_with(
        ArangoProtocol::Vst,
        Some(AuthenticationMethod::jwt("root", "header.payload.signature")),
        true,
    )
    .await;

    let connection = factory(
        ArangoProtocol::Vst,
        Some(AuthenticationMethod::jwt("root", "header.payload.signature")),
    )
    .create(mock.host())
    .await
    .unwrap();
    assert_eq!(connection.execute(&read_request()).await.unwrap().response_code, 200);
}

#[rstest]
#[case::vst(ArangoProtocol::Vst)]
#[case::http(ArangoProtocol::Http)]
#[tokio::test]
async fn hard_cut_fails_in_flight_requests_then_reconnects(#[case] protocol: ArangoProtocol) {
    setup_tracing_subscriber_for_test();
    let mock = MockArangoDb::start(protocol).await;
    let connection = factory(protocol, None).create(mock.host()).await.unwrap();
    connection.execute(&read_request()).await.unwrap();

    mock.set_delay(Duration::from_millis(500));
    let in_flight = tokio::spawn({
        let connection = connection.clone();
        async move { connection.execute(&read_request()).await }
    });
    wait_for(|| mock.recorded_requests().len() == 2).await.unwrap();
    mock.cut_connections();

    let err = in_flight.await.unwrap().unwrap_err();
    assert!(matches!(err, ConnectionError::OtherSideClosed), "{err:?}");
    assert!(!connection.is_connected());
    assert!(connection.state() == ConnectionState::Disconnected);

    mock.set_delay(Duration::ZERO);
    assert_eq!(connection.execute(&read_request()).await.unwrap().response_code, 200);
    assert!(connection.is_connected());
    assert_eq!(mock.connection_count(), 2);
}

#[rstest]
#[case::vst(ArangoProtocol::Vst)]
#[case::http(ArangoProtocol::Http)]
#[tokio::test]
async fn stalled_transport_times_out_then_reconnects(#[case] protocol: ArangoProtocol) {
    setup_tracing_subscriber_for_test();
    let mock = MockArangoDb::start(protocol).await;
    let factory = ConnectionFactory::new(
        ConnectionConfig {
            protocol,
            timeout: Duration::from_millis(200),
            ..ConnectionConfig::default()
        },
        None,
    );
    let connection = factory.create(mock.host()).await.unwrap();
    connection.execute(&read_request()).await.unwrap();

    mock.set_stalled(true);
    let err = connection.execute(&read_request()).await.unwrap_err();
    assert!(matches!(err, ConnectionError::Timeout(_)), "{err:?}");
    assert!(err.is_transient());
    assert!(!connection.is_connected());
    assert!(connection.state() == ConnectionState::Disconnected);

    mock.set_stalled(false);
    let response = connection.execute(&read_request()).await.unwrap();
    assert_eq!(response.response_code, 200);
    assert!(connection.is_connected());
    assert_eq!(mock.connection_count(), 2);
}

#[rstest]
#[case::vst(ArangoProtocol::Vst)]
#[case::http(ArangoProtocol::Http)]
#[tokio::test]
async fn close(#[case] protocol: ArangoProtocol) {
    setup_tracing_subscriber_for_test();
    let mock = MockArangoDb::start(protocol).await;
    let connection = factory(protocol, None).create(mock.host()).await.unwrap();

    mock.set_delay(Duration::from_millis(500));
    let in_flight = tokio::spawn({
        let connection = connection.clone();
        async move { connection.execute(&read_request()).await }
    });
    wait_for(|| !mock.recorded_requests().is_empty()).await.unwrap();

    connection.close();
    connection.close();
    assert!(connection.state() == ConnectionState::Closed);
    assert!(matches!(
        in_flight.await.unwrap(),
        Err(ConnectionError::Closed)
    ));
    assert!(matches!(
        connection.execute(&read_request()).await,
        Err(ConnectionError::Closed)
    ));
}

#[tokio::test]
async fn connect_to_unreachable_host() {
    setup_tracing_subscriber_for_test();
    let connection = factory(ArangoProtocol::Vst, None).build(unreachable_host());
    assert!(connection.state() == ConnectionState::Created);

    let err = connection.connect().await.unwrap_err();
    assert!(matches!(err, ConnectionError::Connect(_)), "{err:?}");
    assert!(err.is_transient());
    assert!(connection.state() == ConnectionState::Disconnected);
}
