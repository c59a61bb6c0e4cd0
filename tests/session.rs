// OPCUA for Rust
// SPDX-License-Identifier: MPL-2.0
// Copyright (C) 2017-2024 Adam Lock

//! Session lifecycle and service conversation tests against the in-process server.

mod common;

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use opcua_client::{
    filter_by_security_mode, filter_by_security_policy, sort_by_security_level, AllowAllValidator,
    Client, ClientBuilder, EndpointDescription, Error, IdentityToken, MessageSecurityMode,
    SecurityPolicy, ServiceRequest, SessionState,
};

use common::{init_logging, TestConnector, TestIdentity, TestServer};

/// A user service that the in-process server answers by echoing the payload.
struct Echo(Vec<u8>);

impl ServiceRequest for Echo {
    type Response = Vec<u8>;

    fn encode(&self) -> Result<Vec<u8>, Error> {
        Ok(self.0.clone())
    }

    fn decode_response(payload: &[u8]) -> Result<Self::Response, Error> {
        Ok(payload.to_vec())
    }
}

fn client_for(server: &Arc<TestServer>) -> Client {
    ClientBuilder::new()
        .session_name("integration test session")
        .request_timeout_ms(5000)
        .identity(Arc::new(TestIdentity))
        .certificate_validator(Arc::new(AllowAllValidator))
        .transport_connector(Arc::new(TestConnector::new(server.clone())))
        .client()
        .unwrap()
}

#[tokio::test]
async fn connect_and_call() {
    init_logging();
    let server = TestServer::new(SecurityPolicy::None, MessageSecurityMode::None);
    let client = client_for(&server);

    let (session, event_loop) = client.new_session_from_endpoint(server.endpoint(), IdentityToken::Anonymous);
    let handle = event_loop.spawn();
    assert!(session.wait_for_connection().await);
    assert_eq!(session.state(), SessionState::Active);
    assert_ne!(session.session_id(), 0);

    let response = session.call(&Echo(b"hello".to_vec())).await.unwrap();
    assert_eq!(response, b"hello".to_vec());

    session.close(true).await.unwrap();
    assert_eq!(session.state(), SessionState::Closed);
    assert!(handle.await.unwrap().is_ok());
}

#[tokio::test]
async fn secured_session_roundtrip() {
    init_logging();
    let server = TestServer::new(
        SecurityPolicy::Basic256Sha256,
        MessageSecurityMode::SignAndEncrypt,
    );
    let client = client_for(&server);

    let (session, event_loop) = client.new_session_from_endpoint(
        server.endpoint(),
        IdentityToken::UserName("sample".to_string(), "sample-password".to_string()),
    );
    let _handle = event_loop.spawn();
    assert!(session.wait_for_connection().await);

    let response = session.call(&Echo(b"secret request".to_vec())).await.unwrap();
    assert_eq!(response, b"secret request".to_vec());

    session.close(true).await.unwrap();
}

#[tokio::test]
async fn responses_complete_out_of_send_order() {
    init_logging();
    let server = TestServer::new(SecurityPolicy::None, MessageSecurityMode::None);
    server.reorder_pairs.store(true, Ordering::Relaxed);
    let client = client_for(&server);

    let (session, event_loop) = client.new_session_from_endpoint(server.endpoint(), IdentityToken::Anonymous);
    let _handle = event_loop.spawn();
    assert!(session.wait_for_connection().await);

    // The server answers these in reverse order; correlation by request id must still
    // hand each caller its own response.
    let first_request = Echo(b"first".to_vec());
    let second_request = Echo(b"second".to_vec());
    let (first, second) = tokio::join!(
        session.call(&first_request),
        session.call(&second_request),
    );
    assert_eq!(first.unwrap(), b"first".to_vec());
    assert_eq!(second.unwrap(), b"second".to_vec());

    session.close(true).await.unwrap();
}

#[tokio::test]
async fn unanswered_request_times_out() {
    init_logging();
    let server = TestServer::new(SecurityPolicy::None, MessageSecurityMode::None);
    let client = client_for(&server);

    let (session, event_loop) = client.new_session_from_endpoint(server.endpoint(), IdentityToken::Anonymous);
    let _handle = event_loop.spawn();
    assert!(session.wait_for_connection().await);

    server.swallow_user_requests.store(true, Ordering::Relaxed);
    let result = session
        .call_with_timeout(&Echo(b"lost".to_vec()), Duration::from_millis(100))
        .await;
    assert_eq!(result, Err(Error::RequestTimeout));

    // The session survives a timed out request
    server.swallow_user_requests.store(false, Ordering::Relaxed);
    assert_eq!(session.state(), SessionState::Active);
    let response = session.call(&Echo(b"retry".to_vec())).await.unwrap();
    assert_eq!(response, b"retry".to_vec());

    session.close(true).await.unwrap();
}

#[tokio::test]
async fn call_before_connect_fails_without_io() {
    init_logging();
    let server = TestServer::new(SecurityPolicy::None, MessageSecurityMode::None);
    let client = client_for(&server);

    // The event loop is never polled, so the session stays in Created
    let (session, _event_loop) = client.new_session_from_endpoint(server.endpoint(), IdentityToken::Anonymous);
    assert_eq!(session.state(), SessionState::Created);
    let result = session.call(&Echo(b"too early".to_vec())).await;
    assert_eq!(result, Err(Error::SessionNotActive));
}

#[tokio::test]
async fn close_is_idempotent() {
    init_logging();
    let server = TestServer::new(SecurityPolicy::None, MessageSecurityMode::None);
    let client = client_for(&server);

    let (session, event_loop) = client.new_session_from_endpoint(server.endpoint(), IdentityToken::Anonymous);
    let handle = event_loop.spawn();
    assert!(session.wait_for_connection().await);

    let close_task = session.close_async(true);
    assert!(session.close(true).await.is_ok());
    assert!(close_task.await.unwrap().is_ok());
    assert!(session.close(true).await.is_ok());
    assert_eq!(session.state(), SessionState::Closed);
    assert_eq!(server.close_delete_subscriptions(), Some(true));
    assert!(handle.await.unwrap().is_ok());

    // Calls after close never reach the network
    let result = session.call(&Echo(b"too late".to_vec())).await;
    assert_eq!(result, Err(Error::SessionNotActive));
}

#[tokio::test]
async fn close_carries_the_delete_subscriptions_flag() {
    init_logging();
    let server = TestServer::new(SecurityPolicy::None, MessageSecurityMode::None);
    let client = client_for(&server);

    let (session, event_loop) = client.new_session_from_endpoint(server.endpoint(), IdentityToken::Anonymous);
    let _handle = event_loop.spawn();
    assert!(session.wait_for_connection().await);
    assert_eq!(server.close_delete_subscriptions(), None);

    session.close(false).await.unwrap();
    assert_eq!(server.close_delete_subscriptions(), Some(false));
}

#[tokio::test]
async fn stale_response_is_discarded() {
    init_logging();
    let server = TestServer::new(SecurityPolicy::None, MessageSecurityMode::None);
    server.reorder_pairs.store(true, Ordering::Relaxed);
    let client = client_for(&server);

    let (session, event_loop) = client.new_session_from_endpoint(server.endpoint(), IdentityToken::Anonymous);
    let _handle = event_loop.spawn();
    assert!(session.wait_for_connection().await);

    // The server holds this request back until the next one arrives; by then the
    // caller has timed out and its pending entry is gone.
    let abandoned = session
        .call_with_timeout(&Echo(b"abandoned".to_vec()), Duration::from_millis(100))
        .await;
    assert_eq!(abandoned, Err(Error::RequestTimeout));

    // This call flushes both responses. The answer to the timed out request matches
    // no pending entry and is dropped without disturbing this caller.
    let response = session.call(&Echo(b"current".to_vec())).await.unwrap();
    assert_eq!(response, b"current".to_vec());

    // The channel stays healthy afterwards
    server.reorder_pairs.store(false, Ordering::Relaxed);
    let response = session.call(&Echo(b"after".to_vec())).await.unwrap();
    assert_eq!(response, b"after".to_vec());

    session.close(true).await.unwrap();
}

#[tokio::test]
async fn abandoned_call_releases_its_request_slot() {
    init_logging();
    let server = TestServer::new(SecurityPolicy::None, MessageSecurityMode::None);
    let client = ClientBuilder::new()
        .session_name("integration test session")
        .request_timeout_ms(5000)
        .max_inflight_messages(1)
        .identity(Arc::new(TestIdentity))
        .certificate_validator(Arc::new(AllowAllValidator))
        .transport_connector(Arc::new(TestConnector::new(server.clone())))
        .client()
        .unwrap();

    let (session, event_loop) = client.new_session_from_endpoint(server.endpoint(), IdentityToken::Anonymous);
    let _handle = event_loop.spawn();
    assert!(session.wait_for_connection().await);

    // Abandon an unanswered call by dropping its future mid flight
    server.swallow_user_requests.store(true, Ordering::Relaxed);
    let request = Echo(b"abandoned".to_vec());
    let abandoned = tokio::time::timeout(
        Duration::from_millis(50),
        session.call_with_timeout(&request, Duration::from_millis(400)),
    )
    .await;
    assert!(abandoned.is_err());

    // With a single request slot, this call can only go out once the abandoned
    // entry has been reaped.
    server.swallow_user_requests.store(false, Ordering::Relaxed);
    let response = session.call(&Echo(b"next".to_vec())).await.unwrap();
    assert_eq!(response, b"next".to_vec());

    session.close(true).await.unwrap();
}

#[tokio::test]
async fn token_renewal_is_transparent() {
    init_logging();
    let server = TestServer::new(SecurityPolicy::None, MessageSecurityMode::None);
    server.token_lifetime_ms.store(200, Ordering::Relaxed);
    let client = client_for(&server);

    let (session, event_loop) = client.new_session_from_endpoint(server.endpoint(), IdentityToken::Anonymous);
    let _handle = event_loop.spawn();
    assert!(session.wait_for_connection().await);

    // Let the token age past its renewal threshold, then keep calling
    for _ in 0..3 {
        tokio::time::sleep(Duration::from_millis(180)).await;
        let response = session.call(&Echo(b"still here".to_vec())).await.unwrap();
        assert_eq!(response, b"still here".to_vec());
    }
    assert!(server.renew_count() >= 1);
    assert_eq!(session.state(), SessionState::Active);

    session.close(true).await.unwrap();
}

#[tokio::test]
async fn discovery_ranks_endpoints() {
    init_logging();
    let endpoints: Vec<EndpointDescription> = [10u8, 50, 30]
        .iter()
        .map(|&level| EndpointDescription {
            endpoint_url: format!("opc.tcp://testserver:4855/{}", level),
            transport_profile_uri: "uatcp".to_string(),
            security_policy: SecurityPolicy::None,
            security_mode: MessageSecurityMode::None,
            security_level: level,
            server_certificate: Vec::new(),
        })
        .collect();
    let server = TestServer::with_endpoints(
        SecurityPolicy::None,
        MessageSecurityMode::None,
        Vec::new(),
        endpoints,
    );
    let client = client_for(&server);

    let discovered = client
        .get_server_endpoints("opc.tcp://testserver:4855/")
        .await
        .unwrap();
    assert_eq!(discovered.len(), 3);

    let matching = filter_by_security_policy(
        &filter_by_security_mode(&discovered, MessageSecurityMode::None),
        SecurityPolicy::None,
    );
    let ranked = sort_by_security_level(&matching);
    assert_eq!(
        ranked.iter().map(|e| e.security_level).collect::<Vec<_>>(),
        vec![10, 30, 50]
    );

    // new_session_from_url picks the highest ranked endpoint and connects
    let (session, event_loop) = client
        .new_session_from_url(
            "opc.tcp://testserver:4855/",
            SecurityPolicy::None,
            MessageSecurityMode::None,
            IdentityToken::Anonymous,
        )
        .await
        .unwrap();
    let _handle = event_loop.spawn();
    assert!(session.wait_for_connection().await);
    session.close(true).await.unwrap();
}

#[tokio::test]
async fn no_matching_endpoint_is_a_discovery_error() {
    init_logging();
    let server = TestServer::new(SecurityPolicy::None, MessageSecurityMode::None);
    let client = client_for(&server);

    let result = client
        .new_session_from_url(
            "opc.tcp://testserver:4855/",
            SecurityPolicy::Basic256Sha256,
            MessageSecurityMode::SignAndEncrypt,
            IdentityToken::Anonymous,
        )
        .await;
    assert!(matches!(result, Err(Error::Discovery(_))));
}
