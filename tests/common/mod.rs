// OPCUA for Rust
// SPDX-License-Identifier: MPL-2.0
// Copyright (C) 2017-2024 Adam Lock

//! In-memory transport and a scripted server for exercising the client end to end
//! without sockets.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use futures::FutureExt;
use parking_lot::Mutex;
use tokio::sync::{mpsc, watch};

use opcua_client::comms::message::{
    ErrorMessage, Frame, FrameHeader, GetEndpointsResponse, MessageType, OpenChannelRequest,
    OpenChannelResponse, SecurityTokenRequestType, ServiceFault, FaultCode, ServiceMessage,
    ServicePayload,
};
use opcua_client::comms::secure_channel::{Role, SecureChannel};
use opcua_client::crypto::random_bytes;
use opcua_client::error::Error;
use opcua_client::{
    EndpointDescription, IdentityProvider, MessageSecurityMode, SecurityPolicy, TransportConnector,
    TransportReader, TransportWriter,
};

pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// An identity with a throwaway certificate; the proof signature is not a real
/// asymmetric signature, the test server does not verify it.
pub struct TestIdentity;

impl IdentityProvider for TestIdentity {
    fn application_name(&self) -> &str {
        "Test Client"
    }

    fn application_uri(&self) -> &str {
        "urn:TestClient"
    }

    fn client_certificate(&self) -> &[u8] {
        b"test-client-certificate"
    }

    fn sign(&self, data: &[u8]) -> Result<Vec<u8>, Error> {
        let mut signature = b"signed:".to_vec();
        signature.extend_from_slice(data);
        Ok(signature)
    }
}

pub struct PipeReader {
    rx: mpsc::Receiver<Vec<u8>>,
}

impl TransportReader for PipeReader {
    fn receive(&mut self) -> BoxFuture<'_, Result<Vec<u8>, Error>> {
        async move {
            self.rx
                .recv()
                .await
                .ok_or_else(|| Error::transport("pipe closed"))
        }
        .boxed()
    }
}

pub struct PipeWriter {
    tx: Option<mpsc::Sender<Vec<u8>>>,
}

impl TransportWriter for PipeWriter {
    fn send<'a>(&'a mut self, message: &'a [u8]) -> BoxFuture<'a, Result<(), Error>> {
        async move {
            match &self.tx {
                Some(tx) => tx
                    .send(message.to_vec())
                    .await
                    .map_err(|_| Error::transport("pipe closed")),
                None => Err(Error::transport("pipe closed")),
            }
        }
        .boxed()
    }

    fn close(&mut self) -> BoxFuture<'_, ()> {
        self.tx = None;
        async {}.boxed()
    }
}

/// A scripted in-process server speaking the client's frame protocol, with knobs for
/// misbehavior.
pub struct TestServer {
    policy: SecurityPolicy,
    mode: MessageSecurityMode,
    pub certificate: Vec<u8>,
    endpoints: Vec<EndpointDescription>,
    pub token_lifetime_ms: AtomicU32,
    /// Refuse new transport connections entirely.
    pub refuse_connections: AtomicBool,
    /// Answer any activate session request with a fault.
    pub reject_activation: AtomicBool,
    /// Never answer user service requests.
    pub swallow_user_requests: AtomicBool,
    /// Buffer user service requests in pairs and answer each pair in reverse order.
    pub reorder_pairs: AtomicBool,
    /// Send every user service response twice, byte for byte.
    pub replay_responses: AtomicBool,
    renew_count: AtomicU32,
    connect_attempts: AtomicU32,
    /// The delete subscriptions flag from the most recent close session request.
    close_delete_subscriptions: Mutex<Option<bool>>,
    next_channel_id: AtomicU32,
    next_session_id: AtomicU32,
    /// Sessions survive connection loss so a client can reactivate, keyed by auth token.
    sessions: Mutex<HashMap<Vec<u8>, u32>>,
    epoch: watch::Sender<u32>,
}

impl TestServer {
    pub fn new(policy: SecurityPolicy, mode: MessageSecurityMode) -> Arc<Self> {
        let certificate = if policy == SecurityPolicy::None {
            Vec::new()
        } else {
            b"test-server-certificate".to_vec()
        };
        let endpoints = vec![EndpointDescription {
            endpoint_url: "opc.tcp://testserver:4855/".to_string(),
            transport_profile_uri: "uatcp".to_string(),
            security_policy: policy,
            security_mode: mode,
            security_level: 1,
            server_certificate: certificate.clone(),
        }];
        Self::with_endpoints(policy, mode, certificate, endpoints)
    }

    pub fn with_endpoints(
        policy: SecurityPolicy,
        mode: MessageSecurityMode,
        certificate: Vec<u8>,
        endpoints: Vec<EndpointDescription>,
    ) -> Arc<Self> {
        let (epoch, _) = watch::channel(0);
        Arc::new(Self {
            policy,
            mode,
            certificate,
            endpoints,
            token_lifetime_ms: AtomicU32::new(60_000),
            refuse_connections: AtomicBool::new(false),
            reject_activation: AtomicBool::new(false),
            swallow_user_requests: AtomicBool::new(false),
            reorder_pairs: AtomicBool::new(false),
            replay_responses: AtomicBool::new(false),
            renew_count: AtomicU32::new(0),
            connect_attempts: AtomicU32::new(0),
            close_delete_subscriptions: Mutex::new(None),
            next_channel_id: AtomicU32::new(0),
            next_session_id: AtomicU32::new(0),
            sessions: Mutex::new(HashMap::new()),
            epoch,
        })
    }

    pub fn endpoint(&self) -> EndpointDescription {
        self.endpoints[0].clone()
    }

    /// Drops every open connection, as if the network went away.
    pub fn kill_connections(&self) {
        self.epoch.send_modify(|e| *e += 1);
    }

    pub fn renew_count(&self) -> u32 {
        self.renew_count.load(Ordering::Relaxed)
    }

    /// Transport connection attempts made so far, refused ones included.
    pub fn connect_attempts(&self) -> u32 {
        self.connect_attempts.load(Ordering::Relaxed)
    }

    pub fn close_delete_subscriptions(&self) -> Option<bool> {
        *self.close_delete_subscriptions.lock()
    }

    async fn send_frame(
        &self,
        channel: &mut SecureChannel,
        tx: &mpsc::Sender<Vec<u8>>,
        message_type: MessageType,
        request_id: u32,
        body: Vec<u8>,
    ) -> Vec<u8> {
        let sequence_number = channel.next_sequence_number();
        let frame = Frame {
            header: FrameHeader::new(
                message_type,
                channel.channel_id(),
                channel.token_id(),
                sequence_number,
                request_id,
            ),
            body,
        };
        let secured = channel.apply_security(&frame).unwrap();
        let _ = tx.send(secured.clone()).await;
        secured
    }

    async fn run_connection(
        self: Arc<Self>,
        mut rx: mpsc::Receiver<Vec<u8>>,
        tx: mpsc::Sender<Vec<u8>>,
    ) {
        let mut channel = SecureChannel::new(Role::Server, self.policy, self.mode);
        let mut epoch_rx = self.epoch.subscribe();
        let mut reorder_stash: Option<(u32, Vec<u8>)> = None;

        loop {
            let bytes = tokio::select! {
                b = rx.recv() => match b {
                    Some(b) => b,
                    None => break,
                },
                _ = epoch_rx.changed() => break,
            };
            let Ok(frame) = channel.verify_and_remove_security(&bytes) else {
                break;
            };

            match frame.header.message_type {
                MessageType::GetEndpoints => {
                    let body = GetEndpointsResponse {
                        endpoints: self.endpoints.clone(),
                    }
                    .encode();
                    self.send_frame(
                        &mut channel,
                        &tx,
                        MessageType::GetEndpointsResponse,
                        frame.header.request_id,
                        body,
                    )
                    .await;
                }
                MessageType::OpenSecureChannel => {
                    let request = OpenChannelRequest::decode(&frame.body).unwrap();
                    let (channel_id, token_id) = match request.request_type {
                        SecurityTokenRequestType::Issue => {
                            (self.next_channel_id.fetch_add(1, Ordering::Relaxed) + 1, 1)
                        }
                        SecurityTokenRequestType::Renew => {
                            self.renew_count.fetch_add(1, Ordering::Relaxed);
                            (channel.channel_id(), channel.token_id() + 1)
                        }
                    };
                    let lifetime_ms = self.token_lifetime_ms.load(Ordering::Relaxed);
                    let server_nonce = self.policy.random_nonce();
                    channel.set_local_nonce(&server_nonce);
                    channel.set_remote_nonce(&request.client_nonce);
                    channel.set_security_token(
                        channel_id,
                        token_id,
                        Duration::from_millis(lifetime_ms as u64),
                    );
                    channel.derive_keys();

                    let body = OpenChannelResponse {
                        channel_id,
                        token_id,
                        revised_lifetime_ms: lifetime_ms,
                        server_nonce,
                        server_certificate: self.certificate.clone(),
                    }
                    .encode();
                    self.send_frame(
                        &mut channel,
                        &tx,
                        MessageType::OpenSecureChannelResponse,
                        frame.header.request_id,
                        body,
                    )
                    .await;
                }
                MessageType::CloseSecureChannel => break,
                MessageType::Message => {
                    let message = ServiceMessage::decode(&frame.body).unwrap();
                    let reply = match message.payload {
                        ServicePayload::CreateSession(_) => {
                            let session_id =
                                self.next_session_id.fetch_add(1, Ordering::Relaxed) + 1;
                            let auth_token = random_bytes(16);
                            self.sessions.lock().insert(auth_token.clone(), session_id);
                            Some(ServicePayload::CreateSessionResponse(
                                opcua_client::comms::message::CreateSessionResponse {
                                    session_id,
                                    auth_token,
                                    server_nonce: random_bytes(32),
                                    server_certificate: self.certificate.clone(),
                                    revised_session_timeout_ms: 60_000,
                                },
                            ))
                        }
                        ServicePayload::ActivateSession(_) => {
                            if self.reject_activation.load(Ordering::Relaxed) {
                                Some(ServicePayload::Fault(ServiceFault {
                                    code: FaultCode::ActivationRejected,
                                    reason: "activation rejected by test server".to_string(),
                                }))
                            } else if self.sessions.lock().contains_key(&message.auth_token) {
                                Some(ServicePayload::ActivateSessionResponse)
                            } else {
                                Some(ServicePayload::Fault(ServiceFault {
                                    code: FaultCode::ActivationRejected,
                                    reason: "unknown session".to_string(),
                                }))
                            }
                        }
                        ServicePayload::CloseSession {
                            delete_subscriptions,
                        } => {
                            *self.close_delete_subscriptions.lock() = Some(delete_subscriptions);
                            self.sessions.lock().remove(&message.auth_token);
                            Some(ServicePayload::CloseSessionResponse)
                        }
                        ServicePayload::UserService(payload) => {
                            if self.swallow_user_requests.load(Ordering::Relaxed) {
                                None
                            } else if self.reorder_pairs.load(Ordering::Relaxed) {
                                match reorder_stash.take() {
                                    None => {
                                        reorder_stash = Some((frame.header.request_id, payload));
                                        None
                                    }
                                    Some((stashed_id, stashed_payload)) => {
                                        // Answer the later request first
                                        self.send_user_response(
                                            &mut channel,
                                            &tx,
                                            frame.header.request_id,
                                            payload,
                                        )
                                        .await;
                                        self.send_user_response(
                                            &mut channel,
                                            &tx,
                                            stashed_id,
                                            stashed_payload,
                                        )
                                        .await;
                                        None
                                    }
                                }
                            } else {
                                let secured = self
                                    .send_user_response(
                                        &mut channel,
                                        &tx,
                                        frame.header.request_id,
                                        payload,
                                    )
                                    .await;
                                if self.replay_responses.load(Ordering::Relaxed) {
                                    let _ = tx.send(secured).await;
                                }
                                None
                            }
                        }
                        other => {
                            let _ = self
                                .send_frame(
                                    &mut channel,
                                    &tx,
                                    MessageType::Error,
                                    frame.header.request_id,
                                    ErrorMessage {
                                        reason: format!("unexpected payload {:?}", other),
                                    }
                                    .encode(),
                                )
                                .await;
                            None
                        }
                    };

                    if let Some(payload) = reply {
                        let body = ServiceMessage {
                            auth_token: Vec::new(),
                            payload,
                        }
                        .encode();
                        self.send_frame(
                            &mut channel,
                            &tx,
                            MessageType::Message,
                            frame.header.request_id,
                            body,
                        )
                        .await;
                    }
                }
                _ => break,
            }
        }
    }

    async fn send_user_response(
        &self,
        channel: &mut SecureChannel,
        tx: &mpsc::Sender<Vec<u8>>,
        request_id: u32,
        payload: Vec<u8>,
    ) -> Vec<u8> {
        let body = ServiceMessage {
            auth_token: Vec::new(),
            payload: ServicePayload::UserServiceResponse(payload),
        }
        .encode();
        self.send_frame(channel, tx, MessageType::Message, request_id, body)
            .await
    }
}

pub struct TestConnector {
    server: Arc<TestServer>,
}

impl TestConnector {
    pub fn new(server: Arc<TestServer>) -> Self {
        Self { server }
    }
}

impl TransportConnector for TestConnector {
    fn connect<'a>(
        &'a self,
        _endpoint_url: &'a str,
    ) -> BoxFuture<'a, Result<(Box<dyn TransportReader>, Box<dyn TransportWriter>), Error>> {
        async move {
            self.server.connect_attempts.fetch_add(1, Ordering::Relaxed);
            if self.server.refuse_connections.load(Ordering::Relaxed) {
                return Err(Error::transport("connection refused"));
            }
            let (client_tx, server_rx) = mpsc::channel(16);
            let (server_tx, client_rx) = mpsc::channel(16);
            tokio::spawn(self.server.clone().run_connection(server_rx, server_tx));
            Ok((
                Box::new(PipeReader { rx: client_rx }) as Box<dyn TransportReader>,
                Box::new(PipeWriter {
                    tx: Some(client_tx),
                }) as Box<dyn TransportWriter>,
            ))
        }
        .boxed()
    }
}
