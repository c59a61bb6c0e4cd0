// OPCUA for Rust
// SPDX-License-Identifier: MPL-2.0
// Copyright (C) 2017-2024 Adam Lock

//! The secure channel layer: negotiation of the channel and its security token, and the
//! message pump that secures, sequences and correlates the traffic flowing over it.

mod pump;
mod state;

pub(crate) use state::{Request, RequestSend};
pub use pump::{ChannelEventLoop, TransportPollResult};

use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwapOption;
use parking_lot::RwLock;

use crate::comms::message::{Frame, MessageType, SecurityTokenRequestType};
use crate::comms::secure_channel::{Role, SecureChannel};
use crate::crypto::CertificateValidator;
use crate::endpoint::{EndpointDescription, SecurityPolicy};
use crate::error::Error;
use crate::transport::TransportConnector;

use pump::ConversationState;
use state::SecureChannelState;

/// Limits and lifetimes for one secure channel.
#[derive(Debug, Clone)]
pub struct ChannelConfig {
    /// Maximum number of requests awaiting a response at once. Further sends wait for a
    /// slot.
    pub max_inflight: usize,
    /// The token lifetime requested in open and renew requests. The server may revise it
    /// downwards.
    pub requested_token_lifetime: Duration,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            max_inflight: 5,
            requested_token_lifetime: Duration::from_millis(60_000),
        }
    }
}

/// Wrapper around an open secure channel.
///
/// Requests are submitted through [`send`](AsyncSecureChannel::send) from any task; the
/// [`ChannelEventLoop`] returned by [`connect_no_retry`](AsyncSecureChannel::connect_no_retry)
/// must be polled for any traffic to flow. The security token is renewed lazily: the
/// first send after the renewal threshold performs the renewal handshake before the
/// request itself goes out.
pub struct AsyncSecureChannel {
    endpoint: EndpointDescription,
    connector: Arc<dyn TransportConnector>,
    config: ChannelConfig,
    pub(crate) secure_channel: Arc<RwLock<SecureChannel>>,
    state: SecureChannelState,
    issue_channel_lock: tokio::sync::Mutex<()>,

    request_send: ArcSwapOption<RequestSend>,
}

impl AsyncSecureChannel {
    pub fn new(
        endpoint: EndpointDescription,
        client_certificate: Vec<u8>,
        validator: Arc<dyn CertificateValidator>,
        connector: Arc<dyn TransportConnector>,
        config: ChannelConfig,
    ) -> Self {
        let mut channel = SecureChannel::new(
            Role::Client,
            endpoint.security_policy,
            endpoint.security_mode,
        );
        channel.set_remote_certificate(&endpoint.server_certificate);
        let secure_channel = Arc::new(RwLock::new(channel));

        Self {
            state: SecureChannelState::new(
                secure_channel.clone(),
                validator,
                client_certificate,
                config.requested_token_lifetime,
            ),
            issue_channel_lock: tokio::sync::Mutex::new(()),
            endpoint,
            connector,
            config,
            secure_channel,
            request_send: Default::default(),
        }
    }

    /// Sends a service message over the channel and waits for the correlated response.
    ///
    /// Renews the security token first when it is past its renewal threshold. A renewal
    /// failure closes the channel; the caller sees [`Error::ChannelExpired`].
    pub async fn send(&self, body: Vec<u8>, timeout: Duration) -> Result<Frame, Error> {
        let sender = self.request_send.load().as_deref().cloned();
        let Some(send) = sender else {
            return Err(Error::transport("secure channel is not connected"));
        };

        let should_renew_security_token = {
            let secure_channel = trace_read_lock!(self.secure_channel);
            secure_channel.should_renew_security_token()
        };

        if should_renew_security_token {
            // Grab the lock, then check again whether we should renew the secure channel,
            // this avoids renewing it multiple times if the client sends many requests in
            // quick succession. Also, if the channel is currently being renewed, we need
            // to wait for the new security token.
            let guard = self.issue_channel_lock.lock().await;
            let should_renew_security_token = {
                let secure_channel = trace_read_lock!(self.secure_channel);
                secure_channel.should_renew_security_token()
            };

            if should_renew_security_token {
                let request = self.state.begin_issue_or_renew_secure_channel(
                    SecurityTokenRequestType::Renew,
                    Duration::from_secs(30),
                    send.clone(),
                );

                let renewed = match request.send().await {
                    Ok(response) => self.state.end_issue_or_renew_secure_channel(response),
                    Err(e) => Err(e),
                };
                if let Err(e) = renewed {
                    error!("Secure channel token renewal failed: {}", e);
                    self.request_send.store(None);
                    return Err(Error::ChannelExpired);
                }
            }

            drop(guard);
        }

        Request::new(MessageType::Message, body, send, timeout)
            .send()
            .await
    }

    pub(crate) fn client_nonce(&self) -> Vec<u8> {
        let secure_channel = trace_read_lock!(self.secure_channel);
        secure_channel.local_nonce().to_vec()
    }

    pub(crate) fn security_policy(&self) -> SecurityPolicy {
        let secure_channel = trace_read_lock!(self.secure_channel);
        secure_channel.security_policy()
    }

    /// Connects the transport and performs the open secure channel handshake once.
    /// There is no retry here; reconnect policy belongs to the session event loop.
    pub async fn connect_no_retry(&self) -> Result<ChannelEventLoop, Error> {
        // A reconnect starts from clean channel state: fresh counters, no token, no keys.
        {
            let mut secure_channel = trace_write_lock!(self.secure_channel);
            *secure_channel = SecureChannel::new(
                Role::Client,
                self.endpoint.security_policy,
                self.endpoint.security_mode,
            );
            secure_channel.set_remote_certificate(&self.endpoint.server_certificate);
        }
        self.request_send.store(None);

        debug!("Connecting transport to {}", self.endpoint.endpoint_url);
        let (reader, writer) = self.connector.connect(&self.endpoint.endpoint_url).await?;

        let (send, recv) = tokio::sync::mpsc::channel(self.config.max_inflight);
        let mut event_loop = ChannelEventLoop::new(
            ConversationState::new(self.secure_channel.clone(), recv, self.config.max_inflight),
            reader,
            writer,
        );

        let request = self.state.begin_issue_or_renew_secure_channel(
            SecurityTokenRequestType::Issue,
            Duration::from_secs(30),
            send.clone(),
        );

        let request_fut = request.send();
        tokio::pin!(request_fut);

        // Temporarily poll the transport task while we're waiting for a response.
        let response = loop {
            tokio::select! {
                r = &mut request_fut => break r?,
                r = event_loop.poll() => {
                    if let TransportPollResult::Closed(e) = r {
                        return Err(e.unwrap_or_else(|| {
                            Error::transport("connection closed during channel negotiation")
                        }));
                    }
                }
            }
        };

        self.state.end_issue_or_renew_secure_channel(response)?;
        self.request_send.store(Some(Arc::new(send)));

        Ok(event_loop)
    }

    /// Closes the secure channel. The close notification is best effort; the channel's
    /// keys are released immediately whether or not it could be delivered.
    pub async fn close_channel(&self) {
        let sender = self.request_send.swap(None).as_deref().cloned();
        if let Some(send) = sender {
            let request = Request::new(
                MessageType::CloseSecureChannel,
                Vec::new(),
                send,
                Duration::from_secs(60),
            );
            if let Err(e) = request.send_no_response().await {
                error!("Failed to send the close channel message: {}", e);
            }
        }

        let mut secure_channel = trace_write_lock!(self.secure_channel);
        secure_channel.clear_security();
    }
}
