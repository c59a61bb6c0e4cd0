// OPCUA for Rust
// SPDX-License-Identifier: MPL-2.0
// Copyright (C) 2017-2024 Adam Lock

use std::sync::{
    atomic::{AtomicU32, Ordering},
    Arc,
};
use std::time::Duration;

use arc_swap::ArcSwap;

use crate::channel::AsyncSecureChannel;
use crate::comms::message::ServicePayload;
use crate::config::ClientConfig;
use crate::crypto::CertificateValidator;
use crate::endpoint::EndpointDescription;
use crate::error::Error;
use crate::identity::{IdentityProvider, IdentityToken};
use crate::retry::SessionRetryPolicy;
use crate::transport::TransportConnector;

use super::{process_unexpected_response, ServiceRequest, SessionEventLoop};

/// Where the session is in its lifecycle. Observed through a watch channel, so state
/// changes made by the event loop are immediately visible to every handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// The session handle exists but no connection attempt has completed yet.
    Created,
    /// A connection or re-activation handshake is in progress. Service calls are
    /// rejected without I/O until it completes.
    Activating,
    /// The session is activated and service calls flow.
    Active,
    /// A close was requested and is in progress.
    Closing,
    /// The session is closed, either deliberately or because re-activation failed.
    /// Terminal; a closed session is never revived.
    Closed,
}

/// A client session. Service calls made through this handle are correlated over the
/// underlying secure channel; the [`SessionEventLoop`] returned alongside it must be
/// polled for any of them to make progress.
pub struct Session {
    pub(super) channel: AsyncSecureChannel,
    pub(super) state_watch_rx: tokio::sync::watch::Receiver<SessionState>,
    pub(super) state_watch_tx: tokio::sync::watch::Sender<SessionState>,
    pub(super) identity: Arc<dyn IdentityProvider>,
    pub(super) identity_token: IdentityToken,
    pub(super) endpoint: EndpointDescription,
    pub(super) session_name: String,
    /// Server assigned session id, zero until a session has been created.
    pub(super) session_id: AtomicU32,
    /// The authentication token issued at session creation, carried on every request.
    pub(super) auth_token: Arc<ArcSwap<Vec<u8>>>,
    /// The server nonce from the most recent create session response, signed during
    /// activation to prove possession of the application key.
    pub(super) server_nonce: ArcSwap<Vec<u8>>,
    pub(super) request_timeout: Duration,
    pub(super) session_timeout: Duration,
}

impl Session {
    pub(crate) fn new(
        endpoint: EndpointDescription,
        identity: Arc<dyn IdentityProvider>,
        identity_token: IdentityToken,
        validator: Arc<dyn CertificateValidator>,
        connector: Arc<dyn TransportConnector>,
        session_retry_policy: SessionRetryPolicy,
        config: &ClientConfig,
    ) -> (Arc<Self>, SessionEventLoop) {
        let (state_watch_tx, state_watch_rx) = tokio::sync::watch::channel(SessionState::Created);

        let session = Arc::new(Session {
            channel: AsyncSecureChannel::new(
                endpoint.clone(),
                identity.client_certificate().to_vec(),
                validator,
                connector,
                config.channel_config(),
            ),
            state_watch_rx,
            state_watch_tx,
            identity,
            identity_token,
            endpoint,
            session_name: config.session_name.clone(),
            session_id: AtomicU32::new(0),
            auth_token: Default::default(),
            server_nonce: Default::default(),
            request_timeout: config.request_timeout(),
            session_timeout: Duration::from_millis(config.session_timeout_ms),
        });

        (
            session.clone(),
            SessionEventLoop::new(session, session_retry_policy),
        )
    }

    /// The server assigned session id, or zero before a session has been created.
    pub fn session_id(&self) -> u32 {
        self.session_id.load(Ordering::Relaxed)
    }

    /// The session's current lifecycle state.
    pub fn state(&self) -> SessionState {
        *self.state_watch_rx.borrow()
    }

    /// Makes a typed service call with the default request timeout.
    pub async fn call<T: ServiceRequest>(&self, request: &T) -> Result<T::Response, Error> {
        self.call_with_timeout(request, self.request_timeout).await
    }

    /// Makes a typed service call with an explicit timeout.
    ///
    /// Fails with [`Error::SessionNotActive`] before any I/O if the session is not in
    /// the `Active` state. Dropping the returned future cancels the call; a late
    /// response is discarded when it arrives.
    pub async fn call_with_timeout<T: ServiceRequest>(
        &self,
        request: &T,
        timeout: Duration,
    ) -> Result<T::Response, Error> {
        if self.state() != SessionState::Active {
            return Err(Error::SessionNotActive);
        }

        let payload = ServicePayload::UserService(request.encode()?);
        match self.send_with_timeout(payload, timeout).await {
            Ok(ServicePayload::UserServiceResponse(response)) => T::decode_response(&response),
            Ok(ServicePayload::Fault(fault)) => Err(super::process_fault(fault)),
            Ok(other) => Err(process_unexpected_response(other)),
            Err(e) => Err(self.map_connection_error(e)),
        }
    }

    /// In-flight calls interrupted by a channel loss fail with a transport error while
    /// the session is recovering, and with [`Error::SessionLost`] once it is closed for
    /// good.
    fn map_connection_error(&self, e: Error) -> Error {
        match e {
            Error::Transport(_) if self.state() == SessionState::Closed => Error::SessionLost,
            e => e,
        }
    }

    /// Moves the session into `Closing` if it is not already closing or closed. Returns
    /// whether this call won the transition, making close idempotent across handles and
    /// orderings.
    fn begin_close(&self) -> bool {
        self.state_watch_tx.send_if_modified(|state| {
            if matches!(*state, SessionState::Closing | SessionState::Closed) {
                false
            } else {
                *state = SessionState::Closing;
                true
            }
        })
    }

    /// Closes the session and its secure channel, then waits for the close to complete.
    /// `delete_subscriptions` asks the server to drop whatever subscriptions the session
    /// owns rather than keeping them for a transfer.
    ///
    /// The close notification to the server is best effort; local resources are always
    /// released. Calling close on a session that is already closing or closed is a no-op.
    pub async fn close(&self, delete_subscriptions: bool) -> Result<(), Error> {
        if !self.begin_close() {
            return Ok(());
        }

        if let Err(e) = self.close_session(delete_subscriptions).await {
            super::session_warn!(self, "Close session request failed: {}", e);
        }
        self.channel.close_channel().await;

        let _ = self.state_watch_tx.send(SessionState::Closed);
        Ok(())
    }

    /// Closes the session on a background task, returning a handle that resolves when
    /// the close has completed. Interchangeable with [`close`](Session::close) in any
    /// order; whichever runs first performs the work.
    pub fn close_async(
        self: &Arc<Self>,
        delete_subscriptions: bool,
    ) -> tokio::task::JoinHandle<Result<(), Error>> {
        let session = self.clone();
        tokio::task::spawn(async move { session.close(delete_subscriptions).await })
    }

    /// Wait for the session to reach a particular state.
    pub(super) async fn wait_for_state(&self, target: SessionState) -> bool {
        let mut rx = self.state_watch_rx.clone();
        let result = rx.wait_for(|s| *s == target).await;
        result.is_ok()
    }

    /// Convenience method to wait until the session is active.
    ///
    /// You should also monitor the session event loop. If it ends, this method may never
    /// return.
    pub async fn wait_for_connection(&self) -> bool {
        self.wait_for_state(SessionState::Active).await
    }
}
