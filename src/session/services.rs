// OPCUA for Rust
// SPDX-License-Identifier: MPL-2.0
// Copyright (C) 2017-2024 Adam Lock

use std::sync::{atomic::Ordering, Arc};
use std::time::Duration;

use crate::comms::message::{
    ActivateSessionRequest, CreateSessionRequest, MessageType, ServiceMessage, ServicePayload,
    WireIdentityToken,
};
use crate::endpoint::SecurityPolicy;
use crate::error::Error;
use crate::identity::IdentityToken;

use super::{process_fault, process_unexpected_response, session_debug, Session};

impl Session {
    /// Sends a service payload over the secure channel and waits for the correlated
    /// response payload, using the default request timeout.
    pub(super) async fn send(&self, payload: ServicePayload) -> Result<ServicePayload, Error> {
        self.send_with_timeout(payload, self.request_timeout).await
    }

    pub(super) async fn send_with_timeout(
        &self,
        payload: ServicePayload,
        timeout: Duration,
    ) -> Result<ServicePayload, Error> {
        let message = ServiceMessage {
            auth_token: (**self.auth_token.load()).clone(),
            payload,
        };
        let response = self.channel.send(message.encode(), timeout).await?;
        if response.header.message_type != MessageType::Message {
            return Err(Error::decoding(format!(
                "expected a service message, got {:?}",
                response.header.message_type
            )));
        }
        Ok(ServiceMessage::decode(&response.body)?.payload)
    }

    /// Sends a create session request, returning the server assigned session id. The
    /// authentication token from the response is stored and carried on every subsequent
    /// request.
    pub(crate) async fn create_session(&self) -> Result<u32, Error> {
        let request = CreateSessionRequest {
            application_name: self.identity.application_name().to_string(),
            application_uri: self.identity.application_uri().to_string(),
            endpoint_url: self.endpoint.endpoint_url.clone(),
            session_name: self.session_name.clone(),
            client_nonce: self.channel.client_nonce(),
            client_certificate: self.identity.client_certificate().to_vec(),
            requested_session_timeout_ms: self.session_timeout.as_millis().min(u32::MAX as u128)
                as u32,
        };

        match self.send(ServicePayload::CreateSession(request)).await? {
            ServicePayload::CreateSessionResponse(response) => {
                if self.channel.security_policy() != SecurityPolicy::None
                    && response.server_certificate != self.endpoint.server_certificate
                {
                    // The session must belong to the server the channel was negotiated
                    // with.
                    return Err(Error::SecurityNegotiation(
                        "create session response carries a different server certificate"
                            .to_string(),
                    ));
                }

                session_debug!(
                    self,
                    "created with server session id {}",
                    response.session_id
                );
                self.session_id.store(response.session_id, Ordering::Relaxed);
                self.auth_token.store(Arc::new(response.auth_token));
                self.server_nonce.store(Arc::new(response.server_nonce));
                Ok(response.session_id)
            }
            ServicePayload::Fault(fault) => Err(process_fault(fault)),
            other => Err(process_unexpected_response(other)),
        }
    }

    /// Sends an activate session request carrying the configured user identity and, on a
    /// secured channel, the client signature over the server certificate and nonce.
    pub(crate) async fn activate_session(&self) -> Result<(), Error> {
        let security_policy = self.channel.security_policy();

        let client_signature = if security_policy == SecurityPolicy::None {
            Vec::new()
        } else {
            self.make_proof_signature()?
        };

        let identity = match &self.identity_token {
            IdentityToken::Anonymous => WireIdentityToken::Anonymous,
            IdentityToken::UserName(user, password) => WireIdentityToken::UserName {
                user: user.clone(),
                // The channel's encryption protects the credentials in transit.
                password: password.as_bytes().to_vec(),
            },
            IdentityToken::X509(certificate) => WireIdentityToken::X509 {
                certificate: certificate.clone(),
                signature: self.make_proof_signature()?,
            },
        };

        let request = ActivateSessionRequest {
            locale_ids: self.identity.preferred_locales().to_vec(),
            identity,
            client_signature,
        };

        match self.send(ServicePayload::ActivateSession(request)).await? {
            ServicePayload::ActivateSessionResponse => Ok(()),
            ServicePayload::Fault(fault) => Err(process_fault(fault)),
            other => Err(process_unexpected_response(other)),
        }
    }

    /// Signs the server certificate and nonce with the application key, proving to the
    /// server that this client owns the key pair its certificate names.
    fn make_proof_signature(&self) -> Result<Vec<u8>, Error> {
        let server_nonce = self.server_nonce.load();
        if server_nonce.is_empty() {
            error!("Cannot create a client signature without a server nonce");
            return Err(Error::Activation(
                "no server nonce to sign for session activation".to_string(),
            ));
        }
        let mut data = Vec::with_capacity(
            self.endpoint.server_certificate.len() + server_nonce.len(),
        );
        data.extend_from_slice(&self.endpoint.server_certificate);
        data.extend_from_slice(&server_nonce);
        self.identity.sign(&data)
    }

    /// Close the session by sending a close session request to the server.
    ///
    /// This is not accessible by users, they must instead call
    /// [`close`](Session::close) to properly close the session.
    pub(crate) async fn close_session(&self, delete_subscriptions: bool) -> Result<(), Error> {
        let response = self
            .send(ServicePayload::CloseSession {
                delete_subscriptions,
            })
            .await?;
        match response {
            ServicePayload::CloseSessionResponse => Ok(()),
            ServicePayload::Fault(fault) => Err(process_fault(fault)),
            other => Err(process_unexpected_response(other)),
        }
    }
}
