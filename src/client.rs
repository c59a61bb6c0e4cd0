// OPCUA for Rust
// SPDX-License-Identifier: MPL-2.0
// Copyright (C) 2017-2024 Adam Lock

use std::sync::Arc;

use crate::config::ClientConfig;
use crate::crypto::CertificateValidator;
use crate::endpoint::{
    self, discover, EndpointDescription, MessageSecurityMode, SecurityPolicy,
};
use crate::error::Error;
use crate::identity::{IdentityProvider, IdentityToken};
use crate::session::{Session, SessionEventLoop};
use crate::transport::TransportConnector;

/// The entry point for making connections: holds the configuration, the application
/// identity and the transport and trust collaborators, and hands out sessions. Built
/// through [`ClientBuilder`](crate::ClientBuilder).
pub struct Client {
    config: ClientConfig,
    identity: Arc<dyn IdentityProvider>,
    validator: Arc<dyn CertificateValidator>,
    connector: Arc<dyn TransportConnector>,
}

impl Client {
    pub(crate) fn new(
        config: ClientConfig,
        identity: Arc<dyn IdentityProvider>,
        validator: Arc<dyn CertificateValidator>,
        connector: Arc<dyn TransportConnector>,
    ) -> Client {
        Client {
            config,
            identity,
            validator,
            connector,
        }
    }

    /// Asks the server at `server_url` for its advertised endpoints.
    pub async fn get_server_endpoints(
        &self,
        server_url: &str,
    ) -> Result<Vec<EndpointDescription>, Error> {
        discover(
            self.connector.as_ref(),
            server_url,
            self.config.discovery_timeout(),
        )
        .await
    }

    /// Creates a session against a known endpoint, together with the event loop that
    /// drives it. No connection is made until the event loop is polled.
    pub fn new_session_from_endpoint(
        &self,
        endpoint: EndpointDescription,
        identity_token: IdentityToken,
    ) -> (Arc<Session>, SessionEventLoop) {
        Session::new(
            endpoint,
            self.identity.clone(),
            identity_token,
            self.validator.clone(),
            self.connector.clone(),
            self.config.retry.policy(),
            &self.config,
        )
    }

    /// Discovers the server's endpoints, keeps the ones matching the requested security
    /// policy and mode and creates a session against the one the server ranks highest.
    pub async fn new_session_from_url(
        &self,
        server_url: &str,
        security_policy: SecurityPolicy,
        security_mode: MessageSecurityMode,
        identity_token: IdentityToken,
    ) -> Result<(Arc<Session>, SessionEventLoop), Error> {
        let endpoints = self.get_server_endpoints(server_url).await?;
        let matching = endpoint::filter_by_security_policy(
            &endpoint::filter_by_security_mode(&endpoints, security_mode),
            security_policy,
        );
        let ranked = endpoint::sort_by_security_level(&matching);
        let Some(chosen) = ranked.last() else {
            return Err(Error::Discovery(format!(
                "server advertises no endpoint with policy {} and mode {}",
                security_policy, security_mode
            )));
        };
        Ok(self.new_session_from_endpoint(chosen.clone(), identity_token))
    }
}
