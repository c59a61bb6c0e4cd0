// OPCUA for Rust
// SPDX-License-Identifier: MPL-2.0
// Copyright (C) 2017-2024 Adam Lock

use std::path::PathBuf;
use std::sync::Arc;

use crate::client::Client;
use crate::config::{ClientConfig, Config, RetryConfig};
use crate::crypto::{CertificateValidator, TrustedCertificates};
use crate::identity::{AnonymousIdentity, IdentityProvider};
use crate::transport::TransportConnector;

/// Builds a [`Client`] from a configuration and the application's collaborators: the
/// identity provider, certificate validator and transport connector.
pub struct ClientBuilder {
    config: ClientConfig,
    identity: Option<Arc<dyn IdentityProvider>>,
    validator: Option<Arc<dyn CertificateValidator>>,
    connector: Option<Arc<dyn TransportConnector>>,
}

impl Default for ClientBuilder {
    fn default() -> Self {
        Self {
            config: ClientConfig::default(),
            identity: None,
            validator: None,
            connector: None,
        }
    }
}

impl ClientBuilder {
    /// Creates a `ClientBuilder`.
    pub fn new() -> ClientBuilder {
        ClientBuilder::default()
    }

    /// Creates a `ClientBuilder` using a configuration file as the initial state.
    pub fn from_config(path: impl Into<PathBuf>) -> Result<ClientBuilder, ()> {
        Ok(ClientBuilder {
            config: ClientConfig::load(&path.into())?,
            ..Default::default()
        })
    }

    /// Yields a [`Client`] from the values set by the builder, or `None` if the builder
    /// is not in a valid state. A transport connector must have been supplied; identity
    /// defaults to an anonymous application and the validator to an empty trust list,
    /// which rejects every certificate until the application trusts one.
    pub fn client(self) -> Option<Client> {
        if !self.is_valid() {
            return None;
        }
        let connector = self.connector?;
        let identity = self
            .identity
            .unwrap_or_else(|| Arc::new(AnonymousIdentity::new("Rust OPC UA Client", "urn:RustOpcUaClient")));
        let validator = self
            .validator
            .unwrap_or_else(|| Arc::new(TrustedCertificates::new()));
        Some(Client::new(self.config, identity, validator, connector))
    }

    /// Yields the [`ClientConfig`] from the values set by the builder.
    pub fn config(self) -> ClientConfig {
        self.config
    }

    /// Tests if the builder is in a valid state to be able to yield a `Client`.
    pub fn is_valid(&self) -> bool {
        self.config.is_valid() && self.connector.is_some()
    }

    /// Sets the session name, presented to the server when the session is created.
    pub fn session_name(mut self, session_name: impl Into<String>) -> Self {
        self.config.session_name = session_name.into();
        self
    }

    /// Sets the default timeout for service requests, in milliseconds.
    pub fn request_timeout_ms(mut self, request_timeout_ms: u64) -> Self {
        self.config.request_timeout_ms = request_timeout_ms;
        self
    }

    /// Sets the session timeout requested from the server, in milliseconds.
    pub fn session_timeout_ms(mut self, session_timeout_ms: u64) -> Self {
        self.config.session_timeout_ms = session_timeout_ms;
        self
    }

    /// Sets the timeout for the discovery exchange, in milliseconds.
    pub fn discovery_timeout_ms(mut self, discovery_timeout_ms: u64) -> Self {
        self.config.discovery_timeout_ms = discovery_timeout_ms;
        self
    }

    /// Sets the secure channel token lifetime requested from the server, in
    /// milliseconds.
    pub fn channel_token_lifetime_ms(mut self, channel_token_lifetime_ms: u64) -> Self {
        self.config.channel_token_lifetime_ms = channel_token_lifetime_ms;
        self
    }

    /// Sets the maximum number of service requests awaiting a response at once.
    pub fn max_inflight_messages(mut self, max_inflight_messages: usize) -> Self {
        self.config.max_inflight_messages = max_inflight_messages;
        self
    }

    /// Sets the reconnect behavior after a connection loss.
    pub fn retry(mut self, retry: RetryConfig) -> Self {
        self.config.retry = retry;
        self
    }

    /// Sets the application identity provider.
    pub fn identity(mut self, identity: Arc<dyn IdentityProvider>) -> Self {
        self.identity = Some(identity);
        self
    }

    /// Sets the certificate validator that judges server certificates during
    /// negotiation.
    pub fn certificate_validator(mut self, validator: Arc<dyn CertificateValidator>) -> Self {
        self.validator = Some(validator);
        self
    }

    /// Sets the transport connector used to reach servers.
    pub fn transport_connector(mut self, connector: Arc<dyn TransportConnector>) -> Self {
        self.connector = Some(connector);
        self
    }
}
