// OPCUA for Rust
// SPDX-License-Identifier: MPL-2.0
// Copyright (C) 2017-2024 Adam Lock

//! Application identity collaborators.
//!
//! Certificate generation and storage live outside this core. The [`IdentityProvider`]
//! trait is the narrow interface through which the negotiation and session layers obtain
//! the local application description, instance certificate and proof-of-possession
//! signatures made with the application key pair.

use crate::error::Error;

/// Supplies the local application identity used during secure channel negotiation and
/// session creation / activation.
pub trait IdentityProvider: Send + Sync {
    /// Human readable application name, sent in the create session request.
    fn application_name(&self) -> &str;

    /// The application instance URI, e.g. `urn:MyFirstClient`.
    fn application_uri(&self) -> &str;

    /// Locales the application prefers for localized strings, most preferred first.
    fn preferred_locales(&self) -> &[String] {
        &[]
    }

    /// The DER encoded application instance certificate, or an empty slice when running
    /// with [`SecurityPolicy::None`](crate::endpoint::SecurityPolicy::None).
    fn client_certificate(&self) -> &[u8];

    /// Signs `data` with the application private key, proving possession of the key pair
    /// matching [`client_certificate`](IdentityProvider::client_certificate). Used for the
    /// client signature in session activation.
    fn sign(&self, data: &[u8]) -> Result<Vec<u8>, Error>;
}

/// An identity with no certificate and no key pair. Only usable against endpoints with
/// security policy `None`; [`sign`](IdentityProvider::sign) always fails.
pub struct AnonymousIdentity {
    application_name: String,
    application_uri: String,
    preferred_locales: Vec<String>,
}

impl AnonymousIdentity {
    pub fn new(application_name: impl Into<String>, application_uri: impl Into<String>) -> Self {
        Self {
            application_name: application_name.into(),
            application_uri: application_uri.into(),
            preferred_locales: Vec::new(),
        }
    }

    pub fn with_locales(mut self, locales: Vec<String>) -> Self {
        self.preferred_locales = locales;
        self
    }
}

impl IdentityProvider for AnonymousIdentity {
    fn application_name(&self) -> &str {
        &self.application_name
    }

    fn application_uri(&self) -> &str {
        &self.application_uri
    }

    fn preferred_locales(&self) -> &[String] {
        &self.preferred_locales
    }

    fn client_certificate(&self) -> &[u8] {
        &[]
    }

    fn sign(&self, _data: &[u8]) -> Result<Vec<u8>, Error> {
        Err(Error::SecurityNegotiation(
            "application has no key pair to sign with".to_string(),
        ))
    }
}

/// The credentials a session is activated with.
#[derive(Debug, Clone)]
pub enum IdentityToken {
    /// Anonymous identity token
    Anonymous,
    /// A user name and a password
    UserName(String, String),
    /// A DER encoded user certificate; the proof signature is made through the
    /// session's [`IdentityProvider`].
    X509(Vec<u8>),
}
