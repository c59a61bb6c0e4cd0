// OPCUA for Rust
// SPDX-License-Identifier: MPL-2.0
// Copyright (C) 2017-2024 Adam Lock

//! The OPC UA client core contains the functionality necessary for a client to discover
//! what secure connection options a server offers, select one, establish an encrypted and
//! session-authenticated channel, and carry out correlated request / response service calls
//! over that channel.
//!
//! The crate deliberately stops at a few narrow seams. The byte transport, the certificate
//! validation policy, the application identity (certificate / key pair) and the encoding of
//! typed service payloads are all collaborator traits supplied by the caller - see
//! [`TransportConnector`], [`CertificateValidator`], [`IdentityProvider`] and
//! [`ServiceRequest`].
//!
//! A typical client:
//!
//! 1. Calls [`Client::get_server_endpoints`] and narrows the result with
//!    [`filter_by_security_mode`], [`filter_by_security_policy`] and
//!    [`sort_by_security_level`], picking the last element for "most secure".
//! 2. Creates a session from the chosen endpoint with [`Client::new_session_from_endpoint`]
//!    and spawns the returned [`SessionEventLoop`].
//! 3. Issues service calls through [`Session::call`]. Requests are correlated by request id,
//!    so responses may complete out of send order, and the session transparently renews the
//!    secure channel token and re-activates itself after a channel loss.

#[macro_use]
extern crate log;

/// Tracing macro for obtaining a lock on a `Mutex`. Sometimes deadlocks can happen in code,
/// and if they do, this macro is useful for finding out where they happened.
#[macro_export]
macro_rules! trace_lock {
    ( $x:expr ) => {{
        let v = $x.lock();
        v
    }};
}

/// Tracing macro for obtaining a read lock on a `RwLock`.
#[macro_export]
macro_rules! trace_read_lock {
    ( $x:expr ) => {{
        let v = $x.read();
        v
    }};
}

/// Tracing macro for obtaining a write lock on a `RwLock`.
#[macro_export]
macro_rules! trace_write_lock {
    ( $x:expr ) => {{
        let v = $x.write();
        v
    }};
}

mod builder;
mod client;
mod config;
mod retry;

pub mod channel;
pub mod comms;
pub mod crypto;
pub mod endpoint;
pub mod error;
pub mod identity;
pub mod session;
pub mod transport;

pub use builder::ClientBuilder;
pub use channel::{AsyncSecureChannel, ChannelConfig, ChannelEventLoop, TransportPollResult};
pub use client::Client;
pub use config::{ClientConfig, Config, RetryConfig};
pub use crypto::{AllowAllValidator, CertificateValidator, TrustedCertificates};
pub use endpoint::{
    discover, filter_by_security_mode, filter_by_security_policy, is_opc_ua_binary_url,
    sort_by_security_level, EndpointDescription, MessageSecurityMode, SecurityPolicy,
};
pub use error::Error;
pub use identity::{AnonymousIdentity, IdentityProvider, IdentityToken};
pub use retry::SessionRetryPolicy;
pub use session::{
    ServiceRequest, Session, SessionConnectMode, SessionEventLoop, SessionPollResult, SessionState,
};
pub use transport::{TransportConnector, TransportReader, TransportWriter};
