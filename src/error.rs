// OPCUA for Rust
// SPDX-License-Identifier: MPL-2.0
// Copyright (C) 2017-2024 Adam Lock

//! The error taxonomy for the client core.
//!
//! Every public operation either returns a well-typed success value or one of these
//! kinds; there is no partial-success return anywhere in the crate.

use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Error {
    /// Endpoint discovery failed, either because the server could not be reached or
    /// because it returned a malformed response.
    #[error("endpoint discovery failed: {0}")]
    Discovery(String),

    /// The underlying byte transport failed to connect, send or receive.
    #[error("transport failure: {0}")]
    Transport(String),

    /// The cryptographic handshake failed - the server certificate was rejected by the
    /// certificate validator, or no mutually acceptable security policy exists.
    #[error("security negotiation failed: {0}")]
    SecurityNegotiation(String),

    /// The secure channel token passed its expiry without being renewed. The channel is
    /// closed and all subsequent sends fail with this error.
    #[error("secure channel token has expired")]
    ChannelExpired,

    /// An inbound message carried a sequence number that did not strictly increase.
    /// This indicates a potential attack and is always fatal to the channel.
    #[error("message replay or out-of-order sequence number detected")]
    ReplayOrOutOfOrder,

    /// The server rejected session creation, e.g. because of resource limits.
    #[error("session creation rejected: {0}")]
    SessionCreation(String),

    /// The server rejected session activation, e.g. because of bad credentials.
    #[error("session activation rejected: {0}")]
    Activation(String),

    /// The session could not be re-activated after losing its secure channel.
    #[error("session was lost and could not be re-activated")]
    SessionLost,

    /// A service call was attempted on a session that is not in the `Active` state.
    /// No network I/O was attempted.
    #[error("session is not active")]
    SessionNotActive,

    /// No response with a matching request id arrived before the deadline. The request
    /// is not retried; the server may still process it.
    #[error("request timed out")]
    RequestTimeout,

    /// A frame or control message could not be decoded.
    #[error("malformed message: {0}")]
    Decoding(String),

    /// The server answered a service call with a fault instead of a response.
    #[error("service fault: {0}")]
    ServiceFault(String),
}

impl Error {
    pub fn transport(reason: impl Into<String>) -> Self {
        Error::Transport(reason.into())
    }

    pub fn decoding(reason: impl Into<String>) -> Self {
        Error::Decoding(reason.into())
    }

    /// Security violations are never retried or ignored; they kill the channel.
    pub fn is_fatal_to_channel(&self) -> bool {
        matches!(
            self,
            Error::ReplayOrOutOfOrder | Error::SecurityNegotiation(_) | Error::ChannelExpired
        )
    }
}
