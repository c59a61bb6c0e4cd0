// OPCUA for Rust
// SPDX-License-Identifier: MPL-2.0
// Copyright (C) 2017-2024 Adam Lock

//! The byte transport seam.
//!
//! This core is transport agnostic: sockets, HTTPS or an in-memory pipe all look the same
//! through these traits. A connection is split into a read half and a write half so the
//! message pump can wait for inbound messages while a send is in progress, the same way a
//! TCP stream is split into `ReadHalf` / `WriteHalf`.

use futures::future::BoxFuture;

use crate::error::Error;

/// The read half of an established transport connection.
pub trait TransportReader: Send {
    /// Receives the next complete message from the peer.
    ///
    /// The returned future must be cancel safe: dropping it before completion must not
    /// lose a message, since the pump races it against the outgoing queue in a `select!`.
    fn receive(&mut self) -> BoxFuture<'_, Result<Vec<u8>, Error>>;
}

/// The write half of an established transport connection.
pub trait TransportWriter: Send {
    /// Sends one complete message to the peer.
    fn send<'a>(&'a mut self, message: &'a [u8]) -> BoxFuture<'a, Result<(), Error>>;

    /// Closes the connection. Best effort; errors are not reported.
    fn close(&mut self) -> BoxFuture<'_, ()>;
}

/// Establishes transport connections to an endpoint URL.
pub trait TransportConnector: Send + Sync {
    /// Connects to `endpoint_url`, returning the two halves of the connection.
    fn connect<'a>(
        &'a self,
        endpoint_url: &'a str,
    ) -> BoxFuture<'a, Result<(Box<dyn TransportReader>, Box<dyn TransportWriter>), Error>>;
}
