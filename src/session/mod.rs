// OPCUA for Rust
// SPDX-License-Identifier: MPL-2.0
// Copyright (C) 2017-2024 Adam Lock

//! The session layer: session lifecycle on top of a secure channel, and the typed
//! service call surface.

mod connect;
mod event_loop;
mod services;
#[allow(clippy::module_inception)]
mod session;

pub use connect::SessionConnectMode;
pub use event_loop::{SessionEventLoop, SessionPollResult};
pub use session::{Session, SessionState};

use crate::comms::message::{FaultCode, ServiceFault, ServicePayload};
use crate::error::Error;

macro_rules! session_warn {
    ($session: expr, $($arg:tt)*) =>  {
        warn!("session {} {}", $session.session_id(), format!($($arg)*));
    }
}
pub(crate) use session_warn;

macro_rules! session_debug {
    ($session: expr, $($arg:tt)*) =>  {
        debug!("session {} {}", $session.session_id(), format!($($arg)*));
    }
}
pub(crate) use session_debug;

/// A typed service request. The application implements this for each service it speaks;
/// the session carries the encoded payload opaquely and hands the correlated response
/// payload back to [`decode_response`](ServiceRequest::decode_response).
pub trait ServiceRequest: Send {
    type Response: Send;

    /// Encodes the request payload.
    fn encode(&self) -> Result<Vec<u8>, Error>;

    /// Decodes the response payload correlated with this request.
    fn decode_response(payload: &[u8]) -> Result<Self::Response, Error>;
}

/// Maps a service fault onto the error kind its code calls for.
pub(crate) fn process_fault(fault: ServiceFault) -> Error {
    match fault.code {
        FaultCode::SessionRejected => Error::SessionCreation(fault.reason),
        FaultCode::ActivationRejected => Error::Activation(fault.reason),
        FaultCode::General => Error::ServiceFault(fault.reason),
    }
}

/// Called when a response payload is of an entirely unexpected kind.
pub(crate) fn process_unexpected_response(payload: ServicePayload) -> Error {
    error!("Received an unexpected response payload: {:?}", payload);
    Error::decoding("response payload has an unexpected kind")
}
