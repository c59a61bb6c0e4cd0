// OPCUA for Rust
// SPDX-License-Identifier: MPL-2.0
// Copyright (C) 2017-2024 Adam Lock

use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::RwLock;
use tokio::sync::mpsc::error::SendTimeoutError;

use crate::channel::pump::OutgoingMessage;
use crate::comms::message::{
    ErrorMessage, Frame, MessageType, OpenChannelRequest, OpenChannelResponse,
    SecurityTokenRequestType,
};
use crate::comms::secure_channel::SecureChannel;
use crate::crypto::CertificateValidator;
use crate::endpoint::{MessageSecurityMode, SecurityPolicy};
use crate::error::Error;

pub(crate) type RequestSend = tokio::sync::mpsc::Sender<OutgoingMessage>;

/// One outbound service or handshake message, bound to the pump's queue. The request id
/// and sequence number are assigned by the pump when the message is actually sent.
pub(crate) struct Request {
    message_type: MessageType,
    body: Vec<u8>,
    sender: RequestSend,
    timeout: Duration,
}

impl Request {
    pub fn new(
        message_type: MessageType,
        body: Vec<u8>,
        sender: RequestSend,
        timeout: Duration,
    ) -> Self {
        Self {
            message_type,
            body,
            sender,
            timeout,
        }
    }

    /// Queues the message without registering for a response. Used for the close
    /// notification, which the peer does not answer.
    pub async fn send_no_response(self) -> Result<(), Error> {
        let message = OutgoingMessage {
            message_type: self.message_type,
            body: self.body,
            callback: None,
            deadline: Instant::now() + self.timeout,
        };

        match self.sender.send_timeout(message, self.timeout).await {
            Ok(()) => Ok(()),
            Err(SendTimeoutError::Closed(_)) => Err(Error::transport("connection closed")),
            Err(SendTimeoutError::Timeout(_)) => Err(Error::RequestTimeout),
        }
    }

    /// Queues the message and waits for the correlated response frame.
    pub async fn send(self) -> Result<Frame, Error> {
        let (cb_send, cb_recv) = tokio::sync::oneshot::channel();

        let message = OutgoingMessage {
            message_type: self.message_type,
            body: self.body,
            callback: Some(cb_send),
            deadline: Instant::now() + self.timeout,
        };

        match self.sender.send_timeout(message, self.timeout).await {
            Ok(()) => (),
            Err(SendTimeoutError::Closed(_)) => return Err(Error::transport("connection closed")),
            Err(SendTimeoutError::Timeout(_)) => return Err(Error::RequestTimeout),
        }

        match cb_recv.await {
            Ok(r) => r,
            // The pump dropped the callback without answering, i.e. it shut down.
            Err(_) => Err(Error::transport("connection closed")),
        }
    }
}

/// The negotiation side of the channel: building open / renew requests and applying the
/// server's response to the shared [`SecureChannel`] state.
pub(super) struct SecureChannelState {
    secure_channel: Arc<RwLock<SecureChannel>>,
    validator: Arc<dyn CertificateValidator>,
    client_certificate: Vec<u8>,
    requested_token_lifetime: Duration,
}

impl SecureChannelState {
    pub fn new(
        secure_channel: Arc<RwLock<SecureChannel>>,
        validator: Arc<dyn CertificateValidator>,
        client_certificate: Vec<u8>,
        requested_token_lifetime: Duration,
    ) -> Self {
        SecureChannelState {
            secure_channel,
            validator,
            client_certificate,
            requested_token_lifetime,
        }
    }

    pub(super) fn begin_issue_or_renew_secure_channel(
        &self,
        request_type: SecurityTokenRequestType,
        timeout: Duration,
        sender: RequestSend,
    ) -> Request {
        trace!("issue_or_renew_secure_channel({:?})", request_type);

        let (security_mode, security_policy, client_nonce) = {
            let mut secure_channel = trace_write_lock!(self.secure_channel);
            secure_channel.create_random_nonce();
            (
                secure_channel.security_mode(),
                secure_channel.security_policy(),
                secure_channel.local_nonce().to_vec(),
            )
        };

        debug!("Making secure channel request");
        debug!("security_mode = {:?}", security_mode);
        debug!("security_policy = {:?}", security_policy);

        let request = OpenChannelRequest {
            request_type,
            security_policy,
            security_mode,
            client_nonce,
            client_certificate: self.client_certificate.clone(),
            requested_lifetime_ms: self
                .requested_token_lifetime
                .as_millis()
                .min(u32::MAX as u128) as u32,
        };

        Request::new(
            MessageType::OpenSecureChannel,
            request.encode(),
            sender,
            timeout,
        )
    }

    pub(super) fn end_issue_or_renew_secure_channel(&self, response: Frame) -> Result<(), Error> {
        let response = match response.header.message_type {
            MessageType::OpenSecureChannelResponse => OpenChannelResponse::decode(&response.body)?,
            MessageType::Error => {
                let error = ErrorMessage::decode(&response.body)?;
                return Err(Error::SecurityNegotiation(error.reason));
            }
            t => {
                return Err(Error::SecurityNegotiation(format!(
                    "expected an open secure channel response, got {:?}",
                    t
                )));
            }
        };

        debug!("Setting transport's security token");
        let mut secure_channel = trace_write_lock!(self.secure_channel);

        if secure_channel.security_policy() != SecurityPolicy::None {
            // The server proves its identity through this certificate; the trust decision
            // is the validator's.
            self.validator.validate(&response.server_certificate)?;
            secure_channel.set_remote_certificate(&response.server_certificate);
        }

        secure_channel.set_security_token(
            response.channel_id,
            response.token_id,
            Duration::from_millis(response.revised_lifetime_ms as u64),
        );

        if secure_channel.security_policy() != SecurityPolicy::None
            && (secure_channel.security_mode() == MessageSecurityMode::Sign
                || secure_channel.security_mode() == MessageSecurityMode::SignAndEncrypt)
        {
            let expected = secure_channel.security_policy().secure_channel_nonce_length();
            if response.server_nonce.len() != expected {
                return Err(Error::SecurityNegotiation(format!(
                    "server nonce has length {}, expected {}",
                    response.server_nonce.len(),
                    expected
                )));
            }
            secure_channel.set_remote_nonce(&response.server_nonce);
            secure_channel.derive_keys();
        }
        Ok(())
    }
}
