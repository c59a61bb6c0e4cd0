// OPCUA for Rust
// SPDX-License-Identifier: MPL-2.0
// Copyright (C) 2017-2024 Adam Lock

//! The frame codec owned by this core.
//!
//! The transport delivers whole messages; each message is one frame: a fixed header
//! carrying the message type, channel id, token id, sequence number and request id,
//! followed by a body. Channel and session control bodies are encoded here. User service
//! bodies are opaque byte payloads produced by the caller's encoder and are carried
//! untouched.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::endpoint::{EndpointDescription, MessageSecurityMode, SecurityPolicy};
use crate::error::Error;

/// Upper bound on any length prefix read off the wire, to stop a corrupt frame from
/// triggering an enormous allocation.
const MAX_FIELD_LENGTH: usize = 16 * 1024 * 1024;

/// Upper bound on the number of endpoints in a discovery response. Far beyond any real
/// server, and small enough that the count prefix cannot drive a large preallocation.
const MAX_ENDPOINT_COUNT: usize = 4096;

pub(crate) const FRAME_HEADER_SIZE: usize = 17;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageType {
    GetEndpoints,
    GetEndpointsResponse,
    OpenSecureChannel,
    OpenSecureChannelResponse,
    CloseSecureChannel,
    Message,
    Error,
}

impl MessageType {
    fn to_wire(self) -> u8 {
        match self {
            MessageType::GetEndpoints => 1,
            MessageType::GetEndpointsResponse => 2,
            MessageType::OpenSecureChannel => 3,
            MessageType::OpenSecureChannelResponse => 4,
            MessageType::CloseSecureChannel => 5,
            MessageType::Message => 6,
            MessageType::Error => 7,
        }
    }

    fn from_wire(value: u8) -> Result<MessageType, Error> {
        match value {
            1 => Ok(MessageType::GetEndpoints),
            2 => Ok(MessageType::GetEndpointsResponse),
            3 => Ok(MessageType::OpenSecureChannel),
            4 => Ok(MessageType::OpenSecureChannelResponse),
            5 => Ok(MessageType::CloseSecureChannel),
            6 => Ok(MessageType::Message),
            7 => Ok(MessageType::Error),
            v => Err(Error::Decoding(format!("unknown message type {}", v))),
        }
    }
}

/// The fixed frame header. Always plaintext; message security covers it with the body's
/// signature so it cannot be tampered with undetected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    pub message_type: MessageType,
    pub channel_id: u32,
    pub token_id: u32,
    pub sequence_number: u32,
    pub request_id: u32,
}

impl FrameHeader {
    pub fn new(
        message_type: MessageType,
        channel_id: u32,
        token_id: u32,
        sequence_number: u32,
        request_id: u32,
    ) -> Self {
        Self {
            message_type,
            channel_id,
            token_id,
            sequence_number,
            request_id,
        }
    }

    pub(crate) fn encode_into(&self, buf: &mut BytesMut) {
        buf.put_u8(self.message_type.to_wire());
        buf.put_u32_le(self.channel_id);
        buf.put_u32_le(self.token_id);
        buf.put_u32_le(self.sequence_number);
        buf.put_u32_le(self.request_id);
    }

    pub(crate) fn decode_from(buf: &mut Bytes) -> Result<FrameHeader, Error> {
        if buf.remaining() < FRAME_HEADER_SIZE {
            return Err(Error::decoding("frame shorter than its header"));
        }
        let message_type = MessageType::from_wire(buf.get_u8())?;
        Ok(FrameHeader {
            message_type,
            channel_id: buf.get_u32_le(),
            token_id: buf.get_u32_le(),
            sequence_number: buf.get_u32_le(),
            request_id: buf.get_u32_le(),
        })
    }
}

/// One wire message: header plus body. The body of a secured frame is encrypted and/or
/// signed by [`SecureChannel`](crate::comms::secure_channel::SecureChannel) after
/// encoding and before transmission.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub header: FrameHeader,
    pub body: Vec<u8>,
}

impl Frame {
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = BytesMut::with_capacity(FRAME_HEADER_SIZE + self.body.len());
        self.header.encode_into(&mut buf);
        buf.put_slice(&self.body);
        buf.to_vec()
    }

    pub fn decode(bytes: &[u8]) -> Result<Frame, Error> {
        let mut buf = Bytes::copy_from_slice(bytes);
        let header = FrameHeader::decode_from(&mut buf)?;
        Ok(Frame {
            header,
            body: buf.to_vec(),
        })
    }
}

// Primitive field helpers. Strings are length-prefixed UTF-8, byte strings are
// length-prefixed raw bytes.

pub(crate) fn write_string(buf: &mut BytesMut, value: &str) {
    buf.put_u32_le(value.len() as u32);
    buf.put_slice(value.as_bytes());
}

pub(crate) fn read_string(buf: &mut Bytes) -> Result<String, Error> {
    let bytes = read_byte_string(buf)?;
    String::from_utf8(bytes).map_err(|_| Error::decoding("string field is not valid UTF-8"))
}

pub(crate) fn write_byte_string(buf: &mut BytesMut, value: &[u8]) {
    buf.put_u32_le(value.len() as u32);
    buf.put_slice(value);
}

pub(crate) fn read_byte_string(buf: &mut Bytes) -> Result<Vec<u8>, Error> {
    let len = read_u32(buf)? as usize;
    if len > MAX_FIELD_LENGTH {
        return Err(Error::decoding("field length exceeds sanity limit"));
    }
    if buf.remaining() < len {
        return Err(Error::decoding("field is truncated"));
    }
    Ok(buf.copy_to_bytes(len).to_vec())
}

pub(crate) fn read_u32(buf: &mut Bytes) -> Result<u32, Error> {
    if buf.remaining() < 4 {
        return Err(Error::decoding("field is truncated"));
    }
    Ok(buf.get_u32_le())
}

pub(crate) fn read_u8(buf: &mut Bytes) -> Result<u8, Error> {
    if !buf.has_remaining() {
        return Err(Error::decoding("field is truncated"));
    }
    Ok(buf.get_u8())
}

/// Body of a `GetEndpoints` frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GetEndpointsRequest {
    pub endpoint_url: String,
}

impl GetEndpointsRequest {
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = BytesMut::new();
        write_string(&mut buf, &self.endpoint_url);
        buf.to_vec()
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, Error> {
        let mut buf = Bytes::copy_from_slice(bytes);
        Ok(Self {
            endpoint_url: read_string(&mut buf)?,
        })
    }
}

/// Body of a `GetEndpointsResponse` frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GetEndpointsResponse {
    pub endpoints: Vec<EndpointDescription>,
}

impl GetEndpointsResponse {
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = BytesMut::new();
        buf.put_u32_le(self.endpoints.len() as u32);
        for endpoint in &self.endpoints {
            write_string(&mut buf, &endpoint.endpoint_url);
            write_string(&mut buf, &endpoint.transport_profile_uri);
            write_string(&mut buf, endpoint.security_policy.to_uri());
            buf.put_u8(endpoint.security_mode.to_wire());
            buf.put_u8(endpoint.security_level);
            write_byte_string(&mut buf, &endpoint.server_certificate);
        }
        buf.to_vec()
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, Error> {
        let mut buf = Bytes::copy_from_slice(bytes);
        let count = read_u32(&mut buf)? as usize;
        if count > MAX_ENDPOINT_COUNT {
            return Err(Error::decoding("endpoint count exceeds sanity limit"));
        }
        let mut endpoints = Vec::with_capacity(count);
        for _ in 0..count {
            let endpoint_url = read_string(&mut buf)?;
            let transport_profile_uri = read_string(&mut buf)?;
            let security_policy = SecurityPolicy::from_uri(&read_string(&mut buf)?)
                .map_err(|e| Error::Decoding(e.to_string()))?;
            let security_mode = MessageSecurityMode::from_wire(read_u8(&mut buf)?);
            let security_level = read_u8(&mut buf)?;
            let server_certificate = read_byte_string(&mut buf)?;
            endpoints.push(EndpointDescription {
                endpoint_url,
                transport_profile_uri,
                security_policy,
                security_mode,
                security_level,
                server_certificate,
            });
        }
        Ok(Self { endpoints })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SecurityTokenRequestType {
    Issue,
    Renew,
}

/// Body of an `OpenSecureChannel` frame. Sent plaintext; the certificate exchange and
/// validator seam provide the trust decision.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OpenChannelRequest {
    pub request_type: SecurityTokenRequestType,
    pub security_policy: SecurityPolicy,
    pub security_mode: MessageSecurityMode,
    pub client_nonce: Vec<u8>,
    pub client_certificate: Vec<u8>,
    pub requested_lifetime_ms: u32,
}

impl OpenChannelRequest {
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = BytesMut::new();
        buf.put_u8(match self.request_type {
            SecurityTokenRequestType::Issue => 0,
            SecurityTokenRequestType::Renew => 1,
        });
        write_string(&mut buf, self.security_policy.to_uri());
        buf.put_u8(self.security_mode.to_wire());
        write_byte_string(&mut buf, &self.client_nonce);
        write_byte_string(&mut buf, &self.client_certificate);
        buf.put_u32_le(self.requested_lifetime_ms);
        buf.to_vec()
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, Error> {
        let mut buf = Bytes::copy_from_slice(bytes);
        let request_type = match read_u8(&mut buf)? {
            0 => SecurityTokenRequestType::Issue,
            1 => SecurityTokenRequestType::Renew,
            v => return Err(Error::Decoding(format!("unknown token request type {}", v))),
        };
        let security_policy = SecurityPolicy::from_uri(&read_string(&mut buf)?)
            .map_err(|e| Error::Decoding(e.to_string()))?;
        Ok(Self {
            request_type,
            security_policy,
            security_mode: MessageSecurityMode::from_wire(read_u8(&mut buf)?),
            client_nonce: read_byte_string(&mut buf)?,
            client_certificate: read_byte_string(&mut buf)?,
            requested_lifetime_ms: read_u32(&mut buf)?,
        })
    }
}

/// Body of an `OpenSecureChannelResponse` frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OpenChannelResponse {
    pub channel_id: u32,
    pub token_id: u32,
    pub revised_lifetime_ms: u32,
    pub server_nonce: Vec<u8>,
    pub server_certificate: Vec<u8>,
}

impl OpenChannelResponse {
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = BytesMut::new();
        buf.put_u32_le(self.channel_id);
        buf.put_u32_le(self.token_id);
        buf.put_u32_le(self.revised_lifetime_ms);
        write_byte_string(&mut buf, &self.server_nonce);
        write_byte_string(&mut buf, &self.server_certificate);
        buf.to_vec()
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, Error> {
        let mut buf = Bytes::copy_from_slice(bytes);
        Ok(Self {
            channel_id: read_u32(&mut buf)?,
            token_id: read_u32(&mut buf)?,
            revised_lifetime_ms: read_u32(&mut buf)?,
            server_nonce: read_byte_string(&mut buf)?,
            server_certificate: read_byte_string(&mut buf)?,
        })
    }
}

/// Body of an `Error` frame sent by the peer before it abandons the connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrorMessage {
    pub reason: String,
}

impl ErrorMessage {
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = BytesMut::new();
        write_string(&mut buf, &self.reason);
        buf.to_vec()
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, Error> {
        let mut buf = Bytes::copy_from_slice(bytes);
        Ok(Self {
            reason: read_string(&mut buf)?,
        })
    }
}

/// Distinguishes the fault categories a server may answer a session control request with,
/// so the client can map them onto the right error kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultCode {
    General,
    SessionRejected,
    ActivationRejected,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceFault {
    pub code: FaultCode,
    pub reason: String,
}

/// The user identity carried inside a session activation request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WireIdentityToken {
    Anonymous,
    UserName { user: String, password: Vec<u8> },
    X509 { certificate: Vec<u8>, signature: Vec<u8> },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreateSessionRequest {
    pub application_name: String,
    pub application_uri: String,
    pub endpoint_url: String,
    pub session_name: String,
    pub client_nonce: Vec<u8>,
    pub client_certificate: Vec<u8>,
    pub requested_session_timeout_ms: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreateSessionResponse {
    pub session_id: u32,
    pub auth_token: Vec<u8>,
    pub server_nonce: Vec<u8>,
    pub server_certificate: Vec<u8>,
    pub revised_session_timeout_ms: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActivateSessionRequest {
    pub locale_ids: Vec<String>,
    pub identity: WireIdentityToken,
    pub client_signature: Vec<u8>,
}

/// The service-level payload of a `Message` frame. Session control messages are owned by
/// this core; `UserService` wraps the caller's opaque encoded request or response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServicePayload {
    CreateSession(CreateSessionRequest),
    CreateSessionResponse(CreateSessionResponse),
    ActivateSession(ActivateSessionRequest),
    ActivateSessionResponse,
    CloseSession { delete_subscriptions: bool },
    CloseSessionResponse,
    UserService(Vec<u8>),
    UserServiceResponse(Vec<u8>),
    Fault(ServiceFault),
}

/// The body of every `Message` frame: the session authentication token followed by the
/// service payload. The token is empty until a session has been created.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceMessage {
    pub auth_token: Vec<u8>,
    pub payload: ServicePayload,
}

impl ServiceMessage {
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = BytesMut::new();
        write_byte_string(&mut buf, &self.auth_token);
        match &self.payload {
            ServicePayload::CreateSession(r) => {
                buf.put_u8(1);
                write_string(&mut buf, &r.application_name);
                write_string(&mut buf, &r.application_uri);
                write_string(&mut buf, &r.endpoint_url);
                write_string(&mut buf, &r.session_name);
                write_byte_string(&mut buf, &r.client_nonce);
                write_byte_string(&mut buf, &r.client_certificate);
                buf.put_u32_le(r.requested_session_timeout_ms);
            }
            ServicePayload::CreateSessionResponse(r) => {
                buf.put_u8(2);
                buf.put_u32_le(r.session_id);
                write_byte_string(&mut buf, &r.auth_token);
                write_byte_string(&mut buf, &r.server_nonce);
                write_byte_string(&mut buf, &r.server_certificate);
                buf.put_u32_le(r.revised_session_timeout_ms);
            }
            ServicePayload::ActivateSession(r) => {
                buf.put_u8(3);
                buf.put_u32_le(r.locale_ids.len() as u32);
                for locale in &r.locale_ids {
                    write_string(&mut buf, locale);
                }
                match &r.identity {
                    WireIdentityToken::Anonymous => buf.put_u8(0),
                    WireIdentityToken::UserName { user, password } => {
                        buf.put_u8(1);
                        write_string(&mut buf, user);
                        write_byte_string(&mut buf, password);
                    }
                    WireIdentityToken::X509 {
                        certificate,
                        signature,
                    } => {
                        buf.put_u8(2);
                        write_byte_string(&mut buf, certificate);
                        write_byte_string(&mut buf, signature);
                    }
                }
                write_byte_string(&mut buf, &r.client_signature);
            }
            ServicePayload::ActivateSessionResponse => {
                buf.put_u8(4);
            }
            ServicePayload::CloseSession {
                delete_subscriptions,
            } => {
                buf.put_u8(5);
                buf.put_u8(u8::from(*delete_subscriptions));
            }
            ServicePayload::CloseSessionResponse => {
                buf.put_u8(6);
            }
            ServicePayload::UserService(payload) => {
                buf.put_u8(7);
                buf.put_slice(payload);
            }
            ServicePayload::UserServiceResponse(payload) => {
                buf.put_u8(8);
                buf.put_slice(payload);
            }
            ServicePayload::Fault(fault) => {
                buf.put_u8(9);
                buf.put_u8(match fault.code {
                    FaultCode::General => 0,
                    FaultCode::SessionRejected => 1,
                    FaultCode::ActivationRejected => 2,
                });
                write_string(&mut buf, &fault.reason);
            }
        }
        buf.to_vec()
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, Error> {
        let mut buf = Bytes::copy_from_slice(bytes);
        let auth_token = read_byte_string(&mut buf)?;
        let kind = read_u8(&mut buf)?;
        let payload = match kind {
            1 => ServicePayload::CreateSession(CreateSessionRequest {
                application_name: read_string(&mut buf)?,
                application_uri: read_string(&mut buf)?,
                endpoint_url: read_string(&mut buf)?,
                session_name: read_string(&mut buf)?,
                client_nonce: read_byte_string(&mut buf)?,
                client_certificate: read_byte_string(&mut buf)?,
                requested_session_timeout_ms: read_u32(&mut buf)?,
            }),
            2 => ServicePayload::CreateSessionResponse(CreateSessionResponse {
                session_id: read_u32(&mut buf)?,
                auth_token: read_byte_string(&mut buf)?,
                server_nonce: read_byte_string(&mut buf)?,
                server_certificate: read_byte_string(&mut buf)?,
                revised_session_timeout_ms: read_u32(&mut buf)?,
            }),
            3 => {
                let locale_count = read_u32(&mut buf)? as usize;
                if locale_count > 256 {
                    return Err(Error::decoding("locale count exceeds sanity limit"));
                }
                let mut locale_ids = Vec::with_capacity(locale_count);
                for _ in 0..locale_count {
                    locale_ids.push(read_string(&mut buf)?);
                }
                let identity = match read_u8(&mut buf)? {
                    0 => WireIdentityToken::Anonymous,
                    1 => WireIdentityToken::UserName {
                        user: read_string(&mut buf)?,
                        password: read_byte_string(&mut buf)?,
                    },
                    2 => WireIdentityToken::X509 {
                        certificate: read_byte_string(&mut buf)?,
                        signature: read_byte_string(&mut buf)?,
                    },
                    v => return Err(Error::Decoding(format!("unknown identity token kind {}", v))),
                };
                ServicePayload::ActivateSession(ActivateSessionRequest {
                    locale_ids,
                    identity,
                    client_signature: read_byte_string(&mut buf)?,
                })
            }
            4 => ServicePayload::ActivateSessionResponse,
            5 => ServicePayload::CloseSession {
                delete_subscriptions: read_u8(&mut buf)? != 0,
            },
            6 => ServicePayload::CloseSessionResponse,
            7 => ServicePayload::UserService(buf.to_vec()),
            8 => ServicePayload::UserServiceResponse(buf.to_vec()),
            9 => {
                let code = match read_u8(&mut buf)? {
                    1 => FaultCode::SessionRejected,
                    2 => FaultCode::ActivationRejected,
                    _ => FaultCode::General,
                };
                ServicePayload::Fault(ServiceFault {
                    code,
                    reason: read_string(&mut buf)?,
                })
            }
            v => return Err(Error::Decoding(format!("unknown service payload kind {}", v))),
        };
        Ok(Self {
            auth_token,
            payload,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_header_roundtrip() {
        let frame = Frame {
            header: FrameHeader::new(MessageType::Message, 7, 3, 42, 9),
            body: vec![1, 2, 3, 4],
        };
        let decoded = Frame::decode(&frame.encode()).unwrap();
        assert_eq!(decoded, frame);
    }

    #[test]
    fn truncated_frame_is_rejected() {
        assert!(Frame::decode(&[6, 0, 0]).is_err());
        assert!(matches!(
            Frame::decode(&[99, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0]),
            Err(Error::Decoding(_))
        ));
    }

    #[test]
    fn open_channel_request_roundtrip() {
        let request = OpenChannelRequest {
            request_type: SecurityTokenRequestType::Renew,
            security_policy: SecurityPolicy::Basic256Sha256,
            security_mode: MessageSecurityMode::SignAndEncrypt,
            client_nonce: vec![1; 32],
            client_certificate: vec![2; 16],
            requested_lifetime_ms: 60_000,
        };
        assert_eq!(
            OpenChannelRequest::decode(&request.encode()).unwrap(),
            request
        );
    }

    #[test]
    fn endpoints_roundtrip() {
        let response = GetEndpointsResponse {
            endpoints: vec![EndpointDescription {
                endpoint_url: "opc.tcp://localhost:4855/".to_string(),
                transport_profile_uri: "uatcp".to_string(),
                security_policy: SecurityPolicy::Basic256Sha256,
                security_mode: MessageSecurityMode::Sign,
                security_level: 30,
                server_certificate: vec![1, 2, 3],
            }],
        };
        assert_eq!(
            GetEndpointsResponse::decode(&response.encode()).unwrap(),
            response
        );
    }

    #[test]
    fn absurd_endpoint_count_is_rejected() {
        // A count prefix promising millions of endpoints must fail before any
        // allocation sized from it.
        let bytes = (u32::MAX).to_le_bytes();
        assert!(matches!(
            GetEndpointsResponse::decode(&bytes),
            Err(Error::Decoding(_))
        ));

        let bytes = ((MAX_ENDPOINT_COUNT + 1) as u32).to_le_bytes();
        assert!(matches!(
            GetEndpointsResponse::decode(&bytes),
            Err(Error::Decoding(_))
        ));
    }

    #[test]
    fn activate_session_roundtrip() {
        let message = ServiceMessage {
            auth_token: vec![9; 16],
            payload: ServicePayload::ActivateSession(ActivateSessionRequest {
                locale_ids: vec!["en".to_string(), "de".to_string()],
                identity: WireIdentityToken::UserName {
                    user: "sample1".to_string(),
                    password: b"sample1pwd".to_vec(),
                },
                client_signature: vec![4; 32],
            }),
        };
        assert_eq!(ServiceMessage::decode(&message.encode()).unwrap(), message);
    }

    #[test]
    fn user_service_payload_is_carried_verbatim() {
        let opaque = vec![0xde, 0xad, 0xbe, 0xef];
        let message = ServiceMessage {
            auth_token: Vec::new(),
            payload: ServicePayload::UserService(opaque.clone()),
        };
        match ServiceMessage::decode(&message.encode()).unwrap().payload {
            ServicePayload::UserService(p) => assert_eq!(p, opaque),
            other => panic!("unexpected payload {:?}", other),
        }
    }

    #[test]
    fn fault_roundtrip() {
        let message = ServiceMessage {
            auth_token: Vec::new(),
            payload: ServicePayload::Fault(ServiceFault {
                code: FaultCode::ActivationRejected,
                reason: "bad credentials".to_string(),
            }),
        };
        assert_eq!(ServiceMessage::decode(&message.encode()).unwrap(), message);
    }
}
