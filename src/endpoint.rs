// OPCUA for Rust
// SPDX-License-Identifier: MPL-2.0
// Copyright (C) 2017-2024 Adam Lock

//! Endpoint catalog and selector.
//!
//! [`discover`] performs a stateless query against a server and returns the endpoint
//! descriptions it advertises. The `filter_by_*` / [`sort_by_security_level`] functions
//! are pure value transformations over that sequence: filters never reorder survivors and
//! the sort is stable ascending, so `endpoints.last()` deterministically means "most
//! secure".

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use url::Url;

use crate::comms::message::{Frame, FrameHeader, GetEndpointsRequest, MessageType};
use crate::error::Error;
use crate::transport::TransportConnector;

pub const OPC_TCP_SCHEME: &str = "opc.tcp";

const DEFAULT_OPC_UA_SERVER_PORT: u16 = 4840;

/// Creates a `Url` from the input string, supplying a default port if necessary.
fn opc_url_from_str(s: &str) -> Result<Url, ()> {
    Url::parse(s)
        .map(|mut url| {
            if url.port().is_none() {
                // If no port is supplied, then treat it as the default port 4840
                let _ = url.set_port(Some(DEFAULT_OPC_UA_SERVER_PORT));
            }
            url
        })
        .map_err(|err| {
            error!("Cannot parse url \"{}\", error = {:?}", s, err);
        })
}

/// Tests if this is a valid url over the binary protocol scheme.
pub fn is_opc_ua_binary_url(url: &str) -> bool {
    if let Ok(url) = opc_url_from_str(url) {
        url.scheme() == OPC_TCP_SCHEME
    } else {
        false
    }
}

/// The security algorithm suites a server may advertise, ordered by strength so that the
/// derived `Ord` ranks `None` lowest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum SecurityPolicy {
    None,
    Basic128Rsa15,
    Basic256,
    Basic256Sha256,
    Aes128Sha256RsaOaep,
    Aes256Sha256RsaPss,
}

// Security policy URIs, as advertised inside endpoint descriptions.
pub const SECURITY_POLICY_NONE_URI: &str = "http://opcfoundation.org/UA/SecurityPolicy#None";
pub const SECURITY_POLICY_BASIC_128_RSA_15_URI: &str =
    "http://opcfoundation.org/UA/SecurityPolicy#Basic128Rsa15";
pub const SECURITY_POLICY_BASIC_256_URI: &str =
    "http://opcfoundation.org/UA/SecurityPolicy#Basic256";
pub const SECURITY_POLICY_BASIC_256_SHA_256_URI: &str =
    "http://opcfoundation.org/UA/SecurityPolicy#Basic256Sha256";
pub const SECURITY_POLICY_AES_128_SHA_256_RSA_OAEP_URI: &str =
    "http://opcfoundation.org/UA/SecurityPolicy#Aes128_Sha256_RsaOaep";
pub const SECURITY_POLICY_AES_256_SHA_256_RSA_PSS_URI: &str =
    "http://opcfoundation.org/UA/SecurityPolicy#Aes256_Sha256_RsaPss";

impl SecurityPolicy {
    pub fn to_uri(self) -> &'static str {
        match self {
            SecurityPolicy::None => SECURITY_POLICY_NONE_URI,
            SecurityPolicy::Basic128Rsa15 => SECURITY_POLICY_BASIC_128_RSA_15_URI,
            SecurityPolicy::Basic256 => SECURITY_POLICY_BASIC_256_URI,
            SecurityPolicy::Basic256Sha256 => SECURITY_POLICY_BASIC_256_SHA_256_URI,
            SecurityPolicy::Aes128Sha256RsaOaep => SECURITY_POLICY_AES_128_SHA_256_RSA_OAEP_URI,
            SecurityPolicy::Aes256Sha256RsaPss => SECURITY_POLICY_AES_256_SHA_256_RSA_PSS_URI,
        }
    }

    pub fn from_uri(uri: &str) -> Result<SecurityPolicy, Error> {
        match uri {
            SECURITY_POLICY_NONE_URI => Ok(SecurityPolicy::None),
            SECURITY_POLICY_BASIC_128_RSA_15_URI => Ok(SecurityPolicy::Basic128Rsa15),
            SECURITY_POLICY_BASIC_256_URI => Ok(SecurityPolicy::Basic256),
            SECURITY_POLICY_BASIC_256_SHA_256_URI => Ok(SecurityPolicy::Basic256Sha256),
            SECURITY_POLICY_AES_128_SHA_256_RSA_OAEP_URI => Ok(SecurityPolicy::Aes128Sha256RsaOaep),
            SECURITY_POLICY_AES_256_SHA_256_RSA_PSS_URI => Ok(SecurityPolicy::Aes256Sha256RsaPss),
            _ => Err(Error::SecurityNegotiation(format!(
                "security policy uri \"{}\" is unknown",
                uri
            ))),
        }
    }

    /// The legacy policies sign with HMAC-SHA1, everything newer with HMAC-SHA256.
    pub fn is_sha1(self) -> bool {
        matches!(
            self,
            SecurityPolicy::Basic128Rsa15 | SecurityPolicy::Basic256
        )
    }

    pub fn symmetric_signature_size(self) -> usize {
        if self.is_sha1() {
            crate::crypto::SHA1_SIZE
        } else {
            crate::crypto::SHA256_SIZE
        }
    }

    pub fn signing_key_size(self) -> usize {
        match self {
            SecurityPolicy::None => 0,
            SecurityPolicy::Basic128Rsa15 => 16,
            SecurityPolicy::Basic256 => 24,
            SecurityPolicy::Basic256Sha256
            | SecurityPolicy::Aes128Sha256RsaOaep
            | SecurityPolicy::Aes256Sha256RsaPss => 32,
        }
    }

    pub fn encryption_key_size(self) -> usize {
        match self {
            SecurityPolicy::None => 0,
            SecurityPolicy::Basic128Rsa15 | SecurityPolicy::Aes128Sha256RsaOaep => 16,
            SecurityPolicy::Basic256
            | SecurityPolicy::Basic256Sha256
            | SecurityPolicy::Aes256Sha256RsaPss => 32,
        }
    }

    pub fn secure_channel_nonce_length(self) -> usize {
        match self {
            SecurityPolicy::None => 0,
            SecurityPolicy::Basic128Rsa15 => 16,
            _ => 32,
        }
    }

    /// A fresh random nonce of the length this policy requires.
    pub fn random_nonce(self) -> Vec<u8> {
        crate::crypto::random_bytes(self.secure_channel_nonce_length())
    }
}

impl fmt::Display for SecurityPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.to_uri())
    }
}

impl FromStr for SecurityPolicy {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        SecurityPolicy::from_uri(s)
    }
}

/// The protection applied to messages on a secure channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageSecurityMode {
    Invalid,
    None,
    Sign,
    SignAndEncrypt,
}

impl MessageSecurityMode {
    pub(crate) fn to_wire(self) -> u8 {
        match self {
            MessageSecurityMode::Invalid => 0,
            MessageSecurityMode::None => 1,
            MessageSecurityMode::Sign => 2,
            MessageSecurityMode::SignAndEncrypt => 3,
        }
    }

    pub(crate) fn from_wire(value: u8) -> MessageSecurityMode {
        match value {
            1 => MessageSecurityMode::None,
            2 => MessageSecurityMode::Sign,
            3 => MessageSecurityMode::SignAndEncrypt,
            _ => MessageSecurityMode::Invalid,
        }
    }
}

impl fmt::Display for MessageSecurityMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            MessageSecurityMode::Invalid => "Invalid",
            MessageSecurityMode::None => "None",
            MessageSecurityMode::Sign => "Sign",
            MessageSecurityMode::SignAndEncrypt => "SignAndEncrypt",
        };
        f.write_str(s)
    }
}

/// A server-advertised combination of network address, security policy and security mode
/// that a client may connect to. Immutable once discovered.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EndpointDescription {
    pub endpoint_url: String,
    pub transport_profile_uri: String,
    pub security_policy: SecurityPolicy,
    pub security_mode: MessageSecurityMode,
    /// Relative ranking assigned by the server, higher is preferred.
    pub security_level: u8,
    /// DER encoded server certificate, empty for policy `None`.
    pub server_certificate: Vec<u8>,
}

/// Returns the subsequence of endpoints whose message security mode equals `security_mode`,
/// preserving discovery order.
pub fn filter_by_security_mode(
    endpoints: &[EndpointDescription],
    security_mode: MessageSecurityMode,
) -> Vec<EndpointDescription> {
    endpoints
        .iter()
        .filter(|e| e.security_mode == security_mode)
        .cloned()
        .collect()
}

/// Returns the subsequence of endpoints whose security policy equals `security_policy`,
/// preserving discovery order.
pub fn filter_by_security_policy(
    endpoints: &[EndpointDescription],
    security_policy: SecurityPolicy,
) -> Vec<EndpointDescription> {
    endpoints
        .iter()
        .filter(|e| e.security_policy == security_policy)
        .cloned()
        .collect()
}

/// Sorts endpoints by security level, lowest first. The sort is stable, ties keep their
/// discovery order, so the last element is the server's most preferred endpoint.
pub fn sort_by_security_level(endpoints: &[EndpointDescription]) -> Vec<EndpointDescription> {
    let mut sorted = endpoints.to_vec();
    sorted.sort_by_key(|e| e.security_level);
    sorted
}

/// Asks the server at `server_url` for the endpoints it advertises.
///
/// The query is stateless - a fresh connection is made and torn down again. An empty
/// result is returned as-is; a caller that needs to connect must treat it as fatal.
pub async fn discover(
    connector: &dyn TransportConnector,
    server_url: &str,
    timeout: Duration,
) -> Result<Vec<EndpointDescription>, Error> {
    debug!("discover, {}", server_url);
    if !is_opc_ua_binary_url(server_url) {
        return Err(Error::Discovery(format!(
            "{} is not a valid opc.tcp url",
            server_url
        )));
    }
    let fut = discover_inner(connector, server_url);
    match tokio::time::timeout(timeout, fut).await {
        Ok(result) => result,
        Err(_) => Err(Error::Discovery(format!(
            "discovery of {} timed out after {:?}",
            server_url, timeout
        ))),
    }
}

async fn discover_inner(
    connector: &dyn TransportConnector,
    server_url: &str,
) -> Result<Vec<EndpointDescription>, Error> {
    let (mut reader, mut writer) = connector
        .connect(server_url)
        .await
        .map_err(|e| Error::Discovery(format!("cannot connect to {}: {}", server_url, e)))?;

    let request = Frame {
        header: FrameHeader::new(MessageType::GetEndpoints, 0, 0, 0, 0),
        body: GetEndpointsRequest {
            endpoint_url: server_url.to_string(),
        }
        .encode(),
    };
    writer
        .send(&request.encode())
        .await
        .map_err(|e| Error::Discovery(format!("cannot send discovery request: {}", e)))?;

    let result = loop {
        let bytes = match reader.receive().await {
            Ok(bytes) => bytes,
            Err(e) => break Err(Error::Discovery(format!("discovery receive failed: {}", e))),
        };
        let frame = match Frame::decode(&bytes) {
            Ok(frame) => frame,
            Err(e) => break Err(Error::Discovery(format!("malformed discovery frame: {}", e))),
        };
        match frame.header.message_type {
            MessageType::GetEndpointsResponse => {
                break crate::comms::message::GetEndpointsResponse::decode(&frame.body)
                    .map(|r| r.endpoints)
                    .map_err(|e| Error::Discovery(format!("malformed endpoint list: {}", e)));
            }
            MessageType::Error => {
                let reason = crate::comms::message::ErrorMessage::decode(&frame.body)
                    .map(|e| e.reason)
                    .unwrap_or_else(|_| "unreadable error message".to_string());
                break Err(Error::Discovery(format!("server refused discovery: {}", reason)));
            }
            other => {
                debug!("discover, ignoring unexpected frame {:?}", other);
            }
        }
    };

    writer.close().await;
    result
}

#[cfg(test)]
mod tests {
    use super::*;

    fn endpoint(policy: SecurityPolicy, mode: MessageSecurityMode, level: u8) -> EndpointDescription {
        EndpointDescription {
            endpoint_url: "opc.tcp://localhost:4855/".to_string(),
            transport_profile_uri: "uatcp".to_string(),
            security_policy: policy,
            security_mode: mode,
            security_level: level,
            server_certificate: Vec::new(),
        }
    }

    fn sample_endpoints() -> Vec<EndpointDescription> {
        vec![
            endpoint(SecurityPolicy::None, MessageSecurityMode::None, 10),
            endpoint(
                SecurityPolicy::Basic256Sha256,
                MessageSecurityMode::SignAndEncrypt,
                50,
            ),
            endpoint(SecurityPolicy::Basic256Sha256, MessageSecurityMode::Sign, 30),
        ]
    }

    #[test]
    fn filter_mode_is_like_for_like() {
        let endpoints = sample_endpoints();
        let filtered = filter_by_security_mode(&endpoints, MessageSecurityMode::SignAndEncrypt);
        assert_eq!(filtered.len(), 1);
        assert!(filtered
            .iter()
            .all(|e| e.security_mode == MessageSecurityMode::SignAndEncrypt));
    }

    #[test]
    fn filter_policy_is_like_for_like_and_preserves_order() {
        let endpoints = sample_endpoints();
        let filtered = filter_by_security_policy(&endpoints, SecurityPolicy::Basic256Sha256);
        assert_eq!(filtered.len(), 2);
        assert!(filtered
            .iter()
            .all(|e| e.security_policy == SecurityPolicy::Basic256Sha256));
        // Discovery order of the survivors is untouched
        assert_eq!(filtered[0].security_level, 50);
        assert_eq!(filtered[1].security_level, 30);
    }

    #[test]
    fn sort_is_ascending_and_last_is_strongest() {
        // Levels [10, 50, 30]: after sorting, the last element is the level 50 endpoint
        let endpoints = sample_endpoints();
        let sorted = sort_by_security_level(&endpoints);
        let levels: Vec<u8> = sorted.iter().map(|e| e.security_level).collect();
        assert_eq!(levels, vec![10, 30, 50]);
        assert_eq!(sorted.last().unwrap().security_level, 50);
    }

    #[test]
    fn sort_is_stable_and_idempotent() {
        let mut endpoints = sample_endpoints();
        // Two endpoints share a level; their relative order must survive the sort
        endpoints.push(endpoint(SecurityPolicy::Basic256, MessageSecurityMode::Sign, 30));
        let once = sort_by_security_level(&endpoints);
        let twice = sort_by_security_level(&once);
        assert_eq!(once, twice);
        let thirties: Vec<SecurityPolicy> = once
            .iter()
            .filter(|e| e.security_level == 30)
            .map(|e| e.security_policy)
            .collect();
        assert_eq!(
            thirties,
            vec![SecurityPolicy::Basic256Sha256, SecurityPolicy::Basic256]
        );
    }

    #[test]
    fn policy_uri_roundtrip() {
        for policy in [
            SecurityPolicy::None,
            SecurityPolicy::Basic128Rsa15,
            SecurityPolicy::Basic256,
            SecurityPolicy::Basic256Sha256,
            SecurityPolicy::Aes128Sha256RsaOaep,
            SecurityPolicy::Aes256Sha256RsaPss,
        ] {
            assert_eq!(SecurityPolicy::from_uri(policy.to_uri()).unwrap(), policy);
        }
        assert!(SecurityPolicy::from_uri("http://example.com/bogus").is_err());
    }

    #[test]
    fn policies_order_by_strength() {
        assert!(SecurityPolicy::None < SecurityPolicy::Basic128Rsa15);
        assert!(SecurityPolicy::Basic256Sha256 < SecurityPolicy::Aes256Sha256RsaPss);
    }

    #[test]
    fn valid_opc_ua_url() {
        assert!(is_opc_ua_binary_url("opc.tcp://foo:4855"));
        assert!(is_opc_ua_binary_url("opc.tcp://foo"));
        assert!(!is_opc_ua_binary_url("http://foo:4855"));
        assert!(!is_opc_ua_binary_url("foo"));
    }
}
