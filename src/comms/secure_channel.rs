// OPCUA for Rust
// SPDX-License-Identifier: MPL-2.0
// Copyright (C) 2017-2024 Adam Lock

//! The cryptographic state of one secure channel: negotiated policy and mode, the nonce
//! pair, the derived symmetric keys for each direction, the security token and both
//! sequence counters.
//!
//! The struct is shared between the channel handle and the message pump behind a
//! `RwLock`; the pump is the only writer of the sequence counters, which is what makes
//! outbound numbering strictly increasing.

use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::comms::message::{Frame, FrameHeader, MessageType, FRAME_HEADER_SIZE};
use crate::crypto::{self, DerivedKeys, AES_BLOCK_SIZE};
use crate::endpoint::{MessageSecurityMode, SecurityPolicy};
use crate::error::Error;

/// The fraction of the token lifetime after which a renewal should be requested.
/// Renewing at 75% leaves plenty of margin before hard expiry.
const TOKEN_RENEWAL_THRESHOLD: f64 = 0.75;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Client,
    Server,
}

/// Cryptographic state for one secure channel. Either end of a conversation holds one of
/// these; the [`Role`] decides which derived key set is used for which direction.
#[derive(Debug)]
pub struct SecureChannel {
    role: Role,
    security_policy: SecurityPolicy,
    security_mode: MessageSecurityMode,
    channel_id: u32,
    token_id: u32,
    token_created_at: DateTime<Utc>,
    token_lifetime: Duration,
    local_nonce: Vec<u8>,
    remote_nonce: Vec<u8>,
    remote_certificate: Vec<u8>,
    send_keys: Option<DerivedKeys>,
    recv_keys: Option<DerivedKeys>,
    /// Keys of the previous token generation. A renewal must not break a response that
    /// was secured before the peer switched tokens.
    previous_recv_keys: Option<(u32, DerivedKeys)>,
    sequence_number_out: u32,
    sequence_number_in: u32,
}

impl SecureChannel {
    pub fn new(role: Role, security_policy: SecurityPolicy, security_mode: MessageSecurityMode) -> Self {
        Self {
            role,
            security_policy,
            security_mode,
            channel_id: 0,
            token_id: 0,
            token_created_at: Utc::now(),
            token_lifetime: Duration::ZERO,
            local_nonce: Vec::new(),
            remote_nonce: Vec::new(),
            remote_certificate: Vec::new(),
            send_keys: None,
            recv_keys: None,
            previous_recv_keys: None,
            sequence_number_out: 0,
            sequence_number_in: 0,
        }
    }

    pub fn is_client_role(&self) -> bool {
        self.role == Role::Client
    }

    pub fn security_policy(&self) -> SecurityPolicy {
        self.security_policy
    }

    pub fn security_mode(&self) -> MessageSecurityMode {
        self.security_mode
    }

    pub fn channel_id(&self) -> u32 {
        self.channel_id
    }

    pub fn token_id(&self) -> u32 {
        self.token_id
    }

    pub fn local_nonce(&self) -> &[u8] {
        &self.local_nonce
    }

    pub fn remote_nonce(&self) -> &[u8] {
        &self.remote_nonce
    }

    pub fn set_local_nonce(&mut self, nonce: &[u8]) {
        self.local_nonce = nonce.to_vec();
    }

    pub fn set_remote_nonce(&mut self, nonce: &[u8]) {
        self.remote_nonce = nonce.to_vec();
    }

    /// Creates a fresh random local nonce of the policy's length.
    pub fn create_random_nonce(&mut self) {
        self.local_nonce = self.security_policy.random_nonce();
    }

    pub fn remote_certificate(&self) -> &[u8] {
        &self.remote_certificate
    }

    pub fn set_remote_certificate(&mut self, certificate: &[u8]) {
        self.remote_certificate = certificate.to_vec();
    }

    /// Installs a security token. On renewal this replaces the derived keys and expiry
    /// while the channel id stays the same; the previous inbound keys are retained so a
    /// response secured under the old token still verifies.
    pub fn set_security_token(&mut self, channel_id: u32, token_id: u32, lifetime: Duration) {
        if self.channel_id != 0 && self.channel_id != channel_id {
            warn!(
                "security token changes channel id {} -> {}",
                self.channel_id, channel_id
            );
        }
        if let Some(old_keys) = self.recv_keys.take() {
            self.previous_recv_keys = Some((self.token_id, old_keys));
        }
        self.channel_id = channel_id;
        self.token_id = token_id;
        self.token_created_at = Utc::now();
        self.token_lifetime = lifetime;
    }

    /// Clears all cryptographic material. Called when the channel closes, regardless of
    /// whether the close notification was delivered.
    pub fn clear_security(&mut self) {
        self.local_nonce.clear();
        self.remote_nonce.clear();
        self.send_keys = None;
        self.recv_keys = None;
        self.previous_recv_keys = None;
    }

    fn is_symmetrically_secured(&self) -> bool {
        self.security_policy != SecurityPolicy::None
            && matches!(
                self.security_mode,
                MessageSecurityMode::Sign | MessageSecurityMode::SignAndEncrypt
            )
    }

    /// Derives the symmetric key sets for both directions from the current nonce pair.
    pub fn derive_keys(&mut self) {
        if !self.is_symmetrically_secured() {
            return;
        }
        let signing_key_size = self.security_policy.signing_key_size();
        let encryption_key_size = self.security_policy.encryption_key_size();
        let use_sha1 = self.security_policy.is_sha1();
        // Key material sent by this end is derived from (remote nonce, local nonce),
        // the peer mirrors this for its inbound keys.
        self.send_keys = Some(DerivedKeys::derive(
            &self.remote_nonce,
            &self.local_nonce,
            signing_key_size,
            encryption_key_size,
            use_sha1,
        ));
        self.recv_keys = Some(DerivedKeys::derive(
            &self.local_nonce,
            &self.remote_nonce,
            signing_key_size,
            encryption_key_size,
            use_sha1,
        ));
    }

    fn token_elapsed(&self) -> Duration {
        (Utc::now() - self.token_created_at)
            .to_std()
            .unwrap_or(Duration::ZERO)
    }

    /// True once the token is past its renewal threshold.
    pub fn should_renew_security_token(&self) -> bool {
        if self.token_id == 0 || self.token_lifetime.is_zero() {
            false
        } else {
            self.token_elapsed().as_secs_f64()
                > self.token_lifetime.as_secs_f64() * TOKEN_RENEWAL_THRESHOLD
        }
    }

    /// True once the token is past its hard expiry.
    pub fn token_has_expired(&self) -> bool {
        if self.token_id == 0 || self.token_lifetime.is_zero() {
            false
        } else {
            self.token_elapsed() > self.token_lifetime
        }
    }

    /// The next outbound sequence number. Callers must hold the channel's write lock and
    /// serialize their send path; the pump task is the single writer.
    pub fn next_sequence_number(&mut self) -> u32 {
        self.sequence_number_out += 1;
        self.sequence_number_out
    }

    pub fn sequence_number_out(&self) -> u32 {
        self.sequence_number_out
    }

    pub fn sequence_number_in(&self) -> u32 {
        self.sequence_number_in
    }

    /// Which frames carry message security. Handshake and discovery frames do not - they
    /// precede the keys, or carry none.
    fn frame_is_secured(message_type: MessageType) -> bool {
        matches!(
            message_type,
            MessageType::Message | MessageType::CloseSecureChannel
        )
    }

    fn send_keys(&self) -> Result<&DerivedKeys, Error> {
        self.send_keys.as_ref().ok_or_else(|| {
            Error::SecurityNegotiation("no derived keys to secure an outbound message".to_string())
        })
    }

    fn recv_keys_for_token(&self, token_id: u32) -> Result<&DerivedKeys, Error> {
        if token_id == self.token_id {
            self.recv_keys.as_ref().ok_or_else(|| {
                Error::SecurityNegotiation(
                    "no derived keys to verify an inbound message".to_string(),
                )
            })
        } else {
            match &self.previous_recv_keys {
                Some((previous_id, keys)) if *previous_id == token_id => Ok(keys),
                _ => Err(Error::SecurityNegotiation(format!(
                    "message secured with unknown token id {}",
                    token_id
                ))),
            }
        }
    }

    fn sign(&self, keys: &DerivedKeys, data: &[u8]) -> Vec<u8> {
        if self.security_policy.is_sha1() {
            crypto::hmac_sha1(&keys.signing_key, data)
        } else {
            crypto::hmac_sha256(&keys.signing_key, data)
        }
    }

    fn verify(&self, keys: &DerivedKeys, data: &[u8], signature: &[u8]) -> bool {
        if self.security_policy.is_sha1() {
            crypto::verify_hmac_sha1(&keys.signing_key, data, signature)
        } else {
            crypto::verify_hmac_sha256(&keys.signing_key, data, signature)
        }
    }

    /// Encodes and secures a frame for transmission according to the channel's mode.
    ///
    /// The signature covers the plaintext header and body. In `SignAndEncrypt` the body
    /// and signature are padded and encrypted; the header stays readable so the receiver
    /// can route the frame before decrypting.
    pub fn apply_security(&self, frame: &Frame) -> Result<Vec<u8>, Error> {
        if !Self::frame_is_secured(frame.header.message_type) || !self.is_symmetrically_secured() {
            return Ok(frame.encode());
        }
        let keys = self.send_keys()?;
        let encoded = frame.encode();
        let (header_bytes, body_bytes) = encoded.split_at(FRAME_HEADER_SIZE);

        let signature = self.sign(keys, &encoded);
        let mut secured = Vec::with_capacity(encoded.len() + signature.len() + AES_BLOCK_SIZE);
        secured.extend_from_slice(header_bytes);

        match self.security_mode {
            MessageSecurityMode::Sign => {
                secured.extend_from_slice(body_bytes);
                secured.extend_from_slice(&signature);
            }
            MessageSecurityMode::SignAndEncrypt => {
                let mut plain = Vec::with_capacity(body_bytes.len() + signature.len() + AES_BLOCK_SIZE);
                plain.extend_from_slice(body_bytes);
                plain.extend_from_slice(&signature);
                // Pad to the cipher block size; the final byte records the pad length
                let pad_size = (AES_BLOCK_SIZE - (plain.len() + 1) % AES_BLOCK_SIZE) % AES_BLOCK_SIZE;
                plain.extend(std::iter::repeat(pad_size as u8).take(pad_size + 1));
                let cipher = crypto::encrypt_aes_cbc(&keys.encryption_key, &keys.iv, &plain)?;
                secured.extend_from_slice(&cipher);
            }
            _ => unreachable!("secured send with mode {}", self.security_mode),
        }
        Ok(secured)
    }

    /// Verifies, decrypts and decodes an inbound message, then enforces the sequence
    /// number invariant: any frame on this channel whose sequence number does not
    /// strictly increase is rejected as [`Error::ReplayOrOutOfOrder`], which is fatal.
    pub fn verify_and_remove_security(&mut self, bytes: &[u8]) -> Result<Frame, Error> {
        let mut buf = bytes::Bytes::copy_from_slice(bytes);
        let header = FrameHeader::decode_from(&mut buf)?;

        let frame = if Self::frame_is_secured(header.message_type) && self.is_symmetrically_secured()
        {
            let keys = self.recv_keys_for_token(header.token_id)?;
            let header_bytes = &bytes[..FRAME_HEADER_SIZE];
            let rest = &bytes[FRAME_HEADER_SIZE..];

            let body = match self.security_mode {
                MessageSecurityMode::Sign => {
                    let signature_size = self.security_policy.symmetric_signature_size();
                    if rest.len() < signature_size {
                        return Err(Error::decoding("secured frame shorter than its signature"));
                    }
                    let (body, signature) = rest.split_at(rest.len() - signature_size);
                    let mut signed = Vec::with_capacity(FRAME_HEADER_SIZE + body.len());
                    signed.extend_from_slice(header_bytes);
                    signed.extend_from_slice(body);
                    if !self.verify(keys, &signed, signature) {
                        return Err(Error::SecurityNegotiation(
                            "message signature verification failed".to_string(),
                        ));
                    }
                    body.to_vec()
                }
                MessageSecurityMode::SignAndEncrypt => {
                    let plain = crypto::decrypt_aes_cbc(&keys.encryption_key, &keys.iv, rest)?;
                    let Some(&pad_size) = plain.last() else {
                        return Err(Error::decoding("decrypted body is empty"));
                    };
                    let signature_size = self.security_policy.symmetric_signature_size();
                    let stripped_len = plain
                        .len()
                        .checked_sub(pad_size as usize + 1)
                        .filter(|len| *len >= signature_size)
                        .ok_or_else(|| Error::decoding("decrypted body has invalid padding"))?;
                    let (body, signature) = plain[..stripped_len].split_at(stripped_len - signature_size);
                    let mut signed = Vec::with_capacity(FRAME_HEADER_SIZE + body.len());
                    signed.extend_from_slice(header_bytes);
                    signed.extend_from_slice(body);
                    if !self.verify(keys, &signed, signature) {
                        return Err(Error::SecurityNegotiation(
                            "message signature verification failed".to_string(),
                        ));
                    }
                    body.to_vec()
                }
                _ => unreachable!("secured receive with mode {}", self.security_mode),
            };
            Frame { header, body }
        } else {
            Frame {
                header,
                body: buf.to_vec(),
            }
        };

        // Sequence numbers apply to channel traffic, not to the channel-less discovery
        // exchange.
        if frame.header.channel_id != 0 || frame.header.sequence_number != 0 {
            if frame.header.sequence_number <= self.sequence_number_in {
                error!(
                    "inbound sequence number {} does not advance past {}",
                    frame.header.sequence_number, self.sequence_number_in
                );
                return Err(Error::ReplayOrOutOfOrder);
            }
            self.sequence_number_in = frame.header.sequence_number;
        }

        Ok(frame)
    }
}
