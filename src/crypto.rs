// OPCUA for Rust
// SPDX-License-Identifier: MPL-2.0
// Copyright (C) 2017-2024 Adam Lock

//! Symmetric cryptography for the secure channel - nonce generation, P_SHA key
//! derivation, HMAC message signatures and AES-CBC encryption - plus the certificate
//! validation seam.
//!
//! Asymmetric operations are not performed here. Peer certificates are judged by a
//! [`CertificateValidator`] and proof-of-possession signatures are produced by the
//! application's [`IdentityProvider`](crate::identity::IdentityProvider).

use aes::cipher::{
    block_padding::NoPadding, generic_array::GenericArray, BlockDecryptMut, BlockEncryptMut,
    KeyIvInit,
};
use hmac::{Hmac, Mac};
use rand::RngCore;
use sha1::Sha1;
use sha2::Sha256;

use crate::error::Error;

type HmacSha1 = Hmac<Sha1>;
type HmacSha256 = Hmac<Sha256>;

type Aes128CbcEnc = cbc::Encryptor<aes::Aes128>;
type Aes128CbcDec = cbc::Decryptor<aes::Aes128>;
type Aes256CbcEnc = cbc::Encryptor<aes::Aes256>;
type Aes256CbcDec = cbc::Decryptor<aes::Aes256>;

pub const SHA1_SIZE: usize = 20;
pub const SHA256_SIZE: usize = 32;
pub const AES_BLOCK_SIZE: usize = 16;

const AES128_KEY_SIZE: usize = 16;
const AES256_KEY_SIZE: usize = 32;

type AesBlock = GenericArray<u8, <aes::Aes128 as aes::cipher::BlockSizeUser>::BlockSize>;
type Aes256Key = GenericArray<u8, <aes::Aes256 as aes::cipher::KeySizeUser>::KeySize>;

/// Fills a buffer of `length` cryptographically random bytes, used for channel and
/// session nonces.
pub fn random_bytes(length: usize) -> Vec<u8> {
    let mut bytes = vec![0u8; length];
    rand::thread_rng().fill_bytes(&mut bytes);
    bytes
}

/// The symmetric key material derived for one direction of a secure channel token.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DerivedKeys {
    pub signing_key: Vec<u8>,
    pub encryption_key: Vec<u8>,
    pub iv: Vec<u8>,
}

impl DerivedKeys {
    /// Derives signing key, encryption key and IV from a secret / seed nonce pair using
    /// the policy's P_SHA function. Key offsets follow OPC UA Part 6: signing key first,
    /// then encryption key, then IV.
    pub fn derive(
        secret: &[u8],
        seed: &[u8],
        signing_key_size: usize,
        encryption_key_size: usize,
        use_sha1: bool,
    ) -> DerivedKeys {
        let length = signing_key_size + encryption_key_size + AES_BLOCK_SIZE;
        let bytes = if use_sha1 {
            p_sha1(secret, seed, length)
        } else {
            p_sha256(secret, seed, length)
        };
        let signing_key = bytes[..signing_key_size].to_vec();
        let encryption_key =
            bytes[signing_key_size..signing_key_size + encryption_key_size].to_vec();
        let iv = bytes[signing_key_size + encryption_key_size..].to_vec();
        DerivedKeys {
            signing_key,
            encryption_key,
            iv,
        }
    }
}

/// Pseudo random `P_SHA` implementation for creating a pseudo random range of bytes from
/// an input
///
/// <https://tools.ietf.org/html/rfc5246>
///
/// P_SHA(secret, seed) = HMAC_SHA(secret, A(1) + seed) +
///                       HMAC_SHA(secret, A(2) + seed) + ...
///
/// Where A(0) = seed and A(n) = HMAC_SHA(secret, A(n-1)).
fn p_hash<M: Mac + hmac::digest::KeyInit>(secret: &[u8], seed: &[u8], length: usize) -> Vec<u8> {
    let mut result = Vec::with_capacity(length);

    let mut a_last = seed.to_vec(); // A(0) = seed

    while result.len() < length {
        // A(n) = HMAC_SHA(secret, A(n-1))
        let a_next = sign_generic::<M>(secret, &a_last);

        let mut input = Vec::with_capacity(a_next.len() + seed.len());
        input.extend_from_slice(&a_next);
        input.extend_from_slice(seed);
        result.extend_from_slice(&sign_generic::<M>(secret, &input));

        a_last = a_next;
    }

    result.truncate(length);
    result
}

pub fn p_sha1(secret: &[u8], seed: &[u8], length: usize) -> Vec<u8> {
    p_hash::<HmacSha1>(secret, seed, length)
}

pub fn p_sha256(secret: &[u8], seed: &[u8], length: usize) -> Vec<u8> {
    p_hash::<HmacSha256>(secret, seed, length)
}

fn sign_generic<M: Mac + hmac::digest::KeyInit>(key: &[u8], data: &[u8]) -> Vec<u8> {
    // HMAC accepts keys of any length so this cannot fail
    let mut mac = <M as Mac>::new_from_slice(key).unwrap();
    mac.update(data);
    mac.finalize().into_bytes().to_vec()
}

pub fn hmac_sha1(key: &[u8], data: &[u8]) -> Vec<u8> {
    sign_generic::<HmacSha1>(key, data)
}

pub fn hmac_sha256(key: &[u8], data: &[u8]) -> Vec<u8> {
    sign_generic::<HmacSha256>(key, data)
}

/// Verify that the HMAC for the data block matches the supplied signature
pub fn verify_hmac_sha1(key: &[u8], data: &[u8], signature: &[u8]) -> bool {
    if signature.len() != SHA1_SIZE {
        return false;
    }
    let mut mac = HmacSha1::new_from_slice(key).unwrap();
    mac.update(data);
    mac.verify_slice(signature).is_ok()
}

/// Verify that the HMAC for the data block matches the supplied signature
pub fn verify_hmac_sha256(key: &[u8], data: &[u8], signature: &[u8]) -> bool {
    if signature.len() != SHA256_SIZE {
        return false;
    }
    let mut mac = HmacSha256::new_from_slice(key).unwrap();
    mac.update(data);
    mac.verify_slice(signature).is_ok()
}

fn validate_aes_args(key: &[u8], iv: &[u8], src: &[u8]) -> Result<(), Error> {
    if key.len() != AES128_KEY_SIZE && key.len() != AES256_KEY_SIZE {
        error!("AES key is an unexpected size, len = {}", key.len());
        Err(Error::SecurityNegotiation(
            "symmetric encryption key has an invalid length".to_string(),
        ))
    } else if iv.len() != AES_BLOCK_SIZE {
        error!("IV is not an expected size, len = {}", iv.len());
        Err(Error::SecurityNegotiation(
            "symmetric IV has an invalid length".to_string(),
        ))
    } else if src.len() % AES_BLOCK_SIZE != 0 {
        Err(Error::decoding(
            "encrypted block is not a multiple of the cipher block size",
        ))
    } else {
        Ok(())
    }
}

/// Encrypts `src` with AES-CBC. The input must already be padded to the block size; the
/// key length selects AES-128 or AES-256.
pub fn encrypt_aes_cbc(key: &[u8], iv: &[u8], src: &[u8]) -> Result<Vec<u8>, Error> {
    validate_aes_args(key, iv, src)?;
    let mut dst = vec![0u8; src.len()];
    let result = if key.len() == AES128_KEY_SIZE {
        Aes128CbcEnc::new(AesBlock::from_slice(key), AesBlock::from_slice(iv))
            .encrypt_padded_b2b_mut::<NoPadding>(src, &mut dst)
    } else {
        Aes256CbcEnc::new(Aes256Key::from_slice(key), AesBlock::from_slice(iv))
            .encrypt_padded_b2b_mut::<NoPadding>(src, &mut dst)
    };
    result.map_err(|_| Error::decoding("symmetric encryption failed"))?;
    Ok(dst)
}

/// Decrypts `src` with AES-CBC. The caller strips padding afterwards.
pub fn decrypt_aes_cbc(key: &[u8], iv: &[u8], src: &[u8]) -> Result<Vec<u8>, Error> {
    validate_aes_args(key, iv, src)?;
    let mut dst = vec![0u8; src.len()];
    let result = if key.len() == AES128_KEY_SIZE {
        Aes128CbcDec::new(AesBlock::from_slice(key), AesBlock::from_slice(iv))
            .decrypt_padded_b2b_mut::<NoPadding>(src, &mut dst)
    } else {
        Aes256CbcDec::new(Aes256Key::from_slice(key), AesBlock::from_slice(iv))
            .decrypt_padded_b2b_mut::<NoPadding>(src, &mut dst)
    };
    result.map_err(|_| Error::decoding("symmetric decryption failed"))?;
    Ok(dst)
}

/// Judges peer certificates during negotiation. Parsing, trust chains and revocation are
/// the implementor's concern; the channel only wants an accept / reject answer.
pub trait CertificateValidator: Send + Sync {
    /// Returns `Ok(())` to accept the DER encoded certificate, or an
    /// [`Error::SecurityNegotiation`] naming the reason to reject it.
    fn validate(&self, certificate: &[u8]) -> Result<(), Error>;
}

/// Accepts any certificate without inspection. For testing only - never use this as a
/// production validator.
pub struct AllowAllValidator;

impl CertificateValidator for AllowAllValidator {
    fn validate(&self, _certificate: &[u8]) -> Result<(), Error> {
        Ok(())
    }
}

/// Accepts exactly the certificates in its trust list, byte for byte. The default
/// validator used by [`ClientBuilder`](crate::ClientBuilder) starts with an empty trust
/// list, i.e. it rejects everything until the application trusts a certificate.
#[derive(Default)]
pub struct TrustedCertificates {
    trusted: Vec<Vec<u8>>,
}

impl TrustedCertificates {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn trust(&mut self, certificate: &[u8]) {
        self.trusted.push(certificate.to_vec());
    }
}

impl CertificateValidator for TrustedCertificates {
    fn validate(&self, certificate: &[u8]) -> Result<(), Error> {
        if certificate.is_empty() {
            return Err(Error::SecurityNegotiation(
                "peer supplied an empty certificate".to_string(),
            ));
        }
        if self.trusted.iter().any(|c| c == certificate) {
            Ok(())
        } else {
            Err(Error::SecurityNegotiation(
                "peer certificate is not in the trust list".to_string(),
            ))
        }
    }
}
