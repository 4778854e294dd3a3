// Copyright (c) 2025 Jonathan Fontanez
// SPDX-License-Identifier: BUSL-1.1

//! Session crypto for the Account Channel: RSA-OAEP key wrap for login,
//! AES-256-CBC for the message envelope, and the account-id derivation.

use crate::error::{FahError, Result};
use aes::cipher::{block_padding::Pkcs7, BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use base64::Engine as _;
use rand::RngCore;
use rsa::pkcs8::DecodePublicKey;
use rsa::{Oaep, RsaPublicKey};
use sha2::{Digest, Sha256};
use std::io::{Read, Write};

type Aes256CbcEnc = cbc::Encryptor<aes::Aes256>;
type Aes256CbcDec = cbc::Decryptor<aes::Aes256>;

/// Plaintext above this size is gzip-compressed before encryption, per
/// spec.md §4.5.
const COMPRESSION_THRESHOLD: usize = 10_000;

/// IV-set size bound; exceeding it forces a session reset to bound memory.
pub const MAX_IV_SET_SIZE: usize = 4_000_000;

pub struct SessionCrypto {
    key: [u8; 32],
}

impl SessionCrypto {
    pub fn generate() -> Result<Self> {
        let mut key = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut key);
        Ok(Self { key })
    }

    /// RSA-OAEP(SHA-256)-wrap the session key for the account's public key,
    /// base64-encoded for the login payload.
    pub fn wrap_key_for(&self, account_pubkey: &RsaPublicKey) -> Result<String> {
        let mut rng = rand::thread_rng();
        let wrapped = account_pubkey
            .encrypt(&mut rng, Oaep::new::<Sha256>(), &self.key)
            .map_err(|e| FahError::Crypto(format!("oaep wrap failed: {e}")))?;
        Ok(base64::engine::general_purpose::STANDARD.encode(wrapped))
    }

    /// Encrypt `plaintext`, gzip-compressing first if it exceeds the
    /// threshold. Returns `(iv, was_compressed, ciphertext)`.
    pub fn encrypt(&self, plaintext: &[u8]) -> Result<([u8; 16], bool, Vec<u8>)> {
        let (body, compressed) = if plaintext.len() > COMPRESSION_THRESHOLD {
            let mut encoder = flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::default());
            encoder
                .write_all(plaintext)
                .map_err(|e| FahError::Other(anyhow::anyhow!(e)))?;
            (
                encoder.finish().map_err(|e| FahError::Other(anyhow::anyhow!(e)))?,
                true,
            )
        } else {
            (plaintext.to_vec(), false)
        };

        let mut iv = [0u8; 16];
        rand::thread_rng().fill_bytes(&mut iv);

        let ciphertext = Aes256CbcEnc::new(&self.key.into(), &iv.into())
            .encrypt_padded_vec_mut::<Pkcs7>(&body);

        Ok((iv, compressed, ciphertext))
    }

    pub fn decrypt(&self, iv: &[u8; 16], ciphertext: &[u8], compressed: bool) -> Result<Vec<u8>> {
        let plain = Aes256CbcDec::new(&self.key.into(), iv.into())
            .decrypt_padded_vec_mut::<Pkcs7>(ciphertext)
            .map_err(|e| FahError::Crypto(format!("aes decrypt failed: {e}")))?;

        if compressed {
            let mut decoder = flate2::read::GzDecoder::new(plain.as_slice());
            let mut out = Vec::new();
            decoder
                .read_to_end(&mut out)
                .map_err(|e| FahError::Other(anyhow::anyhow!(e)))?;
            Ok(out)
        } else {
            Ok(plain)
        }
    }
}

pub fn parse_public_key_pem(pem: &str) -> Result<RsaPublicKey> {
    RsaPublicKey::from_public_key_pem(pem)
        .map_err(|e| FahError::Crypto(format!("invalid account public key: {e}")))
}

/// `account id = urlbase64(sha256(modulus))`, per spec.md §4.5 "INFO".
pub fn account_id_from_public_key_pem(pem: &str) -> Result<String> {
    let key = parse_public_key_pem(pem)?;
    let modulus = key.n().to_bytes_be();
    let digest = Sha256::digest(modulus);
    Ok(base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(digest))
}

/// Verify a `broadcast` message's signature was produced by the account's
/// private key over its payload.
pub fn verify_broadcast_signature(account_pubkey: &RsaPublicKey, payload: &[u8], signature: &[u8]) -> Result<()> {
    crate::identity::verify(account_pubkey, payload, signature)
}
