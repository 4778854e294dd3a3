// Copyright (c) 2025 Jonathan Fontanez
// SPDX-License-Identifier: BUSL-1.1

//! Long-lived RSA-4096 identity: client keypair, derived client id, and
//! sign/verify helpers used by every signed wire message.

use crate::error::{FahError, Result};
use crate::kv::KvTable;
use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use rsa::pkcs1v15::{Signature, SigningKey, VerifyingKey};
use rsa::pkcs8::{DecodePrivateKey, DecodePublicKey, EncodePrivateKey, EncodePublicKey, LineEnding};
use rsa::signature::{RandomizedSigner, SignatureEncoding, Verifier};
use rsa::{RsaPrivateKey, RsaPublicKey};
use sha2::{Digest, Sha256};

const KEY_BITS: usize = 4096;

pub struct Identity {
    private_key: RsaPrivateKey,
    public_key: RsaPublicKey,
    client_id: String,
}

impl Identity {
    /// Load the persisted keypair from the `config` table, generating and
    /// persisting a fresh one if none exists.
    pub fn load_or_generate(config: &KvTable) -> Result<Self> {
        if let Some(pem) = config.get("private-key-pem")? {
            let private_key = RsaPrivateKey::from_pkcs8_pem(&pem)
                .map_err(|e| FahError::Crypto(format!("invalid stored key: {e}")))?;
            return Ok(Self::from_private_key(private_key));
        }

        tracing::info!("no identity found, generating a new {}-bit RSA keypair", KEY_BITS);
        let mut rng = rand::thread_rng();
        let private_key = RsaPrivateKey::new(&mut rng, KEY_BITS)
            .map_err(|e| FahError::Crypto(format!("key generation failed: {e}")))?;

        let pem = private_key
            .to_pkcs8_pem(LineEnding::LF)
            .map_err(|e| FahError::Crypto(format!("pem encoding failed: {e}")))?;
        config.set("private-key-pem", &pem)?;

        Ok(Self::from_private_key(private_key))
    }

    fn from_private_key(private_key: RsaPrivateKey) -> Self {
        let public_key = RsaPublicKey::from(&private_key);
        let client_id = derive_client_id(&public_key);
        Self {
            private_key,
            public_key,
            client_id,
        }
    }

    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    pub fn public_key(&self) -> &RsaPublicKey {
        &self.public_key
    }

    pub fn private_key(&self) -> &RsaPrivateKey {
        &self.private_key
    }

    pub fn public_key_pem(&self) -> Result<String> {
        self.public_key
            .to_public_key_pem(LineEnding::LF)
            .map_err(|e| FahError::Crypto(format!("pem encoding failed: {e}")))
    }

    /// Sign `data` with PKCS#1 v1.5 over SHA-256, returning the raw signature bytes.
    pub fn sign(&self, data: &[u8]) -> Result<Vec<u8>> {
        let signing_key = SigningKey::<Sha256>::new(self.private_key.clone());
        let mut rng = rand::thread_rng();
        let signature = signing_key.sign_with_rng(&mut rng, data);
        Ok(signature.to_vec())
    }

    /// Sign `data`, returning the standard base64 encoding used on the wire.
    pub fn sign_base64(&self, data: &[u8]) -> Result<String> {
        Ok(base64::engine::general_purpose::STANDARD.encode(self.sign(data)?))
    }
}

/// Verify a PKCS#1 v1.5/SHA-256 signature with an arbitrary public key.
pub fn verify(public_key: &RsaPublicKey, data: &[u8], signature: &[u8]) -> Result<()> {
    let verifying_key = VerifyingKey::<Sha256>::new(public_key.clone());
    let signature = Signature::try_from(signature)
        .map_err(|e| FahError::Crypto(format!("malformed signature: {e}")))?;
    verifying_key
        .verify(data, &signature)
        .map_err(|e| FahError::Crypto(format!("signature verification failed: {e}")))
}

/// Stable client id: URL-safe base64 of SHA-256(public key SPKI DER).
pub fn derive_client_id(public_key: &RsaPublicKey) -> String {
    let der = public_key
        .to_public_key_der()
        .expect("RSA public key always encodes to DER");
    let digest = Sha256::digest(der.as_bytes());
    URL_SAFE_NO_PAD.encode(digest)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fresh_store() -> (tempfile::TempDir, KvTable) {
        let dir = tempfile::tempdir().unwrap();
        let store = crate::kv::KvStore::open(dir.path()).unwrap();
        let table = store.table("config").unwrap();
        (dir, table)
    }

    #[test]
    fn generates_and_persists_identity() {
        let (_dir, table) = fresh_store();
        let identity = Identity::load_or_generate(&table).unwrap();
        assert!(!identity.client_id().is_empty());
        assert!(table.has("private-key-pem"));
    }

    #[test]
    fn reload_yields_same_client_id() {
        let (_dir, table) = fresh_store();
        let first = Identity::load_or_generate(&table).unwrap();
        let second = Identity::load_or_generate(&table).unwrap();
        assert_eq!(first.client_id(), second.client_id());
    }

    #[test]
    fn sign_and_verify_roundtrip() {
        let (_dir, table) = fresh_store();
        let identity = Identity::load_or_generate(&table).unwrap();
        let data = b"hello assignment server";
        let sig = identity.sign(data).unwrap();
        verify(identity.public_key(), data, &sig).unwrap();
    }

    #[test]
    fn verify_rejects_tampered_data() {
        let (_dir, table) = fresh_store();
        let identity = Identity::load_or_generate(&table).unwrap();
        let sig = identity.sign(b"original").unwrap();
        assert!(verify(identity.public_key(), b"tampered", &sig).is_err());
    }
}
