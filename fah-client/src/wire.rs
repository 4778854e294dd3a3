// Copyright (c) 2025 Jonathan Fontanez
// SPDX-License-Identifier: BUSL-1.1

//! Signed wire envelopes exchanged with assignment/work/collector servers
//! and the compute kernel certificate chain used to authenticate them.
//!
//! Every envelope on the wire is canonical-JSON-serialized and signed with
//! PKCS#1 v1.5/SHA-256 (see [`crate::identity`]); the signer's certificate
//! must carry the usage attribute appropriate to the role making the claim
//! (`AS` for an assignment server, `WS` for a work server, `core<XX>` for a
//! kernel's signing certificate).

use crate::error::{FahError, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};

/// Certificate usage attribute expected on the signer's leaf certificate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CertUsage {
    AssignmentServer,
    WorkServer,
    Core(u32),
}

impl CertUsage {
    pub fn attribute(&self) -> String {
        match self {
            CertUsage::AssignmentServer => "AS".to_string(),
            CertUsage::WorkServer => "WS".to_string(),
            CertUsage::Core(kind) => format!("core{kind:02X}"),
        }
    }
}

/// A signed payload as carried on the wire: opaque `data`, the signing
/// certificate chain (leaf first), and the signature over `data`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignedEnvelope {
    pub data: Value,
    pub certificate: String,
    #[serde(default)]
    pub intermediate: Option<String>,
    pub signature: String,
}

impl SignedEnvelope {
    /// Verify the certificate chain carries `usage` and the signature covers
    /// `prefix || canonical(self.data)`.
    pub fn verify(&self, usage: CertUsage, prefix: &[u8]) -> Result<()> {
        let cert = crate::core_cache::parse_certificate(&self.certificate)?;
        crate::core_cache::require_usage(&cert, &usage.attribute())?;

        let public_key = crate::core_cache::certificate_rsa_public_key(&cert)?;
        let signature = base64::Engine::decode(
            &base64::engine::general_purpose::STANDARD,
            &self.signature,
        )
        .map_err(|e| FahError::Integrity(format!("malformed signature base64: {e}")))?;

        let mut message = prefix.to_vec();
        message.extend_from_slice(&canonical_json(&self.data)?);
        crate::identity::verify(&public_key, &message, &signature)
    }
}

/// Deterministic JSON encoding (sorted object keys) used as the signing
/// input on both ends of every wire exchange.
pub fn canonical_json(value: &Value) -> Result<Vec<u8>> {
    fn sort(value: &Value) -> Value {
        match value {
            Value::Object(map) => {
                let mut sorted: Vec<_> = map.iter().collect();
                sorted.sort_by(|a, b| a.0.cmp(b.0));
                let mut out = serde_json::Map::new();
                for (k, v) in sorted {
                    out.insert(k.clone(), sort(v));
                }
                Value::Object(out)
            }
            Value::Array(items) => Value::Array(items.iter().map(sort).collect()),
            other => other.clone(),
        }
    }
    serde_json::to_vec(&sort(value)).map_err(|e| FahError::Other(anyhow::anyhow!(e)))
}

pub fn sha256_hex(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

/// The full chain of envelopes a unit accumulates over its lifetime:
/// `{request, assignment, wu, results}`, per spec.md §3. `results` has no
/// certificate of its own — it's the client's self-signed claim about the
/// outcome, so it stays a bare JSON object rather than a [`SignedEnvelope`].
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UnitEnvelopes {
    pub request: Option<Value>,
    pub assignment: Option<SignedEnvelope>,
    pub wu: Option<SignedEnvelope>,
    pub results: Option<Value>,
}

/// Compute the WU id: `urlBase64(sha256(decode_base64(request.signature)))`.
/// Request envelopes are self-signed by the client, so this both names the
/// unit and lets any holder of the request re-derive its id the same way
/// [`crate::identity::derive_client_id`] derives the client id from the
/// public key.
pub fn unit_id(request_signature_b64: &str) -> Result<String> {
    let raw = base64::Engine::decode(
        &base64::engine::general_purpose::STANDARD,
        request_signature_b64,
    )
    .map_err(|e| FahError::Integrity(format!("malformed request signature base64: {e}")))?;
    let digest = Sha256::digest(&raw);
    Ok(base64::Engine::encode(
        &base64::engine::general_purpose::URL_SAFE_NO_PAD,
        digest,
    ))
}

/// Signing input for a results envelope: `request || assignment.data ||
/// wu.data || status || sha256`, each piece canonical-JSON-encoded except
/// the trailing `status`/`sha256` strings, which are concatenated raw.
pub fn results_signing_input(
    request: &Value,
    assignment_data: &Value,
    wu_data: &Value,
    status: &str,
    sha256_hex: &str,
) -> Result<Vec<u8>> {
    let mut buf = canonical_json(request)?;
    buf.extend(canonical_json(assignment_data)?);
    buf.extend(canonical_json(wu_data)?);
    buf.extend_from_slice(status.as_bytes());
    buf.extend_from_slice(sha256_hex.as_bytes());
    Ok(buf)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn canonical_json_sorts_keys() {
        let a = canonical_json(&json!({"b": 1, "a": 2})).unwrap();
        let b = canonical_json(&json!({"a": 2, "b": 1})).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn cert_usage_attribute_formats_core_kind_as_hex() {
        assert_eq!(CertUsage::Core(0x0b).attribute(), "core0B");
        assert_eq!(CertUsage::AssignmentServer.attribute(), "AS");
        assert_eq!(CertUsage::WorkServer.attribute(), "WS");
    }

    #[test]
    fn unit_id_is_deterministic() {
        let sig = base64::Engine::encode(&base64::engine::general_purpose::STANDARD, b"sig-bytes");
        let id1 = unit_id(&sig).unwrap();
        let id2 = unit_id(&sig).unwrap();
        assert_eq!(id1, id2);
    }

    #[test]
    fn unit_id_is_url_safe_base64_not_hex() {
        let sig = base64::Engine::encode(&base64::engine::general_purpose::STANDARD, b"sig-bytes");
        let id = unit_id(&sig).unwrap();
        assert!(!id.contains('+') && !id.contains('/') && !id.ends_with('='));
    }

    #[test]
    fn unit_id_rejects_malformed_base64() {
        assert!(unit_id("not base64!!").is_err());
    }

    #[test]
    fn results_signing_input_concatenates_pieces_in_order() {
        let input = results_signing_input(&json!({"a": 1}), &json!({"b": 2}), &json!({"c": 3}), "ok", "deadbeef").unwrap();
        assert!(input.ends_with(b"okdeadbeef"));
    }
}
