// Copyright (c) 2025 Jonathan Fontanez
// SPDX-License-Identifier: BUSL-1.1

//! The network- and crypto-facing half of the Unit State Machine: Assign,
//! Download, Upload, and Dump, per spec.md §4.1. `super` owns the pure state
//! transitions; these functions perform the wire exchange, verify what comes
//! back, and call straight through to that bookkeeping once it checks out.

use super::Unit;
use crate::error::{FahError, Result};
use crate::group::Config as GroupConfig;
use crate::http_client::HttpClient;
use crate::identity::Identity;
use crate::resource::GpuDescriptor;
use crate::wire::{self, CertUsage, SignedEnvelope};
use serde_json::{json, Value};
use sha2::{Digest, Sha256};
use std::path::Path;

/// Build the per-resource request body an Assign call signs, per spec.md
/// §4.1's field list (client id, version, user/team/passkey, project block,
/// CPU/GPU resource block).
pub fn build_request_data(identity: &Identity, config: &GroupConfig, cpus: u32, gpus: &[GpuDescriptor]) -> Value {
    json!({
        "client": identity.client_id(),
        "version": env!("CARGO_PKG_VERSION"),
        "user": config.user,
        "team": config.team,
        "passkey": config.passkey,
        "project": {
            "cause": config.cause,
            "beta": config.beta,
            "key": config.project_key,
        },
        "cpus": cpus,
        "gpus": gpus.iter().map(|g| json!({
            "id": g.gpu_id(),
            "vendor": g.vendor_name,
            "species": g.species,
        })).collect::<Vec<_>>(),
    })
}

/// Sign `request_data` and derive the WU id from the signature, per
/// invariant 1: `id == urlBase64(sha256(sign(request)))`.
pub fn build_request_envelope(identity: &Identity, request_data: Value) -> Result<(String, Value)> {
    let signature = identity.sign_base64(&wire::canonical_json(&request_data)?)?;
    let id = wire::unit_id(&signature)?;
    let envelope = json!({
        "data": request_data,
        "signature": signature,
        "pub-key": identity.public_key_pem()?,
    });
    Ok((id, envelope))
}

fn envelope_value(e: &SignedEnvelope) -> Result<Value> {
    serde_json::to_value(e).map_err(|err| FahError::Other(anyhow::anyhow!(err)))
}

impl Unit {
    /// POST the signed request to the assignment server. Verifies the
    /// response's `AS`-usage certificate and that the echoed request still
    /// derives this unit's id before advancing to DOWNLOAD.
    pub async fn assign(&mut self, http: &dyn HttpClient, assign_server: &str) -> Result<()> {
        let request = self
            .data
            .request
            .clone()
            .ok_or_else(|| FahError::Other(anyhow::anyhow!("unit has no request envelope")))?;

        let url = format!("{assign_server}/api/assign");
        let resp = http
            .post(&url, serde_json::to_vec(&request).unwrap_or_default(), "application/json")
            .await?;
        if !resp.is_success() {
            return Err(FahError::Rejected(format!("assign request failed: {}", resp.status)));
        }

        let body: Value = serde_json::from_slice(&resp.body)
            .map_err(|e| FahError::Integrity(format!("malformed assign response: {e}")))?;
        let request_echo = body.get("request").cloned().unwrap_or(Value::Null);
        let assignment: SignedEnvelope = serde_json::from_value(
            body.get("assignment")
                .cloned()
                .ok_or_else(|| FahError::Integrity("assign response missing assignment".into()))?,
        )
        .map_err(|e| FahError::Integrity(format!("malformed assignment envelope: {e}")))?;

        // Cheap structural check first: an id mismatch means this response
        // wasn't even meant for us, no point spending a PKI verification on it.
        let echoed_signature = request_echo
            .get("signature")
            .and_then(Value::as_str)
            .ok_or_else(|| FahError::Integrity("echoed request missing signature".into()))?;
        let derived_id = wire::unit_id(echoed_signature)?;
        if derived_id != self.id {
            return Err(FahError::Integrity(format!(
                "assignment response id mismatch: expected {}, got {derived_id}",
                self.id
            )));
        }

        let prefix = wire::canonical_json(&request_echo)?;
        assignment.verify(CertUsage::AssignmentServer, &prefix)?;

        self.data.request = Some(request_echo);
        self.on_assigned(assignment);
        Ok(())
    }

    /// POST the verified assignment to the assignment's work server.
    /// Verifies the `WS`-usage certificate, checks the downloaded payload's
    /// hash against `wu.data.sha256`, persists it to `unit_dir`, and
    /// advances to CORE.
    pub async fn download(&mut self, http: &dyn HttpClient, unit_dir: &Path) -> Result<()> {
        let request = self
            .data
            .request
            .clone()
            .ok_or_else(|| FahError::Other(anyhow::anyhow!("unit has no request envelope")))?;
        let assignment = self
            .data
            .assignment
            .clone()
            .ok_or_else(|| FahError::Other(anyhow::anyhow!("unit has no assignment envelope")))?;

        let ws = assignment
            .data
            .get("ws")
            .and_then(Value::as_str)
            .ok_or_else(|| FahError::Integrity("assignment missing work server".into()))?
            .to_string();
        let url = format!("{ws}/api/assign");

        let body = json!({ "request": request, "assignment": envelope_value(&assignment)? });
        let resp = http
            .post(&url, serde_json::to_vec(&body).unwrap_or_default(), "application/json")
            .await?;
        if !resp.is_success() {
            return Err(FahError::Rejected(format!("download request failed: {}", resp.status)));
        }

        let parsed: Value = serde_json::from_slice(&resp.body)
            .map_err(|e| FahError::Integrity(format!("malformed download response: {e}")))?;
        let wu: SignedEnvelope = serde_json::from_value(
            parsed.get("wu").cloned().ok_or_else(|| FahError::Integrity("download response missing wu".into()))?,
        )
        .map_err(|e| FahError::Integrity(format!("malformed wu envelope: {e}")))?;
        let data_b64 = parsed
            .get("data")
            .and_then(Value::as_str)
            .ok_or_else(|| FahError::Integrity("download response missing data".into()))?;
        let raw = base64::Engine::decode(&base64::engine::general_purpose::STANDARD, data_b64)
            .map_err(|e| FahError::Integrity(format!("malformed wu data base64: {e}")))?;

        // Cheap structural check first: a hash mismatch means corrupt or
        // wrong data regardless of whether the chain checks out.
        let expected_sha256 = wu
            .data
            .get("sha256")
            .and_then(Value::as_str)
            .ok_or_else(|| FahError::Integrity("wu data missing sha256".into()))?;
        let actual_sha256 = hex::encode(Sha256::digest(&raw));
        if actual_sha256 != expected_sha256 {
            return Err(FahError::Integrity(format!(
                "wu data sha256 mismatch: expected {expected_sha256}, got {actual_sha256}"
            )));
        }

        let mut prefix = wire::canonical_json(&request)?;
        prefix.extend(wire::canonical_json(&envelope_value(&assignment)?)?);
        wu.verify(CertUsage::WorkServer, &prefix)?;

        std::fs::create_dir_all(unit_dir).map_err(FahError::Io)?;
        std::fs::write(unit_dir.join("wudata_01.dat"), &raw).map_err(FahError::Io)?;

        let min_cpus = assignment.data.get("min_cpus").and_then(Value::as_u64).unwrap_or(1) as u32;
        let max_cpus = assignment
            .data
            .get("max_cpus")
            .and_then(Value::as_u64)
            .unwrap_or(min_cpus.max(1) as u64) as u32;

        self.on_downloaded(wu, min_cpus, max_cpus);
        Ok(())
    }

    /// Hash `wuresults_01.dat`, build the signed results envelope, and
    /// advance to UPLOAD.
    pub fn package_results(&mut self, identity: &Identity, unit_dir: &Path) -> Result<()> {
        let request = self
            .data
            .request
            .clone()
            .ok_or_else(|| FahError::Other(anyhow::anyhow!("unit has no request envelope")))?;
        let assignment = self
            .data
            .assignment
            .clone()
            .ok_or_else(|| FahError::Other(anyhow::anyhow!("unit has no assignment envelope")))?;
        let wu = self
            .data
            .wu
            .clone()
            .ok_or_else(|| FahError::Other(anyhow::anyhow!("unit has no wu envelope")))?;

        let raw = std::fs::read(unit_dir.join("wuresults_01.dat")).map_err(FahError::Io)?;
        let sha256_hex = hex::encode(Sha256::digest(&raw));
        let status = "ok";

        let input = wire::results_signing_input(&request, &assignment.data, &wu.data, status, &sha256_hex)?;
        let signature = identity.sign_base64(&input)?;

        let results = json!({
            "status": status,
            "sha256": sha256_hex,
            "signature": signature,
            "data": base64::Engine::encode(&base64::engine::general_purpose::STANDARD, &raw),
        });
        self.on_results_packaged(results);
        Ok(())
    }

    /// Build the `status="dumped"` results envelope (no results hash) ahead
    /// of a Dump upload.
    pub fn package_dump(&mut self, identity: &Identity) -> Result<()> {
        let request = self.data.request.clone().unwrap_or(Value::Null);
        let assignment_data = self.data.assignment.as_ref().map(|a| a.data.clone()).unwrap_or(Value::Null);
        let wu_data = self.data.wu.as_ref().map(|w| w.data.clone()).unwrap_or(Value::Null);
        let status = "dumped";

        let input = wire::results_signing_input(&request, &assignment_data, &wu_data, status, "")?;
        let signature = identity.sign_base64(&input)?;

        self.on_results_packaged(json!({ "status": status, "signature": signature }));
        Ok(())
    }

    /// The host currently targeted for an Upload/Dump POST: the work
    /// server while `collector_index == 0`, otherwise `wu.data.cs[]`.
    fn upload_host(&self) -> Result<String> {
        let wu = self
            .data
            .wu
            .as_ref()
            .ok_or_else(|| FahError::Other(anyhow::anyhow!("unit has no wu envelope")))?;
        if self.collector_index == 0 {
            wu.data
                .get("ws")
                .and_then(Value::as_str)
                .map(str::to_string)
                .ok_or_else(|| FahError::Integrity("wu missing work server".into()))
        } else {
            wu.data
                .get("cs")
                .and_then(Value::as_array)
                .and_then(|cs| cs.get(self.collector_index - 1))
                .and_then(Value::as_str)
                .map(str::to_string)
                .ok_or_else(|| FahError::Integrity("collector index out of range".into()))
        }
    }

    /// POST the packaged results envelope to the current upload host.
    /// 400/406/410 are terminal rejections; 503 cycles the collector list
    /// and, if this unit ever reached DOWNLOAD, reverts to ASSIGN for a
    /// fresh token before the caller retries.
    pub async fn upload(&mut self, http: &dyn HttpClient) -> Result<()> {
        let host = self.upload_host()?;
        let url = format!("{host}/api/results");
        let body = json!({
            "request": self.data.request,
            "assignment": self.data.assignment,
            "wu": self.data.wu,
            "results": self.data.results,
        });

        let resp = http
            .post(&url, serde_json::to_vec(&body).unwrap_or_default(), "application/json")
            .await;
        let resp = match resp {
            Ok(resp) => resp,
            Err(e) => {
                self.advance_collector();
                return Err(e);
            }
        };

        match resp.status {
            200..=299 => {
                self.on_upload_succeeded();
                Ok(())
            }
            400 | 406 | 410 => {
                self.on_upload_rejected();
                Ok(())
            }
            503 => {
                self.advance_collector();
                self.on_upload_transient_failure(true);
                Err(FahError::Rejected("upload service unavailable (503)".into()))
            }
            other => {
                self.advance_collector();
                Err(FahError::Rejected(format!("upload failed: {other}")))
            }
        }
    }

    /// POST the `status="dumped"` envelope; any 2xx acks it.
    pub async fn send_dump(&mut self, http: &dyn HttpClient) -> Result<()> {
        let host = self.upload_host()?;
        let url = format!("{host}/api/results");
        let body = json!({
            "request": self.data.request,
            "assignment": self.data.assignment,
            "wu": self.data.wu,
            "results": self.data.results,
        });

        let resp = http
            .post(&url, serde_json::to_vec(&body).unwrap_or_default(), "application/json")
            .await?;
        if resp.is_success() {
            self.on_dump_acked();
            Ok(())
        } else {
            Err(FahError::Rejected(format!("dump upload failed: {}", resp.status)))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http_client::fake::FakeHttpClient;
    use crate::kv::KvStore;

    fn identity() -> (tempfile::TempDir, Identity) {
        let dir = tempfile::tempdir().unwrap();
        let kv = KvStore::open(dir.path()).unwrap();
        let table = kv.table("config").unwrap();
        (dir, Identity::load_or_generate(&table).unwrap())
    }

    fn signed_request(identity: &Identity) -> (String, Value) {
        let data = build_request_data(identity, &GroupConfig::default(), 4, &[]);
        build_request_envelope(identity, data).unwrap()
    }

    fn sign_envelope(identity: &Identity, data: Value) -> SignedEnvelope {
        let signature = identity.sign_base64(&wire::canonical_json(&data).unwrap()).unwrap();
        SignedEnvelope {
            data,
            certificate: String::new(),
            intermediate: None,
            signature,
        }
    }

    #[tokio::test]
    async fn assign_rejects_a_response_whose_id_does_not_match() {
        let (_dir, id) = identity();
        let (unit_id, request) = signed_request(&id);
        let mut unit = Unit::new(unit_id, request.clone());

        // A well-formed response, but signed over a *different* request, so
        // the derived id won't match this unit's id.
        let (_other_id, other_request) = signed_request(&id);
        let assignment_data = json!({ "ws": "https://ws.example", "min_cpus": 1, "max_cpus": 4 });
        let mut prefix = wire::canonical_json(&other_request).unwrap();
        let assignment = sign_envelope(&id, assignment_data);
        prefix.extend(wire::canonical_json(&assignment.data).unwrap());
        let _ = prefix;

        let http = FakeHttpClient::new();
        let url = "https://assign1.example/api/assign".to_string();
        let body = json!({ "request": other_request, "assignment": assignment });
        http.respond(&url, 200, serde_json::to_vec(&body).unwrap());

        let err = unit.assign(&http, "https://assign1.example").await;
        assert!(err.is_err());
        assert_eq!(unit.state, crate::unit::UnitState::Assign);
    }

    /// A payload whose hash matches `wu.data.sha256` clears the cheap
    /// integrity check and reaches certificate verification; this fixture's
    /// `sign_envelope` has no real CA chain behind it, so the only way to
    /// observe "the hash check passed" from outside is that the failure
    /// that does occur is a verification failure, not an integrity one, and
    /// that nothing was written to disk before it.
    #[tokio::test]
    async fn download_matching_hash_clears_integrity_check_before_verification() {
        let (_dir, id) = identity();
        let (unit_id, request) = signed_request(&id);
        let mut unit = Unit::new(unit_id, request.clone());

        let assignment_data = json!({ "ws": "https://ws.example", "min_cpus": 2, "max_cpus": 8 });
        let assignment = sign_envelope(&id, assignment_data);
        unit.on_assigned(assignment.clone());

        let raw = b"kernel input bytes".to_vec();
        let sha256_hex = hex::encode(Sha256::digest(&raw));
        let wu_data = json!({ "sha256": sha256_hex, "ws": "https://ws.example", "cs": [] });
        let wu = sign_envelope(&id, wu_data);
        let data_b64 = base64::Engine::encode(&base64::engine::general_purpose::STANDARD, &raw);
        let resp_body = json!({ "request": request, "assignment": assignment, "wu": wu, "data": data_b64 });

        let http = FakeHttpClient::new();
        http.respond("https://ws.example/api/assign", 200, serde_json::to_vec(&resp_body).unwrap());

        let work_dir = tempfile::tempdir().unwrap();
        let err = unit.download(&http, work_dir.path()).await.unwrap_err();

        assert!(matches!(err, FahError::Integrity(_)) && err.to_string().contains("certificate"));
        assert_eq!(unit.state, crate::unit::UnitState::Download);
        assert!(!work_dir.path().join("wudata_01.dat").exists());
    }

    #[tokio::test]
    async fn download_rejects_a_payload_with_the_wrong_hash() {
        let (_dir, id) = identity();
        let (unit_id, request) = signed_request(&id);
        let mut unit = Unit::new(unit_id, request.clone());

        let assignment = sign_envelope(&id, json!({ "ws": "https://ws.example" }));
        unit.on_assigned(assignment.clone());

        let wu_data = json!({ "sha256": "deadbeef", "ws": "https://ws.example" });
        let wu = sign_envelope(&id, wu_data);
        let data_b64 = base64::Engine::encode(&base64::engine::general_purpose::STANDARD, b"mismatched bytes");
        let resp_body = json!({ "request": request, "assignment": assignment, "wu": wu, "data": data_b64 });

        let http = FakeHttpClient::new();
        http.respond("https://ws.example/api/assign", 200, serde_json::to_vec(&resp_body).unwrap());

        let work_dir = tempfile::tempdir().unwrap();
        let err = unit.download(&http, work_dir.path()).await;
        assert!(err.is_err());
        assert_eq!(unit.state, crate::unit::UnitState::Download);
    }

    #[tokio::test]
    async fn upload_503_advances_collector_and_reverts_to_assign() {
        let (_dir, id) = identity();
        let (unit_id, request) = signed_request(&id);
        let mut unit = Unit::new(unit_id, request);
        let wu = sign_envelope(&id, json!({ "ws": "https://ws.example", "cs": ["https://cs1.example"] }));
        unit.data.wu = Some(wu);
        unit.data.results = Some(json!({ "status": "ok" }));
        unit.state = crate::unit::UnitState::Upload;

        let http = FakeHttpClient::new();
        http.respond("https://ws.example/api/results", 503, Vec::new());

        let err = unit.upload(&http).await;
        assert!(err.is_err());
        assert_eq!(unit.state, crate::unit::UnitState::Assign);
        assert_eq!(unit.collector_index, 1);
    }

    #[tokio::test]
    async fn upload_400_is_terminal_rejection() {
        let (_dir, id) = identity();
        let (unit_id, request) = signed_request(&id);
        let mut unit = Unit::new(unit_id, request);
        let wu = sign_envelope(&id, json!({ "ws": "https://ws.example" }));
        unit.data.wu = Some(wu);
        unit.data.results = Some(json!({ "status": "ok" }));
        unit.state = crate::unit::UnitState::Upload;

        let http = FakeHttpClient::new();
        http.respond("https://ws.example/api/results", 400, Vec::new());

        unit.upload(&http).await.unwrap();
        assert_eq!(unit.state, crate::unit::UnitState::Done(crate::unit::DoneReason::Rejected));
    }

    #[tokio::test]
    async fn upload_success_credits_the_unit() {
        let (_dir, id) = identity();
        let (unit_id, request) = signed_request(&id);
        let mut unit = Unit::new(unit_id, request);
        let wu = sign_envelope(&id, json!({ "ws": "https://ws.example" }));
        unit.data.wu = Some(wu);
        unit.data.results = Some(json!({ "status": "ok" }));
        unit.state = crate::unit::UnitState::Upload;

        let http = FakeHttpClient::new();
        http.respond("https://ws.example/api/results", 200, Vec::new());

        unit.upload(&http).await.unwrap();
        assert_eq!(unit.state, crate::unit::UnitState::Done(crate::unit::DoneReason::Credited));
    }

    #[test]
    fn package_results_hashes_the_results_file_on_disk() {
        let (_dir, id) = identity();
        let (unit_id, request) = signed_request(&id);
        let mut unit = Unit::new(unit_id, request);
        unit.data.assignment = Some(sign_envelope(&id, json!({})));
        unit.data.wu = Some(sign_envelope(&id, json!({})));

        let work_dir = tempfile::tempdir().unwrap();
        std::fs::write(work_dir.path().join("wuresults_01.dat"), b"results payload").unwrap();

        unit.package_results(&id, work_dir.path()).unwrap();
        let results = unit.data.results.as_ref().unwrap();
        let expected = hex::encode(Sha256::digest(b"results payload"));
        assert_eq!(results["sha256"], expected);
        assert_eq!(results["status"], "ok");
    }
}
