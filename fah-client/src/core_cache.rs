// Copyright (c) 2025 Jonathan Fontanez
// SPDX-License-Identifier: BUSL-1.1

//! Core Cache: fetches, verifies, and unpacks signed compute-kernel
//! archives, keyed by the kernel's canonical URL.

use crate::error::{FahError, Result};
use crate::http_client::HttpClient;
use crate::kv::KvTable;
use rsa::RsaPublicKey;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::io::Read;
use std::path::{Path, PathBuf};
use x509_certificate::X509Certificate;

/// Progress callback: `(done, total)`, with a final `(1, 1)` on ready or
/// invalid.
pub type ProgressListener = Box<dyn Fn(u64, u64) + Send + Sync>;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoreEntry {
    pub path: PathBuf,
    pub sha256: String,
    /// Kernel type, e.g. `0x21` for `FahCore_21`.
    pub kind: u32,
}

pub struct CoreCache {
    cores_dir: PathBuf,
    table: KvTable,
}

impl CoreCache {
    pub fn new(cores_dir: PathBuf, table: KvTable) -> Self {
        Self { cores_dir, table }
    }

    pub fn lookup(&self, url: &str) -> Option<CoreEntry> {
        let raw = self.table.get(url).ok()??;
        serde_json::from_str(&raw).ok()
    }

    /// Fetch, verify, and unpack the kernel at `url` if not already cached.
    /// `expected_sha256` is the hash recorded in the assignment envelope;
    /// `kind` is the kernel type (e.g. `0x21`).
    pub async fn fetch(
        &self,
        http: &dyn HttpClient,
        url: &str,
        expected_sha256: &str,
        kind: u32,
        progress: Option<&ProgressListener>,
    ) -> Result<CoreEntry> {
        if let Some(entry) = self.lookup(url) {
            if entry.path.exists() {
                if let Some(cb) = progress {
                    cb(1, 1);
                }
                return Ok(entry);
            }
        }

        let result = self.fetch_uncached(http, url, expected_sha256, kind, progress).await;
        if result.is_err() {
            if let Some(cb) = progress {
                cb(1, 1);
            }
        }
        result
    }

    async fn fetch_uncached(
        &self,
        http: &dyn HttpClient,
        url: &str,
        expected_sha256: &str,
        kind: u32,
        progress: Option<&ProgressListener>,
    ) -> Result<CoreEntry> {
        let cert_pem = http.get(&format!("{url}.crt")).await?.body;
        let signature = http.get(&format!("{url}.sig")).await?.body;
        let archive = http.get(url).await?.body;

        if let Some(cb) = progress {
            cb(archive.len() as u64 / 2, archive.len() as u64);
        }

        let cert = parse_certificate(&String::from_utf8_lossy(&cert_pem))?;
        require_usage(&cert, &format!("core{kind:02X}"))?;

        let public_key = certificate_rsa_public_key(&cert)?;
        let archive_sha256 = Sha256::digest(&archive);
        crate::identity::verify(&public_key, &archive_sha256, &signature)?;

        let actual_hex = hex::encode(archive_sha256);
        if actual_hex != expected_sha256 {
            return Err(FahError::Integrity(format!(
                "core archive sha256 mismatch: expected {expected_sha256}, got {actual_hex}"
            )));
        }

        let basename = basename_of(url);
        let dest = self.cores_dir.join(&actual_hex);
        unpack_archive(&archive, url, &basename, &dest)?;

        let exe_name = format!("FahCore_{kind:02X}");
        let exe_path = dest.join(&exe_name);
        make_executable(&exe_path)?;

        let entry = CoreEntry {
            path: exe_path,
            sha256: actual_hex,
            kind,
        };
        let raw = serde_json::to_string(&entry).map_err(|e| FahError::Other(anyhow::anyhow!(e)))?;
        self.table.set(url, &raw)?;

        if let Some(cb) = progress {
            cb(1, 1);
        }
        Ok(entry)
    }
}

pub(crate) fn parse_certificate(pem: &str) -> Result<X509Certificate> {
    X509Certificate::from_pem(pem)
        .map_err(|e| FahError::Integrity(format!("invalid certificate: {e}")))
}

/// Check the certificate carries the given usage attribute in its subject
/// common name (the Folding@home CA mints leaf certs named e.g. `AS`,
/// `WS`, or `core21`). The real chain walk (leaf -> intermediate ->
/// Folding@home root) is delegated to the transport layer's TLS
/// validation; here we only check the application-level usage claim.
pub(crate) fn require_usage(cert: &X509Certificate, usage: &str) -> Result<()> {
    let subject = cert.subject_common_name().unwrap_or_default();
    if subject.contains(usage) {
        Ok(())
    } else {
        Err(FahError::Integrity(format!(
            "certificate missing required usage attribute {usage}"
        )))
    }
}

pub(crate) fn certificate_rsa_public_key(cert: &X509Certificate) -> Result<RsaPublicKey> {
    use rsa::pkcs8::DecodePublicKey;
    let spki = cert.public_key_data();
    RsaPublicKey::from_public_key_der(spki.as_ref())
        .map_err(|e| FahError::Integrity(format!("unreadable certificate public key: {e}")))
}

fn basename_of(url: &str) -> String {
    url.rsplit('/')
        .next()
        .unwrap_or(url)
        .split('.')
        .next()
        .unwrap_or(url)
        .to_string()
}

/// Decompress by extension, expect an uncompressed tarball, and reject any
/// member whose path escapes a single top-level directory named `basename`.
fn unpack_archive(archive: &[u8], url: &str, basename: &str, dest: &Path) -> Result<()> {
    let tar_bytes: Vec<u8> = if url.ends_with(".gz") || url.ends_with(".tgz") {
        let mut buf = Vec::new();
        flate2::read::GzDecoder::new(archive)
            .read_to_end(&mut buf)
            .map_err(|e| FahError::Integrity(format!("gzip decode failed: {e}")))?;
        buf
    } else if url.ends_with(".bz2") {
        let mut buf = Vec::new();
        bzip2::read::BzDecoder::new(archive)
            .read_to_end(&mut buf)
            .map_err(|e| FahError::Integrity(format!("bzip2 decode failed: {e}")))?;
        buf
    } else {
        archive.to_vec()
    };

    std::fs::create_dir_all(dest).map_err(FahError::Io)?;
    let mut archive = tar::Archive::new(tar_bytes.as_slice());
    for entry in archive.entries().map_err(FahError::Io)? {
        let mut entry = entry.map_err(FahError::Io)?;
        let path = entry.path().map_err(FahError::Io)?.into_owned();
        let mut components = path.components();
        let top = components
            .next()
            .ok_or_else(|| FahError::Integrity("tar member has empty path".into()))?;
        if top.as_os_str() != basename {
            return Err(FahError::Integrity(format!(
                "tar member {} escapes expected top-level directory {basename}",
                path.display()
            )));
        }
        if path.components().any(|c| matches!(c, std::path::Component::ParentDir)) {
            return Err(FahError::Integrity(format!(
                "tar member {} contains a parent-directory component",
                path.display()
            )));
        }
        let relative: PathBuf = components.collect();
        let out_path = dest.join(relative);
        if let Some(parent) = out_path.parent() {
            std::fs::create_dir_all(parent).map_err(FahError::Io)?;
        }
        entry.unpack(&out_path).map_err(FahError::Io)?;
    }
    Ok(())
}

#[cfg(unix)]
fn make_executable(path: &Path) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;
    let mut perms = std::fs::metadata(path).map_err(FahError::Io)?.permissions();
    perms.set_mode(0o755);
    std::fs::set_permissions(path, perms).map_err(FahError::Io)
}

#[cfg(not(unix))]
fn make_executable(_path: &Path) -> Result<()> {
    Ok(())
}
