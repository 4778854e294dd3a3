// Copyright (c) 2025 Jonathan Fontanez
// SPDX-License-Identifier: BUSL-1.1

//! Account Channel: links the client to a Folding@home account and
//! maintains an encrypted, session-multiplexed WebSocket to the account's
//! node, per spec.md §4.5.

mod crypto;
pub mod socket;

pub use crypto::{SessionCrypto, MAX_IV_SET_SIZE};

use crate::backoff::Backoff;
use crate::error::{FahError, Result};
use crate::http_client::HttpClient;
use crate::identity::Identity;
use crate::kv::KvTable;
use rsa::RsaPublicKey;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    Idle,
    Link,
    Info,
    Connect,
    Connected,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct AccountInfo {
    pub account_id: String,
    pub node: String,
    pub public_key_pem: String,
}

/// A remote endpoint multiplexed over the single account WebSocket,
/// addressed by `session`.
pub struct RemoteStub {
    pub session: String,
    pub inbox: tokio::sync::mpsc::UnboundedSender<serde_json::Value>,
}

pub struct AccountChannel {
    state: LinkState,
    backoff: Backoff,
    config: KvTable,
    account: Option<AccountInfo>,
    requested_token: Option<String>,
    crypto: Option<SessionCrypto>,
    remotes: HashMap<String, RemoteStub>,
    used_ivs: HashSet<[u8; 16]>,
}

impl AccountChannel {
    pub fn new(config: KvTable) -> Self {
        let account = config
            .get("account-info")
            .ok()
            .flatten()
            .and_then(|raw| serde_json::from_str(&raw).ok());
        let state = if account.is_some() {
            LinkState::Connect
        } else if config.has("requested-token") {
            LinkState::Link
        } else {
            LinkState::Idle
        };

        Self {
            state,
            backoff: Backoff::new(Duration::from_secs(15), Duration::from_secs(240)),
            requested_token: config.get("requested-token").ok().flatten(),
            account,
            config,
            crypto: None,
            remotes: HashMap::new(),
            used_ivs: HashSet::new(),
        }
    }

    pub fn state(&self) -> LinkState {
        self.state
    }

    /// Begin linking: persist the requested token and move to LINK.
    pub fn request_link(&mut self, token: String) -> Result<()> {
        self.config.set("requested-token", &token)?;
        self.requested_token = Some(token);
        self.state = LinkState::Link;
        self.backoff.reset();
        Ok(())
    }

    /// Clear all linkage state (called on a 404 from LINK or INFO).
    pub fn reset(&mut self) -> Result<()> {
        self.config.remove("requested-token")?;
        self.config.remove("account-token")?;
        self.config.remove("account-info")?;
        self.requested_token = None;
        self.account = None;
        self.crypto = None;
        self.state = LinkState::Idle;
        Ok(())
    }

    /// PUT the link request; see spec.md §4.5 "LINK".
    pub async fn do_link(
        &mut self,
        http: &dyn HttpClient,
        identity: &Identity,
        api_server: &str,
        machine_name: &str,
    ) -> Result<()> {
        let token = self
            .requested_token
            .clone()
            .ok_or_else(|| FahError::Other(anyhow::anyhow!("no requested token set")))?;

        let data = serde_json::json!({ "name": machine_name, "token": token });
        let signature = identity.sign_base64(&crate::wire::canonical_json(&data)?)?;
        let body = serde_json::json!({
            "data": data,
            "signature": signature,
            "pubkey": identity.public_key_pem()?,
        });

        let url = format!("{api_server}/machine/{}", identity.client_id());
        let resp = http
            .put(&url, serde_json::to_vec(&body).unwrap_or_default(), "application/json")
            .await?;

        if resp.status == 404 {
            self.reset()?;
            return Ok(());
        }
        if !resp.is_success() {
            return Err(FahError::Rejected(format!("link request failed: {}", resp.status)));
        }

        self.config.set("account-token", &token)?;
        self.state = LinkState::Info;
        self.backoff.reset();
        Ok(())
    }

    /// GET account info; see spec.md §4.5 "INFO".
    pub async fn do_info(&mut self, http: &dyn HttpClient, identity: &Identity, api_server: &str) -> Result<()> {
        let url = format!("{api_server}/machine/{}", identity.client_id());
        let resp = http.get(&url).await?;

        if resp.status == 404 {
            self.reset()?;
            return Ok(());
        }
        if !resp.is_success() {
            return Err(FahError::Rejected(format!("info request failed: {}", resp.status)));
        }

        let parsed: serde_json::Value = serde_json::from_slice(&resp.body)
            .map_err(|e| FahError::Integrity(format!("malformed account info: {e}")))?;
        let node = parsed["node"]
            .as_str()
            .ok_or_else(|| FahError::Integrity("account info missing node".into()))?
            .to_string();
        let public_key_pem = parsed["pubkey"]
            .as_str()
            .ok_or_else(|| FahError::Integrity("account info missing pubkey".into()))?
            .to_string();

        let account_id = crypto::account_id_from_public_key_pem(&public_key_pem)?;
        let info = AccountInfo {
            account_id,
            node,
            public_key_pem,
        };
        self.config
            .set("account-info", &serde_json::to_string(&info).unwrap_or_default())?;
        self.account = Some(info);
        self.state = LinkState::Connect;
        self.backoff.reset();
        Ok(())
    }

    /// Build the login payload sent immediately after the WebSocket opens.
    /// Returns `(session_key, login_message_json)`; the caller owns the
    /// actual WebSocket send.
    pub fn build_login(&mut self, identity: &Identity, now_unix: u64) -> Result<serde_json::Value> {
        let account = self
            .account
            .clone()
            .ok_or_else(|| FahError::Other(anyhow::anyhow!("no account info to log in with")))?;
        let account_pubkey = crypto::parse_public_key_pem(&account.public_key_pem)?;

        let crypto = SessionCrypto::generate()?;
        let wrapped_key = crypto.wrap_key_for(&account_pubkey)?;

        let payload = serde_json::json!({
            "time": now_unix,
            "account": account.account_id,
            "key": wrapped_key,
        });
        let signature = identity.sign_base64(&crate::wire::canonical_json(&payload)?)?;

        self.crypto = Some(crypto);
        self.state = LinkState::Connected;
        self.backoff.reset();

        Ok(serde_json::json!({
            "type": "login",
            "payload": payload,
            "signature": signature,
            "pubkey": identity.public_key_pem()?,
        }))
    }

    /// Encrypt an application payload into the post-login message envelope.
    pub fn encrypt_message(&mut self, client: &str, session: &str, plaintext: &[u8]) -> Result<serde_json::Value> {
        let crypto = self
            .crypto
            .as_mut()
            .ok_or_else(|| FahError::Other(anyhow::anyhow!("no session established")))?;
        let (iv, compressed, ciphertext) = crypto.encrypt(plaintext)?;
        self.record_iv(iv)?;

        let mut msg = serde_json::json!({
            "type": "message",
            "client": client,
            "session": session,
            "iv": base64::Engine::encode(&base64::engine::general_purpose::STANDARD, iv),
            "payload": base64::Engine::encode(&base64::engine::general_purpose::STANDARD, ciphertext),
        });
        if compressed {
            msg["compression"] = serde_json::json!("gzip");
        }
        Ok(msg)
    }

    /// Decrypt an incoming message envelope's payload, enforcing IV replay
    /// protection and the 4,000,000-entry session reset ceiling.
    pub fn decrypt_message(&mut self, iv_b64: &str, payload_b64: &str, compressed: bool) -> Result<Vec<u8>> {
        let iv_bytes = base64::Engine::decode(&base64::engine::general_purpose::STANDARD, iv_b64)
            .map_err(|e| FahError::Crypto(format!("malformed iv: {e}")))?;
        let iv: [u8; 16] = iv_bytes
            .try_into()
            .map_err(|_| FahError::Crypto("iv must be 16 bytes".into()))?;
        self.record_iv(iv)?;

        let ciphertext = base64::Engine::decode(&base64::engine::general_purpose::STANDARD, payload_b64)
            .map_err(|e| FahError::Crypto(format!("malformed payload: {e}")))?;

        let crypto = self
            .crypto
            .as_ref()
            .ok_or_else(|| FahError::Other(anyhow::anyhow!("no session established")))?;
        crypto.decrypt(&iv, &ciphertext, compressed)
    }

    pub(crate) fn record_iv(&mut self, iv: [u8; 16]) -> Result<()> {
        if self.used_ivs.len() >= MAX_IV_SET_SIZE {
            self.used_ivs.clear();
            self.crypto = None;
            self.state = LinkState::Connect;
            return Err(FahError::Replay("iv set exceeded bound, session reset".into()));
        }
        if !self.used_ivs.insert(iv) {
            self.used_ivs.clear();
            self.crypto = None;
            self.state = LinkState::Connect;
            return Err(FahError::Replay("duplicate iv observed".into()));
        }
        Ok(())
    }

    pub fn open_remote(&mut self, session: String, inbox: tokio::sync::mpsc::UnboundedSender<serde_json::Value>) {
        self.remotes.insert(session.clone(), RemoteStub { session, inbox });
    }

    pub fn close_remote(&mut self, session: &str) {
        self.remotes.remove(session);
    }

    /// Route a decrypted `message` frame's payload to the remote addressed
    /// by `session`. Returns `false` if no remote is open for that session
    /// (a `session-open` frame must have been handled first by whatever
    /// owns the remote's inbox).
    pub fn deliver(&self, session: &str, payload: serde_json::Value) -> bool {
        match self.remotes.get(session) {
            Some(remote) => remote.inbox.send(payload).is_ok(),
            None => false,
        }
    }

    pub fn remote_count(&self) -> usize {
        self.remotes.len()
    }

    /// WebSocket closed with a non-normal status: drop every multiplexed
    /// remote and fall back to reconnecting via INFO's known node.
    pub fn on_disconnected(&mut self) {
        self.remotes.clear();
        self.crypto = None;
        if self.account.is_some() {
            self.state = LinkState::Connect;
        } else {
            self.state = LinkState::Idle;
        }
    }

    pub fn backoff_delay(&mut self) -> Duration {
        self.backoff.next()
    }
}

pub use crypto::verify_broadcast_signature;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http_client::fake::FakeHttpClient;

    fn store() -> (tempfile::TempDir, KvTable) {
        let dir = tempfile::tempdir().unwrap();
        let kv = crate::kv::KvStore::open(dir.path()).unwrap();
        let table = kv.table("config").unwrap();
        (dir, table)
    }

    #[test]
    fn starts_idle_without_persisted_state() {
        let (_dir, table) = store();
        let channel = AccountChannel::new(table);
        assert_eq!(channel.state(), LinkState::Idle);
    }

    #[test]
    fn request_link_moves_to_link_state() {
        let (_dir, table) = store();
        let mut channel = AccountChannel::new(table);
        channel.request_link("tok".into()).unwrap();
        assert_eq!(channel.state(), LinkState::Link);
    }

    #[tokio::test]
    async fn link_404_resets_state() {
        let (_dir, table) = store();
        let identity_table = table.clone();
        let mut channel = AccountChannel::new(table);
        channel.request_link("tok".into()).unwrap();

        let identity = Identity::load_or_generate(&identity_table).unwrap();
        let http = FakeHttpClient::new();
        let url = format!("https://api.example/machine/{}", identity.client_id());
        http.respond(&url, 404, Vec::new());

        channel.do_link(&http, &identity, "https://api.example", "laptop").await.unwrap();
        assert_eq!(channel.state(), LinkState::Idle);
    }

    #[test]
    fn duplicate_iv_triggers_replay_error() {
        let (_dir, table) = store();
        let mut channel = AccountChannel::new(table);
        channel.record_iv([1u8; 16]).unwrap();
        let err = channel.record_iv([1u8; 16]);
        assert!(err.is_err());
        assert_eq!(channel.state(), LinkState::Idle);
    }

    #[test]
    fn disconnect_clears_remotes() {
        let (_dir, table) = store();
        let mut channel = AccountChannel::new(table);
        let (tx, _rx) = tokio::sync::mpsc::unbounded_channel();
        channel.open_remote("s1".into(), tx);
        assert_eq!(channel.remote_count(), 1);
        channel.on_disconnected();
        assert_eq!(channel.remote_count(), 0);
    }
}
