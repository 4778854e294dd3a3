// Copyright (c) 2025 Jonathan Fontanez
// SPDX-License-Identifier: BUSL-1.1

//! The Account Channel's actual WebSocket transport: connects to
//! `wss://<node>/ws/client`, sends the login frame, and relays incoming
//! `message`/`broadcast` frames into the [`AccountChannel`] state machine
//! until the socket closes.
//!
//! This module owns only the socket loop. Session lifecycle for individual
//! remotes (`open_remote`/`close_remote`, driven by `session-open`/
//! `session-close` frames) and dispatch of `broadcast` payloads to
//! state/config/restart handlers are left to the caller, which holds the
//! app state those handlers mutate.

use super::AccountChannel;
use crate::error::{FahError, Result};
use crate::identity::Identity;
use futures_util::{SinkExt, StreamExt};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::sync::Mutex;
use tokio_tungstenite::tungstenite::Message;

/// Connect, log in, and pump frames until the socket closes or errors.
/// Returns `Ok(())` on a clean close; the caller is expected to back off
/// (via `AccountChannel::backoff_delay`) and call this again to reconnect.
pub async fn run(channel: Arc<Mutex<AccountChannel>>, identity: Arc<Identity>, node: &str) -> Result<()> {
    let url = format!("wss://{node}/ws/client");
    let (ws, _response) = tokio_tungstenite::connect_async(url.as_str())
        .await
        .map_err(|e| FahError::Transport(format!("account websocket connect to {url} failed: {e}")))?;
    let (mut sink, mut stream) = ws.split();

    let login = {
        let mut ch = channel.lock().await;
        let now_unix = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs();
        ch.build_login(&identity, now_unix)?
    };
    let login_text = serde_json::to_string(&login)
        .map_err(|e| FahError::Other(anyhow::anyhow!(e)))?;
    sink.send(Message::Text(login_text.into()))
        .await
        .map_err(|e| FahError::Transport(format!("account login send failed: {e}")))?;

    while let Some(frame) = stream.next().await {
        let frame = frame.map_err(|e| FahError::Transport(format!("account websocket error: {e}")))?;
        match frame {
            Message::Text(text) => handle_frame(&channel, &text).await,
            Message::Close(_) => break,
            _ => {}
        }
    }

    channel.lock().await.on_disconnected();
    Ok(())
}

async fn handle_frame(channel: &Arc<Mutex<AccountChannel>>, text: &str) {
    let Ok(frame) = serde_json::from_str::<serde_json::Value>(text) else {
        tracing::warn!("malformed account channel frame, ignoring");
        return;
    };

    match frame["type"].as_str() {
        Some("message") => handle_message_frame(channel, &frame).await,
        Some("broadcast") => {
            // Signature verification (see `verify_broadcast_signature`) and
            // dispatch to state/config/restart handlers belongs to the
            // caller, which owns the mutable app state those handlers act
            // on; this loop only decodes the envelope shape.
            tracing::debug!("account broadcast frame received");
        }
        other => tracing::debug!(?other, "unrecognized account channel frame type"),
    }
}

async fn handle_message_frame(channel: &Arc<Mutex<AccountChannel>>, frame: &serde_json::Value) {
    let (Some(session), Some(iv), Some(payload)) = (
        frame["session"].as_str(),
        frame["iv"].as_str(),
        frame["payload"].as_str(),
    ) else {
        tracing::warn!("message frame missing session/iv/payload");
        return;
    };
    let compressed = frame["compression"].as_str() == Some("gzip");

    let mut ch = channel.lock().await;
    let plaintext = match ch.decrypt_message(iv, payload, compressed) {
        Ok(bytes) => bytes,
        Err(e) => {
            tracing::warn!("failed to decrypt account message: {e}");
            return;
        }
    };
    let Ok(value) = serde_json::from_slice::<serde_json::Value>(&plaintext) else {
        tracing::warn!("account message payload was not valid json");
        return;
    };
    if !ch.deliver(session, value) {
        tracing::debug!(session, "dropped message for unknown remote session");
    }
}
