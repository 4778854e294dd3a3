// Copyright (c) 2025 Jonathan Fontanez
// SPDX-License-Identifier: BUSL-1.1

//! Local Control Surface: broadcasts observable-state diffs to local
//! WebSocket clients and accepts their commands. Framing (the actual
//! `axum` WebSocket upgrade/accept loop) lives in `fah-client-cli`, which
//! owns the HTTP server; this module only defines the data model and the
//! broadcast channel the server wires up to.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::broadcast;

/// A single observable mutation: the path into the app tree and its new
/// value, e.g. `["units", 3, "frames", 12, <value>]`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChangePath {
    pub path: Vec<PathSegment>,
    pub value: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PathSegment {
    Key(String),
    Index(usize),
}

/// Commands a browser client may send as `{cmd: ...}`.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "cmd", rename_all = "lowercase")]
pub enum Command {
    Dump,
    State { state: String, group: Option<String> },
    Config,
    Restart,
    Link { token: String, name: String },
    Viz { unit: String, frame: u32 },
    Log { enable: bool },
    Wus { enable: bool },
}

/// Broadcasts every observable mutation to all connected local clients.
/// Bounded so a stalled client can't grow memory without limit; it simply
/// misses updates and gets caught up by the next full-tree snapshot.
pub struct ObservableBus {
    sender: broadcast::Sender<ChangePath>,
}

impl ObservableBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _receiver) = broadcast::channel(capacity);
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ChangePath> {
        self.sender.subscribe()
    }

    pub fn emit(&self, path: Vec<PathSegment>, value: Value) {
        // No receivers is the common case before the first client connects;
        // that's not an error.
        let _ = self.sender.send(ChangePath { path, value });
    }
}

impl Default for ObservableBus {
    fn default() -> Self {
        Self::new(1024)
    }
}

/// Dispatch an incoming command, logging and ignoring anything the parser
/// didn't recognize (per spec.md §4.6, unknown commands are logged and
/// ignored — this happens at the JSON-decode boundary above this type).
pub fn parse_command(raw: &str) -> Option<Command> {
    match serde_json::from_str(raw) {
        Ok(cmd) => Some(cmd),
        Err(e) => {
            tracing::warn!("ignoring unrecognized local control command: {e}");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn emit_with_no_subscribers_does_not_panic() {
        let bus = ObservableBus::new(8);
        bus.emit(vec![PathSegment::Key("units".into())], serde_json::json!(1));
    }

    #[tokio::test]
    async fn subscriber_receives_emitted_change() {
        let bus = ObservableBus::new(8);
        let mut rx = bus.subscribe();
        bus.emit(
            vec![PathSegment::Key("groups".into()), PathSegment::Index(0)],
            serde_json::json!("paused"),
        );
        let change = rx.recv().await.unwrap();
        assert_eq!(change.value, serde_json::json!("paused"));
    }

    #[test]
    fn unknown_command_parses_to_none() {
        assert!(parse_command(r#"{"cmd":"frobnicate"}"#).is_none());
    }

    #[test]
    fn known_command_parses() {
        let cmd = parse_command(r#"{"cmd":"restart"}"#);
        assert!(matches!(cmd, Some(Command::Restart)));
    }

    #[test]
    fn link_command_carries_fields() {
        let cmd = parse_command(r#"{"cmd":"link","token":"t","name":"laptop"}"#);
        match cmd {
            Some(Command::Link { token, name }) => {
                assert_eq!(token, "t");
                assert_eq!(name, "laptop");
            }
            _ => panic!("expected Link command"),
        }
    }
}
