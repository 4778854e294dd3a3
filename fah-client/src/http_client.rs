// Copyright (c) 2025 Jonathan Fontanez
// SPDX-License-Identifier: BUSL-1.1

//! Signed-HTTP transport, injected behind a trait so unit/group/account
//! tests can run against a fake server instead of real sockets.

use crate::error::{FahError, Result};
use async_trait::async_trait;
use std::collections::HashMap;

#[derive(Debug, Clone)]
pub struct HttpResponse {
    pub status: u16,
    pub headers: HashMap<String, String>,
    pub body: Vec<u8>,
}

impl HttpResponse {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

/// Transport used by the Core Cache, Account Channel's LINK/INFO steps, and
/// the assignment/work/collector HTTP calls the Unit State Machine makes.
#[async_trait]
pub trait HttpClient: Send + Sync {
    async fn get(&self, url: &str) -> Result<HttpResponse>;
    async fn put(&self, url: &str, body: Vec<u8>, content_type: &str) -> Result<HttpResponse>;
    async fn post(&self, url: &str, body: Vec<u8>, content_type: &str) -> Result<HttpResponse>;
}

/// Production transport backed by `reqwest`.
pub struct ReqwestHttpClient {
    client: reqwest::Client,
}

impl ReqwestHttpClient {
    pub fn new() -> Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent(concat!("fah-client/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| FahError::Transport(e.to_string()))?;
        Ok(Self { client })
    }

    async fn to_response(resp: reqwest::Response) -> Result<HttpResponse> {
        let status = resp.status().as_u16();
        let headers = resp
            .headers()
            .iter()
            .filter_map(|(k, v)| Some((k.to_string(), v.to_str().ok()?.to_string())))
            .collect();
        let body = resp
            .bytes()
            .await
            .map_err(|e| FahError::Transport(e.to_string()))?
            .to_vec();
        Ok(HttpResponse {
            status,
            headers,
            body,
        })
    }
}

impl Default for ReqwestHttpClient {
    fn default() -> Self {
        Self::new().expect("default reqwest client construction cannot fail")
    }
}

#[async_trait]
impl HttpClient for ReqwestHttpClient {
    async fn get(&self, url: &str) -> Result<HttpResponse> {
        let resp = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| FahError::Transport(e.to_string()))?;
        Self::to_response(resp).await
    }

    async fn put(&self, url: &str, body: Vec<u8>, content_type: &str) -> Result<HttpResponse> {
        let resp = self
            .client
            .put(url)
            .header("Content-Type", content_type)
            .body(body)
            .send()
            .await
            .map_err(|e| FahError::Transport(e.to_string()))?;
        Self::to_response(resp).await
    }

    async fn post(&self, url: &str, body: Vec<u8>, content_type: &str) -> Result<HttpResponse> {
        let resp = self
            .client
            .post(url)
            .header("Content-Type", content_type)
            .body(body)
            .send()
            .await
            .map_err(|e| FahError::Transport(e.to_string()))?;
        Self::to_response(resp).await
    }
}
