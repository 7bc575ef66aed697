//! HTTP-tunnel handler (spec.md §4.5).
//!
//! Reconstructs an HTTP request from `HTTPMessage` frames, executes it
//! against a local target, and streams the response back as further
//! `HTTPMessage` frames: first the status + headers, then body chunks,
//! then a terminal `eof:true` frame.

use crate::proxy::handler::{Handler, SessionIo};
use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::warn;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(60);

mod base64_body {
    use super::*;

    pub fn serialize<S: Serializer>(bytes: &[u8], s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&BASE64.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(d)?;
        if s.is_empty() {
            return Ok(Vec::new());
        }
        BASE64.decode(s.as_bytes()).map_err(serde::de::Error::custom)
    }
}

/// Sub-protocol riding inside `Frame::body` for the HTTP tunnel (spec.md §3).
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct HttpMessage {
    #[serde(default)]
    pub hijack: bool,
    #[serde(default)]
    pub host: String,
    #[serde(default)]
    pub method: String,
    #[serde(default)]
    pub url: String,
    #[serde(default)]
    pub headers: HashMap<String, Vec<String>>,
    #[serde(default, with = "base64_body")]
    pub body: Vec<u8>,
    #[serde(default)]
    pub code: u16,
    #[serde(default)]
    pub eof: bool,
}

pub struct HttpTunnelHandler {
    verifier: Arc<crate::auth::TokenVerifier>,
}

impl HttpTunnelHandler {
    pub fn new(verifier: Arc<crate::auth::TokenVerifier>) -> Self {
        Self { verifier }
    }
}

#[async_trait]
impl Handler for HttpTunnelHandler {
    async fn handle(&self, initial_message: String, mut io: SessionIo) -> anyhow::Result<()> {
        if let Err(e) = super::verify_session_token(&self.verifier, &initial_message) {
            warn!(err = %e, "http-tunnel session rejected");
            return Ok(());
        }

        let Some(first) = io.inbound.recv().await else {
            return Ok(());
        };
        let first_msg: HttpMessage = serde_json::from_str(&first)?;

        // Read further body chunks until eof:true, or the inbound channel
        // closes mid-frame — which returns a clean EOF rather than an error
        // (spec.md §8 boundary case).
        let mut body = first_msg.body.clone();
        let mut eof = first_msg.eof;
        while !eof {
            match io.inbound.recv().await {
                Some(raw) => {
                    let chunk: HttpMessage = serde_json::from_str(&raw)?;
                    body.extend_from_slice(&chunk.body);
                    eof = chunk.eof;
                }
                None => eof = true,
            }
        }

        let client = reqwest::Client::builder().timeout(REQUEST_TIMEOUT).build()?;
        let method = reqwest::Method::from_bytes(first_msg.method.as_bytes())
            .unwrap_or(reqwest::Method::GET);
        let mut req = client.request(method, &first_msg.url);
        for (name, values) in &first_msg.headers {
            for v in values {
                req = req.header(name, v);
            }
        }
        if !body.is_empty() {
            req = req.body(body);
        }

        let resp = match tokio::time::timeout(REQUEST_TIMEOUT, req.send()).await {
            Ok(Ok(r)) => r,
            Ok(Err(e)) => {
                warn!(err = %e, "http-tunnel request failed — ending session");
                return Ok(());
            }
            Err(_) => {
                warn!("http-tunnel request timed out after 60s");
                return Ok(());
            }
        };

        let code = resp.status().as_u16();
        let mut headers: HashMap<String, Vec<String>> = HashMap::new();
        for (name, value) in resp.headers() {
            headers
                .entry(name.to_string())
                .or_default()
                .push(value.to_str().unwrap_or_default().to_string());
        }

        let head = HttpMessage {
            code,
            headers,
            ..Default::default()
        };
        if io.send(serde_json::to_string(&head)?).await.is_err() {
            return Ok(());
        }

        let resp_bytes = resp.bytes().await.unwrap_or_default();
        if !resp_bytes.is_empty() {
            let body_frame = HttpMessage {
                body: resp_bytes.to_vec(),
                ..Default::default()
            };
            if io.send(serde_json::to_string(&body_frame)?).await.is_err() {
                return Ok(());
            }
        }

        let eof_frame = HttpMessage {
            eof: true,
            ..Default::default()
        };
        let _ = io.send(serde_json::to_string(&eof_frame)?).await;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn http_message_round_trips_through_json() {
        let msg = HttpMessage {
            method: "GET".into(),
            url: "http://127.0.0.1:8080/x".into(),
            body: b"hi".to_vec(),
            code: 200,
            eof: true,
            ..Default::default()
        };
        let json = serde_json::to_string(&msg).unwrap();
        let back: HttpMessage = serde_json::from_str(&json).unwrap();
        assert_eq!(back.body, b"hi");
        assert_eq!(back.code, 200);
        assert!(back.eof);
    }

    #[test]
    fn empty_body_serializes_as_empty_string_not_padding() {
        let msg = HttpMessage::default();
        let json = serde_json::to_string(&msg).unwrap();
        assert!(json.contains("\"body\":\"\""));
    }
}
