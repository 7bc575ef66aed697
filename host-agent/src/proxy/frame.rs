//! Wire frame for the upstream websocket protocol (spec.md §3, §6).
//!
//! Every text message on the socket is `{key, type, body}` with
//! `type ∈ {"Connect","Body","Close"}`. All sub-protocols (HTTPMessage,
//! exec bytes, stats lines) ride inside `body` as opaque text.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FrameType {
    Connect,
    Body,
    Close,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Frame {
    pub key: String,
    #[serde(rename = "type")]
    pub frame_type: FrameType,
    #[serde(default)]
    pub body: String,
}

impl Frame {
    pub fn connect(key: impl Into<String>, initial_url: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            frame_type: FrameType::Connect,
            body: initial_url.into(),
        }
    }

    pub fn body(key: impl Into<String>, body: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            frame_type: FrameType::Body,
            body: body.into(),
        }
    }

    pub fn close(key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            frame_type: FrameType::Close,
            body: String::new(),
        }
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string(self).expect("Frame serialization is infallible")
    }

    pub fn from_json(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_through_json() {
        let f = Frame::body("k1", "hello");
        let json = f.to_json();
        let back = Frame::from_json(&json).unwrap();
        assert_eq!(back.key, "k1");
        assert_eq!(back.frame_type, FrameType::Body);
        assert_eq!(back.body, "hello");
    }

    #[test]
    fn close_frame_has_empty_body() {
        let f = Frame::close("k1");
        assert_eq!(f.frame_type, FrameType::Close);
        assert!(f.body.is_empty());
    }

    #[test]
    fn deserializes_wire_shape_literally() {
        let json = r#"{"key":"k9","type":"Connect","body":"/v1/logs/?token=abc"}"#;
        let f = Frame::from_json(json).unwrap();
        assert_eq!(f.key, "k9");
        assert_eq!(f.frame_type, FrameType::Connect);
        assert_eq!(f.body, "/v1/logs/?token=abc");
    }
}
