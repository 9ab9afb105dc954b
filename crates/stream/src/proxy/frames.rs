//! Frame encoding for multiplexed upstream responses.
//!
//! An upstream response is piped into its stream as a sequence of
//! JSON-line frames: `S` (start: status and headers), `D` (data chunk,
//! base64), then exactly one of `C` (complete), `A` (aborted), or `E`
//! (error). Every frame carries the response id, which increases by one
//! per upstream response on the stream.

use std::collections::BTreeMap;

use base64::{engine::general_purpose::STANDARD, Engine};
use bytes::Bytes;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "t")]
pub enum Frame {
    #[serde(rename = "S")]
    Start {
        rid: u64,
        status: u16,
        headers: BTreeMap<String, String>,
    },
    #[serde(rename = "D")]
    Data { rid: u64, data: String },
    #[serde(rename = "C")]
    Complete { rid: u64 },
    #[serde(rename = "A")]
    Aborted { rid: u64 },
    #[serde(rename = "E")]
    Error { rid: u64, message: String },
}

impl Frame {
    pub fn data(rid: u64, chunk: &[u8]) -> Frame {
        Frame::Data {
            rid,
            data: STANDARD.encode(chunk),
        }
    }

    /// Response id carried by this frame.
    pub fn rid(&self) -> u64 {
        match self {
            Frame::Start { rid, .. }
            | Frame::Data { rid, .. }
            | Frame::Complete { rid }
            | Frame::Aborted { rid }
            | Frame::Error { rid, .. } => *rid,
        }
    }

    /// True for `C`, `A`, and `E`.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Frame::Complete { .. } | Frame::Aborted { .. } | Frame::Error { .. }
        )
    }

    /// One newline-terminated JSON line.
    pub fn encode(&self) -> Bytes {
        let mut line = serde_json::to_vec(self).expect("frame serialization is infallible");
        line.push(b'\n');
        Bytes::from(line)
    }

    /// Parse one journal line back into a frame.
    pub fn decode(line: &[u8]) -> Option<Frame> {
        serde_json::from_slice(line).ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn start_frame_round_trips() {
        let mut headers = BTreeMap::new();
        headers.insert("content-type".to_string(), "text/event-stream".to_string());
        let frame = Frame::Start {
            rid: 1,
            status: 200,
            headers,
        };
        let encoded = frame.encode();
        assert!(encoded.ends_with(b"\n"));
        assert_eq!(Frame::decode(&encoded[..encoded.len() - 1]), Some(frame));
    }

    #[test]
    fn data_frame_carries_base64() {
        let frame = Frame::data(2, b"\x00\x01binary");
        let Frame::Data { rid, data } = &frame else {
            panic!("expected data frame");
        };
        assert_eq!(*rid, 2);
        assert_eq!(STANDARD.decode(data).unwrap(), b"\x00\x01binary");
    }

    #[test]
    fn tags_are_single_letters() {
        let line = Frame::Complete { rid: 3 }.encode();
        let text = std::str::from_utf8(&line).unwrap();
        assert!(text.contains(r#""t":"C""#));
        let line = Frame::Aborted { rid: 3 }.encode();
        assert!(std::str::from_utf8(&line).unwrap().contains(r#""t":"A""#));
    }

    #[test]
    fn terminal_classification() {
        assert!(!Frame::data(1, b"x").is_terminal());
        assert!(Frame::Complete { rid: 1 }.is_terminal());
        assert!(Frame::Aborted { rid: 1 }.is_terminal());
        assert!(Frame::Error { rid: 1, message: "boom".to_string() }.is_terminal());
    }
}
