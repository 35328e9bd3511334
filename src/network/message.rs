// src/network/message.rs

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::error::ModelError;
use crate::model::{IopType, IopValue};

/// Control lines exchanged between TCP presence nodes (one JSON object per line).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum MessageType {
    #[serde(rename = "HELLO")]
    Hello {
        node_id: String,
        name: String,
        listen_addr: Option<String>,
        // Optional protocol branding and version for compatibility signaling
        protocol: Option<String>,
        version: Option<String>,
        #[serde(default)]
        headers: HashMap<String, String>,
        #[serde(default)]
        groups: Vec<String>,
    },
    #[serde(rename = "JOIN")]
    Join { group: String },
    #[serde(rename = "LEAVE")]
    Leave { group: String },
    /// Frames travel in the payload
    #[serde(rename = "WHISPER")]
    Whisper,
    #[serde(rename = "SHOUT")]
    Shout { group: String },
    #[serde(rename = "PEER_LIST")]
    PeerList { peers: Vec<PeerAddr> },
    #[serde(rename = "HEARTBEAT")]
    Heartbeat,
    #[serde(rename = "DISCONNECT")]
    Disconnect,
}

/// Gossip entry: where a known node listens.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PeerAddr {
    pub node_id: String,
    pub addr: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", content = "value")]
pub enum Payload {
    Text(String),
    /// Hex-encoded frames
    Frames(Vec<String>),
}

impl Payload {
    pub fn from_frames(frames: &[Bytes]) -> Self {
        Payload::Frames(frames.iter().map(hex::encode).collect())
    }

    /// Decode frames; a text payload is a single frame.
    pub fn into_frames(self) -> Option<Vec<Bytes>> {
        match self {
            Payload::Text(t) => Some(vec![Bytes::from(t.into_bytes())]),
            Payload::Frames(parts) => parts
                .into_iter()
                .map(|p| hex::decode(p).ok().map(Bytes::from))
                .collect(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Message {
    pub from: String,
    pub msg_type: MessageType,
    pub payload: Option<Payload>,
}

impl Message {
    pub fn new(from: &str, msg_type: MessageType, payload: Option<Payload>) -> Self {
        Self {
            from: from.to_string(),
            msg_type,
            payload,
        }
    }

    pub fn as_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| "{}".into())
    }

    pub fn from_json(json: &str) -> Option<Self> {
        serde_json::from_str(json.trim_end()).ok()
    }
}

/// One published output value: frames are `[name, type tag as decimal text, value bytes]`.
#[derive(Debug, Clone, PartialEq)]
pub struct DataMessage {
    pub name: String,
    pub value: IopValue,
}

impl DataMessage {
    pub fn new(name: impl Into<String>, value: IopValue) -> Self {
        Self {
            name: name.into(),
            value,
        }
    }

    pub fn iop_type(&self) -> IopType {
        self.value.iop_type()
    }

    pub fn to_frames(&self) -> Vec<Bytes> {
        vec![
            Bytes::from(self.name.clone().into_bytes()),
            Bytes::from(self.value.iop_type().tag().to_string().into_bytes()),
            Bytes::from(self.value.to_wire_bytes()),
        ]
    }

    pub fn from_frames(frames: &[Bytes]) -> Result<Self, ModelError> {
        if frames.len() != 3 {
            return Err(ModelError::InvalidValue {
                name: String::new(),
                detail: format!("expected 3 frames, got {}", frames.len()),
            });
        }
        let name = String::from_utf8(frames[0].to_vec()).map_err(|_| ModelError::InvalidValue {
            name: String::new(),
            detail: "output name is not UTF-8".into(),
        })?;
        let tag_text = std::str::from_utf8(&frames[1]).unwrap_or_default();
        let iop_type = tag_text
            .parse::<u8>()
            .ok()
            .and_then(IopType::from_tag)
            .ok_or_else(|| ModelError::UnknownType(tag_text.to_string()))?;
        let value = IopValue::from_wire_bytes(iop_type, &frames[2])?;
        Ok(Self { name, value })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hello_uses_wire_token() {
        let msg = Message::new(
            "n1",
            MessageType::Hello {
                node_id: "n1".into(),
                name: "A".into(),
                listen_addr: Some("127.0.0.1:5670".into()),
                protocol: None,
                version: None,
                headers: HashMap::from([("publisher".to_string(), "6000".to_string())]),
                groups: vec![],
            },
            None,
        );
        let json = msg.as_json();
        assert!(json.contains("\"HELLO\""));
        assert_eq!(Message::from_json(&json), Some(msg));
    }

    #[test]
    fn frames_payload_survives_json() {
        let frames = vec![Bytes::from_static(b"MUTE"), Bytes::from_static(&[0, 255])];
        let msg = Message::new("n1", MessageType::Whisper, Some(Payload::from_frames(&frames)));
        let back = Message::from_json(&msg.as_json()).unwrap();
        assert_eq!(back.payload.unwrap().into_frames().unwrap(), frames);
    }

    #[test]
    fn data_message_layout() {
        let frames = DataMessage::new("temp", IopValue::Double(21.5)).to_frames();
        assert_eq!(&frames[0][..], b"temp");
        assert_eq!(&frames[1][..], b"2");
        assert_eq!(frames[2].len(), 8);
        let back = DataMessage::from_frames(&frames).unwrap();
        assert_eq!(back.value, IopValue::Double(21.5));
    }

    #[test]
    fn data_message_rejects_bad_tag() {
        let frames = vec![
            Bytes::from_static(b"x"),
            Bytes::from_static(b"42"),
            Bytes::new(),
        ];
        assert!(DataMessage::from_frames(&frames).is_err());
    }
}
