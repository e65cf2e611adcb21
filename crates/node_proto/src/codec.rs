//! Typed messages on top of the protobuf envelope.
//!
//! `decode` never panics: truncated, oversized or inconsistent frames come
//! back as [`DecodeError`] so the caller can drop them. Kinds this version
//! does not know decode to [`Message::Unknown`].

use std::collections::BTreeMap;

use prost::Message as _;
use thiserror::Error;

use crate::mesh::{self, envelope::Body, Envelope, KeyValue, MsgType};

pub const PROTOCOL_VERSION: u32 = 2;
pub const BEACON_SIGNATURE: &str = "ZRE";
pub const BEACON_VERSION: u32 = 1;
pub const MAX_FRAME_SIZE: usize = 4 * 1024 * 1024;

/// Peer headers. Keys are unique; on the wire they travel as ordered pairs.
pub type Headers = BTreeMap<String, String>;

#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("protobuf decode error: {0}")]
    Decode(#[from] prost::DecodeError),
    #[error("frame too large: {0} bytes")]
    TooLarge(usize),
    #[error("unsupported protocol version {0}")]
    Version(u32),
    #[error("frame has no sender")]
    MissingSender,
    #[error("{0} frame has no body")]
    MissingBody(&'static str),
    #[error("{0} frame carries a different body")]
    KindMismatch(&'static str),
    #[error("field {0} out of range")]
    OutOfRange(&'static str),
    #[error("bad beacon signature {0:?}")]
    Signature(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    Hello {
        endpoint: String,
        groups: Vec<String>,
        status: u8,
        name: String,
        headers: Headers,
    },
    Whisper {
        payload: Vec<u8>,
    },
    Shout {
        group: String,
        payload: Vec<u8>,
    },
    Join {
        group: String,
        status: u8,
    },
    Leave {
        group: String,
        status: u8,
    },
    Ping,
    PingOk,
    Stop,
    /// A kind from a newer protocol revision; `raw` is the whole frame.
    Unknown {
        kind: i32,
        raw: Vec<u8>,
    },
}

impl Message {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Hello { .. } => "HELLO",
            Self::Whisper { .. } => "WHISPER",
            Self::Shout { .. } => "SHOUT",
            Self::Join { .. } => "JOIN",
            Self::Leave { .. } => "LEAVE",
            Self::Ping => "PING",
            Self::PingOk => "PING-OK",
            Self::Stop => "STOP",
            Self::Unknown { .. } => "UNKNOWN",
        }
    }
}

/// One decoded envelope: who sent it, its per-peer sequence, and the message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub sender: String,
    pub sequence: u16,
    pub message: Message,
}

pub fn encode(frame: &Frame) -> Vec<u8> {
    let (kind, body) = match &frame.message {
        Message::Hello {
            endpoint,
            groups,
            status,
            name,
            headers,
        } => (
            MsgType::Hello,
            Some(Body::Hello(mesh::Hello {
                endpoint: endpoint.clone(),
                groups: groups.clone(),
                status: u32::from(*status),
                name: name.clone(),
                headers: headers
                    .iter()
                    .map(|(key, value)| KeyValue {
                        key: key.clone(),
                        value: value.clone(),
                    })
                    .collect(),
            })),
        ),
        Message::Whisper { payload } => (
            MsgType::Whisper,
            Some(Body::Whisper(mesh::Whisper {
                payload: payload.clone(),
            })),
        ),
        Message::Shout { group, payload } => (
            MsgType::Shout,
            Some(Body::Shout(mesh::Shout {
                group: group.clone(),
                payload: payload.clone(),
            })),
        ),
        Message::Join { group, status } => (
            MsgType::Join,
            Some(Body::Join(mesh::Join {
                group: group.clone(),
                status: u32::from(*status),
            })),
        ),
        Message::Leave { group, status } => (
            MsgType::Leave,
            Some(Body::Leave(mesh::Leave {
                group: group.clone(),
                status: u32::from(*status),
            })),
        ),
        Message::Ping => (MsgType::Ping, Some(Body::Ping(mesh::Ping {}))),
        Message::PingOk => (MsgType::PingOk, Some(Body::PingOk(mesh::PingOk {}))),
        Message::Stop => (MsgType::Stop, Some(Body::Stop(mesh::Stop {}))),
        // Re-emit unknown frames untouched.
        Message::Unknown { raw, .. } => return raw.clone(),
    };

    Envelope {
        version: PROTOCOL_VERSION,
        r#type: kind as i32,
        sequence: u32::from(frame.sequence),
        sender: frame.sender.clone(),
        body,
    }
    .encode_to_vec()
}

pub fn decode(bytes: &[u8]) -> Result<Frame, DecodeError> {
    if bytes.len() > MAX_FRAME_SIZE {
        return Err(DecodeError::TooLarge(bytes.len()));
    }

    let env = Envelope::decode(bytes)?;
    if env.version != PROTOCOL_VERSION {
        return Err(DecodeError::Version(env.version));
    }
    if env.sender.is_empty() {
        return Err(DecodeError::MissingSender);
    }
    let sequence =
        u16::try_from(env.sequence).map_err(|_| DecodeError::OutOfRange("sequence"))?;

    let message = match MsgType::try_from(env.r#type).ok() {
        None | Some(MsgType::Unspecified) => Message::Unknown {
            kind: env.r#type,
            raw: bytes.to_vec(),
        },
        Some(kind) => message_from_body(kind, env.body)?,
    };

    Ok(Frame {
        sender: env.sender,
        sequence,
        message,
    })
}

fn message_from_body(kind: MsgType, body: Option<Body>) -> Result<Message, DecodeError> {
    let message = match (kind, body) {
        (MsgType::Hello, Some(Body::Hello(hello))) => Message::Hello {
            endpoint: hello.endpoint,
            groups: hello.groups,
            status: status_from_wire(hello.status)?,
            name: hello.name,
            // Later duplicates overwrite earlier ones.
            headers: hello
                .headers
                .into_iter()
                .map(|kv| (kv.key, kv.value))
                .collect(),
        },
        (MsgType::Whisper, Some(Body::Whisper(whisper))) => Message::Whisper {
            payload: whisper.payload,
        },
        (MsgType::Shout, Some(Body::Shout(shout))) => Message::Shout {
            group: shout.group,
            payload: shout.payload,
        },
        (MsgType::Join, Some(Body::Join(join))) => Message::Join {
            group: join.group,
            status: status_from_wire(join.status)?,
        },
        (MsgType::Leave, Some(Body::Leave(leave))) => Message::Leave {
            group: leave.group,
            status: status_from_wire(leave.status)?,
        },
        (MsgType::Ping, None | Some(Body::Ping(_))) => Message::Ping,
        (MsgType::PingOk, None | Some(Body::PingOk(_))) => Message::PingOk,
        (MsgType::Stop, None | Some(Body::Stop(_))) => Message::Stop,
        (kind, None) => return Err(DecodeError::MissingBody(kind_name(kind))),
        (kind, Some(_)) => return Err(DecodeError::KindMismatch(kind_name(kind))),
    };
    Ok(message)
}

fn kind_name(kind: MsgType) -> &'static str {
    match kind {
        MsgType::Unspecified => "UNSPECIFIED",
        MsgType::Hello => "HELLO",
        MsgType::Whisper => "WHISPER",
        MsgType::Shout => "SHOUT",
        MsgType::Join => "JOIN",
        MsgType::Leave => "LEAVE",
        MsgType::Ping => "PING",
        MsgType::PingOk => "PING-OK",
        MsgType::Stop => "STOP",
    }
}

fn status_from_wire(status: u32) -> Result<u8, DecodeError> {
    u8::try_from(status).map_err(|_| DecodeError::OutOfRange("status"))
}

/// Contents of a discovery beacon.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BeaconInfo {
    pub node_id: String,
    pub name: String,
    pub port: u16,
}

pub fn encode_beacon(info: &BeaconInfo) -> Vec<u8> {
    mesh::Beacon {
        signature: BEACON_SIGNATURE.to_string(),
        version: BEACON_VERSION,
        node_id: info.node_id.clone(),
        name: info.name.clone(),
        port: u32::from(info.port),
    }
    .encode_to_vec()
}

pub fn decode_beacon(bytes: &[u8]) -> Result<BeaconInfo, DecodeError> {
    let beacon = mesh::Beacon::decode(bytes)?;
    if beacon.signature != BEACON_SIGNATURE {
        return Err(DecodeError::Signature(beacon.signature));
    }
    if beacon.version != BEACON_VERSION {
        return Err(DecodeError::Version(beacon.version));
    }
    if beacon.node_id.is_empty() {
        return Err(DecodeError::MissingSender);
    }
    let port = u16::try_from(beacon.port).map_err(|_| DecodeError::OutOfRange("port"))?;
    Ok(BeaconInfo {
        node_id: beacon.node_id,
        name: beacon.name,
        port,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(message: Message) -> Frame {
        Frame {
            sender: "9F3A0C".into(),
            sequence: 7,
            message,
        }
    }

    fn headers(pairs: &[(&str, &str)]) -> Headers {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    fn hello(headers: Headers) -> Message {
        Message::Hello {
            endpoint: "192.168.1.10:49152".into(),
            groups: vec!["ROOM".into(), "ops".into()],
            status: 4,
            name: "alice".into(),
            headers,
        }
    }

    #[test]
    fn every_kind_survives_encode_decode() {
        let messages = vec![
            hello(Headers::new()),
            Message::Whisper {
                payload: b"psst".to_vec(),
            },
            Message::Shout {
                group: "ROOM".into(),
                payload: b"hi".to_vec(),
            },
            Message::Join {
                group: "ROOM".into(),
                status: 1,
            },
            Message::Leave {
                group: "ROOM".into(),
                status: 2,
            },
            Message::Ping,
            Message::PingOk,
            Message::Stop,
        ];

        for message in messages {
            let original = frame(message);
            let decoded = decode(&encode(&original)).unwrap();
            assert_eq!(decoded, original, "kind {}", original.message.kind());
        }
    }

    #[test]
    fn hello_headers_with_zero_one_and_many_entries() {
        for h in [
            Headers::new(),
            headers(&[("X-Service", "chat")]),
            headers(&[("a", "1"), ("b", ""), ("c", "three"), ("empty", "")]),
        ] {
            let original = frame(hello(h));
            assert_eq!(decode(&encode(&original)).unwrap(), original);
        }
    }

    #[test]
    fn duplicate_header_keys_keep_last_value() {
        let env = Envelope {
            version: PROTOCOL_VERSION,
            r#type: MsgType::Hello as i32,
            sequence: 1,
            sender: "peer".into(),
            body: Some(Body::Hello(mesh::Hello {
                endpoint: "10.0.0.2:5000".into(),
                name: "bob".into(),
                headers: vec![
                    KeyValue {
                        key: "role".into(),
                        value: "first".into(),
                    },
                    KeyValue {
                        key: "zone".into(),
                        value: "eu".into(),
                    },
                    KeyValue {
                        key: "role".into(),
                        value: "last".into(),
                    },
                ],
                ..Default::default()
            })),
        };

        let decoded = decode(&env.encode_to_vec()).unwrap();
        match decoded.message {
            Message::Hello { headers, .. } => {
                assert_eq!(headers.len(), 2);
                assert_eq!(headers["role"], "last");
                assert_eq!(headers["zone"], "eu");
            }
            other => panic!("expected Hello, got {other:?}"),
        }
    }

    #[test]
    fn truncated_frame_is_an_error() {
        let bytes = encode(&frame(Message::Whisper {
            payload: b"a longer payload".to_vec(),
        }));
        let err = decode(&bytes[..bytes.len() - 1]).unwrap_err();
        assert!(matches!(err, DecodeError::Decode(_)));
    }

    #[test]
    fn garbage_is_an_error() {
        assert!(decode(&[0x0a, 0x05, 0x01]).is_err());
        assert!(decode(&[0xff, 0xff, 0xff, 0xff]).is_err());
    }

    #[test]
    fn unknown_kind_is_preserved() {
        let env = Envelope {
            version: PROTOCOL_VERSION,
            r#type: 42,
            sequence: 3,
            sender: "future-peer".into(),
            body: None,
        };
        let bytes = env.encode_to_vec();

        let decoded = decode(&bytes).unwrap();
        assert_eq!(decoded.sender, "future-peer");
        assert_eq!(
            decoded.message,
            Message::Unknown {
                kind: 42,
                raw: bytes.clone()
            }
        );
        assert_eq!(encode(&decoded), bytes);
    }

    #[test]
    fn rejects_wrong_version_and_missing_sender() {
        let mut env = Envelope {
            version: PROTOCOL_VERSION + 1,
            r#type: MsgType::Ping as i32,
            sequence: 1,
            sender: "peer".into(),
            body: None,
        };
        assert!(matches!(
            decode(&env.encode_to_vec()),
            Err(DecodeError::Version(3))
        ));

        env.version = PROTOCOL_VERSION;
        env.sender.clear();
        assert!(matches!(
            decode(&env.encode_to_vec()),
            Err(DecodeError::MissingSender)
        ));
    }

    #[test]
    fn body_must_match_kind() {
        let missing = Envelope {
            version: PROTOCOL_VERSION,
            r#type: MsgType::Shout as i32,
            sequence: 1,
            sender: "peer".into(),
            body: None,
        };
        assert!(matches!(
            decode(&missing.encode_to_vec()),
            Err(DecodeError::MissingBody(_))
        ));

        let mismatched = Envelope {
            body: Some(Body::Ping(mesh::Ping {})),
            ..missing
        };
        assert!(matches!(
            decode(&mismatched.encode_to_vec()),
            Err(DecodeError::KindMismatch(_))
        ));
    }

    #[test]
    fn sequence_out_of_range() {
        let env = Envelope {
            version: PROTOCOL_VERSION,
            r#type: MsgType::Ping as i32,
            sequence: 70_000,
            sender: "peer".into(),
            body: None,
        };
        assert!(matches!(
            decode(&env.encode_to_vec()),
            Err(DecodeError::OutOfRange("sequence"))
        ));
    }

    #[test]
    fn beacon_roundtrip_and_signature_check() {
        let info = BeaconInfo {
            node_id: "C0FFEE".into(),
            name: "bob".into(),
            port: 40123,
        };
        assert_eq!(decode_beacon(&encode_beacon(&info)).unwrap(), info);

        let forged = mesh::Beacon {
            signature: "XYZ".into(),
            version: BEACON_VERSION,
            node_id: "C0FFEE".into(),
            name: String::new(),
            port: 1,
        };
        assert!(matches!(
            decode_beacon(&forged.encode_to_vec()),
            Err(DecodeError::Signature(_))
        ));
    }
}
