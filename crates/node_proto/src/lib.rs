//! Wire types for the mesh protocol.
//!
//! The message structs are prost-derived so every frame on the wire is a
//! protobuf `Envelope` (or a `Beacon` on the discovery channel). Application
//! code should go through [`codec`], which turns envelopes into the typed
//! [`Message`] enum and back.

pub mod codec;

pub use codec::{
    decode, decode_beacon, encode, encode_beacon, BeaconInfo, DecodeError, Frame, Headers,
    Message, BEACON_SIGNATURE, BEACON_VERSION, MAX_FRAME_SIZE, PROTOCOL_VERSION,
};

pub mod mesh {
    #[derive(Clone, PartialEq, ::prost::Message)]
    pub struct KeyValue {
        #[prost(string, tag = "1")]
        pub key: ::prost::alloc::string::String,
        #[prost(string, tag = "2")]
        pub value: ::prost::alloc::string::String,
    }

    /// Broadcast on the discovery channel.
    #[derive(Clone, PartialEq, ::prost::Message)]
    pub struct Beacon {
        #[prost(string, tag = "1")]
        pub signature: ::prost::alloc::string::String,
        #[prost(uint32, tag = "2")]
        pub version: u32,
        #[prost(string, tag = "3")]
        pub node_id: ::prost::alloc::string::String,
        #[prost(string, tag = "4")]
        pub name: ::prost::alloc::string::String,
        #[prost(uint32, tag = "5")]
        pub port: u32,
    }

    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, ::prost::Enumeration)]
    #[repr(i32)]
    pub enum MsgType {
        Unspecified = 0,
        Hello = 1,
        Whisper = 2,
        Shout = 3,
        Join = 4,
        Leave = 5,
        Ping = 6,
        PingOk = 7,
        Stop = 8,
    }

    #[derive(Clone, PartialEq, ::prost::Message)]
    pub struct Envelope {
        #[prost(uint32, tag = "1")]
        pub version: u32,
        #[prost(enumeration = "MsgType", tag = "2")]
        pub r#type: i32,
        #[prost(uint32, tag = "3")]
        pub sequence: u32,
        #[prost(string, tag = "4")]
        pub sender: ::prost::alloc::string::String,
        #[prost(oneof = "envelope::Body", tags = "10, 11, 12, 13, 14, 15, 16, 17")]
        pub body: ::core::option::Option<envelope::Body>,
    }

    pub mod envelope {
        #[derive(Clone, PartialEq, ::prost::Oneof)]
        pub enum Body {
            #[prost(message, tag = "10")]
            Hello(super::Hello),
            #[prost(message, tag = "11")]
            Whisper(super::Whisper),
            #[prost(message, tag = "12")]
            Shout(super::Shout),
            #[prost(message, tag = "13")]
            Join(super::Join),
            #[prost(message, tag = "14")]
            Leave(super::Leave),
            #[prost(message, tag = "15")]
            Ping(super::Ping),
            #[prost(message, tag = "16")]
            PingOk(super::PingOk),
            #[prost(message, tag = "17")]
            Stop(super::Stop),
        }
    }

    #[derive(Clone, PartialEq, ::prost::Message)]
    pub struct Hello {
        #[prost(string, tag = "1")]
        pub endpoint: ::prost::alloc::string::String,
        #[prost(string, repeated, tag = "2")]
        pub groups: ::prost::alloc::vec::Vec<::prost::alloc::string::String>,
        #[prost(uint32, tag = "3")]
        pub status: u32,
        #[prost(string, tag = "4")]
        pub name: ::prost::alloc::string::String,
        /// Ordered pairs; duplicate keys are allowed on the wire.
        #[prost(message, repeated, tag = "5")]
        pub headers: ::prost::alloc::vec::Vec<KeyValue>,
    }

    #[derive(Clone, PartialEq, ::prost::Message)]
    pub struct Whisper {
        #[prost(bytes = "vec", tag = "1")]
        pub payload: ::prost::alloc::vec::Vec<u8>,
    }

    #[derive(Clone, PartialEq, ::prost::Message)]
    pub struct Shout {
        #[prost(string, tag = "1")]
        pub group: ::prost::alloc::string::String,
        #[prost(bytes = "vec", tag = "2")]
        pub payload: ::prost::alloc::vec::Vec<u8>,
    }

    #[derive(Clone, PartialEq, ::prost::Message)]
    pub struct Join {
        #[prost(string, tag = "1")]
        pub group: ::prost::alloc::string::String,
        #[prost(uint32, tag = "2")]
        pub status: u32,
    }

    #[derive(Clone, PartialEq, ::prost::Message)]
    pub struct Leave {
        #[prost(string, tag = "1")]
        pub group: ::prost::alloc::string::String,
        #[prost(uint32, tag = "2")]
        pub status: u32,
    }

    #[derive(Clone, PartialEq, ::prost::Message)]
    pub struct Ping {}

    #[derive(Clone, PartialEq, ::prost::Message)]
    pub struct PingOk {}

    #[derive(Clone, PartialEq, ::prost::Message)]
    pub struct Stop {}
}

#[cfg(test)]
mod tests {
    use prost::Message;

    fn roundtrip<M: Message + Default + PartialEq + std::fmt::Debug>(msg: &M) -> M {
        let encoded = msg.encode_to_vec();
        M::decode(encoded.as_slice()).expect("decode should succeed")
    }

    #[test]
    fn beacon_roundtrip() {
        use super::mesh::Beacon;

        let beacon = Beacon {
            signature: "ZRE".into(),
            version: 1,
            node_id: "A1B2C3".into(),
            name: "alice".into(),
            port: 49152,
        };
        assert_eq!(roundtrip(&beacon), beacon);
    }

    #[test]
    fn msg_type_values() {
        use super::mesh::MsgType;
        assert_eq!(MsgType::Unspecified as i32, 0);
        assert_eq!(MsgType::Hello as i32, 1);
        assert_eq!(MsgType::PingOk as i32, 7);
        assert_eq!(MsgType::Stop as i32, 8);
    }

    #[test]
    fn envelope_with_hello_body() {
        use super::mesh::*;

        let env = Envelope {
            version: 2,
            r#type: MsgType::Hello as i32,
            sequence: 1,
            sender: "node-1".into(),
            body: Some(envelope::Body::Hello(Hello {
                endpoint: "10.0.0.1:4000".into(),
                groups: vec!["ROOM".into()],
                status: 3,
                name: "alice".into(),
                headers: vec![KeyValue {
                    key: "X-Role".into(),
                    value: "chat".into(),
                }],
            })),
        };
        let decoded = roundtrip(&env);
        match decoded.body {
            Some(envelope::Body::Hello(hello)) => {
                assert_eq!(hello.groups, vec!["ROOM".to_string()]);
                assert_eq!(hello.headers.len(), 1);
            }
            other => panic!("expected Hello, got {other:?}"),
        }
    }
}
