// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Payload Codecs
//!
//! The context moves byte payloads; these codecs decide how calling code's
//! messages become bytes and which content type is announced with them.
//!
//! Protocol buffer messages travel in their canonical proto3 JSON mapping
//! (camelCase field names, 64-bit integers as strings), so they interoperate
//! with any producer that publishes protobuf-as-JSON. Message types are
//! expected to carry serde impls following that mapping, as `pbjson`
//! generated types do.

use crate::errors::CodecError;
use serde::{de::DeserializeOwned, Serialize};

/// Content type for JSON payloads, including proto3 JSON
pub const JSON_CONTENT_TYPE: &str = "application/json";

/// Structured text encoding for any serde type.
pub struct Json;

impl Json {
    pub const CONTENT_TYPE: &'static str = JSON_CONTENT_TYPE;

    /// Serializes `message` to JSON bytes.
    ///
    /// # Parameters
    /// * `message` - Any serde-serializable value
    ///
    /// # Returns
    /// The encoded body, or [`CodecError::Encode`]
    pub fn encode<T: Serialize + ?Sized>(message: &T) -> Result<Vec<u8>, CodecError> {
        serde_json::to_vec(message).map_err(|err| CodecError::Encode(err.to_string()))
    }

    /// Deserializes a JSON body into `T`.
    pub fn decode<T: DeserializeOwned>(data: &[u8]) -> Result<T, CodecError> {
        serde_json::from_slice(data).map_err(|err| CodecError::Decode(err.to_string()))
    }
}

/// Proto3 JSON encoding for `prost` messages.
pub struct ProtoJson;

impl ProtoJson {
    pub const CONTENT_TYPE: &'static str = JSON_CONTENT_TYPE;

    /// Serializes a protobuf message in its JSON mapping.
    ///
    /// # Parameters
    /// * `message` - A `prost` message whose serde impl follows the proto3 JSON mapping
    ///
    /// # Returns
    /// The encoded body, or [`CodecError::Encode`]
    pub fn encode<M>(message: &M) -> Result<Vec<u8>, CodecError>
    where
        M: prost::Message + Serialize,
    {
        Json::encode(message)
    }

    /// Deserializes a proto3 JSON body into a protobuf message.
    pub fn decode<M>(data: &[u8]) -> Result<M, CodecError>
    where
        M: prost::Message + DeserializeOwned,
    {
        Json::decode(data)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Greeting {
        text: String,
    }

    /// A hand-written stand-in for a `pbjson` generated message.
    #[derive(Clone, PartialEq, prost::Message, Serialize, Deserialize)]
    #[serde(rename_all = "camelCase")]
    pub(crate) struct Ping {
        #[prost(uint64, tag = "1")]
        #[serde(default, with = "string_u64")]
        pub(crate) from_node_id: u64,
    }

    /// Proto3 JSON writes 64-bit integers as strings and accepts both forms.
    mod string_u64 {
        use serde::{de::Error, Deserialize, Deserializer, Serializer};

        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Repr {
            Text(String),
            Number(u64),
        }

        pub fn serialize<S: Serializer>(value: &u64, serializer: S) -> Result<S::Ok, S::Error> {
            serializer.serialize_str(&value.to_string())
        }

        pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<u64, D::Error> {
            match Repr::deserialize(deserializer)? {
                Repr::Text(text) => text.parse().map_err(D::Error::custom),
                Repr::Number(number) => Ok(number),
            }
        }
    }

    #[test]
    fn json_uses_compact_field_encoding() {
        let body = Json::encode(&Greeting {
            text: "hello".to_owned(),
        })
        .unwrap();

        assert_eq!(body, br#"{"text":"hello"}"#);
    }

    #[test]
    fn json_decode_reports_mismatched_shapes() {
        let err = Json::decode::<Greeting>(br#"{"txt":1}"#).unwrap_err();

        assert!(matches!(err, CodecError::Decode(ref reason) if reason.contains("text")));
    }

    #[test]
    fn proto_messages_use_the_json_mapping() {
        let body = ProtoJson::encode(&Ping { from_node_id: 7 }).unwrap();

        assert_eq!(body, br#"{"fromNodeId":"7"}"#);
    }

    #[test]
    fn proto_json_accepts_both_integer_forms() {
        let text: Ping = ProtoJson::decode(br#"{"fromNodeId":"7"}"#).unwrap();
        let number: Ping = ProtoJson::decode(br#"{"fromNodeId":7}"#).unwrap();

        assert_eq!(text.from_node_id, 7);
        assert_eq!(number, text);
        assert!(ProtoJson::decode::<Ping>(&[0x08, 0x07]).is_err());
    }
}
