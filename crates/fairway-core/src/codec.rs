use std::marker::PhantomData;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::error::CodecError;
use crate::message::Message;

pub const JSON_CONTENT_TYPE: &str = "application/json";

/// Turns typed payloads into message bodies and back. The dispatch core never
/// calls a codec; handlers do.
pub trait Codec: Send + Sync {
    type Item;

    fn content_type(&self) -> &str;

    fn encode(&self, item: &Self::Item) -> Result<Vec<u8>, CodecError>;

    fn decode(&self, content_type: &str, body: &[u8]) -> Result<Self::Item, CodecError>;

    fn decode_message(&self, message: &Message) -> Result<Self::Item, CodecError> {
        self.decode(&message.content_type, &message.payload)
    }
}

/// JSON codec for any serde type. Content type matching is case-insensitive.
pub struct JsonCodec<T> {
    _marker: PhantomData<fn() -> T>,
}

impl<T> JsonCodec<T> {
    pub fn new() -> Self {
        Self {
            _marker: PhantomData,
        }
    }
}

impl<T> Default for JsonCodec<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Codec for JsonCodec<T>
where
    T: Serialize + DeserializeOwned,
{
    type Item = T;

    fn content_type(&self) -> &str {
        JSON_CONTENT_TYPE
    }

    fn encode(&self, item: &T) -> Result<Vec<u8>, CodecError> {
        Ok(serde_json::to_vec(item)?)
    }

    fn decode(&self, content_type: &str, body: &[u8]) -> Result<T, CodecError> {
        if !content_type.eq_ignore_ascii_case(JSON_CONTENT_TYPE) {
            return Err(CodecError::UnsupportedContentType(content_type.to_string()));
        }
        Ok(serde_json::from_slice(body)?)
    }
}

/// Entity change event published per tenant. Tagged by `EntityType` on the wire:
/// `{"EntityType":"Product","Id":7}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "EntityType")]
pub enum EntityChange {
    Product {
        #[serde(rename = "Id")]
        id: u64,
    },
    Category {
        #[serde(rename = "Id")]
        id: u64,
    },
}

impl EntityChange {
    pub fn id(&self) -> u64 {
        match self {
            EntityChange::Product { id } | EntityChange::Category { id } => *id,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn entity_change_uses_tagged_wire_shape() {
        let codec = JsonCodec::<EntityChange>::new();
        let body = codec.encode(&EntityChange::Product { id: 7 }).unwrap();
        assert_eq!(
            String::from_utf8(body).unwrap(),
            r#"{"EntityType":"Product","Id":7}"#
        );
    }

    #[test]
    fn decode_accepts_content_type_in_any_case() {
        let codec = JsonCodec::<EntityChange>::new();
        let change = codec
            .decode("Application/JSON", br#"{"EntityType":"Category","Id":3}"#)
            .unwrap();
        assert_eq!(change, EntityChange::Category { id: 3 });
        assert_eq!(change.id(), 3);
    }

    #[test]
    fn decode_rejects_other_content_types() {
        let codec = JsonCodec::<EntityChange>::new();
        let err = codec.decode("text/plain", b"{}").unwrap_err();
        assert!(matches!(err, CodecError::UnsupportedContentType(ct) if ct == "text/plain"));
    }

    #[test]
    fn decode_reports_malformed_json() {
        let codec = JsonCodec::<EntityChange>::new();
        assert!(matches!(
            codec.decode(JSON_CONTENT_TYPE, b"{not json"),
            Err(CodecError::Json(_))
        ));
        assert!(matches!(
            codec.decode(JSON_CONTENT_TYPE, br#"{"EntityType":"Order","Id":1}"#),
            Err(CodecError::Json(_))
        ));
    }
}
