//! Serialization and deserialization for the `ClassChat` wire protocol.
//!
//! Every frame on the wire (a [`HubMessage`](crate::hub::HubMessage)) and
//! every broadcast payload (e.g. a [`TypingSignal`](crate::typing::TypingSignal))
//! is encoded with postcard.

use serde::Serialize;
use serde::de::DeserializeOwned;

/// Error type for codec encode/decode operations.
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    /// Serialization or deserialization failed.
    #[error("serialization error: {0}")]
    Serialization(String),
}

/// Encodes a wire value into a byte vector using postcard.
///
/// # Errors
///
/// Returns `CodecError::Serialization` if the value cannot be serialized.
pub fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>, CodecError> {
    postcard::to_allocvec(value).map_err(|e| CodecError::Serialization(e.to_string()))
}

/// Decodes a wire value from a byte slice using postcard.
///
/// # Errors
///
/// Returns `CodecError::Serialization` if the bytes cannot be deserialized.
pub fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, CodecError> {
    postcard::from_bytes(bytes).map_err(|e| CodecError::Serialization(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hub::{HubMessage, Topic};
    use crate::message::UserId;

    fn make_broadcast(event: &str) -> HubMessage {
        HubMessage::Broadcast {
            topic: Topic::new("typing:demo"),
            from: UserId::new("alice"),
            event: event.to_string(),
            payload: vec![1, 2, 3],
        }
    }

    #[test]
    fn encode_decode_round_trip_broadcast() {
        let original = make_broadcast("typing");
        let bytes = encode(&original).unwrap();
        let decoded: HubMessage = decode(&bytes).unwrap();
        assert_eq!(original, decoded);
    }

    #[test]
    fn decode_corrupted_bytes_returns_error() {
        let garbage = vec![0xff, 0xfe, 0xfd, 0xfc, 0xfb];
        let result = decode::<HubMessage>(&garbage);
        assert!(result.is_err());
    }

    #[test]
    fn decode_truncated_bytes_returns_error() {
        let original = make_broadcast("truncation test");
        let bytes = encode(&original).unwrap();
        let truncated = &bytes[..bytes.len() / 2];
        assert!(decode::<HubMessage>(truncated).is_err());
    }

    #[test]
    fn decode_empty_bytes_returns_error() {
        assert!(decode::<HubMessage>(&[]).is_err());
    }
}
