//! Array message codec.
//!
//! The payload of every frame is a protobuf message holding one packed
//! repeated `int32` field, the same shape on requests and responses.

use crate::error::FrameError;
use prost::Message;

/// An ordered sequence of 32-bit integers.
#[derive(Clone, PartialEq, prost::Message)]
pub struct ArrayMessage {
    #[prost(int32, repeated, tag = "1")]
    pub values: Vec<i32>,
}

impl ArrayMessage {
    pub fn new(values: Vec<i32>) -> Self {
        Self { values }
    }
}

/// Decode a request payload into an array message.
///
/// A payload holding no values is rejected: its response would encode to
/// zero bytes, and a zero-length header ends the session.
pub fn decode(payload: &[u8]) -> Result<ArrayMessage, FrameError> {
    let message = ArrayMessage::decode(payload)?;
    if message.values.is_empty() {
        return Err(FrameError::EmptyArray);
    }
    Ok(message)
}

/// Encode values into a freshly allocated payload.
#[cfg(test)]
pub fn encode(values: &[i32]) -> Vec<u8> {
    ArrayMessage::new(values.to_vec()).encode_to_vec()
}
