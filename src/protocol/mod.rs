//! Wire protocol shared by every engine and the client.
//!
//! - `frame`: 4-byte big-endian length prefix around each payload
//! - `message`: protobuf array message carried inside the frame

pub mod frame;
pub mod message;

pub use frame::{DEFAULT_MAX_FRAME_LEN, HEADER_LEN};
pub use message::ArrayMessage;
