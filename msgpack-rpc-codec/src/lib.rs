//! msgpack-rpc codec
//!
//! The message model and wire codec for the msgpack-rpc protocol. Every message
//! is a top-level msgpack array tagged with its message type:
//!
//! * Request: `[0, id, method, params]`
//! * Response: `[1, id, error, result]`
//! * Notification: `[2, method, params]`
//!
//! There is no length prefix. A frame ends where its top-level array ends, so
//! decoding is incremental: `decode_one` either produces a message and the number
//! of bytes it consumed, or tells you it needs more bytes. The `FrameReader` wraps
//! that in a receive buffer you can read a byte stream into.

#![deny(missing_docs)]

mod codec;
mod error;
mod frame_reader;
mod message;
mod value;

pub use codec::{decode_one, encode, encode_into};
pub use error::{DecodeError, MalformedMessage};
pub use frame_reader::{DrainMessages, FrameReader};
pub use message::{Message, MessageType};
pub use value::{Integer, Utf8String, Value};
