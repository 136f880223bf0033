/// Why a frame cannot be a msgpack-rpc message.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum MalformedMessage {
    /// The frame decoded, but not to an array.
    #[error("message must be an array, got {0}")]
    NotAnArray(&'static str),
    /// The frame is an empty array.
    #[error("message array is empty")]
    Empty,
    /// The first element is not an unsigned integer.
    #[error("message type must be an unsigned integer, got {0}")]
    InvalidType(&'static str),
    /// The first element is not 0, 1 or 2.
    #[error("unknown message type {0}")]
    UnknownType(u64),
    /// Known message type with the wrong number of fields.
    #[error("message type {message_type} cannot have {length} fields")]
    WrongArity {
        /// The type tag that was read.
        message_type: u64,
        /// The array length that was read.
        length: usize,
    },
    /// The message id is not an unsigned 32 bit integer.
    #[error("message id must be a 32 bit unsigned integer, got {0}")]
    InvalidId(String),
    /// The method name is not a utf-8 string.
    #[error("method name must be a utf-8 string, got {0}")]
    InvalidMethod(&'static str),
    /// The params are not an array.
    #[error("params must be an array, got {0}")]
    InvalidParams(&'static str),
    /// A response carried both a non-nil error and a non-nil result.
    #[error("response {id} carries both an error and a result")]
    AmbiguousResponse {
        /// Id of the offending response.
        id: u32,
    },
    /// The leading bytes are not valid msgpack.
    #[error("invalid msgpack: {0}")]
    InvalidValue(String),
    /// A partial frame outgrew the receive buffer limit.
    #[error("frame exceeds the {limit}b receive buffer limit")]
    FrameTooLarge {
        /// The configured limit.
        limit: usize,
    },
}

/// Errors that can occur when decoding a message from a buffer.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DecodeError {
    /// Buffer is a valid prefix. Retain it and try again with more bytes.
    #[error("Need more bytes to decode the next message")]
    Incomplete,
    /// Buffer cannot hold a message. The stream is broken.
    #[error("Malformed message: {0}")]
    Malformed(#[from] MalformedMessage),
}
