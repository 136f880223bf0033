use msgpack_rpc_codec::{MalformedMessage, Value};

/// Result type for msgpack-rpc.
pub type Result<T> = std::result::Result<T, Error>;

/// Error type for msgpack-rpc.
///
/// `Remote` is an ordinary rpc outcome: the server ran the method and it failed.
/// `ConnectionClosed` and `TransportFailure` mean the connection went away, while
/// `MalformedMessage`, `UnknownCorrelationId` and `UnexpectedRequest` mean the
/// server broke the protocol.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The transport could not connect.
    #[error("Connect failed: {0}")]
    ConnectFailed(#[source] std::io::Error),
    /// Reading or writing the stream failed.
    #[error("IO failure: {0}")]
    TransportFailure(#[from] std::io::Error),
    /// The server sent bytes that are not a msgpack-rpc message.
    #[error("Malformed message: {0}")]
    MalformedMessage(#[from] MalformedMessage),
    /// The server answered a request that is not in flight.
    #[error("Response for unknown request id {0}")]
    UnknownCorrelationId(u32),
    /// The server sent a request. This client does not serve methods.
    #[error("Unexpected request {id} for {method}")]
    UnexpectedRequest {
        /// Id the server assigned.
        id: u32,
        /// Method the server tried to call.
        method: String,
    },
    /// The remote procedure returned an error.
    #[error("Remote error: {0}")]
    Remote(Value),
    /// The session is closed, or closed before the rpc completed.
    #[error("Connection is closed")]
    ConnectionClosed,
    /// The session has not connected yet.
    #[error("Session is not connected")]
    NotConnected,
    /// `connect` was called on a session that is already connected.
    #[error("Session is already connected")]
    AlreadyConnected,
    /// The configured call timeout elapsed before the response arrived.
    #[error("Rpc timed out")]
    TimedOut,
    /// The result did not deserialize to the requested type.
    #[error("Invalid result: {0}")]
    InvalidResult(String),
}

impl Error {
    /// The error handed to every pending rpc when this error ends the session.
    pub(crate) fn teardown_error(&self) -> Self {
        match self {
            Self::TransportFailure(e) => {
                Self::TransportFailure(std::io::Error::new(e.kind(), e.to_string()))
            }
            Self::MalformedMessage(e) => Self::MalformedMessage(e.clone()),
            Self::UnknownCorrelationId(id) => Self::UnknownCorrelationId(*id),
            Self::UnexpectedRequest { id, method } => Self::UnexpectedRequest {
                id: *id,
                method: method.clone(),
            },
            _ => Self::ConnectionClosed,
        }
    }
}
