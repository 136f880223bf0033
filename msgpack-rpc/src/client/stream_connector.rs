use std::future::Future;

use tokio::net::TcpStream;

/// An async handshake that provides an `AsyncRead`/`AsyncWrite` stream.
///
/// A session only needs a duplex byte stream. Implement this for whatever
/// stream type you have: unix sockets, child process pipes, in-memory streams.
pub trait StreamConnector: std::fmt::Debug {
    /// The type of stream this connector will produce
    type Stream: tokio::io::AsyncRead + tokio::io::AsyncWrite + Send + Unpin + 'static;

    /// Establish a stream to `address`.
    fn connect_stream(
        &self,
        address: &str,
    ) -> impl Future<Output = std::io::Result<Self::Stream>> + Send;
}

/// A `StreamConnector` for bare TCP streams. `address` is `host:port`.
#[derive(Debug, Default, Clone, Copy)]
pub struct TcpStreamConnector;
impl StreamConnector for TcpStreamConnector {
    type Stream = TcpStream;

    fn connect_stream(
        &self,
        address: &str,
    ) -> impl Future<Output = std::io::Result<Self::Stream>> + Send {
        let address = address.to_string();
        async move {
            let stream = TcpStream::connect(address).await?;
            stream.set_nodelay(true)?;
            Ok(stream)
        }
    }
}
