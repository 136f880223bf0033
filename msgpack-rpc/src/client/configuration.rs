use std::time::Duration;

use super::{Session, StreamConnector, TcpStreamConnector};

/// Configuration for a msgpack-rpc session.
#[derive(Debug, Clone)]
pub struct Configuration {
    max_buffer_length: usize,
    max_queued_outbound_messages: usize,
    call_timeout: Option<Duration>,
}

impl Default for Configuration {
    fn default() -> Self {
        Self {
            max_buffer_length: 4 << 20,
            max_queued_outbound_messages: 256,
            call_timeout: None,
        }
    }
}

impl Configuration {
    /// Max buffer length limits the max inbound message size. A partial message
    /// that grows past this is treated as a broken stream.
    ///
    /// Default: 4MiB
    pub fn max_buffer_length(&mut self, max_buffer_length: usize) {
        self.max_buffer_length = max_buffer_length;
    }

    /// Max messages that will be queued up waiting for the writer.
    ///
    /// Default: 256
    pub fn max_queued_outbound_messages(&mut self, max_queued_outbound_messages: usize) {
        self.max_queued_outbound_messages = max_queued_outbound_messages.max(1);
    }

    /// How long `call` waits for a response before giving up with `TimedOut`.
    ///
    /// A timed out call still counts toward `Session::in_flight` until its response
    /// arrives or the session closes. A server that never answers will grow that
    /// set with every timeout.
    ///
    /// Default: no timeout
    pub fn call_timeout(&mut self, call_timeout: Option<Duration>) {
        self.call_timeout = call_timeout;
    }

    pub(crate) fn buffer_length(&self) -> usize {
        self.max_buffer_length
    }

    pub(crate) fn queued_outbound_messages(&self) -> usize {
        self.max_queued_outbound_messages
    }

    pub(crate) fn timeout(&self) -> Option<Duration> {
        self.call_timeout
    }
}

/// Connect a new session to a msgpack-rpc server over tcp
pub async fn connect(address: &str, configuration: &Configuration) -> crate::Result<Session> {
    connect_with(&TcpStreamConnector, address, configuration).await
}

/// Connect a new session to a msgpack-rpc server with your own connector
pub async fn connect_with<Connector: StreamConnector>(
    connector: &Connector,
    address: &str,
    configuration: &Configuration,
) -> crate::Result<Session> {
    log::trace!("new session {address}, {configuration:?}");
    let session = Session::new(configuration.clone());
    session.connect_with(connector, address).await?;
    Ok(session)
}
