use std::sync::Arc;

use k_lock::Mutex;
use msgpack_rpc_codec::{encode, FrameReader, Message, Value};
use tokio::{
    io::{AsyncRead, AsyncWrite},
    sync::{mpsc, oneshot},
    task::JoinHandle,
};
use tokio_util::sync::{CancellationToken, DropGuard};

use super::connection_driver::{read_inbound, write_outbound, OutboundFrame};
use super::reactor::completion_reactor::{NotificationHandler, RpcCompletionReactor, Subscriber};
use super::reactor::completion_registry::Correlator;
use super::reactor::completion_unary::CallCompletion;
use super::{Configuration, StreamConnector, TcpStreamConnector};
use crate::Error;

/// Where a session is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Not connected yet. `connect` may be called.
    Disconnected,
    /// `connect` is waiting for the transport.
    Connecting,
    /// Calls and notifications can be sent.
    Connected,
    /// The connection is being torn down.
    Closing,
    /// The connection is gone. A closed session stays closed.
    Closed,
}

enum Lifecycle {
    Disconnected,
    Connecting,
    Connected {
        outbound: mpsc::Sender<OutboundFrame>,
        reader: JoinHandle<()>,
    },
    Closing,
    Closed {
        reason: Option<Error>,
    },
}

impl Lifecycle {
    fn state(&self) -> ConnectionState {
        match self {
            Self::Disconnected => ConnectionState::Disconnected,
            Self::Connecting => ConnectionState::Connecting,
            Self::Connected { .. } => ConnectionState::Connected,
            Self::Closing => ConnectionState::Closing,
            Self::Closed { .. } => ConnectionState::Closed,
        }
    }
}

struct Shared {
    lifecycle: Mutex<Lifecycle>,
    correlator: Correlator,
    subscriber: Subscriber,
    shutdown: CancellationToken,
}

impl Shared {
    #[allow(clippy::expect_used)]
    fn with_lifecycle<T>(&self, f: impl FnOnce(&mut Lifecycle) -> T) -> T {
        let mut lifecycle = self
            .lifecycle
            .lock()
            .expect("brief internal mutex must work");
        f(&mut lifecycle)
    }

    /// The connection ended on its own. Tear it down unless `close` already is.
    fn fail(&self, reason: Error) {
        let previous = self.with_lifecycle(|lifecycle| match lifecycle {
            Lifecycle::Closing | Lifecycle::Closed { .. } => None,
            _ => Some(std::mem::replace(lifecycle, Lifecycle::Closing)),
        });
        let Some(previous) = previous else {
            log::debug!("connection ended while closing: {reason}");
            return;
        };
        match reason {
            Error::ConnectionClosed => log::info!("connection closed"),
            ref reason => log::warn!("closing connection: {reason}"),
        }
        drop(previous);
        self.shutdown.cancel();
        self.correlator.cancel_all(&reason);
        self.with_lifecycle(|lifecycle| {
            *lifecycle = Lifecycle::Closed {
                reason: Some(reason),
            }
        });
    }
}

/// A client session with a msgpack-rpc server.
///
/// It handles sending messages to the server and associating the responses.
/// Calls may be issued concurrently from clones of the session; responses are
/// matched to calls by id, in whatever order the server sends them.
/// Notifications from the server go to the handler set with `on_notification`.
///
/// Dropping every clone of a session closes its connection.
#[derive(Clone)]
pub struct Session {
    shared: Arc<Shared>,
    configuration: Configuration,
    _shutdown_on_drop: Arc<DropGuard>,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("state", &self.state())
            .field("in_flight", &self.in_flight())
            .field("configuration", &self.configuration)
            .finish_non_exhaustive()
    }
}

impl Session {
    /// A disconnected session.
    pub fn new(configuration: Configuration) -> Self {
        let shutdown = CancellationToken::new();
        Self {
            _shutdown_on_drop: Arc::new(shutdown.clone().drop_guard()),
            shared: Arc::new(Shared {
                lifecycle: Mutex::new(Lifecycle::Disconnected),
                correlator: Correlator::new(),
                subscriber: Subscriber::default(),
                shutdown,
            }),
            configuration,
        }
    }

    /// Connect to `host:port` over tcp.
    pub async fn connect(&self, host: &str, port: u16) -> crate::Result<()> {
        self.connect_with(&TcpStreamConnector, &format!("{host}:{port}"))
            .await
    }

    /// Connect through your own connector.
    ///
    /// If the connector fails the session stays disconnected and you may try again.
    pub async fn connect_with<Connector: StreamConnector>(
        &self,
        connector: &Connector,
        address: &str,
    ) -> crate::Result<()> {
        self.shared.with_lifecycle(|lifecycle| match lifecycle {
            Lifecycle::Disconnected => {
                *lifecycle = Lifecycle::Connecting;
                Ok(())
            }
            Lifecycle::Connecting | Lifecycle::Connected { .. } => Err(Error::AlreadyConnected),
            Lifecycle::Closing | Lifecycle::Closed { .. } => Err(Error::ConnectionClosed),
        })?;
        log::debug!("connecting to {address}");

        match connector.connect_stream(address).await {
            Ok(stream) => self.start(stream),
            Err(e) => {
                log::warn!("failed to connect to {address}: {e:?}");
                self.shared.with_lifecycle(|lifecycle| {
                    if let Lifecycle::Connecting = lifecycle {
                        *lifecycle = Lifecycle::Disconnected;
                    }
                });
                Err(Error::ConnectFailed(e))
            }
        }
    }

    fn start<Stream>(&self, stream: Stream) -> crate::Result<()>
    where
        Stream: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (reader, writer) = tokio::io::split(stream);
        let (outbound, outbound_messages) =
            mpsc::channel(self.configuration.queued_outbound_messages());
        let reactor = RpcCompletionReactor::new(
            self.shared.correlator.clone(),
            self.shared.subscriber.clone(),
        );
        let frames = FrameReader::new(self.configuration.buffer_length());

        self.shared.with_lifecycle(|lifecycle| {
            if !matches!(lifecycle, Lifecycle::Connecting) {
                log::debug!("session closed while connecting - dropping the stream");
                return Err(Error::ConnectionClosed);
            }
            let shared = self.shared.clone();
            let shutdown = self.shared.shutdown.clone();
            let reader_task = tokio::spawn(async move {
                let reason = read_inbound(reader, frames, reactor, shutdown).await;
                shared.fail(reason);
            });
            // The writer finishes shutting the stream down on its own.
            tokio::spawn(write_outbound(
                writer,
                outbound_messages,
                self.shared.shutdown.clone(),
            ));
            *lifecycle = Lifecycle::Connected {
                outbound,
                reader: reader_task,
            };
            log::info!("connected");
            Ok(())
        })
    }

    /// Where the session is in its lifecycle.
    pub fn state(&self) -> ConnectionState {
        self.shared.with_lifecycle(|lifecycle| lifecycle.state())
    }

    /// Why the connection ended, if it ended on its own.
    ///
    /// `None` while connected and after an explicit `close`.
    pub fn close_reason(&self) -> Option<Error> {
        self.shared.with_lifecycle(|lifecycle| match lifecycle {
            Lifecycle::Closed {
                reason: Some(reason),
            } => Some(reason.teardown_error()),
            _ => None,
        })
    }

    /// How many calls are waiting for responses, including abandoned ones.
    pub fn in_flight(&self) -> usize {
        self.shared.correlator.in_flight()
    }

    /// Set the handler for the server's notifications, replacing any previous one.
    ///
    /// Set it before connecting to be sure you see every notification.
    pub fn on_notification(&self, handler: impl NotificationHandler) {
        self.shared.subscriber.set(Box::new(handler));
    }

    /// Call a remote procedure and wait for its result.
    ///
    /// `Err(Error::Remote)` carries the error the procedure returned. On `TimedOut`
    /// the call is abandoned, not forgotten: it stays in flight until the server
    /// answers it or the session closes.
    pub async fn call(&self, method: impl Into<String>, params: Vec<Value>) -> crate::Result<Value> {
        let completion = self.send_call(method, params).await?;
        match self.configuration.timeout() {
            Some(timeout) => tokio::time::timeout(timeout, completion)
                .await
                .map_err(|_elapsed| Error::TimedOut)?,
            None => completion.await,
        }
    }

    /// Call a remote procedure and deserialize its result.
    pub async fn call_typed<T>(
        &self,
        method: impl Into<String>,
        params: Vec<Value>,
    ) -> crate::Result<T>
    where
        T: serde::de::DeserializeOwned,
    {
        let result = self.call(method, params).await?;
        rmpv::ext::from_value(result).map_err(|e| Error::InvalidResult(e.to_string()))
    }

    /// Send a call to the server.
    ///
    /// This function only sends the request. You must await the completion to get the response.
    #[must_use = "You must await the completion to get the response. If you drop the completion, the response will be discarded."]
    pub async fn send_call(
        &self,
        method: impl Into<String>,
        params: Vec<Value>,
    ) -> crate::Result<CallCompletion> {
        let outbound = self.outbound()?;
        let (id, mut completion) = self.shared.correlator.register()?;
        let request = Message::request(id, method, params);
        if let Err(e) = write(&outbound, &request).await {
            log::debug!("{id} request was not sent: {e}");
            completion.set_done();
            self.shared.correlator.remove(id);
            return Err(e);
        }
        Ok(completion)
    }

    /// Send a notification. No response is expected.
    ///
    /// Returns once the notification is written to the stream.
    pub async fn notify(&self, method: impl Into<String>, params: Vec<Value>) -> crate::Result<()> {
        let outbound = self.outbound()?;
        write(&outbound, &Message::notification(method, params)).await
    }

    /// Close the connection. Every pending call completes with `ConnectionClosed`.
    ///
    /// Pending calls are cancelled and the session is `Closed` before the first
    /// await, so dropping this future early still closes the session. It returns
    /// once the read task has stopped. The write side is shut down in the background.
    ///
    /// Closing a closed session does nothing.
    pub async fn close(&self) {
        let previous = self.shared.with_lifecycle(|lifecycle| match lifecycle {
            Lifecycle::Closing | Lifecycle::Closed { .. } => None,
            _ => Some(std::mem::replace(lifecycle, Lifecycle::Closing)),
        });
        let Some(previous) = previous else {
            log::debug!("session is already closed");
            return;
        };
        self.shared.shutdown.cancel();
        self.shared.correlator.cancel_all(&Error::ConnectionClosed);
        self.shared
            .with_lifecycle(|lifecycle| *lifecycle = Lifecycle::Closed { reason: None });
        log::info!("session closed");

        if let Lifecycle::Connected { outbound, reader } = previous {
            drop(outbound);
            if let Err(e) = reader.await {
                log::warn!("read task failed: {e:?}");
            }
        }
    }

    fn outbound(&self) -> crate::Result<mpsc::Sender<OutboundFrame>> {
        self.shared.with_lifecycle(|lifecycle| match lifecycle {
            Lifecycle::Connected { outbound, .. } => Ok(outbound.clone()),
            Lifecycle::Disconnected | Lifecycle::Connecting => Err(Error::NotConnected),
            Lifecycle::Closing | Lifecycle::Closed { .. } => Err(Error::ConnectionClosed),
        })
    }
}

async fn write(outbound: &mpsc::Sender<OutboundFrame>, message: &Message) -> crate::Result<()> {
    let (written, write_outcome) = oneshot::channel();
    outbound
        .send(OutboundFrame {
            frame: encode(message),
            written,
        })
        .await
        .map_err(|_e| Error::ConnectionClosed)?;
    match write_outcome.await {
        Ok(result) => result.map_err(Error::TransportFailure),
        Err(_dropped) => Err(Error::ConnectionClosed),
    }
}
