use std::sync::Arc;

use k_lock::Mutex;
use msgpack_rpc_codec::{Message, Value};

use super::completion_registry::Correlator;
use crate::Error;

/// Receives the server's notifications, in the order they arrive.
///
/// Closures taking `(method, params)` are handlers.
pub trait NotificationHandler: Send + 'static {
    /// Called from the session's read task for each notification.
    fn on_notification(&mut self, method: String, params: Vec<Value>);
}

impl<F> NotificationHandler for F
where
    F: FnMut(String, Vec<Value>) + Send + 'static,
{
    fn on_notification(&mut self, method: String, params: Vec<Value>) {
        self(method, params)
    }
}

/// The slot a session's notification handler lives in.
#[derive(Clone, Default)]
pub(crate) struct Subscriber {
    handler: Arc<Mutex<Option<Box<dyn NotificationHandler>>>>,
}

impl Subscriber {
    #[allow(clippy::expect_used)]
    fn with_handler<T>(&self, f: impl FnOnce(&mut Option<Box<dyn NotificationHandler>>) -> T) -> T {
        let mut handler = self.handler.lock().expect("brief internal mutex must work");
        f(&mut handler)
    }

    pub fn set(&self, handler: Box<dyn NotificationHandler>) {
        self.with_handler(|slot| *slot = Some(handler));
    }

    fn deliver(&self, method: String, params: Vec<Value>) {
        // The handler runs outside the lock so it is free to replace itself.
        match self.with_handler(Option::take) {
            Some(mut handler) => {
                handler.on_notification(method, params);
                self.with_handler(|slot| {
                    if slot.is_none() {
                        *slot = Some(handler);
                    }
                });
            }
            None => {
                log::debug!("no notification handler - dropping {method} notification");
            }
        }
    }
}

/// Routes each inbound message to whoever is waiting for it.
pub(crate) struct RpcCompletionReactor {
    correlator: Correlator,
    subscriber: Subscriber,
}

impl RpcCompletionReactor {
    pub fn new(correlator: Correlator, subscriber: Subscriber) -> Self {
        Self {
            correlator,
            subscriber,
        }
    }

    /// Err means the server broke the protocol and the connection must end.
    pub fn on_inbound_message(&mut self, message: Message) -> crate::Result<()> {
        match message {
            Message::Response { id, outcome } => {
                log::trace!("{id} response");
                self.correlator.resolve(id, outcome)
            }
            Message::Notification { method, params } => {
                log::trace!("{method} notification");
                self.subscriber.deliver(method, params);
                Ok(())
            }
            Message::Request { id, method, .. } => {
                log::error!("{id} server sent a request for {method} - this client does not serve methods");
                Err(Error::UnexpectedRequest { id, method })
            }
        }
    }
}
