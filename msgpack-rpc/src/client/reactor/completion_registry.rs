use std::{collections::HashMap, sync::Arc};

use k_lock::Mutex;
use msgpack_rpc_codec::Value;
use tokio::sync::oneshot;

use super::completion_unary::CallCompletion;
use crate::Error;

/// Matches responses to the requests that are waiting for them.
///
/// Ids count up from 0 and wrap at `u32::MAX`, skipping any id that is still in
/// flight. Each registered call is resolved exactly once: by its response, or by
/// `cancel_all` when the connection goes away.
#[derive(Debug, Clone, Default)]
pub struct Correlator {
    registry: Arc<Mutex<Registry>>,
}

#[derive(Debug, Default)]
struct Registry {
    next_id: u32,
    in_flight: HashMap<u32, PendingCall>,
    closed: bool,
}

#[derive(Debug)]
enum PendingCall {
    Waiting(oneshot::Sender<crate::Result<Value>>),
    // The caller dropped its completion. The response is still owed to us.
    Abandoned,
}

impl Correlator {
    /// A correlator with nothing in flight.
    pub fn new() -> Self {
        Self::default()
    }

    // The registry mutex is only held for map operations - it can't panic unless the memory allocator panics.
    #[allow(clippy::expect_used)]
    fn with_registry<T>(&self, f: impl FnOnce(&mut Registry) -> T) -> T {
        let mut registry = self
            .registry
            .lock()
            .expect("brief internal mutex must work");
        f(&mut registry)
    }

    /// Allocate an id and register a waiter for its response.
    ///
    /// Register before sending the request, or you might miss the response.
    pub fn register(&self) -> crate::Result<(u32, CallCompletion)> {
        let (completor, completion) = oneshot::channel();
        let id = self.with_registry(|registry| {
            if registry.closed {
                return Err(Error::ConnectionClosed);
            }
            let mut id = registry.next_id;
            while registry.in_flight.contains_key(&id) {
                id = id.wrapping_add(1);
            }
            registry.next_id = id.wrapping_add(1);
            registry
                .in_flight
                .insert(id, PendingCall::Waiting(completor));
            Ok(id)
        })?;
        log::trace!("{id} registered new call");
        Ok((id, CallCompletion::new(id, completion, self.clone())))
    }

    /// Deliver a response to the call waiting on `id`.
    ///
    /// `Err` outcomes are remote errors and reach the caller as `Error::Remote`.
    pub fn resolve(&self, id: u32, outcome: Result<Value, Value>) -> crate::Result<()> {
        match self.with_registry(|registry| registry.in_flight.remove(&id)) {
            Some(PendingCall::Waiting(completor)) => {
                if let Err(_e) = completor.send(outcome.map_err(Error::Remote)) {
                    log::debug!("{id} completion channel closed - did the client lose interest in this request?");
                }
                Ok(())
            }
            Some(PendingCall::Abandoned) => {
                log::debug!("{id} response for an abandoned call");
                Ok(())
            }
            None => {
                log::warn!("{id} response for a call that was not in flight");
                Err(Error::UnknownCorrelationId(id))
            }
        }
    }

    /// Resolve every pending call with the error for `reason` and refuse new ones.
    pub fn cancel_all(&self, reason: &Error) {
        let in_flight = self.with_registry(|registry| {
            registry.closed = true;
            std::mem::take(&mut registry.in_flight)
        });
        for (id, call) in in_flight {
            if let PendingCall::Waiting(completor) = call {
                log::debug!("{id} cancelling call: {reason}");
                let _ = completor.send(Err(reason.teardown_error()));
            }
        }
    }

    /// Forget a call whose request never made it onto the wire.
    pub fn remove(&self, id: u32) {
        self.with_registry(|registry| registry.in_flight.remove(&id));
    }

    /// Keep the call registered, but discard its response when it arrives.
    pub(crate) fn abandon(&self, id: u32) {
        self.with_registry(|registry| {
            if let Some(call) = registry.in_flight.get_mut(&id) {
                *call = PendingCall::Abandoned;
            }
        });
    }

    /// How many calls are waiting for responses, including abandoned ones.
    pub fn in_flight(&self) -> usize {
        self.with_registry(|registry| registry.in_flight.len())
    }
}
