use std::{
    future::Future,
    pin::{pin, Pin},
    task::{Context, Poll},
};

use msgpack_rpc_codec::Value;
use tokio::sync::oneshot;

use super::completion_registry::Correlator;

/// A completion for a call.
///
/// Resolves to the call's result, the remote error, or the reason the
/// connection ended first. Dropping it before then abandons the call; its
/// response is discarded when it arrives. Until then the call stays registered
/// and counts toward `Session::in_flight`.
#[derive(Debug)]
pub struct CallCompletion {
    id: u32,
    completion: oneshot::Receiver<crate::Result<Value>>,
    correlator: Correlator,
    done: bool,
}

impl CallCompletion {
    pub(crate) fn new(
        id: u32,
        completion: oneshot::Receiver<crate::Result<Value>>,
        correlator: Correlator,
    ) -> Self {
        Self {
            id,
            completion,
            correlator,
            done: false,
        }
    }

    /// The id of the request this completes.
    pub fn id(&self) -> u32 {
        self.id
    }

    /// Set this when the call is no longer registered, so drop leaves the registry alone.
    pub(crate) fn set_done(&mut self) {
        self.done = true;
    }
}

impl Future for CallCompletion {
    type Output = crate::Result<Value>;

    fn poll(mut self: Pin<&mut Self>, context: &mut Context<'_>) -> Poll<Self::Output> {
        match pin!(&mut self.completion).poll(context) {
            Poll::Ready(result) => {
                self.set_done();
                match result {
                    Ok(done) => Poll::Ready(done),
                    Err(_cancelled) => Poll::Ready(Err(crate::Error::ConnectionClosed)),
                }
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

impl Drop for CallCompletion {
    fn drop(&mut self) {
        if !self.done {
            log::debug!("{} call completion dropped before its response", self.id);
            self.correlator.abandon(self.id);
        }
    }
}
