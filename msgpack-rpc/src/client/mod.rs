//! Client sessions.
//!
//! `connect` gives you a connected `Session`. Use `Session::new` and
//! `Session::connect_with` when you want to set a notification handler first or
//! bring your own `StreamConnector`.

mod configuration;
mod connection_driver;
mod reactor;
mod session;
mod stream_connector;

pub use configuration::{connect, connect_with, Configuration};
pub use session::{ConnectionState, Session};
pub use stream_connector::{StreamConnector, TcpStreamConnector};

pub use reactor::completion_reactor::NotificationHandler;
pub use reactor::completion_registry::Correlator;
pub use reactor::completion_unary::CallCompletion;
