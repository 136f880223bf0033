//! msgpack-rpc
//!
//! An async client for msgpack-rpc servers, like neovim's `--listen` socket.
//!
//! A `Session` owns one connection. You can issue calls from as many tasks as you
//! like; each call gets an id, and responses are matched back to their calls in
//! whatever order the server sends them. Notifications from the server are handed
//! to the handler you set with `Session::on_notification`.
//!
//! ```no_run
//! # async fn run() -> msgpack_rpc::Result<()> {
//! use msgpack_rpc::{client, params};
//!
//! let session = client::connect("127.0.0.1:6666", &client::Configuration::default()).await?;
//! let paths = session.call("vim_list_runtime_paths", params![]).await?;
//! println!("runtime paths: {paths}");
//! session.close().await;
//! # Ok(())
//! # }
//! ```
//!
//! The session only needs a duplex byte stream. Tcp is built in; implement
//! `client::StreamConnector` to use anything else.
//!
//! A connection ends when the server closes it, when the stream fails, when the
//! server breaks the protocol, or when you `close` the session. However it ends,
//! every call still waiting completes with an error, and the session stays closed.

#![deny(missing_docs)]

mod error;

pub mod client;

pub use error::{Error, Result};
pub use msgpack_rpc_codec::{params, Message, Value};
