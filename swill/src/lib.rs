//! # Swill
//!
//! A bidirectional, multiplexed RPC framework layered atop a single
//! WebSocket connection. Clients open one socket, negotiate the `swill/1`
//! subprotocol, and issue any number of concurrent calls identified by a
//! `(rpc, seq)` pair — unary or streaming in either direction — carried as
//! length-prefixed, array-encoded MessagePack envelopes.
//!
//! The wire codec and message-constraint validator live in [`swill_core`]
//! and are re-exported here for convenience. This crate adds the pieces that
//! need a task scheduler and a transport: the per-connection dispatcher and
//! call state machines ([`dispatch`], [`handler`], [`request`],
//! [`response`]), the axum WebSocket transport ([`server`]), and the
//! built-in `swill.introspect` handler ([`introspect`]).
//!
//! ## Getting started
//!
//! Register handlers on a [`dispatch::Dispatcher`], mount it on an axum
//! [`axum::Router`] via [`server::router`], and serve it the usual axum way.
//! See `README.md` for a worked example.

pub mod call;
pub mod config;
pub mod connection;
pub mod dispatch;
pub mod error;
pub mod handler;
pub mod hooks;
pub mod introspect;
pub mod request;
pub mod response;
pub mod server;
pub mod shape;

pub use swill_core;

pub mod prelude {
    //! The most common types needed to register handlers and mount a server.
    pub use crate::call::{Call, CallKind};
    pub use crate::config::ServerConfig;
    pub use crate::dispatch::{Dispatcher, DispatcherBuilder};
    pub use crate::error::{CloseConnection, RequestError};
    pub use crate::handler::{stream_stream, stream_unary, unary_stream, unary_unary};
    pub use crate::request::{StreamRequest, UnaryRequest};
    pub use crate::response::Response;
    pub use crate::server::router;
    pub use swill_core::{SwillStatus, Validate};
}
