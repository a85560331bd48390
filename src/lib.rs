//! # r0n-ws
//!
//! A multi-process RFC 6455 WebSocket server with path-routed applications.
//!
//! ## Features
//!
//! - WebSocket frame codec with client masking enforced
//! - HTTP upgrade handshake reassembled across partial reads
//! - One single-threaded event loop per worker process
//! - Pre-forked workers sharing one listening socket
//! - Master relay copying bytes between workers
//! - Per-address connection limits
//!
//! ## Architecture
//!
//! The [`server::Server`] binds the listener and forks workers. Each worker
//! runs a [`server::EventLoop`] that owns its connections and dispatches
//! lifecycle callbacks to the [`server::Application`]s registered for the
//! request path. Workers talk to each other only through the
//! [`ipc::Master`], which forwards whatever one worker publishes to all the
//! others.

pub mod config;
pub mod ipc;
pub mod logging;
pub mod server;
pub mod websocket;
