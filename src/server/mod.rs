//! # WebSocket Server
//!
//! Connection handling, application dispatch and the multi-process launcher.
//!
//! A [`Server`] binds one listening socket, forks the configured number of
//! workers and runs the [`Master`](crate::ipc::Master) relay in the parent.
//! Each worker runs an [`EventLoop`] that accepts from the shared socket,
//! upgrades connections and routes their frames to the [`Application`]s
//! registered for the request path.
//!
//! ```no_run
//! use r0n_ws::config::ServerConfig;
//! use r0n_ws::server::{Application, ApplicationResult, Connection, LoopHandle, Server};
//! use r0n_ws::websocket::Frame;
//! use std::rc::Rc;
//!
//! struct Echo;
//!
//! impl Application for Echo {
//!     fn on_message(&self, conn: &mut Connection, frame: &Frame, _: &LoopHandle) -> ApplicationResult {
//!         conn.send(frame.clone())?;
//!         Ok(())
//!     }
//! }
//!
//! let mut server = Server::new(ServerConfig::default());
//! server.register_application("/echo", Rc::new(Echo));
//! server.run().unwrap();
//! ```

mod application;
mod connection;
mod error;
mod event_loop;
mod events;
mod launcher;
mod registry;

pub use application::{Application, ApplicationRegistry, LoopHandle, RelayListener};
pub use connection::{Connection, ConnectionId, ConnectionState};
pub use error::{
    ApplicationError, ApplicationResult, ConnectionError, ServerError, ServerResult,
};
pub use event_loop::{EventLoop, LoopState};
pub use events::{ErrorSink, LifecycleEvent, LifecycleObserver, LogErrorSink};
pub use launcher::Server;
pub use registry::ConnectionRegistry;
