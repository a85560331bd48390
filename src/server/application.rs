//! Application dispatch contract.
//!
//! Applications are registered per path and called by the event loop for the
//! connections routed to that path. They only see the [`Connection`] the
//! event is about and a [`LoopHandle`]; sockets and the registry stay with
//! the loop.

use super::connection::{Connection, ConnectionId};
use super::error::{ApplicationError, ApplicationResult, ConnectionError};
use crate::websocket::{normalize_path, Frame};
use bytes::Bytes;
use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;

/// A path-routed WebSocket application.
pub trait Application {
    /// The upgrade response has been written.
    fn on_open(&self, _conn: &mut Connection, _handle: &LoopHandle) -> ApplicationResult {
        Ok(())
    }

    /// The connection was closed and deregistered.
    fn on_close(&self, _conn: &Connection, _handle: &LoopHandle) -> ApplicationResult {
        Ok(())
    }

    /// A frame arrived.
    fn on_message(
        &self,
        conn: &mut Connection,
        frame: &Frame,
        handle: &LoopHandle,
    ) -> ApplicationResult;

    /// Something failed on this connection.
    ///
    /// The default propagates the error to the loop's error sink.
    fn on_error(
        &self,
        _conn: &mut Connection,
        error: &ConnectionError,
        _handle: &LoopHandle,
    ) -> ApplicationResult {
        Err(ApplicationError::Unhandled(error.to_string()))
    }

    /// A frame is about to be written.
    fn on_send(&self, _conn: &Connection, _frame: &Frame, _handle: &LoopHandle) -> ApplicationResult {
        Ok(())
    }
}

/// Receives messages other workers published through the master.
pub trait RelayListener {
    /// A relayed message arrived.
    fn on_relay(&self, data: &Bytes, handle: &LoopHandle) -> ApplicationResult;
}

/// Applications keyed by normalized path, in registration order.
#[derive(Default, Clone)]
pub struct ApplicationRegistry {
    routes: HashMap<String, Vec<Rc<dyn Application>>>,
}

impl std::fmt::Debug for ApplicationRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_map()
            .entries(self.routes.iter().map(|(path, apps)| (path, apps.len())))
            .finish()
    }
}

impl ApplicationRegistry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `app` for `path`. Leading and trailing `/` are ignored.
    pub fn register(&mut self, path: &str, app: Rc<dyn Application>) {
        self.routes
            .entry(normalize_path(path).to_string())
            .or_default()
            .push(app);
    }

    /// Applications for a normalized path, empty if none.
    #[must_use]
    pub fn get(&self, path: &str) -> &[Rc<dyn Application>] {
        self.routes.get(path).map(Vec::as_slice).unwrap_or_default()
    }

    /// Registered paths.
    pub fn paths(&self) -> impl Iterator<Item = &str> {
        self.routes.keys().map(String::as_str)
    }

    /// Number of registered paths.
    #[must_use]
    pub fn len(&self) -> usize {
        self.routes.len()
    }

    /// Whether nothing is registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }
}

/// What applications may ask of the event loop during a callback.
///
/// Requests made through the handle take effect after the callback returns.
#[derive(Debug)]
pub struct LoopHandle {
    process_id: u32,
    open_connections: usize,
    relay_attached: bool,
    outbox: RefCell<Vec<(ConnectionId, Frame)>>,
    relayed: RefCell<Vec<Bytes>>,
}

impl LoopHandle {
    pub(crate) fn new(process_id: u32, open_connections: usize, relay_attached: bool) -> Self {
        Self {
            process_id,
            open_connections,
            relay_attached,
            outbox: RefCell::new(Vec::new()),
            relayed: RefCell::new(Vec::new()),
        }
    }

    /// OS process id of the worker running this loop.
    #[must_use]
    pub fn process_id(&self) -> u32 {
        self.process_id
    }

    /// Connections registered in this loop.
    #[must_use]
    pub fn open_connection_count(&self) -> usize {
        self.open_connections
    }

    /// Queue a frame for another connection of this loop. Unknown or closed
    /// connections are skipped.
    pub fn send_to(&self, id: ConnectionId, frame: Frame) {
        self.outbox.borrow_mut().push((id, frame));
    }

    /// Publish bytes to every other worker through the master.
    ///
    /// # Errors
    ///
    /// Returns [`ApplicationError::RelayUnavailable`] when the loop runs
    /// without a master.
    pub fn relay(&self, data: impl Into<Bytes>) -> ApplicationResult {
        if !self.relay_attached {
            return Err(ApplicationError::RelayUnavailable);
        }
        self.relayed.borrow_mut().push(data.into());
        Ok(())
    }

    pub(crate) fn into_requests(self) -> (Vec<(ConnectionId, Frame)>, Vec<Bytes>) {
        (self.outbox.into_inner(), self.relayed.into_inner())
    }
}
