//! Per-process connection multiplexer.
//!
//! One [`EventLoop`] runs on a current-thread runtime in each worker. Every
//! iteration waits on the listening socket, the relay channel and every
//! registered connection (with the interest its state calls for), then
//! handles the whole batch of sockets that are ready before waiting again.
//!
//! Connections move through `New -> Handshaking -> Open -> Closed`:
//!
//! ```text
//! accept            -> connect
//! request parsed    -> handshake.read
//! response written  -> handshake.send, open
//! frame decoded     -> message
//! frame queued      -> on_send observers, send
//! peer closed       -> disconnect, close
//! ```

use super::application::{Application, ApplicationRegistry, LoopHandle, RelayListener};
use super::connection::{Connection, ConnectionId, ConnectionLimits};
use super::error::{ApplicationError, ApplicationResult, ConnectionError, ServerError, ServerResult};
use super::events::{ErrorSink, LifecycleEvent, LifecycleObserver, LogErrorSink};
use super::registry::ConnectionRegistry;
use crate::config::ServerConfig;
use crate::ipc::RelayChannel;
use crate::websocket::{Frame, FrameDecoder, HandshakeState, OpCode};
use bytes::Bytes;
use futures_util::stream::{FuturesUnordered, StreamExt};
use futures_util::FutureExt;
use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::rc::Rc;
use tokio::io::Ready;
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, info, trace, warn};

/// Lifecycle of the loop itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopState {
    /// Built but not yet run.
    NotStarted,
    /// Inside [`EventLoop::run`].
    Running,
    /// `run` has returned.
    Stopped,
}

/// Settings derived from [`ServerConfig`].
#[derive(Debug, Clone)]
struct LoopSettings {
    server_id: String,
    max_connections_per_ip: usize,
    auto_pong: bool,
    limits: ConnectionLimits,
}

impl LoopSettings {
    fn from_config(config: &ServerConfig) -> Self {
        let decoder = FrameDecoder::server().with_max_payload_len(config.limits.max_frame_size);
        Self {
            server_id: config.server.server_id.clone(),
            max_connections_per_ip: config.limits.max_connections_per_ip,
            auto_pong: config.protocol.auto_pong,
            limits: ConnectionLimits {
                read_buffer_size: config.limits.read_buffer_size,
                max_handshake_size: config.limits.max_handshake_size,
                decoder,
            },
        }
    }
}

/// What woke the loop.
enum Wake {
    Shutdown,
    Accept(io::Result<(TcpStream, SocketAddr)>),
    Relay(io::Result<Ready>),
    Ready(Vec<(ConnectionId, io::Result<Ready>)>),
}

/// Multiplexes the listening socket and every open connection of one
/// process.
pub struct EventLoop {
    listener: TcpListener,
    registry: ConnectionRegistry,
    apps: ApplicationRegistry,
    relay: Option<RelayChannel>,
    relay_listener: Option<Rc<dyn RelayListener>>,
    observer: Option<Rc<dyn LifecycleObserver>>,
    error_sink: Rc<dyn ErrorSink>,
    settings: LoopSettings,
    process_id: u32,
    state: LoopState,
}

impl std::fmt::Debug for EventLoop {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventLoop")
            .field("listener", &self.listener)
            .field("connections", &self.registry.len())
            .field("apps", &self.apps)
            .field("relay", &self.relay.is_some())
            .field("state", &self.state)
            .finish_non_exhaustive()
    }
}

impl EventLoop {
    /// Create a loop over an already-bound listener.
    #[must_use]
    pub fn new(listener: TcpListener, apps: ApplicationRegistry, config: &ServerConfig) -> Self {
        Self {
            listener,
            registry: ConnectionRegistry::new(),
            apps,
            relay: None,
            relay_listener: None,
            observer: None,
            error_sink: Rc::new(LogErrorSink),
            settings: LoopSettings::from_config(config),
            process_id: std::process::id(),
            state: LoopState::NotStarted,
        }
    }

    /// Attach the worker's end of the master relay.
    #[must_use]
    pub fn with_relay(mut self, relay: RelayChannel) -> Self {
        self.relay = Some(relay);
        self
    }

    /// Receive messages relayed from other workers.
    #[must_use]
    pub fn with_relay_listener(mut self, listener: Rc<dyn RelayListener>) -> Self {
        self.relay_listener = Some(listener);
        self
    }

    /// Observe lifecycle events.
    #[must_use]
    pub fn with_observer(mut self, observer: Rc<dyn LifecycleObserver>) -> Self {
        self.observer = Some(observer);
        self
    }

    /// Replace the default logging error sink.
    #[must_use]
    pub fn with_error_sink(mut self, sink: Rc<dyn ErrorSink>) -> Self {
        self.error_sink = sink;
        self
    }

    /// Address of the listening socket.
    ///
    /// # Errors
    ///
    /// Propagates the socket error.
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Current loop state.
    #[must_use]
    pub fn state(&self) -> LoopState {
        self.state
    }

    /// Connections currently registered.
    #[must_use]
    pub fn connection_count(&self) -> usize {
        self.registry.len()
    }

    /// Run until `shutdown` resolves.
    ///
    /// Remaining connections are closed (firing `disconnect` and `close`)
    /// before `shutdown` is emitted.
    ///
    /// # Errors
    ///
    /// Returns [`ServerError::AlreadyRunning`] if the loop was started
    /// before, and [`ServerError::Ipc`] if the relay channel fails.
    pub async fn run<F>(&mut self, shutdown: F) -> ServerResult
    where
        F: Future<Output = ()>,
    {
        if self.state != LoopState::NotStarted {
            return Err(ServerError::AlreadyRunning);
        }
        self.state = LoopState::Running;
        info!(
            pid = self.process_id,
            addr = ?self.listener.local_addr().ok(),
            apps = self.apps.len(),
            "event loop started"
        );

        tokio::pin!(shutdown);
        let result = loop {
            let step = match self.wait(shutdown.as_mut()).await {
                Wake::Shutdown => break Ok(()),
                Wake::Accept(Ok((stream, peer))) => {
                    self.accept(stream, peer);
                    Ok(())
                },
                Wake::Accept(Err(e)) => {
                    warn!(error = %e, "accept failed");
                    Ok(())
                },
                Wake::Relay(ready) => self.on_relay_ready(ready),
                Wake::Ready(batch) => {
                    for (id, ready) in batch {
                        self.on_connection_ready(id, ready);
                    }
                    Ok(())
                },
            };
            if let Err(e) = step {
                break Err(e);
            }
        };

        self.stop();
        result
    }

    /// Wait for the next batch of readiness.
    async fn wait<F>(&self, shutdown: Pin<&mut F>) -> Wake
    where
        F: Future<Output = ()>,
    {
        let mut waits: FuturesUnordered<_> = self
            .registry
            .iter()
            .map(|conn| {
                let id = conn.id();
                let interest = conn.interest();
                async move { (id, conn.stream().ready(interest).await) }
            })
            .collect();

        let relay = async {
            match &self.relay {
                Some(relay) => relay.stream().ready(relay.interest()).await,
                None => std::future::pending().await,
            }
        };

        let first = tokio::select! {
            () = shutdown => return Wake::Shutdown,
            accepted = self.listener.accept() => return Wake::Accept(accepted),
            ready = relay => return Wake::Relay(ready),
            Some(first) = waits.next(), if !waits.is_empty() => first,
        };

        let mut batch = vec![first];
        while let Some(Some(next)) = waits.next().now_or_never() {
            batch.push(next);
        }
        Wake::Ready(batch)
    }

    fn stop(&mut self) {
        for id in self.registry.ids() {
            self.close_connection(id);
        }
        self.state = LoopState::Stopped;
        self.emit(LifecycleEvent::Shutdown, None);
        info!(pid = self.process_id, "event loop stopped");
    }

    fn accept(&mut self, stream: TcpStream, peer: SocketAddr) {
        let addr = peer.ip();
        let cap = self.settings.max_connections_per_ip;
        if !self.registry.admits(addr, cap) {
            warn!(addr = %addr, limit = cap, "per-address connection limit reached, rejecting");
            return;
        }

        let id = self.registry.next_id();
        self.registry
            .insert(Connection::new(id, stream, peer, self.settings.limits));
        debug!(connection = %id, peer = %peer, "accepted");
        self.emit(LifecycleEvent::Connect, Some(id));
    }

    fn on_connection_ready(&mut self, id: ConnectionId, ready: io::Result<Ready>) {
        let ready = match ready {
            Ok(ready) => ready,
            Err(e) => {
                self.fail(id, ConnectionError::Io(e));
                return;
            },
        };

        if ready.is_readable() {
            self.on_readable(id);
        }
        if ready.is_writable() {
            self.on_writable(id);
        }
    }

    fn on_readable(&mut self, id: ConnectionId) {
        let Some(conn) = self.registry.get_mut(id) else {
            return;
        };
        let state = conn.handshake_state();

        match conn.read() {
            Ok(0) => {
                debug!(connection = %id, "peer closed");
                if state == HandshakeState::Upgraded {
                    self.close_connection(id);
                } else {
                    self.abort(id);
                }
            },
            Ok(_) => match state {
                HandshakeState::AwaitingRequest => self.advance_handshake(id),
                HandshakeState::Upgraded => self.process_frames(id),
                HandshakeState::RequestReceived => {},
            },
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {},
            Err(e) => {
                if state == HandshakeState::Upgraded {
                    self.fail(id, ConnectionError::Io(e));
                } else {
                    debug!(connection = %id, error = %e, "read failed during handshake");
                    self.abort(id);
                }
            },
        }
    }

    fn advance_handshake(&mut self, id: ConnectionId) {
        let Some(conn) = self.registry.get_mut(id) else {
            return;
        };

        match conn.receive_request() {
            Ok(true) => {
                debug!(connection = %id, path = conn.application_path(), "upgrade request read");
                self.emit(LifecycleEvent::HandshakeRead, Some(id));
            },
            Ok(false) => {},
            Err(e) => {
                warn!(connection = %id, addr = %conn.remote_addr(), error = %e, "handshake failed");
                self.abort(id);
            },
        }
    }

    fn on_writable(&mut self, id: ConnectionId) {
        let Some(conn) = self.registry.get_mut(id) else {
            return;
        };

        if conn.handshake_state() != HandshakeState::RequestReceived {
            self.flush_outbound(id);
            return;
        }

        let written = conn
            .accept_upgrade(&self.settings.server_id)
            .map_err(ConnectionError::from)
            .and_then(|()| conn.flush().map_err(ConnectionError::from));
        if let Err(e) = written {
            warn!(connection = %id, error = %e, "failed to send upgrade response");
            self.abort(id);
            return;
        }

        debug!(connection = %id, "connection open");
        self.emit(LifecycleEvent::HandshakeSend, Some(id));
        self.emit(LifecycleEvent::Open, Some(id));
        self.dispatch(id, |app, conn, handle| app.on_open(conn, handle));

        // frames pipelined behind the request are already buffered
        self.process_frames(id);
    }

    fn process_frames(&mut self, id: ConnectionId) {
        loop {
            let next = match self.registry.get_mut(id) {
                Some(conn) if !conn.close_requested() => conn.next_frame(),
                _ => return,
            };

            match next {
                Ok(Some(frame)) => self.on_frame(id, frame),
                Ok(None) => break,
                Err(e) => {
                    warn!(connection = %id, error = %e, "protocol error");
                    self.fail(id, e.into());
                    return;
                },
            }
        }
        self.close_if_requested(id);
    }

    fn on_frame(&mut self, id: ConnectionId, frame: Frame) {
        match frame.opcode {
            OpCode::Close => {
                debug!(connection = %id, "close frame received");
                self.close_connection(id);
            },
            OpCode::Ping if self.settings.auto_pong => {
                if let Some(conn) = self.registry.get_mut(id) {
                    if let Err(e) = conn.send(Frame::pong(frame.payload.clone())) {
                        debug!(connection = %id, error = %e, "pong dropped");
                    }
                }
                self.on_message(id, frame);
            },
            _ => self.on_message(id, frame),
        }
    }

    fn on_message(&mut self, id: ConnectionId, frame: Frame) {
        trace!(connection = %id, opcode = ?frame.opcode, len = frame.len(), "message");
        self.emit(LifecycleEvent::Message, Some(id));
        self.dispatch(id, |app, conn, handle| app.on_message(conn, &frame, handle));
    }

    /// Encode queued frames (after the `on_send` observers) and write them.
    fn flush_outbound(&mut self, id: ConnectionId) {
        loop {
            let handle = self.handle();
            let outcome = {
                let Some(conn) = self.registry.get_mut(id) else {
                    return;
                };
                let Some(frame) = conn.pop_outbound() else {
                    break;
                };
                let observed = self
                    .apps
                    .get(conn.application_path())
                    .iter()
                    .try_for_each(|app| app.on_send(conn, &frame, &handle));
                (observed, conn.write_frame(&frame))
            };
            self.apply(handle);

            match outcome {
                (observed, Ok(())) => {
                    self.emit(LifecycleEvent::Send, Some(id));
                    if let Err(e) = observed {
                        self.fire_error(id, ConnectionError::Application(e));
                    }
                },
                (_, Err(e)) => {
                    self.fail(id, e.into());
                    return;
                },
            }
        }

        let flushed = match self.registry.get_mut(id) {
            Some(conn) => conn.flush(),
            None => return,
        };
        match flushed {
            Ok(()) => self.close_if_requested(id),
            Err(e) => self.fail(id, ConnectionError::Io(e)),
        }
    }

    /// Call every application of the connection's path until one fails.
    fn dispatch<F>(&mut self, id: ConnectionId, mut call: F)
    where
        F: FnMut(&dyn Application, &mut Connection, &LoopHandle) -> ApplicationResult,
    {
        let handle = self.handle();
        let result = match self.registry.get_mut(id) {
            Some(conn) => self
                .apps
                .get(conn.application_path())
                .iter()
                .try_for_each(|app| call(&**app, conn, &handle)),
            None => Ok(()),
        };
        self.apply(handle);

        if let Err(e) = result {
            self.fire_error(id, ConnectionError::Application(e));
        }
        self.close_if_requested(id);
    }

    /// Route an error to the path's applications; whatever they do not
    /// handle goes to the error sink.
    fn fire_error(&mut self, id: ConnectionId, error: ConnectionError) {
        self.emit(LifecycleEvent::Error, Some(id));

        let handle = self.handle();
        let escaped = match self.registry.get_mut(id) {
            Some(conn) => {
                let apps = self.apps.get(conn.application_path());
                if apps.is_empty() {
                    Some(error)
                } else {
                    apps.iter()
                        .find_map(|app| app.on_error(conn, &error, &handle).err())
                        .map(ConnectionError::Application)
                }
            },
            None => Some(error),
        };
        self.apply(handle);

        if let Some(err) = escaped {
            self.error_sink.report(Some(id), &err);
        }
    }

    fn fail(&mut self, id: ConnectionId, error: ConnectionError) {
        self.fire_error(id, error);
        self.close_connection(id);
    }

    fn close_if_requested(&mut self, id: ConnectionId) {
        let requested = self
            .registry
            .get(id)
            .is_some_and(|conn| conn.close_requested() && !conn.has_pending_output());
        if requested {
            self.close_connection(id);
        }
    }

    /// Deregister and close a connection that may have been upgraded.
    fn close_connection(&mut self, id: ConnectionId) {
        let Some(mut conn) = self.registry.remove(id) else {
            return;
        };
        if let Err(e) = conn.flush() {
            debug!(connection = %id, error = %e, "discarding unsent output");
        }
        conn.mark_closed();
        debug!(connection = %id, "connection closed");
        self.emit(LifecycleEvent::Disconnect, Some(id));

        if !conn.is_upgraded() {
            return;
        }
        self.emit(LifecycleEvent::Close, Some(id));

        let handle = self.handle();
        let failed = self
            .apps
            .get(conn.application_path())
            .iter()
            .find_map(|app| app.on_close(&conn, &handle).err());
        self.apply(handle);

        if let Some(e) = failed {
            self.error_sink
                .report(Some(id), &ConnectionError::Application(e));
        }
    }

    /// Drop a connection that never completed the handshake.
    fn abort(&mut self, id: ConnectionId) {
        if let Some(mut conn) = self.registry.remove(id) {
            conn.mark_closed();
            self.emit(LifecycleEvent::Disconnect, Some(id));
        }
    }

    fn on_relay_ready(&mut self, ready: io::Result<Ready>) -> ServerResult {
        let ready = ready.map_err(crate::ipc::IpcError::from)?;
        let Some(relay) = self.relay.as_mut() else {
            return Ok(());
        };

        if ready.is_writable() {
            relay.flush()?;
        }
        if !ready.is_readable() {
            return Ok(());
        }

        relay.read()?;
        while let Some(data) = self.relay.as_mut().and_then(RelayChannel::next_message) {
            self.deliver_relayed(data);
        }
        Ok(())
    }

    fn deliver_relayed(&mut self, data: Bytes) {
        let Some(listener) = self.relay_listener.clone() else {
            trace!(bytes = data.len(), "no relay listener, dropping relayed message");
            return;
        };

        let handle = self.handle();
        let result = listener.on_relay(&data, &handle);
        self.apply(handle);

        if let Err(e) = result {
            self.error_sink
                .report(None, &ConnectionError::Application(e));
        }
    }

    fn handle(&self) -> LoopHandle {
        LoopHandle::new(self.process_id, self.registry.len(), self.relay.is_some())
    }

    /// Carry out what applications asked for through a handle.
    fn apply(&mut self, handle: LoopHandle) {
        let (outbox, relayed) = handle.into_requests();

        for (target, frame) in outbox {
            if let Some(conn) = self.registry.get_mut(target) {
                if let Err(e) = conn.send(frame) {
                    debug!(connection = %target, error = %e, "frame not queued");
                }
            }
        }

        let Some(relay) = self.relay.as_mut() else {
            return;
        };
        for data in relayed {
            if let Err(e) = relay.publish(&data) {
                let err = ConnectionError::Application(ApplicationError::Other(Box::new(e)));
                self.error_sink.report(None, &err);
            }
        }
    }

    fn emit(&self, event: LifecycleEvent, connection: Option<ConnectionId>) {
        trace!(event = %event, connection = ?connection.map(ConnectionId::as_u64), "lifecycle");
        if let Some(observer) = &self.observer {
            observer.on_event(event, connection);
        }
    }
}
