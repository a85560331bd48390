#![cfg(unix)]
//! Integration tests for the event loop, driven by raw TCP clients.

use bytes::{Buf, Bytes, BytesMut};
use r0n_ws::config::ServerConfig;
use r0n_ws::ipc::{socket_pair, RelayChannel, MAX_RECORD_LEN};
use r0n_ws::server::{
    Application, ApplicationRegistry, ApplicationResult, Connection, ConnectionError,
    ConnectionId, ErrorSink, EventLoop, LifecycleEvent, LifecycleObserver, LoopHandle,
    RelayListener, ServerResult,
};
use r0n_ws::websocket::{encode, Decoded, Frame, FrameDecoder, OpCode, POWERED_BY};
use std::cell::{Cell, RefCell};
use std::net::SocketAddr;
use std::rc::Rc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream, UnixStream};
use tokio::sync::oneshot;
use tokio::task::{JoinHandle, LocalSet};

const KEY: &str = "dGhlIHNhbXBsZSBub25jZQ==";
const ACCEPT: &str = "s3pPLMBiTxaQ9kYGzzhZRbK+xOo=";
const TIMEOUT: Duration = Duration::from_secs(5);

fn request(path: &str) -> String {
    format!(
        "GET {path} HTTP/1.1\r\n\
         Host: localhost\r\n\
         Upgrade: websocket\r\n\
         Connection: Upgrade\r\n\
         Sec-WebSocket-Key: {KEY}\r\n\
         Sec-WebSocket-Version: 13\r\n\r\n"
    )
}

/// Minimal WebSocket client over a raw socket.
struct Client {
    stream: TcpStream,
    buf: BytesMut,
}

impl Client {
    async fn connect(addr: SocketAddr) -> Self {
        Self {
            stream: TcpStream::connect(addr).await.unwrap(),
            buf: BytesMut::new(),
        }
    }

    async fn open(addr: SocketAddr, path: &str) -> Self {
        let mut client = Self::connect(addr).await;
        client.write(request(path).as_bytes()).await;
        let response = client.read_response().await;
        assert!(
            response.starts_with("HTTP/1.0 101 Switching Protocols\r\n"),
            "{response}"
        );
        client
    }

    async fn write(&mut self, data: &[u8]) {
        self.stream.write_all(data).await.unwrap();
    }

    async fn fill(&mut self) -> usize {
        tokio::time::timeout(TIMEOUT, self.stream.read_buf(&mut self.buf))
            .await
            .expect("timed out waiting for data")
            .unwrap()
    }

    async fn read_response(&mut self) -> String {
        loop {
            if let Some(end) = self.buf.windows(4).position(|w| w == b"\r\n\r\n") {
                let head = self.buf.split_to(end + 4);
                return String::from_utf8(head.to_vec()).unwrap();
            }
            assert!(self.fill().await > 0, "connection closed before response");
        }
    }

    async fn send(&mut self, opcode: OpCode, payload: &[u8]) {
        let frame = encode(payload, opcode, true).unwrap();
        self.write(&frame).await;
    }

    async fn recv(&mut self) -> Frame {
        loop {
            if let Decoded::Complete { frame, length } =
                FrameDecoder::client().decode(&self.buf).unwrap()
            {
                self.buf.advance(length);
                return frame;
            }
            assert!(self.fill().await > 0, "connection closed before frame");
        }
    }

    /// Wait for the server to close; returns whatever was still unread.
    async fn closed(&mut self) -> Bytes {
        loop {
            let read = tokio::time::timeout(TIMEOUT, self.stream.read_buf(&mut self.buf))
                .await
                .expect("timed out waiting for close");
            match read {
                Ok(0) | Err(_) => return self.buf.split().freeze(),
                Ok(_) => {},
            }
        }
    }
}

#[derive(Default)]
struct Recorder {
    events: RefCell<Vec<(LifecycleEvent, Option<ConnectionId>)>>,
}

impl LifecycleObserver for Recorder {
    fn on_event(&self, event: LifecycleEvent, connection: Option<ConnectionId>) {
        self.events.borrow_mut().push((event, connection));
    }
}

impl Recorder {
    fn names(&self) -> Vec<&'static str> {
        self.events.borrow().iter().map(|(e, _)| e.as_str()).collect()
    }

    fn count(&self, event: LifecycleEvent) -> usize {
        self.events.borrow().iter().filter(|(e, _)| *e == event).count()
    }
}

#[derive(Default)]
struct Sink {
    errors: RefCell<Vec<String>>,
}

impl ErrorSink for Sink {
    fn report(&self, _: Option<ConnectionId>, error: &ConnectionError) {
        self.errors.borrow_mut().push(error.to_string());
    }
}

/// Echoes data frames.
struct Echo;

impl Application for Echo {
    fn on_message(&self, conn: &mut Connection, frame: &Frame, _: &LoopHandle) -> ApplicationResult {
        if frame.opcode.is_data() {
            conn.send(frame.clone())?;
        }
        Ok(())
    }
}

/// Echoes data frames and records every callback.
#[derive(Default)]
struct Recording {
    opcodes: RefCell<Vec<OpCode>>,
    errors: RefCell<Vec<String>>,
    opened: RefCell<Vec<(usize, u32)>>,
    closed: Cell<usize>,
    sent: Cell<usize>,
    handle_errors: bool,
}

impl Application for Recording {
    fn on_open(&self, _: &mut Connection, handle: &LoopHandle) -> ApplicationResult {
        self.opened
            .borrow_mut()
            .push((handle.open_connection_count(), handle.process_id()));
        Ok(())
    }

    fn on_close(&self, _: &Connection, _: &LoopHandle) -> ApplicationResult {
        self.closed.set(self.closed.get() + 1);
        Ok(())
    }

    fn on_message(&self, conn: &mut Connection, frame: &Frame, _: &LoopHandle) -> ApplicationResult {
        self.opcodes.borrow_mut().push(frame.opcode);
        if frame.opcode.is_data() {
            conn.send(frame.clone())?;
        }
        Ok(())
    }

    fn on_error(
        &self,
        _: &mut Connection,
        error: &ConnectionError,
        _: &LoopHandle,
    ) -> ApplicationResult {
        self.errors.borrow_mut().push(error.to_string());
        if self.handle_errors {
            Ok(())
        } else {
            Err(r0n_ws::server::ApplicationError::Unhandled(error.to_string()))
        }
    }

    fn on_send(&self, _: &Connection, _: &Frame, _: &LoopHandle) -> ApplicationResult {
        self.sent.set(self.sent.get() + 1);
        Ok(())
    }
}

struct Running {
    addr: SocketAddr,
    stop: oneshot::Sender<()>,
    task: JoinHandle<ServerResult>,
}

impl Running {
    async fn shutdown(self) {
        self.stop.send(()).unwrap();
        self.task.await.unwrap().unwrap();
    }
}

async fn bind() -> TcpListener {
    TcpListener::bind("127.0.0.1:0").await.unwrap()
}

async fn event_loop(apps: ApplicationRegistry, config: &ServerConfig) -> EventLoop {
    EventLoop::new(bind().await, apps, config)
}

fn spawn(mut event_loop: EventLoop) -> Running {
    let addr = event_loop.local_addr().unwrap();
    let (stop, stopped) = oneshot::channel::<()>();
    let task = tokio::task::spawn_local(async move {
        event_loop
            .run(async {
                let _ = stopped.await;
            })
            .await
    });
    Running { addr, stop, task }
}

fn relay_pair() -> (UnixStream, UnixStream) {
    let (worker_end, master_end) = socket_pair().unwrap();
    (
        UnixStream::from_std(worker_end).unwrap(),
        UnixStream::from_std(master_end).unwrap(),
    )
}

async fn eventually(condition: impl Fn() -> bool) {
    tokio::time::timeout(TIMEOUT, async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("condition not reached");
}

fn apps_with(path: &str, app: Rc<dyn Application>) -> ApplicationRegistry {
    let mut apps = ApplicationRegistry::new();
    apps.register(path, app);
    apps
}

#[tokio::test]
async fn test_echo_round_trip() {
    LocalSet::new()
        .run_until(async {
            let apps = apps_with("/echo", Rc::new(Echo));
            let running = spawn(event_loop(apps, &ServerConfig::default()).await);

            let mut client = Client::connect(running.addr).await;
            client.write(request("/echo/?room=1").as_bytes()).await;
            let response = client.read_response().await;
            assert_eq!(
                response,
                format!(
                    "HTTP/1.0 101 Switching Protocols\r\n\
                     Upgrade: websocket\r\n\
                     Connection: Upgrade\r\n\
                     Sec-WebSocket-Accept: {ACCEPT}\r\n\
                     X-Powered-By: {POWERED_BY}\r\n\r\n"
                )
            );

            client.send(OpCode::Text, b"hello").await;
            let frame = client.recv().await;
            assert_eq!(frame.opcode, OpCode::Text);
            assert_eq!(frame.as_text(), Some("hello"));
            assert!(!frame.masked);

            let large = vec![9u8; 70_000];
            client.send(OpCode::Binary, &large).await;
            let frame = client.recv().await;
            assert_eq!(frame.opcode, OpCode::Binary);
            assert_eq!(frame.payload.as_ref(), &large[..]);

            running.shutdown().await;
        })
        .await;
}

#[tokio::test]
async fn test_lifecycle_event_order() {
    LocalSet::new()
        .run_until(async {
            let recorder = Rc::new(Recorder::default());
            let apps = apps_with("echo", Rc::new(Echo));
            let running = spawn(
                event_loop(apps, &ServerConfig::default())
                    .await
                    .with_observer(recorder.clone()),
            );

            let mut client = Client::open(running.addr, "/echo").await;
            client.send(OpCode::Text, b"ping").await;
            client.recv().await;
            drop(client);

            eventually(|| recorder.count(LifecycleEvent::Close) == 1).await;
            running.shutdown().await;

            assert_eq!(
                recorder.names(),
                [
                    "connect",
                    "handshake.read",
                    "handshake.send",
                    "open",
                    "message",
                    "send",
                    "disconnect",
                    "close",
                    "shutdown"
                ]
            );
            let events = recorder.events.borrow();
            assert!(events[..8].iter().all(|(_, id)| id.is_some()));
            assert_eq!(events[8].1, None);
        })
        .await;
}

#[tokio::test]
async fn test_admission_control_cap_one() {
    LocalSet::new()
        .run_until(async {
            let mut config = ServerConfig::default();
            config.limits.max_connections_per_ip = 1;
            let recorder = Rc::new(Recorder::default());
            let apps = apps_with("echo", Rc::new(Echo));
            let running = spawn(
                event_loop(apps, &config)
                    .await
                    .with_observer(recorder.clone()),
            );

            let first = Client::open(running.addr, "/echo").await;

            let mut second = Client::connect(running.addr).await;
            assert!(second.closed().await.is_empty());
            assert_eq!(recorder.count(LifecycleEvent::Connect), 1);

            drop(first);
            eventually(|| recorder.count(LifecycleEvent::Disconnect) == 1).await;

            let mut third = Client::open(running.addr, "/echo").await;
            third.send(OpCode::Text, b"again").await;
            assert_eq!(third.recv().await.as_text(), Some("again"));
            assert_eq!(recorder.count(LifecycleEvent::Connect), 2);

            running.shutdown().await;
        })
        .await;
}

#[tokio::test]
async fn test_unmasked_frame_closes_connection() {
    LocalSet::new()
        .run_until(async {
            let recorder = Rc::new(Recorder::default());
            let sink = Rc::new(Sink::default());
            let apps = apps_with("echo", Rc::new(Echo));
            let running = spawn(
                event_loop(apps, &ServerConfig::default())
                    .await
                    .with_observer(recorder.clone())
                    .with_error_sink(sink.clone()),
            );

            let mut client = Client::open(running.addr, "/echo").await;
            client
                .write(&encode(b"hi", OpCode::Text, false).unwrap())
                .await;
            assert!(client.closed().await.is_empty());

            eventually(|| recorder.count(LifecycleEvent::Close) == 1).await;
            let names = recorder.names();
            assert_eq!(&names[names.len() - 3..], ["error", "disconnect", "close"]);
            assert_eq!(recorder.count(LifecycleEvent::Message), 0);

            let errors = sink.errors.borrow();
            assert_eq!(errors.len(), 1);
            assert!(errors[0].contains("not masked"), "{}", errors[0]);
            drop(errors);

            running.shutdown().await;
        })
        .await;
}

#[tokio::test]
async fn test_application_handles_error() {
    LocalSet::new()
        .run_until(async {
            let sink = Rc::new(Sink::default());
            let app = Rc::new(Recording {
                handle_errors: true,
                ..Recording::default()
            });
            let apps = apps_with("app", app.clone());
            let running = spawn(
                event_loop(apps, &ServerConfig::default())
                    .await
                    .with_error_sink(sink.clone()),
            );

            let mut client = Client::open(running.addr, "/app").await;
            client
                .write(&encode(b"hi", OpCode::Text, false).unwrap())
                .await;
            client.closed().await;

            eventually(|| app.closed.get() == 1).await;
            assert_eq!(app.errors.borrow().len(), 1);
            assert!(sink.errors.borrow().is_empty());

            running.shutdown().await;
        })
        .await;
}

#[tokio::test]
async fn test_unhandled_application_error_reaches_sink() {
    LocalSet::new()
        .run_until(async {
            let sink = Rc::new(Sink::default());
            let app = Rc::new(Recording::default());
            let apps = apps_with("app", app.clone());
            let running = spawn(
                event_loop(apps, &ServerConfig::default())
                    .await
                    .with_error_sink(sink.clone()),
            );

            let mut client = Client::open(running.addr, "/app").await;
            client
                .write(&encode(b"hi", OpCode::Text, false).unwrap())
                .await;
            client.closed().await;

            eventually(|| sink.errors.borrow().len() == 1).await;
            assert_eq!(app.errors.borrow().len(), 1);
            assert!(sink.errors.borrow()[0].contains("unhandled"));

            running.shutdown().await;
        })
        .await;
}

#[tokio::test]
async fn test_unregistered_path_is_silent() {
    LocalSet::new()
        .run_until(async {
            let recorder = Rc::new(Recorder::default());
            let sink = Rc::new(Sink::default());
            let apps = apps_with("echo", Rc::new(Echo));
            let running = spawn(
                event_loop(apps, &ServerConfig::default())
                    .await
                    .with_observer(recorder.clone())
                    .with_error_sink(sink.clone()),
            );

            let mut client = Client::open(running.addr, "/nowhere").await;
            client.send(OpCode::Text, b"anyone?").await;
            client.send(OpCode::Ping, b"p").await;

            let pong = client.recv().await;
            assert_eq!(pong.opcode, OpCode::Pong);
            assert_eq!(pong.payload.as_ref(), b"p");
            assert_eq!(recorder.count(LifecycleEvent::Message), 2);
            assert!(sink.errors.borrow().is_empty());

            running.shutdown().await;
        })
        .await;
}

#[tokio::test]
async fn test_malformed_handshake_gets_no_response() {
    LocalSet::new()
        .run_until(async {
            let recorder = Rc::new(Recorder::default());
            let running = spawn(
                event_loop(ApplicationRegistry::new(), &ServerConfig::default())
                    .await
                    .with_observer(recorder.clone()),
            );

            let mut client = Client::connect(running.addr).await;
            client.write(b"garbage\r\n\r\n").await;
            assert!(client.closed().await.is_empty());

            let mut client = Client::connect(running.addr).await;
            client.write(b"GET /echo HTTP/1.1\r\nHost: x\r\n\r\n").await;
            assert!(client.closed().await.is_empty());

            eventually(|| recorder.count(LifecycleEvent::Disconnect) == 2).await;
            assert_eq!(
                recorder.names(),
                ["connect", "disconnect", "connect", "disconnect"]
            );

            running.shutdown().await;
        })
        .await;
}

#[tokio::test]
async fn test_split_request_and_frame() {
    LocalSet::new()
        .run_until(async {
            let apps = apps_with("echo", Rc::new(Echo));
            let running = spawn(event_loop(apps, &ServerConfig::default()).await);

            let mut client = Client::connect(running.addr).await;
            let request = request("/echo");
            let (head, tail) = request.as_bytes().split_at(20);
            client.write(head).await;
            tokio::time::sleep(Duration::from_millis(20)).await;
            client.write(tail).await;
            client.read_response().await;

            let frame = encode(b"in pieces", OpCode::Text, true).unwrap();
            for chunk in frame.chunks(3) {
                client.write(chunk).await;
                tokio::time::sleep(Duration::from_millis(2)).await;
            }
            assert_eq!(client.recv().await.as_text(), Some("in pieces"));

            running.shutdown().await;
        })
        .await;
}

#[tokio::test]
async fn test_frame_pipelined_behind_request() {
    LocalSet::new()
        .run_until(async {
            let apps = apps_with("echo", Rc::new(Echo));
            let running = spawn(event_loop(apps, &ServerConfig::default()).await);

            let mut client = Client::connect(running.addr).await;
            let mut bytes = request("/echo").into_bytes();
            bytes.extend_from_slice(&encode(b"eager", OpCode::Text, true).unwrap());
            client.write(&bytes).await;

            client.read_response().await;
            assert_eq!(client.recv().await.as_text(), Some("eager"));

            running.shutdown().await;
        })
        .await;
}

#[tokio::test]
async fn test_ping_is_answered_and_dispatched() {
    LocalSet::new()
        .run_until(async {
            let app = Rc::new(Recording::default());
            let apps = apps_with("app", app.clone());
            let running = spawn(event_loop(apps, &ServerConfig::default()).await);

            let mut client = Client::open(running.addr, "/app").await;
            client.send(OpCode::Ping, b"are you there").await;
            let pong = client.recv().await;
            assert_eq!(pong.opcode, OpCode::Pong);
            assert_eq!(pong.payload.as_ref(), b"are you there");
            assert_eq!(*app.opcodes.borrow(), [OpCode::Ping]);

            running.shutdown().await;
        })
        .await;
}

#[tokio::test]
async fn test_auto_pong_disabled() {
    LocalSet::new()
        .run_until(async {
            let mut config = ServerConfig::default();
            config.protocol.auto_pong = false;
            let app = Rc::new(Recording::default());
            let apps = apps_with("app", app.clone());
            let running = spawn(event_loop(apps, &config).await);

            let mut client = Client::open(running.addr, "/app").await;
            client.send(OpCode::Ping, b"p").await;
            client.send(OpCode::Text, b"t").await;
            let frame = client.recv().await;
            assert_eq!(frame.opcode, OpCode::Text);
            assert_eq!(*app.opcodes.borrow(), [OpCode::Ping, OpCode::Text]);

            running.shutdown().await;
        })
        .await;
}

#[tokio::test]
async fn test_peer_close_frame() {
    LocalSet::new()
        .run_until(async {
            let recorder = Rc::new(Recorder::default());
            let app = Rc::new(Recording::default());
            let apps = apps_with("app", app.clone());
            let running = spawn(
                event_loop(apps, &ServerConfig::default())
                    .await
                    .with_observer(recorder.clone()),
            );

            let mut client = Client::open(running.addr, "/app").await;
            client.send(OpCode::Close, b"").await;
            assert!(client.closed().await.is_empty());

            eventually(|| app.closed.get() == 1).await;
            assert!(app.opcodes.borrow().is_empty());
            let names = recorder.names();
            assert_eq!(&names[names.len() - 2..], ["disconnect", "close"]);

            running.shutdown().await;
        })
        .await;
}

struct Goodbye;

impl Application for Goodbye {
    fn on_message(&self, conn: &mut Connection, _: &Frame, _: &LoopHandle) -> ApplicationResult {
        conn.send_text("bye")?;
        conn.close();
        assert!(conn.send_text("too late").is_err());
        Ok(())
    }
}

#[tokio::test]
async fn test_application_close_flushes_first() {
    LocalSet::new()
        .run_until(async {
            let apps = apps_with("bye", Rc::new(Goodbye));
            let running = spawn(event_loop(apps, &ServerConfig::default()).await);

            let mut client = Client::open(running.addr, "/bye").await;
            client.send(OpCode::Text, b"hello").await;
            assert_eq!(client.recv().await.as_text(), Some("bye"));
            assert!(client.closed().await.is_empty());

            running.shutdown().await;
        })
        .await;
}

#[tokio::test]
async fn test_on_send_and_loop_handle() {
    LocalSet::new()
        .run_until(async {
            let app = Rc::new(Recording::default());
            let apps = apps_with("app", app.clone());
            let running = spawn(event_loop(apps, &ServerConfig::default()).await);

            let mut first = Client::open(running.addr, "/app").await;
            let _second = Client::open(running.addr, "/app").await;

            first.send(OpCode::Text, b"x").await;
            first.recv().await;
            assert_eq!(app.sent.get(), 1);

            let pid = std::process::id();
            assert_eq!(*app.opened.borrow(), [(1, pid), (2, pid)]);

            running.shutdown().await;
            assert_eq!(app.closed.get(), 2);
        })
        .await;
}

/// Forwards every message to all members and to the other workers.
#[derive(Default)]
struct Room {
    members: RefCell<Vec<ConnectionId>>,
}

impl Room {
    fn broadcast(&self, payload: &Bytes, handle: &LoopHandle) {
        for &id in self.members.borrow().iter() {
            handle.send_to(id, Frame::new(OpCode::Text, payload.clone()));
        }
    }
}

impl Application for Room {
    fn on_open(&self, conn: &mut Connection, _: &LoopHandle) -> ApplicationResult {
        self.members.borrow_mut().push(conn.id());
        Ok(())
    }

    fn on_close(&self, conn: &Connection, _: &LoopHandle) -> ApplicationResult {
        self.members.borrow_mut().retain(|id| *id != conn.id());
        Ok(())
    }

    fn on_message(&self, _: &mut Connection, frame: &Frame, handle: &LoopHandle) -> ApplicationResult {
        self.broadcast(&frame.payload, handle);
        if let Err(e) = handle.relay(frame.payload.clone()) {
            assert!(matches!(e, r0n_ws::server::ApplicationError::RelayUnavailable));
        }
        Ok(())
    }
}

impl RelayListener for Room {
    fn on_relay(&self, data: &Bytes, handle: &LoopHandle) -> ApplicationResult {
        self.broadcast(data, handle);
        Ok(())
    }
}

#[tokio::test]
async fn test_send_to_reaches_other_connections() {
    LocalSet::new()
        .run_until(async {
            let room = Rc::new(Room::default());
            let apps = apps_with("room", room.clone());
            let running = spawn(event_loop(apps, &ServerConfig::default()).await);

            let mut alice = Client::open(running.addr, "/room").await;
            let mut bob = Client::open(running.addr, "/room").await;

            alice.send(OpCode::Text, b"hi all").await;
            assert_eq!(alice.recv().await.as_text(), Some("hi all"));
            assert_eq!(bob.recv().await.as_text(), Some("hi all"));

            running.shutdown().await;
        })
        .await;
}

#[tokio::test]
async fn test_relay_round_trip() {
    LocalSet::new()
        .run_until(async {
            let (worker_end, mut master_end) = relay_pair();
            let room = Rc::new(Room::default());
            let apps = apps_with("room", room.clone());
            let running = spawn(
                event_loop(apps, &ServerConfig::default())
                    .await
                    .with_relay(RelayChannel::new(worker_end))
                    .with_relay_listener(room.clone()),
            );

            let mut client = Client::open(running.addr, "/room").await;
            client.send(OpCode::Text, b"up").await;
            assert_eq!(client.recv().await.as_text(), Some("up"));

            let mut record = vec![0u8; MAX_RECORD_LEN];
            let n = tokio::time::timeout(TIMEOUT, master_end.read(&mut record))
                .await
                .unwrap()
                .unwrap();
            let Decoded::Complete { frame: published, length } =
                FrameDecoder::client().decode(&record[..n]).unwrap()
            else {
                panic!("relay record is not one whole frame");
            };
            assert_eq!(length, n);
            assert_eq!(published.opcode, OpCode::Binary);
            assert_eq!(published.payload.as_ref(), b"up");

            // a malformed record is dropped without stopping the worker
            master_end.write_all(b"\x07junk").await.unwrap();
            master_end
                .write_all(&encode(b"down", OpCode::Binary, false).unwrap())
                .await
                .unwrap();
            assert_eq!(client.recv().await.as_text(), Some("down"));

            running.shutdown().await;
        })
        .await;
}

#[tokio::test]
async fn test_master_gone_stops_loop() {
    LocalSet::new()
        .run_until(async {
            let (worker_end, master_end) = relay_pair();
            let running = spawn(
                event_loop(ApplicationRegistry::new(), &ServerConfig::default())
                    .await
                    .with_relay(RelayChannel::new(worker_end)),
            );

            drop(master_end);
            let result = tokio::time::timeout(TIMEOUT, running.task)
                .await
                .unwrap()
                .unwrap();
            assert!(matches!(
                result,
                Err(r0n_ws::server::ServerError::Ipc(r0n_ws::ipc::IpcError::MasterGone))
            ));
        })
        .await;
}

#[tokio::test]
async fn test_default_limit_rejects_huge_declared_length() {
    LocalSet::new()
        .run_until(async {
            let sink = Rc::new(Sink::default());
            let apps = apps_with("echo", Rc::new(Echo));
            let running = spawn(
                event_loop(apps, &ServerConfig::default())
                    .await
                    .with_error_sink(sink.clone()),
            );

            let mut client = Client::open(running.addr, "/echo").await;
            // binary frame declaring 2^40 payload bytes, masked
            let mut header = vec![0x82, 0xFF];
            header.extend_from_slice(&(1u64 << 40).to_be_bytes());
            header.extend_from_slice(&[1, 2, 3, 4]);
            client.write(&header).await;
            let _ = client.stream.write_all(&[0u8; 4096]).await;
            assert!(client.closed().await.is_empty());

            eventually(|| sink.errors.borrow().len() == 1).await;
            let errors = sink.errors.borrow();
            assert!(errors[0].contains("frame too large"), "{}", errors[0]);
            assert!(errors[0].contains(&format!("max {}", r0n_ws::config::DEFAULT_MAX_FRAME_SIZE)));
            drop(errors);

            running.shutdown().await;
        })
        .await;
}

#[tokio::test]
async fn test_oversized_frame_rejected() {
    LocalSet::new()
        .run_until(async {
            let mut config = ServerConfig::default();
            config.limits.max_frame_size = 4;
            let sink = Rc::new(Sink::default());
            let running = spawn(
                event_loop(ApplicationRegistry::new(), &config)
                    .await
                    .with_error_sink(sink.clone()),
            );

            let mut client = Client::open(running.addr, "/").await;
            client.send(OpCode::Binary, &[0u8; 10]).await;
            assert!(client.closed().await.is_empty());

            eventually(|| sink.errors.borrow().len() == 1).await;
            assert!(sink.errors.borrow()[0].contains("frame too large"));

            running.shutdown().await;
        })
        .await;
}

#[tokio::test]
async fn test_shutdown_closes_open_connections() {
    LocalSet::new()
        .run_until(async {
            let recorder = Rc::new(Recorder::default());
            let apps = apps_with("echo", Rc::new(Echo));
            let running = spawn(
                event_loop(apps, &ServerConfig::default())
                    .await
                    .with_observer(recorder.clone()),
            );

            let mut client = Client::open(running.addr, "/echo").await;
            running.shutdown().await;
            assert!(client.closed().await.is_empty());

            let names = recorder.names();
            assert_eq!(&names[names.len() - 3..], ["disconnect", "close", "shutdown"]);
        })
        .await;
}
