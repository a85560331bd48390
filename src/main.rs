//! r0n-ws binary entry point.
//!
//! Runs the server with two demo applications: an echo service on `/echo`
//! and a chat room on `/chat` whose messages reach clients on every worker.

use bytes::Bytes;
use r0n_ws::config::{ConfigLoader, ServerConfig};
use r0n_ws::logging;
use r0n_ws::server::{
    Application, ApplicationResult, Connection, ConnectionId, LoopHandle, RelayListener, Server,
};
use r0n_ws::websocket::{Frame, OpCode};
use std::cell::RefCell;
use std::collections::BTreeSet;
use std::process::ExitCode;
use std::rc::Rc;
use tracing::error;

/// Sends every data frame back to its sender.
struct Echo;

impl Application for Echo {
    fn on_message(&self, conn: &mut Connection, frame: &Frame, _: &LoopHandle) -> ApplicationResult {
        if frame.opcode.is_data() {
            conn.send(Frame::new(frame.opcode, frame.payload.clone()))?;
        }
        Ok(())
    }
}

/// Broadcasts text messages to every chat member on every worker.
#[derive(Default)]
struct Chat {
    members: RefCell<BTreeSet<ConnectionId>>,
}

impl Chat {
    fn broadcast(&self, text: &Bytes, handle: &LoopHandle) {
        for &id in self.members.borrow().iter() {
            handle.send_to(id, Frame::new(OpCode::Text, text.clone()));
        }
    }
}

impl Application for Chat {
    fn on_open(&self, conn: &mut Connection, _: &LoopHandle) -> ApplicationResult {
        self.members.borrow_mut().insert(conn.id());
        Ok(())
    }

    fn on_close(&self, conn: &Connection, _: &LoopHandle) -> ApplicationResult {
        self.members.borrow_mut().remove(&conn.id());
        Ok(())
    }

    fn on_message(&self, conn: &mut Connection, frame: &Frame, handle: &LoopHandle) -> ApplicationResult {
        let Some(text) = frame.as_text().filter(|_| frame.opcode.is_data()) else {
            return Ok(());
        };

        let line = Bytes::from(format!("user {} ({}): {text}", conn.id(), handle.process_id()));
        self.broadcast(&line, handle);
        handle.relay(line)
    }
}

impl RelayListener for Chat {
    fn on_relay(&self, data: &Bytes, handle: &LoopHandle) -> ApplicationResult {
        self.broadcast(data, handle);
        Ok(())
    }
}

fn load_config() -> Result<ServerConfig, r0n_ws::config::ConfigError> {
    match std::env::args_os().nth(1) {
        Some(path) => ConfigLoader::new().load(path),
        None => Ok(ServerConfig::default()),
    }
}

fn main() -> ExitCode {
    let config = match load_config() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("r0n-ws: {e}");
            return ExitCode::FAILURE;
        },
    };

    if let Err(e) = logging::init(&config.logging) {
        eprintln!("r0n-ws: {e}");
        return ExitCode::FAILURE;
    }

    let chat = Rc::new(Chat::default());
    let mut server = Server::new(config).with_relay_listener(chat.clone());
    server
        .register_application("/echo", Rc::new(Echo))
        .register_application("/chat", chat);

    match server.run() {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(error = %e, "server failed");
            ExitCode::FAILURE
        },
    }
}
