//! Process launcher: binds the listener, forks the workers and runs the
//! master.

use super::application::{Application, ApplicationRegistry, RelayListener};
use super::error::{ServerError, ServerResult};
use super::event_loop::EventLoop;
use super::events::LifecycleObserver;
use crate::config::ServerConfig;
use crate::ipc::{socket_pair, Master, RelayChannel};
use nix::errno::Errno;
use nix::sys::signal::{kill, Signal};
use nix::sys::wait::waitpid;
use nix::unistd::{fork, ForkResult, Pid};
use std::future::Future;
use std::io;
use std::os::unix::net::UnixStream as StdUnixStream;
use std::rc::Rc;
use tokio::net::{TcpListener, UnixStream};
use tokio::signal::unix::{signal, SignalKind};
use tracing::{debug, error, info, warn};

/// Outcome of one `fork`.
enum Forked {
    /// Running in the new worker; holds its end of the pair.
    Child(StdUnixStream),
    /// Running in the master; holds the worker's pid and the master's end.
    Parent(Pid, StdUnixStream),
}

/// A multi-process WebSocket server.
///
/// Applications are registered before [`run`](Self::run); every worker gets
/// its own copy of the registry through `fork`.
pub struct Server {
    config: ServerConfig,
    apps: ApplicationRegistry,
    relay_listener: Option<Rc<dyn RelayListener>>,
    observer: Option<Rc<dyn LifecycleObserver>>,
}

impl std::fmt::Debug for Server {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Server")
            .field("config", &self.config)
            .field("apps", &self.apps)
            .finish_non_exhaustive()
    }
}

impl Server {
    /// Create a server from its configuration.
    #[must_use]
    pub fn new(config: ServerConfig) -> Self {
        Self {
            config,
            apps: ApplicationRegistry::new(),
            relay_listener: None,
            observer: None,
        }
    }

    /// Route connections for `path` to `app`, after any application already
    /// registered for it.
    pub fn register_application(&mut self, path: &str, app: Rc<dyn Application>) -> &mut Self {
        self.apps.register(path, app);
        self
    }

    /// Receive messages relayed from other workers.
    #[must_use]
    pub fn with_relay_listener(mut self, listener: Rc<dyn RelayListener>) -> Self {
        self.relay_listener = Some(listener);
        self
    }

    /// Observe lifecycle events in every worker.
    #[must_use]
    pub fn with_observer(mut self, observer: Rc<dyn LifecycleObserver>) -> Self {
        self.observer = Some(observer);
        self
    }

    /// The server configuration.
    #[must_use]
    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// Registered applications.
    #[must_use]
    pub fn applications(&self) -> &ApplicationRegistry {
        &self.apps
    }

    /// Bind the non-blocking listening socket shared by all workers.
    ///
    /// # Errors
    ///
    /// Returns [`ServerError::Bind`] if the address cannot be bound.
    pub fn bind(&self) -> ServerResult<std::net::TcpListener> {
        let addr = self.config.bind_address();
        let listener = std::net::TcpListener::bind(&addr)
            .and_then(|listener| {
                listener.set_nonblocking(true)?;
                Ok(listener)
            })
            .map_err(|source| ServerError::Bind { addr, source })?;
        Ok(listener)
    }

    /// Bind, fork the workers and run the master until a signal or a worker
    /// failure.
    ///
    /// Must be called before any runtime or thread exists in the process.
    /// Returns in the master after the workers have been stopped and reaped,
    /// and in each worker when its event loop stops.
    ///
    /// # Errors
    ///
    /// Configuration, bind, fork and IPC failures are fatal and returned.
    pub fn run(self) -> ServerResult {
        self.config.validate()?;
        let listener = self.bind()?;
        info!(
            addr = %listener.local_addr()?,
            workers = self.config.server.workers,
            "listening"
        );

        let mut workers = Vec::with_capacity(self.config.server.workers);
        for index in 0..self.config.server.workers {
            match fork_worker() {
                Ok(Forked::Child(channel)) => {
                    drop(workers);
                    return self.run_worker(listener, channel);
                },
                Ok(Forked::Parent(pid, channel)) => {
                    debug!(pid = pid.as_raw(), index, "worker started");
                    workers.push((pid, channel));
                },
                Err(e) => {
                    let pids: Vec<Pid> = workers.iter().map(|(pid, _)| *pid).collect();
                    terminate_workers(&pids);
                    return Err(e);
                },
            }
        }

        drop(listener);
        self.run_master(workers)
    }

    fn run_worker(self, listener: std::net::TcpListener, channel: StdUnixStream) -> ServerResult {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()?;

        let Self {
            config,
            apps,
            relay_listener,
            observer,
        } = self;

        runtime.block_on(async move {
            let listener = TcpListener::from_std(listener)?;
            let relay = RelayChannel::from_std(channel)?;

            let mut event_loop = EventLoop::new(listener, apps, &config).with_relay(relay);
            if let Some(listener) = relay_listener {
                event_loop = event_loop.with_relay_listener(listener);
            }
            if let Some(observer) = observer {
                event_loop = event_loop.with_observer(observer);
            }

            let result = event_loop.run(shutdown_signal()?).await;
            if let Err(e) = &result {
                error!(pid = std::process::id(), error = %e, "worker stopped");
            }
            result
        })
    }

    fn run_master(&self, workers: Vec<(Pid, StdUnixStream)>) -> ServerResult {
        let pids: Vec<Pid> = workers.iter().map(|(pid, _)| *pid).collect();

        let result = self.write_pid_file().and_then(|()| relay(workers));
        if let Err(e) = &result {
            error!(error = %e, "master stopped");
        }

        terminate_workers(&pids);
        self.remove_pid_file();
        result
    }

    fn write_pid_file(&self) -> ServerResult {
        if let Some(path) = &self.config.server.pid_file {
            std::fs::write(path, format!("{}\n", std::process::id()))?;
            debug!(path = %path.display(), "wrote pid file");
        }
        Ok(())
    }

    fn remove_pid_file(&self) {
        if let Some(path) = &self.config.server.pid_file {
            if let Err(e) = std::fs::remove_file(path) {
                warn!(path = %path.display(), error = %e, "failed to remove pid file");
            }
        }
    }
}

fn fork_worker() -> ServerResult<Forked> {
    let (master_end, worker_end) = socket_pair()?;

    // SAFETY: no runtime or helper thread exists yet in this process; the
    // child only builds its own runtime after the fork.
    match unsafe { fork() }.map_err(ServerError::Fork)? {
        ForkResult::Child => {
            drop(master_end);
            Ok(Forked::Child(worker_end))
        },
        ForkResult::Parent { child } => {
            drop(worker_end);
            Ok(Forked::Parent(child, master_end))
        },
    }
}

/// Run the master relay over the workers' pairs until a signal arrives or a
/// worker goes away.
fn relay(workers: Vec<(Pid, StdUnixStream)>) -> ServerResult {
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;

    runtime.block_on(async move {
        let mut master = Master::new();
        for (pid, channel) in workers {
            channel.set_nonblocking(true)?;
            master.add_worker(pid.as_raw().unsigned_abs(), UnixStream::from_std(channel)?);
        }
        master.run(shutdown_signal()?).await?;
        Ok::<(), ServerError>(())
    })
}

/// SIGTERM every worker, then reap them.
fn terminate_workers(pids: &[Pid]) {
    for &pid in pids {
        match kill(pid, Signal::SIGTERM) {
            Ok(()) | Err(Errno::ESRCH) => {},
            Err(e) => warn!(pid = pid.as_raw(), error = %e, "failed to signal worker"),
        }
    }
    for &pid in pids {
        match waitpid(pid, None) {
            Ok(status) => debug!(pid = pid.as_raw(), status = ?status, "worker reaped"),
            Err(e) => warn!(pid = pid.as_raw(), error = %e, "failed to reap worker"),
        }
    }
    info!(workers = pids.len(), "workers stopped");
}

/// Resolves on SIGINT or SIGTERM. Must be called inside a runtime.
fn shutdown_signal() -> io::Result<impl Future<Output = ()>> {
    let mut terminate = signal(SignalKind::terminate())?;
    let mut interrupt = signal(SignalKind::interrupt())?;

    Ok(async move {
        tokio::select! {
            _ = terminate.recv() => info!("received SIGTERM"),
            _ = interrupt.recv() => info!("received SIGINT"),
        }
    })
}
