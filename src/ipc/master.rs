//! Master relay over the worker socket pairs.

use super::error::{IpcError, IpcResult};
use super::pair::MAX_RECORD_LEN;
use futures_util::stream::{FuturesUnordered, StreamExt};
use std::collections::BTreeMap;
use std::future::Future;
use tokio::io::AsyncWriteExt;
use tokio::net::UnixStream;
use tracing::{debug, info, warn};

/// Holds the master-side end of every worker pair and relays between them.
///
/// The master does not interpret relayed bytes: every record that arrives
/// from one worker is written verbatim, whole and in order to every other
/// worker, never back to the sender. The sockets are expected to come from
/// [`socket_pair`](super::socket_pair).
#[derive(Debug, Default)]
pub struct Master {
    /// Worker pid -> master-side socket.
    workers: BTreeMap<u32, UnixStream>,
}

impl Master {
    /// Create a master with no workers.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the master-side end of a worker's pair.
    pub fn add_worker(&mut self, pid: u32, stream: UnixStream) {
        self.workers.insert(pid, stream);
    }

    /// Pids of the registered workers.
    pub fn worker_pids(&self) -> impl Iterator<Item = u32> + '_ {
        self.workers.keys().copied()
    }

    /// Number of registered workers.
    #[must_use]
    pub fn worker_count(&self) -> usize {
        self.workers.len()
    }

    /// Relay until `shutdown` resolves.
    ///
    /// # Errors
    ///
    /// Returns [`IpcError::WorkerGone`] when a worker closes its end and
    /// [`IpcError::Io`] when a read or write fails. The master does not
    /// recover from either.
    pub async fn run<F>(&mut self, shutdown: F) -> IpcResult<()>
    where
        F: Future<Output = ()>,
    {
        tokio::pin!(shutdown);
        info!(workers = self.workers.len(), "master relay started");

        let mut buf = vec![0u8; MAX_RECORD_LEN];
        loop {
            let ready = {
                let mut waits: FuturesUnordered<_> = self
                    .workers
                    .iter()
                    .map(|(&pid, stream)| async move { (pid, stream.readable().await) })
                    .collect();

                tokio::select! {
                    () = &mut shutdown => None,
                    Some(ready) = waits.next(), if !waits.is_empty() => Some(ready),
                }
            };

            let Some((pid, readiness)) = ready else {
                info!("master relay stopping");
                return Ok(());
            };
            readiness?;

            let Some(stream) = self.workers.get(&pid) else {
                continue;
            };
            let n = match stream.try_read(&mut buf) {
                Ok(0) => {
                    warn!(pid, "worker closed its IPC channel");
                    return Err(IpcError::WorkerGone(pid));
                },
                Ok(n) => n,
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => continue,
                Err(e) => return Err(IpcError::Io(e)),
            };

            debug!(from = pid, bytes = n, "relaying record");
            self.broadcast(pid, &buf[..n]).await?;
        }
    }

    async fn broadcast(&mut self, origin: u32, data: &[u8]) -> IpcResult<()> {
        for (&pid, stream) in &mut self.workers {
            if pid == origin {
                continue;
            }
            stream.write_all(data).await?;
        }
        Ok(())
    }
}
