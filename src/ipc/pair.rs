//! Record-preserving socket pairs between the master and a worker.
//!
//! Pairs are `SOCK_SEQPACKET`: every write is delivered as one record and
//! every read returns at most one record, so relay messages from different
//! workers can never interleave on the way through the master.

use super::error::{IpcError, IpcResult};
use nix::sys::socket::{socketpair, AddressFamily, SockFlag, SockType};
use std::os::unix::net::UnixStream;

/// Largest record a relay pair carries, header included.
///
/// Kept below the default Unix socket send buffer so a record always fits in
/// one write.
pub const MAX_RECORD_LEN: usize = 64 * 1024;

/// Create a non-blocking, close-on-exec `SOCK_SEQPACKET` pair.
///
/// # Errors
///
/// Returns [`IpcError::Io`] if the kernel refuses the pair.
pub fn socket_pair() -> IpcResult<(UnixStream, UnixStream)> {
    let (a, b) = socketpair(
        AddressFamily::Unix,
        SockType::SeqPacket,
        None,
        SockFlag::SOCK_NONBLOCK | SockFlag::SOCK_CLOEXEC,
    )
    .map_err(|errno| IpcError::Io(errno.into()))?;
    Ok((UnixStream::from(a), UnixStream::from(b)))
}
