//! Inter-process plumbing between the master and its workers.
//!
//! Each worker is joined to the master by one `SOCK_SEQPACKET` pair. The
//! [`Master`] multiplexes the master-side ends and copies every record one
//! worker writes to every other worker; the [`RelayChannel`] is the
//! worker-side end that applications publish through.

mod error;
mod master;
mod pair;
mod relay;

pub use error::{IpcError, IpcResult};
pub use master::Master;
pub use pair::{socket_pair, MAX_RECORD_LEN};
pub use relay::RelayChannel;
