//! Worker-side end of the master relay.
//!
//! Each published message travels as one unmasked binary WebSocket frame in
//! one `SOCK_SEQPACKET` record. The master forwards records whole, so every
//! record a worker reads is exactly one message another worker published.

use super::error::{IpcError, IpcResult};
use super::pair::MAX_RECORD_LEN;
use crate::websocket::{encode_into, Decoded, FrameDecoder, OpCode};
use bytes::{Bytes, BytesMut};
use std::collections::VecDeque;
use std::io;
use tokio::io::Interest;
use tokio::net::UnixStream;
use tracing::warn;

/// A worker's connection to the master.
#[derive(Debug)]
pub struct RelayChannel {
    stream: UnixStream,
    /// Scratch space for one record.
    record: Box<[u8]>,
    inbox: VecDeque<Bytes>,
    outbox: VecDeque<Bytes>,
    decoder: FrameDecoder,
}

impl RelayChannel {
    /// Wrap the worker-side end of a pair made by
    /// [`socket_pair`](super::socket_pair).
    #[must_use]
    pub fn new(stream: UnixStream) -> Self {
        Self {
            stream,
            record: vec![0u8; MAX_RECORD_LEN].into_boxed_slice(),
            inbox: VecDeque::new(),
            outbox: VecDeque::new(),
            decoder: FrameDecoder::client(),
        }
    }

    /// Wrap a std socket inherited across `fork`.
    ///
    /// # Errors
    ///
    /// Fails if the socket cannot be made non-blocking or registered with the
    /// runtime.
    pub fn from_std(stream: std::os::unix::net::UnixStream) -> IpcResult<Self> {
        stream.set_nonblocking(true)?;
        Ok(Self::new(UnixStream::from_std(stream)?))
    }

    /// Queue a message for the other workers.
    ///
    /// # Errors
    ///
    /// Returns [`IpcError::MessageTooLarge`] if the framed message does not
    /// fit in one record.
    pub fn publish(&mut self, data: &[u8]) -> IpcResult<()> {
        let mut record = BytesMut::with_capacity(data.len() + 10);
        encode_into(&mut record, data, OpCode::Binary, None)?;
        if record.len() > MAX_RECORD_LEN {
            return Err(IpcError::MessageTooLarge {
                max: MAX_RECORD_LEN,
                actual: record.len(),
            });
        }
        self.outbox.push_back(record.freeze());
        Ok(())
    }

    /// Whether published messages are waiting to be written.
    #[must_use]
    pub fn has_pending_writes(&self) -> bool {
        !self.outbox.is_empty()
    }

    pub(crate) fn interest(&self) -> Interest {
        if self.has_pending_writes() {
            Interest::READABLE | Interest::WRITABLE
        } else {
            Interest::READABLE
        }
    }

    pub(crate) fn stream(&self) -> &UnixStream {
        &self.stream
    }

    /// Read every record the master has forwarded so far.
    ///
    /// Records that do not hold exactly one frame are logged and dropped.
    /// Returns the number of records read.
    pub(crate) fn read(&mut self) -> IpcResult<usize> {
        let mut records = 0;
        loop {
            let n = match self.stream.try_read(&mut self.record) {
                Ok(0) => return Err(IpcError::MasterGone),
                Ok(n) => n,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(records),
                Err(e) => return Err(IpcError::Io(e)),
            };
            records += 1;

            match self.decoder.decode(&self.record[..n]) {
                Ok(Decoded::Complete { frame, length }) if length == n => {
                    self.inbox.push_back(frame.payload);
                },
                Ok(Decoded::Complete { length, .. }) => {
                    warn!(bytes = n, frame = length, "dropping relay record with trailing bytes");
                },
                Ok(Decoded::Incomplete) => {
                    warn!(bytes = n, "dropping truncated relay record");
                },
                Err(e) => warn!(bytes = n, error = %e, "dropping malformed relay record"),
            }
        }
    }

    /// Next relayed message, in arrival order.
    pub(crate) fn next_message(&mut self) -> Option<Bytes> {
        self.inbox.pop_front()
    }

    /// Write queued records until the socket would block.
    pub(crate) fn flush(&mut self) -> IpcResult<()> {
        while let Some(record) = self.outbox.front() {
            match self.stream.try_write(record) {
                Ok(n) if n == record.len() => {
                    self.outbox.pop_front();
                },
                Ok(n) => {
                    return Err(IpcError::Io(io::Error::new(
                        io::ErrorKind::WriteZero,
                        format!("relay record cut short: {n} of {} bytes", record.len()),
                    )))
                },
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) => return Err(IpcError::Io(e)),
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ipc::socket_pair;
    use crate::websocket::encode;
    use tokio::io::AsyncWriteExt;

    fn pair() -> (UnixStream, UnixStream) {
        let (a, b) = socket_pair().unwrap();
        (UnixStream::from_std(a).unwrap(), UnixStream::from_std(b).unwrap())
    }

    async fn flush_all(channel: &mut RelayChannel) {
        while channel.has_pending_writes() {
            channel.stream().writable().await.unwrap();
            channel.flush().unwrap();
        }
    }

    async fn wait_for_message(channel: &mut RelayChannel) -> Bytes {
        loop {
            if let Some(message) = channel.next_message() {
                return message;
            }
            channel.stream().readable().await.unwrap();
            channel.read().unwrap();
        }
    }

    #[tokio::test]
    async fn test_publish_and_receive_preserves_boundaries() {
        let (a, b) = pair();
        let mut sender = RelayChannel::new(a);
        let mut receiver = RelayChannel::new(b);

        sender.publish(b"first").unwrap();
        sender.publish(b"").unwrap();
        sender.publish(&[7u8; 300]).unwrap();
        assert!(sender.has_pending_writes());
        assert!(sender.interest().is_writable());

        flush_all(&mut sender).await;
        assert!(!sender.has_pending_writes());

        assert_eq!(wait_for_message(&mut receiver).await.as_ref(), b"first");
        assert!(wait_for_message(&mut receiver).await.is_empty());
        assert_eq!(wait_for_message(&mut receiver).await.as_ref(), &[7u8; 300][..]);
    }

    #[tokio::test]
    async fn test_malformed_records_are_dropped() {
        let (mut raw, b) = pair();
        let mut receiver = RelayChannel::new(b);

        let frame = encode(&[5u8; 300], OpCode::Binary, false).unwrap();
        let (head, tail) = frame.split_at(150);
        raw.write_all(head).await.unwrap();
        raw.write_all(&encode(b"whole", OpCode::Binary, false).unwrap()).await.unwrap();
        raw.write_all(tail).await.unwrap();
        raw.write_all(&encode(b"after", OpCode::Binary, false).unwrap()).await.unwrap();

        assert_eq!(wait_for_message(&mut receiver).await.as_ref(), b"whole");
        assert_eq!(wait_for_message(&mut receiver).await.as_ref(), b"after");
        assert!(receiver.next_message().is_none());
    }

    #[tokio::test]
    async fn test_publish_rejects_oversized_message() {
        let (a, _b) = pair();
        let mut sender = RelayChannel::new(a);

        let result = sender.publish(&vec![0u8; MAX_RECORD_LEN]);
        assert!(matches!(result, Err(IpcError::MessageTooLarge { .. })));
        assert!(!sender.has_pending_writes());
    }

    #[tokio::test]
    async fn test_peer_close_is_master_gone() {
        let (a, b) = pair();
        let mut channel = RelayChannel::new(a);
        drop(b);

        channel.stream().readable().await.unwrap();
        assert!(matches!(channel.read(), Err(IpcError::MasterGone)));
    }
}
