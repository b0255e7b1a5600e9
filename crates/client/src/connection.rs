//! Framed connection to the daemon with bounded reconnect backoff.

use crate::ClientError;
use std::path::{Path, PathBuf};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::UnixStream;
use tokio::time::{sleep, Duration};
use tracing::debug;
use wire::{BinaryQueue, Message, SequenceNumber};

const CONNECT_ATTEMPTS: u32 = 5;
const CONNECT_BACKOFF_START: Duration = Duration::from_millis(10);
const READ_CHUNK: usize = 4096;

pub(crate) struct Connection {
    path: PathBuf,
    stream: UnixStream,
    inbound: BinaryQueue,
    next_sequence: SequenceNumber,
}

impl Connection {
    /// Connect with a bounded retry and exponential backoff.
    pub(crate) async fn connect(path: &Path) -> Result<Self, ClientError> {
        let mut delay = CONNECT_BACKOFF_START;
        let mut last_err: Option<std::io::Error> = None;
        for attempt in 0..CONNECT_ATTEMPTS {
            match UnixStream::connect(path).await {
                Ok(stream) => {
                    return Ok(Self {
                        path: path.to_owned(),
                        stream,
                        inbound: BinaryQueue::new(),
                        next_sequence: 0,
                    })
                }
                Err(e) => {
                    debug!(path = %path.display(), attempt, error = %e, "connect failed");
                    last_err = Some(e);
                    if attempt + 1 < CONNECT_ATTEMPTS {
                        sleep(delay).await;
                        delay *= 2;
                    }
                }
            }
        }
        Err(last_err.map(ClientError::Io).unwrap_or(ClientError::Disconnected))
    }

    pub(crate) fn path(&self) -> &Path {
        &self.path
    }

    /// Non-blocking probe for a server-initiated close. Bytes that arrived
    /// in the meantime are kept for the next `receive`.
    pub(crate) fn poll_disconnect(&mut self) -> bool {
        let mut buf = [0u8; 1024];
        loop {
            match self.stream.try_read(&mut buf) {
                Ok(0) => return true,
                Ok(n) => self.inbound.append(&buf[..n]),
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => return false,
                Err(_) => return true,
            }
        }
    }

    pub(crate) fn allocate_sequence(&mut self) -> SequenceNumber {
        let seq = self.next_sequence;
        self.next_sequence = self.next_sequence.wrapping_add(1);
        seq
    }

    pub(crate) async fn send(
        &mut self,
        message: &Message,
        sequence: SequenceNumber,
    ) -> Result<(), ClientError> {
        self.stream.write_all(&message.encode(sequence)).await?;
        Ok(())
    }

    /// Receive the next complete frame.
    pub(crate) async fn receive(&mut self) -> Result<(SequenceNumber, Message), ClientError> {
        loop {
            if let Some((sequence, message)) = Message::decode(&mut self.inbound)? {
                return Ok((sequence, message));
            }
            let mut buf = [0u8; READ_CHUNK];
            let n = self.stream.read(&mut buf).await?;
            if n == 0 {
                return Err(ClientError::Disconnected);
            }
            self.inbound.append(&buf[..n]);
        }
    }

    /// Send `message` under a fresh sequence number and wait for the frame
    /// echoing it back.
    pub(crate) async fn round_trip(
        &mut self,
        message: &Message,
    ) -> Result<Message, ClientError> {
        let sequence = self.allocate_sequence();
        self.send(message, sequence).await?;
        loop {
            let (got, response) = self.receive().await?;
            if got == sequence {
                return Ok(response);
            }
            // A response to an older, abandoned exchange; skip it.
            debug!(sequence = got, "discarding out-of-sequence frame");
        }
    }
}
