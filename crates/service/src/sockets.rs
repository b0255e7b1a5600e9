//! Socket plumbing: accept loops and per-connection byte shuttles.
//!
//! Reader tasks decode complete frames off their inbound queue and forward
//! them to the dispatcher; writer tasks drain the per-connection outbound
//! queue. Dropping a connection's writer sender shuts the stream down,
//! which clients observe as the invalidation signal.

use crate::dispatcher::{ConnId, Event, SocketKind};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::unix::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::UnixListener;
use tokio::sync::{mpsc, Notify};
use tracing::{debug, warn};
use wire::{BinaryQueue, Message};

const READ_CHUNK: usize = 4096;

static NEXT_CONN_ID: AtomicU64 = AtomicU64::new(1);

pub(crate) async fn accept_loop(
    listener: UnixListener,
    kind: SocketKind,
    events: mpsc::UnboundedSender<Event>,
) {
    loop {
        match listener.accept().await {
            Ok((stream, _)) => {
                let conn = NEXT_CONN_ID.fetch_add(1, Ordering::Relaxed);
                let (read_half, write_half) = stream.into_split();
                let (writer_tx, writer_rx) = mpsc::unbounded_channel();
                let close = Arc::new(Notify::new());
                // Announce before the reader can emit its first frame.
                if events
                    .send(Event::Connected { conn, kind, writer: writer_tx, close: close.clone() })
                    .is_err()
                {
                    return;
                }
                tokio::spawn(write_loop(write_half, writer_rx));
                tokio::spawn(read_loop(conn, read_half, events.clone(), close));
            }
            Err(e) => warn!(error = %e, "accept failed"),
        }
    }
}

async fn read_loop(
    conn: ConnId,
    mut stream: OwnedReadHalf,
    events: mpsc::UnboundedSender<Event>,
    close: Arc<Notify>,
) {
    let mut inbound = BinaryQueue::new();
    let mut buf = [0u8; READ_CHUNK];
    loop {
        loop {
            match Message::decode(&mut inbound) {
                Ok(Some((sequence, message))) => {
                    if events.send(Event::Frame { conn, sequence, message }).is_err() {
                        return;
                    }
                }
                Ok(None) => break,
                Err(error) => {
                    let _ = events.send(Event::ProtocolError { conn, error });
                    return;
                }
            }
        }
        tokio::select! {
            _ = close.notified() => return,
            read = stream.read(&mut buf) => match read {
                Ok(0) => {
                    let _ = events.send(Event::Disconnected { conn });
                    return;
                }
                Ok(n) => inbound.append(&buf[..n]),
                Err(e) => {
                    debug!(conn, error = %e, "read failed");
                    let _ = events.send(Event::Disconnected { conn });
                    return;
                }
            },
        }
    }
}

async fn write_loop(mut stream: OwnedWriteHalf, mut frames: mpsc::UnboundedReceiver<Vec<u8>>) {
    while let Some(bytes) = frames.recv().await {
        if stream.write_all(&bytes).await.is_err() {
            break;
        }
    }
    let _ = stream.shutdown().await;
}
