//! TCP accept loop and per-connection I/O tasks.
//!
//! Each connection gets a reader loop (decode frames, forward them to the
//! game loop) and a writer task (drain the `ClientLink` queue). Neither task
//! touches game state; everything goes through [`Inbound`].

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use bytes::Bytes;
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, OwnedSemaphorePermit, Semaphore};

use super::{read_framed_packet, ClientLink, ConnectionId, Inbound, Packet};
use crate::core::{shutdown_requested, SharedServerState};

/// How often the accept loop re-checks the shutdown flag.
const ACCEPT_POLL: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, Copy)]
pub struct ListenerOptions {
    pub max_connections: usize,
    pub idle_timeout: Duration,
}

/// Accept connections until shutdown is requested.
pub async fn run_listener(
    listener: TcpListener,
    options: ListenerOptions,
    inbound: mpsc::UnboundedSender<Inbound>,
    state: SharedServerState,
) -> Result<()> {
    let slots = Arc::new(Semaphore::new(options.max_connections));
    let mut next_id: ConnectionId = 1;

    tracing::info!("[net] Listening on {}", listener.local_addr()?);

    loop {
        if shutdown_requested(&state) || inbound.is_closed() {
            tracing::info!("[net] Shutdown requested");
            break;
        }

        match tokio::time::timeout(ACCEPT_POLL, listener.accept()).await {
            Ok(Ok((socket, addr))) => {
                let Ok(permit) = Arc::clone(&slots).try_acquire_owned() else {
                    tracing::warn!("[net] [refused] {} (connection limit {})", addr, options.max_connections);
                    continue;
                };
                let id = next_id;
                next_id = next_id.checked_add(1).unwrap_or(1);
                tracing::debug!("[net] New connection from {} conn={}", addr, id);
                tokio::spawn(handle_connection(
                    socket,
                    addr,
                    id,
                    inbound.clone(),
                    options.idle_timeout,
                    permit,
                ));
            }
            Ok(Err(e)) => {
                tracing::error!("[net] Accept error: {}", e);
            }
            Err(_) => continue,
        }
    }

    Ok(())
}

async fn handle_connection(
    socket: TcpStream,
    addr: SocketAddr,
    id: ConnectionId,
    inbound: mpsc::UnboundedSender<Inbound>,
    idle_timeout: Duration,
    _permit: OwnedSemaphorePermit,
) {
    let _ = socket.set_nodelay(true);
    let (link, rx) = ClientLink::channel(id);
    if inbound.send(Inbound::Connected { id, addr, link }).is_err() {
        return;
    }

    let (mut read_half, write_half) = socket.into_split();
    let mut writer = tokio::spawn(write_loop(write_half, rx));

    loop {
        tokio::select! {
            read = tokio::time::timeout(idle_timeout, read_framed_packet(&mut read_half)) => {
                match read {
                    Ok(Ok(frame)) => match Packet::decode(&frame) {
                        Ok(packet) => {
                            tracing::trace!(
                                "[net] [packet_in] conn={} family={} action={} len={}",
                                id, packet.family, packet.action, packet.body.len()
                            );
                            if inbound.send(Inbound::Message { id, packet }).is_err() {
                                break;
                            }
                        }
                        Err(e) => tracing::trace!("[net] conn={} dropped frame: {}", id, e),
                    },
                    Ok(Err(e)) => {
                        tracing::debug!("[net] conn={} closed: {}", id, e);
                        break;
                    }
                    Err(_) => {
                        tracing::warn!("[net] conn={} timeout (idle {}s)", id, idle_timeout.as_secs());
                        break;
                    }
                }
            }
            _ = &mut writer => {
                tracing::debug!("[net] conn={} closed by server", id);
                break;
            }
        }
    }

    let _ = inbound.send(Inbound::Disconnected { id });
    tracing::info!("[net] Closed: conn={} addr={}", id, addr);
}

/// Drain queued frames until every `ClientLink` clone is dropped.
async fn write_loop(
    mut write_half: tokio::net::tcp::OwnedWriteHalf,
    mut rx: mpsc::UnboundedReceiver<Bytes>,
) {
    while let Some(frame) = rx.recv().await {
        if write_half.write_all(&frame).await.is_err() {
            break;
        }
    }
    let _ = write_half.shutdown().await;
}
