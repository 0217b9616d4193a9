pub mod listener;
pub mod packet;

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{bail, Result};
use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::sync::mpsc;

use crate::config::ServerConfig;

pub use packet::{Action, Family, Packet, PacketBuilder, PacketError, PacketReader};

/// First byte of every frame.
pub const FRAME_MARKER: u8 = 0xAA;

/// Listener-assigned connection number, unique for the life of the process.
pub type ConnectionId = u32;

/// Read one 0xAA-framed packet from `stream`.
/// Returns the full buffer including the 3-byte header.
pub async fn read_framed_packet<R>(stream: &mut R) -> Result<Vec<u8>>
where
    R: AsyncRead + Unpin,
{
    let mut header = [0u8; 3];
    stream.read_exact(&mut header).await?;
    if header[0] != FRAME_MARKER {
        bail!("expected 0xAA header, got {:02X}", header[0]);
    }
    let payload_len = u16::from_be_bytes([header[1], header[2]]) as usize;
    let total = payload_len + 3;
    let mut buf = vec![0u8; total];
    buf[..3].copy_from_slice(&header);
    stream.read_exact(&mut buf[3..]).await?;
    Ok(buf)
}

/// Outbound half of a connection, held by the game thread.
///
/// Frames go to the connection's writer task. Dropping every clone of the
/// link closes the connection once queued frames are flushed.
#[derive(Debug, Clone)]
pub struct ClientLink {
    id: ConnectionId,
    tx: mpsc::UnboundedSender<Bytes>,
}

impl ClientLink {
    pub fn new(id: ConnectionId, tx: mpsc::UnboundedSender<Bytes>) -> Self {
        Self { id, tx }
    }

    /// A link plus the receiver its writer task drains.
    pub fn channel(id: ConnectionId) -> (Self, mpsc::UnboundedReceiver<Bytes>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self::new(id, tx), rx)
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// Queue a packet. Returns false when the connection is already gone.
    pub fn send(&self, packet: &PacketBuilder) -> bool {
        tracing::trace!(
            "[net] [packet_out] conn={} {}/{} len={}",
            self.id,
            packet.family(),
            packet.action(),
            packet.len()
        );
        self.send_frame(packet.finish())
    }

    pub fn send_frame(&self, frame: Bytes) -> bool {
        self.tx.send(frame).is_ok()
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// Events flowing from I/O tasks (and signal handlers) into the game loop.
#[derive(Debug)]
pub enum Inbound {
    Connected {
        id: ConnectionId,
        addr: SocketAddr,
        link: ClientLink,
    },
    Message {
        id: ConnectionId,
        packet: Packet,
    },
    Disconnected {
        id: ConnectionId,
    },
    Rehash(Arc<ServerConfig>),
}
