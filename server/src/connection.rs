//! Logical view of a connected peer.
//!
//! The dispatcher and rooms only ever see a [`ConnectionHandle`]; the
//! actual socket lives in the transport tasks, fed through a bounded
//! outbound queue. Because the queue is drained in order by the writer
//! task, a queued close flushes everything sent before it.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use roomlink_protocol::{
    encode_frame, ControlPacket, ConnectionId, DisconnectReason, Frame, PreparedStream,
};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Outbound queue capacity per connection.
pub(crate) const OUTBOUND_BUFFER: usize = 256;

/// State shared between the transport tasks and the dispatcher.
///
/// Everything here is touched from both sides, so it is all atomics; being
/// off by one packet is harmless.
#[derive(Debug, Default)]
pub struct ConnectionShared {
    /// Per-connection packet counter for the spam gate.
    pub packet_rate: crate::rate::Ratekeeper,
    idle_notified: AtomicBool,
    is_host: AtomicBool,
}

impl ConnectionShared {
    /// Mark the idle state as notified; returns true when it was not
    /// already, i.e. when a notification should actually go out.
    pub fn mark_idle_notified(&self) -> bool {
        !self.idle_notified.swap(true, Ordering::Relaxed)
    }

    pub fn clear_idle_notified(&self) {
        self.idle_notified.store(false, Ordering::Relaxed);
    }

    pub fn is_host(&self) -> bool {
        self.is_host.load(Ordering::Relaxed)
    }

    pub fn set_host(&self, host: bool) {
        self.is_host.store(host, Ordering::Relaxed);
    }
}

/// One item of the outbound queue.
#[derive(Debug)]
pub(crate) enum Outbound {
    /// Encoded frame bytes, ready for the wire.
    Frame { bytes: Vec<u8>, reliable: bool },
    /// Route unreliable sends to this UDP address from now on.
    BindUdp(SocketAddr),
    /// Flush everything queued before this, then drop the socket.
    Close(DisconnectReason),
}

/// Cloneable handle to a connected peer.
#[derive(Debug, Clone)]
pub struct ConnectionHandle {
    pub id: ConnectionId,
    pub addr: SocketAddr,
    shared: Arc<ConnectionShared>,
    outbound: mpsc::Sender<Outbound>,
    kill: CancellationToken,
}

impl ConnectionHandle {
    pub(crate) fn new(
        id: ConnectionId,
        addr: SocketAddr,
        shared: Arc<ConnectionShared>,
        outbound: mpsc::Sender<Outbound>,
        kill: CancellationToken,
    ) -> Self {
        Self {
            id,
            addr,
            shared,
            outbound,
            kill,
        }
    }

    pub(crate) fn shared(&self) -> &Arc<ConnectionShared> {
        &self.shared
    }

    pub fn is_connected(&self) -> bool {
        !self.outbound.is_closed() && !self.kill.is_cancelled()
    }

    /// Send a control packet reliably.
    pub fn send(&self, packet: &ControlPacket) {
        self.send_frame(&Frame::Control(packet.clone()), true);
    }

    /// Send a control packet with the given reliability.
    pub fn send_with(&self, packet: &ControlPacket, reliable: bool) {
        self.send_frame(&Frame::Control(packet.clone()), reliable);
    }

    /// Send an opaque payload with the given reliability.
    pub fn send_raw(&self, data: Vec<u8>, reliable: bool) {
        self.send_frame(&Frame::Raw(data), reliable);
    }

    /// Send a prepared stream, head first.
    pub fn send_stream(&self, stream: &PreparedStream) {
        for frame in stream.frames() {
            self.send_frame(&frame, true);
        }
    }

    pub(crate) fn send_frame(&self, frame: &Frame, reliable: bool) {
        let bytes = match encode_frame(frame) {
            Ok(bytes) => bytes,
            Err(err) => {
                tracing::warn!(con = %self.id, %err, "dropping unencodable frame");
                return;
            }
        };
        // Anything this big must go through the stream layer; the peer
        // would reject the frame anyway.
        if bytes.len() > roomlink_protocol::MAX_FRAME_LEN {
            tracing::warn!(con = %self.id, len = bytes.len(), "dropping oversized frame");
            return;
        }
        match self.outbound.try_send(Outbound::Frame { bytes, reliable }) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(_)) => {
                // A peer that cannot drain its queue is dead weight.
                tracing::warn!(con = %self.id, "outbound queue full, dropping peer");
                self.kill.cancel();
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {}
        }
    }

    /// Route unreliable traffic for this peer to `addr`.
    pub(crate) fn bind_udp(&self, addr: SocketAddr) {
        let _ = self.outbound.try_send(Outbound::BindUdp(addr));
    }

    /// Close after flushing queued sends.
    pub fn close(&self, reason: DisconnectReason) {
        if self.outbound.try_send(Outbound::Close(reason)).is_err() {
            self.kill.cancel();
        }
    }

    /// Drop the socket without flushing.
    pub fn kill(&self) {
        self.kill.cancel();
    }

    #[cfg(test)]
    pub(crate) fn for_tests(id: u32, addr: SocketAddr) -> (Self, mpsc::Receiver<Outbound>) {
        let (tx, rx) = mpsc::channel(OUTBOUND_BUFFER);
        let handle = Self::new(
            ConnectionId(id),
            addr,
            Arc::new(ConnectionShared::default()),
            tx,
            CancellationToken::new(),
        );
        (handle, rx)
    }
}
