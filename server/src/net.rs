//! TCP+UDP transport on a single port.
//!
//! One accept loop, one reader and one writer task per connection, one
//! shared UDP socket. The transport tasks never touch relay state: they
//! decode frames and post [`RelayMessage`]s; the only things they touch in
//! place are the per-connection rate counter and idle flag, which are
//! atomics.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use roomlink_protocol::{
    decode_frame, discovery_response, length_prefix, ConnectionId, DisconnectReason, Frame,
    FrameBuffer,
};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, UdpSocket};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::config::Gate;
use crate::connection::{ConnectionHandle, ConnectionShared, Outbound, OUTBOUND_BUFFER};
use crate::rate::SPAM_WINDOW;
use crate::relay::RelayMessage;

/// How long a connection may stay silent before the relay reports it
/// idling to its room host.
const IDLE_TIMEOUT: Duration = Duration::from_secs(10);

const READ_BUFFER: usize = 8 * 1024;
const UDP_BUFFER: usize = 64 * 1024;

/// Bind both sockets and spawn the transport tasks. Returns the actual
/// local address (useful with port 0).
pub(crate) async fn bind(
    port: u16,
    gate: Arc<Gate>,
    tx: mpsc::Sender<RelayMessage>,
    cancel: CancellationToken,
) -> std::io::Result<SocketAddr> {
    let listener = TcpListener::bind(("0.0.0.0", port)).await?;
    let addr = listener.local_addr()?;
    let udp = Arc::new(UdpSocket::bind(("0.0.0.0", addr.port())).await?);

    tokio::spawn(accept_loop(
        listener,
        Arc::clone(&udp),
        gate,
        tx.clone(),
        cancel.clone(),
    ));
    tokio::spawn(udp_loop(udp, tx, cancel));

    Ok(addr)
}

async fn accept_loop(
    listener: TcpListener,
    udp: Arc<UdpSocket>,
    gate: Arc<Gate>,
    tx: mpsc::Sender<RelayMessage>,
    cancel: CancellationToken,
) {
    let mut next_id: u32 = 1;
    loop {
        let accepted = tokio::select! {
            _ = cancel.cancelled() => break,
            accepted = listener.accept() => accepted,
        };
        let (stream, peer) = match accepted {
            Ok(pair) => pair,
            Err(err) => {
                tracing::warn!(%err, "accept failed");
                continue;
            }
        };
        if gate.is_closed() || gate.is_blacklisted(&peer.ip()) {
            tracing::warn!(
                addr = %peer,
                "connection rejected: {}",
                if gate.is_closed() { "server closing" } else { "blacklisted address" }
            );
            continue; // dropping the stream closes it
        }
        stream.set_nodelay(true).ok();

        let id = ConnectionId(next_id);
        next_id = next_id.wrapping_add(1).max(1);

        let shared = Arc::new(ConnectionShared::default());
        let (out_tx, out_rx) = mpsc::channel(OUTBOUND_BUFFER);
        let kill = CancellationToken::new();
        let handle = ConnectionHandle::new(id, peer, Arc::clone(&shared), out_tx, kill.clone());

        let (read_half, write_half) = stream.into_split();
        tokio::spawn(writer_loop(write_half, out_rx, Arc::clone(&udp), kill.clone(), id));
        if tx.send(RelayMessage::Connected { handle }).await.is_err() {
            kill.cancel();
            break;
        }
        tokio::spawn(reader_loop(
            read_half,
            id,
            shared,
            Arc::clone(&gate),
            tx.clone(),
            kill,
        ));
    }
}

async fn reader_loop(
    mut read_half: OwnedReadHalf,
    id: ConnectionId,
    shared: Arc<ConnectionShared>,
    gate: Arc<Gate>,
    tx: mpsc::Sender<RelayMessage>,
    kill: CancellationToken,
) {
    let mut buf = [0u8; READ_BUFFER];
    let mut frames = FrameBuffer::new();
    let reason = 'read: loop {
        let read = tokio::select! {
            _ = kill.cancelled() => break 'read DisconnectReason::Closed,
            read = tokio::time::timeout(IDLE_TIMEOUT, read_half.read(&mut buf)) => read,
        };
        let n = match read {
            // No traffic for a while: report idling, once per quiet spell.
            Err(_elapsed) => {
                if shared.mark_idle_notified() && tx.send(RelayMessage::Idle { id }).await.is_err()
                {
                    break 'read DisconnectReason::Closed;
                }
                continue;
            }
            Ok(Ok(0)) => break 'read DisconnectReason::Closed,
            Ok(Ok(n)) => n,
            Ok(Err(_)) => break 'read DisconnectReason::Error,
        };
        shared.clear_idle_notified();

        let decoded: Vec<_> = frames.push(&buf[..n]).collect();
        for framed in decoded {
            let frame = match framed.and_then(|bytes| decode_frame(&bytes)) {
                Ok(frame) => frame,
                Err(err) => {
                    tracing::warn!(con = %id, %err, "malformed frame");
                    break 'read DisconnectReason::Error;
                }
            };
            let limit = gate.spam_limit();
            if limit > 0 && !shared.is_host() && !shared.packet_rate.allow(SPAM_WINDOW, limit) {
                // The dispatcher kicks; just stop forwarding this burst.
                let _ = tx.send(RelayMessage::RateLimited { id }).await;
                continue;
            }
            if tx
                .send(RelayMessage::Frame {
                    id,
                    frame,
                    reliable: true,
                })
                .await
                .is_err()
            {
                break 'read DisconnectReason::Closed;
            }
        }
    };
    let _ = tx.send(RelayMessage::Disconnected { id, reason }).await;
}

async fn writer_loop(
    mut write_half: OwnedWriteHalf,
    mut out_rx: mpsc::Receiver<Outbound>,
    udp: Arc<UdpSocket>,
    kill: CancellationToken,
    id: ConnectionId,
) {
    let mut udp_target: Option<SocketAddr> = None;
    loop {
        let item = tokio::select! {
            _ = kill.cancelled() => break,
            item = out_rx.recv() => item,
        };
        match item {
            None => break,
            Some(Outbound::Frame { bytes, reliable }) => {
                // Unreliable sends fall back to TCP until UDP is bound.
                if let (false, Some(target)) = (reliable, udp_target) {
                    let _ = udp.send_to(&bytes, target).await;
                } else if write_half.write_all(&length_prefix(&bytes)).await.is_err() {
                    break;
                }
            }
            Some(Outbound::BindUdp(addr)) => udp_target = Some(addr),
            Some(Outbound::Close(reason)) => {
                tracing::debug!(con = %id, ?reason, "closing connection");
                let _ = write_half.shutdown().await;
                break;
            }
        }
    }
}

async fn udp_loop(
    udp: Arc<UdpSocket>,
    tx: mpsc::Sender<RelayMessage>,
    cancel: CancellationToken,
) {
    let mut buf = [0u8; UDP_BUFFER];
    let discovery = discovery_response();
    loop {
        let received = tokio::select! {
            _ = cancel.cancelled() => break,
            received = udp.recv_from(&mut buf) => received,
        };
        let (n, addr) = match received {
            Ok(pair) => pair,
            // Transient (ICMP-driven) errors are expected on UDP.
            Err(err) => {
                tracing::debug!(%err, "udp receive error");
                continue;
            }
        };
        match decode_frame(&buf[..n]) {
            Ok(Frame::Discovery) => {
                let _ = udp.send_to(&discovery, addr).await;
            }
            Ok(Frame::UdpRegister { con_id }) => {
                if tx
                    .send(RelayMessage::UdpRegister { id: con_id, addr })
                    .await
                    .is_err()
                {
                    break;
                }
            }
            Ok(frame) => {
                if tx
                    .send(RelayMessage::UdpDatagram { addr, frame })
                    .await
                    .is_err()
                {
                    break;
                }
            }
            Err(err) => {
                tracing::debug!(%addr, %err, "undecodable datagram");
            }
        }
    }
}
