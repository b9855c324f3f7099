//! Per-socket connection state.
//!
//! Each accepted socket gets a [`Connection`] plus three tasks: a receive
//! loop feeding the per-client message queue, a send loop draining the
//! bounded outbound queue, and a health monitor enforcing the idle and
//! handshake deadlines. The connection itself holds no socket half; the
//! tasks own those, so unit tests can drive a `Connection` without any
//! I/O.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Context as _;
use bytes::{Bytes, BytesMut};
use parking_lot::Mutex;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};
use tq_crypto::{DhExchange, TqCipher, BOOTSTRAP_KEY};
use tq_protocol::{CodecError, FrameDecoder, Packet};

use crate::dispatcher::ClientMessage;
use crate::limit::{FloodWindow, TokenBucket, TypeDiversity};
use crate::server::SessionCallbacks;
use crate::NetworkConfig;

/// Frames processed per receive-loop wake-up before yielding, so one
/// chatty client cannot starve the rest.
const MAX_FRAMES_PER_WAKE: usize = 10;

/// Receive scratch buffer size.
const RECV_BUF_SIZE: usize = 8192;

/// Socket send/receive buffer size.
const SOCKET_BUF_SIZE: usize = 8192;

/// Consecutive non-fatal decode errors tolerated before disconnecting.
const MAX_CONSECUTIVE_ERRORS: u32 = 5;

/// Write retries on transient socket errors.
const MAX_WRITE_RETRIES: u32 = 3;

/// Lifecycle of a connection. Transitions only move forward, except that
/// every state may fall to `Disconnected`, which is terminal.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Debug)]
pub enum ConnectionState {
    Connecting,
    WaitingForDummyPacket,
    DhKeyExchange,
    Connected,
    Disconnected,
}

/// One live client connection.
pub struct Connection {
    client_id: u64,
    remote_addr: SocketAddr,
    connected_at: Instant,
    state: Mutex<ConnectionState>,
    cipher: Mutex<TqCipher>,
    dh: Mutex<Option<DhExchange>>,
    outgoing_tx: flume::Sender<Bytes>,
    cancel: CancellationToken,
    last_activity: Mutex<Instant>,
    handshake_started: Mutex<Option<Instant>>,
    packet_limiter: TokenBucket,
    byte_limiter: TokenBucket,
    flood: FloodWindow,
    diversity: TypeDiversity,
    consecutive_errors: AtomicU32,
    /// Object id of the attached player entity; zero until login.
    player_id: AtomicU32,
    packets_sent: AtomicU64,
    bytes_sent: AtomicU64,
    packets_received: AtomicU64,
    bytes_received: AtomicU64,
    disconnect_reason: Mutex<Option<String>>,
}

impl Connection {
    /// Creates the connection state for an accepted socket and queues the
    /// opening key-exchange packet, encrypted under the bootstrap key.
    /// Returns the receiver the send loop drains.
    pub fn accept(
        client_id: u64,
        remote_addr: SocketAddr,
        cancel: CancellationToken,
        config: &NetworkConfig,
    ) -> (Arc<Self>, flume::Receiver<Bytes>) {
        let (outgoing_tx, outgoing_rx) = flume::bounded(config.send_queue_capacity);

        let conn = Arc::new(Self {
            client_id,
            remote_addr,
            connected_at: Instant::now(),
            state: Mutex::new(ConnectionState::Connecting),
            cipher: Mutex::new(TqCipher::new()),
            dh: Mutex::new(None),
            outgoing_tx,
            cancel,
            last_activity: Mutex::new(Instant::now()),
            handshake_started: Mutex::new(None),
            packet_limiter: TokenBucket::packets(),
            byte_limiter: TokenBucket::bytes(),
            flood: FloodWindow::standard(),
            diversity: TypeDiversity::standard(),
            consecutive_errors: AtomicU32::new(0),
            player_id: AtomicU32::new(0),
            packets_sent: AtomicU64::new(0),
            bytes_sent: AtomicU64::new(0),
            packets_received: AtomicU64::new(0),
            bytes_received: AtomicU64::new(0),
            disconnect_reason: Mutex::new(None),
        });

        conn.begin_handshake();
        (conn, outgoing_rx)
    }

    /// Keys the cipher with the bootstrap key, queues the encrypted
    /// key-exchange packet, and arms the handshake timer.
    fn begin_handshake(&self) {
        let exchange = DhExchange::new();
        let blob = exchange.create_key_exchange_packet();

        let mut cipher = self.cipher.lock();
        cipher.generate_key(BOOTSTRAP_KEY);
        let mut wire = BytesMut::from(&blob[..]);
        let _ = cipher.encrypt(&mut wire);
        drop(cipher);

        *self.dh.lock() = Some(exchange);

        // The queue is freshly created and far larger than one frame.
        let _ = self.outgoing_tx.try_send(wire.freeze());

        self.advance(ConnectionState::WaitingForDummyPacket);
        *self.handshake_started.lock() = Some(Instant::now());
    }

    pub fn client_id(&self) -> u64 {
        self.client_id
    }

    pub fn remote_addr(&self) -> SocketAddr {
        self.remote_addr
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.lock()
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    /// Attempts a forward state transition. Transitions never move
    /// backward and nothing leaves `Disconnected`.
    pub(crate) fn advance(&self, to: ConnectionState) -> bool {
        let mut state = self.state.lock();
        if *state == ConnectionState::Disconnected || to <= *state {
            return false;
        }
        trace!(client = self.client_id, from = ?*state, ?to, "state transition");
        *state = to;
        true
    }

    /// Tears the connection down: records the reason, transitions to
    /// `Disconnected`, and cancels every task. Safe to call any number of
    /// times; only the first has any effect.
    pub fn disconnect(&self, reason: &str) {
        {
            let mut state = self.state.lock();
            if *state == ConnectionState::Disconnected {
                return;
            }
            *state = ConnectionState::Disconnected;
        }
        *self.disconnect_reason.lock() = Some(reason.to_owned());
        debug!(
            client = self.client_id,
            addr = %self.remote_addr,
            reason,
            duration_ms = self.connected_at.elapsed().as_millis() as u64,
            packets_in = self.packets_received.load(Ordering::Relaxed),
            packets_out = self.packets_sent.load(Ordering::Relaxed),
            "connection closed"
        );
        self.cancel.cancel();
    }

    pub fn disconnect_reason(&self) -> Option<String> {
        self.disconnect_reason.lock().clone()
    }

    pub fn cancellation_token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Queues an outbound frame, waiting for queue capacity.
    pub async fn send(&self, frame: Bytes) -> anyhow::Result<()> {
        self.outgoing_tx
            .send_async(frame)
            .await
            .context("outbound queue closed")
    }

    /// Queues an outbound frame without waiting. Used by broadcast, where
    /// one slow client must not stall the rest.
    pub fn try_send(&self, frame: Bytes) -> Result<(), flume::TrySendError<Bytes>> {
        self.outgoing_tx.try_send(frame)
    }

    fn touch(&self) {
        *self.last_activity.lock() = Instant::now();
    }

    pub fn idle_for(&self, now: Instant) -> Duration {
        now.duration_since(*self.last_activity.lock())
    }

    pub fn handshake_elapsed(&self) -> Option<Duration> {
        self.handshake_started.lock().map(|t| t.elapsed())
    }

    /// Links the logged-in player entity to this connection.
    pub fn attach_player(&self, object_id: u32) {
        self.player_id.store(object_id, Ordering::Release);
    }

    pub fn player_id(&self) -> Option<u32> {
        match self.player_id.load(Ordering::Acquire) {
            0 => None,
            id => Some(id),
        }
    }

    fn record_error(&self) -> u32 {
        self.consecutive_errors.fetch_add(1, Ordering::Relaxed) + 1
    }

    fn clear_errors(&self) {
        self.consecutive_errors.store(0, Ordering::Relaxed);
    }

    pub fn packets_sent(&self) -> u64 {
        self.packets_sent.load(Ordering::Relaxed)
    }

    pub fn bytes_sent(&self) -> u64 {
        self.bytes_sent.load(Ordering::Relaxed)
    }

    pub fn packets_received(&self) -> u64 {
        self.packets_received.load(Ordering::Relaxed)
    }

    pub fn bytes_received(&self) -> u64 {
        self.bytes_received.load(Ordering::Relaxed)
    }

    pub fn connected_at(&self) -> Instant {
        self.connected_at
    }
}

/// Applies the per-socket options the protocol expects: no Nagle, small
/// fixed kernel buffers, keepalive on, linger off, short syscall
/// timeouts.
pub(crate) fn configure_socket(stream: &TcpStream) -> std::io::Result<()> {
    stream.set_nodelay(true)?;
    let sock = socket2::SockRef::from(stream);
    sock.set_recv_buffer_size(SOCKET_BUF_SIZE)?;
    sock.set_send_buffer_size(SOCKET_BUF_SIZE)?;
    sock.set_tcp_keepalive(
        &socket2::TcpKeepalive::new()
            .with_time(Duration::from_secs(60))
            .with_interval(Duration::from_secs(10)),
    )?;
    sock.set_linger(None)?;
    sock.set_read_timeout(Some(Duration::from_secs(5)))?;
    sock.set_write_timeout(Some(Duration::from_secs(5)))?;
    Ok(())
}

/// The receive loop: socket bytes in, [`ClientMessage`]s out.
pub(crate) async fn run_recv_loop(
    conn: Arc<Connection>,
    mut reader: OwnedReadHalf,
    messages: flume::Sender<ClientMessage>,
    callbacks: Arc<dyn SessionCallbacks>,
    config: NetworkConfig,
) {
    let mut decoder = FrameDecoder::new();
    let mut buf = [0u8; RECV_BUF_SIZE];

    loop {
        let n = tokio::select! {
            _ = conn.cancel.cancelled() => break,
            read = reader.read(&mut buf) => match read {
                Ok(0) => {
                    conn.disconnect("Connection closed by peer");
                    break;
                }
                Ok(n) => n,
                Err(e) if is_transient(&e) => continue,
                Err(e) => {
                    conn.disconnect(&format!("Socket error: {e}"));
                    break;
                }
            },
        };

        conn.touch();
        conn.bytes_received.fetch_add(n as u64, Ordering::Relaxed);
        if !conn.byte_limiter.acquire(n as u32).await {
            conn.disconnect("Byte rate exceeded");
            break;
        }

        decoder.queue_slice(&buf[..n]);

        // Drain in bounded batches, yielding between them so one client
        // cannot monopolize the executor with a large burst.
        loop {
            match drain_frames(&conn, &mut decoder, &messages, &callbacks, &config).await {
                Ok(processed) if processed == MAX_FRAMES_PER_WAKE => {
                    tokio::task::yield_now().await;
                }
                Ok(_) => break,
                Err(reason) => {
                    conn.disconnect(&reason);
                    return;
                }
            }
        }
    }
}

/// Processes up to [`MAX_FRAMES_PER_WAKE`] frames from the decoder,
/// according to the current handshake phase. Returns how many frames it
/// consumed; a returned error is the disconnect reason.
async fn drain_frames(
    conn: &Arc<Connection>,
    decoder: &mut FrameDecoder,
    messages: &flume::Sender<ClientMessage>,
    callbacks: &Arc<dyn SessionCallbacks>,
    config: &NetworkConfig,
) -> Result<usize, String> {
    for processed in 0..MAX_FRAMES_PER_WAKE {
        match conn.state() {
            ConnectionState::WaitingForDummyPacket => {
                match decoder.next_dummy().map_err(size_reason)? {
                    Some(len) => {
                        trace!(client = conn.client_id, len, "dummy packet consumed");
                        conn.advance(ConnectionState::DhKeyExchange);
                    }
                    None => return Ok(processed),
                }
            }
            ConnectionState::DhKeyExchange => {
                if conn
                    .handshake_elapsed()
                    .is_some_and(|t| t > config.handshake_timeout)
                {
                    return Err("Handshake timeout".into());
                }

                let blob = {
                    let mut cipher = conn.cipher.lock();
                    decoder
                        .next_key_blob(|b| {
                            let _ = cipher.decrypt(b);
                        })
                        .map_err(size_reason)?
                };

                let Some(blob) = blob else {
                    // Not enough of the blob yet; the timer bounds how
                    // long we keep waiting.
                    return Ok(processed);
                };
                let client_key = Packet::from_raw(blob)
                    .try_extract_dh_key()
                    .ok_or("Bad key exchange response")?;
                complete_handshake(conn, &client_key)?;
                callbacks
                    .on_connected(conn)
                    .await
                    .map_err(|e| format!("Session setup failed: {e:#}"))?;
            }
            ConnectionState::Connected => {
                let frame = {
                    let mut cipher = conn.cipher.lock();
                    decoder.next_frame(|b| {
                        let _ = cipher.decrypt(b);
                    })
                };
                match frame.map_err(size_reason)? {
                    Some(packet) => {
                        handle_frame(conn, packet, messages).await?;
                    }
                    None => return Ok(processed),
                }
            }
            ConnectionState::Connecting | ConnectionState::Disconnected => return Ok(processed),
        }
    }
    Ok(MAX_FRAMES_PER_WAKE)
}

/// Feeds the client's public key through the exchange, installs the
/// session key, and transitions to `Connected`.
fn complete_handshake(conn: &Arc<Connection>, client_key: &str) -> Result<(), String> {
    let session_key = {
        let mut dh = conn.dh.lock();
        let exchange = dh.as_mut().ok_or("Key exchange already completed")?;
        exchange
            .handle_client_response(client_key)
            .map_err(|e| format!("Bad key exchange response: {e}"))?;
        let key = exchange
            .derive_session_key()
            .map_err(|e| format!("Bad key exchange response: {e}"))?;
        *dh = None;
        key
    };

    let mut cipher = conn.cipher.lock();
    cipher.generate_key(&session_key);
    cipher.reset();
    drop(cipher);

    conn.advance(ConnectionState::Connected);
    debug!(client = conn.client_id, "handshake complete");
    Ok(())
}

/// Rate checks and validation for one decoded frame, then hand-off to
/// the per-client queue.
async fn handle_frame(
    conn: &Arc<Connection>,
    packet: Packet,
    messages: &flume::Sender<ClientMessage>,
) -> Result<(), String> {
    if !conn.packet_limiter.acquire(1).await {
        return Err("Packet rate exceeded".into());
    }
    if !conn.flood.record(Instant::now()) {
        return Err("Flood detected".into());
    }
    if conn.diversity.record(packet.packet_type().0) {
        warn!(
            client = conn.client_id,
            types = conn.diversity.cardinality(),
            "unusual packet type diversity"
        );
    }

    if !(packet.is_complete() && packet.is_client_packet()) {
        let errors = conn.record_error();
        warn!(
            client = conn.client_id,
            ty = %packet.packet_type(),
            errors,
            "dropping malformed frame"
        );
        if errors >= MAX_CONSECUTIVE_ERRORS {
            return Err("Too many malformed packets".into());
        }
        return Ok(());
    }

    conn.clear_errors();
    conn.packets_received.fetch_add(1, Ordering::Relaxed);
    let _ = messages.send(ClientMessage {
        client_id: conn.client_id,
        packet,
    });
    Ok(())
}

/// The send loop: sole consumer of the outbound queue. Frames queued
/// after the handshake go out under the session cipher; handshake-phase
/// frames (already encrypted at build time or deliberately plain) pass
/// through untouched.
pub(crate) async fn run_send_loop(
    conn: Arc<Connection>,
    mut writer: OwnedWriteHalf,
    outgoing_rx: flume::Receiver<Bytes>,
) {
    loop {
        let frame = tokio::select! {
            _ = conn.cancel.cancelled() => break,
            recv = outgoing_rx.recv_async() => match recv {
                Ok(frame) => frame,
                Err(_) => break,
            },
        };

        let mut wire = BytesMut::from(&frame[..]);
        if conn.is_connected() {
            let mut cipher = conn.cipher.lock();
            if cipher.is_initialized() {
                let _ = cipher.encrypt(&mut wire);
            }
        }

        if let Err(e) = write_with_retry(&mut writer, &wire).await {
            conn.disconnect(&format!("Send failed: {e}"));
            break;
        }
        conn.packets_sent.fetch_add(1, Ordering::Relaxed);
        conn.bytes_sent.fetch_add(wire.len() as u64, Ordering::Relaxed);
    }
}

async fn write_with_retry(writer: &mut OwnedWriteHalf, data: &[u8]) -> std::io::Result<()> {
    let mut attempt = 0;
    loop {
        match writer.write_all(data).await {
            Ok(()) => return writer.flush().await,
            Err(e) if attempt < MAX_WRITE_RETRIES && is_transient(&e) => {
                attempt += 1;
                tokio::time::sleep(Duration::from_millis(10) * attempt).await;
            }
            Err(e) => return Err(e),
        }
    }
}

/// Frame-size violations share one client-visible diagnostic.
fn size_reason(e: CodecError) -> String {
    match e {
        CodecError::FrameTooLarge { .. } | CodecError::FrameTooSmall { .. } => {
            "Invalid packet size".into()
        }
        other => other.to_string(),
    }
}

fn is_transient(e: &std::io::Error) -> bool {
    matches!(
        e.kind(),
        std::io::ErrorKind::WouldBlock
            | std::io::ErrorKind::Interrupted
            | std::io::ErrorKind::OutOfMemory
    )
}

/// The health monitor: enforces the handshake and idle deadlines and
/// periodically clears the packet-type diversity window.
pub(crate) async fn run_health_monitor(conn: Arc<Connection>, config: NetworkConfig) {
    let start = tokio::time::Instant::now() + config.health_check_interval;
    let mut ticks = tokio::time::interval_at(start, config.health_check_interval);
    let mut last_diversity_reset = Instant::now();

    loop {
        tokio::select! {
            _ = conn.cancel.cancelled() => break,
            _ = ticks.tick() => {}
        }

        let now = Instant::now();
        match conn.state() {
            ConnectionState::Disconnected => break,
            ConnectionState::WaitingForDummyPacket | ConnectionState::DhKeyExchange => {
                if conn
                    .handshake_elapsed()
                    .is_some_and(|t| t > config.handshake_timeout)
                {
                    conn.disconnect("Handshake timeout");
                    break;
                }
            }
            ConnectionState::Connected => {
                if conn.idle_for(now) > config.idle_timeout {
                    conn.disconnect("Idle timeout");
                    break;
                }
            }
            ConnectionState::Connecting => {}
        }

        if now.duration_since(last_diversity_reset) >= config.diversity_reset_interval {
            conn.diversity.reset();
            last_diversity_reset = now;
        }
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;
    use tq_crypto::dh::parse_key_exchange_packet;

    use super::*;

    fn test_conn() -> (Arc<Connection>, flume::Receiver<Bytes>) {
        Connection::accept(
            1,
            "127.0.0.1:9999".parse().unwrap(),
            CancellationToken::new(),
            &NetworkConfig::default(),
        )
    }

    #[test]
    fn accept_queues_the_key_exchange_packet() {
        let (conn, rx) = test_conn();
        assert_eq!(conn.state(), ConnectionState::WaitingForDummyPacket);
        assert!(conn.handshake_elapsed().is_some());

        let mut wire = BytesMut::from(&rx.try_recv().unwrap()[..]);
        let mut client_cipher = TqCipher::new();
        client_cipher.generate_key(BOOTSTRAP_KEY);
        client_cipher.decrypt(&mut wire).unwrap();

        let params = parse_key_exchange_packet(&wire).unwrap();
        assert_eq!(params.generator, tq_crypto::dh::DH_GENERATOR);
    }

    #[test]
    fn state_only_moves_forward() {
        let (conn, _rx) = test_conn();
        assert!(!conn.advance(ConnectionState::WaitingForDummyPacket));
        assert!(conn.advance(ConnectionState::DhKeyExchange));
        assert!(!conn.advance(ConnectionState::WaitingForDummyPacket));
        assert!(conn.advance(ConnectionState::Connected));
    }

    #[test]
    fn disconnect_is_idempotent_and_terminal() {
        let (conn, _rx) = test_conn();
        conn.disconnect("first reason");
        assert_eq!(conn.state(), ConnectionState::Disconnected);
        assert!(conn.cancellation_token().is_cancelled());
        assert_eq!(conn.disconnect_reason().as_deref(), Some("first reason"));

        conn.disconnect("second reason");
        assert_eq!(conn.disconnect_reason().as_deref(), Some("first reason"));
        assert!(!conn.advance(ConnectionState::Connected));
    }

    #[test]
    fn player_attachment() {
        let (conn, _rx) = test_conn();
        assert_eq!(conn.player_id(), None);
        conn.attach_player(10_002);
        assert_eq!(conn.player_id(), Some(10_002));
    }

    #[tokio::test]
    async fn send_queues_frames_in_order() {
        let (conn, rx) = test_conn();
        let _handshake = rx.try_recv().unwrap();

        conn.send(Bytes::from_static(b"one")).await.unwrap();
        conn.send(Bytes::from_static(b"two")).await.unwrap();
        assert_eq!(rx.try_recv().unwrap(), Bytes::from_static(b"one"));
        assert_eq!(rx.try_recv().unwrap(), Bytes::from_static(b"two"));
    }
}
