//! The accept loop and server lifecycle.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context as _;
use async_trait::async_trait;
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::connection::{
    self, configure_socket, Connection,
};
use crate::dispatcher::{HandlerContext, PacketDispatcher};
use crate::registry::ClientRegistry;
use crate::NetworkConfig;

/// Hooks the world side implements; the server invokes them from inside
/// the connection tasks. `on_connected` runs after the handshake
/// completes and before the first game packet is dispatched.
#[async_trait]
pub trait SessionCallbacks: Send + Sync + 'static {
    async fn on_connected(&self, connection: &Arc<Connection>) -> anyhow::Result<()> {
        let _ = connection;
        Ok(())
    }

    async fn on_disconnected(&self, connection: &Arc<Connection>) {
        let _ = connection;
    }
}

/// The no-op callbacks, useful as a placeholder.
#[async_trait]
impl SessionCallbacks for () {}

/// Owns the listener, the registry, and the per-client task fleet.
pub struct GameServer {
    config: NetworkConfig,
    registry: Arc<ClientRegistry>,
    dispatcher: Arc<PacketDispatcher>,
    callbacks: Arc<dyn SessionCallbacks>,
    cancel: CancellationToken,
    next_client_id: AtomicU64,
}

impl GameServer {
    pub fn new(
        config: NetworkConfig,
        dispatcher: PacketDispatcher,
        callbacks: impl SessionCallbacks,
    ) -> Arc<Self> {
        Arc::new(Self {
            config,
            registry: Arc::new(ClientRegistry::new()),
            dispatcher: Arc::new(dispatcher),
            callbacks: Arc::new(callbacks),
            cancel: CancellationToken::new(),
            next_client_id: AtomicU64::new(1),
        })
    }

    pub fn registry(&self) -> &Arc<ClientRegistry> {
        &self.registry
    }

    pub fn config(&self) -> &NetworkConfig {
        &self.config
    }

    /// The root token; connection tokens are children of it.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Binds the configured address and accepts until cancelled.
    pub async fn run(self: &Arc<Self>) -> anyhow::Result<()> {
        let addr = self.config.socket_addr();
        let listener = TcpListener::bind(addr)
            .await
            .with_context(|| format!("binding listener on {addr}"))?;
        self.serve(listener).await
    }

    /// Accepts connections from an already bound listener until
    /// cancelled.
    pub async fn serve(self: &Arc<Self>, listener: TcpListener) -> anyhow::Result<()> {
        info!(
            addr = %listener.local_addr().context("listener address")?,
            max_clients = self.config.max_clients,
            "server listening"
        );

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                accepted = listener.accept() => match accepted {
                    Ok((stream, remote_addr)) => self.admit(stream, remote_addr),
                    Err(e) => error!("accept failed: {e}"),
                },
            }
        }
        info!("accept loop stopped");
        Ok(())
    }

    /// Admits one accepted socket: enforces the client cap, allocates an
    /// id, and spawns the connection's task fleet.
    fn admit(self: &Arc<Self>, stream: TcpStream, remote_addr: std::net::SocketAddr) {
        if self.registry.count() >= self.config.max_clients {
            warn!(%remote_addr, max = self.config.max_clients, "client cap reached; rejecting");
            return;
        }
        if let Err(e) = configure_socket(&stream) {
            warn!(%remote_addr, "socket configuration failed: {e}");
        }

        let client_id = self.next_client_id.fetch_add(1, Ordering::Relaxed);
        let (conn, outgoing_rx) =
            Connection::accept(client_id, remote_addr, self.cancel.child_token(), &self.config);
        self.registry.add(Arc::clone(&conn));
        debug!(client = client_id, %remote_addr, "client admitted");

        let (messages_tx, messages_rx) = flume::unbounded();
        let (reader, writer) = stream.into_split();

        tokio::spawn(connection::run_recv_loop(
            Arc::clone(&conn),
            reader,
            messages_tx,
            Arc::clone(&self.callbacks),
            self.config.clone(),
        ));
        tokio::spawn(connection::run_send_loop(
            Arc::clone(&conn),
            writer,
            outgoing_rx,
        ));
        tokio::spawn(connection::run_health_monitor(
            Arc::clone(&conn),
            self.config.clone(),
        ));

        // The drain task: sole reader of this client's queue, so packets
        // dispatch in wire order and one handler finishes before the next
        // starts.
        let dispatcher = Arc::clone(&self.dispatcher);
        let registry = Arc::clone(&self.registry);
        let drain_conn = Arc::clone(&conn);
        tokio::spawn(async move {
            while let Ok(message) = messages_rx.recv_async().await {
                let cx = HandlerContext {
                    connection: Arc::clone(&drain_conn),
                    packet: message.packet,
                    registry: Arc::clone(&registry),
                    cancel: drain_conn.cancellation_token().child_token(),
                };
                dispatcher.dispatch(cx).await;
            }
        });

        // Reaper: waits for the connection to die, then disposes it.
        let server = Arc::clone(self);
        tokio::spawn(async move {
            conn.cancellation_token().cancelled().await;
            server.registry.remove(conn.client_id());
            server.callbacks.on_disconnected(&conn).await;
        });
    }

    /// Graceful shutdown: cancel everything, give connections the grace
    /// period to drain, then dispose whatever is left.
    pub async fn shutdown(&self) {
        info!("server shutting down");
        self.cancel.cancel();

        let deadline = tokio::time::Instant::now() + self.config.shutdown_grace;
        while self.registry.count() > 0 && tokio::time::Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(50)).await;
        }

        for connection in self.registry.snapshot() {
            connection.disconnect("Server shutting down");
            self.registry.remove(connection.client_id());
        }
        info!(
            total_packets_sent = self.registry.total_packets_sent(),
            total_bytes_sent = self.registry.total_bytes_sent(),
            "shutdown complete"
        );
    }
}
