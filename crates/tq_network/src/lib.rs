//! The network fabric: per-connection state machines over the encrypted
//! TQ wire protocol, the handler dispatch pipeline, the live-client
//! registry, and the accept loop tying them together.

pub mod connection;
pub mod dispatcher;
pub mod limit;
pub mod registry;
pub mod server;

use std::net::{IpAddr, Ipv4Addr};
use std::time::Duration;

pub use connection::{Connection, ConnectionState};
pub use dispatcher::{ClientMessage, HandlerContext, Middleware, PacketDispatcher};
pub use limit::{FloodWindow, RateLimitError, TokenBucket, TypeDiversity};
pub use registry::ClientRegistry;
pub use server::{GameServer, SessionCallbacks};

/// Tunables for the listener and every connection it accepts. The
/// defaults are the production values; tests shrink the timers.
#[derive(Clone, Debug)]
pub struct NetworkConfig {
    /// Interface to bind.
    pub bind_addr: IpAddr,
    /// TCP port to listen on.
    pub port: u16,
    /// Hard cap on simultaneously connected clients.
    pub max_clients: usize,
    /// How long a client may take to finish the handshake.
    pub handshake_timeout: Duration,
    /// Disconnect after this long without any inbound activity.
    pub idle_timeout: Duration,
    /// Period of the per-connection health timer.
    pub health_check_interval: Duration,
    /// Period after which the packet-type diversity set is cleared.
    pub diversity_reset_interval: Duration,
    /// Capacity of the bounded outbound frame queue.
    pub send_queue_capacity: usize,
    /// How long shutdown waits for connections to drain.
    pub shutdown_grace: Duration,
}

impl NetworkConfig {
    pub fn socket_addr(&self) -> std::net::SocketAddr {
        std::net::SocketAddr::new(self.bind_addr, self.port)
    }
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            bind_addr: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            port: 10033,
            max_clients: 1000,
            handshake_timeout: Duration::from_secs(10),
            idle_timeout: Duration::from_secs(300),
            health_check_interval: Duration::from_secs(30),
            diversity_reset_interval: Duration::from_secs(60),
            send_queue_capacity: 100,
            shutdown_grace: Duration::from_secs(10),
        }
    }
}
