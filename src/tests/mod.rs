//! End-to-end scenarios driven over real sockets against an in-process
//! server.

mod client;
mod protocol_errors;

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;
use tq_network::{GameServer, NetworkConfig, PacketDispatcher};
use tq_world::{GameWorld, InMemoryPlayerRepository, Map, Position};

use crate::callbacks::WorldCallbacks;
use crate::handlers::register_handlers;

pub(crate) use client::TestClient;

pub(crate) const TEST_MAP: u16 = 1002;
pub(crate) const TEST_SPAWN: Position = Position::new(10, 10);

pub(crate) struct TestHarness {
    pub(crate) server: Arc<GameServer>,
    pub(crate) world: Arc<GameWorld>,
    pub(crate) addr: SocketAddr,
}

fn test_config() -> NetworkConfig {
    NetworkConfig {
        bind_addr: IpAddr::V4(Ipv4Addr::LOCALHOST),
        port: 0,
        max_clients: 16,
        handshake_timeout: Duration::from_millis(400),
        idle_timeout: Duration::from_secs(60),
        health_check_interval: Duration::from_millis(50),
        diversity_reset_interval: Duration::from_secs(60),
        send_queue_capacity: 100,
        shutdown_grace: Duration::from_secs(1),
    }
}

pub(crate) async fn spawn_server() -> TestHarness {
    spawn_server_with(|_| {}).await
}

/// Boots a server on an ephemeral port with the built-in handlers plus
/// whatever `customize` registers.
pub(crate) async fn spawn_server_with(
    customize: impl FnOnce(&mut PacketDispatcher),
) -> TestHarness {
    let world = Arc::new(GameWorld::new());
    world.add_map(Map::new(TEST_MAP, 64, 64).expect("valid test map"));
    let repo = Arc::new(InMemoryPlayerRepository::new());

    let mut dispatcher = PacketDispatcher::with_standard_middleware(16);
    register_handlers(&mut dispatcher, &world);
    customize(&mut dispatcher);

    let callbacks = WorldCallbacks::new(Arc::clone(&world), repo, TEST_MAP, TEST_SPAWN);
    let server = GameServer::new(test_config(), dispatcher, callbacks);

    let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0))
        .await
        .expect("bind test listener");
    let addr = listener.local_addr().expect("listener addr");

    let accept_server = Arc::clone(&server);
    tokio::spawn(async move {
        let _ = accept_server.serve(listener).await;
    });

    TestHarness { server, world, addr }
}
