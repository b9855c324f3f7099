use std::net::IpAddr;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::{Duration, Instant};

use clap::Parser;
use tq_network::{GameServer, NetworkConfig, PacketDispatcher};
use tq_server::handlers::register_handlers;
use tq_server::WorldCallbacks;
use tq_world::{GameWorld, InMemoryPlayerRepository, Map, Position};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "tq-server", about = "TQ protocol game server", version)]
struct Args {
    /// TCP port to listen on.
    #[arg(long, default_value_t = 10033)]
    port: u16,

    /// Interface to bind.
    #[arg(long, default_value = "0.0.0.0")]
    bind: IpAddr,

    /// Maximum simultaneously connected clients.
    #[arg(long, default_value_t = 1000)]
    max_clients: usize,

    /// World tick frequency in Hz.
    #[arg(long, default_value_t = 100)]
    tick_rate: u32,
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    match run(args).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("fatal: {e:#}");
            ExitCode::FAILURE
        }
    }
}

async fn run(args: Args) -> anyhow::Result<()> {
    let world = Arc::new(GameWorld::new());
    world.add_map(Map::new(1002, 512, 512)?);
    let repo = Arc::new(InMemoryPlayerRepository::new());

    let mut dispatcher = PacketDispatcher::with_standard_middleware(args.max_clients);
    register_handlers(&mut dispatcher, &world);

    let callbacks = WorldCallbacks::new(
        Arc::clone(&world),
        repo,
        1002,
        Position::new(300, 278),
    );

    let config = NetworkConfig {
        bind_addr: args.bind,
        port: args.port,
        max_clients: args.max_clients,
        ..NetworkConfig::default()
    };
    let server = GameServer::new(config, dispatcher, callbacks);

    spawn_tick_loop(&server, Arc::clone(&world), args.tick_rate);

    let accept = {
        let server = Arc::clone(&server);
        tokio::spawn(async move { server.run().await })
    };

    tokio::signal::ctrl_c().await?;
    info!("interrupt received; shutting down");

    // A second interrupt forces the process down.
    let force_exit = tokio::spawn(async {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("second interrupt; forcing exit");
            std::process::exit(1);
        }
    });

    server.shutdown().await;
    force_exit.abort();
    accept.await??;
    Ok(())
}

/// Drives periodic world maintenance at the configured tick rate.
fn spawn_tick_loop(server: &Arc<GameServer>, world: Arc<GameWorld>, tick_rate: u32) {
    let cancel = server.cancellation_token();
    let period = Duration::from_secs_f64(1.0 / f64::from(tick_rate.max(1)));
    tokio::spawn(async move {
        let mut ticks = tokio::time::interval(period);
        ticks.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticks.tick() => world.tick(Instant::now()),
            }
        }
    });
}
