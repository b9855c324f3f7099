//! World-side session hooks.
//!
//! The network layer knows nothing about entities; these callbacks close
//! the loop: a player entity is materialized when a connection finishes
//! its handshake (before its first game packet dispatches) and torn down
//! again, with a persistence pass, when the connection dies.

use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use tracing::{debug, warn};
use tq_network::{Connection, SessionCallbacks};
use tq_world::{GameWorld, PlayerRecord, PlayerRepository, Position};

pub struct WorldCallbacks {
    world: Arc<GameWorld>,
    repo: Arc<dyn PlayerRepository>,
    spawn_map: u16,
    spawn_point: Position,
}

impl WorldCallbacks {
    pub fn new(
        world: Arc<GameWorld>,
        repo: Arc<dyn PlayerRepository>,
        spawn_map: u16,
        spawn_point: Position,
    ) -> Self {
        Self {
            world,
            repo,
            spawn_map,
            spawn_point,
        }
    }
}

#[async_trait]
impl SessionCallbacks for WorldCallbacks {
    async fn on_connected(&self, connection: &Arc<Connection>) -> anyhow::Result<()> {
        let name = format!("player-{}", connection.client_id());
        let entity = self.world.create_player(connection.client_id(), name);

        if let Some(mut player) = entity.player() {
            player.last_login_ms = SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .map(|d| d.as_millis() as u64)
                .unwrap_or(0);
        }

        self.world
            .spawn(Arc::clone(&entity), self.spawn_map, self.spawn_point)?;
        connection.attach_player(entity.object_id());
        debug!(
            client = connection.client_id(),
            object_id = entity.object_id(),
            "player materialized"
        );
        Ok(())
    }

    async fn on_disconnected(&self, connection: &Arc<Connection>) {
        let Some(object_id) = connection.player_id() else {
            return;
        };

        if let Some(entity) = self.world.entity(object_id) {
            let record = entity.player().and_then(|player| {
                let pos = entity.position();
                player.dirty.then(|| {
                    PlayerRecord::from_player(object_id, entity.map_id(), pos.x, pos.y, &player)
                })
            });
            if let Some(record) = record {
                if !self.repo.upsert_player(&record).await {
                    warn!(object_id, "failed to persist player on disconnect");
                }
            }
        }

        self.world.despawn(object_id);
    }
}
