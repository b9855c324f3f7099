//! Built-in packet handlers.
//!
//! These cover the handful of message types the core server answers by
//! itself: login acknowledgement, chat relay, and movement. Everything
//! else belongs to game modules that register their own handlers against
//! the same dispatcher.

use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::Context as _;
use tracing::debug;
use tq_network::{HandlerContext, PacketDispatcher};
use tq_protocol::messages::{
    MsgAction, MsgActionResponse, MsgLoginGame, MsgLoginResponse, MsgTalk,
};
use tq_protocol::PacketPayload;
use tq_world::{GameWorld, Position};

/// Installs the built-in handlers. Dependencies ride inside the handler
/// closures; nothing is resolved at dispatch time.
pub fn register_handlers(dispatcher: &mut PacketDispatcher, world: &Arc<GameWorld>) {
    let w = Arc::clone(world);
    dispatcher.register(MsgLoginGame::TYPE, move |cx| {
        let world = Arc::clone(&w);
        async move { handle_login(world, cx).await }
    });

    dispatcher.register(MsgTalk::TYPE, |cx| async move { handle_talk(cx).await });

    let w = Arc::clone(world);
    dispatcher.register(MsgAction::TYPE, move |cx| {
        let world = Arc::clone(&w);
        async move { handle_action(world, cx).await }
    });
}

/// Acknowledges a login with the player's uid and a zero (success)
/// state. The player entity itself was materialized when the handshake
/// completed; credential verification lives with the auth service.
async fn handle_login(world: Arc<GameWorld>, cx: HandlerContext) -> anyhow::Result<()> {
    let mut packet = cx.packet;
    let request = MsgLoginGame::from_packet(&mut packet)?;

    let object_id = cx
        .connection
        .player_id()
        .context("login dispatched without a player entity")?;

    if let Some(entity) = world.entity(object_id) {
        if let Some(mut player) = entity.player() {
            player.last_login_ms = SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .map(|d| d.as_millis() as u64)
                .unwrap_or(0);
            player.dirty = true;
        }
    }
    debug!(
        client = cx.connection.client_id(),
        account = request.account_id,
        uid = object_id,
        "login accepted"
    );

    let response = MsgLoginResponse {
        uid: object_id,
        state: 0,
    }
    .to_packet()?;
    cx.connection.send(response.finalize()).await
}

/// Relays a chat line to every other connected client.
async fn handle_talk(cx: HandlerContext) -> anyhow::Result<()> {
    let mut packet = cx.packet;
    let talk = MsgTalk::from_packet(&mut packet)?;

    let relay = talk.to_packet()?.finalize();
    cx.registry
        .broadcast(&relay, Some(cx.connection.client_id()));
    Ok(())
}

/// Movement and other world actions. Walk requests go through the map's
/// movement validation; the response echoes the action with the
/// position the server settled on and whether the move was accepted.
async fn handle_action(world: Arc<GameWorld>, cx: HandlerContext) -> anyhow::Result<()> {
    let mut packet = cx.packet;
    let request = MsgAction::from_packet(&mut packet)?;

    let object_id = cx
        .connection
        .player_id()
        .context("action dispatched without a player entity")?;
    let entity = world
        .entity(object_id)
        .context("player entity missing from the world")?;

    let accepted = match request.action {
        MsgAction::WALK => {
            let map = world
                .map(entity.map_id())
                .context("player stands on an unregistered map")?;
            let moved = map.try_move_entity(&entity, Position::new(request.x, request.y));
            if moved {
                if let Some(mut player) = entity.player() {
                    player.dirty = true;
                }
            }
            moved
        }
        _ => false,
    };

    let pos = entity.position();
    let response = MsgActionResponse {
        action: request.action,
        x: pos.x,
        y: pos.y,
        accepted,
    }
    .to_packet()?;
    cx.connection.send(response.finalize()).await
}
