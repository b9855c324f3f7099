//! Handler registration and the invocation pipeline.
//!
//! Handlers are registered per packet type at startup; discovery is an
//! explicit table, with dependencies captured in the handler closures.
//! Every invocation runs through the middleware chain (rate-limit, auth,
//! logging, metrics) and any middleware can abort the chain by returning
//! false. Per-client ordering comes from the drain task model: one task
//! reads one client's queue, so dispatches for a client are sequential
//! while different clients proceed in parallel.

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use rustc_hash::FxHashMap;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};
use tq_protocol::{Packet, PacketType};

use crate::connection::Connection;
use crate::limit::TokenBucket;
use crate::registry::ClientRegistry;

/// One decoded frame on its way to a handler.
pub struct ClientMessage {
    pub client_id: u64,
    pub packet: Packet,
}

/// Everything a handler invocation gets to work with.
pub struct HandlerContext {
    pub connection: Arc<Connection>,
    pub packet: Packet,
    pub registry: Arc<ClientRegistry>,
    /// Cancelled when the connection goes away; handlers honor it at
    /// their await points.
    pub cancel: CancellationToken,
}

type HandlerFuture = Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send>>;
type HandlerFn = Arc<dyn Fn(HandlerContext) -> HandlerFuture + Send + Sync>;

/// A link in the invocation chain. Returning false aborts the dispatch
/// without error.
#[async_trait]
pub trait Middleware: Send + Sync + 'static {
    fn name(&self) -> &'static str;
    async fn handle(&self, cx: &HandlerContext) -> bool;
}

/// The handler registry and middleware pipeline.
#[derive(Default)]
pub struct PacketDispatcher {
    handlers: FxHashMap<u16, HandlerFn>,
    middleware: Vec<Arc<dyn Middleware>>,
}

impl PacketDispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// A dispatcher with the standard chain installed:
    /// rate-limit -> auth -> logging -> metrics.
    pub fn with_standard_middleware(max_clients: usize) -> Self {
        let mut this = Self::new();
        this.add_middleware(Arc::new(DispatchRateLimit::for_capacity(max_clients)));
        this.add_middleware(Arc::new(RequireAuth));
        this.add_middleware(Arc::new(DispatchLogging));
        this.add_middleware(Arc::new(DispatchMetrics::default()));
        this
    }

    pub fn add_middleware(&mut self, middleware: Arc<dyn Middleware>) {
        self.middleware.push(middleware);
    }

    /// Registers a handler for one packet type, replacing any previous
    /// registration.
    pub fn register<F, Fut>(&mut self, ty: PacketType, handler: F)
    where
        F: Fn(HandlerContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.handlers
            .insert(ty.0, Arc::new(move |cx| Box::pin(handler(cx))));
    }

    pub fn has_handler(&self, ty: PacketType) -> bool {
        self.handlers.contains_key(&ty.0)
    }

    pub fn handler_count(&self) -> usize {
        self.handlers.len()
    }

    /// Runs one invocation: lookup, middleware chain, handler. Unknown
    /// types are dropped with a log line; handler errors are logged and
    /// never propagate to the receive loop.
    pub async fn dispatch(&self, cx: HandlerContext) {
        let ty = cx.packet.packet_type();
        let Some(handler) = self.handlers.get(&ty.0) else {
            debug!(client = cx.connection.client_id(), %ty, "no handler; packet dropped");
            return;
        };

        for middleware in &self.middleware {
            if !middleware.handle(&cx).await {
                trace!(
                    client = cx.connection.client_id(),
                    %ty,
                    middleware = middleware.name(),
                    "dispatch aborted"
                );
                return;
            }
        }

        let client = cx.connection.client_id();
        if let Err(e) = handler(cx).await {
            warn!(client, %ty, "handler failed: {e:#}");
        }
    }
}

/// Server-wide dispatch budget; a backstop behind the per-connection
/// limiters.
pub struct DispatchRateLimit {
    budget: TokenBucket,
}

impl DispatchRateLimit {
    pub fn for_capacity(max_clients: usize) -> Self {
        let per_second = (max_clients as u32).saturating_mul(100).max(100);
        Self {
            budget: TokenBucket::new(per_second, per_second, 0),
        }
    }
}

#[async_trait]
impl Middleware for DispatchRateLimit {
    fn name(&self) -> &'static str {
        "rate-limit"
    }

    async fn handle(&self, cx: &HandlerContext) -> bool {
        if self.budget.try_acquire(1) {
            return true;
        }
        warn!(
            client = cx.connection.client_id(),
            "global dispatch budget exhausted; dropping packet"
        );
        false
    }
}

/// Blocks game packets until the connection has a player attached. Login
/// is the one packet type allowed through unauthenticated.
pub struct RequireAuth;

#[async_trait]
impl Middleware for RequireAuth {
    fn name(&self) -> &'static str {
        "auth"
    }

    async fn handle(&self, cx: &HandlerContext) -> bool {
        cx.packet.packet_type() == PacketType::C_MSG_LOGIN_GAME
            || cx.connection.player_id().is_some()
    }
}

pub struct DispatchLogging;

#[async_trait]
impl Middleware for DispatchLogging {
    fn name(&self) -> &'static str {
        "logging"
    }

    async fn handle(&self, cx: &HandlerContext) -> bool {
        trace!(
            client = cx.connection.client_id(),
            ty = %cx.packet.packet_type(),
            len = cx.packet.payload_len(),
            "dispatching"
        );
        true
    }
}

/// Counts dispatched packets and payload bytes.
#[derive(Default)]
pub struct DispatchMetrics {
    packets: AtomicU64,
    payload_bytes: AtomicU64,
}

impl DispatchMetrics {
    pub fn packets(&self) -> u64 {
        self.packets.load(Ordering::Relaxed)
    }

    pub fn payload_bytes(&self) -> u64 {
        self.payload_bytes.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl Middleware for DispatchMetrics {
    fn name(&self) -> &'static str {
        "metrics"
    }

    async fn handle(&self, cx: &HandlerContext) -> bool {
        self.packets.fetch_add(1, Ordering::Relaxed);
        self.payload_bytes
            .fetch_add(cx.packet.payload_len() as u64, Ordering::Relaxed);
        true
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;

    use bytes::BytesMut;
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::NetworkConfig;

    fn context(ty: PacketType) -> HandlerContext {
        let (connection, _rx) = Connection::accept(
            1,
            "127.0.0.1:9999".parse().unwrap(),
            CancellationToken::new(),
            &NetworkConfig::default(),
        );
        let wire = {
            let mut p = Packet::build(ty);
            p.write_u32(7).unwrap();
            p.finalize()
        };
        HandlerContext {
            cancel: connection.cancellation_token().child_token(),
            connection,
            packet: Packet::from_frame(BytesMut::from(&wire[..])).unwrap(),
            registry: Arc::new(ClientRegistry::new()),
        }
    }

    #[tokio::test]
    async fn dispatch_invokes_the_registered_handler() {
        let hits = Arc::new(AtomicUsize::new(0));
        let mut dispatcher = PacketDispatcher::new();
        let counted = Arc::clone(&hits);
        dispatcher.register(PacketType::C_MSG_ACTION, move |_cx| {
            let counted = Arc::clone(&counted);
            async move {
                counted.fetch_add(1, Ordering::Relaxed);
                Ok(())
            }
        });

        dispatcher.dispatch(context(PacketType::C_MSG_ACTION)).await;
        assert_eq!(hits.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn unknown_types_are_dropped() {
        let dispatcher = PacketDispatcher::new();
        // Nothing registered; must not panic.
        dispatcher.dispatch(context(PacketType(4242))).await;
    }

    #[tokio::test]
    async fn handler_errors_do_not_propagate() {
        let mut dispatcher = PacketDispatcher::new();
        dispatcher.register(PacketType::C_MSG_TALK, |_cx| async {
            anyhow::bail!("boom")
        });
        dispatcher.dispatch(context(PacketType::C_MSG_TALK)).await;
    }

    #[tokio::test]
    async fn middleware_can_abort_the_chain() {
        struct Deny;
        #[async_trait]
        impl Middleware for Deny {
            fn name(&self) -> &'static str {
                "deny"
            }
            async fn handle(&self, _cx: &HandlerContext) -> bool {
                false
            }
        }

        let hits = Arc::new(AtomicUsize::new(0));
        let mut dispatcher = PacketDispatcher::new();
        dispatcher.add_middleware(Arc::new(Deny));
        let counted = Arc::clone(&hits);
        dispatcher.register(PacketType::C_MSG_ACTION, move |_cx| {
            let counted = Arc::clone(&counted);
            async move {
                counted.fetch_add(1, Ordering::Relaxed);
                Ok(())
            }
        });

        dispatcher.dispatch(context(PacketType::C_MSG_ACTION)).await;
        assert_eq!(hits.load(Ordering::Relaxed), 0);
    }

    #[tokio::test]
    async fn auth_gates_game_packets_until_login() {
        let auth = RequireAuth;
        let cx = context(PacketType::C_MSG_ACTION);
        assert!(!auth.handle(&cx).await);

        cx.connection.attach_player(10_002);
        assert!(auth.handle(&cx).await);

        let login_cx = context(PacketType::C_MSG_LOGIN_GAME);
        assert!(auth.handle(&login_cx).await);
    }

    #[tokio::test]
    async fn metrics_count_dispatches() {
        let metrics = DispatchMetrics::default();
        let cx = context(PacketType::C_MSG_ACTION);
        assert!(metrics.handle(&cx).await);
        assert!(metrics.handle(&cx).await);
        assert_eq!(metrics.packets(), 2);
        assert_eq!(metrics.payload_bytes(), 8);
    }
}
