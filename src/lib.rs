//! The tq-server runtime: wiring between the network fabric, the game
//! world, and the built-in packet handlers. The host binary in
//! `main.rs` assembles these parts; tests drive them in-process.

pub mod callbacks;
pub mod handlers;

pub use callbacks::WorldCallbacks;
pub use {tq_crypto, tq_network, tq_protocol, tq_world};

#[cfg(test)]
mod tests;
