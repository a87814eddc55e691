//! # Relay Server Library
//!
//! This library provides a transparent man-in-the-middle relay for the game's
//! binary TCP protocol. Players connect to the relay instead of the game
//! server; for each one the relay dials the real (backend) server and forwards
//! traffic in both directions, inspecting every packet on the way.
//!
//! ## Core Responsibilities
//!
//! ### Transparent Forwarding
//! Every packet the client sends is decoded, possibly acted upon, re-encoded
//! and written to the backend in the order it arrived. Packets sent before the
//! backend connection exists are queued and flushed exactly once, in order,
//! when it comes up. Everything the backend sends reaches the client.
//!
//! ### Player Tracking
//! Entity updates are merged into a per-player [`shared::EntityRecord`]. The
//! first update that carries a name joins the player: it is indexed, announced
//! and greeted. Position changes go through [`anticheat`] before they are
//! relayed.
//!
//! ### Server-side Features
//! Chat is broadcast by the relay itself, slash commands are executed locally
//! ([`commands`]), hits are tracked to detect kills, and accounts, ranks, bans
//! and warp points live in [`storage`].
//!
//! ## Architecture Design
//!
//! ### Single Event Loop
//! One task owns every session ([`registry::SessionRegistry`]). Socket reads,
//! backend dials, ban lookups and storage replies all arrive as
//! [`network::ServerMessage`]s and are handled one at a time, so session state
//! needs no locks.
//!
//! ### Connection Tasks
//! Each TCP stream is served by its own task that forwards reads to the loop
//! and performs writes queued through a [`session::Leg`]. Closing a leg stops
//! its task; a peer hanging up is reported back as a close event.
//!
//! ### Effects Instead of Shared Borrows
//! A session only mutates itself and [`registry::RelayState`]. Broadcasts,
//! hits on other players and commands are queued as
//! [`registry::Effect`]s and applied by the registry afterwards.
//!
//! ## Module Organization
//!
//! ### Session Module (`session`)
//! The per-connection state machine: queueing, decoding, entity merging,
//! join detection, chat, teleport, heal, kick and teardown.
//!
//! ### Registry Module (`registry`)
//! All sessions plus the player and entity indexes, hook bus, rank table and
//! per-address connection counts.
//!
//! ### Network Module (`network`)
//! Listener, admission (hooks, per-address limit, bans), backend dialing and
//! the main `select!` loop with the server tick.
//!
//! ### Hooks Module (`hooks`)
//! Named events delivered to registered handlers in order, with veto and
//! replace short-circuits.
//!
//! ## Usage Example
//!
//! ```rust,no_run
//! use server::config::RelayConfig;
//! use server::network::Server;
//! use server::storage::{MemoryStorage, StorageHandle};
//!
//! #[tokio::main]
//! async fn main() -> std::io::Result<()> {
//!     let mut config = RelayConfig::default();
//!     config.port = 12345;
//!     config.backend_port = 12346;
//!
//!     let storage = StorageHandle::spawn(MemoryStorage::new());
//!     let mut server = Server::new(config, storage).await?;
//!
//!     // Ctrl+C stops accepting and closes every session
//!     let handle = server.handle();
//!     tokio::spawn(async move {
//!         let _ = tokio::signal::ctrl_c().await;
//!         handle.shutdown();
//!     });
//!
//!     server.run().await
//! }
//! ```

pub mod anticheat;
pub mod commands;
pub mod config;
pub mod hooks;
pub mod network;
pub mod registry;
pub mod session;
pub mod storage;
