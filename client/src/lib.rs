//! # Scripted Client Library
//!
//! A headless stand-in for the game client. It speaks the client->server side
//! of the protocol over TCP, so it can be pointed at the relay (or straight at
//! a game server) to drive a player without the real game running.
//!
//! ## Module Organization
//!
//! ### Network Module (`network`)
//! A framed [`network::Connection`] over any async stream: packets go out
//! through the client->server schema and come back through the
//! server->client one.
//!
//! ### Game Module (`game`)
//! [`game::LocalPlayer`] keeps the bot's own entity record in step with what
//! the server reports and produces the updates a real client would send:
//! the joining update, small random walks and chat lines.
//!
//! ## Usage Example
//!
//! ```rust,no_run
//! use client::game::LocalPlayer;
//! use client::network::Connection;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let mut connection = Connection::connect("127.0.0.1:12345").await?;
//!     let mut player = LocalPlayer::new(42, "Bot");
//!
//!     connection.send(&player.join_packet()).await?;
//!     connection.send(&LocalPlayer::chat("hello")).await?;
//!
//!     while let Some(packet) = connection.recv().await? {
//!         if let Some(line) = player.apply(&packet) {
//!             println!("{line}");
//!         }
//!     }
//!     Ok(())
//! }
//! ```

pub mod game;
pub mod network;
