//! # Game Server Library
//!
//! Authoritative session and synchronization core for a multiplayer voxel
//! shooter. The server owns every player's state, validates what clients
//! claim, and fans the results back out to everyone who needs them.
//!
//! ## Core Responsibilities
//!
//! ### Session Lifecycle
//! Each transport peer moves through a small state machine:
//! - Version check and player id assignment on connect
//! - A handshake that streams content packs
//! - Map, game state and roster delivery in one step, after which the peer
//!   is active
//! - Cleanup and a `PlayerLeft` broadcast on disconnect or timeout
//!
//! ### Authoritative Simulation
//! Health, deaths and respawns, tool cooldowns, ammunition and reloads,
//! block inventory and explosives are all simulated here on a fixed tick.
//! Client position reports are accepted only while they stay close to the
//! tracked position; otherwise the client is snapped back.
//!
//! ### Extension Hooks
//! Game rules plug in through named observer registries. `try_*` hooks
//! run before an action commits and may cancel it or rewrite its
//! parameters; `on_*` hooks observe the committed result.
//!
//! ## Architecture Design
//!
//! ### Single-Owner Event Loop
//! One task owns the [`protocol::Protocol`] and processes network events and
//! simulation ticks strictly one after another. Nothing else touches game
//! state, so there are no locks around it. Long-running work such as the
//! pack stream runs in its own task and reports back over a channel.
//!
//! ### UDP-Based Communication
//! Packets travel over UDP with a thin reliability layer: reliable frames
//! carry a sequence number, are acknowledged, and are resent until acked.
//! World snapshots go unreliable since a newer one is always on its way.
//!
//! ## Module Organization
//!
//! ### Transport (`network`, `client_manager`)
//! Socket receiver, sender and maintenance tasks, plus per-peer reliability
//! state: sequence numbers, duplicate suppression, retransmits and timeouts.
//!
//! ### Session (`protocol`, `connection`)
//! The coordinator that routes packets, runs the tick and exposes the
//! server-side operations (spawn, hurt, kill, build, chat, entities,
//! sounds), and the per-peer connection with its packet waiters.
//!
//! ### Game State (`tools`, `entity`, `game`, `world`, `physics`)
//! Tool and weapon state machines, world objects and explosives, teams and
//! the pluggable game mode, and the map and physics collaborators.
//!
//! ### Infrastructure (`event`, `hooks`, `id_pool`, `config`, `error`)
//! Observer registries, the named hook points, wire id allocation, settings
//! and content packs, and the error types.
//!
//! ## Usage Example
//!
//! ```rust,no_run
//! use server::config::ServerConfig;
//! use server::network::Server;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = ServerConfig {
//!         host: "127.0.0.1".into(),
//!         ..ServerConfig::default()
//!     };
//!     let mut server = Server::new(config, Vec::new()).await?;
//!
//!     // Runs until a shutdown is requested through `server.handle()`
//!     server.run().await?;
//!     Ok(())
//! }
//! ```

pub mod client_manager;
pub mod config;
pub mod connection;
pub mod entity;
pub mod error;
pub mod event;
pub mod game;
pub mod hooks;
pub mod id_pool;
pub mod network;
pub mod physics;
pub mod protocol;
pub mod tools;
pub mod world;
