//! # Heartbeat Server Library
//!
//! This library provides the server half of a small control-channel protocol.
//! Clients connect over TCP, receive an immediate PING, and are expected to
//! answer periodic PINGs with PONGs to stay registered.
//!
//! ## Architecture Design
//!
//! ### Acceptor Pool
//! Several acceptor loops share one listening socket. The OS hands every new
//! connection to exactly one of them, which registers it, spawns its
//! connection task and sends the accept-time PING.
//!
//! ### Connection Tasks
//! Each connection is read by exactly one task. The task waits for readiness,
//! reads one fixed-size frame per read until the socket would block, and
//! tears the connection down on any short read, zero-byte read or I/O error.
//! Unknown packet types are logged and ignored.
//!
//! ### Shared Registry
//! The [`registry::ConnectionRegistry`] is the only state shared by every
//! loop. It lives behind a read-write lock so that registration and removal
//! are atomic to all readers, and removal is idempotent so that whichever task
//! sees a failure first performs the cleanup.
//!
//! ### Heartbeat and Broadcast
//! The heartbeat loop PINGs every registered connection on a fixed interval.
//! Broadcast sends one frame to every connection but the sender and reaps
//! peers it finds already closed.
//!
//! ## Module Organization
//!
//! - `config` - server settings and their defaults
//! - `error` - server error taxonomy
//! - `registry` - connection table
//! - `peer` - per-connection socket wrapper with whole-frame writes
//! - `network` - listener, acceptor pool and frame dispatch
//! - `heartbeat` - periodic PING scheduler
//! - `broadcast` - fan-out with dead-peer reaping
//! - `shutdown` - cooperative shutdown flag
//! - `utils` - bootstrap helpers
//!
//! ## Usage Example
//!
//! ```rust,no_run
//! use server::config::ServerConfig;
//! use server::network::Server;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let server = Server::bind(ServerConfig::new(9000)).await?;
//!
//!     let shutdown = server.shutdown_handle();
//!     tokio::spawn(async move {
//!         let _ = tokio::signal::ctrl_c().await;
//!         shutdown.trigger();
//!     });
//!
//!     server.run().await?;
//!     Ok(())
//! }
//! ```

pub mod broadcast;
pub mod config;
pub mod error;
pub mod heartbeat;
pub mod network;
pub mod peer;
pub mod registry;
pub mod shutdown;
pub mod utils;
