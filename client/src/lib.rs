//! # Heartbeat Client Library
//!
//! Client role of the fixed-frame control-channel protocol. A client connects
//! to the server, receives an immediate PING, and answers every PING with a
//! PONG to stay registered.
//!
//! Frames are read whole: every receive consumes exactly
//! [`shared::FRAME_SIZE`] bytes from the stream.
//!
//! ## Usage Example
//!
//! ```rust,no_run
//! use client::network::Client;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let mut client = Client::connect("127.0.0.1", 9000).await?;
//!     client.run().await?;
//!     Ok(())
//! }
//! ```

pub mod network;
