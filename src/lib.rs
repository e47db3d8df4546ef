//! # NMEA 2000 State Aggregator and Fan-Out Server
//!
//! This crate implements a real-time aggregation daemon for a vessel's
//! NMEA 2000 bus. An external analyzer feeds it one JSON record per
//! decoded frame on stdin; TCP clients read the accumulated state or the
//! live stream back out.
//!
//! ## Features
//!
//! - Ingest newline-terminated JSON records from the analyzer stream.
//! - Keep the latest message per `(PGN, source, secondary key)` with
//!   per-message expiry.
//! - Serve a full-state JSON snapshot to one-shot TCP clients.
//! - Mirror every ingested record to streaming TCP clients, in order.
//! - Accept NMEA 0183 clients on a second port for the translator
//!   subsystem.
//! - Forward (or tee, or discard) client-submitted lines via stdout modes.
//! - Single-threaded readiness loop; no locks, no background workers.
//!
//! ## Architecture Overview
//!
//! The crate is organized into several modules:
//!
//! - [`clock`](crate::clock) — wall-clock seconds and milliseconds.
//! - [`record`](crate::record) — record validation and key extraction.
//! - [`ingest`](crate::ingest) — line reassembly driving store and
//!   broadcast buffer.
//! - [`store`](crate::store) — the per-PGN message table and the snapshot
//!   builder.
//! - [`registry`](crate::registry) — typed slots for accepted clients.
//! - [`server`](crate::server) — listeners and the readiness event loop.
//! - [`defs`](crate::defs) — shared constants and timing parameters.
//! - [`errors`](crate::errors) — error types used across modules.
//!
//! ## TCP Protocol
//!
//! The JSON port serves two client styles:
//!
//! - connect and wait: after roughly half a second the server sends one
//!   JSON object holding every live message, then closes;
//! - connect and send a line ending in `-`: the connection switches to
//!   streaming and mirrors every subsequently ingested record, one per
//!   line, until disconnect.
//!
//! The port above it accepts NMEA 0183 clients; that byte protocol is
//! owned by the translator subsystem.
//!
//! ## Example: Running the Server
//!
//! ```no_run
//! use n2kd::registry::OutputMode;
//! use n2kd::server::{Server, ServerConfig};
//!
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let mut server = Server::new(ServerConfig {
//!         port: 2597,
//!         output_mode: OutputMode::Stream,
//!     })?;
//!     server.run()?;
//!     Ok(())
//! }
//! ```

#![warn(missing_docs)]
#![deny(unreachable_pub)]

pub mod clock;
pub mod defs;
pub mod errors;
pub mod ingest;
pub mod record;
pub mod registry;
pub mod server;
pub mod store;
