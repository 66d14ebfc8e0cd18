//! Line-based TCP chat relay.
//!
//! Clients connect, send a display name as their first line, then exchange
//! room chat and direct messages through the relay. Each module focuses on a
//! concrete responsibility:
//!
//! - [`framer`] turns raw socket reads into `\n`-terminated lines.
//! - [`connection`] is the shared write side of one client plus its close latch.
//! - [`registry`] is the synchronized name <-> connection map.
//! - [`router`] delivers broadcasts and direct messages from registry snapshots.
//! - [`protocol`] parses client commands and renders relay lines.
//! - [`session`] runs the per-connection state machine.
//! - [`relay`] accepts TCP connections and spawns a session task for each.
//! - [`cli`] and [`client`] provide the command-line relay and terminal client.
//!
//! Integration tests drive the relay over real sockets; unit tests use
//! in-memory duplex pipes.

pub mod cli;
pub mod client;
pub mod connection;
pub mod framer;
pub mod protocol;
pub mod registry;
pub mod relay;
pub mod router;
pub mod session;
