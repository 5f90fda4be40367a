//! Multi-room chat relay with out-of-band file exchange.
//!
//! Clients speak a newline-delimited text protocol (`LOGIN:`, `JOIN:`, `MSG:`,
//! `PM:`, `LEAVE`, `LOGOUT`) on the chat listener, and upload or download
//! files on a second listener. Each module focuses on one responsibility:
//!
//! - [`cli`] parses the command-line configuration.
//! - [`protocol`] holds the chat wire format and line I/O helpers.
//! - [`session`] runs the per-connection state machine and owns the bounded
//!   outbound queue of each connection.
//! - [`directory`] is the shared registry of usernames and room members.
//! - [`relay`] fans messages out to rooms and single users.
//! - [`server`] accepts chat connections and drives sessions.
//! - [`files`] stores uploads, serves downloads and announces new files.
//! - [`error`] defines protocol and transfer errors.
//!
//! Room broadcasts are delivered to every member, the sender included.

pub mod cli;
pub mod directory;
pub mod error;
pub mod files;
pub mod protocol;
pub mod relay;
pub mod server;
pub mod session;
