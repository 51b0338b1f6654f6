//! mSIM server core.
//!
//! A line-oriented instant-messaging server: clients hold a long-lived
//! plaintext TCP connection, authenticate, exchange messages with end-to-end
//! acknowledgements, manage contact lists, and hand off point-to-point file
//! transfers to a broker that splices two ephemeral TCP streams together.

pub mod config;
pub mod connection;
pub mod control;
pub mod db;
pub mod protocol;
pub mod server;
pub mod transfer;
