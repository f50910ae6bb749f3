//! relay - a multi-client text chat relay.
//!
//! Clients connect over TCP, claim a unique display name, and exchange
//! messages addressed to a named peer. The server keeps the joined sessions
//! in a [`session::SessionRegistry`], runs one [`router`] task per
//! connection, and exposes operator actions through [`admin::Admin`].

pub mod admin;
pub mod catalog;
pub mod client;
pub mod config;
pub mod protocol;
pub mod router;
pub mod server;
pub mod session;
