//! mxircd - Matrix-IRC bridge connection core.
//!
//! Maintains one virtual IRC client per bridged Matrix user, the identifier
//! assignment queues those clients depend on, and the deduplication broker
//! that decides which of many redundant TCP streams relays a given IRC line.
//! The Matrix side of the bridge is an external collaborator reached through
//! the [`irc::EventSink`] and [`db::DataStore`] interfaces.

pub mod config;
pub mod db;
pub mod error;
pub mod http;
pub mod irc;
pub mod metrics;
pub mod util;
