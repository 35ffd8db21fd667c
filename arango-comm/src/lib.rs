//! The communication layer of an ArangoDB client.
//!
//! Below are the main areas that you should be looking at when working with this crate.
//!
//! ## Entry point
//! * [`communication::ArangoCommunication`], bootstraps the connection pool for a [`config::CommunicationConfig`]
//!   and executes requests against it with retries, failover and host affinity.
//!
//! ## Connections
//! * [`connection::ArangoConnection`], a single (re)connecting connection to one host over VST or HTTP.
//! * [`connection::ConnectionFactory`], creates connections and performs the authentication handshake.
//! * [`connection::message_store::MessageStore`], correlates VST message ids with their pending responses.
//!
//! ## Routing
//! * [`communication::pool::ConnectionPool`], selects a connection for a request given the topology.
//! * [`communication::conversation::ConversationManager`], pins a unit of work to a single host.

// A library must never write to the host application's stdout
#![deny(clippy::print_stdout)]
#![deny(clippy::print_stderr)]

pub mod auth;
pub mod codec;
pub mod communication;
pub mod config;
pub mod connection;
pub mod error;
pub mod host;
mod observability;
pub mod request;
pub mod tcp;
pub mod vpack;
