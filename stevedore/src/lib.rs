//! stevedore hosts long-lived message-oriented services over stream and
//! datagram transports. Both endpoint shapes are built from the same parts:
//! a receiver (server) or sender (client) shell binds the transport, a
//! [`factory::ProtocolFactory`] builds one [`connection::Connection`] per
//! peer, and every connection runs a [`codec::Codec`] to turn raw bytes into
//! message objects that are either handed to an [`action::Action`] (one-way
//! servers) or correlated against pending requests (two-way clients). A
//! process-wide [`manager::ConnectionsManager`] tracks live connections and
//! lets callers wait on arbitrary connection counts.

pub mod action;
pub mod adaptor;
pub mod codec;
pub mod config;
pub mod connection;
pub mod counters;
pub mod factory;
pub mod manager;
pub mod message;
pub mod notify;
pub mod receiver;
pub mod recording;
pub mod requester;
pub mod sender;
pub mod signals;
pub mod status;
pub mod transport;
