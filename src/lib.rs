#![deny(missing_debug_implementations)]
#![cfg_attr(docsrs, feature(doc_cfg))]
//! # Aula
//! Aula is a room and signaling layer for building multi-party conferencing
//! servers. It manages peers, their media resources and the request/notify
//! signaling protocol between server and clients, on top of a pluggable media
//! engine. This doesn't provide a socket server, please bind your own socket
//! layer through [`signaling::SignalingConnection`] and route inbound requests
//! into [`room::Room::handle_request`].

/// Configuration for [`room::Room`] and its peers.
pub mod config;
/// Media engine abstraction the rooms drive.
pub mod engine;
pub mod error;
/// Reconnection grace handling for disconnected peers.
pub mod liveness;
/// Signaling protocol messages and payloads.
pub mod message;
/// Peer is a module that owns the media resources of one participant.
pub mod peer;
/// Durable room records behind the in-memory rooms.
pub mod record;
/// Room is a module that coordinates peers and dispatches their requests.
pub mod room;
/// Server is a module that manages multiple rooms.
pub mod server;
pub mod signaling;

#[cfg(test)]
mod test_support;
