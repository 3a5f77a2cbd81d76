//! Networking layers.
//!
//! Everything that touches a socket lives here.  [`transport`] and
//! [`tls_util`] produce established byte streams, [`channel`] runs the
//! framing, heartbeat and call correlation over one stream, and
//! [`connector`] and [`acceptor`] create channels from outgoing and
//! incoming connections.  [`registry`] adds presence tracking and
//! broadcast on top of both ends.

pub mod acceptor;
pub mod channel;
pub mod connector;
pub mod handler;
pub mod registry;
pub mod tls_util;
pub mod transport;
