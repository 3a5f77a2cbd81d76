//! Protocol primitives: what travels on the wire.
//!
//! Nothing in this module performs network I/O beyond reading from
//! an already established byte stream.  [`entity`] defines the typed
//! parameters, [`message`] the request/response envelope and
//! [`frame`] the length-prefixed framing with its heartbeat signals.

pub mod entity;
pub mod frame;
pub mod message;
