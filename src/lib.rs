//! Bidirectional RPC over framed TCP and TLS links.
//!
//! Either end of a connection can call the other: a [`Request`] names
//! a command and carries an [`EntityBag`] of typed parameters, and
//! the peer's handler for that command answers with a [`Response`].
//! [`Client`] dials (and optionally keeps redialing) a [`Server`];
//! [`Registry`] is a server that also tracks who is connected and can
//! push notices to everyone or to named groups.
//!
//! The crate never installs a `tracing` subscriber.  The embedding
//! program decides where logs go; the `warren` binary shows one way.

pub mod config;
pub mod error;
pub mod network;
pub mod protocol;

pub use error::{Error, Result};
pub use network::acceptor::Server;
pub use network::channel::{Channel, ChannelConfig};
pub use network::connector::{Client, ClientOptions, TlsOptions};
pub use network::handler::{ChannelListener, FnHandler, Handler, HandlerTable};
pub use network::registry::{ChannelInfo, Presence, Registry, RegistryClient, REGISTER_CMD};
pub use protocol::entity::{EntityBag, EntityError, Value};
pub use protocol::message::{Request, Response, ResultCode};
