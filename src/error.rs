//! Crate-wide error type.
//!
//! Transport faults surface as [`Error`].  Call faults and
//! application faults do not: [`Channel::execute`] always returns a
//! [`Response`] whose result code describes what went wrong.
//!
//! [`Channel::execute`]: crate::network::channel::Channel::execute
//! [`Response`]: crate::protocol::message::Response

use std::io;

use thiserror::Error;

use crate::protocol::frame::FrameError;

#[derive(Debug, Error)]
pub enum Error {
    #[error("link broken")]
    LinkBroken,
    #[error("frame: {0}")]
    Frame(#[from] FrameError),
    #[error("codec: {0}")]
    Codec(#[from] postcard::Error),
    #[error("tls: {0}")]
    Tls(#[from] rustls::Error),
    #[error("invalid tls server name `{0}`")]
    InvalidServerName(String),
    #[error("no private key found in {0}")]
    MissingPrivateKey(String),
    #[error("client is shut down")]
    ClientShutdown,
    #[error("server is already listening")]
    AlreadyServing,
    #[error("connect to {addr} timed out")]
    ConnectTimeout { addr: String },
    #[error(transparent)]
    Io(#[from] io::Error),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
