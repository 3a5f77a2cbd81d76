//! Byte-stream abstraction shared by plain TCP and TLS links.
//!
//! A [`Transport`] is an established connection split into an owned
//! read half and an owned write half.  The halves are boxed so that
//! a [`Channel`](super::channel::Channel) does not care whether it
//! sits on a `TcpStream`, a client or server `TlsStream`, or an
//! in-memory pipe in tests.

use std::fmt;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;

pub type BoxReader = Box<dyn AsyncRead + Send + Unpin>;
pub type BoxWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// An established connection ready to be bound to a channel.
pub struct Transport {
    /// Remote address, used for diagnostics only.
    pub peer: String,
    pub reader: BoxReader,
    pub writer: BoxWriter,
}

impl Transport {
    /// Wrap any bidirectional stream.
    pub fn new<S>(peer: impl Into<String>, stream: S) -> Self
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (reader, writer) = tokio::io::split(stream);
        Self {
            peer: peer.into(),
            reader: Box::new(reader),
            writer: Box::new(writer),
        }
    }

    /// Wrap a plain TCP stream using its own halves, which avoids
    /// the shared lock `tokio::io::split` needs.
    pub fn tcp(stream: TcpStream) -> Self {
        let peer = stream
            .peer_addr()
            .map(|a| a.to_string())
            .unwrap_or_else(|_| "unknown".to_string());
        if let Err(e) = stream.set_nodelay(true) {
            tracing::debug!(%peer, error = %e, "set_nodelay failed");
        }
        let (reader, writer) = stream.into_split();
        Self {
            peer,
            reader: Box::new(reader),
            writer: Box::new(writer),
        }
    }
}

impl fmt::Debug for Transport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Transport").field("peer", &self.peer).finish()
    }
}
