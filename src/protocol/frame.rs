//! Binary framing for the wire.
//!
//! Every unit on the wire is a 4 byte header followed by a body:
//!
//! ```text
//! +------+--------------------------+----------------+
//! | 0xAA | body length (24 bit, BE) | body (length)  |
//! +------+--------------------------+----------------+
//! ```
//!
//! Two lengths are reserved and carry no body: `0` is a heartbeat
//! probe and `1` is the acknowledgement a peer sends back for it.
//! Any other length announces an encoded
//! [`Envelope`](crate::protocol::message::Envelope).
//!
//! [`FrameReader`] pulls frames off an async byte stream.  It keeps
//! partially read headers across idle deadlines so that a slow peer
//! cannot desynchronise the stream.

use std::io;

use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::time::{timeout_at, Instant};

/// First byte of every header.
pub const FRAME_MARKER: u8 = 0xAA;

/// Size of the frame header in bytes.
pub const HEADER_LEN: usize = 4;

/// Largest body a single frame can announce.
pub const MAX_BODY_LEN: usize = 0x00FF_FFFF;

/// Heartbeat probe: a header announcing a zero length body.
pub const HEARTBEAT_PROBE: [u8; HEADER_LEN] = [FRAME_MARKER, 0, 0, 0];

/// Heartbeat acknowledgement: a header announcing a one byte body
/// that is never sent.
pub const HEARTBEAT_ACK: [u8; HEADER_LEN] = [FRAME_MARKER, 0, 0, 1];

#[derive(Debug, Error)]
pub enum FrameError {
    #[error("invalid frame marker {0:#04x}")]
    BadMarker(u8),
    #[error("frame body of {0} bytes exceeds the {MAX_BODY_LEN} byte limit")]
    Oversize(usize),
    #[error("frame body of {0} bytes collides with a heartbeat length")]
    Reserved(usize),
    /// No bytes arrived before the read deadline.
    #[error("read deadline elapsed")]
    Idle,
    /// The peer closed the stream on a frame boundary.
    #[error("connection closed by peer")]
    Closed,
    #[error(transparent)]
    Io(#[from] io::Error),
}

/// What a decoded header announces.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameKind {
    Probe,
    Ack,
    Message(usize),
}

impl FrameKind {
    pub fn decode(header: [u8; HEADER_LEN]) -> Result<Self, FrameError> {
        if header[0] != FRAME_MARKER {
            return Err(FrameError::BadMarker(header[0]));
        }
        let len = u32::from_be_bytes([0, header[1], header[2], header[3]]) as usize;
        Ok(match len {
            0 => FrameKind::Probe,
            1 => FrameKind::Ack,
            n => FrameKind::Message(n),
        })
    }
}

/// Build a message frame (header + body) ready to be written in one go.
pub fn encode_frame(body: &[u8]) -> Result<Vec<u8>, FrameError> {
    let len = body.len();
    if len > MAX_BODY_LEN {
        return Err(FrameError::Oversize(len));
    }
    if len < 2 {
        return Err(FrameError::Reserved(len));
    }
    let mut out = Vec::with_capacity(HEADER_LEN + len);
    out.extend_from_slice(&(len as u32).to_be_bytes());
    out[0] = FRAME_MARKER;
    out.extend_from_slice(body);
    Ok(out)
}

/// Reads frames from one half of a connection.
pub struct FrameReader<R> {
    inner: R,
    header: [u8; HEADER_LEN],
    filled: usize,
}

impl<R: AsyncRead + Unpin> FrameReader<R> {
    pub fn new(inner: R) -> Self {
        Self {
            inner,
            header: [0; HEADER_LEN],
            filled: 0,
        }
    }

    /// Read the next header, giving up with [`FrameError::Idle`] if
    /// `deadline` passes first.  Bytes already received are kept for
    /// the next call.
    pub async fn read_header(&mut self, deadline: Instant) -> Result<FrameKind, FrameError> {
        while self.filled < HEADER_LEN {
            let n = match timeout_at(deadline, self.inner.read(&mut self.header[self.filled..])).await
            {
                Ok(read) => read?,
                Err(_) => return Err(FrameError::Idle),
            };
            if n == 0 {
                return Err(if self.filled == 0 {
                    FrameError::Closed
                } else {
                    io::Error::from(io::ErrorKind::UnexpectedEof).into()
                });
            }
            self.filled += n;
        }
        self.filled = 0;
        FrameKind::decode(self.header)
    }

    /// Read exactly `len` body bytes.  A stream that ends early is an
    /// `UnexpectedEof` I/O error.
    pub async fn read_body(&mut self, len: usize, deadline: Instant) -> Result<Vec<u8>, FrameError> {
        let mut body = vec![0u8; len];
        match timeout_at(deadline, self.inner.read_exact(&mut body)).await {
            Ok(read) => {
                read?;
                Ok(body)
            }
            Err(_) => Err(FrameError::Idle),
        }
    }
}
