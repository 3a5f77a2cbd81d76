//! One live connection: framing, heartbeat, correlation and dispatch.
//!
//! A [`Channel`] owns exactly one socket for its whole life.  Once
//! [`serve`](Channel::serve) is called a dedicated task reads frames
//! until the first read error, then closes the socket, marks the
//! channel invalid and fires
//! [`on_disconnect`](super::handler::ChannelListener::on_disconnect).
//! A channel is never revived; reconnecting means building a new one.
//!
//! Inbound requests are routed to the [`HandlerTable`] by command
//! name.  Inbound responses are matched by request id against the
//! table of pending [`execute`](Channel::execute) calls.  Every
//! decoded message is handled on its own task, so a slow handler
//! never holds up the read loop.
//!
//! # Heartbeat
//!
//! Each header read is bounded by `now + heartbeat`.  When that
//! deadline passes with nothing received the channel sends a probe
//! and waits one more interval.  A second silent interval in a row
//! is treated as a dead link.

use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::io::AsyncWriteExt;
use tokio::sync::{oneshot, watch};
use tokio::time::Instant;
use tracing::{debug, error, info, trace, warn, Instrument};

use super::handler::{ChannelListener, HandlerTable};
use super::transport::{BoxReader, BoxWriter, Transport};
use crate::error::{Error, Result};
use crate::protocol::frame::{
    encode_frame, FrameError, FrameKind, FrameReader, HEARTBEAT_ACK, HEARTBEAT_PROBE,
};
use crate::protocol::message::{Envelope, Request, Response, ResultCode};

/// Default idle interval before a heartbeat probe is sent.
pub const DEFAULT_HEARTBEAT: Duration = Duration::from_secs(180);

static NEXT_CHANNEL_ID: AtomicU64 = AtomicU64::new(1);

/// Per-channel tuning.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChannelConfig {
    /// Idle interval after which a probe is sent.  Two idle
    /// intervals in a row close the channel.
    pub heartbeat: Duration,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            heartbeat: DEFAULT_HEARTBEAT,
        }
    }
}

pub struct Channel {
    id: u64,
    peer: String,
    config: ChannelConfig,
    handlers: Arc<HandlerTable>,
    listener: Option<Arc<dyn ChannelListener>>,
    pending: Mutex<HashMap<String, oneshot::Sender<Response>>>,
    valid: AtomicBool,
    writer: tokio::sync::Mutex<Option<BoxWriter>>,
    reader: Mutex<Option<(BoxReader, watch::Receiver<bool>)>>,
    closed: watch::Sender<bool>,
}

impl Channel {
    /// Bind a freshly established transport to a new, not yet
    /// serving channel.
    pub fn new(
        transport: Transport,
        handlers: Arc<HandlerTable>,
        listener: Option<Arc<dyn ChannelListener>>,
        config: ChannelConfig,
    ) -> Arc<Self> {
        let (closed, closed_rx) = watch::channel(false);
        Arc::new(Self {
            id: NEXT_CHANNEL_ID.fetch_add(1, Ordering::Relaxed),
            peer: transport.peer,
            config,
            handlers,
            listener,
            pending: Mutex::new(HashMap::new()),
            valid: AtomicBool::new(false),
            writer: tokio::sync::Mutex::new(Some(transport.writer)),
            reader: Mutex::new(Some((transport.reader, closed_rx))),
            closed,
        })
    }

    /// Start the channel: fire `on_connecting`, mark it valid, spawn
    /// the read loop and fire `on_connected`.  Only the first call
    /// has any effect.
    pub fn serve(self: &Arc<Self>) {
        let Some((reader, closed_rx)) = self.reader.lock().take() else {
            warn!(channel = %self, "channel is already serving");
            return;
        };
        if let Some(listener) = &self.listener {
            listener.on_connecting(self);
        }
        self.valid.store(true, Ordering::SeqCst);
        let span = tracing::info_span!("channel", id = self.id, peer = %self.peer);
        tokio::spawn(Arc::clone(self).read_loop(reader, closed_rx).instrument(span));
        if let Some(listener) = &self.listener {
            listener.on_connected(self);
        }
    }

    /// Process-unique identifier of this channel.
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn remote_addr(&self) -> &str {
        &self.peer
    }

    /// `true` between a successful `serve` and the first read failure.
    pub fn is_valid(&self) -> bool {
        self.valid.load(Ordering::SeqCst)
    }

    /// Close the socket.  The read loop notices, invalidates the
    /// channel and fires `on_disconnect`.
    pub fn close(&self) {
        self.closed.send_replace(true);
    }

    /// Send `request` and wait up to `timeout` for the matching
    /// response.
    ///
    /// Never fails with an error: transport and call faults come back
    /// as synthesized responses (`LINK_BROKEN`, `CLIENT_EXCEPTION`,
    /// `DUPLICATE_REQID`, `TIMEOUT`).
    pub async fn execute(&self, request: &Request, timeout: Duration) -> Response {
        let req_id = request.req_id();
        if !self.is_valid() {
            return Response::new(req_id, ResultCode::LinkBroken);
        }
        let body = match request.encode() {
            Ok(body) => body,
            Err(e) => return Response::with_errmsg(req_id, ResultCode::ClientException, e.to_string()),
        };
        let mut rx = {
            let mut pending = self.pending.lock();
            match pending.entry(req_id.to_string()) {
                Entry::Occupied(_) => return Response::new(req_id, ResultCode::DuplicateReqId),
                Entry::Vacant(slot) => {
                    let (tx, rx) = oneshot::channel();
                    slot.insert(tx);
                    rx
                }
            }
        };
        if let Err(e) = self.send(&body).await {
            self.pending.lock().remove(req_id);
            return Response::with_errmsg(req_id, ResultCode::ClientException, e.to_string());
        }

        match tokio::time::timeout(timeout, &mut rx).await {
            Ok(Ok(response)) => response,
            Ok(Err(_)) => Response::new(req_id, ResultCode::LinkBroken),
            Err(_) => {
                let expired = self.pending.lock().remove(req_id).is_some();
                if expired {
                    debug!(channel = %self, req_id, "request timed out");
                    return Response::new(req_id, ResultCode::Timeout);
                }
                // The response won the race: its sender already took the
                // slot and is handing the value over.
                rx.await
                    .unwrap_or_else(|_| Response::new(req_id, ResultCode::Timeout))
            }
        }
    }

    /// Send `request` without waiting for, or expecting, a response.
    pub async fn notice(&self, request: &Request) -> Result<()> {
        if !self.is_valid() {
            return Err(Error::LinkBroken);
        }
        let body = request.encode()?;
        self.send(&body).await
    }

    /// Write one message frame carrying an already encoded envelope.
    ///
    /// Bodies over [`MAX_BODY_LEN`](crate::protocol::frame::MAX_BODY_LEN)
    /// are rejected before anything is written.  A write failure
    /// closes the channel.
    pub async fn send(&self, body: &[u8]) -> Result<()> {
        let frame = encode_frame(body)?;
        self.write_frame(&frame).await
    }

    async fn write_frame(&self, bytes: &[u8]) -> Result<()> {
        let mut guard = self.writer.lock().await;
        let Some(writer) = guard.as_mut() else {
            return Err(Error::LinkBroken);
        };
        let result = match writer.write_all(bytes).await {
            Ok(()) => writer.flush().await,
            Err(e) => Err(e),
        };
        drop(guard);
        if let Err(e) = result {
            self.close();
            return Err(e.into());
        }
        Ok(())
    }

    async fn write_response(&self, response: &Response) -> Result<()> {
        if !self.is_valid() {
            return Err(Error::LinkBroken);
        }
        let body = response.encode()?;
        self.send(&body).await
    }

    async fn read_loop(self: Arc<Self>, reader: BoxReader, mut closed: watch::Receiver<bool>) {
        let mut frames = FrameReader::new(reader);
        let reason = tokio::select! {
            biased;
            _ = closed.wait_for(|stop| *stop) => None,
            err = self.pump(&mut frames) => Some(err),
        };
        match &reason {
            None => debug!("channel closed locally"),
            Some(FrameError::Closed) => info!("peer closed the connection"),
            Some(FrameError::Idle) => warn!("no heartbeat acknowledgement, dropping link"),
            Some(e) => error!(error = %e, "channel read error"),
        }

        drop(frames);
        self.valid.store(false, Ordering::SeqCst);
        self.closed.send_replace(true);
        if let Some(mut writer) = self.writer.lock().await.take() {
            if let Err(e) = writer.shutdown().await {
                trace!(error = %e, "socket shutdown failed");
            }
        }
        if let Some(listener) = &self.listener {
            listener.on_disconnect(&self);
        }
    }

    /// Read frames until the first fatal error, which is returned.
    async fn pump(self: &Arc<Self>, frames: &mut FrameReader<BoxReader>) -> FrameError {
        let heartbeat = self.config.heartbeat;
        let mut probed = false;
        loop {
            let kind = match frames.read_header(Instant::now() + heartbeat).await {
                Ok(kind) => kind,
                Err(FrameError::Idle) if !probed => {
                    probed = true;
                    debug!("link idle, sending heartbeat probe");
                    if let Err(e) = self.write_frame(&HEARTBEAT_PROBE).await {
                        error!(error = %e, "failed to send heartbeat probe");
                    }
                    continue;
                }
                Err(e) => return e,
            };
            probed = false;
            match kind {
                FrameKind::Probe => {
                    if let Err(e) = self.write_frame(&HEARTBEAT_ACK).await {
                        warn!(error = %e, "failed to acknowledge heartbeat");
                    }
                }
                FrameKind::Ack => trace!("heartbeat acknowledged"),
                FrameKind::Message(len) => {
                    let body = match frames.read_body(len, Instant::now() + heartbeat).await {
                        Ok(body) => body,
                        Err(e) => return e,
                    };
                    let channel = Arc::clone(self);
                    tokio::spawn(channel.dispatch(body).in_current_span());
                }
            }
        }
    }

    async fn dispatch(self: Arc<Self>, body: Vec<u8>) {
        match Envelope::decode(&body) {
            Ok(Envelope::Request(request)) => self.handle_request(request).await,
            Ok(Envelope::Response(response)) => self.deliver_response(response),
            Err(e) => warn!(error = %e, len = body.len(), "failed to decode envelope"),
        }
    }

    async fn handle_request(self: Arc<Self>, request: Request) {
        let response = match self.handlers.get(request.cmd()) {
            Some(handler) => handler.handle(Arc::clone(&self), request).await,
            None => {
                debug!(cmd = request.cmd(), req_id = request.req_id(), "no handler for command");
                Some(Response::with_errmsg(
                    request.req_id(),
                    ResultCode::HandlerNotFound,
                    request.cmd(),
                ))
            }
        };
        if let Some(response) = response {
            if let Err(e) = self.write_response(&response).await {
                error!(req_id = response.req_id(), error = %e, "write response error");
            }
        }
    }

    fn deliver_response(&self, response: Response) {
        let waiter = self.pending.lock().remove(response.req_id());
        match waiter {
            Some(tx) => {
                if tx.send(response).is_err() {
                    debug!("waiter dropped before its response arrived");
                }
            }
            None => warn!(req_id = response.req_id(), "drop unknown response"),
        }
    }

    #[cfg(test)]
    pub(crate) fn pending_len(&self) -> usize {
        self.pending.lock().len()
    }
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}]", self.peer)
    }
}

impl fmt::Debug for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Channel")
            .field("id", &self.id)
            .field("peer", &self.peer)
            .field("valid", &self.is_valid())
            .finish()
    }
}
