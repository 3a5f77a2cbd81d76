//! Outgoing connections.
//!
//! A [`Client`] dials one server address over plain TCP or TLS and
//! binds the resulting stream to a [`Channel`].  With a non-zero
//! redial interval the client keeps itself connected: a failed dial
//! is retried after the interval and a lost link is redialed as soon
//! as the channel reports its disconnect.  With a zero interval the
//! client dials exactly once.
//!
//! ```no_run
//! # use std::time::Duration;
//! # use warren_rpc::{Client, ClientOptions, Request};
//! # async fn demo() -> warren_rpc::Result<()> {
//! let client = Client::new(ClientOptions::new("127.0.0.1:7020").with_redial(Duration::from_secs(1)));
//! client.serve().await?;
//! let rsp = client.execute(&Request::new("echo"), Duration::from_secs(2)).await;
//! println!("{rsp}");
//! # Ok(())
//! # }
//! ```

use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use rustls::pki_types::ServerName;
use tokio::net::TcpStream;
use tokio::sync::watch;
use tokio_rustls::TlsConnector;
use tracing::{debug, info, warn};

use super::channel::{Channel, ChannelConfig};
use super::handler::{ChannelListener, Handler, HandlerTable};
use super::tls_util::{make_client_config, server_name};
use super::transport::Transport;
use crate::error::{Error, Result};
use crate::protocol::message::{Request, Response, ResultCode};

/// Default bound on a single TCP connect plus TLS handshake.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Pause between closing an old channel and dialing a new one in
/// [`Client::serve`].
const REPLACE_GRACE: Duration = Duration::from_millis(100);

/// TLS settings for outgoing connections.
#[derive(Clone)]
pub struct TlsOptions {
    pub config: Arc<rustls::ClientConfig>,
    /// Name the server certificate is verified against.
    pub server_name: ServerName<'static>,
}

impl TlsOptions {
    /// Trust the CA certificates in `ca_path` and verify the server
    /// as `server_name`.
    pub fn from_ca_file(ca_path: &Path, server_name_str: &str) -> Result<Self> {
        Ok(Self {
            config: make_client_config(ca_path)?,
            server_name: server_name(server_name_str)?,
        })
    }
}

#[derive(Clone)]
pub struct ClientOptions {
    /// `host:port` to dial.
    pub addr: String,
    /// Interval between dial attempts.  Zero dials once and never
    /// reconnects.
    pub redial: Duration,
    pub connect_timeout: Duration,
    pub tls: Option<TlsOptions>,
    pub channel: ChannelConfig,
}

impl ClientOptions {
    pub fn new(addr: impl Into<String>) -> Self {
        Self {
            addr: addr.into(),
            redial: Duration::ZERO,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            tls: None,
            channel: ChannelConfig::default(),
        }
    }

    pub fn with_redial(mut self, redial: Duration) -> Self {
        self.redial = redial;
        self
    }

    pub fn with_tls(mut self, tls: TlsOptions) -> Self {
        self.tls = Some(tls);
        self
    }

    pub fn with_channel(mut self, channel: ChannelConfig) -> Self {
        self.channel = channel;
        self
    }
}

/// A (re)connecting RPC client.
///
/// Register handlers first, then call [`serve`](Client::serve) or
/// [`serve_bg`](Client::serve_bg).  Handlers registered after the
/// first dial are not seen by the connection.
pub struct Client {
    options: ClientOptions,
    handlers: HandlerTable,
    listener: Option<Arc<dyn ChannelListener>>,
    dialer: Mutex<Option<Arc<Dialer>>>,
}

impl Client {
    pub fn new(options: ClientOptions) -> Self {
        Self {
            options,
            handlers: HandlerTable::new(),
            listener: None,
            dialer: Mutex::new(None),
        }
    }

    /// Set the callbacks fired for every channel this client creates.
    pub fn with_listener(mut self, listener: Arc<dyn ChannelListener>) -> Self {
        self.listener = Some(listener);
        self
    }

    /// Register an async handler.  Panics if `cmd` is taken.
    pub fn handle(&mut self, cmd: impl Into<String>, handler: impl Handler) {
        self.handlers.insert(cmd, handler);
    }

    /// Register a synchronous handler.  Panics if `cmd` is taken.
    pub fn handle_fn<F>(&mut self, cmd: impl Into<String>, f: F)
    where
        F: Fn(&Arc<Channel>, &Request) -> Option<Response> + Send + Sync + 'static,
    {
        self.handlers.insert_fn(cmd, f);
    }

    pub fn addr(&self) -> &str {
        &self.options.addr
    }

    fn dialer(&self) -> Arc<Dialer> {
        let mut slot = self.dialer.lock();
        let dialer = slot.get_or_insert_with(|| {
            Arc::new(Dialer {
                options: self.options.clone(),
                handlers: Arc::new(self.handlers.clone()),
                listener: self.listener.clone(),
                current: Mutex::new(None),
                dialing: watch::channel(false).0,
                stopped: AtomicBool::new(false),
            })
        });
        Arc::clone(dialer)
    }

    /// Dial and wait until connected.
    ///
    /// A live channel is closed and replaced.  With a zero redial
    /// interval a failed dial is returned as an error; otherwise this
    /// keeps trying until it connects or the client is shut down.
    ///
    /// If a background or redial loop is already running, this waits
    /// for that loop instead of starting another one.
    pub async fn serve(&self) -> Result<()> {
        let dialer = self.dialer();
        dialer.stopped.store(false, Ordering::SeqCst);
        let Some(guard) = dialer.claim() else {
            debug!(addr = %self.options.addr, "dial in progress, waiting for it");
            dialer.dial_finished().await;
            return match dialer.current.lock().as_ref() {
                Some(channel) if channel.is_valid() => Ok(()),
                _ => Err(Error::LinkBroken),
            };
        };
        let previous = dialer.current.lock().take();
        if let Some(previous) = previous {
            debug!(channel = %previous, "replacing live channel");
            previous.close();
            tokio::time::sleep(REPLACE_GRACE).await;
        }
        dialer.dial(guard).await.map(|_| ())
    }

    /// Dial on a background task.  Does nothing when a channel exists
    /// or a dial is already in progress.
    pub fn serve_bg(&self) {
        let dialer = self.dialer();
        let Some(guard) = dialer.claim() else {
            return;
        };
        // A finished dial publishes its channel before releasing the
        // claim, so this check cannot miss it.
        if dialer.current.lock().is_some() {
            return;
        }
        dialer.stopped.store(false, Ordering::SeqCst);
        tokio::spawn(async move {
            let _ = dialer.dial(guard).await;
        });
    }

    /// The current channel, if one has been established.
    pub fn channel(&self) -> Option<Arc<Channel>> {
        self.dialer.lock().as_ref().and_then(|d| d.current.lock().clone())
    }

    pub fn is_valid(&self) -> bool {
        self.channel().is_some_and(|c| c.is_valid())
    }

    /// Call the server.  See [`Channel::execute`].
    pub async fn execute(&self, request: &Request, timeout: Duration) -> Response {
        match self.channel() {
            Some(channel) => channel.execute(request, timeout).await,
            None => Response::new(request.req_id(), ResultCode::LinkBroken),
        }
    }

    /// Send a one-way request.  See [`Channel::notice`].
    pub async fn notice(&self, request: &Request) -> Result<()> {
        match self.channel() {
            Some(channel) => channel.notice(request).await,
            None => Err(Error::LinkBroken),
        }
    }

    /// Drop the current link.  A configured redial reconnects.
    pub fn close(&self) {
        if let Some(channel) = self.channel() {
            channel.close();
        }
    }

    /// Drop the current link and stop redialing.
    pub fn shutdown(&self) {
        if let Some(dialer) = self.dialer.lock().as_ref() {
            dialer.stopped.store(true, Ordering::SeqCst);
        }
        self.close();
    }
}

/// Shared dial state.  Channels hold it weakly through [`DialHook`].
struct Dialer {
    options: ClientOptions,
    handlers: Arc<HandlerTable>,
    listener: Option<Arc<dyn ChannelListener>>,
    current: Mutex<Option<Arc<Channel>>>,
    /// `true` while a dial loop owns the right to dial.
    dialing: watch::Sender<bool>,
    stopped: AtomicBool,
}

/// Exclusive right to run the dial loop.  Released on drop.
struct DialingGuard {
    dialer: Arc<Dialer>,
}

impl Drop for DialingGuard {
    fn drop(&mut self) {
        self.dialer.dialing.send_replace(false);
    }
}

impl Dialer {
    /// Take the dial right, or `None` if another loop holds it.
    fn claim(self: &Arc<Self>) -> Option<DialingGuard> {
        let claimed = self.dialing.send_if_modified(|dialing| {
            if *dialing {
                return false;
            }
            *dialing = true;
            true
        });
        claimed.then(|| DialingGuard {
            dialer: Arc::clone(self),
        })
    }

    async fn dial_finished(&self) {
        let mut dialing = self.dialing.subscribe();
        let _ = dialing.wait_for(|dialing| !*dialing).await;
    }

    async fn dial(self: &Arc<Self>, guard: DialingGuard) -> Result<Arc<Channel>> {
        let addr = &self.options.addr;
        loop {
            if self.stopped.load(Ordering::SeqCst) {
                return Err(Error::ClientShutdown);
            }
            match self.connect().await {
                Ok(transport) => {
                    let hook: Arc<dyn ChannelListener> = Arc::new(DialHook {
                        dialer: Arc::downgrade(self),
                    });
                    let channel = Channel::new(
                        transport,
                        Arc::clone(&self.handlers),
                        Some(hook),
                        self.options.channel,
                    );
                    *self.current.lock() = Some(Arc::clone(&channel));
                    drop(guard);
                    info!(%addr, channel = %channel, "connected");
                    channel.serve();
                    return Ok(channel);
                }
                Err(e) => {
                    warn!(%addr, error = %e, "connect to server failed");
                    if self.options.redial.is_zero() {
                        return Err(e);
                    }
                    tokio::time::sleep(self.options.redial).await;
                }
            }
        }
    }

    async fn connect(&self) -> Result<Transport> {
        let addr = &self.options.addr;
        let limit = self.options.connect_timeout;
        let timed_out = || Error::ConnectTimeout { addr: addr.clone() };

        let stream = tokio::time::timeout(limit, TcpStream::connect(addr))
            .await
            .map_err(|_| timed_out())??;
        let Some(tls) = &self.options.tls else {
            return Ok(Transport::tcp(stream));
        };

        let peer = stream
            .peer_addr()
            .map(|a| a.to_string())
            .unwrap_or_else(|_| addr.clone());
        if let Err(e) = stream.set_nodelay(true) {
            debug!(%peer, error = %e, "set_nodelay failed");
        }
        let connector = TlsConnector::from(Arc::clone(&tls.config));
        let stream = tokio::time::timeout(limit, connector.connect(tls.server_name.clone(), stream))
            .await
            .map_err(|_| timed_out())??;
        Ok(Transport::new(peer, stream))
    }

    fn is_current(&self, channel: &Arc<Channel>) -> bool {
        self.current
            .lock()
            .as_ref()
            .is_some_and(|c| c.id() == channel.id())
    }
}

/// Forwards channel events to the user's listener and drives redial.
struct DialHook {
    dialer: Weak<Dialer>,
}

impl ChannelListener for DialHook {
    fn on_connecting(&self, channel: &Arc<Channel>) {
        if let Some(listener) = self.dialer.upgrade().and_then(|d| d.listener.clone()) {
            listener.on_connecting(channel);
        }
    }

    fn on_connected(&self, channel: &Arc<Channel>) {
        if let Some(listener) = self.dialer.upgrade().and_then(|d| d.listener.clone()) {
            listener.on_connected(channel);
        }
    }

    fn on_disconnect(&self, channel: &Arc<Channel>) {
        let Some(dialer) = self.dialer.upgrade() else {
            return;
        };
        if let Some(listener) = &dialer.listener {
            listener.on_disconnect(channel);
        }
        // A channel replaced by `serve` is no longer current and must
        // not trigger a second dial.
        if !dialer.is_current(channel) {
            return;
        }
        if dialer.options.redial.is_zero() || dialer.stopped.load(Ordering::SeqCst) {
            return;
        }
        let Some(guard) = dialer.claim() else {
            return;
        };
        info!(addr = %dialer.options.addr, "link lost, redialing");
        tokio::spawn(async move {
            let _ = dialer.dial(guard).await;
        });
    }
}
