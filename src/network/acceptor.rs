//! Listener for incoming connections.
//!
//! The [`Server`] binds a TCP port, optionally performs a TLS
//! handshake with each peer and binds every accepted stream to its
//! own [`Channel`].  The accept loop never waits on a connection:
//! plain sockets are bound inline and TLS handshakes run on their own
//! task.
//!
//! [`Server::stop`] ends the accept loop and makes the pending
//! `serve` call return `Ok(())`.  Channels that are already running
//! are left alone.

use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use rustls::ServerConfig;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio_rustls::TlsAcceptor;
use tracing::{debug, error, info, warn};

use super::channel::{Channel, ChannelConfig};
use super::handler::{ChannelListener, Handler, HandlerTable};
use super::tls_util::{make_server_config, make_server_config_from_pem};
use super::transport::Transport;
use crate::error::{Error, Result};
use crate::protocol::message::{Request, Response};

/// Bound on a single inbound TLS handshake.
pub const TLS_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

pub struct Server {
    handlers: HandlerTable,
    config: ChannelConfig,
    stop: watch::Sender<bool>,
    local_addr: Mutex<Option<SocketAddr>>,
}

impl Default for Server {
    fn default() -> Self {
        Self::new()
    }
}

impl Server {
    pub fn new() -> Self {
        Self {
            handlers: HandlerTable::new(),
            config: ChannelConfig::default(),
            stop: watch::channel(false).0,
            local_addr: Mutex::new(None),
        }
    }

    /// Channel settings applied to every accepted connection.
    pub fn with_channel_config(mut self, config: ChannelConfig) -> Self {
        self.config = config;
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

    /// Address of the listening socket while `serve` is running.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        *self.local_addr.lock()
    }

    /// Accept plain TCP connections on `addr` until stopped.
    pub async fn serve(&self, addr: &str, listener: Option<Arc<dyn ChannelListener>>) -> Result<()> {
        let socket = TcpListener::bind(addr).await?;
        self.run(socket, None, listener).await
    }

    /// Accept TLS connections on `addr` until stopped.
    pub async fn serve_tls(
        &self,
        addr: &str,
        tls: Arc<ServerConfig>,
        listener: Option<Arc<dyn ChannelListener>>,
    ) -> Result<()> {
        let socket = TcpListener::bind(addr).await?;
        self.run(socket, Some(TlsAcceptor::from(tls)), listener).await
    }

    /// [`serve_tls`](Self::serve_tls) with an in-memory PEM
    /// certificate chain and key.
    pub async fn serve_tls_with_pem(
        &self,
        addr: &str,
        cert_pem: &[u8],
        key_pem: &[u8],
        listener: Option<Arc<dyn ChannelListener>>,
    ) -> Result<()> {
        let tls = make_server_config_from_pem(cert_pem, key_pem)?;
        self.serve_tls(addr, tls, listener).await
    }

    /// [`serve_tls`](Self::serve_tls) with PEM files on disk.
    pub async fn serve_tls_with_pem_file(
        &self,
        addr: &str,
        cert_path: &Path,
        key_path: &Path,
        listener: Option<Arc<dyn ChannelListener>>,
    ) -> Result<()> {
        let tls = make_server_config(cert_path, key_path)?;
        self.serve_tls(addr, tls, listener).await
    }

    /// Accept plain TCP connections on an already bound socket.
    pub async fn serve_on(
        &self,
        socket: TcpListener,
        listener: Option<Arc<dyn ChannelListener>>,
    ) -> Result<()> {
        self.run(socket, None, listener).await
    }

    /// Accept TLS connections on an already bound socket.
    pub async fn serve_tls_on(
        &self,
        socket: TcpListener,
        tls: Arc<ServerConfig>,
        listener: Option<Arc<dyn ChannelListener>>,
    ) -> Result<()> {
        self.run(socket, Some(TlsAcceptor::from(tls)), listener).await
    }

    /// Stop accepting.  The running `serve` call returns `Ok(())`.
    pub fn stop(&self) {
        self.stop.send_replace(true);
    }

    async fn run(
        &self,
        socket: TcpListener,
        tls: Option<TlsAcceptor>,
        listener: Option<Arc<dyn ChannelListener>>,
    ) -> Result<()> {
        let local = socket.local_addr()?;
        {
            let mut slot = self.local_addr.lock();
            if slot.is_some() {
                return Err(Error::AlreadyServing);
            }
            self.stop.send_replace(false);
            *slot = Some(local);
        }
        let mut stop = self.stop.subscribe();
        let handlers = Arc::new(self.handlers.clone());
        info!(%local, tls = tls.is_some(), "start serving");

        let result = loop {
            let accepted = tokio::select! {
                biased;
                _ = stop.wait_for(|stopped| *stopped) => break Ok(()),
                accepted = socket.accept() => accepted,
            };
            match accepted {
                Ok((stream, peer)) => {
                    debug!(%peer, "accepted connection");
                    self.start_channel(stream, peer, tls.clone(), &handlers, listener.clone());
                }
                Err(e) => {
                    error!(%local, error = %e, "accept failed");
                    break Err(e.into());
                }
            }
        };

        *self.local_addr.lock() = None;
        info!(%local, "stopped serving");
        result
    }

    fn start_channel(
        &self,
        stream: TcpStream,
        peer: SocketAddr,
        tls: Option<TlsAcceptor>,
        handlers: &Arc<HandlerTable>,
        listener: Option<Arc<dyn ChannelListener>>,
    ) {
        let config = self.config;
        let handlers = Arc::clone(handlers);
        let Some(acceptor) = tls else {
            Channel::new(Transport::tcp(stream), handlers, listener, config).serve();
            return;
        };
        tokio::spawn(async move {
            if let Err(e) = stream.set_nodelay(true) {
                debug!(%peer, error = %e, "set_nodelay failed");
            }
            match tokio::time::timeout(TLS_HANDSHAKE_TIMEOUT, acceptor.accept(stream)).await {
                Ok(Ok(stream)) => {
                    let transport = Transport::new(peer.to_string(), stream);
                    Channel::new(transport, handlers, listener, config).serve();
                }
                Ok(Err(e)) => warn!(%peer, error = %e, "tls handshake failed"),
                Err(_) => warn!(%peer, "tls handshake timed out"),
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn wait_listening(server: &Server) -> SocketAddr {
        for _ in 0..200 {
            if let Some(addr) = server.local_addr() {
                return addr;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("server never started listening");
    }

    #[tokio::test]
    async fn stop_returns_ok() {
        let server = Arc::new(Server::new());
        let socket = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let running = {
            let server = Arc::clone(&server);
            tokio::spawn(async move { server.serve_on(socket, None).await })
        };
        wait_listening(&server).await;

        server.stop();
        let result = tokio::time::timeout(Duration::from_secs(2), running)
            .await
            .unwrap()
            .unwrap();
        assert!(result.is_ok());
        assert!(server.local_addr().is_none());
    }

    #[tokio::test]
    async fn second_serve_is_rejected_while_running() {
        let server = Arc::new(Server::new());
        let socket = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let running = {
            let server = Arc::clone(&server);
            tokio::spawn(async move { server.serve_on(socket, None).await })
        };
        wait_listening(&server).await;

        let other = TcpListener::bind("127.0.0.1:0").await.unwrap();
        assert!(matches!(server.serve_on(other, None).await, Err(Error::AlreadyServing)));

        server.stop();
        running.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn bind_failure_is_reported() {
        let taken = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = taken.local_addr().unwrap().to_string();
        let server = Server::new();
        assert!(matches!(server.serve(&addr, None).await, Err(Error::Io(_))));
    }
}
