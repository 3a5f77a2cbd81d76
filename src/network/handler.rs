//! Command handlers and connection lifecycle callbacks.
//!
//! A [`HandlerTable`] maps command names to [`Handler`]s.  It is
//! filled while a [`Client`](super::connector::Client) or
//! [`Server`](super::acceptor::Server) is being set up and then
//! shared read-only by every channel they create.
//!
//! Handlers are async.  Any `Fn(Arc<Channel>, Request) -> impl
//! Future<Output = Option<Response>>` closure is a handler; plain
//! synchronous closures can be registered through
//! [`HandlerTable::insert_fn`].  Returning `None` means "send
//! nothing back", which is how notice-style commands are written.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use super::channel::Channel;
use crate::protocol::message::{Request, Response};

pub type HandlerFuture = Pin<Box<dyn Future<Output = Option<Response>> + Send + 'static>>;

/// Handles one inbound request on the channel it arrived on.
pub trait Handler: Send + Sync + 'static {
    fn handle(&self, channel: Arc<Channel>, request: Request) -> HandlerFuture;
}

impl<F, Fut> Handler for F
where
    F: Fn(Arc<Channel>, Request) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Option<Response>> + Send + 'static,
{
    fn handle(&self, channel: Arc<Channel>, request: Request) -> HandlerFuture {
        Box::pin(self(channel, request))
    }
}

/// Adapter that lets a synchronous closure act as a [`Handler`].
pub struct FnHandler<F>(pub F);

impl<F> Handler for FnHandler<F>
where
    F: Fn(&Arc<Channel>, &Request) -> Option<Response> + Send + Sync + 'static,
{
    fn handle(&self, channel: Arc<Channel>, request: Request) -> HandlerFuture {
        let response = (self.0)(&channel, &request);
        Box::pin(async move { response })
    }
}

/// Command name -> handler.
#[derive(Clone, Default)]
pub struct HandlerTable {
    handlers: HashMap<String, Arc<dyn Handler>>,
}

impl HandlerTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `handler` for `cmd`.
    ///
    /// # Panics
    ///
    /// Panics if `cmd` already has a handler.  Registering a command
    /// twice is a setup mistake, not something to recover from.
    pub fn insert(&mut self, cmd: impl Into<String>, handler: impl Handler) {
        let cmd = cmd.into();
        assert!(
            !self.handlers.contains_key(&cmd),
            "multiple handlers for command: {cmd}"
        );
        self.handlers.insert(cmd, Arc::new(handler));
    }

    /// Register a synchronous closure for `cmd`.
    ///
    /// # Panics
    ///
    /// Same as [`insert`](Self::insert).
    pub fn insert_fn<F>(&mut self, cmd: impl Into<String>, f: F)
    where
        F: Fn(&Arc<Channel>, &Request) -> Option<Response> + Send + Sync + 'static,
    {
        self.insert(cmd, FnHandler(f));
    }

    pub fn get(&self, cmd: &str) -> Option<Arc<dyn Handler>> {
        self.handlers.get(cmd).cloned()
    }
}

/// Connection lifecycle callbacks.
///
/// All methods default to doing nothing.  Callbacks run inline on
/// the task that drives the connection, so they must not block;
/// spawn a task for anything that needs to await.
pub trait ChannelListener: Send + Sync + 'static {
    /// The socket exists but the channel is not usable yet.
    fn on_connecting(&self, _channel: &Arc<Channel>) {}
    /// The channel can send.
    fn on_connected(&self, _channel: &Arc<Channel>) {}
    /// The channel is closed and invalid.  Fires exactly once.
    fn on_disconnect(&self, _channel: &Arc<Channel>) {}
}
