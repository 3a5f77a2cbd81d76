//! Presence tracking and fan-out on top of [`Server`] and [`Client`].
//!
//! A [`Registry`] is a server that knows who is connected.  Every
//! accepted channel gets a [`ChannelInfo`] as soon as its socket
//! exists.  A peer may then claim an id and join a group by sending
//! the [`REGISTER_CMD`] request.  Ids are unique across the registry;
//! groups are open.
//!
//! Group membership lists keep their positions: a member that leaves
//! is replaced by an empty slot that a later registration reuses.
//!
//! [`Registry::broadcast`] and [`Registry::multicast`] encode the
//! request once and write it to every target as a notice from a
//! detached task, so a slow peer never blocks the caller.
//!
//! A [`RegistryClient`] is the other end: a [`Client`] that registers
//! its id and group every time it connects.

use std::collections::HashMap;
use std::fmt;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use rustls::ServerConfig;
use tokio::net::TcpListener;
use tracing::{error, info, warn};

use super::acceptor::Server;
use super::channel::{Channel, ChannelConfig};
use super::connector::{Client, ClientOptions};
use super::handler::{ChannelListener, Handler};
use crate::error::Result;
use crate::protocol::message::{Request, Response, ResultCode};

/// Command a peer sends to claim an id and join a group.
pub const REGISTER_CMD: &str = "/simplepush_regist";

/// How long a [`RegistryClient`] waits for its registration reply.
pub const REGISTER_TIMEOUT: Duration = Duration::from_secs(2);

/// Pause before a rejected [`RegistryClient`] drops its link.
const REJECT_BACKOFF: Duration = Duration::from_secs(1);

/// A connected channel plus the id and group it registered with.
/// Both are empty until the peer registers.
#[derive(Clone)]
pub struct ChannelInfo {
    channel: Arc<Channel>,
    id: String,
    group: String,
}

impl ChannelInfo {
    pub fn channel(&self) -> &Arc<Channel> {
        &self.channel
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn group(&self) -> &str {
        &self.group
    }

    pub fn is_valid(&self) -> bool {
        self.channel.is_valid()
    }
}

impl fmt::Display for ChannelInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}:{}:{}]", self.group, self.id, self.channel)
    }
}

impl fmt::Debug for ChannelInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChannelInfo")
            .field("channel", &self.channel.id())
            .field("id", &self.id)
            .field("group", &self.group)
            .finish()
    }
}

#[derive(Default)]
struct Indices {
    by_channel: HashMap<u64, ChannelInfo>,
    by_id: HashMap<String, u64>,
    by_group: HashMap<String, Vec<Option<u64>>>,
    snapshot: Arc<Vec<ChannelInfo>>,
    dirty: bool,
}

impl Indices {
    /// Drop `key`'s id claim and group slot, leaving it connected.
    fn release(&mut self, key: u64) {
        let Some(info) = self.by_channel.get(&key) else {
            return;
        };
        if !info.id.is_empty() && self.by_id.get(&info.id) == Some(&key) {
            self.by_id.remove(&info.id);
        }
        if let Some(slots) = self.by_group.get_mut(&info.group) {
            for slot in slots.iter_mut().filter(|s| **s == Some(key)) {
                *slot = None;
            }
        }
    }

    fn join_group(&mut self, group: &str, key: u64) {
        let slots = self.by_group.entry(group.to_string()).or_default();
        match slots.iter_mut().find(|s| s.is_none()) {
            Some(slot) => *slot = Some(key),
            None => slots.push(Some(key)),
        }
    }
}

/// The registry's indices.  Implements [`ChannelListener`] so it sees
/// every channel the server creates.
#[derive(Default)]
pub struct Presence {
    indices: RwLock<Indices>,
}

impl Presence {
    pub fn new() -> Self {
        Self::default()
    }

    fn register(&self, channel: &Arc<Channel>, request: &Request) -> Response {
        let entities = request.entities();
        let (Ok(group), Ok(id)) = (entities.get_string("group"), entities.get_string("id")) else {
            return Response::with_errmsg(
                request.req_id(),
                ResultCode::InvalidRequest,
                "group and id are required",
            );
        };

        let key = channel.id();
        let mut indices = self.indices.write();
        if !indices.by_channel.contains_key(&key) {
            return Response::with_errmsg(request.req_id(), ResultCode::InvalidRequest, "channel is gone");
        }
        if !id.is_empty() {
            if let Some(&holder) = indices.by_id.get(id) {
                if holder != key {
                    warn!(channel = %channel, id, "id already registered");
                    return Response::with_errmsg(
                        request.req_id(),
                        ResultCode::InvalidRequest,
                        format!("id {id} is already registered"),
                    );
                }
            }
        }

        indices.release(key);
        if let Some(info) = indices.by_channel.get_mut(&key) {
            info.id = id.to_string();
            info.group = group.to_string();
        }
        if !id.is_empty() {
            indices.by_id.insert(id.to_string(), key);
        }
        if !group.is_empty() {
            indices.join_group(group, key);
        }
        indices.dirty = true;
        info!(channel = %channel, id, group, "registered");
        request.reply(ResultCode::Ok)
    }

    /// Every known channel, registered or not.
    ///
    /// The result is cached and only rebuilt after membership changed,
    /// so repeated calls are cheap.
    pub fn get_channel_all(&self) -> Arc<Vec<ChannelInfo>> {
        {
            let indices = self.indices.read();
            if !indices.dirty {
                return Arc::clone(&indices.snapshot);
            }
        }
        let mut indices = self.indices.write();
        if indices.dirty {
            let fresh: Vec<ChannelInfo> = indices.by_channel.values().cloned().collect();
            indices.snapshot = Arc::new(fresh);
            indices.dirty = false;
        }
        Arc::clone(&indices.snapshot)
    }

    pub fn channel_by_id(&self, id: &str) -> Option<ChannelInfo> {
        let indices = self.indices.read();
        let key = indices.by_id.get(id)?;
        indices.by_channel.get(key).cloned()
    }

    /// What the registry knows about `channel`.
    pub fn channel_info(&self, channel: &Channel) -> Option<ChannelInfo> {
        self.indices.read().by_channel.get(&channel.id()).cloned()
    }

    /// Members of `group` that are still connected, in slot order.
    pub fn channels_by_group(&self, group: &str) -> Vec<ChannelInfo> {
        let indices = self.indices.read();
        indices
            .by_group
            .get(group)
            .map(|slots| {
                slots
                    .iter()
                    .flatten()
                    .filter_map(|key| indices.by_channel.get(key).cloned())
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Send `request` as a notice to every valid channel whose id is
    /// not in `except_ids`.  Returns once the request is encoded.
    pub fn broadcast(&self, request: &Request, except_ids: &[&str]) -> Result<()> {
        let body = request.encode()?;
        let except: Vec<String> = except_ids.iter().map(|s| s.to_string()).collect();
        let targets: Vec<ChannelInfo> = self
            .get_channel_all()
            .iter()
            .filter(|info| !except.iter().any(|id| *id == info.id))
            .cloned()
            .collect();
        fan_out("broadcast", request.cmd().to_string(), body, targets);
        Ok(())
    }

    /// Send `request` as a notice to every valid member of the named
    /// groups.
    pub fn multicast(&self, request: &Request, groups: &[&str]) -> Result<()> {
        if groups.is_empty() {
            return Ok(());
        }
        let body = request.encode()?;
        let targets: Vec<ChannelInfo> = groups
            .iter()
            .flat_map(|group| self.channels_by_group(group))
            .collect();
        fan_out("multicast", request.cmd().to_string(), body, targets);
        Ok(())
    }
}

fn fan_out(kind: &'static str, cmd: String, body: Vec<u8>, targets: Vec<ChannelInfo>) {
    tokio::spawn(async move {
        for target in targets {
            if !target.is_valid() {
                continue;
            }
            if let Err(e) = target.channel.send(&body).await {
                warn!(kind, %cmd, target = %target, error = %e, "fan-out send failed");
            }
        }
    });
}

impl ChannelListener for Presence {
    fn on_connecting(&self, channel: &Arc<Channel>) {
        let mut indices = self.indices.write();
        indices.by_channel.insert(
            channel.id(),
            ChannelInfo {
                channel: Arc::clone(channel),
                id: String::new(),
                group: String::new(),
            },
        );
        indices.dirty = true;
    }

    fn on_disconnect(&self, channel: &Arc<Channel>) {
        let key = channel.id();
        let mut indices = self.indices.write();
        indices.release(key);
        if indices.by_channel.remove(&key).is_some() {
            indices.dirty = true;
        }
    }
}

/// Forwards lifecycle events to the registry first, then to the
/// embedding program's listener.
struct RegistryHook {
    presence: Arc<Presence>,
    listener: Option<Arc<dyn ChannelListener>>,
}

impl ChannelListener for RegistryHook {
    fn on_connecting(&self, channel: &Arc<Channel>) {
        self.presence.on_connecting(channel);
        if let Some(listener) = &self.listener {
            listener.on_connecting(channel);
        }
    }

    fn on_connected(&self, channel: &Arc<Channel>) {
        if let Some(listener) = &self.listener {
            listener.on_connected(channel);
        }
    }

    fn on_disconnect(&self, channel: &Arc<Channel>) {
        self.presence.on_disconnect(channel);
        if let Some(listener) = &self.listener {
            listener.on_disconnect(channel);
        }
    }
}

/// A [`Server`] with presence tracking.
pub struct Registry {
    server: Server,
    presence: Arc<Presence>,
    listener: Option<Arc<dyn ChannelListener>>,
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}

impl Registry {
    pub fn new() -> Self {
        Self::with_server(Server::new())
    }

    /// Wrap a configured server.  Panics if the server already has
    /// a handler for [`REGISTER_CMD`].
    pub fn with_server(mut server: Server) -> Self {
        let presence = Arc::new(Presence::new());
        let registrar = Arc::clone(&presence);
        server.handle_fn(REGISTER_CMD, move |channel, request| {
            Some(registrar.register(channel, request))
        });
        Self {
            server,
            presence,
            listener: None,
        }
    }

    pub fn with_channel_config(mut self, config: ChannelConfig) -> Self {
        self.server = self.server.with_channel_config(config);
        self
    }

    /// Callbacks fired after the registry has updated its indices.
    pub fn with_listener(mut self, listener: Arc<dyn ChannelListener>) -> Self {
        self.listener = Some(listener);
        self
    }

    /// Shared handle to the indices, for use inside handlers.
    pub fn presence(&self) -> Arc<Presence> {
        Arc::clone(&self.presence)
    }

    pub fn handle(&mut self, cmd: impl Into<String>, handler: impl Handler) {
        self.server.handle(cmd, handler);
    }

    pub fn handle_fn<F>(&mut self, cmd: impl Into<String>, f: F)
    where
        F: Fn(&Arc<Channel>, &Request) -> Option<Response> + Send + Sync + 'static,
    {
        self.server.handle_fn(cmd, f);
    }

    fn hook(&self) -> Option<Arc<dyn ChannelListener>> {
        Some(Arc::new(RegistryHook {
            presence: Arc::clone(&self.presence),
            listener: self.listener.clone(),
        }))
    }

    pub async fn serve(&self, addr: &str) -> Result<()> {
        self.server.serve(addr, self.hook()).await
    }

    pub async fn serve_on(&self, socket: TcpListener) -> Result<()> {
        self.server.serve_on(socket, self.hook()).await
    }

    pub async fn serve_tls(&self, addr: &str, tls: Arc<ServerConfig>) -> Result<()> {
        self.server.serve_tls(addr, tls, self.hook()).await
    }

    pub async fn serve_tls_on(&self, socket: TcpListener, tls: Arc<ServerConfig>) -> Result<()> {
        self.server.serve_tls_on(socket, tls, self.hook()).await
    }

    pub async fn serve_tls_with_pem(&self, addr: &str, cert_pem: &[u8], key_pem: &[u8]) -> Result<()> {
        self.server
            .serve_tls_with_pem(addr, cert_pem, key_pem, self.hook())
            .await
    }

    pub async fn serve_tls_with_pem_file(&self, addr: &str, cert_path: &Path, key_path: &Path) -> Result<()> {
        self.server
            .serve_tls_with_pem_file(addr, cert_path, key_path, self.hook())
            .await
    }

    pub fn stop(&self) {
        self.server.stop();
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.server.local_addr()
    }

    pub fn broadcast(&self, request: &Request, except_ids: &[&str]) -> Result<()> {
        self.presence.broadcast(request, except_ids)
    }

    pub fn multicast(&self, request: &Request, groups: &[&str]) -> Result<()> {
        self.presence.multicast(request, groups)
    }

    pub fn get_channel_all(&self) -> Arc<Vec<ChannelInfo>> {
        self.presence.get_channel_all()
    }

    pub fn channel_by_id(&self, id: &str) -> Option<ChannelInfo> {
        self.presence.channel_by_id(id)
    }

    pub fn channels_by_group(&self, group: &str) -> Vec<ChannelInfo> {
        self.presence.channels_by_group(group)
    }
}

/// Client-side registration hook.  Holds back `on_connected` until the
/// registration has been accepted.
struct RegisterHook {
    id: String,
    group: String,
    listener: Option<Arc<dyn ChannelListener>>,
}

async fn register_on_connect(
    id: String,
    group: String,
    listener: Option<Arc<dyn ChannelListener>>,
    channel: Arc<Channel>,
) {
    if !id.is_empty() || !group.is_empty() {
        let mut request = Request::new(REGISTER_CMD);
        request.entities_mut().set_string("id", id.as_str());
        request.entities_mut().set_string("group", group.as_str());
        let response = channel.execute(&request, REGISTER_TIMEOUT).await;
        if !response.is_ok() {
            error!(%id, %group, %response, "registration failed");
            tokio::time::sleep(REJECT_BACKOFF).await;
            channel.close();
            return;
        }
        info!(%id, %group, "registration accepted");
    }
    if let Some(listener) = listener {
        listener.on_connected(&channel);
    }
}

impl ChannelListener for RegisterHook {
    fn on_connecting(&self, channel: &Arc<Channel>) {
        if let Some(listener) = &self.listener {
            listener.on_connecting(channel);
        }
    }

    fn on_connected(&self, channel: &Arc<Channel>) {
        tokio::spawn(register_on_connect(
            self.id.clone(),
            self.group.clone(),
            self.listener.clone(),
            Arc::clone(channel),
        ));
    }

    fn on_disconnect(&self, channel: &Arc<Channel>) {
        if let Some(listener) = &self.listener {
            listener.on_disconnect(channel);
        }
    }
}

/// A [`Client`] that registers with a [`Registry`] on every connect.
///
/// Registration is skipped when both id and group are empty.  A
/// rejected registration drops the link after a short pause; with a
/// redial interval configured the client then tries again.
pub struct RegistryClient {
    client: Client,
    id: String,
    group: String,
    listener: Option<Arc<dyn ChannelListener>>,
}

impl RegistryClient {
    pub fn new(options: ClientOptions) -> Self {
        Self {
            client: Client::new(options),
            id: String::new(),
            group: String::new(),
            listener: None,
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    pub fn with_group(mut self, group: impl Into<String>) -> Self {
        self.group = group.into();
        self
    }

    /// Callbacks fired for every channel.  `on_connected` fires only
    /// after registration succeeded.
    pub fn with_listener(mut self, listener: Arc<dyn ChannelListener>) -> Self {
        self.listener = Some(listener);
        self
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn group(&self) -> &str {
        &self.group
    }

    pub fn handle(&mut self, cmd: impl Into<String>, handler: impl Handler) {
        self.client.handle(cmd, handler);
    }

    pub fn handle_fn<F>(&mut self, cmd: impl Into<String>, f: F)
    where
        F: Fn(&Arc<Channel>, &Request) -> Option<Response> + Send + Sync + 'static,
    {
        self.client.handle_fn(cmd, f);
    }

    /// Build the client.  Handlers must be registered before this.
    pub fn build(self) -> Client {
        let hook = RegisterHook {
            id: self.id,
            group: self.group,
            listener: self.listener,
        };
        self.client.with_listener(Arc::new(hook))
    }
}
