#![allow(dead_code)]

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use warren_rpc::{Channel, ChannelListener, Registry, Request, Response, ResultCode, Server};

pub const CALL_TIMEOUT: Duration = Duration::from_secs(2);

/// Poll `cond` until it holds or two seconds pass.
pub async fn eventually(what: &str, cond: impl Fn() -> bool) {
    for _ in 0..400 {
        if cond() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("timed out waiting for {what}");
}

pub async fn bind() -> (TcpListener, SocketAddr) {
    let socket = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = socket.local_addr().unwrap();
    (socket, addr)
}

pub async fn start_server(
    server: Server,
    listener: Option<Arc<dyn ChannelListener>>,
) -> (Arc<Server>, SocketAddr, JoinHandle<warren_rpc::Result<()>>) {
    let (socket, addr) = bind().await;
    let server = Arc::new(server);
    let running = {
        let server = Arc::clone(&server);
        tokio::spawn(async move { server.serve_on(socket, listener).await })
    };
    (server, addr, running)
}

pub async fn start_registry(registry: Registry) -> (Arc<Registry>, SocketAddr) {
    let (socket, addr) = bind().await;
    let registry = Arc::new(registry);
    {
        let registry = Arc::clone(&registry);
        tokio::spawn(async move { registry.serve_on(socket).await });
    }
    (registry, addr)
}

pub fn echo(_: &Arc<Channel>, request: &Request) -> Option<Response> {
    Some(request.reply(ResultCode::Ok).with_entities(request.entities().clone()))
}

/// Handler body for commands that sleep `sleep_ms` before answering.
pub fn slow(
    _: Arc<Channel>,
    request: Request,
) -> impl Future<Output = Option<Response>> + Send + 'static {
    async move {
        let ms = request.entities().get_int64("sleep_ms").unwrap_or(50);
        tokio::time::sleep(Duration::from_millis(ms as u64)).await;
        Some(request.reply(ResultCode::Ok))
    }
}

/// Sink that collects the `msg` entity of every request it sees.
pub fn collector() -> (
    impl Fn(&Arc<Channel>, &Request) -> Option<Response> + Send + Sync + 'static,
    mpsc::UnboundedReceiver<String>,
) {
    let (tx, rx) = mpsc::unbounded_channel();
    let handler = move |_: &Arc<Channel>, request: &Request| {
        if let Ok(msg) = request.entities().get_string("msg") {
            let _ = tx.send(msg.to_string());
        }
        None
    };
    (handler, rx)
}

/// Everything currently buffered in `rx`, sorted.
pub async fn drain_sorted(rx: &mut mpsc::UnboundedReceiver<String>) -> Vec<String> {
    tokio::time::sleep(Duration::from_millis(100)).await;
    let mut out = Vec::new();
    while let Ok(msg) = rx.try_recv() {
        out.push(msg);
    }
    out.sort();
    out
}
