mod common;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;

use common::{echo, eventually, slow, start_server, CALL_TIMEOUT};
use warren_rpc::{
    Channel, ChannelConfig, ChannelListener, Client, ClientOptions, Request, ResultCode, Server,
};

fn echo_server() -> Server {
    let mut server = Server::new();
    server.handle_fn("echo", echo);
    server.handle("slow", slow);
    server
}

#[tokio::test]
async fn echo_round_trip() {
    let (_server, addr, _running) = start_server(echo_server(), None).await;
    let client = Client::new(ClientOptions::new(addr.to_string()));
    client.serve().await.unwrap();
    assert!(client.is_valid());

    let mut request = Request::new("echo");
    request.entities_mut().set_string("msg", "hi");
    let response = client.execute(&request, CALL_TIMEOUT).await;
    assert!(response.is_ok(), "{response}");
    assert_eq!(response.req_id(), request.req_id());
    assert_eq!(response.entities().get_string("msg").unwrap(), "hi");
}

#[tokio::test]
async fn unknown_command_is_reported() {
    let (_server, addr, _running) = start_server(echo_server(), None).await;
    let client = Client::new(ClientOptions::new(addr.to_string()));
    client.serve().await.unwrap();

    let response = client.execute(&Request::new("/nope"), CALL_TIMEOUT).await;
    assert_eq!(response.result(), ResultCode::HandlerNotFound);
    assert_eq!(response.errmsg(), "/nope");
    assert_eq!(response.to_string(), "HANDLER_NOT_FOUND:/nope");
    assert!(client.is_valid());
}

#[tokio::test]
async fn short_timeout_then_link_still_usable() {
    let (_server, addr, _running) = start_server(echo_server(), None).await;
    let client = Client::new(ClientOptions::new(addr.to_string()));
    client.serve().await.unwrap();

    let mut request = Request::new("slow");
    request.entities_mut().set_int64("sleep_ms", 50);
    let response = client.execute(&request, Duration::from_millis(1)).await;
    assert_eq!(response.result(), ResultCode::Timeout);

    tokio::time::sleep(Duration::from_millis(100)).await;
    let response = client.execute(&Request::new("echo"), CALL_TIMEOUT).await;
    assert!(response.is_ok(), "{response}");
}

#[tokio::test]
async fn concurrent_calls_share_one_link() {
    let (_server, addr, _running) = start_server(echo_server(), None).await;
    let client = Arc::new(Client::new(ClientOptions::new(addr.to_string())));
    client.serve().await.unwrap();

    let mut calls = Vec::new();
    for i in 0..20i64 {
        let client = Arc::clone(&client);
        calls.push(tokio::spawn(async move {
            let mut request = Request::new(if i % 2 == 0 { "echo" } else { "slow" });
            request.entities_mut().set_int64("n", i);
            request.entities_mut().set_int64("sleep_ms", 20 - i);
            client.execute(&request, CALL_TIMEOUT).await
        }));
    }
    for call in calls {
        let response = call.await.unwrap();
        assert!(response.is_ok(), "{response}");
    }
}

struct Capture(mpsc::UnboundedSender<Arc<Channel>>);

impl ChannelListener for Capture {
    fn on_connected(&self, channel: &Arc<Channel>) {
        let _ = self.0.send(Arc::clone(channel));
    }
}

#[tokio::test]
async fn server_can_call_client() {
    let (tx, mut rx) = mpsc::unbounded_channel();
    let (_server, addr, _running) =
        start_server(echo_server(), Some(Arc::new(Capture(tx)))).await;

    let mut client = Client::new(ClientOptions::new(addr.to_string()));
    client.handle_fn("whoami", |_, request| {
        let mut response = request.reply(ResultCode::Ok);
        response.entities_mut().set_string("name", "client-1");
        Some(response)
    });
    client.serve().await.unwrap();

    let server_side = tokio::time::timeout(CALL_TIMEOUT, rx.recv()).await.unwrap().unwrap();
    let response = server_side.execute(&Request::new("whoami"), CALL_TIMEOUT).await;
    assert!(response.is_ok(), "{response}");
    assert_eq!(response.entities().get_string("name").unwrap(), "client-1");
}

#[derive(Default)]
struct Counts {
    connected: AtomicUsize,
    disconnected: AtomicUsize,
}

impl ChannelListener for Counts {
    fn on_connected(&self, _: &Arc<Channel>) {
        self.connected.fetch_add(1, Ordering::SeqCst);
    }
    fn on_disconnect(&self, _: &Arc<Channel>) {
        self.disconnected.fetch_add(1, Ordering::SeqCst);
    }
}

#[tokio::test]
async fn client_redials_after_server_drops_link() {
    let mut server = echo_server();
    server.handle_fn("/kick", |channel, _| {
        channel.close();
        None
    });
    let (_server, addr, _running) = start_server(server, None).await;

    let counts = Arc::new(Counts::default());
    let client = Client::new(
        ClientOptions::new(addr.to_string()).with_redial(Duration::from_millis(20)),
    )
    .with_listener(counts.clone());
    client.serve().await.unwrap();
    assert_eq!(counts.connected.load(Ordering::SeqCst), 1);

    client.notice(&Request::new("/kick")).await.unwrap();
    eventually("redial", || counts.connected.load(Ordering::SeqCst) == 2).await;
    assert_eq!(counts.disconnected.load(Ordering::SeqCst), 1);
    eventually("valid link", || client.is_valid()).await;

    let response = client.execute(&Request::new("echo"), CALL_TIMEOUT).await;
    assert!(response.is_ok(), "{response}");

    client.shutdown();
    eventually("shutdown", || !client.is_valid()).await;
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(counts.connected.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn serve_replaces_live_channel() {
    let (_server, addr, _running) = start_server(echo_server(), None).await;
    let counts = Arc::new(Counts::default());
    let client = Client::new(
        ClientOptions::new(addr.to_string()).with_redial(Duration::from_millis(20)),
    )
    .with_listener(counts.clone());

    client.serve().await.unwrap();
    let first = client.channel().unwrap();
    client.serve().await.unwrap();
    let second = client.channel().unwrap();

    assert_ne!(first.id(), second.id());
    eventually("old channel closed", || !first.is_valid()).await;
    assert!(second.is_valid());
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(counts.connected.load(Ordering::SeqCst), 2);
    client.shutdown();
}

#[tokio::test]
async fn heartbeat_keeps_idle_link_open() {
    let server = echo_server().with_channel_config(ChannelConfig {
        heartbeat: Duration::from_millis(40),
    });
    let (_server, addr, _running) = start_server(server, None).await;
    let client = Client::new(ClientOptions::new(addr.to_string()).with_channel(ChannelConfig {
        heartbeat: Duration::from_millis(40),
    }));
    client.serve().await.unwrap();

    tokio::time::sleep(Duration::from_millis(300)).await;
    assert!(client.is_valid());
    let response = client.execute(&Request::new("echo"), CALL_TIMEOUT).await;
    assert!(response.is_ok(), "{response}");
}

#[tokio::test]
async fn stop_ends_serve_with_success() {
    let (server, addr, running) = start_server(echo_server(), None).await;
    let client = Client::new(ClientOptions::new(addr.to_string()));
    client.serve().await.unwrap();

    server.stop();
    let result = tokio::time::timeout(CALL_TIMEOUT, running).await.unwrap().unwrap();
    assert!(result.is_ok());

    // Existing links survive a stop.
    let response = client.execute(&Request::new("echo"), CALL_TIMEOUT).await;
    assert!(response.is_ok(), "{response}");
}
