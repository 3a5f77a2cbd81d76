mod common;

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use rcgen::{BasicConstraints, CertificateParams, IsCa, KeyPair};
use tempfile::TempDir;

use common::{bind, collector, drain_sorted, echo, eventually, CALL_TIMEOUT};
use warren_rpc::network::tls_util::{make_server_config, make_server_config_from_pem};
use warren_rpc::{
    Client, ClientOptions, Registry, RegistryClient, Request, ResultCode, Server, TlsOptions,
};

struct Pki {
    _dir: TempDir,
    ca: PathBuf,
    cert: PathBuf,
    key: PathBuf,
    cert_pem: String,
    key_pem: String,
}

/// A throwaway CA and a `localhost` leaf certificate signed by it.
fn pki() -> Pki {
    let ca_key = KeyPair::generate().unwrap();
    let mut ca_params = CertificateParams::new(Vec::<String>::new()).unwrap();
    ca_params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
    let ca_cert = ca_params.self_signed(&ca_key).unwrap();

    let leaf_key = KeyPair::generate().unwrap();
    let leaf_params = CertificateParams::new(vec!["localhost".to_string()]).unwrap();
    let leaf = leaf_params.signed_by(&leaf_key, &ca_cert, &ca_key).unwrap();

    let dir = tempfile::tempdir().unwrap();
    let write = |name: &str, contents: &str| {
        let path = dir.path().join(name);
        std::fs::write(&path, contents).unwrap();
        path
    };
    let cert_pem = leaf.pem();
    let key_pem = leaf_key.serialize_pem();
    Pki {
        ca: write("ca.pem", &ca_cert.pem()),
        cert: write("server.pem", &cert_pem),
        key: write("server.key", &key_pem),
        cert_pem,
        key_pem,
        _dir: dir,
    }
}

fn tls_client(addr: &str, ca: &Path, name: &str) -> Client {
    let tls = TlsOptions::from_ca_file(ca, name).unwrap();
    Client::new(ClientOptions::new(addr).with_tls(tls))
}

#[tokio::test]
async fn echo_over_tls() {
    let pki = pki();
    let mut server = Server::new();
    server.handle_fn("echo", echo);
    let server = Arc::new(server);
    let (socket, addr) = bind().await;
    let tls = make_server_config(&pki.cert, &pki.key).unwrap();
    {
        let server = Arc::clone(&server);
        tokio::spawn(async move { server.serve_tls_on(socket, tls, None).await });
    }

    let client = tls_client(&addr.to_string(), &pki.ca, "localhost");
    client.serve().await.unwrap();
    let mut request = Request::new("echo");
    request.entities_mut().set_string("msg", "secret");
    let response = client.execute(&request, CALL_TIMEOUT).await;
    assert!(response.is_ok(), "{response}");
    assert_eq!(response.entities().get_string("msg").unwrap(), "secret");

    let response = client.execute(&Request::new("/nope"), CALL_TIMEOUT).await;
    assert_eq!(response.result(), ResultCode::HandlerNotFound);
    server.stop();
}

#[tokio::test]
async fn wrong_server_name_fails_handshake() {
    let pki = pki();
    let server = Arc::new(Server::new());
    let (socket, addr) = bind().await;
    let tls = make_server_config_from_pem(pki.cert_pem.as_bytes(), pki.key_pem.as_bytes()).unwrap();
    {
        let server = Arc::clone(&server);
        tokio::spawn(async move { server.serve_tls_on(socket, tls, None).await });
    }

    let client = tls_client(&addr.to_string(), &pki.ca, "not-localhost.example");
    assert!(client.serve().await.is_err());
    assert!(!client.is_valid());
}

#[tokio::test]
async fn registry_push_over_tls() {
    let pki = pki();
    let mut registry = Registry::new();
    registry.handle_fn("echo", echo);
    let registry = Arc::new(registry);
    let (socket, addr) = bind().await;
    let tls = make_server_config(&pki.cert, &pki.key).unwrap();
    {
        let registry = Arc::clone(&registry);
        tokio::spawn(async move { registry.serve_tls_on(socket, tls).await });
    }

    let (sink, mut rx) = collector();
    let options = ClientOptions::new(addr.to_string())
        .with_tls(TlsOptions::from_ca_file(&pki.ca, "localhost").unwrap())
        .with_redial(Duration::from_millis(50));
    let mut member = RegistryClient::new(options).with_id("t1").with_group("secure");
    member.handle_fn("/push", sink);
    let member = member.build();
    member.serve().await.unwrap();

    eventually("registration", || registry.channel_by_id("t1").is_some()).await;
    let mut push = Request::new("/push");
    push.entities_mut().set_string("msg", "over tls");
    registry.multicast(&push, &["secure"]).unwrap();
    assert_eq!(drain_sorted(&mut rx).await, vec!["over tls"]);
    member.shutdown();
}

#[tokio::test]
async fn registry_serves_tls_from_pem_bytes() {
    let pki = pki();
    let mut registry = Registry::new();
    registry.handle_fn("echo", echo);
    let registry = Arc::new(registry);
    {
        let registry = Arc::clone(&registry);
        let (cert, key) = (pki.cert_pem.clone(), pki.key_pem.clone());
        tokio::spawn(async move {
            registry
                .serve_tls_with_pem("127.0.0.1:0", cert.as_bytes(), key.as_bytes())
                .await
        });
    }
    eventually("listener bound", || registry.local_addr().is_some()).await;
    let addr = registry.local_addr().unwrap();

    let (sink, mut rx) = collector();
    let options = ClientOptions::new(addr.to_string())
        .with_tls(TlsOptions::from_ca_file(&pki.ca, "localhost").unwrap());
    let mut member = RegistryClient::new(options).with_id("p1").with_group("pem");
    member.handle_fn("/push", sink);
    let member = member.build();
    member.serve().await.unwrap();

    eventually("registration", || registry.channel_by_id("p1").is_some()).await;
    let mut push = Request::new("/push");
    push.entities_mut().set_string("msg", "from pem");
    registry.multicast(&push, &["pem"]).unwrap();
    assert_eq!(drain_sorted(&mut rx).await, vec!["from pem"]);

    member.shutdown();
    registry.stop();
}

#[test]
fn missing_key_is_reported() {
    let pki = pki();
    let err = make_server_config_from_pem(pki.cert_pem.as_bytes(), pki.cert_pem.as_bytes()).unwrap_err();
    assert!(matches!(err, warren_rpc::Error::MissingPrivateKey(_)), "{err}");
}
