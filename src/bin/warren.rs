//! Command line front end for `warren_rpc`.
//!
//! `warren serve` runs a registry that answers `echo` and relays
//! `/publish` requests to the other connected peers as `/push`
//! notices.  `warren connect` runs a registering client that prints
//! every `/push` it receives and can publish one message itself.
//!
//! Both subcommands read an optional TOML file (see
//! [`warren_rpc::config`]) and let flags override it.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use warren_rpc::config::Config;
use warren_rpc::network::tls_util::make_server_config;
use warren_rpc::{
    Channel, ChannelListener, ClientOptions, Presence, Registry, RegistryClient, Request, Response,
    ResultCode, TlsOptions,
};

/// Command line options for the `warren` binary.
#[derive(Parser, Debug)]
#[command(name = "warren", about = "Framed RPC registry and client")]
struct Cli {
    /// Path to a `warren.toml` configuration file.
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run a registry server.
    Serve(ServeArgs),
    /// Connect to a registry and print pushed messages.
    Connect(ConnectArgs),
}

#[derive(Args, Debug)]
struct ServeArgs {
    /// Address to listen on (host:port).
    #[arg(long)]
    listen: Option<String>,
    /// PEM certificate chain; enables TLS together with `--key`.
    #[arg(long, requires = "key")]
    cert: Option<PathBuf>,
    /// PEM private key.
    #[arg(long, requires = "cert")]
    key: Option<PathBuf>,
}

#[derive(Args, Debug)]
struct ConnectArgs {
    /// Registry address (host:port).
    #[arg(long)]
    addr: Option<String>,
    /// Id to register.
    #[arg(long)]
    id: Option<String>,
    /// Group to join.
    #[arg(long)]
    group: Option<String>,
    /// PEM file with the CA certificates to trust; enables TLS.
    #[arg(long)]
    ca: Option<PathBuf>,
    /// Name to verify the server certificate against.
    #[arg(long)]
    server_name: Option<String>,
    /// Milliseconds between dial attempts; 0 dials once.
    #[arg(long)]
    redial_ms: Option<u64>,
    /// Publish this message once connected.
    #[arg(long)]
    publish: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let mut config = Config::load_or_default(cli.config.as_deref())?;
    init_logging(&config.log.level);

    match cli.command {
        Command::Serve(args) => {
            if let Some(listen) = args.listen {
                config.server.listen = listen;
            }
            if args.cert.is_some() {
                config.tls.cert = args.cert;
                config.tls.key = args.key;
            }
            serve(config).await
        }
        Command::Connect(args) => {
            let publish = args.publish.clone();
            apply_connect_args(&mut config, args);
            connect(config, publish).await
        }
    }
}

fn init_logging(default_level: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

fn apply_connect_args(config: &mut Config, args: ConnectArgs) {
    if let Some(addr) = args.addr {
        config.client.addr = addr;
    }
    if let Some(id) = args.id {
        config.client.id = id;
    }
    if let Some(group) = args.group {
        config.client.group = group;
    }
    if let Some(redial_ms) = args.redial_ms {
        config.client.redial_ms = redial_ms;
    }
    if args.ca.is_some() {
        config.tls.ca = args.ca;
    }
    if args.server_name.is_some() {
        config.tls.server_name = args.server_name;
    }
}

async fn serve(config: Config) -> Result<()> {
    let mut registry = Registry::new().with_channel_config(config.server.channel_config());
    registry.handle_fn("echo", |_, request| {
        Some(request.reply(ResultCode::Ok).with_entities(request.entities().clone()))
    });
    let presence = registry.presence();
    registry.handle_fn("/publish", move |channel, request| Some(publish(&presence, channel, request)));
    let registry = Arc::new(registry);

    let running = {
        let registry = Arc::clone(&registry);
        let listen = config.server.listen.clone();
        let tls = match (&config.tls.cert, &config.tls.key) {
            (Some(cert), Some(key)) => Some(make_server_config(cert, key).context("loading tls material")?),
            _ => None,
        };
        tokio::spawn(async move {
            match tls {
                Some(tls) => registry.serve_tls(&listen, tls).await,
                None => registry.serve(&listen).await,
            }
        })
    };

    tokio::select! {
        result = running => {
            result.context("server task panicked")??;
        }
        signal = tokio::signal::ctrl_c() => {
            signal?;
            info!("shutdown signal received");
            registry.stop();
        }
    }
    Ok(())
}

/// Relay a `/publish` request as a `/push` notice.
fn publish(presence: &Presence, channel: &Arc<Channel>, request: &Request) -> Response {
    let Ok(msg) = request.entities().get_string("msg") else {
        return Response::with_errmsg(request.req_id(), ResultCode::InvalidRequest, "msg is required");
    };
    let from = presence
        .channel_info(channel)
        .map(|info| info.id().to_string())
        .unwrap_or_default();

    let mut push = Request::new("/push");
    push.entities_mut().set_string("msg", msg);
    push.entities_mut().set_string("from", from.as_str());

    let sent = match request.entities().get_string("group") {
        Ok(group) if !group.is_empty() => presence.multicast(&push, &[group]),
        _ if from.is_empty() => presence.broadcast(&push, &[]),
        _ => presence.broadcast(&push, &[from.as_str()]),
    };
    match sent {
        Ok(()) => request.reply(ResultCode::Ok),
        Err(e) => Response::with_errmsg(request.req_id(), ResultCode::ServerException, e.to_string()),
    }
}

/// Logs connection events and publishes once per connect.
struct Publisher {
    message: Option<String>,
}

impl ChannelListener for Publisher {
    fn on_connected(&self, channel: &Arc<Channel>) {
        info!(%channel, "connected");
        let Some(message) = self.message.clone() else {
            return;
        };
        let channel = Arc::clone(channel);
        tokio::spawn(async move {
            let mut request = Request::new("/publish");
            request.entities_mut().set_string("msg", message);
            let response = channel.execute(&request, Duration::from_secs(5)).await;
            if response.is_ok() {
                info!("published");
            } else {
                warn!(%response, "publish failed");
            }
        });
    }

    fn on_disconnect(&self, channel: &Arc<Channel>) {
        warn!(%channel, "disconnected");
    }
}

async fn connect(config: Config, publish: Option<String>) -> Result<()> {
    let mut options = ClientOptions::new(config.client.addr.clone())
        .with_redial(config.client.redial())
        .with_channel(config.client.channel_config());
    if let Some(ca) = &config.tls.ca {
        let name = config
            .tls
            .server_name
            .clone()
            .unwrap_or_else(|| config.client.host().to_string());
        options = options.with_tls(TlsOptions::from_ca_file(ca, &name).context("loading ca")?);
    }

    let mut client = RegistryClient::new(options)
        .with_id(config.client.id.clone())
        .with_group(config.client.group.clone())
        .with_listener(Arc::new(Publisher { message: publish }));
    client.handle_fn("/push", |_, request| {
        let entities = request.entities();
        match entities.get_string("msg") {
            Ok(msg) => info!(from = entities.get_string("from").unwrap_or(""), msg, "push"),
            Err(e) => error!(error = %e, "malformed push"),
        }
        None
    });
    let client = client.build();

    client.serve().await?;
    tokio::signal::ctrl_c().await?;
    info!("shutdown signal received");
    client.shutdown();
    Ok(())
}
