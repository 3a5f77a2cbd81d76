//! Configuration file for the `warren` binary.
//!
//! The [`Config`] structure mirrors a `warren.toml` file.  Every
//! table is optional and every field has a default, so an empty
//! file (or no file at all) is a valid configuration.  Command line
//! flags override whatever the file says.
//!
//! Example `warren.toml`:
//!
//! ```toml
//! [server]
//! listen = "0.0.0.0:7020"
//! heartbeat_secs = 180
//!
//! [client]
//! addr = "127.0.0.1:7020"
//! redial_ms = 3000
//! id = "node-1"
//! group = "blue"
//!
//! [tls]
//! cert = "certs/server.crt"
//! key = "certs/server.key"
//! ca = "certs/ca.crt"
//! server_name = "localhost"
//!
//! [log]
//! level = "info"
//! ```

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;

use crate::network::channel::{ChannelConfig, DEFAULT_HEARTBEAT};

/// Top-level configuration.  Each section corresponds to a table in
/// the TOML file.
#[derive(Debug, Default, Deserialize, Clone, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    pub server: ServerSection,
    pub client: ClientSection,
    pub tls: TlsSection,
    pub log: LogSection,
}

/// Listening side.
#[derive(Debug, Deserialize, Clone, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct ServerSection {
    /// `host:port` to bind.
    pub listen: String,
    /// Idle seconds before a heartbeat probe.
    pub heartbeat_secs: u64,
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            listen: "0.0.0.0:7020".to_string(),
            heartbeat_secs: DEFAULT_HEARTBEAT.as_secs(),
        }
    }
}

/// Dialing side.
#[derive(Debug, Deserialize, Clone, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct ClientSection {
    pub addr: String,
    /// Milliseconds between dial attempts; `0` dials once.
    pub redial_ms: u64,
    pub heartbeat_secs: u64,
    /// Id to register with the registry.  Empty means none.
    pub id: String,
    /// Group to join.  Empty means none.
    pub group: String,
}

impl Default for ClientSection {
    fn default() -> Self {
        Self {
            addr: "127.0.0.1:7020".to_string(),
            redial_ms: 3000,
            heartbeat_secs: DEFAULT_HEARTBEAT.as_secs(),
            id: String::new(),
            group: String::new(),
        }
    }
}

/// TLS material.  A server uses TLS when both `cert` and `key` are
/// set; a client when `ca` is set.
#[derive(Debug, Default, Deserialize, Clone, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct TlsSection {
    pub cert: Option<PathBuf>,
    pub key: Option<PathBuf>,
    pub ca: Option<PathBuf>,
    /// Name the server certificate is checked against.  Defaults to
    /// the host part of the client address.
    pub server_name: Option<String>,
}

#[derive(Debug, Deserialize, Clone, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct LogSection {
    /// `tracing` filter directive, used when `RUST_LOG` is unset.
    pub level: String,
}

impl Default for LogSection {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

impl Config {
    /// Load configuration from a file.  A missing or malformed file
    /// is an error; see the top of this file for the format.
    pub fn load(path: &Path) -> Result<Self> {
        let contents = fs::read_to_string(path)
            .with_context(|| format!("failed to read config file {}", path.display()))?;
        Self::parse(&contents).with_context(|| format!("failed to parse config {}", path.display()))
    }

    pub fn parse(contents: &str) -> Result<Self> {
        Ok(toml::from_str(contents)?)
    }

    /// [`load`](Self::load) if a path was given, defaults otherwise.
    pub fn load_or_default(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(path) => Self::load(path),
            None => Ok(Self::default()),
        }
    }
}

impl ServerSection {
    pub fn channel_config(&self) -> ChannelConfig {
        ChannelConfig {
            heartbeat: Duration::from_secs(self.heartbeat_secs.max(1)),
        }
    }
}

impl ClientSection {
    pub fn channel_config(&self) -> ChannelConfig {
        ChannelConfig {
            heartbeat: Duration::from_secs(self.heartbeat_secs.max(1)),
        }
    }

    pub fn redial(&self) -> Duration {
        Duration::from_millis(self.redial_ms)
    }

    /// Host part of `addr`, for use as the default TLS server name.
    pub fn host(&self) -> &str {
        match self.addr.rsplit_once(':') {
            Some((host, _)) => host.trim_start_matches('[').trim_end_matches(']'),
            None => &self.addr,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn empty_file_uses_defaults() {
        let cfg = Config::parse("").unwrap();
        assert_eq!(cfg, Config::default());
        assert_eq!(cfg.server.listen, "0.0.0.0:7020");
        assert_eq!(cfg.server.channel_config(), ChannelConfig::default());
        assert_eq!(cfg.client.redial(), Duration::from_secs(3));
        assert_eq!(cfg.log.level, "info");
    }

    #[test]
    fn load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
[server]
listen = "127.0.0.1:9000"
heartbeat_secs = 5

[client]
addr = "example.org:9000"
redial_ms = 0
id = "n1"
group = "blue"

[tls]
ca = "ca.pem"

[log]
level = "debug"
"#
        )
        .unwrap();

        let cfg = Config::load(file.path()).unwrap();
        assert_eq!(cfg.server.listen, "127.0.0.1:9000");
        assert_eq!(cfg.server.channel_config().heartbeat, Duration::from_secs(5));
        assert_eq!(cfg.client.redial(), Duration::ZERO);
        assert_eq!(cfg.client.id, "n1");
        assert_eq!(cfg.client.host(), "example.org");
        assert_eq!(cfg.tls.ca.as_deref(), Some(Path::new("ca.pem")));
        assert!(cfg.tls.cert.is_none());
        assert_eq!(cfg.log.level, "debug");
    }

    #[test]
    fn unknown_keys_are_rejected() {
        assert!(Config::parse("[server]\nport = 1\n").is_err());
    }

    #[test]
    fn missing_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = Config::load(&dir.path().join("nope.toml")).unwrap_err();
        assert!(err.to_string().contains("failed to read config file"));
    }

    #[test]
    fn bracketed_ipv6_host() {
        let client = ClientSection {
            addr: "[::1]:7020".to_string(),
            ..ClientSection::default()
        };
        assert_eq!(client.host(), "::1");
    }
}
