//! TLS helper functions.
//!
//! Convenience functions for loading certificates and private keys
//! from PEM data and building the `rustls` client and server
//! configurations used by [`Client`](super::connector::Client) and
//! [`Server`](super::acceptor::Server).  Client authentication is
//! not used.

use std::fs;
use std::io::BufReader;
use std::path::Path;
use std::sync::Arc;

use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName};
use rustls::{ClientConfig, RootCertStore, ServerConfig};

use crate::error::{Error, Result};

/// Parse every certificate in a PEM blob.
pub fn parse_certs(pem: &[u8]) -> Result<Vec<CertificateDer<'static>>> {
    let mut reader = BufReader::new(pem);
    let certs = rustls_pemfile::certs(&mut reader).collect::<Result<Vec<_>, _>>()?;
    Ok(certs)
}

/// Parse the first private key (PKCS#1, PKCS#8 or SEC1) in a PEM blob.
pub fn parse_private_key(pem: &[u8], origin: &str) -> Result<PrivateKeyDer<'static>> {
    let mut reader = BufReader::new(pem);
    rustls_pemfile::private_key(&mut reader)?
        .ok_or_else(|| Error::MissingPrivateKey(origin.to_string()))
}

/// Load a vector of certificates from a PEM file.
pub fn load_certs(path: &Path) -> Result<Vec<CertificateDer<'static>>> {
    parse_certs(&fs::read(path)?)
}

/// Load a private key from a PEM file.
pub fn load_private_key(path: &Path) -> Result<PrivateKeyDer<'static>> {
    parse_private_key(&fs::read(path)?, &path.display().to_string())
}

/// Create a TLS client configuration trusting the CA certificates
/// in `ca_path`.
pub fn make_client_config(ca_path: &Path) -> Result<Arc<ClientConfig>> {
    let mut root_store = RootCertStore::empty();
    for cert in load_certs(ca_path)? {
        root_store.add(cert)?;
    }
    let config = ClientConfig::builder()
        .with_root_certificates(root_store)
        .with_no_client_auth();
    Ok(Arc::new(config))
}

/// Create a TLS server configuration from PEM encoded certificate
/// chain and key bytes.
pub fn make_server_config_from_pem(cert_pem: &[u8], key_pem: &[u8]) -> Result<Arc<ServerConfig>> {
    let certs = parse_certs(cert_pem)?;
    let key = parse_private_key(key_pem, "key pem")?;
    let config = ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)?;
    Ok(Arc::new(config))
}

/// Create a TLS server configuration from certificate and key
/// PEM files.
pub fn make_server_config(cert_path: &Path, key_path: &Path) -> Result<Arc<ServerConfig>> {
    let certs = load_certs(cert_path)?;
    let key = load_private_key(key_path)?;
    let config = ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)?;
    Ok(Arc::new(config))
}

/// Validate a host name for use as the TLS server name.
pub fn server_name(host: &str) -> Result<ServerName<'static>> {
    ServerName::try_from(host.to_string()).map_err(|_| Error::InvalidServerName(host.to_string()))
}
