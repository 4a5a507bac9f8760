//! TLS configuration: load PEM certificates and keys, build the rustls
//! server config used for LDAPS listeners and STARTTLS upgrades.

use std::fs;
use std::io::BufReader;
use std::sync::Arc;

use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls_pemfile::{certs, pkcs8_private_keys, rsa_private_keys};

use crate::config::TlsConfig;
use crate::error::{Error, Result};

/// Build a rustls `ServerConfig` from PEM certificate and key file paths.
pub fn server_config_from_files(cert_file: &str, key_file: &str) -> Result<Arc<rustls::ServerConfig>> {
    let chain = load_certs(cert_file)?;
    let key = load_private_key(key_file)?;
    let config = rustls::ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(chain, key)
        .map_err(|e| Error::Tls(format!("build server config: {}", e)))?;
    Ok(Arc::new(config))
}

/// Build a rustls `ServerConfig` from the [`TlsConfig`] section.
pub fn server_config(tls: &TlsConfig) -> Result<Arc<rustls::ServerConfig>> {
    server_config_from_files(&tls.cert_file, &tls.key_file)
}

/// Load all certificates from a PEM file.
pub fn load_certs(path: &str) -> Result<Vec<CertificateDer<'static>>> {
    let file = fs::File::open(path)
        .map_err(|e| Error::Tls(format!("open cert file {}: {}", path, e)))?;
    let mut reader = BufReader::new(file);
    let chain: Vec<CertificateDer<'static>> = certs(&mut reader)
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(|e| Error::Tls(format!("parse PEM certificates in {}: {}", path, e)))?;
    if chain.is_empty() {
        return Err(Error::Tls(format!("no certificates found in {}", path)));
    }
    Ok(chain)
}

/// Load the first private key (PKCS#8, then RSA) from a PEM file.
pub fn load_private_key(path: &str) -> Result<PrivateKeyDer<'static>> {
    let file = fs::File::open(path)
        .map_err(|e| Error::Tls(format!("open key file {}: {}", path, e)))?;
    let mut reader = BufReader::new(file);
    let pkcs8: Vec<_> = pkcs8_private_keys(&mut reader)
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(|e| Error::Tls(format!("parse PKCS8 keys in {}: {}", path, e)))?;
    if let Some(key) = pkcs8.into_iter().next() {
        return Ok(key.into());
    }
    let file = fs::File::open(path)
        .map_err(|e| Error::Tls(format!("open key file {}: {}", path, e)))?;
    let mut reader = BufReader::new(file);
    let rsa: Vec<_> = rsa_private_keys(&mut reader)
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(|e| Error::Tls(format!("parse RSA keys in {}: {}", path, e)))?;
    rsa.into_iter()
        .next()
        .map(Into::into)
        .ok_or_else(|| Error::Tls(format!("no private key found in {}", path)))
}
