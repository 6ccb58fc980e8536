//! Building rustls server configs from PEM certificates and keys.
//!
//! The result goes into [`ServerConfig::tls`](crate::ServerConfig::tls). Every config
//! built here offers `http/1.1` over ALPN and uses the `ring` crypto provider.

use crate::Error;
use rustls::crypto::ring::default_provider;
use rustls::crypto::CryptoProvider;
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::server::ResolvesServerCertUsingSni;
use rustls::sign::CertifiedKey;
use std::fs;
use std::io::BufReader;
use std::path::Path;
use std::sync::Arc;

/// One certificate chain with its key, served for one SNI host name.
#[derive(Debug)]
pub struct SniCert<'a> {
    /// Host name the client asks for.
    pub server_name: &'a str,
    /// PEM certificate chain, leaf first.
    pub cert_pem: &'a [u8],
    /// PEM private key (PKCS#8, PKCS#1 or SEC1).
    pub key_pem: &'a [u8],
}

/// Config serving a single certificate read from PEM files.
pub fn load_server_config(
    cert_path: impl AsRef<Path>,
    key_path: impl AsRef<Path>,
) -> Result<Arc<rustls::ServerConfig>, Error> {
    let cert_pem = fs::read(cert_path.as_ref())?;
    let key_pem = fs::read(key_path.as_ref())?;
    server_config_from_pem(&cert_pem, &key_pem)
}

/// Config serving a single certificate from in-memory PEM.
pub fn server_config_from_pem(
    cert_pem: &[u8],
    key_pem: &[u8],
) -> Result<Arc<rustls::ServerConfig>, Error> {
    let certs = parse_certs(cert_pem)?;
    let key = parse_key(key_pem)?;

    let mut config = rustls::ServerConfig::builder_with_provider(Arc::new(default_provider()))
        .with_safe_default_protocol_versions()?
        .with_no_client_auth()
        .with_single_cert(certs, key)?;

    config.alpn_protocols = vec![b"http/1.1".to_vec()];

    Ok(Arc::new(config))
}

/// Config choosing the certificate by the SNI name the client sends.
///
/// A client naming a host not in `certs`, or sending no SNI at all, fails the
/// handshake.
pub fn sni_server_config(certs: &[SniCert<'_>]) -> Result<Arc<rustls::ServerConfig>, Error> {
    if certs.is_empty() {
        return Err(Error::Config("sni config without certificates".into()));
    }

    let provider: Arc<CryptoProvider> = Arc::new(default_provider());
    let mut resolver = ResolvesServerCertUsingSni::new();

    for c in certs {
        let chain = parse_certs(c.cert_pem)?;
        let key = provider.key_provider.load_private_key(parse_key(c.key_pem)?)?;

        resolver.add(c.server_name, CertifiedKey::new(chain, key))?;
        debug!("sni certificate for {}", c.server_name);
    }

    let mut config = rustls::ServerConfig::builder_with_provider(provider)
        .with_safe_default_protocol_versions()?
        .with_no_client_auth()
        .with_cert_resolver(Arc::new(resolver));

    config.alpn_protocols = vec![b"http/1.1".to_vec()];

    Ok(Arc::new(config))
}

fn parse_certs(pem: &[u8]) -> Result<Vec<CertificateDer<'static>>, Error> {
    let mut reader = BufReader::new(pem);

    let certs = rustls_pemfile::certs(&mut reader).collect::<Result<Vec<_>, _>>()?;

    if certs.is_empty() {
        return Err(Error::Config("no certificates found in PEM".into()));
    }

    Ok(certs)
}

fn parse_key(pem: &[u8]) -> Result<PrivateKeyDer<'static>, Error> {
    let mut reader = BufReader::new(pem);

    rustls_pemfile::private_key(&mut reader)?
        .ok_or_else(|| Error::Config("no private key found in PEM".into()))
}
