//! Builds the server-side TLS acceptor STARTTLS upgrades into.
//!
//! Certificates come from PEM files named in the configuration, or from a
//! generated self-signed pair when `tls_self_signed` is set. With neither,
//! STARTTLS is answered with 502.

use std::fs::File;
use std::io::BufReader;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};
use rustls::ServerConfig;
use tokio_rustls::TlsAcceptor;

use crate::config::Config;

/// Builds the acceptor described by the configuration, or `None` when TLS is
/// not configured at all.
pub fn acceptor(config: &Config) -> Result<Option<TlsAcceptor>> {
    let (certs, key) = match (&config.tls_cert_path, &config.tls_key_path) {
        (Some(cert_path), Some(key_path)) => (
            load_certs(cert_path).with_context(|| format!("loading {}", cert_path))?,
            load_key(key_path).with_context(|| format!("loading {}", key_path))?,
        ),
        (None, None) if config.tls_self_signed => self_signed(&config.domain_name)?,
        (None, None) => return Ok(None),
        _ => bail!("POSTBOX_TLS_CERT and POSTBOX_TLS_KEY must be set together"),
    };
    Ok(Some(from_parts(certs, key)?))
}

pub(crate) fn from_parts(
    certs: Vec<CertificateDer<'static>>,
    key: PrivateKeyDer<'static>,
) -> Result<TlsAcceptor> {
    let server_config = ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)?;
    Ok(TlsAcceptor::from(Arc::new(server_config)))
}

fn load_certs(path: &str) -> Result<Vec<CertificateDer<'static>>> {
    let mut reader = BufReader::new(File::open(path)?);
    Ok(rustls_pemfile::certs(&mut reader).collect::<std::io::Result<Vec<_>>>()?)
}

fn load_key(path: &str) -> Result<PrivateKeyDer<'static>> {
    let mut reader = BufReader::new(File::open(path)?);
    match rustls_pemfile::read_one(&mut reader)? {
        Some(rustls_pemfile::Item::Pkcs1Key(key)) => Ok(PrivateKeyDer::Pkcs1(key)),
        Some(rustls_pemfile::Item::Pkcs8Key(key)) => Ok(PrivateKeyDer::Pkcs8(key)),
        Some(rustls_pemfile::Item::Sec1Key(key)) => Ok(PrivateKeyDer::Sec1(key)),
        _ => bail!("no private key found in key file"),
    }
}

/// Generates a self-signed certificate for `domain`.
pub(crate) fn self_signed(
    domain: &str,
) -> Result<(Vec<CertificateDer<'static>>, PrivateKeyDer<'static>)> {
    let rcgen::CertifiedKey { cert, signing_key } =
        rcgen::generate_simple_self_signed(vec![domain.to_string()])?;
    let key = PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(signing_key.serialize_der()));
    Ok((vec![cert.der().clone()], key))
}
