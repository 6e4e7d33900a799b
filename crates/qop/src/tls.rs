//! Client TLS configuration loader.

use std::io::{BufReader, Seek};
use std::sync::Arc;

use anyhow::Context;
use tokio_rustls::rustls::pki_types::{CertificateDer, PrivateKeyDer};
use tokio_rustls::rustls::{ClientConfig, RootCertStore};

use crate::config::TlsPaths;

/// Build a rustls client config from PEM files: the CA bundle anchors the
/// KV server, and the client cert/key are presented for mutual auth.
pub fn client_config(paths: &TlsPaths) -> anyhow::Result<Arc<ClientConfig>> {
    let ca_file = std::fs::File::open(&paths.ca_cert)
        .with_context(|| format!("open ca cert {}", paths.ca_cert.display()))?;
    let ca_certs: Vec<CertificateDer<'static>> =
        rustls_pemfile::certs(&mut BufReader::new(ca_file))
            .collect::<Result<_, _>>()
            .context("read ca certs")?;
    let mut roots = RootCertStore::empty();
    for cert in ca_certs {
        roots.add(cert).context("add ca cert")?;
    }

    let cert_file = std::fs::File::open(&paths.cert)
        .with_context(|| format!("open client cert {}", paths.cert.display()))?;
    let certs: Vec<CertificateDer<'static>> =
        rustls_pemfile::certs(&mut BufReader::new(cert_file))
            .collect::<Result<_, _>>()
            .context("read client certs")?;

    let key_file = std::fs::File::open(&paths.key)
        .with_context(|| format!("open client key {}", paths.key.display()))?;
    let mut key_reader = BufReader::new(key_file);
    let mut keys: Vec<PrivateKeyDer<'static>> =
        rustls_pemfile::pkcs8_private_keys(&mut key_reader)
            .map(|k| k.map(Into::into))
            .collect::<Result<_, _>>()
            .context("read pkcs8 private key")?;
    if keys.is_empty() {
        key_reader.rewind().context("rewind key reader")?;
        keys = rustls_pemfile::rsa_private_keys(&mut key_reader)
            .map(|k| k.map(Into::into))
            .collect::<Result<_, _>>()
            .context("read rsa private key")?;
    }
    let key = keys
        .pop()
        .ok_or_else(|| anyhow::anyhow!("no private key in {}", paths.key.display()))?;

    let config = ClientConfig::builder()
        .with_root_certificates(roots)
        .with_client_auth_cert(certs, key)
        .context("build tls client config")?;
    Ok(Arc::new(config))
}
