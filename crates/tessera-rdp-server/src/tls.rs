//! TLS setup for the RDP security selector: certificates come from the
//! property store, with a self-signed fallback so a fresh install works
//! out of the box.

use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use rcgen::{CertificateParams, KeyPair};
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};

/// Load a server config from PEM files.
pub fn load_from_files(cert_path: &Path, key_path: &Path) -> Result<Arc<rustls::ServerConfig>> {
    tracing::info!(?cert_path, ?key_path, "loading TLS certificate");

    let cert_file = std::fs::read(cert_path)
        .with_context(|| format!("failed to read certificate {}", cert_path.display()))?;
    let certs: Vec<CertificateDer<'static>> =
        rustls_pemfile::certs(&mut cert_file.as_slice())
            .collect::<Result<_, _>>()
            .context("failed to parse certificate PEM")?;

    let key_file = std::fs::read(key_path)
        .with_context(|| format!("failed to read key {}", key_path.display()))?;
    let key = rustls_pemfile::private_key(&mut key_file.as_slice())
        .context("failed to parse key PEM")?
        .context("no private key in file")?;

    make_config(certs, key)
}

/// Generate a self-signed certificate.
pub fn generate_self_signed() -> Result<Arc<rustls::ServerConfig>> {
    tracing::info!("generating self-signed TLS certificate");

    let key_pair = KeyPair::generate().context("failed to generate key pair")?;
    let mut params = CertificateParams::new(vec!["localhost".to_string()])
        .context("failed to create certificate params")?;
    params.distinguished_name.push(
        rcgen::DnType::CommonName,
        rcgen::DnValue::Utf8String("tessera-rdp-server".to_string()),
    );
    let cert = params
        .self_signed(&key_pair)
        .context("failed to self-sign certificate")?;

    let cert_der = CertificateDer::from(cert.der().to_vec());
    let key_der = PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(key_pair.serialize_der()));
    make_config(vec![cert_der], key_der)
}

fn make_config(
    certs: Vec<CertificateDer<'static>>,
    key: PrivateKeyDer<'static>,
) -> Result<Arc<rustls::ServerConfig>> {
    let config = rustls::ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .context("bad certificate/key")?;
    Ok(Arc::new(config))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn self_signed_config_builds() {
        let config = generate_self_signed().unwrap();
        assert!(!config.alpn_protocols.iter().any(|p| p == b"h2"));
    }
}
