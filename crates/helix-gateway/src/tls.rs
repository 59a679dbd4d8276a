//! TLS termination for the public HTTPS/WSS boundary.
//!
//! The Control Gateway is the only component in Helix RDSC that terminates
//! TLS directly from a browser; everything downstream of it travels over the
//! tunnel established by the Sandbox Supervisor.

use std::net::IpAddr;
use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum_server::tls_rustls::RustlsConfig;
use rcgen::{CertificateParams, DnType, DnValue, KeyPair, SanType};
use tokio_rustls::rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};
use tokio_rustls::rustls;

/// TLS configuration ready to hand to `axum_server::bind_rustls`.
pub struct TlsContext {
    pub config: RustlsConfig,
}

/// Generate a self-signed certificate for LAN/dev deployments.
///
/// The bind address is included in the SAN list so that browsers connecting
/// by IP see a matching certificate.
///
/// # Errors
///
/// Returns an error if key generation or certificate creation fails.
pub fn generate_self_signed(bind_ip: IpAddr) -> Result<TlsContext> {
    tracing::info!("generating self-signed TLS certificate for Control Gateway");

    let key_pair = KeyPair::generate().context("failed to generate key pair")?;

    let mut san_names = vec!["localhost".to_string()];
    let ip_str = bind_ip.to_string();
    if !bind_ip.is_unspecified() && ip_str != "localhost" {
        san_names.push(ip_str);
    }

    let mut params =
        CertificateParams::new(san_names).context("failed to create certificate params")?;
    if !bind_ip.is_unspecified() {
        params.subject_alt_names.push(SanType::IpAddress(bind_ip));
    }
    params
        .distinguished_name
        .push(DnType::CommonName, DnValue::Utf8String("helix-gateway".to_string()));

    let cert = params
        .self_signed(&key_pair)
        .context("failed to generate self-signed certificate")?;

    let cert_der = CertificateDer::from(cert.der().to_vec());
    let key_der = PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(key_pair.serialize_der()));

    let config = make_config(&[cert_der], key_der)?;
    Ok(TlsContext { config })
}

/// Load a certificate chain and private key from PEM files.
///
/// # Errors
///
/// Returns an error if the files cannot be read or contain no usable
/// certificate/key material.
pub fn load_from_files(cert_path: &Path, key_path: &Path) -> Result<TlsContext> {
    tracing::info!(?cert_path, ?key_path, "loading TLS certificate from files");

    let cert_pem = std::fs::read(cert_path)
        .with_context(|| format!("failed to read cert: {}", cert_path.display()))?;
    let certs = rustls_pemfile::certs(&mut cert_pem.as_slice())
        .collect::<Result<Vec<_>, _>>()
        .context("failed to parse PEM certificates")?;
    if certs.is_empty() {
        anyhow::bail!("no certificates found in {}", cert_path.display());
    }

    let key_pem = std::fs::read(key_path)
        .with_context(|| format!("failed to read key: {}", key_path.display()))?;
    let key = rustls_pemfile::private_key(&mut key_pem.as_slice())
        .context("failed to parse PEM private key")?
        .with_context(|| format!("no private key found in {}", key_path.display()))?;

    let config = make_config(&certs, key)?;
    Ok(TlsContext { config })
}

fn make_config(certs: &[CertificateDer<'static>], key: PrivateKeyDer<'static>) -> Result<RustlsConfig> {
    let mut server_config = rustls::ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs.to_vec(), key)
        .context("bad certificate/key")?;

    // Only enable TLS key logging in debug builds (for Wireshark analysis).
    #[cfg(debug_assertions)]
    {
        server_config.key_log = Arc::new(rustls::KeyLogFile::new());
    }
    #[cfg(not(debug_assertions))]
    {
        let _ = &server_config;
    }

    Ok(RustlsConfig::from_config(Arc::new(server_config)))
}
