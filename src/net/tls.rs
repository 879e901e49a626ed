//! TLS configuration and certificate loading.
//!
//! # Responsibilities
//! - Load PEM certificate chains and private keys
//! - Build QUIC server and client crypto configs with the tunnel ALPN
//! - Select the client trust policy (webpki roots, pinned CA, or none)
//!
//! # Design Decisions
//! - rustls is pinned to the `ring` provider and TLS 1.3, as QUIC requires
//! - The insecure verifier still checks handshake signatures

use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use quinn::crypto::rustls::{QuicClientConfig, QuicServerConfig};
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::CryptoProvider;
use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName, UnixTime};
use rustls::{DigitallySignedStruct, RootCertStore, SignatureScheme};

use crate::config::TunnelConfig;
use crate::error::TunnelError;

fn provider() -> Arc<CryptoProvider> {
    Arc::new(rustls::crypto::ring::default_provider())
}

/// Load a certificate chain from a PEM file.
pub fn load_certs(path: &Path) -> Result<Vec<CertificateDer<'static>>, TunnelError> {
    let file = File::open(path)
        .map_err(|e| TunnelError::Tls(format!("failed to open cert file {}: {e}", path.display())))?;
    let certs = rustls_pemfile::certs(&mut BufReader::new(file))
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| TunnelError::Tls(format!("failed to parse certificates in {}: {e}", path.display())))?;
    if certs.is_empty() {
        return Err(TunnelError::Tls(format!("no certificates found in {}", path.display())));
    }
    tracing::debug!(count = certs.len(), path = %path.display(), "Loaded certificates");
    Ok(certs)
}

/// Load the first private key (PKCS#1, PKCS#8 or SEC1) from a PEM file.
pub fn load_private_key(path: &Path) -> Result<PrivateKeyDer<'static>, TunnelError> {
    let file = File::open(path)
        .map_err(|e| TunnelError::Tls(format!("failed to open key file {}: {e}", path.display())))?;
    rustls_pemfile::private_key(&mut BufReader::new(file))
        .map_err(|e| TunnelError::Tls(format!("failed to parse private key in {}: {e}", path.display())))?
        .ok_or_else(|| TunnelError::Tls(format!("no private key found in {}", path.display())))
}

/// QUIC transport settings shared by both endpoints.
pub fn transport_config(idle_timeout: Duration) -> Result<quinn::TransportConfig, TunnelError> {
    let idle = quinn::IdleTimeout::try_from(idle_timeout)
        .map_err(|_| TunnelError::Tls(format!("idle timeout {idle_timeout:?} is out of range")))?;
    let mut transport = quinn::TransportConfig::default();
    transport.max_idle_timeout(Some(idle));
    Ok(transport)
}

/// Build the QUIC server config.
pub fn server_config(
    certs: Vec<CertificateDer<'static>>,
    key: PrivateKeyDer<'static>,
    alpn: &str,
    idle_timeout: Duration,
) -> Result<quinn::ServerConfig, TunnelError> {
    let mut crypto = rustls::ServerConfig::builder_with_provider(provider())
        .with_protocol_versions(&[&rustls::version::TLS13])
        .map_err(|e| TunnelError::Tls(e.to_string()))?
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .map_err(|e| TunnelError::Tls(e.to_string()))?;
    crypto.alpn_protocols = vec![alpn.as_bytes().to_vec()];

    let crypto = QuicServerConfig::try_from(crypto).map_err(|e| TunnelError::Tls(e.to_string()))?;
    let mut config = quinn::ServerConfig::with_crypto(Arc::new(crypto));
    config.transport_config(Arc::new(transport_config(idle_timeout)?));
    Ok(config)
}

/// How a client decides whether to trust the server certificate.
#[derive(Debug, Clone)]
pub enum ClientTrust {
    /// Mozilla's root program via `webpki-roots`.
    WebPki,
    /// Only the given CA certificates.
    Pinned(Vec<CertificateDer<'static>>),
    /// Accept any certificate.
    Insecure,
}

/// Build a rustls client config for the given trust policy and ALPN list.
pub fn rustls_client_config(trust: &ClientTrust, alpn: &[&[u8]]) -> Result<rustls::ClientConfig, TunnelError> {
    let provider = provider();
    let builder = rustls::ClientConfig::builder_with_provider(provider.clone())
        .with_protocol_versions(&[&rustls::version::TLS13])
        .map_err(|e| TunnelError::Tls(e.to_string()))?;

    let mut config = match trust {
        ClientTrust::Insecure => builder
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(SkipServerVerification(provider)))
            .with_no_client_auth(),
        ClientTrust::WebPki => {
            let mut roots = RootCertStore::empty();
            roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
            builder.with_root_certificates(roots).with_no_client_auth()
        }
        ClientTrust::Pinned(cas) => {
            let mut roots = RootCertStore::empty();
            for ca in cas {
                roots.add(ca.clone()).map_err(|e| TunnelError::Tls(e.to_string()))?;
            }
            builder.with_root_certificates(roots).with_no_client_auth()
        }
    };
    config.alpn_protocols = alpn.iter().map(|p| p.to_vec()).collect();
    Ok(config)
}

/// Build the QUIC client config.
pub fn client_config(trust: &ClientTrust, alpn: &str, idle_timeout: Duration) -> Result<quinn::ClientConfig, TunnelError> {
    let crypto = rustls_client_config(trust, &[alpn.as_bytes()])?;
    let crypto = QuicClientConfig::try_from(crypto).map_err(|e| TunnelError::Tls(e.to_string()))?;
    let mut config = quinn::ClientConfig::new(Arc::new(crypto));
    config.transport_config(Arc::new(transport_config(idle_timeout)?));
    Ok(config)
}

/// Server config from the `[tls]` and `[transport]` sections.
pub fn server_config_from(config: &TunnelConfig) -> Result<quinn::ServerConfig, TunnelError> {
    let (Some(cert_path), Some(key_path)) = (&config.tls.cert_path, &config.tls.key_path) else {
        return Err(TunnelError::Tls("server requires tls.cert_path and tls.key_path".into()));
    };
    let certs = load_certs(Path::new(cert_path))?;
    let key = load_private_key(Path::new(key_path))?;
    server_config(certs, key, &config.tls.alpn, config.transport.idle_timeout())
}

/// Client config from the `[tls]` and `[transport]` sections.
pub fn client_config_from(config: &TunnelConfig) -> Result<quinn::ClientConfig, TunnelError> {
    let trust = if config.tls.insecure_skip_verify {
        tracing::warn!("Server certificate verification is disabled");
        ClientTrust::Insecure
    } else if let Some(ca) = &config.tls.ca_cert_path {
        ClientTrust::Pinned(load_certs(Path::new(ca))?)
    } else {
        ClientTrust::WebPki
    };
    client_config(&trust, &config.tls.alpn, config.transport.idle_timeout())
}

/// Accepts any server certificate but still verifies handshake signatures.
#[derive(Debug)]
struct SkipServerVerification(Arc<CryptoProvider>);

impl ServerCertVerifier for SkipServerVerification {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls12_signature(message, cert, dss, &self.0.signature_verification_algorithms)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls13_signature(message, cert, dss, &self.0.signature_verification_algorithms)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.0.signature_verification_algorithms.supported_schemes()
    }
}
