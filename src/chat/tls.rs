//! Secure channel factory
//!
//! Wraps accepted connections in server-side TLS (rustls, ring provider).
//! Each handshake is bounded by a timeout so a peer that stalls mid-handshake
//! only ever costs its own task.

use std::fmt;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use rcgen::{CertificateParams, DistinguishedName, DnType, KeyPair};
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::ServerConfig;
use rustls_pemfile::{certs, private_key};
use sha2::{Digest, Sha256};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_rustls::server::TlsStream;
use tokio_rustls::TlsAcceptor;

use crate::chat::error::{RelayError, RelayResult};

/// Performs the TLS handshake on freshly accepted connections
#[derive(Clone)]
pub struct SecureChannelFactory {
    acceptor: TlsAcceptor,
    fingerprint: String,
    handshake_timeout: Duration,
}

impl SecureChannelFactory {
    /// Load PEM certificate chain and private key from disk
    pub fn from_pem_files(
        cert_path: &Path,
        key_path: &Path,
        handshake_timeout: Duration,
    ) -> RelayResult<Self> {
        let cert_pem = std::fs::read_to_string(cert_path).map_err(|e| {
            RelayError::Tls(format!("cannot read certificate {:?}: {}", cert_path, e))
        })?;
        let key_pem = std::fs::read_to_string(key_path).map_err(|e| {
            RelayError::Tls(format!("cannot read private key {:?}: {}", key_path, e))
        })?;

        Self::from_pem(&cert_pem, &key_pem, handshake_timeout)
    }

    /// Build from in-memory PEM data
    pub fn from_pem(
        cert_pem: &str,
        key_pem: &str,
        handshake_timeout: Duration,
    ) -> RelayResult<Self> {
        let cert_chain = parse_certificates(cert_pem)?;
        let key = parse_private_key(key_pem)?;

        let fingerprint = certificate_fingerprint(&cert_chain[0]);

        let provider = Arc::new(rustls::crypto::ring::default_provider());
        let tls_config = ServerConfig::builder_with_provider(provider)
            .with_safe_default_protocol_versions()
            .map_err(|e| RelayError::Tls(e.to_string()))?
            .with_no_client_auth()
            .with_single_cert(cert_chain, key)
            .map_err(|e| RelayError::Tls(e.to_string()))?;

        Ok(Self {
            acceptor: TlsAcceptor::from(Arc::new(tls_config)),
            fingerprint,
            handshake_timeout,
        })
    }

    /// Run the server side of the handshake on `io`
    ///
    /// On failure `io` is dropped, which closes the raw connection.
    pub async fn accept<IO>(&self, io: IO, peer: SocketAddr) -> RelayResult<TlsStream<IO>>
    where
        IO: AsyncRead + AsyncWrite + Unpin,
    {
        match tokio::time::timeout(self.handshake_timeout, self.acceptor.accept(io)).await {
            Ok(Ok(stream)) => Ok(stream),
            Ok(Err(e)) => Err(RelayError::Handshake {
                peer,
                reason: e.to_string(),
            }),
            Err(_) => Err(RelayError::Handshake {
                peer,
                reason: format!("timed out after {:?}", self.handshake_timeout),
            }),
        }
    }

    /// SHA-256 fingerprint of the leaf certificate
    pub fn fingerprint(&self) -> &str {
        &self.fingerprint
    }

    pub fn handshake_timeout(&self) -> Duration {
        self.handshake_timeout
    }
}

impl fmt::Debug for SecureChannelFactory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SecureChannelFactory")
            .field("fingerprint", &self.fingerprint)
            .field("handshake_timeout", &self.handshake_timeout)
            .finish()
    }
}

/// PEM pair produced by [`generate_self_signed`]
#[derive(Debug, Clone)]
pub struct SelfSignedCert {
    pub certificate_pem: String,
    pub private_key_pem: String,
}

/// Generate a self-signed certificate for development and tests
pub fn generate_self_signed(hostnames: &[String]) -> RelayResult<SelfSignedCert> {
    let common_name = hostnames
        .first()
        .cloned()
        .unwrap_or_else(|| "localhost".to_string());

    let mut params = CertificateParams::new(hostnames.to_vec())
        .map_err(|e| RelayError::Tls(format!("certificate generation failed: {}", e)))?;

    let mut distinguished_name = DistinguishedName::new();
    distinguished_name.push(DnType::CommonName, common_name);
    params.distinguished_name = distinguished_name;

    let key_pair = KeyPair::generate()
        .map_err(|e| RelayError::Tls(format!("key generation failed: {}", e)))?;
    let cert = params
        .self_signed(&key_pair)
        .map_err(|e| RelayError::Tls(format!("certificate generation failed: {}", e)))?;

    Ok(SelfSignedCert {
        certificate_pem: cert.pem(),
        private_key_pem: key_pair.serialize_pem(),
    })
}

/// Colon-separated upper-case SHA-256 of a DER certificate
pub fn certificate_fingerprint(der: &[u8]) -> String {
    let digest = Sha256::digest(der);
    hex::encode_upper(digest)
        .as_bytes()
        .chunks(2)
        .map(|pair| std::str::from_utf8(pair).unwrap_or("??"))
        .collect::<Vec<_>>()
        .join(":")
}

fn parse_certificates(pem: &str) -> RelayResult<Vec<CertificateDer<'static>>> {
    let mut cursor = std::io::Cursor::new(pem.as_bytes());
    let chain = certs(&mut cursor)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| RelayError::Tls(format!("certificate parsing failed: {}", e)))?;

    if chain.is_empty() {
        return Err(RelayError::Tls("no certificate found in PEM data".to_string()));
    }
    Ok(chain)
}

fn parse_private_key(pem: &str) -> RelayResult<PrivateKeyDer<'static>> {
    let mut cursor = std::io::Cursor::new(pem.as_bytes());
    private_key(&mut cursor)
        .map_err(|e| RelayError::Tls(format!("private key parsing failed: {}", e)))?
        .ok_or_else(|| RelayError::Tls("no private key found in PEM data".to_string()))
}
