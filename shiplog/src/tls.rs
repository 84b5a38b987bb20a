//! TLS configuration built from PEM files.
//!
//! Both planes of the shared port use the same material: the server side
//! terminates client RPC and inbound consensus connections, the peer side
//! dials other nodes. When a CA is configured the server requires client
//! certificates, and the certificate Common Name becomes the authorization
//! subject.

use crate::error::{LogError, Result};
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::RootCertStore;
use std::fs;
use std::path::PathBuf;
use std::sync::Arc;

/// Paths to this node's PEM material.
#[derive(Debug, Clone)]
pub struct TlsFiles {
    /// Certificate chain.
    pub cert_file: PathBuf,
    /// Private key.
    pub key_file: PathBuf,
    /// CA bundle used to verify the other side; required for mutual auth.
    pub ca_file: Option<PathBuf>,
}

impl TlsFiles {
    fn load_certs(&self) -> Result<Vec<CertificateDer<'static>>> {
        let pem = fs::read(&self.cert_file)?;
        rustls_pemfile::certs(&mut pem.as_slice())
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(|e| LogError::Config(format!("parse {}: {}", self.cert_file.display(), e)))
    }

    fn load_key(&self) -> Result<PrivateKeyDer<'static>> {
        let pem = fs::read(&self.key_file)?;
        rustls_pemfile::private_key(&mut pem.as_slice())
            .map_err(|e| LogError::Config(format!("parse {}: {}", self.key_file.display(), e)))?
            .ok_or_else(|| {
                LogError::Config(format!("no private key in {}", self.key_file.display()))
            })
    }

    fn load_roots(&self) -> Result<RootCertStore> {
        let ca_file = self.ca_file.as_ref().ok_or_else(|| {
            LogError::Config("a CA file is required to verify the remote side".to_string())
        })?;
        let pem = fs::read(ca_file)?;
        let mut roots = RootCertStore::empty();
        for cert in rustls_pemfile::certs(&mut pem.as_slice()) {
            let cert =
                cert.map_err(|e| LogError::Config(format!("parse {}: {}", ca_file.display(), e)))?;
            roots
                .add(cert)
                .map_err(|e| LogError::Config(format!("add CA cert: {}", e)))?;
        }
        Ok(roots)
    }

    /// Server-side config. With a CA configured, clients must present a
    /// certificate signed by it (mutual auth).
    pub fn server_config(&self) -> Result<Arc<rustls::ServerConfig>> {
        let certs = self.load_certs()?;
        let key = self.load_key()?;

        let builder = rustls::ServerConfig::builder();
        let mut config = if self.ca_file.is_some() {
            let verifier = rustls::server::WebPkiClientVerifier::builder(Arc::new(
                self.load_roots()?,
            ))
            .build()
            .map_err(|e| LogError::Config(format!("client verifier: {}", e)))?;
            builder
                .with_client_cert_verifier(verifier)
                .with_single_cert(certs, key)
                .map_err(|e| LogError::Config(format!("server cert: {}", e)))?
        } else {
            builder
                .with_no_client_auth()
                .with_single_cert(certs, key)
                .map_err(|e| LogError::Config(format!("server cert: {}", e)))?
        };
        // Client RPC rides gRPC over HTTP/2.
        config.alpn_protocols = vec![b"h2".to_vec()];
        Ok(Arc::new(config))
    }

    /// Client-side config presenting our certificate to the remote server.
    pub fn client_config(&self) -> Result<Arc<rustls::ClientConfig>> {
        let certs = self.load_certs()?;
        let key = self.load_key()?;
        let roots = self.load_roots()?;
        let config = rustls::ClientConfig::builder()
            .with_root_certificates(roots)
            .with_client_auth_cert(certs, key)
            .map_err(|e| LogError::Config(format!("client cert: {}", e)))?;
        Ok(Arc::new(config))
    }
}
