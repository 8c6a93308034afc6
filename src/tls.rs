//! TLS policy for agents and clients.
//!
//! Both ends load a certificate, its private key and a CA bundle. The CA
//! bundle is used to verify the peer: agents require client certificates
//! unless client auth is turned off.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use rustls::pki_types::pem::PemObject;
use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName};
use rustls::{ClientConfig, RootCertStore, ServerConfig};
use tokio_rustls::{TlsAcceptor, TlsConnector};

use crate::error::{Error, Result};

/// Certificate file paths, usually taken from the environment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TlsPaths {
    pub cert: PathBuf,
    pub key: PathBuf,
    pub ca: PathBuf,
}

impl TlsPaths {
    /// Read `TLS_CERT`, `TLS_KEY` and `TLS_CA`. All three are required.
    pub fn from_env() -> Result<Self> {
        let var = |name: &str| std::env::var_os(name).filter(|v| !v.is_empty());
        match (var("TLS_CERT"), var("TLS_KEY"), var("TLS_CA")) {
            (Some(cert), Some(key), Some(ca)) => Ok(Self {
                cert: cert.into(),
                key: key.into(),
                ca: ca.into(),
            }),
            _ => Err(Error::Config(
                "must provide cert, key, and CA certificate files (TLS_CERT, TLS_KEY, TLS_CA)"
                    .into(),
            )),
        }
    }
}

/// Ready-made TLS configuration for both directions.
#[derive(Clone)]
pub struct TlsConfig {
    server: Arc<ServerConfig>,
    client: Arc<ClientConfig>,
}

impl std::fmt::Debug for TlsConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TlsConfig").finish_non_exhaustive()
    }
}

/// Builder for [`TlsConfig`].
#[derive(Default)]
pub struct TlsConfigBuilder {
    ca_pem: Option<Vec<u8>>,
    cert_pem: Option<Vec<u8>>,
    key_pem: Option<Vec<u8>>,
    optional_client_auth: bool,
}

impl TlsConfigBuilder {
    #[must_use]
    pub fn ca_pem(mut self, pem: impl Into<Vec<u8>>) -> Self {
        self.ca_pem = Some(pem.into());
        self
    }

    #[must_use]
    pub fn cert_pem(mut self, pem: impl Into<Vec<u8>>) -> Self {
        self.cert_pem = Some(pem.into());
        self
    }

    #[must_use]
    pub fn key_pem(mut self, pem: impl Into<Vec<u8>>) -> Self {
        self.key_pem = Some(pem.into());
        self
    }

    /// Accept clients without a certificate (server side only).
    #[must_use]
    pub const fn optional_client_auth(mut self, optional: bool) -> Self {
        self.optional_client_auth = optional;
        self
    }

    pub fn build(self) -> Result<TlsConfig> {
        let ca_pem = self
            .ca_pem
            .ok_or_else(|| Error::Tls("CA certificate required".into()))?;
        let cert_pem = self
            .cert_pem
            .ok_or_else(|| Error::Tls("certificate required".into()))?;
        let key_pem = self
            .key_pem
            .ok_or_else(|| Error::Tls("private key required".into()))?;

        let ca_certs = parse_certificates(&ca_pem)?;
        if ca_certs.is_empty() {
            return Err(Error::Tls("no CA certificates found".into()));
        }
        let mut roots = RootCertStore::empty();
        for cert in ca_certs {
            roots
                .add(cert)
                .map_err(|e| Error::Tls(format!("failed to add CA certificate: {e}")))?;
        }
        let roots = Arc::new(roots);

        let certs = parse_certificates(&cert_pem)?;
        if certs.is_empty() {
            return Err(Error::Tls("no certificates found".into()));
        }
        let key = parse_private_key(&key_pem)?;

        let client = ClientConfig::builder()
            .with_root_certificates(Arc::clone(&roots))
            .with_client_auth_cert(certs.clone(), key.clone_key())
            .map_err(|e| Error::Tls(format!("client config error: {e}")))?;

        let mut verifier = rustls::server::WebPkiClientVerifier::builder(roots);
        if self.optional_client_auth {
            verifier = verifier.allow_unauthenticated();
        }
        let verifier = verifier
            .build()
            .map_err(|e| Error::Tls(format!("client verifier error: {e}")))?;

        let server = ServerConfig::builder()
            .with_client_cert_verifier(verifier)
            .with_single_cert(certs, key)
            .map_err(|e| Error::Tls(format!("server config error: {e}")))?;

        Ok(TlsConfig {
            server: Arc::new(server),
            client: Arc::new(client),
        })
    }
}

impl TlsConfig {
    pub fn builder() -> TlsConfigBuilder {
        TlsConfigBuilder::default()
    }

    /// Load certificate, key and CA bundle from PEM files.
    pub fn from_files(cert: &Path, key: &Path, ca: &Path) -> Result<Self> {
        let read = |path: &Path| {
            std::fs::read(path)
                .map_err(|e| Error::Tls(format!("could not read {}: {e}", path.display())))
        };
        Self::builder()
            .cert_pem(read(cert)?)
            .key_pem(read(key)?)
            .ca_pem(read(ca)?)
            .build()
    }

    /// Load the files named by `TLS_CERT`, `TLS_KEY` and `TLS_CA`.
    pub fn from_env() -> Result<Self> {
        let paths = TlsPaths::from_env()?;
        Self::from_files(&paths.cert, &paths.key, &paths.ca)
    }

    pub fn acceptor(&self) -> TlsAcceptor {
        TlsAcceptor::from(Arc::clone(&self.server))
    }

    pub fn connector(&self) -> TlsConnector {
        TlsConnector::from(Arc::clone(&self.client))
    }
}

/// Server name to verify for a dial address such as `agent.local:8814`.
pub(crate) fn server_name(addr: &str) -> Result<ServerName<'static>> {
    let host = match addr.rsplit_once(':') {
        Some((host, _port)) => host,
        None => addr,
    };
    let host = host.trim_start_matches('[').trim_end_matches(']');
    ServerName::try_from(host.to_string())
        .map_err(|e| Error::Tls(format!("invalid server name '{host}': {e}")))
}

fn parse_certificates(pem: &[u8]) -> Result<Vec<CertificateDer<'static>>> {
    CertificateDer::pem_slice_iter(pem)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| Error::Tls(format!("failed to parse certificates: {e}")))
}

fn parse_private_key(pem: &[u8]) -> Result<PrivateKeyDer<'static>> {
    PrivateKeyDer::from_pem_slice(pem)
        .map_err(|e| Error::Tls(format!("failed to parse private key: {e}")))
}
