//! Dialing agents.

mod conn;

pub use conn::{ClientConn, LogStream};

use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpStream;
use tracing::{debug, instrument};

use crate::config::ConnConfig;
use crate::error::{Error, Result};
use crate::tls::{server_name, TlsConfig};
use crate::transport::{BoxStream, Codec, JsonCodec};

/// Opens connections to agents.
#[derive(Clone)]
pub struct Client {
    config: ConnConfig,
    tls: Option<TlsConfig>,
    codec: Arc<dyn Codec>,
}

impl Default for Client {
    fn default() -> Self {
        Self::new(ConnConfig::default())
    }
}

impl Client {
    pub fn new(config: ConnConfig) -> Self {
        Self {
            config,
            tls: None,
            codec: Arc::new(JsonCodec),
        }
    }

    /// Dial agents over TLS.
    #[must_use]
    pub fn with_tls(mut self, tls: TlsConfig) -> Self {
        self.tls = Some(tls);
        self
    }

    #[must_use]
    pub fn with_codec(mut self, codec: Arc<dyn Codec>) -> Self {
        self.codec = codec;
        self
    }

    /// Connect to the agent at `addr` using the configured dial timeout.
    pub async fn dial(&self, addr: &str) -> Result<ClientConn> {
        self.dial_timeout(addr, self.config.dial_timeout()).await
    }

    /// Connect to the agent at `addr`, giving up after `timeout`.
    #[instrument(skip(self))]
    pub async fn dial_timeout(&self, addr: &str, timeout: Duration) -> Result<ClientConn> {
        let tcp = tokio::time::timeout(timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| Error::Timeout("dial"))??;
        if let Err(e) = tcp.set_nodelay(true) {
            debug!(error = %e, "failed to set TCP_NODELAY");
        }

        let stream: BoxStream = match &self.tls {
            None => Box::new(tcp),
            Some(tls) => {
                let name = server_name(addr)?;
                let stream = tokio::time::timeout(
                    self.config.handshake_timeout(),
                    tls.connector().connect(name, tcp),
                )
                .await
                .map_err(|_| Error::Timeout("TLS handshake"))?
                .map_err(|e| Error::Tls(format!("handshake with {addr}: {e}")))?;
                Box::new(stream)
            }
        };

        debug!("Connected");
        Ok(ClientConn::new(stream, Arc::clone(&self.codec), &self.config))
    }
}

/// Dial `addr` with default settings.
pub async fn dial(addr: &str) -> Result<ClientConn> {
    Client::default().dial(addr).await
}
