//! The agent process: accepts connections and runs one job per connection.

mod conn;

pub use conn::{AgentConn, SignalQueue};

use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, info_span, warn, Instrument};

use crate::config::Config;
use crate::discovery::{NoopRegistrator, Registrator};
use crate::error::{Error, Result};
use crate::listener::{self, Incoming, Listener, Server};
use crate::registry::Registry;
use crate::tls::TlsConfig;
use crate::transport::{Codec, JsonCodec};

/// Serves registered jobs to clients.
pub struct Agent {
    registry: Arc<Registry>,
    config: Config,
    codec: Arc<dyn Codec>,
    tls: Option<TlsConfig>,
    registrator: Box<dyn Registrator>,
    handle_signals: bool,
    shutdown: CancellationToken,
    connections: TaskTracker,
}

/// Builder for [`Agent`].
pub struct AgentBuilder {
    registry: Arc<Registry>,
    config: Config,
    codec: Arc<dyn Codec>,
    tls: Option<TlsConfig>,
    registrator: Box<dyn Registrator>,
    handle_signals: bool,
}

impl AgentBuilder {
    #[must_use]
    pub fn config(mut self, config: Config) -> Self {
        self.config = config;
        self
    }

    #[must_use]
    pub fn codec(mut self, codec: Arc<dyn Codec>) -> Self {
        self.codec = codec;
        self
    }

    /// Terminate TLS on every accepted connection.
    #[must_use]
    pub fn tls(mut self, tls: TlsConfig) -> Self {
        self.tls = Some(tls);
        self
    }

    /// Announce the agent's job types while it is listening.
    #[must_use]
    pub fn registrator(mut self, registrator: impl Registrator + 'static) -> Self {
        self.registrator = Box::new(registrator);
        self
    }

    /// Whether SIGINT/SIGTERM/SIGQUIT (Ctrl-C on Windows) shut the agent
    /// down. On by default.
    #[must_use]
    pub const fn handle_signals(mut self, enabled: bool) -> Self {
        self.handle_signals = enabled;
        self
    }

    pub fn build(self) -> Agent {
        Agent {
            registry: self.registry,
            config: self.config,
            codec: self.codec,
            tls: self.tls,
            registrator: self.registrator,
            handle_signals: self.handle_signals,
            shutdown: CancellationToken::new(),
            connections: TaskTracker::new(),
        }
    }
}

impl Agent {
    pub fn builder(registry: Arc<Registry>) -> AgentBuilder {
        AgentBuilder {
            registry,
            config: Config::default(),
            codec: Arc::new(JsonCodec),
            tls: None,
            registrator: Box::new(NoopRegistrator),
            handle_signals: true,
        }
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Bind `addr` and serve until shutdown.
    pub async fn start(&self, addr: &str) -> Result<()> {
        let listener = self.bind(addr).await?;
        self.run(listener).await
    }

    /// Bind a listener with this agent's settings, terminating TLS when
    /// configured.
    pub async fn bind(&self, addr: &str) -> Result<Listener> {
        match &self.tls {
            Some(tls) => {
                Listener::bind_tls(addr, &self.config.listener, &self.config.conn, tls).await
            }
            None => Listener::bind(addr, &self.config.listener, &self.config.conn).await,
        }
    }

    /// Serve on an already bound listener until shutdown, then wait for
    /// in-flight connections up to the configured grace period.
    pub async fn run(&self, listener: Listener) -> Result<()> {
        let watcher = self
            .handle_signals
            .then(|| tokio::spawn(watch_signals(self.shutdown.clone())));

        let port = listener.local_addr()?.port();
        if let Err(e) = self.registrator.register(port, &self.registry).await {
            warn!(error = %e, "Registration failed");
        }

        listener::serve(&listener, self).await;
        drop(listener);

        if let Err(e) = self.registrator.deregister().await {
            warn!(error = %e, "Deregistration failed");
        }
        if let Some(watcher) = watcher {
            watcher.abort();
        }

        self.connections.close();
        let grace = self.config.agent.shutdown_grace();
        if tokio::time::timeout(grace, self.connections.wait())
            .await
            .is_err()
        {
            warn!(
                remaining = self.connections.len(),
                "Connections still running after shutdown grace period"
            );
        }
        info!("Agent stopped");
        Ok(())
    }

    /// Stop accepting and cancel every open connection.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    pub fn is_shutdown(&self) -> bool {
        self.shutdown.is_cancelled()
    }
}

impl Server for Agent {
    fn serve(&self, incoming: Incoming) {
        let registry = Arc::clone(&self.registry);
        let codec = Arc::clone(&self.codec);
        let config = self.config.conn.clone();
        let shutdown = self.shutdown.clone();
        let peer = incoming.peer_addr();

        self.connections.spawn(
            async move {
                let stream = match incoming.establish().await {
                    Ok(stream) => stream,
                    Err(e) => {
                        warn!(error = %e, "Connection setup failed");
                        return;
                    }
                };

                let conn = AgentConn::new(stream, codec, &config, &shutdown).with_peer(peer);
                match conn.serve(&registry).await {
                    Ok(()) => debug!("Job finished"),
                    Err(Error::ConnectionShutdown) => debug!("Connection closed before a request"),
                    Err(e) => info!(error = %e, "Job failed"),
                }
            }
            .instrument(info_span!("conn", peer = %peer)),
        );
    }

    fn shutdown_token(&self) -> &CancellationToken {
        &self.shutdown
    }
}

/// Cancel `shutdown` when the process is asked to stop.
async fn watch_signals(shutdown: CancellationToken) {
    tokio::select! {
        () = shutdown.cancelled() => {}
        received = wait_for_signal() => match received {
            Ok(name) => {
                info!(signal = name, "Received signal, shutting down");
                shutdown.cancel();
            }
            Err(e) => warn!(error = %e, "Could not install signal handlers"),
        }
    }
}

#[cfg(unix)]
async fn wait_for_signal() -> std::io::Result<&'static str> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut interrupt = signal(SignalKind::interrupt())?;
    let mut terminate = signal(SignalKind::terminate())?;
    let mut quit = signal(SignalKind::quit())?;

    let name = tokio::select! {
        _ = interrupt.recv() => "SIGINT",
        _ = terminate.recv() => "SIGTERM",
        _ = quit.recv() => "SIGQUIT",
    };
    Ok(name)
}

#[cfg(not(unix))]
async fn wait_for_signal() -> std::io::Result<&'static str> {
    tokio::signal::ctrl_c().await?;
    Ok("Ctrl-C")
}
