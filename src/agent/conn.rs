//! Agent side of one connection.
//!
//! A connection carries exactly one job: wait for the request, resolve it
//! through the [`Registry`], run it while its log lines stream to the
//! client, then report completion and close.

use std::net::SocketAddr;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures::FutureExt;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::ConnConfig;
use crate::error::{Error, Result};
use crate::registry::Registry;
use crate::transport::{BoxStream, Codec, Completion, Mux, Request, Signal};

/// Shared handle to the connection's inbound signal queue.
pub type SignalQueue = Arc<Mutex<mpsc::UnboundedReceiver<Signal>>>;

/// One accepted connection, from request to completion.
pub struct AgentConn {
    mux: Arc<Mux>,
    requests: mpsc::UnboundedReceiver<Request>,
    signals: SignalQueue,
    logs: mpsc::Sender<String>,
    finished: CancellationToken,
    forwarder: Option<JoinHandle<()>>,
    peer: Option<SocketAddr>,
}

impl AgentConn {
    /// Wrap `stream` and start its decode loop and log forwarder.
    ///
    /// The connection closes when `shutdown` is cancelled.
    pub fn new(
        stream: BoxStream,
        codec: Arc<dyn Codec>,
        config: &ConnConfig,
        shutdown: &CancellationToken,
    ) -> Self {
        let mut builder = Mux::builder(stream, codec)
            .max_frame_size(config.max_frame_size)
            .shutdown_with(shutdown);
        let requests = builder.receive::<Request>();
        let signals = builder.receive::<Signal>();
        let mux = Arc::new(builder.start());

        let (logs, log_rx) = mpsc::channel(config.log_buffer);
        let finished = CancellationToken::new();
        let forwarder = tokio::spawn(forward_logs(
            Arc::clone(&mux),
            log_rx,
            finished.clone(),
        ));

        Self {
            mux,
            requests,
            signals: Arc::new(Mutex::new(signals)),
            logs,
            finished,
            forwarder: Some(forwarder),
            peer: None,
        }
    }

    /// Record the remote address, for logging.
    #[must_use]
    pub const fn with_peer(mut self, peer: SocketAddr) -> Self {
        self.peer = Some(peer);
        self
    }

    /// Sender for log lines bound for the client. Waits when the buffer is
    /// full.
    pub fn logs(&self) -> mpsc::Sender<String> {
        self.logs.clone()
    }

    /// Send one log line to the client. Lines are dropped once the client
    /// has gone away.
    pub async fn log(&self, line: impl Into<String>) {
        if self.logs.send(line.into()).await.is_err() {
            debug!("log forwarder gone, line dropped");
        }
    }

    /// Signals sent by the client.
    pub fn signals(&self) -> SignalQueue {
        Arc::clone(&self.signals)
    }

    /// Cancelled when the agent shuts down or the client disconnects.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.mux.closed_token()
    }

    pub const fn peer_addr(&self) -> Option<SocketAddr> {
        self.peer
    }

    /// Serve the connection's one job and close it.
    ///
    /// Returns the job's result, which is also reported to the client
    /// while the connection can still carry it. A shutdown before the
    /// request arrived is reported as "connection shutdown".
    pub async fn serve(mut self, registry: &Registry) -> Result<()> {
        let request = tokio::select! {
            biased;
            request = self.requests.recv() => request.ok_or(Error::ConnectionShutdown),
            () = self.mux.closed() => Err(Error::ConnectionShutdown),
        };

        let result = match request {
            Ok(request) => self.dispatch(registry, &request).await,
            Err(e) => Err(e),
        };

        self.complete(&result).await;
        self.close().await;
        result
    }

    async fn dispatch(&self, registry: &Registry, request: &Request) -> Result<()> {
        let job = registry.get(request)?;
        info!(job_type = %request.job_type, peer = ?self.peer, "Running job");

        match AssertUnwindSafe(job.run(self)).catch_unwind().await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(Error::Job(e)),
            Err(_) => {
                error!(job_type = %request.job_type, "Job panicked");
                Err(Error::UnexpectedError)
            }
        }
    }

    /// Flush the remaining log lines, then send the completion report.
    async fn complete(&mut self, result: &Result<()>) {
        self.stop_forwarder().await;

        let completion = Completion {
            error: result.as_ref().err().map(ToString::to_string),
        };
        if let Err(e) = self.mux.send(completion).await {
            debug!(error = %e, "could not report completion");
        }
    }

    async fn stop_forwarder(&mut self) {
        self.finished.cancel();
        if let Some(forwarder) = self.forwarder.take() {
            if let Err(e) = forwarder.await {
                warn!(error = %e, "log forwarder did not exit cleanly");
            }
        }
    }

    async fn close(&mut self) {
        self.stop_forwarder().await;
        self.mux.close().await;
    }
}

/// Move log lines from the job's queue onto the wire until `finished`,
/// then flush whatever is still buffered. Stops as soon as the connection
/// closes; lines still queued then are dropped.
async fn forward_logs(
    mux: Arc<Mux>,
    mut lines: mpsc::Receiver<String>,
    finished: CancellationToken,
) {
    loop {
        tokio::select! {
            biased;
            () = finished.cancelled() => {
                while let Ok(line) = lines.try_recv() {
                    send_line(&mux, line).await;
                }
                break;
            }
            () = mux.closed() => {
                debug!("connection closed, log forwarding stopped");
                break;
            }
            line = lines.recv() => match line {
                Some(line) => send_line(&mux, line).await,
                None => break,
            },
        }
    }
}

async fn send_line(mux: &Mux, line: String) {
    // Keep draining after a failed send so jobs never block on a dead client.
    if let Err(e) = mux.send(line).await {
        debug!(error = %e, "log line dropped");
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use async_trait::async_trait;

    use super::*;
    use crate::job::Job;
    use crate::transport::{send_message, JsonCodec, Message, DEFAULT_MAX_FRAME_SIZE};

    #[derive(Clone)]
    struct Echo {
        message: String,
    }

    #[async_trait]
    impl Job for Echo {
        fn job_type(&self) -> &str {
            "echo"
        }

        fn configure(&mut self, data: &[u8]) -> anyhow::Result<()> {
            self.message = String::from_utf8(data.to_vec())?;
            Ok(())
        }

        async fn run(&self, conn: &AgentConn) -> anyhow::Result<()> {
            conn.log(self.message.clone()).await;
            Ok(())
        }
    }

    #[derive(Clone)]
    struct Panics;

    #[async_trait]
    impl Job for Panics {
        fn job_type(&self) -> &str {
            "panics"
        }

        fn configure(&mut self, _data: &[u8]) -> anyhow::Result<()> {
            Ok(())
        }

        async fn run(&self, _conn: &AgentConn) -> anyhow::Result<()> {
            panic!("boom");
        }
    }

    /// Logs until the connection shuts down.
    #[derive(Clone)]
    struct Chatty;

    #[async_trait]
    impl Job for Chatty {
        fn job_type(&self) -> &str {
            "chatty"
        }

        fn configure(&mut self, _data: &[u8]) -> anyhow::Result<()> {
            Ok(())
        }

        async fn run(&self, conn: &AgentConn) -> anyhow::Result<()> {
            let shutdown = conn.shutdown_token();
            loop {
                tokio::select! {
                    () = shutdown.cancelled() => return Ok(()),
                    () = conn.log("chatter ".repeat(16)) => {}
                }
            }
        }
    }

    struct Peer {
        mux: Mux,
        logs: mpsc::UnboundedReceiver<String>,
        done: mpsc::UnboundedReceiver<Completion>,
    }

    fn connect(shutdown: &CancellationToken) -> (AgentConn, Peer) {
        let (agent_io, client_io) = tokio::io::duplex(64 * 1024);
        let conn = AgentConn::new(
            Box::new(agent_io),
            Arc::new(JsonCodec),
            &ConnConfig::default(),
            shutdown,
        );

        let mut builder = Mux::builder(Box::new(client_io), Arc::new(JsonCodec));
        let logs = builder.receive::<String>();
        let done = builder.receive::<Completion>();
        let peer = Peer {
            mux: builder.start(),
            logs,
            done,
        };
        (conn, peer)
    }

    fn registry() -> Registry {
        let registry = Registry::new();
        registry.add(Echo {
            message: String::new(),
        });
        registry.add(Panics);
        registry
    }

    #[tokio::test]
    async fn logs_arrive_before_completion() {
        let (conn, mut peer) = connect(&CancellationToken::new());
        let registry = registry();

        peer.mux.send(Request::new("echo", "hello")).await.unwrap();
        conn.serve(&registry).await.unwrap();

        assert_eq!(peer.logs.recv().await.as_deref(), Some("hello"));
        assert_eq!(peer.done.recv().await, Some(Completion { error: None }));
        assert!(peer.done.recv().await.is_none());
    }

    #[tokio::test]
    async fn unknown_job_is_reported() {
        let (conn, mut peer) = connect(&CancellationToken::new());

        peer.mux.send(Request::new("missing", "")).await.unwrap();
        let err = conn.serve(&registry()).await.unwrap_err();
        assert!(matches!(err, Error::JobNotFound(_)));

        let done = peer.done.recv().await.unwrap();
        assert_eq!(done.error.as_deref(), Some("job not found: missing"));
    }

    #[tokio::test]
    async fn panic_becomes_unexpected_error() {
        let (conn, mut peer) = connect(&CancellationToken::new());

        peer.mux.send(Request::new("panics", "")).await.unwrap();
        let err = conn.serve(&registry()).await.unwrap_err();
        assert!(matches!(err, Error::UnexpectedError));

        let done = peer.done.recv().await.unwrap();
        assert_eq!(
            done.error.as_deref(),
            Some("job exited with unexpected error")
        );
    }

    #[tokio::test]
    async fn shutdown_before_request() {
        let shutdown = CancellationToken::new();
        let (conn, mut peer) = connect(&shutdown);

        shutdown.cancel();
        let err = conn.serve(&registry()).await.unwrap_err();
        assert!(matches!(err, Error::ConnectionShutdown));
        assert_eq!(
            peer.done.recv().await,
            Some(Completion {
                error: Some("connection shutdown".to_string())
            })
        );
        assert!(peer.done.recv().await.is_none());
    }

    #[tokio::test]
    async fn shutdown_unblocks_a_stalled_client() {
        let shutdown = CancellationToken::new();
        // The client sends its request and then never reads.
        let (agent_io, mut client_io) = tokio::io::duplex(1024);
        let conn = AgentConn::new(
            Box::new(agent_io),
            Arc::new(JsonCodec),
            &ConnConfig::default(),
            &shutdown,
        );
        let payload = JsonCodec
            .encode(&Request::new("chatty", "").into_frame())
            .unwrap();
        send_message(&mut client_io, &payload, DEFAULT_MAX_FRAME_SIZE)
            .await
            .unwrap();

        let registry = Registry::new();
        registry.add(Chatty);
        let serving = tokio::spawn(async move { conn.serve(&registry).await });

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(!serving.is_finished());
        shutdown.cancel();

        let result = tokio::time::timeout(Duration::from_secs(3), serving)
            .await
            .expect("serve did not return after shutdown")
            .unwrap();
        assert!(result.is_ok());
        drop(client_io);
    }

    #[tokio::test]
    async fn client_hangup_before_request() {
        let (conn, peer) = connect(&CancellationToken::new());

        peer.mux.close().await;
        let err = conn.serve(&registry()).await.unwrap_err();
        assert!(matches!(err, Error::ConnectionShutdown));
    }

    #[tokio::test]
    async fn signals_are_queued_for_the_job() {
        let (conn, peer) = connect(&CancellationToken::new());

        peer.mux.send(Signal::INTERRUPT).await.unwrap();
        let signals = conn.signals();
        let received = signals.lock().await.recv().await;
        assert_eq!(received, Some(Signal::INTERRUPT));
        assert!(!conn.shutdown_token().is_cancelled());
    }
}
