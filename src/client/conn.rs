//! Client side of one connection.

use std::sync::Arc;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::config::ConnConfig;
use crate::error::{Error, Result};
use crate::transport::{BoxStream, Codec, Completion, Mux, Request, Signal};

/// Live log lines from the agent. Yields `None` once the connection is
/// closed.
pub type LogStream = mpsc::UnboundedReceiver<String>;

/// A dialed connection, ready to run one request.
///
/// Take the log stream and signal senders first, then call
/// [`ClientConn::run`].
pub struct ClientConn {
    mux: Arc<Mux>,
    logs: Option<LogStream>,
    done: mpsc::UnboundedReceiver<Completion>,
    signal_tx: mpsc::UnboundedSender<Signal>,
    signal_rx: mpsc::UnboundedReceiver<Signal>,
}

impl ClientConn {
    pub fn new(stream: BoxStream, codec: Arc<dyn Codec>, config: &ConnConfig) -> Self {
        let mut builder = Mux::builder(stream, codec).max_frame_size(config.max_frame_size);
        let logs = builder.receive::<String>();
        let done = builder.receive::<Completion>();
        let (signal_tx, signal_rx) = mpsc::unbounded_channel();

        Self {
            mux: Arc::new(builder.start()),
            logs: Some(logs),
            done,
            signal_tx,
            signal_rx,
        }
    }

    /// Take the agent's log stream. Returns `None` after the first call.
    /// Lines are discarded if nobody takes the stream.
    pub fn take_logs(&mut self) -> Option<LogStream> {
        self.logs.take()
    }

    /// Sender for signals to relay to the running job. Relaying stops
    /// when every sender is dropped or the connection closes.
    pub fn signals(&self) -> mpsc::UnboundedSender<Signal> {
        self.signal_tx.clone()
    }

    /// Cancelled once the connection has closed.
    pub fn closed_token(&self) -> CancellationToken {
        self.mux.closed_token()
    }

    /// Send `request`, wait for the agent to report completion and close
    /// the connection.
    ///
    /// Returns the agent's error message as [`Error::Remote`], or
    /// [`Error::ConnectionClosed`] when the agent went away without
    /// reporting.
    pub async fn run(self, request: Request) -> Result<()> {
        let Self {
            mux,
            logs,
            mut done,
            signal_tx,
            signal_rx,
        } = self;
        drop(signal_tx);
        drop(logs);

        debug!(job_type = %request.job_type, "Sending request");
        if let Err(e) = mux.send(request).await {
            mux.close().await;
            return Err(e);
        }

        let stop = CancellationToken::new();
        let relay = tokio::spawn(relay_signals(Arc::clone(&mux), signal_rx, stop.clone()));

        let completion = done.recv().await;

        stop.cancel();
        if let Err(e) = relay.await {
            warn!(error = %e, "signal relay did not exit cleanly");
        }
        mux.close().await;

        match completion {
            Some(Completion { error: None }) => Ok(()),
            Some(Completion { error: Some(message) }) => Err(Error::Remote(message)),
            None => Err(Error::ConnectionClosed),
        }
    }
}

async fn relay_signals(
    mux: Arc<Mux>,
    mut signals: mpsc::UnboundedReceiver<Signal>,
    stop: CancellationToken,
) {
    loop {
        let signal = tokio::select! {
            biased;
            () = stop.cancelled() => break,
            () = mux.closed() => break,
            signal = signals.recv() => match signal {
                Some(signal) => signal,
                None => break,
            },
        };
        debug!(signal = %signal, "Relaying signal");
        if let Err(e) = mux.send(signal).await {
            debug!(error = %e, "signal relay stopped");
            break;
        }
    }
}
