//! Bridges a job's own connection to a connection it opened to another
//! agent: the child's logs flow up to the parent's client, and signals
//! from the parent's client flow down to the child.

use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::agent::{AgentConn, SignalQueue};
use crate::client::{ClientConn, LogStream};
use crate::transport::Signal;

/// Running bridge between a parent and a child connection.
pub struct Communicator {
    exit: CancellationToken,
    tasks: JoinSet<()>,
}

impl Communicator {
    /// Start forwarding between `parent` and `child`.
    ///
    /// Takes the child's log stream; call this before `child.run`.
    pub fn communicate(parent: &AgentConn, child: &mut ClientConn) -> Self {
        let exit = CancellationToken::new();
        let parent_shutdown = parent.shutdown_token();
        let mut tasks = JoinSet::new();

        match child.take_logs() {
            Some(child_logs) => {
                tasks.spawn(drain_logs(
                    child_logs,
                    parent.logs(),
                    parent_shutdown.clone(),
                    exit.clone(),
                ));
            }
            None => debug!("child log stream already taken"),
        }

        tasks.spawn(forward_signals(
            parent.signals(),
            child.signals(),
            child.closed_token(),
            parent_shutdown,
            exit.clone(),
        ));

        Self { exit, tasks }
    }

    /// Stop forwarding without waiting.
    pub fn cancel(&self) {
        self.exit.cancel();
    }

    /// Stop forwarding and wait for both loops to finish. Log lines the
    /// child already delivered are still passed on.
    pub async fn wait(mut self) {
        self.exit.cancel();
        while let Some(result) = self.tasks.join_next().await {
            if let Err(e) = result {
                warn!(error = %e, "communicator task failed");
            }
        }
    }
}

async fn drain_logs(
    mut child_logs: LogStream,
    parent_logs: mpsc::Sender<String>,
    parent_shutdown: CancellationToken,
    exit: CancellationToken,
) {
    loop {
        tokio::select! {
            biased;
            line = child_logs.recv() => match line {
                Some(line) => {
                    if parent_logs.send(line).await.is_err() {
                        break;
                    }
                }
                None => break,
            },
            () = parent_shutdown.cancelled() => break,
            () = exit.cancelled() => {
                while let Ok(line) = child_logs.try_recv() {
                    if parent_logs.send(line).await.is_err() {
                        break;
                    }
                }
                break;
            }
        }
    }
}

async fn forward_signals(
    parent_signals: SignalQueue,
    child_signals: mpsc::UnboundedSender<Signal>,
    child_closed: CancellationToken,
    parent_shutdown: CancellationToken,
    exit: CancellationToken,
) {
    let mut signals = tokio::select! {
        biased;
        () = exit.cancelled() => return,
        signals = parent_signals.lock() => signals,
    };

    loop {
        let signal = tokio::select! {
            biased;
            () = exit.cancelled() => break,
            () = child_closed.cancelled() => break,
            () = parent_shutdown.cancelled() => break,
            signal = signals.recv() => match signal {
                Some(signal) => signal,
                None => break,
            },
        };
        debug!(signal = %signal, "Forwarding signal to child");
        if child_signals.send(signal).is_err() {
            break;
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::config::ConnConfig;
    use crate::transport::{Completion, JsonCodec, Mux, Request};

    /// Parent connection plus the parent's client end.
    fn parent() -> (AgentConn, Mux, mpsc::UnboundedReceiver<String>) {
        let (agent_io, client_io) = tokio::io::duplex(64 * 1024);
        let conn = AgentConn::new(
            Box::new(agent_io),
            Arc::new(JsonCodec),
            &ConnConfig::default(),
            &CancellationToken::new(),
        );
        let mut builder = Mux::builder(Box::new(client_io), Arc::new(JsonCodec));
        let logs = builder.receive::<String>();
        (conn, builder.start(), logs)
    }

    /// Child connection plus a fake agent at the other end.
    fn child() -> (
        ClientConn,
        Mux,
        mpsc::UnboundedReceiver<Request>,
        mpsc::UnboundedReceiver<Signal>,
    ) {
        let (client_io, agent_io) = tokio::io::duplex(64 * 1024);
        let conn = ClientConn::new(
            Box::new(client_io),
            Arc::new(JsonCodec),
            &ConnConfig::default(),
        );
        let mut builder = Mux::builder(Box::new(agent_io), Arc::new(JsonCodec));
        let requests = builder.receive::<Request>();
        let signals = builder.receive::<Signal>();
        (conn, builder.start(), requests, signals)
    }

    #[tokio::test]
    async fn bridges_logs_and_signals() {
        let (parent, parent_client, mut parent_logs) = parent();
        let (mut child, child_agent, mut requests, mut child_signals) = child();

        let comm = Communicator::communicate(&parent, &mut child);
        let run = tokio::spawn(child.run(Request::new("build", "")));
        requests.recv().await.unwrap();

        parent_client.send(Signal::INTERRUPT).await.unwrap();
        assert_eq!(child_signals.recv().await, Some(Signal::INTERRUPT));

        child_agent.send("step 1".to_string()).await.unwrap();
        child_agent.send("step 2".to_string()).await.unwrap();
        child_agent
            .send(Completion { error: None })
            .await
            .unwrap();

        run.await.unwrap().unwrap();
        comm.wait().await;

        assert_eq!(parent_logs.recv().await.as_deref(), Some("step 1"));
        assert_eq!(parent_logs.recv().await.as_deref(), Some("step 2"));
    }

    #[tokio::test]
    async fn wait_returns_when_nothing_happens() {
        let (parent, _parent_client, _parent_logs) = parent();
        let (mut child, _child_agent, _requests, _signals) = child();

        let comm = Communicator::communicate(&parent, &mut child);
        comm.cancel();
        comm.wait().await;
    }
}
