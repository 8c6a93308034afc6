//! Built-in jobs.
//!
//! - `shell`: `{"command": "..."}` runs a command through the agent's
//!   runner, streaming its output and relaying the client's signals.
//! - `forward`: `{"address": "...", "request": {"type": "...", "data": [bytes]}}`
//!   hands a request to another agent and relays its logs and signals.

use anyhow::Context;
use async_trait::async_trait;
use serde::Deserialize;
use tracing::info;

use crate::agent::AgentConn;
use crate::client::Client;
use crate::communicator::Communicator;
use crate::job::{Job, Step, StepsJob};
use crate::state::StateBag;
use crate::transport::Request;

/// Runs one shell command.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ShellJob {
    #[serde(default)]
    command: String,
}

impl ShellJob {
    pub const TYPE: &'static str = "shell";

    /// Request running `command` on an agent.
    pub fn request(command: &str) -> Request {
        Request::new(
            Self::TYPE,
            serde_json::json!({ "command": command }).to_string(),
        )
    }
}

impl StepsJob for ShellJob {
    fn job_type(&self) -> &str {
        Self::TYPE
    }

    fn configure(&mut self, data: &[u8]) -> anyhow::Result<()> {
        *self = serde_json::from_slice(data).context("invalid shell job data")?;
        anyhow::ensure!(!self.command.trim().is_empty(), "command is required");
        Ok(())
    }

    fn steps(&self) -> Vec<Box<dyn Step>> {
        vec![Box::new(RunCommand {
            command: self.command.clone(),
        })]
    }
}

struct RunCommand {
    command: String,
}

#[async_trait]
impl Step for RunCommand {
    async fn run(&self, state: &mut StateBag<'_>) -> anyhow::Result<()> {
        let runner = state.runner();
        let logs = state.logs();
        let signals = state.conn().signals();
        let mut signals = signals.lock().await;

        runner.run(&self.command, &logs, &mut signals).await?;
        Ok(())
    }
}

/// Where to forward and what. The inner request keeps its data as raw
/// bytes so any payload survives the trip.
#[derive(Debug, Clone, Deserialize)]
struct ForwardTarget {
    address: String,
    request: Request,
}

/// Delegates a request to another agent.
#[derive(Clone, Default)]
pub struct ForwardJob {
    client: Client,
    target: Option<ForwardTarget>,
}

impl ForwardJob {
    pub const TYPE: &'static str = "forward";

    /// Forwarding job that dials with `client`.
    pub fn new(client: Client) -> Self {
        Self {
            client,
            target: None,
        }
    }

    /// Request forwarding `request` to the agent at `address`.
    pub fn request(address: &str, request: &Request) -> Request {
        let body = serde_json::json!({ "address": address, "request": request });
        Request::new(Self::TYPE, body.to_string())
    }
}

#[async_trait]
impl Job for ForwardJob {
    fn job_type(&self) -> &str {
        Self::TYPE
    }

    fn configure(&mut self, data: &[u8]) -> anyhow::Result<()> {
        let target: ForwardTarget =
            serde_json::from_slice(data).context("invalid forward job data")?;
        anyhow::ensure!(!target.address.is_empty(), "address is required");
        self.target = Some(target);
        Ok(())
    }

    async fn run(&self, conn: &AgentConn) -> anyhow::Result<()> {
        let target = self
            .target
            .as_ref()
            .context("forward job is not configured")?;
        let request = target.request.clone();

        let mut child = self
            .client
            .dial(&target.address)
            .await
            .with_context(|| format!("could not reach agent at {}", target.address))?;
        info!(job_type = %request.job_type, address = %target.address, "Forwarding job");
        conn.log(format!(
            "Forwarding {} to {}",
            request.job_type, target.address
        ))
        .await;

        let communicator = Communicator::communicate(conn, &mut child);
        let result = child.run(request).await;
        communicator.wait().await;

        Ok(result?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::Registry;

    #[test]
    fn shell_requires_a_command() {
        let mut job = ShellJob::default();
        assert!(job.configure(br#"{"command": "  "}"#).is_err());
        assert!(job.configure(b"not json").is_err());
        job.configure(br#"{"command": "echo hi"}"#).unwrap();
        assert_eq!(job.steps().len(), 1);
    }

    #[test]
    fn shell_request_round_trips_through_registry() {
        let registry = Registry::new();
        registry.add_steps(ShellJob::default());

        let job = registry.get(&ShellJob::request("echo hi")).unwrap();
        assert_eq!(job.job_type(), "shell");
    }

    #[test]
    fn forward_request_keeps_inner_data() {
        let inner = ShellJob::request("echo hi");
        let outer = ForwardJob::request("127.0.0.1:8814", &inner);

        let mut job = ForwardJob::default();
        job.configure(&outer.data).unwrap();
        let target = job.target.as_ref().unwrap();
        assert_eq!(target.address, "127.0.0.1:8814");
        assert_eq!(target.request, inner);
    }

    #[test]
    fn forward_request_keeps_binary_data() {
        let inner = Request::new("blob", vec![255, 0, 127]);
        let outer = ForwardJob::request("127.0.0.1:8814", &inner);

        let mut job = ForwardJob::default();
        job.configure(&outer.data).unwrap();
        let target = job.target.as_ref().unwrap();
        assert_eq!(target.request.data, [255, 0, 127]);
        assert_eq!(target.request, inner);
    }

    #[test]
    fn forward_requires_an_address() {
        let mut job = ForwardJob::default();
        let err = job
            .configure(br#"{"address": "", "request": {"type": "shell"}}"#)
            .unwrap_err();
        assert_eq!(err.to_string(), "address is required");
    }
}
