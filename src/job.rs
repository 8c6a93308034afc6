//! Jobs and the step executor.
//!
//! A [`Job`] is what the registry hands out for a request. Jobs that are
//! naturally a sequence of [`Step`]s implement [`StepsJob`] instead and
//! are wrapped in a [`StepsAdapter`] when registered.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::debug;

use crate::agent::AgentConn;
use crate::runner::{Runner, ShellRunner};
use crate::state::StateBag;

/// A unit of work an agent can run.
///
/// The registry keeps one template per type and clones a fresh instance
/// for every request, so `configure` may mutate freely.
#[async_trait]
pub trait Job: Send + Sync {
    /// Type name requests use to select this job.
    fn job_type(&self) -> &str;

    /// Apply the request's data. Errors are reported to the client as-is.
    fn configure(&mut self, data: &[u8]) -> anyhow::Result<()>;

    /// Run the job on `conn`.
    async fn run(&self, conn: &AgentConn) -> anyhow::Result<()>;
}

/// A job expressed as an ordered list of steps.
pub trait StepsJob: Send + Sync {
    fn job_type(&self) -> &str;

    fn configure(&mut self, data: &[u8]) -> anyhow::Result<()>;

    /// Steps to execute, in order. Called once per run.
    fn steps(&self) -> Vec<Box<dyn Step>>;
}

/// One stage of a [`StepsJob`].
///
/// Steps hold no per-run state of their own; anything later steps need
/// goes into the [`StateBag`].
#[async_trait]
pub trait Step: Send + Sync {
    /// Do the work. Returning an error, or recording one with
    /// [`StateBag::set_error`], halts the job after this step.
    async fn run(&self, state: &mut StateBag<'_>) -> anyhow::Result<()>;

    /// Undo or release whatever `run` set up. Called exactly once for
    /// every step whose `run` was called, in reverse order.
    async fn cleanup(&self, _state: &mut StateBag<'_>) {}
}

/// Runs steps in order with reverse-order cleanup.
pub struct Executor {
    steps: Vec<Box<dyn Step>>,
}

impl Executor {
    pub fn new(steps: Vec<Box<dyn Step>>) -> Self {
        Self { steps }
    }

    /// Run until the steps are exhausted or one records an error, then
    /// clean up the steps that ran. Returns the recorded error, if any.
    pub async fn run(&self, state: &mut StateBag<'_>) -> anyhow::Result<()> {
        let mut ran = 0;
        for (index, step) in self.steps.iter().enumerate() {
            ran = index + 1;
            if let Err(e) = step.run(state).await {
                state.set_error(e);
            }
            if state.has_error() {
                debug!(step = index, "Step failed, halting");
                break;
            }
        }

        for step in self.steps[..ran].iter().rev() {
            step.cleanup(state).await;
        }

        state.take_error().map_or(Ok(()), Err)
    }
}

/// Makes a [`StepsJob`] a [`Job`] by running its steps through an
/// [`Executor`].
#[derive(Clone)]
pub struct StepsAdapter<J> {
    job: J,
    runner: Arc<dyn Runner>,
}

impl<J: StepsJob> StepsAdapter<J> {
    /// Wrap `job`, giving its steps a [`ShellRunner`].
    pub fn new(job: J) -> Self {
        Self::with_runner(job, Arc::new(ShellRunner::new()))
    }

    pub fn with_runner(job: J, runner: Arc<dyn Runner>) -> Self {
        Self { job, runner }
    }

    pub const fn inner(&self) -> &J {
        &self.job
    }
}

#[async_trait]
impl<J: StepsJob> Job for StepsAdapter<J> {
    fn job_type(&self) -> &str {
        self.job.job_type()
    }

    fn configure(&mut self, data: &[u8]) -> anyhow::Result<()> {
        self.job.configure(data)
    }

    async fn run(&self, conn: &AgentConn) -> anyhow::Result<()> {
        let mut state = StateBag::new(conn, Arc::clone(&self.runner));
        Executor::new(self.job.steps()).run(&mut state).await
    }
}
