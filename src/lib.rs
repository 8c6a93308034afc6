//! jobwire
//!
//! Run typed jobs on remote agents over one multiplexed connection:
//! - Listener with a re-armed accept deadline and cooperative shutdown
//! - Multiplexer carrying request, log, signal and completion sub-channels
//! - Agent and client connections, one job per connection
//! - Job registry, step executor and shell process runner
//! - Communicator for jobs that delegate to another agent

pub mod agent;
pub mod client;
pub mod communicator;
pub mod config;
pub mod discovery;
pub mod error;
pub mod job;
pub mod jobs;
pub mod listener;
pub mod registry;
pub mod runner;
pub mod state;
pub mod tls;
pub mod transport;

pub use agent::{Agent, AgentConn};
pub use client::{Client, ClientConn};
pub use error::{Error, Result};
pub use job::{Job, Step, StepsAdapter, StepsJob};
pub use registry::Registry;
pub use state::StateBag;
pub use transport::{Request, Signal};
