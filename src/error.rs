//! Error types shared by the transport, connections and jobs.
//!
//! Job and step code returns `anyhow::Result`; those errors enter this enum
//! through the transparent [`Error::Job`] variant so their message reaches
//! the client unchanged.

use std::io;

use thiserror::Error;

/// Result alias used throughout the crate.
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Errors produced by jobwire.
#[derive(Debug, Error)]
pub enum Error {
    /// The listen or dial address could not be resolved.
    #[error("invalid address: {0}")]
    InvalidAddr(String),

    /// Binding the listening socket failed.
    #[error("unable to listen on {addr}: {source}")]
    Listen {
        /// Address we tried to bind.
        addr: String,
        /// Underlying socket error.
        #[source]
        source: io::Error,
    },

    /// Transport-level I/O failure.
    #[error("connection error: {0}")]
    Io(#[from] io::Error),

    /// TLS configuration or handshake failure.
    #[error("TLS error: {0}")]
    Tls(String),

    /// A bounded operation did not complete in time.
    #[error("operation timed out: {0}")]
    Timeout(&'static str),

    /// A frame could not be encoded or decoded.
    #[error("codec error: {0}")]
    Codec(String),

    /// A frame exceeded the configured maximum size.
    #[error("frame exceeds max size: {size} > {max}")]
    FrameTooLarge {
        /// Size of the offending frame.
        size: usize,
        /// Configured limit.
        max: usize,
    },

    /// The connection shut down before a request arrived.
    #[error("connection shutdown")]
    ConnectionShutdown,

    /// The peer went away before reporting completion.
    #[error("connection closed before the job completed")]
    ConnectionClosed,

    /// No job is registered for the requested type.
    #[error("job not found: {0}")]
    JobNotFound(String),

    /// A job, step or configure call failed.
    #[error(transparent)]
    Job(#[from] anyhow::Error),

    /// The job panicked.
    #[error("job exited with unexpected error")]
    UnexpectedError,

    /// A subprocess exited with a non-zero status.
    #[error("run failed with exit code: {code}")]
    ExitStatus {
        /// Exit status reported by the process (1 when unknown).
        code: i32,
    },

    /// Error reported by the remote agent, verbatim.
    #[error("{0}")]
    Remote(String),

    /// No directory entry could serve the request.
    #[error("no agents responded with type {job_type}{}", agent_suffix(.agent))]
    NoAgents {
        /// Job type that failed to resolve.
        job_type: String,
        /// Specific agent name, if one was requested.
        agent: Option<String>,
    },

    /// One or more directory registrations failed.
    #[error("registration failed: {0}")]
    Registration(String),

    /// A step tried to write a key the executor owns.
    #[error("state key '{0}' is reserved")]
    ReservedKey(String),

    /// Invalid configuration.
    #[error("configuration error: {0}")]
    Config(String),
}

fn agent_suffix(agent: &Option<String>) -> String {
    agent
        .as_ref()
        .map(|name| format!(" and name {name}"))
        .unwrap_or_default()
}

impl Error {
    /// Build a `NoAgents` error for a job type.
    pub fn no_agents(job_type: impl Into<String>) -> Self {
        Self::NoAgents {
            job_type: job_type.into(),
            agent: None,
        }
    }

    /// Build a `NoAgents` error for a job type on a named agent.
    pub fn no_agents_with_name(job_type: impl Into<String>, agent: impl Into<String>) -> Self {
        Self::NoAgents {
            job_type: job_type.into(),
            agent: Some(agent.into()),
        }
    }

    /// Whether this is the "no agents responded" condition.
    pub const fn is_no_agents(&self) -> bool {
        matches!(self, Self::NoAgents { .. })
    }

    /// Whether this error means the peer disconnected, as opposed to a
    /// real failure. Used by the accept loop to keep shutdown races quiet.
    pub fn is_disconnect(&self) -> bool {
        match self {
            Self::Io(e) => is_disconnect_kind(e.kind()),
            Self::ConnectionClosed | Self::ConnectionShutdown => true,
            _ => false,
        }
    }
}

/// I/O error kinds that mean "the other side went away".
pub(crate) const fn is_disconnect_kind(kind: io::ErrorKind) -> bool {
    matches!(
        kind,
        io::ErrorKind::UnexpectedEof
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::BrokenPipe
            | io::ErrorKind::NotConnected
    )
}
