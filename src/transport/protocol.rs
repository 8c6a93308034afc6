//! Wire message types.
//!
//! Every frame carries exactly one [`Frame`] value, tagged by `kind`.
//! Framing is: [4-byte BE length][codec payload]

use std::fmt;

use serde::{Deserialize, Serialize};

/// Logical sub-channels multiplexed over one connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageType {
    /// The single job request (client → agent).
    Request,
    /// One line of job output (agent → client).
    Log,
    /// A process-control signal (client → agent).
    Signal,
    /// Job completion (agent → client).
    Done,
}

/// A job request: the job type plus opaque job-specific data.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Request {
    /// Selects the job on the agent.
    #[serde(rename = "type")]
    pub job_type: String,
    /// Job configuration, opaque to the transport.
    #[serde(default)]
    pub data: Vec<u8>,
}

impl Request {
    /// Build a request from a job type and raw data.
    pub fn new(job_type: impl Into<String>, data: impl Into<Vec<u8>>) -> Self {
        Self {
            job_type: job_type.into(),
            data: data.into(),
        }
    }

    /// Build a request from a value that knows its own job type, encoding
    /// the value itself as JSON data.
    pub fn from_routable<R: Routable + Serialize>(routable: &R) -> serde_json::Result<Self> {
        Ok(Self {
            job_type: routable.job_type().to_string(),
            data: serde_json::to_vec(routable)?,
        })
    }
}

/// Something that can be routed to a job by type name.
pub trait Routable {
    /// Job type this value is addressed to.
    fn job_type(&self) -> &str;
}

/// An OS process-control signal, carried as its raw number.
///
/// The transport does not interpret signals; the process runner maps them
/// onto the platform's delivery mechanism.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Signal(pub i32);

impl Signal {
    /// `SIGHUP`: the controlling terminal went away.
    pub const HANGUP: Self = Self(1);
    /// `SIGINT`: interrupt, as from Ctrl-C.
    pub const INTERRUPT: Self = Self(2);
    /// `SIGQUIT`: quit and dump core.
    pub const QUIT: Self = Self(3);
    /// `SIGKILL`: cannot be caught or ignored.
    pub const KILL: Self = Self(9);
    /// `SIGTERM`: polite request to terminate.
    pub const TERMINATE: Self = Self(15);

    /// Raw signal number.
    pub const fn number(self) -> i32 {
        self.0
    }
}

impl fmt::Display for Signal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            Self::HANGUP => f.write_str("SIGHUP"),
            Self::INTERRUPT => f.write_str("SIGINT"),
            Self::QUIT => f.write_str("SIGQUIT"),
            Self::KILL => f.write_str("SIGKILL"),
            Self::TERMINATE => f.write_str("SIGTERM"),
            Self(n) => write!(f, "signal {n}"),
        }
    }
}

/// Completion report sent by the agent once the job has finished.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Completion {
    /// Error message, `None` on success.
    pub error: Option<String>,
}

/// One decoded frame.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Frame {
    Request(Request),
    Log { line: String },
    Signal { signal: Signal },
    Done(Completion),
}

impl Frame {
    /// Sub-channel this frame belongs to.
    pub const fn message_type(&self) -> MessageType {
        match self {
            Self::Request(_) => MessageType::Request,
            Self::Log { .. } => MessageType::Log,
            Self::Signal { .. } => MessageType::Signal,
            Self::Done(_) => MessageType::Done,
        }
    }
}

/// A value that travels on exactly one sub-channel.
pub trait Message: Sized + Send + 'static {
    /// Sub-channel for this value.
    const TYPE: MessageType;

    /// Wrap the value for sending.
    fn into_frame(self) -> Frame;

    /// Unwrap a frame of this message's type.
    fn from_frame(frame: Frame) -> Option<Self>;
}

impl Message for Request {
    const TYPE: MessageType = MessageType::Request;

    fn into_frame(self) -> Frame {
        Frame::Request(self)
    }

    fn from_frame(frame: Frame) -> Option<Self> {
        match frame {
            Frame::Request(request) => Some(request),
            _ => None,
        }
    }
}

/// Log lines travel as plain strings.
impl Message for String {
    const TYPE: MessageType = MessageType::Log;

    fn into_frame(self) -> Frame {
        Frame::Log { line: self }
    }

    fn from_frame(frame: Frame) -> Option<Self> {
        match frame {
            Frame::Log { line } => Some(line),
            _ => None,
        }
    }
}

impl Message for Signal {
    const TYPE: MessageType = MessageType::Signal;

    fn into_frame(self) -> Frame {
        Frame::Signal { signal: self }
    }

    fn from_frame(frame: Frame) -> Option<Self> {
        match frame {
            Frame::Signal { signal } => Some(signal),
            _ => None,
        }
    }
}

impl Message for Completion {
    const TYPE: MessageType = MessageType::Done;

    fn into_frame(self) -> Frame {
        Frame::Done(self)
    }

    fn from_frame(frame: Frame) -> Option<Self> {
        match frame {
            Frame::Done(completion) => Some(completion),
            _ => None,
        }
    }
}
