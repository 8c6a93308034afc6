//! Per-execution state shared by the steps of one job run.
//!
//! Well-known things live in typed slots: the connection, the recorded
//! error and the process runner. Everything else goes into a string-keyed
//! bag of arbitrary values. The keys `"conn"` and `"error"` belong to the
//! executor and cannot be written through the bag.

use std::any::Any;
use std::collections::BTreeMap;
use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::info;

use crate::agent::AgentConn;
use crate::error::{Error, Result};
use crate::runner::Runner;

/// Keys owned by the executor.
pub const RESERVED_KEYS: [&str; 2] = ["conn", "error"];

/// State for one job execution. Dropped when the job finishes.
pub struct StateBag<'a> {
    conn: &'a AgentConn,
    runner: Arc<dyn Runner>,
    error: Option<anyhow::Error>,
    values: BTreeMap<String, Box<dyn Any + Send + Sync>>,
}

impl<'a> StateBag<'a> {
    pub fn new(conn: &'a AgentConn, runner: Arc<dyn Runner>) -> Self {
        Self {
            conn,
            runner,
            error: None,
            values: BTreeMap::new(),
        }
    }

    /// The connection the job is running on.
    pub const fn conn(&self) -> &'a AgentConn {
        self.conn
    }

    /// Sender for log lines that go to the client.
    pub fn logs(&self) -> mpsc::Sender<String> {
        self.conn.logs()
    }

    pub fn runner(&self) -> Arc<dyn Runner> {
        Arc::clone(&self.runner)
    }

    /// Log a line to the client only.
    pub async fn say(&self, line: impl Into<String>) {
        self.conn.log(line).await;
    }

    /// Log a line to the client and to the agent's own log.
    pub async fn say_both(&self, line: impl Into<String>) {
        let line = line.into();
        info!(peer = ?self.conn.peer_addr(), "{line}");
        self.conn.log(line).await;
    }

    /// Store a value under `key`, replacing any previous value.
    pub fn put<T: Any + Send + Sync>(&mut self, key: impl Into<String>, value: T) -> Result<()> {
        let key = key.into();
        if RESERVED_KEYS.contains(&key.as_str()) {
            return Err(Error::ReservedKey(key));
        }
        self.values.insert(key, Box::new(value));
        Ok(())
    }

    /// Value under `key`, if present and of type `T`.
    pub fn get<T: Any>(&self, key: &str) -> Option<&T> {
        self.values.get(key)?.downcast_ref()
    }

    pub fn get_mut<T: Any>(&mut self, key: &str) -> Option<&mut T> {
        self.values.get_mut(key)?.downcast_mut()
    }

    /// Remove and return the value under `key` if it has type `T`. A value
    /// of another type is left in place.
    pub fn remove<T: Any>(&mut self, key: &str) -> Option<T> {
        if !self.values.get(key)?.is::<T>() {
            return None;
        }
        self.values
            .remove(key)
            .and_then(|value| value.downcast().ok())
            .map(|value| *value)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.values.contains_key(key)
    }

    /// Keys in the bag, in sorted order.
    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.values.keys().map(String::as_str)
    }

    /// Record an error. The executor halts after the current step.
    pub fn set_error(&mut self, error: anyhow::Error) {
        self.error = Some(error);
    }

    pub const fn error(&self) -> Option<&anyhow::Error> {
        self.error.as_ref()
    }

    pub const fn has_error(&self) -> bool {
        self.error.is_some()
    }

    pub(crate) fn take_error(&mut self) -> Option<anyhow::Error> {
        self.error.take()
    }
}
