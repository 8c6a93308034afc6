//! Finding agents.
//!
//! Agents announce the job types they serve through a [`Registrator`];
//! clients find a connection for a job type through a [`Resolver`]. Only
//! the in-process directory ships here; other backends plug in through the
//! same two traits.

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};

use async_trait::async_trait;
use tracing::{debug, info, warn};

use crate::client::{Client, ClientConn};
use crate::error::{Error, Result};
use crate::registry::Registry;

/// Announces an agent's job types while it listens.
#[async_trait]
pub trait Registrator: Send + Sync {
    /// Announce every type in `registry`, reachable on `port`.
    async fn register(&self, port: u16, registry: &Registry) -> Result<()>;

    /// Withdraw what `register` announced.
    async fn deregister(&self) -> Result<()>;
}

#[async_trait]
impl<T: Registrator + ?Sized> Registrator for Arc<T> {
    async fn register(&self, port: u16, registry: &Registry) -> Result<()> {
        (**self).register(port, registry).await
    }

    async fn deregister(&self) -> Result<()> {
        (**self).deregister().await
    }
}

/// What a client is looking for.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResolveRequest {
    /// A specific agent, or any agent when `None`.
    pub agent: Option<String>,
    pub job_type: String,
}

impl ResolveRequest {
    pub fn new(job_type: impl Into<String>) -> Self {
        Self {
            agent: None,
            job_type: job_type.into(),
        }
    }

    #[must_use]
    pub fn on_agent(mut self, agent: impl Into<String>) -> Self {
        self.agent = Some(agent.into());
        self
    }

    /// The "no agents" error for this request.
    pub fn no_agents(&self) -> Error {
        match &self.agent {
            Some(agent) => Error::no_agents_with_name(&self.job_type, agent),
            None => Error::no_agents(&self.job_type),
        }
    }
}

/// Finds and dials an agent for a request.
#[async_trait]
pub trait Resolver: Send + Sync {
    async fn resolve(&self, request: &ResolveRequest) -> Result<ClientConn>;
}

/// Registrator that announces nothing.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopRegistrator;

#[async_trait]
impl Registrator for NoopRegistrator {
    async fn register(&self, _port: u16, _registry: &Registry) -> Result<()> {
        Ok(())
    }

    async fn deregister(&self) -> Result<()> {
        Ok(())
    }
}

/// Job type to address map shared by agents and clients in one process.
///
/// Registering maps every job type to `host:port`; the most recent
/// registration for a type wins. Agent names are not tracked.
#[derive(Debug)]
pub struct InMemoryDirectory {
    host: String,
    jobs: RwLock<HashMap<String, String>>,
}

impl Default for InMemoryDirectory {
    fn default() -> Self {
        Self::with_host("127.0.0.1")
    }
}

impl InMemoryDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Directory that records addresses on `host`.
    pub fn with_host(host: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            jobs: RwLock::new(HashMap::new()),
        }
    }

    /// Address registered for `job_type`.
    pub fn address(&self, job_type: &str) -> Option<String> {
        self.jobs
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(job_type)
            .cloned()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .is_empty()
    }
}

#[async_trait]
impl Registrator for InMemoryDirectory {
    async fn register(&self, port: u16, registry: &Registry) -> Result<()> {
        let addr = format!("{}:{port}", self.host);
        let mut jobs = self.jobs.write().unwrap_or_else(PoisonError::into_inner);
        for job_type in registry.types() {
            debug!(job_type = %job_type, addr = %addr, "Registered");
            jobs.insert(job_type, addr.clone());
        }
        Ok(())
    }

    async fn deregister(&self) -> Result<()> {
        self.jobs
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
        Ok(())
    }
}

/// Resolves requests against an [`InMemoryDirectory`].
#[derive(Clone)]
pub struct InMemoryResolver {
    client: Client,
    directory: Arc<InMemoryDirectory>,
}

impl InMemoryResolver {
    pub fn new(client: Client, directory: Arc<InMemoryDirectory>) -> Self {
        Self { client, directory }
    }
}

#[async_trait]
impl Resolver for InMemoryResolver {
    async fn resolve(&self, request: &ResolveRequest) -> Result<ClientConn> {
        let addr = self
            .directory
            .address(&request.job_type)
            .ok_or_else(|| request.no_agents())?;
        self.client.dial(&addr).await
    }
}

/// Tries resolvers in order; the first success wins.
#[derive(Default)]
pub struct MultiResolver {
    resolvers: Vec<Box<dyn Resolver>>,
}

impl MultiResolver {
    pub fn new(resolvers: Vec<Box<dyn Resolver>>) -> Self {
        Self { resolvers }
    }

    pub fn push(&mut self, resolver: impl Resolver + 'static) {
        self.resolvers.push(Box::new(resolver));
    }
}

#[async_trait]
impl Resolver for MultiResolver {
    /// Fails with the last resolver's error, or "no agents" when there are
    /// no resolvers.
    async fn resolve(&self, request: &ResolveRequest) -> Result<ClientConn> {
        let mut last = None;
        for resolver in &self.resolvers {
            match resolver.resolve(request).await {
                Ok(conn) => return Ok(conn),
                Err(e) => {
                    debug!(job_type = %request.job_type, error = %e, "Resolver failed");
                    last = Some(e);
                }
            }
        }
        Err(last.unwrap_or_else(|| request.no_agents()))
    }
}

/// Registers with every registrator.
#[derive(Default)]
pub struct MultiRegistrator {
    registrators: Vec<Box<dyn Registrator>>,
}

impl MultiRegistrator {
    pub fn new(registrators: Vec<Box<dyn Registrator>>) -> Self {
        Self { registrators }
    }

    pub fn push(&mut self, registrator: impl Registrator + 'static) {
        self.registrators.push(Box::new(registrator));
    }
}

#[async_trait]
impl Registrator for MultiRegistrator {
    async fn register(&self, port: u16, registry: &Registry) -> Result<()> {
        let mut failures = Vec::new();
        for registrator in &self.registrators {
            if let Err(e) = registrator.register(port, registry).await {
                warn!(error = %e, "Registrator failed");
                failures.push(e.to_string());
            }
        }
        if failures.is_empty() {
            info!(port, count = self.registrators.len(), "Registered");
            Ok(())
        } else {
            Err(Error::Registration(failures.join("; ")))
        }
    }

    async fn deregister(&self) -> Result<()> {
        let mut failures = Vec::new();
        for registrator in &self.registrators {
            if let Err(e) = registrator.deregister().await {
                warn!(error = %e, "Deregistration failed");
                failures.push(e.to_string());
            }
        }
        if failures.is_empty() {
            Ok(())
        } else {
            Err(Error::Registration(failures.join("; ")))
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;

    use super::*;
    use crate::agent::AgentConn;
    use crate::job::Job;

    #[derive(Clone)]
    struct Nothing(&'static str);

    #[async_trait]
    impl Job for Nothing {
        fn job_type(&self) -> &str {
            self.0
        }

        fn configure(&mut self, _data: &[u8]) -> anyhow::Result<()> {
            Ok(())
        }

        async fn run(&self, _conn: &AgentConn) -> anyhow::Result<()> {
            Ok(())
        }
    }

    struct Failing(&'static str);

    #[async_trait]
    impl Resolver for Failing {
        async fn resolve(&self, _request: &ResolveRequest) -> Result<ClientConn> {
            Err(Error::Config(self.0.to_string()))
        }
    }

    #[async_trait]
    impl Registrator for Failing {
        async fn register(&self, _port: u16, _registry: &Registry) -> Result<()> {
            Err(Error::Config(self.0.to_string()))
        }

        async fn deregister(&self) -> Result<()> {
            Ok(())
        }
    }

    #[derive(Default)]
    struct Counting(AtomicUsize);

    #[async_trait]
    impl Registrator for Counting {
        async fn register(&self, _port: u16, _registry: &Registry) -> Result<()> {
            self.0.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn deregister(&self) -> Result<()> {
            Ok(())
        }
    }

    fn registry() -> Registry {
        let registry = Registry::new();
        registry.add(Nothing("build"));
        registry.add(Nothing("deploy"));
        registry
    }

    #[tokio::test]
    async fn in_memory_register_and_deregister() {
        let directory = InMemoryDirectory::new();
        directory.register(8814, &registry()).await.unwrap();

        assert_eq!(directory.address("build").as_deref(), Some("127.0.0.1:8814"));
        assert_eq!(directory.address("deploy").as_deref(), Some("127.0.0.1:8814"));
        assert!(directory.address("test").is_none());

        directory.deregister().await.unwrap();
        assert!(directory.is_empty());
    }

    #[tokio::test]
    async fn in_memory_missing_type_is_no_agents() {
        let resolver = InMemoryResolver::new(Client::default(), Arc::new(InMemoryDirectory::new()));

        let err = resolver
            .resolve(&ResolveRequest::new("test"))
            .await
            .err()
            .unwrap();
        assert!(err.is_no_agents());
        assert_eq!(err.to_string(), "no agents responded with type test");

        let err = resolver
            .resolve(&ResolveRequest::new("test").on_agent("twice"))
            .await
            .err()
            .unwrap();
        assert_eq!(
            err.to_string(),
            "no agents responded with type test and name twice"
        );
    }

    #[tokio::test]
    async fn empty_multi_resolver_is_no_agents() {
        let err = MultiResolver::default()
            .resolve(&ResolveRequest::new("test"))
            .await
            .err()
            .unwrap();
        assert!(err.is_no_agents());
    }

    #[tokio::test]
    async fn multi_resolver_returns_last_error() {
        let mut resolver = MultiResolver::default();
        resolver.push(Failing("first"));
        resolver.push(Failing("second"));

        let err = resolver
            .resolve(&ResolveRequest::new("test"))
            .await
            .err()
            .unwrap();
        assert_eq!(err.to_string(), "configuration error: second");
    }

    #[tokio::test]
    async fn multi_resolver_first_success_wins() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let directory = Arc::new(InMemoryDirectory::new());
        directory.register(port, &registry()).await.unwrap();

        let mut resolver = MultiResolver::default();
        resolver.push(Failing("unreachable"));
        resolver.push(InMemoryResolver::new(Client::default(), Arc::clone(&directory)));

        let conn = resolver.resolve(&ResolveRequest::new("build")).await;
        assert!(conn.is_ok());
    }

    #[tokio::test]
    async fn multi_registrator_registers_everywhere() {
        let counting = Arc::new(Counting::default());
        let mut registrator = MultiRegistrator::default();
        registrator.push(Arc::clone(&counting));
        registrator.push(Failing("down"));
        registrator.push(Arc::clone(&counting));

        let err = registrator.register(1, &registry()).await.unwrap_err();
        assert_eq!(
            err.to_string(),
            "registration failed: configuration error: down"
        );
        assert_eq!(counting.0.load(Ordering::SeqCst), 2);
        registrator.deregister().await.unwrap();
    }
}
