//! Job registry: job type name to a fresh, configured job instance.

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};

use tracing::debug;

use crate::error::{Error, Result};
use crate::job::{Job, StepsAdapter, StepsJob};
use crate::transport::Request;

type Factory = Arc<dyn Fn() -> Box<dyn Job> + Send + Sync>;

/// Maps job types to factories. Safe to share between connections.
#[derive(Default)]
pub struct Registry {
    jobs: RwLock<HashMap<String, Factory>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `template` under its job type. Every request gets its own
    /// clone. A later registration for the same type replaces this one.
    pub fn add<J: Job + Clone + 'static>(&self, template: J) {
        let job_type = template.job_type().to_string();
        self.add_factory(job_type, move || Box::new(template.clone()) as Box<dyn Job>);
    }

    /// Register a step-based job, wrapped in a [`StepsAdapter`].
    pub fn add_steps<J: StepsJob + Clone + 'static>(&self, template: J) {
        self.add(StepsAdapter::new(template));
    }

    /// Register a factory for jobs that cannot be cloned.
    pub fn add_factory<F>(&self, job_type: impl Into<String>, factory: F)
    where
        F: Fn() -> Box<dyn Job> + Send + Sync + 'static,
    {
        let job_type = job_type.into();
        debug!(job_type = %job_type, "Registering job");
        self.jobs
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(job_type, Arc::new(factory));
    }

    /// A fresh job for `request`, configured with the request's data.
    pub fn get(&self, request: &Request) -> Result<Box<dyn Job>> {
        let factory = self
            .jobs
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&request.job_type)
            .cloned()
            .ok_or_else(|| Error::JobNotFound(request.job_type.clone()))?;

        let mut job = factory();
        job.configure(&request.data)?;
        Ok(job)
    }

    /// Registered job types, sorted.
    pub fn types(&self) -> Vec<String> {
        let mut types: Vec<String> = self
            .jobs
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect();
        types.sort();
        types
    }

    pub fn len(&self) -> usize {
        self.jobs.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
