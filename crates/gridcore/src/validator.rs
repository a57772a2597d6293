//! Detection and removal of broken workers.
use std::cell::RefCell;
use std::rc::Rc;
use std::time::{Duration, Instant};

use crate::ScaleResult;
use crate::backend::{BackendFuture, InstanceProvider, QueueBackend, RunStatus, run_id_from_host};
use crate::common::Map;
use crate::common::timeutils::now_monotonic;
use crate::host::SharedHostStorage;
use crate::job::Job;
use crate::scale::ScaleDownHandler;

pub trait WorkerValidator {
    /// Returns the subset of `hosts` that are not valid cluster members, in the order of `hosts`.
    fn validate<'a>(&'a self, hosts: &'a [String]) -> BackendFuture<'a, Vec<String>>;
}

/// Asks the queue whether it still considers the hosts healthy.
pub struct QueueWorkerValidator {
    queue: Rc<dyn QueueBackend>,
}

impl QueueWorkerValidator {
    pub fn new(queue: Rc<dyn QueueBackend>) -> Self {
        Self { queue }
    }
}

impl WorkerValidator for QueueWorkerValidator {
    fn validate<'a>(&'a self, hosts: &'a [String]) -> BackendFuture<'a, Vec<String>> {
        Box::pin(async move {
            let mut invalid = Vec::new();
            for host in hosts {
                if !self.queue.is_valid_host(host).await? {
                    log::debug!("Host {host} is not valid according to the queue");
                    invalid.push(host.clone());
                }
            }
            Ok(invalid)
        })
    }
}

/// Checks that the runs of the hosts are still running.
pub struct RunStatusWorkerValidator {
    provider: Rc<dyn InstanceProvider>,
}

impl RunStatusWorkerValidator {
    pub fn new(provider: Rc<dyn InstanceProvider>) -> Self {
        Self { provider }
    }
}

impl WorkerValidator for RunStatusWorkerValidator {
    fn validate<'a>(&'a self, hosts: &'a [String]) -> BackendFuture<'a, Vec<String>> {
        Box::pin(async move {
            let mut invalid = Vec::new();
            for host in hosts {
                let Some(run_id) = run_id_from_host(host) else {
                    log::warn!("Cannot determine the run of host {host}, skipping its validation");
                    continue;
                };
                match self.provider.load_run(run_id).await {
                    Ok(run) if run.status != RunStatus::Running => {
                        log::debug!("Run {run_id} of host {host} has status {:?}", run.status);
                        invalid.push(host.clone());
                    }
                    Ok(_) => {}
                    Err(error) => {
                        log::warn!("Cannot load run {run_id} of host {host}: {error:?}");
                    }
                }
            }
            Ok(invalid)
        })
    }
}

/// A host is invalid if any of the validators considers it invalid.
pub struct CompositeWorkerValidator {
    validators: Vec<Box<dyn WorkerValidator>>,
}

impl CompositeWorkerValidator {
    pub fn new(validators: Vec<Box<dyn WorkerValidator>>) -> Self {
        Self { validators }
    }
}

impl WorkerValidator for CompositeWorkerValidator {
    fn validate<'a>(&'a self, hosts: &'a [String]) -> BackendFuture<'a, Vec<String>> {
        Box::pin(async move {
            let mut invalid: Vec<String> = Vec::new();
            for validator in &self.validators {
                let remaining: Vec<String> = hosts
                    .iter()
                    .filter(|host| !invalid.contains(*host))
                    .cloned()
                    .collect();
                if remaining.is_empty() {
                    break;
                }
                invalid.extend(validator.validate(&remaining).await?);
            }
            invalid.sort_by_key(|host| hosts.iter().position(|h| h == host));
            Ok(invalid)
        })
    }
}

/// Reports a host only after it has been failing validation continuously for longer than
/// `grace_period`. A single successful validation forgives all previous failures.
pub struct GracePeriodWorkerValidator {
    inner: Box<dyn WorkerValidator>,
    grace_period: Duration,
    failing_since: RefCell<Map<String, Instant>>,
}

impl GracePeriodWorkerValidator {
    pub fn new(inner: Box<dyn WorkerValidator>, grace_period: Duration) -> Self {
        Self {
            inner,
            grace_period,
            failing_since: Default::default(),
        }
    }
}

impl WorkerValidator for GracePeriodWorkerValidator {
    fn validate<'a>(&'a self, hosts: &'a [String]) -> BackendFuture<'a, Vec<String>> {
        Box::pin(async move {
            let failing = self.inner.validate(hosts).await?;
            let now = now_monotonic();
            let mut failing_since = self.failing_since.borrow_mut();
            failing_since.retain(|host, _| failing.contains(host));

            let mut invalid = Vec::new();
            for host in failing {
                let since = *failing_since.entry(host.clone()).or_insert(now);
                let duration = now.saturating_duration_since(since);
                if duration > self.grace_period {
                    log::warn!(
                        "Host {host} has been failing validation for {}s",
                        duration.as_secs()
                    );
                    invalid.push(host);
                } else {
                    log::info!(
                        "Host {host} is failing validation for {}s, waiting for grace period of {}s",
                        duration.as_secs(),
                        self.grace_period.as_secs()
                    );
                }
            }
            Ok(invalid)
        })
    }
}

/// Removes tracked workers that fail validation.
pub struct WorkerValidatorHandler {
    queue: Rc<dyn QueueBackend>,
    validator: Box<dyn WorkerValidator>,
    storage: SharedHostStorage,
    scale_down: Rc<ScaleDownHandler>,
}

impl WorkerValidatorHandler {
    pub fn new(
        queue: Rc<dyn QueueBackend>,
        validator: Box<dyn WorkerValidator>,
        storage: SharedHostStorage,
        scale_down: Rc<ScaleDownHandler>,
    ) -> Self {
        Self {
            queue,
            validator,
            storage,
            scale_down,
        }
    }

    /// Validates all stored hosts. Jobs of invalid hosts are killed and the hosts are torn down.
    /// Returns the hosts that were removed.
    pub async fn validate_hosts(&self) -> ScaleResult<Vec<String>> {
        let hosts = self.storage.load_hosts()?;
        if hosts.is_empty() {
            return Ok(vec![]);
        }
        let invalid = self.validator.validate(&hosts).await?;
        if invalid.is_empty() {
            log::debug!("All {} worker(s) are valid", hosts.len());
            return Ok(vec![]);
        }

        let jobs = self.queue.list_jobs().await?;
        let mut removed = Vec::new();
        for host in invalid {
            log::warn!("Worker {host} is invalid, removing it");
            let host_jobs: Vec<Job> = jobs.iter().filter(|job| job.runs_on(&host)).cloned().collect();
            if !host_jobs.is_empty() {
                log::warn!("Killing {} job(s) of invalid worker {host}", host_jobs.len());
                if let Err(error) = self.queue.kill_jobs(&host_jobs, true).await {
                    log::error!("Cannot kill jobs of invalid worker {host}: {error:?}");
                }
            }
            match self.scale_down.forget(&host).await {
                Ok(()) => removed.push(host),
                Err(error) => log::error!("Cannot remove invalid worker {host}: {error:?}"),
            }
        }
        Ok(removed)
    }
}
