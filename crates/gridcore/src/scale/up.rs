use std::fmt::{Display, Formatter};
use std::rc::Rc;

use anyhow::Context;

use crate::ScaleResult;
use crate::backend::{InstanceProvider, LaunchRequest, PriceType, QueueBackend, RunId, RunInfo};
use crate::common::retry::{Poll, PollOutcome, RetryPolicy, poll};
use crate::event::{EventManager, InstanceEvent};
use crate::host::SharedHostStorage;
use crate::hostsfile::ClusterHosts;
use crate::instance::Instance;

#[derive(Debug, Clone)]
pub struct ScaleUpConfig {
    /// Run that launched workers are attached to (the cluster master).
    pub parent_run_id: RunId,
    /// Owner of workers launched for demand without an owner.
    pub default_owner: String,
    pub disk: u32,
    pub image: String,
    pub cmd_template: String,
    pub price_type: PriceType,
    pub region_id: Option<u64>,
    /// How long to wait for a launched worker to initialize.
    pub polling: RetryPolicy,
}

/// A launched run reached a final status before it initialized.
#[derive(Debug)]
struct RunFailed {
    run: RunInfo,
}

impl RunFailed {
    fn is_insufficient_capacity(&self) -> bool {
        self.run
            .state_reason
            .as_deref()
            .is_some_and(|reason| reason.to_lowercase().contains("insufficient"))
    }
}

impl Display for RunFailed {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "Run {} ended with status {:?}", self.run.id, self.run.status)?;
        if let Some(reason) = &self.run.state_reason {
            write!(f, ": {reason}")?;
        }
        Ok(())
    }
}

impl std::error::Error for RunFailed {}

/// Launches workers and registers them in the cluster.
pub struct ScaleUpHandler {
    queue: Rc<dyn QueueBackend>,
    provider: Rc<dyn InstanceProvider>,
    storage: SharedHostStorage,
    hosts: ClusterHosts,
    events: Rc<EventManager>,
    config: ScaleUpConfig,
}

impl ScaleUpHandler {
    pub fn new(
        queue: Rc<dyn QueueBackend>,
        provider: Rc<dyn InstanceProvider>,
        storage: SharedHostStorage,
        hosts: ClusterHosts,
        events: Rc<EventManager>,
        config: ScaleUpConfig,
    ) -> Self {
        Self {
            queue,
            provider,
            storage,
            hosts,
            events,
            config,
        }
    }

    /// Launches a worker of the given instance type and waits until it joins the cluster.
    /// Returns the hostname of the new worker.
    ///
    /// The outcome is recorded as an instance event. A worker that fails to initialize is
    /// stopped and reported as an error, it is not retried.
    pub async fn scale_up(&self, instance: &Instance, owner: Option<&str>) -> ScaleResult<String> {
        let owner = owner.unwrap_or(&self.config.default_owner);
        log::info!("Scaling up: launching worker {instance} owned by {owner}");
        let request = LaunchRequest {
            instance_type: instance.name.clone(),
            disk: self.config.disk,
            image: self.config.image.clone(),
            cmd_template: self.config.cmd_template.clone(),
            owner: owner.to_string(),
            parent_run_id: self.config.parent_run_id,
            price_type: self.config.price_type,
            region_id: self.config.region_id,
        };
        let run_id = match self.provider.launch_instance(&request).await {
            Ok(run_id) => run_id,
            Err(error) => {
                self.events.register(InstanceEvent::failing(&instance.name));
                return Err(error.context(format!("Cannot launch worker {}", instance.name)));
            }
        };
        log::info!("Worker run {run_id} ({}) was launched", instance.name);

        let run = match self.await_initialization(run_id).await {
            PollOutcome::Ready(run) => run,
            PollOutcome::Aborted(error) => {
                let insufficient = error
                    .downcast_ref::<RunFailed>()
                    .is_some_and(|failure| failure.is_insufficient_capacity());
                if insufficient {
                    self.events.register(InstanceEvent::insufficient(&instance.name));
                } else {
                    self.events.register(InstanceEvent::failing(&instance.name));
                }
                self.stop_run(run_id).await;
                return Err(error.context(format!("Worker run {run_id} failed to initialize")));
            }
            PollOutcome::Exhausted { attempts } => {
                self.events.register(InstanceEvent::failing(&instance.name));
                self.stop_run(run_id).await;
                anyhow::bail!(
                    "Worker run {run_id} did not initialize after {attempts} status check(s)"
                );
            }
        };

        let (Some(host), Some(ip)) = (run.host, run.ip) else {
            anyhow::bail!("Worker run {run_id} is ready but has no host or IP");
        };
        self.register(&host, &ip).await?;
        self.events.register(InstanceEvent::available(&instance.name));
        log::info!("Worker {host} ({ip}) joined the cluster");
        Ok(host)
    }

    async fn await_initialization(&self, run_id: RunId) -> PollOutcome<RunInfo> {
        let provider = &self.provider;
        poll(self.config.polling, |attempt| async move {
            match provider.load_run(run_id).await {
                Ok(run) if run.status.is_final() => {
                    Poll::Abort(anyhow::Error::new(RunFailed { run }))
                }
                Ok(run) if run.is_ready() => Poll::Ready(run),
                Ok(run) => {
                    log::debug!(
                        "Worker run {run_id} is not ready yet (status {:?}, initialized {}), attempt {attempt}",
                        run.status,
                        run.initialized
                    );
                    Poll::Pending
                }
                Err(error) => {
                    log::warn!("Cannot load worker run {run_id}: {error:?}");
                    Poll::Pending
                }
            }
        })
        .await
    }

    async fn register(&self, host: &str, ip: &str) -> ScaleResult<()> {
        self.hosts
            .add_to_hosts_file(host, ip)
            .with_context(|| format!("Cannot add {host} to the hosts file"))?;
        self.hosts
            .add_to_default_hostfile(host)
            .with_context(|| format!("Cannot add {host} to the default host file"))?;
        self.queue
            .enable_host(host)
            .await
            .with_context(|| format!("Cannot enable host {host}"))?;
        self.storage.add_host(host)?;
        Ok(())
    }

    async fn stop_run(&self, run_id: RunId) {
        if let Err(error) = self.provider.terminate_instance(run_id).await {
            log::error!("Cannot stop failed worker run {run_id}: {error:?}");
        }
    }
}
