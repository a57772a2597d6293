use std::rc::Rc;

use anyhow::Context;

use crate::ScaleResult;
use crate::backend::{InstanceProvider, QueueBackend, run_id_from_host};
use crate::host::SharedHostStorage;
use crate::hostsfile::ClusterHosts;
use crate::resource::ComputeResource;

/// Removes workers from the cluster.
pub struct ScaleDownHandler {
    queue: Rc<dyn QueueBackend>,
    provider: Rc<dyn InstanceProvider>,
    storage: SharedHostStorage,
    hosts: ClusterHosts,
}

impl ScaleDownHandler {
    pub fn new(
        queue: Rc<dyn QueueBackend>,
        provider: Rc<dyn InstanceProvider>,
        storage: SharedHostStorage,
        hosts: ClusterHosts,
    ) -> Self {
        Self {
            queue,
            provider,
            storage,
            hosts,
        }
    }

    /// Removes the host if it runs no jobs and returns `true`.
    ///
    /// The host is disabled before its jobs are checked so that nothing is scheduled on it in
    /// between. A host that still runs jobs is enabled again and `false` is returned.
    pub async fn scale_down(&self, host: &str) -> ScaleResult<bool> {
        self.queue
            .disable_host(host)
            .await
            .with_context(|| format!("Cannot disable host {host}"))?;
        let jobs = match self.queue.list_jobs().await {
            Ok(jobs) => jobs,
            Err(error) => {
                self.enable_back(host).await;
                return Err(error);
            }
        };
        let running = jobs
            .iter()
            .filter(|job| job.is_running() && job.runs_on(host))
            .count();
        if running > 0 {
            log::info!("Host {host} still runs {running} job(s), it will not be removed");
            self.enable_back(host).await;
            return Ok(false);
        }
        log::info!("Scaling down: removing host {host}");
        self.teardown(host).await?;
        Ok(true)
    }

    async fn enable_back(&self, host: &str) {
        if let Err(error) = self.queue.enable_host(host).await {
            log::error!("Cannot enable host {host} again: {error:?}");
        }
    }

    /// Removes the host from the cluster regardless of its jobs.
    ///
    /// The host is removed from the host storage only after all other steps succeed, so that an
    /// interrupted teardown is attempted again.
    pub async fn teardown(&self, host: &str) -> ScaleResult<()> {
        self.queue
            .disable_host(host)
            .await
            .with_context(|| format!("Cannot disable host {host}"))?;
        let capacity = self
            .queue
            .get_host_capacity(host)
            .await
            .with_context(|| format!("Cannot get capacity of host {host}"))?;
        self.queue
            .delete_host(host)
            .await
            .with_context(|| format!("Cannot delete host {host} from the queue"))?;
        self.hosts.remove_from_hosts_file(host)?;
        self.hosts.remove_from_default_hostfile(host)?;
        self.stop_run(host).await?;

        if capacity.cpu > 0 {
            self.queue
                .decrease_slots(capacity.cpu)
                .await
                .with_context(|| format!("Cannot decrease slots by {}", capacity.cpu))?;
        }
        self.storage.remove_host(host)?;
        log::info!("Host {host} was removed from the cluster");
        Ok(())
    }

    /// Removes a host that may be already unknown to the queue.
    ///
    /// Queue steps are best effort, a failed capacity lookup skips the slot decrease. The run
    /// has to be stopped (or already finished) before the host is dropped from the host storage.
    pub async fn forget(&self, host: &str) -> ScaleResult<()> {
        if let Err(error) = self.queue.disable_host(host).await {
            log::warn!("Cannot disable host {host}: {error:?}");
        }
        let capacity = match self.queue.get_host_capacity(host).await {
            Ok(capacity) => capacity,
            Err(error) => {
                log::warn!("Cannot get capacity of host {host}, slots stay unchanged: {error:?}");
                ComputeResource::default()
            }
        };
        if let Err(error) = self.queue.delete_host(host).await {
            log::warn!("Cannot delete host {host} from the queue: {error:?}");
        }
        self.hosts.remove_from_hosts_file(host)?;
        self.hosts.remove_from_default_hostfile(host)?;
        self.stop_run(host).await?;

        if capacity.cpu > 0 {
            if let Err(error) = self.queue.decrease_slots(capacity.cpu).await {
                log::warn!("Cannot decrease slots by {}: {error:?}", capacity.cpu);
            }
        }
        self.storage.remove_host(host)?;
        log::info!("Host {host} was removed from the cluster");
        Ok(())
    }

    /// Stops the run of the host. A run that has already finished counts as stopped.
    async fn stop_run(&self, host: &str) -> ScaleResult<()> {
        let Some(run_id) = run_id_from_host(host) else {
            log::warn!("Cannot determine the run of host {host}, it will not be stopped");
            return Ok(());
        };
        let Err(error) = self.provider.terminate_instance(run_id).await else {
            return Ok(());
        };
        match self.provider.load_run(run_id).await {
            Ok(run) if run.status.is_final() => {
                log::debug!("Run {run_id} of host {host} has already finished ({:?})", run.status);
                Ok(())
            }
            _ => Err(error.context(format!("Cannot stop run {run_id} of host {host}"))),
        }
    }
}
