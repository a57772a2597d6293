use std::cell::RefCell;
use std::rc::Rc;
use std::time::{Duration, Instant, SystemTime};

use crate::ScaleResult;
use crate::availability::InstanceAvailabilityManager;
use crate::backend::{InstanceProvider, QueueBackend};
use crate::common::Map;
use crate::common::error::ScaleError;
use crate::common::timeutils::now_monotonic;
use crate::demand::{CustomResourceFilter, Demand, DemandSelector, JobValidator};
use crate::host::SharedHostStorage;
use crate::instance::{CpuCapacityInstanceSelector, Instance, InstanceDemand, InstanceSource};
use crate::job::Job;
use crate::scale::{ScaleDownHandler, ScaleUpHandler};

#[derive(Debug, Clone)]
pub struct AutoscalerConfig {
    /// Pending jobs younger than this do not cause a scale up.
    pub scale_up_timeout: Duration,
    /// Workers idle for at least this long are scaled down.
    pub scale_down_timeout: Duration,
    pub max_workers: u32,
    /// Maximum number of workers launched in a single cycle.
    pub scale_up_batch_size: usize,
    /// Maximum number of workers removed in a single cycle.
    pub scale_down_batch_size: usize,
    pub instance_source: InstanceSource,
    /// Custom resources considered by the custom resource filter.
    pub custom_resources: Vec<String>,
}

impl AutoscalerConfig {
    pub fn validate(&self) -> crate::Result<()> {
        if self.max_workers == 0 {
            return Err(ScaleError::InvalidConfiguration(
                "maximum number of workers has to be positive".to_string(),
            ));
        }
        if self.scale_up_batch_size == 0 || self.scale_down_batch_size == 0 {
            return Err(ScaleError::InvalidConfiguration(
                "scale up and scale down batch sizes have to be positive".to_string(),
            ));
        }
        Ok(())
    }
}

/// Decisions of a single cycle, computed from one snapshot of the queue.
#[derive(Debug, Default)]
pub struct ScalePlan {
    pub jobs: Vec<Job>,
    pub workers: Vec<String>,
    pub pending: usize,
    /// Pending jobs that can never be satisfied.
    pub invalid_jobs: Vec<Job>,
    pub demands: Vec<Demand>,
    pub launches: Vec<InstanceDemand>,
}

#[derive(Debug, Default, PartialEq, Eq)]
pub struct CycleSummary {
    pub launched: Vec<String>,
    pub removed: Vec<String>,
}

/// Scales the cluster according to the jobs in the queue.
pub struct GridEngineAutoscaler {
    queue: Rc<dyn QueueBackend>,
    provider: Rc<dyn InstanceProvider>,
    storage: SharedHostStorage,
    scale_up: ScaleUpHandler,
    scale_down: Rc<ScaleDownHandler>,
    availability: InstanceAvailabilityManager,
    job_validator: JobValidator,
    custom_filter: CustomResourceFilter,
    demand_selector: DemandSelector,
    config: AutoscalerConfig,
    /// Tracked workers that run no jobs, with the time they were first seen idle.
    idle_since: RefCell<Map<String, Instant>>,
}

impl GridEngineAutoscaler {
    pub fn new(
        queue: Rc<dyn QueueBackend>,
        provider: Rc<dyn InstanceProvider>,
        storage: SharedHostStorage,
        scale_up: ScaleUpHandler,
        scale_down: Rc<ScaleDownHandler>,
        availability: InstanceAvailabilityManager,
        config: AutoscalerConfig,
    ) -> Self {
        Self {
            job_validator: JobValidator::new(queue.clone(), config.max_workers),
            custom_filter: CustomResourceFilter::new(queue.clone(), config.custom_resources.clone()),
            demand_selector: DemandSelector::new(queue.clone()),
            queue,
            provider,
            storage,
            scale_up,
            scale_down,
            availability,
            config,
            idle_since: Default::default(),
        }
    }

    /// Computes what a cycle would do, without changing anything.
    pub async fn plan(&self) -> ScaleResult<ScalePlan> {
        let jobs = self.queue.list_jobs().await?;
        let workers = self.storage.load_hosts()?;
        let now = SystemTime::now();

        let pending: Vec<&Job> = jobs.iter().filter(|job| job.is_pending()).collect();
        let expired: Vec<Job> = pending
            .iter()
            .filter(|job| {
                now.duration_since(job.submit_time).unwrap_or_default() >= self.config.scale_up_timeout
            })
            .map(|job| (*job).clone())
            .collect();
        let pending = pending.len();
        log::debug!(
            "Found {} job(s), {pending} pending, {} waiting for longer than {}s, {} worker(s)",
            jobs.len(),
            expired.len(),
            self.config.scale_up_timeout.as_secs(),
            workers.len()
        );

        let mut plan = ScalePlan {
            pending,
            ..Default::default()
        };
        if !expired.is_empty() {
            let instances = self.load_instances().await?;
            let validated = self.job_validator.validate(expired, &instances).await?;
            let valid = self.custom_filter.filter(validated.valid).await?;
            plan.invalid_jobs = validated.invalid;
            plan.demands = self.demand_selector.select(&valid).await?;
            if !plan.demands.is_empty() {
                plan.launches = self.select_launches(&plan.demands, &instances, workers.len());
            }
        }
        plan.jobs = jobs;
        plan.workers = workers;
        Ok(plan)
    }

    /// Runs a single cycle: kills invalid jobs, launches workers for unsatisfied demand and
    /// removes idle workers when nothing is pending.
    pub async fn scale(&self) -> ScaleResult<CycleSummary> {
        let plan = self.plan().await?;
        self.update_idle_hosts(&plan.jobs, &plan.workers);

        if !plan.invalid_jobs.is_empty() {
            log::warn!(
                "Killing {} job(s) that cannot be satisfied by the cluster",
                plan.invalid_jobs.len()
            );
            if let Err(error) = self.queue.kill_jobs(&plan.invalid_jobs, false).await {
                log::error!("Cannot kill invalid jobs: {error:?}");
            }
        }

        let mut summary = CycleSummary::default();
        if !plan.launches.is_empty() {
            summary.launched = self.launch(&plan.launches).await;
        }
        if plan.pending == 0 {
            summary.removed = self.scale_down_idle().await;
        } else {
            log::debug!("There are pending jobs, skipping scale down");
        }
        Ok(summary)
    }

    async fn load_instances(&self) -> ScaleResult<Vec<Instance>> {
        let allowed = self.provider.list_instances().await?;
        let instances = self.config.instance_source.candidates(allowed);
        if instances.is_empty() {
            anyhow::bail!(
                "No instance type matches {:?}",
                self.config.instance_source
            );
        }
        Ok(instances)
    }

    fn select_launches(
        &self,
        demands: &[Demand],
        instances: &[Instance],
        workers: usize,
    ) -> Vec<InstanceDemand> {
        let max_workers = self.config.max_workers as usize;
        if workers >= max_workers {
            log::info!(
                "There are {} unsatisfied demand(s) but the maximum number of workers ({max_workers}) is reached",
                demands.len()
            );
            return vec![];
        }
        let unavailable = self.availability.get_unavailable();
        let available: Vec<Instance> = instances
            .iter()
            .filter(|instance| !unavailable.contains(&instance.name))
            .cloned()
            .collect();
        if available.is_empty() {
            log::warn!("All instance types are temporarily unavailable: {unavailable:?}");
            return vec![];
        }
        if !unavailable.is_empty() {
            log::info!("Instance types {unavailable:?} are temporarily unavailable");
        }

        let limit = self.config.scale_up_batch_size.min(max_workers - workers);
        let mut launches = CpuCapacityInstanceSelector.select(demands.to_vec(), &available);
        if launches.len() > limit {
            log::info!(
                "Launching only {limit} of {} required worker(s) in this cycle",
                launches.len()
            );
            launches.truncate(limit);
        }
        launches
    }

    /// Launches the workers concurrently and returns the hosts that joined the cluster.
    async fn launch(&self, launches: &[InstanceDemand]) -> Vec<String> {
        let results = futures::future::join_all(
            launches
                .iter()
                .map(|demand| self.scale_up.scale_up(&demand.instance, demand.owner.as_deref())),
        )
        .await;

        let mut hosts = Vec::new();
        for (demand, result) in launches.iter().zip(results) {
            match result {
                Ok(host) => hosts.push(host),
                Err(error) => log::error!("Scale up of {} failed: {error:?}", demand.instance.name),
            }
        }
        hosts
    }

    fn update_idle_hosts(&self, jobs: &[Job], workers: &[String]) {
        let now = now_monotonic();
        let mut idle_since = self.idle_since.borrow_mut();
        idle_since.retain(|host, _| workers.contains(host));
        for worker in workers {
            let busy = jobs
                .iter()
                .any(|job| job.is_running() && job.runs_on(worker));
            if busy {
                idle_since.remove(worker);
            } else {
                idle_since.entry(worker.clone()).or_insert(now);
            }
        }
    }

    async fn scale_down_idle(&self) -> Vec<String> {
        let now = now_monotonic();
        let mut candidates: Vec<(String, Instant)> = self
            .idle_since
            .borrow()
            .iter()
            .filter(|(_, since)| now.saturating_duration_since(**since) >= self.config.scale_down_timeout)
            .map(|(host, since)| (host.clone(), *since))
            .collect();
        candidates.sort_by(|(host_a, a), (host_b, b)| a.cmp(b).then_with(|| host_a.cmp(host_b)));

        let mut removed = Vec::new();
        for (host, _) in candidates.into_iter().take(self.config.scale_down_batch_size) {
            match self.scale_down.scale_down(&host).await {
                Ok(true) => {
                    self.idle_since.borrow_mut().remove(&host);
                    removed.push(host);
                }
                Ok(false) => {}
                Err(error) => log::error!("Scale down of {host} failed: {error:?}"),
            }
        }
        removed
    }
}

#[cfg(test)]
mod tests {
    use super::GridEngineAutoscaler;
    use crate::availability::{AvailabilityConfig, InstanceAvailabilityManager};
    use crate::common::timeutils::mock_time::MockTime;
    use crate::event::InstanceEvent;
    use crate::instance::Instance;
    use crate::job::JobState;
    use crate::resource::ComputeResource;
    use crate::scale::{ScaleDownHandler, ScaleUpHandler};
    use crate::tests::utils::{AutoscalerOptionsBuilder, TestEnv, job, mpi_job, scale_up_config};
    use std::rc::Rc;
    use std::time::{Duration, Instant, SystemTime};
    use tempfile::TempDir;

    fn create_autoscaler(env: &TestEnv, options: AutoscalerOptionsBuilder) -> GridEngineAutoscaler {
        let config = options.build();
        env.provider.set_instances(vec![
            Instance::new("m5.large", 2, 0, 8),
            Instance::new("m5.xlarge", 4, 0, 16),
            Instance::new("m5.2xlarge", 8, 0, 32),
            Instance::new("c5.large", 2, 0, 4),
        ]);
        let scale_down = Rc::new(ScaleDownHandler::new(
            env.queue.clone(),
            env.provider.clone(),
            env.storage.clone(),
            env.hosts.clone(),
        ));
        let scale_up = ScaleUpHandler::new(
            env.queue.clone(),
            env.provider.clone(),
            env.storage.clone(),
            env.hosts.clone(),
            env.events.clone(),
            scale_up_config(3),
        );
        let availability =
            InstanceAvailabilityManager::new(env.events.clone(), AvailabilityConfig::default());
        GridEngineAutoscaler::new(
            env.queue.clone(),
            env.provider.clone(),
            env.storage.clone(),
            scale_up,
            scale_down,
            availability,
            config,
        )
    }

    fn running_on(id: &str, host: &str) -> crate::job::Job {
        let mut running = job(id, 1);
        running.state = JobState::Running;
        running.hosts = vec![host.to_string()];
        running
    }

    #[test]
    fn config_validation() {
        assert!(AutoscalerOptionsBuilder::default().build().validate().is_ok());
        assert!(
            AutoscalerOptionsBuilder::default()
                .max_workers(0)
                .build()
                .validate()
                .is_err()
        );
        assert!(
            AutoscalerOptionsBuilder::default()
                .scale_up_batch_size(0)
                .build()
                .validate()
                .is_err()
        );
    }

    #[tokio::test]
    async fn pending_job_launches_worker() {
        let dir = TempDir::new().unwrap();
        let env = TestEnv::new(&dir);
        env.queue.set_jobs(vec![job("1", 3)]);
        let autoscaler = create_autoscaler(&env, AutoscalerOptionsBuilder::default());

        let summary = autoscaler.scale().await.unwrap();
        assert_eq!(summary.launched, vec!["pipeline-1"]);
        assert!(summary.removed.is_empty());
        assert_eq!(env.provider.launched()[0].instance_type, "m5.xlarge");
        assert_eq!(env.storage.load_hosts().unwrap(), vec!["pipeline-1"]);
    }

    #[tokio::test]
    async fn fresh_pending_job_is_not_scaled_for() {
        let dir = TempDir::new().unwrap();
        let env = TestEnv::new(&dir);
        let mut fresh = job("1", 3);
        fresh.submit_time = SystemTime::now();
        env.queue.set_jobs(vec![fresh]);
        let autoscaler = create_autoscaler(
            &env,
            AutoscalerOptionsBuilder::default().scale_up_timeout(Duration::from_secs(600)),
        );

        let summary = autoscaler.scale().await.unwrap();
        assert!(summary.launched.is_empty());
        assert!(env.provider.launched().is_empty());
    }

    #[tokio::test]
    async fn max_workers_limits_launches() {
        let dir = TempDir::new().unwrap();
        let env = TestEnv::new(&dir);
        env.storage.add_host("pipeline-50").unwrap();
        env.queue
            .set_jobs(vec![job("1", 8), job("2", 8), job("3", 8), running_on("4", "pipeline-50")]);
        let autoscaler = create_autoscaler(
            &env,
            AutoscalerOptionsBuilder::default()
                .max_workers(3)
                .scale_up_batch_size(10),
        );

        let summary = autoscaler.scale().await.unwrap();
        assert_eq!(summary.launched.len(), 2);
        assert_eq!(env.storage.load_hosts().unwrap().len(), 3);

        let summary = autoscaler.scale().await.unwrap();
        assert!(summary.launched.is_empty());
        assert_eq!(env.provider.launched().len(), 2);
    }

    #[tokio::test]
    async fn batch_size_limits_launches() {
        let dir = TempDir::new().unwrap();
        let env = TestEnv::new(&dir);
        env.queue.set_jobs(vec![job("1", 8), job("2", 8), job("3", 8)]);
        let autoscaler = create_autoscaler(
            &env,
            AutoscalerOptionsBuilder::default().scale_up_batch_size(1),
        );
        let summary = autoscaler.scale().await.unwrap();
        assert_eq!(summary.launched.len(), 1);
    }

    #[tokio::test]
    async fn invalid_jobs_are_killed() {
        let dir = TempDir::new().unwrap();
        let env = TestEnv::new(&dir);
        env.queue.set_jobs(vec![job("1", 64), job("2", 2)]);
        let autoscaler = create_autoscaler(&env, AutoscalerOptionsBuilder::default());

        let plan = autoscaler.plan().await.unwrap();
        assert_eq!(plan.invalid_jobs.len(), 1);
        assert_eq!(plan.launches.len(), 1);
        assert!(env.queue.killed_jobs().is_empty());

        autoscaler.scale().await.unwrap();
        assert_eq!(env.queue.killed_jobs(), vec![("1".to_string(), false)]);
        assert_eq!(env.provider.launched()[0].instance_type, "m5.large");
    }

    #[tokio::test]
    async fn unavailable_instance_types_are_skipped() {
        let dir = TempDir::new().unwrap();
        let env = TestEnv::new(&dir);
        env.events.register(InstanceEvent::insufficient("m5.large"));
        env.queue.set_jobs(vec![job("1", 2)]);
        let autoscaler = create_autoscaler(&env, AutoscalerOptionsBuilder::default());

        autoscaler.scale().await.unwrap();
        assert_eq!(env.provider.launched()[0].instance_type, "m5.xlarge");
    }

    #[tokio::test]
    async fn supply_of_existing_workers_is_used_for_mpi_jobs() {
        let dir = TempDir::new().unwrap();
        let env = TestEnv::new(&dir);
        env.queue.set_supplies(vec![crate::resource::ResourceSupply::new(
            "pipeline-50",
            ComputeResource::cpu(8),
        )]);
        env.queue.set_jobs(vec![mpi_job("1", 10)]);
        let autoscaler = create_autoscaler(&env, AutoscalerOptionsBuilder::default());

        let plan = autoscaler.plan().await.unwrap();
        assert_eq!(plan.launches.len(), 1);
        assert_eq!(plan.launches[0].instance.name, "m5.large");
    }

    #[tokio::test]
    async fn idle_workers_are_removed_after_timeout() {
        let time = MockTime::mock(Instant::now());
        let dir = TempDir::new().unwrap();
        let env = TestEnv::new(&dir);
        for host in ["pipeline-1", "pipeline-2", "pipeline-3"] {
            env.storage.add_host(host).unwrap();
            env.queue.set_capacity(host, ComputeResource::cpu(2));
        }
        env.queue.set_jobs(vec![running_on("1", "pipeline-2")]);
        let autoscaler = create_autoscaler(
            &env,
            AutoscalerOptionsBuilder::default()
                .scale_down_timeout(Duration::from_secs(300))
                .scale_down_batch_size(5),
        );

        assert!(autoscaler.scale().await.unwrap().removed.is_empty());
        time.advance(Duration::from_secs(200));
        assert!(autoscaler.scale().await.unwrap().removed.is_empty());
        time.advance(Duration::from_secs(100));
        let summary = autoscaler.scale().await.unwrap();
        assert_eq!(summary.removed, vec!["pipeline-1", "pipeline-3"]);
        assert_eq!(env.storage.load_hosts().unwrap(), vec!["pipeline-2"]);
        assert_eq!(env.queue.decreased_slots(), vec![2, 2]);
    }

    #[tokio::test]
    async fn scale_down_batch_removes_oldest_idle_first() {
        let time = MockTime::mock(Instant::now());
        let dir = TempDir::new().unwrap();
        let env = TestEnv::new(&dir);
        env.storage.add_host("pipeline-2").unwrap();
        let autoscaler = create_autoscaler(
            &env,
            AutoscalerOptionsBuilder::default()
                .scale_down_timeout(Duration::from_secs(60))
                .scale_down_batch_size(1),
        );

        autoscaler.scale().await.unwrap();
        time.advance(Duration::from_secs(30));
        env.storage.add_host("pipeline-1").unwrap();
        assert!(autoscaler.scale().await.unwrap().removed.is_empty());

        time.advance(Duration::from_secs(70));
        assert_eq!(autoscaler.scale().await.unwrap().removed, vec!["pipeline-2"]);
        assert_eq!(autoscaler.scale().await.unwrap().removed, vec!["pipeline-1"]);
    }

    #[tokio::test]
    async fn pending_jobs_block_scale_down() {
        let time = MockTime::mock(Instant::now());
        let dir = TempDir::new().unwrap();
        let env = TestEnv::new(&dir);
        env.storage.add_host("pipeline-1").unwrap();
        let mut fresh = job("1", 2);
        fresh.submit_time = SystemTime::now();
        env.queue.set_jobs(vec![fresh]);
        let autoscaler = create_autoscaler(
            &env,
            AutoscalerOptionsBuilder::default()
                .scale_up_timeout(Duration::from_secs(600))
                .scale_down_timeout(Duration::from_secs(60)),
        );

        autoscaler.scale().await.unwrap();
        time.advance(Duration::from_secs(120));
        assert!(autoscaler.scale().await.unwrap().removed.is_empty());
        assert_eq!(env.storage.load_hosts().unwrap(), vec!["pipeline-1"]);
    }
}
