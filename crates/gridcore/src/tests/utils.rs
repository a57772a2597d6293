use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::rc::Rc;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use derive_builder::Builder;
use tempfile::TempDir;

use crate::ScaleResult;
use crate::autoscaler::AutoscalerConfig;
use crate::backend::{
    BackendFuture, InstanceProvider, LaunchRequest, PriceType, QueueBackend, RunId, RunInfo,
    RunStatus,
};
use crate::common::retry::RetryPolicy;
use crate::common::{Map, Set};
use crate::event::EventManager;
use crate::host::{MemoryHostStorage, SharedHostStorage};
use crate::hostsfile::ClusterHosts;
use crate::instance::{Instance, InstanceSource};
use crate::job::{AllocationRule, Job, JobState};
use crate::resource::{ComputeResource, Cpu, CustomResource, ResourceSupply};
use crate::scale::ScaleUpConfig;

/// Pending single host job submitted long ago.
pub fn job(id: &str, cpu: Cpu) -> Job {
    Job {
        id: id.to_string(),
        root_id: id.to_string(),
        name: format!("job-{id}"),
        user: "user".to_string(),
        state: JobState::Pending,
        submit_time: SystemTime::UNIX_EPOCH,
        pe: None,
        cpu,
        gpu: 0,
        mem: 0,
        hosts: vec![],
        requests: Map::default(),
    }
}

/// Pending job of a round robin parallel environment.
pub fn mpi_job(id: &str, cpu: Cpu) -> Job {
    Job {
        pe: Some("mpi".to_string()),
        ..job(id, cpu)
    }
}

pub fn ready_run(id: RunId) -> RunInfo {
    RunInfo {
        id,
        status: RunStatus::Running,
        initialized: true,
        host: Some(format!("pipeline-{id}")),
        ip: Some(format!("10.0.0.{id}")),
        state_reason: None,
    }
}

pub fn scale_up_config(attempts: u32) -> ScaleUpConfig {
    ScaleUpConfig {
        parent_run_id: 100,
        default_owner: "root".to_string(),
        disk: 50,
        image: "library/centos:7".to_string(),
        cmd_template: "sleep infinity".to_string(),
        price_type: PriceType::Spot,
        region_id: None,
        polling: RetryPolicy::new(attempts, Duration::ZERO),
    }
}

#[derive(Builder)]
#[builder(pattern = "owned", build_fn(name = "finish"))]
pub struct AutoscalerOptions {
    #[builder(default = "Duration::ZERO")]
    scale_up_timeout: Duration,
    #[builder(default = "Duration::from_secs(60)")]
    scale_down_timeout: Duration,
    #[builder(default = "10")]
    max_workers: u32,
    #[builder(default = "10")]
    scale_up_batch_size: usize,
    #[builder(default = "1")]
    scale_down_batch_size: usize,
    #[builder(default = "InstanceSource::Family { family: \"m5\".to_string(), max_cpu: None }")]
    instance_source: InstanceSource,
    #[builder(default)]
    custom_resources: Vec<String>,
}

impl AutoscalerOptionsBuilder {
    pub fn build(self) -> AutoscalerConfig {
        let AutoscalerOptions {
            scale_up_timeout,
            scale_down_timeout,
            max_workers,
            scale_up_batch_size,
            scale_down_batch_size,
            instance_source,
            custom_resources,
        } = self.finish().unwrap();
        AutoscalerConfig {
            scale_up_timeout,
            scale_down_timeout,
            max_workers,
            scale_up_batch_size,
            scale_down_batch_size,
            instance_source,
            custom_resources,
        }
    }
}

/// In-memory queue that records all modifications.
#[derive(Default)]
pub struct MockQueue {
    jobs: RefCell<Vec<Job>>,
    supplies: RefCell<Vec<ResourceSupply>>,
    global_supplies: RefCell<CustomResource>,
    capacities: RefCell<Map<String, ComputeResource>>,
    invalid_hosts: RefCell<Set<String>>,
    lost_hosts: RefCell<Set<String>>,
    enabled: RefCell<Vec<String>>,
    disabled: RefCell<Vec<String>>,
    deleted: RefCell<Vec<String>>,
    killed: RefCell<Vec<(String, bool)>>,
    decreased: RefCell<Vec<Cpu>>,
}

impl MockQueue {
    pub fn set_jobs(&self, jobs: Vec<Job>) {
        *self.jobs.borrow_mut() = jobs;
    }

    pub fn set_supplies(&self, supplies: Vec<ResourceSupply>) {
        *self.supplies.borrow_mut() = supplies;
    }

    pub fn set_global_supplies(&self, supplies: CustomResource) {
        *self.global_supplies.borrow_mut() = supplies;
    }

    pub fn set_capacity(&self, host: &str, capacity: ComputeResource) {
        self.capacities.borrow_mut().insert(host.to_string(), capacity);
    }

    pub fn set_invalid_hosts(&self, hosts: &[&str]) {
        *self.invalid_hosts.borrow_mut() = hosts.iter().map(|host| host.to_string()).collect();
    }

    /// Hosts unknown to the queue, all host operations fail for them.
    pub fn set_lost_hosts(&self, hosts: &[&str]) {
        *self.lost_hosts.borrow_mut() = hosts.iter().map(|host| host.to_string()).collect();
    }

    fn check_known(&self, host: &str) -> ScaleResult<()> {
        if self.lost_hosts.borrow().contains(host) {
            anyhow::bail!("Host {host} does not exist");
        }
        Ok(())
    }

    pub fn enabled_hosts(&self) -> Vec<String> {
        self.enabled.borrow().clone()
    }

    pub fn disabled_hosts(&self) -> Vec<String> {
        self.disabled.borrow().clone()
    }

    pub fn deleted_hosts(&self) -> Vec<String> {
        self.deleted.borrow().clone()
    }

    pub fn killed_jobs(&self) -> Vec<(String, bool)> {
        self.killed.borrow().clone()
    }

    pub fn decreased_slots(&self) -> Vec<Cpu> {
        self.decreased.borrow().clone()
    }
}

impl QueueBackend for MockQueue {
    fn list_jobs(&self) -> BackendFuture<'_, Vec<Job>> {
        Box::pin(async move { Ok(self.jobs.borrow().clone()) })
    }

    fn list_host_supplies(&self) -> BackendFuture<'_, Vec<ResourceSupply>> {
        Box::pin(async move { Ok(self.supplies.borrow().clone()) })
    }

    fn list_global_supplies(&self) -> BackendFuture<'_, CustomResource> {
        Box::pin(async move { Ok(self.global_supplies.borrow().clone()) })
    }

    fn get_allocation_rule<'a>(&'a self, pe: &'a str) -> BackendFuture<'a, AllocationRule> {
        Box::pin(async move {
            Ok(match pe {
                "mpi" => AllocationRule::RoundRobin,
                "fill" => AllocationRule::FillUp,
                _ => AllocationRule::PeSlots,
            })
        })
    }

    fn enable_host<'a>(&'a self, host: &'a str) -> BackendFuture<'a, ()> {
        Box::pin(async move {
            self.check_known(host)?;
            self.enabled.borrow_mut().push(host.to_string());
            Ok(())
        })
    }

    fn disable_host<'a>(&'a self, host: &'a str) -> BackendFuture<'a, ()> {
        Box::pin(async move {
            self.check_known(host)?;
            self.disabled.borrow_mut().push(host.to_string());
            Ok(())
        })
    }

    fn delete_host<'a>(&'a self, host: &'a str) -> BackendFuture<'a, ()> {
        Box::pin(async move {
            self.check_known(host)?;
            self.deleted.borrow_mut().push(host.to_string());
            Ok(())
        })
    }

    fn kill_jobs<'a>(&'a self, jobs: &'a [Job], force: bool) -> BackendFuture<'a, ()> {
        Box::pin(async move {
            let mut killed = self.killed.borrow_mut();
            killed.extend(jobs.iter().map(|job| (job.id.clone(), force)));
            Ok(())
        })
    }

    fn is_valid_host<'a>(&'a self, host: &'a str) -> BackendFuture<'a, bool> {
        Box::pin(async move { Ok(!self.invalid_hosts.borrow().contains(host)) })
    }

    fn get_host_capacity<'a>(&'a self, host: &'a str) -> BackendFuture<'a, ComputeResource> {
        Box::pin(async move {
            self.check_known(host)?;
            Ok(self
                .capacities
                .borrow()
                .get(host)
                .cloned()
                .unwrap_or_default())
        })
    }

    fn decrease_slots(&self, slots: Cpu) -> BackendFuture<'_, ()> {
        Box::pin(async move {
            self.decreased.borrow_mut().push(slots);
            Ok(())
        })
    }
}

/// In-memory cloud that launches runs with increasing ids.
///
/// Statuses pushed for a run are returned one by one, the last one repeatedly.
/// Launched runs without pushed statuses are ready immediately.
#[derive(Default)]
pub struct MockProvider {
    launched: RefCell<Vec<LaunchRequest>>,
    statuses: RefCell<Map<RunId, VecDeque<RunInfo>>>,
    terminated: RefCell<Vec<RunId>>,
    instances: RefCell<Vec<Instance>>,
    fail_launch: Cell<bool>,
    fail_terminate: Cell<bool>,
}

impl MockProvider {
    pub fn push_status(&self, run_id: RunId, run: RunInfo) {
        self.statuses
            .borrow_mut()
            .entry(run_id)
            .or_default()
            .push_back(run);
    }

    pub fn set_instances(&self, instances: Vec<Instance>) {
        *self.instances.borrow_mut() = instances;
    }

    pub fn fail_launches(&self) {
        self.fail_launch.set(true);
    }

    pub fn fail_terminations(&self) {
        self.fail_terminate.set(true);
    }

    pub fn launched(&self) -> Vec<LaunchRequest> {
        self.launched.borrow().clone()
    }

    pub fn terminated(&self) -> Vec<RunId> {
        self.terminated.borrow().clone()
    }
}

impl InstanceProvider for MockProvider {
    fn launch_instance<'a>(&'a self, request: &'a LaunchRequest) -> BackendFuture<'a, RunId> {
        Box::pin(async move {
            if self.fail_launch.get() {
                anyhow::bail!("Launch of {} failed", request.instance_type);
            }
            let mut launched = self.launched.borrow_mut();
            launched.push(request.clone());
            Ok(launched.len() as RunId)
        })
    }

    fn load_run(&self, run_id: RunId) -> BackendFuture<'_, RunInfo> {
        Box::pin(async move {
            let mut statuses = self.statuses.borrow_mut();
            if let Some(queue) = statuses.get_mut(&run_id) {
                let run = if queue.len() > 1 {
                    queue.pop_front()
                } else {
                    queue.front().cloned()
                };
                if let Some(run) = run {
                    return Ok(run);
                }
            }
            if run_id >= 1 && run_id <= self.launched.borrow().len() as RunId {
                return Ok(ready_run(run_id));
            }
            anyhow::bail!("Run {run_id} does not exist")
        })
    }

    fn terminate_instance(&self, run_id: RunId) -> BackendFuture<'_, ()> {
        Box::pin(async move {
            if self.fail_terminate.get() {
                anyhow::bail!("Cannot stop run {run_id}");
            }
            self.terminated.borrow_mut().push(run_id);
            Ok(())
        })
    }

    fn list_instances(&self) -> BackendFuture<'_, Vec<Instance>> {
        Box::pin(async move { Ok(self.instances.borrow().clone()) })
    }
}

/// Mock backends with host files placed in a temporary directory.
pub struct TestEnv {
    pub queue: Rc<MockQueue>,
    pub provider: Rc<MockProvider>,
    pub storage: SharedHostStorage,
    pub hosts: ClusterHosts,
    pub events: Rc<EventManager>,
}

impl TestEnv {
    pub fn new(dir: &TempDir) -> Self {
        Self::with_backends(
            dir,
            Rc::new(MockQueue::default()),
            Rc::new(MockProvider::default()),
            Rc::new(EventManager::new(Duration::from_secs(3600))),
        )
    }

    pub fn with_backends(
        dir: &TempDir,
        queue: Rc<MockQueue>,
        provider: Rc<MockProvider>,
        events: Rc<EventManager>,
    ) -> Self {
        Self {
            queue,
            provider,
            storage: Arc::new(MemoryHostStorage::default()),
            hosts: ClusterHosts::new(
                Some(dir.path().join("hosts")),
                Some(dir.path().join("default_hostfile")),
            ),
            events,
        }
    }
}
