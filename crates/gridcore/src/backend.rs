//! Capabilities that the engine consumes from the outside world.
//!
//! [`QueueBackend`] talks to the job scheduler (Grid Engine, Kubernetes), [`InstanceProvider`]
//! launches and stops cloud instances. Concrete implementations are chosen once at process start.
use std::fmt::{Display, Formatter};
use std::future::Future;
use std::pin::Pin;

use crate::ScaleResult;
use crate::instance::Instance;
use crate::job::{AllocationRule, Job};
use crate::resource::{ComputeResource, Cpu, CustomResource, ResourceSupply};

pub type BackendFuture<'a, T> = Pin<Box<dyn Future<Output = ScaleResult<T>> + 'a>>;

/// Handler that can communicate with a job queue (e.g. SGE `qstat`/`qconf`).
pub trait QueueBackend {
    /// All jobs currently known to the queue, in submission order.
    fn list_jobs(&self) -> BackendFuture<'_, Vec<Job>>;

    /// Free capacity of every host in the queue.
    fn list_host_supplies(&self) -> BackendFuture<'_, Vec<ResourceSupply>>;

    /// Cluster-wide amounts of custom (consumable) resources.
    fn list_global_supplies(&self) -> BackendFuture<'_, CustomResource>;

    fn get_allocation_rule<'a>(&'a self, pe: &'a str) -> BackendFuture<'a, AllocationRule>;

    /// Allow the host to accept new jobs.
    fn enable_host<'a>(&'a self, host: &'a str) -> BackendFuture<'a, ()>;

    /// Forbid the host to accept new jobs. Running jobs are not affected.
    fn disable_host<'a>(&'a self, host: &'a str) -> BackendFuture<'a, ()>;

    /// Remove the host from the queue configuration.
    fn delete_host<'a>(&'a self, host: &'a str) -> BackendFuture<'a, ()>;

    fn kill_jobs<'a>(&'a self, jobs: &'a [Job], force: bool) -> BackendFuture<'a, ()>;

    /// Returns false if the queue considers the host broken or does not know it at all.
    fn is_valid_host<'a>(&'a self, host: &'a str) -> BackendFuture<'a, bool>;

    /// Total capacity of the host.
    fn get_host_capacity<'a>(&'a self, host: &'a str) -> BackendFuture<'a, ComputeResource>;

    /// Decrease the number of slots of the parallel environment(s) served by the queue.
    fn decrease_slots(&self, slots: Cpu) -> BackendFuture<'_, ()>;
}

pub type RunId = u64;

/// Prefix of hostnames of instances launched by the cloud platform.
pub const HOST_PREFIX: &str = "pipeline-";

/// Instance hostnames have the form `pipeline-<run id>`.
pub fn run_id_from_host(host: &str) -> Option<RunId> {
    host.strip_prefix(HOST_PREFIX)?.parse().ok()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PriceType {
    Spot,
    OnDemand,
}

impl Display for PriceType {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            PriceType::Spot => f.write_str("spot"),
            PriceType::OnDemand => f.write_str("on-demand"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchRequest {
    pub instance_type: String,
    pub disk: u32,
    pub image: String,
    pub cmd_template: String,
    pub owner: String,
    pub parent_run_id: RunId,
    pub price_type: PriceType,
    pub region_id: Option<u64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunStatus {
    Running,
    Success,
    Failure,
    Stopped,
    Resuming,
    Pausing,
    Paused,
}

impl RunStatus {
    /// The run will never be running again.
    pub fn is_final(&self) -> bool {
        matches!(
            self,
            RunStatus::Success | RunStatus::Failure | RunStatus::Stopped
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunInfo {
    pub id: RunId,
    pub status: RunStatus,
    pub initialized: bool,
    /// Hostname of the instance, once it is known.
    pub host: Option<String>,
    pub ip: Option<String>,
    /// Reason of the last status change reported by the platform.
    pub state_reason: Option<String>,
}

impl RunInfo {
    /// The instance is up and reachable by the queue.
    pub fn is_ready(&self) -> bool {
        self.initialized
            && self.status == RunStatus::Running
            && self.host.is_some()
            && self.ip.is_some()
    }
}

/// Handler that can launch cloud instances (e.g. Cloud Pipeline runs).
pub trait InstanceProvider {
    fn launch_instance<'a>(&'a self, request: &'a LaunchRequest) -> BackendFuture<'a, RunId>;

    fn load_run(&self, run_id: RunId) -> BackendFuture<'_, RunInfo>;

    fn terminate_instance(&self, run_id: RunId) -> BackendFuture<'_, ()>;

    /// Instance types that may be launched.
    fn list_instances(&self) -> BackendFuture<'_, Vec<Instance>>;
}
