use std::fmt::{Display, Formatter};
use std::time::SystemTime;

use crate::common::Map;
use crate::resource::{ComputeResource, Cpu, Gpu, Memory};

pub type JobId = String;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum JobState {
    Running,
    Pending,
    Suspended,
    Error,
    Deleted,
    Unknown,
}

impl Display for JobState {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            JobState::Running => "RUNNING",
            JobState::Pending => "PENDING",
            JobState::Suspended => "SUSPENDED",
            JobState::Error => "ERROR",
            JobState::Deleted => "DELETED",
            JobState::Unknown => "UNKNOWN",
        };
        f.write_str(name)
    }
}

/// How the slots of a parallel environment are spread across hosts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AllocationRule {
    /// All slots of a job have to be allocated on a single host.
    PeSlots,
    /// Slots are distributed to hosts one at a time.
    RoundRobin,
    /// Hosts are filled up one after another.
    FillUp,
}

impl AllocationRule {
    /// Returns true if a job can be satisfied by capacity of several hosts.
    pub fn is_fractional(&self) -> bool {
        matches!(self, AllocationRule::RoundRobin | AllocationRule::FillUp)
    }
}

/// Queued or running unit of work, as reported by the queue backend in a single cycle.
#[derive(Debug, Clone, PartialEq)]
pub struct Job {
    pub id: JobId,
    /// Identifier of the job that this job is a task of (array jobs), otherwise the same as `id`.
    pub root_id: JobId,
    pub name: String,
    pub user: String,
    pub state: JobState,
    pub submit_time: SystemTime,
    /// Parallel environment name.
    pub pe: Option<String>,
    pub cpu: Cpu,
    pub gpu: Gpu,
    pub mem: Memory,
    pub hosts: Vec<String>,
    /// Other requested (custom) resources.
    pub requests: Map<String, String>,
}

impl Job {
    pub fn is_running(&self) -> bool {
        self.state == JobState::Running
    }

    pub fn is_pending(&self) -> bool {
        self.state == JobState::Pending
    }

    pub fn runs_on(&self, host: &str) -> bool {
        self.hosts.iter().any(|h| h == host)
    }

    /// Requested resources, owned by the job's user.
    pub fn resource(&self) -> ComputeResource {
        ComputeResource::new(self.cpu, self.gpu, self.mem).with_owner(self.user.clone())
    }
}
