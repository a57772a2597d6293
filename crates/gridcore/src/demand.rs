//! Translation of queued jobs into resource demand.
use std::rc::Rc;

use crate::ScaleResult;
use crate::backend::QueueBackend;
use crate::instance::Instance;
use crate::job::{AllocationRule, Job};
use crate::resource::{ComputeResource, CustomResource};

/// Resources that should be provided by new workers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Demand {
    /// Has to be satisfied by a single host.
    Integral(ComputeResource),
    /// May be satisfied by capacity of several hosts.
    Fractional(ComputeResource),
}

impl Demand {
    pub fn resource(&self) -> &ComputeResource {
        match self {
            Demand::Integral(resource) | Demand::Fractional(resource) => resource,
        }
    }

    pub fn owner(&self) -> Option<&str> {
        self.resource().owner.as_deref()
    }
}

pub async fn get_allocation_rule(queue: &dyn QueueBackend, job: &Job) -> ScaleResult<AllocationRule> {
    match &job.pe {
        Some(pe) => queue.get_allocation_rule(pe).await,
        None => Ok(AllocationRule::PeSlots),
    }
}

/// Converts pending jobs into the demand that the current hosts cannot satisfy.
pub struct DemandSelector {
    queue: Rc<dyn QueueBackend>,
}

impl DemandSelector {
    pub fn new(queue: Rc<dyn QueueBackend>) -> Self {
        Self { queue }
    }

    /// Jobs are processed in the given (submission) order.
    ///
    /// Each job with a single host allocation rule results in one integral demand of its full
    /// size. Jobs with a fractional allocation rule consume free capacity of the current hosts
    /// first and result in a fractional demand of whatever is left. Capacity consumed by a job is
    /// not available to the following jobs.
    ///
    /// A fractional job that fits into the free capacity emits no demand at all, e.g. two 8 CPU
    /// round robin jobs against two hosts with 32 free CPUs each. Only the missing part of a job
    /// is demanded: a 33 CPU and a 1 CPU job against two 16 CPU hosts demand `cpu=1` each.
    pub async fn select(&self, jobs: &[Job]) -> ScaleResult<Vec<Demand>> {
        let mut supplies: Vec<ComputeResource> = self
            .queue
            .list_host_supplies()
            .await?
            .into_iter()
            .map(|supply| supply.resource)
            .collect();

        let mut demands = Vec::new();
        for job in jobs {
            let rule = get_allocation_rule(self.queue.as_ref(), job).await?;
            if rule.is_fractional() {
                let left = consume_supplies(job.resource(), &mut supplies);
                if left.is_empty() {
                    log::debug!("Job {} can be satisfied by the existing hosts", job.id);
                } else {
                    demands.push(Demand::Fractional(left));
                }
            } else {
                demands.push(Demand::Integral(job.resource()));
            }
        }
        Ok(demands)
    }
}

/// Subtracts as much of `demand` as possible from `supplies`, returns the unsatisfied rest.
fn consume_supplies(demand: ComputeResource, supplies: &mut [ComputeResource]) -> ComputeResource {
    let mut left = demand;
    for supply in supplies.iter_mut() {
        if left.is_empty() {
            break;
        }
        let next = left.subtract(supply);
        let consumed = left.subtract(&next);
        *supply = supply.subtract(&consumed);
        left = next;
    }
    left
}

/// Jobs that can never be satisfied, no matter how many workers are launched.
pub struct JobValidator {
    queue: Rc<dyn QueueBackend>,
    max_workers: u32,
}

#[derive(Debug, Default)]
pub struct ValidatedJobs {
    pub valid: Vec<Job>,
    pub invalid: Vec<Job>,
}

impl JobValidator {
    pub fn new(queue: Rc<dyn QueueBackend>, max_workers: u32) -> Self {
        Self { queue, max_workers }
    }

    /// A single host job is invalid if no instance type can hold it.
    /// A multi host job is invalid if it does not fit into `max_workers` of the largest instances.
    pub async fn validate(&self, jobs: Vec<Job>, instances: &[Instance]) -> ScaleResult<ValidatedJobs> {
        let largest = instances
            .iter()
            .map(|instance| instance.resource())
            .fold(ComputeResource::zero(), |acc, resource| ComputeResource {
                cpu: acc.cpu.max(resource.cpu),
                gpu: acc.gpu.max(resource.gpu),
                mem: acc.mem.max(resource.mem),
                owner: None,
            });
        let cluster = ComputeResource::new(
            largest.cpu.saturating_mul(self.max_workers),
            largest.gpu.saturating_mul(self.max_workers),
            largest.mem.saturating_mul(self.max_workers as u64),
        );

        let mut result = ValidatedJobs::default();
        for job in jobs {
            let rule = get_allocation_rule(self.queue.as_ref(), &job).await?;
            let resource = job.resource();
            let valid = if rule.is_fractional() {
                resource.fits_into(&cluster)
            } else {
                instances
                    .iter()
                    .any(|instance| resource.fits_into(&instance.resource()))
            };
            if valid {
                result.valid.push(job);
            } else {
                log::warn!(
                    "Job {} ({}) requests {resource} which exceeds the capacity of the cluster",
                    job.id,
                    job.name
                );
                result.invalid.push(job);
            }
        }
        Ok(result)
    }
}

/// Discards jobs whose custom resource requirements cannot be met by the cluster-wide supply.
pub struct CustomResourceFilter {
    queue: Rc<dyn QueueBackend>,
    /// Names of custom resources that are taken into account.
    names: Vec<String>,
}

impl CustomResourceFilter {
    pub fn new(queue: Rc<dyn QueueBackend>, names: Vec<String>) -> Self {
        Self { queue, names }
    }

    pub async fn filter(&self, jobs: Vec<Job>) -> ScaleResult<Vec<Job>> {
        if self.names.is_empty() {
            return Ok(jobs);
        }
        let mut supply = self.queue.list_global_supplies().await?;
        let mut result = Vec::with_capacity(jobs.len());
        for job in jobs {
            let Some(requirement) = self.job_requirement(&job) else {
                log::warn!("Job {} has a malformed custom resource request, skipping it", job.id);
                continue;
            };
            if requirement.is_empty() {
                result.push(job);
            } else if requirement.is_greater_than(&supply) {
                log::debug!(
                    "Custom resources of job {} cannot be satisfied at the moment: {:?}",
                    job.id,
                    job.requests
                );
            } else {
                supply = supply.subtract(&requirement);
                result.push(job);
            }
        }
        Ok(result)
    }

    fn job_requirement(&self, job: &Job) -> Option<CustomResource> {
        let mut values = Vec::new();
        for name in &self.names {
            if let Some(value) = job.requests.get(name) {
                let amount: f64 = value.trim().parse().ok()?;
                if amount < 0.0 {
                    return None;
                }
                values.push((name.clone(), amount.ceil() as u64));
            }
        }
        Some(CustomResource::new(values))
    }
}
