use std::cmp::Ordering;
use std::fmt::{Display, Formatter};

use serde::{Deserialize, Serialize};

use crate::demand::Demand;
use crate::resource::{ComputeResource, Cpu, Gpu, Memory};

/// Cloud instance type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Instance {
    pub name: String,
    pub cpu: Cpu,
    pub gpu: Gpu,
    pub mem: Memory,
    /// Hourly price, used only to break ties between otherwise equal instance types.
    #[serde(default)]
    pub price: f64,
}

impl Instance {
    pub fn new(name: impl Into<String>, cpu: Cpu, gpu: Gpu, mem: Memory) -> Self {
        Self {
            name: name.into(),
            cpu,
            gpu,
            mem,
            price: 0.0,
        }
    }

    pub fn resource(&self) -> ComputeResource {
        ComputeResource::new(self.cpu, self.gpu, self.mem)
    }

    fn size_cmp(&self, other: &Instance) -> Ordering {
        self.cpu
            .cmp(&other.cpu)
            .then(self.mem.cmp(&other.mem))
            .then(self.gpu.cmp(&other.gpu))
            .then(self.price.total_cmp(&other.price))
    }
}

impl Display for Instance {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} (cpu={} gpu={} mem={}G)",
            self.name, self.cpu, self.gpu, self.mem
        )
    }
}

/// Which instance types may be launched.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InstanceSource {
    /// Always launch the same instance type.
    Fixed(String),
    /// Launch any instance type of the family (hybrid mode), optionally limited in size.
    Family {
        family: String,
        max_cpu: Option<Cpu>,
    },
}

impl InstanceSource {
    /// Filters the instance types allowed by the cloud platform down to the launch candidates.
    /// Candidates are sorted from the smallest to the largest.
    pub fn candidates(&self, allowed: Vec<Instance>) -> Vec<Instance> {
        let mut candidates: Vec<Instance> = allowed
            .into_iter()
            .filter(|instance| match self {
                InstanceSource::Fixed(name) => &instance.name == name,
                InstanceSource::Family { family, max_cpu } => {
                    is_instance_of_family(&instance.name, family)
                        && max_cpu.is_none_or(|max| instance.cpu <= max)
                }
            })
            .collect();
        candidates.sort_by(|a, b| a.size_cmp(b));
        candidates
    }
}

fn is_instance_of_family(name: &str, family: &str) -> bool {
    name.strip_prefix(family)
        .and_then(|rest| rest.chars().next())
        .is_some_and(|separator| matches!(separator, '.' | '-' | '_'))
}

/// A single worker that should be launched.
#[derive(Debug, Clone, PartialEq)]
pub struct InstanceDemand {
    pub instance: Instance,
    pub owner: Option<String>,
}

/// Packs demands into instances.
///
/// In every step, the instance type that fulfils the most requested CPUs of the remaining
/// demands is chosen, then the one that takes the most demands (the smaller type wins a tie).
/// Integral demands are only packed into an instance that can hold them whole, fractional
/// demands may be split among several instances. Demands without any requested resources fit
/// into every instance type.
pub struct CpuCapacityInstanceSelector;

struct Packing {
    fulfilled_cpu: u64,
    packed: usize,
    owner: Option<String>,
    remaining: Vec<Demand>,
}

impl CpuCapacityInstanceSelector {
    /// `instances` are the launch candidates sorted from the smallest to the largest.
    pub fn select(&self, demands: Vec<Demand>, instances: &[Instance]) -> Vec<InstanceDemand> {
        let mut remaining = demands;
        let mut selected = Vec::new();

        while !remaining.is_empty() {
            let mut best: Option<(&Instance, Packing)> = None;
            for instance in instances {
                let packing = pack(instance, &remaining);
                let better = match &best {
                    Some((_, current)) => {
                        (packing.fulfilled_cpu, packing.packed) > (current.fulfilled_cpu, current.packed)
                    }
                    None => packing.packed > 0,
                };
                if better {
                    best = Some((instance, packing));
                }
            }

            match best {
                Some((instance, packing)) => {
                    log::debug!(
                        "Selected instance {instance} fulfilling {} cpu(s) for owner {:?}",
                        packing.fulfilled_cpu,
                        packing.owner
                    );
                    selected.push(InstanceDemand {
                        instance: instance.clone(),
                        owner: packing.owner,
                    });
                    remaining = packing.remaining;
                }
                None => {
                    log::warn!(
                        "{} demand(s) cannot be satisfied by any of {} instance type(s): {:?}",
                        remaining.len(),
                        instances.len(),
                        remaining
                    );
                    break;
                }
            }
        }
        selected
    }
}

fn pack(instance: &Instance, demands: &[Demand]) -> Packing {
    let mut capacity = instance.resource();
    let mut fulfilled_cpu = 0;
    let mut packed = 0;
    let mut owner = None;
    let mut remaining = Vec::with_capacity(demands.len());

    for demand in demands {
        match demand {
            Demand::Integral(resource) => {
                if resource.fits_into(&capacity) {
                    capacity = capacity.subtract(resource);
                    fulfilled_cpu += resource.cpu as u64;
                    packed += 1;
                    owner = owner.or_else(|| resource.owner.clone());
                } else {
                    remaining.push(demand.clone());
                }
            }
            Demand::Fractional(resource) if resource.is_empty() => {
                packed += 1;
                owner = owner.or_else(|| resource.owner.clone());
            }
            Demand::Fractional(resource) => {
                let left = resource.subtract(&capacity);
                let consumed = resource.subtract(&left);
                if consumed.is_empty() {
                    remaining.push(demand.clone());
                    continue;
                }
                capacity = capacity.subtract(&consumed);
                fulfilled_cpu += consumed.cpu as u64;
                packed += 1;
                owner = owner.or_else(|| resource.owner.clone());
                if !left.is_empty() {
                    remaining.push(Demand::Fractional(left));
                }
            }
        }
    }

    Packing {
        fulfilled_cpu,
        packed,
        owner,
        remaining,
    }
}
