use std::fmt::{Display, Formatter};

use serde::{Deserialize, Serialize};

use crate::common::Map;

pub type Cpu = u32;
pub type Gpu = u32;
/// Memory in GiB.
pub type Memory = u64;

/// Amount of compute resources, used both for demand (what jobs want) and for supply (what hosts
/// and instances provide).
///
/// Values are never mutated in place, arithmetic produces new values.
/// Subtraction is clamped to zero in every dimension.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ComputeResource {
    pub cpu: Cpu,
    pub gpu: Gpu,
    pub mem: Memory,
    pub owner: Option<String>,
}

impl ComputeResource {
    pub fn new(cpu: Cpu, gpu: Gpu, mem: Memory) -> Self {
        Self {
            cpu,
            gpu,
            mem,
            owner: None,
        }
    }

    pub fn cpu(cpu: Cpu) -> Self {
        Self::new(cpu, 0, 0)
    }

    pub fn zero() -> Self {
        Self::default()
    }

    pub fn with_owner(mut self, owner: impl Into<String>) -> Self {
        self.owner = Some(owner.into());
        self
    }

    pub fn add(&self, other: &ComputeResource) -> ComputeResource {
        ComputeResource {
            cpu: self.cpu.saturating_add(other.cpu),
            gpu: self.gpu.saturating_add(other.gpu),
            mem: self.mem.saturating_add(other.mem),
            owner: self.owner.clone().or_else(|| other.owner.clone()),
        }
    }

    pub fn subtract(&self, other: &ComputeResource) -> ComputeResource {
        ComputeResource {
            cpu: self.cpu.saturating_sub(other.cpu),
            gpu: self.gpu.saturating_sub(other.gpu),
            mem: self.mem.saturating_sub(other.mem),
            owner: self.owner.clone(),
        }
    }

    /// Returns true if at least one dimension of `self` strictly exceeds the same dimension of
    /// `other`, i.e. `self` cannot be satisfied by `other`.
    pub fn is_greater_than(&self, other: &ComputeResource) -> bool {
        self.cpu > other.cpu || self.gpu > other.gpu || self.mem > other.mem
    }

    /// Returns true if `capacity` can satisfy `self` in every dimension.
    pub fn fits_into(&self, capacity: &ComputeResource) -> bool {
        !self.is_greater_than(capacity)
    }

    pub fn is_empty(&self) -> bool {
        self.cpu == 0 && self.gpu == 0 && self.mem == 0
    }

    pub fn sum<'a>(resources: impl IntoIterator<Item = &'a ComputeResource>) -> ComputeResource {
        resources
            .into_iter()
            .fold(ComputeResource::zero(), |acc, resource| acc.add(resource))
    }
}

impl Display for ComputeResource {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "cpu={} gpu={} mem={}G", self.cpu, self.gpu, self.mem)?;
        if let Some(owner) = &self.owner {
            write!(f, " owner={owner}")?;
        }
        Ok(())
    }
}

/// Free capacity of a single host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceSupply {
    pub host: String,
    pub resource: ComputeResource,
}

impl ResourceSupply {
    pub fn new(host: impl Into<String>, resource: ComputeResource) -> Self {
        Self {
            host: host.into(),
            resource,
        }
    }
}

/// Amounts of arbitrary named resources (licenses, GPU classes, ...).
/// A missing dimension is treated as zero.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CustomResource {
    values: Map<String, u64>,
}

impl CustomResource {
    pub fn new(values: impl IntoIterator<Item = (String, u64)>) -> Self {
        Self {
            values: values.into_iter().collect(),
        }
    }

    pub fn get(&self, name: &str) -> u64 {
        self.values.get(name).copied().unwrap_or(0)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.values.keys().map(|name| name.as_str())
    }

    pub fn add(&self, other: &CustomResource) -> CustomResource {
        let mut values = self.values.clone();
        for (name, amount) in &other.values {
            let value = values.entry(name.clone()).or_default();
            *value = value.saturating_add(*amount);
        }
        CustomResource { values }
    }

    pub fn subtract(&self, other: &CustomResource) -> CustomResource {
        let values = self
            .values
            .iter()
            .map(|(name, amount)| (name.clone(), amount.saturating_sub(other.get(name))))
            .collect();
        CustomResource { values }
    }

    pub fn is_greater_than(&self, other: &CustomResource) -> bool {
        self.values
            .iter()
            .any(|(name, amount)| *amount > other.get(name))
    }

    pub fn is_empty(&self) -> bool {
        self.values.values().all(|amount| *amount == 0)
    }
}
