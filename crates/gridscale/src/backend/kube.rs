//! Kubernetes cluster used as a job queue: pods are jobs and nodes are hosts.
use std::time::SystemTime;

use anyhow::Context;
use gridcore::ScaleResult;
use gridcore::backend::{BackendFuture, QueueBackend};
use gridcore::common::Map;
use gridcore::job::{AllocationRule, Job, JobState};
use gridcore::resource::{ComputeResource, Cpu, CustomResource, ResourceSupply};
use serde::Deserialize;

use crate::backend::command::CommandRunner;

const GPU_RESOURCE: &str = "nvidia.com/gpu";
const GIB: f64 = 1024.0 * 1024.0 * 1024.0;

#[derive(Debug, Deserialize)]
struct ItemList<T> {
    items: Vec<T>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Metadata {
    name: String,
    creation_timestamp: Option<chrono::DateTime<chrono::Utc>>,
    #[serde(default)]
    labels: Map<String, String>,
}

#[derive(Debug, Default, Deserialize)]
struct Resources {
    #[serde(default)]
    requests: Map<String, String>,
}

#[derive(Debug, Deserialize)]
struct Container {
    #[serde(default)]
    resources: Resources,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PodSpec {
    node_name: Option<String>,
    #[serde(default)]
    containers: Vec<Container>,
}

#[derive(Debug, Default, Deserialize)]
struct PodStatus {
    phase: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Pod {
    metadata: Metadata,
    spec: PodSpec,
    #[serde(default)]
    status: PodStatus,
}

#[derive(Debug, Default, Deserialize)]
struct NodeSpec {
    #[serde(default)]
    unschedulable: bool,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct NodeCondition {
    #[serde(rename = "type")]
    kind: String,
    status: String,
}

#[derive(Debug, Default, Deserialize)]
struct NodeStatus {
    #[serde(default)]
    capacity: Map<String, String>,
    #[serde(default)]
    allocatable: Map<String, String>,
    #[serde(default)]
    conditions: Vec<NodeCondition>,
}

#[derive(Debug, Deserialize)]
struct Node {
    metadata: Metadata,
    #[serde(default)]
    spec: NodeSpec,
    #[serde(default)]
    status: NodeStatus,
}

impl Node {
    fn is_ready(&self) -> bool {
        self.status
            .conditions
            .iter()
            .any(|condition| condition.kind == "Ready" && condition.status == "True")
    }
}

/// Sum of resource requests of all containers, in raw units (millicores, bytes, devices).
#[derive(Debug, Default, Clone, Copy, PartialEq)]
struct Requests {
    cpu_millis: u64,
    gpu: u64,
    mem_bytes: f64,
}

impl Requests {
    fn from_map(values: &Map<String, String>) -> Self {
        Self {
            cpu_millis: values.get("cpu").and_then(|v| parse_cpu_millis(v)).unwrap_or(0),
            gpu: values
                .get(GPU_RESOURCE)
                .and_then(|v| v.parse().ok())
                .unwrap_or(0),
            mem_bytes: values
                .get("memory")
                .and_then(|v| parse_memory_bytes(v))
                .unwrap_or(0.0),
        }
    }

    fn add(self, other: Requests) -> Requests {
        Requests {
            cpu_millis: self.cpu_millis + other.cpu_millis,
            gpu: self.gpu + other.gpu,
            mem_bytes: self.mem_bytes + other.mem_bytes,
        }
    }

    /// Demanded resources are rounded up.
    fn to_demand(self) -> ComputeResource {
        ComputeResource::new(
            self.cpu_millis.div_ceil(1000) as Cpu,
            self.gpu as u32,
            (self.mem_bytes / GIB).ceil() as u64,
        )
    }

    /// Supplied resources are rounded down.
    fn to_supply(self) -> ComputeResource {
        ComputeResource::new(
            (self.cpu_millis / 1000) as Cpu,
            self.gpu as u32,
            (self.mem_bytes / GIB).floor() as u64,
        )
    }
}

impl Pod {
    fn requests(&self) -> Requests {
        self.spec
            .containers
            .iter()
            .map(|container| Requests::from_map(&container.resources.requests))
            .fold(Requests::default(), Requests::add)
    }

    fn state(&self) -> Option<JobState> {
        match self.status.phase.as_deref() {
            Some("Pending") => Some(JobState::Pending),
            Some("Running") => Some(JobState::Running),
            Some("Succeeded" | "Failed") => None,
            _ => Some(JobState::Unknown),
        }
    }

    fn into_job(self) -> Option<Job> {
        let state = self.state()?;
        let resource = self.requests().to_demand();
        let user = self
            .metadata
            .labels
            .get("owner")
            .cloned()
            .unwrap_or_default();
        let submit_time = self
            .metadata
            .creation_timestamp
            .map(SystemTime::from)
            .unwrap_or_else(SystemTime::now);
        Some(Job {
            id: self.metadata.name.clone(),
            root_id: self.metadata.name.clone(),
            name: self.metadata.name,
            user,
            state,
            submit_time,
            pe: None,
            cpu: resource.cpu,
            gpu: resource.gpu,
            mem: resource.mem,
            hosts: self.spec.node_name.into_iter().collect(),
            requests: Map::default(),
        })
    }
}

/// `500m` or `2` (cores) in millicores.
fn parse_cpu_millis(value: &str) -> Option<u64> {
    match value.strip_suffix('m') {
        Some(millis) => millis.parse().ok(),
        None => value.parse::<f64>().ok().map(|cores| (cores * 1000.0).ceil() as u64),
    }
}

/// Kubernetes memory quantity (`512Mi`, `2Gi`, `1G`, `1048576`) in bytes.
fn parse_memory_bytes(value: &str) -> Option<f64> {
    const SUFFIXES: [(&str, f64); 8] = [
        ("Ki", 1024.0),
        ("Mi", 1024.0 * 1024.0),
        ("Gi", GIB),
        ("Ti", GIB * 1024.0),
        ("k", 1e3),
        ("M", 1e6),
        ("G", 1e9),
        ("T", 1e12),
    ];
    for (suffix, multiplier) in SUFFIXES {
        if let Some(number) = value.strip_suffix(suffix) {
            return number.parse::<f64>().ok().map(|n| n * multiplier);
        }
    }
    value.parse().ok()
}

fn parse_pods(output: &str) -> ScaleResult<Vec<Pod>> {
    let list: ItemList<Pod> =
        serde_json::from_str(output).context("Cannot parse kubectl pod list")?;
    Ok(list.items)
}

fn parse_nodes(output: &str) -> ScaleResult<Vec<Node>> {
    let list: ItemList<Node> =
        serde_json::from_str(output).context("Cannot parse kubectl node list")?;
    Ok(list.items)
}

/// Free capacity of schedulable ready nodes: allocatable resources minus requests of the pods
/// assigned to them.
fn node_supplies(nodes: &[Node], pods: &[Pod]) -> Vec<ResourceSupply> {
    let mut used: Map<&str, Requests> = Map::default();
    for pod in pods {
        if !matches!(pod.state(), Some(JobState::Running | JobState::Pending)) {
            continue;
        }
        if let Some(node) = &pod.spec.node_name {
            let entry = used.entry(node.as_str()).or_default();
            *entry = entry.add(pod.requests());
        }
    }
    nodes
        .iter()
        .filter(|node| !node.spec.unschedulable && node.is_ready())
        .map(|node| {
            let allocatable = Requests::from_map(&node.status.allocatable);
            let used = used
                .get(node.metadata.name.as_str())
                .copied()
                .unwrap_or_default();
            let free = Requests {
                cpu_millis: allocatable.cpu_millis.saturating_sub(used.cpu_millis),
                gpu: allocatable.gpu.saturating_sub(used.gpu),
                mem_bytes: (allocatable.mem_bytes - used.mem_bytes).max(0.0),
            };
            ResourceSupply::new(node.metadata.name.clone(), free.to_supply())
        })
        .collect()
}

pub struct KubeQueueBackend {
    runner: CommandRunner,
    namespace: String,
}

impl KubeQueueBackend {
    pub fn new(runner: CommandRunner, namespace: String) -> Self {
        Self { runner, namespace }
    }

    async fn pods(&self) -> ScaleResult<Vec<Pod>> {
        let output = self
            .runner
            .run(&["kubectl", "get", "pods", "-n", self.namespace.as_str(), "-o", "json"])
            .await?;
        parse_pods(&output)
    }

    async fn nodes(&self) -> ScaleResult<Vec<Node>> {
        let output = self
            .runner
            .run(&["kubectl", "get", "nodes", "-o", "json"])
            .await?;
        parse_nodes(&output)
    }

    async fn node(&self, host: &str) -> ScaleResult<Option<Node>> {
        Ok(self
            .nodes()
            .await?
            .into_iter()
            .find(|node| node.metadata.name == host))
    }
}

impl QueueBackend for KubeQueueBackend {
    fn list_jobs(&self) -> BackendFuture<'_, Vec<Job>> {
        Box::pin(async move {
            let mut pods = self.pods().await?;
            pods.sort_by_key(|pod| pod.metadata.creation_timestamp);
            Ok(pods.into_iter().filter_map(Pod::into_job).collect())
        })
    }

    fn list_host_supplies(&self) -> BackendFuture<'_, Vec<ResourceSupply>> {
        Box::pin(async move {
            let nodes = self.nodes().await?;
            let pods = self.pods().await?;
            Ok(node_supplies(&nodes, &pods))
        })
    }

    fn list_global_supplies(&self) -> BackendFuture<'_, CustomResource> {
        Box::pin(async move { Ok(CustomResource::default()) })
    }

    fn get_allocation_rule<'a>(&'a self, _pe: &'a str) -> BackendFuture<'a, AllocationRule> {
        // A pod always runs on a single node
        Box::pin(async move { Ok(AllocationRule::PeSlots) })
    }

    fn enable_host<'a>(&'a self, host: &'a str) -> BackendFuture<'a, ()> {
        Box::pin(async move {
            self.runner.run(&["kubectl", "uncordon", host]).await?;
            Ok(())
        })
    }

    fn disable_host<'a>(&'a self, host: &'a str) -> BackendFuture<'a, ()> {
        Box::pin(async move {
            self.runner.run(&["kubectl", "cordon", host]).await?;
            Ok(())
        })
    }

    fn delete_host<'a>(&'a self, host: &'a str) -> BackendFuture<'a, ()> {
        Box::pin(async move {
            self.runner
                .run(&["kubectl", "delete", "node", host, "--ignore-not-found"])
                .await?;
            Ok(())
        })
    }

    fn kill_jobs<'a>(&'a self, jobs: &'a [Job], force: bool) -> BackendFuture<'a, ()> {
        Box::pin(async move {
            if jobs.is_empty() {
                return Ok(());
            }
            let mut arguments = vec!["kubectl", "delete", "pod", "-n", self.namespace.as_str()];
            arguments.extend(jobs.iter().map(|job| job.id.as_str()));
            if force {
                arguments.extend(["--force", "--grace-period=0"]);
            }
            self.runner.run(&arguments).await?;
            Ok(())
        })
    }

    fn is_valid_host<'a>(&'a self, host: &'a str) -> BackendFuture<'a, bool> {
        Box::pin(async move {
            Ok(match self.node(host).await? {
                Some(node) => node.is_ready(),
                None => false,
            })
        })
    }

    fn get_host_capacity<'a>(&'a self, host: &'a str) -> BackendFuture<'a, ComputeResource> {
        Box::pin(async move {
            let node = self
                .node(host)
                .await?
                .ok_or_else(|| anyhow::anyhow!("Node {host} does not exist"))?;
            Ok(Requests::from_map(&node.status.capacity).to_supply())
        })
    }

    fn decrease_slots(&self, _slots: Cpu) -> BackendFuture<'_, ()> {
        // Kubernetes has no slot limit
        Box::pin(async move { Ok(()) })
    }
}

#[cfg(test)]
mod tests {
    use super::{node_supplies, parse_cpu_millis, parse_memory_bytes, parse_nodes, parse_pods};
    use gridcore::job::JobState;
    use gridcore::resource::ComputeResource;

    const PODS: &str = r#"{
      "items": [
        {
          "metadata": {"name": "job-1", "creationTimestamp": "2026-10-18T10:00:00Z", "labels": {"owner": "alice"}},
          "spec": {"nodeName": "pipeline-1", "containers": [
            {"resources": {"requests": {"cpu": "1500m", "memory": "2Gi"}}},
            {"resources": {"requests": {"cpu": "500m", "memory": "512Mi"}}}
          ]},
          "status": {"phase": "Running"}
        },
        {
          "metadata": {"name": "job-2", "creationTimestamp": "2026-10-18T10:01:00Z"},
          "spec": {"containers": [{"resources": {"requests": {"cpu": "3", "nvidia.com/gpu": "1"}}}]},
          "status": {"phase": "Pending"}
        },
        {
          "metadata": {"name": "job-0"},
          "spec": {"nodeName": "pipeline-1", "containers": [{"resources": {"requests": {"cpu": "8"}}}]},
          "status": {"phase": "Succeeded"}
        }
      ]
    }"#;

    const NODES: &str = r#"{
      "items": [
        {
          "metadata": {"name": "pipeline-1"},
          "status": {
            "capacity": {"cpu": "4", "memory": "16Gi"},
            "allocatable": {"cpu": "3800m", "memory": "15Gi"},
            "conditions": [{"type": "Ready", "status": "True"}]
          }
        },
        {
          "metadata": {"name": "pipeline-2"},
          "spec": {"unschedulable": true},
          "status": {"allocatable": {"cpu": "4"}, "conditions": [{"type": "Ready", "status": "True"}]}
        },
        {
          "metadata": {"name": "pipeline-3"},
          "status": {"allocatable": {"cpu": "4"}, "conditions": [{"type": "Ready", "status": "False"}]}
        }
      ]
    }"#;

    #[test]
    fn pods_to_jobs() {
        let jobs: Vec<_> = parse_pods(PODS)
            .unwrap()
            .into_iter()
            .filter_map(|pod| pod.into_job())
            .collect();
        assert_eq!(jobs.len(), 2);
        assert_eq!(jobs[0].state, JobState::Running);
        assert_eq!(jobs[0].user, "alice");
        assert_eq!(jobs[0].cpu, 2);
        assert_eq!(jobs[0].mem, 3);
        assert_eq!(jobs[0].hosts, vec!["pipeline-1"]);
        assert_eq!(jobs[1].state, JobState::Pending);
        assert_eq!(jobs[1].cpu, 3);
        assert_eq!(jobs[1].gpu, 1);
        assert!(jobs[1].hosts.is_empty());
    }

    #[test]
    fn supplies_of_ready_nodes() {
        let pods = parse_pods(PODS).unwrap();
        let nodes = parse_nodes(NODES).unwrap();
        let supplies = node_supplies(&nodes, &pods);
        assert_eq!(supplies.len(), 1);
        assert_eq!(supplies[0].host, "pipeline-1");
        assert_eq!(supplies[0].resource, ComputeResource::new(1, 0, 12));
        assert!(nodes[0].is_ready());
        assert!(!nodes[2].is_ready());
    }

    #[test]
    fn parse_quantities() {
        assert_eq!(parse_cpu_millis("250m"), Some(250));
        assert_eq!(parse_cpu_millis("2"), Some(2000));
        assert_eq!(parse_cpu_millis("0.5"), Some(500));
        assert_eq!(parse_memory_bytes("1Ki"), Some(1024.0));
        assert_eq!(parse_memory_bytes("2G"), Some(2e9));
        assert_eq!(parse_memory_bytes("100"), Some(100.0));
        assert_eq!(parse_memory_bytes("lots"), None);
    }
}
