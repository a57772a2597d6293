//! Sun Grid Engine queue backend.
//!
//! All queries and mutations go through the Grid Engine command line tools of the master host.
use std::cell::RefCell;

use anyhow::Context;
use gridcore::backend::{BackendFuture, QueueBackend};
use gridcore::common::{Map, Set};
use gridcore::job::{AllocationRule, Job};
use gridcore::resource::{ComputeResource, Cpu, CustomResource, Memory, ResourceSupply};
use gridcore::ScaleResult;

use crate::backend::command::CommandRunner;
use crate::backend::sge::output::{
    QstatReport, parse_allocation_rule, parse_complex_values, parse_qhost, parse_qstat,
    qconf_attribute,
};

pub mod output;

#[derive(Debug, Clone)]
pub struct SgeConfig {
    /// Queue whose hosts are managed, e.g. `main.q`.
    pub queue: String,
    /// Host group that workers are members of, e.g. `@allhosts`.
    pub hostlist: String,
    /// Parallel environments whose slot counts follow the cluster size.
    pub parallel_environments: Vec<String>,
}

pub struct SgeQueueBackend {
    runner: CommandRunner,
    config: SgeConfig,
    allocation_rules: RefCell<Map<String, AllocationRule>>,
}

impl SgeQueueBackend {
    pub fn new(runner: CommandRunner, config: SgeConfig) -> Self {
        Self {
            runner,
            config,
            allocation_rules: Default::default(),
        }
    }

    fn queue_instance(&self, host: &str) -> String {
        format!("{}@{host}", self.config.queue)
    }

    async fn qstat(&self) -> ScaleResult<QstatReport> {
        let output = self
            .runner
            .run(&["qstat", "-u", "*", "-r", "-f", "-q", self.config.queue.as_str()])
            .await?;
        parse_qstat(&output, &self.config.queue)
    }

    async fn execution_hosts(&self) -> ScaleResult<Set<String>> {
        let output = self.runner.run(&["qconf", "-sel"]).await?;
        Ok(output
            .lines()
            .map(|line| line.trim().to_string())
            .filter(|line| !line.is_empty())
            .collect())
    }

    async fn pe_slots(&self, pe: &str) -> ScaleResult<Cpu> {
        let output = self.runner.run(&["qconf", "-sp", pe]).await?;
        let slots = qconf_attribute(&output, "slots")
            .ok_or_else(|| anyhow::anyhow!("Missing slots in configuration of PE {pe}"))?;
        slots
            .parse()
            .with_context(|| format!("Invalid slot count {slots} of PE {pe}"))
    }

    async fn run_ignoring_missing(&self, arguments: &[&str]) -> ScaleResult<()> {
        if let Err(error) = self.runner.run(arguments).await {
            let message = format!("{error:?}");
            if message.contains("does not exist") || message.contains("not an execution host") {
                log::debug!("`{}` has nothing to remove", arguments.join(" "));
                return Ok(());
            }
            return Err(error);
        }
        Ok(())
    }
}

impl QueueBackend for SgeQueueBackend {
    fn list_jobs(&self) -> BackendFuture<'_, Vec<Job>> {
        Box::pin(async move { Ok(self.qstat().await?.jobs) })
    }

    fn list_host_supplies(&self) -> BackendFuture<'_, Vec<ResourceSupply>> {
        Box::pin(async move {
            let report = self.qstat().await?;
            let output = self.runner.run(&["qhost", "-F", "gpus,mem_free"]).await?;
            let hosts: Map<String, _> = parse_qhost(&output)?
                .into_iter()
                .map(|host| (host.host.clone(), host))
                .collect();
            Ok(report
                .instances
                .iter()
                .filter(|instance| !instance.is_disabled() && !instance.is_broken())
                .map(|instance| {
                    let host = hosts.get(&instance.host);
                    let gpu = host
                        .and_then(|host| host.value("gpus"))
                        .map(|gpus| gpus.floor() as u32)
                        .unwrap_or(0);
                    let mem = host
                        .and_then(|host| host.value("mem_free").or(Some(host.mem_total)))
                        .map(|mem| mem.floor() as Memory)
                        .unwrap_or(0);
                    ResourceSupply::new(
                        instance.host.clone(),
                        ComputeResource::new(instance.free_slots(), gpu, mem),
                    )
                })
                .collect())
        })
    }

    fn list_global_supplies(&self) -> BackendFuture<'_, CustomResource> {
        Box::pin(async move {
            let output = self.runner.run(&["qconf", "-se", "global"]).await?;
            Ok(parse_complex_values(&output))
        })
    }

    fn get_allocation_rule<'a>(&'a self, pe: &'a str) -> BackendFuture<'a, AllocationRule> {
        Box::pin(async move {
            let cached = self.allocation_rules.borrow().get(pe).copied();
            if let Some(rule) = cached {
                return Ok(rule);
            }
            let output = self.runner.run(&["qconf", "-sp", pe]).await?;
            let rule = parse_allocation_rule(&output)
                .with_context(|| format!("Cannot determine allocation rule of PE {pe}"))?;
            log::debug!("PE {pe} has allocation rule {rule:?}");
            self.allocation_rules.borrow_mut().insert(pe.to_string(), rule);
            Ok(rule)
        })
    }

    fn enable_host<'a>(&'a self, host: &'a str) -> BackendFuture<'a, ()> {
        Box::pin(async move {
            self.runner
                .run(&["qmod", "-e", self.queue_instance(host).as_str()])
                .await?;
            Ok(())
        })
    }

    fn disable_host<'a>(&'a self, host: &'a str) -> BackendFuture<'a, ()> {
        Box::pin(async move {
            self.runner
                .run(&["qmod", "-d", self.queue_instance(host).as_str()])
                .await?;
            Ok(())
        })
    }

    fn delete_host<'a>(&'a self, host: &'a str) -> BackendFuture<'a, ()> {
        Box::pin(async move {
            let instance = self.queue_instance(host);
            self.run_ignoring_missing(&[
                "qconf",
                "-dattr",
                "hostgroup",
                "hostlist",
                host,
                self.config.hostlist.as_str(),
            ])
            .await?;
            self.run_ignoring_missing(&["qconf", "-purge", "queue", "slots", instance.as_str()])
                .await?;
            self.run_ignoring_missing(&["qconf", "-de", host]).await?;
            self.run_ignoring_missing(&["qconf", "-dh", host]).await?;
            Ok(())
        })
    }

    fn kill_jobs<'a>(&'a self, jobs: &'a [Job], force: bool) -> BackendFuture<'a, ()> {
        Box::pin(async move {
            if jobs.is_empty() {
                return Ok(());
            }
            let mut arguments = vec!["qdel"];
            if force {
                arguments.push("-f");
            }
            arguments.extend(jobs.iter().map(|job| job.id.as_str()));
            self.runner.run(&arguments).await?;
            Ok(())
        })
    }

    fn is_valid_host<'a>(&'a self, host: &'a str) -> BackendFuture<'a, bool> {
        Box::pin(async move {
            if !self.execution_hosts().await?.contains(host) {
                log::debug!("Host {host} is not an execution host");
                return Ok(false);
            }
            let report = self.qstat().await?;
            match report.instances.iter().find(|instance| instance.host == host) {
                Some(instance) if instance.is_broken() => {
                    log::debug!("Queue instance of host {host} has states {}", instance.states);
                    Ok(false)
                }
                Some(_) => Ok(true),
                None => {
                    log::debug!("Host {host} has no instance of queue {}", self.config.queue);
                    Ok(false)
                }
            }
        })
    }

    fn get_host_capacity<'a>(&'a self, host: &'a str) -> BackendFuture<'a, ComputeResource> {
        Box::pin(async move {
            let output = self.runner.run(&["qhost", "-F", "gpus", "-h", host]).await?;
            let entry = parse_qhost(&output)?
                .into_iter()
                .find(|entry| entry.host == host)
                .ok_or_else(|| anyhow::anyhow!("Host {host} was not found by qhost"))?;
            Ok(ComputeResource::new(
                entry.cpu,
                entry.value("gpus").map(|gpus| gpus.floor() as u32).unwrap_or(0),
                entry.mem_total.floor() as Memory,
            ))
        })
    }

    fn decrease_slots(&self, slots: Cpu) -> BackendFuture<'_, ()> {
        Box::pin(async move {
            for pe in &self.config.parallel_environments {
                let current = self.pe_slots(pe).await?;
                let updated = current.saturating_sub(slots);
                log::debug!("Decreasing slots of PE {pe} from {current} to {updated}");
                let updated = updated.to_string();
                self.runner
                    .run(&["qconf", "-mattr", "pe", "slots", updated.as_str(), pe.as_str()])
                    .await?;
            }
            Ok(())
        })
    }
}
