//! Implementation of the command line subcommands.
use std::fmt::Write;

use gridcore::autoscaler::ScalePlan;
use gridcore::demand::Demand;
use gridcore::host::file_host_storage;

use crate::cluster::create_cluster;
use crate::common::cli::{CheckOpts, HostsCommand, HostsOpts, RunOpts};
use crate::daemon::run_daemon;

pub async fn command_run(opts: RunOpts) -> crate::Result<()> {
    let interval = opts.update_interval.unpack();
    let cluster = create_cluster(opts.autoscale)?;
    let workers = cluster.storage.load_hosts()?;
    log::info!(
        "Starting autoscaler with {} tracked worker(s), cycle interval {}",
        workers.len(),
        humantime::format_duration(interval)
    );
    run_daemon(&cluster, interval).await;
    Ok(())
}

pub async fn command_check(opts: CheckOpts) -> crate::Result<()> {
    let cluster = create_cluster(opts.autoscale)?;
    let plan = cluster.autoscaler.plan().await?;
    print!("{}", format_plan(&plan));
    Ok(())
}

pub fn command_hosts(opts: HostsOpts) -> crate::Result<()> {
    let storage = file_host_storage(&opts.storage.host_storage);
    match opts.subcmd {
        HostsCommand::List => {
            for host in storage.load_hosts()? {
                println!("{host}");
            }
        }
        HostsCommand::Add(arg) => {
            storage.add_host(&arg.host)?;
            log::info!("Host {} was stored", arg.host);
        }
        HostsCommand::Remove(arg) => {
            storage.remove_host(&arg.host)?;
            log::info!("Host {} was removed from the storage", arg.host);
        }
        HostsCommand::Clear => {
            storage.clear()?;
            log::info!("Host storage was cleared");
        }
    }
    Ok(())
}

pub fn format_plan(plan: &ScalePlan) -> String {
    let mut output = String::new();
    let _ = writeln!(
        output,
        "Jobs: {} ({} pending), workers: {}",
        plan.jobs.len(),
        plan.pending,
        plan.workers.len()
    );
    for job in &plan.invalid_jobs {
        let _ = writeln!(
            output,
            "Invalid job {} ({}) of {}: {}",
            job.id,
            job.name,
            job.user,
            job.resource()
        );
    }
    if plan.demands.is_empty() {
        let _ = writeln!(output, "No unsatisfied demand");
    }
    for demand in &plan.demands {
        let kind = match demand {
            Demand::Integral(_) => "integral",
            Demand::Fractional(_) => "fractional",
        };
        let _ = writeln!(output, "Demand ({kind}): {}", demand.resource());
    }
    for launch in &plan.launches {
        let owner = launch.owner.as_deref().unwrap_or("default owner");
        let _ = writeln!(output, "Launch {} for {owner}", launch.instance);
    }
    output
}
