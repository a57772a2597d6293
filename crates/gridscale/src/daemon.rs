//! The autoscaling loop.
use std::future::Future;
use std::time::Duration;

use tokio::time::MissedTickBehavior;

use crate::cluster::Cluster;

/// Runs autoscaling cycles every `interval` until the process receives Ctrl-C.
pub async fn run_daemon(cluster: &Cluster, interval: Duration) {
    let shutdown = async {
        if let Err(error) = tokio::signal::ctrl_c().await {
            log::error!("Cannot listen for the shutdown signal: {error:?}");
            std::future::pending::<()>().await;
        }
    };
    let cycles = run_periodically(interval, move || run_cycle(cluster), shutdown).await;
    log::info!("Autoscaler stopped after {cycles} cycle(s)");
}

/// Calls `cycle` every `interval` until `shutdown` resolves. A running cycle is never
/// interrupted, the shutdown is noticed before the next one starts.
/// Returns the number of finished cycles.
pub async fn run_periodically<F, Fut, S>(interval: Duration, mut cycle: F, shutdown: S) -> u64
where
    F: FnMut() -> Fut,
    Fut: Future<Output = ()>,
    S: Future,
{
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    tokio::pin!(shutdown);

    let mut cycles = 0;
    loop {
        tokio::select! {
            biased;
            _ = &mut shutdown => {
                log::info!("Shutdown requested");
                break;
            }
            _ = ticker.tick() => {}
        }
        cycle().await;
        cycles += 1;
    }
    cycles
}

/// Removes invalid workers, then scales the cluster. Failures are logged, the next cycle
/// starts from scratch.
pub async fn run_cycle(cluster: &Cluster) {
    match cluster.validator.validate_hosts().await {
        Ok(removed) if !removed.is_empty() => {
            log::info!("Removed invalid worker(s): {}", removed.join(", "));
        }
        Ok(_) => {}
        Err(error) => log::error!("Worker validation failed: {error:?}"),
    }
    match cluster.autoscaler.scale().await {
        Ok(summary) => {
            if !summary.launched.is_empty() {
                log::info!("Launched worker(s): {}", summary.launched.join(", "));
            }
            if !summary.removed.is_empty() {
                log::info!("Removed idle worker(s): {}", summary.removed.join(", "));
            }
        }
        Err(error) => log::error!("Autoscaling cycle failed: {error:?}"),
    }
}
