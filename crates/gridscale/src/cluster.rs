//! Construction of the autoscaler handler graph from command line options.
use std::rc::Rc;

use gridcore::autoscaler::{AutoscalerConfig, GridEngineAutoscaler};
use gridcore::availability::{AvailabilityConfig, InstanceAvailabilityManager};
use gridcore::backend::{InstanceProvider, PriceType, QueueBackend};
use gridcore::common::retry::RetryPolicy;
use gridcore::event::EventManager;
use gridcore::host::{SharedHostStorage, file_host_storage};
use gridcore::hostsfile::ClusterHosts;
use gridcore::instance::InstanceSource;
use gridcore::scale::{ScaleDownHandler, ScaleUpConfig, ScaleUpHandler};
use gridcore::validator::{
    CompositeWorkerValidator, GracePeriodWorkerValidator, QueueWorkerValidator,
    RunStatusWorkerValidator, WorkerValidatorHandler,
};

use crate::backend::command::CommandRunner;
use crate::backend::kube::KubeQueueBackend;
use crate::backend::sge::{SgeConfig, SgeQueueBackend};
use crate::common::cli::{AutoscaleOpts, InstanceOpts, PriceTypeArg, QueueKind, QueueOpts};
use crate::common::error::GridScaleError;
use crate::pipeline::{ApiConfig, CloudPipelineClient};

/// Everything that runs in a single autoscaling cycle.
pub struct Cluster {
    pub autoscaler: GridEngineAutoscaler,
    pub validator: WorkerValidatorHandler,
    pub storage: SharedHostStorage,
}

pub fn create_cluster(opts: AutoscaleOpts) -> crate::Result<Cluster> {
    let config = autoscaler_config(&opts)?;
    config.validate()?;

    let storage = file_host_storage(&opts.storage.host_storage);
    let queue = create_queue_backend(&opts.queue);
    let provider: Rc<dyn InstanceProvider> = Rc::new(CloudPipelineClient::new(ApiConfig {
        url: opts.api.api_url.clone(),
        token: opts.api.api_token.clone(),
        timeout: *opts.api.api_timeout.get(),
        region_id: opts.instance.region_id,
    })?);
    let hosts = ClusterHosts::new(Some(opts.hosts_file.clone()), opts.default_hostfile.clone());
    let events = Rc::new(EventManager::new(*opts.event_ttl.get()));

    let scale_up = ScaleUpHandler::new(
        queue.clone(),
        provider.clone(),
        storage.clone(),
        hosts.clone(),
        events.clone(),
        scale_up_config(&opts),
    );
    let scale_down = Rc::new(ScaleDownHandler::new(
        queue.clone(),
        provider.clone(),
        storage.clone(),
        hosts,
    ));
    let availability = InstanceAvailabilityManager::new(
        events,
        AvailabilityConfig {
            unavail_count_failure: opts.unavail_count_failure,
            unavail_count_insufficient: opts.unavail_count_insufficient,
            unavail_delay: *opts.unavail_delay.get(),
        },
    );

    let worker_validator = GracePeriodWorkerValidator::new(
        Box::new(CompositeWorkerValidator::new(vec![
            Box::new(QueueWorkerValidator::new(queue.clone())),
            Box::new(RunStatusWorkerValidator::new(provider.clone())),
        ])),
        *opts.grace_period.get(),
    );
    let validator = WorkerValidatorHandler::new(
        queue.clone(),
        Box::new(worker_validator),
        storage.clone(),
        scale_down.clone(),
    );
    let autoscaler = GridEngineAutoscaler::new(
        queue,
        provider,
        storage.clone(),
        scale_up,
        scale_down,
        availability,
        config,
    );
    Ok(Cluster {
        autoscaler,
        validator,
        storage,
    })
}

fn create_queue_backend(opts: &QueueOpts) -> Rc<dyn QueueBackend> {
    let mut runner = CommandRunner::new(RetryPolicy::new(
        opts.command_attempts,
        *opts.command_delay.get(),
    ));
    if let Some(dir) = &opts.tools_dir {
        runner = runner.with_tools_dir(dir.clone());
    }
    match opts.backend {
        QueueKind::Sge => Rc::new(SgeQueueBackend::new(
            runner,
            SgeConfig {
                queue: opts.queue.clone(),
                hostlist: opts.hostlist.clone(),
                parallel_environments: opts.pe.clone(),
            },
        )),
        QueueKind::Kube => Rc::new(KubeQueueBackend::new(runner, opts.kube_namespace.clone())),
    }
}

pub fn autoscaler_config(opts: &AutoscaleOpts) -> crate::Result<AutoscalerConfig> {
    Ok(AutoscalerConfig {
        scale_up_timeout: *opts.scale_up_timeout.get(),
        scale_down_timeout: *opts.scale_down_timeout.get(),
        max_workers: opts.max_workers,
        scale_up_batch_size: opts.scale_up_batch_size,
        scale_down_batch_size: opts.scale_down_batch_size,
        instance_source: instance_source(&opts.instance)?,
        custom_resources: opts
            .custom_requirements
            .iter()
            .map(|name| name.trim().to_string())
            .filter(|name| !name.is_empty())
            .collect(),
    })
}

fn scale_up_config(opts: &AutoscaleOpts) -> ScaleUpConfig {
    let instance = &opts.instance;
    ScaleUpConfig {
        parent_run_id: instance.parent_run_id,
        default_owner: instance.owner.clone(),
        disk: instance.instance_disk,
        image: instance.instance_image.clone(),
        cmd_template: instance.cmd_template.clone(),
        price_type: match instance.price_type {
            PriceTypeArg::Spot => PriceType::Spot,
            PriceTypeArg::OnDemand => PriceType::OnDemand,
        },
        region_id: instance.region_id,
        polling: RetryPolicy::from_timeout(
            *opts.scale_up_polling_timeout.get(),
            *opts.scale_up_polling_delay.get(),
        ),
    }
}

/// A fixed instance type, or in hybrid mode the family of instance types.
///
/// The hybrid family defaults to the family of the instance type (`m5` for `m5.large`).
pub fn instance_source(opts: &InstanceOpts) -> crate::Result<InstanceSource> {
    if !opts.hybrid {
        return match &opts.instance_type {
            Some(instance_type) => Ok(InstanceSource::Fixed(instance_type.clone())),
            None => Err(GridScaleError::GenericError(
                "An instance type has to be configured unless hybrid mode is enabled".to_string(),
            )),
        };
    }
    let family = match (&opts.hybrid_family, &opts.instance_type) {
        (Some(family), _) => family.clone(),
        (None, Some(instance_type)) => instance_family(instance_type).ok_or_else(|| {
            GridScaleError::GenericError(format!(
                "Cannot determine the family of instance type {instance_type}"
            ))
        })?,
        (None, None) => {
            return Err(GridScaleError::GenericError(
                "Hybrid mode requires an instance family or an instance type".to_string(),
            ));
        }
    };
    Ok(InstanceSource::Family {
        family,
        max_cpu: opts.hybrid_max_cpu,
    })
}

/// `m5.large` => `m5`, `n1-standard-2` => `n1`
fn instance_family(instance_type: &str) -> Option<String> {
    let (family, _) = instance_type.split_once(['.', '-'])?;
    Some(family.to_string())
}

#[cfg(test)]
mod tests {
    use super::{instance_family, instance_source};
    use crate::common::cli::{InstanceOpts, PriceTypeArg};
    use gridcore::instance::InstanceSource;

    fn opts() -> InstanceOpts {
        InstanceOpts {
            instance_type: Some("m5.large".to_string()),
            hybrid: false,
            hybrid_family: None,
            hybrid_max_cpu: None,
            instance_disk: 50,
            instance_image: "worker".to_string(),
            cmd_template: "sleep infinity".to_string(),
            price_type: PriceTypeArg::OnDemand,
            region_id: None,
            parent_run_id: 1,
            owner: "root".to_string(),
        }
    }

    #[test]
    fn fixed_instance_source() {
        assert_eq!(
            instance_source(&opts()).unwrap(),
            InstanceSource::Fixed("m5.large".to_string())
        );
        let mut missing = opts();
        missing.instance_type = None;
        assert!(instance_source(&missing).is_err());
    }

    #[test]
    fn hybrid_instance_source() {
        let mut hybrid = opts();
        hybrid.hybrid = true;
        hybrid.hybrid_max_cpu = Some(16);
        assert_eq!(
            instance_source(&hybrid).unwrap(),
            InstanceSource::Family {
                family: "m5".to_string(),
                max_cpu: Some(16)
            }
        );
        hybrid.hybrid_family = Some("c5".to_string());
        assert!(matches!(
            instance_source(&hybrid).unwrap(),
            InstanceSource::Family { family, .. } if family == "c5"
        ));
    }

    #[test]
    fn instance_families() {
        assert_eq!(instance_family("m5.large").as_deref(), Some("m5"));
        assert_eq!(instance_family("n1-standard-2").as_deref(), Some("n1"));
        assert_eq!(instance_family("large"), None);
    }
}
