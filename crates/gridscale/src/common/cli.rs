use std::path::PathBuf;

use clap::Parser;

use crate::common::timeutils::ArgDuration;

#[derive(clap::ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
pub enum QueueKind {
    /// Sun Grid Engine
    Sge,
    /// Kubernetes cluster, pods are treated as jobs
    Kube,
}

#[derive(clap::ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
pub enum PriceTypeArg {
    /// Spot (preemptible) instances
    Spot,
    /// On-demand instances
    OnDemand,
}

// Common CLI options
#[derive(Parser)]
pub struct CommonOpts {
    /// Enables more detailed log output
    #[arg(
        long,
        global = true,
        env = "GRIDSCALE_DEBUG",
        help_heading("GLOBAL OPTIONS"),
        hide_short_help(true)
    )]
    pub debug: bool,
}

#[derive(Parser)]
#[command(
    author,
    about,
    version,
    disable_help_subcommand(true),
    help_expected(true)
)]
pub struct RootOptions {
    #[clap(flatten)]
    pub common: CommonOpts,

    #[clap(subcommand)]
    pub subcmd: SubCommand,
}

#[allow(clippy::large_enum_variant)]
#[derive(Parser)]
pub enum SubCommand {
    /// Run the autoscaling daemon
    Run(RunOpts),
    /// Compute a single scaling plan and print it, without changing the cluster
    Check(CheckOpts),
    /// Inspect and maintain hosts launched by the autoscaler
    Hosts(HostsOpts),
}

#[derive(Parser)]
pub struct RunOpts {
    /// Time between two autoscaling cycles
    #[arg(long, env = "CP_CAP_AUTOSCALE_UPDATE_INTERVAL", default_value = "10s")]
    pub update_interval: ArgDuration,

    #[clap(flatten)]
    pub autoscale: AutoscaleOpts,
}

#[derive(Parser)]
pub struct CheckOpts {
    #[clap(flatten)]
    pub autoscale: AutoscaleOpts,
}

#[derive(Parser)]
pub struct StorageOpts {
    /// File that stores the hosts launched by the autoscaler
    #[arg(
        long,
        env = "CP_CAP_AUTOSCALE_HOST_STORAGE",
        default_value = "/var/lib/gridscale/hosts",
        value_hint = clap::ValueHint::FilePath
    )]
    pub host_storage: PathBuf,
}

#[derive(Parser)]
pub struct ApiOpts {
    /// Base URL of the Cloud Pipeline REST API
    #[arg(long, env = "CP_API_URL")]
    pub api_url: String,

    /// Access token of the Cloud Pipeline REST API
    #[arg(long, env = "CP_API_TOKEN", hide_env_values = true)]
    pub api_token: String,

    /// Timeout of a single API request
    #[arg(long, env = "CP_API_TIMEOUT", default_value = "60s")]
    pub api_timeout: ArgDuration,
}

#[derive(Parser)]
pub struct QueueOpts {
    /// Queue backend that is scaled
    #[arg(long, env = "CP_CAP_AUTOSCALE_BACKEND", value_enum, default_value_t = QueueKind::Sge)]
    pub backend: QueueKind,

    /// Grid Engine queue whose hosts are managed
    #[arg(long, env = "CP_CAP_SGE_QUEUE_NAME", default_value = "main.q")]
    pub queue: String,

    /// Grid Engine host group that workers are added to
    #[arg(long, env = "CP_CAP_SGE_HOSTLIST_NAME", default_value = "@allhosts")]
    pub hostlist: String,

    /// Grid Engine parallel environments whose slots follow the cluster size
    #[arg(long, env = "CP_CAP_SGE_PE_NAME", value_delimiter(','), default_value = "local")]
    pub pe: Vec<String>,

    /// Kubernetes namespace of the job pods
    #[arg(long, env = "CP_CAP_KUBE_NAMESPACE", default_value = "default")]
    pub kube_namespace: String,

    /// How many times is a failed queue command attempted
    #[arg(
        long,
        env = "CP_CAP_AUTOSCALE_COMMAND_ATTEMPTS",
        default_value_t = 3,
        value_parser = clap::value_parser!(u32).range(1..)
    )]
    pub command_attempts: u32,

    /// Delay between attempts of a failed queue command
    #[arg(long, env = "CP_CAP_AUTOSCALE_COMMAND_DELAY", default_value = "5s")]
    pub command_delay: ArgDuration,

    /// Directory with the queue command line tools (e.g. `$SGE_ROOT/bin/lx-amd64`),
    /// the tools are looked up in PATH if it is not set
    #[arg(long, env = "CP_CAP_AUTOSCALE_TOOLS_DIR")]
    pub tools_dir: Option<PathBuf>,
}

#[derive(Parser)]
pub struct InstanceOpts {
    /// Instance type of launched workers
    #[arg(long, env = "CP_CAP_AUTOSCALE_INSTANCE_TYPE")]
    pub instance_type: Option<String>,

    /// Launch instance types of a whole family, sized to the demand
    #[arg(long, env = "CP_CAP_AUTOSCALE_HYBRID")]
    pub hybrid: bool,

    /// Instance family used in hybrid mode, defaults to the family of --instance-type
    #[arg(long, env = "CP_CAP_AUTOSCALE_HYBRID_FAMILY")]
    pub hybrid_family: Option<String>,

    /// Largest number of CPUs of an instance launched in hybrid mode
    #[arg(long, env = "CP_CAP_AUTOSCALE_HYBRID_MAX_CORE_PER_NODE")]
    pub hybrid_max_cpu: Option<u32>,

    /// Disk size of launched workers in GiB
    #[arg(long, env = "CP_CAP_AUTOSCALE_INSTANCE_DISK", default_value_t = 50)]
    pub instance_disk: u32,

    /// Docker image of launched workers
    #[arg(long, env = "CP_CAP_AUTOSCALE_INSTANCE_IMAGE")]
    pub instance_image: String,

    /// Command executed by launched workers
    #[arg(long, env = "CP_CAP_AUTOSCALE_CMD_TEMPLATE", default_value = "sleep infinity")]
    pub cmd_template: String,

    /// Price type of launched workers
    #[arg(long, env = "CP_CAP_AUTOSCALE_PRICE_TYPE", value_enum, default_value_t = PriceTypeArg::OnDemand)]
    pub price_type: PriceTypeArg,

    /// Cloud region of launched workers
    #[arg(long, env = "CLOUD_REGION_ID")]
    pub region_id: Option<u64>,

    /// Run that launched workers belong to
    #[arg(long, env = "RUN_ID")]
    pub parent_run_id: u64,

    /// Owner of workers that are not launched for a particular user
    #[arg(long, env = "OWNER", default_value = "root")]
    pub owner: String,
}

#[derive(Parser)]
pub struct AutoscaleOpts {
    /// Maximum number of workers launched by the autoscaler
    #[arg(
        long,
        env = "CP_CAP_AUTOSCALE_WORKERS",
        default_value_t = 3,
        value_parser = clap::value_parser!(u32).range(1..)
    )]
    pub max_workers: u32,

    /// Pending jobs waiting for longer than this cause a scale up
    #[arg(long, env = "CP_CAP_AUTOSCALE_SCALE_UP_TIMEOUT", default_value = "30s")]
    pub scale_up_timeout: ArgDuration,

    /// Workers idle for longer than this are removed
    #[arg(long, env = "CP_CAP_AUTOSCALE_SCALE_DOWN_TIMEOUT", default_value = "30s")]
    pub scale_down_timeout: ArgDuration,

    /// Maximum number of workers launched in a single cycle
    #[arg(long, env = "CP_CAP_AUTOSCALE_SCALE_UP_BATCH_SIZE", default_value_t = 1)]
    pub scale_up_batch_size: usize,

    /// Maximum number of workers removed in a single cycle
    #[arg(long, env = "CP_CAP_AUTOSCALE_SCALE_DOWN_BATCH_SIZE", default_value_t = 1)]
    pub scale_down_batch_size: usize,

    /// How long to wait for a launched worker to initialize
    #[arg(long, env = "CP_CAP_AUTOSCALE_SCALE_UP_POLLING_TIMEOUT", default_value = "15m")]
    pub scale_up_polling_timeout: ArgDuration,

    /// Delay between status checks of a launched worker
    #[arg(long, env = "CP_CAP_AUTOSCALE_SCALE_UP_POLLING_DELAY", default_value = "10s")]
    pub scale_up_polling_delay: ArgDuration,

    /// For how long is an instance type not launched after repeated failures
    #[arg(long, env = "CP_CAP_AUTOSCALE_UNAVAILABILITY_DELAY", default_value = "30m")]
    pub unavail_delay: ArgDuration,

    /// Failures in a row that make an instance type unavailable
    #[arg(long, env = "CP_CAP_AUTOSCALE_UNAVAILABILITY_COUNT_FAILURE", default_value_t = 3)]
    pub unavail_count_failure: u32,

    /// Insufficient capacity errors in a row that make an instance type unavailable
    #[arg(
        long,
        env = "CP_CAP_AUTOSCALE_UNAVAILABILITY_COUNT_INSUFFICIENT",
        default_value_t = 1
    )]
    pub unavail_count_insufficient: u32,

    /// For how long are instance launch events remembered
    #[arg(long, env = "CP_CAP_AUTOSCALE_EVENT_TTL", default_value = "3h")]
    pub event_ttl: ArgDuration,

    /// For how long may a worker fail validation before it is removed
    #[arg(long, env = "CP_CAP_AUTOSCALE_INVALID_WORKER_GRACE_PERIOD", default_value = "5m")]
    pub grace_period: ArgDuration,

    /// Custom (consumable) resources whose global amounts limit the jobs considered
    #[arg(long, env = "CP_CAP_AUTOSCALE_CUSTOM_REQUIREMENTS", value_delimiter(','))]
    pub custom_requirements: Vec<String>,

    /// Hosts file (`<ip> <host>` lines) that workers are added to
    #[arg(long, env = "CP_CAP_AUTOSCALE_HOSTS_FILE", default_value = "/etc/hosts")]
    pub hosts_file: PathBuf,

    /// File listing one worker per line, used by MPI launchers
    #[arg(long, env = "DEFAULT_HOSTFILE")]
    pub default_hostfile: Option<PathBuf>,

    #[clap(flatten)]
    pub queue: QueueOpts,

    #[clap(flatten)]
    pub instance: InstanceOpts,

    #[clap(flatten)]
    pub api: ApiOpts,

    #[clap(flatten)]
    pub storage: StorageOpts,
}

#[derive(Parser)]
pub struct HostsOpts {
    #[clap(flatten)]
    pub storage: StorageOpts,

    #[clap(subcommand)]
    pub subcmd: HostsCommand,
}

#[derive(Parser)]
pub enum HostsCommand {
    /// List stored hosts
    List,
    /// Store a host, so that it is managed by the autoscaler
    Add(HostArg),
    /// Forget a host, it will no longer be managed by the autoscaler
    Remove(HostArg),
    /// Forget all hosts
    Clear,
}

#[derive(Parser)]
pub struct HostArg {
    /// Hostname
    pub host: String,
}
