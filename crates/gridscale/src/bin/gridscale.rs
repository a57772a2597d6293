use clap::{CommandFactory, FromArgMatches};

use gridscale::commands::{command_check, command_hosts, command_run};
use gridscale::common::cli::{RootOptions, SubCommand};
use gridscale::common::setup::setup_logging;

#[tokio::main(flavor = "current_thread")]
async fn main() -> gridscale::Result<()> {
    let matches = RootOptions::command().get_matches();
    let top_opts = match RootOptions::from_arg_matches(&matches) {
        Ok(opts) => opts,
        Err(error) => error.exit(),
    };

    setup_logging(top_opts.common.debug);

    let result = match top_opts.subcmd {
        SubCommand::Run(opts) => command_run(opts).await,
        SubCommand::Check(opts) => command_check(opts).await,
        SubCommand::Hosts(opts) => command_hosts(opts),
    };

    if let Err(e) = result {
        log::error!("{e}");
        std::process::exit(1);
    }

    Ok(())
}
