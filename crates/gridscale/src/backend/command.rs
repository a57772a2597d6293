use std::path::PathBuf;
use std::process::Output;

use anyhow::Context;
use bstr::ByteSlice;
use gridcore::ScaleResult;
use gridcore::common::retry::{RetryPolicy, retry};
use tokio::process::Command;

pub fn create_command(arguments: &[&str]) -> Command {
    let mut command = Command::new(arguments[0]);
    command.args(&arguments[1..]);
    command
}

pub fn check_command_output(output: Output) -> ScaleResult<Output> {
    let status = output.status;
    if !status.success() {
        return Err(anyhow::anyhow!(
            "Exit code: {}\nStderr: {}\nStdout: {}",
            status.code().unwrap_or(-1),
            output.stderr.to_str_lossy().trim(),
            output.stdout.to_str_lossy().trim()
        ));
    }
    Ok(output)
}

/// Runs external commands (`qstat`, `kubectl`, ...), retrying failed attempts.
#[derive(Debug, Clone)]
pub struct CommandRunner {
    policy: RetryPolicy,
    tools_dir: Option<PathBuf>,
}

impl CommandRunner {
    pub fn new(policy: RetryPolicy) -> Self {
        Self {
            policy,
            tools_dir: None,
        }
    }

    /// Programs are started from `dir` instead of being looked up in PATH.
    pub fn with_tools_dir(mut self, dir: PathBuf) -> Self {
        self.tools_dir = Some(dir);
        self
    }

    /// Runs the command and returns its standard output.
    pub async fn run(&self, arguments: &[&str]) -> ScaleResult<String> {
        let program = match &self.tools_dir {
            Some(dir) => dir.join(arguments[0]).to_string_lossy().into_owned(),
            None => arguments[0].to_string(),
        };
        let mut resolved = arguments.to_vec();
        resolved[0] = program.as_str();
        retry(self.policy, || run_once(&resolved))
            .await
            .with_context(|| format!("Command `{}` failed", arguments.join(" ")))
    }
}

async fn run_once(arguments: &[&str]) -> ScaleResult<String> {
    log::debug!("Running command `{}`", arguments.join(" "));
    let program = arguments[0];
    let output = create_command(arguments)
        .output()
        .await
        .with_context(|| format!("{program} start failed"))?;
    let output =
        check_command_output(output).with_context(|| format!("{program} execution failed"))?;
    let stdout = output
        .stdout
        .to_str()
        .map_err(|e| anyhow::anyhow!("Invalid UTF-8 {program} output: {e:?}"))?;
    log::trace!("{program} output:\n{stdout}");
    Ok(stdout.to_string())
}
