//! `recon-worker run` command.

use anyhow::{Result, bail};
use clap::Args;
use recon_engine::ToolExecutionRequest;
use tracing::warn;

use super::print_result;
use crate::opts::WorkerOpts;
use crate::output::print_output;

#[derive(Args, Debug)]
pub struct RunArgs {
    /// Shell command line to run
    pub command: String,

    /// Session key to label the container with
    #[arg(long, default_value = "cli")]
    pub key: String,

    /// Tool name, used to pick the default timeout
    #[arg(long, default_value = "")]
    pub tool: String,

    /// Timeout for this command in milliseconds
    #[arg(long)]
    pub timeout_ms: Option<u64>,
}

pub async fn cmd_run(opts: &WorkerOpts, args: &RunArgs) -> Result<()> {
    let manager = opts.manager()?;
    let mut request = ToolExecutionRequest::new(&args.command, &args.key)
        .stage("cli")
        .tool(&args.tool);
    if let Some(ms) = args.timeout_ms {
        request = request.timeout_ms(ms);
    }
    let result = tokio::select! {
        result = manager.run_tool(&request) => result?,
        _ = tokio::signal::ctrl_c() => {
            // the dropped run only schedules its cleanup; remove the container before exiting
            match manager.kill_container(&args.key).await {
                Ok(killed) => warn!(key = %args.key, killed, "interrupted; container removed"),
                Err(err) => warn!(key = %args.key, "interrupted; cleanup failed: {err}"),
            }
            bail!("interrupted");
        }
    };
    print_output(opts, &result, print_result)
}
