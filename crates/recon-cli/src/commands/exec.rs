//! `recon-worker exec` command.

use anyhow::{Result, anyhow};
use clap::Args;
use recon_engine::ToolExecutionRequest;
use tracing::warn;

use super::print_result;
use crate::opts::WorkerOpts;
use crate::output::print_output;

#[derive(Args, Debug)]
pub struct ExecArgs {
    /// Session key
    #[arg(long, default_value = "cli")]
    pub session: String,

    /// Working directory inside the session container
    #[arg(long)]
    pub workdir: Option<String>,

    /// Extra environment as KEY=VALUE (repeatable)
    #[arg(long = "env", value_parser = parse_env)]
    pub env: Vec<(String, String)>,

    /// Leave the session container running afterwards
    #[arg(long)]
    pub keep: bool,

    /// Commands to run in order; the working directory and exports carry over
    #[arg(required = true)]
    pub commands: Vec<String>,
}

fn parse_env(raw: &str) -> Result<(String, String), String> {
    match raw.split_once('=') {
        Some((key, value)) if !key.is_empty() => Ok((key.to_owned(), value.to_owned())),
        _ => Err(format!("expected KEY=VALUE, got '{raw}'")),
    }
}

pub async fn cmd_exec(opts: &WorkerOpts, args: &ExecArgs) -> Result<()> {
    let manager = opts.manager()?;
    let mut outcome = Ok(());
    for command in &args.commands {
        let mut request = ToolExecutionRequest::new(command, &args.session).stage("cli");
        for (key, value) in &args.env {
            request = request.env(key, value);
        }
        if let Some(dir) = &args.workdir {
            request = request.working_dir(dir);
        }
        let run = tokio::select! {
            run = manager.run_tool_in_session(&request) => run,
            _ = tokio::signal::ctrl_c() => {
                if let Err(err) = manager.kill_container(&args.session).await {
                    warn!(session = %args.session, "interrupted; cleanup failed: {err}");
                }
                return Err(anyhow!("interrupted"));
            }
        };
        match run {
            Ok(result) => print_output(opts, &result, print_result)?,
            Err(err) => {
                outcome = Err(err.into());
                break;
            }
        }
    }

    if !args.keep {
        if let Err(err) = manager.end_session(&args.session).await {
            warn!(session = %args.session, "failed to end session: {err}");
        }
    }
    outcome
}
