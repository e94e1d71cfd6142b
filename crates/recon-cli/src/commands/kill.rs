//! `recon-worker kill` command.

use anyhow::Result;
use clap::Args;
use serde_json::json;

use crate::opts::WorkerOpts;
use crate::output::print_output;

#[derive(Args, Debug)]
pub struct KillArgs {
    /// Session key whose containers should be killed
    pub key: String,
}

pub async fn cmd_kill(opts: &WorkerOpts, args: &KillArgs) -> Result<()> {
    let manager = opts.manager()?;
    let killed = manager.kill_container(&args.key).await?;
    print_output(opts, &json!({ "key": args.key, "killed": killed }), |_| {
        println!("killed {killed} container(s) for '{}'", args.key);
        Ok(())
    })
}
