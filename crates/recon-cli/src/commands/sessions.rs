//! `recon-worker sessions` command.

use anyhow::Result;
use recon_engine::ContainerRuntime;
use recon_engine::manager::ROLE_SESSION;
use serde_json::{Value, json};

use crate::opts::WorkerOpts;
use crate::output::print_output;

pub async fn cmd_sessions(opts: &WorkerOpts) -> Result<()> {
    let config = opts.config()?;
    let runtime = opts.runtime(&config);
    let filter = [
        (config.managed_label(), "true".to_owned()),
        (config.label("role"), ROLE_SESSION.to_owned()),
    ];
    let containers = runtime.list_containers(&filter).await?;
    let sessions: Vec<Value> = containers
        .iter()
        .map(|container| {
            json!({
                "key": container.labels.get(&config.label("session")),
                "container": container.names.first().unwrap_or(&container.id),
                "id": container.id,
                "state": container.state,
            })
        })
        .collect();

    print_output(opts, &sessions, |sessions| {
        if sessions.is_empty() {
            println!("no sessions");
        }
        for session in sessions {
            println!(
                "{:<24} {:<40} {}",
                session["key"].as_str().unwrap_or("-"),
                session["container"].as_str().unwrap_or("-"),
                session["state"].as_str().unwrap_or("-"),
            );
        }
        Ok(())
    })
}
