//! `recon-worker health` command.

use anyhow::Result;

use crate::opts::WorkerOpts;
use crate::output::print_output;

pub async fn cmd_health(opts: &WorkerOpts) -> Result<()> {
    let manager = opts.manager()?;
    let health = manager.health_check().await;
    print_output(opts, &health, |health| {
        println!("docker:     {}", if health.docker_available { "available" } else { "unavailable" });
        if let Some(version) = &health.version {
            println!("version:    {version}");
        }
        println!(
            "image:      {} ({})",
            manager.config().image,
            if health.image_exists { "present" } else { "missing" }
        );
        println!("containers: {}", health.active_containers);
        Ok(())
    })?;
    if !health.docker_available {
        anyhow::bail!("execution runtime not available");
    }
    Ok(())
}
