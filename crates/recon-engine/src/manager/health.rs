use tracing::debug;

use super::WorkerManager;
use crate::types::HealthStatus;

impl WorkerManager {
    /// Check the runtime. Each sub-check degrades only its own field, so this
    /// never fails even when the runtime is unreachable.
    pub async fn health_check(&self) -> HealthStatus {
        let managed = [(self.config.managed_label(), "true".to_owned())];
        let (ping, image, containers, version) = tokio::join!(
            self.runtime.ping(),
            self.runtime.image_exists(&self.config.image),
            self.runtime.list_containers(&managed),
            self.runtime.version(),
        );

        let docker_available = match ping {
            Ok(()) => true,
            Err(err) => {
                debug!("runtime ping failed: {err}");
                false
            }
        };
        let image_exists = image.unwrap_or_else(|err| {
            debug!(image = %self.config.image, "image lookup failed: {err}");
            false
        });
        let active_containers = containers.map(|list| list.len()).unwrap_or_else(|err| {
            debug!("container listing failed: {err}");
            0
        });

        HealthStatus {
            docker_available,
            image_exists,
            active_containers,
            active_sessions: self.registry.len(),
            version: version.ok(),
        }
    }
}
