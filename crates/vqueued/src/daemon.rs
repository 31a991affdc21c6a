//! `vqueued run` — one scaling agent per configured virtual queue.

use std::path::Path;
use std::sync::Arc;

use anyhow::Context;
use tracing::{error, info};

use vqueue_autoscale::{AgentConfig, ScalingAgent};
use vqueue_backend::QueueService;
use vqueue_client::VirtualQueue;
use vqueue_core::VqueueConfig;

/// The set of running agents.
pub struct Daemon {
    agents: Vec<ScalingAgent>,
}

impl Daemon {
    /// Ensure every configured queue exists and start its agent.
    ///
    /// If any agent fails to start, the ones already started are stopped
    /// and the error is returned.
    pub async fn start(service: Arc<dyn QueueService>, config: &VqueueConfig) -> anyhow::Result<Self> {
        let mut daemon = Self { agents: Vec::new() };
        for settings in config.queue_settings()? {
            match start_agent(Arc::clone(&service), &settings).await {
                Ok(agent) => daemon.agents.push(agent),
                Err(e) => {
                    error!(queue = %settings.name, error = %e, "agent failed to start");
                    daemon.stop().await;
                    return Err(e);
                }
            }
        }
        info!(agents = daemon.agents.len(), "all scaling agents running");
        Ok(daemon)
    }

    pub fn queue_names(&self) -> Vec<&str> {
        self.agents.iter().map(ScalingAgent::queue_name).collect()
    }

    pub fn agents(&self) -> &[ScalingAgent] {
        &self.agents
    }

    /// Stop every agent, in configuration order.
    pub async fn stop(self) {
        for agent in &self.agents {
            agent.stop().await;
        }
    }
}

async fn start_agent(
    service: Arc<dyn QueueService>,
    settings: &vqueue_core::QueueSettings,
) -> anyhow::Result<ScalingAgent> {
    VirtualQueue::ensure_created(service.as_ref(), &settings.name)
        .await
        .with_context(|| format!("creating virtual queue {}", settings.name))?;

    let agent = ScalingAgent::new(&settings.name, service, AgentConfig::from_settings(settings)?)?;
    agent
        .start()
        .await
        .with_context(|| format!("starting scaling agent for {}", settings.name))?;
    Ok(agent)
}

/// Load the config, open the backend, run agents until Ctrl-C.
pub async fn run(config_path: &Path) -> anyhow::Result<()> {
    let config = VqueueConfig::from_file(config_path)
        .with_context(|| format!("loading {}", config_path.display()))?;
    info!(
        path = %config_path.display(),
        queues = config.queues.len(),
        "vqueue daemon starting"
    );

    let service = crate::open_service(&config.backend.data_dir, config.backend.max_size_megabytes)?;
    let daemon = Daemon::start(service, &config).await?;

    tokio::signal::ctrl_c()
        .await
        .context("installing Ctrl-C handler")?;
    info!("shutdown signal received");

    daemon.stop().await;
    info!("vqueue daemon stopped");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use vqueue_backend::testing::RecordingService;
    use vqueue_backend::{MemoryQueueService, PhysicalQueue};
    use vqueue_core::Message;

    fn config(text: &str) -> VqueueConfig {
        let config: VqueueConfig = toml::from_str(text).unwrap();
        config.validate().unwrap();
        config
    }

    #[tokio::test(start_paused = true)]
    async fn starts_one_agent_per_queue() {
        let memory = MemoryQueueService::new(1);
        let config = config(
            r#"
            [defaults]
            threshold = 0.5
            poll_interval = "1s"

            [[queue]]
            name = "orders"

            [[queue]]
            name = "events"
            threshold = 0.9
            "#,
        );

        let daemon = Daemon::start(Arc::new(memory.clone()), &config).await.unwrap();
        assert_eq!(daemon.queue_names(), vec!["orders", "events"]);
        assert_eq!(daemon.agents()[1].threshold(), 0.9);
        assert!(memory.queue("orders-0").is_some());
        assert!(memory.queue("events-0").is_some());

        // Past the orders threshold but not the events one.
        for name in ["orders-0", "events-0"] {
            memory
                .queue(name)
                .unwrap()
                .send(Message::new(vec![0u8; 600 * 1024]))
                .await
                .unwrap();
        }
        tokio::time::sleep(Duration::from_millis(1500)).await;
        assert!(memory.queue("orders-1").is_some());
        assert!(memory.queue("events-1").is_none());

        daemon.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn failed_start_stops_earlier_agents() {
        let memory = MemoryQueueService::new(1);
        // A stray shard name that cannot be parsed makes the second agent fail.
        memory.create_queue("events-dlq").await.unwrap();
        let config = config(
            r#"
            [[queue]]
            name = "orders"

            [[queue]]
            name = "events"
            "#,
        );

        let recording = RecordingService::new(Arc::new(memory));
        let err = Daemon::start(Arc::new(recording.clone()), &config)
            .await
            .err()
            .unwrap();
        assert!(format!("{err:#}").contains("events"), "{err:#}");

        // The orders agent was stopped: the backend sees no more calls.
        let calls = recording.calls().len();
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(recording.calls().len(), calls);
    }
}
