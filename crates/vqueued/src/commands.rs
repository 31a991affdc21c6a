//! One-shot commands against a queue service.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, bail};
use serde::Serialize;

use vqueue_backend::QueueService;
use vqueue_client::{ClientConfig, VirtualQueue};
use vqueue_core::{ReceivedMessage, validate_queue_name};
use vqueue_shard::{MonitorConfig, ShardSetMonitor, ShardSource, ShardSummary};

/// JSON shape printed by `vqueued status`.
#[derive(Debug, Serialize)]
pub struct QueueStatus {
    pub queue: String,
    pub max_queue_size_megabytes: u64,
    pub current_queue_size_bytes: u64,
    pub send_shard: Option<String>,
    pub receive_shard: Option<String>,
    pub shards: Vec<ShardSummary>,
}

pub async fn create(service: Arc<dyn QueueService>, name: &str) -> anyhow::Result<bool> {
    VirtualQueue::ensure_created(service.as_ref(), name)
        .await
        .with_context(|| format!("creating virtual queue {name}"))
}

pub async fn status(service: Arc<dyn QueueService>, name: &str) -> anyhow::Result<QueueStatus> {
    validate_queue_name(name)?;
    let monitor = ShardSetMonitor::new(name, service, MonitorConfig::default());
    let shards = monitor
        .refresh()
        .await
        .with_context(|| format!("listing shards of {name}"))?;
    if shards.is_empty() {
        bail!("virtual queue {name} does not exist");
    }

    Ok(QueueStatus {
        queue: name.to_string(),
        max_queue_size_megabytes: shards.max_size_megabytes(),
        current_queue_size_bytes: shards.current_size_bytes(),
        send_shard: shards.send_shard().map(|s| s.name().to_string()),
        receive_shard: shards.receive_shard().map(|s| s.name().to_string()),
        shards: shards.summaries(),
    })
}

pub async fn send(service: Arc<dyn QueueService>, name: &str, body: String) -> anyhow::Result<u64> {
    let queue = VirtualQueue::open(service, name, ClientConfig::default()).await?;
    let result = queue.send(body).await;
    queue.close().await;
    Ok(result.with_context(|| format!("sending to {name}"))?)
}

pub async fn receive(
    service: Arc<dyn QueueService>,
    name: &str,
    wait: Duration,
) -> anyhow::Result<Vec<ReceivedMessage>> {
    let queue = VirtualQueue::open(service, name, ClientConfig::default()).await?;
    let result = queue.receive_batch(wait).await;
    queue.close().await;
    Ok(result.with_context(|| format!("receiving from {name}"))?)
}

/// One output line per message: sequence, then the body as text when it
/// is UTF-8, else its length.
pub fn render(message: &ReceivedMessage) -> String {
    match message.body_str() {
        Some(text) => format!("{}\t{text}", message.sequence),
        None => format!("{}\t<{} bytes>", message.sequence, message.body.len()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use vqueue_backend::{MemoryQueueService, RedbQueueService};
    use vqueue_core::ShardState;

    fn memory() -> Arc<dyn QueueService> {
        Arc::new(MemoryQueueService::new(1))
    }

    #[tokio::test(start_paused = true)]
    async fn create_then_status() {
        let service = memory();
        assert!(create(service.clone(), "orders").await.unwrap());
        assert!(!create(service.clone(), "orders").await.unwrap());

        let status = status(service, "orders").await.unwrap();
        assert_eq!(status.queue, "orders");
        assert_eq!(status.max_queue_size_megabytes, 1);
        assert_eq!(status.send_shard.as_deref(), Some("orders-0"));
        assert_eq!(status.receive_shard.as_deref(), Some("orders-0"));
        assert_eq!(status.shards.len(), 1);
        assert_eq!(status.shards[0].state, ShardState::Enabled);

        let json = serde_json::to_value(&status).unwrap();
        assert_eq!(json["shards"][0]["state"], "enabled");
    }

    #[tokio::test]
    async fn status_of_unknown_queue_fails() {
        let err = status(memory(), "ghost").await.unwrap_err();
        assert!(err.to_string().contains("does not exist"), "{err}");
    }

    #[tokio::test(start_paused = true)]
    async fn send_and_receive_through_redb() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("vqueue.redb");

        {
            let service: Arc<dyn QueueService> =
                Arc::new(RedbQueueService::open(&path, 1).unwrap());
            create(service.clone(), "jobs").await.unwrap();
            assert_eq!(send(service.clone(), "jobs", "hello".into()).await.unwrap(), 0);
            send(service, "jobs", "world".into()).await.unwrap();
        }

        // A fresh process sees the persisted messages.
        let service: Arc<dyn QueueService> = Arc::new(RedbQueueService::open(&path, 1).unwrap());
        let messages = receive(service, "jobs", Duration::from_millis(10))
            .await
            .unwrap();
        let lines: Vec<_> = messages.iter().map(render).collect();
        assert_eq!(lines, vec!["0\thello", "1\tworld"]);
    }

    #[test]
    fn render_binary_body() {
        let message = ReceivedMessage {
            sequence: 3,
            body: vec![0xffu8, 0xfe].into(),
            content_type: None,
            enqueued_at: 0,
        };
        assert_eq!(render(&message), "3\t<2 bytes>");
    }
}
