//! Scaling agent — utilization-driven scale-out and state reconciliation.
//!
//! Each tick reads the send shard from the monitor, creates the next shard
//! (send-only) when the send shard's utilization exceeds the threshold, and
//! then runs a reconciliation pass over every shard. Backend failures end
//! the tick; the next tick retries from whatever state the backend is in.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use serde::Serialize;
use tokio::sync::{Mutex, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use vqueue_backend::QueueService;
use vqueue_core::{
    BackendError, QueueError, QueueResult, QueueSettings, shard_name, validate_queue_name,
    validate_threshold,
};
use vqueue_shard::{MonitorConfig, Shard, ShardSetMonitor, ShardSource};

use crate::reconcile::{TargetState, Transition, plan_transitions};

/// Agent tuning.
#[derive(Debug, Clone)]
pub struct AgentConfig {
    /// Send-shard utilization above which a new shard is created.
    pub threshold: f64,
    /// Delay between ticks; also used for the agent's monitor.
    pub poll_interval: Duration,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            threshold: 0.8,
            poll_interval: Duration::from_secs(1),
        }
    }
}

impl AgentConfig {
    pub fn new(threshold: f64, poll_interval: Duration) -> QueueResult<Self> {
        let config = Self {
            threshold,
            poll_interval,
        };
        config.validate()?;
        Ok(config)
    }

    pub fn from_settings(settings: &QueueSettings) -> QueueResult<Self> {
        Self::new(settings.threshold, settings.poll_interval)
    }

    fn validate(&self) -> QueueResult<()> {
        validate_threshold(self.threshold)?;
        if self.poll_interval.is_zero() {
            return Err(QueueError::Configuration(
                "poll interval must be positive".into(),
            ));
        }
        Ok(())
    }
}

/// A shard creation performed during a tick.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ScaleOut {
    /// Name of the new send shard.
    pub shard: String,
    pub from_index: u64,
    pub to_index: u64,
    /// Utilization of the previous send shard that triggered the scale-out.
    pub utilization: f64,
    /// The backend already had a queue with this name.
    pub already_existed: bool,
}

/// Everything a tick changed.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct TickReport {
    pub scale_out: Option<ScaleOut>,
    pub transitions: Vec<Transition>,
}

impl TickReport {
    /// True when the tick issued no backend mutation.
    pub fn is_quiet(&self) -> bool {
        self.scale_out.is_none() && self.transitions.is_empty()
    }
}

/// State shared between the agent and its loop.
struct Reconciler {
    queue_name: String,
    service: Arc<dyn QueueService>,
    monitor: Arc<ShardSetMonitor>,
    threshold: f64,
    ticks: AtomicU64,
}

impl Reconciler {
    async fn tick(&self) -> QueueResult<TickReport> {
        self.ticks.fetch_add(1, Ordering::Relaxed);
        let mut report = TickReport::default();

        let mut shards = self.monitor.shards();
        if shards.is_empty() {
            return Err(QueueError::NoSendableShard(self.queue_name.clone()));
        }

        match shards.send_shard() {
            Some(send) => report.scale_out = self.scale_out_if_needed(send).await?,
            None => warn!(
                queue = %self.queue_name,
                "no sendable shard; skipping utilization check"
            ),
        }
        if report.scale_out.is_some() {
            shards = self.monitor.refresh().await?;
        }

        if let Some(highest) = shards.highest()
            && shards.len() > 1
            && !highest.can_send()
        {
            warn!(
                queue = %self.queue_name,
                shard = %highest.name(),
                state = %highest.state(),
                "highest shard does not accept sends"
            );
        }

        for transition in plan_transitions(&shards) {
            self.apply(&transition).await?;
            info!(
                queue = %self.queue_name,
                shard = %transition.shard,
                from = %transition.from,
                to = ?transition.to,
                "shard state reconciled"
            );
            report.transitions.push(transition);
        }
        if !report.transitions.is_empty() {
            self.monitor.refresh().await?;
        }

        Ok(report)
    }

    async fn scale_out_if_needed(&self, send: &Shard) -> QueueResult<Option<ScaleOut>> {
        let utilization = send.storage_utilization()?;
        if utilization <= self.threshold {
            debug!(
                queue = %self.queue_name,
                shard = send.index(),
                utilization,
                threshold = self.threshold,
                "send shard within threshold"
            );
            return Ok(None);
        }

        let to_index = send.index() + 1;
        let name = shard_name(&self.queue_name, to_index);
        let already_existed = match self.service.create_send_only_queue(&name).await {
            Ok(_) => false,
            Err(BackendError::AlreadyExists(_)) => true,
            Err(e) => return Err(e.into()),
        };

        info!(
            queue = %self.queue_name,
            shard = %name,
            from = send.index(),
            utilization,
            threshold = self.threshold,
            already_existed,
            "scaled out to new send shard"
        );
        Ok(Some(ScaleOut {
            shard: name,
            from_index: send.index(),
            to_index,
            utilization,
            already_existed,
        }))
    }

    async fn apply(&self, transition: &Transition) -> QueueResult<()> {
        let name = transition.shard.as_str();
        match transition.to {
            TargetState::Enabled => self.service.set_queue_enabled(name).await?,
            TargetState::ReceiveOnly => self.service.set_queue_receive_only(name).await?,
            TargetState::Disabled => self.service.set_queue_disabled(name).await?,
        }
        Ok(())
    }
}

/// Handle to the running agent loop.
struct LoopSlot {
    handle: JoinHandle<()>,
    shutdown_tx: watch::Sender<bool>,
}

/// Scales one virtual queue out as its send shard fills up.
///
/// Run at most one agent per virtual queue. Two agents converge on the same
/// state but may both issue the same transition.
pub struct ScalingAgent {
    reconciler: Arc<Reconciler>,
    poll_interval: Duration,
    slot: Mutex<Option<LoopSlot>>,
}

impl ScalingAgent {
    /// Create a stopped agent and its (stopped) shard monitor.
    pub fn new(
        queue_name: &str,
        service: Arc<dyn QueueService>,
        config: AgentConfig,
    ) -> QueueResult<Self> {
        validate_queue_name(queue_name)?;
        config.validate()?;

        let monitor = Arc::new(ShardSetMonitor::new(
            queue_name,
            Arc::clone(&service),
            MonitorConfig {
                poll_interval: config.poll_interval,
            },
        ));
        Ok(Self {
            reconciler: Arc::new(Reconciler {
                queue_name: queue_name.to_string(),
                service,
                monitor,
                threshold: config.threshold,
                ticks: AtomicU64::new(0),
            }),
            poll_interval: config.poll_interval,
            slot: Mutex::new(None),
        })
    }

    /// Start the monitor, run one tick, then start the background loop.
    ///
    /// Errors from the monitor's first poll or the first tick propagate and
    /// leave the agent stopped. Starting a running agent is a no-op.
    pub async fn start(&self) -> QueueResult<TickReport> {
        let mut slot = self.slot.lock().await;
        if slot.is_some() {
            debug!(queue = %self.reconciler.queue_name, "scaling agent already running");
            return Ok(TickReport::default());
        }

        self.reconciler.monitor.start().await?;
        let report = match self.reconciler.tick().await {
            Ok(report) => report,
            Err(e) => {
                self.reconciler.monitor.stop().await;
                return Err(e);
            }
        };

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let reconciler = Arc::clone(&self.reconciler);
        let interval = self.poll_interval;
        let handle = tokio::spawn(async move {
            run_agent_loop(reconciler, interval, shutdown_rx).await;
        });
        *slot = Some(LoopSlot {
            handle,
            shutdown_tx,
        });

        info!(
            queue = %self.reconciler.queue_name,
            threshold = self.reconciler.threshold,
            interval_ms = interval.as_millis() as u64,
            "scaling agent started"
        );
        Ok(report)
    }

    /// Stop the loop, wait for an in-flight tick, then stop the monitor.
    /// No backend call is issued after this returns.
    pub async fn stop(&self) {
        let slot = self.slot.lock().await.take();
        if let Some(slot) = slot {
            let _ = slot.shutdown_tx.send(true);
            let _ = slot.handle.await;
        }
        self.reconciler.monitor.stop().await;
        info!(queue = %self.reconciler.queue_name, "scaling agent stopped");
    }

    /// Run one tick against the monitor's current snapshot.
    pub async fn evaluate_and_reconcile(&self) -> QueueResult<TickReport> {
        self.reconciler.tick().await
    }

    pub async fn is_running(&self) -> bool {
        self.slot.lock().await.is_some()
    }

    /// The agent's monitor, for clients that want to share it.
    pub fn monitor(&self) -> Arc<ShardSetMonitor> {
        Arc::clone(&self.reconciler.monitor)
    }

    pub fn queue_name(&self) -> &str {
        &self.reconciler.queue_name
    }

    pub fn threshold(&self) -> f64 {
        self.reconciler.threshold
    }

    /// Ticks run so far, including failed ones.
    pub fn tick_count(&self) -> u64 {
        self.reconciler.ticks.load(Ordering::Relaxed)
    }
}

impl Drop for ScalingAgent {
    fn drop(&mut self) {
        if let Some(slot) = self.slot.get_mut().take() {
            let _ = slot.shutdown_tx.send(true);
            slot.handle.abort();
        }
    }
}

/// The reconciliation loop for a single virtual queue.
async fn run_agent_loop(
    reconciler: Arc<Reconciler>,
    interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    debug!(queue = %reconciler.queue_name, "scaling loop starting");

    loop {
        tokio::select! {
            _ = tokio::time::sleep(interval) => {}
            _ = shutdown.changed() => break,
        }
        if *shutdown.borrow() {
            break;
        }

        if let Err(e) = reconciler.tick().await {
            warn!(
                queue = %reconciler.queue_name,
                error = %e,
                "scaling tick failed; retrying next interval"
            );
        }
    }

    debug!(queue = %reconciler.queue_name, "scaling loop shutting down");
}
