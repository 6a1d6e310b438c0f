//! Task supervision: start, monitor, restart, and orderly shutdown.
//!
//! Listeners and the shipper run as independent supervised tasks. The
//! supervisor restarts a crashed task with exponential backoff (reset after
//! a stable run); once the restart budget inside the window is spent, the
//! task is marked degraded and left down while the process keeps running.
//! SIGTERM/SIGINT stop listeners first, then the shipper, bounded by the
//! shutdown grace. SIGHUP invokes a reload callback for safe tunables.

use crate::health::{HealthState, ServiceStatus};
use crate::metrics::Metrics;
use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

pub type TaskError = Box<dyn std::error::Error + Send + Sync>;

/// Contract for anything the supervisor owns.
///
/// `run` holds the task's whole lifetime and returns when cancelled (clean)
/// or on failure (restarted). `healthy` is polled while the task runs.
#[async_trait]
pub trait SupervisedTask: Send + Sync {
    fn name(&self) -> &str;

    async fn run(&self, cancel: CancellationToken) -> Result<(), TaskError>;

    fn healthy(&self) -> bool;
}

#[derive(Debug, Clone)]
pub struct RestartPolicy {
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    /// A run longer than this resets the backoff and the restart window.
    pub reset_after: Duration,
    /// Restarts allowed within `window` before the task degrades.
    pub max_restarts: u32,
    pub window: Duration,
}

impl Default for RestartPolicy {
    fn default() -> Self {
        RestartPolicy {
            initial_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(30),
            reset_after: Duration::from_secs(60),
            max_restarts: 10,
            window: Duration::from_secs(300),
        }
    }
}

#[derive(Debug, Error)]
pub enum SupervisorError {
    #[error("failed to install signal handler: {0}")]
    Signal(#[from] std::io::Error),
}

/// Why the supervisor returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitReason {
    /// SIGTERM or an internal stop: exit code 0.
    Normal,
    /// SIGINT: exit code 130.
    Interrupted,
}

/// Owns listener tasks plus the shipper, which always shuts down last.
pub struct Supervisor {
    listeners: Vec<Arc<dyn SupervisedTask>>,
    shipper: Arc<dyn SupervisedTask>,
    health: Arc<HealthState>,
    metrics: Arc<Metrics>,
    policy: RestartPolicy,
    shutdown_grace: Duration,
}

impl Supervisor {
    pub fn new(
        listeners: Vec<Arc<dyn SupervisedTask>>,
        shipper: Arc<dyn SupervisedTask>,
        health: Arc<HealthState>,
        metrics: Arc<Metrics>,
        policy: RestartPolicy,
        shutdown_grace: Duration,
    ) -> Self {
        Supervisor {
            listeners,
            shipper,
            health,
            metrics,
            policy,
            shutdown_grace,
        }
    }

    /// Runs until a shutdown signal arrives, then drains in order:
    /// listeners stop producing first, the shipper flushes last.
    pub async fn run(
        self,
        mut on_sighup: Option<Box<dyn FnMut() + Send>>,
    ) -> Result<ExitReason, SupervisorError> {
        self.health.set_status(ServiceStatus::Starting);

        let listener_stop = CancellationToken::new();
        let shipper_stop = CancellationToken::new();

        let mut listener_monitors = Vec::new();
        for task in &self.listeners {
            listener_monitors.push(tokio::spawn(supervise(
                Arc::clone(task),
                listener_stop.clone(),
                self.policy.clone(),
                Arc::clone(&self.health),
                Arc::clone(&self.metrics),
            )));
        }
        let mut shipper_monitor = tokio::spawn(supervise(
            Arc::clone(&self.shipper),
            shipper_stop.clone(),
            self.policy.clone(),
            Arc::clone(&self.health),
            Arc::clone(&self.metrics),
        ));

        self.health.set_status(ServiceStatus::Healthy);
        info!(
            listeners = self.listeners.len(),
            "supervisor started all tasks"
        );

        let reason = self.wait_for_shutdown(&mut on_sighup).await?;

        self.health.set_status(ServiceStatus::ShuttingDown);
        info!(?reason, "supervisor shutting down");

        // Listeners stop producing before the shipper drains.
        listener_stop.cancel();
        let deadline = Instant::now() + self.shutdown_grace;
        for mut monitor in listener_monitors {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if tokio::time::timeout(remaining, &mut monitor).await.is_err() {
                warn!("listener did not stop within grace, aborting");
                monitor.abort();
            }
        }

        shipper_stop.cancel();
        let remaining = deadline.saturating_duration_since(Instant::now());
        let shipper_grace = remaining.max(Duration::from_secs(1));
        if tokio::time::timeout(shipper_grace, &mut shipper_monitor)
            .await
            .is_err()
        {
            warn!("shipper did not stop within grace, aborting");
            shipper_monitor.abort();
        }

        self.metrics.up.set(0);
        info!("supervisor shutdown complete");
        Ok(reason)
    }

    #[cfg(unix)]
    async fn wait_for_shutdown(
        &self,
        on_sighup: &mut Option<Box<dyn FnMut() + Send>>,
    ) -> Result<ExitReason, SupervisorError> {
        use tokio::signal::unix::{signal, SignalKind};

        let mut sigterm = signal(SignalKind::terminate())?;
        let mut sigint = signal(SignalKind::interrupt())?;
        let mut sighup = signal(SignalKind::hangup())?;
        let mut health_tick = tokio::time::interval(Duration::from_secs(5));

        loop {
            tokio::select! {
                _ = sigterm.recv() => return Ok(ExitReason::Normal),
                _ = sigint.recv() => return Ok(ExitReason::Interrupted),
                _ = sighup.recv() => {
                    info!("received SIGHUP, reloading safe tunables");
                    if let Some(reload) = on_sighup.as_mut() {
                        reload();
                    }
                }
                _ = health_tick.tick() => self.refresh_health(),
            }
        }
    }

    #[cfg(not(unix))]
    async fn wait_for_shutdown(
        &self,
        _on_sighup: &mut Option<Box<dyn FnMut() + Send>>,
    ) -> Result<ExitReason, SupervisorError> {
        let mut health_tick = tokio::time::interval(Duration::from_secs(5));
        loop {
            tokio::select! {
                result = tokio::signal::ctrl_c() => {
                    result?;
                    return Ok(ExitReason::Interrupted);
                }
                _ = health_tick.tick() => self.refresh_health(),
            }
        }
    }

    /// Re-evaluates per-task health predicates and the aggregate status.
    fn refresh_health(&self) {
        for task in self.listeners.iter().chain(std::iter::once(&self.shipper)) {
            let healthy = task.healthy();
            self.health.set_task_healthy(task.name(), healthy);
            self.metrics
                .component_healthy
                .with_label_values(&[task.name()])
                .set(i64::from(healthy));
        }
        let status = if self.health.any_degraded() {
            ServiceStatus::Degraded
        } else {
            ServiceStatus::Healthy
        };
        if self.health.status() != ServiceStatus::ShuttingDown {
            self.health.set_status(status);
        }
    }
}

/// Monitor loop for one task: run, observe termination, back off, restart.
async fn supervise(
    task: Arc<dyn SupervisedTask>,
    stop: CancellationToken,
    policy: RestartPolicy,
    health: Arc<HealthState>,
    metrics: Arc<Metrics>,
) {
    let name = task.name().to_string();
    let mut backoff = policy.initial_backoff;
    let mut restarts: VecDeque<Instant> = VecDeque::new();

    loop {
        if stop.is_cancelled() {
            return;
        }

        health.task_started(&name);
        metrics.component_healthy.with_label_values(&[name.as_str()]).set(1);
        let started = Instant::now();

        let run_cancel = stop.child_token();
        let task_run = Arc::clone(&task);
        let handle: JoinHandle<Result<(), TaskError>> =
            tokio::spawn(async move { task_run.run(run_cancel).await });
        let outcome = handle.await;
        let ran_for = started.elapsed();

        if stop.is_cancelled() {
            debug!(task = %name, "task stopped on request");
            health.task_stopped(&name);
            metrics.component_healthy.with_label_values(&[name.as_str()]).set(0);
            return;
        }

        let error_text = match outcome {
            Ok(Ok(())) => "task exited unexpectedly".to_string(),
            Ok(Err(e)) => e.to_string(),
            Err(join_err) if join_err.is_panic() => "task panicked".to_string(),
            Err(join_err) => join_err.to_string(),
        };
        warn!(task = %name, error = %error_text, ran_for_ms = ran_for.as_millis() as u64,
              "supervised task terminated");
        health.task_failed(&name, &error_text);
        metrics.component_healthy.with_label_values(&[name.as_str()]).set(0);

        // A long stable run earns a fresh backoff and window.
        if ran_for >= policy.reset_after {
            backoff = policy.initial_backoff;
            restarts.clear();
        }

        let now = Instant::now();
        restarts.push_back(now);
        while restarts
            .front()
            .map(|t| now.duration_since(*t) > policy.window)
            .unwrap_or(false)
        {
            restarts.pop_front();
        }
        if restarts.len() as u32 > policy.max_restarts {
            error!(task = %name, restarts = restarts.len(),
                   "restart budget exhausted, marking task degraded");
            health.task_degraded(&name);
            return;
        }

        tokio::select! {
            _ = stop.cancelled() => return,
            _ = tokio::time::sleep(backoff) => {}
        }
        backoff = (backoff * 2).min(policy.max_backoff);
        health.task_restarted(&name);
    }
}
