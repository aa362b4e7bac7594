//! Per-task dispatch worker
//!
//! One worker drives one [`DispatchTask`] from `Pending` to a terminal status,
//! feeding its chunks into the task's channel. Transport failures and timeouts
//! are retried while nothing has reached the caller yet; cancellation is
//! checked before acquiring a connection and before every chunk.

use backoff::backoff::Backoff;
use backoff::ExponentialBackoffBuilder;
use futures::StreamExt;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{timeout, timeout_at, Instant};
use tracing::{debug, info, warn};

use crate::adapters::metrics_handler::MetricsCollector;
use crate::aggregator::TaskSender;
use crate::connection::{ConnectionHandle, ConnectionManager};
use crate::domain::{CancelFlag, DispatchTask, RemoteTaskState, TaskStatus};
use crate::error::{DispatchError, DispatchResult};

/// Timeouts, retries and transport preferences for dispatches
#[derive(Debug, Clone)]
pub struct DispatchPolicy {
    /// Bound on one attempt, from submission to the remote's last update
    pub timeout: Duration,
    /// Attempts allowed after the first one
    pub max_retries: u32,
    pub retry_base_delay: Duration,
    /// Ask streaming-capable agents for incremental updates
    pub prefer_streaming: bool,
    pub channel_buffer: usize,
    /// Bound on the best-effort remote `tasks/cancel` call
    pub cancel_timeout: Duration,
}

impl Default for DispatchPolicy {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            max_retries: 2,
            retry_base_delay: Duration::from_millis(500),
            prefer_streaming: true,
            channel_buffer: 64,
            cancel_timeout: Duration::from_secs(2),
        }
    }
}

pub(crate) struct Worker {
    pub connections: Arc<ConnectionManager>,
    pub policy: DispatchPolicy,
    pub metrics: Option<Arc<MetricsCollector>>,
}

impl Worker {
    /// Runs `task` to a terminal status and sends its terminal marker
    pub async fn run(
        self: Arc<Self>,
        mut task: DispatchTask,
        mut sender: TaskSender,
        cancel: CancelFlag,
    ) -> DispatchTask {
        let started = Instant::now();
        let mut schedule = ExponentialBackoffBuilder::new()
            .with_initial_interval(self.policy.retry_base_delay)
            .with_multiplier(2.0)
            .with_randomization_factor(0.0)
            .with_max_elapsed_time(None)
            .build();

        let result = loop {
            task.attempts += 1;
            let error = match self.attempt(&mut task, &mut sender, &cancel).await {
                Ok(()) => break Ok(()),
                Err(error) => error,
            };

            let retryable = error.is_retryable()
                && sender.chunks_sent() == 0
                && task.attempts <= self.policy.max_retries
                && !cancel.is_cancelled();
            if !retryable {
                break Err(error);
            }

            let delay = schedule.next_backoff().unwrap_or(self.policy.retry_base_delay);
            warn!(
                task_id = %task.id,
                agent = %task.target,
                attempt = task.attempts,
                error = %error,
                delay_ms = delay.as_millis() as u64,
                "Dispatch attempt failed, retrying"
            );
            if let Some(metrics) = &self.metrics {
                metrics
                    .dispatch_retries
                    .with_label_values(&[task.target.as_str()])
                    .inc();
            }

            tokio::select! {
                _ = cancel.cancelled() => break Err(DispatchError::Cancelled),
                _ = tokio::time::sleep(delay) => {}
            }
        };

        let transition = match result {
            Ok(()) => task.transition(TaskStatus::Completed),
            Err(DispatchError::Cancelled) => task.transition(TaskStatus::Cancelled),
            Err(error) => task.fail(error),
        };
        if let Err(e) = transition {
            warn!(task_id = %task.id, error = %e, "Ignoring late status change");
        }

        info!(
            task_id = %task.id,
            agent = %task.target,
            status = %task.status(),
            attempts = task.attempts,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Dispatch finished"
        );
        if let Some(metrics) = &self.metrics {
            let status = task.status().to_string();
            metrics
                .dispatches_total
                .with_label_values(&[task.target.as_str(), status.as_str()])
                .inc();
            metrics
                .dispatch_duration
                .with_label_values(&[task.target.as_str()])
                .observe(started.elapsed().as_secs_f64());
        }

        sender.finish(task.status(), task.error().cloned()).await;
        task
    }

    async fn attempt(
        &self,
        task: &mut DispatchTask,
        sender: &mut TaskSender,
        cancel: &CancelFlag,
    ) -> DispatchResult<()> {
        if cancel.is_cancelled() {
            return Err(DispatchError::Cancelled);
        }

        let handle = self.connections.acquire(&task.target)?;
        let result = self.exchange(&handle, task, sender, cancel).await;
        self.connections.release(handle);
        result
    }

    async fn exchange(
        &self,
        handle: &ConnectionHandle,
        task: &mut DispatchTask,
        sender: &mut TaskSender,
        cancel: &CancelFlag,
    ) -> DispatchResult<()> {
        let deadline = Instant::now() + self.policy.timeout;
        let timeout_error = || DispatchError::Timeout(self.policy.timeout.as_millis() as u64);

        debug!(
            task_id = %task.id,
            agent = %task.target,
            streaming = task.request.streaming,
            continuing = task.request.task_id.is_some(),
            "Submitting task"
        );
        let mut stream = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(DispatchError::Cancelled),
            submitted = timeout_at(deadline, handle.send(&task.request)) => {
                submitted.map_err(|_| timeout_error())??
            }
        };

        if task.status() == TaskStatus::Pending {
            let _ = task.transition(TaskStatus::Streaming);
        }

        loop {
            let next = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    self.cancel_remote(handle, task).await;
                    return Err(DispatchError::Cancelled);
                }
                next = timeout_at(deadline, stream.next()) => next,
            };

            let update = match next {
                Err(_) => {
                    self.cancel_remote(handle, task).await;
                    return Err(timeout_error());
                }
                // A reply to `message/send` ends with its single update.
                Ok(None) if !task.request.streaming => return Ok(()),
                Ok(None) => {
                    return Err(DispatchError::Transport(
                        "stream ended before a final update".to_string(),
                    ))
                }
                Ok(Some(Err(error))) => {
                    if error.poisons_connection() {
                        handle.mark_failed();
                    }
                    return Err(error);
                }
                Ok(Some(Ok(update))) => update,
            };

            if let Some(remote_task) = &update.task_id {
                task.remote.task_id = Some(remote_task.clone());
            }
            if let Some(context) = &update.context_id {
                task.remote.context_id = Some(context.clone());
            }

            let reason = || update.text.clone().unwrap_or_else(|| "no reason given".to_string());
            match update.state {
                Some(RemoteTaskState::Rejected) => return Err(DispatchError::Rejected(reason())),
                Some(RemoteTaskState::Failed) => return Err(DispatchError::RemoteFailed(reason())),
                Some(RemoteTaskState::Canceled) => return Err(DispatchError::Cancelled),
                _ => {}
            }

            if let Some(text) = update.text {
                match update.state {
                    Some(RemoteTaskState::Submitted | RemoteTaskState::Working) => {
                        sender.progress(text).await
                    }
                    _ => sender.chunk(text).await,
                };
            }

            match update.state {
                Some(state) if state.awaits_input() => {
                    task.awaiting_input = true;
                    return Ok(());
                }
                Some(RemoteTaskState::Completed) => {
                    task.remote.task_id = None;
                    return Ok(());
                }
                _ if update.last => return Ok(()),
                _ => {}
            }
        }
    }

    /// Best-effort remote cancellation of the task's remote counterpart
    async fn cancel_remote(&self, handle: &ConnectionHandle, task: &DispatchTask) {
        let Some(remote_task) = task.remote.task_id.as_deref() else {
            return;
        };
        match timeout(self.policy.cancel_timeout, handle.cancel_task(remote_task)).await {
            Ok(Ok(())) => debug!(task_id = %task.id, remote_task, "Remote task cancelled"),
            Ok(Err(e)) => warn!(task_id = %task.id, remote_task, error = %e, "Remote cancel failed"),
            Err(_) => warn!(task_id = %task.id, remote_task, "Remote cancel timed out"),
        }
    }
}
