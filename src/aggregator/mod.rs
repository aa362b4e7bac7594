//! Response aggregator
//!
//! Merges the per-task streams of one request into a single caller-facing
//! stream. Chunks of one task keep their order; chunks of different tasks
//! interleave in arrival order. Every task gets a `TaskFinished` marker and the
//! stream ends with exactly one `Finished` once all tasks are terminal.

mod stream;

pub use stream::{task_channel, AggregatedStream, TaskResult, TaskSender, TaskStream};

use futures::stream::select_all;
use futures::StreamExt;
use std::collections::HashMap;
use tokio::sync::mpsc;
use tracing::{debug, info};

use crate::domain::{AggregateEvent, AggregateOutcome, TaskFailure, TaskPayload, TaskStatus};
use crate::error::DispatchError;
use stream::TaskMessage;

pub struct Aggregator {
    buffer: usize,
}

impl Default for Aggregator {
    fn default() -> Self {
        Self::new(64)
    }
}

impl Aggregator {
    pub fn new(buffer: usize) -> Self {
        Self { buffer }
    }

    /// Spawns the merge of `streams` and returns the merged stream
    pub fn aggregate(&self, streams: Vec<TaskStream>) -> AggregatedStream {
        let (sender, output) = AggregatedStream::channel(self.buffer);
        tokio::spawn(merge(streams, sender));
        output
    }
}

/// Drives the merge to completion, even after the caller stops listening, so
/// every producer can reach its terminal state.
pub async fn merge(streams: Vec<TaskStream>, sender: mpsc::Sender<AggregateEvent>) -> AggregateOutcome {
    let order: HashMap<_, _> = streams
        .iter()
        .enumerate()
        .map(|(index, stream)| (stream.task_id().clone(), index))
        .collect();
    let total = streams.len();

    let mut merged = select_all(streams.into_iter().map(|s| Box::pin(s.into_messages())));
    let mut results: Vec<TaskResult> = Vec::with_capacity(total);
    let mut detached = false;

    while let Some(message) = merged.next().await {
        let event = match message {
            TaskMessage::Chunk(chunk) => AggregateEvent::Chunk(chunk),
            TaskMessage::Finished(result) => {
                debug!(
                    task_id = %result.task_id,
                    agent = %result.agent,
                    status = %result.status,
                    "Task finished"
                );
                let event = AggregateEvent::TaskFinished {
                    task_id: result.task_id.clone(),
                    agent: result.agent.clone(),
                    status: result.status,
                    error: result.error.as_ref().map(ToString::to_string),
                };
                results.push(result);
                event
            }
        };

        if !detached && sender.send(event).await.is_err() {
            debug!("Aggregated stream receiver dropped, draining remaining tasks");
            detached = true;
        }
    }

    results.sort_by_key(|r| order.get(&r.task_id).copied().unwrap_or(usize::MAX));
    let outcome = outcome_of(results);
    info!(
        tasks = total,
        succeeded = outcome.payloads().len(),
        failed = outcome.failures().len(),
        "Aggregation finished"
    );

    if !detached {
        let _ = sender.send(AggregateEvent::Finished(outcome.clone())).await;
    }
    outcome
}

/// Classifies terminal task results into the overall outcome
pub fn outcome_of(results: Vec<TaskResult>) -> AggregateOutcome {
    let mut payloads = Vec::new();
    let mut failures = Vec::new();

    for result in results {
        match result.status {
            TaskStatus::Completed => payloads.push(TaskPayload {
                task_id: result.task_id,
                agent: result.agent,
                content: result.content,
            }),
            status => {
                let error = result.error.unwrap_or(match status {
                    TaskStatus::Cancelled => DispatchError::Cancelled,
                    _ => DispatchError::Internal(format!("task ended as {}", status)),
                });
                failures.push(TaskFailure {
                    task_id: result.task_id,
                    agent: result.agent,
                    error,
                });
            }
        }
    }

    AggregateOutcome::from_results(payloads, failures)
}
