//! Per-task channels and the caller-facing aggregated stream

use futures::{Stream, StreamExt};
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;

use crate::domain::{AgentId, AggregateEvent, AggregateOutcome, ResponseChunk, TaskId, TaskStatus};
use crate::error::DispatchError;

/// Terminal record of one task as seen by the aggregator
#[derive(Debug, Clone)]
pub struct TaskResult {
    pub task_id: TaskId,
    pub agent: AgentId,
    pub status: TaskStatus,
    pub error: Option<DispatchError>,
    /// Concatenated answer content
    pub content: String,
}

#[derive(Debug)]
pub(crate) enum TaskMessage {
    Chunk(ResponseChunk),
    Finished(TaskResult),
}

/// Producer half of one task's channel.
///
/// Sequence numbers are assigned here, so they are monotonic per task.
/// [`TaskSender::finish`] consumes the sender: nothing can follow the
/// terminal marker.
pub struct TaskSender {
    task_id: TaskId,
    agent: AgentId,
    sender: mpsc::Sender<TaskMessage>,
    next_sequence: u64,
    content: String,
}

impl TaskSender {
    pub fn task_id(&self) -> &TaskId {
        &self.task_id
    }

    /// Chunks emitted so far
    pub fn chunks_sent(&self) -> u64 {
        self.next_sequence
    }

    /// Emits answer content; it also becomes part of the task's payload
    pub async fn chunk(&mut self, content: impl Into<String>) -> bool {
        let content = content.into();
        self.content.push_str(&content);
        self.emit(content).await
    }

    /// Emits interim status text that is not part of the final payload
    pub async fn progress(&mut self, content: impl Into<String>) -> bool {
        self.emit(content.into()).await
    }

    async fn emit(&mut self, content: String) -> bool {
        let chunk = ResponseChunk {
            task_id: self.task_id.clone(),
            agent: self.agent.clone(),
            sequence: self.next_sequence,
            content,
        };
        self.next_sequence += 1;
        self.sender.send(TaskMessage::Chunk(chunk)).await.is_ok()
    }

    /// Sends the terminal marker for this task
    pub async fn finish(self, status: TaskStatus, error: Option<DispatchError>) {
        let result = TaskResult {
            task_id: self.task_id,
            agent: self.agent,
            status,
            error,
            content: self.content,
        };
        // A closed receiver means the aggregation was abandoned
        let _ = self.sender.send(TaskMessage::Finished(result)).await;
    }
}

/// Consumer half of one task's channel
pub struct TaskStream {
    task_id: TaskId,
    agent: AgentId,
    receiver: mpsc::Receiver<TaskMessage>,
}

impl TaskStream {
    pub fn task_id(&self) -> &TaskId {
        &self.task_id
    }

    pub fn agent(&self) -> &AgentId {
        &self.agent
    }

    /// Messages of this task, ending with exactly one terminal result.
    ///
    /// A producer that goes away without finishing yields a failed result.
    pub(crate) fn into_messages(self) -> impl Stream<Item = TaskMessage> + Send {
        futures::stream::unfold(Some(self), |state| async move {
            let mut stream = state?;
            match stream.receiver.recv().await {
                Some(TaskMessage::Chunk(chunk)) => Some((TaskMessage::Chunk(chunk), Some(stream))),
                Some(finished) => Some((finished, None)),
                None => {
                    let result = TaskResult {
                        task_id: stream.task_id,
                        agent: stream.agent,
                        status: TaskStatus::Failed,
                        error: Some(DispatchError::Internal(
                            "task ended without a terminal status".to_string(),
                        )),
                        content: String::new(),
                    };
                    Some((TaskMessage::Finished(result), None))
                }
            }
        })
    }
}

/// Creates the channel pair for one task
pub fn task_channel(task_id: TaskId, agent: AgentId, buffer: usize) -> (TaskSender, TaskStream) {
    let (sender, receiver) = mpsc::channel(buffer.max(1));
    (
        TaskSender {
            task_id: task_id.clone(),
            agent: agent.clone(),
            sender,
            next_sequence: 0,
            content: String::new(),
        },
        TaskStream {
            task_id,
            agent,
            receiver,
        },
    )
}

/// Forward-only stream of aggregate events, ending with one `Finished`
pub struct AggregatedStream {
    inner: ReceiverStream<AggregateEvent>,
}

impl AggregatedStream {
    pub fn new(receiver: mpsc::Receiver<AggregateEvent>) -> Self {
        Self {
            inner: ReceiverStream::new(receiver),
        }
    }

    /// Create a channel pair for building an aggregated stream
    pub fn channel(buffer: usize) -> (mpsc::Sender<AggregateEvent>, Self) {
        let (tx, rx) = mpsc::channel(buffer.max(1));
        (tx, Self::new(rx))
    }

    /// Waits for the overall terminal marker, discarding intermediate events
    pub async fn outcome(mut self) -> AggregateOutcome {
        while let Some(event) = self.inner.next().await {
            if let AggregateEvent::Finished(outcome) = event {
                return outcome;
            }
        }
        AggregateOutcome::internal("aggregation ended without a result")
    }

    /// Drains every event
    pub async fn collect(mut self) -> Vec<AggregateEvent> {
        let mut events = Vec::new();
        while let Some(event) = self.inner.next().await {
            events.push(event);
        }
        events
    }
}

impl Stream for AggregatedStream {
    type Item = AggregateEvent;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        Pin::new(&mut self.inner).poll_next(cx)
    }
}
