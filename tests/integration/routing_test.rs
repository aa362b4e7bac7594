use super::common::{self, FakeAgent};

use axum::http::StatusCode;
use futures::StreamExt;
use std::collections::HashMap;
use std::time::Duration;
use switchboard::domain::{AggregateEvent, AggregateOutcome, TaskStatus};
use switchboard::error::{AggregationError, DispatchError};

fn weather() -> FakeAgent {
    FakeAgent::new("weather").with_skill("forecast", &["weather"])
}

fn lodging() -> FakeAgent {
    FakeAgent::new("lodging").with_skill("search", &["hotel", "lodging"])
}

fn finished_count(events: &[AggregateEvent]) -> usize {
    events.iter().filter(|e| e.is_finished()).count()
}

fn outcome(events: &[AggregateEvent]) -> &AggregateOutcome {
    match events.last() {
        Some(AggregateEvent::Finished(outcome)) => outcome,
        other => panic!("stream did not end with Finished: {other:?}"),
    }
}

#[tokio::test]
async fn test_weather_and_lodging_request_reaches_both_agents() {
    let weather = weather()
        .with_chunks(&["Sunny, ", "22C in Paris"])
        .spawn()
        .await;
    let lodging = lodging()
        .streaming(false)
        .with_chunks(&["Hotel du Louvre has rooms"])
        .spawn()
        .await;
    let host = common::start_host(&common::settings(&[&weather, &lodging])).await;

    let events = host
        .handle_user_message(None, "What's the weather in Paris, and find me a hotel there")
        .await
        .unwrap()
        .collect()
        .await;

    assert!(matches!(
        &events[0],
        AggregateEvent::Dispatched { tasks, .. } if tasks.len() == 2
    ));
    assert_eq!(finished_count(&events), 1);

    let outcome = outcome(&events);
    assert!(outcome.is_success());
    let text = outcome.combined_text();
    assert!(text.contains("Sunny, 22C in Paris"));
    assert!(text.contains("Hotel du Louvre has rooms"));

    let methods: Vec<_> = lodging
        .recorded
        .requests()
        .iter()
        .map(|r| r["method"].as_str().unwrap_or_default().to_string())
        .collect();
    assert_eq!(methods, vec!["message/send"]);
}

#[tokio::test]
async fn test_forecast_request_reaches_only_weather_agent() {
    let weather = weather().with_chunks(&["Sunny, 22C"]).spawn().await;
    let lodging = lodging().with_chunks(&["Hotel du Louvre"]).spawn().await;
    let mut settings = common::settings(&[&weather, &lodging]);
    settings
        .matching
        .aliases
        .insert("weather".to_string(), vec!["forecast".to_string()]);
    let host = common::start_host(&settings).await;

    let events = host
        .handle_user_message(None, "What's the forecast in Paris?")
        .await
        .unwrap()
        .collect()
        .await;

    match &events[0] {
        AggregateEvent::Dispatched { tasks, .. } => {
            assert_eq!(tasks.len(), 1);
            assert_eq!(tasks[0].1.as_str(), "weather");
        }
        other => panic!("unexpected first event {other:?}"),
    }
    let outcome = outcome(&events);
    assert!(outcome.is_success());
    assert_eq!(outcome.combined_text(), "Sunny, 22C");
    assert!(lodging.recorded.requests().is_empty());
}

#[tokio::test]
async fn test_chunk_sequences_increase_per_task() {
    let weather = weather()
        .with_chunks(&["a", "b", "c", "d"])
        .with_chunk_delay(Duration::from_millis(5))
        .spawn()
        .await;
    let lodging = lodging()
        .with_chunks(&["1", "2", "3"])
        .with_chunk_delay(Duration::from_millis(5))
        .spawn()
        .await;
    let host = common::start_host(&common::settings(&[&weather, &lodging])).await;

    let events = host
        .handle_user_message(None, "weather and hotel please")
        .await
        .unwrap()
        .collect()
        .await;

    let mut last_seen = HashMap::new();
    let mut finished_tasks = Vec::new();
    for event in &events {
        match event {
            AggregateEvent::Chunk(chunk) => {
                assert!(!finished_tasks.contains(&chunk.task_id), "chunk after terminal marker");
                if let Some(previous) = last_seen.insert(chunk.task_id.clone(), chunk.sequence) {
                    assert!(chunk.sequence > previous);
                }
            }
            AggregateEvent::TaskFinished { task_id, .. } => finished_tasks.push(task_id.clone()),
            _ => {}
        }
    }
    assert_eq!(finished_tasks.len(), 2);
    assert_eq!(finished_count(&events), 1);
}

#[tokio::test]
async fn test_mid_stream_timeout_fails_without_retry() {
    let weather = weather()
        .with_chunks(&["one", "two", "three", "four", "five"])
        .hang_after(2)
        .spawn()
        .await;
    let mut settings = common::settings(&[&weather]);
    settings.dispatch.timeout_ms = 300;
    let host = common::start_host(&settings).await;

    let events = host
        .handle_user_message(None, "weather tomorrow?")
        .await
        .unwrap()
        .collect()
        .await;

    let chunks: Vec<_> = events
        .iter()
        .filter_map(|e| match e {
            AggregateEvent::Chunk(chunk) => Some(chunk.content.as_str()),
            _ => None,
        })
        .collect();
    assert_eq!(chunks, vec!["one", "two"]);

    assert!(events.iter().any(|e| matches!(
        e,
        AggregateEvent::TaskFinished { status: TaskStatus::Failed, .. }
    )));

    match outcome(&events) {
        AggregateOutcome::Failure {
            error: AggregationError::TotalFailure { failures },
            ..
        } => {
            assert_eq!(failures.len(), 1);
            assert!(matches!(failures[0].error, DispatchError::Timeout(300)));
        }
        other => panic!("unexpected outcome {other:?}"),
    }

    let streams = weather
        .recorded
        .requests()
        .iter()
        .filter(|r| r["method"] == "message/stream")
        .count();
    assert_eq!(streams, 1);
    assert_eq!(weather.recorded.cancels(), vec!["weather-task"]);
}

#[tokio::test]
async fn test_partial_failure_keeps_successful_payloads() {
    let weather = weather().with_chunks(&["Rain"]).spawn().await;
    let lodging = lodging().failing_with(StatusCode::BAD_REQUEST).spawn().await;
    let host = common::start_host(&common::settings(&[&weather, &lodging])).await;

    let outcome = host
        .handle_user_message(None, "weather and a hotel")
        .await
        .unwrap()
        .outcome()
        .await;

    match &outcome {
        AggregateOutcome::PartialSuccess {
            payloads,
            warning: AggregationError::PartialFailure { failures },
            ..
        } => {
            assert_eq!(payloads.len(), 1);
            assert_eq!(payloads[0].content, "Rain");
            assert_eq!(failures.len(), 1);
            assert_eq!(failures[0].agent.as_str(), "lodging");
        }
        other => panic!("unexpected outcome {other:?}"),
    }
    // Protocol errors are not retried
    assert_eq!(lodging.recorded.requests().len(), 1);
}

#[tokio::test]
async fn test_total_failure_lists_every_error() {
    let weather = weather()
        .failing_with(StatusCode::INTERNAL_SERVER_ERROR)
        .spawn()
        .await;
    let lodging = lodging()
        .failing_with(StatusCode::INTERNAL_SERVER_ERROR)
        .spawn()
        .await;
    let host = common::start_host(&common::settings(&[&weather, &lodging])).await;

    let outcome = host
        .handle_user_message(None, "weather and a hotel")
        .await
        .unwrap()
        .outcome()
        .await;

    match &outcome {
        AggregateOutcome::Failure {
            error: AggregationError::TotalFailure { failures },
            ..
        } => {
            assert_eq!(failures.len(), 2);
            assert!(failures
                .iter()
                .all(|f| matches!(f.error, DispatchError::Transport(_))));
        }
        other => panic!("unexpected outcome {other:?}"),
    }
    // One retry each
    assert_eq!(weather.recorded.requests().len(), 2);
    assert_eq!(lodging.recorded.requests().len(), 2);
}

#[tokio::test]
async fn test_cancel_leaves_no_running_task() {
    let weather = weather()
        .with_chunks(&["first", "second"])
        .hang_after(1)
        .spawn()
        .await;
    let lodging = lodging()
        .with_chunks(&["first", "second"])
        .hang_after(1)
        .spawn()
        .await;
    let host = common::start_host(&common::settings(&[&weather, &lodging])).await;
    let session_id = host.open_session().await;

    let mut stream = host
        .handle_user_message(Some(session_id.clone()), "weather and a hotel")
        .await
        .unwrap();
    let mut chunks = 0;
    while chunks < 2 {
        match stream.next().await {
            Some(AggregateEvent::Chunk(_)) => chunks += 1,
            Some(_) => {}
            None => panic!("stream ended before any chunk"),
        }
    }

    host.cancel(&session_id).await.unwrap();
    let outcome = stream.outcome().await;
    assert_eq!(outcome.failures().len(), 2);
    assert!(outcome
        .failures()
        .iter()
        .all(|f| matches!(f.error, DispatchError::Cancelled)));

    let state = host.sessions().snapshot(&session_id).await.unwrap();
    assert!(state.in_flight.is_empty());
    assert!(state.turns[0]
        .tasks
        .iter()
        .all(|t| t.status == TaskStatus::Cancelled));
    assert_eq!(weather.recorded.cancels(), vec!["weather-task"]);
    assert_eq!(lodging.recorded.cancels(), vec!["lodging-task"]);
}

#[tokio::test]
async fn test_completed_task_keeps_remote_context() {
    let weather = weather().streaming(false).spawn().await;
    let host = common::start_host(&common::settings(&[&weather])).await;
    let session_id = host.open_session().await;

    for text in ["weather?", "weather in Lyon"] {
        host.handle_user_message(Some(session_id.clone()), text)
            .await
            .unwrap()
            .outcome()
            .await;
    }

    // A completed remote task keeps only its context for the next turn
    let requests = weather.recorded.requests();
    let second = &requests[1]["params"]["message"];
    assert_eq!(second["contextId"], "weather-ctx");
    assert!(second.get("taskId").is_none());
}
