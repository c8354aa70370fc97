// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! Wire payloads and destinations of the todo application: the task queue,
//! the event fanout and the movie lookup served over RPC.

use crate::{
    configs::SubscriberConfig,
    consumer::ConsumerHandler,
    errors::HandlerError,
    exchange::ExchangeDefinition,
    message::Metadata,
    queue::QueueDefinition,
    topology::{AmqpTopology, Topology},
};
use async_trait::async_trait;
use chrono::{DateTime, Local, NaiveDateTime};
use lapin::Channel;
use opentelemetry::Context;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{json, Value};
use std::{sync::Arc, time::Duration};
use tracing::info;

pub const TASK_QUEUE: &str = "todo_tasks";
pub const EVENT_EXCHANGE: &str = "todo_events";
pub const RPC_QUEUE: &str = "rpc_queue";

/// Work item sent to the task queue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskMessage {
    pub task_id: u64,
    pub description: String,
    #[serde(deserialize_with = "iso_timestamp")]
    pub created_at: NaiveDateTime,
}

impl TaskMessage {
    pub fn new(task_id: u64) -> Self {
        TaskMessage {
            task_id,
            description: format!("Task {task_id}"),
            created_at: Local::now().naive_local(),
        }
    }
}

/// Reads an ISO-8601 timestamp with or without a UTC offset. Offset
/// timestamps are converted to UTC.
fn iso_timestamp<'de, D>(deserializer: D) -> Result<NaiveDateTime, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = String::deserialize(deserializer)?;
    match DateTime::parse_from_rfc3339(&raw) {
        Ok(with_offset) => Ok(with_offset.naive_utc()),
        Err(_) => raw.parse::<NaiveDateTime>().map_err(serde::de::Error::custom),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    TodoCreated,
    TodoUpdated,
    TodoDeleted,
}

impl EventType {
    const CYCLE: [EventType; 3] = [
        EventType::TodoCreated,
        EventType::TodoUpdated,
        EventType::TodoDeleted,
    ];

    /// Event type of the `n`th published event.
    pub fn for_sequence(n: u64) -> Self {
        Self::CYCLE[(n % Self::CYCLE.len() as u64) as usize]
    }
}

/// Notification broadcast on the event exchange.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventMessage {
    pub event_type: EventType,
    pub todo_id: u64,
    pub data: Value,
    #[serde(deserialize_with = "iso_timestamp")]
    pub timestamp: NaiveDateTime,
}

impl EventMessage {
    /// The `n`th event of the demo publisher.
    pub fn sample(n: u64) -> Self {
        EventMessage {
            event_type: EventType::for_sequence(n),
            todo_id: n,
            data: json!({
                "text": format!("Task {n}"),
                "completed": n % 2 == 0,
            }),
            timestamp: Local::now().naive_local(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RpcResponse {
    pub status: String,
    pub info: String,
}

/// Answers a `get_movie_info` request.
pub fn movie_details(request: &Value) -> RpcResponse {
    let movie = match request.get("movie_id") {
        Some(Value::String(id)) => id.clone(),
        Some(Value::Null) | None => "unknown".to_owned(),
        Some(id) => id.to_string(),
    };

    RpcResponse {
        status: "success".to_owned(),
        info: format!("Details for movie {movie}"),
    }
}

/// Durable task queue, event fanout and the RPC request queue.
pub fn topology(channel: Arc<Channel>) -> AmqpTopology {
    AmqpTopology::new(channel)
        .queue(QueueDefinition::new(TASK_QUEUE).durable())
        .exchange(ExchangeDefinition::new(EVENT_EXCHANGE).fanout())
        .queue(QueueDefinition::new(RPC_QUEUE))
}

/// Processes tasks, simulating `work` of effort per task.
pub struct TaskHandler {
    work: Duration,
}

impl TaskHandler {
    pub fn new(work: Duration) -> Self {
        TaskHandler { work }
    }
}

#[async_trait]
impl ConsumerHandler for TaskHandler {
    async fn exec(&self, _ctx: &Context, payload: &[u8], meta: &Metadata) -> Result<(), HandlerError> {
        let task: TaskMessage = serde_json::from_slice(payload)?;
        info!(
            task_id = task.task_id,
            redelivered = meta.redelivered,
            "processing task: {}",
            task.description
        );

        tokio::time::sleep(self.work).await;

        info!(task_id = task.task_id, "task completed");
        Ok(())
    }
}

/// Logs every event under the subscriber's name.
pub struct EventHandler {
    subscriber: SubscriberConfig,
}

impl EventHandler {
    pub fn new(subscriber: SubscriberConfig) -> Self {
        EventHandler { subscriber }
    }
}

#[async_trait]
impl ConsumerHandler for EventHandler {
    async fn exec(&self, _ctx: &Context, payload: &[u8], _: &Metadata) -> Result<(), HandlerError> {
        let event: EventMessage = serde_json::from_slice(payload)?;
        info!(
            subscriber = self.subscriber.name.as_str(),
            event_type = ?event.event_type,
            todo_id = event.todo_id,
            "received event: {}",
            event.data
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        ack::{AckDecision, AckPolicy},
        consumer::{spawn_subscription, MockConsumerHandler},
        memory::MemoryBroker,
        message::{encode_json, Destination, PublishOptions},
        publisher::Publisher,
    };
    use chrono::NaiveDate;

    fn new_year() -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2024, 1, 1)
            .unwrap()
            .and_hms_opt(0, 0, 0)
            .unwrap()
    }

    #[test]
    fn task_serializes_with_iso_timestamp() {
        let task = TaskMessage {
            task_id: 1,
            description: "Task 1".to_owned(),
            created_at: new_year(),
        };

        let value = serde_json::to_value(&task).unwrap();
        assert_eq!(
            value,
            json!({"task_id": 1, "description": "Task 1", "created_at": "2024-01-01T00:00:00"})
        );

        let decoded: TaskMessage = serde_json::from_value(value).unwrap();
        assert_eq!(decoded, task);
    }

    #[test]
    fn timestamps_with_an_offset_are_read_as_utc() {
        for created_at in ["2024-01-01T00:00:00Z", "2024-01-01T00:00:00+00:00", "2024-01-01T02:00:00+02:00"] {
            let task: TaskMessage = serde_json::from_value(json!({
                "task_id": 1,
                "description": "Task 1",
                "created_at": created_at,
            }))
            .unwrap();
            assert_eq!(task.created_at, new_year(), "{created_at}");
        }

        let event: EventMessage = serde_json::from_value(json!({
            "event_type": "todo_created",
            "todo_id": 3,
            "data": {},
            "timestamp": "2024-01-01T00:00:00.000Z",
        }))
        .unwrap();
        assert_eq!(event.timestamp, new_year());
    }

    #[test]
    fn fractional_naive_timestamps_are_accepted() {
        let event: EventMessage = serde_json::from_value(json!({
            "event_type": "todo_deleted",
            "todo_id": 2,
            "data": {"text": "Task 2"},
            "timestamp": "2024-01-01T00:00:00.123456",
        }))
        .unwrap();
        assert_eq!(event.timestamp.and_utc().timestamp(), new_year().and_utc().timestamp());
    }

    #[tokio::test]
    async fn task_handler_accepts_offset_timestamps() {
        let handler = TaskHandler::new(Duration::ZERO);
        for payload in [
            r#"{"task_id":1,"description":"Task 1","created_at":"2024-01-01T00:00:00Z"}"#,
            r#"{"task_id":1,"description":"Task 1","created_at":"2024-01-01T00:00:00+00:00"}"#,
        ] {
            handler
                .exec(&Context::new(), payload.as_bytes(), &Metadata::default())
                .await
                .unwrap();
        }
    }

    #[test]
    fn event_types_use_snake_case_names_and_cycle() {
        assert_eq!(
            serde_json::to_value(EventType::TodoDeleted).unwrap(),
            json!("todo_deleted")
        );
        assert_eq!(EventType::for_sequence(1), EventType::TodoUpdated);
        assert_eq!(EventType::for_sequence(2), EventType::TodoDeleted);
        assert_eq!(EventType::for_sequence(3), EventType::TodoCreated);
    }

    #[test]
    fn sample_event_carries_text_and_completion() {
        let event = EventMessage::sample(4);
        assert_eq!(event.todo_id, 4);
        assert_eq!(event.data, json!({"text": "Task 4", "completed": true}));

        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["event_type"], "todo_updated");
    }

    #[test]
    fn movie_details_names_the_requested_movie() {
        let res = movie_details(&json!({"task": "get_movie_info", "movie_id": 42}));
        assert_eq!(res.status, "success");
        assert_eq!(res.info, "Details for movie 42");

        assert_eq!(movie_details(&json!({"movie_id": "tt01"})).info, "Details for movie tt01");
        assert_eq!(movie_details(&json!({})).info, "Details for movie unknown");
    }

    #[tokio::test]
    async fn task_handler_rejects_garbage_as_malformed() {
        let handler = TaskHandler::new(Duration::ZERO);
        let err = handler
            .exec(&Context::new(), b"not json", &Metadata::default())
            .await
            .unwrap_err();
        assert!(matches!(err, HandlerError::Malformed(_)));
    }

    #[tokio::test]
    async fn event_handler_accepts_published_events() {
        let handler = EventHandler::new(SubscriberConfig::new("audit"));
        let payload = encode_json(&EventMessage::sample(1)).unwrap();
        handler
            .exec(&Context::new(), &payload, &Metadata::default())
            .await
            .unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn persistent_task_is_processed_once_and_acked() {
        let broker = MemoryBroker::new();
        broker.declare_queue(TASK_QUEUE);

        let payload = encode_json(&TaskMessage::new(7)).unwrap();
        broker
            .publish(&Destination::queue(TASK_QUEUE), &payload, &PublishOptions::default().persistent())
            .await
            .unwrap();

        let handle = spawn_subscription(
            TASK_QUEUE,
            broker.consume(TASK_QUEUE),
            1,
            AckPolicy::tasks(),
            Arc::new(TaskHandler::new(Duration::from_secs(2))),
        );

        tokio::time::sleep(Duration::from_secs(3)).await;
        handle.shutdown().await.unwrap();

        assert_eq!(broker.settlements(TASK_QUEUE), vec![AckDecision::Ack]);
        assert_eq!(broker.depth(TASK_QUEUE), 0);
    }

    #[tokio::test]
    async fn every_subscriber_gets_each_event_once() {
        let broker = MemoryBroker::new();
        let first = broker.declare_queue("");
        let second = broker.declare_queue("");
        broker.bind(EVENT_EXCHANGE, &first);
        broker.bind(EVENT_EXCHANGE, &second);

        let mut subscriptions = vec![];
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        for queue in [&first, &second] {
            let mut handler = MockConsumerHandler::new();
            let tx = tx.clone();
            let name = queue.clone();
            handler.expect_exec().times(1).returning(move |_, payload, _| {
                let event: EventMessage = serde_json::from_slice(payload).unwrap();
                tx.send((name.clone(), event.todo_id)).unwrap();
                Ok(())
            });

            subscriptions.push(spawn_subscription(
                queue.as_str(),
                broker.consume(queue),
                1,
                AckPolicy::events(),
                Arc::new(handler),
            ));
        }

        let payload = encode_json(&EventMessage::sample(1)).unwrap();
        broker
            .publish(&Destination::fanout(EVENT_EXCHANGE), &payload, &PublishOptions::default())
            .await
            .unwrap();

        let mut received = vec![rx.recv().await.unwrap(), rx.recv().await.unwrap()];
        received.sort();
        let mut expected = vec![(first.clone(), 1), (second.clone(), 1)];
        expected.sort();
        assert_eq!(received, expected);

        for handle in subscriptions {
            handle.shutdown().await.unwrap();
        }
        assert_eq!(broker.settlements(&first), vec![AckDecision::Ack]);
        assert_eq!(broker.settlements(&second), vec![AckDecision::Ack]);
    }
}
