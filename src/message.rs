// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Messages and Destinations
//!
//! Broker-agnostic view of what flows through the publishers and consumers:
//! where a message goes ([`Destination`]), how it is published
//! ([`PublishOptions`]) and what a consumer receives ([`InboundMessage`]).

use crate::{errors::AmqpError, errors::PublishError, otel};
use async_trait::async_trait;
use futures_util::stream::BoxStream;
use lapin::{
    acker::Acker,
    message::Delivery,
    options::{BasicAckOptions, BasicNackOptions},
};
use opentelemetry::Context;
use serde::Serialize;
use std::fmt;
use tracing::error;

/// Delivery mode that asks the broker to write the message to disk.
pub const PERSISTENT_DELIVERY_MODE: u8 = 2;

/// Named publish/consume target.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Destination {
    /// Point-to-point queue, addressed through the default exchange
    Queue(String),
    /// Fanout exchange. Every subscriber consumes from its own anonymous,
    /// exclusive queue bound to it.
    Fanout(String),
}

impl Destination {
    pub fn queue(name: impl Into<String>) -> Self {
        Destination::Queue(name.into())
    }

    pub fn fanout(exchange: impl Into<String>) -> Self {
        Destination::Fanout(exchange.into())
    }

    /// Exchange to publish to.
    pub fn exchange(&self) -> &str {
        match self {
            Destination::Queue(_) => "",
            Destination::Fanout(exchange) => exchange,
        }
    }

    /// Routing key to publish with. Fanout exchanges ignore it.
    pub fn routing_key(&self) -> &str {
        match self {
            Destination::Queue(queue) => queue,
            Destination::Fanout(_) => "",
        }
    }
}

impl fmt::Display for Destination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Destination::Queue(queue) => write!(f, "queue:{queue}"),
            Destination::Fanout(exchange) => write!(f, "fanout:{exchange}"),
        }
    }
}

/// Per-message publish settings.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PublishOptions {
    pub(crate) persistent: bool,
    pub(crate) correlation_id: Option<String>,
    pub(crate) reply_to: Option<String>,
}

impl PublishOptions {
    /// Asks the broker to keep the message across restarts.
    pub fn persistent(mut self) -> Self {
        self.persistent = true;
        self
    }

    pub fn correlation_id(mut self, id: impl Into<String>) -> Self {
        self.correlation_id = Some(id.into());
        self
    }

    pub fn reply_to(mut self, queue: impl Into<String>) -> Self {
        self.reply_to = Some(queue.into());
        self
    }
}

/// Properties of a received message.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Metadata {
    /// Broker-assigned, only meaningful on the channel that delivered it
    pub delivery_tag: u64,
    pub correlation_id: Option<String>,
    pub reply_to: Option<String>,
    pub persistent: bool,
    pub redelivered: bool,
}

/// Settles a delivery with the broker.
///
/// The consumer calls exactly one of these once per delivery.
#[async_trait]
pub trait Acknowledge: Send + Sync {
    async fn ack(&self) -> Result<(), AmqpError>;

    async fn nack(&self, requeue: bool) -> Result<(), AmqpError>;
}

#[async_trait]
impl Acknowledge for Acker {
    async fn ack(&self) -> Result<(), AmqpError> {
        Acker::ack(self, BasicAckOptions { multiple: false })
            .await
            .map_err(|err| {
                error!(error = err.to_string(), "error whiling ack msg");
                AmqpError::AckMessageError
            })
    }

    async fn nack(&self, requeue: bool) -> Result<(), AmqpError> {
        Acker::nack(
            self,
            BasicNackOptions {
                multiple: false,
                requeue,
            },
        )
        .await
        .map_err(|err| {
            error!(error = err.to_string(), "error whiling nack msg");
            AmqpError::NackMessageError
        })
    }
}

/// Acker for deliveries consumed in auto-ack mode, where the broker settled
/// the message on delivery.
pub struct AutoAcked;

#[async_trait]
impl Acknowledge for AutoAcked {
    async fn ack(&self) -> Result<(), AmqpError> {
        Ok(())
    }

    async fn nack(&self, _requeue: bool) -> Result<(), AmqpError> {
        Ok(())
    }
}

/// A message handed to a consumer, together with the means to settle it.
pub struct InboundMessage {
    pub payload: Vec<u8>,
    pub metadata: Metadata,
    pub(crate) ctx: Context,
    pub(crate) acker: Box<dyn Acknowledge>,
}

impl InboundMessage {
    pub fn new(payload: Vec<u8>, metadata: Metadata, acker: impl Acknowledge + 'static) -> Self {
        InboundMessage {
            payload,
            metadata,
            ctx: Context::new(),
            acker: Box::new(acker),
        }
    }

    /// Trace context the publisher propagated in the message headers.
    pub fn context(&self) -> &Context {
        &self.ctx
    }

    pub(crate) fn from_delivery(delivery: Delivery) -> Self {
        let ctx = otel::extract_context(&delivery.properties);
        let props = &delivery.properties;

        let metadata = Metadata {
            delivery_tag: delivery.delivery_tag,
            correlation_id: props.correlation_id().as_ref().map(|v| v.as_str().to_owned()),
            reply_to: props.reply_to().as_ref().map(|v| v.as_str().to_owned()),
            persistent: *props.delivery_mode() == Some(PERSISTENT_DELIVERY_MODE),
            redelivered: delivery.redelivered,
        };

        InboundMessage {
            payload: delivery.data,
            metadata,
            ctx,
            acker: Box::new(delivery.acker),
        }
    }
}

impl fmt::Debug for InboundMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InboundMessage")
            .field("payload_len", &self.payload.len())
            .field("metadata", &self.metadata)
            .finish()
    }
}

/// Stream of deliveries feeding a subscription. It ends or yields an error
/// when the underlying channel is gone.
pub type DeliveryStream = BoxStream<'static, Result<InboundMessage, AmqpError>>;

/// Serializes a payload as a JSON body.
pub fn encode_json<T: Serialize + ?Sized>(value: &T) -> Result<Vec<u8>, PublishError> {
    serde_json::to_vec(value).map_err(|err| PublishError::Encode(err.to_string()))
}
