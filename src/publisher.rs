// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Message Publisher
//!
//! [`Publisher`] is the seam used by producers and by the RPC router;
//! [`RabbitMQPublisher`] implements it on a lapin channel with publisher
//! confirms and OpenTelemetry context propagation.

use crate::{
    connection::Session,
    errors::{AmqpError, PublishError},
    message::{Destination, PublishOptions, PERSISTENT_DELIVERY_MODE},
    otel,
};
use async_trait::async_trait;
use lapin::{
    options::{BasicPublishOptions, ConfirmSelectOptions},
    types::{FieldTable, ShortString},
    BasicProperties, Channel,
};
use opentelemetry::Context;
use std::{sync::Arc, time::Duration};
use tokio::sync::Mutex;
use tracing::{debug, error};
use uuid::Uuid;

/// Default content type for JSON messages
pub const JSON_CONTENT_TYPE: &str = "application/json";

/// Sends messages to a destination. Fire-and-forget: success means the broker
/// took the message, not that anybody processed it.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Publisher: Send + Sync {
    /// Publishes one message.
    ///
    /// # Parameters
    /// * `destination` - Queue to route to directly, or exchange to publish on
    /// * `payload` - Message body
    /// * `opts` - Delivery mode, correlation and reply-to properties
    ///
    /// # Returns
    /// Ok once the broker confirmed the message, or why it was not taken
    async fn publish(
        &self,
        destination: &Destination,
        payload: &[u8],
        opts: &PublishOptions,
    ) -> Result<(), PublishError>;
}

/// RabbitMQ implementation of the Publisher trait.
///
/// Concurrent callers are serialized on an internal lock so only one publish
/// is written to the channel at a time.
pub struct RabbitMQPublisher {
    channel: Mutex<Arc<Channel>>,
    blocked_timeout: Duration,
}

impl RabbitMQPublisher {
    /// Wraps an open channel. `blocked_timeout` bounds how long a publish may
    /// wait on a broker that stopped accepting messages.
    pub fn new(channel: Arc<Channel>, blocked_timeout: Duration) -> Arc<RabbitMQPublisher> {
        Arc::new(RabbitMQPublisher {
            channel: Mutex::new(channel),
            blocked_timeout,
        })
    }

    /// Opens a dedicated channel on `session` with publisher confirms enabled.
    ///
    /// # Parameters
    /// * `session` - The live connection to open the channel on
    ///
    /// # Returns
    /// The publisher, or an error if the channel or confirm mode could not be set up
    pub async fn open(session: &Session) -> Result<Arc<RabbitMQPublisher>, AmqpError> {
        let channel = session.channel().await?;

        channel
            .confirm_select(ConfirmSelectOptions::default())
            .await
            .map_err(|err| {
                error!(error = err.to_string(), "failure to enable publisher confirms");
                AmqpError::ChannelError
            })?;

        Ok(RabbitMQPublisher::new(channel, session.blocked_timeout()))
    }
}

#[async_trait]
impl Publisher for RabbitMQPublisher {
    async fn publish(
        &self,
        destination: &Destination,
        payload: &[u8],
        opts: &PublishOptions,
    ) -> Result<(), PublishError> {
        let channel = self.channel.lock().await;

        if !channel.status().connected() {
            error!(destination = %destination, "publishing on a closed channel");
            return Err(PublishError::NotConnected);
        }

        let props = properties(opts, otel::inject_context(&Context::current()));

        let publish = async {
            let confirm = channel
                .basic_publish(
                    destination.exchange(),
                    destination.routing_key(),
                    BasicPublishOptions {
                        immediate: false,
                        mandatory: false,
                    },
                    payload,
                    props,
                )
                .await
                .map_err(publish_error)?;

            let confirmation = confirm.await.map_err(publish_error)?;
            if confirmation.is_nack() {
                return Err(PublishError::BrokerRejected("nacked by broker".to_owned()));
            }

            Ok(())
        };

        match tokio::time::timeout(self.blocked_timeout, publish).await {
            Err(_) => {
                error!(destination = %destination, "publish blocked by the broker");
                Err(PublishError::Blocked(self.blocked_timeout))
            }
            Ok(Err(err)) => {
                error!(destination = %destination, error = err.to_string(), "error publishing message");
                Err(err)
            }
            Ok(Ok(())) => {
                debug!(destination = %destination, "message published");
                Ok(())
            }
        }
    }
}

fn publish_error(err: lapin::Error) -> PublishError {
    match err {
        lapin::Error::InvalidChannelState(_)
        | lapin::Error::InvalidConnectionState(_)
        | lapin::Error::IOError(_) => PublishError::NotConnected,
        other => PublishError::BrokerRejected(other.to_string()),
    }
}

/// AMQP properties for an outgoing message.
pub(crate) fn properties(opts: &PublishOptions, headers: FieldTable) -> BasicProperties {
    let mut props = BasicProperties::default()
        .with_content_type(ShortString::from(JSON_CONTENT_TYPE))
        .with_message_id(ShortString::from(Uuid::new_v4().to_string()))
        .with_headers(headers);

    if opts.persistent {
        props = props.with_delivery_mode(PERSISTENT_DELIVERY_MODE);
    }
    if let Some(id) = &opts.correlation_id {
        props = props.with_correlation_id(ShortString::from(id.clone()));
    }
    if let Some(queue) = &opts.reply_to {
        props = props.with_reply_to(ShortString::from(queue.clone()));
    }

    props
}
