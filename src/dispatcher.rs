// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # RabbitMQ Message Dispatcher
//!
//! Binds handlers to destinations on a lapin channel. Queue destinations are
//! consumed directly; fanout destinations get a fresh anonymous exclusive
//! queue bound to the exchange for every subscription.
//!
//! Each subscription runs on its own tokio task, see
//! [`crate::consumer::SubscriptionHandle`]. Stopping a subscription cancels its
//! broker consumer and requeues the deliveries lapin had already buffered; the
//! channel itself stays open until [`RabbitMQDispatcher::close`].

use crate::{
    ack::AckPolicy,
    connection::Session,
    consumer::{requeue_buffered, spawn_subscription_with, ConsumerHandler, SubscriptionHandle},
    errors::{AmqpError, SubscriptionError},
    exchange::ExchangeDefinition,
    message::{DeliveryStream, Destination, InboundMessage},
    queue::{QueueBinding, QueueDefinition},
    topology,
};
use futures_util::StreamExt;
use lapin::{
    options::{BasicCancelOptions, BasicConsumeOptions, BasicQosOptions},
    types::FieldTable,
    Channel,
};
use std::sync::Arc;
use tracing::{debug, error, info};

/// Default number of unacknowledged messages a subscription may hold.
pub const DEFAULT_PREFETCH: u16 = 1;

/// Subscribes handlers to destinations on one channel.
pub struct RabbitMQDispatcher {
    channel: Arc<Channel>,
}

impl RabbitMQDispatcher {
    /// Creates a dispatcher on an existing channel.
    ///
    /// # Parameters
    /// * `channel` - A channel to the RabbitMQ server, shared by every subscription
    ///
    /// # Returns
    /// A new RabbitMQDispatcher instance
    pub fn new(channel: Arc<Channel>) -> Self {
        RabbitMQDispatcher { channel }
    }

    /// Opens a dedicated channel for this dispatcher.
    ///
    /// # Parameters
    /// * `session` - The live connection to open the channel on
    ///
    /// # Returns
    /// The dispatcher, or an error if the channel could not be created
    pub async fn open(session: &Session) -> Result<Self, AmqpError> {
        Ok(RabbitMQDispatcher::new(session.channel().await?))
    }

    /// Starts consuming `destination`, settling each message according to `policy`.
    ///
    /// The subscription runs until cancelled through the returned handle or
    /// until the channel fails.
    ///
    /// # Parameters
    /// * `destination` - Queue to consume, or fanout exchange to bind a private queue to
    /// * `prefetch` - Maximum number of unacknowledged messages; zero is treated as one
    /// * `policy` - How handler outcomes are turned into ack/nack decisions
    /// * `handler` - Processes every delivered payload
    ///
    /// # Returns
    /// A handle on the running subscription, or an error if qos, topology or
    /// consumer setup failed
    pub async fn subscribe(
        &self,
        destination: &Destination,
        prefetch: u16,
        policy: AckPolicy,
        handler: Arc<dyn ConsumerHandler>,
    ) -> Result<SubscriptionHandle, SubscriptionError> {
        let prefetch = prefetch.max(1);

        if let Err(err) = self
            .channel
            .basic_qos(prefetch, BasicQosOptions { global: false })
            .await
        {
            error!(error = err.to_string(), "failure to configure qos");
            return Err(AmqpError::QoSDeclarationError(err.to_string()).into());
        }

        let queue = self.resolve(destination).await?;

        let consumer = match self
            .channel
            .basic_consume(
                &queue,
                "",
                BasicConsumeOptions {
                    no_local: false,
                    no_ack: false,
                    exclusive: false,
                    nowait: false,
                },
                FieldTable::default(),
            )
            .await
        {
            Err(err) => {
                error!(error = err.to_string(), "error to create the consumer");
                Err(AmqpError::ConsumerDeclarationError(queue.clone()))
            }
            Ok(c) => Ok(c),
        }?;

        let tag = consumer.tag().as_str().to_owned();
        info!(destination = %destination, queue = queue.as_str(), "consumer created");

        let channel = self.channel.clone();
        let on_stop = move |mut deliveries: DeliveryStream| async move {
            debug!(consumer = tag.as_str(), "cancelling consumer");
            if let Err(err) = channel
                .basic_cancel(&tag, BasicCancelOptions { nowait: false })
                .await
            {
                debug!(error = err.to_string(), "consumer already gone");
            }
            requeue_buffered(&mut deliveries).await;
        };

        Ok(spawn_subscription_with(
            destination.to_string(),
            deliveries(consumer),
            prefetch,
            policy,
            handler,
            on_stop,
        ))
    }

    /// Name of the queue to consume for `destination`.
    async fn resolve(&self, destination: &Destination) -> Result<String, AmqpError> {
        match destination {
            Destination::Queue(name) => Ok(name.clone()),
            Destination::Fanout(exchange) => {
                topology::declare_exchange(&self.channel, &ExchangeDefinition::new(exchange).fanout())
                    .await?;
                let queue = topology::declare_queue(&self.channel, &QueueDefinition::anonymous()).await?;
                topology::bind_queue(&self.channel, &QueueBinding::new(&queue).exchange(exchange))
                    .await?;
                Ok(queue)
            }
        }
    }

    /// Closes the dispatcher's channel. Subscriptions should be shut down
    /// first; anything still unacknowledged is requeued by the broker.
    pub async fn close(self) -> Result<(), AmqpError> {
        if !self.channel.status().connected() {
            return Ok(());
        }
        self.channel
            .close(200, "dispatcher closed")
            .await
            .map_err(|err| AmqpError::Transport(err.to_string()))
    }
}

/// Adapts a lapin consumer to the crate's delivery stream.
///
/// # Parameters
/// * `consumer` - The lapin consumer returned by `basic_consume`
///
/// # Returns
/// A stream of inbound messages; transport errors end the subscription
pub(crate) fn deliveries(consumer: lapin::Consumer) -> DeliveryStream {
    consumer
        .map(|res| {
            res.map(InboundMessage::from_delivery)
                .map_err(|err| AmqpError::Transport(err.to_string()))
        })
        .boxed()
}
