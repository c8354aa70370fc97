// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Message Consumer
//!
//! The subscription loop shared by every consumer in the crate. It pulls
//! deliveries from a [`DeliveryStream`], runs the handler of each one inside
//! its own failure boundary and settles the delivery according to the
//! [`AckPolicy`]. A semaphore bounds how many deliveries are between receipt
//! and settlement at any time.

use crate::{
    ack::{AckDecision, AckPolicy},
    errors::{HandlerError, SubscriptionError},
    message::{DeliveryStream, InboundMessage, Metadata},
    otel,
};
use async_trait::async_trait;
use futures_util::{FutureExt, StreamExt};
use opentelemetry::{
    global::{self, BoxedTracer},
    trace::{Span, Status},
    Context,
};
use std::{borrow::Cow, future::Future, panic::AssertUnwindSafe, sync::Arc};
use tokio::{
    sync::Semaphore,
    task::{JoinHandle, JoinSet},
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Processes the payload of one delivery.
///
/// Handlers may see the same message more than once and must tolerate it.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ConsumerHandler: Send + Sync {
    async fn exec(
        &self,
        ctx: &Context,
        payload: &[u8],
        metadata: &Metadata,
    ) -> Result<(), HandlerError>;
}

/// Runs the handler on one delivery and settles it exactly once.
///
/// A panicking handler counts as a transient failure.
pub(crate) async fn consume(
    tracer: &BoxedTracer,
    subscription: &str,
    msg: InboundMessage,
    handler: &dyn ConsumerHandler,
    policy: AckPolicy,
) -> AckDecision {
    let InboundMessage {
        payload,
        metadata,
        ctx,
        acker,
    } = msg;

    let mut span = otel::consumer_span(tracer, &ctx, subscription);

    debug!(
        delivery_tag = metadata.delivery_tag,
        redelivered = metadata.redelivered,
        "received: {}",
        subscription
    );

    let outcome = match AssertUnwindSafe(handler.exec(&ctx, &payload, &metadata))
        .catch_unwind()
        .await
    {
        Ok(outcome) => outcome,
        Err(_) => {
            error!(delivery_tag = metadata.delivery_tag, "handler panicked");
            Err(HandlerError::Transient("handler panicked".to_owned()))
        }
    };

    let decision = policy.decide(&outcome);

    match &outcome {
        Ok(()) => {
            debug!("message successfully processed");
            span.set_status(Status::Ok);
        }
        Err(err) => {
            match err {
                HandlerError::Malformed(reason) => error!(
                    delivery_tag = metadata.delivery_tag,
                    reason = reason.as_str(),
                    requeue = decision == AckDecision::RequeueNack,
                    "malformed message"
                ),
                HandlerError::Transient(reason) => warn!(
                    delivery_tag = metadata.delivery_tag,
                    reason = reason.as_str(),
                    "error whiling handling msg, requeuing for latter"
                ),
            }
            span.record_error(err);
            span.set_status(Status::Error {
                description: Cow::from(err.to_string()),
            });
        }
    }

    let settled = match decision.requeue() {
        None => acker.ack().await,
        Some(requeue) => acker.nack(requeue).await,
    };

    if let Err(err) = settled {
        error!(
            delivery_tag = metadata.delivery_tag,
            error = err.to_string(),
            "failure to settle message"
        );
        span.record_error(&err);
    }

    decision
}

/// Owner's handle on a running subscription.
pub struct SubscriptionHandle {
    name: String,
    cancel: CancellationToken,
    task: JoinHandle<Result<(), SubscriptionError>>,
}

impl SubscriptionHandle {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Stops accepting deliveries. In-flight handlers still finish.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Token that cancels this subscription when triggered.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Waits for the subscription to end on its own, i.e. with a
    /// [`SubscriptionError`] or after someone cancelled it.
    pub async fn join(self) -> Result<(), SubscriptionError> {
        match self.task.await {
            Ok(res) => res,
            Err(err) => {
                error!(error = err.to_string(), "subscription task failed");
                Err(SubscriptionError::Internal(err.to_string()))
            }
        }
    }

    /// Cancels the subscription and waits until in-flight handlers are done.
    pub async fn shutdown(self) -> Result<(), SubscriptionError> {
        self.cancel();
        self.join().await
    }
}

/// Starts consuming `deliveries` on a new task.
///
/// # Parameters
/// * `name` - Subscription name used in log records and spans
/// * `deliveries` - Stream of messages to process, in broker order
/// * `limit` - Maximum number of unsettled deliveries; zero is treated as one
/// * `policy` - How handler outcomes are settled with the broker
/// * `handler` - Processes every delivered payload
///
/// # Returns
/// A handle to cancel the subscription or wait for it to end
pub fn spawn_subscription(
    name: impl Into<String>,
    deliveries: DeliveryStream,
    limit: u16,
    policy: AckPolicy,
    handler: Arc<dyn ConsumerHandler>,
) -> SubscriptionHandle {
    spawn_subscription_with(name, deliveries, limit, policy, handler, |_| async {})
}

/// Like [`spawn_subscription`], handing the delivery stream to `on_stop`
/// once the loop has drained its in-flight handlers.
pub(crate) fn spawn_subscription_with<S, F>(
    name: impl Into<String>,
    deliveries: DeliveryStream,
    limit: u16,
    policy: AckPolicy,
    handler: Arc<dyn ConsumerHandler>,
    on_stop: S,
) -> SubscriptionHandle
where
    S: FnOnce(DeliveryStream) -> F + Send + 'static,
    F: Future<Output = ()> + Send + 'static,
{
    let name = name.into();
    let cancel = CancellationToken::new();

    let task = tokio::spawn({
        let name = name.clone();
        let cancel = cancel.clone();
        async move {
            let mut deliveries = deliveries;
            let res = run(&name, &mut deliveries, limit, policy, handler, cancel).await;
            on_stop(deliveries).await;
            res
        }
    });

    SubscriptionHandle { name, cancel, task }
}

/// Hands every delivery that is already buffered in `deliveries` back to the
/// broker with a requeue-nack, without waiting for new ones.
///
/// # Returns
/// The number of deliveries returned
pub(crate) async fn requeue_buffered(deliveries: &mut DeliveryStream) -> usize {
    let mut buffered = vec![];
    while let Some(Some(Ok(msg))) = deliveries.next().now_or_never() {
        buffered.push(msg);
    }

    for msg in &buffered {
        if let Err(err) = msg.acker.nack(true).await {
            error!(
                delivery_tag = msg.metadata.delivery_tag,
                error = err.to_string(),
                "failure to return buffered message"
            );
        }
    }

    if !buffered.is_empty() {
        debug!(count = buffered.len(), "buffered messages returned to the broker");
    }
    buffered.len()
}

async fn run(
    name: &str,
    deliveries: &mut DeliveryStream,
    limit: u16,
    policy: AckPolicy,
    handler: Arc<dyn ConsumerHandler>,
    cancel: CancellationToken,
) -> Result<(), SubscriptionError> {
    let permits = Arc::new(Semaphore::new(usize::from(limit.max(1))));
    let tracer = Arc::new(global::tracer(otel::CONSUMER_TRACER));
    let mut in_flight = JoinSet::new();

    info!(subscription = name, limit = limit.max(1), "subscription started");

    let res = loop {
        let permit = tokio::select! {
            biased;
            _ = cancel.cancelled() => break Ok(()),
            permit = permits.clone().acquire_owned() => match permit {
                Ok(permit) => permit,
                Err(err) => break Err(SubscriptionError::Internal(err.to_string())),
            },
        };

        let next = tokio::select! {
            biased;
            _ = cancel.cancelled() => break Ok(()),
            next = deliveries.next() => next,
        };

        match next {
            Some(Ok(msg)) => {
                let tracer = tracer.clone();
                let handler = handler.clone();
                let subscription = name.to_owned();

                in_flight.spawn(async move {
                    consume(&tracer, &subscription, msg, handler.as_ref(), policy).await;
                    drop(permit);
                });
            }
            Some(Err(err)) => {
                error!(subscription = name, error = err.to_string(), "errors consume msg");
                break Err(SubscriptionError::ConnectionLost(err.to_string()));
            }
            None => {
                warn!(subscription = name, "delivery stream closed");
                break Err(SubscriptionError::ConnectionLost(
                    "delivery stream closed".to_owned(),
                ));
            }
        }

        while in_flight.try_join_next().is_some() {}
    };

    while let Some(joined) = in_flight.join_next().await {
        if let Err(err) = joined {
            error!(subscription = name, error = err.to_string(), "tokio process error");
        }
    }

    info!(subscription = name, "subscription stopped");
    res
}
