// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Request/Reply over AMQP
//!
//! [`CorrelationRouter`] turns a publisher plus a private reply queue into a
//! call/response API. Every call gets a fresh UUIDv4 correlation id and a
//! pending slot registered *before* the request is published. A single
//! listener task consumes the reply queue and resolves the slot whose id
//! matches; replies nobody waits for any more are dropped.
//!
//! [`ReplyHandler`] is the other side: a consumer handler that answers each
//! request on the queue named in its `reply_to` property.

use crate::{
    connection::Session,
    consumer::ConsumerHandler,
    dispatcher,
    errors::{AmqpError, HandlerError, PublishError, RpcError},
    message::{encode_json, DeliveryStream, Destination, Metadata, PublishOptions},
    publisher::{Publisher, RabbitMQPublisher},
    queue::QueueDefinition,
    topology,
};
use async_trait::async_trait;
use dashmap::{mapref::entry::Entry, DashMap};
use futures_util::StreamExt;
use lapin::{options::BasicConsumeOptions, types::FieldTable, Channel};
use opentelemetry::Context;
use serde::{de::DeserializeOwned, Serialize};
use std::{
    marker::PhantomData,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};
use tokio::{
    sync::oneshot,
    task::JoinHandle,
    time::{sleep_until, Instant},
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

type ReplySlot = oneshot::Sender<Result<Vec<u8>, RpcError>>;

struct PendingCall {
    slot: ReplySlot,
    created_at: Instant,
}

/// Outstanding calls keyed by correlation id.
#[derive(Default)]
struct PendingCalls {
    calls: DashMap<String, PendingCall>,
    closed: AtomicBool,
}

impl PendingCalls {
    /// Registers a new call under a fresh correlation id.
    fn register(&self) -> Result<(String, oneshot::Receiver<Result<Vec<u8>, RpcError>>), RpcError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(RpcError::ConnectionLost);
        }

        let (slot, reply) = oneshot::channel();

        let id = loop {
            let id = Uuid::new_v4().to_string();
            match self.calls.entry(id.clone()) {
                Entry::Occupied(_) => continue,
                Entry::Vacant(entry) => {
                    entry.insert(PendingCall {
                        slot,
                        created_at: Instant::now(),
                    });
                    break id;
                }
            }
        };

        // fail_all may have drained the map between the check above and the insert
        if self.closed.load(Ordering::SeqCst) {
            self.calls.remove(&id);
            return Err(RpcError::ConnectionLost);
        }

        Ok((id, reply))
    }

    /// Hands `payload` to the call waiting on `id`. False if nobody waits.
    fn resolve(&self, id: &str, payload: Vec<u8>) -> bool {
        match self.calls.remove(id) {
            Some((_, call)) => {
                debug!(
                    correlation_id = id,
                    elapsed_ms = call.created_at.elapsed().as_millis() as u64,
                    "reply matched"
                );
                // the caller may have given up in the meantime
                let _ = call.slot.send(Ok(payload));
                true
            }
            None => false,
        }
    }

    fn remove(&self, id: &str) {
        self.calls.remove(id);
    }

    /// Resolves every outstanding call with `err` and refuses new ones.
    fn fail_all(&self, err: RpcError) {
        self.closed.store(true, Ordering::SeqCst);

        let ids: Vec<String> = self.calls.iter().map(|call| call.key().clone()).collect();
        for id in ids {
            if let Some((_, call)) = self.calls.remove(&id) {
                let _ = call.slot.send(Err(err.clone()));
            }
        }
    }
}

/// Removes the pending entry of a call on every exit path, including when
/// the caller drops the call future.
struct PendingGuard<'a> {
    pending: &'a PendingCalls,
    id: &'a str,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        self.pending.remove(self.id);
    }
}

/// Synchronous-looking calls on top of a publisher and a reply queue.
pub struct CorrelationRouter {
    publisher: Arc<dyn Publisher>,
    reply_to: String,
    pending: Arc<PendingCalls>,
    stop: CancellationToken,
    listener: JoinHandle<()>,
    reply_channel: Option<Arc<Channel>>,
}

impl CorrelationRouter {
    /// Starts the reply listener on `replies`, the delivery stream of the
    /// queue named `reply_to`.
    ///
    /// # Parameters
    /// * `publisher` - Sends the requests
    /// * `reply_to` - Queue name stamped on every request
    /// * `replies` - Deliveries of that queue, already settled by the broker
    ///
    /// # Returns
    /// A router whose listener is running
    pub fn new(
        publisher: Arc<dyn Publisher>,
        reply_to: impl Into<String>,
        replies: DeliveryStream,
    ) -> CorrelationRouter {
        let pending = Arc::new(PendingCalls::default());
        let stop = CancellationToken::new();
        let listener = tokio::spawn(listen(replies, pending.clone(), stop.clone()));

        CorrelationRouter {
            publisher,
            reply_to: reply_to.into(),
            pending,
            stop,
            listener,
            reply_channel: None,
        }
    }

    /// Sets up a router on `session`: a confirmed publisher channel, and an
    /// exclusive server-named reply queue consumed in auto-ack mode.
    ///
    /// # Parameters
    /// * `session` - The live connection to open both channels on
    ///
    /// # Returns
    /// The router, or an error if a channel, the reply queue or its consumer
    /// could not be created
    pub async fn open(session: &Session) -> Result<CorrelationRouter, AmqpError> {
        let publisher = RabbitMQPublisher::open(session).await?;
        let channel = session.channel().await?;

        let reply_to = topology::declare_queue(&channel, &QueueDefinition::anonymous()).await?;

        let consumer = match channel
            .basic_consume(
                &reply_to,
                "",
                BasicConsumeOptions {
                    no_local: false,
                    no_ack: true,
                    exclusive: true,
                    nowait: false,
                },
                FieldTable::default(),
            )
            .await
        {
            Err(err) => {
                error!(error = err.to_string(), "error to create the reply consumer");
                Err(AmqpError::ConsumerDeclarationError(reply_to.clone()))
            }
            Ok(c) => Ok(c),
        }?;

        info!(reply_to = reply_to.as_str(), "rpc client ready");

        let mut router = CorrelationRouter::new(publisher, reply_to, dispatcher::deliveries(consumer));
        router.reply_channel = Some(channel);
        Ok(router)
    }

    /// The private queue replies are expected on.
    pub fn reply_to(&self) -> &str {
        &self.reply_to
    }

    /// Number of calls currently waiting for a reply.
    pub fn pending_calls(&self) -> usize {
        self.pending.calls.len()
    }

    pub fn is_pending(&self, correlation_id: &str) -> bool {
        self.pending.calls.contains_key(correlation_id)
    }

    /// Publishes `payload` to `destination` and waits up to `timeout` for the reply.
    ///
    /// # Parameters
    /// * `destination` - Where the request is published
    /// * `payload` - Request body, sent as is
    /// * `timeout` - Deadline covering both the publish and the wait
    ///
    /// # Returns
    /// The reply body, or the reason the call ended without one
    pub async fn call(
        &self,
        destination: &Destination,
        payload: &[u8],
        timeout: Duration,
    ) -> Result<Vec<u8>, RpcError> {
        self.call_cancellable(destination, payload, timeout, &CancellationToken::new())
            .await
    }

    /// Like [`CorrelationRouter::call`], also giving up when `cancel` fires.
    pub async fn call_cancellable(
        &self,
        destination: &Destination,
        payload: &[u8],
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<Vec<u8>, RpcError> {
        let deadline = Instant::now() + timeout;
        let (correlation_id, reply) = self.pending.register()?;
        let _guard = PendingGuard {
            pending: &self.pending,
            id: &correlation_id,
        };

        debug!(
            correlation_id = correlation_id.as_str(),
            destination = %destination,
            "sending request"
        );

        let opts = PublishOptions::default()
            .correlation_id(correlation_id.clone())
            .reply_to(self.reply_to.clone());

        tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(RpcError::Cancelled),
            _ = sleep_until(deadline) => return Err(RpcError::Timeout(timeout)),
            published = self.publisher.publish(destination, payload, &opts) => published?,
        }

        tokio::select! {
            biased;
            res = reply => res.unwrap_or(Err(RpcError::ConnectionLost)),
            _ = cancel.cancelled() => {
                debug!(correlation_id = correlation_id.as_str(), "call cancelled");
                Err(RpcError::Cancelled)
            }
            _ = sleep_until(deadline) => {
                warn!(correlation_id = correlation_id.as_str(), "no reply before the deadline");
                Err(RpcError::Timeout(timeout))
            }
        }
    }

    /// JSON convenience over [`CorrelationRouter::call`].
    ///
    /// # Returns
    /// The decoded reply; [`RpcError::Decode`] if it is not a valid `Resp`
    pub async fn call_json<Req, Resp>(
        &self,
        destination: &Destination,
        request: &Req,
        timeout: Duration,
    ) -> Result<Resp, RpcError>
    where
        Req: Serialize + ?Sized,
        Resp: DeserializeOwned,
    {
        let payload = encode_json(request)?;
        let reply = self.call(destination, &payload, timeout).await?;
        serde_json::from_slice(&reply).map_err(|err| RpcError::Decode(err.to_string()))
    }

    /// Stops the listener. Calls still waiting resolve with
    /// [`RpcError::ConnectionLost`].
    pub async fn shutdown(mut self) {
        self.stop.cancel();
        if let Err(err) = (&mut self.listener).await {
            error!(error = err.to_string(), "reply listener failed");
        }
        if let Some(channel) = self.reply_channel.take() {
            if let Err(err) = channel.close(200, "rpc client closed").await {
                debug!(error = err.to_string(), "reply channel already closed");
            }
        }
    }
}

impl Drop for CorrelationRouter {
    fn drop(&mut self) {
        self.stop.cancel();
    }
}

async fn listen(mut replies: DeliveryStream, pending: Arc<PendingCalls>, stop: CancellationToken) {
    loop {
        let next = tokio::select! {
            biased;
            _ = stop.cancelled() => break,
            next = replies.next() => next,
        };

        match next {
            Some(Ok(msg)) => {
                let Some(correlation_id) = msg.metadata.correlation_id.as_deref() else {
                    warn!(delivery_tag = msg.metadata.delivery_tag, "reply without correlation id dropped");
                    continue;
                };

                if !pending.resolve(correlation_id, msg.payload) {
                    debug!(correlation_id = correlation_id, "dropping reply for unknown or expired call");
                }
            }
            Some(Err(err)) => {
                error!(error = err.to_string(), "reply consumer failed");
                break;
            }
            None => {
                warn!("reply consumer closed");
                break;
            }
        }
    }

    pending.fail_all(RpcError::ConnectionLost);
}

/// Answers RPC requests: decodes the request, computes the response and
/// publishes it to the request's `reply_to` queue with the same correlation id.
///
/// Requests missing `reply_to` or `correlation_id`, or whose body does not
/// decode, are reported as malformed. Failing to publish the reply is
/// transient, so the request is redelivered.
pub struct ReplyHandler<Req, Resp, F> {
    publisher: Arc<dyn Publisher>,
    respond: F,
    _marker: PhantomData<fn(Req) -> Resp>,
}

impl<Req, Resp, F> ReplyHandler<Req, Resp, F>
where
    F: Fn(Req) -> Resp + Send + Sync,
{
    /// # Parameters
    /// * `publisher` - Sends the replies
    /// * `respond` - Computes the response for a decoded request
    pub fn new(publisher: Arc<dyn Publisher>, respond: F) -> Self {
        ReplyHandler {
            publisher,
            respond,
            _marker: PhantomData,
        }
    }
}

#[async_trait]
impl<Req, Resp, F> ConsumerHandler for ReplyHandler<Req, Resp, F>
where
    Req: DeserializeOwned + Send + 'static,
    Resp: Serialize + Send + 'static,
    F: Fn(Req) -> Resp + Send + Sync,
{
    async fn exec(
        &self,
        _ctx: &Context,
        payload: &[u8],
        metadata: &Metadata,
    ) -> Result<(), HandlerError> {
        let (Some(reply_to), Some(correlation_id)) = (&metadata.reply_to, &metadata.correlation_id)
        else {
            return Err(HandlerError::Malformed(
                "request without reply_to or correlation_id".to_owned(),
            ));
        };

        let request: Req = serde_json::from_slice(payload)?;
        info!(correlation_id = correlation_id.as_str(), "processing request");

        let body = encode_json(&(self.respond)(request))
            .map_err(|err| HandlerError::Malformed(err.to_string()))?;

        self.publisher
            .publish(
                &Destination::queue(reply_to.as_str()),
                &body,
                &PublishOptions::default().correlation_id(correlation_id.as_str()),
            )
            .await
            .map_err(|err: PublishError| HandlerError::Transient(err.to_string()))
    }
}
