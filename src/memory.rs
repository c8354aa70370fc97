// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! In-process broker used by the unit tests. Queues, fanout bindings,
//! requeue-on-nack and server-named queues behave like RabbitMQ; every
//! settlement is recorded so tests can assert on it.

use crate::{
    ack::AckDecision,
    errors::{AmqpError, PublishError},
    message::{Acknowledge, DeliveryStream, Destination, InboundMessage, Metadata, PublishOptions},
    publisher::Publisher,
};
use async_trait::async_trait;
use futures_util::StreamExt;
use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering},
        Arc, Mutex,
    },
};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

#[derive(Clone)]
struct Stored {
    payload: Vec<u8>,
    opts: PublishOptions,
    redelivered: bool,
}

struct MemoryQueue {
    tx: mpsc::UnboundedSender<Stored>,
    rx: Mutex<Option<mpsc::UnboundedReceiver<Stored>>>,
    /// published and not yet acked or discarded
    outstanding: AtomicUsize,
    unsettled: AtomicUsize,
    peak_unsettled: AtomicUsize,
    next_tag: AtomicU64,
    settlements: Mutex<Vec<AckDecision>>,
}

impl MemoryQueue {
    fn new() -> Arc<Self> {
        let (tx, rx) = mpsc::unbounded_channel();
        Arc::new(MemoryQueue {
            tx,
            rx: Mutex::new(Some(rx)),
            outstanding: AtomicUsize::new(0),
            unsettled: AtomicUsize::new(0),
            peak_unsettled: AtomicUsize::new(0),
            next_tag: AtomicU64::new(0),
            settlements: Mutex::new(vec![]),
        })
    }

    fn push(&self, stored: Stored) {
        self.outstanding.fetch_add(1, Ordering::SeqCst);
        let _ = self.tx.send(stored);
    }

    fn deliver(self: &Arc<Self>, stored: Stored) -> InboundMessage {
        let tag = self.next_tag.fetch_add(1, Ordering::SeqCst) + 1;
        let now = self.unsettled.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak_unsettled.fetch_max(now, Ordering::SeqCst);

        let metadata = Metadata {
            delivery_tag: tag,
            correlation_id: stored.opts.correlation_id.clone(),
            reply_to: stored.opts.reply_to.clone(),
            persistent: stored.opts.persistent,
            redelivered: stored.redelivered,
        };

        InboundMessage::new(
            stored.payload.clone(),
            metadata,
            MemoryAcker {
                queue: self.clone(),
                stored,
                settled: AtomicBool::new(false),
            },
        )
    }
}

struct MemoryAcker {
    queue: Arc<MemoryQueue>,
    stored: Stored,
    settled: AtomicBool,
}

impl MemoryAcker {
    fn settle(&self, decision: AckDecision) -> Result<(), AmqpError> {
        if self.settled.swap(true, Ordering::SeqCst) {
            return Err(AmqpError::AckMessageError);
        }

        self.queue.settlements.lock().unwrap().push(decision);
        self.queue.unsettled.fetch_sub(1, Ordering::SeqCst);

        if decision == AckDecision::RequeueNack {
            let mut again = self.stored.clone();
            again.redelivered = true;
            let _ = self.queue.tx.send(again);
        } else {
            self.queue.outstanding.fetch_sub(1, Ordering::SeqCst);
        }
        Ok(())
    }
}

#[async_trait]
impl Acknowledge for MemoryAcker {
    async fn ack(&self) -> Result<(), AmqpError> {
        self.settle(AckDecision::Ack)
    }

    async fn nack(&self, requeue: bool) -> Result<(), AmqpError> {
        self.settle(if requeue {
            AckDecision::RequeueNack
        } else {
            AckDecision::DiscardNack
        })
    }
}

#[derive(Default)]
struct Inner {
    queues: Mutex<HashMap<String, Arc<MemoryQueue>>>,
    bindings: Mutex<HashMap<String, Vec<String>>>,
    anonymous: AtomicU64,
    severed: CancellationToken,
}

#[derive(Clone, Default)]
pub(crate) struct MemoryBroker {
    inner: Arc<Inner>,
}

impl MemoryBroker {
    pub(crate) fn new() -> Self {
        MemoryBroker::default()
    }

    /// Declares a queue; an empty name gets a fresh server-generated one.
    pub(crate) fn declare_queue(&self, name: &str) -> String {
        let name = if name.is_empty() {
            let n = self.inner.anonymous.fetch_add(1, Ordering::SeqCst);
            format!("amq.gen-{n}")
        } else {
            name.to_owned()
        };

        self.inner
            .queues
            .lock()
            .unwrap()
            .entry(name.clone())
            .or_insert_with(MemoryQueue::new);
        name
    }

    pub(crate) fn bind(&self, exchange: &str, queue: &str) {
        self.inner
            .bindings
            .lock()
            .unwrap()
            .entry(exchange.to_owned())
            .or_default()
            .push(queue.to_owned());
    }

    fn queue(&self, name: &str) -> Option<Arc<MemoryQueue>> {
        self.inner.queues.lock().unwrap().get(name).cloned()
    }

    /// Takes the single consumer side of a declared queue.
    pub(crate) fn consume(&self, name: &str) -> DeliveryStream {
        let queue = self.queue(name).expect("queue not declared");
        let rx = queue
            .rx
            .lock()
            .unwrap()
            .take()
            .expect("queue already has a consumer");
        let severed = self.inner.severed.clone();

        futures_util::stream::unfold((rx, queue, severed), |(mut rx, queue, severed)| async move {
            let stored = tokio::select! {
                biased;
                _ = severed.cancelled() => None,
                stored = rx.recv() => stored,
            }?;
            let msg = queue.deliver(stored);
            Some((Ok::<_, AmqpError>(msg), (rx, queue, severed)))
        })
        .boxed()
    }

    /// Drops the "connection": every delivery stream ends and publishes fail.
    pub(crate) fn sever(&self) {
        self.inner.severed.cancel();
    }

    pub(crate) fn depth(&self, name: &str) -> usize {
        self.queue(name)
            .map(|q| q.outstanding.load(Ordering::SeqCst))
            .unwrap_or_default()
    }

    pub(crate) fn peak_unsettled(&self, name: &str) -> usize {
        self.queue(name)
            .map(|q| q.peak_unsettled.load(Ordering::SeqCst))
            .unwrap_or_default()
    }

    pub(crate) fn settlements(&self, name: &str) -> Vec<AckDecision> {
        self.queue(name)
            .map(|q| q.settlements.lock().unwrap().clone())
            .unwrap_or_default()
    }
}

#[async_trait]
impl Publisher for MemoryBroker {
    async fn publish(
        &self,
        destination: &Destination,
        payload: &[u8],
        opts: &PublishOptions,
    ) -> Result<(), PublishError> {
        if self.inner.severed.is_cancelled() {
            return Err(PublishError::NotConnected);
        }

        let targets = match destination {
            Destination::Queue(name) => vec![name.clone()],
            Destination::Fanout(exchange) => self
                .inner
                .bindings
                .lock()
                .unwrap()
                .get(exchange)
                .cloned()
                .unwrap_or_default(),
        };

        // unroutable messages are dropped, as on the default exchange
        for name in targets {
            if let Some(queue) = self.queue(&name) {
                queue.push(Stored {
                    payload: payload.to_vec(),
                    opts: opts.clone(),
                    redelivered: false,
                });
            }
        }
        Ok(())
    }
}
