// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Acknowledgment Policy
//!
//! Maps the result of a handler to the single ack/nack decision applied to the
//! delivery. Transient failures are always requeued. What happens to a
//! malformed message depends on the use site and has to be chosen explicitly:
//! task consumers requeue it, event subscribers discard it.

use crate::errors::HandlerError;

/// What the consumer sends back to the broker for one delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckDecision {
    Ack,
    /// Reject and put the message back on the queue for redelivery
    RequeueNack,
    /// Reject and drop the message
    DiscardNack,
}

impl AckDecision {
    /// The `requeue` flag of the nack, or `None` for an ack.
    pub fn requeue(&self) -> Option<bool> {
        match self {
            AckDecision::Ack => None,
            AckDecision::RequeueNack => Some(true),
            AckDecision::DiscardNack => Some(false),
        }
    }
}

/// Handling of messages the handler reports as [`HandlerError::Malformed`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MalformedPolicy {
    Requeue,
    Discard,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AckPolicy {
    on_malformed: MalformedPolicy,
}

impl AckPolicy {
    pub const fn new(on_malformed: MalformedPolicy) -> Self {
        AckPolicy { on_malformed }
    }

    /// Policy of the task consumer: every failure is redelivered.
    pub const fn tasks() -> Self {
        AckPolicy::new(MalformedPolicy::Requeue)
    }

    /// Policy of event subscribers: malformed events are dropped.
    pub const fn events() -> Self {
        AckPolicy::new(MalformedPolicy::Discard)
    }

    pub fn on_malformed(&self) -> MalformedPolicy {
        self.on_malformed
    }

    pub fn decide(&self, outcome: &Result<(), HandlerError>) -> AckDecision {
        match outcome {
            Ok(()) => AckDecision::Ack,
            Err(HandlerError::Transient(_)) => AckDecision::RequeueNack,
            Err(HandlerError::Malformed(_)) => match self.on_malformed {
                MalformedPolicy::Requeue => AckDecision::RequeueNack,
                MalformedPolicy::Discard => AckDecision::DiscardNack,
            },
        }
    }
}
