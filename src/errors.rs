// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Error Types
//!
//! Every failure the messaging core can surface, grouped by the component that
//! raises it. Connection and subscription errors are fatal to their owner,
//! publish errors are recoverable by the caller, handler errors never leave the
//! consumer loop and RPC errors are terminal for a single call.

use std::time::Duration;
use thiserror::Error;

/// Errors raised while talking to the broker on an already open channel.
///
/// Used by topology installation, channel creation and the ack/nack path.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AmqpError {
    /// Transport-level failure reported by the client library
    #[error("transport failure: {0}")]
    Transport(String),

    /// Error creating a channel from an established connection
    #[error("failure to create a channel")]
    ChannelError,

    /// Error declaring an exchange with the given name
    #[error("failure to declare an exchange `{0}`")]
    DeclareExchangeError(String),

    /// Error declaring a queue with the given name
    #[error("failure to declare a queue `{0}`")]
    DeclareQueueError(String),

    /// Error binding an exchange to a queue
    #[error("failure to binding exchange `{0}` to queue `{1}`")]
    BindingExchangeToQueueError(String, String),

    /// Error configuring Quality of Service parameters
    #[error("failure to configure qos `{0}`")]
    QoSDeclarationError(String),

    /// Error declaring a consumer
    #[error("failure to declare consumer on `{0}`")]
    ConsumerDeclarationError(String),

    /// Error acknowledging a message
    #[error("failure to ack message")]
    AckMessageError,

    /// Error negative-acknowledging a message
    #[error("failure to nack message")]
    NackMessageError,
}

/// Raised by the backoff connector once it gives up.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConnectionError {
    /// Every attempt allowed by the policy failed
    #[error("failure to connect after {attempts} attempts")]
    ExhaustedRetries { attempts: u32 },

    /// The caller cancelled while waiting between attempts
    #[error("connection attempt cancelled")]
    Cancelled,
}

/// Raised by a publisher. The caller may retry the publish.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PublishError {
    /// The channel behind the publisher is not open
    #[error("publisher is not connected")]
    NotConnected,

    /// The broker refused or nacked the message
    #[error("broker rejected the message: {0}")]
    BrokerRejected(String),

    /// The publish did not complete within the blocked-connection timeout
    #[error("publish blocked for more than {0:?}")]
    Blocked(Duration),

    /// The payload could not be serialized
    #[error("failure to encode payload: {0}")]
    Encode(String),
}

/// Outcome of a failed handler invocation, consumed by the ack policy.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum HandlerError {
    /// Processing failed but may succeed on redelivery
    #[error("transient failure: {0}")]
    Transient(String),

    /// The message itself cannot be processed (bad payload, missing properties)
    #[error("malformed message: {0}")]
    Malformed(String),
}

impl From<serde_json::Error> for HandlerError {
    fn from(err: serde_json::Error) -> Self {
        HandlerError::Malformed(err.to_string())
    }
}

/// Terminal failure of a single RPC call.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RpcError {
    /// No reply arrived before the deadline
    #[error("no reply within {0:?}")]
    Timeout(Duration),

    /// The caller cancelled the call
    #[error("call cancelled")]
    Cancelled,

    /// The reply consumer lost its connection
    #[error("connection lost while waiting for the reply")]
    ConnectionLost,

    /// The request could not be published
    #[error(transparent)]
    Publish(#[from] PublishError),

    /// The reply payload could not be decoded
    #[error("failure to decode reply: {0}")]
    Decode(String),
}

/// Ends a subscription. The owner decides whether to reconnect.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SubscriptionError {
    /// The delivery stream closed or failed
    #[error("subscription lost its connection: {0}")]
    ConnectionLost(String),

    /// The subscription could not be set up on the channel
    #[error(transparent)]
    Declare(#[from] AmqpError),

    /// The subscription task itself failed
    #[error("subscription task failed: {0}")]
    Internal(String),
}
