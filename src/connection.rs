// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # AMQP Connection Management
//!
//! This module handles the creation of AMQP connections and channels. A
//! [`Session`] owns one open connection; publishers, dispatchers and RPC
//! clients open their own channels on it.

use crate::{
    configs::BrokerConfig,
    connector::{BackoffConnector, Dialer},
    errors::{AmqpError, ConnectionError},
};
use async_trait::async_trait;
use lapin::{types::LongString, uri::AMQPUri, Channel, Connection, ConnectionProperties};
use std::{sync::Arc, time::Duration};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

/// Reply code sent when closing a connection on purpose.
const REPLY_SUCCESS: u16 = 200;

/// Opens lapin connections for one broker endpoint.
#[derive(Debug, Clone)]
pub struct AmqpDialer {
    uri: AMQPUri,
    endpoint: String,
    connection_name: String,
    blocked_timeout: Duration,
}

impl AmqpDialer {
    pub fn new(cfg: &BrokerConfig) -> Self {
        AmqpDialer {
            uri: cfg.uri(),
            endpoint: cfg.endpoint(),
            connection_name: cfg.connection_name.clone(),
            blocked_timeout: cfg.blocked_timeout(),
        }
    }
}

#[async_trait]
impl Dialer for AmqpDialer {
    type Connection = Session;

    async fn dial(&self) -> Result<Session, AmqpError> {
        debug!("creating amqp connection...");
        let options = ConnectionProperties::default()
            .with_connection_name(LongString::from(self.connection_name.clone()));

        // lapin drops the socket before returning an error
        match Connection::connect_uri(self.uri.clone(), options).await {
            Ok(conn) => {
                debug!("amqp connected");
                Ok(Session {
                    connection: conn,
                    endpoint: self.endpoint.clone(),
                    blocked_timeout: self.blocked_timeout,
                })
            }
            Err(err) => {
                error!(error = err.to_string(), "failure to connect");
                Err(AmqpError::Transport(err.to_string()))
            }
        }
    }

    fn endpoint(&self) -> String {
        self.endpoint.clone()
    }
}

/// An open connection to the broker, owned by whoever established it.
pub struct Session {
    connection: Connection,
    endpoint: String,
    blocked_timeout: Duration,
}

impl Session {
    /// Connects to the configured broker, retrying with backoff.
    pub async fn connect(
        cfg: &BrokerConfig,
        cancel: &CancellationToken,
    ) -> Result<Session, ConnectionError> {
        BackoffConnector::new(cfg.backoff())
            .connect(&AmqpDialer::new(cfg), cancel)
            .await
    }

    /// Creates a new channel on this connection.
    pub async fn channel(&self) -> Result<Arc<Channel>, AmqpError> {
        debug!("creating amqp channel...");
        match self.connection.create_channel().await {
            Ok(c) => {
                debug!("channel created");
                Ok(Arc::new(c))
            }
            Err(err) => {
                error!(error = err.to_string(), "error to create the channel");
                Err(AmqpError::ChannelError)
            }
        }
    }

    pub fn is_connected(&self) -> bool {
        self.connection.status().connected()
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    /// Timeout applied to publishes on this connection.
    pub fn blocked_timeout(&self) -> Duration {
        self.blocked_timeout
    }

    /// Closes the connection and every channel opened on it.
    pub async fn close(self) -> Result<(), AmqpError> {
        if !self.is_connected() {
            return Ok(());
        }

        match self.connection.close(REPLY_SUCCESS, "closing").await {
            Ok(()) => {
                info!(endpoint = self.endpoint.as_str(), "connection closed");
                Ok(())
            }
            Err(err) => {
                error!(error = err.to_string(), "failure to close the connection");
                Err(AmqpError::Transport(err.to_string()))
            }
        }
    }
}
