// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Connection Establishment with Backoff
//!
//! The broker is often still booting when the services start, so opening a
//! connection is retried with a bounded exponential delay:
//! `delay = min(cap, unit * base^attempt)`, attempt counted from one.
//! With the defaults this gives 2s, 4s, 8s, 10s, 10s, ... for up to 12 attempts.
//!
//! The retry loop only knows about the [`Dialer`] trait. The lapin-backed
//! implementation lives in [`crate::connection`].
//!
//! [`BackoffConnector::supervise`] keeps a workload running across dropped
//! connections: whenever the workload reports [`Interrupted::ConnectionLost`],
//! a fresh connection is established with the same backoff schedule and the
//! workload starts over on it.

use crate::errors::{AmqpError, ConnectionError};
use async_trait::async_trait;
use std::{fmt, future::Future, time::Duration};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// Opens one transport connection, without retrying.
///
/// A failed attempt must not leave any socket behind: implementations return
/// only after every resource created by the attempt has been dropped.
#[async_trait]
pub trait Dialer: Send + Sync {
    type Connection: Send;

    async fn dial(&self) -> Result<Self::Connection, AmqpError>;

    /// Endpoint used in log records. Must not contain credentials.
    fn endpoint(&self) -> String;
}

/// Shape of the retry schedule.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffPolicy {
    pub(crate) max_attempts: u32,
    pub(crate) base: u32,
    pub(crate) cap: Duration,
    pub(crate) unit: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 12,
            base: 2,
            cap: Duration::from_secs(10),
            unit: Duration::from_secs(1),
        }
    }
}

impl BackoffPolicy {
    /// Number of attempts before giving up. Zero is treated as one.
    pub fn max_attempts(mut self, max: u32) -> Self {
        self.max_attempts = max.max(1);
        self
    }

    pub fn base(mut self, base: u32) -> Self {
        self.base = base;
        self
    }

    pub fn cap(mut self, cap: Duration) -> Self {
        self.cap = cap;
        self
    }

    /// Duration of one `base^attempt` step.
    pub fn unit(mut self, unit: Duration) -> Self {
        self.unit = unit;
        self
    }

    /// Delay to wait after the `attempt`-th consecutive failure.
    ///
    /// # Parameters
    /// * `attempt` - Consecutive failures so far, starting at one
    ///
    /// # Returns
    /// `unit * base^attempt`, never more than the cap
    pub fn delay(&self, attempt: u32) -> Duration {
        let factor = self.base.checked_pow(attempt).unwrap_or(u32::MAX);
        self.unit.saturating_mul(factor).min(self.cap)
    }
}

/// Progress of one sequence of connection attempts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RetryState {
    attempt: u32,
    delay: Duration,
}

impl RetryState {
    /// Consecutive failures recorded so far.
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    /// Delay computed for the last failure.
    pub fn delay(&self) -> Duration {
        self.delay
    }

    /// Records one more failure and returns the delay to wait before retrying.
    pub fn record_failure(&mut self, policy: &BackoffPolicy) -> Duration {
        self.attempt += 1;
        self.delay = policy.delay(self.attempt);
        self.delay
    }

    pub fn reset(&mut self) {
        *self = RetryState::default();
    }
}

/// How a workload running on a supervised connection ended early.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Interrupted<E> {
    /// The connection dropped; the workload should run again on a new one
    ConnectionLost(E),
    /// Reconnecting would not help
    Failed(E),
}

/// Why [`BackoffConnector::supervise`] gave up.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Supervised<E> {
    /// No connection could be (re-)established
    Connect(ConnectionError),
    /// The workload failed for a reason other than a lost connection
    Failed(E),
}

impl<E: fmt::Display> fmt::Display for Supervised<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Supervised::Connect(err) => write!(f, "{err}"),
            Supervised::Failed(err) => write!(f, "{err}"),
        }
    }
}

/// Opens connections, retrying failed attempts according to a [`BackoffPolicy`].
#[derive(Debug, Clone, Default)]
pub struct BackoffConnector {
    policy: BackoffPolicy,
}

impl BackoffConnector {
    /// Creates a connector following `policy`.
    ///
    /// # Parameters
    /// * `policy` - Retry schedule applied to every connection sequence
    ///
    /// # Returns
    /// A new BackoffConnector instance
    pub fn new(policy: BackoffPolicy) -> Self {
        BackoffConnector { policy }
    }

    pub fn policy(&self) -> &BackoffPolicy {
        &self.policy
    }

    /// Dials until a connection is open, the attempts run out or `cancel` fires.
    ///
    /// The returned connection has completed its open handshake. No sleep
    /// happens after the final failed attempt.
    ///
    /// # Parameters
    /// * `dialer` - Opens one connection per attempt
    /// * `cancel` - Interrupts both the dial and the backoff sleep
    ///
    /// # Returns
    /// The open connection, [`ConnectionError::ExhaustedRetries`] once
    /// `max_attempts` consecutive dials failed, or [`ConnectionError::Cancelled`]
    pub async fn connect<D>(
        &self,
        dialer: &D,
        cancel: &CancellationToken,
    ) -> Result<D::Connection, ConnectionError>
    where
        D: Dialer + ?Sized,
    {
        let endpoint = dialer.endpoint();
        let mut state = RetryState::default();

        loop {
            let attempt = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(ConnectionError::Cancelled),
                res = dialer.dial() => res,
            };

            let err = match attempt {
                Ok(conn) => {
                    info!(
                        endpoint = endpoint.as_str(),
                        attempts = state.attempt() + 1,
                        "successfully connected to the broker"
                    );
                    state.reset();
                    return Ok(conn);
                }
                Err(err) => err,
            };

            let delay = state.record_failure(&self.policy);
            if state.attempt() >= self.policy.max_attempts {
                error!(
                    endpoint = endpoint.as_str(),
                    attempts = state.attempt(),
                    error = err.to_string(),
                    "failure to connect, giving up"
                );
                return Err(ConnectionError::ExhaustedRetries {
                    attempts: state.attempt(),
                });
            }

            warn!(
                endpoint = endpoint.as_str(),
                attempt = state.attempt(),
                delay_ms = delay.as_millis() as u64,
                error = err.to_string(),
                "connection attempt failed, retrying"
            );

            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(ConnectionError::Cancelled),
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }

    /// Runs `work` on a connection, reconnecting whenever it reports the
    /// connection as lost.
    ///
    /// Every reconnect starts a fresh retry sequence, after waiting the first
    /// backoff step so a connection that keeps dropping does not spin.
    ///
    /// # Parameters
    /// * `dialer` - Opens one connection per attempt
    /// * `cancel` - Stops the supervision; a cancelled run ends with `Ok(())`
    /// * `work` - Takes ownership of each new connection
    ///
    /// # Returns
    /// `Ok(())` once `work` completes or `cancel` fires, otherwise the reason
    /// the supervision gave up
    pub async fn supervise<D, W, Fut, E>(
        &self,
        dialer: &D,
        cancel: &CancellationToken,
        mut work: W,
    ) -> Result<(), Supervised<E>>
    where
        D: Dialer + ?Sized,
        W: FnMut(D::Connection) -> Fut,
        Fut: Future<Output = Result<(), Interrupted<E>>>,
        E: fmt::Display,
    {
        let endpoint = dialer.endpoint();

        loop {
            let conn = match self.connect(dialer, cancel).await {
                Ok(conn) => conn,
                Err(ConnectionError::Cancelled) => return Ok(()),
                Err(err) => return Err(Supervised::Connect(err)),
            };

            let err = match work(conn).await {
                Ok(()) => return Ok(()),
                Err(Interrupted::Failed(err)) => return Err(Supervised::Failed(err)),
                Err(Interrupted::ConnectionLost(err)) => err,
            };

            if cancel.is_cancelled() {
                return Ok(());
            }

            let delay = self.policy.delay(1);
            warn!(
                endpoint = endpoint.as_str(),
                delay_ms = delay.as_millis() as u64,
                error = err.to_string(),
                "connection lost, reconnecting"
            );

            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Ok(()),
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }
}
