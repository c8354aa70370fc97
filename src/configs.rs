// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Broker Configuration
//!
//! Connection settings are read from `BROKER_*` environment variables and fall
//! back to the defaults of the docker-compose deployment (`rabbitmq` host,
//! `guest` credentials).

use crate::connector::BackoffPolicy;
use config::{Config, ConfigError, Environment};
use lapin::uri::{AMQPAuthority, AMQPQueryString, AMQPScheme, AMQPUri, AMQPUserInfo};
use serde::Deserialize;
use std::time::Duration;
use uuid::Uuid;

/// Settings needed to reach and talk to the broker.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct BrokerConfig {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub pass: String,
    /// Virtual host name as the broker knows it, e.g. `/`
    pub vhost: String,
    pub heartbeat_secs: u16,
    /// How long a publish may stay blocked by a broker resource alarm
    pub blocked_timeout_secs: u64,
    pub max_attempts: u32,
    /// Name shown for the connection in the broker management UI
    pub connection_name: String,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            host: "rabbitmq".to_owned(),
            port: 5672,
            user: "guest".to_owned(),
            pass: "guest".to_owned(),
            vhost: "/".to_owned(),
            heartbeat_secs: 600,
            blocked_timeout_secs: 300,
            max_attempts: 12,
            connection_name: "todomq".to_owned(),
        }
    }
}

impl BrokerConfig {
    /// Loads the configuration from `BROKER_*` environment variables,
    /// e.g. `BROKER_HOST`, `BROKER_USER`, `BROKER_PASS`, `BROKER_HEARTBEAT_SECS`.
    pub fn from_env() -> Result<BrokerConfig, ConfigError> {
        Config::builder()
            .add_source(Environment::with_prefix("BROKER").try_parsing(true))
            .build()?
            .try_deserialize()
    }

    /// AMQP URI including credentials and the heartbeat negotiation parameter.
    ///
    /// Built from typed fields, so credentials and vhost names may contain
    /// characters that are reserved in URI syntax (`@`, `/`, `#`, `:`, `?`).
    ///
    /// # Returns
    /// The URI lapin connects with through `Connection::connect_uri`
    pub fn uri(&self) -> AMQPUri {
        AMQPUri {
            scheme: AMQPScheme::AMQP,
            authority: AMQPAuthority {
                userinfo: AMQPUserInfo {
                    username: self.user.clone(),
                    password: self.pass.clone(),
                },
                host: self.host.clone(),
                port: self.port,
            },
            vhost: self.vhost.clone(),
            query: AMQPQueryString {
                heartbeat: Some(self.heartbeat_secs),
                ..AMQPQueryString::default()
            },
        }
    }

    /// Endpoint without credentials, safe to log.
    pub fn endpoint(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn blocked_timeout(&self) -> Duration {
        Duration::from_secs(self.blocked_timeout_secs)
    }

    pub fn backoff(&self) -> BackoffPolicy {
        BackoffPolicy::default().max_attempts(self.max_attempts)
    }
}

/// Identity of a fanout subscriber, used in its log records.
///
/// Built once at startup and handed to the subscriber, so two subscribers in
/// the same process can carry different names.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscriberConfig {
    pub name: String,
}

impl SubscriberConfig {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }

    /// `subscriber-` followed by eight random hex characters.
    pub fn generated() -> Self {
        let id = Uuid::new_v4().simple().to_string();
        Self::new(format!("subscriber-{}", &id[..8]))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    #[test]
    #[serial]
    fn defaults_match_the_compose_deployment() {
        let cfg = BrokerConfig::default();
        assert_eq!(cfg.host, "rabbitmq");
        assert_eq!(cfg.user, "guest");
        assert_eq!(cfg.heartbeat_secs, 600);
        assert_eq!(cfg.blocked_timeout(), Duration::from_secs(300));
        assert_eq!(cfg.max_attempts, 12);

        let uri = cfg.uri();
        assert_eq!(uri.authority.userinfo.username, "guest");
        assert_eq!(uri.authority.host, "rabbitmq");
        assert_eq!(uri.authority.port, 5672);
        assert_eq!(uri.vhost, "/");
        assert_eq!(uri.query.heartbeat, Some(600));
    }

    #[test]
    #[serial]
    fn reserved_characters_in_credentials_reach_the_broker_intact() {
        temp_env::with_vars(
            [
                ("BROKER_USER", Some("svc:ops")),
                ("BROKER_PASS", Some("p@ss/w#rd?x")),
                ("BROKER_VHOST", Some("team/a")),
            ],
            || {
                let uri = BrokerConfig::from_env().unwrap().uri();
                assert_eq!(uri.authority.userinfo.username, "svc:ops");
                assert_eq!(uri.authority.userinfo.password, "p@ss/w#rd?x");
                assert_eq!(uri.authority.host, "rabbitmq");
                assert_eq!(uri.authority.port, 5672);
                assert_eq!(uri.vhost, "team/a");
                assert_eq!(uri.query.heartbeat, Some(600));
            },
        );
    }

    #[test]
    #[serial]
    fn environment_overrides_defaults() {
        temp_env::with_vars(
            [
                ("BROKER_HOST", Some("broker.internal")),
                ("BROKER_USER", Some("svc")),
                ("BROKER_PASS", Some("secret")),
                ("BROKER_MAX_ATTEMPTS", Some("3")),
            ],
            || {
                let cfg = BrokerConfig::from_env().unwrap();
                assert_eq!(cfg.host, "broker.internal");
                assert_eq!(cfg.user, "svc");
                assert_eq!(cfg.pass, "secret");
                assert_eq!(cfg.max_attempts, 3);
                assert_eq!(cfg.port, 5672);
                assert_eq!(cfg.endpoint(), "broker.internal:5672");
            },
        );
    }

    #[test]
    fn generated_subscriber_names_are_distinct() {
        let a = SubscriberConfig::generated();
        let b = SubscriberConfig::generated();
        assert!(a.name.starts_with("subscriber-"));
        assert_eq!(a.name.len(), "subscriber-".len() + 8);
        assert_ne!(a, b);
    }
}
