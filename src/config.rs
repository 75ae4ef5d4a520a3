// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Transport Configuration
//!
//! Settings of one bus endpoint. Deserializable (every field defaults), built
//! fluently in code, or read from `SERVICE_BUS_*` environment variables.
//!
//! | Variable                              | Field                    |
//! |---------------------------------------|--------------------------|
//! | `SERVICE_BUS_ENDPOINT`                | `endpoint`               |
//! | `SERVICE_BUS_THREAD_COUNT`            | `thread_count`           |
//! | `SERVICE_BUS_CONSUME_IN_TRANSACTION`  | `consume_in_transaction` |
//! | `SERVICE_BUS_NUMBER_OF_RETRIES`       | `number_of_retries`      |
//! | `SERVICE_BUS_DELAY_EXCHANGE`          | `delay_exchange`         |
//! | `SERVICE_BUS_DRAIN_TIMEOUT_MS`        | `drain_timeout_ms`       |
//! | `SERVICE_BUS_CONNECTION_NAME`         | `connection_name`        |
//! | `SERVICE_BUS_DISABLE_QUEUE_CREATION`  | `disable_queue_creation` |
//! | `SERVICE_BUS_OWNERS`                  | `owners`, as `prefix=uri;prefix=uri` |

use crate::{actions::MessageOwner, address::Address, errors::BusError};
use serde::Deserialize;
use std::{str::FromStr, time::Duration};

const ENV_PREFIX: &str = "SERVICE_BUS_";

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct TransportConfig {
    /// Endpoint URI this bus consumes from and replies to.
    pub endpoint: String,
    /// Deliveries processed concurrently. Zero makes the endpoint send-only.
    pub thread_count: usize,
    /// When false, a failed delivery is republished instead of requeued.
    pub consume_in_transaction: bool,
    pub number_of_retries: u32,
    pub delay_exchange: Option<String>,
    pub drain_timeout_ms: u64,
    pub connection_name: String,
    pub disable_queue_creation: bool,
    pub owners: Vec<MessageOwner>,
}

impl Default for TransportConfig {
    fn default() -> Self {
        TransportConfig {
            endpoint: String::new(),
            thread_count: 1,
            consume_in_transaction: true,
            number_of_retries: 5,
            delay_exchange: None,
            drain_timeout_ms: 30_000,
            connection_name: "rabbitbus".to_owned(),
            disable_queue_creation: false,
            owners: vec![],
        }
    }
}

impl TransportConfig {
    pub fn new(endpoint: &str) -> TransportConfig {
        TransportConfig {
            endpoint: endpoint.to_owned(),
            ..Default::default()
        }
    }

    pub fn thread_count(mut self, count: usize) -> Self {
        self.thread_count = count;
        self
    }

    pub fn consume_in_transaction(mut self, enabled: bool) -> Self {
        self.consume_in_transaction = enabled;
        self
    }

    pub fn number_of_retries(mut self, retries: u32) -> Self {
        self.number_of_retries = retries;
        self
    }

    pub fn delay_exchange(mut self, exchange: &str) -> Self {
        self.delay_exchange = Some(exchange.to_owned());
        self
    }

    pub fn drain_timeout_ms(mut self, millis: u64) -> Self {
        self.drain_timeout_ms = millis;
        self
    }

    pub fn connection_name(mut self, name: &str) -> Self {
        self.connection_name = name.to_owned();
        self
    }

    pub fn disable_queue_creation(mut self, disabled: bool) -> Self {
        self.disable_queue_creation = disabled;
        self
    }

    pub fn owner(mut self, owner: MessageOwner) -> Self {
        self.owners.push(owner);
        self
    }

    pub fn drain_timeout(&self) -> Duration {
        Duration::from_millis(self.drain_timeout_ms)
    }

    pub fn endpoint_address(&self) -> Result<Address, BusError> {
        if self.endpoint.is_empty() {
            return Err(BusError::Config("endpoint is not configured".to_owned()));
        }
        Address::parse(&self.endpoint)
            .map_err(|err| BusError::Config(format!("invalid endpoint: {}", err)))
    }

    /// Reads the configuration from the process environment.
    pub fn from_env() -> Result<TransportConfig, BusError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Reads the configuration through `lookup`, given full variable names.
    pub fn from_lookup<F>(lookup: F) -> Result<TransportConfig, BusError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |name: &str| lookup(&format!("{}{}", ENV_PREFIX, name));
        let mut config = TransportConfig::default();

        if let Some(endpoint) = var("ENDPOINT") {
            config.endpoint = endpoint;
        }
        if let Some(value) = var("THREAD_COUNT") {
            config.thread_count = parse_var("THREAD_COUNT", &value)?;
        }
        if let Some(value) = var("CONSUME_IN_TRANSACTION") {
            config.consume_in_transaction = parse_var("CONSUME_IN_TRANSACTION", &value)?;
        }
        if let Some(value) = var("NUMBER_OF_RETRIES") {
            config.number_of_retries = parse_var("NUMBER_OF_RETRIES", &value)?;
        }
        if let Some(exchange) = var("DELAY_EXCHANGE").filter(|e| !e.is_empty()) {
            config.delay_exchange = Some(exchange);
        }
        if let Some(value) = var("DRAIN_TIMEOUT_MS") {
            config.drain_timeout_ms = parse_var("DRAIN_TIMEOUT_MS", &value)?;
        }
        if let Some(name) = var("CONNECTION_NAME") {
            config.connection_name = name;
        }
        if let Some(value) = var("DISABLE_QUEUE_CREATION") {
            config.disable_queue_creation = parse_var("DISABLE_QUEUE_CREATION", &value)?;
        }
        if let Some(value) = var("OWNERS") {
            config.owners = parse_owners(&value)?;
        }

        Ok(config)
    }
}

fn parse_var<T: FromStr>(name: &str, value: &str) -> Result<T, BusError> {
    value.trim().parse().map_err(|_| {
        BusError::Config(format!("invalid value `{}` for {}{}", value, ENV_PREFIX, name))
    })
}

fn parse_owners(value: &str) -> Result<Vec<MessageOwner>, BusError> {
    value
        .split(';')
        .map(str::trim)
        .filter(|entry| !entry.is_empty())
        .map(|entry| {
            entry
                .split_once('=')
                .map(|(name, endpoint)| MessageOwner::new(name.trim(), endpoint.trim()))
                .ok_or_else(|| BusError::Config(format!("invalid message owner `{}`", entry)))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| vars.get(key).cloned()
    }

    #[test]
    fn defaults() {
        let config = TransportConfig::default();

        assert_eq!(config.thread_count, 1);
        assert!(config.consume_in_transaction);
        assert_eq!(config.number_of_retries, 5);
        assert_eq!(config.drain_timeout(), Duration::from_secs(30));
        assert_eq!(config.delay_exchange, None);
    }

    #[test]
    fn reads_environment_variables() {
        let config = TransportConfig::from_lookup(lookup(&[
            ("SERVICE_BUS_ENDPOINT", "rmq://localhost/orders"),
            ("SERVICE_BUS_THREAD_COUNT", "4"),
            ("SERVICE_BUS_CONSUME_IN_TRANSACTION", "false"),
            ("SERVICE_BUS_DELAY_EXCHANGE", "delayed"),
            ("SERVICE_BUS_OWNERS", "Billing.=rmq://localhost/billing; Orders.=rmq://localhost/orders"),
        ]))
        .unwrap();

        assert_eq!(config.endpoint, "rmq://localhost/orders");
        assert_eq!(config.thread_count, 4);
        assert!(!config.consume_in_transaction);
        assert_eq!(config.number_of_retries, 5);
        assert_eq!(config.delay_exchange.as_deref(), Some("delayed"));
        assert_eq!(
            config.owners,
            vec![
                MessageOwner::new("Billing.", "rmq://localhost/billing"),
                MessageOwner::new("Orders.", "rmq://localhost/orders"),
            ]
        );
    }

    #[test]
    fn rejects_malformed_values() {
        let err = TransportConfig::from_lookup(lookup(&[("SERVICE_BUS_THREAD_COUNT", "many")]))
            .unwrap_err();
        assert!(matches!(err, BusError::Config(_)));

        let err = TransportConfig::from_lookup(lookup(&[("SERVICE_BUS_OWNERS", "nobody")]))
            .unwrap_err();
        assert!(matches!(err, BusError::Config(_)));
    }

    #[test]
    fn deserializes_with_defaults() {
        let config: TransportConfig = serde_json::from_str(
            r#"{ "endpoint": "rmq://localhost/orders", "number_of_retries": 2 }"#,
        )
        .unwrap();

        assert_eq!(config.number_of_retries, 2);
        assert_eq!(config.thread_count, 1);
        assert_eq!(config.endpoint_address().unwrap().queue(), "orders");
    }

    #[test]
    fn missing_endpoint_is_a_config_error() {
        assert!(matches!(
            TransportConfig::default().endpoint_address(),
            Err(BusError::Config(_))
        ));
    }
}
