// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Endpoint Addresses
//!
//! An `Address` describes where a message goes: the broker, the virtual host,
//! the credentials, and the exchange / queue / routing keys to publish with.
//!
//! The textual form is
//! `scheme://[user[:password]@]broker[:port]/[vhost/]queue?routingKey=..&routeByType=..&ssl=..#exchange`
//! where `rmq`/`amqp` select a plain connection and `rmqs`/`amqps` select TLS.

use crate::errors::AddressError;
use std::{
    fmt,
    hash::{Hash, Hasher},
    str::FromStr,
};
use tracing::warn;

const ROUTING_KEY_PARAM: &str = "routingKey";
const ROUTE_BY_TYPE_PARAM: &str = "routeByType";
const SSL_PARAM: &str = "ssl";
const SERVER_NAME_PARAM: &str = "serverName";

/// Auxiliary queues derived from an endpoint queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SubQueue {
    Subscriptions,
    Errors,
    Discarded,
}

impl SubQueue {
    pub fn as_str(&self) -> &'static str {
        match self {
            SubQueue::Subscriptions => "subscriptions",
            SubQueue::Errors => "errors",
            SubQueue::Discarded => "discarded",
        }
    }
}

impl fmt::Display for SubQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// TLS settings of a broker connection.
///
/// The lapin connector only applies `enabled`; a `server_name` other than
/// the broker host and any `protocol` are logged and ignored.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TlsOptions {
    pub enabled: bool,
    /// Name checked against the broker certificate. Defaults to the broker host.
    pub server_name: String,
    /// Requested protocol version, e.g. `tls12`.
    pub protocol: Option<String>,
}

/// Immutable broker endpoint descriptor.
///
/// Equality and hashing consider the broker, exchange, queue, routing keys,
/// the route-by-type flag and whether TLS is enabled. Virtual host and
/// credentials are connection concerns and do not change which endpoint an
/// address designates.
#[derive(Debug, Clone)]
pub struct Address {
    broker: String,
    virtual_host: String,
    username: String,
    password: String,
    exchange: String,
    queue: String,
    routing_keys: String,
    route_by_type: bool,
    tls: TlsOptions,
}

impl Address {
    /// Builds an address and checks that it names something to talk to.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        broker: &str,
        virtual_host: &str,
        username: &str,
        password: &str,
        exchange: &str,
        queue: &str,
        routing_keys: &str,
        route_by_type: bool,
        tls: TlsOptions,
    ) -> Result<Address, AddressError> {
        let address = Address {
            broker: broker.to_lowercase(),
            virtual_host: virtual_host.to_owned(),
            username: username.to_owned(),
            password: password.to_owned(),
            exchange: exchange.to_owned(),
            queue: queue.to_owned(),
            routing_keys: routing_keys.to_owned(),
            route_by_type,
            tls,
        };
        address.validate()?;
        Ok(address)
    }

    /// Parses an endpoint URI.
    pub fn parse(value: &str) -> Result<Address, AddressError> {
        let (scheme, rest) = value
            .split_once("://")
            .ok_or_else(|| AddressError::InvalidUri(value.to_owned()))?;

        let tls_enabled = match scheme.to_lowercase().as_str() {
            "rmq" | "amqp" => false,
            "rmqs" | "amqps" => true,
            other => return Err(AddressError::UnsupportedScheme(other.to_owned())),
        };

        let (rest, fragment) = match rest.split_once('#') {
            Some((rest, fragment)) => (rest, Some(fragment)),
            None => (rest, None),
        };
        let (rest, query) = match rest.split_once('?') {
            Some((rest, query)) => (rest, Some(query)),
            None => (rest, None),
        };
        let (authority, path) = match rest.split_once('/') {
            Some((authority, path)) => (authority, path),
            None => (rest, ""),
        };

        let (user_info, host) = match authority.rsplit_once('@') {
            Some((user_info, host)) => (Some(user_info), host),
            None => (None, authority),
        };
        if host.is_empty() {
            return Err(AddressError::InvalidUri(value.to_owned()));
        }

        let (username, password) = match user_info {
            Some(info) => match info.split_once(':') {
                Some((user, pass)) => (decode(user, value)?, decode(pass, value)?),
                None => (decode(info, value)?, String::new()),
            },
            None => (String::new(), String::new()),
        };

        let segments: Vec<&str> = if path.is_empty() {
            vec![]
        } else {
            path.split('/').collect()
        };
        let (virtual_host, queue) = match segments.as_slice() {
            [] => (String::new(), String::new()),
            [queue] => (String::new(), decode(queue, value)?),
            [vhost, queue] => (decode(vhost, value)?, decode(queue, value)?),
            _ => return Err(AddressError::InvalidUri(value.to_owned())),
        };

        let mut routing_keys = String::new();
        let mut route_by_type = false;
        let mut tls = TlsOptions {
            enabled: tls_enabled,
            server_name: String::new(),
            protocol: None,
        };

        for pair in query.unwrap_or_default().split('&').filter(|p| !p.is_empty()) {
            let (key, val) = pair.split_once('=').unwrap_or((pair, ""));
            let val = decode(&val.replace('+', " "), value)?;
            match key {
                ROUTING_KEY_PARAM => routing_keys = val,
                ROUTE_BY_TYPE_PARAM => {
                    route_by_type = val.parse::<bool>().map_err(|_| {
                        AddressError::InvalidParameter(ROUTE_BY_TYPE_PARAM.to_owned(), val.clone())
                    })?
                }
                SSL_PARAM => {
                    tls.enabled = true;
                    if !val.is_empty() {
                        tls.protocol = Some(val);
                    }
                }
                SERVER_NAME_PARAM => tls.server_name = val,
                other => warn!(parameter = other, "ignoring unknown endpoint parameter"),
            }
        }

        let broker = host.to_lowercase();
        if tls.server_name.is_empty() {
            tls.server_name = host_part(&broker).to_owned();
        }

        let exchange = match fragment {
            Some(fragment) => decode(fragment, value)?,
            None => String::new(),
        };

        if exchange.is_empty() && queue.is_empty() && routing_keys.trim().is_empty() {
            return Err(AddressError::Underspecified(value.to_owned()));
        }

        Address::new(
            &broker,
            &virtual_host,
            &username,
            &password,
            &exchange,
            &queue,
            &routing_keys,
            route_by_type,
            tls,
        )
    }

    fn validate(&self) -> Result<(), AddressError> {
        if self.exchange.is_empty() && (self.route_by_type || !self.routing_keys.trim().is_empty())
        {
            return Err(AddressError::MissingExchange(self.to_string()));
        }
        if !self.queue.is_empty() && (self.route_by_type || !self.routing_keys.trim().is_empty()) {
            warn!(
                queue = %self.queue,
                "queue specified with routing keys, publishes route by queue name"
            );
        }
        Ok(())
    }

    /// Broker as `host[:port]`, lowercased.
    pub fn broker(&self) -> &str {
        &self.broker
    }

    pub fn host(&self) -> &str {
        host_part(&self.broker)
    }

    pub fn port(&self) -> Option<u16> {
        self.broker
            .rsplit_once(':')
            .and_then(|(_, port)| port.parse::<u16>().ok())
    }

    pub fn virtual_host(&self) -> &str {
        &self.virtual_host
    }

    pub fn username(&self) -> &str {
        &self.username
    }

    pub fn password(&self) -> &str {
        &self.password
    }

    pub fn exchange(&self) -> &str {
        &self.exchange
    }

    pub fn queue(&self) -> &str {
        &self.queue
    }

    /// Raw, space-delimited routing keys.
    pub fn routing_keys(&self) -> &str {
        &self.routing_keys
    }

    pub fn routing_keys_list(&self) -> Vec<&str> {
        self.routing_keys.split_whitespace().collect()
    }

    pub fn route_by_type(&self) -> bool {
        self.route_by_type
    }

    pub fn tls(&self) -> &TlsOptions {
        &self.tls
    }

    /// Derives the address of an auxiliary queue, `<queue>.<kind>`.
    pub fn for_sub_queue(&self, kind: SubQueue) -> Address {
        let mut derived = self.clone();
        derived.queue = format!("{}.{}", self.queue, kind);
        derived.exchange = String::new();
        derived.routing_keys = String::new();
        derived.route_by_type = false;
        derived
    }

    /// Same broker, routed through `exchange` instead of this address' own.
    pub fn with_exchange(&self, exchange: &str) -> Address {
        let mut derived = self.clone();
        derived.exchange = exchange.to_owned();
        derived
    }

    /// Same broker and exchange, addressed with an explicit routing key.
    pub fn with_route(&self, route: &str) -> Address {
        let mut derived = self.clone();
        derived.queue = String::new();
        derived.routing_keys = route.to_owned();
        derived.route_by_type = false;
        derived
    }
}

impl PartialEq for Address {
    fn eq(&self, other: &Self) -> bool {
        self.broker == other.broker
            && self.exchange == other.exchange
            && self.queue == other.queue
            && self.routing_keys == other.routing_keys
            && self.route_by_type == other.route_by_type
            && self.tls.enabled == other.tls.enabled
    }
}

impl Eq for Address {}

impl Hash for Address {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.broker.hash(state);
        self.exchange.hash(state);
        self.queue.hash(state);
        self.routing_keys.hash(state);
        self.route_by_type.hash(state);
        self.tls.enabled.hash(state);
    }
}

impl FromStr for Address {
    type Err = AddressError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Address::parse(s)
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let scheme = if self.tls.enabled { "rmqs" } else { "rmq" };
        write!(f, "{}://", scheme)?;

        if !self.username.is_empty() || !self.password.is_empty() {
            write!(f, "{}", urlencoding::encode(&self.username))?;
            if !self.password.is_empty() {
                write!(f, ":{}", urlencoding::encode(&self.password))?;
            }
            f.write_str("@")?;
        }

        write!(f, "{}/", self.broker)?;
        if !self.virtual_host.is_empty() {
            write!(f, "{}/", urlencoding::encode(&self.virtual_host))?;
        }
        write!(f, "{}", urlencoding::encode(&self.queue))?;

        let mut params = vec![];
        if !self.routing_keys.is_empty() {
            params.push(format!(
                "{}={}",
                ROUTING_KEY_PARAM,
                urlencoding::encode(&self.routing_keys)
            ));
        }
        if self.route_by_type {
            params.push(format!("{}=true", ROUTE_BY_TYPE_PARAM));
        }
        if let Some(protocol) = self.tls.protocol.as_ref().filter(|_| self.tls.enabled) {
            params.push(format!("{}={}", SSL_PARAM, urlencoding::encode(protocol)));
        }
        if self.tls.enabled && self.tls.server_name != self.host() {
            params.push(format!(
                "{}={}",
                SERVER_NAME_PARAM,
                urlencoding::encode(&self.tls.server_name)
            ));
        }
        if !params.is_empty() {
            write!(f, "?{}", params.join("&"))?;
        }

        if !self.exchange.is_empty() {
            write!(f, "#{}", urlencoding::encode(&self.exchange))?;
        }

        Ok(())
    }
}

fn host_part(broker: &str) -> &str {
    match broker.rsplit_once(':') {
        Some((host, port)) if port.parse::<u16>().is_ok() => host,
        _ => broker,
    }
}

fn decode(raw: &str, uri: &str) -> Result<String, AddressError> {
    urlencoding::decode(raw)
        .map(|v| v.into_owned())
        .map_err(|_| AddressError::InvalidUri(uri.to_owned()))
}
