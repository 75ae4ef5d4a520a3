// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

mod otel;

pub mod actions;
pub mod address;
pub mod broker;
pub mod channel;
pub mod config;
pub mod consumer;
pub mod dispatcher;
pub mod envelope;
pub mod error_action;
pub mod errors;
pub mod exchange;
pub mod memory;
pub mod message;
pub mod module;
pub mod queue;
pub mod registry;
pub mod subscriptions;
pub mod topology;
pub mod transaction;
pub mod transport;
