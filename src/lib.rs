// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

mod otel;

#[cfg(test)]
mod memory;

pub mod ack;
pub mod configs;
pub mod connection;
pub mod connector;
pub mod consumer;
pub mod dispatcher;
pub mod errors;
pub mod exchange;
pub mod message;
pub mod publisher;
pub mod queue;
pub mod rpc;
pub mod todo;
pub mod topology;
