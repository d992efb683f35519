// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! Resilient RabbitMQ producer and consumer built on lapin.
//!
//! A [`supervisor::ConnectionSupervisor`] keeps one connection and one channel
//! alive, reconnecting and re-declaring the topology after failures. The
//! [`client::MQProducer`] pushes with publisher confirms and the
//! [`client::MQConsumer`] runs a prefetch-bounded worker pool that resubscribes
//! on its own.

mod otel;

pub mod broker;
pub mod channel;
pub mod client;
pub mod config;
pub mod consumer;
pub mod dispatcher;
pub mod errors;
pub mod exchange;
pub mod publisher;
pub mod signal;
pub mod supervisor;
pub mod topology;
