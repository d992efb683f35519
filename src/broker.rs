// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Broker Abstractions
//!
//! The supervisor, the publisher and the consumer never talk to the wire library
//! directly. They go through the traits in this module, which describe exactly the
//! broker operations the client needs: dial, open a channel, passive/durable
//! declares, bind, confirm mode, qos, publish with a pending confirmation, consume,
//! and close notifications. `crate::channel` implements them on top of lapin.

use crate::{
    channel::Endpoint, consumer::Delivery, errors::AmqpError, exchange::ExchangeKind,
    signal::CloseSignal,
};
use async_trait::async_trait;
use futures_util::{future::BoxFuture, stream::BoxStream};
use lapin::types::{AMQPValue, FieldTable, ShortString};
use std::{collections::BTreeMap, sync::Arc};

/// Outcome of a publisher confirmation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Confirmation {
    /// The broker took responsibility for the message
    Ack,
    /// The broker refused the message
    Nack,
    /// The channel is not in confirm mode
    NotRequested,
}

/// Confirmation of a publish that has been written but not yet confirmed.
pub type PendingConfirm = BoxFuture<'static, Result<Confirmation, AmqpError>>;

/// Ordered stream of deliveries handed out by the broker for one consumer.
pub type DeliveryStream = BoxStream<'static, Result<Delivery, AmqpError>>;

/// A message ready to be written to a channel.
#[derive(Debug, Clone, PartialEq)]
pub struct OutboundMessage {
    pub exchange: String,
    pub routing_key: String,
    pub payload: Vec<u8>,
    pub content_type: String,
    pub priority: u8,
    pub message_id: String,
    pub headers: BTreeMap<ShortString, AMQPValue>,
}

/// Dials the broker.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Connector: Send + Sync {
    /// Opens a new transport connection to `endpoint`.
    async fn connect(&self, endpoint: &Endpoint) -> Result<Arc<dyn BrokerConnection>, AmqpError>;
}

/// A live transport connection.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait BrokerConnection: Send + Sync {
    /// Opens a new channel multiplexed over this connection.
    async fn open_channel(&self) -> Result<Arc<dyn BrokerChannel>, AmqpError>;

    /// One-shot signal fired when the broker or the network closes the connection.
    fn close_signal(&self) -> CloseSignal;

    async fn close(&self) -> Result<(), AmqpError>;
}

/// A logical channel on top of a connection.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait BrokerChannel: Send + Sync {
    /// Passive declare: `Ok(false)` when the queue does not exist.
    async fn queue_exists(&self, queue: &str) -> Result<bool, AmqpError>;

    /// Durable declare of `queue` with the given arguments.
    async fn declare_queue(&self, queue: &str, args: &FieldTable) -> Result<(), AmqpError>;

    /// Passive declare: `Ok(false)` when the exchange does not exist.
    async fn exchange_exists(&self, exchange: &str, kind: &ExchangeKind)
        -> Result<bool, AmqpError>;

    /// Durable declare of `exchange`.
    async fn declare_exchange(
        &self,
        exchange: &str,
        kind: &ExchangeKind,
        args: &FieldTable,
    ) -> Result<(), AmqpError>;

    async fn bind_queue(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
    ) -> Result<(), AmqpError>;

    /// Switches the channel into publisher confirm mode.
    async fn confirm_select(&self) -> Result<(), AmqpError>;

    /// Limits the number of unacknowledged deliveries handed to this channel.
    async fn qos(&self, prefetch: u16) -> Result<(), AmqpError>;

    /// Writes `message` and returns its pending confirmation.
    ///
    /// An `Err` means the publish itself failed and nothing was sent.
    async fn publish(&self, message: OutboundMessage) -> Result<PendingConfirm, AmqpError>;

    /// Starts a manual-ack consumer on `queue`.
    async fn consume(&self, queue: &str, consumer_tag: &str)
        -> Result<DeliveryStream, AmqpError>;

    /// One-shot signal fired when the channel is closed.
    fn close_signal(&self) -> CloseSignal;

    async fn close(&self) -> Result<(), AmqpError>;
}

/// Settles a single delivery.
#[async_trait]
pub trait Acknowledge: Send + Sync {
    async fn ack(&self) -> Result<(), AmqpError>;

    async fn nack(&self, requeue: bool) -> Result<(), AmqpError>;

    async fn reject(&self, requeue: bool) -> Result<(), AmqpError>;
}
