// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # RabbitMQ Topology Management
//!
//! This module describes the queue/exchange layout a client depends on and installs
//! it on a channel. Installation is idempotent: every queue and exchange is first
//! checked passively and only declared when missing, so it is safe to run again
//! after every reconnect.
//!
//! The main components are:
//! - `Topology`: the immutable descriptor (queue, exchange, routing key, arguments)
//! - `ensure_topology`: the passive-check-then-declare-then-bind installer
//! - Header constants: the queue/exchange argument names understood by RabbitMQ

use crate::{broker::BrokerChannel, errors::AmqpError, exchange::ExchangeKind};
use lapin::types::{AMQPValue, FieldTable, LongInt, LongString, ShortShortUInt, ShortString};
use std::collections::BTreeMap;
use tracing::{debug, error};

/// Constant for the header field used to specify the maximum priority of a queue
pub const AMQP_HEADERS_MAX_PRIORITY: &str = "x-max-priority";
/// Constant for the header field used to specify message TTL
pub const AMQP_HEADERS_MESSAGE_TTL: &str = "x-message-ttl";
/// Constant for the header field used to specify maximum queue length
pub const AMQP_HEADERS_MAX_LENGTH: &str = "x-max-length";
/// Constant for the header field used to specify maximum queue size in bytes
pub const AMQP_HEADERS_MAX_LENGTH_BYTES: &str = "x-max-length-bytes";
/// Constant for the header field used to specify the delayed exchange type
pub const AMQP_HEADERS_DELAYED_EXCHANGE_TYPE: &str = "x-delayed-type";

/// Immutable description of the queue and the optional exchange binding a client uses.
///
/// When either the exchange name or the routing key is empty, no binding is made and
/// messages are published straight to the queue through the default exchange.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Topology {
    pub(crate) queue_name: String,
    pub(crate) exchange_name: String,
    pub(crate) exchange_kind: ExchangeKind,
    pub(crate) routing_key: String,
    pub(crate) queue_args: BTreeMap<ShortString, AMQPValue>,
    pub(crate) exchange_args: BTreeMap<ShortString, AMQPValue>,
}

impl Topology {
    /// Creates a topology that publishes directly to `queue`.
    pub fn new(queue: &str) -> Topology {
        Topology {
            queue_name: queue.to_owned(),
            ..Default::default()
        }
    }

    /// Routes through `exchange` of the given kind.
    pub fn exchange(mut self, exchange: &str, kind: ExchangeKind) -> Self {
        self.exchange_name = exchange.to_owned();
        self.exchange_kind = kind;
        self
    }

    /// Routes through a delayed-message exchange that behaves like `inner` once the
    /// delay elapsed. Requires the x-delayed-message plugin on the broker.
    pub fn delayed_exchange(mut self, exchange: &str, inner: ExchangeKind) -> Self {
        self.exchange_name = exchange.to_owned();
        self.exchange_kind = ExchangeKind::XMessageDelayed;
        self.exchange_args.insert(
            ShortString::from(AMQP_HEADERS_DELAYED_EXCHANGE_TYPE),
            AMQPValue::LongString(LongString::from(inner.as_str())),
        );
        self
    }

    /// Sets the routing key used both for the binding and for publishing.
    pub fn routing_key(mut self, key: &str) -> Self {
        self.routing_key = key.to_owned();
        self
    }

    /// Adds a raw queue declare argument.
    pub fn arg(mut self, key: &str, value: AMQPValue) -> Self {
        self.queue_args.insert(ShortString::from(key), value);
        self
    }

    /// Turns the queue into a priority queue accepting priorities up to `max`.
    pub fn max_priority(self, max: u8) -> Self {
        self.arg(
            AMQP_HEADERS_MAX_PRIORITY,
            AMQPValue::ShortShortUInt(ShortShortUInt::from(max)),
        )
    }

    /// Sets the message Time-To-Live (TTL) for the queue, in milliseconds.
    pub fn ttl(self, ttl: i32) -> Self {
        self.arg(AMQP_HEADERS_MESSAGE_TTL, AMQPValue::LongInt(LongInt::from(ttl)))
    }

    /// Sets the maximum number of messages the queue can hold.
    pub fn max_length(self, max: i32) -> Self {
        self.arg(AMQP_HEADERS_MAX_LENGTH, AMQPValue::LongInt(LongInt::from(max)))
    }

    /// Sets the maximum size in bytes the queue can hold.
    pub fn max_length_bytes(self, max_bytes: i32) -> Self {
        self.arg(
            AMQP_HEADERS_MAX_LENGTH_BYTES,
            AMQPValue::LongInt(LongInt::from(max_bytes)),
        )
    }

    pub fn queue_name(&self) -> &str {
        &self.queue_name
    }

    pub fn exchange_name(&self) -> &str {
        &self.exchange_name
    }

    pub fn exchange_kind(&self) -> &ExchangeKind {
        &self.exchange_kind
    }

    pub fn routing_key_name(&self) -> &str {
        &self.routing_key
    }

    /// Whether messages are routed through an exchange binding.
    pub fn uses_exchange(&self) -> bool {
        !self.exchange_name.is_empty() && !self.routing_key.is_empty()
    }

    /// The `(exchange, routing key)` pair a publish must target.
    pub fn publish_target(&self) -> (&str, &str) {
        if self.uses_exchange() {
            (&self.exchange_name, &self.routing_key)
        } else {
            ("", &self.queue_name)
        }
    }

    /// Checks the descriptor before any broker work is attempted.
    pub fn validate(&self) -> Result<(), AmqpError> {
        if self.queue_name.trim().is_empty() {
            return Err(AmqpError::InvalidTopology(
                "queue name must not be empty".to_owned(),
            ));
        }

        Ok(())
    }

    pub(crate) fn queue_arguments(&self) -> FieldTable {
        FieldTable::from(self.queue_args.clone())
    }

    pub(crate) fn exchange_arguments(&self) -> FieldTable {
        FieldTable::from(self.exchange_args.clone())
    }
}

/// Installs `topology` on `channel`.
///
/// This method performs the following operations in order:
/// 1. Checks the queue passively and declares it durably when missing
/// 2. When exchange routing is configured, checks the exchange passively and
///    declares it durably when missing
/// 3. Binds the queue to the exchange with the routing key
///
/// Running it against a broker that already has the topology issues no declare.
pub async fn ensure_topology(
    channel: &dyn BrokerChannel,
    topology: &Topology,
) -> Result<(), AmqpError> {
    topology.validate()?;

    install_queue(channel, topology).await?;

    if !topology.uses_exchange() {
        debug!(
            queue = %topology.queue_name,
            "no exchange routing configured, publishing straight to the queue"
        );
        return Ok(());
    }

    install_exchange(channel, topology).await?;
    binding_queue(channel, topology).await
}

async fn install_queue(channel: &dyn BrokerChannel, topology: &Topology) -> Result<(), AmqpError> {
    let name = topology.queue_name.as_str();

    if channel.queue_exists(name).await? {
        debug!("queue: {} already exists", name);
        return Ok(());
    }

    debug!("creating queue: {}", name);
    match channel.declare_queue(name, &topology.queue_arguments()).await {
        Err(err) => {
            error!(error = err.to_string(), name, "registration queue failed");
            Err(err)
        }
        _ => {
            debug!("queue: {} was created", name);
            Ok(())
        }
    }
}

async fn install_exchange(
    channel: &dyn BrokerChannel,
    topology: &Topology,
) -> Result<(), AmqpError> {
    let name = topology.exchange_name.as_str();

    if channel.exchange_exists(name, &topology.exchange_kind).await? {
        debug!("exchange: {} already exists", name);
        return Ok(());
    }

    debug!("creating exchange: {}", name);
    match channel
        .declare_exchange(name, &topology.exchange_kind, &topology.exchange_arguments())
        .await
    {
        Err(err) => {
            error!(error = err.to_string(), name, "registration exchange failed");
            Err(err)
        }
        _ => {
            debug!("exchange: {} was created", name);
            Ok(())
        }
    }
}

async fn binding_queue(channel: &dyn BrokerChannel, topology: &Topology) -> Result<(), AmqpError> {
    debug!(
        "binding queue: {} to the exchange: {} with the key: {}",
        topology.queue_name, topology.exchange_name, topology.routing_key
    );

    match channel
        .bind_queue(
            &topology.queue_name,
            &topology.exchange_name,
            &topology.routing_key,
        )
        .await
    {
        Err(err) => {
            error!(error = err.to_string(), "error to bind queue to exchange");
            Err(err)
        }
        _ => {
            debug!("queue was bounded");
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::MockBrokerChannel;
    use mockall::predicate::eq;

    fn routed() -> Topology {
        Topology::new("orders")
            .exchange("orders-ex", ExchangeKind::Topic)
            .routing_key("orders.created")
            .max_priority(10)
    }

    #[test]
    fn empty_routing_publishes_to_queue() {
        let topology = Topology::new("orders").exchange("orders-ex", ExchangeKind::Direct);

        assert!(!topology.uses_exchange());
        assert_eq!(topology.publish_target(), ("", "orders"));
        assert_eq!(routed().publish_target(), ("orders-ex", "orders.created"));
    }

    #[test]
    fn empty_queue_is_fatal() {
        let err = Topology::new(" ").validate().unwrap_err();
        assert!(err.is_fatal());
    }

    #[test]
    fn delayed_exchange_carries_inner_type() {
        let topology = Topology::new("jobs").delayed_exchange("jobs-ex", ExchangeKind::Fanout);

        assert_eq!(topology.exchange_kind, ExchangeKind::XMessageDelayed);
        assert_eq!(
            topology
                .exchange_args
                .get(&ShortString::from(AMQP_HEADERS_DELAYED_EXCHANGE_TYPE)),
            Some(&AMQPValue::LongString(LongString::from("fanout")))
        );
    }

    #[tokio::test]
    async fn existing_topology_is_not_declared_again() {
        let mut channel = MockBrokerChannel::new();
        channel
            .expect_queue_exists()
            .with(eq("orders"))
            .times(2)
            .returning(|_| Ok(true));
        channel
            .expect_exchange_exists()
            .times(2)
            .returning(|_, _| Ok(true));
        channel.expect_declare_queue().never();
        channel.expect_declare_exchange().never();
        channel
            .expect_bind_queue()
            .with(eq("orders"), eq("orders-ex"), eq("orders.created"))
            .times(2)
            .returning(|_, _, _| Ok(()));

        let topology = routed();
        assert_eq!(ensure_topology(&channel, &topology).await, Ok(()));
        assert_eq!(ensure_topology(&channel, &topology).await, Ok(()));
    }

    #[tokio::test]
    async fn missing_queue_is_declared_with_arguments() {
        let mut channel = MockBrokerChannel::new();
        channel.expect_queue_exists().returning(|_| Ok(false));
        channel
            .expect_declare_queue()
            .withf(|name, args| {
                name == "orders"
                    && args
                        .inner()
                        .contains_key(&ShortString::from(AMQP_HEADERS_MAX_PRIORITY))
            })
            .times(1)
            .returning(|_, _| Ok(()));
        channel.expect_exchange_exists().returning(|_, _| Ok(false));
        channel
            .expect_declare_exchange()
            .withf(|name, kind, _| name == "orders-ex" && *kind == ExchangeKind::Topic)
            .times(1)
            .returning(|_, _, _| Ok(()));
        channel.expect_bind_queue().times(1).returning(|_, _, _| Ok(()));

        assert_eq!(ensure_topology(&channel, &routed()).await, Ok(()));
    }

    #[tokio::test]
    async fn direct_queue_skips_exchange_work() {
        let mut channel = MockBrokerChannel::new();
        channel.expect_queue_exists().returning(|_| Ok(true));
        channel.expect_exchange_exists().never();
        channel.expect_bind_queue().never();

        assert_eq!(
            ensure_topology(&channel, &Topology::new("orders")).await,
            Ok(())
        );
    }

    #[tokio::test]
    async fn declare_failure_is_reported() {
        let mut channel = MockBrokerChannel::new();
        channel.expect_queue_exists().returning(|_| Ok(false));
        channel
            .expect_declare_queue()
            .returning(|name, _| Err(AmqpError::DeclareQueueError(name.to_owned())));

        assert_eq!(
            ensure_topology(&channel, &routed()).await,
            Err(AmqpError::DeclareQueueError("orders".to_owned()))
        );
    }
}
