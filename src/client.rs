// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # RabbitMQ Clients
//!
//! `MQProducer` and `MQConsumer` each own their own connection supervisor, built
//! from [`RabbitMQConfigs`]. Nothing is global: two producers are two connections.
//!
//! ```no_run
//! use rabbitmq::{client::MQProducer, config::RabbitMQConfigs};
//!
//! # async fn run() -> Result<(), rabbitmq::errors::AmqpError> {
//! let producer = MQProducer::init(&RabbitMQConfigs::from_env()?)?;
//! producer.wait_ready().await?;
//! producer.push(b"hello", 0).await?;
//! producer.close().await
//! # }
//! ```

use crate::{
    broker::{Connector, PendingConfirm},
    channel::LapinConnector,
    config::RabbitMQConfigs,
    consumer::ConsumerHandler,
    dispatcher::{ConsumerSettings, RabbitMQDispatcher},
    errors::AmqpError,
    publisher::{PublisherSettings, RabbitMQPublisher},
    supervisor::{ChannelRole, ConnectionSupervisor, SupervisorSettings},
};
use serde::Serialize;
use std::sync::Arc;
use tracing::info;

fn supervisor(
    cfg: &RabbitMQConfigs,
    role: ChannelRole,
    settings: SupervisorSettings,
    connector: Arc<dyn Connector>,
) -> Result<ConnectionSupervisor, AmqpError> {
    let supervisor =
        ConnectionSupervisor::new(cfg.endpoint()?, cfg.topology()?, role, settings, connector)?;
    supervisor.start()?;
    Ok(supervisor)
}

/// Confirm-tracking producer.
pub struct MQProducer {
    supervisor: ConnectionSupervisor,
    publisher: Arc<RabbitMQPublisher>,
}

impl MQProducer {
    /// Connects with lapin and starts supervising the connection in the background.
    pub fn init(cfg: &RabbitMQConfigs) -> Result<MQProducer, AmqpError> {
        Self::with_connector(
            cfg,
            SupervisorSettings::default(),
            PublisherSettings::default(),
            LapinConnector::new(),
        )
    }

    pub fn with_connector(
        cfg: &RabbitMQConfigs,
        supervisor_settings: SupervisorSettings,
        publisher_settings: PublisherSettings,
        connector: Arc<dyn Connector>,
    ) -> Result<MQProducer, AmqpError> {
        let supervisor = supervisor(cfg, ChannelRole::Producer, supervisor_settings, connector)?;
        let publisher = RabbitMQPublisher::new(supervisor.clone(), publisher_settings);

        info!(endpoint = %supervisor.endpoint(), "producer started");
        Ok(MQProducer {
            supervisor,
            publisher,
        })
    }

    pub async fn push(&self, payload: &[u8], priority: u8) -> Result<(), AmqpError> {
        self.publisher.push(payload, priority).await
    }

    pub async fn push_json<T: Serialize + ?Sized>(
        &self,
        value: &T,
        priority: u8,
    ) -> Result<(), AmqpError> {
        self.publisher.push_json(value, priority).await
    }

    pub async fn unsafe_push(
        &self,
        payload: &[u8],
        priority: u8,
    ) -> Result<PendingConfirm, AmqpError> {
        self.publisher.unsafe_push(payload, priority).await
    }

    pub fn is_ready(&self) -> bool {
        self.supervisor.is_ready()
    }

    /// Waits until the channel is initialized and in confirm mode.
    pub async fn wait_ready(&self) -> Result<(), AmqpError> {
        self.supervisor.wait_ready().await.map(|_| ())
    }

    pub fn supervisor(&self) -> &ConnectionSupervisor {
        &self.supervisor
    }

    /// Stops reconnecting and releases the channel and the connection. Pending
    /// pushes return [`AmqpError::Shutdown`].
    pub async fn close(&self) -> Result<(), AmqpError> {
        self.supervisor.shutdown().await
    }
}

/// Supervised consumer running a pool of handler workers.
pub struct MQConsumer {
    supervisor: ConnectionSupervisor,
    dispatcher: RabbitMQDispatcher,
    workers: usize,
}

impl MQConsumer {
    /// Connects with lapin and starts supervising the connection in the background.
    pub fn init(cfg: &RabbitMQConfigs) -> Result<MQConsumer, AmqpError> {
        Self::with_connector(
            cfg,
            SupervisorSettings::default(),
            cfg.consumer_settings(),
            LapinConnector::new(),
        )
    }

    pub fn with_connector(
        cfg: &RabbitMQConfigs,
        supervisor_settings: SupervisorSettings,
        consumer_settings: ConsumerSettings,
        connector: Arc<dyn Connector>,
    ) -> Result<MQConsumer, AmqpError> {
        let supervisor = supervisor(cfg, ChannelRole::Consumer, supervisor_settings, connector)?;
        let dispatcher = RabbitMQDispatcher::new(supervisor.clone(), consumer_settings);

        info!(endpoint = %supervisor.endpoint(), "consumer started");
        Ok(MQConsumer {
            supervisor,
            dispatcher,
            workers: cfg.workers,
        })
    }

    /// Consumes with the configured number of workers until [`MQConsumer::close`].
    pub async fn consume(&self, handler: Arc<dyn ConsumerHandler>) -> Result<(), AmqpError> {
        self.dispatcher.consume(handler, self.workers).await
    }

    pub async fn consume_with(
        &self,
        handler: Arc<dyn ConsumerHandler>,
        workers: usize,
    ) -> Result<(), AmqpError> {
        self.dispatcher.consume(handler, workers).await
    }

    pub fn is_ready(&self) -> bool {
        self.supervisor.is_ready()
    }

    pub fn supervisor(&self) -> &ConnectionSupervisor {
        &self.supervisor
    }

    pub async fn close(&self) -> Result<(), AmqpError> {
        self.supervisor.shutdown().await
    }
}
