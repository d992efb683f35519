// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # AMQP Channel Management
//!
//! This module handles the creation and management of AMQP connections and channels.
//! It provides the broker endpoint description and the lapin-backed implementations
//! of the [`Connector`], [`BrokerConnection`] and [`BrokerChannel`] traits used by the
//! connection supervisor.
//!
//! Every connection and channel registers an error callback that fires its one-shot
//! close signal, which is how broker driven closes reach the supervisor.

use crate::{
    broker::{
        Acknowledge, BrokerChannel, BrokerConnection, Confirmation, Connector, DeliveryStream,
        OutboundMessage, PendingConfirm,
    },
    consumer::Delivery,
    errors::AmqpError,
    exchange::ExchangeKind,
    signal::{close_signal, CloseSignal},
};
use async_trait::async_trait;
use futures_util::StreamExt;
use lapin::{
    acker::Acker,
    options::{
        BasicAckOptions, BasicConsumeOptions, BasicNackOptions, BasicPublishOptions,
        BasicQosOptions, BasicRejectOptions, ConfirmSelectOptions, ExchangeDeclareOptions,
        QueueBindOptions, QueueDeclareOptions,
    },
    protocol::{AMQPErrorKind, AMQPSoftError},
    publisher_confirm::Confirmation as LapinConfirmation,
    types::{FieldTable, LongString, ShortString},
    uri::{AMQPUri, AMQPUserInfo},
    BasicProperties, Channel, Connection, ConnectionProperties,
};
use std::{fmt, str::FromStr, sync::Arc};
use tracing::{debug, error, warn};

/// AMQP reply code for a normal close
const REPLY_SUCCESS: u16 = 200;
/// Persistent delivery mode
const DELIVERY_MODE_PERSISTENT: u8 = 2;

/// Broker address, virtual host and credentials.
#[derive(Debug, Clone)]
pub struct Endpoint {
    uri: AMQPUri,
    connection_name: Option<String>,
}

impl Endpoint {
    /// Parses `address` (an `amqp://` or `amqps://` URI) and pins the virtual host.
    ///
    /// A malformed address is a configuration error and is never retried.
    pub fn new(address: &str, virtual_host: &str) -> Result<Endpoint, AmqpError> {
        let mut uri = match AMQPUri::from_str(address) {
            Ok(uri) => Ok(uri),
            Err(err) => {
                error!(error = %err, "invalid amqp address");
                Err(AmqpError::InvalidEndpoint(address.to_owned()))
            }
        }?;

        if !virtual_host.is_empty() {
            uri.vhost = virtual_host.to_owned();
        }

        Ok(Endpoint {
            uri,
            connection_name: None,
        })
    }

    /// Overrides the credentials carried by the address.
    pub fn with_credentials(mut self, username: &str, password: &str) -> Self {
        self.uri.authority.userinfo = AMQPUserInfo {
            username: username.to_owned(),
            password: password.to_owned(),
        };
        self
    }

    /// Name reported to the broker for connections to this endpoint.
    pub fn with_connection_name(mut self, name: &str) -> Self {
        self.connection_name = Some(name.to_owned());
        self
    }

    pub fn host(&self) -> &str {
        &self.uri.authority.host
    }

    pub fn port(&self) -> u16 {
        self.uri.authority.port
    }

    pub fn virtual_host(&self) -> &str {
        &self.uri.vhost
    }

    pub fn username(&self) -> &str {
        &self.uri.authority.userinfo.username
    }

    pub(crate) fn password(&self) -> &str {
        &self.uri.authority.userinfo.password
    }

    pub(crate) fn uri(&self) -> AMQPUri {
        self.uri.clone()
    }

    pub(crate) fn connection_properties(&self) -> ConnectionProperties {
        let options = ConnectionProperties::default();
        match &self.connection_name {
            Some(name) => options.with_connection_name(LongString::from(name.clone())),
            None => options,
        }
    }
}

impl fmt::Display for Endpoint {
    /// Renders the endpoint without its password.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}@{}:{}/{}",
            self.username(),
            self.host(),
            self.port(),
            self.virtual_host()
        )
    }
}

/// Dials RabbitMQ with lapin.
#[derive(Debug, Default, Clone)]
pub struct LapinConnector;

impl LapinConnector {
    pub fn new() -> Arc<LapinConnector> {
        Arc::new(LapinConnector)
    }
}

#[async_trait]
impl Connector for LapinConnector {
    async fn connect(&self, endpoint: &Endpoint) -> Result<Arc<dyn BrokerConnection>, AmqpError> {
        debug!("creating amqp connection...");

        let conn = match Connection::connect_uri(endpoint.uri(), endpoint.connection_properties())
            .await
        {
            Ok(c) => Ok(c),
            Err(err) => {
                error!(error = err.to_string(), "failure to connect");
                Err(AmqpError::ConnectionError)
            }
        }?;
        debug!("amqp connected");

        let (notifier, closed) = close_signal();
        conn.on_error(move |err| {
            warn!(error = err.to_string(), "amqp connection error");
            notifier.notify(err.to_string());
        });

        Ok(Arc::new(LapinConnection {
            connection: Arc::new(conn),
            closed,
        }))
    }
}

/// A lapin connection plus its close signal.
pub struct LapinConnection {
    connection: Arc<Connection>,
    closed: CloseSignal,
}

#[async_trait]
impl BrokerConnection for LapinConnection {
    async fn open_channel(&self) -> Result<Arc<dyn BrokerChannel>, AmqpError> {
        debug!("creating amqp channel...");

        let channel = match self.connection.create_channel().await {
            Ok(c) => Ok(c),
            Err(err) => {
                error!(error = err.to_string(), "error to create the channel");
                Err(AmqpError::ChannelError)
            }
        }?;

        let (notifier, closed) = close_signal();
        channel.on_error(move |err| {
            warn!(error = err.to_string(), "amqp channel error");
            notifier.notify(err.to_string());
        });
        debug!("channel created");

        Ok(Arc::new(LapinChannel {
            channel,
            connection: self.connection.clone(),
            closed,
        }))
    }

    fn close_signal(&self) -> CloseSignal {
        self.closed.clone()
    }

    async fn close(&self) -> Result<(), AmqpError> {
        if !self.connection.status().connected() {
            return Ok(());
        }

        self.connection
            .close(REPLY_SUCCESS, "OK")
            .await
            .map_err(|err| {
                error!(error = err.to_string(), "failure to close the connection");
                AmqpError::ConnectionError
            })
    }
}

/// A lapin channel plus its close signal.
///
/// The owning connection is kept so that passive checks can run on a scratch
/// channel: a failed passive declare closes the channel it ran on.
pub struct LapinChannel {
    channel: Channel,
    connection: Arc<Connection>,
    closed: CloseSignal,
}

impl LapinChannel {
    async fn scratch(&self) -> Result<Channel, AmqpError> {
        match self.connection.create_channel().await {
            Ok(c) => Ok(c),
            Err(err) => {
                error!(error = err.to_string(), "error to create the scratch channel");
                Err(AmqpError::ChannelError)
            }
        }
    }

    async fn release_scratch(scratch: &Channel) {
        if scratch.status().connected() {
            if let Err(err) = scratch.close(REPLY_SUCCESS, "OK").await {
                debug!(error = err.to_string(), "failure to close the scratch channel");
            }
        }
    }
}

fn is_not_found(err: &lapin::Error) -> bool {
    matches!(
        err,
        lapin::Error::ProtocolError(amqp)
            if matches!(amqp.kind(), AMQPErrorKind::Soft(AMQPSoftError::NOTFOUND))
    )
}

#[async_trait]
impl BrokerChannel for LapinChannel {
    async fn queue_exists(&self, queue: &str) -> Result<bool, AmqpError> {
        let scratch = self.scratch().await?;

        let result = scratch
            .queue_declare(
                queue,
                QueueDeclareOptions {
                    passive: true,
                    ..QueueDeclareOptions::default()
                },
                FieldTable::default(),
            )
            .await;

        Self::release_scratch(&scratch).await;

        match result {
            Ok(_) => Ok(true),
            Err(err) if is_not_found(&err) => Ok(false),
            Err(err) => {
                error!(error = err.to_string(), queue, "failure to check the queue");
                Err(AmqpError::DeclareQueueError(queue.to_owned()))
            }
        }
    }

    async fn declare_queue(&self, queue: &str, args: &FieldTable) -> Result<(), AmqpError> {
        match self
            .channel
            .queue_declare(
                queue,
                QueueDeclareOptions {
                    durable: true,
                    ..QueueDeclareOptions::default()
                },
                args.clone(),
            )
            .await
        {
            Err(err) => {
                error!(error = err.to_string(), queue, "error to declare the queue");
                Err(AmqpError::DeclareQueueError(queue.to_owned()))
            }
            _ => Ok(()),
        }
    }

    async fn exchange_exists(
        &self,
        exchange: &str,
        kind: &ExchangeKind,
    ) -> Result<bool, AmqpError> {
        let scratch = self.scratch().await?;

        let result = scratch
            .exchange_declare(
                exchange,
                kind.into(),
                ExchangeDeclareOptions {
                    passive: true,
                    ..ExchangeDeclareOptions::default()
                },
                FieldTable::default(),
            )
            .await;

        Self::release_scratch(&scratch).await;

        match result {
            Ok(_) => Ok(true),
            Err(err) if is_not_found(&err) => Ok(false),
            Err(err) => {
                error!(error = err.to_string(), exchange, "failure to check the exchange");
                Err(AmqpError::DeclareExchangeError(exchange.to_owned()))
            }
        }
    }

    async fn declare_exchange(
        &self,
        exchange: &str,
        kind: &ExchangeKind,
        args: &FieldTable,
    ) -> Result<(), AmqpError> {
        match self
            .channel
            .exchange_declare(
                exchange,
                kind.into(),
                ExchangeDeclareOptions {
                    durable: true,
                    ..ExchangeDeclareOptions::default()
                },
                args.clone(),
            )
            .await
        {
            Err(err) => {
                error!(
                    error = err.to_string(),
                    name = exchange,
                    "error to declare the exchange"
                );
                Err(AmqpError::DeclareExchangeError(exchange.to_owned()))
            }
            _ => Ok(()),
        }
    }

    async fn bind_queue(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
    ) -> Result<(), AmqpError> {
        match self
            .channel
            .queue_bind(
                queue,
                exchange,
                routing_key,
                QueueBindOptions { nowait: false },
                FieldTable::default(),
            )
            .await
        {
            Err(err) => {
                error!(error = err.to_string(), "error to bind queue to exchange");
                Err(AmqpError::BindingExchangeToQueueError(
                    exchange.to_owned(),
                    queue.to_owned(),
                ))
            }
            _ => Ok(()),
        }
    }

    async fn confirm_select(&self) -> Result<(), AmqpError> {
        match self
            .channel
            .confirm_select(ConfirmSelectOptions::default())
            .await
        {
            Err(err) => {
                error!(error = err.to_string(), "error to enable publisher confirms");
                Err(AmqpError::ConfirmSelectError)
            }
            _ => Ok(()),
        }
    }

    async fn qos(&self, prefetch: u16) -> Result<(), AmqpError> {
        match self
            .channel
            .basic_qos(prefetch, BasicQosOptions { global: false })
            .await
        {
            Err(err) => {
                error!(error = err.to_string(), "error setting qos");
                Err(AmqpError::QoSDeclarationError(err.to_string()))
            }
            _ => Ok(()),
        }
    }

    async fn publish(&self, message: OutboundMessage) -> Result<PendingConfirm, AmqpError> {
        let properties = BasicProperties::default()
            .with_content_type(ShortString::from(message.content_type))
            .with_priority(message.priority)
            .with_delivery_mode(DELIVERY_MODE_PERSISTENT)
            .with_message_id(ShortString::from(message.message_id))
            .with_headers(FieldTable::from(message.headers));

        let confirm = match self
            .channel
            .basic_publish(
                &message.exchange,
                &message.routing_key,
                BasicPublishOptions {
                    immediate: false,
                    mandatory: false,
                },
                &message.payload,
                properties,
            )
            .await
        {
            Err(err) => {
                error!(error = err.to_string(), "error publishing message");
                Err(AmqpError::PublishingError)
            }
            Ok(confirm) => Ok(confirm),
        }?;

        Ok(Box::pin(async move {
            match confirm.await {
                Ok(LapinConfirmation::Ack(_)) => Ok(Confirmation::Ack),
                Ok(LapinConfirmation::Nack(_)) => Ok(Confirmation::Nack),
                Ok(LapinConfirmation::NotRequested) => Ok(Confirmation::NotRequested),
                Err(err) => {
                    warn!(error = err.to_string(), "confirmation lost");
                    Err(AmqpError::PublishingError)
                }
            }
        }))
    }

    async fn consume(&self, queue: &str, consumer_tag: &str) -> Result<DeliveryStream, AmqpError> {
        let consumer = match self
            .channel
            .basic_consume(
                queue,
                consumer_tag,
                BasicConsumeOptions {
                    no_local: false,
                    no_ack: false,
                    exclusive: false,
                    nowait: false,
                },
                FieldTable::default(),
            )
            .await
        {
            Err(err) => {
                error!(error = err.to_string(), "error to create the consumer");
                Err(AmqpError::ConsumerDeclarationError)
            }
            Ok(c) => Ok(c),
        }?;

        Ok(consumer
            .map(|result| match result {
                Ok(delivery) => Ok(Delivery::from(delivery)),
                Err(err) => {
                    error!(error = err.to_string(), "errors consume msg");
                    Err(AmqpError::ConsumerError(err.to_string()))
                }
            })
            .boxed())
    }

    fn close_signal(&self) -> CloseSignal {
        self.closed.clone()
    }

    async fn close(&self) -> Result<(), AmqpError> {
        if !self.channel.status().connected() {
            return Ok(());
        }

        self.channel
            .close(REPLY_SUCCESS, "OK")
            .await
            .map_err(|err| {
                error!(error = err.to_string(), "failure to close the channel");
                AmqpError::ChannelError
            })
    }
}

/// Settles lapin deliveries.
pub(crate) struct LapinAcker(pub(crate) Acker);

#[async_trait]
impl Acknowledge for LapinAcker {
    async fn ack(&self) -> Result<(), AmqpError> {
        self.0
            .ack(BasicAckOptions { multiple: false })
            .await
            .map(|_| ())
            .map_err(|err| {
                error!(error = err.to_string(), "error whiling ack msg");
                AmqpError::AckMessageError
            })
    }

    async fn nack(&self, requeue: bool) -> Result<(), AmqpError> {
        self.0
            .nack(BasicNackOptions {
                multiple: false,
                requeue,
            })
            .await
            .map(|_| ())
            .map_err(|err| {
                error!(error = err.to_string(), "error whiling nack msg");
                AmqpError::NackMessageError
            })
    }

    async fn reject(&self, requeue: bool) -> Result<(), AmqpError> {
        self.0
            .reject(BasicRejectOptions { requeue })
            .await
            .map(|_| ())
            .map_err(|err| {
                error!(error = err.to_string(), "error whiling reject msg");
                AmqpError::RejectMessageError
            })
    }
}
