// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Error Types for RabbitMQ Implementation
//!
//! This module provides the error type shared by the connection supervisor, the
//! confirm-tracking publisher and the supervised consumer. Broker library errors
//! are logged where they happen and mapped into one of these variants, so every
//! variant stays comparable in tests.

use thiserror::Error;

/// Represents errors that can occur during AMQP/RabbitMQ operations.
///
/// The variants fall into four groups:
/// - transient connectivity failures, retried by the supervisor or the publisher
/// - fatal configuration failures, surfaced immediately and never retried
/// - delivery handling failures, reported back to the consumer handler
/// - terminal lifecycle errors such as [`AmqpError::Shutdown`]
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AmqpError {
    /// Internal errors that don't fit into other categories
    #[error("internal error")]
    InternalError,

    /// The broker address could not be parsed
    #[error("invalid broker endpoint `{0}`")]
    InvalidEndpoint(String),

    /// The topology descriptor is not usable
    #[error("invalid topology: {0}")]
    InvalidTopology(String),

    /// A configuration value could not be loaded
    #[error("failure to load config `{key}`: {details}")]
    ConfigError { key: String, details: String },

    /// Error establishing a connection to the RabbitMQ server
    #[error("failure to connect")]
    ConnectionError,

    /// The dial did not complete within the connect timeout
    #[error("connect timed out")]
    ConnectTimeout,

    /// A channel setup or teardown step did not complete in time
    #[error("channel operation timed out")]
    ChannelTimeout,

    /// Error creating a channel from an established connection
    #[error("failure to create a channel")]
    ChannelError,

    /// Error switching the channel into publisher confirm mode
    #[error("failure to enable publisher confirms")]
    ConfirmSelectError,

    /// Error declaring an exchange with the given name
    #[error("failure to declare an exchange `{0}`")]
    DeclareExchangeError(String),

    /// Error declaring a queue with the given name
    #[error("failure to declare a queue `{0}`")]
    DeclareQueueError(String),

    /// Error binding an exchange to a queue
    #[error("failure to binding exchange `{0}` to queue `{1}`")]
    BindingExchangeToQueueError(String, String),

    /// Error publishing a message
    #[error("failure to publish")]
    PublishingError,

    /// Error parsing a message payload
    #[error("failure to parse payload")]
    ParsePayloadError,

    /// Error acknowledging a message
    #[error("failure to ack message")]
    AckMessageError,

    /// Error negative-acknowledging a message
    #[error("failure to nack message")]
    NackMessageError,

    /// Error rejecting a message
    #[error("failure to reject message")]
    RejectMessageError,

    /// Error configuring Quality of Service parameters
    #[error("failure to configure qos `{0}`")]
    QoSDeclarationError(String),

    /// Error declaring a consumer
    #[error("consumer declaration error")]
    ConsumerDeclarationError,

    /// Error consuming a message
    #[error("failure to consume message `{0}`")]
    ConsumerError(String),

    /// No ready channel is available
    #[error("not connected to a server")]
    NotConnected,

    /// Close was requested on a client that is already closed
    #[error("already closed: not connected to the server")]
    AlreadyClosed,

    /// The supervisor loop was started twice
    #[error("supervisor already started")]
    AlreadyStarted,

    /// The client is shutting down
    #[error("client is shutting down")]
    Shutdown,
}

impl AmqpError {
    /// Whether the failure is a connectivity hiccup that a retry may fix.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            AmqpError::ConnectionError
                | AmqpError::ConnectTimeout
                | AmqpError::ChannelTimeout
                | AmqpError::ChannelError
                | AmqpError::ConfirmSelectError
                | AmqpError::DeclareExchangeError(_)
                | AmqpError::DeclareQueueError(_)
                | AmqpError::BindingExchangeToQueueError(_, _)
                | AmqpError::PublishingError
                | AmqpError::QoSDeclarationError(_)
                | AmqpError::ConsumerDeclarationError
                | AmqpError::ConsumerError(_)
                | AmqpError::NotConnected
        )
    }

    /// Whether the failure comes from configuration and must not be retried.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            AmqpError::InvalidEndpoint(_)
                | AmqpError::InvalidTopology(_)
                | AmqpError::ConfigError { .. }
                | AmqpError::ParsePayloadError
        )
    }
}
