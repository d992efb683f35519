// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # RabbitMQ Message Consumer
//!
//! This module provides the delivery type handed to application handlers and the
//! per-delivery processing run by every consumer worker. Each delivery gets its own
//! OpenTelemetry consumer span built from the trace context carried in its headers.
//!
//! Handlers own the acknowledgement: they must `ack`, `nack` or `reject` every
//! delivery, otherwise it keeps counting against the channel prefetch. When a handler
//! fails without settling, the worker settles the delivery itself.

use crate::{broker::Acknowledge, channel::LapinAcker, errors::AmqpError, otel};
use async_trait::async_trait;
use lapin::types::{AMQPValue, FieldTable, ShortString};
use opentelemetry::{
    global::BoxedTracer,
    trace::{Span, Status},
    Context,
};
use serde::de::DeserializeOwned;
use std::{
    borrow::Cow,
    future::Future,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};
use tracing::{debug, error, warn};

/// A message handed out by the broker, pending acknowledgement.
///
/// Clones share the same settlement state, so a delivery is acknowledged at most once
/// no matter which clone settles it.
#[derive(Clone)]
pub struct Delivery {
    pub delivery_tag: u64,
    pub exchange: String,
    pub routing_key: String,
    pub redelivered: bool,
    pub priority: Option<u8>,
    pub msg_type: String,
    pub headers: FieldTable,
    pub data: Vec<u8>,
    acker: Arc<dyn Acknowledge>,
    settled: Arc<AtomicBool>,
}

impl std::fmt::Debug for Delivery {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Delivery")
            .field("delivery_tag", &self.delivery_tag)
            .field("exchange", &self.exchange)
            .field("routing_key", &self.routing_key)
            .field("redelivered", &self.redelivered)
            .field("priority", &self.priority)
            .field("msg_type", &self.msg_type)
            .field("len", &self.data.len())
            .finish()
    }
}

impl Delivery {
    /// Builds a delivery around a broker acknowledger.
    pub fn new(delivery_tag: u64, data: Vec<u8>, acker: Arc<dyn Acknowledge>) -> Delivery {
        Delivery {
            delivery_tag,
            exchange: String::new(),
            routing_key: String::new(),
            redelivered: false,
            priority: None,
            msg_type: String::new(),
            headers: FieldTable::default(),
            data,
            acker,
            settled: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn redelivered(mut self, redelivered: bool) -> Self {
        self.redelivered = redelivered;
        self
    }

    pub fn with_headers(mut self, headers: FieldTable) -> Self {
        self.headers = headers;
        self
    }

    pub fn header(&self, key: &str) -> Option<&AMQPValue> {
        self.headers.inner().get(&ShortString::from(key))
    }

    /// Whether the delivery was already acked, nacked or rejected.
    pub fn is_settled(&self) -> bool {
        self.settled.load(Ordering::Acquire)
    }

    /// Decodes the payload as JSON.
    pub fn json<T: DeserializeOwned>(&self) -> Result<T, AmqpError> {
        serde_json::from_slice(&self.data).map_err(|err| {
            error!(error = err.to_string(), "failure to parse payload");
            AmqpError::ParsePayloadError
        })
    }

    pub async fn ack(&self) -> Result<(), AmqpError> {
        if self.claim() {
            self.acker.ack().await
        } else {
            Ok(())
        }
    }

    pub async fn nack(&self, requeue: bool) -> Result<(), AmqpError> {
        if self.claim() {
            self.acker.nack(requeue).await
        } else {
            Ok(())
        }
    }

    pub async fn reject(&self, requeue: bool) -> Result<(), AmqpError> {
        if self.claim() {
            self.acker.reject(requeue).await
        } else {
            Ok(())
        }
    }

    /// Settling twice is a channel error on the broker side, so only the first
    /// settlement goes out.
    fn claim(&self) -> bool {
        let first = !self.settled.swap(true, Ordering::AcqRel);
        if !first {
            debug!(tag = self.delivery_tag, "delivery already settled");
        }
        first
    }
}

impl From<lapin::message::Delivery> for Delivery {
    fn from(delivery: lapin::message::Delivery) -> Delivery {
        let props = &delivery.properties;

        let msg_type = match props.kind() {
            Some(value) => value.to_string(),
            _ => "".to_owned(),
        };

        Delivery {
            delivery_tag: delivery.delivery_tag,
            exchange: delivery.exchange.to_string(),
            routing_key: delivery.routing_key.to_string(),
            redelivered: delivery.redelivered,
            priority: *props.priority(),
            msg_type,
            headers: props.headers().clone().unwrap_or_default(),
            data: delivery.data,
            acker: Arc::new(LapinAcker(delivery.acker)),
            settled: Arc::new(AtomicBool::new(false)),
        }
    }
}

/// Application callback invoked once per delivery.
#[async_trait]
pub trait ConsumerHandler: Send + Sync {
    /// Processes `delivery`. The handler is expected to settle it.
    async fn exec(&self, ctx: &Context, delivery: Delivery) -> Result<(), AmqpError>;
}

#[async_trait]
impl<F, Fut> ConsumerHandler for F
where
    F: Fn(Context, Delivery) -> Fut + Send + Sync,
    Fut: Future<Output = Result<(), AmqpError>> + Send + 'static,
{
    async fn exec(&self, ctx: &Context, delivery: Delivery) -> Result<(), AmqpError> {
        (self)(ctx.clone(), delivery).await
    }
}

/// Runs `handler` for one delivery inside a consumer span.
///
/// A handler failure that leaves the delivery unsettled is nacked so it does not
/// hold a prefetch slot forever. First deliveries are requeued, redeliveries are
/// dropped to avoid a poison message loop.
pub(crate) async fn consume(
    tracer: &BoxedTracer,
    queue: &str,
    delivery: Delivery,
    handler: &dyn ConsumerHandler,
) {
    let name = if delivery.msg_type.is_empty() {
        queue
    } else {
        delivery.msg_type.as_str()
    };

    let (ctx, mut span) = otel::new_span(&delivery.headers, tracer, name);

    debug!(
        "received: {} - exchange: {} - tag: {}",
        name, delivery.exchange, delivery.delivery_tag,
    );

    match handler.exec(&ctx, delivery.clone()).await {
        Ok(()) => {
            debug!("message successfully processed");
            span.set_status(Status::Ok);
        }
        Err(err) => {
            warn!(error = err.to_string(), "error whiling handling msg");
            span.record_error(&err);
            span.set_status(Status::Error {
                description: Cow::from("handler failure"),
            });

            if !delivery.is_settled() {
                let requeue = !delivery.redelivered;
                if let Err(e) = delivery.nack(requeue).await {
                    error!("error whiling nack msg");
                    span.record_error(&e);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[derive(Default)]
    struct RecordingAcker {
        calls: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl Acknowledge for RecordingAcker {
        async fn ack(&self) -> Result<(), AmqpError> {
            self.calls.lock().unwrap().push("ack".to_owned());
            Ok(())
        }

        async fn nack(&self, requeue: bool) -> Result<(), AmqpError> {
            self.calls.lock().unwrap().push(format!("nack:{requeue}"));
            Ok(())
        }

        async fn reject(&self, requeue: bool) -> Result<(), AmqpError> {
            self.calls.lock().unwrap().push(format!("reject:{requeue}"));
            Ok(())
        }
    }

    fn delivery(acker: &Arc<RecordingAcker>) -> Delivery {
        Delivery::new(7, br#"{"id":42}"#.to_vec(), acker.clone())
    }

    #[tokio::test]
    async fn settles_once() {
        let acker = Arc::new(RecordingAcker::default());
        let delivery = delivery(&acker);

        delivery.ack().await.unwrap();
        delivery.clone().nack(true).await.unwrap();

        assert!(delivery.is_settled());
        assert_eq!(*acker.calls.lock().unwrap(), vec!["ack".to_owned()]);
    }

    #[test]
    fn decodes_json_payload() {
        #[derive(Debug, serde::Deserialize)]
        struct Order {
            id: u32,
        }

        let acker = Arc::new(RecordingAcker::default());
        let order: Order = delivery(&acker).json().unwrap();
        assert_eq!(order.id, 42);

        let broken = Delivery::new(1, b"nope".to_vec(), acker);
        assert_eq!(
            broken.json::<Order>().unwrap_err(),
            AmqpError::ParsePayloadError
        );
    }

    #[tokio::test]
    async fn failed_handler_requeues_unsettled_delivery() {
        let acker = Arc::new(RecordingAcker::default());
        let tracer = opentelemetry::global::tracer("test");

        let handler = |_ctx: Context, _delivery: Delivery| async { Err::<(), _>(AmqpError::InternalError) };
        consume(&tracer, "orders", delivery(&acker), &handler).await;

        assert_eq!(*acker.calls.lock().unwrap(), vec!["nack:true".to_owned()]);
    }

    #[tokio::test]
    async fn failed_redelivery_is_dropped() {
        let acker = Arc::new(RecordingAcker::default());
        let tracer = opentelemetry::global::tracer("test");

        let handler = |_ctx: Context, _delivery: Delivery| async { Err::<(), _>(AmqpError::InternalError) };
        consume(&tracer, "orders", delivery(&acker).redelivered(true), &handler).await;

        assert_eq!(*acker.calls.lock().unwrap(), vec!["nack:false".to_owned()]);
    }

    #[tokio::test]
    async fn handler_settlement_is_respected() {
        let acker = Arc::new(RecordingAcker::default());
        let tracer = opentelemetry::global::tracer("test");

        let handler = |_ctx: Context, delivery: Delivery| async move {
            delivery.ack().await?;
            Err::<(), AmqpError>(AmqpError::InternalError)
        };
        consume(&tracer, "orders", delivery(&acker), &handler).await;

        assert_eq!(*acker.calls.lock().unwrap(), vec!["ack".to_owned()]);
    }
}
