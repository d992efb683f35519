// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # RabbitMQ Message Dispatcher
//!
//! This module provides the supervised consumer. The dispatcher subscribes to the
//! topology queue with a bounded prefetch and fans the delivery stream out to a pool
//! of workers, each running the registered handler inside a consumer span.
//!
//! A pool belongs to exactly one stream. When the stream ends or its channel or
//! connection closes, the old workers are stopped and joined, the dispatcher waits
//! `resubscribe_delay`, asks the supervisor to reconnect, and builds a fresh stream
//! and a fresh pool on the next session.

use crate::{
    broker::DeliveryStream,
    consumer::{consume, ConsumerHandler},
    errors::AmqpError,
    signal::{
        bounded, close_signal, shutdown_requested, sleep_or_shutdown, CloseNotifier, CloseSignal,
    },
    supervisor::{ConnectionSupervisor, Session},
};
use futures_util::StreamExt;
use opentelemetry::global;
use std::{sync::Arc, time::Duration};
use tokio::{
    sync::{watch, Mutex},
    task::JoinSet,
};
use tracing::{debug, error, info, warn};

/// Unacknowledged deliveries handed to one consumer channel
pub const DEFAULT_PREFETCH: u16 = 50;
/// Consumer tag used when none is configured
pub const DEFAULT_CONSUMER_TAG: &str = "rmq-tag";
/// When resubscribing after the delivery stream failed
pub const DEFAULT_RESUBSCRIBE_DELAY: Duration = Duration::from_secs(30);
/// Upper bound to let in-flight handlers finish before old workers are aborted
pub const DEFAULT_DRAIN_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsumerSettings {
    pub prefetch: u16,
    pub consumer_tag: String,
    pub resubscribe_delay: Duration,
    pub drain_timeout: Duration,
}

impl Default for ConsumerSettings {
    fn default() -> Self {
        Self {
            prefetch: DEFAULT_PREFETCH,
            consumer_tag: DEFAULT_CONSUMER_TAG.to_owned(),
            resubscribe_delay: DEFAULT_RESUBSCRIBE_DELAY,
            drain_timeout: DEFAULT_DRAIN_TIMEOUT,
        }
    }
}

impl ConsumerSettings {
    pub fn with_prefetch(mut self, prefetch: u16) -> Self {
        self.prefetch = prefetch;
        self
    }

    pub fn with_consumer_tag(mut self, tag: &str) -> Self {
        self.consumer_tag = tag.to_owned();
        self
    }

    pub fn with_resubscribe_delay(mut self, delay: Duration) -> Self {
        self.resubscribe_delay = delay;
        self
    }

    pub fn with_drain_timeout(mut self, timeout: Duration) -> Self {
        self.drain_timeout = timeout;
        self
    }
}

/// Why a stream generation ended.
#[derive(Debug)]
enum StreamExit {
    Shutdown,
    Failed(String),
}

/// Consumes the supervisor topology queue, surviving channel and connection failures.
pub struct RabbitMQDispatcher {
    supervisor: ConnectionSupervisor,
    settings: ConsumerSettings,
}

impl RabbitMQDispatcher {
    /// Creates a new RabbitMQ dispatcher.
    ///
    /// # Parameters
    /// * `supervisor` - The supervisor keeping the consumer channel alive
    /// * `settings` - Prefetch, consumer tag and resubscription timing
    pub fn new(supervisor: ConnectionSupervisor, settings: ConsumerSettings) -> Self {
        RabbitMQDispatcher {
            supervisor,
            settings,
        }
    }

    pub fn settings(&self) -> &ConsumerSettings {
        &self.settings
    }

    /// Consumes messages in a blocking manner.
    ///
    /// Runs `workers` concurrent handler invocations (at least one) and resubscribes
    /// on every stream failure, without a retry cap. Returns once the client shuts
    /// down.
    pub async fn consume(
        &self,
        handler: Arc<dyn ConsumerHandler>,
        workers: usize,
    ) -> Result<(), AmqpError> {
        let workers = workers.max(1);
        let queue = self.supervisor.topology().queue_name();
        let mut shutdown = self.supervisor.subscribe_shutdown();
        let mut last_generation = 0;

        loop {
            let session = tokio::select! {
                biased;
                _ = shutdown_requested(&mut shutdown) => return Ok(()),
                session = self.supervisor.wait_ready_after(last_generation) => match session {
                    Ok(session) => session,
                    Err(AmqpError::Shutdown) => return Ok(()),
                    Err(err) => return Err(err),
                },
            };
            let generation = session.generation();

            let subscribed = tokio::select! {
                biased;
                _ = shutdown_requested(&mut shutdown) => return Ok(()),
                subscribed = self.subscribe(&session) => subscribed,
            };

            match subscribed {
                Ok(stream) => {
                    info!(queue, generation, workers, "consumer subscribed");
                    let mut pool = WorkerPool::spawn(stream, handler.clone(), workers, queue);

                    let exit = wait_stream_exit(&session, &pool, &mut shutdown).await;
                    pool.stop(self.settings.drain_timeout).await;

                    match exit {
                        StreamExit::Shutdown => return Ok(()),
                        StreamExit::Failed(reason) => {
                            warn!(%reason, queue, generation, "consumer stream failed");
                        }
                    }
                }
                Err(err) => {
                    error!(error = err.to_string(), queue, "failure to create the consumer");
                }
            }

            info!(
                queue,
                delay = ?self.settings.resubscribe_delay,
                "consumer will resubscribe..."
            );
            if sleep_or_shutdown(self.settings.resubscribe_delay, &mut shutdown).await {
                return Ok(());
            }

            self.supervisor.request_reconnect(generation);
            last_generation = generation;
        }
    }

    /// Applies the prefetch and opens the delivery stream, each step bounded by
    /// the supervisor's `channel_timeout`.
    async fn subscribe(&self, session: &Session) -> Result<DeliveryStream, AmqpError> {
        let channel = session.channel();
        let limit = self.supervisor.settings().channel_timeout;

        bounded(limit, channel.qos(self.settings.prefetch)).await?;
        bounded(
            limit,
            channel.consume(
                self.supervisor.topology().queue_name(),
                &self.settings.consumer_tag,
            ),
        )
        .await
    }
}

async fn wait_stream_exit(
    session: &Session,
    pool: &WorkerPool,
    shutdown: &mut watch::Receiver<bool>,
) -> StreamExit {
    let mut connection_closed = session.connection().close_signal();
    let mut channel_closed = session.channel().close_signal();
    let mut ended = pool.ended.clone();

    tokio::select! {
        biased;
        _ = shutdown_requested(shutdown) => StreamExit::Shutdown,
        reason = connection_closed.closed() => StreamExit::Failed(format!("connection closed: {reason}")),
        reason = channel_closed.closed() => StreamExit::Failed(format!("channel closed: {reason}")),
        reason = ended.closed() => StreamExit::Failed(reason),
    }
}

/// Workers bound to one delivery stream.
struct WorkerPool {
    workers: JoinSet<()>,
    stop: watch::Sender<bool>,
    ended: CloseSignal,
}

impl WorkerPool {
    fn spawn(
        stream: DeliveryStream,
        handler: Arc<dyn ConsumerHandler>,
        count: usize,
        queue: &str,
    ) -> WorkerPool {
        let stream = Arc::new(Mutex::new(stream));
        let (stop, _) = watch::channel(false);
        let (notifier, ended) = close_signal();
        let notifier = Arc::new(notifier);

        let mut workers = JoinSet::new();
        for id in 0..count {
            workers.spawn(worker_loop(
                id,
                queue.to_owned(),
                stream.clone(),
                handler.clone(),
                stop.subscribe(),
                notifier.clone(),
            ));
        }

        WorkerPool {
            workers,
            stop,
            ended,
        }
    }

    /// Signals every worker and joins them. Workers still busy after `drain_timeout`
    /// are aborted.
    async fn stop(&mut self, drain_timeout: Duration) {
        self.stop.send_replace(true);

        let joined = tokio::time::timeout(drain_timeout, async {
            while let Some(result) = self.workers.join_next().await {
                if let Err(err) = result {
                    error!(error = err.to_string(), "consumer worker failure");
                }
            }
        })
        .await;

        if joined.is_err() {
            warn!(remaining = self.workers.len(), "aborting consumer workers");
            self.workers.abort_all();
            while self.workers.join_next().await.is_some() {}
        }
    }
}

async fn worker_loop(
    id: usize,
    queue: String,
    stream: Arc<Mutex<DeliveryStream>>,
    handler: Arc<dyn ConsumerHandler>,
    mut stop: watch::Receiver<bool>,
    ended: Arc<CloseNotifier>,
) {
    let tracer = global::tracer("amqp consumer");
    debug!(worker = id, queue = %queue, "consumer worker started");

    loop {
        let next = tokio::select! {
            biased;
            _ = shutdown_requested(&mut stop) => break,
            next = async { stream.lock().await.next().await } => next,
        };

        match next {
            Some(Ok(delivery)) => consume(&tracer, &queue, delivery, handler.as_ref()).await,
            Some(Err(err)) => {
                error!(error = err.to_string(), "errors consume msg");
                ended.notify(err.to_string());
                break;
            }
            None => {
                ended.notify("delivery stream ended");
                break;
            }
        }
    }

    debug!(worker = id, queue = %queue, "consumer worker stopped");
}
