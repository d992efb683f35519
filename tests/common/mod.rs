// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! In-memory broker driving the client through its broker traits.

#![allow(dead_code)]

use async_trait::async_trait;
use futures_util::{future, stream, FutureExt, StreamExt};
use lapin::types::FieldTable;
use rabbitmq::{
    broker::{
        Acknowledge, BrokerChannel, BrokerConnection, Confirmation, Connector, DeliveryStream,
        OutboundMessage, PendingConfirm,
    },
    channel::Endpoint,
    consumer::Delivery,
    errors::AmqpError,
    exchange::ExchangeKind,
    signal::{close_signal, CloseNotifier, CloseSignal},
};
use std::{
    collections::{HashMap, HashSet, VecDeque},
    sync::{Arc, Mutex},
};
use tokio::sync::watch;

#[derive(Default)]
struct State {
    failing_dials: usize,
    dials: usize,
    next_id: u64,
    next_tag: u64,

    queues: HashSet<String>,
    exchanges: HashSet<String>,
    bindings: Vec<(String, String, String)>,
    declares: usize,

    confirmations: VecDeque<Confirmation>,
    hang_confirms: bool,
    published: Vec<OutboundMessage>,

    ready: VecDeque<(Vec<u8>, bool)>,
    unacked: HashMap<u64, (u64, Vec<u8>)>,
    max_unacked: usize,
    acked: usize,

    connections: HashMap<u64, CloseNotifier>,
    channels: HashMap<u64, (u64, CloseNotifier)>,
    prefetch: HashMap<u64, u16>,
    closed_channels: HashSet<u64>,
}

impl State {
    fn unacked_on(&self, channel: u64) -> usize {
        self.unacked.values().filter(|(id, _)| *id == channel).count()
    }

    fn release_channel(&mut self, channel: u64) {
        self.closed_channels.insert(channel);
        self.prefetch.remove(&channel);

        let tags: Vec<u64> = self
            .unacked
            .iter()
            .filter(|(_, (id, _))| *id == channel)
            .map(|(tag, _)| *tag)
            .collect();
        for tag in tags {
            if let Some((_, payload)) = self.unacked.remove(&tag) {
                self.ready.push_front((payload, true));
            }
        }
    }
}

/// Shared fake broker. Clones observe the same state.
#[derive(Clone)]
pub struct FakeBroker {
    state: Arc<Mutex<State>>,
    version: Arc<watch::Sender<u64>>,
}

impl Default for FakeBroker {
    fn default() -> Self {
        let (version, _) = watch::channel(0);
        FakeBroker {
            state: Arc::new(Mutex::new(State::default())),
            version: Arc::new(version),
        }
    }
}

impl FakeBroker {
    pub fn new() -> FakeBroker {
        FakeBroker::default()
    }

    pub fn connector(&self) -> Arc<dyn Connector> {
        Arc::new(FakeConnector {
            broker: self.clone(),
        })
    }

    fn with_state<R>(&self, f: impl FnOnce(&mut State) -> R) -> R {
        let result = f(&mut self.state.lock().unwrap());
        self.version.send_modify(|version| *version += 1);
        result
    }

    pub fn fail_next_dials(&self, count: usize) {
        self.with_state(|state| state.failing_dials = count);
    }

    pub fn script_confirmations(&self, confirmations: &[Confirmation]) {
        self.with_state(|state| state.confirmations.extend(confirmations.iter().copied()));
    }

    pub fn hang_confirms(&self, hang: bool) {
        self.with_state(|state| state.hang_confirms = hang);
    }

    pub fn enqueue(&self, payload: &[u8]) {
        self.with_state(|state| state.ready.push_back((payload.to_vec(), false)));
    }

    /// Closes every open channel as a channel exception would.
    pub fn close_channels(&self, reason: &str) {
        self.with_state(|state| {
            let ids: Vec<u64> = state.channels.keys().copied().collect();
            for id in ids {
                if let Some((_, notifier)) = state.channels.remove(&id) {
                    notifier.notify(reason);
                }
                state.release_channel(id);
            }
        });
    }

    /// Drops every open connection as a network failure would.
    pub fn drop_connections(&self, reason: &str) {
        self.with_state(|state| {
            for (_, notifier) in state.connections.drain() {
                notifier.notify(reason);
            }
            let ids: Vec<u64> = state.channels.keys().copied().collect();
            for id in ids {
                if let Some((_, notifier)) = state.channels.remove(&id) {
                    notifier.notify(reason);
                }
                state.release_channel(id);
            }
        });
    }

    pub fn dials(&self) -> usize {
        self.state.lock().unwrap().dials
    }

    pub fn declares(&self) -> usize {
        self.state.lock().unwrap().declares
    }

    pub fn bindings(&self) -> Vec<(String, String, String)> {
        self.state.lock().unwrap().bindings.clone()
    }

    pub fn published(&self) -> Vec<OutboundMessage> {
        self.state.lock().unwrap().published.clone()
    }

    pub fn max_unacked(&self) -> usize {
        self.state.lock().unwrap().max_unacked
    }

    pub fn unacked(&self) -> usize {
        self.state.lock().unwrap().unacked.len()
    }

    pub fn acked(&self) -> usize {
        self.state.lock().unwrap().acked
    }

    pub fn open_channels(&self) -> usize {
        self.state.lock().unwrap().channels.len()
    }

    fn next_delivery(&self, channel: u64) -> Option<Option<Delivery>> {
        let mut state = self.state.lock().unwrap();

        if state.closed_channels.contains(&channel) {
            return Some(None);
        }

        let prefetch = state.prefetch.get(&channel).copied().unwrap_or(0) as usize;
        if prefetch != 0 && state.unacked_on(channel) >= prefetch {
            return None;
        }

        let (payload, redelivered) = state.ready.pop_front()?;
        state.next_tag += 1;
        let tag = state.next_tag;
        state.unacked.insert(tag, (channel, payload.clone()));
        state.max_unacked = state.max_unacked.max(state.unacked_on(channel));

        let acker = Arc::new(FakeAcker {
            broker: self.clone(),
            tag,
        });
        Some(Some(
            Delivery::new(tag, payload, acker).redelivered(redelivered),
        ))
    }
}

struct FakeConnector {
    broker: FakeBroker,
}

#[async_trait]
impl Connector for FakeConnector {
    async fn connect(&self, _endpoint: &Endpoint) -> Result<Arc<dyn BrokerConnection>, AmqpError> {
        let broker = self.broker.clone();

        self.broker.with_state(|state| {
            state.dials += 1;
            if state.failing_dials > 0 {
                state.failing_dials -= 1;
                return Err(AmqpError::ConnectionError);
            }

            state.next_id += 1;
            let (notifier, closed) = close_signal();
            state.connections.insert(state.next_id, notifier);

            Ok(Arc::new(FakeConnection {
                broker,
                id: state.next_id,
                closed,
            }) as Arc<dyn BrokerConnection>)
        })
    }
}

struct FakeConnection {
    broker: FakeBroker,
    id: u64,
    closed: CloseSignal,
}

#[async_trait]
impl BrokerConnection for FakeConnection {
    async fn open_channel(&self) -> Result<Arc<dyn BrokerChannel>, AmqpError> {
        if self.closed.is_closed() {
            return Err(AmqpError::ChannelError);
        }

        let broker = self.broker.clone();
        let connection = self.id;

        Ok(self.broker.with_state(|state| {
            state.next_id += 1;
            let (notifier, closed) = close_signal();
            state.channels.insert(state.next_id, (connection, notifier));

            Arc::new(FakeChannel {
                broker,
                id: state.next_id,
                closed,
            }) as Arc<dyn BrokerChannel>
        }))
    }

    fn close_signal(&self) -> CloseSignal {
        self.closed.clone()
    }

    async fn close(&self) -> Result<(), AmqpError> {
        let id = self.id;
        self.broker.with_state(|state| {
            state.connections.remove(&id);
            let ids: Vec<u64> = state
                .channels
                .iter()
                .filter(|(_, (connection, _))| *connection == id)
                .map(|(channel, _)| *channel)
                .collect();
            for channel in ids {
                state.channels.remove(&channel);
                state.release_channel(channel);
            }
        });
        Ok(())
    }
}

struct FakeChannel {
    broker: FakeBroker,
    id: u64,
    closed: CloseSignal,
}

impl FakeChannel {
    fn check_open(&self) -> Result<(), AmqpError> {
        if self.closed.is_closed() {
            Err(AmqpError::ChannelError)
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl BrokerChannel for FakeChannel {
    async fn queue_exists(&self, queue: &str) -> Result<bool, AmqpError> {
        self.check_open()?;
        Ok(self.broker.state.lock().unwrap().queues.contains(queue))
    }

    async fn declare_queue(&self, queue: &str, _args: &FieldTable) -> Result<(), AmqpError> {
        self.check_open()?;
        self.broker.with_state(|state| {
            state.declares += 1;
            state.queues.insert(queue.to_owned());
        });
        Ok(())
    }

    async fn exchange_exists(
        &self,
        exchange: &str,
        _kind: &ExchangeKind,
    ) -> Result<bool, AmqpError> {
        self.check_open()?;
        Ok(self.broker.state.lock().unwrap().exchanges.contains(exchange))
    }

    async fn declare_exchange(
        &self,
        exchange: &str,
        _kind: &ExchangeKind,
        _args: &FieldTable,
    ) -> Result<(), AmqpError> {
        self.check_open()?;
        self.broker.with_state(|state| {
            state.declares += 1;
            state.exchanges.insert(exchange.to_owned());
        });
        Ok(())
    }

    async fn bind_queue(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
    ) -> Result<(), AmqpError> {
        self.check_open()?;
        self.broker.with_state(|state| {
            let binding = (queue.to_owned(), exchange.to_owned(), routing_key.to_owned());
            if !state.bindings.contains(&binding) {
                state.bindings.push(binding);
            }
        });
        Ok(())
    }

    async fn confirm_select(&self) -> Result<(), AmqpError> {
        self.check_open()
    }

    async fn qos(&self, prefetch: u16) -> Result<(), AmqpError> {
        self.check_open()?;
        let id = self.id;
        self.broker.with_state(|state| {
            state.prefetch.insert(id, prefetch);
        });
        Ok(())
    }

    async fn publish(&self, message: OutboundMessage) -> Result<PendingConfirm, AmqpError> {
        self.check_open()?;

        let (hang, confirmation) = self.broker.with_state(|state| {
            state.published.push(message);
            let confirmation = state
                .confirmations
                .pop_front()
                .unwrap_or(Confirmation::Ack);
            (state.hang_confirms, confirmation)
        });

        if hang {
            Ok(future::pending::<Result<Confirmation, AmqpError>>().boxed())
        } else {
            Ok(future::ready(Ok(confirmation)).boxed())
        }
    }

    async fn consume(&self, _queue: &str, _consumer_tag: &str) -> Result<DeliveryStream, AmqpError> {
        self.check_open()?;

        let broker = self.broker.clone();
        let changes = broker.version.subscribe();
        let channel = self.id;

        Ok(stream::unfold(
            (broker, changes),
            move |(broker, mut changes)| async move {
                loop {
                    let _ = changes.borrow_and_update();
                    match broker.next_delivery(channel) {
                        Some(Some(delivery)) => return Some((Ok(delivery), (broker, changes))),
                        Some(None) => return None,
                        None => {
                            if changes.changed().await.is_err() {
                                return None;
                            }
                        }
                    }
                }
            },
        )
        .boxed())
    }

    fn close_signal(&self) -> CloseSignal {
        self.closed.clone()
    }

    async fn close(&self) -> Result<(), AmqpError> {
        let id = self.id;
        self.broker.with_state(|state| {
            state.channels.remove(&id);
            state.release_channel(id);
        });
        Ok(())
    }
}

struct FakeAcker {
    broker: FakeBroker,
    tag: u64,
}

impl FakeAcker {
    fn settle(&self, requeue: bool) -> Result<(), AmqpError> {
        let tag = self.tag;
        self.broker.with_state(|state| match state.unacked.remove(&tag) {
            Some((_, payload)) => {
                if requeue {
                    state.ready.push_front((payload, true));
                } else {
                    state.acked += 1;
                }
                Ok(())
            }
            None => Err(AmqpError::AckMessageError),
        })
    }
}

#[async_trait]
impl Acknowledge for FakeAcker {
    async fn ack(&self) -> Result<(), AmqpError> {
        self.settle(false)
    }

    async fn nack(&self, requeue: bool) -> Result<(), AmqpError> {
        self.settle(requeue)
    }

    async fn reject(&self, requeue: bool) -> Result<(), AmqpError> {
        self.settle(requeue)
    }
}
