// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Close Notifications
//!
//! Every connection and channel owns a one-shot close signal. The broker side
//! (a lapin error callback, or a fake broker in tests) holds the
//! [`CloseNotifier`]; the supervisor and the consumer select on clones of the
//! matching [`CloseSignal`]. A fresh pair is created for every connection and
//! channel, so a signal can never be confused with one from an older generation.

use crate::errors::AmqpError;
use std::{future::Future, time::Duration};
use tokio::sync::watch;

/// Sending half of a one-shot close notification.
#[derive(Debug)]
pub struct CloseNotifier {
    tx: watch::Sender<Option<String>>,
}

/// Receiving half of a one-shot close notification.
///
/// Dropping the notifier without firing it also counts as closed: the owner of
/// the handle is gone.
#[derive(Debug, Clone)]
pub struct CloseSignal {
    rx: watch::Receiver<Option<String>>,
}

/// Creates a linked notifier/signal pair.
pub fn close_signal() -> (CloseNotifier, CloseSignal) {
    let (tx, rx) = watch::channel(None);
    (CloseNotifier { tx }, CloseSignal { rx })
}

impl CloseNotifier {
    /// Fires the signal. Only the first reason is kept.
    pub fn notify(&self, reason: impl Into<String>) {
        let reason = reason.into();
        self.tx.send_if_modified(|current| {
            if current.is_some() {
                return false;
            }
            *current = Some(reason);
            true
        });
    }

    /// Returns a new signal subscribed to this notifier.
    pub fn signal(&self) -> CloseSignal {
        CloseSignal {
            rx: self.tx.subscribe(),
        }
    }
}

impl CloseSignal {
    /// Whether the signal has fired (or its notifier is gone).
    pub fn is_closed(&self) -> bool {
        self.rx.borrow().is_some() || self.rx.has_changed().is_err()
    }

    /// The close reason, if the signal fired.
    pub fn reason(&self) -> Option<String> {
        self.rx.borrow().clone()
    }

    /// Waits until the signal fires and returns the close reason.
    pub async fn closed(&mut self) -> String {
        loop {
            if let Some(reason) = self.rx.borrow_and_update().clone() {
                return reason;
            }

            if self.rx.changed().await.is_err() {
                return self
                    .rx
                    .borrow()
                    .clone()
                    .unwrap_or_else(|| "closed".to_owned());
            }
        }
    }
}

/// Waits until the shutdown flag flips to `true`.
///
/// A dropped sender is treated as shutdown so that no loop outlives its owner.
pub(crate) async fn shutdown_requested(rx: &mut watch::Receiver<bool>) {
    loop {
        if *rx.borrow_and_update() {
            return;
        }

        if rx.changed().await.is_err() {
            return;
        }
    }
}

/// Sleeps for `delay` unless shutdown arrives first.
///
/// Returns `true` when the sleep was interrupted by shutdown.
pub(crate) async fn sleep_or_shutdown(delay: Duration, rx: &mut watch::Receiver<bool>) -> bool {
    tokio::select! {
        _ = shutdown_requested(rx) => true,
        _ = tokio::time::sleep(delay) => false,
    }
}

/// Runs one broker step, failing with [`AmqpError::ChannelTimeout`] when it
/// outlasts `limit`.
pub(crate) async fn bounded<T>(
    limit: Duration,
    step: impl Future<Output = Result<T, AmqpError>>,
) -> Result<T, AmqpError> {
    tokio::time::timeout(limit, step)
        .await
        .unwrap_or(Err(AmqpError::ChannelTimeout))
}
