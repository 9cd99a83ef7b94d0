// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Actor inboxes.
//!
//! [`Mailbox`] is an unbounded queue with a single logical consumer side. Bursts
//! grow the queue instead of blocking the producer. [`SyncMailbox`] layers a
//! request/response exchange on top of it: the sender waits until the receiver
//! answers the [`Callback`] or the caller's token is cancelled.

use std::sync::Arc;

use tokio::sync::{mpsc, oneshot, Mutex};
use tokio_util::sync::CancellationToken;

use crate::errors::MailboxError;

pub struct Mailbox<T> {
    tx: mpsc::UnboundedSender<T>,
    rx: Arc<Mutex<mpsc::UnboundedReceiver<T>>>,
    closed: CancellationToken,
}

impl<T> Clone for Mailbox<T> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
            rx: Arc::clone(&self.rx),
            closed: self.closed.clone(),
        }
    }
}

impl<T> Default for Mailbox<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Mailbox<T> {
    #[must_use]
    pub fn new() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            tx,
            rx: Arc::new(Mutex::new(rx)),
            closed: CancellationToken::new(),
        }
    }

    /// Enqueues `value`. Fails only when `cancel` fired before the enqueue or the
    /// mailbox was closed.
    pub fn send(&self, cancel: &CancellationToken, value: T) -> Result<(), MailboxError> {
        if cancel.is_cancelled() {
            return Err(MailboxError::Cancelled);
        }
        if self.closed.is_cancelled() {
            return Err(MailboxError::Closed);
        }
        self.tx.send(value).map_err(|_| MailboxError::Closed)
    }

    /// Waits for the next item. Several tasks may wait concurrently, every item is
    /// handed to exactly one of them. Returns `None` once the mailbox is closed and
    /// drained.
    pub async fn recv(&self) -> Option<T> {
        let mut rx = self.rx.lock().await;
        tokio::select! {
            biased;
            value = rx.recv() => value,
            () = self.closed.cancelled() => rx.try_recv().ok(),
        }
    }

    /// Stops accepting new items. Items already queued can still be received.
    pub fn close(&self) {
        self.closed.cancel();
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }
}

/// A request waiting for its response.
///
/// The receiver must answer with [`Callback::notify`]. Only the first call has an
/// effect; dropping the callback unanswered fails the waiting sender with
/// [`MailboxError::NoResponse`].
pub struct Callback<T, R> {
    pub value: T,
    done: Option<oneshot::Sender<R>>,
}

impl<T, R> Callback<T, R> {
    /// Completes the request. Returns `false` if it was already completed or the
    /// sender stopped waiting.
    pub fn notify(&mut self, response: R) -> bool {
        match self.done.take() {
            Some(done) => done.send(response).is_ok(),
            None => false,
        }
    }

    #[must_use]
    pub fn is_notified(&self) -> bool {
        self.done.is_none()
    }
}

pub struct SyncMailbox<T, R> {
    inner: Mailbox<Callback<T, R>>,
}

impl<T, R> Clone for SyncMailbox<T, R> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T, R> Default for SyncMailbox<T, R> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T, R> SyncMailbox<T, R> {
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: Mailbox::new(),
        }
    }

    /// Sends `value` and waits for the receiver's response.
    pub async fn send(&self, cancel: &CancellationToken, value: T) -> Result<R, MailboxError> {
        let (done, response) = oneshot::channel();
        self.inner.send(
            cancel,
            Callback {
                value,
                done: Some(done),
            },
        )?;

        tokio::select! {
            response = response => response.map_err(|_| MailboxError::NoResponse),
            () = cancel.cancelled() => Err(MailboxError::Cancelled),
        }
    }

    pub async fn recv(&self) -> Option<Callback<T, R>> {
        self.inner.recv().await
    }

    pub fn close(&self) {
        self.inner.close();
    }
}
