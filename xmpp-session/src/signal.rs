// Copyright (c) 2026 xmpp-rs contributors.
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! # Observer signals
//!
//! A [`Signal`] is an ordered list of subscribers which are called
//! synchronously, in connection order, whenever the signal is emitted. A
//! subscriber which panics is logged and skipped; it never prevents the
//! remaining subscribers from running, nor does it take down the emitting
//! task.
//!
//! A [`BarrierSignal`] has asynchronous subscribers which are awaited in
//! order. The emitter does not proceed until every subscriber has finished.

use alloc::sync::Arc;
use core::error::Error;
use core::future::Future;
use core::panic::AssertUnwindSafe;
use std::panic::catch_unwind;
use std::sync::{Mutex, MutexGuard, PoisonError};

use futures::future::{BoxFuture, FutureExt};

/// Handle identifying a subscription, used to disconnect it again.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

struct Subscribers<F: ?Sized> {
    next_id: u64,
    entries: Vec<(SubscriptionId, Arc<F>)>,
}

impl<F: ?Sized> Subscribers<F> {
    fn new() -> Self {
        Self {
            next_id: 0,
            entries: Vec::new(),
        }
    }

    fn insert(&mut self, f: Arc<F>) -> SubscriptionId {
        let id = SubscriptionId(self.next_id);
        self.next_id += 1;
        self.entries.push((id, f));
        id
    }

    fn remove(&mut self, id: SubscriptionId) -> bool {
        let before = self.entries.len();
        self.entries.retain(|(other, _)| *other != id);
        self.entries.len() != before
    }

    fn snapshot(&self) -> Vec<Arc<F>> {
        self.entries.iter().map(|(_, f)| f.clone()).collect()
    }
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    // Subscribers never run while the lock is held.
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

type Callback<T> = dyn Fn(&T) + Send + Sync;

/// A synchronous observer list.
pub struct Signal<T> {
    subscribers: Mutex<Subscribers<Callback<T>>>,
}

impl<T> Signal<T> {
    /// Create a signal without subscribers.
    pub fn new() -> Self {
        Self {
            subscribers: Mutex::new(Subscribers::new()),
        }
    }

    /// Subscribe to the signal.
    pub fn connect<F: Fn(&T) + Send + Sync + 'static>(&self, f: F) -> SubscriptionId {
        lock(&self.subscribers).insert(Arc::new(f))
    }

    /// Remove a subscription.
    ///
    /// Returns false if the subscription did not exist (anymore).
    pub fn disconnect(&self, id: SubscriptionId) -> bool {
        lock(&self.subscribers).remove(id)
    }

    /// Number of current subscribers.
    pub fn subscriber_count(&self) -> usize {
        lock(&self.subscribers).entries.len()
    }

    /// Call every subscriber with `value`.
    ///
    /// Subscribers connected or disconnected during emission take effect
    /// for the next emission.
    pub fn emit(&self, value: &T) {
        let subscribers = lock(&self.subscribers).snapshot();
        for f in subscribers {
            if catch_unwind(AssertUnwindSafe(|| f(value))).is_err() {
                log::error!("Signal subscriber panicked. Continuing with the next one.");
            }
        }
    }
}

impl<T> Default for Signal<T> {
    fn default() -> Self {
        Self::new()
    }
}

/// Error type returned by [`BarrierSignal`] subscribers.
pub type BoxError = Box<dyn Error + Send + Sync>;

type BarrierCallback = dyn Fn() -> BoxFuture<'static, Result<(), BoxError>> + Send + Sync;

/// An asynchronous observer list which is awaited in full by the emitter.
pub struct BarrierSignal {
    subscribers: Mutex<Subscribers<BarrierCallback>>,
}

impl BarrierSignal {
    /// Create a signal without subscribers.
    pub fn new() -> Self {
        Self {
            subscribers: Mutex::new(Subscribers::new()),
        }
    }

    /// Subscribe to the signal.
    pub fn connect<F, Fut>(&self, f: F) -> SubscriptionId
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), BoxError>> + Send + 'static,
    {
        lock(&self.subscribers).insert(Arc::new(move || f().boxed()))
    }

    /// Remove a subscription.
    pub fn disconnect(&self, id: SubscriptionId) -> bool {
        lock(&self.subscribers).remove(id)
    }

    /// Number of current subscribers.
    pub fn subscriber_count(&self) -> usize {
        lock(&self.subscribers).entries.len()
    }

    /// Run every subscriber to completion, one after the other.
    ///
    /// Failing or panicking subscribers are logged; the remaining
    /// subscribers still run.
    pub async fn emit(&self) {
        let subscribers = lock(&self.subscribers).snapshot();
        for f in subscribers {
            let fut = AssertUnwindSafe(async move { f().await }).catch_unwind();
            match fut.await {
                Ok(Ok(())) => (),
                Ok(Err(e)) => log::warn!("Barrier subscriber failed: {e}"),
                Err(_) => log::error!("Barrier subscriber panicked. Continuing with the next one."),
            }
        }
    }
}

impl Default for BarrierSignal {
    fn default() -> Self {
        Self::new()
    }
}
