// Copyright (c) 2024 Jonas Schäfer <jonas@zombofant.net>
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! # Session-scoped stanza exchange
//!
//! The [`StanzaBroker`] owns everything which belongs to the logical XMPP
//! session rather than to a single connection: the transmit queue, the
//! [XEP-0198](https://xmpp.org/extensions/xep-0198.html) state, the table of
//! pending IQ requests and the handler registrations.
//!
//! A broker is *started* on an authenticated and bound
//! [`XmppStream`][`crate::xmlstream::XmppStream`]. While running, a single
//! task writes queued stanzas in batches, dispatches inbound stanzas to the
//! registered handlers, correlates IQ responses and keeps the stream alive
//! with probes. The run ends when [`StanzaBroker::stop`] is called or the
//! stream fails; the session state survives in the broker and the broker
//! can be started again on a new stream.
//!
//! Stanzas can be enqueued at any time, also while no stream is attached.
//! They are sent in enqueue order once a stream becomes available.

use alloc::sync::Arc;
use core::future::Future;
use core::time::Duration;
use std::sync::{Mutex, MutexGuard, PoisonError};

use futures::FutureExt;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::{sync::CancellationToken, task::TaskTracker};

use xmpp_parsers::{
    iq::{Iq, IqType},
    message::{Message, MessageType},
    presence::{Presence, Type as PresenceType},
    sm,
};

use crate::error::ProtocolError;
use crate::jid::Jid;
use crate::signal::Signal;
use crate::xmlstream::XmppStream;
use crate::{Error, Stanza};

mod dispatch;
mod iq;
mod queue;
mod stream_management;
mod worker;

pub use dispatch::{HandlerError, IncomingIq, IqHandlerResult, IqRequestType, PayloadKind};
pub use iq::{IqResponse, IqResponseToken};
pub use queue::{OpaqueIoError, StanzaStage, StanzaState, StanzaToken};
pub use stream_management::SmResumption;
pub use worker::WorkerExit;

use dispatch::{DispatchTables, IqHandler};
use iq::IqResponseTracker;
use queue::{QueueEntry, StanzaState as State, TransmitQueue};
use worker::{BrokerCore, Worker};

/// Tunables of the [`StanzaBroker`].
#[derive(Debug, Clone)]
pub struct BrokerConfig {
    /// Send a liveness probe after this long without inbound traffic.
    pub ping_interval: Duration,

    /// Attach a liveness probe to an outbound flush when nothing was
    /// received for this long.
    pub ping_opportunistic_interval: Duration,

    /// Fail the run if nothing is received within this long after a probe.
    pub ping_timeout: Duration,

    /// Upper bound on waiting for request handlers and for the stream
    /// close when stopping.
    pub shutdown_grace: Duration,

    /// Maximum number of stanzas written per flush.
    pub max_batch: usize,

    /// Request an XEP-0198 ack after each flush.
    pub sm_request_on_flush: bool,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            ping_interval: Duration::from_secs(15),
            ping_opportunistic_interval: Duration::from_secs(15),
            ping_timeout: Duration::from_secs(30),
            shutdown_grace: Duration::from_secs(10),
            max_batch: 32,
            sm_request_on_flush: true,
        }
    }
}

impl BrokerConfig {
    /// Short timeouts for tests and for links where failures must be
    /// detected quickly.
    pub fn tight() -> Self {
        Self {
            ping_interval: Duration::from_secs(1),
            ping_opportunistic_interval: Duration::from_secs(1),
            ping_timeout: Duration::from_secs(2),
            shutdown_grace: Duration::from_secs(1),
            max_batch: 8,
            sm_request_on_flush: true,
        }
    }
}

/// Signals emitted by the [`StanzaBroker`].
#[derive(Default)]
pub struct BrokerSignals {
    /// Every inbound stanza, before it is dispatched.
    pub on_stanza_received: Signal<Stanza>,

    /// A run ended with an error.
    pub on_failure: Signal<Error>,

    /// The session state was discarded, with an optional reason.
    pub on_destroyed: Signal<Option<String>>,
}

/// State shared between the broker handle and its running worker.
pub(crate) struct Shared {
    pub(super) config: BrokerConfig,
    outbound_tx: Mutex<mpsc::UnboundedSender<QueueEntry>>,
    dispatch: Mutex<DispatchTables>,
    pub(super) tracker: IqResponseTracker,
    pub(super) signals: BrokerSignals,
    pub(super) tasks: TaskTracker,
    local_jid: Mutex<Option<Jid>>,
}

impl Shared {
    pub(super) fn dispatch(&self) -> MutexGuard<'_, DispatchTables> {
        self.dispatch.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Sending half of the transmit queue.
    pub(super) fn outbound(&self) -> mpsc::UnboundedSender<QueueEntry> {
        self.outbound_tx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Replace the transmit queue, returning the new receiving half.
    fn renew_outbound(&self) -> TransmitQueue {
        let (tx, queue) = TransmitQueue::channel();
        *self
            .outbound_tx
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = tx;
        queue
    }

    pub(super) fn local_jid(&self) -> Option<Jid> {
        self.local_jid
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

enum BrokerState {
    Idle(Box<BrokerCore>),
    Running(JoinHandle<(BrokerCore, WorkerExit)>),
    /// The worker panicked and took the session state with it.
    Lost,
}

impl BrokerState {
    /// Move a finished worker's state back in.
    fn reap(&mut self) {
        let Self::Running(handle) = self else {
            return;
        };
        if !handle.is_finished() {
            return;
        }
        match handle.now_or_never() {
            Some(Ok((core, exit))) => {
                log::debug!("Reaping finished broker run which nobody joined: {exit:?}");
                *self = Self::Idle(Box::new(core));
            }
            Some(Err(e)) => {
                log::error!("Broker worker crashed: {e}");
                *self = Self::Lost;
            }
            None => (),
        }
    }
}

struct Inner {
    shared: Arc<Shared>,
    state: tokio::sync::Mutex<BrokerState>,
    stop_token: Mutex<Option<CancellationToken>>,
}

impl Drop for Inner {
    fn drop(&mut self) {
        if let Some(token) = self
            .stop_token
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            token.cancel();
        }
    }
}

/// Handle to the session-scoped stanza broker.
///
/// Cloning the handle is cheap; all clones refer to the same broker. When
/// the last handle is dropped, a running worker is stopped.
#[derive(Clone)]
pub struct StanzaBroker {
    inner: Arc<Inner>,
}

impl StanzaBroker {
    /// Create a new, idle broker.
    pub fn new(config: BrokerConfig) -> Self {
        let (outbound_tx, queue) = TransmitQueue::channel();
        let shared = Arc::new(Shared {
            config,
            outbound_tx: Mutex::new(outbound_tx),
            dispatch: Mutex::new(DispatchTables::new()),
            tracker: IqResponseTracker::new(),
            signals: BrokerSignals::default(),
            tasks: TaskTracker::new(),
            local_jid: Mutex::new(None),
        });
        Self {
            inner: Arc::new(Inner {
                shared,
                state: tokio::sync::Mutex::new(BrokerState::Idle(Box::new(BrokerCore::new(
                    queue,
                )))),
                stop_token: Mutex::new(None),
            }),
        }
    }

    /// Start processing on `stream`.
    pub fn start(&self, stream: XmppStream) -> Result<(), Error> {
        self.start_with_backlog(stream, Vec::new())
    }

    /// Start processing on `stream`, dispatching `backlog` first.
    ///
    /// The backlog holds stanzas the peer sent while the stream was being
    /// negotiated. They are dispatched like any other inbound stanza, but
    /// are not counted for stream management.
    pub fn start_with_backlog(&self, stream: XmppStream, backlog: Vec<Stanza>) -> Result<(), Error> {
        let mut state = self
            .inner
            .state
            .try_lock()
            .map_err(|_| Error::AlreadyRunning)?;
        state.reap();
        let core = match core::mem::replace(&mut *state, BrokerState::Lost) {
            BrokerState::Idle(core) => core,
            BrokerState::Running(handle) => {
                *state = BrokerState::Running(handle);
                return Err(Error::AlreadyRunning);
            }
            BrokerState::Lost => return Err(Error::InvalidState),
        };
        let cancel = CancellationToken::new();
        *self.lock_stop_token() = Some(cancel.clone());
        let worker = Worker::new(*core, stream, self.inner.shared.clone(), cancel, backlog);
        *state = BrokerState::Running(tokio::spawn(worker.run()));
        log::debug!("Stanza broker started.");
        Ok(())
    }

    fn lock_stop_token(&self) -> MutexGuard<'_, Option<CancellationToken>> {
        self.inner
            .stop_token
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Stop the running worker and wait for it to exit.
    ///
    /// Returns `None` if the broker was not running. Safe to call
    /// repeatedly and from multiple tasks.
    pub async fn stop(&self) -> Option<WorkerExit> {
        if let Some(token) = self.lock_stop_token().take() {
            token.cancel();
        }
        self.join().await
    }

    /// Wait for the running worker to exit.
    ///
    /// Returns `None` if the broker was not running. This is cancel-safe:
    /// dropping the future leaves the worker untouched.
    pub async fn join(&self) -> Option<WorkerExit> {
        let mut state = self.inner.state.lock().await;
        let BrokerState::Running(handle) = &mut *state else {
            return None;
        };
        let result = handle.await;
        self.lock_stop_token().take();
        match result {
            Ok((core, exit)) => {
                *state = BrokerState::Idle(Box::new(core));
                Some(exit)
            }
            Err(e) => {
                log::error!("Broker worker crashed: {e}");
                *state = BrokerState::Lost;
                Some(WorkerExit::Failed(Error::InvalidState))
            }
        }
    }

    /// Return true if a worker is currently attached to a stream.
    pub fn is_running(&self) -> bool {
        match self.inner.state.try_lock() {
            Ok(state) => match &*state {
                BrokerState::Running(handle) => !handle.is_finished(),
                _ => false,
            },
            // Only `join` holds the lock across an await, and only while
            // running.
            Err(_) => true,
        }
    }

    /// Enqueue a stanza for transmission.
    ///
    /// An ID is assigned if the stanza has none. Never blocks; stanzas are
    /// sent in the order they were enqueued.
    pub fn enqueue<S: Into<Stanza>>(&self, stanza: S) -> StanzaToken {
        let mut stanza = stanza.into();
        stanza.ensure_id();
        let (entry, token) = QueueEntry::tracked(Box::new(stanza));
        if let Err(mpsc::error::SendError(entry)) = self.inner.shared.outbound().send(entry) {
            log::error!("Transmit queue is gone, dropping stanza.");
            entry.set_state(State::Dropped);
        }
        token
    }

    /// Send an IQ request and return a token resolving to its response.
    ///
    /// Only `get` and `set` requests can be sent this way.
    pub fn send_iq(&self, mut iq: Iq) -> Result<IqResponseToken, Error> {
        match iq.payload {
            IqType::Get(_) | IqType::Set(_) => (),
            IqType::Result(_) | IqType::Error(_) => return Err(Error::InvalidState),
        }
        if iq.id.is_empty() {
            iq.id = crate::stanza::make_id();
        }
        let mut token = self
            .inner
            .shared
            .tracker
            .register(iq.to.clone(), iq.id.clone())?;
        token.set_stanza_token(self.enqueue(iq));
        Ok(token)
    }

    /// Send an IQ request and wait up to `timeout` for its response.
    ///
    /// An `Ok` result may still carry an [`IqResponse::Error`].
    pub async fn send_and_await_reply(
        &self,
        iq: Iq,
        timeout: Duration,
    ) -> Result<IqResponse, Error> {
        let token = self.send_iq(iq)?;
        match tokio::time::timeout(timeout, token).await {
            Ok(result) => result,
            Err(_) => Err(Error::Timeout),
        }
    }

    /// Register the handler for IQ requests of type `type_` carrying a
    /// payload of `kind`.
    ///
    /// The handler runs in its own task. Its result is sent back to the
    /// requester, as a `result` reply on success and as an `error` reply
    /// otherwise.
    pub fn register_iq_handler<F, Fut>(
        &self,
        type_: IqRequestType,
        kind: PayloadKind,
        handler: F,
    ) -> Result<(), Error>
    where
        F: Fn(IncomingIq) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = IqHandlerResult> + Send + 'static,
    {
        let handler: IqHandler = Arc::new(move |iq| handler(iq).boxed());
        self.inner.shared.dispatch().insert_iq(type_, kind, handler)
    }

    /// Remove an IQ handler. Returns false if none was registered.
    pub fn unregister_iq_handler(&self, type_: IqRequestType, kind: &PayloadKind) -> bool {
        self.inner.shared.dispatch().remove_iq(type_, kind)
    }

    /// Register a message handler.
    ///
    /// `None` matches any type or sender. The most specific registration
    /// wins, looked up as `(type, from)`, then `(type, None)`, then
    /// `(None, None)`.
    pub fn register_message_handler<F>(
        &self,
        type_: Option<MessageType>,
        from: Option<Jid>,
        handler: F,
    ) -> Result<(), Error>
    where
        F: Fn(Message) + Send + Sync + 'static,
    {
        self.inner
            .shared
            .dispatch()
            .insert_message(type_, from, Arc::new(handler))
    }

    /// Remove a message handler. Returns false if none was registered.
    pub fn unregister_message_handler(
        &self,
        type_: Option<&MessageType>,
        from: Option<&Jid>,
    ) -> bool {
        self.inner.shared.dispatch().remove_message(type_, from)
    }

    /// Register a presence handler, with the same lookup rules as message
    /// handlers.
    pub fn register_presence_handler<F>(
        &self,
        type_: Option<PresenceType>,
        from: Option<Jid>,
        handler: F,
    ) -> Result<(), Error>
    where
        F: Fn(Presence) + Send + Sync + 'static,
    {
        self.inner
            .shared
            .dispatch()
            .insert_presence(type_, from, Arc::new(handler))
    }

    /// Remove a presence handler. Returns false if none was registered.
    pub fn unregister_presence_handler(
        &self,
        type_: Option<&PresenceType>,
        from: Option<&Jid>,
    ) -> bool {
        self.inner.shared.dispatch().remove_presence(type_, from)
    }

    fn with_idle_core<R, F: FnOnce(&mut BrokerCore) -> R>(&self, f: F) -> Result<R, Error> {
        let mut state = self
            .inner
            .state
            .try_lock()
            .map_err(|_| Error::AlreadyRunning)?;
        state.reap();
        match &mut *state {
            BrokerState::Idle(core) => Ok(f(core)),
            BrokerState::Running(_) => Err(Error::AlreadyRunning),
            BrokerState::Lost => Err(Error::InvalidState),
        }
    }

    /// Remove and return all stanzas which have not been written yet.
    ///
    /// Their tokens move to [`StanzaStage::Dropped`]. Replies the broker
    /// generated itself are discarded rather than returned. Only possible
    /// while the broker is not running.
    pub fn drain_outbound(&self) -> Result<Vec<Stanza>, Error> {
        self.with_idle_core(|core| {
            core.queue
                .drain()
                .into_iter()
                .filter_map(|entry| {
                    entry.set_state(State::Dropped);
                    if entry.is_reply {
                        log::debug!("Discarding unsent reply {:?}.", entry.stanza.id());
                        return None;
                    }
                    Some(*entry.stanza)
                })
                .collect()
        })
    }

    /// Turn on stream management with fresh counters.
    ///
    /// Any previous stream management state is discarded.
    pub fn enable_sm(&self, enabled: sm::Enabled) -> Result<(), Error> {
        self.with_idle_core(|core| {
            if let Some(old) = core.sm.replace(enabled.into()) {
                log::debug!("Discarding previous stream management state: {old:?}");
                old.discard();
            }
        })
    }

    /// Apply a successful resumption where the peer handled `h` of our
    /// stanzas.
    ///
    /// Unacknowledged stanzas are put back at the front of the queue, in
    /// their original order.
    pub fn resume_sm(&self, h: u32) -> Result<(), Error> {
        self.with_idle_core(|core| {
            let Some(sm) = core.sm.as_mut() else {
                return Err(Error::InvalidState);
            };
            let replay: Vec<_> = sm.resume(h).map_err(ProtocolError::from)?.collect();
            log::debug!("Resumed stream, retransmitting {} stanzas.", replay.len());
            core.queue.requeue_all(replay);
            Ok(())
        })?
    }

    /// Discard any stream management state.
    pub fn disable_sm(&self) -> Result<(), Error> {
        self.with_idle_core(|core| {
            if let Some(sm) = core.sm.take() {
                sm.discard();
            }
        })
    }

    /// Information needed to resume the session, if the peer allowed it.
    ///
    /// Always `None` while the broker is running.
    pub fn sm_resume_info(&self) -> Option<SmResumption> {
        self.with_idle_core(|core| core.sm.as_ref().and_then(|sm| sm.resume_info()))
            .ok()
            .flatten()
    }

    /// Return true if stream management is enabled.
    pub fn sm_enabled(&self) -> Result<bool, Error> {
        self.with_idle_core(|core| core.sm.is_some())
    }

    /// Discard the session state.
    ///
    /// Unacknowledged stanzas are dropped and every pending IQ request fails
    /// with [`Error::ConnectionLost`]. Stanzas which were never written stay
    /// queued for the next session.
    ///
    /// If a worker crash took the session state with it, a fresh one is
    /// set up, so that the broker can be started again.
    pub fn destroy(&self, reason: Option<String>) -> Result<(), Error> {
        {
            let mut state = self
                .inner
                .state
                .try_lock()
                .map_err(|_| Error::AlreadyRunning)?;
            state.reap();
            match &mut *state {
                BrokerState::Idle(core) => {
                    if let Some(sm) = core.sm.take() {
                        sm.discard();
                    }
                }
                BrokerState::Running(_) => return Err(Error::AlreadyRunning),
                BrokerState::Lost => {
                    log::warn!("Session state was lost with a crashed worker, starting over.");
                    let queue = self.inner.shared.renew_outbound();
                    *state = BrokerState::Idle(Box::new(BrokerCore::new(queue)));
                }
            }
        }
        let failed = self.inner.shared.tracker.fail_all();
        log::debug!(
            "Session destroyed ({}), failed {failed} pending requests.",
            reason.as_deref().unwrap_or("no reason given")
        );
        self.inner.shared.signals.on_destroyed.emit(&reason);
        Ok(())
    }

    /// Set the address bound on the current stream.
    pub fn set_local_jid(&self, jid: Option<Jid>) {
        *self
            .inner
            .shared
            .local_jid
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = jid;
    }

    /// The address bound on the current stream, if any.
    pub fn local_jid(&self) -> Option<Jid> {
        self.inner.shared.local_jid()
    }

    /// Number of IQ requests waiting for a response.
    pub fn pending_requests(&self) -> usize {
        self.inner.shared.tracker.len()
    }

    /// Access the broker signals.
    pub fn signals(&self) -> &BrokerSignals {
        &self.inner.shared.signals
    }

    /// Access the configuration.
    pub fn config(&self) -> &BrokerConfig {
        &self.inner.shared.config
    }
}
