// Copyright (c) 2019 Emmanuel Gil Peyrot <linkmauve@linkmauve.fr>
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

use alloc::sync::Arc;
use core::panic::AssertUnwindSafe;
use core::time::Duration;
use std::io;
use std::panic::catch_unwind;

use futures::{FutureExt, SinkExt, StreamExt};
use rand::{thread_rng, Rng};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use xmpp_parsers::{
    iq::{Iq, IqType},
    jid::Jid,
    message::{Message, MessageType},
    ping,
    presence::{Presence, Type as PresenceType},
    sm,
    stanza_error::{DefinedCondition, ErrorType, StanzaError},
    stream_error::{ReceivedStreamError, StreamError},
};

use super::dispatch::{HandlerError, IncomingIq, IqRequestType, PayloadKind};
use super::queue::{QueueEntry, StanzaState, TransmitQueue};
use super::stream_management::SmState;
use super::Shared;
use crate::error::{MalformedStanza, ProtocolError};
use crate::minidom::Element;
use crate::xmlstream::{ReadError, SmNonza, XmppStream, XmppStreamElement};
use crate::{Error, Stanza, StanzaKind};

pub(super) static REMOTE_SHUTDOWN_TIMEOUT: Duration = Duration::new(5, 0);
pub(super) static PING_PROBE_ID_PREFIX: &str = "xmpp-rs-session-liveness-probe";

/// How a broker run ended.
#[derive(Debug)]
pub enum WorkerExit {
    /// The run was stopped locally and the stream closed.
    Stopped,

    /// The run failed. The error has also been emitted through
    /// [`BrokerSignals::on_failure`][`super::BrokerSignals::on_failure`].
    Failed(Error),
}

/// State which outlives a single run of the broker.
pub(super) struct BrokerCore {
    pub queue: TransmitQueue,
    pub sm: Option<SmState>,
    ping_probe_ctr: u64,
}

impl BrokerCore {
    pub fn new(queue: TransmitQueue) -> Self {
        Self {
            queue,
            sm: None,
            // Random start to avoid clashes with ids used by application
            // code.
            ping_probe_ctr: thread_rng().gen(),
        }
    }
}

fn handler_error_to_stanza_error(e: HandlerError) -> StanzaError {
    match e {
        HandlerError::Stanza(e) => e,
        HandlerError::Malformed(e) => StanzaError::new(
            ErrorType::Modify,
            DefinedCondition::BadRequest,
            "en",
            e.to_string(),
        ),
        HandlerError::Other(_) => internal_server_error(),
    }
}

fn internal_server_error() -> StanzaError {
    StanzaError::new(
        ErrorType::Cancel,
        DefinedCondition::InternalServerError,
        "en",
        "The request handler failed.",
    )
}

/// One run of the broker on one stream.
pub(super) struct Worker {
    core: BrokerCore,
    stream: XmppStream,
    shared: Arc<Shared>,
    cancel: CancellationToken,
    backlog: Vec<Stanza>,
    last_rx: Instant,
    probe_deadline: Option<Instant>,
}

impl Worker {
    pub fn new(
        core: BrokerCore,
        stream: XmppStream,
        shared: Arc<Shared>,
        cancel: CancellationToken,
        backlog: Vec<Stanza>,
    ) -> Self {
        Self {
            core,
            stream,
            shared,
            cancel,
            backlog,
            last_rx: Instant::now(),
            probe_deadline: None,
        }
    }

    pub async fn run(mut self) -> (BrokerCore, WorkerExit) {
        for stanza in core::mem::take(&mut self.backlog) {
            self.dispatch(stanza);
        }

        let exit = loop {
            let keepalive = self.keepalive_deadline();
            tokio::select! {
                _ = self.cancel.cancelled() => break self.shutdown().await,
                ev = self.stream.next() => {
                    if let Err(e) = self.handle_inbound(ev).await {
                        break WorkerExit::Failed(e);
                    }
                }
                entry = self.core.queue.next() => match entry {
                    Some(entry) => {
                        if let Err(e) = self.flush(entry).await {
                            break WorkerExit::Failed(e);
                        }
                    }
                    // The sender lives in `Shared`, which we hold.
                    None => break WorkerExit::Failed(Error::InvalidState),
                },
                _ = tokio::time::sleep_until(keepalive) => {
                    if let Err(e) = self.keepalive().await {
                        break WorkerExit::Failed(e);
                    }
                }
            }
        };

        if let WorkerExit::Failed(ref e) = exit {
            log::debug!("Stanza broker run failed: {e}");
            self.shared.signals.on_failure.emit(e);
        }
        (self.core, exit)
    }

    fn keepalive_deadline(&self) -> Instant {
        self.probe_deadline
            .unwrap_or(self.last_rx + self.shared.config.ping_interval)
    }

    fn note_traffic(&mut self) {
        self.last_rx = Instant::now();
        self.probe_deadline = None;
    }

    async fn handle_inbound(
        &mut self,
        ev: Option<Result<XmppStreamElement, ReadError>>,
    ) -> Result<(), Error> {
        let Some(ev) = ev else {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "stream ended without stream footer",
            )
            .into());
        };
        self.note_traffic();
        match ev {
            Ok(XmppStreamElement::Stanza(stanza)) => {
                if let Some(sm) = self.core.sm.as_mut() {
                    sm.count_inbound();
                }
                self.dispatch(stanza);
            }
            Ok(XmppStreamElement::SM(SmNonza::Ack(sm::A { h }))) => match self.core.sm.as_mut() {
                Some(sm) => {
                    if let Err(e) = sm.remote_acked(h) {
                        log::error!("{e}");
                        let _: Result<_, _> = self.stream.send(StreamError::from(&e).into()).await;
                        let _: Result<_, _> =
                            tokio::time::timeout(REMOTE_SHUTDOWN_TIMEOUT, self.stream.close())
                                .await;
                        return Err(ProtocolError::from(e).into());
                    }
                }
                None => log::warn!("Ignoring <sm:a/> on a stream without stream management."),
            },
            Ok(XmppStreamElement::SM(SmNonza::Req(_))) => match self.core.sm.as_ref() {
                Some(sm) => {
                    let h = sm.inbound_ctr();
                    log::trace!("Answering <sm:r/> with h = {h}");
                    self.stream.send(sm::A::new(h).into()).await?;
                }
                None => log::warn!("Ignoring <sm:r/> on a stream without stream management."),
            },
            Ok(XmppStreamElement::SM(other)) => {
                log::warn!("Ignoring unexpected stream management nonza: {other:?}");
            }
            Ok(XmppStreamElement::StreamError(e)) => {
                log::debug!("Received stream error: {e}");
                return Err(io::Error::other(ReceivedStreamError(e)).into());
            }
            Err(ReadError::Malformed(m)) => {
                if m.kind.is_some() {
                    if let Some(sm) = self.core.sm.as_mut() {
                        sm.count_inbound();
                    }
                }
                self.reply_malformed(m);
            }
            Err(ReadError::HardError(e)) => return Err(e.into()),
            Err(ReadError::StreamFooterReceived) => {
                log::debug!("Peer closed the stream, closing our side.");
                match tokio::time::timeout(REMOTE_SHUTDOWN_TIMEOUT, self.stream.close()).await {
                    Ok(_) => (),
                    Err(_) => {
                        log::debug!("Giving up on clean stream shutdown after timeout elapsed.")
                    }
                }
                return Err(io::Error::new(
                    io::ErrorKind::ConnectionAborted,
                    "peer closed the XML stream",
                )
                .into());
            }
        }
        Ok(())
    }

    fn dispatch(&mut self, stanza: Stanza) {
        self.shared.signals.on_stanza_received.emit(&stanza);
        match stanza {
            Stanza::Iq(iq) => self.dispatch_iq(iq),
            Stanza::Message(message) => {
                let handler = self.shared.dispatch().lookup_message(&message);
                match handler {
                    Some(handler) => {
                        if catch_unwind(AssertUnwindSafe(|| handler(message))).is_err() {
                            log::error!("Message handler panicked.");
                        }
                    }
                    None => log::debug!(
                        "No handler for message {:?} from {:?}, dropping it.",
                        message.id,
                        message.from
                    ),
                }
            }
            Stanza::Presence(presence) => {
                let handler = self.shared.dispatch().lookup_presence(&presence);
                match handler {
                    Some(handler) => {
                        if catch_unwind(AssertUnwindSafe(|| handler(presence))).is_err() {
                            log::error!("Presence handler panicked.");
                        }
                    }
                    None => log::debug!(
                        "No handler for presence {:?} from {:?}, dropping it.",
                        presence.type_,
                        presence.from
                    ),
                }
            }
        }
    }

    fn dispatch_iq(&mut self, iq: Iq) {
        match iq.payload {
            IqType::Get(payload) => {
                self.dispatch_request(iq.from, iq.to, iq.id, IqRequestType::Get, payload)
            }
            IqType::Set(payload) => {
                self.dispatch_request(iq.from, iq.to, iq.id, IqRequestType::Set, payload)
            }
            payload @ (IqType::Result(_) | IqType::Error(_)) => {
                if iq.id.starts_with(PING_PROBE_ID_PREFIX) {
                    log::trace!("Received reply to liveness probe {:?}", iq.id);
                    return;
                }
                let local = self.shared.local_jid();
                let iq = Iq { payload, ..iq };
                if let core::ops::ControlFlow::Continue(iq) =
                    self.shared.tracker.handle_iq(iq, local.as_ref())
                {
                    log::debug!(
                        "Dropping unsolicited IQ response {:?} from {:?}",
                        iq.id,
                        iq.from
                    );
                }
            }
        }
    }

    fn dispatch_request(
        &mut self,
        from: Option<Jid>,
        to: Option<Jid>,
        id: String,
        type_: IqRequestType,
        payload: Element,
    ) {
        let kind = PayloadKind::of(&payload);
        let handler = self.shared.dispatch().lookup_iq(type_, kind.clone());
        let Some(handler) = handler else {
            log::debug!(
                "No handler for IQ {type_:?} {kind} from {from:?}, replying with feature-not-implemented."
            );
            self.reply(
                Iq {
                    from: None,
                    to: from,
                    id,
                    payload: IqType::Error(StanzaError::new(
                        ErrorType::Cancel,
                        DefinedCondition::FeatureNotImplemented,
                        "en",
                        "No handler is registered for this request.",
                    )),
                }
                .into(),
            );
            return;
        };

        let requester = from.clone();
        let reply_id = id.clone();
        let request = IncomingIq {
            from,
            to,
            id,
            type_,
            payload,
        };
        let outbound = self.shared.outbound();
        self.shared.tasks.spawn(async move {
            let result = AssertUnwindSafe(async move { handler(request).await })
                .catch_unwind()
                .await;
            let payload = match result {
                Ok(Ok(payload)) => IqType::Result(payload),
                Ok(Err(e)) => {
                    log::debug!("IQ handler for {kind} failed: {e}");
                    IqType::Error(handler_error_to_stanza_error(e))
                }
                Err(_) => {
                    log::error!("IQ handler for {kind} panicked.");
                    IqType::Error(internal_server_error())
                }
            };
            let reply = Iq {
                from: None,
                to: requester,
                id: reply_id,
                payload,
            };
            if outbound
                .send(QueueEntry::reply(Box::new(reply.into())))
                .is_err()
            {
                log::warn!("Broker went away before IQ reply could be queued.");
            }
        });
    }

    fn reply(&mut self, stanza: Stanza) {
        if self
            .shared
            .outbound()
            .send(QueueEntry::reply(Box::new(stanza)))
            .is_err()
        {
            log::warn!("Transmit queue is gone, dropping reply.");
        }
    }

    fn reply_malformed(&mut self, m: MalformedStanza) {
        if !m.is_replyable() {
            log::warn!("Dropping malformed stanza: {m}");
            return;
        }
        log::debug!("Replying with bad-request to malformed stanza: {m}");
        let error = StanzaError::new(
            ErrorType::Modify,
            DefinedCondition::BadRequest,
            "en",
            m.reason.clone(),
        );
        let stanza: Stanza = match m.kind {
            Some(StanzaKind::Iq) => Iq {
                from: None,
                to: m.from,
                id: m.id.unwrap_or_default(),
                payload: IqType::Error(error),
            }
            .into(),
            Some(StanzaKind::Message) => {
                let mut message = Message::new(m.from);
                message.type_ = MessageType::Error;
                message.id = m.id;
                message.payloads.push(error.into());
                message.into()
            }
            Some(StanzaKind::Presence) => {
                let mut presence = Presence::new(PresenceType::Error);
                presence.to = m.from;
                presence.id = m.id;
                presence.payloads.push(error.into());
                presence.into()
            }
            None => return,
        };
        self.reply(stanza);
    }

    /// Write `first` and whatever else is queued, up to the batch limit,
    /// then flush once.
    async fn flush(&mut self, first: QueueEntry) -> Result<(), Error> {
        let max_batch = self.shared.config.max_batch.max(1);
        let mut next = Some(first);
        let mut written = 0;
        while let Some(entry) = next.take() {
            self.write_entry(entry).await?;
            written += 1;
            if written < max_batch {
                next = self.core.queue.try_next();
            }
        }
        log::trace!("Wrote {written} stanzas");

        if self.probe_deadline.is_none()
            && self.last_rx.elapsed() >= self.shared.config.ping_opportunistic_interval
        {
            self.start_probe().await?;
        } else if self.core.sm.is_some() && self.shared.config.sm_request_on_flush {
            self.stream.feed(sm::R.into()).await?;
        }
        self.stream.flush().await?;
        Ok(())
    }

    async fn write_entry(&mut self, entry: QueueEntry) -> Result<(), Error> {
        let element = XmppStreamElement::Stanza((*entry.stanza).clone());
        match self.stream.feed(element).await {
            Ok(()) => {
                match self.core.sm.as_mut() {
                    Some(sm) => sm.enqueue(entry),
                    None => entry.set_state(StanzaState::Sent),
                }
                Ok(())
            }
            // The codec refused the stanza; it will never be sendable.
            Err(e) if matches!(
                e.kind(),
                io::ErrorKind::InvalidInput | io::ErrorKind::InvalidData
            ) =>
            {
                log::warn!("Failed to serialise stanza, dropping it: {e}");
                entry.set_state(StanzaState::Failed { error: (&e).into() });
                Ok(())
            }
            Err(e) => {
                self.core.queue.requeue_all([entry]);
                Err(e.into())
            }
        }
    }

    async fn keepalive(&mut self) -> Result<(), Error> {
        let now = Instant::now();
        if let Some(deadline) = self.probe_deadline {
            if now >= deadline {
                log::warn!(
                    "Peer did not respond to liveness probe within {:?}.",
                    self.shared.config.ping_timeout
                );
                return Err(Error::Timeout);
            }
            return Ok(());
        }
        if now >= self.last_rx + self.shared.config.ping_interval {
            self.start_probe().await?;
            self.stream.flush().await?;
        }
        Ok(())
    }

    /// Feed a liveness probe into the stream. Does not flush.
    async fn start_probe(&mut self) -> Result<(), Error> {
        self.probe_deadline = Some(Instant::now() + self.shared.config.ping_timeout);
        if self.core.sm.is_some() {
            log::debug!("Sending <sm:r/> as liveness probe.");
            self.stream.feed(sm::R.into()).await?;
        } else {
            self.core.ping_probe_ctr = self.core.ping_probe_ctr.wrapping_add(1);
            log::debug!("Stream management is not enabled, sending ping IQ as liveness probe.");
            // to/from can stay blank: the server answers pings on c2s
            // streams.
            let iq = Iq::from_get(
                format!("{}-{}", PING_PROBE_ID_PREFIX, self.core.ping_probe_ctr),
                ping::Ping,
            );
            self.stream.feed(Stanza::Iq(iq).into()).await?;
        }
        Ok(())
    }

    /// Write the replies which are still queued, such as those of request
    /// handlers which finished during the grace period. Other stanzas stay
    /// queued for the next run.
    async fn write_replies(&mut self) {
        let mut kept = Vec::new();
        let mut written = 0usize;
        while let Some(entry) = self.core.queue.try_next() {
            if !entry.is_reply {
                kept.push(entry);
                continue;
            }
            if let Err(e) = self.write_entry(entry).await {
                log::debug!("Could not write reply while shutting down: {e}");
                break;
            }
            written += 1;
        }
        self.core.queue.requeue_all(kept);
        if written > 0 {
            log::debug!("Wrote {written} pending replies before closing the stream.");
        }
    }

    async fn shutdown(&mut self) -> WorkerExit {
        let grace = self.shared.config.shutdown_grace;
        self.shared.tasks.close();
        if tokio::time::timeout(grace, self.shared.tasks.wait())
            .await
            .is_err()
        {
            log::warn!(
                "{} request handlers still running after {:?}, not waiting for them any longer.",
                self.shared.tasks.len(),
                grace
            );
        }
        self.shared.tasks.reopen();
        self.write_replies().await;

        if let Some(sm) = self.core.sm.as_ref() {
            let h = sm.inbound_ctr();
            let _: Result<_, _> = self.stream.feed(sm::A::new(h).into()).await;
        }
        match tokio::time::timeout(grace, self.stream.close()).await {
            Ok(Ok(())) => log::debug!("Stream closed successfully"),
            Ok(Err(e)) => log::debug!("Stream closure failed: {e}"),
            Err(_) => log::debug!("Giving up on clean stream shutdown after timeout elapsed."),
        }
        WorkerExit::Stopped
    }
}
