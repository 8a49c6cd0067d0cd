// Copyright (c) 2025 Jonas Schäfer <jonas@zombofant.net>
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

use alloc::collections::BTreeMap;
use alloc::sync::{Arc, Weak};
use core::future::Future;
use core::ops::ControlFlow;
use core::pin::Pin;
use core::task::{ready, Context, Poll};
use std::sync::{Mutex, PoisonError};

use futures::Stream;
use tokio::sync::oneshot;

use xmpp_parsers::{
    iq::{Iq, IqType},
    stanza_error::StanzaError,
};

use super::queue::{StanzaState, StanzaToken};
use crate::{jid::Jid, minidom::Element, Error};

/// An IQ response payload
#[derive(Debug, Clone)]
pub enum IqResponse {
    /// Payload for a `type="result"` response.
    Result(Option<Element>),

    /// Payload for a `type="error"` response.
    Error(StanzaError),
}

impl From<IqResponse> for IqType {
    fn from(other: IqResponse) -> IqType {
        match other {
            IqResponse::Result(v) => Self::Result(v),
            IqResponse::Error(v) => Self::Error(v),
        }
    }
}

type IqKey = (Option<Jid>, String);
type IqMap = BTreeMap<IqKey, IqResponseSink>;

struct IqMapEntryHandle {
    key: IqKey,
    map: Weak<Mutex<IqMap>>,
}

impl Drop for IqMapEntryHandle {
    fn drop(&mut self) {
        let Some(map) = self.map.upgrade() else {
            return;
        };
        map.lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&self.key);
    }
}

pin_project_lite::pin_project! {
    /// Handle for awaiting an IQ response.
    ///
    /// Completes with the response, or with [`Error::ConnectionLost`] if the
    /// session is destroyed before one arrives. An `Ok(_)` result does
    /// **not** imply a successful execution of the remote command: It may
    /// contain a [`IqResponse::Error`] variant.
    ///
    /// Dropping (cancelling) an `IqResponseToken` removes the internal
    /// bookkeeping required for tracking the response.
    pub struct IqResponseToken {
        entry: Option<IqMapEntryHandle>,
        #[pin]
        stanza_token: Option<tokio_stream::wrappers::WatchStream<StanzaState>>,
        #[pin]
        inner: oneshot::Receiver<Result<IqResponse, Error>>,
    }
}

impl IqResponseToken {
    /// Tie a stanza token to this IQ response token.
    ///
    /// The stanza token should point at the IQ **request**. Awaiting the
    /// response token will then fail early if the request can never be
    /// delivered.
    pub(crate) fn set_stanza_token(&mut self, token: StanzaToken) {
        debug_assert!(self.stanza_token.is_none());
        self.stanza_token = Some(token.into_stream());
    }
}

impl Future for IqResponseToken {
    type Output = Result<IqResponse, Error>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let mut this = self.project();
        match this.inner.poll(cx) {
            Poll::Ready(Ok(v)) => {
                this.entry.take();
                return Poll::Ready(v);
            }
            Poll::Ready(Err(_)) => {
                log::warn!("IqResponseToken oneshot::Receiver returned receive error!");
                this.entry.take();
                return Poll::Ready(Err(Error::ConnectionLost));
            }
            Poll::Pending => (),
        };

        loop {
            match this.stanza_token.as_mut().as_pin_mut() {
                Some(stream) => match ready!(stream.poll_next(cx)) {
                    // Still in the queue, or waiting for retransmission.
                    Some(StanzaState::Queued) => (),

                    Some(StanzaState::Failed { error }) => {
                        this.entry.take();
                        return Poll::Ready(Err(Error::Transport(error.into_io_error())));
                    }

                    // The broker drops the request from tracking when it
                    // is drained from the queue or its session ends; in the
                    // latter case, the response sink fails on its own.
                    Some(StanzaState::Dropped) | None => {
                        *this.stanza_token = None;
                        return Poll::Pending;
                    }

                    Some(StanzaState::Sent) | Some(StanzaState::Acked) => (),
                },

                None => return Poll::Pending,
            }
        }
    }
}

struct IqResponseSink {
    inner: oneshot::Sender<Result<IqResponse, Error>>,
}

impl IqResponseSink {
    fn complete(self, resp: IqResponse) {
        let _: Result<_, _> = self.inner.send(Ok(resp));
    }

    fn fail(self, error: Error) {
        let _: Result<_, _> = self.inner.send(Err(error));
    }
}

/// Returns true if `from` is an address under which the server may answer
/// requests we addressed to ourselves (i.e. sent without `to`).
fn is_self_address(from: &Jid, local: &Jid) -> bool {
    from.resource().is_none()
        && from.domain() == local.domain()
        && (from.node().is_none() || from.node() == local.node())
}

/// Utility struct to track IQ responses.
#[derive(Clone)]
pub(crate) struct IqResponseTracker {
    map: Arc<Mutex<IqMap>>,
}

impl IqResponseTracker {
    /// Create a new empty response tracker.
    pub fn new() -> Self {
        Self {
            map: Arc::new(Mutex::new(IqMap::new())),
        }
    }

    /// Attempt to handle an IQ stanza as IQ response.
    ///
    /// Requests sent without a `to` are answered by the server under our
    /// bare JID or its domain; such responses are matched as if they came
    /// without a `from`.
    ///
    /// Returns the IQ stanza unharmed if it is not an IQ response matching
    /// any request which is still being tracked.
    pub fn handle_iq(&self, iq: Iq, local: Option<&Jid>) -> ControlFlow<(), Iq> {
        let payload = match iq.payload {
            IqType::Error(error) => IqResponse::Error(error),
            IqType::Result(result) => IqResponse::Result(result),
            _ => return ControlFlow::Continue(iq),
        };
        let key = (iq.from, iq.id);
        let mut map = self.map.lock().unwrap_or_else(PoisonError::into_inner);
        let sink = match map.remove(&key) {
            Some(sink) => Some(sink),
            None => match (key.0.as_ref(), local) {
                (Some(from), Some(local)) if is_self_address(from, local) => {
                    map.remove(&(None, key.1.clone()))
                }
                _ => None,
            },
        };
        match sink {
            None => {
                log::trace!("not handling IQ response from {:?} with id {:?}: no active tracker for this tuple", key.0, key.1);
                ControlFlow::Continue(Iq {
                    from: key.0,
                    id: key.1,
                    to: iq.to,
                    payload: payload.into(),
                })
            }
            Some(sink) => {
                sink.complete(payload);
                ControlFlow::Break(())
            }
        }
    }

    /// Start tracking the response to a request with the given recipient
    /// and ID.
    ///
    /// Fails if a request with the same key is already pending.
    pub fn register(&self, to: Option<Jid>, id: String) -> Result<IqResponseToken, Error> {
        let key = (to, id);
        let mut map = self.map.lock().unwrap_or_else(PoisonError::into_inner);
        if map.contains_key(&key) {
            return Err(Error::DuplicateHandler(format!(
                "IQ response from {:?} with id {:?}",
                key.0, key.1
            )));
        }
        let (tx, rx) = oneshot::channel();
        let token = IqResponseToken {
            entry: Some(IqMapEntryHandle {
                key: key.clone(),
                map: Arc::downgrade(&self.map),
            }),
            stanza_token: None,
            inner: rx,
        };
        map.insert(key, IqResponseSink { inner: tx });
        Ok(token)
    }

    /// Fail all pending requests with [`Error::ConnectionLost`].
    pub fn fail_all(&self) -> usize {
        let pending = core::mem::take(
            &mut *self.map.lock().unwrap_or_else(PoisonError::into_inner),
        );
        let n = pending.len();
        for (_, sink) in pending {
            sink.fail(Error::ConnectionLost);
        }
        n
    }

    /// Number of pending requests.
    pub fn len(&self) -> usize {
        self.map.lock().unwrap_or_else(PoisonError::into_inner).len()
    }
}
