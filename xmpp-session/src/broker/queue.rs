// Copyright (c) 2019 Emmanuel Gil Peyrot <linkmauve@linkmauve.fr>
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

use core::cmp::Ordering;
use core::fmt;
use std::collections::VecDeque;
use std::io;

use tokio::sync::{mpsc, watch};

use crate::Stanza;

/// An [`io::Error`] reduced to something which can be cloned into every
/// observer of a stanza.
#[derive(Debug, Clone)]
pub struct OpaqueIoError {
    kind: io::ErrorKind,
    message: String,
}

impl OpaqueIoError {
    /// The kind of the original error.
    pub fn kind(&self) -> io::ErrorKind {
        self.kind
    }

    /// Reconstruct an [`io::Error`] from this.
    pub fn into_io_error(self) -> io::Error {
        io::Error::new(self.kind, self.message)
    }
}

impl From<&io::Error> for OpaqueIoError {
    fn from(other: &io::Error) -> Self {
        Self {
            kind: other.kind(),
            message: other.to_string(),
        }
    }
}

impl fmt::Display for OpaqueIoError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(&self.message)
    }
}

impl core::error::Error for OpaqueIoError {}

/// The five stages of stanza transmission.
#[derive(Debug, PartialEq, Eq, PartialOrd, Ord, Clone, Copy)]
pub enum StanzaStage {
    /// The stanza is in the transmit queue, but has not been written to the
    /// stream yet.
    Queued,

    /// The stanza was written to the stream.
    Sent,

    /// The stanza has been acked by the peer using XEP-0198.
    ///
    /// **Note:** This state is only ever reached on streams where XEP-0198
    /// was succesfully negotiated.
    Acked,

    /// Stanza transmission failed.
    Failed,

    /// The stanza was removed from tracking without being acknowledged,
    /// for instance because the session it was sent on was destroyed or
    /// because the queue was drained.
    Dropped,
}

impl From<&StanzaState> for StanzaStage {
    fn from(other: &StanzaState) -> Self {
        match other {
            StanzaState::Queued => Self::Queued,
            StanzaState::Sent => Self::Sent,
            StanzaState::Acked => Self::Acked,
            StanzaState::Failed { .. } => Self::Failed,
            StanzaState::Dropped => Self::Dropped,
        }
    }
}

impl PartialEq<StanzaStage> for StanzaState {
    fn eq(&self, other: &StanzaStage) -> bool {
        StanzaStage::from(self).eq(other)
    }
}

impl PartialOrd<StanzaStage> for StanzaState {
    fn partial_cmp(&self, other: &StanzaStage) -> Option<Ordering> {
        StanzaStage::from(self).partial_cmp(other)
    }
}

/// State of a stanza in transit to the peer.
#[derive(Debug, Clone)]
pub enum StanzaState {
    /// The stanza has been enqueued in the local queue but not sent yet.
    Queued,

    /// The stanza has been written to the stream, but there is no proof
    /// that it has been received by the server yet.
    Sent,

    /// Confirmation that the stanza has been seen by the server has been
    /// received.
    Acked,

    /// Sending the stanza has failed in a non-recoverable manner.
    Failed {
        /// The error which caused the sending to fail.
        error: OpaqueIoError,
    },

    /// The stanza was dropped from tracking.
    Dropped,
}

/// Track stanza transmission through the
/// [`StanzaBroker`][`super::StanzaBroker`] up to the peer.
#[derive(Clone)]
pub struct StanzaToken {
    inner: watch::Receiver<StanzaState>,
}

impl StanzaToken {
    /// Wait for the stanza transmission to reach the given state.
    ///
    /// If the stanza is removed from tracking before that state is reached,
    /// `None` is returned.
    pub async fn wait_for(&mut self, state: StanzaStage) -> Option<StanzaState> {
        self.inner
            .wait_for(|st| *st >= state)
            .await
            .map(|x| x.clone())
            .ok()
    }

    pub(crate) fn into_stream(self) -> tokio_stream::wrappers::WatchStream<StanzaState> {
        tokio_stream::wrappers::WatchStream::new(self.inner)
    }

    /// Read the current transmission state.
    pub fn state(&self) -> StanzaState {
        self.inner.borrow().clone()
    }
}

impl fmt::Debug for StanzaToken {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("StanzaToken")
            .field("state", &*self.inner.borrow())
            .finish()
    }
}

pub(crate) struct QueueEntry {
    pub stanza: Box<Stanza>,
    pub token: watch::Sender<StanzaState>,
    /// Generated by the broker in response to an inbound stanza.
    pub is_reply: bool,
}

impl QueueEntry {
    pub fn reply(st: Box<Stanza>) -> Self {
        let mut entry = Self::tracked(st).0;
        entry.is_reply = true;
        entry
    }

    pub fn tracked(st: Box<Stanza>) -> (Self, StanzaToken) {
        let (tx, rx) = watch::channel(StanzaState::Queued);
        let token = StanzaToken { inner: rx };
        (
            QueueEntry {
                stanza: st,
                token: tx,
                is_reply: false,
            },
            token,
        )
    }

    pub fn set_state(&self, state: StanzaState) {
        self.token.send_replace(state);
    }
}

/// A transmit queue coupled to an unbounded [`mpsc::UnboundedReceiver`].
///
/// Items can be prepended to the front, which is used for retransmitting
/// unacknowledged stanzas after resumption and for putting back a stanza
/// whose write failed.
pub(crate) struct TransmitQueue {
    inner: mpsc::UnboundedReceiver<QueueEntry>,
    front: VecDeque<QueueEntry>,
}

impl TransmitQueue {
    /// Create a new mpsc channel and wrap the receiving side in a
    /// transmission queue
    pub fn channel() -> (mpsc::UnboundedSender<QueueEntry>, Self) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            tx,
            Self {
                inner: rx,
                front: VecDeque::new(),
            },
        )
    }

    /// Wait for the next item to transmit.
    ///
    /// Cancel safe: if the future is dropped, no item is lost.
    pub async fn next(&mut self) -> Option<QueueEntry> {
        if let Some(entry) = self.front.pop_front() {
            return Some(entry);
        }
        self.inner.recv().await
    }

    /// Take the next item if one is available right away.
    pub fn try_next(&mut self) -> Option<QueueEntry> {
        self.front
            .pop_front()
            .or_else(|| self.inner.try_recv().ok())
    }

    /// Requeue a sequence of items to the front of the queue.
    ///
    /// The first item from `iter` is going to be the next item yielded.
    pub fn requeue_all<I: IntoIterator<Item = QueueEntry>>(&mut self, iter: I) {
        let mut items: VecDeque<QueueEntry> = iter.into_iter().collect();
        if items.is_empty() {
            return;
        }
        items.append(&mut self.front);
        self.front = items;
    }

    /// Remove every queued item, in transmission order.
    pub fn drain(&mut self) -> Vec<QueueEntry> {
        let mut result: Vec<QueueEntry> = self.front.drain(..).collect();
        while let Ok(entry) = self.inner.try_recv() {
            result.push(entry);
        }
        self.front.shrink_to_fit();
        result
    }

    /// Number of items in the queue.
    pub fn len(&self) -> usize {
        self.front.len() + self.inner.len()
    }
}
