// Copyright (c) 2019 Emmanuel Gil Peyrot <linkmauve@linkmauve.fr>
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

use core::fmt;
use std::collections::{vec_deque, VecDeque};

use xmpp_parsers::{
    sm,
    stream_error::{DefinedCondition, StreamError},
};

use super::queue::{QueueEntry, StanzaState};
use crate::error::ProtocolError;

#[derive(Debug, Clone)]
pub(crate) enum SmResumeInfo {
    NotResumable,
    Resumable {
        /// XEP-0198 stream ID
        id: String,

        /// Preferred address for resumption as indicated by the peer.
        location: Option<String>,
    },
}

/// Snapshot of what is needed to attempt resumption of a session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SmResumption {
    /// XEP-0198 stream ID
    pub id: String,

    /// Number of stanzas we have handled so far
    pub h: u32,

    /// Preferred address (`host:port`) for resumption
    pub location: Option<String>,

    /// Resumption timeout in seconds announced by the peer
    pub max: Option<u32>,
}

/// State for stream management
pub(crate) struct SmState {
    /// Last value seen from the remote stanza counter.
    outbound_base: u32,

    /// Counter for received stanzas
    inbound_ctr: u32,

    /// Information about resumability of the stream
    resumption: SmResumeInfo,

    /// Maximum resumption time announced by the peer.
    max: Option<u32>,

    /// Unacked stanzas in the order they were sent
    unacked_stanzas: VecDeque<QueueEntry>,
}

impl fmt::Debug for SmState {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("SmState")
            .field("outbound_base", &self.outbound_base)
            .field("inbound_ctr", &self.inbound_ctr)
            .field("resumption", &self.resumption)
            .field("len(unacked_stanzas)", &self.unacked_stanzas.len())
            .finish()
    }
}

#[derive(Debug, PartialEq, Eq)]
pub(crate) struct RemoteAckedMoreStanzas {
    local_base: u32,
    queue_len: u32,
    remote_ctr: u32,
}

impl RemoteAckedMoreStanzas {
    fn send_count(&self) -> u32 {
        self.local_base.wrapping_add(self.queue_len)
    }
}

impl From<RemoteAckedMoreStanzas> for ProtocolError {
    fn from(other: RemoteAckedMoreStanzas) -> Self {
        ProtocolError::HandledCountTooHigh {
            h: other.remote_ctr,
            send_count: other.send_count(),
        }
    }
}

impl From<&RemoteAckedMoreStanzas> for StreamError {
    fn from(other: &RemoteAckedMoreStanzas) -> Self {
        StreamError {
            condition: DefinedCondition::UndefinedCondition,
            text: Some((
                None,
                format!(
                    "You acknowledged {} stanza(s), while I only sent {} so far.",
                    other.remote_ctr,
                    other.send_count()
                ),
            )),
            application_specific: vec![],
        }
    }
}

impl fmt::Display for RemoteAckedMoreStanzas {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "remote acked more stanzas than we sent: remote counter = {}. queue covers range {}..<{}",
            self.remote_ctr,
            self.local_base,
            self.send_count()
        )
    }
}

impl SmState {
    /// Mark a stanza as sent and keep it in the stream management queue.
    pub fn enqueue(&mut self, entry: QueueEntry) {
        // The counters wrap at 2^32 and RFC 1982 arithmetic treats
        // differences above half the number space as negative, so a longer
        // queue would make acks ambiguous.
        const MAX_QUEUE_SIZE: usize = (u32::MAX / 2 - 1) as usize;
        if self.unacked_stanzas.len() >= MAX_QUEUE_SIZE {
            panic!("Too many pending stanzas.");
        }

        entry.set_state(StanzaState::Sent);
        self.unacked_stanzas.push_back(entry);
        log::trace!(
            "Stored stanza in SmState. We are now at {} unacked stanzas.",
            self.unacked_stanzas.len()
        );
    }

    /// Process resumption.
    ///
    /// Updates the internal state according to the received remote counter.
    /// Returns an iterator which yields the queue entries which need to be
    /// retransmitted, oldest first.
    pub fn resume(
        &mut self,
        h: u32,
    ) -> Result<vec_deque::Drain<'_, QueueEntry>, RemoteAckedMoreStanzas> {
        self.remote_acked(h)?;
        // The peer has not seen any of the leftover stanzas: they got lost
        // in the previous unclean disconnect.
        for entry in self.unacked_stanzas.iter() {
            entry.set_state(StanzaState::Queued);
        }
        // Retransmissions are counted again when they are sent.
        Ok(self.unacked_stanzas.drain(..))
    }

    /// Process remote `<a/>`
    ///
    /// An ack below the last seen counter is ignored. An ack covering more
    /// stanzas than were sent is an error.
    pub fn remote_acked(&mut self, h: u32) -> Result<(), RemoteAckedMoreStanzas> {
        log::debug!("remote_acked: {self:?}::remote_acked({h})");
        // XEP-0198 specifies that counters are mod 2^32, which is handy when
        // you use u32 data types :-).
        let to_drop = h.wrapping_sub(self.outbound_base);
        if to_drop == 0 {
            log::trace!("remote_acked: no stanzas to drop");
            return Ok(());
        }
        if to_drop > u32::MAX / 2 {
            // A wrapping difference greater than half the number space is a
            // negative difference: h went backwards.
            log::warn!(
                "remote_acked: peer acked less stanzas than before (h = {h}, base = {}). Ignoring.",
                self.outbound_base
            );
            return Ok(());
        }
        let to_drop = to_drop as usize;
        if to_drop > self.unacked_stanzas.len() {
            return Err(RemoteAckedMoreStanzas {
                local_base: self.outbound_base,
                queue_len: self.unacked_stanzas.len() as u32,
                remote_ctr: h,
            });
        }
        for entry in self.unacked_stanzas.drain(..to_drop) {
            entry.set_state(StanzaState::Acked);
        }
        self.outbound_base = h;
        log::debug!("remote_acked: remote acked {to_drop} stanzas");
        Ok(())
    }

    /// Count a stanza received from the peer.
    pub fn count_inbound(&mut self) {
        self.inbound_ctr = self.inbound_ctr.wrapping_add(1);
    }

    /// Get the current inbound counter.
    #[inline(always)]
    pub fn inbound_ctr(&self) -> u32 {
        self.inbound_ctr
    }

    /// Number of stanzas sent but not yet acknowledged.
    pub fn unacked_len(&self) -> usize {
        self.unacked_stanzas.len()
    }

    /// Get the info necessary for resumption.
    ///
    /// Returns None if the peer did not allow resumption.
    pub fn resume_info(&self) -> Option<SmResumption> {
        match self.resumption {
            SmResumeInfo::Resumable {
                ref id,
                ref location,
            } => Some(SmResumption {
                id: id.clone(),
                h: self.inbound_ctr,
                location: location.clone(),
                max: self.max,
            }),
            SmResumeInfo::NotResumable => None,
        }
    }

    /// Drop all unacknowledged stanzas.
    pub fn discard(self) {
        for entry in self.unacked_stanzas {
            entry.set_state(StanzaState::Dropped);
        }
    }
}

/// Initialize stream management state
impl From<sm::Enabled> for SmState {
    fn from(other: sm::Enabled) -> Self {
        let resumption = if other.resume == sm::ResumeAttr::True {
            match other.id {
                Some(id) => SmResumeInfo::Resumable {
                    location: other.location,
                    id: id.0,
                },
                None => {
                    log::warn!("peer replied with <enable resume='true'/>, but without an ID! cannot make this stream resumable.");
                    SmResumeInfo::NotResumable
                }
            }
        } else {
            SmResumeInfo::NotResumable
        };

        Self {
            outbound_base: 0,
            inbound_ctr: 0,
            resumption,
            max: other.max,
            unacked_stanzas: VecDeque::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::broker::queue::{StanzaStage, StanzaToken};
    use xmpp_parsers::presence::Presence;

    fn resumable() -> SmState {
        sm::Enabled {
            id: Some(sm::StreamId("sm-1".to_owned())),
            resume: sm::ResumeAttr::True,
            location: None,
            max: Some(300),
        }
        .into()
    }

    fn send(sm: &mut SmState, id: &str) -> StanzaToken {
        let mut presence = Presence::available();
        presence.id = Some(id.to_owned());
        let (entry, token) = QueueEntry::tracked(Box::new(presence.into()));
        sm.enqueue(entry);
        token
    }

    #[test]
    fn acks_release_stanzas_in_order() {
        let mut sm = resumable();
        let t1 = send(&mut sm, "1");
        let t2 = send(&mut sm, "2");
        let t3 = send(&mut sm, "3");
        assert_eq!(t1.state(), StanzaStage::Sent);

        sm.remote_acked(2).unwrap();
        assert_eq!(t1.state(), StanzaStage::Acked);
        assert_eq!(t2.state(), StanzaStage::Acked);
        assert_eq!(t3.state(), StanzaStage::Sent);
        assert_eq!(sm.unacked_len(), 1);

        // Repeated and backwards acks are harmless.
        sm.remote_acked(2).unwrap();
        sm.remote_acked(1).unwrap();
        assert_eq!(sm.unacked_len(), 1);
    }

    #[test]
    fn ack_beyond_sent_is_rejected() {
        let mut sm = resumable();
        send(&mut sm, "1");
        let err = sm.remote_acked(5).unwrap_err();
        assert_eq!(
            ProtocolError::from(err).to_string(),
            "peer acked 5 stanzas, but only 1 were sent"
        );
        assert_eq!(sm.unacked_len(), 1);
    }

    #[test]
    fn ack_wraps_around() {
        let mut sm = resumable();
        sm.outbound_base = u32::MAX - 1;
        let t1 = send(&mut sm, "1");
        let t2 = send(&mut sm, "2");
        let t3 = send(&mut sm, "3");
        sm.remote_acked(1).unwrap();
        assert_eq!(t1.state(), StanzaStage::Acked);
        assert_eq!(t2.state(), StanzaStage::Acked);
        assert_eq!(t3.state(), StanzaStage::Acked);
        assert_eq!(sm.unacked_len(), 0);
    }

    #[test]
    fn resume_returns_unacked_tail() {
        let mut sm = resumable();
        for id in ["1", "2", "3"] {
            send(&mut sm, id);
        }
        let drained: Vec<_> = sm.resume(2).unwrap().collect();
        assert_eq!(drained.len(), 1);
        assert_eq!(drained[0].stanza.id(), Some("3"));
        assert_eq!(sm.unacked_len(), 0);
    }

    #[test]
    fn resume_info_tracks_inbound_counter() {
        let mut sm = resumable();
        sm.count_inbound();
        sm.count_inbound();
        let info = sm.resume_info().unwrap();
        assert_eq!(info.id, "sm-1");
        assert_eq!(info.h, 2);
        assert_eq!(info.max, Some(300));

        let plain: SmState = sm::Enabled {
            id: None,
            resume: sm::ResumeAttr::True,
            location: None,
            max: None,
        }
        .into();
        assert!(plain.resume_info().is_none());
    }
}
