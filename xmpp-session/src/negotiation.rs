// Copyright (c) 2019 Emmanuel Gil Peyrot <linkmauve@linkmauve.fr>
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Post-authentication stream setup: resumption, resource binding, legacy
//! session establishment and enabling stream management.

use std::io;

use futures::{SinkExt, StreamExt};

use xmpp_parsers::{
    bind::{BindQuery, BindResponse},
    iq::{Iq, IqType},
    jid::{FullJid, Jid},
    sm,
    stanza_error::DefinedCondition,
    stream_error::ReceivedStreamError,
};

use crate::broker::{SmResumption, StanzaBroker};
use crate::connect::{SessionRequirement, StreamFeatures};
use crate::error::{Error, ProtocolError};
use crate::minidom::Element;
use crate::xmlstream::{ReadError, SmNonza, XmppStream, XmppStreamElement};
use crate::Stanza;

pub(crate) static BIND_REQ_ID: &str = "resource-bind";
pub(crate) static SESSION_REQ_ID: &str = "legacy-session";
static SESSION_NS: &str = "urn:ietf:params:xml:ns:xmpp-session";

/// Result of a resumption attempt.
#[derive(Debug)]
pub(crate) enum ResumeOutcome {
    /// The previous session continues on this stream.
    Resumed,

    /// The previous session is gone, for the given reason. The stream is
    /// still usable for a fresh session.
    Failed(String),
}

enum Awaited {
    Iq(Iq),
    Sm(SmNonza),
}

/// Drives the negotiation on a freshly authenticated stream.
///
/// Stanzas the peer sends before negotiation completes are collected and
/// must be handed to the broker as backlog.
pub(crate) struct Negotiator<'a> {
    stream: &'a mut XmppStream,
    broker: &'a StanzaBroker,
    backlog: Vec<Stanza>,
}

impl<'a> Negotiator<'a> {
    pub fn new(stream: &'a mut XmppStream, broker: &'a StanzaBroker) -> Self {
        Self {
            stream,
            broker,
            backlog: Vec::new(),
        }
    }

    pub fn into_backlog(self) -> Vec<Stanza> {
        self.backlog
    }

    /// Read until an IQ response with `awaiting_id` or a stream management
    /// nonza arrives.
    async fn recv(&mut self, awaiting_id: Option<&str>) -> Result<Awaited, Error> {
        loop {
            let item = self.stream.next().await.unwrap_or_else(|| {
                Err(ReadError::HardError(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "eof before stream footer",
                )))
            });
            match item {
                Ok(XmppStreamElement::Stanza(Stanza::Iq(iq)))
                    if Some(iq.id.as_str()) == awaiting_id
                        && matches!(iq.payload, IqType::Result(_) | IqType::Error(_)) =>
                {
                    return Ok(Awaited::Iq(iq))
                }
                Ok(XmppStreamElement::Stanza(stanza)) => {
                    log::debug!("Keeping {} received during negotiation for later.", stanza.kind());
                    self.backlog.push(stanza);
                }
                Ok(XmppStreamElement::SM(nonza)) => return Ok(Awaited::Sm(nonza)),
                Ok(XmppStreamElement::StreamError(e)) => {
                    log::debug!("Received stream error during negotiation: {e}");
                    return Err(io::Error::other(ReceivedStreamError(e)).into());
                }
                Err(ReadError::Malformed(m)) => {
                    if awaiting_id.is_some() && m.id.as_deref() == awaiting_id {
                        log::warn!("Response to negotiation request is malformed: {m}");
                        return Err(ProtocolError::InvalidBindResponse.into());
                    }
                    log::warn!("Ignoring malformed stanza during negotiation: {m}");
                }
                Err(ReadError::HardError(e)) => return Err(e.into()),
                Err(ReadError::StreamFooterReceived) => {
                    return Err(io::Error::new(
                        io::ErrorKind::ConnectionAborted,
                        "stream footer received during negotiation",
                    )
                    .into())
                }
            }
        }
    }

    /// Ask the peer to resume the previous session.
    ///
    /// On success the broker's unacknowledged stanzas have been requeued.
    pub async fn try_resume(&mut self, info: &SmResumption) -> Result<ResumeOutcome, Error> {
        log::debug!("Attempting to resume stream {:?} at h = {}", info.id, info.h);
        self.stream
            .send(
                sm::Resume {
                    previd: sm::StreamId(info.id.clone()),
                    h: info.h,
                }
                .into(),
            )
            .await?;
        loop {
            match self.recv(None).await? {
                Awaited::Sm(SmNonza::Resumed(sm::Resumed { previd, h })) => {
                    if previd.0 != info.id {
                        return Ok(ResumeOutcome::Failed(format!(
                            "peer resumed stream {:?} instead of {:?}",
                            previd.0, info.id
                        )));
                    }
                    return match self.broker.resume_sm(h) {
                        Ok(()) => Ok(ResumeOutcome::Resumed),
                        Err(e) => {
                            log::warn!("Resumption is inconsistent with local state: {e}");
                            Ok(ResumeOutcome::Failed(e.to_string()))
                        }
                    };
                }
                Awaited::Sm(SmNonza::Failed(sm::Failed { h, error })) => {
                    log::debug!("Peer refused resumption (h = {h:?}, error = {error:?}).");
                    return Ok(ResumeOutcome::Failed("peer refused resumption".to_owned()));
                }
                Awaited::Sm(other) => {
                    log::warn!("Ignoring {other:?} while waiting for <resumed/>.");
                }
                Awaited::Iq(iq) => {
                    log::warn!("Ignoring unexpected IQ {:?} during negotiation.", iq.id);
                }
            }
        }
    }

    /// Set up a fresh session: bind, legacy session if required and
    /// stream management if offered.
    pub async fn establish(
        &mut self,
        jid: &Jid,
        features: &StreamFeatures,
    ) -> Result<FullJid, Error> {
        if !features.can_bind {
            return Err(ProtocolError::NoBindFeature.into());
        }
        let bound = self.bind(jid.resource().map(|r| r.as_str().to_owned())).await?;
        log::debug!("Bound to {bound}");

        match features.session {
            SessionRequirement::Required => self.session().await?,
            SessionRequirement::Optional | SessionRequirement::NotOffered => (),
        }

        if features.stream_management {
            self.enable_sm().await?;
        } else {
            log::debug!("Peer does not offer stream management.");
            self.broker.disable_sm()?;
        }
        Ok(bound)
    }

    async fn request(&mut self, id: &str, payload: Element) -> Result<Iq, Error> {
        let iq = Iq {
            from: None,
            to: None,
            id: id.to_owned(),
            payload: IqType::Set(payload),
        };
        self.stream.send(Stanza::Iq(iq).into()).await?;
        loop {
            if let Awaited::Iq(iq) = self.recv(Some(id)).await? {
                return Ok(iq);
            }
        }
    }

    async fn bind(&mut self, resource: Option<String>) -> Result<FullJid, Error> {
        let response = self
            .request(BIND_REQ_ID, BindQuery::new(resource).into())
            .await?;
        match response.payload {
            IqType::Result(Some(payload)) => match BindResponse::try_from(payload) {
                Ok(v) => Ok(v.into()),
                Err(e) => {
                    log::warn!("Failed to parse bind response: {e}");
                    Err(ProtocolError::InvalidBindResponse.into())
                }
            },
            IqType::Error(e) if e.defined_condition == DefinedCondition::Conflict => {
                Err(ProtocolError::ResourceConflict.into())
            }
            IqType::Error(e) => Err(ProtocolError::BindRefused(e).into()),
            _ => Err(ProtocolError::InvalidBindResponse.into()),
        }
    }

    async fn session(&mut self) -> Result<(), Error> {
        let response = self
            .request(SESSION_REQ_ID, Element::builder("session", SESSION_NS).build())
            .await?;
        match response.payload {
            IqType::Error(e) => Err(ProtocolError::SessionRefused(e).into()),
            _ => Ok(()),
        }
    }

    async fn enable_sm(&mut self) -> Result<(), Error> {
        self.stream
            .send(sm::Enable::new().with_resume().into())
            .await?;
        loop {
            match self.recv(None).await? {
                Awaited::Sm(SmNonza::Enabled(enabled)) => {
                    log::debug!(
                        "Stream management enabled (resumable: {}).",
                        enabled.resume == sm::ResumeAttr::True && enabled.id.is_some()
                    );
                    return self.broker.enable_sm(enabled);
                }
                Awaited::Sm(SmNonza::Failed(_)) => {
                    log::warn!("Peer refused to enable stream management, continuing without.");
                    return self.broker.disable_sm();
                }
                Awaited::Sm(other) => {
                    log::warn!("Ignoring {other:?} while waiting for <enabled/>.");
                }
                Awaited::Iq(iq) => {
                    log::warn!("Ignoring unexpected IQ {:?} during negotiation.", iq.id);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use xmpp_parsers::{
        message::Message,
        stanza_error::{ErrorType, StanzaError},
        stream_error::{self, StreamError},
    };

    use crate::broker::BrokerConfig;
    use crate::xmlstream::mock;

    fn features(sm: bool) -> StreamFeatures {
        StreamFeatures {
            stream_management: sm,
            can_bind: true,
            session: SessionRequirement::NotOffered,
        }
    }

    fn jid() -> Jid {
        Jid::new("me@example.com/desk").unwrap()
    }

    #[tokio::test]
    async fn fresh_session_with_stream_management() {
        let broker = StanzaBroker::new(BrokerConfig::tight());
        let (mut stream, mut peer) = mock::pair();
        let server = tokio::spawn(async move {
            let resource = peer.serve_bind("me@example.com/desk-1").await;
            assert_eq!(resource.as_deref(), Some("desk"));
            peer.send_stanza(Message::new(None));
            peer.serve_enable(Some("sm-1")).await;
            peer
        });

        let mut negotiator = Negotiator::new(&mut stream, &broker);
        let bound = negotiator.establish(&jid(), &features(true)).await.unwrap();
        assert_eq!(bound.to_string(), "me@example.com/desk-1");
        assert_eq!(negotiator.into_backlog().len(), 1);
        assert_eq!(broker.sm_resume_info().unwrap().id, "sm-1");
        server.await.unwrap();
    }

    #[tokio::test]
    async fn sm_refusal_is_not_fatal() {
        let broker = StanzaBroker::new(BrokerConfig::tight());
        let (mut stream, mut peer) = mock::pair();
        let server = tokio::spawn(async move {
            peer.serve_bind("me@example.com/desk").await;
            peer.serve_enable(None).await;
        });
        let mut negotiator = Negotiator::new(&mut stream, &broker);
        negotiator.establish(&jid(), &features(true)).await.unwrap();
        assert!(!broker.sm_enabled().unwrap());
        server.await.unwrap();
    }

    #[tokio::test]
    async fn resource_conflict_is_a_protocol_error() {
        let broker = StanzaBroker::new(BrokerConfig::tight());
        let (mut stream, mut peer) = mock::pair();
        tokio::spawn(async move {
            let request = peer.recv_iq().await;
            peer.send_stanza(Iq {
                from: None,
                to: None,
                id: request.id,
                payload: IqType::Error(StanzaError::new(
                    ErrorType::Cancel,
                    DefinedCondition::Conflict,
                    "en",
                    "resource in use",
                )),
            });
            peer
        });
        let mut negotiator = Negotiator::new(&mut stream, &broker);
        let err = negotiator
            .establish(&jid(), &features(false))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Protocol(ProtocolError::ResourceConflict)));
        assert!(!err.is_transient());
    }

    #[tokio::test]
    async fn empty_bind_result_is_invalid() {
        let broker = StanzaBroker::new(BrokerConfig::tight());
        let (mut stream, mut peer) = mock::pair();
        tokio::spawn(async move {
            let request = peer.recv_iq().await;
            peer.send_stanza(Iq {
                from: None,
                to: None,
                id: request.id,
                payload: IqType::Result(None),
            });
            peer
        });
        let mut negotiator = Negotiator::new(&mut stream, &broker);
        assert!(matches!(
            negotiator.establish(&jid(), &features(false)).await,
            Err(Error::Protocol(ProtocolError::InvalidBindResponse))
        ));
    }

    #[tokio::test]
    async fn stream_error_during_negotiation_is_transient() {
        let broker = StanzaBroker::new(BrokerConfig::tight());
        let (mut stream, peer) = mock::pair();
        peer.send(StreamError {
            condition: stream_error::DefinedCondition::SystemShutdown,
            text: None,
            application_specific: vec![],
        });
        let mut negotiator = Negotiator::new(&mut stream, &broker);
        let err = negotiator
            .establish(&jid(), &features(false))
            .await
            .unwrap_err();
        assert!(err.is_transient());
    }

    #[tokio::test]
    async fn resumption_requeues_and_refusal_is_reported() {
        let broker = StanzaBroker::new(BrokerConfig::tight());
        broker
            .enable_sm(sm::Enabled {
                id: Some(sm::StreamId("sm-1".to_owned())),
                resume: sm::ResumeAttr::True,
                location: None,
                max: None,
            })
            .unwrap();
        let info = broker.sm_resume_info().unwrap();

        let (mut stream, mut peer) = mock::pair();
        let server = tokio::spawn(async move {
            match peer.recv().await {
                XmppStreamElement::SM(SmNonza::Resume(sm::Resume { previd, h })) => {
                    assert_eq!(previd.0, "sm-1");
                    assert_eq!(h, 0);
                }
                other => panic!("expected <resume/>, got {other:?}"),
            }
            peer.send(sm::Failed {
                h: None,
                error: None,
            });
            peer
        });
        let mut negotiator = Negotiator::new(&mut stream, &broker);
        assert!(matches!(
            negotiator.try_resume(&info).await.unwrap(),
            ResumeOutcome::Failed(_)
        ));
        server.await.unwrap();

        let (mut stream, peer) = mock::pair();
        peer.send(sm::Resumed {
            previd: sm::StreamId("sm-1".to_owned()),
            h: 0,
        });
        let mut negotiator = Negotiator::new(&mut stream, &broker);
        assert!(matches!(
            negotiator.try_resume(&info).await.unwrap(),
            ResumeOutcome::Resumed
        ));
    }
}
