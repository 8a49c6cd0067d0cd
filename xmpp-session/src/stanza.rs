// Copyright (c) 2024 Jonas Schäfer <jonas@zombofant.net>
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

use core::fmt;

use rand::{thread_rng, Rng};
use xmpp_parsers::{iq::Iq, jid::Jid, message::Message, presence::Presence};

use crate::error::MalformedStanza;
use crate::minidom::Element;

pub(crate) fn make_id() -> String {
    let id: u64 = thread_rng().gen();
    format!("{}", id)
}

/// The three kinds of XMPP stanzas.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StanzaKind {
    /// `<iq/>`
    Iq,
    /// `<message/>`
    Message,
    /// `<presence/>`
    Presence,
}

impl StanzaKind {
    /// Map an element name to a stanza kind.
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "iq" => Some(Self::Iq),
            "message" => Some(Self::Message),
            "presence" => Some(Self::Presence),
            _ => None,
        }
    }
}

impl fmt::Display for StanzaKind {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(match self {
            Self::Iq => "iq",
            Self::Message => "message",
            Self::Presence => "presence",
        })
    }
}

/// A stanza sent/received over the stream.
#[derive(Debug, Clone)]
pub enum Stanza {
    /// IQ stanza
    Iq(Iq),

    /// Message stanza
    Message(Message),

    /// Presence stanza
    Presence(Presence),
}

impl Stanza {
    /// Assign a random ID to the stanza, if no ID has been assigned yet.
    pub fn ensure_id(&mut self) -> &str {
        match self {
            Self::Iq(iq) => {
                if iq.id.is_empty() {
                    iq.id = make_id();
                }
                &iq.id
            }
            Self::Message(message) => message.id.get_or_insert_with(make_id),
            Self::Presence(presence) => presence.id.get_or_insert_with(make_id),
        }
    }

    /// The kind of this stanza.
    pub fn kind(&self) -> StanzaKind {
        match self {
            Self::Iq(_) => StanzaKind::Iq,
            Self::Message(_) => StanzaKind::Message,
            Self::Presence(_) => StanzaKind::Presence,
        }
    }

    /// The stanza ID, if any.
    pub fn id(&self) -> Option<&str> {
        match self {
            Self::Iq(iq) if iq.id.is_empty() => None,
            Self::Iq(iq) => Some(&iq.id),
            Self::Message(message) => message.id.as_deref(),
            Self::Presence(presence) => presence.id.as_deref(),
        }
    }

    /// The sender address, if any.
    pub fn from(&self) -> Option<&Jid> {
        match self {
            Self::Iq(iq) => iq.from.as_ref(),
            Self::Message(message) => message.from.as_ref(),
            Self::Presence(presence) => presence.from.as_ref(),
        }
    }

    /// The recipient address, if any.
    pub fn to(&self) -> Option<&Jid> {
        match self {
            Self::Iq(iq) => iq.to.as_ref(),
            Self::Message(message) => message.to.as_ref(),
            Self::Presence(presence) => presence.to.as_ref(),
        }
    }
}

impl From<Iq> for Stanza {
    fn from(other: Iq) -> Self {
        Self::Iq(other)
    }
}

impl From<Presence> for Stanza {
    fn from(other: Presence) -> Self {
        Self::Presence(other)
    }
}

impl From<Message> for Stanza {
    fn from(other: Message) -> Self {
        Self::Message(other)
    }
}

impl TryFrom<Stanza> for Message {
    type Error = Stanza;

    fn try_from(other: Stanza) -> Result<Self, Self::Error> {
        match other {
            Stanza::Message(st) => Ok(st),
            other => Err(other),
        }
    }
}

impl TryFrom<Stanza> for Presence {
    type Error = Stanza;

    fn try_from(other: Stanza) -> Result<Self, Self::Error> {
        match other {
            Stanza::Presence(st) => Ok(st),
            other => Err(other),
        }
    }
}

impl TryFrom<Stanza> for Iq {
    type Error = Stanza;

    fn try_from(other: Stanza) -> Result<Self, Self::Error> {
        match other {
            Stanza::Iq(st) => Ok(st),
            other => Err(other),
        }
    }
}

impl From<Stanza> for Element {
    fn from(other: Stanza) -> Self {
        match other {
            Stanza::Iq(st) => st.into(),
            Stanza::Message(st) => st.into(),
            Stanza::Presence(st) => st.into(),
        }
    }
}

/// Parse a stanza from a raw element.
///
/// On failure, the routing attributes which could be read are preserved in
/// the returned [`MalformedStanza`], so that codecs can hand it to the
/// broker for an error reply.
impl TryFrom<Element> for Stanza {
    type Error = MalformedStanza;

    fn try_from(el: Element) -> Result<Self, Self::Error> {
        let mut salvaged = MalformedStanza {
            kind: StanzaKind::from_name(el.name()),
            id: el.attr("id").map(ToOwned::to_owned),
            from: el.attr("from").and_then(|v| v.parse().ok()),
            to: el.attr("to").and_then(|v| v.parse().ok()),
            type_: el.attr("type").map(ToOwned::to_owned),
            reason: String::new(),
        };
        let result = match salvaged.kind {
            Some(StanzaKind::Iq) => Iq::try_from(el).map(Self::Iq).map_err(|e| e.to_string()),
            Some(StanzaKind::Message) => Message::try_from(el)
                .map(Self::Message)
                .map_err(|e| e.to_string()),
            Some(StanzaKind::Presence) => Presence::try_from(el)
                .map(Self::Presence)
                .map_err(|e| e.to_string()),
            None => Err(format!("unknown stanza element <{}/>", el.name())),
        };
        result.map_err(|reason| {
            salvaged.reason = reason;
            salvaged
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use xmpp_parsers::iq::IqType;
    use xmpp_parsers::ping::Ping;

    #[test]
    fn ensure_id_assigns_once() {
        let mut st = Stanza::Iq(Iq {
            from: None,
            to: None,
            id: String::new(),
            payload: IqType::Get(Ping.into()),
        });
        assert_eq!(st.id(), None);
        let id = st.ensure_id().to_owned();
        assert!(!id.is_empty());
        assert_eq!(st.ensure_id(), id);
        assert_eq!(st.id(), Some(id.as_str()));
    }

    #[test]
    fn parse_valid_iq() {
        let el: Element = "<iq xmlns='jabber:client' type='get' id='p1' from='peer@example.com/x'><ping xmlns='urn:xmpp:ping'/></iq>"
            .parse()
            .unwrap();
        let st = Stanza::try_from(el).unwrap();
        assert_eq!(st.kind(), StanzaKind::Iq);
        assert_eq!(st.id(), Some("p1"));
        assert_eq!(
            st.from().map(|j| j.to_string()),
            Some("peer@example.com/x".to_owned())
        );
    }

    #[test]
    fn parse_salvages_routing_information() {
        let el: Element =
            "<iq xmlns='jabber:client' type='get' id='q1' from='peer@example.com/x'/>"
                .parse()
                .unwrap();
        let err = Stanza::try_from(el).unwrap_err();
        assert_eq!(err.kind, Some(StanzaKind::Iq));
        assert_eq!(err.id.as_deref(), Some("q1"));
        assert_eq!(err.type_.as_deref(), Some("get"));
        assert!(err.from.is_some());
        assert!(err.is_replyable());
    }

    #[test]
    fn parse_rejects_unknown_element() {
        let el: Element = "<foo xmlns='jabber:client' id='x'/>".parse().unwrap();
        let err = Stanza::try_from(el).unwrap_err();
        assert_eq!(err.kind, None);
        assert!(!err.is_replyable());
    }
}
