// Copyright (c) 2026 xmpp-rs contributors.
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

use alloc::sync::Arc;
use core::error::Error as StdError;
use core::fmt;
use std::collections::HashMap;

use futures::future::BoxFuture;
use xmpp_parsers::{
    message::{Message, MessageType},
    presence::{Presence, Type as PresenceType},
    stanza_error::StanzaError,
};

use crate::{jid::Jid, minidom::Element, Error};

/// The two kinds of IQ requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IqRequestType {
    /// `type="get"`
    Get,
    /// `type="set"`
    Set,
}

/// Identifies an IQ payload by its qualified element name.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PayloadKind {
    /// XML namespace of the payload element
    pub namespace: String,
    /// Local name of the payload element
    pub name: String,
}

impl PayloadKind {
    /// Create a payload kind from its namespace and name.
    pub fn new<N: Into<String>, L: Into<String>>(namespace: N, name: L) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }

    /// The payload kind of an element.
    pub fn of(el: &Element) -> Self {
        Self {
            namespace: el.ns(),
            name: el.name().to_owned(),
        }
    }
}

impl fmt::Display for PayloadKind {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{{{}}}{}", self.namespace, self.name)
    }
}

/// An inbound IQ request as handed to a request handler.
#[derive(Debug, Clone)]
pub struct IncomingIq {
    /// Requesting entity
    pub from: Option<Jid>,
    /// Addressee, usually our own JID
    pub to: Option<Jid>,
    /// Request ID, echoed in the reply
    pub id: String,
    /// Request type
    pub type_: IqRequestType,
    /// Request payload
    pub payload: Element,
}

/// Failure of an IQ request handler.
///
/// The broker turns each variant into an error reply to the requester.
#[derive(Debug)]
pub enum HandlerError {
    /// Reply with exactly this stanza error.
    Stanza(StanzaError),

    /// The request payload could not be parsed; replied to with
    /// `bad-request`.
    Malformed(xso::error::Error),

    /// Any other failure; replied to with `internal-server-error`.
    Other(Box<dyn StdError + Send + Sync>),
}

impl fmt::Display for HandlerError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::Stanza(e) => write!(f, "stanza error: {:?}", e.defined_condition),
            Self::Malformed(e) => write!(f, "malformed request: {e}"),
            Self::Other(e) => write!(f, "{e}"),
        }
    }
}

impl StdError for HandlerError {}

impl From<StanzaError> for HandlerError {
    fn from(other: StanzaError) -> Self {
        Self::Stanza(other)
    }
}

impl From<xso::error::Error> for HandlerError {
    fn from(other: xso::error::Error) -> Self {
        Self::Malformed(other)
    }
}

/// Result type of IQ request handlers: the reply payload, if any.
pub type IqHandlerResult = Result<Option<Element>, HandlerError>;

pub(crate) type IqHandler = Arc<dyn Fn(IncomingIq) -> BoxFuture<'static, IqHandlerResult> + Send + Sync>;
pub(crate) type MessageHandler = Arc<dyn Fn(Message) + Send + Sync>;
pub(crate) type PresenceHandler = Arc<dyn Fn(Presence) + Send + Sync>;

/// Handlers keyed by an optional stanza type and an optional sender, with
/// fallback from the most to the least specific key.
struct FallbackTable<K, H> {
    entries: Vec<(Option<K>, Option<Jid>, H)>,
}

impl<K: PartialEq + fmt::Debug, H: Clone> FallbackTable<K, H> {
    fn new() -> Self {
        Self {
            entries: Vec::new(),
        }
    }

    fn position(&self, type_: Option<&K>, from: Option<&Jid>) -> Option<usize> {
        self.entries
            .iter()
            .position(|(k, f, _)| k.as_ref() == type_ && f.as_ref() == from)
    }

    fn insert(&mut self, type_: Option<K>, from: Option<Jid>, handler: H) -> Result<(), Error> {
        if self.position(type_.as_ref(), from.as_ref()).is_some() {
            return Err(Error::DuplicateHandler(format!(
                "type {:?} from {:?}",
                type_, from
            )));
        }
        self.entries.push((type_, from, handler));
        Ok(())
    }

    fn remove(&mut self, type_: Option<&K>, from: Option<&Jid>) -> bool {
        match self.position(type_, from) {
            Some(idx) => {
                self.entries.swap_remove(idx);
                true
            }
            None => false,
        }
    }

    /// Look up `(type, from)`, then `(type, any)`, then `(any, any)`.
    fn lookup(&self, type_: &K, from: Option<&Jid>) -> Option<H> {
        let mut candidates = Vec::with_capacity(3);
        if from.is_some() {
            candidates.push((Some(type_), from));
        }
        candidates.push((Some(type_), None));
        candidates.push((None, None));
        candidates
            .into_iter()
            .find_map(|(k, f)| self.position(k, f))
            .map(|idx| self.entries[idx].2.clone())
    }
}

/// The broker's handler registrations.
pub(crate) struct DispatchTables {
    iq: HashMap<(IqRequestType, PayloadKind), IqHandler>,
    messages: FallbackTable<MessageType, MessageHandler>,
    presences: FallbackTable<PresenceType, PresenceHandler>,
}

impl DispatchTables {
    pub fn new() -> Self {
        Self {
            iq: HashMap::new(),
            messages: FallbackTable::new(),
            presences: FallbackTable::new(),
        }
    }

    pub fn insert_iq(
        &mut self,
        type_: IqRequestType,
        kind: PayloadKind,
        handler: IqHandler,
    ) -> Result<(), Error> {
        let key = (type_, kind);
        if self.iq.contains_key(&key) {
            return Err(Error::DuplicateHandler(format!("IQ {:?} {}", key.0, key.1)));
        }
        self.iq.insert(key, handler);
        Ok(())
    }

    pub fn remove_iq(&mut self, type_: IqRequestType, kind: &PayloadKind) -> bool {
        self.iq.remove(&(type_, kind.clone())).is_some()
    }

    pub fn lookup_iq(&self, type_: IqRequestType, kind: PayloadKind) -> Option<IqHandler> {
        self.iq.get(&(type_, kind)).cloned()
    }

    pub fn insert_message(
        &mut self,
        type_: Option<MessageType>,
        from: Option<Jid>,
        handler: MessageHandler,
    ) -> Result<(), Error> {
        self.messages.insert(type_, from, handler)
    }

    pub fn remove_message(&mut self, type_: Option<&MessageType>, from: Option<&Jid>) -> bool {
        self.messages.remove(type_, from)
    }

    pub fn lookup_message(&self, message: &Message) -> Option<MessageHandler> {
        self.messages.lookup(&message.type_, message.from.as_ref())
    }

    pub fn insert_presence(
        &mut self,
        type_: Option<PresenceType>,
        from: Option<Jid>,
        handler: PresenceHandler,
    ) -> Result<(), Error> {
        self.presences.insert(type_, from, handler)
    }

    pub fn remove_presence(&mut self, type_: Option<&PresenceType>, from: Option<&Jid>) -> bool {
        self.presences.remove(type_, from)
    }

    pub fn lookup_presence(&self, presence: &Presence) -> Option<PresenceHandler> {
        self.presences
            .lookup(&presence.type_, presence.from.as_ref())
    }
}
