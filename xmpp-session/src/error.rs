// Copyright (c) 2026 xmpp-rs contributors.
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

use sasl::client::MechanismError as SaslMechanismError;
use std::error::Error as StdError;
use std::fmt;
use std::io::Error as IoError;

use crate::{
    jid::{self, Jid},
    parsers::{sasl::DefinedCondition as SaslDefinedCondition, stanza_error::StanzaError},
    StanzaKind,
};

/// Top-level error type
#[derive(Debug)]
pub enum Error {
    /// I/O error on the underlying transport
    Transport(IoError),
    /// Authentication error
    Auth(AuthError),
    /// TLS negotiation error
    Tls(TlsError),
    /// A stanza could not be interpreted
    Malformed(MalformedStanza),
    /// Protocol-level error
    Protocol(ProtocolError),
    /// An operation did not complete within its deadline
    Timeout,
    /// The session the operation was bound to has been destroyed
    ConnectionLost,
    /// The component is already running
    AlreadyRunning,
    /// The component is not in a state which permits the operation
    InvalidState,
    /// A handler for the given key has already been registered
    DuplicateHandler(String),
    /// The service dependency graph contains a cycle
    ServiceCycle(String),
    /// A service failed to initialise
    Service(Box<dyn StdError + Send + Sync>),
    /// Error parsing Jabber-Id
    JidParse(jid::Error),
}

impl Error {
    /// Return true if retrying the failed operation on a fresh connection
    /// may succeed.
    ///
    /// Authentication failures, TLS failures and protocol violations are
    /// permanent: retrying would only fail the same way again.
    pub fn is_transient(&self) -> bool {
        match self {
            Error::Transport(_) | Error::Timeout | Error::ConnectionLost | Error::Malformed(_) => {
                true
            }
            Error::Auth(_)
            | Error::Tls(_)
            | Error::Protocol(_)
            | Error::AlreadyRunning
            | Error::InvalidState
            | Error::DuplicateHandler(_)
            | Error::ServiceCycle(_)
            | Error::Service(_)
            | Error::JidParse(_) => false,
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Error::Transport(e) => write!(fmt, "transport error: {}", e),
            Error::Auth(e) => write!(fmt, "authentication error: {}", e),
            Error::Tls(e) => write!(fmt, "TLS error: {}", e),
            Error::Malformed(e) => write!(fmt, "malformed stanza: {}", e),
            Error::Protocol(e) => write!(fmt, "protocol error: {}", e),
            Error::Timeout => write!(fmt, "timeout"),
            Error::ConnectionLost => write!(fmt, "connection lost"),
            Error::AlreadyRunning => write!(fmt, "already running"),
            Error::InvalidState => write!(fmt, "invalid state"),
            Error::DuplicateHandler(key) => write!(fmt, "handler already registered for {}", key),
            Error::ServiceCycle(path) => write!(fmt, "service dependency cycle: {}", path),
            Error::Service(e) => write!(fmt, "service error: {}", e),
            Error::JidParse(e) => write!(fmt, "jid parse error: {}", e),
        }
    }
}

impl StdError for Error {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        match self {
            Error::Transport(e) => Some(e),
            Error::Auth(e) => Some(e),
            Error::Tls(e) => Some(e),
            Error::Protocol(e) => Some(e),
            Error::Service(e) => Some(&**e),
            Error::JidParse(e) => Some(e),
            _ => None,
        }
    }
}

impl From<IoError> for Error {
    fn from(e: IoError) -> Self {
        Error::Transport(e)
    }
}

impl From<jid::Error> for Error {
    fn from(e: jid::Error) -> Self {
        Error::JidParse(e)
    }
}

impl From<ProtocolError> for Error {
    fn from(e: ProtocolError) -> Self {
        Error::Protocol(e)
    }
}

impl From<AuthError> for Error {
    fn from(e: AuthError) -> Self {
        Error::Auth(e)
    }
}

impl From<TlsError> for Error {
    fn from(e: TlsError) -> Self {
        Error::Tls(e)
    }
}

impl From<MalformedStanza> for Error {
    fn from(e: MalformedStanza) -> Self {
        Error::Malformed(e)
    }
}

/// XMPP protocol-level error
#[derive(Debug)]
pub enum ProtocolError {
    /// Error with expected stanza schema
    Parsers(xso::error::Error),
    /// Another session took over our resource during binding
    ResourceConflict,
    /// The server refused to bind a resource
    BindRefused(StanzaError),
    /// Invalid response to resource binding
    InvalidBindResponse,
    /// The server did not offer resource binding
    NoBindFeature,
    /// The server refused to establish a legacy session
    SessionRefused(StanzaError),
    /// The peer acknowledged stanzas we never sent
    HandledCountTooHigh {
        /// Counter value received from the peer
        h: u32,
        /// Number of stanzas we actually sent
        send_count: u32,
    },
}

impl fmt::Display for ProtocolError {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        match self {
            ProtocolError::Parsers(e) => write!(fmt, "error with expected stanza schema: {}", e),
            ProtocolError::ResourceConflict => write!(fmt, "resource conflict during binding"),
            ProtocolError::BindRefused(e) => {
                write!(fmt, "resource binding refused: {:?}", e.defined_condition)
            }
            ProtocolError::InvalidBindResponse => {
                write!(fmt, "invalid response to resource binding")
            }
            ProtocolError::NoBindFeature => write!(fmt, "server does not offer resource binding"),
            ProtocolError::SessionRefused(e) => {
                write!(fmt, "session establishment refused: {:?}", e.defined_condition)
            }
            ProtocolError::HandledCountTooHigh { h, send_count } => write!(
                fmt,
                "peer acked {} stanzas, but only {} were sent",
                h, send_count
            ),
        }
    }
}

impl StdError for ProtocolError {}

impl From<xso::error::Error> for ProtocolError {
    fn from(e: xso::error::Error) -> Self {
        ProtocolError::Parsers(e)
    }
}

/// Authentication error
#[derive(Debug)]
pub enum AuthError {
    /// No matching SASL mechanism available
    NoMechanism,
    /// Local SASL implementation error
    Sasl(SaslMechanismError),
    /// Failure from server
    Fail(SaslDefinedCondition),
}

impl StdError for AuthError {}

impl fmt::Display for AuthError {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        match self {
            AuthError::NoMechanism => write!(fmt, "no matching SASL mechanism available"),
            AuthError::Sasl(s) => write!(fmt, "local SASL implementation error: {}", s),
            AuthError::Fail(c) => write!(fmt, "failure from the server: {:?}", c),
        }
    }
}

/// TLS negotiation error
#[derive(Debug)]
pub enum TlsError {
    /// The server does not offer TLS, but the connection requires it
    Unavailable,
    /// The TLS handshake failed
    Handshake(IoError),
}

impl StdError for TlsError {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        match self {
            TlsError::Handshake(e) => Some(e),
            TlsError::Unavailable => None,
        }
    }
}

impl fmt::Display for TlsError {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        match self {
            TlsError::Unavailable => write!(fmt, "TLS is not available"),
            TlsError::Handshake(e) => write!(fmt, "TLS handshake failed: {}", e),
        }
    }
}

/// A stanza which could be framed but not interpreted.
///
/// Carries whatever routing information could be salvaged from the raw
/// element, so that the receiver can still send an error reply.
#[derive(Debug, Clone, Default)]
pub struct MalformedStanza {
    /// Kind of the stanza, if the element name was recognised
    pub kind: Option<StanzaKind>,
    /// Value of the `id` attribute
    pub id: Option<String>,
    /// Value of the `from` attribute, if it was a valid JID
    pub from: Option<Jid>,
    /// Value of the `to` attribute, if it was a valid JID
    pub to: Option<Jid>,
    /// Raw value of the `type` attribute
    pub type_: Option<String>,
    /// Human readable description of what went wrong
    pub reason: String,
}

impl MalformedStanza {
    /// Create a new description with only a reason.
    pub fn new<R: Into<String>>(reason: R) -> Self {
        Self {
            reason: reason.into(),
            ..Self::default()
        }
    }

    /// Whether an error reply may be sent for this stanza.
    ///
    /// Error replies must never be sent in response to error stanzas, or
    /// to IQ responses.
    pub fn is_replyable(&self) -> bool {
        let type_ = self.type_.as_deref();
        if type_ == Some("error") {
            return false;
        }
        match self.kind {
            Some(StanzaKind::Iq) => {
                self.id.is_some() && matches!(type_, Some("get") | Some("set"))
            }
            Some(StanzaKind::Message) | Some(StanzaKind::Presence) => true,
            None => false,
        }
    }
}

impl fmt::Display for MalformedStanza {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        match self.kind {
            Some(kind) => write!(fmt, "{} stanza: {}", kind, self.reason),
            None => fmt.write_str(&self.reason),
        }
    }
}

impl StdError for MalformedStanza {}

impl From<xso::error::Error> for MalformedStanza {
    fn from(e: xso::error::Error) -> Self {
        Self::new(e.to_string())
    }
}
