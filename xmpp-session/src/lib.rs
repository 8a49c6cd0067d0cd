//! Resilient [XMPP](https://xmpp.org/) client sessions on top of [tokio](https://tokio.rs/).
//!
//! This crate keeps a client session alive across unreliable connections.
//! It is split in three layers:
//!
//! - The [`broker::StanzaBroker`] owns the outbound queue of a session,
//!   correlates IQ responses with their requests and routes inbound stanzas
//!   to registered handlers.
//! - [XEP-0198](https://xmpp.org/extensions/xep-0198.html) stream
//!   management lives inside the broker: stanzas are counted and
//!   acknowledged, and unacknowledged ones are retransmitted when a stream
//!   is resumed.
//! - The [`client::Client`] drives the connection lifecycle: it connects,
//!   negotiates, resumes or re-establishes the session after drops, and
//!   backs off between failed attempts.
//!
//! Transports and authentication are pluggable through the
//! [`connect::ServerConnector`] and [`connect::Authenticator`] traits.
//! Protocol extensions are built as [`service::Service`]s.
//!
//! # Getting started
//!
//! Create a [`client::Client`] with a connector and an authenticator,
//! register handlers on its [`client::Client::broker`], subscribe to the
//! [`client::ClientSignals`] you care about and call
//! [`client::Client::start`].

#![deny(unsafe_code, missing_docs, bare_trait_objects)]
#![cfg_attr(docsrs, feature(doc_auto_cfg))]

extern crate alloc;

pub mod broker;
pub mod client;
pub mod connect;
pub mod service;
pub mod services;
pub mod signal;
pub mod xmlstream;

mod negotiation;
mod stanza;
pub use stanza::{Stanza, StanzaKind};

/// Detailed error types
pub mod error;

#[doc(inline)]
/// Generic session error
pub use crate::error::Error;

// Re-exports
pub use minidom;
pub use xmpp_parsers as parsers;
pub use xmpp_parsers::jid;
