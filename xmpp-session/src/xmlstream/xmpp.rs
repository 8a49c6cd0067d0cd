// Copyright (c) 2024 Jonas Schäfer <jonas@zombofant.net>
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

use xmpp_parsers::{sm, stream_error::StreamError};

use crate::Stanza;

/// Any XMPP stream-level element the session engine exchanges after
/// authentication.
#[derive(Debug, Clone)]
pub enum XmppStreamElement {
    /// Stanza
    Stanza(Stanza),

    /// XEP-0198 nonzas
    SM(SmNonza),

    /// Stream error, sent or received
    StreamError(StreamError),
}

impl From<Stanza> for XmppStreamElement {
    fn from(other: Stanza) -> Self {
        Self::Stanza(other)
    }
}

impl From<SmNonza> for XmppStreamElement {
    fn from(other: SmNonza) -> Self {
        Self::SM(other)
    }
}

impl From<StreamError> for XmppStreamElement {
    fn from(other: StreamError) -> Self {
        Self::StreamError(other)
    }
}

/// Any of the XEP-0198 nonzas exchanged once a stream is established.
#[derive(Debug, Clone, PartialEq)]
pub enum SmNonza {
    /// Request to enable SM
    Enable(sm::Enable),

    /// Successful SM enablement response
    Enabled(sm::Enabled),

    /// Request to resume SM
    Resume(sm::Resume),

    /// Successful SM resumption response
    Resumed(sm::Resumed),

    /// Error response
    Failed(sm::Failed),

    /// Acknowledgement
    Ack(sm::A),

    /// Request for an acknowledgement
    Req(sm::R),
}

macro_rules! nonza_from {
    ($($variant:ident($ty:ty),)*) => {
        $(
            impl From<$ty> for SmNonza {
                fn from(other: $ty) -> Self {
                    Self::$variant(other)
                }
            }

            impl From<$ty> for XmppStreamElement {
                fn from(other: $ty) -> Self {
                    Self::SM(SmNonza::$variant(other))
                }
            }
        )*
    };
}

nonza_from! {
    Enable(sm::Enable),
    Enabled(sm::Enabled),
    Resume(sm::Resume),
    Resumed(sm::Resumed),
    Failed(sm::Failed),
    Ack(sm::A),
    Req(sm::R),
}
