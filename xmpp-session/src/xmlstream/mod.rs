// Copyright (c) 2024 Jonas Schäfer <jonas@zombofant.net>
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! # Element streams
//!
//! After authentication, the session engine only ever sees a stream of
//! [`XmppStreamElement`]s and a sink accepting them. How elements are
//! serialised to the wire is left to a [`StanzaCodec`], which can be plugged
//! onto any byte transport with [`FramedXmppStream`].
//!
//! Reading from an element stream yields [`ReadError`]s which distinguish
//! between fatal transport failures and recoverable per-stanza problems: a
//! [`ReadError::Malformed`] item does not end the stream.

use core::fmt;
use std::io;

use futures::{Sink, Stream};

use crate::error::MalformedStanza;

mod codec;
mod xmpp;

#[cfg(test)]
pub(crate) mod mock;

pub use codec::{Decoded, FramedXmppStream, StanzaCodec};
pub use xmpp::{SmNonza, XmppStreamElement};

/// Error which may occur while reading from an element stream.
#[derive(Debug)]
pub enum ReadError {
    /// An I/O error occurred in the underlying I/O object.
    ///
    /// This is generally fatal.
    HardError(io::Error),

    /// A stanza was framed correctly but could not be interpreted.
    ///
    /// This is non-fatal and more elements may be read from the stream.
    Malformed(MalformedStanza),

    /// The stream footer was received.
    ///
    /// Any future read attempts will again return this error. The stream has
    /// been closed by the peer and you should probably close it, too.
    StreamFooterReceived,
}

impl fmt::Display for ReadError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::HardError(e) => write!(f, "{e}"),
            Self::Malformed(e) => write!(f, "malformed stanza: {e}"),
            Self::StreamFooterReceived => f.write_str("stream footer received"),
        }
    }
}

impl core::error::Error for ReadError {
    fn source(&self) -> Option<&(dyn core::error::Error + 'static)> {
        match self {
            Self::HardError(e) => Some(e),
            Self::Malformed(e) => Some(e),
            Self::StreamFooterReceived => None,
        }
    }
}

/// A bidirectional stream of XMPP stream elements.
///
/// Closing the sink sends the stream footer and shuts down the transport.
pub trait ElementStream:
    Stream<Item = Result<XmppStreamElement, ReadError>>
    + Sink<XmppStreamElement, Error = io::Error>
    + Send
    + Unpin
{
}

impl<T> ElementStream for T where
    T: Stream<Item = Result<XmppStreamElement, ReadError>>
        + Sink<XmppStreamElement, Error = io::Error>
        + Send
        + Unpin
{
}

/// Type-erased authenticated element stream.
pub type XmppStream = Box<dyn ElementStream>;
