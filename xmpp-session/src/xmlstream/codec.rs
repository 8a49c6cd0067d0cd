// Copyright (c) 2024 Jonas Schäfer <jonas@zombofant.net>
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

use core::pin::Pin;
use core::task::{ready, Context, Poll};
use std::io;

use bytes::BytesMut;
use futures::{Sink, Stream};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::codec::{Decoder, Encoder, Framed};

use super::{ReadError, XmppStreamElement};
use crate::error::MalformedStanza;

/// Result of decoding one unit from the wire.
#[derive(Debug)]
pub enum Decoded {
    /// A well-formed stream element.
    Element(XmppStreamElement),

    /// A stanza which was framed but could not be interpreted.
    Malformed(MalformedStanza),

    /// The peer closed its side of the stream.
    StreamFooter,
}

/// Wire format used by [`FramedXmppStream`].
///
/// Returning an `Err` from any of these methods is treated as a fatal
/// transport error. Per-stanza problems must be reported as
/// [`Decoded::Malformed`] instead.
pub trait StanzaCodec: Send + Unpin + 'static {
    /// Decode the next unit from `src`, or return `Ok(None)` if more bytes
    /// are needed.
    fn decode(&mut self, src: &mut BytesMut) -> io::Result<Option<Decoded>>;

    /// Serialise an element into `dst`.
    fn encode(&mut self, item: &XmppStreamElement, dst: &mut BytesMut) -> io::Result<()>;

    /// Serialise the stream footer into `dst`.
    fn encode_footer(&mut self, dst: &mut BytesMut) -> io::Result<()>;
}

struct CodecAdapter<C>(C);

impl<C: StanzaCodec> Decoder for CodecAdapter<C> {
    type Item = Decoded;
    type Error = io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> io::Result<Option<Decoded>> {
        self.0.decode(src)
    }
}

impl<C: StanzaCodec> Encoder<XmppStreamElement> for CodecAdapter<C> {
    type Error = io::Error;

    fn encode(&mut self, item: XmppStreamElement, dst: &mut BytesMut) -> io::Result<()> {
        self.0.encode(&item, dst)
    }
}

/// An [`ElementStream`][`super::ElementStream`] on top of a byte transport
/// and a [`StanzaCodec`].
pub struct FramedXmppStream<Io, C> {
    inner: Framed<Io, CodecAdapter<C>>,
    footer_received: bool,
    footer_queued: bool,
}

impl<Io: AsyncRead + AsyncWrite + Unpin, C: StanzaCodec> FramedXmppStream<Io, C> {
    /// Wrap a transport which has completed stream negotiation.
    pub fn new(io: Io, codec: C) -> Self {
        Self {
            inner: Framed::new(io, CodecAdapter(codec)),
            footer_received: false,
            footer_queued: false,
        }
    }

    /// Access the codec.
    pub fn codec(&self) -> &C {
        &self.inner.codec().0
    }

    /// Access the transport.
    pub fn get_ref(&self) -> &Io {
        self.inner.get_ref()
    }
}

impl<Io: AsyncRead + AsyncWrite + Unpin, C: StanzaCodec> Stream for FramedXmppStream<Io, C> {
    type Item = Result<XmppStreamElement, ReadError>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        if this.footer_received {
            return Poll::Ready(Some(Err(ReadError::StreamFooterReceived)));
        }
        Poll::Ready(match ready!(Pin::new(&mut this.inner).poll_next(cx)) {
            None => None,
            Some(Err(e)) => Some(Err(ReadError::HardError(e))),
            Some(Ok(Decoded::Element(el))) => Some(Ok(el)),
            Some(Ok(Decoded::Malformed(m))) => Some(Err(ReadError::Malformed(m))),
            Some(Ok(Decoded::StreamFooter)) => {
                this.footer_received = true;
                Some(Err(ReadError::StreamFooterReceived))
            }
        })
    }
}

impl<Io: AsyncRead + AsyncWrite + Unpin, C: StanzaCodec> Sink<XmppStreamElement>
    for FramedXmppStream<Io, C>
{
    type Error = io::Error;

    fn poll_ready(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Sink::<XmppStreamElement>::poll_ready(Pin::new(&mut self.get_mut().inner), cx)
    }

    fn start_send(self: Pin<&mut Self>, item: XmppStreamElement) -> io::Result<()> {
        let this = self.get_mut();
        if this.footer_queued {
            return Err(io::Error::new(
                io::ErrorKind::BrokenPipe,
                "stream footer already sent",
            ));
        }
        Pin::new(&mut this.inner).start_send(item)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Sink::<XmppStreamElement>::poll_flush(Pin::new(&mut self.get_mut().inner), cx)
    }

    fn poll_close(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        if !this.footer_queued {
            let mut footer = BytesMut::new();
            this.inner.codec_mut().0.encode_footer(&mut footer)?;
            this.inner.write_buffer_mut().extend_from_slice(&footer);
            this.footer_queued = true;
        }
        Sink::<XmppStreamElement>::poll_close(Pin::new(&mut this.inner), cx)
    }
}
