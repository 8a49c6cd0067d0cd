// Copyright (c) 2026 xmpp-rs contributors.
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! In-memory element stream for tests.

use core::pin::Pin;
use core::task::{Context, Poll};
use core::time::Duration;
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use futures::{Sink, Stream};
use tokio::sync::mpsc;

use xmpp_parsers::{
    iq::{Iq, IqType},
    ns, sm,
};

use super::{ReadError, SmNonza, XmppStream, XmppStreamElement};
use crate::minidom::Element;
use crate::Stanza;

pub(crate) struct MockStream {
    rx: mpsc::UnboundedReceiver<Result<XmppStreamElement, ReadError>>,
    tx: mpsc::UnboundedSender<XmppStreamElement>,
    closed: Arc<AtomicBool>,
}

impl Stream for MockStream {
    type Item = Result<XmppStreamElement, ReadError>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.get_mut().rx.poll_recv(cx)
    }
}

impl Sink<XmppStreamElement> for MockStream {
    type Error = io::Error;

    fn poll_ready(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn start_send(self: Pin<&mut Self>, item: XmppStreamElement) -> io::Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(io::Error::new(io::ErrorKind::BrokenPipe, "stream closed"));
        }
        self.tx
            .send(item)
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "peer went away"))
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_close(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        self.closed.store(true, Ordering::SeqCst);
        Poll::Ready(Ok(()))
    }
}

/// The remote end of a [`MockStream`].
///
/// Dropping the peer makes the local stream report end-of-file.
pub(crate) struct MockPeer {
    tx: mpsc::UnboundedSender<Result<XmppStreamElement, ReadError>>,
    rx: mpsc::UnboundedReceiver<XmppStreamElement>,
    closed: Arc<AtomicBool>,
}

pub(crate) fn pair() -> (XmppStream, MockPeer) {
    let (in_tx, in_rx) = mpsc::unbounded_channel();
    let (out_tx, out_rx) = mpsc::unbounded_channel();
    let closed = Arc::new(AtomicBool::new(false));
    let stream = MockStream {
        rx: in_rx,
        tx: out_tx,
        closed: closed.clone(),
    };
    let peer = MockPeer {
        tx: in_tx,
        rx: out_rx,
        closed,
    };
    (Box::new(stream), peer)
}

impl MockPeer {
    pub fn send(&self, el: impl Into<XmppStreamElement>) {
        let _ = self.tx.send(Ok(el.into()));
    }

    pub fn send_stanza(&self, st: impl Into<Stanza>) {
        self.send(st.into());
    }

    pub fn send_error(&self, e: ReadError) {
        let _ = self.tx.send(Err(e));
    }

    /// Receive the next element the local side wrote.
    pub async fn recv(&mut self) -> XmppStreamElement {
        tokio::time::timeout(Duration::from_secs(30), self.rx.recv())
            .await
            .expect("timed out waiting for element")
            .expect("local side went away")
    }

    /// Receive the next stanza, skipping SM nonzas.
    pub async fn recv_stanza(&mut self) -> Stanza {
        loop {
            match self.recv().await {
                XmppStreamElement::Stanza(st) => return st,
                XmppStreamElement::SM(SmNonza::Req(_) | SmNonza::Ack(_)) => continue,
                other => panic!("expected stanza, got {other:?}"),
            }
        }
    }

    /// Receive everything written so far without waiting.
    pub fn drain(&mut self) -> Vec<XmppStreamElement> {
        let mut result = Vec::new();
        while let Ok(el) = self.rx.try_recv() {
            result.push(el);
        }
        result
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub async fn recv_iq(&mut self) -> Iq {
        Iq::try_from(self.recv_stanza().await).expect("expected IQ")
    }

    /// Answer a resource binding request with `bound`, returning the
    /// requested resource.
    pub async fn serve_bind(&mut self, bound: &str) -> Option<String> {
        let request = self.recv_iq().await;
        let IqType::Set(payload) = request.payload else {
            panic!("expected bind request, got {request:?}");
        };
        assert!(payload.is("bind", ns::BIND));
        let resource = payload.get_child("resource", ns::BIND).map(|r| r.text());
        let response = Element::builder("bind", ns::BIND)
            .append(Element::builder("jid", ns::BIND).append(bound))
            .build();
        self.send_stanza(Iq {
            from: None,
            to: None,
            id: request.id,
            payload: IqType::Result(Some(response)),
        });
        resource
    }

    /// Answer `<enable/>` with `<enabled/>` carrying `id`, or with
    /// `<failed/>` if `id` is `None`.
    pub async fn serve_enable(&mut self, id: Option<&str>) {
        match self.recv().await {
            XmppStreamElement::SM(SmNonza::Enable(_)) => (),
            other => panic!("expected <enable/>, got {other:?}"),
        }
        match id {
            Some(id) => self.send(sm::Enabled {
                id: Some(sm::StreamId(id.to_owned())),
                resume: sm::ResumeAttr::True,
                location: None,
                max: None,
            }),
            None => self.send(sm::Failed {
                h: None,
                error: None,
            }),
        }
    }
}
