// Copyright (c) 2026 xmpp-rs contributors.
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! XEP-0199: XMPP Ping

use alloc::sync::Arc;
use core::time::Duration;

use futures::future::BoxFuture;
use tokio::time::Instant;

use xmpp_parsers::{iq::Iq, ns, ping::Ping};

use crate::broker::{IqHandlerResult, IqRequestType, IqResponse, PayloadKind, StanzaBroker};
use crate::jid::Jid;
use crate::service::{Dependencies, Service, ServiceContext, ServiceKind};
use crate::Error;

fn ping_kind() -> PayloadKind {
    PayloadKind::new(ns::PING, "ping")
}

/// Answers pings from the server and other entities.
pub struct PingResponder {
    broker: StanzaBroker,
}

impl Service for PingResponder {
    fn new(ctx: &ServiceContext, _: &Dependencies) -> Result<Self, Error> {
        ctx.broker
            .register_iq_handler(IqRequestType::Get, ping_kind(), |request| async move {
                log::trace!("Answering ping from {:?}", request.from);
                IqHandlerResult::Ok(None)
            })?;
        Ok(Self {
            broker: ctx.broker.clone(),
        })
    }

    fn shutdown(self: Arc<Self>) -> BoxFuture<'static, ()> {
        self.broker
            .unregister_iq_handler(IqRequestType::Get, &ping_kind());
        Box::pin(async {})
    }
}

/// Measures round trips to other entities.
///
/// Anything which pings is expected to answer pings as well, so this pulls
/// in the [`PingResponder`].
pub struct Pinger {
    broker: StanzaBroker,
}

impl Service for Pinger {
    fn dependencies() -> Vec<ServiceKind> {
        vec![ServiceKind::of::<PingResponder>()]
    }

    fn new(ctx: &ServiceContext, _: &Dependencies) -> Result<Self, Error> {
        Ok(Self {
            broker: ctx.broker.clone(),
        })
    }
}

impl Pinger {
    /// Ping `target`, or our own server if `None`, and return the round
    /// trip time.
    ///
    /// An error reply still proves that the target is reachable, except
    /// when it comes with `service-unavailable` or `remote-server-not-found`
    /// which the server sends on behalf of unreachable entities.
    pub async fn ping(&self, target: Option<Jid>, timeout: Duration) -> Result<Duration, Error> {
        let mut iq = Iq::from_get("", Ping);
        iq.to = target;
        let started = Instant::now();
        let response = self.broker.send_and_await_reply(iq, timeout).await?;
        let rtt = started.elapsed();
        match response {
            IqResponse::Result(_) => Ok(rtt),
            IqResponse::Error(e) => {
                use xmpp_parsers::stanza_error::DefinedCondition::*;
                match e.defined_condition {
                    ServiceUnavailable | RemoteServerNotFound => Err(Error::ConnectionLost),
                    _ => Ok(rtt),
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use xmpp_parsers::iq::IqType;

    use crate::broker::BrokerConfig;
    use crate::client::ClientSignals;
    use crate::service::ServiceRegistry;
    use crate::xmlstream::mock;

    fn registry(broker: &StanzaBroker) -> ServiceRegistry {
        ServiceRegistry::new(ServiceContext {
            broker: broker.clone(),
            signals: Arc::new(ClientSignals::default()),
            jid: Jid::new("me@example.com").unwrap(),
        })
    }

    #[tokio::test]
    async fn responder_answers_until_shut_down() {
        let broker = StanzaBroker::new(BrokerConfig::tight());
        let mut registry = registry(&broker);
        registry.summon::<Pinger>().unwrap();
        assert_eq!(registry.len(), 2);

        let (stream, mut peer) = mock::pair();
        broker.start(stream).unwrap();
        let server = Jid::new("example.com").unwrap();

        peer.send_stanza(Iq::from_get("s2c-1", Ping).with_from(server.clone()));
        let reply = peer.recv_iq().await;
        assert_eq!(reply.id, "s2c-1");
        assert!(matches!(reply.payload, IqType::Result(None)));

        registry.shutdown().await;
        peer.send_stanza(Iq::from_get("s2c-2", Ping).with_from(server));
        let reply = peer.recv_iq().await;
        assert!(matches!(reply.payload, IqType::Error(_)));
        broker.stop().await;
    }

    #[tokio::test]
    async fn pinger_measures_round_trip() {
        let broker = StanzaBroker::new(BrokerConfig::tight());
        let pinger = registry(&broker).summon::<Pinger>().unwrap();
        let (stream, mut peer) = mock::pair();
        broker.start(stream).unwrap();

        let pending = tokio::spawn(async move {
            pinger
                .ping(Some(Jid::new("peer@example.com/x").unwrap()), Duration::from_secs(5))
                .await
        });
        let request = peer.recv_iq().await;
        assert_eq!(request.to, Some(Jid::new("peer@example.com/x").unwrap()));
        peer.send_stanza(Iq {
            from: request.to,
            to: None,
            id: request.id,
            payload: IqType::Result(None),
        });
        assert!(pending.await.unwrap().is_ok());
        broker.stop().await;
    }
}
