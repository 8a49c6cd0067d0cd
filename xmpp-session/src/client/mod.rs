// Copyright (c) 2019 Emmanuel Gil Peyrot <linkmauve@linkmauve.fr>
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! # Long-lived client sessions
//!
//! A [`Client`] keeps one logical XMPP session alive across connections.
//! It obtains transports from a [`ServerConnector`], hands them to an
//! [`Authenticator`], negotiates the stream and attaches the result to its
//! [`StanzaBroker`].
//!
//! When the stream breaks and the server allowed resumption, the client is
//! [`Phase::Suspended`]: the session is kept, and reconnecting resumes it
//! without losing stanzas. Otherwise the session is destroyed (pending IQ
//! requests fail) and a fresh one is established on the next connection.
//! Reconnection continues until [`Client::stop`] is called or a permanent
//! error occurs.

use alloc::sync::Arc;
use core::fmt;
use core::time::Duration;
use std::io;
use std::sync::{Mutex, PoisonError};

use sasl::common::Credentials;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use xmpp_parsers::{iq::Iq, jid::FullJid};

use crate::broker::{BrokerConfig, IqResponse, StanzaBroker, StanzaToken, WorkerExit};
use crate::connect::{Authenticated, Authenticator, ServerConnector};
use crate::jid::Jid;
use crate::negotiation::{Negotiator, ResumeOutcome};
use crate::service::{Service, ServiceContext, ServiceRegistry};
use crate::signal::{BarrierSignal, Signal};
use crate::xmlstream::XmppStream;
use crate::{Error, Stanza};

mod backoff;

pub use backoff::BackoffConfig;
use backoff::Backoff;

/// Lifecycle phase of a [`Client`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    /// No session exists.
    Disconnected,
    /// Looking for a server to connect to.
    Connecting,
    /// A transport is open and being authenticated and negotiated.
    Negotiating,
    /// The session is live.
    Established,
    /// The stream broke, but the session may still be resumed.
    Suspended,
    /// Looking for a server after a previous session ended.
    Reconnecting,
    /// The client has stopped for good.
    Stopped,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(match self {
            Phase::Disconnected => "disconnected",
            Phase::Connecting => "connecting",
            Phase::Negotiating => "negotiating",
            Phase::Established => "established",
            Phase::Suspended => "suspended",
            Phase::Reconnecting => "reconnecting",
            Phase::Stopped => "stopped",
        })
    }
}

/// Configuration of a [`Client`].
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Configuration of the session's broker.
    pub broker: BrokerConfig,

    /// Delays between failed connection attempts.
    pub backoff: BackoffConfig,

    /// Give up after this many failed attempts if no session was ever
    /// established. Attempts after the first success are unlimited.
    pub max_initial_attempts: Option<u32>,

    /// Timeout for opening a transport to a single candidate.
    pub connect_timeout: Duration,

    /// Timeout for authentication and stream negotiation together.
    pub negotiation_timeout: Duration,

    /// Give up resuming a suspended session after this long. The server's
    /// own limit applies as well.
    pub resumption_timeout: Option<Duration>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            broker: BrokerConfig::default(),
            backoff: BackoffConfig::default(),
            max_initial_attempts: Some(5),
            connect_timeout: Duration::from_secs(30),
            negotiation_timeout: Duration::from_secs(60),
            resumption_timeout: None,
        }
    }
}

impl ClientConfig {
    /// Short timeouts everywhere, for tests.
    pub fn tight() -> Self {
        Self {
            broker: BrokerConfig::tight(),
            backoff: BackoffConfig::tight(),
            max_initial_attempts: Some(3),
            connect_timeout: Duration::from_secs(1),
            negotiation_timeout: Duration::from_secs(2),
            resumption_timeout: None,
        }
    }
}

/// Signals emitted by a [`Client`].
#[derive(Default)]
pub struct ClientSignals {
    /// The phase changed.
    pub on_phase_changed: Signal<Phase>,

    /// A fresh session is live on the wire, but the application has not
    /// been told yet. Subscribers are awaited in order, so services can
    /// send their initial stanzas ahead of anything the application sends.
    pub before_stream_established: BarrierSignal,

    /// A fresh session was established.
    pub on_stream_established: Signal<()>,

    /// A suspended session was resumed.
    pub on_stream_resumed: Signal<()>,

    /// The stream broke, but the session can be resumed.
    pub on_stream_suspended: Signal<Error>,

    /// The session was destroyed, with an optional reason.
    pub on_stream_destroyed: Signal<Option<String>>,

    /// The client stopped because of a permanent error.
    pub on_failure: Signal<Error>,

    /// The client stopped because [`Client::stop`] was called.
    pub on_stopped: Signal<()>,
}

struct Shared<C: ServerConnector, A: Authenticator> {
    jid: Jid,
    credentials: Credentials,
    connector: C,
    authenticator: A,
    config: ClientConfig,
    broker: StanzaBroker,
    signals: Arc<ClientSignals>,
    phase: watch::Sender<Phase>,
    cancel: CancellationToken,
}

enum Lifecycle {
    Idle,
    Running(JoinHandle<()>),
    Finished,
}

struct RunState {
    backoff: Backoff,
    established_once: bool,
    initial_failures: u32,
    session_alive: bool,
    suspended_since: Option<Instant>,
}

struct Handshake {
    stream: XmppStream,
    backlog: Vec<Stanza>,
    bound: Option<FullJid>,
}

/// A reconnecting XMPP client session.
pub struct Client<C: ServerConnector, A: Authenticator> {
    shared: Arc<Shared<C, A>>,
    lifecycle: tokio::sync::Mutex<Lifecycle>,
    services: Mutex<ServiceRegistry>,
}

impl<C: ServerConnector, A: Authenticator> Client<C, A> {
    /// Create a client for the account `jid`.
    ///
    /// If `jid` carries a resource, it is requested when binding.
    pub fn new(
        jid: Jid,
        credentials: Credentials,
        connector: C,
        authenticator: A,
        config: ClientConfig,
    ) -> Self {
        let broker = StanzaBroker::new(config.broker.clone());
        let signals = Arc::new(ClientSignals::default());
        broker.signals().on_destroyed.connect({
            let signals = signals.clone();
            move |reason| signals.on_stream_destroyed.emit(reason)
        });
        let services = ServiceRegistry::new(ServiceContext {
            broker: broker.clone(),
            signals: signals.clone(),
            jid: jid.clone(),
        });
        let (phase, _) = watch::channel(Phase::Disconnected);
        Self {
            shared: Arc::new(Shared {
                jid,
                credentials,
                connector,
                authenticator,
                config,
                broker,
                signals,
                phase,
                cancel: CancellationToken::new(),
            }),
            lifecycle: tokio::sync::Mutex::new(Lifecycle::Idle),
            services: Mutex::new(services),
        }
    }

    /// Start connecting in a background task.
    ///
    /// A client can only be started once.
    pub fn start(&self) -> Result<(), Error> {
        let mut lifecycle = self
            .lifecycle
            .try_lock()
            .map_err(|_| Error::AlreadyRunning)?;
        match *lifecycle {
            Lifecycle::Idle => (),
            Lifecycle::Running(_) => return Err(Error::AlreadyRunning),
            Lifecycle::Finished => return Err(Error::InvalidState),
        }
        log::debug!("Starting client for {}", self.shared.jid);
        *lifecycle = Lifecycle::Running(tokio::spawn(self.shared.clone().run()));
        Ok(())
    }

    /// Stop the client.
    ///
    /// A live stream is closed cleanly, within the broker's grace period.
    /// Services are shut down. Returns the stanzas which were enqueued but
    /// never sent. Calling this again has no effect and returns nothing.
    pub async fn stop(&self) -> Vec<Stanza> {
        let mut lifecycle = self.lifecycle.lock().await;
        match core::mem::replace(&mut *lifecycle, Lifecycle::Finished) {
            Lifecycle::Idle => {
                self.shared.set_phase(Phase::Stopped);
                self.shared.signals.on_stopped.emit(&());
            }
            Lifecycle::Running(handle) => {
                self.shared.cancel.cancel();
                if let Err(e) = handle.await {
                    log::error!("Client task crashed: {e}");
                }
            }
            Lifecycle::Finished => return Vec::new(),
        }
        drop(lifecycle);

        let shutdown = self
            .services
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .shutdown();
        shutdown.await;

        match self.shared.broker.drain_outbound() {
            Ok(stanzas) => stanzas,
            Err(e) => {
                log::warn!("Could not drain outbound queue: {e}");
                Vec::new()
            }
        }
    }

    /// Wait until the client has stopped, for whatever reason.
    pub async fn closed(&self) {
        let mut rx = self.shared.phase.subscribe();
        let _: Result<_, _> = rx.wait_for(|phase| *phase == Phase::Stopped).await;
    }

    /// The current phase.
    pub fn phase(&self) -> Phase {
        *self.shared.phase.borrow()
    }

    /// Watch the phase.
    pub fn watch_phase(&self) -> watch::Receiver<Phase> {
        self.shared.phase.subscribe()
    }

    /// The account address the client was created for.
    pub fn jid(&self) -> &Jid {
        &self.shared.jid
    }

    /// The address bound on the current session, if any.
    pub fn local_jid(&self) -> Option<Jid> {
        self.shared.broker.local_jid()
    }

    /// Enqueue a stanza for transmission. See [`StanzaBroker::enqueue`].
    pub fn enqueue<S: Into<Stanza>>(&self, stanza: S) -> StanzaToken {
        self.shared.broker.enqueue(stanza)
    }

    /// Send an IQ request and wait for the response. See
    /// [`StanzaBroker::send_and_await_reply`].
    pub async fn send_and_await_reply(
        &self,
        iq: Iq,
        timeout: Duration,
    ) -> Result<IqResponse, Error> {
        self.shared.broker.send_and_await_reply(iq, timeout).await
    }

    /// The session's stanza broker, for registering handlers.
    pub fn broker(&self) -> &StanzaBroker {
        &self.shared.broker
    }

    /// The client's signals.
    pub fn signals(&self) -> &ClientSignals {
        &self.shared.signals
    }

    /// Get the instance of service `S`, building it first if needed.
    pub fn summon<S: Service>(&self) -> Result<Arc<S>, Error> {
        self.services
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .summon::<S>()
    }
}

impl<C: ServerConnector, A: Authenticator> Drop for Client<C, A> {
    fn drop(&mut self) {
        self.shared.cancel.cancel();
    }
}

impl<C: ServerConnector, A: Authenticator> Shared<C, A> {
    fn set_phase(&self, phase: Phase) {
        let changed = self.phase.send_if_modified(|current| {
            if *current == phase {
                false
            } else {
                *current = phase;
                true
            }
        });
        if changed {
            log::debug!("Client phase: {phase}");
            self.signals.on_phase_changed.emit(&phase);
        }
    }

    async fn run(self: Arc<Self>) {
        let mut state = RunState {
            backoff: Backoff::new(self.config.backoff),
            established_once: false,
            initial_failures: 0,
            session_alive: false,
            suspended_since: None,
        };
        let result = tokio::select! {
            _ = self.cancel.cancelled() => Ok(()),
            result = self.run_sessions(&mut state) => result,
        };

        if let Some(exit) = self.broker.stop().await {
            log::debug!("Broker stopped: {exit:?}");
        }
        if state.session_alive {
            if let Err(e) = self.broker.destroy(Some("client stopped".to_owned())) {
                log::warn!("Failed to discard session state: {e}");
            }
            self.broker.set_local_jid(None);
        }
        self.set_phase(Phase::Stopped);
        match result {
            Ok(()) => {
                log::info!("Client stopped.");
                self.signals.on_stopped.emit(&());
            }
            Err(e) => {
                log::error!("Client failed permanently: {e}");
                self.signals.on_failure.emit(&e);
            }
        }
    }

    fn resumption_limit(&self) -> Option<Duration> {
        let server = self
            .broker
            .sm_resume_info()
            .and_then(|info| info.max)
            .map(|max| Duration::from_secs(max.into()));
        match (self.config.resumption_timeout, server) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }

    fn destroy_session(&self, state: &mut RunState, reason: String) {
        state.suspended_since = None;
        if !state.session_alive {
            return;
        }
        state.session_alive = false;
        log::info!("Session destroyed: {reason}");
        if let Err(e) = self.broker.destroy(Some(reason)) {
            log::warn!("Failed to discard session state: {e}");
        }
        self.broker.set_local_jid(None);
        self.set_phase(Phase::Disconnected);
    }

    async fn run_sessions(&self, state: &mut RunState) -> Result<(), Error> {
        self.set_phase(Phase::Connecting);
        loop {
            if let Some(since) = state.suspended_since {
                if let Some(limit) = self.resumption_limit() {
                    if since.elapsed() >= limit {
                        self.destroy_session(
                            state,
                            format!("session not resumed within {limit:?}"),
                        );
                    }
                }
            }

            match self.attempt(state).await {
                Ok(WorkerExit::Stopped) => return Ok(()),
                Ok(WorkerExit::Failed(e)) => {
                    state.backoff.reset();
                    let resumable = self.broker.sm_resume_info().is_some();
                    if e.is_transient() && resumable {
                        log::info!("Stream broke, session suspended: {e}");
                        state.suspended_since = Some(Instant::now());
                        self.set_phase(Phase::Suspended);
                        self.signals.on_stream_suspended.emit(&e);
                    } else {
                        self.destroy_session(state, e.to_string());
                    }
                }
                Err(e) if !e.is_transient() => return Err(e),
                Err(e) => {
                    if !state.established_once {
                        state.initial_failures += 1;
                        if let Some(max) = self.config.max_initial_attempts {
                            if state.initial_failures >= max {
                                log::warn!("Giving up after {max} failed attempts.");
                                return Err(e);
                            }
                        }
                    }
                    let delay = state.backoff.next_delay();
                    log::info!("Connection attempt failed: {e}. Retrying in {delay:?}.");
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }

    /// Connect, negotiate and run the broker until the stream ends.
    async fn attempt(&self, state: &mut RunState) -> Result<WorkerExit, Error> {
        let resume = if state.session_alive {
            self.broker.sm_resume_info()
        } else {
            None
        };
        let waiting_phase = if resume.is_some() {
            Phase::Suspended
        } else if state.established_once {
            Phase::Reconnecting
        } else {
            Phase::Connecting
        };

        let candidates = self
            .connector
            .candidates(
                &self.jid,
                resume.as_ref().and_then(|info| info.location.as_deref()),
            )
            .await?;
        if candidates.is_empty() {
            return Err(io::Error::new(io::ErrorKind::NotFound, "no server address found").into());
        }

        let mut tls_error = None;
        let mut last_error: Error =
            io::Error::new(io::ErrorKind::NotFound, "no server address found").into();
        let mut handshake = None;
        for candidate in candidates {
            self.set_phase(waiting_phase);
            let transport = match self
                .connector
                .connect(&candidate, self.config.connect_timeout)
                .await
            {
                Ok(transport) => transport,
                Err(e) => {
                    log::debug!("Could not connect to {candidate}: {e}");
                    last_error = e.into();
                    continue;
                }
            };
            log::debug!("Connected to {candidate}");
            self.set_phase(Phase::Negotiating);
            let result = tokio::time::timeout(
                self.config.negotiation_timeout,
                self.handshake(transport, state),
            )
            .await
            .unwrap_or(Err(Error::Timeout));
            match result {
                Ok(v) => {
                    handshake = Some(v);
                    break;
                }
                Err(Error::Tls(e)) => {
                    log::warn!("TLS with {candidate} failed: {e}");
                    tls_error = Some(Error::Tls(e));
                }
                Err(e) if e.is_transient() => {
                    log::debug!("Handshake with {candidate} failed: {e}");
                    last_error = e;
                }
                Err(e) => return Err(e),
            }
        }
        let Some(Handshake {
            stream,
            backlog,
            bound,
        }) = handshake
        else {
            return Err(tls_error.unwrap_or(last_error));
        };

        let resumed = bound.is_none();
        if let Some(bound) = bound {
            self.broker.set_local_jid(Some(bound.into()));
        }
        self.broker.start_with_backlog(stream, backlog)?;
        state.suspended_since = None;
        state.backoff.reset();
        if resumed {
            self.set_phase(Phase::Established);
            self.signals.on_stream_resumed.emit(&());
        } else {
            state.session_alive = true;
            state.established_once = true;
            self.signals.before_stream_established.emit().await;
            self.set_phase(Phase::Established);
            self.signals.on_stream_established.emit(&());
        }

        Ok(self.broker.join().await.unwrap_or(WorkerExit::Stopped))
    }

    /// Authenticate, then resume the session or set up a fresh one.
    ///
    /// `bound` is `None` in the result if the session was resumed.
    async fn handshake(
        &self,
        transport: C::Stream,
        state: &mut RunState,
    ) -> Result<Handshake, Error> {
        let Authenticated {
            mut stream,
            features,
        } = self
            .authenticator
            .authenticate(
                transport,
                &self.jid,
                &self.credentials,
                self.config.negotiation_timeout,
            )
            .await?;

        let resume = if state.session_alive {
            self.broker.sm_resume_info()
        } else {
            None
        };
        let mut negotiator = Negotiator::new(&mut stream, &self.broker);
        if let Some(info) = resume {
            if features.stream_management {
                match negotiator.try_resume(&info).await? {
                    ResumeOutcome::Resumed => {
                        let backlog = negotiator.into_backlog();
                        return Ok(Handshake {
                            stream,
                            backlog,
                            bound: None,
                        });
                    }
                    ResumeOutcome::Failed(reason) => self.destroy_session(state, reason),
                }
            } else {
                self.destroy_session(
                    state,
                    "server no longer offers stream management".to_owned(),
                );
            }
            self.set_phase(Phase::Negotiating);
        } else if state.session_alive {
            // The session is alive, but there is no way to resume it.
            self.destroy_session(state, "session is not resumable".to_owned());
            self.set_phase(Phase::Negotiating);
        }

        let bound = negotiator.establish(&self.jid, &features).await?;
        let backlog = negotiator.into_backlog();
        Ok(Handshake {
            stream,
            backlog,
            bound: Some(bound),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use core::future::Future;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use tokio::io::{BufStream, DuplexStream};
    use tokio::sync::mpsc;
    use xmpp_parsers::{iq::IqType, message::Message, ping::Ping, sm};

    use crate::broker::StanzaStage;
    use crate::connect::{AsyncReadAndWrite, SessionRequirement, StreamFeatures};
    use crate::error::{AuthError, TlsError};
    use crate::xmlstream::{mock, mock::MockPeer, SmNonza, XmppStreamElement};

    #[derive(Clone, Debug)]
    struct MockConnector {
        candidates: Vec<String>,
        locations: Arc<Mutex<Vec<Option<String>>>>,
    }

    impl MockConnector {
        fn new(candidates: &[&str]) -> Self {
            Self {
                candidates: candidates.iter().map(|c| (*c).to_owned()).collect(),
                locations: Arc::default(),
            }
        }
    }

    impl ServerConnector for MockConnector {
        type Stream = BufStream<DuplexStream>;

        fn candidates(
            &self,
            _jid: &Jid,
            preferred_location: Option<&str>,
        ) -> impl Future<Output = Result<Vec<String>, Error>> + Send {
            self.locations
                .lock()
                .unwrap()
                .push(preferred_location.map(ToOwned::to_owned));
            let candidates = self.candidates.clone();
            async move { Ok(candidates) }
        }

        fn connect(
            &self,
            candidate: &str,
            _timeout: Duration,
        ) -> impl Future<Output = io::Result<Self::Stream>> + Send {
            let refused = candidate.starts_with("down");
            async move {
                if refused {
                    Err(io::Error::new(io::ErrorKind::ConnectionRefused, "refused"))
                } else {
                    Ok(BufStream::new(tokio::io::duplex(64).0))
                }
            }
        }
    }

    enum Step {
        Accept(StreamFeatures),
        Fail(fn() -> Error),
    }

    #[derive(Clone)]
    struct ScriptedAuthenticator {
        script: Arc<Mutex<VecDeque<Step>>>,
        peers: mpsc::UnboundedSender<MockPeer>,
    }

    impl Authenticator for ScriptedAuthenticator {
        fn authenticate<S: AsyncReadAndWrite + 'static>(
            &self,
            transport: S,
            _jid: &Jid,
            _credentials: &Credentials,
            _timeout: Duration,
        ) -> impl Future<Output = Result<Authenticated, Error>> + Send {
            drop(transport);
            let step = self.script.lock().unwrap().pop_front();
            let result = match step {
                Some(Step::Accept(features)) => {
                    let (stream, peer) = mock::pair();
                    let _ = self.peers.send(peer);
                    Ok(Authenticated { stream, features })
                }
                Some(Step::Fail(error)) => Err(error()),
                None => Err(io::Error::new(io::ErrorKind::ConnectionReset, "script exhausted").into()),
            };
            async move { result }
        }
    }

    fn with_sm() -> StreamFeatures {
        StreamFeatures {
            stream_management: true,
            can_bind: true,
            session: SessionRequirement::Optional,
        }
    }

    fn without_sm() -> StreamFeatures {
        StreamFeatures {
            stream_management: false,
            ..with_sm()
        }
    }

    type TestClient = Client<MockConnector, ScriptedAuthenticator>;

    fn client_with(
        candidates: &[&str],
        script: Vec<Step>,
    ) -> (TestClient, mpsc::UnboundedReceiver<MockPeer>, Arc<Mutex<VecDeque<Step>>>) {
        let _ = env_logger::builder().is_test(true).try_init();
        let (tx, rx) = mpsc::unbounded_channel();
        let script = Arc::new(Mutex::new(VecDeque::from(script)));
        let client = Client::new(
            Jid::new("me@example.com/desk").unwrap(),
            Credentials::default()
                .with_username("me")
                .with_password("secret"),
            MockConnector::new(candidates),
            ScriptedAuthenticator {
                script: script.clone(),
                peers: tx,
            },
            ClientConfig::tight(),
        );
        (client, rx, script)
    }

    fn counter(signal: &Signal<()>) -> Arc<AtomicUsize> {
        let count = Arc::new(AtomicUsize::new(0));
        let c = count.clone();
        signal.connect(move |_| {
            c.fetch_add(1, Ordering::SeqCst);
        });
        count
    }

    async fn next_peer(rx: &mut mpsc::UnboundedReceiver<MockPeer>) -> MockPeer {
        tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("client did not reconnect")
            .expect("authenticator went away")
    }

    async fn wait_phase(client: &TestClient, phase: Phase) {
        let mut rx = client.watch_phase();
        tokio::time::timeout(Duration::from_secs(5), rx.wait_for(|p| *p == phase))
            .await
            .expect("phase not reached")
            .unwrap();
    }

    fn chat(id: &str) -> Message {
        let mut message = Message::new(Some(Jid::new("peer@example.com").unwrap()));
        message.id = Some(id.to_owned());
        message
    }

    #[tokio::test]
    async fn happy_path() {
        let (client, mut peers, _) = client_with(&["a"], vec![Step::Accept(with_sm())]);
        let order = Arc::new(Mutex::new(Vec::new()));
        client.signals().before_stream_established.connect({
            let order = order.clone();
            move || {
                let order = order.clone();
                async move {
                    order.lock().unwrap().push("before");
                    Ok(())
                }
            }
        });
        client.signals().on_stream_established.connect({
            let order = order.clone();
            move |_| order.lock().unwrap().push("established")
        });
        let stopped = counter(&client.signals().on_stopped);
        let established = counter(&client.signals().on_stream_established);
        let resumed = counter(&client.signals().on_stream_resumed);

        client.start().unwrap();
        assert!(matches!(client.start(), Err(Error::AlreadyRunning)));
        let mut peer = next_peer(&mut peers).await;
        peer.serve_bind("me@example.com/desk").await;
        peer.serve_enable(Some("sm-1")).await;
        wait_phase(&client, Phase::Established).await;
        assert_eq!(*order.lock().unwrap(), vec!["before", "established"]);
        assert_eq!(
            client.local_jid(),
            Some(Jid::new("me@example.com/desk").unwrap())
        );

        for id in ["m1", "m2", "m3"] {
            client.enqueue(chat(id));
        }
        for id in ["m1", "m2", "m3"] {
            assert_eq!(peer.recv_stanza().await.id(), Some(id));
        }

        let request = tokio::spawn({
            let broker = client.broker().clone();
            async move {
                broker
                    .send_and_await_reply(Iq::from_get("", Ping), Duration::from_secs(5))
                    .await
            }
        });
        let ping = peer.recv_iq().await;
        peer.send_stanza(Iq {
            from: Some(Jid::new("me@example.com").unwrap()),
            to: None,
            id: ping.id,
            payload: IqType::Result(None),
        });
        assert!(matches!(
            request.await.unwrap(),
            Ok(IqResponse::Result(None))
        ));

        assert!(client.stop().await.is_empty());
        assert_eq!(client.phase(), Phase::Stopped);
        assert_eq!(stopped.load(Ordering::SeqCst), 1);
        assert_eq!(established.load(Ordering::SeqCst), 1);
        assert_eq!(resumed.load(Ordering::SeqCst), 0);
        assert!(peer.is_closed());
        // Everything was sent exactly once.
        let leftover = peer.drain();
        assert!(
            leftover
                .iter()
                .all(|el| !matches!(el, XmppStreamElement::Stanza(_))),
            "unexpected retransmission: {leftover:?}"
        );
    }

    #[tokio::test]
    async fn dropped_stream_is_resumed() {
        let (client, mut peers, _) = client_with(
            &["a"],
            vec![Step::Accept(with_sm()), Step::Accept(with_sm())],
        );
        let resumed = counter(&client.signals().on_stream_resumed);
        let established = counter(&client.signals().on_stream_established);
        let suspended = Arc::new(AtomicUsize::new(0));
        client.signals().on_stream_suspended.connect({
            let suspended = suspended.clone();
            move |_| {
                suspended.fetch_add(1, Ordering::SeqCst);
            }
        });
        let destroyed = Arc::new(AtomicUsize::new(0));
        client.signals().on_stream_destroyed.connect({
            let destroyed = destroyed.clone();
            move |_| {
                destroyed.fetch_add(1, Ordering::SeqCst);
            }
        });
        client.start().unwrap();

        let mut peer = next_peer(&mut peers).await;
        peer.serve_bind("me@example.com/desk").await;
        peer.serve_enable(Some("sm-1")).await;
        wait_phase(&client, Phase::Established).await;

        let mut tokens: Vec<_> = ["1", "2", "3"]
            .into_iter()
            .map(|id| client.enqueue(chat(id)))
            .collect();
        for id in ["1", "2", "3"] {
            assert_eq!(peer.recv_stanza().await.id(), Some(id));
        }
        peer.send(sm::A::new(2));
        assert!(tokens[1].wait_for(StanzaStage::Acked).await.is_some());
        drop(peer);

        let mut peer = next_peer(&mut peers).await;
        assert_eq!(suspended.load(Ordering::SeqCst), 1);
        match peer.recv().await {
            XmppStreamElement::SM(SmNonza::Resume(sm::Resume { previd, h })) => {
                assert_eq!(previd.0, "sm-1");
                assert_eq!(h, 0);
            }
            other => panic!("expected <resume/>, got {other:?}"),
        }
        peer.send(sm::Resumed {
            previd: sm::StreamId("sm-1".to_owned()),
            h: 2,
        });
        assert_eq!(peer.recv_stanza().await.id(), Some("3"));
        peer.send(sm::A::new(3));
        assert!(tokens[2].wait_for(StanzaStage::Acked).await.is_some());
        wait_phase(&client, Phase::Established).await;
        assert!(peer
            .drain()
            .iter()
            .all(|el| !matches!(el, XmppStreamElement::Stanza(_))));
        assert_eq!(resumed.load(Ordering::SeqCst), 1);
        assert_eq!(established.load(Ordering::SeqCst), 1);
        assert_eq!(destroyed.load(Ordering::SeqCst), 0);

        client.stop().await;
    }

    #[tokio::test]
    async fn refused_resumption_starts_fresh() {
        let (client, mut peers, _) = client_with(
            &["a"],
            vec![Step::Accept(with_sm()), Step::Accept(with_sm())],
        );
        let destroyed = Arc::new(Mutex::new(Vec::new()));
        client.signals().on_stream_destroyed.connect({
            let destroyed = destroyed.clone();
            move |reason: &Option<String>| destroyed.lock().unwrap().push(reason.clone())
        });
        let established = counter(&client.signals().on_stream_established);
        client.start().unwrap();

        let mut peer = next_peer(&mut peers).await;
        peer.serve_bind("me@example.com/desk").await;
        peer.serve_enable(Some("sm-1")).await;
        wait_phase(&client, Phase::Established).await;
        drop(peer);

        let mut peer = next_peer(&mut peers).await;
        assert!(matches!(
            peer.recv().await,
            XmppStreamElement::SM(SmNonza::Resume(_))
        ));
        peer.send(sm::Failed {
            h: None,
            error: None,
        });
        peer.serve_bind("me@example.com/desk").await;
        peer.serve_enable(Some("sm-2")).await;
        tokio::time::timeout(Duration::from_secs(5), async {
            while established.load(Ordering::SeqCst) < 2 {
                tokio::task::yield_now().await;
            }
        })
        .await
        .unwrap();
        assert_eq!(destroyed.lock().unwrap().len(), 1);

        client.stop().await;
    }

    #[tokio::test]
    async fn without_stream_management_pending_requests_fail() {
        let (client, mut peers, _) = client_with(&["a"], vec![Step::Accept(without_sm())]);
        let phases = Arc::new(Mutex::new(Vec::new()));
        client.signals().on_phase_changed.connect({
            let phases = phases.clone();
            move |phase: &Phase| phases.lock().unwrap().push(*phase)
        });
        let destroyed = Arc::new(AtomicUsize::new(0));
        client.signals().on_stream_destroyed.connect({
            let destroyed = destroyed.clone();
            move |_| {
                destroyed.fetch_add(1, Ordering::SeqCst);
            }
        });
        client.start().unwrap();
        let mut peer = next_peer(&mut peers).await;
        peer.serve_bind("me@example.com/desk").await;
        wait_phase(&client, Phase::Established).await;

        let mut requests = Vec::new();
        for _ in 0..3 {
            let broker = client.broker().clone();
            requests.push(tokio::spawn(async move {
                broker
                    .send_and_await_reply(Iq::from_get("", Ping), Duration::from_secs(30))
                    .await
            }));
        }
        for _ in 0..3 {
            peer.recv_iq().await;
        }
        drop(peer);

        for request in requests {
            assert!(matches!(request.await.unwrap(), Err(Error::ConnectionLost)));
        }
        assert_eq!(destroyed.load(Ordering::SeqCst), 1);
        tokio::time::timeout(Duration::from_secs(5), async {
            while !phases.lock().unwrap().contains(&Phase::Reconnecting) {
                tokio::task::yield_now().await;
            }
        })
        .await
        .unwrap();
        let phases = phases.lock().unwrap().clone();
        let established = phases.iter().position(|p| *p == Phase::Established).unwrap();
        assert_eq!(
            phases[established + 1..established + 3],
            [Phase::Disconnected, Phase::Reconnecting]
        );
        client.stop().await;
    }

    #[tokio::test]
    async fn concurrent_stops_finish_once() {
        let (client, mut peers, _) = client_with(&["a"], vec![Step::Accept(with_sm())]);
        let stopped = counter(&client.signals().on_stopped);
        let failures = Arc::new(AtomicUsize::new(0));
        client.signals().on_failure.connect({
            let failures = failures.clone();
            move |_| {
                failures.fetch_add(1, Ordering::SeqCst);
            }
        });
        client.start().unwrap();
        let mut peer = next_peer(&mut peers).await;
        peer.serve_bind("me@example.com/desk").await;
        peer.serve_enable(Some("sm-1")).await;
        wait_phase(&client, Phase::Established).await;

        tokio::join!(client.stop(), client.stop());
        assert_eq!(stopped.load(Ordering::SeqCst), 1);
        assert_eq!(failures.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn gives_up_after_max_initial_attempts() {
        let (client, _peers, _) = client_with(&["down-1", "down-2"], Vec::new());
        let failure = Arc::new(Mutex::new(None));
        client.signals().on_failure.connect({
            let failure = failure.clone();
            move |e: &Error| *failure.lock().unwrap() = Some(e.is_transient())
        });
        let stopped = counter(&client.signals().on_stopped);
        client.start().unwrap();
        tokio::time::timeout(Duration::from_secs(5), client.closed())
            .await
            .unwrap();
        assert_eq!(*failure.lock().unwrap(), Some(true));
        assert_eq!(stopped.load(Ordering::SeqCst), 0);
        assert_eq!(
            client.shared.connector.locations.lock().unwrap().len(),
            3
        );
        assert!(client.stop().await.is_empty());
    }

    #[tokio::test]
    async fn authentication_failure_is_not_retried() {
        let (client, _peers, script) = client_with(
            &["a"],
            vec![
                Step::Fail(|| Error::Auth(AuthError::NoMechanism)),
                Step::Accept(with_sm()),
            ],
        );
        let failures = Arc::new(AtomicUsize::new(0));
        client.signals().on_failure.connect({
            let failures = failures.clone();
            move |_| {
                failures.fetch_add(1, Ordering::SeqCst);
            }
        });
        client.start().unwrap();
        tokio::time::timeout(Duration::from_secs(5), client.closed())
            .await
            .unwrap();
        assert_eq!(failures.load(Ordering::SeqCst), 1);
        assert_eq!(script.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn tls_failure_falls_through_to_next_candidate() {
        let (client, mut peers, _) = client_with(
            &["a", "b"],
            vec![
                Step::Fail(|| Error::Tls(TlsError::Unavailable)),
                Step::Accept(without_sm()),
            ],
        );
        client.start().unwrap();
        let mut peer = next_peer(&mut peers).await;
        peer.serve_bind("me@example.com/desk").await;
        wait_phase(&client, Phase::Established).await;
        client.stop().await;
    }

    #[tokio::test]
    async fn transient_handshake_failure_tries_next_candidate() {
        let (client, mut peers, script) = client_with(
            &["a", "b"],
            vec![
                Step::Fail(|| io::Error::new(io::ErrorKind::ConnectionReset, "reset").into()),
                Step::Accept(without_sm()),
            ],
        );
        client.start().unwrap();
        let mut peer = next_peer(&mut peers).await;
        peer.serve_bind("me@example.com/desk").await;
        wait_phase(&client, Phase::Established).await;

        // Both candidates were tried within the same attempt.
        assert_eq!(client.shared.connector.locations.lock().unwrap().len(), 1);
        assert!(script.lock().unwrap().is_empty());
        client.stop().await;
    }

    #[tokio::test]
    async fn tls_failure_everywhere_is_fatal() {
        let (client, _peers, script) = client_with(
            &["a", "b"],
            vec![
                Step::Fail(|| Error::Tls(TlsError::Unavailable)),
                Step::Fail(|| Error::Tls(TlsError::Unavailable)),
                Step::Accept(without_sm()),
            ],
        );
        let failure = Arc::new(Mutex::new(None));
        client.signals().on_failure.connect({
            let failure = failure.clone();
            move |e: &Error| *failure.lock().unwrap() = Some(matches!(e, Error::Tls(_)))
        });
        client.start().unwrap();
        tokio::time::timeout(Duration::from_secs(5), client.closed())
            .await
            .unwrap();
        assert_eq!(*failure.lock().unwrap(), Some(true));
        assert_eq!(script.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn stop_is_idempotent_and_returns_unsent() {
        let (client, _peers, _) = client_with(&["a"], Vec::new());
        let stopped = counter(&client.signals().on_stopped);
        client.enqueue(chat("unsent"));

        let unsent = client.stop().await;
        assert_eq!(unsent.len(), 1);
        assert_eq!(unsent[0].id(), Some("unsent"));
        assert!(client.stop().await.is_empty());
        assert_eq!(stopped.load(Ordering::SeqCst), 1);
        assert_eq!(client.phase(), Phase::Stopped);
        assert!(matches!(client.start(), Err(Error::InvalidState)));
    }

    #[tokio::test]
    async fn services_are_shut_down_on_stop() {
        let (client, mut peers, _) = client_with(&["a"], vec![Step::Accept(without_sm())]);
        client
            .summon::<crate::services::PingResponder>()
            .unwrap();
        client.start().unwrap();
        let mut peer = next_peer(&mut peers).await;
        peer.serve_bind("me@example.com/desk").await;
        wait_phase(&client, Phase::Established).await;

        peer.send_stanza(
            Iq::from_get("s2c", Ping).with_from(Jid::new("example.com").unwrap()),
        );
        let reply = peer.recv_iq().await;
        assert!(matches!(reply.payload, IqType::Result(None)));

        client.stop().await;
        assert!(!client
            .broker()
            .unregister_iq_handler(
                crate::broker::IqRequestType::Get,
                &crate::broker::PayloadKind::new(xmpp_parsers::ns::PING, "ping"),
            ));
    }
}
