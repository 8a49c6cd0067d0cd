//! `ServerConnector` provides transports for XMPP clients, `Authenticator`
//! turns them into authenticated element streams.
//!
//! Neither DNS resolution, TLS nor SASL are implemented in this crate. They
//! are supplied through these two traits, which lets the session engine run
//! over any transport and lets tests script the server side.

use core::future::Future;
use core::time::Duration;
use std::io;

use sasl::common::Credentials;
use tokio::io::{AsyncBufRead, AsyncWrite};
use xmpp_parsers::jid::Jid;

use crate::xmlstream::XmppStream;
use crate::Error;

mod tcp;

pub use tcp::{TcpServerConnector, DEFAULT_PORT};

/// trait returned wrapped in XmppStream by ServerConnector
pub trait AsyncReadAndWrite: AsyncBufRead + AsyncWrite + Unpin + Send {}
impl<T: AsyncBufRead + AsyncWrite + Unpin + Send> AsyncReadAndWrite for T {}

/// Trait called to connect to an XMPP server, perhaps called multiple times
pub trait ServerConnector: Clone + core::fmt::Debug + Send + Sync + Unpin + 'static {
    /// The type of transport this ServerConnector produces
    type Stream: AsyncReadAndWrite + 'static;

    /// Produce the ordered list of addresses to try for `jid`.
    ///
    /// `preferred_location` is the resumption address the server asked us
    /// to use, if any. Implementations should try it first.
    fn candidates(
        &self,
        jid: &Jid,
        preferred_location: Option<&str>,
    ) -> impl Future<Output = Result<Vec<String>, Error>> + Send;

    /// Open a transport to a single candidate address.
    fn connect(
        &self,
        candidate: &str,
        timeout: Duration,
    ) -> impl Future<Output = io::Result<Self::Stream>> + Send;
}

/// How the server announced legacy (RFC 3921) session establishment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SessionRequirement {
    /// No `<session/>` feature was announced.
    #[default]
    NotOffered,

    /// `<session><optional/></session>` was announced.
    Optional,

    /// `<session/>` was announced without `<optional/>`.
    Required,
}

/// The subset of post-authentication stream features the session engine
/// cares about.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StreamFeatures {
    /// XEP-0198 stream management is offered.
    pub stream_management: bool,

    /// Resource binding is offered.
    pub can_bind: bool,

    /// Legacy session establishment.
    pub session: SessionRequirement,
}

/// An authenticated stream together with the features the server offered
/// after the final stream restart.
pub struct Authenticated {
    /// The element stream, ready for resource binding or resumption.
    pub stream: XmppStream,

    /// Features announced by the server.
    pub features: StreamFeatures,
}

/// Trait called to secure and authenticate a freshly connected transport.
///
/// Implementations perform TLS, SASL and the stream restarts which go with
/// them, and return an element stream. TLS failures must be reported as
/// [`Error::Tls`], so that the controller can tell them apart from
/// transient transport problems.
pub trait Authenticator: Clone + Send + Sync + 'static {
    /// Secure and authenticate `transport` as `jid`.
    fn authenticate<S: AsyncReadAndWrite + 'static>(
        &self,
        transport: S,
        jid: &Jid,
        credentials: &Credentials,
        timeout: Duration,
    ) -> impl Future<Output = Result<Authenticated, Error>> + Send;
}
