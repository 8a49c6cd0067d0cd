//! `TcpServerConnector` provides plain TCP transports

use core::future::Future;
use core::time::Duration;
use std::io;

use tokio::{io::BufStream, net::TcpStream};
use xmpp_parsers::jid::Jid;

use crate::connect::ServerConnector;
use crate::Error;

/// Default port for client-to-server connections.
pub const DEFAULT_PORT: u16 = 5222;

/// Connect via plain TCP to fixed addresses, or to the account's domain on
/// the default port.
///
/// Encryption is left to the [`Authenticator`][`super::Authenticator`]
/// which receives the transport.
#[derive(Debug, Clone, Default)]
pub struct TcpServerConnector {
    addrs: Vec<String>,
}

impl TcpServerConnector {
    /// Connect to the domain of the account JID on port 5222.
    pub fn new() -> Self {
        Self::default()
    }

    /// Connect to `addrs`, in order, instead of the account's domain.
    pub fn with_addrs<I: IntoIterator<Item = S>, S: Into<String>>(addrs: I) -> Self {
        Self {
            addrs: addrs.into_iter().map(Into::into).collect(),
        }
    }
}

impl ServerConnector for TcpServerConnector {
    type Stream = BufStream<TcpStream>;

    fn candidates(
        &self,
        jid: &Jid,
        preferred_location: Option<&str>,
    ) -> impl Future<Output = Result<Vec<String>, Error>> + Send {
        let mut candidates: Vec<String> = preferred_location.map(ToOwned::to_owned).into_iter().collect();
        if self.addrs.is_empty() {
            candidates.push(format!("{}:{}", jid.domain(), DEFAULT_PORT));
        } else {
            candidates.extend(self.addrs.iter().cloned());
        }
        candidates.dedup();
        async move { Ok(candidates) }
    }

    fn connect(
        &self,
        candidate: &str,
        timeout: Duration,
    ) -> impl Future<Output = io::Result<Self::Stream>> + Send {
        let candidate = candidate.to_owned();
        async move {
            let stream = tokio::time::timeout(timeout, TcpStream::connect(&candidate))
                .await
                .map_err(|_| {
                    io::Error::new(
                        io::ErrorKind::TimedOut,
                        format!("connecting to {candidate} timed out"),
                    )
                })??;
            stream.set_nodelay(true)?;
            Ok(BufStream::new(stream))
        }
    }
}
