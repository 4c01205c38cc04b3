//! Byte stream under a session: plain TCP or TLS.

use crate::config::SessionConfig;
use crate::error::SessionError;
use crate::tls::build_connector;
use pin_project_lite::pin_project;
use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::TcpStream;
use tokio_rustls::client::TlsStream;

pin_project! {
    /// Transport stream of a session.
    #[project = SessionStreamProj]
    pub enum SessionStream {
        Plain { #[pin] stream: TcpStream },
        Tls { #[pin] stream: TlsStream<TcpStream> },
    }
}

impl SessionStream {
    /// Dials the configured server, upgrading to TLS when configured.
    ///
    /// The connect timeout covers both the TCP connect and the TLS handshake.
    pub async fn connect(config: &SessionConfig) -> Result<Self, SessionError> {
        let target = format!("{}:{}", config.host, config.port);
        tracing::debug!("Connecting to {}...", target);

        tokio::time::timeout(config.connect_timeout, async {
            let tcp = TcpStream::connect(&target).await.map_err(|e| {
                tracing::debug!("Connection to {} failed: {}", target, e);
                SessionError::Io(e)
            })?;
            tcp.set_nodelay(true).ok();

            match config.tls.as_ref().filter(|t| t.enabled) {
                Some(tls) => {
                    let (connector, server_name) = build_connector(tls, &config.host)?;
                    tracing::debug!("Performing TLS handshake with {}", target);
                    let stream = connector
                        .connect(server_name, tcp)
                        .await
                        .map_err(|e| SessionError::TlsHandshake(e.to_string()))?;
                    Ok(SessionStream::Tls { stream })
                }
                None => Ok(SessionStream::Plain { stream: tcp }),
            }
        })
        .await
        .map_err(|_| {
            tracing::debug!("Connect to {} timed out", target);
            SessionError::Timeout
        })?
    }

    /// Returns whether this stream is TLS-encrypted.
    pub fn is_tls(&self) -> bool {
        matches!(self, SessionStream::Tls { .. })
    }

    pub fn peer_addr(&self) -> io::Result<SocketAddr> {
        match self {
            SessionStream::Plain { stream } => stream.peer_addr(),
            SessionStream::Tls { stream } => stream.get_ref().0.peer_addr(),
        }
    }
}

impl AsyncRead for SessionStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.project() {
            SessionStreamProj::Plain { stream } => stream.poll_read(cx, buf),
            SessionStreamProj::Tls { stream } => stream.poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for SessionStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match self.project() {
            SessionStreamProj::Plain { stream } => stream.poll_write(cx, buf),
            SessionStreamProj::Tls { stream } => stream.poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.project() {
            SessionStreamProj::Plain { stream } => stream.poll_flush(cx),
            SessionStreamProj::Tls { stream } => stream.poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.project() {
            SessionStreamProj::Plain { stream } => stream.poll_shutdown(cx),
            SessionStreamProj::Tls { stream } => stream.poll_shutdown(cx),
        }
    }
}
