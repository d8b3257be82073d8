//! Client-side stream abstraction.
//!
//! Wraps either a raw TCP socket or a TLS session behind one type so the
//! connection state machine is transport-agnostic. The TLS layer buffers
//! plaintext internally; tokio-rustls keeps polling the rustls session
//! until it reports pending I/O, which preserves the retry-until-blocked
//! semantics a readiness-based loop would need.

use crate::{ProxyError, Result};
use rustls::pki_types::CertificateDer;
use rustls::{HandshakeKind, ProtocolVersion, ServerConfig};
use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::TcpStream;
use tokio_rustls::server::TlsStream;
use tokio_rustls::TlsAcceptor;

/// A client connection stream, plain or TLS-wrapped.
pub enum Stream {
    /// Plain TCP.
    Plain(TcpStream),

    /// TLS session over TCP.
    Tls(Box<TlsStream<TcpStream>>),
}

/// Facts observed at TLS handshake completion.
#[derive(Debug, Clone, Copy, Default)]
pub struct TlsHandshakeInfo {
    /// Negotiated protocol version.
    pub version: Option<ProtocolVersion>,

    /// True when the session was resumed rather than fully negotiated.
    pub resumed: bool,
}

impl Stream {
    /// Completes the TLS handshake on an accepted socket.
    pub async fn accept_tls(
        acceptor: &TlsAcceptor,
        socket: TcpStream,
    ) -> Result<(Self, TlsHandshakeInfo)> {
        let tls = acceptor
            .accept(socket)
            .await
            .map_err(|e| ProxyError::Tls(e.to_string()))?;

        let info = {
            let (_, session) = tls.get_ref();
            TlsHandshakeInfo {
                version: session.protocol_version(),
                resumed: session.handshake_kind() == Some(HandshakeKind::Resumed),
            }
        };

        Ok((Self::Tls(Box::new(tls)), info))
    }

    /// True for TLS-wrapped streams.
    pub fn is_tls(&self) -> bool {
        matches!(self, Self::Tls(_))
    }
}

impl AsyncRead for Stream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            Self::Plain(s) => Pin::new(s).poll_read(cx, buf),
            Self::Tls(s) => Pin::new(s.as_mut()).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for Stream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        match self.get_mut() {
            Self::Plain(s) => Pin::new(s).poll_write(cx, buf),
            Self::Tls(s) => Pin::new(s.as_mut()).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            Self::Plain(s) => Pin::new(s).poll_flush(cx),
            Self::Tls(s) => Pin::new(s.as_mut()).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            Self::Plain(s) => Pin::new(s).poll_shutdown(cx),
            Self::Tls(s) => Pin::new(s.as_mut()).poll_shutdown(cx),
        }
    }
}

/// Loads a rustls server configuration from PEM certificate and key files.
pub fn load_tls_config<P: AsRef<Path>>(cert_path: P, key_path: P) -> Result<Arc<ServerConfig>> {
    let cert_file = File::open(cert_path.as_ref())
        .map_err(|e| ProxyError::Tls(format!("failed to open certificate file: {e}")))?;
    let mut cert_reader = BufReader::new(cert_file);
    let certs: Vec<CertificateDer<'static>> = rustls_pemfile::certs(&mut cert_reader)
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(|e| ProxyError::Tls(format!("failed to parse certificates: {e}")))?;

    if certs.is_empty() {
        return Err(ProxyError::Tls("no certificates found in file".into()));
    }

    let key_file = File::open(key_path.as_ref())
        .map_err(|e| ProxyError::Tls(format!("failed to open key file: {e}")))?;
    let mut key_reader = BufReader::new(key_file);
    let key = rustls_pemfile::private_key(&mut key_reader)
        .map_err(|e| ProxyError::Tls(format!("failed to parse private key: {e}")))?
        .ok_or_else(|| ProxyError::Tls("no private key found in file".into()))?;

    let config = ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .map_err(|e| ProxyError::Tls(format!("failed to build TLS config: {e}")))?;

    Ok(Arc::new(config))
}
