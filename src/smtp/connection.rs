//! Line-oriented I/O over a client connection, plain or TLS.
//!
//! The connection starts as a buffered plain stream and can be swapped for a
//! server-side TLS stream once during STARTTLS. It is generic over the
//! underlying stream so protocol tests can drive it with in-memory pipes.

use anyhow::{bail, Result};
use log::debug;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufStream};
use tokio_rustls::{server::TlsStream, TlsAcceptor};

pub enum Connection<S: AsyncRead + AsyncWrite + Unpin + Send> {
    Plain(BufStream<S>),
    Tls(Box<BufStream<TlsStream<S>>>),
    /// Transient placeholder while a TLS handshake replaces the plain stream.
    Detached,
}

impl<S: AsyncRead + AsyncWrite + Unpin + Send> Connection<S> {
    pub fn new(stream: S) -> Self {
        Self::Plain(BufStream::new(stream))
    }

    /// Reads one CRLF-terminated line, with the line ending trimmed.
    ///
    /// Returns `None` when the peer has closed the connection.
    pub async fn read_line(&mut self) -> Result<Option<String>> {
        let mut buffer = String::new();
        let bytes_read = match self {
            Self::Plain(stream) => stream.read_line(&mut buffer).await?,
            Self::Tls(stream) => stream.read_line(&mut buffer).await?,
            Self::Detached => bail!("connection detached"),
        };
        if bytes_read == 0 {
            return Ok(None);
        }
        let line = buffer.trim_end_matches(['\r', '\n']).to_string();
        debug!("SMTP read: {}", line);
        Ok(Some(line))
    }

    /// Writes a single line (appending CRLF) and flushes it to the peer.
    pub async fn write_line(&mut self, line: &str) -> Result<()> {
        debug!("SMTP write: {}", line);
        let payload = format!("{}\r\n", line);
        match self {
            Self::Plain(stream) => {
                stream.write_all(payload.as_bytes()).await?;
                stream.flush().await?;
            }
            Self::Tls(stream) => {
                stream.write_all(payload.as_bytes()).await?;
                stream.flush().await?;
            }
            Self::Detached => bail!("connection detached"),
        }
        Ok(())
    }

    /// Runs the server side of a TLS handshake over the plain stream and
    /// returns the encrypted connection. Only a plain connection can be
    /// upgraded; the tls flag on the session stays monotonic.
    pub async fn upgrade(self, acceptor: &TlsAcceptor) -> Result<Self> {
        match self {
            Self::Plain(stream) => {
                let stream = acceptor.accept(stream.into_inner()).await?;
                Ok(Self::Tls(Box::new(BufStream::new(stream))))
            }
            Self::Tls(_) => bail!("connection is already encrypted"),
            Self::Detached => bail!("connection detached"),
        }
    }

    pub fn is_tls(&self) -> bool {
        matches!(self, Self::Tls(_))
    }
}
