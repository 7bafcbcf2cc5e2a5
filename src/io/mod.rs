//! The connection byte stream.
//!
//! A connection is either plain TCP or TLS over TCP. The driver owns one
//! `SmtpStream` and rebinds it across the STARTTLS handshake; the reader and
//! writer never need to know which side of the handshake they are on.

pub mod tls;

use async_std::net::TcpStream;
use async_tls::server::TlsStream;
use async_tls::TlsAcceptor;
use futures::io::{AsyncRead, AsyncWrite};
use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};

pub enum SmtpStream {
    Plain(TcpStream),
    Tls(Box<TlsStream<TcpStream>>),
}

impl SmtpStream {
    pub fn is_encrypted(&self) -> bool {
        matches!(self, SmtpStream::Tls(_))
    }

    /// Run the server side handshake, swapping the plain transport for the
    /// encrypted one. An already encrypted stream passes through untouched;
    /// the session refuses a second STARTTLS before it gets here.
    pub async fn encrypt(self, acceptor: &TlsAcceptor) -> io::Result<SmtpStream> {
        match self {
            SmtpStream::Plain(tcp) => {
                let tls = acceptor.accept(tcp).await?;
                Ok(SmtpStream::Tls(Box::new(tls)))
            }
            encrypted @ SmtpStream::Tls(_) => Ok(encrypted),
        }
    }
}

impl AsyncRead for SmtpStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut [u8],
    ) -> Poll<io::Result<usize>> {
        match self.get_mut() {
            SmtpStream::Plain(stream) => Pin::new(stream).poll_read(cx, buf),
            SmtpStream::Tls(stream) => Pin::new(stream.as_mut()).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for SmtpStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match self.get_mut() {
            SmtpStream::Plain(stream) => Pin::new(stream).poll_write(cx, buf),
            SmtpStream::Tls(stream) => Pin::new(stream.as_mut()).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            SmtpStream::Plain(stream) => Pin::new(stream).poll_flush(cx),
            SmtpStream::Tls(stream) => Pin::new(stream.as_mut()).poll_flush(cx),
        }
    }

    fn poll_close(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            SmtpStream::Plain(stream) => Pin::new(stream).poll_close(cx),
            SmtpStream::Tls(stream) => Pin::new(stream.as_mut()).poll_close(cx),
        }
    }
}
