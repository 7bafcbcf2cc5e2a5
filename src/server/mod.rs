//! The listener and the per-connection driver.
//!
//! One task accepts; every accepted connection gets its own task that owns
//! the stream, the framer and the session. Nothing per-connection is shared,
//! so the session runs lock free. The callbacks are the only shared state.

use crate::common::Result;
use crate::grammar::Grammar;
use crate::io::SmtpStream;
use crate::model::response::SmtpReply;
use crate::model::session::{LineOutcome, Session, SessionConfig};
use crate::protocol::{FramingError, LineFramer, MAX_LINE_LENGTH};
use crate::service::{ErrorSink, MailSink, SpfPolicy};
use async_std::io::prelude::*;
use async_std::net::{TcpListener, TcpStream};
use async_std::task;
use async_tls::TlsAcceptor;
use futures::stream::StreamExt;
use std::fmt;
use std::io;
use std::net::IpAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// How the listener relates to TLS.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TlsMode {
    /// The stream is encrypted from the first byte (port 465 style).
    Implicit,
    /// Plaintext until STARTTLS; envelope commands answer 523 until then.
    StartTlsRequired,
    /// STARTTLS accepted, plaintext tolerated throughout.
    StartTlsOptional,
    /// No TLS at all; STARTTLS answers 502.
    None,
}

/// A non-fatal error on one connection, reported to the error sink.
#[derive(Debug)]
pub enum ServerError {
    Accept(io::Error),
    /// Read failure; a read deadline expiry shows up here as `TimedOut`.
    Read(io::Error),
    Write(io::Error),
    TlsHandshake(io::Error),
    Framing(FramingError),
}

impl fmt::Display for ServerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ServerError::Accept(e) => write!(f, "failed to accept connection: {}", e),
            ServerError::Read(e) => write!(f, "failed to read from connection: {}", e),
            ServerError::Write(e) => write!(f, "failed to write to connection: {}", e),
            ServerError::TlsHandshake(e) => write!(f, "tls handshake failed: {}", e),
            ServerError::Framing(e) => write!(f, "framing violation: {}", e),
        }
    }
}

impl std::error::Error for ServerError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ServerError::Accept(e)
            | ServerError::Read(e)
            | ServerError::Write(e)
            | ServerError::TlsHandshake(e) => Some(e),
            ServerError::Framing(e) => Some(e),
        }
    }
}

/// The inbound SMTP listener.
///
/// Construct with the advertised domain and the mail sink, adjust with the
/// `with_*` builders, then `listen()`.
pub struct Listener {
    domain: String,
    host: String,
    port: u16,
    tls_mode: TlsMode,
    tls_config: Option<Arc<rustls::ServerConfig>>,
    max_rcpts: Option<usize>,
    max_msg_size: usize,
    max_connections: Option<usize>,
    connection_timeout: Duration,
    mail: Arc<dyn MailSink>,
    spf: Option<Arc<dyn SpfPolicy>>,
    errors: Option<Arc<dyn ErrorSink>>,
}

impl Listener {
    pub fn new(domain: impl ToString, mail: impl MailSink + 'static) -> Self {
        Self {
            domain: domain.to_string(),
            host: "0.0.0.0".to_owned(),
            port: 25,
            tls_mode: TlsMode::None,
            tls_config: None,
            max_rcpts: None,
            max_msg_size: 10 * 1024 * 1024,
            max_connections: None,
            connection_timeout: Duration::from_secs(5 * 60),
            mail: Arc::new(mail),
            spf: None,
            errors: None,
        }
    }

    /// Bind address, for example `("0.0.0.0", 25)`.
    pub fn on(mut self, host: impl ToString, port: u16) -> Self {
        self.host = host.to_string();
        self.port = port;
        self
    }

    pub fn with_tls_mode(mut self, mode: TlsMode) -> Self {
        self.tls_mode = mode;
        self
    }

    /// TLS material; required unless the mode is `TlsMode::None`.
    pub fn with_tls_config(mut self, config: Arc<rustls::ServerConfig>) -> Self {
        self.tls_config = Some(config);
        self
    }

    /// Cap on accepted RCPT TO lines per transaction.
    pub fn with_max_rcpts(mut self, max: usize) -> Self {
        self.max_rcpts = Some(max);
        self
    }

    /// Body byte cap, advertised as `SIZE` in the EHLO banner.
    pub fn with_max_msg_size(mut self, bytes: usize) -> Self {
        self.max_msg_size = bytes;
        self
    }

    /// Cap on concurrently served connections. Connections over the cap are
    /// greeted with `451 LISTENER OVERSATURATED` and closed.
    pub fn with_max_connections(mut self, max: usize) -> Self {
        self.max_connections = Some(max);
        self
    }

    /// Read deadline; an idle connection is dropped when it expires.
    pub fn with_connection_timeout(mut self, timeout: Duration) -> Self {
        self.connection_timeout = timeout;
        self
    }

    pub fn with_spf(mut self, policy: impl SpfPolicy + 'static) -> Self {
        self.spf = Some(Arc::new(policy));
        self
    }

    pub fn with_error_sink(mut self, sink: impl ErrorSink + 'static) -> Self {
        self.errors = Some(Arc::new(sink));
        self
    }

    /// Validate, bind and serve until the listening socket closes.
    ///
    /// Fatal errors (bad configuration, failure to bind) come back from this
    /// call; everything that concerns a single connection goes to the error
    /// sink and only costs that connection.
    pub async fn listen(self) -> Result<()> {
        let host = self.host.clone();
        let port = self.port;
        let acceptor = match (self.tls_mode, &self.tls_config) {
            (TlsMode::None, _) => None,
            (_, Some(config)) => Some(TlsAcceptor::from(config.clone())),
            (_, None) => return Err("tls config must be specified".into()),
        };
        let session_config = Arc::new(SessionConfig {
            max_msg_size: self.max_msg_size,
            max_rcpts: self.max_rcpts,
            require_tls: self.tls_mode == TlsMode::StartTlsRequired,
            offer_tls: self.tls_mode != TlsMode::None,
            spf: self.spf,
            grammar: Grammar::new(),
        });
        trace!("Binding on {}:{}", host, port);
        let listener = TcpListener::bind((host.as_str(), port))
            .await
            .map_err(|e| format!("Unable to bind {}:{}: {}", host, port, e))?;
        info!("Listening on {:?}", listener.local_addr());

        let core = Arc::new(ListenerCore {
            domain: self.domain,
            tls_mode: self.tls_mode,
            acceptor,
            connection_timeout: self.connection_timeout,
            max_connections: self.max_connections,
            live_connections: AtomicUsize::new(0),
            session_config,
            mail: self.mail,
            errors: self.errors,
        });

        let mut incoming = listener.incoming();
        while let Some(stream) = incoming.next().await {
            match stream {
                Err(e) => core.report(&ServerError::Accept(e)),
                Ok(tcp) => {
                    let core = core.clone();
                    task::spawn(serve_connection(core, tcp));
                }
            }
        }
        Ok(())
    }
}

struct ListenerCore {
    domain: String,
    tls_mode: TlsMode,
    acceptor: Option<TlsAcceptor>,
    connection_timeout: Duration,
    max_connections: Option<usize>,
    live_connections: AtomicUsize,
    session_config: Arc<SessionConfig>,
    mail: Arc<dyn MailSink>,
    errors: Option<Arc<dyn ErrorSink>>,
}

impl ListenerCore {
    fn report(&self, error: &ServerError) {
        debug!("{}", error);
        if let Some(errors) = &self.errors {
            errors.report(error);
        }
    }
}

/// Holds one slot in the live connection count for as long as it lives.
struct ConnectionSlot(Arc<ListenerCore>);

impl ConnectionSlot {
    fn admit(core: &Arc<ListenerCore>) -> (Self, bool) {
        let live = core.live_connections.fetch_add(1, Ordering::SeqCst) + 1;
        let admitted = core.max_connections.map_or(true, |max| live <= max);
        (ConnectionSlot(core.clone()), admitted)
    }
}

impl Drop for ConnectionSlot {
    fn drop(&mut self) {
        self.0.live_connections.fetch_sub(1, Ordering::SeqCst);
    }
}

async fn serve_connection(core: Arc<ListenerCore>, tcp: TcpStream) {
    let peer_ip = match tcp.peer_addr() {
        Ok(addr) => addr.ip(),
        Err(e) => {
            core.report(&ServerError::Accept(e));
            return;
        }
    };
    trace!("{} -- started connection", peer_ip);
    let (_slot, admitted) = ConnectionSlot::admit(&core);

    // implicit TLS handshakes before anything is said
    let mut stream = match (&core.acceptor, core.tls_mode) {
        (Some(acceptor), TlsMode::Implicit) => {
            match SmtpStream::Plain(tcp).encrypt(acceptor).await {
                Ok(stream) => stream,
                Err(e) => {
                    core.report(&ServerError::TlsHandshake(e));
                    return;
                }
            }
        }
        _ => SmtpStream::Plain(tcp),
    };

    if !admitted {
        trace!("{} -- refused, listener oversaturated", peer_ip);
        let refusal = SmtpReply::Oversaturated.to_string();
        if let Err(e) = stream.write_all(refusal.as_bytes()).await {
            core.report(&ServerError::Write(e));
        }
        return;
    }

    drive_session(&core, stream, peer_ip).await;
    trace!("{} -- closed connection", peer_ip);
}

enum Control {
    Terminate,
    Upgrade,
}

async fn drive_session(core: &Arc<ListenerCore>, mut stream: SmtpStream, peer_ip: IpAddr) {
    let mut session = Session::new(peer_ip, stream.is_encrypted(), core.session_config.clone());

    let greeting = SmtpReply::ServiceReady(core.domain.clone()).to_string();
    trace!("{} <- {:?}", peer_ip, greeting);
    if let Err(e) = stream.write_all(greeting.as_bytes()).await {
        core.report(&ServerError::Write(e));
        return;
    }

    let mut framer = LineFramer::new();
    let mut buffer = vec![0u8; MAX_LINE_LENGTH];
    loop {
        let read = async_std::io::timeout(core.connection_timeout, stream.read(&mut buffer)).await;
        let len = match read {
            Ok(0) => {
                trace!("{} -- peer closed the stream", peer_ip);
                return;
            }
            Ok(len) => len,
            Err(e) => {
                core.report(&ServerError::Read(e));
                return;
            }
        };
        framer.feed(&buffer[..len]);

        // all replies for one read go out in one write, in request order
        let mut responses = String::new();
        let mut control = None;
        loop {
            let line = match framer.next_line() {
                Some(line) => line,
                None => break,
            };
            trace!("{} -> {:?}", peer_ip, String::from_utf8_lossy(&line));
            match session.handle_line(&line) {
                LineOutcome::Silent => {}
                LineOutcome::Delivered(mail, reply) => {
                    debug!(
                        "{} -- received {} byte mail from {} for {} recipients",
                        peer_ip,
                        mail.body.len(),
                        mail.sender,
                        mail.recipients.len()
                    );
                    core.mail.deliver(mail);
                    responses.push_str(&reply.to_string());
                }
                LineOutcome::Reply(reply) => {
                    let terminate = reply.terminates_connection();
                    let upgrade = reply.upgrades_tls();
                    responses.push_str(&reply.to_string());
                    if terminate {
                        // remaining pipelined lines are ignored
                        control = Some(Control::Terminate);
                        break;
                    }
                    if upgrade {
                        control = Some(Control::Upgrade);
                        break;
                    }
                }
            }
        }

        // command mode input must arrive in whole CRLF lines, no longer than
        // one read buffer
        if control.is_none() && !session.is_in_body() && framer.pending() > 0 {
            let violation = if framer.pending() >= MAX_LINE_LENGTH {
                FramingError::LineTooLong
            } else {
                FramingError::MissingCrlf
            };
            responses.push_str(&SmtpReply::SyntaxError.to_string());
            let _ = stream.write_all(responses.as_bytes()).await;
            core.report(&ServerError::Framing(violation));
            return;
        }

        // a body line may outgrow the read buffer and is carried until its
        // CRLF arrives; the message size cap still bounds it
        if control.is_none()
            && session.is_in_body()
            && session.body_len() + framer.pending() > core.session_config.max_msg_size
        {
            framer.clear();
            responses.push_str(&session.discard_oversized_body().to_string());
        }

        if !responses.is_empty() {
            trace!("{} <- {:?}", peer_ip, responses);
            if let Err(e) = stream.write_all(responses.as_bytes()).await {
                core.report(&ServerError::Write(e));
                return;
            }
        }

        match control {
            None => {}
            Some(Control::Terminate) => return,
            Some(Control::Upgrade) => {
                let acceptor = match &core.acceptor {
                    Some(acceptor) => acceptor,
                    // the session only offers the upgrade when TLS is configured
                    None => return,
                };
                // nothing read in plaintext may survive past the handshake
                framer.clear();
                stream = match stream.encrypt(acceptor).await {
                    Ok(stream) => stream,
                    Err(e) => {
                        core.report(&ServerError::TlsHandshake(e));
                        return;
                    }
                };
                session.reset_for_tls();
                trace!("{} -- tls established", peer_ip);
            }
        }
    }
}
