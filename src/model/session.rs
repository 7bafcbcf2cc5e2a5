use crate::grammar::{Grammar, ParseError, SmtpCommand};
use crate::model::mail::{Mail, SmtpPath};
use crate::model::response::SmtpReply;
use crate::service::{SpfOutcome, SpfPolicy};
use bytes::BytesMut;
use std::net::IpAddr;
use std::sync::Arc;

/// Listener-level settings the session consults while handling commands.
/// One instance is shared by all connections of a listener.
pub struct SessionConfig {
    /// Body byte cap, advertised in the EHLO banner as `SIZE`.
    pub max_msg_size: usize,
    /// RCPT TO cap; `None` means unlimited.
    pub max_rcpts: Option<usize>,
    /// Envelope commands answer 523 until the stream is encrypted.
    pub require_tls: bool,
    /// STARTTLS is available (advertised and accepted).
    pub offer_tls: bool,
    /// Optional SPF policy consulted after MAIL FROM parsing.
    pub spf: Option<Arc<dyn SpfPolicy>>,
    pub grammar: Grammar,
}

/// What the session wants done with one inbound line.
#[derive(Debug)]
pub enum LineOutcome {
    /// Body line accumulated, no reply due.
    Silent,
    /// Write this reply.
    Reply(SmtpReply),
    /// A transaction completed: deliver the mail, then write the reply.
    Delivered(Mail, SmtpReply),
}

/// Derived session state, mostly useful for assertions and logging.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionStage {
    Idle,
    Greeted,
    Envelope,
    Body,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct Helo {
    name: String,
    extended: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct Transaction {
    sender: SmtpPath,
    recipients: Vec<SmtpPath>,
}

enum Phase {
    /// Waiting for a command; the transaction exists once MAIL FROM passed.
    Command(Option<Transaction>),
    /// Between DATA and the `.` terminator; body accumulates here.
    Body { txn: Transaction, data: BytesMut },
}

/// The per-connection SMTP session.
///
/// The session is owned by its connection task; all mutation is serial, so
/// no locking happens here. It turns framed lines into replies and completed
/// transactions, leaving all I/O to the connection driver.
pub struct Session {
    config: Arc<SessionConfig>,
    peer_ip: IpAddr,
    tls_enabled: bool,
    helo: Option<Helo>,
    phase: Phase,
}

impl Session {
    pub fn new(peer_ip: IpAddr, tls_enabled: bool, config: Arc<SessionConfig>) -> Self {
        Self {
            config,
            peer_ip,
            tls_enabled,
            helo: None,
            phase: Phase::Command(None),
        }
    }

    pub fn is_in_body(&self) -> bool {
        matches!(self.phase, Phase::Body { .. })
    }

    pub fn tls_enabled(&self) -> bool {
        self.tls_enabled
    }

    /// Did the client greet with the extended EHLO form?
    pub fn said_ehlo(&self) -> bool {
        self.helo.as_ref().map_or(false, |h| h.extended)
    }

    pub fn stage(&self) -> SessionStage {
        match (&self.phase, &self.helo) {
            (Phase::Body { .. }, _) => SessionStage::Body,
            (Phase::Command(Some(_)), _) => SessionStage::Envelope,
            (Phase::Command(None), Some(_)) => SessionStage::Greeted,
            (Phase::Command(None), None) => SessionStage::Idle,
        }
    }

    /// Bytes of body accumulated so far; zero outside body mode.
    pub fn body_len(&self) -> usize {
        match &self.phase {
            Phase::Body { data, .. } => data.len(),
            Phase::Command(_) => 0,
        }
    }

    /// Abort the transaction because the body outgrew the configured cap
    /// before its current line even ended. Same outcome as an oversized
    /// append: the body is discarded, the session fully resets and the
    /// connection stays open.
    pub fn discard_oversized_body(&mut self) -> SmtpReply {
        self.reset_all();
        SmtpReply::MessageTooBig
    }

    /// Full reset after a successful STARTTLS handshake. Nothing from the
    /// plaintext phase survives except the now encrypted stream.
    pub fn reset_for_tls(&mut self) {
        self.reset_all();
        self.tls_enabled = true;
    }

    /// Handle one framed line, body or command mode as appropriate.
    pub fn handle_line(&mut self, raw: &[u8]) -> LineOutcome {
        if self.is_in_body() {
            return self.handle_body_line(raw);
        }
        let text = String::from_utf8_lossy(raw);
        let line = text.trim_end_matches(' ');
        if line.is_empty() {
            return LineOutcome::Silent;
        }
        LineOutcome::Reply(self.handle_command(line))
    }

    fn handle_command(&mut self, line: &str) -> SmtpReply {
        let cmd = match self.config.grammar.parse_command(line) {
            Err(ParseError::InvalidArgCount) => return SmtpReply::InvalidArgCount,
            Err(ParseError::SyntaxError) => return SmtpReply::SyntaxError,
            Ok(cmd) => cmd,
        };
        match cmd {
            SmtpCommand::Helo(domain) => self.cmd_helo(domain, false),
            SmtpCommand::Ehlo(domain) => self.cmd_helo(domain, true),
            SmtpCommand::Mail { path } => self.cmd_mail(&path),
            SmtpCommand::Rcpt { path } => self.cmd_rcpt(&path),
            SmtpCommand::Data => self.cmd_data(),
            SmtpCommand::Rset => self.cmd_rset(),
            SmtpCommand::Noop => SmtpReply::Ok,
            SmtpCommand::Quit => SmtpReply::Goodbye,
            SmtpCommand::StartTls => self.cmd_starttls(),
            SmtpCommand::Help => SmtpReply::Help,
            SmtpCommand::Vrfy | SmtpCommand::Expn => SmtpReply::WillNotVerify,
            SmtpCommand::NotImplemented(_) => SmtpReply::NotImplemented,
            SmtpCommand::Obsolete(_) => SmtpReply::ObsoleteVerb,
            SmtpCommand::Unknown(_) => SmtpReply::UnknownVerb,
        }
    }

    fn cmd_helo(&mut self, domain: String, extended: bool) -> SmtpReply {
        if self.helo.is_some() {
            return SmtpReply::InvalidSequence;
        }
        if !self.config.grammar.is_valid_helo(&domain) {
            return SmtpReply::SyntaxError;
        }
        self.helo = Some(Helo {
            name: domain,
            extended,
        });
        if !extended {
            return SmtpReply::Hello;
        }
        let mut extensions = vec![
            "PIPELINING".to_owned(),
            format!("SIZE {}", self.config.max_msg_size),
        ];
        if self.config.offer_tls && !self.tls_enabled {
            extensions.push("STARTTLS".to_owned());
        }
        SmtpReply::Ehlo(extensions)
    }

    fn cmd_mail(&mut self, path: &str) -> SmtpReply {
        let in_transaction = matches!(self.phase, Phase::Command(Some(_)));
        if self.helo.is_none() || in_transaction {
            return SmtpReply::InvalidSequence;
        }
        if self.config.require_tls && !self.tls_enabled {
            return SmtpReply::TlsRequired;
        }
        let sender = if path == "<>" {
            SmtpPath::Null
        } else {
            match self.config.grammar.extract_address(path) {
                Some(address) => SmtpPath::Mailbox(address.to_owned()),
                None => return SmtpReply::InvalidAddress,
            }
        };
        if let (Some(spf), SmtpPath::Mailbox(address)) = (&self.config.spf, &sender) {
            let domain = sender.domain().unwrap_or("");
            match spf.check(self.peer_ip, domain, address) {
                Err(e) => {
                    debug!("spf policy errored for {}: {}", address, e);
                    return SmtpReply::SpfError;
                }
                Ok(SpfOutcome::Fail) => return SmtpReply::SpfFailed,
                Ok(SpfOutcome::Pass) => {}
            }
        }
        self.phase = Phase::Command(Some(Transaction {
            sender,
            recipients: vec![],
        }));
        SmtpReply::Ok
    }

    fn cmd_rcpt(&mut self, path: &str) -> SmtpReply {
        if !matches!(self.phase, Phase::Command(Some(_))) {
            return SmtpReply::InvalidSequence;
        }
        if self.config.require_tls && !self.tls_enabled {
            return SmtpReply::TlsRequired;
        }
        let recipient = match self.config.grammar.extract_address(path) {
            Some(address) => SmtpPath::Mailbox(address.to_owned()),
            None => {
                // the path token is bracketed by the line shape check
                let inner = &path[1..path.len() - 1];
                if inner.eq_ignore_ascii_case("postmaster") {
                    SmtpPath::Postmaster
                } else {
                    return SmtpReply::InvalidAddress;
                }
            }
        };
        let max_rcpts = self.config.max_rcpts;
        let txn = match &mut self.phase {
            Phase::Command(Some(txn)) => txn,
            Phase::Command(None) | Phase::Body { .. } => return SmtpReply::InvalidSequence,
        };
        if let Some(max) = max_rcpts {
            if txn.recipients.len() >= max {
                return SmtpReply::TooManyRecipients;
            }
        }
        if txn
            .recipients
            .iter()
            .any(|r| r.address() == recipient.address())
        {
            return SmtpReply::DuplicateRecipient;
        }
        txn.recipients.push(recipient);
        SmtpReply::Ok
    }

    fn cmd_data(&mut self) -> SmtpReply {
        match &mut self.phase {
            Phase::Command(Some(txn)) if !txn.recipients.is_empty() => {
                if self.config.require_tls && !self.tls_enabled {
                    return SmtpReply::TlsRequired;
                }
                let txn = txn.clone();
                self.phase = Phase::Body {
                    txn,
                    data: BytesMut::new(),
                };
                SmtpReply::StartMail
            }
            _ => SmtpReply::InvalidSequence,
        }
    }

    fn cmd_rset(&mut self) -> SmtpReply {
        self.reset_all();
        SmtpReply::SessionReset
    }

    fn cmd_starttls(&mut self) -> SmtpReply {
        if self.tls_enabled {
            return SmtpReply::InvalidSequence;
        }
        if !self.config.offer_tls {
            return SmtpReply::NotImplemented;
        }
        SmtpReply::TlsUpgradeReady
    }

    fn handle_body_line(&mut self, raw: &[u8]) -> LineOutcome {
        let (txn, data) = match &mut self.phase {
            Phase::Body { txn, data } => (txn, data),
            Phase::Command(_) => {
                warn!("body line outside body mode");
                return LineOutcome::Reply(SmtpReply::InvalidSequence);
            }
        };
        if raw == b"." {
            let txn = txn.clone();
            let body = std::mem::take(data).freeze();
            let helo = self
                .helo
                .as_ref()
                .map(|h| h.name.clone())
                .unwrap_or_default();
            let mail = Mail {
                helo,
                peer_ip: self.peer_ip,
                sender: txn.sender,
                recipients: txn.recipients,
                body,
            };
            // back to command mode, HELO identity survives for the next
            // transaction on this connection
            self.phase = Phase::Command(None);
            return LineOutcome::Delivered(mail, SmtpReply::Ok);
        }
        // dot-unstuffing: the client doubles a leading dot, undo it
        let content = if raw.starts_with(b".") { &raw[1..] } else { raw };
        data.extend_from_slice(content);
        data.extend_from_slice(b"\r\n");
        if data.len() > self.config.max_msg_size {
            self.reset_all();
            return LineOutcome::Reply(SmtpReply::MessageTooBig);
        }
        LineOutcome::Silent
    }

    fn reset_all(&mut self) {
        self.helo = None;
        self.phase = Phase::Command(None);
    }
}
