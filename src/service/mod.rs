//! The three application seams of the listener.
//!
//! All of them are plain synchronous calls made from the connection task that
//! owns the session, so they block that one connection while they run. They
//! must be callable from many connection tasks at once.

use crate::common::Result;
use crate::model::mail::Mail;
use crate::server::ServerError;
use std::net::IpAddr;

/// The application's mail sink. Receives every completed transaction,
/// exactly once, before the session resets for the next one.
pub trait MailSink: Send + Sync {
    fn deliver(&self, mail: Mail);
}

impl<F> MailSink for F
where
    F: Fn(Mail) + Send + Sync,
{
    fn deliver(&self, mail: Mail) {
        self(mail)
    }
}

/// Verdict of an SPF check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpfOutcome {
    Pass,
    Fail,
}

/// Sender policy check, consulted after MAIL FROM parsing.
///
/// `domain` is the domain part of the sender address without the leading `@`;
/// `sender` is the whole address. The check is skipped for the `<>` null
/// reverse path. An `Err` answers the client with `451 SPF ERROR`,
/// `Ok(SpfOutcome::Fail)` with `550 SPF FAILED`.
pub trait SpfPolicy: Send + Sync {
    fn check(&self, peer_ip: IpAddr, domain: &str, sender: &str) -> Result<SpfOutcome>;
}

impl<F> SpfPolicy for F
where
    F: Fn(IpAddr, &str, &str) -> Result<SpfOutcome> + Send + Sync,
{
    fn check(&self, peer_ip: IpAddr, domain: &str, sender: &str) -> Result<SpfOutcome> {
        self(peer_ip, domain, sender)
    }
}

/// Hears about every non-fatal error: failed accepts, reads, writes, TLS
/// handshakes and framing violations. Fatal listener errors are returned
/// from `listen()` instead.
pub trait ErrorSink: Send + Sync {
    fn report(&self, error: &ServerError);
}

impl<F> ErrorSink for F
where
    F: Fn(&ServerError) + Send + Sync,
{
    fn report(&self, error: &ServerError) {
        self(error)
    }
}
