use bytes::Bytes;
use std::fmt;
use std::net::IpAddr;

/// A forward or reverse path as named on a MAIL FROM / RCPT TO line.
#[derive(Eq, PartialEq, Debug, Clone)]
pub enum SmtpPath {
    /// A validated `local@domain` address.
    Mailbox(String),
    /// The special `postmaster` recipient, accepted without a domain.
    Postmaster,
    /// The `<>` null reverse path used by bounce messages.
    Null,
}

impl SmtpPath {
    pub fn address(&self) -> &str {
        match self {
            SmtpPath::Null => "",
            SmtpPath::Postmaster => "POSTMASTER",
            SmtpPath::Mailbox(ref address) => address,
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, SmtpPath::Null)
    }

    /// The domain part of the address, without the `@`.
    pub fn domain(&self) -> Option<&str> {
        match self {
            SmtpPath::Mailbox(address) => address.splitn(2, '@').nth(1),
            _ => None,
        }
    }
}

impl fmt::Display for SmtpPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "<{}>", self.address())
    }
}

/// A complete received message, handed to the mail sink exactly once per
/// finished transaction.
#[derive(Debug, Clone)]
pub struct Mail {
    /// The domain token the client presented in HELO/EHLO.
    pub helo: String,
    /// The peer IP captured at accept.
    pub peer_ip: IpAddr,
    /// The reverse path; `SmtpPath::Null` for bounce mail.
    pub sender: SmtpPath,
    /// Forward paths in the order they were accepted. No duplicates.
    pub recipients: Vec<SmtpPath>,
    /// The message body as received, CRLF line endings, dot-unstuffed,
    /// without the terminating `.` line.
    pub body: Bytes,
}
