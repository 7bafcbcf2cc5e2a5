/* codes are arranged according to rfc5321:

   2yz  Positive Completion reply
   3yz  Positive Intermediate reply (DATA)
   4yz  Transient Negative Completion reply
   5yz  Permanent Negative Completion reply
*/

use crate::common::CRLF;
use std::fmt;

/// The catalog of replies this server sends.
///
/// Each variant knows its three digit status code, its primary text line and
/// any continuation lines, plus the two control flags the connection driver
/// acts on: terminate the connection, or upgrade the stream to TLS. The
/// `Display` implementation renders the wire form.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SmtpReply {
    /// 220, the connection greeting
    ServiceReady(String),
    /// 220, accepted STARTTLS - the driver runs the handshake next
    TlsUpgradeReady,
    /// 221, QUIT acknowledged - the driver closes the connection
    Goodbye,
    /// 250
    Ok,
    /// 250, HELO acknowledged
    Hello,
    /// 250 multi-line, EHLO acknowledged with extension keywords
    Ehlo(Vec<String>),
    /// 250, RSET acknowledged
    SessionReset,
    /// 250 multi-line, the supported verbs
    Help,
    /// 252, VRFY and EXPN are refused
    WillNotVerify,
    /// 354, DATA accepted, body follows
    StartMail,
    /// 451, the SPF policy errored out
    SpfError,
    /// 451, connection cap reached - the driver closes the connection
    Oversaturated,
    /// 500
    SyntaxError,
    /// 500
    UnknownVerb,
    /// 501
    InvalidArgCount,
    /// 501
    InvalidAddress,
    /// 502, AUTH and TURN
    NotImplemented,
    /// 502, SEND, SAML, SOML and friends
    ObsoleteVerb,
    /// 503
    InvalidSequence,
    /// 523, plaintext envelope commands while STARTTLS is mandatory
    TlsRequired,
    /// 550, the SPF policy rejected the sender
    SpfFailed,
    /// 550
    DuplicateRecipient,
    /// 550
    TooManyRecipients,
    /// 554, body grew past the configured cap
    MessageTooBig,
}

impl SmtpReply {
    pub fn code(&self) -> u16 {
        use SmtpReply::*;
        match self {
            ServiceReady(_) | TlsUpgradeReady => 220,
            Goodbye => 221,
            Ok | Hello | Ehlo(_) | SessionReset | Help => 250,
            WillNotVerify => 252,
            StartMail => 354,
            SpfError | Oversaturated => 451,
            SyntaxError | UnknownVerb => 500,
            InvalidArgCount | InvalidAddress => 501,
            NotImplemented | ObsoleteVerb => 502,
            InvalidSequence => 503,
            TlsRequired => 523,
            SpfFailed | DuplicateRecipient | TooManyRecipients => 550,
            MessageTooBig => 554,
        }
    }

    /// The primary text line.
    pub fn message(&self) -> String {
        use SmtpReply::*;
        match self {
            ServiceReady(domain) => format!("{} ESMTP SERVICE READY", domain),
            TlsUpgradeReady => "READY FOR TLS UPGRADE".to_owned(),
            Goodbye => "GOODBYE".to_owned(),
            Ok => "OK".to_owned(),
            Hello | Ehlo(_) => "HELLO".to_owned(),
            SessionReset => "SESSION RESET".to_owned(),
            Help => "HELP".to_owned(),
            WillNotVerify => "WILL NOT VERIFY".to_owned(),
            StartMail => "START MAIL".to_owned(),
            SpfError => "SPF ERROR".to_owned(),
            Oversaturated => "LISTENER OVERSATURATED".to_owned(),
            SyntaxError => "SYNTAX ERROR".to_owned(),
            UnknownVerb => "UNKNOWN VERB".to_owned(),
            InvalidArgCount => "INVALID NUMBER OF ARGS".to_owned(),
            InvalidAddress => "INVALID ADDRESS".to_owned(),
            NotImplemented => "NOT IMPLEMENTED".to_owned(),
            ObsoleteVerb => "OBSOLETE VERB".to_owned(),
            InvalidSequence => "INVALID SEQUENCE".to_owned(),
            TlsRequired => "TLS REQUIRED".to_owned(),
            SpfFailed => "SPF FAILED".to_owned(),
            DuplicateRecipient => "DUPLICATE RECIPIENT".to_owned(),
            TooManyRecipients => "TOO MANY RECIPIENTS".to_owned(),
            MessageTooBig => "MESSAGE TOO BIG".to_owned(),
        }
    }

    /// Continuation lines following the primary line, if any.
    pub fn extensions(&self) -> Vec<String> {
        match self {
            SmtpReply::Ehlo(extensions) => extensions.clone(),
            SmtpReply::Help => vec![
                "HELO EHLO MAIL RCPT DATA RSET".to_owned(),
                "NOOP QUIT STARTTLS HELP VRFY EXPN".to_owned(),
            ],
            _ => vec![],
        }
    }

    /// The driver closes the connection after writing this reply.
    pub fn terminates_connection(&self) -> bool {
        matches!(self, SmtpReply::Goodbye | SmtpReply::Oversaturated)
    }

    /// The driver runs the server side TLS handshake after writing this reply.
    pub fn upgrades_tls(&self) -> bool {
        matches!(self, SmtpReply::TlsUpgradeReady)
    }
}

impl fmt::Display for SmtpReply {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let code = self.code();
        let extensions = self.extensions();
        if extensions.is_empty() {
            return write!(f, "{} {}{}", code, self.message(), CRLF);
        }
        write!(f, "{}-{}{}", code, self.message(), CRLF)?;
        let last = extensions.len() - 1;
        for (i, line) in extensions.iter().enumerate() {
            if i == last {
                write!(f, "{} {}{}", code, line, CRLF)?;
            } else {
                write!(f, "{}-{}{}", code, line, CRLF)?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn single_line_wire_form() {
        assert_eq!(SmtpReply::Ok.to_string(), "250 OK\r\n");
        assert_eq!(SmtpReply::Hello.to_string(), "250 HELLO\r\n");
        assert_eq!(SmtpReply::Goodbye.to_string(), "221 GOODBYE\r\n");
        assert_eq!(SmtpReply::StartMail.to_string(), "354 START MAIL\r\n");
        assert_eq!(
            SmtpReply::ServiceReady("localhost".to_owned()).to_string(),
            "220 localhost ESMTP SERVICE READY\r\n"
        );
    }

    #[test]
    fn ehlo_banner_wire_form() {
        let reply = SmtpReply::Ehlo(vec![
            "PIPELINING".to_owned(),
            "SIZE 1024".to_owned(),
            "STARTTLS".to_owned(),
        ]);
        assert_eq!(
            reply.to_string(),
            "250-HELLO\r\n250-PIPELINING\r\n250-SIZE 1024\r\n250 STARTTLS\r\n"
        );
    }

    #[test]
    fn ehlo_banner_without_starttls() {
        let reply = SmtpReply::Ehlo(vec!["PIPELINING".to_owned(), "SIZE 1024".to_owned()]);
        assert_eq!(
            reply.to_string(),
            "250-HELLO\r\n250-PIPELINING\r\n250 SIZE 1024\r\n"
        );
    }

    #[test]
    fn control_flags() {
        assert!(SmtpReply::Goodbye.terminates_connection());
        assert!(SmtpReply::Oversaturated.terminates_connection());
        assert!(SmtpReply::TlsUpgradeReady.upgrades_tls());
        assert!(!SmtpReply::Ok.terminates_connection());
        assert!(!SmtpReply::Ok.upgrades_tls());
        assert!(!SmtpReply::MessageTooBig.terminates_connection());
    }
}
