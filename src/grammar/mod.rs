use regex::Regex;

/// A parsed command line. Verbs are matched case insensitively; arguments
/// keep the case the client sent.
///
/// `Mail` and `Rcpt` carry the bracketed path token verbatim (for example
/// `<bob@example.org>` or `<>`). Address validation happens in the session so
/// that sequencing errors take precedence over a bad address.
#[derive(Eq, PartialEq, Debug, Clone)]
pub enum SmtpCommand {
    Helo(String),
    Ehlo(String),
    Mail { path: String },
    Rcpt { path: String },
    Data,
    Rset,
    Noop,
    Quit,
    StartTls,
    Help,
    Vrfy,
    Expn,
    NotImplemented(String),
    Obsolete(String),
    Unknown(String),
}

#[derive(Eq, PartialEq, Debug, Clone, Copy)]
pub enum ParseError {
    /// Wrong number of positional arguments for the verb.
    InvalidArgCount,
    /// The line does not match the shape the verb requires.
    SyntaxError,
}

/// Compiled patterns for token validation and command line shapes.
pub struct Grammar {
    helo: Regex,
    address: Regex,
    mail_from: Regex,
    rcpt_to: Regex,
    bracketed: Regex,
}

impl Default for Grammar {
    fn default() -> Self {
        Self::new()
    }
}

impl Grammar {
    pub fn new() -> Self {
        Self {
            helo: Regex::new(r"^[a-zA-Z0-9\-./_:\[\]\\]{1,255}$").unwrap(),
            address: Regex::new(r"^[^@]{1,64}@[a-zA-Z0-9\-.]{1,255}$").unwrap(),
            mail_from: Regex::new(r"(?i)^MAIL FROM: ?<[^<>]*>( <[^<>]+>)*$").unwrap(),
            rcpt_to: Regex::new(r"(?i)^RCPT TO: ?<[^<>]+>( <[^<>]+>)*$").unwrap(),
            bracketed: Regex::new(r"<[^<>]*>").unwrap(),
        }
    }

    /// Is this an acceptable HELO/EHLO domain token?
    pub fn is_valid_helo(&self, token: &str) -> bool {
        self.helo.is_match(token)
    }

    /// Extract a validated address from its bracketed form.
    ///
    /// The input must start with `<`, end with `>` and the inner text must
    /// look like `local@domain`. The empty form `<>` is not a valid address
    /// here; MAIL FROM handles the null reverse path before calling this.
    pub fn extract_address<'a>(&self, bracketed: &'a str) -> Option<&'a str> {
        if !bracketed.starts_with('<') || !bracketed.ends_with('>') || bracketed.len() < 2 {
            return None;
        }
        let address = &bracketed[1..bracketed.len() - 1];
        if self.address.is_match(address) {
            Some(address)
        } else {
            None
        }
    }

    /// Parse one command mode line.
    pub fn parse_command(&self, line: &str) -> Result<SmtpCommand, ParseError> {
        let words: Vec<&str> = line.split(' ').collect();
        let verb = words[0].to_ascii_uppercase();
        match verb.as_str() {
            "HELO" => self.one_arg(&words).map(SmtpCommand::Helo),
            "EHLO" => self.one_arg(&words).map(SmtpCommand::Ehlo),
            "MAIL" => {
                if !self.mail_from.is_match(line) {
                    return Err(ParseError::SyntaxError);
                }
                Ok(SmtpCommand::Mail {
                    path: self.first_bracketed(line)?,
                })
            }
            "RCPT" => {
                if !self.rcpt_to.is_match(line) {
                    return Err(ParseError::SyntaxError);
                }
                Ok(SmtpCommand::Rcpt {
                    path: self.first_bracketed(line)?,
                })
            }
            "DATA" => self.no_args(&words, SmtpCommand::Data),
            "QUIT" => self.no_args(&words, SmtpCommand::Quit),
            "RSET" => self.no_args(&words, SmtpCommand::Rset),
            "NOOP" => self.no_args(&words, SmtpCommand::Noop),
            "STARTTLS" => self.no_args(&words, SmtpCommand::StartTls),
            "HELP" => Ok(SmtpCommand::Help),
            "VRFY" => Ok(SmtpCommand::Vrfy),
            "EXPN" => Ok(SmtpCommand::Expn),
            "AUTH" | "TURN" => Ok(SmtpCommand::NotImplemented(verb)),
            "SEND" | "SAML" | "SOML" | "TLS" | "STARTSSL" | "RELAY" => {
                Ok(SmtpCommand::Obsolete(verb))
            }
            _ => Ok(SmtpCommand::Unknown(verb)),
        }
    }

    fn one_arg(&self, words: &[&str]) -> Result<String, ParseError> {
        if words.len() != 2 {
            return Err(ParseError::InvalidArgCount);
        }
        Ok(words[1].to_owned())
    }

    fn no_args(&self, words: &[&str], cmd: SmtpCommand) -> Result<SmtpCommand, ParseError> {
        if words.len() != 1 {
            return Err(ParseError::InvalidArgCount);
        }
        Ok(cmd)
    }

    fn first_bracketed(&self, line: &str) -> Result<String, ParseError> {
        self.bracketed
            .find(line)
            .map(|m| m.as_str().to_owned())
            .ok_or(ParseError::SyntaxError)
    }
}
