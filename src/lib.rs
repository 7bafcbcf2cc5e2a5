//! An inbound SMTP/ESMTP server library.
//!
//! `smtpin` accepts TCP (or TLS) connections from mail-sending clients,
//! drives each one through the SMTP request/response protocol, assembles a
//! complete message and hands it to your application. It is a receiver only -
//! there is no relaying, no queueing, no mailbox storage and no outbound
//! delivery.
//!
//! # Installation
//!
//! Add this to your `Cargo.toml`:
//!
//! ```toml
//! [dependencies]
//! smtpin = "0"
//! ```
//!
//! # Usage
//!
//! There are a few interesting provisions one could take away here:
//! * The listener (through `server::Listener`) - configure the bind address,
//!   TLS mode and limits, then `listen()`.
//! * The callbacks (`service::MailSink`, `service::SpfPolicy`,
//!   `service::ErrorSink`) - plain closures work; this is where your
//!   application receives mail and hears about trouble.
//! * The session and domain model (`model::session`, `model::response`,
//!   `model::mail`) - these describe the protocol behavior.
//! * The low level line framer (`protocol::LineFramer`) - slices the inbound
//!   byte stream into CRLF lines, pipelining included.
//!
//! # Server
//!
//! ```no_run
//! use smtpin::model::mail::Mail;
//! use smtpin::server::Listener;
//!
//! fn main() {
//!     env_logger::init();
//!     let listener = Listener::new("example.org", |mail: Mail| {
//!         println!("mail from {} - {} bytes", mail.sender, mail.body.len());
//!     })
//!     .on("0.0.0.0", 2525);
//!     async_std::task::block_on(listener.listen()).unwrap()
//! }
//! ```

#[macro_use]
extern crate log;

pub mod grammar;
pub mod io;
pub mod model;
pub mod protocol;
pub mod server;
pub mod service;

pub mod common {
    pub type Error = Box<dyn std::error::Error + Send + Sync>;
    pub type Result<T> = std::result::Result<T, Error>;

    pub const CRLF: &str = "\r\n";
}

pub use crate::model::mail::{Mail, SmtpPath};
pub use crate::model::response::SmtpReply;
pub use crate::server::{Listener, ServerError, TlsMode};
pub use crate::service::{ErrorSink, MailSink, SpfOutcome, SpfPolicy};
