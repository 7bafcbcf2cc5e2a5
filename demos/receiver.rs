//! Minimal receiver: accept mail on localhost and print the envelopes.
//!
//! ```bash
//! cargo run --example receiver
//! # then, in another terminal:
//! # openssl s_client -connect localhost:2525 -crlf  (or nc / swaks)
//! ```

use smtpin::model::mail::Mail;
use smtpin::server::{Listener, ServerError};

fn main() {
    env_logger::init();

    let listener = Listener::new("localhost", |mail: Mail| {
        let recipients: Vec<&str> = mail.recipients.iter().map(|r| r.address()).collect();
        println!(
            "received {} bytes from {} (helo {}) for {}",
            mail.body.len(),
            mail.sender,
            mail.helo,
            recipients.join(", ")
        );
    })
    .on("127.0.0.1", 2525)
    .with_max_msg_size(1024 * 1024)
    .with_max_rcpts(100)
    .with_error_sink(|e: &ServerError| eprintln!("Err: {}", e));

    if let Err(e) = async_std::task::block_on(listener.listen()) {
        eprintln!("listener failed: {}", e);
        std::process::exit(1);
    }
}
