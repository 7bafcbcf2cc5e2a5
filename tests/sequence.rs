//! Wire level tests: dial the listener over loopback TCP and assert exact
//! request/response bytes.

use async_std::io::prelude::*;
use async_std::net::TcpStream;
use async_std::task;
use smtpin::model::mail::Mail;
use smtpin::server::{Listener, ServerError};
use std::sync::{Arc, Mutex};
use std::time::Duration;

const GREETING: &str = "220 localhost ESMTP SERVICE READY\r\n";

type Mailbox = Arc<Mutex<Vec<Mail>>>;

async fn start_listener(port: u16, configure: impl FnOnce(Listener) -> Listener) -> Mailbox {
    let mails: Mailbox = Arc::new(Mutex::new(Vec::new()));
    let sink = {
        let mails = mails.clone();
        move |mail: Mail| mails.lock().unwrap().push(mail)
    };
    let listener = configure(Listener::new("localhost", sink).on("127.0.0.1", port));
    task::spawn(async move {
        if let Err(e) = listener.listen().await {
            panic!("listener failed: {}", e);
        }
    });
    task::sleep(Duration::from_millis(200)).await;
    mails
}

async fn dial(port: u16) -> TcpStream {
    TcpStream::connect(("127.0.0.1", port))
        .await
        .expect("failed to dial listener")
}

/// Send `request` (may be empty) and read until `expected` many bytes came
/// back, then compare. Works over the plain socket and the TLS stream alike.
async fn exchange<S>(conn: &mut S, request: &str, expected: &str)
where
    S: Read + Write + Unpin,
{
    if !request.is_empty() {
        conn.write_all(request.as_bytes()).await.unwrap();
    }
    if expected.is_empty() {
        return;
    }
    let mut collected = Vec::new();
    let mut buf = [0u8; 1024];
    while collected.len() < expected.len() {
        let n = conn.read(&mut buf).await.unwrap();
        if n == 0 {
            break;
        }
        collected.extend_from_slice(&buf[..n]);
    }
    assert_eq!(
        String::from_utf8_lossy(&collected),
        expected,
        "unexpected response to {:?}",
        request
    );
}

async fn expect_eof<S>(conn: &mut S)
where
    S: Read + Unpin,
{
    let mut buf = [0u8; 64];
    let n = conn.read(&mut buf).await.unwrap();
    assert_eq!(n, 0, "expected the server to close the connection");
}

#[async_std::test]
async fn basic_sequences() {
    let mails = start_listener(17825, |l| l.with_max_msg_size(1024).with_max_rcpts(100)).await;
    let mut conn = dial(17825).await;

    exchange(&mut conn, "", "220 localhost ESMTP SERVICE READY\r\n").await;
    exchange(&mut conn, "HELO test1\r\n", "250 HELLO\r\n").await;
    exchange(&mut conn, "MAIL FROM:<bob@colorado.edu>\r\n", "250 OK\r\n").await;
    exchange(&mut conn, "RCPT TO:<alice@colorado.edu>\r\n", "250 OK\r\n").await;
    exchange(&mut conn, "DATA\r\n", "354 START MAIL\r\n").await;
    exchange(&mut conn, "abc\r\n", "").await;
    exchange(&mut conn, "123\r\n", "").await;
    exchange(&mut conn, ".\r\n", "250 OK\r\n").await;
    exchange(&mut conn, "RSET\r\n", "250 SESSION RESET\r\n").await;
    exchange(
        &mut conn,
        "EHLO test2\r\n",
        "250-HELLO\r\n250-PIPELINING\r\n250 SIZE 1024\r\n",
    )
    .await;
    exchange(&mut conn, "MAIL FROM:<bob@colorado.edu>\r\n", "250 OK\r\n").await;
    exchange(&mut conn, "RCPT TO:<alice@colorado.edu>\r\n", "250 OK\r\n").await;
    exchange(
        &mut conn,
        "DATA\r\nabc\r\n123\r\n.\r\n",
        "354 START MAIL\r\n250 OK\r\n",
    )
    .await;
    exchange(&mut conn, "QUIT\r\n", "221 GOODBYE\r\n").await;
    expect_eof(&mut conn).await;

    let mails = mails.lock().unwrap();
    assert_eq!(mails.len(), 2);
    for mail in mails.iter() {
        assert_eq!(&mail.body[..], b"abc\r\n123\r\n");
        assert_eq!(mail.sender.address(), "bob@colorado.edu");
        assert_eq!(mail.recipients.len(), 1);
        assert_eq!(mail.recipients[0].address(), "alice@colorado.edu");
    }
    assert_eq!(mails[0].helo, "test1");
    assert_eq!(mails[1].helo, "test2");
}

#[async_std::test]
async fn pipelined_transaction_answers_in_order() {
    let mails = start_listener(17826, |l| l).await;
    let mut conn = dial(17826).await;

    exchange(&mut conn, "", "220 localhost ESMTP SERVICE READY\r\n").await;
    exchange(&mut conn, "HELO test1\r\n", "250 HELLO\r\n").await;
    exchange(
        &mut conn,
        "MAIL FROM:<a@b>\r\nRCPT TO:<c@d>\r\nDATA\r\nabc\r\n123\r\n.\r\n",
        "250 OK\r\n250 OK\r\n354 START MAIL\r\n250 OK\r\n",
    )
    .await;

    let mails = mails.lock().unwrap();
    assert_eq!(mails.len(), 1);
    assert_eq!(&mails[0].body[..], b"abc\r\n123\r\n");
    assert_eq!(mails[0].sender.address(), "a@b");
}

#[async_std::test]
async fn mail_before_helo_is_rejected() {
    start_listener(17827, |l| l).await;
    let mut conn = dial(17827).await;

    exchange(&mut conn, "", "220 localhost ESMTP SERVICE READY\r\n").await;
    exchange(&mut conn, "MAIL FROM:<a@b>\r\n", "503 INVALID SEQUENCE\r\n").await;
}

#[async_std::test]
async fn command_without_crlf_is_a_framing_violation() {
    let errors: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));
    let seen = errors.clone();
    start_listener(17828, move |l| {
        l.with_error_sink(move |e: &ServerError| seen.lock().unwrap().push(e.to_string()))
    })
    .await;
    let mut conn = dial(17828).await;

    exchange(&mut conn, "", "220 localhost ESMTP SERVICE READY\r\n").await;
    exchange(&mut conn, "HELO test1", "500 SYNTAX ERROR\r\n").await;
    expect_eof(&mut conn).await;

    task::sleep(Duration::from_millis(100)).await;
    let errors = errors.lock().unwrap();
    assert!(
        errors.iter().any(|e| e.contains("framing violation")),
        "framing violation not reported: {:?}",
        errors
    );
}

#[async_std::test]
async fn oversize_body_aborts_but_keeps_the_connection() {
    let mails = start_listener(17829, |l| l.with_max_msg_size(10)).await;
    let mut conn = dial(17829).await;

    exchange(&mut conn, "", "220 localhost ESMTP SERVICE READY\r\n").await;
    exchange(&mut conn, "HELO test1\r\n", "250 HELLO\r\n").await;
    exchange(&mut conn, "MAIL FROM:<bob@colorado.edu>\r\n", "250 OK\r\n").await;
    exchange(&mut conn, "RCPT TO:<alice@colorado.edu>\r\n", "250 OK\r\n").await;
    exchange(&mut conn, "DATA\r\n", "354 START MAIL\r\n").await;
    exchange(&mut conn, "12345678901\r\n", "554 MESSAGE TOO BIG\r\n").await;
    // the session is reset but the connection lives on
    exchange(&mut conn, "HELO test1\r\n", "250 HELLO\r\n").await;

    assert!(mails.lock().unwrap().is_empty());
}

#[async_std::test]
async fn connections_over_the_cap_are_refused() {
    start_listener(17830, |l| l.with_max_connections(1)).await;

    let mut first = dial(17830).await;
    exchange(&mut first, "", "220 localhost ESMTP SERVICE READY\r\n").await;

    let mut second = dial(17830).await;
    exchange(&mut second, "", "451 LISTENER OVERSATURATED\r\n").await;
    expect_eof(&mut second).await;

    // the slot frees up once the first connection ends
    exchange(&mut first, "QUIT\r\n", "221 GOODBYE\r\n").await;
    drop(first);
    task::sleep(Duration::from_millis(200)).await;

    let mut third = dial(17830).await;
    exchange(&mut third, "", "220 localhost ESMTP SERVICE READY\r\n").await;
}

#[async_std::test]
async fn idle_connections_hit_the_read_deadline() {
    let errors: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));
    let seen = errors.clone();
    start_listener(17831, move |l| {
        l.with_connection_timeout(Duration::from_millis(100))
            .with_error_sink(move |e: &ServerError| seen.lock().unwrap().push(e.to_string()))
    })
    .await;
    let mut conn = dial(17831).await;

    exchange(&mut conn, "", "220 localhost ESMTP SERVICE READY\r\n").await;
    // say nothing and wait for the server to hang up
    expect_eof(&mut conn).await;

    let errors = errors.lock().unwrap();
    assert!(
        errors.iter().any(|e| e.contains("failed to read")),
        "read deadline not reported: {:?}",
        errors
    );
}

#[async_std::test]
async fn starttls_without_tls_answers_not_implemented() {
    start_listener(17832, |l| l).await;
    let mut conn = dial(17832).await;

    exchange(&mut conn, "", "220 localhost ESMTP SERVICE READY\r\n").await;
    exchange(&mut conn, "STARTTLS\r\n", "502 NOT IMPLEMENTED\r\n").await;
    // still in plaintext command mode
    exchange(&mut conn, "HELO test1\r\n", "250 HELLO\r\n").await;
}

#[async_std::test]
async fn a_body_line_longer_than_one_read_is_accepted() {
    let mails = start_listener(17834, |l| l).await;
    let mut conn = dial(17834).await;

    exchange(&mut conn, "", GREETING).await;
    exchange(&mut conn, "HELO test1\r\n", "250 HELLO\r\n").await;
    exchange(&mut conn, "MAIL FROM:<bob@colorado.edu>\r\n", "250 OK\r\n").await;
    exchange(&mut conn, "RCPT TO:<alice@colorado.edu>\r\n", "250 OK\r\n").await;
    exchange(&mut conn, "DATA\r\n", "354 START MAIL\r\n").await;
    // one body line larger than the 8 KiB read buffer
    let long_line = "a".repeat(9 * 1024);
    let request = format!("{}\r\n.\r\n", long_line);
    exchange(&mut conn, &request, "250 OK\r\n").await;

    let mails = mails.lock().unwrap();
    assert_eq!(mails.len(), 1);
    assert_eq!(mails[0].body.len(), 9 * 1024 + 2);
    assert!(mails[0].body.starts_with(b"aaaa"));
}

#[async_std::test]
async fn unterminated_body_overflow_aborts_but_keeps_the_connection() {
    let mails = start_listener(17835, |l| l.with_max_msg_size(10)).await;
    let mut conn = dial(17835).await;

    exchange(&mut conn, "", GREETING).await;
    exchange(&mut conn, "HELO test1\r\n", "250 HELLO\r\n").await;
    exchange(&mut conn, "MAIL FROM:<bob@colorado.edu>\r\n", "250 OK\r\n").await;
    exchange(&mut conn, "RCPT TO:<alice@colorado.edu>\r\n", "250 OK\r\n").await;
    exchange(&mut conn, "DATA\r\n", "354 START MAIL\r\n").await;
    // twenty body bytes and no line ending in sight
    exchange(&mut conn, "12345678901234567890", "554 MESSAGE TOO BIG\r\n").await;
    // the transaction is gone but the connection lives on
    exchange(&mut conn, "HELO test1\r\n", "250 HELLO\r\n").await;

    assert!(mails.lock().unwrap().is_empty());
}

#[async_std::test]
async fn starttls_upgrades_the_stream() {
    use async_tls::TlsConnector;
    use rustls::{Certificate, ClientConfig, RootCertStore};
    use smtpin::io::tls::tls_config_from_pem;
    use smtpin::server::TlsMode;
    use std::fs::File;
    use std::io::BufReader;

    let server_config =
        tls_config_from_pem("tests/data/cert.pem", "tests/data/key.pem").unwrap();
    let mails = start_listener(17836, move |l| {
        l.with_tls_mode(TlsMode::StartTlsOptional)
            .with_tls_config(Arc::new(server_config))
            .with_max_msg_size(1024)
    })
    .await;

    let mut plain = dial(17836).await;
    exchange(&mut plain, "", GREETING).await;
    exchange(
        &mut plain,
        "EHLO test1\r\n",
        "250-HELLO\r\n250-PIPELINING\r\n250-SIZE 1024\r\n250 STARTTLS\r\n",
    )
    .await;
    exchange(&mut plain, "STARTTLS\r\n", "220 READY FOR TLS UPGRADE\r\n").await;

    // client side of the handshake trusts the test certificate
    let mut roots = RootCertStore::empty();
    let cert_file = File::open("tests/data/cert.pem").unwrap();
    for der in rustls_pemfile::certs(&mut BufReader::new(cert_file)).unwrap() {
        roots.add(&Certificate(der)).unwrap();
    }
    let client_config = ClientConfig::builder()
        .with_safe_defaults()
        .with_root_certificates(roots)
        .with_no_client_auth();
    let connector = TlsConnector::from(Arc::new(client_config));
    let mut tls = connector
        .connect("localhost", plain)
        .await
        .expect("client handshake");

    // the upgraded session is fresh and no longer offers STARTTLS
    exchange(
        &mut tls,
        "EHLO test2\r\n",
        "250-HELLO\r\n250-PIPELINING\r\n250 SIZE 1024\r\n",
    )
    .await;
    exchange(&mut tls, "MAIL FROM:<bob@colorado.edu>\r\n", "250 OK\r\n").await;
    exchange(&mut tls, "RCPT TO:<alice@colorado.edu>\r\n", "250 OK\r\n").await;
    exchange(
        &mut tls,
        "DATA\r\nabc\r\n123\r\n.\r\n",
        "354 START MAIL\r\n250 OK\r\n",
    )
    .await;
    exchange(&mut tls, "QUIT\r\n", "221 GOODBYE\r\n").await;

    let mails = mails.lock().unwrap();
    assert_eq!(mails.len(), 1);
    assert_eq!(mails[0].helo, "test2");
    assert_eq!(&mails[0].body[..], b"abc\r\n123\r\n");
    assert_eq!(mails[0].sender.address(), "bob@colorado.edu");
}

#[async_std::test]
async fn dot_stuffed_body_lines_are_unstuffed() {
    let mails = start_listener(17833, |l| l).await;
    let mut conn = dial(17833).await;

    exchange(&mut conn, "", "220 localhost ESMTP SERVICE READY\r\n").await;
    exchange(&mut conn, "HELO test1\r\n", "250 HELLO\r\n").await;
    exchange(&mut conn, "MAIL FROM:<>\r\n", "250 OK\r\n").await;
    exchange(&mut conn, "RCPT TO:<postmaster>\r\n", "250 OK\r\n").await;
    exchange(&mut conn, "DATA\r\n", "354 START MAIL\r\n").await;
    exchange(&mut conn, "..only one dot\r\n.\r\n", "250 OK\r\n").await;

    let mails = mails.lock().unwrap();
    assert_eq!(mails.len(), 1);
    assert_eq!(&mails[0].body[..], b".only one dot\r\n");
    assert!(mails[0].sender.is_null());
    assert_eq!(mails[0].recipients[0].address(), "POSTMASTER");
}
