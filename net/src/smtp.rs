//! SMTP client — a minimal mail submission sequencer over TCP.
//!
//! Drives the dedicated TCP socket through HELO / MAIL FROM / RCPT TO
//! / DATA / body / "." / QUIT against port 25. Any reply line
//! beginning '2' or '3' counts as success. No authentication.

use spin::Mutex;
use tern_lib::clock;

use crate::config::SOCKET_SMTP;
use crate::pool;
use crate::types::{IfaceId, Ipv4Addr, Port};
use crate::tcp;

const SMTP_PORT: Port = Port(25);
const TIMEOUT_SMTP_MS: u64 = 2000;

/// Position in the mail transaction.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum SmtpState {
    Idle,
    From,
    Rcpt,
    Data,
}

static STATE: Mutex<SmtpState> = Mutex::new(SmtpState::Idle);

/// Wait for a server reply and accept 2xx/3xx lines.
fn reply_ok() -> bool {
    let Some(id) = tcp::read(SOCKET_SMTP, TIMEOUT_SMTP_MS) else {
        return false;
    };
    let ok = pool::with_mut(id, |b| {
        matches!(b.payload().first(), Some(b'2') | Some(b'3'))
    })
    .unwrap_or(false);
    pool::release(id);
    ok
}

/// Connect to an SMTP server and open a mail session with HELO.
pub fn connect(server: Ipv4Addr, dev: IfaceId) -> bool {
    if *STATE.lock() != SmtpState::Idle {
        return false;
    }

    if tcp::open(SOCKET_SMTP, tcp::ephemeral_port(), server, SMTP_PORT, dev).is_err() {
        return false;
    }

    if !reply_ok() {
        quit();
        return false;
    }

    if tcp::send_text(SOCKET_SMTP, "HELO tern\r\n").is_err() {
        quit();
        return false;
    }
    if !reply_ok() {
        return false;
    }

    *STATE.lock() = SmtpState::From;
    true
}

/// Announce the sender.
pub fn from(addr: &str) -> bool {
    if *STATE.lock() != SmtpState::From {
        return false;
    }

    let Some(id) = tcp::new(SOCKET_SMTP) else {
        return false;
    };
    pool::with_mut(id, |b| {
        b.write_str("MAIL FROM:<");
        b.write_str(addr);
        b.write_str(">\r\n");
    });
    let sent = tcp::send(SOCKET_SMTP, id).is_ok();
    pool::release(id);

    if !sent || !reply_ok() {
        return false;
    }
    *STATE.lock() = SmtpState::Rcpt;
    true
}

/// Add one recipient.
pub fn to(addr: &str) -> bool {
    if *STATE.lock() != SmtpState::Rcpt {
        return false;
    }

    let Some(id) = tcp::new(SOCKET_SMTP) else {
        return false;
    };
    pool::with_mut(id, |b| {
        b.write_str("RCPT TO:<");
        b.write_str(addr);
        b.write_str(">\r\n");
    });
    let sent = tcp::send(SOCKET_SMTP, id).is_ok();
    pool::release(id);

    if !sent || !reply_ok() {
        return false;
    }
    true
}

/// Send one line of message body. The first call issues the DATA
/// command.
pub fn data_line(line: &str) -> bool {
    {
        let state = *STATE.lock();
        if state == SmtpState::Rcpt {
            if tcp::send_text(SOCKET_SMTP, "DATA\r\n").is_err() {
                return false;
            }
            if !reply_ok() {
                return false;
            }
            *STATE.lock() = SmtpState::Data;
        }
    }

    if *STATE.lock() != SmtpState::Data {
        return false;
    }
    tcp::send_text(SOCKET_SMTP, line).is_ok()
}

/// Terminate the body and ask for delivery.
pub fn finish() -> bool {
    if *STATE.lock() != SmtpState::Data {
        return false;
    }
    if tcp::send_text(SOCKET_SMTP, "\r\n.\r\n").is_err() {
        return false;
    }
    if !reply_ok() {
        return false;
    }
    *STATE.lock() = SmtpState::From;
    true
}

/// End the session: QUIT, then close the socket.
pub fn quit() {
    if !tcp::is_open(SOCKET_SMTP) {
        *STATE.lock() = SmtpState::Idle;
        return;
    }

    let _ = tcp::send_text(SOCKET_SMTP, "QUIT\r\n");
    reply_ok();

    clock::sleep_ms(500);
    if tcp::is_open(SOCKET_SMTP) {
        let _ = tcp::close(SOCKET_SMTP);
    }
    *STATE.lock() = SmtpState::Idle;
}

/// Abandon any session state. For tests.
pub fn reset() {
    *STATE.lock() = SmtpState::Idle;
}
