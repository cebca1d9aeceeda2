//! ICMP echo request/reply.
//!
//! Only echo is handled; every other type is dropped after checksum
//! validation. A received request is answered in place: flip the type,
//! recompute the checksum, reverse the IP addressing and retransmit.

use log::debug;
use tern_lib::Signal;

use crate::checksum::Checksum;
use crate::ipv4;
use crate::pool::{self, BufId, Buffer};
use crate::types::{IfaceId, IpProtocol, Ipv4Addr};

pub const ICMP_HEADER_LEN: usize = 8;

const ECHO_REPLY: u8 = 0;
const ECHO_REQUEST: u8 = 8;

/// Attempts per [`ping`].
pub const MAX_PING: u32 = 5;

/// Per-attempt reply timeout, milliseconds.
pub const TIMEOUT_PING_MS: u64 = 300;

static ECHO_SIGNAL: Signal = Signal::new();

/// One's-complement sum over the ICMP message, padded to even length.
fn message_checksum(b: &Buffer) -> Checksum {
    let mut sum = Checksum::new();
    sum.push_padded(b.payload());
    sum
}

/// Send one echo request with a random id and sequence.
fn echo_request(dst: Ipv4Addr, iface: IfaceId) {
    let Some(id) = ipv4::datagram_new(dst, 64, iface) else {
        return;
    };
    let frame = pool::with_mut(id, |b| {
        ipv4::set_protocol(b, IpProtocol::Icmp);
        b.write_u8(ECHO_REQUEST);
        b.write_u8(0);
        b.write_u16(0); // checksum, patched below
        b.write_u16(rand::random::<u16>());
        b.write_u16(rand::random::<u16>());
        let value = message_checksum(b).value();
        b.payload_mut()[2..4].copy_from_slice(&value.to_be_bytes());
        ipv4::finalize(b)
    });
    if let Some(frame) = frame {
        let _ = ipv4::send_frame(&frame);
    }
    pool::release(id);
}

/// Ping `dst`: up to [`MAX_PING`] requests, each waiting
/// [`TIMEOUT_PING_MS`] for a reply. True on the first reply.
pub fn ping(dst: Ipv4Addr, iface: IfaceId) -> bool {
    for _ in 0..MAX_PING {
        echo_request(dst, iface);
        if ECHO_SIGNAL.wait_timeout(TIMEOUT_PING_MS) {
            return true;
        }
    }
    false
}

/// Handle an inbound ICMP message.
pub(crate) fn parse(_id: BufId, b: &mut Buffer) {
    if b.payload().len() < ICMP_HEADER_LEN {
        return;
    }
    if !message_checksum(b).is_valid() {
        debug!("icmp: bad checksum");
        return;
    }

    match b.payload()[0] {
        ECHO_REQUEST => {
            // Answer in place: flip the type, fresh checksum, reverse
            // the addressing.
            {
                let p = b.payload_mut();
                p[0] = ECHO_REPLY;
                p[2] = 0;
                p[3] = 0;
            }
            let value = message_checksum(b).value();
            b.payload_mut()[2..4].copy_from_slice(&value.to_be_bytes());
            ipv4::answer(b);
            let _ = ipv4::transmit(b);
        }
        ECHO_REPLY => {
            ECHO_SIGNAL.raise();
        }
        other => {
            debug!("icmp: type {} not handled", other);
        }
    }
}
