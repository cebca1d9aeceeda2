//! Message dispatch — the single task that drains tagged buffers.
//!
//! Link drivers submit inbound buffers with a concrete protocol tag
//! and raise the [`MESSAGE`] signal. The dispatcher scans every pool
//! slot in index order; for each slot carrying a parseable tag it
//! latches the tag, re-asserts `Reserved`, and runs the matching
//! layer parser under the slot's lock. After the parser returns, the
//! dispatcher drops its reference.
//!
//! A parser may promote a buffer to a higher layer by retaining it
//! and writing a new tag (IP → TCP/UDP/ICMP); the inner loop
//! re-examines the same slot until its tag is back to `Empty` or
//! `Reserved`, so the promotion is handled in the same pass.
//!
//! Buffers are processed in pool-index order, not arrival order.

use tern_lib::Signal;

use crate::config::NUM_BUFFERS;
use crate::pool::{self, BufId, Buffer, ProtocolTag};
use crate::types::IfaceId;
use crate::{arp, icmp, ipv4, tcp, udp};

/// Raised by link drivers once an inbound buffer carries its tag.
pub static MESSAGE: Signal = Signal::new();

/// Submit an inbound frame from a link driver.
///
/// `frame` starts at the layer named by `tag` (the IP or ARP header;
/// link framing already stripped). Copies into a fresh buffer, tags
/// it and wakes the dispatcher. Returns `None` when the pool is
/// exhausted — the frame is dropped, the link retransmits or the
/// peer retries.
pub fn net_rx(iface: IfaceId, tag: ProtocolTag, frame: &[u8]) -> Option<BufId> {
    let id = pool::alloc(frame.len())?;
    pool::with_mut(id, |b| {
        b.frame_mut()[..frame.len()].copy_from_slice(frame);
        b.set_size(frame.len());
        b.set_iface(iface);
        b.set_tag(tag);
    });
    MESSAGE.raise();
    Some(id)
}

fn parse(tag: ProtocolTag, id: BufId, buf: &mut Buffer) {
    match tag {
        ProtocolTag::Ip => ipv4::parse(id, buf),
        ProtocolTag::Tcp => tcp::parse(id, buf),
        ProtocolTag::Udp => udp::parse(id, buf),
        ProtocolTag::Icmp => icmp::parse(id, buf),
        ProtocolTag::Arp => arp::parse(id, buf),
        // PPP framing and NAT belong to external collaborators; a
        // buffer tagged for them is dropped here.
        _ => {}
    }
}

/// Drain every pending buffer once.
///
/// The slot's lock is held for the whole parser run, so a task woken
/// by the parser observes the buffer only once parsing is done.
pub fn poll() {
    for idx in 0..NUM_BUFFERS {
        loop {
            let id = BufId(idx as u8);
            {
                let mut buf = pool::slot(idx).lock();
                let tag = buf.tag();
                if matches!(tag, ProtocolTag::Empty | ProtocolTag::Reserved) {
                    break;
                }
                buf.set_tag(ProtocolTag::Reserved);
                parse(tag, id, &mut buf);
            }
            pool::release(id);
        }
    }
}

/// The long-lived dispatcher task: block on [`MESSAGE`], drain, repeat.
pub fn run() -> ! {
    loop {
        MESSAGE.wait();
        poll();
    }
}
