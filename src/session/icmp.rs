//! ICMP echo handling
//!
//! Echo requests never touch the network: the reply is synthesized locally
//! by rewriting the request in place, then fed through the inbound shaper
//! so the configured delay and loss still apply. This means a ping
//! "succeeds" whether or not the destination is reachable; the emulator
//! reports link conditions, not remote liveness.
//!
//! Every other ICMP type is dropped with a log line.

use std::sync::Arc;

use bytes::Bytes;
use tracing::{debug, trace};

use crate::packet::checksum::{checksum, ipv4_header_checksum};
use crate::packet::{IcmpMessage, Ipv4Packet};

use super::FlowContext;

/// Handle one outbound ICMP message from the tun reader
pub fn handle_icmp(ctx: &Arc<FlowContext>, frame: &[u8], ip: &Ipv4Packet<'_>) {
    let message = match IcmpMessage::parse(ip.payload()) {
        Ok(message) => message,
        Err(e) => {
            debug!(error = %e, "malformed ICMP message dropped");
            ctx.stats.record_rejected_frame();
            return;
        }
    };

    if message.icmp_type != IcmpMessage::ECHO_REQUEST {
        debug!(
            icmp_type = message.icmp_type,
            code = message.code,
            "unsupported ICMP type dropped"
        );
        ctx.stats.record_rejected_frame();
        return;
    }

    trace!(src = %ip.src(), dst = %ip.dst(), "echo request, synthesizing local reply");
    ctx.submit_inbound(echo_reply(frame, ip));
}

/// Rewrite an echo request into its reply in place
///
/// Swaps source and destination, flips the type to echo-reply, and
/// recomputes both checksums. Identifier, sequence number and payload are
/// preserved verbatim.
fn echo_reply(frame: &[u8], ip: &Ipv4Packet<'_>) -> Bytes {
    let header_len = ip.header_len();
    let mut buf = frame[..ip.total_len()].to_vec();

    // Swap the address fields.
    for i in 0..4 {
        buf.swap(12 + i, 16 + i);
    }

    buf[header_len] = IcmpMessage::ECHO_REPLY;
    buf[header_len + 2] = 0;
    buf[header_len + 3] = 0;
    let icmp_sum = checksum(&buf[header_len..]);
    buf[header_len + 2..header_len + 4].copy_from_slice(&icmp_sum.to_be_bytes());

    buf[10] = 0;
    buf[11] = 0;
    let ip_sum = ipv4_header_checksum(&buf[..header_len]);
    buf[10..12].copy_from_slice(&ip_sum.to_be_bytes());

    Bytes::from(buf)
}
