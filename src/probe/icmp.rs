use pnet::packet::MutablePacket;
use pnet::packet::icmp::echo_request::MutableEchoRequestPacket;
use pnet::packet::icmp::{IcmpCode, IcmpType, IcmpTypes};
use std::sync::atomic::{AtomicU16, Ordering};

/// ICMP header size (fixed)
pub const ICMP_HEADER_SIZE: usize = 8;
/// Default payload size (standard ping)
pub const DEFAULT_PAYLOAD_SIZE: usize = 56;
/// Minimum payload size (identifier + sequence + 4 byte timestamp)
pub const MIN_PAYLOAD_SIZE: usize = 8;
/// ICMPv6 Echo Request type
pub const ICMPV6_ECHO_REQUEST: u8 = 128;

static INSTANCE_COUNTER: AtomicU16 = AtomicU16::new(0);

/// Allocate an ICMP identifier for a new backend instance.
///
/// Mixes the process id with a per-process counter so two backends in the
/// same process never claim each other's replies.
pub fn next_identifier() -> u16 {
    let instance = INSTANCE_COUNTER.fetch_add(1, Ordering::Relaxed);
    (std::process::id() as u16).wrapping_add(instance.wrapping_mul(0x0101))
}

/// Build an ICMP Echo Request packet
///
/// Payload layout:
/// - Bytes 0-1: identifier (kernels may rewrite the header identifier on DGRAM sockets)
/// - Bytes 2-3: sequence
/// - Bytes 4-7: send timestamp (lower 32 bits of microseconds since the epoch)
/// - Bytes 8+: pattern fill
///
/// ICMPv6 checksums need the IPv6 pseudo-header and are filled in by the kernel.
pub fn build_echo_request(
    identifier: u16,
    sequence: u16,
    payload_size: usize,
    ipv6: bool,
) -> Vec<u8> {
    let payload_size = payload_size.max(MIN_PAYLOAD_SIZE);
    let mut buffer = vec![0u8; ICMP_HEADER_SIZE + payload_size];

    if let Some(mut packet) = MutableEchoRequestPacket::new(&mut buffer) {
        if ipv6 {
            packet.set_icmp_type(IcmpType::new(ICMPV6_ECHO_REQUEST));
        } else {
            packet.set_icmp_type(IcmpTypes::EchoRequest);
        }
        packet.set_icmp_code(IcmpCode::new(0));
        packet.set_identifier(identifier);
        packet.set_sequence_number(sequence);

        let payload = packet.payload_mut();
        payload[0..2].copy_from_slice(&identifier.to_be_bytes());
        payload[2..4].copy_from_slice(&sequence.to_be_bytes());
        let timestamp = chrono::Utc::now().timestamp_micros() as u32;
        payload[4..8].copy_from_slice(&timestamp.to_be_bytes());
        for (i, byte) in payload[8..].iter_mut().enumerate() {
            *byte = (i & 0xFF) as u8;
        }
    }

    if !ipv6 {
        // Checksum word is at offset 2 (16-bit word index 1)
        let cksum = pnet::util::checksum(&buffer, 1);
        buffer[2..4].copy_from_slice(&cksum.to_be_bytes());
    }

    buffer
}
