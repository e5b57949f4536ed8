use pnet::packet::ipv4::Ipv4Packet;
use std::net::{IpAddr, Ipv6Addr};

use crate::error::Error;
use crate::probe::{ICMPV6_ECHO_REQUEST, ReplyKind};

// IP protocol numbers
const IPPROTO_ICMP: u8 = 1;
const IPPROTO_ICMPV6: u8 = 58;

// ICMPv4 types
const ICMP_ECHO_REPLY: u8 = 0;
const ICMP_DEST_UNREACHABLE: u8 = 3;
const ICMP_ECHO_REQUEST: u8 = 8;
const ICMP_TIME_EXCEEDED: u8 = 11;

// ICMPv6 types
const ICMPV6_DEST_UNREACHABLE: u8 = 1;
const ICMPV6_TIME_EXCEEDED: u8 = 3;
const ICMPV6_ECHO_REPLY: u8 = 129;

const IPV6_HEADER_LEN: usize = 40;

/// An inbound packet that belongs to this backend instance
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedReply {
    pub responder: IpAddr,
    pub sequence: u16,
    pub kind: ReplyKind,
    /// Original destination (quoted packet for errors, responder for echo replies)
    pub destination: Option<IpAddr>,
}

/// Validate an ICMP checksum (RFC 1071): the one's-complement sum folds to 0xFFFF
fn validate_icmp_checksum(data: &[u8]) -> bool {
    if data.len() < 4 {
        return false;
    }

    let mut sum: u32 = 0;
    let mut chunks = data.chunks_exact(2);
    for word in &mut chunks {
        sum += u16::from_be_bytes([word[0], word[1]]) as u32;
    }
    if let [last] = chunks.remainder() {
        sum += (*last as u32) << 8;
    }
    while sum >> 16 != 0 {
        sum = (sum & 0xFFFF) + (sum >> 16);
    }

    sum == 0xFFFF || sum == 0x0000
}

/// Identifier and sequence repeated at the start of our echo payload
fn extract_id_from_payload(payload: &[u8], our_identifier: u16) -> Option<u16> {
    if payload.len() < 4 {
        return None;
    }
    let payload_id = u16::from_be_bytes([payload[0], payload[1]]);
    if payload_id == our_identifier {
        Some(u16::from_be_bytes([payload[2], payload[3]]))
    } else {
        None
    }
}

/// Sequence of one of our echo requests, checking the header identifier first
/// and falling back to the payload copy
fn match_echo(echo: &[u8], our_identifier: u16) -> Result<u16, Error> {
    if echo.len() < 8 {
        return Err(Error::MalformedReply("truncated echo header"));
    }
    let identifier = u16::from_be_bytes([echo[4], echo[5]]);
    if identifier == our_identifier {
        return Ok(u16::from_be_bytes([echo[6], echo[7]]));
    }
    extract_id_from_payload(&echo[8..], our_identifier)
        .ok_or(Error::MalformedReply("identifier belongs to another prober"))
}

/// Parse an ICMP packet and correlate it to our probes
///
/// When `is_dgram` is true, or for IPv6 (the kernel strips the IPv6 header on
/// raw ICMPv6 sockets), the packet starts directly at the ICMP header.
///
/// Fails with `MalformedReply` if the packet is truncated, carries a bad
/// checksum, is not a reply type we track, or was not sent by this backend.
pub fn parse_icmp_response(
    data: &[u8],
    responder: IpAddr,
    our_identifier: u16,
    is_dgram: bool,
) -> Result<ParsedReply, Error> {
    if data.is_empty() {
        return Err(Error::MalformedReply("empty packet"));
    }

    if responder.is_ipv6() {
        parse_icmpv6(data, responder, our_identifier)
    } else if is_dgram {
        parse_icmpv4(data, responder, our_identifier)
    } else {
        let ip_packet =
            Ipv4Packet::new(data).ok_or(Error::MalformedReply("truncated IPv4 header"))?;
        if ip_packet.get_version() != 4 {
            return Err(Error::MalformedReply("not an IPv4 packet"));
        }
        let ip_header_len = (ip_packet.get_header_length() as usize) * 4;
        if data.len() < ip_header_len + 8 {
            return Err(Error::MalformedReply("truncated ICMP header"));
        }
        parse_icmpv4(&data[ip_header_len..], responder, our_identifier)
    }
}

/// Parse ICMPv4 starting at the ICMP header
fn parse_icmpv4(
    icmp_data: &[u8],
    responder: IpAddr,
    our_identifier: u16,
) -> Result<ParsedReply, Error> {
    if icmp_data.len() < 8 {
        return Err(Error::MalformedReply("truncated ICMP header"));
    }

    let code = icmp_data[1];
    match icmp_data[0] {
        ICMP_ECHO_REPLY => {
            if !validate_icmp_checksum(icmp_data) {
                return Err(Error::MalformedReply("bad ICMP checksum"));
            }
            let sequence = match_echo(icmp_data, our_identifier)?;
            Ok(ParsedReply {
                responder,
                sequence,
                kind: ReplyKind::EchoReply,
                destination: Some(responder),
            })
        }
        ICMP_TIME_EXCEEDED => {
            parse_icmpv4_error(icmp_data, responder, our_identifier, ReplyKind::TtlExceeded)
        }
        ICMP_DEST_UNREACHABLE => {
            parse_icmpv4_error(icmp_data, responder, our_identifier, ReplyKind::Unreachable(code))
        }
        _ => Err(Error::MalformedReply("untracked ICMP type")),
    }
}

/// Parse the quoted datagram of an ICMPv4 error
///
/// [0-7] ICMP header, [8..] original IP header + at least 8 bytes of its payload
fn parse_icmpv4_error(
    icmp_data: &[u8],
    responder: IpAddr,
    our_identifier: u16,
    kind: ReplyKind,
) -> Result<ParsedReply, Error> {
    if icmp_data.len() < 8 + 20 + 8 {
        return Err(Error::MalformedReply("ICMP error too short to quote a probe"));
    }

    let original_ip_data = &icmp_data[8..];
    let original_ip =
        Ipv4Packet::new(original_ip_data).ok_or(Error::MalformedReply("truncated quoted header"))?;
    let orig_ihl = (original_ip.get_header_length() as usize) * 4;
    if original_ip.get_next_level_protocol().0 != IPPROTO_ICMP {
        return Err(Error::MalformedReply("quoted packet is not ICMP"));
    }
    if original_ip_data.len() < orig_ihl + 8 {
        return Err(Error::MalformedReply("truncated quoted ICMP header"));
    }

    let original_echo = &original_ip_data[orig_ihl..];
    if original_echo[0] != ICMP_ECHO_REQUEST {
        return Err(Error::MalformedReply("quoted packet is not an echo request"));
    }

    let sequence = match_echo(original_echo, our_identifier)?;
    Ok(ParsedReply {
        responder,
        sequence,
        kind,
        destination: Some(IpAddr::V4(original_ip.get_destination())),
    })
}

/// Parse ICMPv6 starting at the ICMPv6 header
///
/// Checksums are not validated: they cover the IPv6 pseudo-header, which the
/// kernel has already verified before delivery.
fn parse_icmpv6(
    icmp_data: &[u8],
    responder: IpAddr,
    our_identifier: u16,
) -> Result<ParsedReply, Error> {
    if icmp_data.len() < 8 {
        return Err(Error::MalformedReply("truncated ICMPv6 header"));
    }

    let code = icmp_data[1];
    let kind = match icmp_data[0] {
        ICMPV6_ECHO_REPLY => {
            let sequence = match_echo(icmp_data, our_identifier)?;
            return Ok(ParsedReply {
                responder,
                sequence,
                kind: ReplyKind::EchoReply,
                destination: Some(responder),
            });
        }
        ICMPV6_TIME_EXCEEDED => ReplyKind::TtlExceeded,
        ICMPV6_DEST_UNREACHABLE => ReplyKind::Unreachable(code),
        _ => return Err(Error::MalformedReply("untracked ICMPv6 type")),
    };

    // [0-7] ICMPv6 header, [8..48] original IPv6 header, [48..] original ICMPv6
    if icmp_data.len() < 8 + IPV6_HEADER_LEN + 8 {
        return Err(Error::MalformedReply("ICMPv6 error too short to quote a probe"));
    }
    let original = &icmp_data[8..];
    if original[6] != IPPROTO_ICMPV6 {
        return Err(Error::MalformedReply("quoted packet is not ICMPv6"));
    }
    let mut dest = [0u8; 16];
    dest.copy_from_slice(&original[24..40]);

    let original_echo = &original[IPV6_HEADER_LEN..];
    if original_echo[0] != ICMPV6_ECHO_REQUEST {
        return Err(Error::MalformedReply("quoted packet is not an echo request"));
    }

    let sequence = match_echo(original_echo, our_identifier)?;
    Ok(ParsedReply {
        responder,
        sequence,
        kind,
        destination: Some(IpAddr::V6(Ipv6Addr::from(dest))),
    })
}
