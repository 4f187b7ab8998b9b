use std::net::IpAddr;

pub const ICMPV4_ECHO_REQUEST: u8 = 8;
pub const ICMPV4_ECHO_REPLY: u8 = 0;
pub const ICMPV6_ECHO_REQUEST: u8 = 128;
pub const ICMPV6_ECHO_REPLY: u8 = 129;

/// Payload carried by every echo request.
pub const ECHO_PAYLOAD: &[u8] = b"ICMP testing";

const HEADER_LEN: usize = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IcmpFamily {
    V4,
    V6,
}

impl IcmpFamily {
    pub fn of(ip: &IpAddr) -> Self {
        match ip {
            IpAddr::V4(_) => IcmpFamily::V4,
            IpAddr::V6(_) => IcmpFamily::V6,
        }
    }

    pub fn request_type(self) -> u8 {
        match self {
            IcmpFamily::V4 => ICMPV4_ECHO_REQUEST,
            IcmpFamily::V6 => ICMPV6_ECHO_REQUEST,
        }
    }

    pub fn reply_type(self) -> u8 {
        match self {
            IcmpFamily::V4 => ICMPV4_ECHO_REPLY,
            IcmpFamily::V6 => ICMPV6_ECHO_REPLY,
        }
    }
}

/// RFC 1071 internet checksum.
pub fn checksum(bytes: &[u8]) -> u16 {
    let mut sum = 0u32;
    let mut chunks = bytes.chunks_exact(2);
    for chunk in &mut chunks {
        sum += u32::from(u16::from_be_bytes([chunk[0], chunk[1]]));
    }
    if let [last] = chunks.remainder() {
        sum += u32::from(*last) << 8;
    }
    while sum >> 16 != 0 {
        sum = (sum & 0xffff) + (sum >> 16);
    }
    !(sum as u16)
}

/// Encode an echo message. The checksum is filled for IPv4 only; for ICMPv6 the
/// kernel computes it over the pseudo header.
pub fn encode_echo(family: IcmpFamily, kind: u8, id: u16, seq: u16, payload: &[u8]) -> Vec<u8> {
    let mut packet = Vec::with_capacity(HEADER_LEN + payload.len());
    packet.extend_from_slice(&[kind, 0, 0, 0]);
    packet.extend_from_slice(&id.to_be_bytes());
    packet.extend_from_slice(&seq.to_be_bytes());
    packet.extend_from_slice(payload);
    if family == IcmpFamily::V4 {
        let sum = checksum(&packet);
        packet[2..4].copy_from_slice(&sum.to_be_bytes());
    }
    packet
}

/// Strip the IP header from a packet read off a raw IPv4 socket. Anything that
/// does not look like an IPv4 header is returned unchanged.
pub fn ipv4_payload(packet: &mut [u8]) -> &mut [u8] {
    let Some(first) = packet.first() else {
        return packet;
    };
    if first >> 4 != 4 {
        return packet;
    }
    let header_len = usize::from(first & 0x0f) * 4;
    if header_len < 20 || header_len > packet.len() {
        return packet;
    }
    &mut packet[header_len..]
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplyMatch {
    Matched,
    UnexpectedPeer,
    Mismatch,
}

/// Byte-exact comparison of received packets against the expected echo reply.
///
/// Fields the kernel may rewrite are zeroed on both sides before comparing:
/// the identifier when the socket is unprivileged, the checksum when the
/// identifier is unknown or the family is IPv6.
#[derive(Debug, Clone)]
pub struct EchoMatcher {
    expected: Vec<u8>,
    peer: IpAddr,
    family: IcmpFamily,
    id_unknown: bool,
}

impl EchoMatcher {
    pub fn new(request: &[u8], peer: IpAddr, id_unknown: bool) -> Self {
        let family = IcmpFamily::of(&peer);
        let mut expected = request.to_vec();
        if let Some(kind) = expected.first_mut() {
            *kind = family.reply_type();
        }
        if family == IcmpFamily::V4 && expected.len() >= HEADER_LEN {
            expected[2..4].fill(0);
            let sum = checksum(&expected);
            expected[2..4].copy_from_slice(&sum.to_be_bytes());
        }
        normalize(&mut expected, family, id_unknown);
        Self { expected, peer, family, id_unknown }
    }

    pub fn expected(&self) -> &[u8] {
        &self.expected
    }

    pub fn peer(&self) -> IpAddr {
        self.peer
    }

    pub fn inspect(&self, from: IpAddr, packet: &mut [u8]) -> ReplyMatch {
        if from != self.peer {
            return ReplyMatch::UnexpectedPeer;
        }
        normalize(packet, self.family, self.id_unknown);
        if packet == self.expected.as_slice() {
            ReplyMatch::Matched
        } else {
            ReplyMatch::Mismatch
        }
    }
}

fn normalize(packet: &mut [u8], family: IcmpFamily, id_unknown: bool) {
    if packet.len() < HEADER_LEN {
        return;
    }
    if id_unknown {
        packet[4..6].fill(0);
    }
    if id_unknown || family == IcmpFamily::V6 {
        packet[2..4].fill(0);
    }
}
