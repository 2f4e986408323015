//! Packet classification for the suppressor.
//!
//! A [`Matcher`] is compiled once from the trusted prefix and applied to
//! raw frame bytes. Instead of invoking side-effecting handlers it returns
//! a tagged [`Classification`] which the caller applies against its own
//! state; the dispatch stays data, the state stays in one place.
//!
//! The two stateless filters below mirror the match expressions
//! `tcp[flags] & (RST|FIN) != 0 or (SYN and ACK)` (packets that cannot open
//! a flow) and `ip proto udp or tcp[flags] & SYN` (packets that do). Both
//! resolve the transport header through either the IPv4 IHL or the IPv6
//! extension chain.
//!
//! [`Matcher`]: struct.Matcher.html
//! [`Classification`]: enum.Classification.html
use crate::wire::{ethernet, ipv4, ipv6, tcp, udp, EtherType, IpProtocol, Ipv4Address, Ipv4Cidr};

/// The source and destination of one packet, ports zero when portless.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FlowTuple {
    pub src: Ipv4Address,
    pub dst: Ipv4Address,
    pub src_port: u16,
    pub dst_port: u16,
}

/// What the matcher decided about a packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Classification {
    /// IPv4, trusted source, untrusted destination.
    Inside(FlowTuple),
    /// IPv4, untrusted source, trusted destination.
    Outside(FlowTuple),
    /// None of the suppressor's business; pass it along.
    Forward,
}

/// The compiled classifier.
#[derive(Debug, Clone, Copy)]
pub struct Matcher {
    inside: Ipv4Cidr,
}

impl Matcher {
    /// Compile a matcher for the given trusted network.
    pub fn new(inside: Ipv4Cidr) -> Matcher {
        Matcher { inside }
    }

    /// The trusted prefix.
    pub fn inside(&self) -> Ipv4Cidr {
        self.inside
    }

    /// Classify a frame. Anything unparseable is [`Forward`]: the
    /// suppressor's default for traffic it cannot judge is to pass it.
    ///
    /// [`Forward`]: enum.Classification.html#variant.Forward
    pub fn classify(&self, frame: &[u8]) -> Classification {
        let packet = match ipv4_packet(frame) {
            Some(packet) => packet,
            None => return Classification::Forward,
        };
        let src = packet.src_addr();
        let dst = packet.dst_addr();
        let (src_port, dst_port) = transport_ports(packet);
        let tuple = FlowTuple { src, dst, src_port, dst_port };

        match (self.inside.contains(src), self.inside.contains(dst)) {
            (true, false) => Classification::Inside(tuple),
            (false, true) => Classification::Outside(tuple),
            _ => Classification::Forward,
        }
    }
}

fn ipv4_packet(frame: &[u8]) -> Option<&ipv4> {
    let frame = ethernet::new_checked(frame).ok()?;
    let (ethertype, payload) = frame.net_payload().ok()?;
    if ethertype != EtherType::Ipv4 {
        return None;
    }
    ipv4::new_checked(payload).ok()
}

fn transport_ports(packet: &ipv4) -> (u16, u16) {
    // Ports live in the leading fragment only.
    if packet.frag_offset() != 0 {
        return (0, 0);
    }
    let transport = packet.transport_payload();
    match packet.protocol() {
        IpProtocol::Tcp => match tcp::new_checked(transport) {
            Ok(segment) => (segment.src_port(), segment.dst_port()),
            Err(_) => (0, 0),
        },
        IpProtocol::Udp => match udp::new_checked(transport) {
            Ok(dgram) => (dgram.src_port(), dgram.dst_port()),
            Err(_) => (0, 0),
        },
        _ => (0, 0),
    }
}

/// The transport protocol and header bytes of an IPv4 or IPv6 frame.
fn transport(frame: &[u8]) -> Option<(IpProtocol, &[u8])> {
    let frame = ethernet::new_checked(frame).ok()?;
    let (ethertype, payload) = frame.net_payload().ok()?;
    match ethertype {
        EtherType::Ipv4 => {
            let packet = ipv4::new_checked(payload).ok()?;
            if packet.frag_offset() != 0 {
                return None;
            }
            let at = packet.header_len() as usize;
            Some((packet.protocol(), &payload[at..]))
        }
        EtherType::Ipv6 => {
            let packet = ipv6::new_checked(payload).ok()?;
            let found = packet.transport_header().ok()?;
            Some((found.protocol, &payload[found.offset..]))
        }
        _ => None,
    }
}

/// The hygiene filter: a TCP packet that cannot open a flow (RST, FIN, or
/// SYN+ACK). Such a packet arriving for an unknown connection is noise or
/// probing and is dropped rather than counted.
pub fn cannot_open_flow(frame: &[u8]) -> bool {
    match transport(frame) {
        Some((IpProtocol::Tcp, bytes)) => match tcp::new_checked(bytes) {
            Ok(segment) => segment.rst() || segment.fin() || (segment.syn() && segment.ack()),
            Err(_) => false,
        },
        _ => false,
    }
}

/// The block-sensitive filter: a packet that would open a new flow, any
/// UDP or a TCP SYN. These are what a blocked source is not allowed to
/// send past an established bucket.
pub fn opens_flow(frame: &[u8]) -> bool {
    match transport(frame) {
        Some((IpProtocol::Udp, _)) => true,
        Some((IpProtocol::Tcp, bytes)) => match tcp::new_checked(bytes) {
            Ok(segment) => segment.syn() && !segment.ack(),
            Err(_) => false,
        },
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layer::scan::testing::{tcp_frame, udp_frame, TcpFlags};

    fn matcher() -> Matcher {
        Matcher::new(Ipv4Cidr::new(Ipv4Address::new(10, 0, 0, 0), 8))
    }

    #[test]
    fn directions() {
        let m = matcher();

        let outbound = tcp_frame(
            Ipv4Address::new(10, 0, 0, 1),
            Ipv4Address::new(192, 0, 2, 9),
            4321,
            80,
            TcpFlags::SYN,
        );
        match m.classify(&outbound) {
            Classification::Inside(tuple) => {
                assert_eq!(tuple.src, Ipv4Address::new(10, 0, 0, 1));
                assert_eq!(tuple.dst_port, 80);
            }
            other => panic!("expected inside, got {:?}", other),
        }

        let inbound = tcp_frame(
            Ipv4Address::new(192, 0, 2, 9),
            Ipv4Address::new(10, 0, 0, 1),
            80,
            4321,
            TcpFlags::SYN,
        );
        assert!(matches!(m.classify(&inbound), Classification::Outside(_)));

        let internal = tcp_frame(
            Ipv4Address::new(10, 0, 0, 1),
            Ipv4Address::new(10, 9, 9, 9),
            1,
            2,
            TcpFlags::SYN,
        );
        assert_eq!(m.classify(&internal), Classification::Forward);

        assert_eq!(m.classify(b"garbage"), Classification::Forward);
    }

    #[test]
    fn hygiene_filter() {
        let src = Ipv4Address::new(192, 0, 2, 9);
        let dst = Ipv4Address::new(10, 0, 0, 1);
        assert!(cannot_open_flow(&tcp_frame(src, dst, 1, 2, TcpFlags::RST)));
        assert!(cannot_open_flow(&tcp_frame(src, dst, 1, 2, TcpFlags::FIN)));
        assert!(cannot_open_flow(&tcp_frame(src, dst, 1, 2, TcpFlags::SYN_ACK)));
        assert!(!cannot_open_flow(&tcp_frame(src, dst, 1, 2, TcpFlags::SYN)));
        assert!(!cannot_open_flow(&tcp_frame(src, dst, 1, 2, TcpFlags::ACK)));
        assert!(!cannot_open_flow(&udp_frame(src, dst, 1, 2)));
    }

    #[test]
    fn block_sensitive_filter() {
        let src = Ipv4Address::new(192, 0, 2, 9);
        let dst = Ipv4Address::new(10, 0, 0, 1);
        assert!(opens_flow(&tcp_frame(src, dst, 1, 2, TcpFlags::SYN)));
        assert!(opens_flow(&udp_frame(src, dst, 1, 2)));
        assert!(!opens_flow(&tcp_frame(src, dst, 1, 2, TcpFlags::ACK)));
        assert!(!opens_flow(&tcp_frame(src, dst, 1, 2, TcpFlags::SYN_ACK)));
    }
}
