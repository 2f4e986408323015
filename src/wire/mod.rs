/*! Low-level, bit-exact access to packet headers.

The module deals in *views*: the lowercase byte wrappers (e.g. [`ethernet`],
[`ipv4`]) reinterpret a `&[u8]` as a particular header format and provide
field accessors at fixed offsets. A view performs no copying and no parsing
up front; `check_len` guarantees that no accessor of the fixed header will
panic afterwards.

Nothing here allocates. Malformed input surfaces as an [`Error`], never as a
panic.

[`ethernet`]: struct.ethernet.html
[`ipv4`]: struct.ipv4.html
[`Error`]: enum.Error.html
*/
use core::fmt;

#[path = "ethernet.rs"]
mod ethernet_impl;
#[path = "ipv4.rs"]
mod ipv4_impl;
#[path = "ipv6.rs"]
mod ipv6_impl;
#[path = "tcp.rs"]
mod tcp_impl;
#[path = "udp.rs"]
mod udp_impl;

pub use self::ethernet_impl::{ethernet, EtherType, VLAN_HEADER_LEN};
pub use self::ipv4_impl::{ipv4, Address as Ipv4Address, Cidr as Ipv4Cidr};
pub use self::ipv6_impl::{ipv6, TransportHeader};
pub use self::tcp_impl::tcp;
pub use self::udp_impl::udp;

/// The error type for view construction and header walking.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    /// An incoming packet could not be parsed because it was shorter than
    /// the format requires, or a length field pointed past the buffer.
    Truncated,

    /// An incoming packet could not be recognized.
    ///
    /// E.g. an Ethernet frame with an ethertype this crate does not handle,
    /// or an IPv6 extension header outside the set the chain walk knows.
    Unrecognized,

    /// An incoming packet was recognized but self-contradictory, such as an
    /// IPv4 header whose IHL is smaller than the fixed header.
    Malformed,
}

/// The result type for the wire module.
pub type Result<T> = core::result::Result<T, Error>;

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Error::Truncated => write!(f, "truncated packet"),
            Error::Unrecognized => write!(f, "unrecognized packet"),
            Error::Malformed => write!(f, "malformed packet"),
        }
    }
}

pub(crate) mod field {
    pub type Field = core::ops::Range<usize>;
    pub type Rest = core::ops::RangeFrom<usize>;
}

enum_with_unknown! {
    /// IP protocol numbers relevant to the data plane.
    pub enum IpProtocol(u8) {
        HopByHop = 0x00,
        Icmp = 0x01,
        Tcp = 0x06,
        Udp = 0x11,
        Ipv6Route = 0x2b,
        Ipv6Frag = 0x2c,
        Ah = 0x33,
        Ipv6NoNxt = 0x3b,
        Ipv6Opts = 0x3c,
    }
}

impl fmt::Display for IpProtocol {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            IpProtocol::HopByHop => write!(f, "hop-by-hop"),
            IpProtocol::Icmp => write!(f, "ICMP"),
            IpProtocol::Tcp => write!(f, "TCP"),
            IpProtocol::Udp => write!(f, "UDP"),
            IpProtocol::Ipv6Route => write!(f, "IPv6-Route"),
            IpProtocol::Ipv6Frag => write!(f, "IPv6-Frag"),
            IpProtocol::Ah => write!(f, "AH"),
            IpProtocol::Ipv6NoNxt => write!(f, "IPv6-NoNxt"),
            IpProtocol::Ipv6Opts => write!(f, "IPv6-Opts"),
            IpProtocol::Unknown(id) => write!(f, "0x{:02x}", id),
        }
    }
}

pub(crate) mod checksum {
    use byteorder::{ByteOrder, NetworkEndian};

    fn propagate_carries(word: u32) -> u16 {
        let sum = (word >> 16) + (word & 0xffff);
        ((sum >> 16) as u16) + (sum as u16)
    }

    /// Compute an RFC 1071 compliant checksum (without the final complement).
    pub(crate) fn data(mut data: &[u8]) -> u16 {
        let mut accum = 0u32;

        while data.len() >= 2 {
            accum += NetworkEndian::read_u16(data) as u32;
            data = &data[2..];
        }

        if let Some(&value) = data.first() {
            accum += (value as u32) << 8;
        }

        propagate_carries(accum)
    }

}
