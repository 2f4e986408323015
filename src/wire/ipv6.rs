use byteorder::{ByteOrder, NetworkEndian};

use super::{Error, IpProtocol as Protocol, Result};

/// A byte sequence representing an IPv6 packet.
byte_wrapper!(ipv6);

mod field {
    use crate::wire::field::*;

    pub const LENGTH: Field = 4..6;
    pub const NEXT_HEADER: usize = 6;
    pub const HOP_LIMIT: usize = 7;
    pub const SRC_ADDR: Field = 8..24;
    pub const DST_ADDR: Field = 24..40;
}

/// Length of the fixed IPv6 header.
pub(crate) const HEADER_LEN: usize = field::DST_ADDR.end;

/// The transport header located by walking the extension chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransportHeader {
    /// The transport protocol, one of TCP, UDP or `Ipv6NoNxt`.
    pub protocol: Protocol,
    /// Offset of the transport header within the IPv6 packet.
    pub offset: usize,
}

impl ipv6 {
    pub fn new_unchecked(data: &[u8]) -> &Self {
        Self::__from_macro_new_unchecked(data)
    }

    pub fn new_checked(data: &[u8]) -> Result<&Self> {
        Self::new_unchecked(data).check_len()?;
        Ok(Self::new_unchecked(data))
    }

    /// Ensure that no accessor method of the fixed header will panic.
    pub fn check_len(&self) -> Result<()> {
        if self.0.len() < HEADER_LEN {
            return Err(Error::Truncated);
        }
        if self.0[0] >> 4 != 6 {
            return Err(Error::Unrecognized);
        }
        Ok(())
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// Return the payload length field.
    #[inline]
    pub fn payload_len(&self) -> u16 {
        NetworkEndian::read_u16(&self.0[field::LENGTH])
    }

    /// Return the next header field of the fixed header.
    #[inline]
    pub fn next_header(&self) -> Protocol {
        Protocol::from(self.0[field::NEXT_HEADER])
    }

    /// Return the hop limit field.
    #[inline]
    pub fn hop_limit(&self) -> u8 {
        self.0[field::HOP_LIMIT]
    }

    /// Return the source address bytes.
    #[inline]
    pub fn src_addr(&self) -> &[u8] {
        &self.0[field::SRC_ADDR]
    }

    /// Return the destination address bytes.
    #[inline]
    pub fn dst_addr(&self) -> &[u8] {
        &self.0[field::DST_ADDR]
    }

    /// Walk the extension-header chain to the transport header.
    ///
    /// The chain crosses hop-by-hop, routing and destination options (whose
    /// length octet counts 8-octet units beyond the mandatory first eight),
    /// fragment headers (always 8 octets) and AH (whose length octet counts
    /// 4-octet units beyond the first two). The walk stops at TCP, UDP or
    /// the no-next-header marker; any other protocol is `Unrecognized`, and
    /// running past the buffer is `Truncated`.
    pub fn transport_header(&self) -> Result<TransportHeader> {
        self.check_len()?;
        let mut protocol = self.next_header();
        let mut offset = HEADER_LEN;
        loop {
            match protocol {
                Protocol::Tcp | Protocol::Udp | Protocol::Ipv6NoNxt => {
                    return Ok(TransportHeader { protocol, offset });
                }
                Protocol::HopByHop | Protocol::Ipv6Route | Protocol::Ipv6Opts => {
                    if self.0.len() < offset + 2 {
                        return Err(Error::Truncated);
                    }
                    let next = Protocol::from(self.0[offset]);
                    let len = self.0[offset + 1] as usize * 8 + 8;
                    protocol = next;
                    offset += len;
                }
                Protocol::Ipv6Frag => {
                    if self.0.len() < offset + 2 {
                        return Err(Error::Truncated);
                    }
                    protocol = Protocol::from(self.0[offset]);
                    offset += 8;
                }
                Protocol::Ah => {
                    if self.0.len() < offset + 2 {
                        return Err(Error::Truncated);
                    }
                    let next = Protocol::from(self.0[offset]);
                    let len = self.0[offset + 1] as usize * 4 + 8;
                    protocol = next;
                    offset += len;
                }
                _ => return Err(Error::Unrecognized),
            }
            if offset > self.0.len() {
                return Err(Error::Truncated);
            }
        }
    }
}

impl AsRef<[u8]> for ipv6 {
    fn as_ref(&self) -> &[u8] {
        self.as_bytes()
    }
}
