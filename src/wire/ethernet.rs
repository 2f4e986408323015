use core::fmt;
use byteorder::{ByteOrder, NetworkEndian};

use super::{Error, Result};

enum_with_unknown! {
    /// Ethernet protocol type.
    pub enum EtherType(u16) {
        Ipv4 = 0x0800,
        Arp  = 0x0806,
        Vlan = 0x8100,
        Ipv6 = 0x86DD,
    }
}

impl fmt::Display for EtherType {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            EtherType::Ipv4 => write!(f, "IPv4"),
            EtherType::Arp => write!(f, "ARP"),
            EtherType::Vlan => write!(f, "VLAN"),
            EtherType::Ipv6 => write!(f, "IPv6"),
            EtherType::Unknown(id) => write!(f, "0x{:04x}", id),
        }
    }
}

/// Length of one 802.1Q tag: the TCI plus the inner ethertype.
pub const VLAN_HEADER_LEN: usize = 4;

/// A byte sequence representing an Ethernet II frame.
byte_wrapper!(ethernet);

mod field {
    use crate::wire::field::*;

    pub const DESTINATION: Field = 0..6;
    pub const SOURCE: Field = 6..12;
    pub const ETHERTYPE: Field = 12..14;
    pub const PAYLOAD: Rest = 14..;
}

impl ethernet {
    pub fn new_unchecked(data: &[u8]) -> &Self {
        Self::__from_macro_new_unchecked(data)
    }

    pub fn new_unchecked_mut(data: &mut [u8]) -> &mut Self {
        Self::__from_macro_new_unchecked_mut(data)
    }

    pub fn new_checked(data: &[u8]) -> Result<&Self> {
        Self::new_unchecked(data).check_len()?;
        Ok(Self::new_unchecked(data))
    }

    pub fn new_checked_mut(data: &mut [u8]) -> Result<&mut Self> {
        Self::new_checked(&data[..])?;
        Ok(Self::new_unchecked_mut(data))
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn as_bytes_mut(&mut self) -> &mut [u8] {
        &mut self.0
    }

    /// Ensure that no accessor method of the fixed header will panic.
    pub fn check_len(&self) -> Result<()> {
        if self.0.len() < field::PAYLOAD.start {
            Err(Error::Truncated)
        } else {
            Ok(())
        }
    }

    /// Return the length of a frame header without VLAN tags.
    pub fn header_len() -> usize {
        field::PAYLOAD.start
    }

    /// Return the destination address bytes.
    pub fn dst_addr(&self) -> &[u8] {
        &self.0[field::DESTINATION]
    }

    /// Return the source address bytes.
    pub fn src_addr(&self) -> &[u8] {
        &self.0[field::SOURCE]
    }

    /// Return the EtherType field, without following 802.1Q tags.
    pub fn ethertype(&self) -> EtherType {
        NetworkEndian::read_u16(&self.0[field::ETHERTYPE]).into()
    }

    /// Resolve the layer-3 protocol and its offset, chasing VLAN tags.
    ///
    /// 802.1Q tags chain: each `0x8100` ethertype is followed by a two-byte
    /// TCI and the next ethertype, pushing the layer-3 header out by four
    /// bytes per tag. Returns the final ethertype together with the offset
    /// of the layer-3 header within the frame.
    pub fn net_protocol(&self) -> Result<(EtherType, usize)> {
        self.check_len()?;
        let mut type_at = field::ETHERTYPE.start;
        loop {
            let raw = NetworkEndian::read_u16(&self.0[type_at..type_at + 2]);
            if EtherType::from(raw) != EtherType::Vlan {
                return Ok((raw.into(), type_at + 2));
            }
            // vlan_id at type_at + 2, inner ethertype at type_at + 4
            type_at += VLAN_HEADER_LEN;
            if self.0.len() < type_at + 2 {
                return Err(Error::Truncated);
            }
        }
    }

    /// The layer-3 bytes of the frame, after any VLAN tags.
    pub fn net_payload(&self) -> Result<(EtherType, &[u8])> {
        let (ethertype, offset) = self.net_protocol()?;
        Ok((ethertype, &self.0[offset..]))
    }
}

impl AsRef<[u8]> for ethernet {
    fn as_ref(&self) -> &[u8] {
        self.as_bytes()
    }
}
