use byteorder::{ByteOrder, NetworkEndian};

use super::{Error, Result};

/// A byte sequence representing a UDP datagram header.
byte_wrapper!(udp);

mod field {
    use crate::wire::field::*;

    pub const SRC_PORT: Field = 0..2;
    pub const DST_PORT: Field = 2..4;
    pub const LENGTH: Field = 4..6;
}

/// Length of a UDP header.
pub(crate) const HEADER_LEN: usize = 8;

impl udp {
    pub fn new_unchecked(data: &[u8]) -> &Self {
        Self::__from_macro_new_unchecked(data)
    }

    pub fn new_checked(data: &[u8]) -> Result<&Self> {
        Self::new_unchecked(data).check_len()?;
        Ok(Self::new_unchecked(data))
    }

    /// Ensure that no accessor method will panic.
    pub fn check_len(&self) -> Result<()> {
        if self.0.len() < HEADER_LEN {
            Err(Error::Truncated)
        } else {
            Ok(())
        }
    }

    /// Return the source port field.
    #[inline]
    pub fn src_port(&self) -> u16 {
        NetworkEndian::read_u16(&self.0[field::SRC_PORT])
    }

    /// Return the destination port field.
    #[inline]
    pub fn dst_port(&self) -> u16 {
        NetworkEndian::read_u16(&self.0[field::DST_PORT])
    }

    /// Return the length field, header included.
    #[inline]
    pub fn len(&self) -> u16 {
        NetworkEndian::read_u16(&self.0[field::LENGTH])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ports() {
        let bytes = [0xc3, 0x50, 0x00, 0x35, 0x00, 0x08, 0x00, 0x00];
        let dgram = udp::new_checked(&bytes[..]).unwrap();
        assert_eq!(dgram.src_port(), 50000);
        assert_eq!(dgram.dst_port(), 53);
        assert_eq!(dgram.len(), 8);
        assert_eq!(udp::new_checked(&bytes[..6]), Err(Error::Truncated));
    }
}
