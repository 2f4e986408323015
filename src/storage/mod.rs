//! Packet buffers and the links that carry them between apps.
//!
//! A [`Packet`] is an owned, fixed-capacity byte buffer drawn from a
//! process-local free list; dropping it returns the buffer to the list. A
//! [`Link`] is the bounded FIFO connecting two apps: transmitting transfers
//! ownership, a full link drops and counts instead of blocking.
//!
//! [`Packet`]: struct.Packet.html
//! [`Link`]: struct.Link.html

mod link;
mod packet;

pub use self::link::Link;
pub use self::packet::{Error, Packet, DEFAULT_HEADROOM, PACKET_SIZE};
