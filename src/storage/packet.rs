use core::fmt;
use core::mem::ManuallyDrop;
use std::cell::RefCell;

/// Size of a packet buffer, and so the largest representable payload.
pub const PACKET_SIZE: usize = 10 * 1024;

/// Headroom reserved in a freshly allocated packet.
///
/// Prepending up to this many bytes (an encapsulation header, say) needs no
/// copy of the payload.
pub const DEFAULT_HEADROOM: usize = 256;

/// Buffers kept on the free list; beyond this, dropped buffers are returned
/// to the allocator.
const FREELIST_MAX: usize = 512;

type Buffer = Box<[u8; PACKET_SIZE]>;

thread_local! {
    static FREELIST: RefCell<Vec<Buffer>> = RefCell::new(Vec::new());
}

/// Error variants for packet mutation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    /// The requested payload would not fit the buffer.
    Oversize,
    /// Not enough headroom left for the prepend.
    Headroom,
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Error::Oversize => write!(f, "payload exceeds packet capacity"),
            Error::Headroom => write!(f, "headroom exhausted"),
        }
    }
}

/// An owned, fixed-capacity packet buffer.
///
/// The payload occupies `[headroom, headroom + length)` of the underlying
/// buffer; the headroom in front of it allows header prepends without moving
/// the payload. Buffers come from a process-local free list and return to it
/// when the packet is dropped. Ownership transfers on transmit to a
/// [`Link`](struct.Link.html).
pub struct Packet {
    headroom: usize,
    length: usize,
    data: ManuallyDrop<Buffer>,
}

impl Packet {
    /// Take an empty packet from the free list.
    pub fn allocate() -> Packet {
        Packet::with_headroom(DEFAULT_HEADROOM)
    }

    /// As [`allocate`](#method.allocate), with a chosen headroom. Zero buys
    /// the full buffer as payload capacity at the price of copying on any
    /// later prepend.
    ///
    /// # Panics
    /// Panics if `headroom` exceeds the buffer itself.
    pub fn with_headroom(headroom: usize) -> Packet {
        assert!(headroom <= PACKET_SIZE);
        Packet {
            headroom,
            length: 0,
            data: ManuallyDrop::new(fresh_buffer()),
        }
    }

    /// Allocate a packet holding a copy of `data`.
    ///
    /// # Panics
    /// Panics if `data` does not fit behind the default headroom. Use
    /// [`allocate`](#method.allocate) and [`extend`](#method.extend) to
    /// handle oversize input gracefully.
    pub fn from_slice(data: &[u8]) -> Packet {
        let mut packet = Packet::allocate();
        packet.extend(data).expect("payload within packet capacity");
        packet
    }

    /// Bytes of valid payload.
    pub fn len(&self) -> usize {
        self.length
    }

    /// Whether the packet carries no payload.
    pub fn is_empty(&self) -> bool {
        self.length == 0
    }

    /// Payload capacity remaining behind the current headroom.
    pub fn capacity(&self) -> usize {
        PACKET_SIZE - self.headroom
    }

    /// Headroom left in front of the payload.
    pub fn headroom(&self) -> usize {
        self.headroom
    }

    /// The payload bytes.
    pub fn as_slice(&self) -> &[u8] {
        &self.data[self.headroom..self.headroom + self.length]
    }

    /// The payload bytes, mutably.
    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut self.data[self.headroom..self.headroom + self.length]
    }

    /// Grow or shrink the payload to `length` bytes.
    ///
    /// Newly exposed bytes are whatever the buffer last held; callers are
    /// expected to overwrite them.
    pub fn resize(&mut self, length: usize) -> Result<(), Error> {
        if length > self.capacity() {
            return Err(Error::Oversize);
        }
        self.length = length;
        Ok(())
    }

    /// Append a copy of `data` to the payload.
    pub fn extend(&mut self, data: &[u8]) -> Result<(), Error> {
        let end = self.length;
        if data.len() > self.capacity() - end {
            return Err(Error::Oversize);
        }
        self.length += data.len();
        self.as_mut_slice()[end..].copy_from_slice(data);
        Ok(())
    }

    /// Prepend a copy of `data`, consuming headroom instead of shifting the
    /// payload.
    pub fn prepend(&mut self, data: &[u8]) -> Result<(), Error> {
        if data.len() > self.headroom {
            return Err(Error::Headroom);
        }
        self.headroom -= data.len();
        self.length += data.len();
        self.as_mut_slice()[..data.len()].copy_from_slice(data);
        Ok(())
    }

    /// Strip `count` bytes off the front of the payload, reclaiming them as
    /// headroom.
    pub fn strip(&mut self, count: usize) -> Result<(), Error> {
        if count > self.length {
            return Err(Error::Oversize);
        }
        self.headroom += count;
        self.length -= count;
        Ok(())
    }
}

impl Drop for Packet {
    fn drop(&mut self) {
        // SAFETY: drop runs once; the buffer is never touched again.
        let buffer = unsafe { ManuallyDrop::take(&mut self.data) };
        let _ = FREELIST.try_with(move |cell| {
            let mut free = cell.borrow_mut();
            if free.len() < FREELIST_MAX {
                free.push(buffer);
            }
        });
    }
}

impl fmt::Debug for Packet {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Packet")
            .field("headroom", &self.headroom)
            .field("length", &self.length)
            .finish()
    }
}

fn fresh_buffer() -> Buffer {
    FREELIST
        .try_with(|cell| cell.borrow_mut().pop())
        .ok()
        .flatten()
        .unwrap_or_else(|| Box::new([0u8; PACKET_SIZE]))
}
