//! IPv4 fragment reassembly.
//!
//! Fragments are keyed by `(source, destination, identification)` into a
//! [`CTable`] whose values are fixed-size reassembly buffers. Payload bytes
//! are copied into place as fragments arrive, in any order; byte ranges are
//! kept sorted by insertion sort and any overlap rejects the whole datagram,
//! per RFC 5722. On completion the datagram's header is re-emitted with the
//! final total length, a zeroed identification field and a recomputed
//! checksum.
//!
//! The fragment table never grows: when all slots are spoken for, a
//! uniformly random flow is ejected to make room. Reassembly state is
//! otherwise reclaimed only by completion or invalidity.
//!
//! [`CTable`]: ../../table/struct.CTable.html
use rand::rngs::OsRng;
use rand::RngCore;

use crate::storage::{Link, Packet, PACKET_SIZE};
use crate::table::{self, CTable, Mode, Params, Record};
use crate::time::Instant;
use crate::wire::{ethernet, ipv4, EtherType};

use byteorder::{ByteOrder, LittleEndian};

use super::App;

/// Capacity of the per-flow range arrays; `max_frags_per_packet` may be
/// configured lower but not higher.
pub const MAX_FRAGS: usize = 64;

/// Reassembler parameters.
#[derive(Debug, Clone, Copy)]
pub struct Config {
    /// Flows the fragment table holds before random ejection kicks in.
    pub max_concurrent_packets: u32,
    /// Fragments a single datagram may arrive in before the flow is treated
    /// as malicious and dropped.
    pub max_frags_per_packet: u16,
}

impl Default for Config {
    fn default() -> Config {
        Config {
            max_concurrent_packets: 20_000,
            max_frags_per_packet: 40,
        }
    }
}

/// The fragment-table key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FragKey {
    /// Source address, host order.
    pub src: u32,
    /// Destination address, host order.
    pub dst: u32,
    /// The identification field.
    pub ident: u16,
}

impl Record for FragKey {
    const SIZE: usize = 10;

    fn write_to(&self, bytes: &mut [u8]) {
        LittleEndian::write_u32(&mut bytes[0..4], self.src);
        LittleEndian::write_u32(&mut bytes[4..8], self.dst);
        LittleEndian::write_u16(&mut bytes[8..10], self.ident);
    }

    fn read_from(bytes: &[u8]) -> Self {
        FragKey {
            src: LittleEndian::read_u32(&bytes[0..4]),
            dst: LittleEndian::read_u32(&bytes[4..8]),
            ident: LittleEndian::read_u16(&bytes[8..10]),
        }
    }
}

/// Per-flow reassembly state, stored inline in the fragment table.
#[derive(Clone, Copy, PartialEq)]
pub struct ReassemblyBuffer {
    fragment_starts: [u16; MAX_FRAGS],
    fragment_ends: [u16; MAX_FRAGS],
    fragment_count: u16,
    /// Offset of the final fragment; zero while none has arrived.
    final_start: u16,
    /// Bytes of framing ahead of the IP payload in `data`.
    reassembly_base: u16,
    /// Payload bytes accumulated so far.
    running_length: u32,
    /// Highest `base + start + size` seen.
    reassembly_length: u32,
    data: [u8; PACKET_SIZE],
}

impl Default for ReassemblyBuffer {
    fn default() -> ReassemblyBuffer {
        ReassemblyBuffer {
            fragment_starts: [0; MAX_FRAGS],
            fragment_ends: [0; MAX_FRAGS],
            fragment_count: 0,
            final_start: 0,
            reassembly_base: 0,
            running_length: 0,
            reassembly_length: 0,
            data: [0; PACKET_SIZE],
        }
    }
}

impl Record for ReassemblyBuffer {
    const SIZE: usize = 4 * MAX_FRAGS + 14 + PACKET_SIZE;

    fn write_to(&self, bytes: &mut [u8]) {
        let mut at = 0;
        for &start in self.fragment_starts.iter() {
            LittleEndian::write_u16(&mut bytes[at..at + 2], start);
            at += 2;
        }
        for &end in self.fragment_ends.iter() {
            LittleEndian::write_u16(&mut bytes[at..at + 2], end);
            at += 2;
        }
        LittleEndian::write_u16(&mut bytes[at..at + 2], self.fragment_count);
        LittleEndian::write_u16(&mut bytes[at + 2..at + 4], self.final_start);
        LittleEndian::write_u16(&mut bytes[at + 4..at + 6], self.reassembly_base);
        LittleEndian::write_u32(&mut bytes[at + 6..at + 10], self.running_length);
        LittleEndian::write_u32(&mut bytes[at + 10..at + 14], self.reassembly_length);
        bytes[at + 14..at + 14 + PACKET_SIZE].copy_from_slice(&self.data);
    }

    fn read_from(bytes: &[u8]) -> Self {
        let mut buffer = ReassemblyBuffer::default();
        let mut at = 0;
        for start in buffer.fragment_starts.iter_mut() {
            *start = LittleEndian::read_u16(&bytes[at..at + 2]);
            at += 2;
        }
        for end in buffer.fragment_ends.iter_mut() {
            *end = LittleEndian::read_u16(&bytes[at..at + 2]);
            at += 2;
        }
        buffer.fragment_count = LittleEndian::read_u16(&bytes[at..at + 2]);
        buffer.final_start = LittleEndian::read_u16(&bytes[at + 2..at + 4]);
        buffer.reassembly_base = LittleEndian::read_u16(&bytes[at + 4..at + 6]);
        buffer.running_length = LittleEndian::read_u32(&bytes[at + 6..at + 10]);
        buffer.reassembly_length = LittleEndian::read_u32(&bytes[at + 10..at + 14]);
        buffer.data.copy_from_slice(&bytes[at + 14..at + 14 + PACKET_SIZE]);
        buffer
    }
}

/// Outcome of caching one fragment.
pub enum CacheResult {
    /// The datagram is whole; the flow has been released.
    Reassembled(Packet),
    /// More fragments are needed; state is retained.
    FragmentMissing,
    /// The fragment or its flow was structurally bad; both were freed.
    Invalid,
}

enum Verdict {
    Missing,
    Invalid,
    Complete(u32),
}

struct FragmentView {
    key: FragKey,
    /// Frame bytes ahead of the IP payload: layer-2 framing plus the IP
    /// header including options.
    base: usize,
    start: usize,
    size: usize,
    more: bool,
}

fn parse_fragment(bytes: &[u8]) -> Option<FragmentView> {
    let frame = ethernet::new_checked(bytes).ok()?;
    let (ethertype, l3) = frame.net_protocol().ok()?;
    if ethertype != EtherType::Ipv4 {
        return None;
    }
    let ip = ipv4::new_checked(&bytes[l3..]).ok()?;
    if !ip.is_fragment() {
        return None;
    }
    let header_len = ip.header_len() as usize;
    let total_len = ip.total_len() as usize;
    if bytes.len() < l3 + total_len {
        return None;
    }
    Some(FragmentView {
        key: FragKey {
            src: ip.src_addr().to_host_integer(),
            dst: ip.dst_addr().to_host_integer(),
            ident: ip.ident(),
        },
        base: l3 + header_len,
        start: ip.frag_offset() as usize,
        size: total_len - header_len,
        more: ip.more_frags(),
    })
}

/// The reassembly app.
///
/// Non-fragments pass through untouched; fragments are consumed, and a
/// completed datagram is emitted in their place, in arrival position of its
/// completing fragment.
pub struct Reassembler {
    table: CTable<FragKey, ReassemblyBuffer>,
    max_concurrent: u32,
    max_frags: u16,
    reassembled: u64,
    invalid: u64,
    evictions: u64,
}

impl Reassembler {
    /// Create a reassembler; the fragment table is allocated up front.
    ///
    /// # Panics
    /// Panics if `max_frags_per_packet` is zero or above [`MAX_FRAGS`].
    ///
    /// [`MAX_FRAGS`]: constant.MAX_FRAGS.html
    pub fn new(config: Config) -> table::Result<Reassembler> {
        assert!(config.max_frags_per_packet > 0);
        assert!(config.max_frags_per_packet as usize <= MAX_FRAGS);
        let initial_size = (config.max_concurrent_packets as f64 / 0.9).ceil() as u32;
        let table = CTable::new(Params {
            initial_size,
            max_occupancy_rate: 0.9,
            min_occupancy_rate: 0.0,
            seed: None,
        })?;
        Ok(Reassembler {
            table,
            max_concurrent: config.max_concurrent_packets,
            max_frags: config.max_frags_per_packet,
            reassembled: 0,
            invalid: 0,
            evictions: 0,
        })
    }

    /// Datagrams reassembled so far.
    pub fn reassembled(&self) -> u64 {
        self.reassembled
    }

    /// Fragments or flows rejected as structurally bad.
    pub fn invalid(&self) -> u64 {
        self.invalid
    }

    /// Flows ejected to make room for new ones.
    pub fn evictions(&self) -> u64 {
        self.evictions
    }

    /// Flows currently awaiting fragments.
    pub fn pending(&self) -> u32 {
        self.table.occupancy()
    }

    /// Fold one fragment into its flow.
    ///
    /// The fragment is consumed either way. The second element reports a
    /// flow ejected to make room, if any.
    pub fn cache_fragment(&mut self, fragment: Packet) -> (CacheResult, Option<FragKey>) {
        let view = match parse_fragment(fragment.as_slice()) {
            Some(view) => view,
            None => {
                net_debug!("reassembly: unparseable fragment dropped");
                self.invalid += 1;
                return (CacheResult::Invalid, None);
            }
        };

        let mut ejected = None;
        let index = match self.table.lookup(&view.key) {
            Some(index) => index,
            None => {
                if self.table.occupancy() + 1 > self.max_concurrent {
                    if let Some(victim) = self.random_victim() {
                        ejected = self.table.entry(victim).map(|entry| entry.key);
                        self.table.remove_at(victim);
                        self.evictions += 1;
                        net_debug!("reassembly: table full, ejected a random flow");
                    }
                }
                let mut fresh = ReassemblyBuffer::default();
                fresh.reassembly_base = view.base as u16;
                match self.table.add(view.key, fresh, Mode::Insert) {
                    Ok(index) => index,
                    Err(err) => {
                        net_debug!("reassembly: flow allocation failed: {}", err);
                        self.invalid += 1;
                        return (CacheResult::Invalid, ejected);
                    }
                }
            }
        };

        let verdict = match self.table.entry_mut(index) {
            Some(entry) => apply_fragment(
                &mut entry.value,
                &view,
                self.max_frags,
                fragment.as_slice(),
            ),
            None => Verdict::Invalid,
        };

        match verdict {
            Verdict::Missing => (CacheResult::FragmentMissing, ejected),
            Verdict::Invalid => {
                net_debug!("reassembly: flow {}:{} invalidated", view.key.src, view.key.ident);
                self.table.remove_at(index);
                self.invalid += 1;
                (CacheResult::Invalid, ejected)
            }
            Verdict::Complete(length) => {
                let packet = self
                    .table
                    .entry(index)
                    .and_then(|entry| build_packet(&entry.value, length));
                self.table.remove_at(index);
                match packet {
                    Some(packet) => {
                        self.reassembled += 1;
                        (CacheResult::Reassembled(packet), ejected)
                    }
                    None => {
                        self.invalid += 1;
                        (CacheResult::Invalid, ejected)
                    }
                }
            }
        }
    }

    fn random_victim(&self) -> Option<usize> {
        let occupancy = self.table.occupancy();
        if occupancy == 0 {
            return None;
        }
        let target = (OsRng.next_u64() % occupancy as u64) as usize;
        (0..self.table.slots())
            .filter(|&index| self.table.entry(index).is_some())
            .nth(target)
    }
}

fn apply_fragment(
    buffer: &mut ReassemblyBuffer,
    view: &FragmentView,
    max_frags: u16,
    frame: &[u8],
) -> Verdict {
    let base = buffer.reassembly_base as usize;

    // Every fragment of a flow must carry the same framing.
    if view.base != base {
        return Verdict::Invalid;
    }
    if view.size == 0 || base + view.start + view.size > PACKET_SIZE {
        return Verdict::Invalid;
    }
    if buffer.fragment_count + 1 > max_frags {
        return Verdict::Invalid;
    }
    if !view.more {
        if buffer.final_start != 0 {
            return Verdict::Invalid;
        }
        buffer.final_start = view.start as u16;
    }

    // Insertion sort of the new byte range.
    let count = buffer.fragment_count as usize;
    let start = view.start as u16;
    let end = (view.start + view.size) as u16;
    let mut at = count;
    while at > 0 && buffer.fragment_starts[at - 1] > start {
        buffer.fragment_starts[at] = buffer.fragment_starts[at - 1];
        buffer.fragment_ends[at] = buffer.fragment_ends[at - 1];
        at -= 1;
    }
    buffer.fragment_starts[at] = start;
    buffer.fragment_ends[at] = end;
    buffer.fragment_count += 1;

    // Adjacent ranges may touch, never overlap.
    for i in 1..buffer.fragment_count as usize {
        if buffer.fragment_starts[i] < buffer.fragment_ends[i - 1] {
            return Verdict::Invalid;
        }
    }

    if view.start == 0 {
        buffer.data[..base].copy_from_slice(&frame[..base]);
    }
    let dst = base + view.start;
    buffer.data[dst..dst + view.size].copy_from_slice(&frame[view.base..view.base + view.size]);
    buffer.running_length += view.size as u32;
    buffer.reassembly_length = buffer
        .reassembly_length
        .max((base + view.start + view.size) as u32);

    if buffer.final_start == 0 || buffer.running_length != buffer.reassembly_length - base as u32 {
        return Verdict::Missing;
    }

    // All bytes are allegedly here; the chain must be gapless from zero and
    // must end on the final fragment.
    let count = buffer.fragment_count as usize;
    if buffer.fragment_starts[0] != 0 {
        return Verdict::Invalid;
    }
    for i in 1..count {
        if buffer.fragment_starts[i] != buffer.fragment_ends[i - 1] {
            return Verdict::Invalid;
        }
    }
    if buffer.fragment_starts[count - 1] != buffer.final_start {
        return Verdict::Invalid;
    }
    Verdict::Complete(buffer.reassembly_length)
}

fn build_packet(buffer: &ReassemblyBuffer, length: u32) -> Option<Packet> {
    let total = length as usize;
    let mut packet = Packet::with_headroom(0);
    packet.resize(total).ok()?;
    packet.as_mut_slice().copy_from_slice(&buffer.data[..total]);

    let l3 = {
        let frame = ethernet::new_checked(packet.as_slice()).ok()?;
        let (ethertype, l3) = frame.net_protocol().ok()?;
        if ethertype != EtherType::Ipv4 {
            return None;
        }
        l3
    };
    let bytes = packet.as_mut_slice();
    let ip = ipv4::new_checked_mut(&mut bytes[l3..]).ok()?;
    ip.set_total_len((total - l3) as u16);
    ip.set_ident(0);
    ip.fill_checksum();
    Some(packet)
}

impl App for Reassembler {
    fn push(&mut self, _now: Instant, input: &mut Link, output: &mut Link) {
        while !output.is_full() {
            let packet = match input.receive() {
                Some(packet) => packet,
                None => break,
            };
            if parse_fragment(packet.as_slice()).is_none() {
                output.transmit(packet);
                continue;
            }
            match self.cache_fragment(packet) {
                (CacheResult::Reassembled(whole), _) => output.transmit(whole),
                (CacheResult::FragmentMissing, _) | (CacheResult::Invalid, _) => {}
            }
        }
    }
}
