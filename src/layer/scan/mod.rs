//! TRW-style scan suppression.
//!
//! A source outside the trusted network earns a point for every connection
//! attempt that nothing inside ever answered, and loses points when an
//! attempt turns out to be wanted. Past a threshold the source is treated
//! as a scanner: its packets are dropped unless they belong to a bucket
//! some inside host opened first, and even then packets that would open
//! a *new* flow stay blocked.
//!
//! Two approximate caches carry the state: a [connection cache] of one-byte
//! direction/age slots and a four-way [address cache] of per-source counts,
//! scattered by a keyed [permutation]. Both tolerate collisions; the
//! failure mode is under-counting, never false blocking of an established
//! connection.
//!
//! Housekeeping is cooperative: count decay and connection aging run inline
//! at the top of [`push`] when their tick deadlines pass.
//!
//! [connection cache]: struct.ConnectionCache.html
//! [address cache]: struct.AddressCache.html
//! [permutation]: struct.Cipher.html
//! [`push`]: ../trait.App.html#tymethod.push
use rand::rngs::OsRng;
use rand::RngCore;

use crate::storage::Link;
use crate::table::AllocError;
use crate::time::{Duration, Expiration, Instant};
use crate::wire::{Ipv4Address, Ipv4Cidr};

use super::App;

mod addr;
mod cipher;
mod classify;
mod conn;

pub use self::addr::AddressCache;
pub use self::cipher::Cipher;
pub use self::classify::{cannot_open_flow, opens_flow, Classification, FlowTuple, Matcher};
pub use self::conn::{Conn, ConnectionCache, AGE_MAX};

/// Suppressor parameters.
#[derive(Debug, Clone, Copy)]
pub struct Config {
    /// The trusted prefix; traffic between two inside or two outside
    /// addresses is none of the suppressor's business.
    pub inside_network: Ipv4Cidr,
    /// Sources at or above this count are presumed scanners.
    pub block_threshold: i16,
    /// Lower clamp on stored counts.
    pub c_min: i16,
    /// Upper clamp on stored counts.
    pub c_max: i16,
    /// Ticks between count-decay sweeps.
    pub d_miss_ticks: Duration,
    /// Ticks between connection-aging sweeps.
    pub age_interval_ticks: Duration,
    /// Aging sweeps a connection may sit idle before its slot clears.
    pub d_conn_ticks: u8,
    /// Connection-cache slots; a power of two.
    pub conn_cache_slots: usize,
    /// Address-cache lines; a power of two, at least 2¹⁶.
    pub addr_cache_lines: usize,
    /// Cache seed; `None` draws one from the OS.
    pub seed: Option<u64>,
}

impl Config {
    /// Defaults for a given trusted network.
    pub fn new(inside_network: Ipv4Cidr) -> Config {
        Config {
            inside_network,
            block_threshold: 5,
            c_min: -5,
            c_max: i16::MAX,
            d_miss_ticks: Duration::from_ticks(1),
            age_interval_ticks: Duration::from_ticks(1),
            d_conn_ticks: 30,
            conn_cache_slots: 1 << 20,
            addr_cache_lines: 1 << 20,
            seed: None,
        }
    }
}

/// The scan-suppression app.
pub struct ScanSuppressor {
    matcher: Matcher,
    conn: ConnectionCache,
    addr: AddressCache,
    block_threshold: i16,
    d_conn_ticks: u8,
    miss_interval: Duration,
    age_interval: Duration,
    miss_deadline: Expiration,
    age_deadline: Expiration,
    forwarded: u64,
    dropped: u64,
}

impl ScanSuppressor {
    /// Create a suppressor; both caches are allocated up front.
    pub fn new(config: Config) -> Result<ScanSuppressor, AllocError> {
        let seed = match config.seed {
            Some(seed) => seed,
            None => OsRng.next_u64(),
        };
        Ok(ScanSuppressor {
            matcher: Matcher::new(config.inside_network),
            conn: ConnectionCache::new(config.conn_cache_slots, seed)?,
            addr: AddressCache::new(config.addr_cache_lines, !seed, config.c_min, config.c_max)?,
            block_threshold: config.block_threshold,
            d_conn_ticks: config.d_conn_ticks,
            miss_interval: config.d_miss_ticks,
            age_interval: config.age_interval_ticks,
            miss_deadline: Expiration::Never,
            age_deadline: Expiration::Never,
            forwarded: 0,
            dropped: 0,
        })
    }

    /// Packets passed to the output link.
    pub fn forwarded(&self) -> u64 {
        self.forwarded
    }

    /// Packets dropped by policy.
    pub fn dropped(&self) -> u64 {
        self.dropped
    }

    /// The cached count for a source, zero when unknown.
    pub fn address_count(&self, addr: Ipv4Address) -> i16 {
        self.addr.count(addr)
    }

    fn housekeeping(&mut self, now: Instant) {
        match self.miss_deadline {
            Expiration::When(at) if now >= at => {
                net_trace!("scan: decay sweep at {}", now);
                self.addr.decay();
                self.miss_deadline = Expiration::When(now + self.miss_interval);
            }
            Expiration::Never => {
                self.miss_deadline = Expiration::When(now + self.miss_interval);
            }
            _ => {}
        }
        match self.age_deadline {
            Expiration::When(at) if now >= at => {
                net_trace!("scan: aging sweep at {}", now);
                self.conn.age_sweep(self.d_conn_ticks);
                self.age_deadline = Expiration::When(now + self.age_interval);
            }
            Expiration::Never => {
                self.age_deadline = Expiration::When(now + self.age_interval);
            }
            _ => {}
        }
    }

    /// A packet leaving the trusted network. Always forwarded; its only
    /// effect is on the caches.
    fn inside_packet(&mut self, tuple: &FlowTuple) {
        let index = self.conn.index(tuple);
        let mut conn = self.conn.get(index);
        if !conn.in_to_out() {
            if conn.out_to_in() {
                // The earlier outside packet was counted a miss; it has
                // just become a hit.
                let count = self.addr.count(tuple.dst);
                self.addr.set_count(tuple.dst, count - 2);
            }
            conn.set_in_to_out();
        }
        conn.reset_age();
        self.conn.set(index, conn);
    }

    /// A packet entering the trusted network. Returns whether to forward.
    fn outside_packet(&mut self, tuple: &FlowTuple, frame: &[u8]) -> bool {
        let index = self.conn.index(tuple);
        let mut conn = self.conn.get(index);
        let count = self.addr.count(tuple.src);

        if count < self.block_threshold {
            if !conn.out_to_in() {
                if conn.in_to_out() {
                    // The inside host reached out first: a hit.
                    self.addr.set_count(tuple.src, count - 1);
                    conn.set_out_to_in();
                } else if classify::cannot_open_flow(frame) {
                    net_debug!("scan: hygiene drop from {}", tuple.src);
                    return false;
                } else {
                    // Nothing inside asked for this: a potential miss.
                    self.addr.set_count(tuple.src, count + 1);
                    conn.set_out_to_in();
                }
            }
            conn.reset_age();
            self.conn.set(index, conn);
            true
        } else if conn.in_to_out() {
            // A presumed scanner, but some inside host opened this bucket;
            // only flow-opening packets stay blocked.
            if classify::opens_flow(frame) {
                net_debug!("scan: blocked source {} denied a new flow", tuple.src);
                return false;
            }
            if !conn.out_to_in() {
                self.addr.set_count(tuple.src, count - 1);
                conn.set_out_to_in();
            }
            conn.reset_age();
            self.conn.set(index, conn);
            true
        } else {
            net_debug!("scan: dropped packet from blocked source {}", tuple.src);
            false
        }
    }
}

impl App for ScanSuppressor {
    fn push(&mut self, now: Instant, input: &mut Link, output: &mut Link) {
        self.housekeeping(now);
        while !output.is_full() {
            let packet = match input.receive() {
                Some(packet) => packet,
                None => break,
            };
            match self.matcher.classify(packet.as_slice()) {
                Classification::Forward => {
                    self.forwarded += 1;
                    output.transmit(packet);
                }
                Classification::Inside(tuple) => {
                    self.inside_packet(&tuple);
                    self.forwarded += 1;
                    output.transmit(packet);
                }
                Classification::Outside(tuple) => {
                    if self.outside_packet(&tuple, packet.as_slice()) {
                        self.forwarded += 1;
                        output.transmit(packet);
                    } else {
                        self.dropped += 1;
                    }
                }
            }
        }
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use byteorder::{ByteOrder, NetworkEndian};

    use crate::wire::{ipv4, Ipv4Address};

    const ETH_LEN: usize = 14;
    const IP_LEN: usize = 20;

    pub(crate) struct TcpFlags;

    impl TcpFlags {
        pub(crate) const FIN: u16 = 0x001;
        pub(crate) const SYN: u16 = 0x002;
        pub(crate) const RST: u16 = 0x004;
        pub(crate) const ACK: u16 = 0x010;
        pub(crate) const SYN_ACK: u16 = 0x012;
    }

    fn frame(src: Ipv4Address, dst: Ipv4Address, protocol: u8, transport: &[u8]) -> Vec<u8> {
        let mut bytes = vec![0u8; ETH_LEN + IP_LEN + transport.len()];
        bytes[0..6].copy_from_slice(&[2; 6]);
        bytes[6..12].copy_from_slice(&[1; 6]);
        NetworkEndian::write_u16(&mut bytes[12..14], 0x0800);

        bytes[ETH_LEN] = 0x45;
        NetworkEndian::write_u16(
            &mut bytes[ETH_LEN + 2..ETH_LEN + 4],
            (IP_LEN + transport.len()) as u16,
        );
        bytes[ETH_LEN + 8] = 64;
        bytes[ETH_LEN + 9] = protocol;
        bytes[ETH_LEN + 12..ETH_LEN + 16].copy_from_slice(src.as_bytes());
        bytes[ETH_LEN + 16..ETH_LEN + 20].copy_from_slice(dst.as_bytes());
        bytes[ETH_LEN + IP_LEN..].copy_from_slice(transport);

        let ip = ipv4::new_checked_mut(&mut bytes[ETH_LEN..]).unwrap();
        ip.fill_checksum();
        bytes
    }

    pub(crate) fn tcp_frame(
        src: Ipv4Address,
        dst: Ipv4Address,
        src_port: u16,
        dst_port: u16,
        flags: u16,
    ) -> Vec<u8> {
        let mut segment = [0u8; 20];
        NetworkEndian::write_u16(&mut segment[0..2], src_port);
        NetworkEndian::write_u16(&mut segment[2..4], dst_port);
        NetworkEndian::write_u16(&mut segment[12..14], (5 << 12) | flags);
        frame(src, dst, 6, &segment)
    }

    pub(crate) fn udp_frame(
        src: Ipv4Address,
        dst: Ipv4Address,
        src_port: u16,
        dst_port: u16,
    ) -> Vec<u8> {
        let mut dgram = [0u8; 8];
        NetworkEndian::write_u16(&mut dgram[0..2], src_port);
        NetworkEndian::write_u16(&mut dgram[2..4], dst_port);
        NetworkEndian::write_u16(&mut dgram[4..6], 8);
        frame(src, dst, 17, &dgram)
    }
}

#[cfg(test)]
mod tests {
    use super::testing::{tcp_frame, udp_frame, TcpFlags};
    use super::*;
    use crate::storage::Packet;
    use crate::wire::Ipv4Address as Addr;

    fn suppressor() -> ScanSuppressor {
        let mut config = Config::new(Ipv4Cidr::new(Addr::new(10, 0, 0, 0), 8));
        config.conn_cache_slots = 1 << 16;
        config.addr_cache_lines = 1 << 16;
        config.seed = Some(0x5eed);
        ScanSuppressor::new(config).unwrap()
    }

    fn drive(s: &mut ScanSuppressor, frames: &[Vec<u8>], now: Instant) -> Vec<Packet> {
        let mut input = Link::new();
        let mut output = Link::new();
        for bytes in frames {
            input.transmit(Packet::from_slice(bytes));
        }
        s.push(now, &mut input, &mut output);
        let mut forwarded = Vec::new();
        while let Some(packet) = output.receive() {
            forwarded.push(packet);
        }
        forwarded
    }

    const T0: Instant = Instant { ticks: 0 };

    #[test]
    fn test_scan_block_at_threshold() {
        let mut s = suppressor();
        let scanner = Addr::new(192, 0, 2, 1);

        // Five unanswered probes climb the count to the threshold.
        for i in 1..=5u8 {
            let probe = tcp_frame(scanner, Addr::new(10, 0, 0, i), 40_000, 80, TcpFlags::SYN);
            assert_eq!(drive(&mut s, &[probe], T0).len(), 1, "probe {} forwarded", i);
            assert_eq!(s.address_count(scanner), i as i16);
        }

        // The sixth probe is dropped.
        let probe = tcp_frame(scanner, Addr::new(10, 0, 0, 6), 40_000, 80, TcpFlags::SYN);
        assert_eq!(drive(&mut s, &[probe], T0).len(), 0);
        assert_eq!(s.dropped(), 1);
        assert_eq!(s.address_count(scanner), 5);

        // An inside host answers one probe: the miss becomes a hit and the
        // count drops by two.
        let reply = tcp_frame(Addr::new(10, 0, 0, 3), scanner, 80, 40_000, TcpFlags::SYN_ACK);
        assert_eq!(drive(&mut s, &[reply], T0).len(), 1);
        assert_eq!(s.address_count(scanner), 3);
    }

    #[test]
    fn test_hygiene_drop() {
        let mut s = suppressor();
        let outside = Addr::new(198, 51, 100, 1);

        // A RST with no matching connection state is dropped even though
        // the source is nowhere near the threshold, and is not counted.
        let rst = tcp_frame(outside, Addr::new(10, 0, 0, 1), 1, 2, TcpFlags::RST);
        assert_eq!(drive(&mut s, &[rst], T0).len(), 0);
        assert_eq!(s.dropped(), 1);
        assert_eq!(s.address_count(outside), 0);

        let synack = tcp_frame(outside, Addr::new(10, 0, 0, 1), 1, 2, TcpFlags::SYN_ACK);
        assert_eq!(drive(&mut s, &[synack], T0).len(), 0);

        // But the same packets are fine once the inside host opened first.
        let open = tcp_frame(Addr::new(10, 0, 0, 1), outside, 2, 1, TcpFlags::SYN);
        drive(&mut s, &[open], T0);
        let synack = tcp_frame(outside, Addr::new(10, 0, 0, 1), 1, 2, TcpFlags::SYN_ACK);
        assert_eq!(drive(&mut s, &[synack], T0).len(), 1);
        assert_eq!(s.address_count(outside), -1);
    }

    #[test]
    fn test_blocked_source_established_bypass() {
        let mut s = suppressor();
        let scanner = Addr::new(192, 0, 2, 1);

        // Two inside hosts talk to the future scanner first.
        let open_a = tcp_frame(Addr::new(10, 0, 0, 9), scanner, 5_555, 443, TcpFlags::SYN);
        let open_b = tcp_frame(Addr::new(10, 0, 0, 8), scanner, 6_666, 443, TcpFlags::SYN);
        assert_eq!(drive(&mut s, &[open_a, open_b], T0).len(), 2);

        // The source then probes its way past the threshold.
        for i in 1..=5u8 {
            let probe = tcp_frame(scanner, Addr::new(10, 0, 0, i), 40_000, 80, TcpFlags::SYN);
            drive(&mut s, &[probe], T0);
        }
        assert_eq!(s.address_count(scanner), 5);

        // Unknown destinations are now dropped outright.
        let probe = tcp_frame(scanner, Addr::new(10, 0, 0, 200), 40_000, 80, TcpFlags::SYN);
        assert_eq!(drive(&mut s, &[probe], T0).len(), 0);

        // Flow-opening traffic stays blocked even on an opened bucket.
        let udp = udp_frame(scanner, Addr::new(10, 0, 0, 8), 443, 6_666);
        assert_eq!(drive(&mut s, &[udp], T0).len(), 0);
        assert_eq!(s.address_count(scanner), 5);

        // Non-opening traffic on an opened bucket passes, and retroactively
        // counts as a hit.
        let ack = tcp_frame(scanner, Addr::new(10, 0, 0, 9), 443, 5_555, TcpFlags::ACK);
        assert_eq!(drive(&mut s, &[ack], T0).len(), 1);
        assert_eq!(s.address_count(scanner), 4);
    }

    #[test]
    fn test_decay_sweep() {
        let mut s = suppressor();
        let outside = Addr::new(192, 0, 2, 7);
        for i in 1..=3u8 {
            let probe = tcp_frame(outside, Addr::new(10, 0, 0, i), 9, 80, TcpFlags::SYN);
            drive(&mut s, &[probe], T0);
        }
        assert_eq!(s.address_count(outside), 3);

        // The first push armed the timers at tick 1; passing it decays.
        drive(&mut s, &[], Instant::from_ticks(1));
        assert_eq!(s.address_count(outside), 2);
        drive(&mut s, &[], Instant::from_ticks(2));
        assert_eq!(s.address_count(outside), 1);
    }

    #[test]
    fn test_connection_aging() {
        let mut config = Config::new(Ipv4Cidr::new(Addr::new(10, 0, 0, 0), 8));
        config.conn_cache_slots = 1 << 16;
        config.addr_cache_lines = 1 << 16;
        config.seed = Some(0x5eed);
        config.d_conn_ticks = 2;
        let mut s = ScanSuppressor::new(config).unwrap();
        let index = s.conn.index(&FlowTuple {
            src: Addr::new(10, 0, 0, 1),
            dst: Addr::new(192, 0, 2, 1),
            src_port: 1_234,
            dst_port: 80,
        });

        let open = tcp_frame(Addr::new(10, 0, 0, 1), Addr::new(192, 0, 2, 1), 1_234, 80, TcpFlags::SYN);
        drive(&mut s, &[open], T0);
        assert!(s.conn.get(index).is_active());

        drive(&mut s, &[], Instant::from_ticks(1));
        assert!(s.conn.get(index).is_active());
        assert_eq!(s.conn.get(index).age(), 1);

        drive(&mut s, &[], Instant::from_ticks(2));
        assert!(!s.conn.get(index).is_active());
    }

    #[test]
    fn test_order_preserved() {
        let mut s = suppressor();
        let internal = tcp_frame(Addr::new(10, 1, 1, 1), Addr::new(10, 2, 2, 2), 1, 2, TcpFlags::SYN);
        let miss = tcp_frame(Addr::new(192, 0, 2, 5), Addr::new(10, 0, 0, 1), 3, 4, TcpFlags::SYN);
        let noise = tcp_frame(Addr::new(192, 0, 2, 6), Addr::new(10, 0, 0, 1), 5, 6, TcpFlags::RST);
        let outbound = tcp_frame(Addr::new(10, 0, 0, 2), Addr::new(203, 0, 113, 9), 7, 8, TcpFlags::SYN);

        let frames = [internal.clone(), miss.clone(), noise, outbound.clone()];
        let forwarded = drive(&mut s, &frames, T0);

        let bytes: Vec<&[u8]> = forwarded.iter().map(|p| p.as_slice()).collect();
        assert_eq!(bytes, vec![&internal[..], &miss[..], &outbound[..]]);
    }

    #[test]
    fn test_backpressure_stops_the_drain() {
        let mut s = suppressor();
        let mut input = Link::new();
        let mut output = Link::with_capacity(1);
        for i in 1..=3u8 {
            let probe = tcp_frame(Addr::new(10, 1, 0, i), Addr::new(10, 2, 0, i), 1, 2, TcpFlags::SYN);
            input.transmit(Packet::from_slice(&probe));
        }
        s.push(T0, &mut input, &mut output);
        assert_eq!(output.len(), 1);
        assert_eq!(input.len(), 2);
    }
}
