//! The packet-processing apps.
//!
//! An app sits between two [`Link`]s and implements [`App::push`]: called
//! once per breath of the scheduling loop, it drains its input until the
//! input runs empty or the output runs full. Work always runs to
//! completion; backpressure is link fullness, never blocking. Housekeeping
//! (decay, aging) happens at the top of a push, between packets, never in
//! the middle of one.
//!
//! [`Link`]: ../storage/struct.Link.html
//! [`App::push`]: trait.App.html#tymethod.push

pub mod reassembly;
pub mod scan;

use crate::storage::Link;
use crate::time::Instant;

/// A run-to-completion packet processor.
pub trait App {
    /// Process queued packets.
    ///
    /// `now` is the worker's monotonic tick count; apps compare it against
    /// their own deadlines for periodic sweeps. Implementations must
    /// preserve packet order and must stop draining once `output` is full.
    fn push(&mut self, now: Instant, input: &mut Link, output: &mut Link);
}
