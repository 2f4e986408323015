//! Data-plane packet processing apps and the data structures they share.
//!
//! The crate follows a run-to-completion model: packets travel between apps
//! over bounded [`Link`] queues, and each app exposes a [`push`] method that
//! drains its input until the input is empty or the output is full. There is
//! no blocking, no suspension and no inter-thread sharing; a worker owns its
//! apps and their caches outright.
//!
//! The interesting parts, in dependency order:
//!
//! * [`wire`]: bit-exact views over raw header bytes (Ethernet with chained
//!   VLAN tags, IPv4 with its fragmentation fields, the IPv6 extension-header
//!   chain, TCP flags).
//! * [`storage`]: the owned [`Packet`] buffer with its process-local free
//!   list, and the bounded FIFO [`Link`].
//! * [`table`]: a Robin-Hood open-addressed hash table with displacement
//!   tracking, a batch lookup streamer, and a bit-exact snapshot format.
//! * [`layer`]: the apps themselves, IPv4 fragment reassembly and TRW-style
//!   scan suppression.
//!
//! [`Link`]: storage/struct.Link.html
//! [`push`]: layer/trait.App.html#tymethod.push
//! [`Packet`]: storage/struct.Packet.html
//! [`wire`]: wire/index.html
//! [`storage`]: storage/index.html
//! [`table`]: table/index.html
//! [`layer`]: layer/index.html

#[macro_use]
mod macros;

pub mod layer;
pub mod storage;
pub mod table;
pub mod time;
pub mod wire;
