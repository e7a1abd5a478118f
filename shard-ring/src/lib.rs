//! Consistent-hash ring and hash-range arithmetic used to place shards on a
//! 64-bit keyspace.

mod range;
mod ring;

pub use range::HashRange;
pub use ring::{ConsistentHashRing, RingError};
