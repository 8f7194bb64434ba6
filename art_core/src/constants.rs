//! Constants and stock stride schedules.

/// Hard upper bound on trie depth.
pub const MAX_LEVELS: usize = 16;

/// Widest stride a single table may consume; a stride-8 table is an
/// allotment heap of 512 cells.
pub const MAX_STRIDE: u8 = 8;

/// Heap index of a table's own default entry (zero extra bits).
pub const DEFAULT_IDX: usize = 1;

pub const IPV4_ALEN: u8 = 32;
pub const IPV6_ALEN: u8 = 128;

/// Stock schedules; any schedule summing to the address length works.
pub const IPV4_STRIDES: [u8; 4] = [8, 8, 8, 8];
pub const IPV6_STRIDES: [u8; 16] = [8; 16];

pub const DEFAULT_CAPACITY: usize = 1_048_576;
