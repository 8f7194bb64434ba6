//! Data model: root, allotment table, leaf node, slot cells.

use crossbeam_epoch::Atomic;
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{PoisonError, RwLock};

/// One allotment cell. Null means empty; otherwise exactly one of a leaf
/// (a stored prefix) or a branch (the trie continues below). Internal heap
/// cells only ever hold leaves; branches live on the fringe.
pub enum Slot<R> {
    Leaf(ArtNode<R>),
    Branch(ArtTable<R>),
}

pub(crate) type SlotCell<R> = Atomic<Slot<R>>;

/// A stored `(prefix, prefix_len)` pair and its multipath route list.
///
/// The engine never interprets `R`; equality and ordering of routes are the
/// caller's concern. A node is created on first insert of the pair and
/// reclaimed after the last delete, once no reader can still hold it.
pub struct ArtNode<R> {
    key: u128,
    plen: u8,
    routes: RwLock<Vec<R>>,
}

impl<R> ArtNode<R> {
    pub(crate) fn new(key: u128, plen: u8, route: R) -> Self {
        Self {
            key,
            plen,
            routes: RwLock::new(vec![route]),
        }
    }

    /// Canonical prefix value (host bits zero), MSB-aligned.
    #[inline]
    pub fn key(&self) -> u128 {
        self.key
    }

    #[inline]
    pub fn prefix_len(&self) -> u8 {
        self.plen
    }

    /// Append an equal-cost alternative to the multipath list.
    pub fn push_route(&self, route: R) {
        self.routes
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(route);
    }

    /// Run `f` over the multipath list; route selection is caller policy.
    pub fn with_routes<T>(&self, f: impl FnOnce(&[R]) -> T) -> T {
        f(&self.routes.read().unwrap_or_else(PoisonError::into_inner))
    }

    pub fn route_count(&self) -> usize {
        self.routes
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub(crate) fn take_routes(&self) -> Vec<R> {
        std::mem::take(&mut *self.routes.write().unwrap_or_else(PoisonError::into_inner))
    }

    /// Recover the route from a node that never got published.
    pub(crate) fn into_route(self) -> R {
        let mut routes = self
            .routes
            .into_inner()
            .unwrap_or_else(PoisonError::into_inner);
        debug_assert_eq!(routes.len(), 1);
        routes
            .pop()
            .expect("freshly built node carries its route")
    }
}

/// One trie level: an allotment heap of `2^(stride+1)` cells, index 0 unused.
///
/// Heap index `j` encodes a sub-prefix of this level's stride: `j == 1` is
/// the table default (zero extra bits), `2^k + v` a `k`-bit prefix of value
/// `v`, and `2^stride + digit` the fringe slot for a full-stride digit.
/// A shorter-than-stride prefix occupies its single heap cell and is never
/// fanned out over the fringe; lookups walk the heap toward index 1 instead.
pub struct ArtTable<R> {
    level: u8,
    stride: u8,
    /// Occupied cells below this table. Writer-maintained; readers never
    /// look at it, so `Relaxed` suffices.
    live: AtomicUsize,
    heap: Box<[SlotCell<R>]>,
}

impl<R> ArtTable<R> {
    pub(crate) fn new(level: u8, stride: u8) -> Self {
        let cells = 1usize << (stride + 1);
        let heap = (0..cells)
            .map(|_| Atomic::null())
            .collect::<Vec<_>>()
            .into_boxed_slice();
        Self {
            level,
            stride,
            live: AtomicUsize::new(0),
            heap,
        }
    }

    #[inline]
    pub(crate) fn level(&self) -> u8 {
        self.level
    }

    #[inline]
    pub(crate) fn stride(&self) -> u8 {
        self.stride
    }

    #[inline]
    pub(crate) fn fringe_base(&self) -> usize {
        1 << self.stride
    }

    #[inline]
    pub(crate) fn cells(&self) -> usize {
        self.heap.len()
    }

    #[inline]
    pub(crate) fn cell(&self, j: usize) -> &SlotCell<R> {
        &self.heap[j]
    }

    #[inline]
    pub(crate) fn live(&self) -> usize {
        self.live.load(Ordering::Relaxed)
    }

    pub(crate) fn live_inc(&self) {
        self.live.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn live_dec(&self) {
        self.live.fetch_sub(1, Ordering::Relaxed);
    }

    pub(crate) fn live_reset(&self) {
        self.live.store(0, Ordering::Relaxed);
    }
}

/// One routing table: stride schedule, node budget and the top-level table.
///
/// Readers pin an epoch guard and run wait-free; writers publish with
/// single-pointer CAS and must be serialized by the host among themselves.
pub struct ArtRoot<R> {
    rtableid: u32,
    alen: u8,
    off: usize,
    bits: Vec<u8>,
    capacity: usize,
    /// Installed `(prefix, len)` pairs. Writer-maintained.
    pub(crate) count: AtomicUsize,
    pub(crate) top: ArtTable<R>,
}

impl<R> ArtRoot<R> {
    pub(crate) fn build(
        rtableid: u32,
        alen: u8,
        off: usize,
        bits: Vec<u8>,
        capacity: usize,
    ) -> Self {
        let top = ArtTable::new(0, bits[0]);
        Self {
            rtableid,
            alen,
            off,
            bits,
            capacity,
            count: AtomicUsize::new(0),
            top,
        }
    }

    #[inline]
    pub fn rtableid(&self) -> u32 {
        self.rtableid
    }

    /// Address length in bits (32 for IPv4 schedules, 128 for IPv6).
    #[inline]
    pub fn alen(&self) -> u8 {
        self.alen
    }

    /// Byte offset of the key inside caller-provided address buffers.
    #[inline]
    pub fn offset(&self) -> usize {
        self.off
    }

    #[inline]
    pub fn strides(&self) -> &[u8] {
        &self.bits
    }

    #[inline]
    pub fn levels(&self) -> usize {
        self.bits.len()
    }

    #[inline]
    pub(crate) fn stride_at(&self, level: u8) -> u8 {
        self.bits[level as usize]
    }

    /// Installed `(prefix, len)` pairs.
    pub fn len(&self) -> usize {
        self.count.load(Ordering::Relaxed)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Remaining node budget.
    pub fn available_capacity(&self) -> usize {
        self.capacity.saturating_sub(self.len())
    }
}

impl<R> fmt::Debug for ArtNode<R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ArtNode")
            .field("key", &format_args!("{:032x}", self.key))
            .field("prefix_len", &self.plen)
            .field("routes", &self.route_count())
            .finish()
    }
}

impl<R> fmt::Debug for ArtRoot<R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ArtRoot")
            .field("rtableid", &self.rtableid)
            .field("alen", &self.alen)
            .field("strides", &self.bits)
            .field("len", &self.len())
            .finish()
    }
}

/// Outcome of an insert: either a fresh leaf, or the already-present node
/// with the caller's route handed back so multipath-append vs reject stays
/// caller policy.
pub enum Insertion<'g, R> {
    Inserted(&'g ArtNode<R>),
    Exists { node: &'g ArtNode<R>, route: R },
}

impl<'g, R> Insertion<'g, R> {
    pub fn node(&self) -> &'g ArtNode<R> {
        match *self {
            Insertion::Inserted(node) => node,
            Insertion::Exists { node, .. } => node,
        }
    }

    pub fn is_new(&self) -> bool {
        matches!(self, Insertion::Inserted(_))
    }
}

impl<'g, R> fmt::Debug for Insertion<'g, R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Insertion::Inserted(node) => f.debug_tuple("Inserted").field(node).finish(),
            Insertion::Exists { node, .. } => f.debug_tuple("Exists").field(node).finish(),
        }
    }
}
