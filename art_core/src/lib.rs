//! Allotment routing table: a multi-level, array-based trie for
//! longest-prefix-match route lookup. Readers run wait-free against a
//! single writer; unlinked slots are reclaimed through epoch-based
//! deferral, never freed in place.

pub mod constants;
pub mod errors;
pub mod helpers;
pub mod registry;
pub mod telemetry;
pub mod types;

pub use crossbeam_epoch::{self as epoch, pin, Guard};
pub use errors::Error;
pub use registry::RootRegistry;
pub use types::{ArtNode, ArtRoot, ArtTable, Insertion, Slot};

use constants::*;
use crossbeam_epoch::{Owned, Shared};
use helpers::*;
use log::{debug, trace, warn};
use metrics::{counter, gauge};
use once_cell::sync::OnceCell;
use std::sync::atomic::Ordering;

impl<R> ArtRoot<R>
where
    R: Send + Sync + 'static,
{
    // ---- logging bootstrapper ------------------------------------------
    fn ensure_logging() {
        static INIT: OnceCell<()> = OnceCell::new();
        INIT.get_or_init(|| {
            let _ = env_logger::builder()
                .format_timestamp(None)
                .is_test(std::env::var("RUST_TEST_THREADS").is_ok())
                .try_init();
        });
    }

    /// Stock IPv4 root: 8-8-8-8 strides over 32 bits.
    pub fn ipv4(rtableid: u32, off: usize, capacity: usize) -> Self {
        Self::with_strides(rtableid, IPV4_ALEN, off, &IPV4_STRIDES, capacity)
            .expect("stock IPv4 stride schedule is valid")
    }

    /// Stock IPv6 root: sixteen 8-bit strides over 128 bits.
    pub fn ipv6(rtableid: u32, off: usize, capacity: usize) -> Self {
        Self::with_strides(rtableid, IPV6_ALEN, off, &IPV6_STRIDES, capacity)
            .expect("stock IPv6 stride schedule is valid")
    }

    /// Create a root with an explicit stride schedule.
    ///
    /// The schedule is a tuning knob, not a semantic one: any `bits` with
    /// `sum(bits) == alen`, at most [`MAX_LEVELS`](constants::MAX_LEVELS)
    /// entries and per-level strides in `1..=MAX_STRIDE` yields identical
    /// match results.
    pub fn with_strides(
        rtableid: u32,
        alen: u8,
        off: usize,
        bits: &[u8],
        capacity: usize,
    ) -> Result<Self, Error> {
        Self::ensure_logging();
        telemetry::init();
        if alen == 0 || alen > 128 {
            return Err(Error::UnsupportedAddressLength);
        }
        if bits.is_empty() || bits.len() > MAX_LEVELS {
            return Err(Error::InvalidStrides);
        }
        if bits.iter().any(|&s| s == 0 || s > MAX_STRIDE) {
            return Err(Error::InvalidStrides);
        }
        if bits.iter().map(|&s| s as u32).sum::<u32>() != alen as u32 {
            return Err(Error::InvalidStrides);
        }
        debug!(
            "new art root: rtableid={rtableid} alen={alen} nlvl={} capacity={capacity}",
            bits.len()
        );
        Ok(Self::build(rtableid, alen, off, bits.to_vec(), capacity))
    }

    /// Emit the free-slot gauge (caller decides cadence).
    pub fn report_capacity_metrics(&self) {
        gauge!("art_free_slots").set(self.available_capacity() as f64);
    }

    /// Execute pending deferred frees now. Cheap, and wait-free for
    /// readers; meant for a cron job or admin endpoint.
    pub fn flush(&self) {
        epoch::pin().flush();
    }

    // ---- insert --------------------------------------------------------

    /// Install `route` under `(key, plen)`.
    ///
    /// Returns [`Insertion::Exists`] with the caller's route handed back
    /// when the pair is already present; appending to the multipath list
    /// vs rejecting the duplicate is caller policy. The tree is untouched
    /// on any error.
    pub fn insert<'g>(
        &'g self,
        guard: &'g Guard,
        key: u128,
        plen: u8,
        mut route: R,
    ) -> Result<Insertion<'g, R>, Error> {
        if plen > self.alen() {
            return Err(Error::InvalidPrefix);
        }
        counter!("art_inserts_total").increment(1);
        let key = canonical(key, plen);
        trace!("insert: rtableid={} {key:032x}/{plen}", self.rtableid());

        'restart: loop {
            if self.len() >= self.capacity() {
                return Err(Error::CapacityExceeded);
            }
            let mut table = &self.top;
            let mut consumed = 0u8;
            loop {
                let stride = table.stride();
                let rem = plen - consumed;
                let dg = digit(key, consumed, stride);

                if rem > stride {
                    // The prefix reaches past this level: descend, growing
                    // a child table when the fringe slot has none.
                    let cell = table.cell(table.fringe_base() + dg);
                    let cur = cell.load(Ordering::Acquire, guard);
                    if let Some(Slot::Branch(child)) = unsafe { cur.as_ref() } {
                        table = child;
                        consumed += stride;
                        continue;
                    }
                    let child = ArtTable::new(table.level() + 1, self.stride_at(table.level() + 1));
                    if !cur.is_null() {
                        // An exact-stride leaf occupies the slot; it becomes
                        // the new table's default, published in the same
                        // parent-slot swap so readers see one or the other.
                        child.cell(DEFAULT_IDX).store(cur, Ordering::Relaxed);
                        child.live_inc();
                    }
                    let grown = Owned::new(Slot::Branch(child));
                    match cell.compare_exchange(cur, grown, Ordering::AcqRel, Ordering::Acquire, guard)
                    {
                        Ok(published) => {
                            if cur.is_null() {
                                table.live_inc();
                            }
                            counter!("art_tables_grown_total").increment(1);
                            let Slot::Branch(child) = (unsafe { published.deref() }) else {
                                unreachable!("just published a branch")
                            };
                            table = child;
                            consumed += stride;
                            continue;
                        }
                        Err(lost) => {
                            // Unhook the moved leaf before the fresh table
                            // drops, then retry against the new shape.
                            if let Slot::Branch(t) = &*lost.new {
                                t.cell(DEFAULT_IDX).store(Shared::null(), Ordering::Relaxed);
                            }
                            warn!("insert: fringe slot changed during table growth, restarting");
                            continue 'restart;
                        }
                    }
                }

                // Terminal level: resolve the cell encoding (prefix, len).
                let (host, j) = if rem == stride {
                    let fj = table.fringe_base() + dg;
                    match unsafe { table.cell(fj).load(Ordering::Acquire, guard).as_ref() } {
                        // a child table already hangs here; the pair lands
                        // in its default slot
                        Some(Slot::Branch(child)) => (child, DEFAULT_IDX),
                        _ => (table, fj),
                    }
                } else {
                    (table, (1usize << rem) | (dg >> (stride - rem)))
                };

                let cell = host.cell(j);
                let cur = cell.load(Ordering::Acquire, guard);
                match unsafe { cur.as_ref() } {
                    Some(Slot::Leaf(node)) => {
                        debug_assert_eq!((node.key(), node.prefix_len()), (key, plen));
                        counter!("art_insert_dupes_total").increment(1);
                        return Ok(Insertion::Exists { node, route });
                    }
                    Some(Slot::Branch(_)) => {
                        // a racing writer deepened the slot we resolved
                        continue 'restart;
                    }
                    None => {}
                }
                let leaf = Owned::new(Slot::Leaf(ArtNode::new(key, plen, route)));
                match cell.compare_exchange(
                    Shared::null(),
                    leaf,
                    Ordering::AcqRel,
                    Ordering::Acquire,
                    guard,
                ) {
                    Ok(published) => {
                        host.live_inc();
                        self.count.fetch_add(1, Ordering::Relaxed);
                        gauge!("art_route_count").set(self.len() as f64);
                        debug!("insert: new leaf {key:032x}/{plen} rtableid={}", self.rtableid());
                        let Slot::Leaf(node) = (unsafe { published.deref() }) else {
                            unreachable!("just published a leaf")
                        };
                        return Ok(Insertion::Inserted(node));
                    }
                    Err(lost) => {
                        let Slot::Leaf(node) = *lost.new.into_box() else {
                            unreachable!("we built a leaf")
                        };
                        route = node.into_route();
                        continue 'restart;
                    }
                }
            }
        }
    }

    // ---- delete --------------------------------------------------------

    /// Withdraw `(key, plen)`; returns the removed multipath list, or
    /// `None` when the pair was never installed (a no-op, not an error).
    pub fn delete(&self, guard: &Guard, key: u128, plen: u8) -> Option<Vec<R>> {
        if plen > self.alen() {
            return None;
        }
        let key = canonical(key, plen);

        // Descend to the terminal cell, recording the fringe path for the
        // collapse pass.
        let mut path: Vec<(&ArtTable<R>, usize)> = Vec::with_capacity(self.levels());
        let mut table = &self.top;
        let mut consumed = 0u8;
        let (host, j) = loop {
            let stride = table.stride();
            let rem = plen - consumed;
            let dg = digit(key, consumed, stride);
            if rem > stride {
                let fj = table.fringe_base() + dg;
                match unsafe { table.cell(fj).load(Ordering::Acquire, guard).as_ref() } {
                    Some(Slot::Branch(child)) => {
                        path.push((table, fj));
                        table = child;
                        consumed += stride;
                        continue;
                    }
                    _ => return None,
                }
            }
            if rem == stride {
                let fj = table.fringe_base() + dg;
                match unsafe { table.cell(fj).load(Ordering::Acquire, guard).as_ref() } {
                    Some(Slot::Branch(child)) => {
                        path.push((table, fj));
                        break (child, DEFAULT_IDX);
                    }
                    _ => break (table, fj),
                }
            }
            break (table, (1usize << rem) | (dg >> (stride - rem)));
        };

        let cell = host.cell(j);
        let cur = cell.load(Ordering::Acquire, guard);
        let node = match unsafe { cur.as_ref() } {
            Some(Slot::Leaf(node)) if node.key() == key && node.prefix_len() == plen => node,
            _ => return None,
        };
        // Unlink with a single CAS; if the slot changed underneath, the
        // target is gone already.
        if cell
            .compare_exchange(cur, Shared::null(), Ordering::AcqRel, Ordering::Acquire, guard)
            .is_err()
        {
            return None;
        }
        host.live_dec();
        self.count.fetch_sub(1, Ordering::Relaxed);
        let routes = node.take_routes();
        // Readers that entered before the unlink may still hold the node;
        // freeing waits until no pinned reader can reference it.
        unsafe { guard.defer_destroy(cur) };
        counter!("art_deletes_total").increment(1);
        gauge!("art_route_count").set(self.len() as f64);
        debug!("delete: removed {key:032x}/{plen} rtableid={}", self.rtableid());

        self.collapse(guard, &path);
        Some(routes)
    }

    /// Bottom-up cleanup after a delete: unlink tables left empty, and
    /// re-hoist a table whose only remaining entry is its default leaf.
    fn collapse(&self, guard: &Guard, path: &[(&ArtTable<R>, usize)]) {
        for &(parent, fj) in path.iter().rev() {
            let cell = parent.cell(fj);
            let cur = cell.load(Ordering::Acquire, guard);
            let child = match unsafe { cur.as_ref() } {
                Some(Slot::Branch(child)) => child,
                _ => return,
            };
            match child.live() {
                0 => {
                    if cell
                        .compare_exchange(
                            cur,
                            Shared::null(),
                            Ordering::AcqRel,
                            Ordering::Acquire,
                            guard,
                        )
                        .is_err()
                    {
                        return;
                    }
                    parent.live_dec();
                    // Table drops are shallow; its cells are already empty.
                    unsafe { guard.defer_destroy(cur) };
                    counter!("art_tables_collapsed_total").increment(1);
                    trace!("collapse: empty level-{} table unlinked", child.level());
                    // the parent may have gone empty in turn
                }
                1 => {
                    // Sole survivor: only a default leaf may move up; a
                    // lone deeper entry keeps its table.
                    let dflt = child.cell(DEFAULT_IDX).load(Ordering::Acquire, guard);
                    match unsafe { dflt.as_ref() } {
                        Some(Slot::Leaf(_)) => {}
                        _ => return,
                    }
                    if cell
                        .compare_exchange(cur, dflt, Ordering::AcqRel, Ordering::Acquire, guard)
                        .is_ok()
                    {
                        // The dying table still references the leaf until
                        // reclaimed; the shallow drop never frees it.
                        unsafe { guard.defer_destroy(cur) };
                        counter!("art_tables_collapsed_total").increment(1);
                        trace!("collapse: level-{} table re-hoisted its default", child.level());
                    }
                    return;
                }
                _ => return,
            }
        }
    }

    // ---- lookup (hot path) ---------------------------------------------

    /// Longest-prefix match for `key`.
    ///
    /// One descent, acquire loads only: a fringe leaf wins outright, a
    /// branch refreshes the running best with this table's nearest
    /// enclosing default before descending, and an empty fringe resolves
    /// to the nearest default; no deeper match can exist below an
    /// unallocated slot.
    pub fn lookup<'g>(&'g self, guard: &'g Guard, key: u128) -> Option<&'g ArtNode<R>> {
        let mut table = &self.top;
        let mut consumed = 0u8;
        let mut best: Option<&'g ArtNode<R>> = None;
        loop {
            let stride = table.stride();
            let dg = digit(key, consumed, stride);
            let fj = table.fringe_base() + dg;
            match unsafe { table.cell(fj).load(Ordering::Acquire, guard).as_ref() } {
                Some(Slot::Leaf(node)) => return Some(node),
                Some(Slot::Branch(child)) => {
                    if let Some(node) = Self::heap_default(guard, table, fj) {
                        best = Some(node);
                    }
                    table = child;
                    consumed += stride;
                }
                None => return Self::heap_default(guard, table, fj).or(best),
            }
        }
    }

    /// Nearest enclosing default for fringe index `fj`: walk the allotment
    /// heap toward the root cell. The first leaf met is the deepest
    /// sub-prefix covering the digit.
    fn heap_default<'g>(
        guard: &'g Guard,
        table: &'g ArtTable<R>,
        fj: usize,
    ) -> Option<&'g ArtNode<R>> {
        let mut j = fj >> 1;
        while j >= DEFAULT_IDX {
            if let Some(Slot::Leaf(node)) =
                unsafe { table.cell(j).load(Ordering::Acquire, guard).as_ref() }
            {
                return Some(node);
            }
            j >>= 1;
        }
        None
    }

    /// Exact `(key, plen)` lookup: same descent as [`lookup`](Self::lookup)
    /// but without default fallback. Control-plane use, not forwarding.
    pub fn exact<'g>(&'g self, guard: &'g Guard, key: u128, plen: u8) -> Option<&'g ArtNode<R>> {
        if plen > self.alen() {
            return None;
        }
        let key = canonical(key, plen);
        let mut table = &self.top;
        let mut consumed = 0u8;
        let (host, j) = loop {
            let stride = table.stride();
            let rem = plen - consumed;
            let dg = digit(key, consumed, stride);
            if rem > stride {
                match unsafe {
                    table
                        .cell(table.fringe_base() + dg)
                        .load(Ordering::Acquire, guard)
                        .as_ref()
                } {
                    Some(Slot::Branch(child)) => {
                        table = child;
                        consumed += stride;
                        continue;
                    }
                    _ => return None,
                }
            }
            if rem == stride {
                let fj = table.fringe_base() + dg;
                match unsafe { table.cell(fj).load(Ordering::Acquire, guard).as_ref() } {
                    Some(Slot::Branch(child)) => break (child, DEFAULT_IDX),
                    _ => break (table, fj),
                }
            }
            break (table, (1usize << rem) | (dg >> (stride - rem)));
        };
        match unsafe { host.cell(j).load(Ordering::Acquire, guard).as_ref() } {
            Some(Slot::Leaf(node)) if node.key() == key && node.prefix_len() == plen => Some(node),
            _ => None,
        }
    }

    // ---- buffer entry points -------------------------------------------

    /// [`insert`](Self::insert) with the key extracted at this root's byte
    /// offset inside a caller-defined address buffer.
    pub fn insert_buf<'g>(
        &'g self,
        guard: &'g Guard,
        buf: &[u8],
        plen: u8,
        route: R,
    ) -> Result<Insertion<'g, R>, Error> {
        let key = key_from_bytes(buf, self.offset(), self.alen()).ok_or(Error::KeyTooShort)?;
        self.insert(guard, key, plen, route)
    }

    pub fn delete_buf(&self, guard: &Guard, buf: &[u8], plen: u8) -> Option<Vec<R>> {
        let key = key_from_bytes(buf, self.offset(), self.alen())?;
        self.delete(guard, key, plen)
    }

    pub fn lookup_buf<'g>(&'g self, guard: &'g Guard, buf: &[u8]) -> Option<&'g ArtNode<R>> {
        let key = key_from_bytes(buf, self.offset(), self.alen())?;
        self.lookup(guard, key)
    }

    pub fn exact_buf<'g>(
        &'g self,
        guard: &'g Guard,
        buf: &[u8],
        plen: u8,
    ) -> Option<&'g ArtNode<R>> {
        let key = key_from_bytes(buf, self.offset(), self.alen())?;
        self.exact(guard, key, plen)
    }

    // ---- walk ----------------------------------------------------------

    /// Visit every installed node exactly once, aborting on the first
    /// `Err` from `visit` and propagating it.
    ///
    /// Relaxed consistency: concurrent inserts and deletes are tolerated
    /// and the traversal is a best-effort snapshot, not an isolated one.
    /// Diagnostics and dumps, not forwarding.
    pub fn walk<'g, F, E>(&'g self, guard: &'g Guard, mut visit: F) -> Result<(), E>
    where
        F: FnMut(&'g ArtNode<R>) -> Result<(), E>,
    {
        let mut stack: Vec<&'g ArtTable<R>> = Vec::with_capacity(self.levels());
        stack.push(&self.top);
        while let Some(table) = stack.pop() {
            for j in DEFAULT_IDX..table.cells() {
                match unsafe { table.cell(j).load(Ordering::Acquire, guard).as_ref() } {
                    Some(Slot::Leaf(node)) => visit(node)?,
                    Some(Slot::Branch(child)) => stack.push(child),
                    None => {}
                }
            }
        }
        Ok(())
    }

    // ---- clear ---------------------------------------------------------

    /// Withdraw every installed prefix. Freeing is deferred per slot, so
    /// in-flight readers finish against the old shape.
    pub fn clear(&self, guard: &Guard) {
        let mut pending: Vec<Shared<'_, Slot<R>>> = Vec::new();
        for j in DEFAULT_IDX..self.top.cells() {
            let sh = self.top.cell(j).swap(Shared::null(), Ordering::AcqRel, guard);
            if !sh.is_null() {
                pending.push(sh);
            }
        }
        self.top.live_reset();
        while let Some(sh) = pending.pop() {
            if let Some(Slot::Branch(table)) = unsafe { sh.as_ref() } {
                for j in DEFAULT_IDX..table.cells() {
                    let c = table.cell(j).swap(Shared::null(), Ordering::AcqRel, guard);
                    if !c.is_null() {
                        pending.push(c);
                    }
                }
            }
            unsafe { guard.defer_destroy(sh) };
        }
        self.count.store(0, Ordering::Relaxed);
        gauge!("art_route_count").set(0.0);
        debug!("clear: rtableid={} emptied", self.rtableid());
    }
}

impl<R> Drop for ArtRoot<R> {
    fn drop(&mut self) {
        // Sole owner here: no reader can still be pinned on this trie, so
        // the unprotected guard is sound.
        let guard = unsafe { epoch::unprotected() };
        let mut pending: Vec<Owned<Slot<R>>> = Vec::new();
        for j in DEFAULT_IDX..self.top.cells() {
            let sh = self.top.cell(j).swap(Shared::null(), Ordering::Relaxed, guard);
            if !sh.is_null() {
                pending.push(unsafe { sh.into_owned() });
            }
        }
        while let Some(slot) = pending.pop() {
            if let Slot::Branch(table) = &*slot {
                for j in DEFAULT_IDX..table.cells() {
                    let sh = table.cell(j).swap(Shared::null(), Ordering::Relaxed, guard);
                    if !sh.is_null() {
                        pending.push(unsafe { sh.into_owned() });
                    }
                }
            }
        }
    }
}
