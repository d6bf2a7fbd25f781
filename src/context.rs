//! The page cache / allocator context: bounded buffer pool,
//! cooperative eviction with depth-ordered commit, and the free-list
//! allocator that backs it.

use tracing::{debug, trace, warn};

use crate::checksum::Checksum;
use crate::disk::{read_page, write_run, Disk};
use crate::error::{bug, Error, Result};
use crate::id::{Allocator, Id, IdRange};
use crate::lru::{Elt, Lru};
use crate::sector::{Buffer, FinalizeOutcome, Finalizer, PendingEntry, Sector, SectorState};

/// Every committed page reserves one leading byte for cache bookkeeping and a
/// trailing checksum digest; producers (e.g. [`crate::rope`]) only ever see
/// the slice in between, via [`Context::cstruct_payload`].
const PAGE_HEADER_BYTES: usize = 1;

pub(crate) fn checksum_data_end(page_len: usize, digest_size: usize) -> usize {
    page_len - digest_size
}

/// Computes and appends a checksum trailer to `buf`, in place. Exposed
/// `pub(crate)` so [`crate::superblock`] can checksum generation records the
/// same way ordinary pages are checksummed.
pub(crate) fn write_checksum_trailer(checksum: &dyn Checksum, buf: &mut [u8]) {
    let digest_size = checksum.digest_size();
    let end = checksum_data_end(buf.len(), digest_size);
    let digest = checksum.compute(&buf[..end]);
    buf[end..].copy_from_slice(&digest);
}

pub(crate) fn verify_checksum_trailer(checksum: &dyn Checksum, buf: &[u8]) -> bool {
    let digest_size = checksum.digest_size();
    let end = checksum_data_end(buf.len(), digest_size);
    let digest = checksum.compute(&buf[..end]);
    buf[end..] == digest[..]
}

/// Where a freshly allocated page comes from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AllocFrom {
    /// A pinned, detached page (e.g. a rope root held by the caller).
    Root,
    /// An attached page, eligible for eviction once written to.
    Load,
}

/// Tunable cache configuration.
#[derive(Debug, Clone, Copy)]
pub struct CacheConfig {
    pub max_lru_size: usize,
    pub min_lru_size: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self { max_lru_size: 1024, min_lru_size: 512 }
    }
}

/// The page cache and allocator. Generic over the backing [`Disk`] so tests
/// can swap in [`crate::disk::mem::MemDisk`].
pub struct Context {
    disk: Box<dyn Disk>,
    checksum: Box<dyn Checksum>,
    page_size: usize,
    config: CacheConfig,
    lru: Lru<Sector>,
    available: Vec<Buffer>,
    safe_lru: bool,
    allocator: Allocator,
}

impl Context {
    pub fn new(
        disk: Box<dyn Disk>,
        checksum: Box<dyn Checksum>,
        page_size: usize,
        config: CacheConfig,
        allocator: Allocator,
    ) -> Self {
        Self {
            disk,
            checksum,
            page_size,
            config,
            lru: Lru::new(),
            available: Vec::new(),
            safe_lru: true,
            allocator,
        }
    }

    pub fn page_size(&self) -> usize {
        self.page_size
    }

    /// Bytes available to a page producer once the reserved header byte and
    /// the trailing checksum digest are excluded.
    pub fn payload_size(&self) -> usize {
        self.page_size - PAGE_HEADER_BYTES - self.checksum.digest_size()
    }

    pub fn checksum(&self) -> &dyn Checksum {
        self.checksum.as_ref()
    }

    pub fn config(&self) -> CacheConfig {
        self.config
    }

    pub fn allocator_mut(&mut self) -> &mut Allocator {
        &mut self.allocator
    }

    pub fn allocator(&self) -> &Allocator {
        &self.allocator
    }

    /// Exposed so [`crate::superblock`] can read/write the two reserved
    /// generation-record pages directly, bypassing the page cache (they
    /// aren't cached pages -- there's nowhere to evict them to).
    pub(crate) fn disk(&self) -> &dyn Disk {
        self.disk.as_ref()
    }

    // ---- buffer pool ----------------------------------------------------

    fn cstruct_create(&mut self) -> Buffer {
        self.available.pop().unwrap_or_else(|| vec![0u8; self.page_size])
    }

    /// Push buffers back onto the pool, but only if doing so wouldn't exceed
    /// `max_lru_size`. The check happens once, before the whole list is
    /// appended -- not per element (see DESIGN.md for why this is kept as-is
    /// rather than "fixed").
    fn release_cstructs(&mut self, mut bufs: Vec<Buffer>) {
        if self.available.len() < self.config.max_lru_size {
            self.available.append(&mut bufs);
        }
    }

    // ---- reentrancy guard -------------------------------------------------

    fn protect_lru<F, T>(&mut self, f: F) -> Result<T>
    where
        F: FnOnce(&mut Self) -> Result<T>,
    {
        assert!(self.safe_lru, "reentrant entry into the eviction path");
        self.safe_lru = false;
        let result = f(self);
        self.safe_lru = true;
        result
    }

    // ---- allocation / lifecycle -------------------------------------------

    /// Allocate a fresh `InMemory` sector.
    pub fn allocate(&mut self, from: AllocFrom) -> Result<Elt> {
        match from {
            AllocFrom::Root => {
                let buf = self.cstruct_create();
                Ok(self.lru.make_detached(Sector::new_in_memory(buf)))
            }
            AllocFrom::Load => {
                if self.safe_lru && self.lru.length() >= self.config.max_lru_size {
                    self.protect_lru(|ctx| ctx.lru_make_room())?;
                }
                let buf = self.cstruct_create();
                Ok(self.lru.make_elt(Sector::new_in_memory(buf)))
            }
        }
    }

    /// Register the finalizer for a sector. Must happen before the sector is
    /// first observed as evictable.
    pub fn set_finalize(&mut self, elt: Elt, finalizer: Finalizer) {
        self.lru.get_mut(elt).finalizer = Some(finalizer);
    }

    /// Transition `InMemory -> OnDisk(id)` outside of the eviction path,
    /// releasing the buffer back to the pool immediately.
    pub fn set_id(&mut self, elt: Elt, id: Id) {
        let sector = self.lru.get_mut(elt);
        match std::mem::replace(&mut sector.state, SectorState::OnDisk(id)) {
            SectorState::InMemory(buf) => self.release_cstructs(vec![buf]),
            SectorState::OnDisk(existing) => {
                assert_eq!(existing, id, "sector already OnDisk under a different id");
                self.lru.get_mut(elt).state = SectorState::OnDisk(existing);
            }
            SectorState::Freed => bug!("set_id on a Freed sector"),
        }
        self.lru.detach_remove(elt);
    }

    /// Commit-path variant of [`Context::set_id`]: transitions the sector to
    /// `OnDisk(id)` but hands the buffer back to the caller instead of the
    /// pool, so it can still be used for the pending vectored write.
    pub(crate) fn finish_commit(&mut self, elt: Elt, id: Id) -> Buffer {
        let sector = self.lru.get_mut(elt);
        let buf = match std::mem::replace(&mut sector.state, SectorState::OnDisk(id)) {
            SectorState::InMemory(buf) => buf,
            _ => bug!("finish_commit on a non-InMemory sector"),
        };
        self.lru.detach_remove(elt);
        buf
    }

    /// Tear down a sector: release its buffer (if any) and mark it `Freed`.
    pub fn unallocate(&mut self, elt: Elt) {
        let sector = self.lru.get_mut(elt);
        match std::mem::replace(&mut sector.state, SectorState::Freed) {
            SectorState::InMemory(buf) => self.release_cstructs(vec![buf]),
            SectorState::OnDisk(_) => {}
            SectorState::Freed => bug!("double unallocate of a sector"),
        }
        self.lru.detach_remove(elt);
    }

    /// Get the buffer for `elt`, loading it from disk first if it's
    /// currently `OnDisk`. Touches the LRU (moves to the front).
    pub fn cstruct(&mut self, elt: Elt) -> Result<&mut [u8]> {
        self.lru.use_elt(elt);
        if let SectorState::OnDisk(id) = self.lru.get(elt).state {
            let mut buf = self.cstruct_create();
            trace!(page = id.0, "loading page from disk");
            read_page(self.disk.as_ref(), id.0, &mut buf)?;
            if !verify_checksum_trailer(self.checksum.as_ref(), &buf) {
                self.available.push(buf);
                return Err(Error::InvalidChecksum(id));
            }
            self.lru.get_mut(elt).state = SectorState::InMemory(buf);
        }
        match &mut self.lru.get_mut(elt).state {
            SectorState::InMemory(buf) => Ok(buf.as_mut_slice()),
            SectorState::Freed => bug!("cstruct on a Freed sector"),
            SectorState::OnDisk(_) => unreachable!("just transitioned to InMemory above"),
        }
    }

    /// Infallible buffer accessor; fatal if the sector isn't `InMemory`.
    pub fn cstruct_in_memory(&mut self, elt: Elt) -> &mut [u8] {
        match &mut self.lru.get_mut(elt).state {
            SectorState::InMemory(buf) => buf.as_mut_slice(),
            _ => bug!("cstruct_in_memory on a non-InMemory sector"),
        }
    }

    /// [`Context::cstruct`], narrowed to the payload region a page producer
    /// is allowed to see (the reserved header byte and checksum trailer are
    /// cache-layer concerns, not theirs).
    pub fn cstruct_payload(&mut self, elt: Elt) -> Result<&mut [u8]> {
        let end = checksum_data_end(self.page_size, self.checksum.digest_size());
        let buf = self.cstruct(elt)?;
        Ok(&mut buf[PAGE_HEADER_BYTES..end])
    }

    /// [`Context::cstruct_in_memory`], narrowed to the payload region.
    pub fn cstruct_in_memory_payload(&mut self, elt: Elt) -> &mut [u8] {
        let end = checksum_data_end(self.page_size, self.checksum.digest_size());
        let buf = self.cstruct_in_memory(elt);
        &mut buf[PAGE_HEADER_BYTES..end]
    }

    pub fn is_in_memory(&self, elt: Elt) -> bool {
        self.lru.get(elt).is_in_memory()
    }

    pub fn on_disk_id(&self, elt: Elt) -> Option<Id> {
        self.lru.get(elt).on_disk_id()
    }

    /// Create a detached handle onto an already-committed page, without
    /// reading it. The buffer is loaded lazily, on first [`Context::cstruct`].
    pub fn load_on_disk(&mut self, id: Id) -> Elt {
        self.lru.make_detached(Sector { state: SectorState::OnDisk(id), finalizer: None })
    }

    /// Attach a detached element to the LRU, making it evictable. A no-op if
    /// it's already attached.
    pub fn attach(&mut self, elt: Elt) {
        if !self.lru.is_attached(elt) {
            self.lru.push_front(elt);
        }
    }

    /// Verify a page's checksum trailer directly against disk, bypassing the
    /// cache. Used by [`crate::rope::verify_checksum`]'s integrity scan.
    pub fn verify_on_disk_page(&self, id: Id) -> Result<()> {
        let mut buf = vec![0u8; self.page_size];
        read_page(self.disk.as_ref(), id.0, &mut buf)?;
        if verify_checksum_trailer(self.checksum.as_ref(), &buf) {
            Ok(())
        } else {
            Err(Error::InvalidChecksum(id))
        }
    }

    // ---- discarded set ------------------------------------------------

    pub fn discard(&mut self, id: Id) {
        self.allocator.discarded_mut().add(id);
    }

    pub fn discard_range(&mut self, range: IdRange) {
        self.allocator.discarded_mut().add_range(range.start, range.len);
    }

    pub fn acquire_discarded(&mut self) -> Vec<IdRange> {
        self.allocator.discarded_mut().drain_as_ranges()
    }

    // ---- eviction -------------------------------------------------------

    /// Run `elt`'s finalizer, if it has one and is still `InMemory`,
    /// detaching it from the LRU first so it can never be independently
    /// re-evicted. Any `Pending` entry the finalizer produces (for itself or
    /// recursively for its children) lands in the shared `batch`.
    fn run_finalizer(&mut self, elt: Elt, batch: &mut Vec<PendingEntry>) -> Result<()> {
        if !self.lru.get(elt).is_in_memory() {
            return Ok(());
        }
        self.lru.detach_remove(elt);
        let Some(mut finalizer) = self.lru.get_mut(elt).finalizer.take() else {
            // A sector only ever loses its finalizer by having one run. If it's
            // still `InMemory` afterward, something upstream discarded a
            // `Pending` write instead of committing it -- the sector was never
            // actually given an id, so treating this as "already handled" would
            // let a dangling child reach a parent's writer with no on-disk id.
            bug!("sector {:?} is InMemory with a consumed finalizer (pending write dropped without committing)", elt);
        };
        match finalizer(self, batch)? {
            FinalizeOutcome::Evicted(id) => self.set_id(elt, id),
            FinalizeOutcome::Pending => {}
        }
        Ok(())
    }

    /// Recursively finalize a child sector that isn't necessarily at the LRU
    /// tail: an interior node's finalizer finalizes its still-`InMemory`
    /// children before itself. Exposed for [`crate::rope`].
    pub(crate) fn finalize_child(&mut self, elt: Elt, batch: &mut Vec<PendingEntry>) -> Result<()> {
        self.run_finalizer(elt, batch)
    }

    /// The central eviction loop. Stops once the LRU has dipped below
    /// `min_lru_size` and the buffer pool can still supply a fresh buffer --
    /// `allocate(Load)` only needs *some* room, not an empty cache.
    pub(crate) fn lru_make_room(&mut self) -> Result<()> {
        self.drain_lru(true)
    }

    /// Shared eviction loop behind [`Context::lru_make_room`] and
    /// [`Context::flush`]. With `stop_early`, respects the soft
    /// `min_lru_size` floor; without it, drains every evictable sector
    /// regardless of the floor (a generation commit must flush the whole
    /// cache before swapping the generation).
    fn drain_lru(&mut self, stop_early: bool) -> Result<()> {
        let mut batch: Vec<PendingEntry> = Vec::new();
        loop {
            let Some(elt) = self.lru.peek_back() else { break };
            if self.lru.get(elt).finalizer.is_none() {
                break;
            }
            if stop_early && self.lru.length() < self.config.min_lru_size && !self.available.is_empty() {
                break;
            }
            let elt = self.lru.pop_back().expect("peek_back just confirmed an element");
            match self.lru.get(elt).state {
                SectorState::OnDisk(id) => {
                    self.discard(id);
                    self.lru.take(elt);
                }
                SectorState::Freed => bug!("Freed sector found attached in the LRU"),
                SectorState::InMemory(_) => {
                    self.run_finalizer(elt, &mut batch)?;
                }
            }
        }
        self.commit_batch(batch)
    }

    /// Fully drains the LRU through the depth-ordered commit path, leaving it
    /// empty. Used by a generation commit, which must persist every dirty
    /// page -- not just enough to free up room for the next allocation.
    pub fn flush(&mut self) -> Result<()> {
        self.protect_lru(|ctx| ctx.drain_lru(false))
    }

    /// The depth-ordered commit phase: request ids, sort shallowest-first
    /// (leaves before their ancestors), write each entry, then issue one
    /// vectored write per contiguous run.
    fn commit_batch(&mut self, mut batch: Vec<PendingEntry>) -> Result<()> {
        if batch.is_empty() {
            return Ok(());
        }

        // 1. Request |batch| contiguous ids.
        let requested = batch.len() as u64;
        let run = self.allocator.alloc_run(requested).ok_or(Error::DiskIsFull)?;

        // 2. Drop entries superseded during the traversal; return the
        // unconsumed tail of the run to the discarded set.
        batch.retain(|entry| self.lru.get(entry.elt).is_in_memory());
        let consumed = batch.len() as u64;
        if consumed < run.len {
            let leftover_start = run.start.add(consumed);
            self.allocator.discarded_mut().add_range(leftover_start, run.len - consumed);
        }
        if batch.is_empty() {
            return Ok(());
        }

        // 3. Entries are queued lowest-height (leaves) first by construction
        // already -- every interior finalizer recursively finalizes its
        // still-InMemory children, appending their entries to the batch,
        // before it appends its own. Sort stably on height as a defensive
        // re-assertion of that ordering rather than relying purely on
        // construction order: a writer reads its children's on-disk ids
        // (`interior_finalizer`'s `expect`), so a parent's entry must never
        // execute before any of its children's.
        batch.sort_by_key(|entry| entry.depth);

        debug!(run_start = run.start.0, count = batch.len(), "flushing eviction batch");

        // 4. Align the run with the sorted entries, invoking each writer.
        let mut bufs: Vec<Buffer> = Vec::with_capacity(batch.len());
        for (i, entry) in batch.into_iter().enumerate() {
            let id = run.start.add(i as u64);
            let mut buf = (entry.writer)(self, id)?;
            write_checksum_trailer(self.checksum.as_ref(), &mut buf);
            bufs.push(buf);
        }

        // 5. One vectored write per contiguous run.
        let refs: Vec<&[u8]> = bufs.iter().map(|b| b.as_slice()).collect();
        if let Err(e) = write_run(self.disk.as_ref(), run.start.0, &refs) {
            warn!(run_start = run.start.0, "vectored commit write failed");
            return Err(e);
        }

        // 6. Return all consumed buffers to the pool.
        self.release_cstructs(bufs);
        Ok(())
    }

    /// Commits every attached dirty sector to disk and empties the buffer
    /// pool.
    ///
    /// Goes through the same depth-ordered commit path as `flush` rather
    /// than discarding pending writes: a rope finalizer always resolves as
    /// `Pending`, never inline, so discarding would leave dirty sectors
    /// `InMemory` with their finalizer already consumed -- neither
    /// committed nor freed, and fatal to any live ancestor that still
    /// references them.
    pub fn clear(&mut self) -> Result<()> {
        self.flush()?;
        self.available.clear();
        Ok(())
    }

    /// Forces a single sector (and, transitively, whatever it finalizes) to
    /// commit immediately, outside of the ordinary eviction path. Used to
    /// persist a still-pinned root explicitly for a superblock commit, since
    /// a detached root is never visited by [`Context::lru_make_room`].
    /// The caller must have already registered a real finalizer on `elt`.
    pub fn force_commit(&mut self, elt: Elt) -> Result<Id> {
        if let Some(id) = self.on_disk_id(elt) {
            return Ok(id);
        }
        self.protect_lru(|ctx| {
            let mut batch = Vec::new();
            ctx.finalize_child(elt, &mut batch)?;
            ctx.commit_batch(batch)
        })?;
        Ok(self.on_disk_id(elt).unwrap_or_else(|| bug!("force_commit did not produce an id")))
    }

    #[cfg(test)]
    pub(crate) fn lru_len(&self) -> usize {
        self.lru.length()
    }

    #[cfg(test)]
    pub(crate) fn pool_len(&self) -> usize {
        self.available.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checksum::Xxh3Checksum;
    use crate::disk::mem::MemDisk;
    use crate::id::Allocator;
    use crate::sector::FinalizeOutcome;

    fn new_ctx(page_size: usize, sectors: u64, cache: CacheConfig) -> Context {
        let disk = MemDisk::new(page_size as u32, sectors);
        Context::new(Box::new(disk), Box::new(Xxh3Checksum), page_size, cache, Allocator::new(sectors))
    }

    /// A finalizer that evicts immediately, without touching the commit
    /// batch -- stands in for a leaf whose write has already gone through.
    fn immediate_finalizer(id: Id) -> Finalizer {
        Box::new(move |_ctx, _batch| Ok(FinalizeOutcome::Evicted(id)))
    }

    #[test]
    fn allocate_load_evicts_when_cache_is_full() {
        // max_lru_size = 2: the third Load allocation must evict the tail
        // before creating room for itself.
        let mut ctx = new_ctx(64, 64, CacheConfig { max_lru_size: 2, min_lru_size: 0 });
        let a = ctx.allocate(AllocFrom::Load).unwrap();
        ctx.set_finalize(a, immediate_finalizer(Id(10)));
        let b = ctx.allocate(AllocFrom::Load).unwrap();
        ctx.set_finalize(b, immediate_finalizer(Id(11)));
        assert_eq!(ctx.lru_len(), 2);

        let c = ctx.allocate(AllocFrom::Load).unwrap();
        ctx.set_finalize(c, immediate_finalizer(Id(12)));
        // `a`, the least-recently-used, was evicted to make room for `c`.
        assert!(ctx.lru_len() <= 2);
        assert!(ctx.on_disk_id(a).is_some());
    }

    #[test]
    fn clear_empties_lru_and_buffer_pool() {
        // Spec §8 invariant 8: after clear(), the LRU and buffer pool are
        // both empty.
        let mut ctx = new_ctx(64, 64, CacheConfig::default());
        for i in 0..5 {
            let elt = ctx.allocate(AllocFrom::Load).unwrap();
            ctx.set_finalize(elt, immediate_finalizer(Id(20 + i)));
        }
        assert_eq!(ctx.lru_len(), 5);
        ctx.clear().unwrap();
        assert_eq!(ctx.lru_len(), 0);
        assert_eq!(ctx.pool_len(), 0);
    }

    #[test]
    fn clear_commits_attached_child_still_referenced_by_a_pinned_parent() {
        // Regression test: a pinned (Root) parent isn't attached to the
        // LRU, so `clear()` never visits it directly, but its child is
        // attached and dirty. `clear()` must still commit that child for
        // real -- not discard its pending write -- so the parent's own
        // commit can find the child's id later instead of hitting a
        // consumed-finalizer sector.
        let mut ctx = new_ctx(64, 64, CacheConfig::default());

        let child = ctx.allocate(AllocFrom::Load).unwrap();
        ctx.set_finalize(
            child,
            Box::new(move |ctx, batch| {
                batch.push(PendingEntry {
                    elt: child,
                    depth: 0,
                    writer: Box::new(move |ctx, id| Ok(ctx.finish_commit(child, id))),
                });
                let _ = ctx;
                Ok(FinalizeOutcome::Pending)
            }),
        );

        let parent = ctx.allocate(AllocFrom::Root).unwrap();

        ctx.clear().unwrap();
        assert!(ctx.on_disk_id(child).is_some(), "clear() must commit the still-referenced child, not drop it");

        ctx.set_finalize(
            parent,
            Box::new(move |ctx, batch| {
                ctx.finalize_child(child, batch)?;
                batch.push(PendingEntry {
                    elt: parent,
                    depth: 1,
                    writer: Box::new(move |ctx, id| {
                        let child_id = ctx.on_disk_id(child).expect("child committed by clear()");
                        let mut buf = ctx.finish_commit(parent, id);
                        buf.extend_from_slice(&child_id.0.to_le_bytes());
                        Ok(buf)
                    }),
                });
                Ok(FinalizeOutcome::Pending)
            }),
        );
        let id = ctx.force_commit(parent).unwrap();
        assert_eq!(ctx.on_disk_id(parent), Some(id));
    }

    #[test]
    fn root_allocation_bypasses_eviction() {
        // A Root allocation is pinned and detached; it never counts toward
        // lru_len and never triggers eviction, even at a full cache.
        let mut ctx = new_ctx(64, 64, CacheConfig { max_lru_size: 1, min_lru_size: 0 });
        let pinned = ctx.allocate(AllocFrom::Root).unwrap();
        assert_eq!(ctx.lru_len(), 0);
        assert!(ctx.is_in_memory(pinned));
    }

    #[test]
    fn depth_ordered_commit_writes_children_before_parents() {
        // A parent's finalizer recursively finalizes a still-InMemory child
        // first, so the child's entry lands in the batch before the
        // parent's; the child's write closure then runs -- and assigns the
        // child its id -- before the parent's does.
        let mut ctx = new_ctx(64, 64, CacheConfig { max_lru_size: 1, min_lru_size: 0 });

        let child = ctx.allocate(AllocFrom::Load).unwrap();
        ctx.set_finalize(
            child,
            Box::new(move |ctx, batch| {
                batch.push(PendingEntry {
                    elt: child,
                    depth: 0,
                    writer: Box::new(move |ctx, id| Ok(ctx.finish_commit(child, id))),
                });
                let _ = ctx;
                Ok(FinalizeOutcome::Pending)
            }),
        );

        let parent = ctx.allocate(AllocFrom::Root).unwrap();
        ctx.set_finalize(
            parent,
            Box::new(move |ctx, batch| {
                ctx.finalize_child(child, batch)?;
                batch.push(PendingEntry {
                    elt: parent,
                    depth: 1,
                    writer: Box::new(move |ctx, id| {
                        assert!(
                            ctx.on_disk_id(child).is_some(),
                            "child must have committed before the parent's writer runs"
                        );
                        Ok(ctx.finish_commit(parent, id))
                    }),
                });
                Ok(FinalizeOutcome::Pending)
            }),
        );

        let id = ctx.force_commit(parent).unwrap();
        assert_eq!(ctx.on_disk_id(parent), Some(id));
        assert!(ctx.on_disk_id(child).is_some());
    }

    #[test]
    fn commit_batch_returns_unconsumed_run_tail_to_discarded_set() {
        // Only one of two queued entries is still InMemory by commit time;
        // the unconsumed half of the allocated run goes to the discarded set
        // rather than leaking.
        let mut ctx = new_ctx(64, 64, CacheConfig { max_lru_size: 1, min_lru_size: 0 });
        let a = ctx.allocate(AllocFrom::Load).unwrap();
        let b = ctx.allocate(AllocFrom::Load).unwrap();
        // `b` is superseded before the batch commits (e.g. overwritten by a
        // fresher allocation elsewhere); only `a` still needs a write.
        ctx.set_id(b, Id(30));

        let batch = vec![PendingEntry {
            elt: a,
            depth: 0,
            writer: Box::new(move |ctx, id| Ok(ctx.finish_commit(a, id))),
        }, PendingEntry {
            elt: b,
            depth: 0,
            writer: Box::new(move |ctx, id| Ok(ctx.finish_commit(b, id))),
        }];
        // `b` was queued as part of the traversal, then resolved out from
        // under the batch (via `set_id` above) before the commit phase runs.
        // `commit_batch` must filter it out itself and return the
        // unconsumed half of the two-id run to the discarded set.
        ctx.commit_batch(batch).unwrap();
        assert!(ctx.on_disk_id(a).is_some());
        assert!(ctx.allocator().discarded().len() > 0);
    }
}
