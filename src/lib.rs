//! `crab-rope`: a persistent key-value store's core, living directly on top
//! of a block device.
//!
//! The crate is organized bottom-up, the way the system is actually layered:
//!
//! - [`disk`] / [`checksum`]: the abstract collaborators supplied by an
//!   embedder (a block device, a page digest algorithm).
//! - [`id`]: page identifier arithmetic and the discarded-range free pool.
//! - [`lru`]: the doubly-linked, detachable-element LRU list.
//! - [`sector`] / [`context`]: the page cache and allocator -- a bounded
//!   buffer pool with lazy write-back and depth-ordered, finalizer-driven
//!   eviction.
//! - [`rope`]: the variable-length byte container built out of cached pages.
//! - [`superblock`]: the two reserved generation records that anchor a rope
//!   root across restarts and publish a new generation atomically.
//!
//! [`Store`] wires all of the above into the one type most callers need.

pub mod checksum;
pub mod context;
pub mod disk;
pub mod error;
pub mod id;
pub mod lru;
pub mod rope;
pub mod sector;
pub mod superblock;

use tracing::debug;

use checksum::Checksum;
use context::{CacheConfig, Context};
use disk::Disk;
use error::Result;
use id::{Allocator, DiscardedSet, Id, IdWidth};
use rope::{Rope, RopeLayout};

/// Constructor-time configuration: cache sizing. Page size and checksum
/// algorithm are fixed by the disk and the caller's [`Checksum`] impl
/// respectively, not by this builder -- it only configures what a
/// format/open call can't infer from the backing storage itself.
#[derive(Debug, Clone, Copy)]
pub struct Config {
    cache: CacheConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self { cache: CacheConfig::default() }
    }
}

impl Config {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the page cache's hard ceiling.
    pub fn max_lru_size(&mut self, n: usize) -> &mut Self {
        self.cache.max_lru_size = n;
        self
    }

    /// Set the page cache's soft floor.
    pub fn min_lru_size(&mut self, n: usize) -> &mut Self {
        self.cache.min_lru_size = n;
        self
    }

    /// Formats a fresh store: writes two generation-0 superblocks and an
    /// empty rope.
    pub fn format(&self, disk: Box<dyn Disk>, checksum: Box<dyn Checksum>) -> Result<Store> {
        let info = disk.info();
        let page_size = info.sector_size as usize;
        let nb_sectors = info.size_sectors;
        let id_width = IdWidth::for_nb_sectors(nb_sectors);

        superblock::format_slot(disk.as_ref(), checksum.as_ref(), Id::ROOT_A, page_size, nb_sectors, id_width)?;
        superblock::format_slot(disk.as_ref(), checksum.as_ref(), Id::ROOT_B, page_size, nb_sectors, id_width)?;

        let allocator = Allocator::new(nb_sectors);
        let mut ctx = Context::new(disk, checksum, page_size, self.cache, allocator);
        let layout = RopeLayout::for_context(&ctx, id_width);
        let rope = rope::create(&mut ctx)?;

        debug!(page_size, nb_sectors, "formatted new store");
        Ok(Store {
            ctx,
            layout,
            rope: Some(rope),
            generation: 0,
            active_slot: Id::ROOT_A,
            nb_sectors,
            id_width,
        })
    }

    /// Opens an existing store, adopting the higher-numbered valid
    /// generation.
    pub fn open(&self, disk: Box<dyn Disk>, checksum: Box<dyn Checksum>) -> Result<Store> {
        let info = disk.info();
        let page_size = info.sector_size as usize;
        let nb_sectors = info.size_sectors;

        let opened = superblock::open(disk.as_ref(), checksum.as_ref(), page_size, nb_sectors)?;
        let gen = opened.generation;
        let allocator = Allocator::from_parts(DiscardedSet::from_ranges(gen.discarded.clone()), gen.high_water, nb_sectors);
        let mut ctx = Context::new(disk, checksum, page_size, self.cache, allocator);
        let layout = RopeLayout::for_context(&ctx, gen.id_width);
        let rope = rope::load(&mut ctx, layout, gen.root_id)?;

        debug!(generation = gen.generation, slot = opened.slot.0, "opened existing store");
        Ok(Store {
            ctx,
            layout,
            rope: Some(rope),
            generation: gen.generation,
            active_slot: opened.slot,
            nb_sectors,
            id_width: gen.id_width,
        })
    }
}

/// An opened key-value store core: one page cache/allocator [`Context`] plus
/// the single [`Rope`] it anchors.
///
/// The higher-level key-value directory mapping names to ropes is an
/// external collaborator and isn't implemented here; `Store` anchors exactly
/// one rope, the way a single value would be anchored by that higher layer.
pub struct Store {
    ctx: Context,
    layout: RopeLayout,
    rope: Option<Rope>,
    generation: u64,
    active_slot: Id,
    nb_sectors: u64,
    id_width: IdWidth,
}

impl Store {
    /// Current size, in bytes, of the store's rope.
    pub fn size(&self) -> u64 {
        rope::size(self.rope.as_ref().expect("rope always present between calls"))
    }

    /// Appends `data` to the end of the rope.
    pub fn append(&mut self, data: &[u8]) -> Result<()> {
        let rope = self.rope.take().expect("rope always present between calls");
        self.rope = Some(rope::append(&mut self.ctx, self.layout, rope, data)?);
        Ok(())
    }

    /// Reads up to `dst.len()` bytes starting at `offset`, returning how
    /// many were actually copied.
    pub fn read(&mut self, offset: u64, dst: &mut [u8]) -> Result<usize> {
        let rope = self.rope.as_mut().expect("rope always present between calls");
        rope::blit_to_bytes(&mut self.ctx, self.layout, rope, offset, dst)
    }

    /// Overwrites the rope in place starting at `offset`, appending whatever
    /// part of `src` extends past the current size.
    pub fn write(&mut self, offset: u64, src: &[u8]) -> Result<()> {
        let rope = self.rope.take().expect("rope always present between calls");
        self.rope = Some(rope::blit_from_string(&mut self.ctx, self.layout, rope, offset, src)?);
        Ok(())
    }

    /// Reads the entire rope into a freshly allocated buffer.
    pub fn to_vec(&mut self) -> Result<Vec<u8>> {
        let rope = self.rope.as_mut().expect("rope always present between calls");
        rope::to_string(&mut self.ctx, self.layout, rope)
    }

    /// Recursively verifies the checksum of every committed page in the
    /// store's rope.
    pub fn verify_checksum(&mut self) -> Result<()> {
        let rope = self.rope.as_mut().expect("rope always present between calls");
        rope::verify_checksum(&mut self.ctx, rope)
    }

    /// Flushes every dirty page, then atomically publishes a new generation:
    /// the inactive reserved slot is overwritten with the new generation
    /// record, and only then is it adopted -- a reader
    /// that crashes or reopens mid-commit still sees the prior, fully
    /// consistent generation.
    pub fn commit(&mut self) -> Result<()> {
        self.ctx.flush()?;
        let root_id = {
            let rope = self.rope.as_mut().expect("rope always present between calls");
            rope::commit_root(&mut self.ctx, self.layout, rope)?
        };

        let discarded: Vec<id::IdRange> = self.ctx.allocator().discarded().ranges().collect();
        let high_water = self.ctx.allocator().high_water();
        let next_generation = self.generation + 1;
        let target_slot = if self.active_slot == Id::ROOT_A { Id::ROOT_B } else { Id::ROOT_A };

        let gen = superblock::Generation {
            generation: next_generation,
            root_id: Some(root_id),
            high_water,
            discarded,
            page_size: self.ctx.page_size() as u32,
            nb_sectors: self.nb_sectors,
            id_width: self.id_width,
        };
        superblock::write_slot(self.ctx.disk(), self.ctx.checksum(), target_slot, &gen)?;

        self.generation = next_generation;
        self.active_slot = target_slot;
        debug!(generation = next_generation, slot = target_slot.0, "committed new generation");
        Ok(())
    }

    /// The generation counter of the last-committed (or just-opened)
    /// generation. Not yet incremented by in-memory mutations that haven't
    /// gone through [`Store::commit`].
    pub fn generation(&self) -> u64 {
        self.generation
    }
}
