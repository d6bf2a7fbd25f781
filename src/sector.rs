//! The per-page bookkeeping record and its finalizer protocol.

use crate::context::Context;
use crate::error::Result;
use crate::id::Id;
use crate::lru::Elt;

/// A page-sized buffer drawn from the context's buffer pool.
pub type Buffer = Vec<u8>;

/// The state of a single cached page.
pub enum SectorState {
    /// Dirty, or freshly loaded: occupies one buffer-pool slot.
    InMemory(Buffer),
    /// Contents known only by reference; no buffer held.
    OnDisk(Id),
    /// Logically deleted. Any access is a programmer error.
    Freed,
}

/// What a sector's finalizer accomplished when invoked.
pub enum FinalizeOutcome {
    /// The sector was committed immediately and is now known by this id.
    Evicted(Id),
    /// Commit was deferred: the finalizer pushed its own [`PendingEntry`]
    /// onto the shared batch passed to it.
    Pending,
}

/// Finalizes (and, for interior nodes, patches) a page once an id has been
/// assigned to it during the commit phase of [`lru_make_room`](crate::context::Context::lru_make_room).
pub type Writer = Box<dyn FnOnce(&mut Context, Id) -> Result<Buffer>>;

/// A sector queued for commit: its LRU element, its height in the rope (used
/// to sort deepest-first so children commit before parents), and the writer
/// that finishes the job once an id is assigned.
pub struct PendingEntry {
    pub elt: Elt,
    pub depth: u32,
    pub writer: Writer,
}

/// Commits a sector (possibly recursively finalizing children first via the
/// shared batch) and reports what happened. Taken out of the sector and run
/// at most once per generation.
pub type Finalizer = Box<dyn FnMut(&mut Context, &mut Vec<PendingEntry>) -> Result<FinalizeOutcome>>;

/// The in-memory bookkeeping record for a page.
pub struct Sector {
    pub state: SectorState,
    pub finalizer: Option<Finalizer>,
}

impl Sector {
    pub fn new_in_memory(buf: Buffer) -> Self {
        Self { state: SectorState::InMemory(buf), finalizer: None }
    }

    pub fn is_in_memory(&self) -> bool {
        matches!(self.state, SectorState::InMemory(_))
    }

    pub fn on_disk_id(&self) -> Option<Id> {
        match self.state {
            SectorState::OnDisk(id) => Some(id),
            _ => None,
        }
    }
}
