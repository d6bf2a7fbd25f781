//! Page identifier arithmetic and the discarded-range set.

use std::collections::BTreeMap;

/// A page identifier: an integer in `[0, nb_sectors)`. Ids 0 and 1 are
/// reserved for the superblock and are never handed out by the allocator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Id(pub u64);

impl Id {
    pub const ROOT_A: Id = Id(0);
    pub const ROOT_B: Id = Id(1);
    pub const FIRST_FREE: Id = Id(2);

    /// `add(id, k)`: the id `k` pages after this one.
    pub fn add(self, k: u64) -> Id {
        Id(self.0 + k)
    }

    pub fn is_reserved(self) -> bool {
        self.0 < 2
    }
}

impl std::fmt::Display for Id {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// The narrowest integer width that can address every page in a volume of
/// `nb_sectors` pages. Rope node pointer fields use this to
/// compress on small volumes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdWidth {
    U16,
    U32,
    U64,
}

impl IdWidth {
    pub fn for_nb_sectors(nb_sectors: u64) -> IdWidth {
        if nb_sectors <= u16::MAX as u64 + 1 {
            IdWidth::U16
        } else if nb_sectors <= u32::MAX as u64 + 1 {
            IdWidth::U32
        } else {
            IdWidth::U64
        }
    }

    pub fn byte_len(self) -> usize {
        match self {
            IdWidth::U16 => 2,
            IdWidth::U32 => 4,
            IdWidth::U64 => 8,
        }
    }

    /// Read an [`Id`] at `offset` in `buf`, sized per this width.
    pub fn read(self, buf: &[u8], offset: usize) -> Id {
        use byteorder::{ByteOrder, LittleEndian};
        match self {
            IdWidth::U16 => Id(LittleEndian::read_u16(&buf[offset..offset + 2]) as u64),
            IdWidth::U32 => Id(LittleEndian::read_u32(&buf[offset..offset + 4]) as u64),
            IdWidth::U64 => Id(LittleEndian::read_u64(&buf[offset..offset + 8])),
        }
    }

    /// Write `id` at `offset` in `buf`, sized per this width. Panics (a
    /// format-time bug, not a runtime error) if `id` doesn't fit.
    pub fn write(self, buf: &mut [u8], offset: usize, id: Id) {
        use byteorder::{ByteOrder, LittleEndian};
        match self {
            IdWidth::U16 => {
                let v = u16::try_from(id.0).expect("id too large for configured IdWidth::U16");
                LittleEndian::write_u16(&mut buf[offset..offset + 2], v);
            }
            IdWidth::U32 => {
                let v = u32::try_from(id.0).expect("id too large for configured IdWidth::U32");
                LittleEndian::write_u32(&mut buf[offset..offset + 4], v);
            }
            IdWidth::U64 => LittleEndian::write_u64(&mut buf[offset..offset + 8], id.0),
        }
    }
}

/// A maximal contiguous range of ids awaiting return to the allocator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IdRange {
    pub start: Id,
    pub len: u64,
}

impl IdRange {
    fn end(&self) -> u64 {
        self.start.0 + self.len
    }
}

/// The discarded set: ids awaiting return to the free pool,
/// stored as a set of maximal contiguous ranges with automatic coalescing.
///
/// Backed by a `BTreeMap` keyed on range start, which gives O(log n)
/// neighbor lookups for the merge-on-insert that keeps ranges maximal.
#[derive(Debug, Default)]
pub struct DiscardedSet {
    ranges: BTreeMap<u64, u64>,
}

impl DiscardedSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuilds a set from previously-serialized ranges, as read at open time.
    pub fn from_ranges(ranges: impl IntoIterator<Item = IdRange>) -> Self {
        let mut set = Self::new();
        for r in ranges {
            set.add_range(r.start, r.len);
        }
        set
    }

    pub fn is_empty(&self) -> bool {
        self.ranges.is_empty()
    }

    /// Add a single id to the set.
    pub fn add(&mut self, id: Id) {
        self.add_range(id, 1);
    }

    /// Add a range of `len` ids starting at `start`, coalescing with
    /// adjacent ranges already present.
    pub fn add_range(&mut self, start: Id, len: u64) {
        if len == 0 {
            return;
        }
        let mut new_start = start.0;
        let mut new_end = start.0 + len;

        // Merge with a predecessor range that touches or overlaps us.
        if let Some((&p_start, &p_len)) = self.ranges.range(..=new_start).next_back() {
            let p_end = p_start + p_len;
            if p_end >= new_start {
                new_start = new_start.min(p_start);
                new_end = new_end.max(p_end);
                self.ranges.remove(&p_start);
            }
        }

        // Merge with any successor ranges touched by the (possibly grown) range.
        let touched: Vec<u64> = self
            .ranges
            .range(new_start..=new_end)
            .map(|(&s, _)| s)
            .collect();
        for s in touched {
            let l = self.ranges.remove(&s).unwrap();
            new_end = new_end.max(s + l);
        }

        self.ranges.insert(new_start, new_end - new_start);
    }

    /// Return and empty the set, as maximal ranges sorted by start.
    pub fn drain_as_ranges(&mut self) -> Vec<IdRange> {
        std::mem::take(&mut self.ranges)
            .into_iter()
            .map(|(start, len)| IdRange { start: Id(start), len })
            .collect()
    }

    /// Non-destructive view of the current ranges, sorted by start. Used to
    /// serialize the allocator's free pool into a generation record without
    /// handing the ranges away (see [`crate::superblock`]).
    pub fn ranges(&self) -> impl Iterator<Item = IdRange> + '_ {
        self.ranges.iter().map(|(&start, &len)| IdRange { start: Id(start), len })
    }

    /// Total number of ids currently held in the set.
    pub fn len(&self) -> u64 {
        self.ranges.values().sum()
    }

    pub fn contains(&self, id: Id) -> bool {
        self.ranges
            .range(..=id.0)
            .next_back()
            .map(|(&s, &l)| id.0 < s + l)
            .unwrap_or(false)
    }
}

/// Hands out contiguous runs of ids from the discarded set, falling back to
/// a monotonic high-water mark. Never returns the reserved ids 0/1.
#[derive(Debug)]
pub struct Allocator {
    discarded: DiscardedSet,
    /// One past the highest id ever handed out or reserved.
    high_water: u64,
    nb_sectors: u64,
}

impl Allocator {
    pub fn new(nb_sectors: u64) -> Self {
        Self {
            discarded: DiscardedSet::new(),
            high_water: 2,
            nb_sectors,
        }
    }

    pub fn from_parts(discarded: DiscardedSet, high_water: u64, nb_sectors: u64) -> Self {
        Self { discarded, high_water: high_water.max(2), nb_sectors }
    }

    pub fn discarded_mut(&mut self) -> &mut DiscardedSet {
        &mut self.discarded
    }

    pub fn discarded(&self) -> &DiscardedSet {
        &self.discarded
    }

    pub fn high_water(&self) -> u64 {
        self.high_water
    }

    /// Request `n` contiguous fresh ids. Prefers a run already present in
    /// the discarded set (best-fit by smallest sufficient range) before
    /// extending the high-water mark. Returns `None` if the disk is full.
    pub fn alloc_run(&mut self, n: u64) -> Option<IdRange> {
        if n == 0 {
            return Some(IdRange { start: Id(self.high_water), len: 0 });
        }

        let ranges = self.discarded.drain_as_ranges();
        let mut best: Option<IdRange> = None;
        let mut rest = Vec::with_capacity(ranges.len());
        for r in ranges {
            if r.len >= n && best.map(|b: IdRange| r.len < b.len).unwrap_or(true) {
                if let Some(prev) = best.replace(r) {
                    rest.push(prev);
                }
            } else {
                rest.push(r);
            }
        }
        for r in rest {
            self.discarded.add_range(r.start, r.len);
        }

        if let Some(found) = best {
            let alloc = IdRange { start: found.start, len: n };
            let remainder_start = found.start.0 + n;
            let remainder_len = found.len - n;
            if remainder_len > 0 {
                self.discarded.add_range(Id(remainder_start), remainder_len);
            }
            return Some(alloc);
        }

        if self.high_water + n > self.nb_sectors {
            return None;
        }
        let start = Id(self.high_water);
        self.high_water += n;
        Some(IdRange { start, len: n })
    }
}
