//! Generation records and the superblock.
//!
//! Ids 0 and 1 are reserved for exactly this: two generation records that
//! `open()` chooses between by counter, and that `commit` swaps between to
//! publish a new generation atomically. Each record is a single page, laid
//! out as a fixed [`RawHeader`] (read directly with `bytemuck`), followed by
//! a packed list of discarded-range pairs, followed by the ordinary page
//! checksum trailer.

use bytemuck::{Pod, Zeroable};

use crate::checksum::Checksum;
use crate::context::{checksum_data_end, verify_checksum_trailer, write_checksum_trailer};
use crate::disk::{read_page, write_page, Disk};
use crate::error::{Error, Result};
use crate::id::{Id, IdRange, IdWidth};

const MAGIC: u64 = 0x6372_6162_726f_7065; // b"crabrope"[..8] as little-endian u64
const NULL_ROOT: u64 = u64::MAX;
const NAME_LEN: usize = 16;
const RANGE_ENTRY_LEN: usize = 16; // start: u64, len: u64

#[repr(C)]
#[derive(Clone, Copy, Pod, Zeroable)]
struct RawHeader {
    magic: u64,
    generation: u64,
    nb_sectors: u64,
    root_id: u64,
    high_water: u64,
    page_size: u32,
    checksum_digest_size: u32,
    discarded_len: u32,
    id_width: u8,
    _pad: [u8; 3],
    checksum_name: [u8; NAME_LEN],
}

const HEADER_LEN: usize = std::mem::size_of::<RawHeader>();

/// The smallest page size that can hold the fixed header plus a checksum
/// trailer. `write_slot`/`read_slot_outcome` both index `buf[..HEADER_LEN]`
/// unconditionally, so this must be checked *before* either ever allocates
/// or slices a page-sized buffer, not asserted after the fact.
fn ensure_page_size_fits_header(page_size: usize, digest_size: usize) -> Result<()> {
    if page_size < HEADER_LEN + digest_size {
        return Err(Error::WrongPageSize { got: page_size as u32 });
    }
    Ok(())
}

/// A fully decoded, not-yet-adopted generation record.
#[derive(Debug, Clone)]
pub struct Generation {
    pub generation: u64,
    pub root_id: Option<Id>,
    pub high_water: u64,
    pub discarded: Vec<IdRange>,
    pub page_size: u32,
    pub nb_sectors: u64,
    pub id_width: IdWidth,
}

fn id_width_tag(w: IdWidth) -> u8 {
    match w {
        IdWidth::U16 => 0,
        IdWidth::U32 => 1,
        IdWidth::U64 => 2,
    }
}

fn id_width_from_tag(tag: u8) -> IdWidth {
    match tag {
        0 => IdWidth::U16,
        1 => IdWidth::U32,
        _ => IdWidth::U64,
    }
}

fn encode_name(name: &str) -> [u8; NAME_LEN] {
    let mut out = [0u8; NAME_LEN];
    let bytes = name.as_bytes();
    let n = bytes.len().min(NAME_LEN);
    out[..n].copy_from_slice(&bytes[..n]);
    out
}

fn decode_name(raw: &[u8; NAME_LEN]) -> String {
    let end = raw.iter().position(|&b| b == 0).unwrap_or(NAME_LEN);
    String::from_utf8_lossy(&raw[..end]).into_owned()
}

/// Outcome of reading one of the two reserved superblock slots.
enum SlotOutcome {
    /// No magic present: the disk has never been formatted.
    Unformatted,
    /// A generation was recorded, but the checksum digest over it doesn't
    /// match -- the record is torn or the sector is bad. A slot in this
    /// state never aborts `open`; it's simply not a candidate, so the other
    /// slot (if valid) wins.
    Corrupt,
    /// The checksum trailer *did* verify -- this is a real, intact record,
    /// not a torn write -- but it was written with a different checksum
    /// algorithm or page size than what's being used to open it now. Kept
    /// distinct from `Corrupt` so it can still be reported precisely if the
    /// other slot turns out unusable too, instead of being swallowed as
    /// `AllGenerationsCorrupted`.
    Mismatch(Error),
    Valid(Generation),
}

/// Writes a fresh, empty generation (the one `format` produces) to `id`.
pub fn format_slot(
    disk: &dyn Disk,
    checksum: &dyn Checksum,
    id: Id,
    page_size: usize,
    nb_sectors: u64,
    id_width: IdWidth,
) -> Result<()> {
    let gen = Generation {
        generation: 0,
        root_id: None,
        high_water: 2,
        discarded: Vec::new(),
        page_size: page_size as u32,
        nb_sectors,
        id_width,
    };
    write_slot(disk, checksum, id, &gen)
}

/// Encodes and writes `gen` to reserved page `id`, truncating the discarded
/// list to whatever fits in the page if it's too long to represent (see
/// DESIGN.md: freed ids beyond that point are simply not carried into this
/// generation, a deliberate scope limitation rather than a bug).
pub fn write_slot(disk: &dyn Disk, checksum: &dyn Checksum, id: Id, gen: &Generation) -> Result<()> {
    let page_size = gen.page_size as usize;
    ensure_page_size_fits_header(page_size, checksum.digest_size())?;
    let mut buf = vec![0u8; page_size];
    let trailer_start = checksum_data_end(page_size, checksum.digest_size());
    let room = trailer_start.saturating_sub(HEADER_LEN);
    let max_entries = room / RANGE_ENTRY_LEN;
    let kept = gen.discarded.len().min(max_entries);
    if kept < gen.discarded.len() {
        tracing::warn!(
            dropped = gen.discarded.len() - kept,
            "generation record has no room for all discarded ranges; dropping the tail"
        );
    }

    let header = RawHeader {
        magic: MAGIC,
        generation: gen.generation,
        nb_sectors: gen.nb_sectors,
        root_id: gen.root_id.map(|i| i.0).unwrap_or(NULL_ROOT),
        high_water: gen.high_water,
        page_size: gen.page_size,
        checksum_digest_size: checksum.digest_size() as u32,
        discarded_len: kept as u32,
        id_width: id_width_tag(gen.id_width),
        _pad: [0; 3],
        checksum_name: encode_name(checksum.name()),
    };
    buf[..HEADER_LEN].copy_from_slice(bytemuck::bytes_of(&header));

    let mut off = HEADER_LEN;
    for r in &gen.discarded[..kept] {
        buf[off..off + 8].copy_from_slice(&r.start.0.to_le_bytes());
        buf[off + 8..off + 16].copy_from_slice(&r.len.to_le_bytes());
        off += RANGE_ENTRY_LEN;
    }

    write_checksum_trailer(checksum, &mut buf);
    write_page(disk, id.0, &buf)
}

fn decode_ranges(buf: &[u8], count: usize) -> Vec<IdRange> {
    let mut out = Vec::with_capacity(count);
    let mut off = HEADER_LEN;
    for _ in 0..count {
        let start = u64::from_le_bytes(buf[off..off + 8].try_into().unwrap());
        let len = u64::from_le_bytes(buf[off + 8..off + 16].try_into().unwrap());
        out.push(IdRange { start: Id(start), len });
        off += RANGE_ENTRY_LEN;
    }
    out
}

fn read_slot_outcome(
    disk: &dyn Disk,
    checksum: &dyn Checksum,
    id: Id,
    page_size: usize,
) -> Result<SlotOutcome> {
    // This is about *our own* page layout (header + this checksum's
    // trailer) not fitting in a sector at all -- identical for every slot on
    // this disk, not a per-slot corruption/mismatch, so it's a hard error
    // rather than something to fall back past.
    ensure_page_size_fits_header(page_size, checksum.digest_size())?;

    let mut buf = vec![0u8; page_size];
    read_page(disk, id.0, &mut buf)?;
    let header: RawHeader = *bytemuck::from_bytes(&buf[..HEADER_LEN]);
    if header.magic != MAGIC {
        return Ok(SlotOutcome::Unformatted);
    }

    // A name/page-size mismatch no longer aborts `open` outright -- it's
    // reported as `Mismatch` rather than `Err` so the caller can still fall
    // back to the other slot if it holds a valid, higher-generation record;
    // see `open`'s `mismatch` fallback below. It's checked ahead of the
    // checksum trailer deliberately: verifying a record with a checksum
    // algorithm other than the one it was written with will essentially
    // always fail the trailer comparison too, and `WrongChecksumAlgorithm`
    // is the more informative of the two outcomes when this slot is the one
    // the caller ultimately has to fall back on.
    let on_disk_name = decode_name(&header.checksum_name);
    if on_disk_name != checksum.name() || header.checksum_digest_size as usize != checksum.digest_size() {
        return Ok(SlotOutcome::Mismatch(Error::WrongChecksumAlgorithm {
            name: on_disk_name,
            size: header.checksum_digest_size as usize,
        }));
    }
    if header.page_size as usize != page_size {
        return Ok(SlotOutcome::Mismatch(Error::WrongPageSize { got: header.page_size }));
    }
    if !verify_checksum_trailer(checksum, &buf) {
        return Ok(SlotOutcome::Corrupt);
    }

    let discarded = decode_ranges(&buf, header.discarded_len as usize);
    let root_id = if header.root_id == NULL_ROOT { None } else { Some(Id(header.root_id)) };
    Ok(SlotOutcome::Valid(Generation {
        generation: header.generation,
        root_id,
        high_water: header.high_water,
        discarded,
        page_size: header.page_size,
        nb_sectors: header.nb_sectors,
        id_width: id_width_from_tag(header.id_width),
    }))
}

/// The result of opening an existing store: the winning generation, and
/// which reserved slot it came from (the other slot is what `commit` writes
/// the next generation to).
pub struct Opened {
    pub generation: Generation,
    pub slot: Id,
}

/// Reads both reserved superblock slots and adopts the higher-numbered valid
/// generation. `expected_nb_sectors` comes from the disk's own geometry, not
/// the recorded one, so a resized device is caught here rather than silently
/// trusting stale metadata.
pub fn open(
    disk: &dyn Disk,
    checksum: &dyn Checksum,
    page_size: usize,
    expected_nb_sectors: u64,
) -> Result<Opened> {
    let a = read_slot_outcome(disk, checksum, Id::ROOT_A, page_size)?;
    let b = read_slot_outcome(disk, checksum, Id::ROOT_B, page_size)?;

    let a_unformatted = matches!(&a, SlotOutcome::Unformatted);
    let b_unformatted = matches!(&b, SlotOutcome::Unformatted);
    if a_unformatted && b_unformatted {
        return Err(Error::DiskNotFormatted);
    }

    // A slot that verified but doesn't match this checksum/page size isn't a
    // candidate generation, but it's a more informative failure than
    // "both generations corrupted" if the other slot doesn't pan out either
    // -- remember the first one seen as a fallback rather than surfacing it
    // immediately and abandoning a perfectly good other slot.
    let mut mismatch: Option<Error> = None;
    let mut pick = |outcome: SlotOutcome, slot: Id| -> Result<Option<(Generation, Id)>> {
        match outcome {
            SlotOutcome::Unformatted | SlotOutcome::Corrupt => Ok(None),
            SlotOutcome::Mismatch(e) => {
                mismatch.get_or_insert(e);
                Ok(None)
            }
            SlotOutcome::Valid(gen) => {
                if gen.nb_sectors != expected_nb_sectors {
                    return Err(Error::WrongDiskSize { got: gen.nb_sectors });
                }
                Ok(Some((gen, slot)))
            }
        }
    };
    let a_res = pick(a, Id::ROOT_A)?;
    let b_res = pick(b, Id::ROOT_B)?;

    match (a_res, b_res) {
        (None, None) => Err(mismatch.unwrap_or(Error::AllGenerationsCorrupted)),
        (Some((gen, slot)), None) => Ok(Opened { generation: gen, slot }),
        (None, Some((gen, slot))) => Ok(Opened { generation: gen, slot }),
        (Some((ga, sa)), Some((gb, sb))) => {
            if ga.generation >= gb.generation {
                Ok(Opened { generation: ga, slot: sa })
            } else {
                Ok(Opened { generation: gb, slot: sb })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checksum::Xxh3Checksum;
    use crate::disk::mem::MemDisk;

    #[test]
    fn format_then_open_round_trips() {
        let disk = MemDisk::new(256, 4096);
        let checksum = Xxh3Checksum;
        format_slot(&disk, &checksum, Id::ROOT_A, 256, 4096, IdWidth::U32).unwrap();
        format_slot(&disk, &checksum, Id::ROOT_B, 256, 4096, IdWidth::U32).unwrap();
        let opened = open(&disk, &checksum, 256, 4096).unwrap();
        assert_eq!(opened.generation.generation, 0);
        assert_eq!(opened.generation.root_id, None);
        assert_eq!(opened.generation.high_water, 2);
    }

    #[test]
    fn open_without_format_is_not_formatted() {
        let disk = MemDisk::new(256, 4096);
        let checksum = Xxh3Checksum;
        let err = open(&disk, &checksum, 256, 4096).unwrap_err();
        assert!(matches!(err, Error::DiskNotFormatted));
    }

    #[test]
    fn higher_generation_wins() {
        let disk = MemDisk::new(256, 4096);
        let checksum = Xxh3Checksum;
        format_slot(&disk, &checksum, Id::ROOT_A, 256, 4096, IdWidth::U32).unwrap();
        let mut gen1 = Generation {
            generation: 1,
            root_id: Some(Id(5)),
            high_water: 10,
            discarded: vec![IdRange { start: Id(2), len: 3 }],
            page_size: 256,
            nb_sectors: 4096,
            id_width: IdWidth::U32,
        };
        write_slot(&disk, &checksum, Id::ROOT_B, &gen1).unwrap();
        let opened = open(&disk, &checksum, 256, 4096).unwrap();
        assert_eq!(opened.slot, Id::ROOT_B);
        assert_eq!(opened.generation.root_id, Some(Id(5)));
        assert_eq!(opened.generation.discarded, gen1.discarded);

        gen1.generation = 2;
        gen1.root_id = Some(Id(9));
        write_slot(&disk, &checksum, Id::ROOT_A, &gen1).unwrap();
        let opened = open(&disk, &checksum, 256, 4096).unwrap();
        assert_eq!(opened.slot, Id::ROOT_A);
        assert_eq!(opened.generation.root_id, Some(Id(9)));
    }

    #[test]
    fn wrong_checksum_algorithm_is_reported() {
        struct OtherChecksum;
        impl Checksum for OtherChecksum {
            fn name(&self) -> &str {
                "other"
            }
            fn digest_size(&self) -> usize {
                8
            }
            fn compute(&self, bytes: &[u8]) -> Vec<u8> {
                xxhash_rust::xxh3::xxh3_64(bytes).to_be_bytes().to_vec()
            }
        }
        let disk = MemDisk::new(256, 4096);
        format_slot(&disk, &Xxh3Checksum, Id::ROOT_A, 256, 4096, IdWidth::U32).unwrap();
        format_slot(&disk, &Xxh3Checksum, Id::ROOT_B, 256, 4096, IdWidth::U32).unwrap();
        let err = open(&disk, &OtherChecksum, 256, 4096).unwrap_err();
        assert!(matches!(err, Error::WrongChecksumAlgorithm { .. }));
    }

    #[test]
    fn page_size_too_small_for_header_is_rejected_not_panicking() {
        // 64 bytes can't hold the 72-byte fixed header plus an 8-byte xxh3
        // trailer; this must return WrongPageSize, not panic on a slice
        // index out of range.
        let disk = MemDisk::new(64, 4096);
        let checksum = Xxh3Checksum;
        let err = format_slot(&disk, &checksum, Id::ROOT_A, 64, 4096, IdWidth::U32).unwrap_err();
        assert!(matches!(err, Error::WrongPageSize { got: 64 }));
        let err = open(&disk, &checksum, 64, 4096).unwrap_err();
        assert!(matches!(err, Error::WrongPageSize { got: 64 }));
    }

    #[test]
    fn mismatched_slot_falls_back_to_the_other_valid_slot() {
        // Slot A was written under a different checksum algorithm (as if
        // the device had been reformatted with a different one and only
        // one slot rewritten so far); slot B holds a real, valid
        // generation. `open` must still succeed from B rather than
        // aborting the moment it sees A's mismatch.
        struct OtherChecksum;
        impl Checksum for OtherChecksum {
            fn name(&self) -> &str {
                "other"
            }
            fn digest_size(&self) -> usize {
                8
            }
            fn compute(&self, bytes: &[u8]) -> Vec<u8> {
                xxhash_rust::xxh3::xxh3_64(bytes).to_be_bytes().to_vec()
            }
        }
        let disk = MemDisk::new(256, 4096);
        format_slot(&disk, &OtherChecksum, Id::ROOT_A, 256, 4096, IdWidth::U32).unwrap();
        format_slot(&disk, &Xxh3Checksum, Id::ROOT_B, 256, 4096, IdWidth::U32).unwrap();
        let opened = open(&disk, &Xxh3Checksum, 256, 4096).unwrap();
        assert_eq!(opened.slot, Id::ROOT_B);
    }
}
