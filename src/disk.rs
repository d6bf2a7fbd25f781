//! The disk adapter trait: a thin, typed interface over a
//! block device. Everything above this layer works in whole pages; the
//! adapter is the only place that talks about raw sectors.

use crate::error::{Error, Result};

/// Static information about the backing device, fixed for the life of a
/// format.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DiskInfo {
    /// Size of one sector/page in bytes. Becomes the page size for the whole store.
    pub sector_size: u32,
    /// Total number of addressable sectors on the device.
    pub size_sectors: u64,
}

/// A block device that can be read and written in whole sectors.
///
/// Both `read` and `write` operate on a run of *contiguous* sectors starting
/// at `start_sector`; each buffer in the slice corresponds to one sector, in
/// order. This lets the page cache batch depth-ordered commits onto a single
/// vectored write.
pub trait Disk {
    /// Device geometry.
    fn info(&self) -> DiskInfo;

    /// Read `buffers.len()` contiguous sectors starting at `start_sector`
    /// into `buffers`, one sector per buffer.
    fn read(&self, start_sector: u64, buffers: &mut [&mut [u8]]) -> std::result::Result<(), DiskError>;

    /// Write `buffers.len()` contiguous sectors starting at `start_sector`.
    fn write(&self, start_sector: u64, buffers: &[&[u8]]) -> std::result::Result<(), DiskError>;
}

/// Opaque error type surfaced by a [`Disk`] implementation; wrapped into
/// [`Error::Read`]/[`Error::Write`] at the boundary.
#[derive(Debug)]
pub struct DiskError(pub Box<dyn std::error::Error + Send + Sync + 'static>);

impl DiskError {
    pub fn new(e: impl std::error::Error + Send + Sync + 'static) -> Self {
        Self(Box::new(e))
    }
}

impl std::fmt::Display for DiskError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}
impl std::error::Error for DiskError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(self.0.as_ref())
    }
}

pub(crate) fn read_page(disk: &dyn Disk, sector: u64, buf: &mut [u8]) -> Result<()> {
    disk.read(sector, &mut [buf]).map_err(|e| Error::Read(e.0))
}

pub(crate) fn write_page(disk: &dyn Disk, sector: u64, buf: &[u8]) -> Result<()> {
    disk.write(sector, &[buf]).map_err(|e| Error::Write(e.0))
}

pub(crate) fn write_run(disk: &dyn Disk, start_sector: u64, bufs: &[&[u8]]) -> Result<()> {
    disk.write(start_sector, bufs).map_err(|e| Error::Write(e.0))
}

/// In-memory [`Disk`] used by this crate's own test suite.
pub mod mem {
    use super::*;
    use std::cell::RefCell;
    use std::rc::Rc;

    /// A fixed-size block device backed entirely by a `Vec<u8>`.
    ///
    /// Cloning shares the same backing buffer (via `Rc`), so a test can
    /// "restart" a store -- format/write/commit through one handle, drop it,
    /// then `open` through a clone -- without actually touching the
    /// filesystem.
    #[derive(Clone)]
    pub struct MemDisk {
        sector_size: u32,
        data: Rc<RefCell<Vec<u8>>>,
    }

    impl MemDisk {
        pub fn new(sector_size: u32, size_sectors: u64) -> Self {
            let len = sector_size as usize * size_sectors as usize;
            Self {
                sector_size,
                data: Rc::new(RefCell::new(vec![0u8; len])),
            }
        }

        fn size_sectors(&self) -> u64 {
            self.data.borrow().len() as u64 / self.sector_size as u64
        }
    }

    impl Disk for MemDisk {
        fn info(&self) -> DiskInfo {
            DiskInfo {
                sector_size: self.sector_size,
                size_sectors: self.size_sectors(),
            }
        }

        fn read(&self, start_sector: u64, buffers: &mut [&mut [u8]]) -> std::result::Result<(), DiskError> {
            let data = self.data.borrow();
            let mut offset = start_sector as usize * self.sector_size as usize;
            for buf in buffers.iter_mut() {
                let len = buf.len();
                let src = data.get(offset..offset + len).ok_or_else(|| {
                    DiskError::new(std::io::Error::other("read out of range"))
                })?;
                buf.copy_from_slice(src);
                offset += len;
            }
            Ok(())
        }

        fn write(&self, start_sector: u64, buffers: &[&[u8]]) -> std::result::Result<(), DiskError> {
            let mut data = self.data.borrow_mut();
            let mut offset = start_sector as usize * self.sector_size as usize;
            for buf in buffers.iter() {
                let len = buf.len();
                let dst = data.get_mut(offset..offset + len).ok_or_else(|| {
                    DiskError::new(std::io::Error::other("write out of range"))
                })?;
                dst.copy_from_slice(buf);
                offset += len;
            }
            Ok(())
        }
    }
}
