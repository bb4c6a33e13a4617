// This file is part of xgqd, a host-side service for the XGQ command queue of PCIe FPGA accelerator cards.
//
// Copyright 2025 Canonical Ltd.
//
// SPDX-License-Identifier: GPL-3.0-only
//
// xgqd is free software: you can redistribute it and/or modify it under the terms of the GNU General Public License version 3, as published by the Free Software Foundation.
//
// xgqd is distributed in the hope that it will be useful, but WITHOUT ANY WARRANTY; without even the implied warranties of MERCHANTABILITY, SATISFACTORY QUALITY, or FITNESS FOR A PARTICULAR PURPOSE.  See the GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License along with this program.  If not, see http://www.gnu.org/licenses/.

//! Word-granular access to device memory.
//!
//! The XGQ rings, the shared descriptor and the payload arena all live in memory the card
//! exposes through a PCI BAR. Everything above this module talks to that memory through the
//! [`DeviceMemory`] trait, which only knows 32-bit little-endian loads and stores at byte
//! offsets from the start of a region. Two implementations exist:
//!
//! - [`MappedRegion`]: an `mmap` of a PCI resource file such as
//!   `/sys/bus/pci/devices/0000:c1:00.0/resource2`, accessed with volatile loads and stores.
//! - [`SimulatedMemory`]: a plain block of atomics used by the emulator and the tests.
//!
//! Every access is bounds and alignment checked and reports an [`AccessError`] instead of
//! touching memory outside the region.

use crate::error::{AccessError, XgqdError};
use log::{debug, trace};
use rustix::mm::{MapFlags, ProtFlags, mmap, munmap};
use std::fmt;
use std::fs::OpenOptions;
use std::path::{Path, PathBuf};
use std::ptr;
use std::sync::atomic::{AtomicU32, Ordering};

pub trait DeviceMemory: Send + Sync + fmt::Debug {
    /// Size of the region in bytes.
    fn size(&self) -> u64;

    fn read32(&self, offset: u64) -> Result<u32, AccessError>;

    fn write32(&self, offset: u64, value: u32) -> Result<(), AccessError>;

    /// Copy `buf.len()` bytes starting at `offset` out of the region.
    ///
    /// The copy is done one word at a time. A trailing partial word is read whole and only
    /// the needed bytes are kept.
    fn read_bytes(&self, offset: u64, buf: &mut [u8]) -> Result<(), AccessError> {
        check_access(offset, buf.len() as u64, self.size())?;
        for (i, chunk) in buf.chunks_mut(4).enumerate() {
            let word = self.read32(offset + 4 * i as u64)?.to_le_bytes();
            chunk.copy_from_slice(&word[..chunk.len()]);
        }
        Ok(())
    }

    /// Copy `data` into the region starting at `offset`.
    ///
    /// A trailing partial word is merged with the bytes already in memory.
    fn write_bytes(&self, offset: u64, data: &[u8]) -> Result<(), AccessError> {
        check_access(offset, data.len() as u64, self.size())?;
        for (i, chunk) in data.chunks(4).enumerate() {
            let at = offset + 4 * i as u64;
            let word = if chunk.len() == 4 {
                [chunk[0], chunk[1], chunk[2], chunk[3]]
            } else {
                let mut word = self.read32(at)?.to_le_bytes();
                word[..chunk.len()].copy_from_slice(chunk);
                word
            };
            self.write32(at, u32::from_le_bytes(word))?;
        }
        Ok(())
    }
}

/// Check that `len` bytes at `offset` are word aligned at the start and fit in `size`.
///
/// The end of the access is rounded up to a whole word since every access is done in words.
pub(crate) fn check_access(offset: u64, len: u64, size: u64) -> Result<(), AccessError> {
    if offset % 4 != 0 {
        return Err(AccessError::Unaligned { offset });
    }
    let end = offset
        .checked_add(len.div_ceil(4) * 4)
        .ok_or(AccessError::OutOfBounds { offset, len, size })?;
    if end > size {
        return Err(AccessError::OutOfBounds { offset, len, size });
    }
    Ok(())
}

/// A PCI BAR mapped into the daemon's address space.
pub struct MappedRegion {
    path: PathBuf,
    base: *mut u8,
    len: usize,
}

// SAFETY: the mapping is owned by this value for its whole life and every access goes through
// volatile 32-bit loads and stores, which the device serialises.
unsafe impl Send for MappedRegion {}
unsafe impl Sync for MappedRegion {}

impl MappedRegion {
    /// Map the whole of a PCI resource file read/write and shared.
    ///
    /// # Arguments
    ///
    /// * `path` - Path of the resource file, e.g. `/sys/bus/pci/devices/<bdf>/resource2`
    ///
    /// # Returns: `Result<MappedRegion, XgqdError>`
    /// * `Ok(MappedRegion)` - The mapped region
    /// * `Err(XgqdError::IORead)` - The file could not be opened or its size read
    /// * `Err(XgqdError::IOMap)` - The `mmap` call failed
    pub fn open(path: &Path) -> Result<Self, XgqdError> {
        trace!("Attempting to map {path:?}");
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(path)
            .map_err(|e| XgqdError::IORead {
                file: path.into(),
                e,
            })?;
        let len = file
            .metadata()
            .map_err(|e| XgqdError::IORead {
                file: path.into(),
                e,
            })?
            .len() as usize;
        if len == 0 || len % 4 != 0 {
            return Err(XgqdError::Argument(format!(
                "Resource {path:?} has unusable size {len}"
            )));
        }
        // SAFETY: a fresh shared mapping of a file we hold open, no existing memory is replaced.
        let base = unsafe {
            mmap(
                ptr::null_mut(),
                len,
                ProtFlags::READ | ProtFlags::WRITE,
                MapFlags::SHARED,
                &file,
                0,
            )
        }
        .map_err(|e| XgqdError::IOMap {
            file: path.into(),
            e: e.into(),
        })?;
        debug!("Mapped {len:#x} bytes of {path:?}");
        Ok(MappedRegion {
            path: path.into(),
            base: base.cast(),
            len,
        })
    }
}

impl fmt::Debug for MappedRegion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MappedRegion")
            .field("path", &self.path)
            .field("len", &self.len)
            .finish()
    }
}

impl DeviceMemory for MappedRegion {
    fn size(&self) -> u64 {
        self.len as u64
    }

    fn read32(&self, offset: u64) -> Result<u32, AccessError> {
        check_access(offset, 4, self.size())?;
        // SAFETY: bounds and alignment checked above.
        let value = unsafe { ptr::read_volatile(self.base.add(offset as usize).cast::<u32>()) };
        Ok(u32::from_le(value))
    }

    fn write32(&self, offset: u64, value: u32) -> Result<(), AccessError> {
        check_access(offset, 4, self.size())?;
        // SAFETY: bounds and alignment checked above.
        unsafe { ptr::write_volatile(self.base.add(offset as usize).cast::<u32>(), value.to_le()) };
        Ok(())
    }
}

impl Drop for MappedRegion {
    fn drop(&mut self) {
        // SAFETY: base and len are exactly what mmap returned and nothing else unmaps them.
        if let Err(e) = unsafe { munmap(self.base.cast(), self.len) } {
            log::error!("Failed to unmap {:?}: {e}", self.path);
        }
    }
}

/// Device memory backed by host RAM.
#[derive(Debug)]
pub struct SimulatedMemory {
    words: Vec<AtomicU32>,
}

impl SimulatedMemory {
    /// Create a zeroed region of `size` bytes, rounded up to a whole word.
    pub fn new(size: u64) -> Self {
        let words = (0..size.div_ceil(4)).map(|_| AtomicU32::new(0)).collect();
        SimulatedMemory { words }
    }
}

impl DeviceMemory for SimulatedMemory {
    fn size(&self) -> u64 {
        self.words.len() as u64 * 4
    }

    fn read32(&self, offset: u64) -> Result<u32, AccessError> {
        check_access(offset, 4, self.size())?;
        Ok(self.words[(offset / 4) as usize].load(Ordering::SeqCst))
    }

    fn write32(&self, offset: u64, value: u32) -> Result<(), AccessError> {
        check_access(offset, 4, self.size())?;
        self.words[(offset / 4) as usize].store(value, Ordering::SeqCst);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unaligned_and_out_of_bounds_are_rejected() {
        let mem = SimulatedMemory::new(16);
        assert_eq!(
            mem.read32(2),
            Err(AccessError::Unaligned { offset: 2 }),
            "Unaligned read should be refused"
        );
        assert!(
            matches!(mem.write32(16, 1), Err(AccessError::OutOfBounds { .. })),
            "Write past the end should be refused"
        );
        assert!(
            matches!(
                mem.write_bytes(12, &[1, 2, 3, 4, 5]),
                Err(AccessError::OutOfBounds { .. })
            ),
            "A copy that spills over the end should be refused before anything is written"
        );
        assert_eq!(mem.read32(12), Ok(0));
    }

    #[test]
    fn test_partial_word_copy_keeps_neighbouring_bytes() {
        let mem = SimulatedMemory::new(16);
        mem.write32(4, 0xAABB_CCDD).unwrap();
        mem.write_bytes(4, &[0x11, 0x22]).unwrap();
        assert_eq!(mem.read32(4).unwrap(), 0xAABB_2211);

        let mut buf = [0u8; 3];
        mem.read_bytes(4, &mut buf).unwrap();
        assert_eq!(buf, [0x11, 0x22, 0xBB]);
    }
}
