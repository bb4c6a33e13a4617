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

//! The shared data arena.
//!
//! Bulk data moves between host and firmware through a window of payload memory described by
//! the shared descriptor. The first [`LOG_PAGE_SIZE`] bytes of the window hold log pages and
//! sensor reports; the rest holds images being downloaded or flashed. Each region is guarded
//! by a single permit so at most one operation is filling or reading it at a time, while the
//! two regions are independent of each other.
//!
//! A caller takes a permit, copies its data in (or out) through the [`ArenaPermit`], submits a
//! command naming [`ArenaPermit::address`], and keeps the permit until the command has
//! finished. Dropping the permit releases the region on every exit path.

use crate::device_memory::DeviceMemory;
use crate::error::{ArenaError, AttachError};
use crate::xgq::descriptor::SharedDescriptor;
use log::{trace, warn};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::time::timeout;

pub const LOG_PAGE_SIZE: u64 = 1024 * 1024;
pub const LOG_PAGE_NUM: u64 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegionKind {
    LogPage,
    Data,
}

impl fmt::Display for RegionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RegionKind::LogPage => f.write_str("log page"),
            RegionKind::Data => f.write_str("data"),
        }
    }
}

#[derive(Debug)]
struct Region {
    kind: RegionKind,
    offset: u64,
    len: u64,
    permits: Arc<Semaphore>,
}

#[derive(Debug)]
pub struct SharedArena {
    mem: Arc<dyn DeviceMemory>,
    log_page: Region,
    data: Region,
    wait: Duration,
}

impl SharedArena {
    /// Carve the arena out of the window the descriptor names.
    ///
    /// # Arguments
    ///
    /// * `mem` - Payload memory
    /// * `descriptor` - A ready descriptor
    /// * `wait` - How long [`acquire`](SharedArena::acquire) waits for a busy region
    /// * `permits` - Holders each region admits at once
    ///
    /// # Returns: `Result<SharedArena, AttachError>`
    /// * `Ok(SharedArena)` - The arena
    /// * `Err(AttachError::BadGeometry)` - The window is too small, does not fit in memory,
    ///   or no permits were asked for
    pub fn from_descriptor(
        mem: Arc<dyn DeviceMemory>,
        descriptor: &SharedDescriptor,
        wait: Duration,
        permits: usize,
    ) -> Result<Self, AttachError> {
        if permits == 0 {
            return Err(AttachError::BadGeometry(
                "arena regions need at least one permit".to_string(),
            ));
        }
        let start = u64::from(descriptor.data_start);
        let end = u64::from(descriptor.data_end);
        let log_len = LOG_PAGE_SIZE * LOG_PAGE_NUM;
        if end < start || end - start + 1 <= log_len {
            return Err(AttachError::BadGeometry(format!(
                "data window {start:#x}..={end:#x} leaves no room after the log page"
            )));
        }
        if end >= mem.size() || start % 4 != 0 {
            return Err(AttachError::BadGeometry(format!(
                "data window {start:#x}..={end:#x} does not fit payload memory of {:#x} bytes",
                mem.size()
            )));
        }
        let data_len = end - start + 1 - log_len;
        Ok(SharedArena {
            mem,
            log_page: Region {
                kind: RegionKind::LogPage,
                offset: start,
                len: log_len,
                permits: Arc::new(Semaphore::new(permits)),
            },
            data: Region {
                kind: RegionKind::Data,
                offset: start + log_len,
                len: data_len,
                permits: Arc::new(Semaphore::new(permits)),
            },
            wait,
        })
    }

    fn region(&self, kind: RegionKind) -> &Region {
        match kind {
            RegionKind::LogPage => &self.log_page,
            RegionKind::Data => &self.data,
        }
    }

    pub fn capacity(&self, kind: RegionKind) -> u64 {
        self.region(kind).len
    }

    /// Take exclusive use of a region, waiting up to the configured time for it.
    ///
    /// # Returns: `Result<ArenaPermit, ArenaError>`
    /// * `Ok(ArenaPermit)` - The region is held until the permit is dropped
    /// * `Err(ArenaError::Busy)` - Still held elsewhere after the wait, or the arena is closed
    pub async fn acquire(&self, kind: RegionKind) -> Result<ArenaPermit, ArenaError> {
        let region = self.region(kind);
        trace!("Waiting for the {kind} region");
        match timeout(self.wait, region.permits.clone().acquire_owned()).await {
            Ok(Ok(permit)) => Ok(ArenaPermit {
                mem: self.mem.clone(),
                kind,
                offset: region.offset,
                len: region.len,
                _permit: permit,
            }),
            Ok(Err(_)) => {
                warn!("The {kind} region was closed while waiting for it");
                Err(ArenaError::Busy { region: kind })
            }
            Err(_) => {
                warn!("The {kind} region is still busy after {:?}", self.wait);
                Err(ArenaError::Busy { region: kind })
            }
        }
    }

    pub async fn acquire_log(&self) -> Result<ArenaPermit, ArenaError> {
        self.acquire(RegionKind::LogPage).await
    }

    pub async fn acquire_data(&self) -> Result<ArenaPermit, ArenaError> {
        self.acquire(RegionKind::Data).await
    }

    /// Wake every waiter with `Busy`. Used when the channel detaches from the firmware.
    pub fn close(&self) {
        self.log_page.permits.close();
        self.data.permits.close();
    }
}

/// Exclusive use of one arena region.
#[derive(Debug)]
pub struct ArenaPermit {
    mem: Arc<dyn DeviceMemory>,
    kind: RegionKind,
    offset: u64,
    len: u64,
    _permit: OwnedSemaphorePermit,
}

impl ArenaPermit {
    pub fn kind(&self) -> RegionKind {
        self.kind
    }

    /// Device visible address of the start of the region, as carried in command payloads.
    pub fn address(&self) -> u64 {
        self.offset
    }

    pub fn len(&self) -> u64 {
        self.len
    }

    fn check(&self, at: u64, len: u64) -> Result<(), ArenaError> {
        match at.checked_add(len) {
            Some(end) if end <= self.len => Ok(()),
            _ => Err(ArenaError::TooLarge {
                region: self.kind,
                requested: at.saturating_add(len),
                available: self.len,
            }),
        }
    }

    pub fn write(&self, at: u64, data: &[u8]) -> Result<(), ArenaError> {
        self.check(at, data.len() as u64)?;
        Ok(self.mem.write_bytes(self.offset + at, data)?)
    }

    pub fn read(&self, at: u64, len: u64) -> Result<Vec<u8>, ArenaError> {
        self.check(at, len)?;
        let mut buf = vec![0u8; len as usize];
        self.mem.read_bytes(self.offset + at, &mut buf)?;
        Ok(buf)
    }

    pub fn release(self) {
        trace!("Released the {} region", self.kind);
    }
}
