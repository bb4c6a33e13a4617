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

//! The shared descriptor the firmware publishes at the start of payload memory.
//!
//! Before anything else can happen the host has to wait for the firmware to fill in this
//! descriptor and flag itself ready. The descriptor then says where the rings, the firmware
//! log and the shared data arena live:
//!
//! ```text
//! 0x00 magic             0x04 ring buffer offset   0x08 ring buffer length
//! 0x0c status offset     0x10 log index            0x14 log buffer offset
//! 0x18 log buffer length 0x1c data start           0x20 data end (inclusive)
//! ```

use crate::device_memory::DeviceMemory;
use crate::error::{AccessError, AttachError};
use log::{debug, error, info, trace};
use std::time::Duration;
use tokio::time::sleep;

pub const VMR_MAGIC_NO: u32 = 0x564D_5230;
pub const DESCRIPTOR_SIZE: u64 = 0x24;

const DESC_MAGIC: u64 = 0x00;
const DESC_RING_BUFFER_OFF: u64 = 0x04;
const DESC_RING_BUFFER_LEN: u64 = 0x08;
const DESC_STATUS_OFF: u64 = 0x0c;
const DESC_LOG_INDEX: u64 = 0x10;
const DESC_LOG_BUF_OFF: u64 = 0x14;
const DESC_LOG_BUF_LEN: u64 = 0x18;
const DESC_DATA_START: u64 = 0x1c;
const DESC_DATA_END: u64 = 0x20;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SharedDescriptor {
    pub magic: u32,
    pub ring_buffer_off: u32,
    pub ring_buffer_len: u32,
    pub status_off: u32,
    pub log_index: u32,
    pub log_buf_off: u32,
    pub log_buf_len: u32,
    pub data_start: u32,
    pub data_end: u32,
}

impl SharedDescriptor {
    pub fn read(mem: &dyn DeviceMemory) -> Result<Self, AccessError> {
        Ok(SharedDescriptor {
            magic: mem.read32(DESC_MAGIC)?,
            ring_buffer_off: mem.read32(DESC_RING_BUFFER_OFF)?,
            ring_buffer_len: mem.read32(DESC_RING_BUFFER_LEN)?,
            status_off: mem.read32(DESC_STATUS_OFF)?,
            log_index: mem.read32(DESC_LOG_INDEX)?,
            log_buf_off: mem.read32(DESC_LOG_BUF_OFF)?,
            log_buf_len: mem.read32(DESC_LOG_BUF_LEN)?,
            data_start: mem.read32(DESC_DATA_START)?,
            data_end: mem.read32(DESC_DATA_END)?,
        })
    }

    /// Write every field except the magic, then the magic. The firmware side of [`read`].
    ///
    /// [`read`]: SharedDescriptor::read
    pub fn publish(&self, mem: &dyn DeviceMemory) -> Result<(), AccessError> {
        mem.write32(DESC_MAGIC, 0)?;
        mem.write32(DESC_RING_BUFFER_OFF, self.ring_buffer_off)?;
        mem.write32(DESC_RING_BUFFER_LEN, self.ring_buffer_len)?;
        mem.write32(DESC_STATUS_OFF, self.status_off)?;
        mem.write32(DESC_LOG_INDEX, self.log_index)?;
        mem.write32(DESC_LOG_BUF_OFF, self.log_buf_off)?;
        mem.write32(DESC_LOG_BUF_LEN, self.log_buf_len)?;
        mem.write32(DESC_DATA_START, self.data_start)?;
        mem.write32(DESC_DATA_END, self.data_end)?;
        mem.write32(DESC_MAGIC, VMR_MAGIC_NO)
    }

    pub fn has_magic(&self) -> bool {
        self.magic == VMR_MAGIC_NO
    }

    /// Re-read the log write index, which moves as the firmware logs.
    pub fn current_log_index(&self, mem: &dyn DeviceMemory) -> Result<u32, AccessError> {
        mem.read32(DESC_LOG_INDEX)
    }

    pub fn set_log_index(&self, mem: &dyn DeviceMemory, index: u32) -> Result<(), AccessError> {
        mem.write32(DESC_LOG_INDEX, index)
    }

    /// Descriptor is published and the firmware status word is non-zero.
    ///
    /// A status offset that cannot be read counts as not ready. The descriptor may be
    /// half-written while the firmware boots.
    pub fn is_ready(&self, mem: &dyn DeviceMemory) -> bool {
        if !self.has_magic() {
            return false;
        }
        match mem.read32(u64::from(self.status_off)) {
            Ok(status) => status != 0,
            Err(e) => {
                trace!("Status word at {:#x} is unreadable: {e}", self.status_off);
                false
            }
        }
    }
}

/// Poll the descriptor until the firmware reports ready.
///
/// # Arguments
///
/// * `mem` - Payload memory holding the descriptor at offset 0
/// * `retries` - Number of polls before giving up
/// * `interval` - Sleep before each poll
///
/// # Returns: `Result<SharedDescriptor, AttachError>`
/// * `Ok(SharedDescriptor)` - The descriptor as read on the poll that saw it ready
/// * `Err(AttachError::NotReady)` - The firmware never became ready
/// * `Err(AttachError::Access)` - The descriptor itself cannot be read
pub async fn wait_ready(
    mem: &dyn DeviceMemory,
    retries: u32,
    interval: Duration,
) -> Result<SharedDescriptor, AttachError> {
    for attempt in 1..=retries {
        sleep(interval).await;
        let descriptor = SharedDescriptor::read(mem)?;
        if descriptor.is_ready(mem) {
            info!(
                "Firmware is ready after {} ms",
                (interval * attempt).as_millis()
            );
            debug!("Shared descriptor: {descriptor:?}");
            return Ok(descriptor);
        }
        trace!("Firmware not ready on poll {attempt}");
    }
    let waited = interval * retries;
    error!("Firmware is not ready after {} ms", waited.as_millis());
    Err(AttachError::NotReady { waited })
}
