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

//! Reader for the firmware's circular log.
//!
//! The firmware keeps its last [`VMR_LOG_MAX_RECS`] messages as fixed size, NUL padded records
//! in payload memory. The descriptor's log index names the slot the next message will go to,
//! which is also the oldest record once the ring has wrapped.

use crate::device_memory::DeviceMemory;
use crate::error::AccessError;
use crate::xgq::descriptor::SharedDescriptor;

pub const VMR_LOG_MAX_RECS: u32 = 50;
pub const VMR_LOG_ENTRY_SIZE: u32 = 256;

/// Read up to `count` of the most recent log records, oldest first. Empty records are skipped.
pub fn read_recent(
    mem: &dyn DeviceMemory,
    descriptor: &SharedDescriptor,
    count: u32,
) -> Result<Vec<String>, AccessError> {
    let count = count.min(VMR_LOG_MAX_RECS);
    let index = descriptor.current_log_index(mem)? % VMR_LOG_MAX_RECS;
    let first = (index + VMR_LOG_MAX_RECS - count) % VMR_LOG_MAX_RECS;
    let mut records = Vec::with_capacity(count as usize);
    let mut buf = vec![0u8; VMR_LOG_ENTRY_SIZE as usize];
    for i in 0..count {
        let slot = (first + i) % VMR_LOG_MAX_RECS;
        let at = u64::from(descriptor.log_buf_off) + u64::from(slot * VMR_LOG_ENTRY_SIZE);
        mem.read_bytes(at, &mut buf)?;
        let end = buf.iter().position(|b| *b == 0).unwrap_or(buf.len());
        let line = String::from_utf8_lossy(&buf[..end]).trim_end().to_string();
        if !line.is_empty() {
            records.push(line);
        }
    }
    Ok(records)
}

/// Append one record the way the firmware does, advancing the log index.
pub fn append(
    mem: &dyn DeviceMemory,
    descriptor: &SharedDescriptor,
    line: &str,
) -> Result<(), AccessError> {
    let index = descriptor.current_log_index(mem)? % VMR_LOG_MAX_RECS;
    let mut record = vec![0u8; VMR_LOG_ENTRY_SIZE as usize];
    let len = line.len().min(record.len() - 1);
    record[..len].copy_from_slice(&line.as_bytes()[..len]);
    let at = u64::from(descriptor.log_buf_off) + u64::from(index * VMR_LOG_ENTRY_SIZE);
    mem.write_bytes(at, &record)?;
    descriptor.set_log_index(mem, (index + 1) % VMR_LOG_MAX_RECS)
}
