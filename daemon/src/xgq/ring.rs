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

//! Submission and completion rings shared with the firmware.
//!
//! The firmware allocates both rings inside the payload memory and describes them with a
//! 32 byte header at the ring base:
//!
//! ```text
//! 0x00 magic          0x04 minor (u16) | major (u16)
//! 0x08 slot count     0x0c submission ring offset
//! 0x10 sq slot size   0x14 completion ring offset
//! 0x18 sq consumed    0x1c cq consumed
//! ```
//!
//! Each ring has one producer and one consumer which keep free running 32-bit counters. A
//! slot index is always `counter & (slot_count - 1)`, so slot counts must be powers of two.
//! The submission producer publishes its counter through the doorbell register at
//! [`SQ_PRODUCED_REG`]; the firmware publishes its submission consumer counter in the header.
//! The completion side mirrors that with [`CQ_PRODUCED_REG`] and the `cq consumed` header
//! word.
//!
//! The rings are not internally synchronised. [`SubmissionRing`] is owned by the command
//! lifecycle and only touched under its lock; [`CompletionRing`] belongs to the completion
//! drainer.

use crate::device_memory::DeviceMemory;
use crate::error::{AccessError, AttachError, SubmitError};
use crate::xgq::record::{CQ_ENTRY_SIZE, ENTRY_NEW, Opcode, SQ_HEADER_SIZE};
use log::{debug, trace};
use std::sync::Arc;

pub const XGQ_ALLOC_MAGIC: u32 = 0x5847_513F;
pub const XGQ_MAJOR: u16 = 1;
pub const XGQ_MINOR: u16 = 0;
pub const XGQ_MIN_NUM_SLOTS: u32 = 2;
pub const XGQ_HEADER_SIZE: u64 = 32;

const HDR_MAGIC: u64 = 0x00;
const HDR_VERSION: u64 = 0x04;
const HDR_SLOT_NUM: u64 = 0x08;
const HDR_SQ_OFFSET: u64 = 0x0c;
const HDR_SQ_SLOT_SIZE: u64 = 0x10;
const HDR_CQ_OFFSET: u64 = 0x14;
pub(crate) const HDR_SQ_CONSUMED: u64 = 0x18;
pub(crate) const HDR_CQ_CONSUMED: u64 = 0x1c;

pub const SQ_PRODUCED_REG: u64 = 0x000;
pub const SQ_INTR_REG: u64 = 0x004;
pub const SQ_INTR_CTRL: u64 = 0x00c;
pub const CQ_PRODUCED_REG: u64 = 0x100;
pub const CQ_INTR_REG: u64 = 0x104;
pub const CQ_INTR_CTRL: u64 = 0x10c;
/// Span of the doorbell register block.
pub const XGQ_REG_SPAN: u64 = 0x110;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct XgqHeader {
    pub major: u16,
    pub minor: u16,
    pub slot_num: u32,
    pub sq_offset: u32,
    pub sq_slot_size: u32,
    pub cq_offset: u32,
}

impl XgqHeader {
    /// Lay out a pair of rings starting right after the header.
    pub fn layout(slot_num: u32, sq_slot_size: u32) -> Self {
        let sq_offset = XGQ_HEADER_SIZE as u32;
        XgqHeader {
            major: XGQ_MAJOR,
            minor: XGQ_MINOR,
            slot_num,
            sq_offset,
            sq_slot_size,
            cq_offset: sq_offset + slot_num * sq_slot_size,
        }
    }

    /// Bytes needed for the header and both rings.
    pub fn footprint(&self) -> u64 {
        u64::from(self.cq_offset) + u64::from(self.slot_num) * CQ_ENTRY_SIZE as u64
    }

    fn read(mem: &dyn DeviceMemory, base: u64) -> Result<Self, AccessError> {
        let version = mem.read32(base + HDR_VERSION)?;
        Ok(XgqHeader {
            minor: (version & 0xffff) as u16,
            major: (version >> 16) as u16,
            slot_num: mem.read32(base + HDR_SLOT_NUM)?,
            sq_offset: mem.read32(base + HDR_SQ_OFFSET)?,
            sq_slot_size: mem.read32(base + HDR_SQ_SLOT_SIZE)?,
            cq_offset: mem.read32(base + HDR_CQ_OFFSET)?,
        })
    }

    /// Initialise the rings at `base` the way the firmware does: zeroed counters and slots
    /// first, the header next, the magic last.
    pub fn publish(
        &self,
        mem: &dyn DeviceMemory,
        regs: &dyn DeviceMemory,
        base: u64,
    ) -> Result<(), AccessError> {
        mem.write32(base + HDR_MAGIC, 0)?;
        for offset in (XGQ_HEADER_SIZE..self.footprint()).step_by(4) {
            mem.write32(base + offset, 0)?;
        }
        for reg in [SQ_PRODUCED_REG, CQ_PRODUCED_REG, SQ_INTR_CTRL, CQ_INTR_CTRL] {
            regs.write32(reg, 0)?;
        }
        mem.write32(
            base + HDR_VERSION,
            u32::from(self.minor) | (u32::from(self.major) << 16),
        )?;
        mem.write32(base + HDR_SLOT_NUM, self.slot_num)?;
        mem.write32(base + HDR_SQ_OFFSET, self.sq_offset)?;
        mem.write32(base + HDR_SQ_SLOT_SIZE, self.sq_slot_size)?;
        mem.write32(base + HDR_CQ_OFFSET, self.cq_offset)?;
        mem.write32(base + HDR_SQ_CONSUMED, 0)?;
        mem.write32(base + HDR_CQ_CONSUMED, 0)?;
        mem.write32(base + HDR_MAGIC, XGQ_ALLOC_MAGIC)
    }
}

/// Location of one ring and the counters that describe its occupancy.
#[derive(Debug, Clone, Copy)]
pub(crate) struct RingCursor {
    pub(crate) slot_num: u32,
    pub(crate) slot_size: u32,
    pub(crate) slot_addr: u64,
    pub(crate) produced: u32,
    pub(crate) consumed: u32,
}

impl RingCursor {
    pub(crate) fn is_full(&self) -> bool {
        self.produced.wrapping_sub(self.consumed) >= self.slot_num
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.produced == self.consumed
    }

    pub(crate) fn slot_ptr(&self, counter: u32) -> u64 {
        self.slot_addr + u64::from(counter & (self.slot_num - 1)) * u64::from(self.slot_size)
    }
}

/// Host side of the submission ring: the host produces, the firmware consumes.
#[derive(Debug)]
pub struct SubmissionRing {
    payload: Arc<dyn DeviceMemory>,
    regs: Arc<dyn DeviceMemory>,
    consumed_addr: u64,
    cursor: RingCursor,
}

impl SubmissionRing {
    pub fn slot_size(&self) -> u32 {
        self.cursor.slot_size
    }

    pub fn produced(&self) -> u32 {
        self.cursor.produced
    }

    /// Reserve the next slot, refreshing the firmware's consumed counter if the ring looks
    /// full. Returns `None` when there really is no space.
    pub fn try_produce(&mut self) -> Result<Option<u64>, AccessError> {
        if self.cursor.is_full() {
            self.cursor.consumed = self.payload.read32(self.consumed_addr)?;
            if self.cursor.is_full() {
                return Ok(None);
            }
        }
        self.cursor.produced = self.cursor.produced.wrapping_add(1);
        Ok(Some(self.cursor.slot_ptr(self.cursor.produced)))
    }

    /// Copy `record` into the next free slot and ring the producer doorbell.
    ///
    /// On any error the producer counter is left where it was, so nothing becomes visible to
    /// the firmware.
    pub fn produce(&mut self, opcode: Opcode, record: &[u8]) -> Result<(), SubmitError> {
        if record.len() < SQ_HEADER_SIZE || record.len() > self.cursor.slot_size as usize {
            return Err(SubmitError::RecordTooLarge {
                len: record.len(),
                slot_size: self.cursor.slot_size,
            });
        }
        let previous = self.cursor.produced;
        let slot = self
            .try_produce()?
            .ok_or(SubmitError::QueueFull { opcode })?;
        // The header goes in last so the firmware never sees the new flag on a half written
        // record.
        let written = self
            .payload
            .write_bytes(slot + SQ_HEADER_SIZE as u64, &record[SQ_HEADER_SIZE..])
            .and_then(|_| self.payload.write_bytes(slot + 4, &record[4..SQ_HEADER_SIZE]))
            .and_then(|_| self.payload.write_bytes(slot, &record[..4]))
            .and_then(|_| self.notify_produced());
        if let Err(e) = written {
            self.cursor.produced = previous;
            return Err(e.into());
        }
        trace!("Produced {opcode} into sq slot {slot:#x}");
        Ok(())
    }

    fn notify_produced(&self) -> Result<(), AccessError> {
        self.regs.write32(SQ_PRODUCED_REG, self.cursor.produced)
    }
}

/// Host side of the completion ring: the firmware produces, the host consumes.
#[derive(Debug)]
pub struct CompletionRing {
    payload: Arc<dyn DeviceMemory>,
    regs: Arc<dyn DeviceMemory>,
    consumed_addr: u64,
    cursor: RingCursor,
}

impl CompletionRing {
    /// Address of the next completion slot if the producer counter says one is waiting.
    /// Does not advance the consumer.
    pub fn try_consume(&mut self) -> Result<Option<u64>, AccessError> {
        if self.cursor.is_empty() {
            self.cursor.produced = self.regs.read32(CQ_PRODUCED_REG)?;
            if self.cursor.is_empty() {
                return Ok(None);
            }
        }
        Ok(Some(
            self.cursor.slot_ptr(self.cursor.consumed.wrapping_add(1)),
        ))
    }

    /// Read the next completion if one is ready.
    ///
    /// A slot is only taken once its new flag is set. The first word of a consumed slot is
    /// cleared so the flag cannot be seen twice; the consumer counter only moves after that.
    pub fn consume(&mut self) -> Result<Option<[u8; CQ_ENTRY_SIZE]>, AccessError> {
        let Some(slot) = self.try_consume()? else {
            return Ok(None);
        };
        if self.payload.read32(slot)? & ENTRY_NEW == 0 {
            trace!("cq slot {slot:#x} is counted but not yet flagged");
            return Ok(None);
        }
        let mut entry = [0u8; CQ_ENTRY_SIZE];
        self.payload.read_bytes(slot, &mut entry)?;
        self.payload.write32(slot, 0)?;
        self.cursor.consumed = self.cursor.consumed.wrapping_add(1);
        Ok(Some(entry))
    }

    /// Publish the consumer counter so the firmware can reuse the slots.
    pub fn notify_consumed(&self) -> Result<(), AccessError> {
        self.payload.write32(self.consumed_addr, self.cursor.consumed)
    }

    /// Enable or disable completion interrupts from the firmware.
    pub fn set_interrupts(&self, enabled: bool) -> Result<(), AccessError> {
        self.regs.write32(CQ_INTR_CTRL, u32::from(enabled))
    }
}

/// Validate the header at `base` and build both host side rings.
///
/// Counters are fast-forwarded to whatever the firmware and the doorbells currently hold, so
/// re-attaching after a stop never replays old records.
///
/// # Arguments
///
/// * `payload` - Memory holding the header and both rings
/// * `regs` - The doorbell register block
/// * `base` - Offset of the ring header within `payload`
///
/// # Returns: `Result<(SubmissionRing, CompletionRing), AttachError>`
/// * `Ok(..)` - Both rings, ready to use
/// * `Err(AttachError::BadMagic)` - No rings have been published at `base`
/// * `Err(AttachError::UnsupportedMajor)` - The header layout is from a different major version
/// * `Err(AttachError::BadGeometry)` - Slot counts or sizes are unusable or the rings do not fit
pub fn attach(
    payload: Arc<dyn DeviceMemory>,
    regs: Arc<dyn DeviceMemory>,
    base: u64,
) -> Result<(SubmissionRing, CompletionRing), AttachError> {
    let magic = payload.read32(base + HDR_MAGIC)?;
    if magic != XGQ_ALLOC_MAGIC {
        return Err(AttachError::BadMagic {
            expected: XGQ_ALLOC_MAGIC,
            found: magic,
        });
    }
    let header = XgqHeader::read(payload.as_ref(), base)?;
    if header.major != XGQ_MAJOR {
        return Err(AttachError::UnsupportedMajor {
            major: header.major,
            minor: header.minor,
        });
    }
    if header.slot_num < XGQ_MIN_NUM_SLOTS || !header.slot_num.is_power_of_two() {
        return Err(AttachError::BadGeometry(format!(
            "slot count {} is not a power of two of at least {XGQ_MIN_NUM_SLOTS}",
            header.slot_num
        )));
    }
    if header.sq_slot_size < SQ_HEADER_SIZE as u32 || header.sq_slot_size % 4 != 0 {
        return Err(AttachError::BadGeometry(format!(
            "submission slot size {} is unusable",
            header.sq_slot_size
        )));
    }
    let sq_end = u64::from(header.sq_offset)
        + u64::from(header.slot_num) * u64::from(header.sq_slot_size);
    let cq_end = header.footprint();
    if base + sq_end.max(cq_end) > payload.size() {
        return Err(AttachError::BadGeometry(format!(
            "rings at {base:#x} extend past the payload region of {:#x} bytes",
            payload.size()
        )));
    }
    if regs.size() < XGQ_REG_SPAN {
        return Err(AttachError::BadGeometry(format!(
            "register block of {:#x} bytes is too small",
            regs.size()
        )));
    }

    let sq = SubmissionRing {
        consumed_addr: base + HDR_SQ_CONSUMED,
        cursor: RingCursor {
            slot_num: header.slot_num,
            slot_size: header.sq_slot_size,
            slot_addr: base + u64::from(header.sq_offset),
            produced: regs.read32(SQ_PRODUCED_REG)?,
            consumed: payload.read32(base + HDR_SQ_CONSUMED)?,
        },
        payload: payload.clone(),
        regs: regs.clone(),
    };
    let cq = CompletionRing {
        consumed_addr: base + HDR_CQ_CONSUMED,
        cursor: RingCursor {
            slot_num: header.slot_num,
            slot_size: CQ_ENTRY_SIZE as u32,
            slot_addr: base + u64::from(header.cq_offset),
            produced: regs.read32(CQ_PRODUCED_REG)?,
            consumed: payload.read32(base + HDR_CQ_CONSUMED)?,
        },
        payload,
        regs,
    };
    debug!(
        "Attached xgq {}.{} at {base:#x}: {} slots, sq slot size {}",
        header.major, header.minor, header.slot_num, header.sq_slot_size
    );
    Ok((sq, cq))
}
