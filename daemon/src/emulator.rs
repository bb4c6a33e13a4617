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

//! An in-process stand-in for the card's management firmware.
//!
//! The emulator owns a [`SimulatedMemory`] payload region and register block laid out the way
//! the real firmware lays out its BAR: descriptor, status word, rings, log and data window.
//! It consumes submission records, acts on them against its own state and produces
//! completions, so a [`DeviceChannel`](crate::xgq::service::DeviceChannel) attached to it
//! exercises the same code paths as on hardware.
//!
//! It serves the daemon when `XGQD_EMULATE=1` and backs the integration tests. Tests steer it
//! through [`EmulatorBehaviour`]: report a different interface version, fail or ignore chosen
//! opcodes, delay responses, or inject completions the host never asked for.

use crate::device_memory::{DeviceMemory, SimulatedMemory};
use crate::error::AccessError;
use crate::vmr::{ClockScalingStatus, VmrStatus, VmrVersion};
use crate::xgq::descriptor::SharedDescriptor;
use crate::xgq::lock;
use crate::xgq::record::{
    CQ_ENTRY_SIZE, ClockRequest, Command, Completion, DecodeError, LogPageKind,
    MAX_CLOCK_FREQS, Opcode, SQ_HEADER_SIZE, ThrottlingAction, TransferKind, VmrControlRequest,
};
use crate::xgq::ring::{
    CQ_INTR_CTRL, CQ_PRODUCED_REG, HDR_CQ_CONSUMED, HDR_SQ_CONSUMED, SQ_PRODUCED_REG,
    XGQ_REG_SPAN, XgqHeader,
};
use crate::xgq::vmr_log::{self, VMR_LOG_ENTRY_SIZE, VMR_LOG_MAX_RECS};
use log::{debug, error, info};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::sleep;

pub const EFAULT: i32 = 14;
pub const EINVAL: i32 = 22;
pub const EOPNOTSUPP: i32 = 95;

/// Where everything lives in the emulated payload memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EmulatorLayout {
    pub payload_size: u64,
    pub status_off: u32,
    pub ring_base: u32,
    pub slot_num: u32,
    pub sq_slot_size: u32,
    pub log_buf_off: u32,
    pub data_start: u32,
    pub data_end: u32,
}

impl Default for EmulatorLayout {
    fn default() -> Self {
        EmulatorLayout {
            payload_size: 0x40_0000,
            status_off: 0x40,
            ring_base: 0x1000,
            slot_num: 32,
            sq_slot_size: 512,
            log_buf_off: 0x8000,
            data_start: 0x1_0000,
            data_end: 0x3F_FFFF,
        }
    }
}

impl EmulatorLayout {
    fn header(&self) -> XgqHeader {
        XgqHeader::layout(self.slot_num, self.sq_slot_size)
    }

    fn descriptor(&self) -> SharedDescriptor {
        let header = self.header();
        SharedDescriptor {
            ring_buffer_off: self.ring_base,
            ring_buffer_len: header.footprint() as u32,
            status_off: self.status_off,
            log_index: 0,
            log_buf_off: self.log_buf_off,
            log_buf_len: VMR_LOG_MAX_RECS * VMR_LOG_ENTRY_SIZE,
            data_start: self.data_start,
            data_end: self.data_end,
            ..Default::default()
        }
    }
}

/// How the emulated firmware answers.
#[derive(Debug, Clone)]
pub struct EmulatorBehaviour {
    pub version: VmrVersion,
    pub status: VmrStatus,
    pub clock_scaling: ClockScalingStatus,
    /// Clock frequencies in MHz, shared by every region.
    pub clock_freqs: [u32; MAX_CLOCK_FREQS],
    pub log_pages: HashMap<LogPageKind, Vec<u8>>,
    pub sensor_report: Vec<u8>,
    /// Complete these opcodes with the given non-zero rcode.
    pub failures: HashMap<Opcode, i32>,
    /// Consume these opcodes but never complete them.
    pub unresponsive: HashSet<Opcode>,
    pub response_delay: Duration,
}

impl Default for EmulatorBehaviour {
    fn default() -> Self {
        let mut log_pages = HashMap::new();
        log_pages.insert(
            LogPageKind::ShellInterfaceUuid,
            b"a3e2c7f0-0000-4000-8000-00000000beef".to_vec(),
        );
        log_pages.insert(LogPageKind::Info, b"vmr emulator\n".to_vec());
        EmulatorBehaviour {
            version: VmrVersion { major: 1, minor: 0 },
            status: VmrStatus {
                boot_on_default: true,
                has_fpt: true,
                has_ext_scfw: true,
                sc_is_ready: true,
                ps_is_ready: true,
                program_progress: 100,
                ..Default::default()
            },
            clock_scaling: ClockScalingStatus {
                supported: true,
                power_limit: 225,
                temp_limit: 95,
                ..Default::default()
            },
            clock_freqs: [300, 500, 0, 0],
            log_pages,
            sensor_report: vec![0x5a; 64],
            failures: HashMap::new(),
            unresponsive: HashSet::new(),
            response_delay: Duration::ZERO,
        }
    }
}

/// A command as the emulated firmware received it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceivedCommand {
    pub cid: u16,
    pub command: Command,
    /// The staged image, for data transfers.
    pub data: Vec<u8>,
}

#[derive(Debug, Default)]
struct ServerCursors {
    sq_consumed: u32,
    cq_produced: u32,
    backlog: VecDeque<Completion>,
}

type InterruptHook = Arc<dyn Fn() + Send + Sync>;

#[derive(Debug)]
pub struct VmrEmulator {
    layout: EmulatorLayout,
    payload: Arc<SimulatedMemory>,
    regs: Arc<SimulatedMemory>,
    behaviour: Mutex<EmulatorBehaviour>,
    received: Mutex<Vec<ReceivedCommand>>,
    cursors: Mutex<ServerCursors>,
}

/// A running emulator task.
#[derive(Debug)]
pub struct EmulatorTask {
    stop: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl EmulatorTask {
    pub async fn shutdown(self) {
        self.stop.send_replace(true);
        if let Err(e) = self.task.await {
            error!("Emulator task ended abnormally: {e}");
        }
    }
}

impl VmrEmulator {
    pub fn new(layout: EmulatorLayout, behaviour: EmulatorBehaviour) -> Arc<Self> {
        Arc::new(VmrEmulator {
            layout,
            payload: Arc::new(SimulatedMemory::new(layout.payload_size)),
            regs: Arc::new(SimulatedMemory::new(XGQ_REG_SPAN)),
            behaviour: Mutex::new(behaviour),
            received: Mutex::new(Vec::new()),
            cursors: Mutex::new(ServerCursors::default()),
        })
    }

    pub fn payload(&self) -> Arc<dyn DeviceMemory> {
        self.payload.clone()
    }

    pub fn regs(&self) -> Arc<dyn DeviceMemory> {
        self.regs.clone()
    }

    pub fn layout(&self) -> EmulatorLayout {
        self.layout
    }

    /// Publish fresh rings and the descriptor, then flag ready. Calling it again emulates a
    /// firmware restart: every counter starts over.
    pub fn boot(&self) -> Result<(), AccessError> {
        let mem = self.payload.as_ref();
        mem.write32(u64::from(self.layout.status_off), 0)?;
        *lock(&self.cursors, "emulator cursors") = ServerCursors::default();
        self.layout
            .header()
            .publish(mem, self.regs.as_ref(), u64::from(self.layout.ring_base))?;
        let descriptor = self.layout.descriptor();
        descriptor.publish(mem)?;
        let version = lock(&self.behaviour, "emulator behaviour").version;
        vmr_log::append(mem, &descriptor, &format!("vmr {version} booted"))?;
        mem.write32(u64::from(self.layout.status_off), 1)?;
        info!("Emulated firmware {version} is ready");
        Ok(())
    }

    pub fn update(&self, change: impl FnOnce(&mut EmulatorBehaviour)) {
        change(&mut lock(&self.behaviour, "emulator behaviour"));
    }

    pub fn received(&self) -> Vec<ReceivedCommand> {
        lock(&self.received, "emulator received").clone()
    }

    /// Append a line to the firmware log.
    pub fn log(&self, line: &str) -> Result<(), AccessError> {
        vmr_log::append(self.payload.as_ref(), &self.layout.descriptor(), line)
    }

    /// Queue a completion that answers no submission.
    pub fn inject_completion(&self, completion: Completion) -> Result<(), AccessError> {
        lock(&self.cursors, "emulator cursors")
            .backlog
            .push_back(completion);
        self.flush().map(|_| ())
    }

    /// Start serving the rings, polling the doorbell every `poll` interval.
    pub fn serve(self: &Arc<Self>, poll: Duration) -> EmulatorTask {
        self.serve_inner(poll, None)
    }

    /// As [`serve`](VmrEmulator::serve), calling `hook` after producing completions while the
    /// host has completion interrupts enabled.
    pub fn serve_with_interrupts(
        self: &Arc<Self>,
        poll: Duration,
        hook: impl Fn() + Send + Sync + 'static,
    ) -> EmulatorTask {
        self.serve_inner(poll, Some(Arc::new(hook)))
    }

    fn serve_inner(self: &Arc<Self>, poll: Duration, hook: Option<InterruptHook>) -> EmulatorTask {
        let (stop, mut rx) = watch::channel(false);
        let emulator = self.clone();
        let task = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = rx.changed() => break,
                    _ = sleep(poll) => {}
                }
                match emulator.step().await {
                    Ok(0) => {}
                    Ok(_) => {
                        if let Some(hook) = &hook {
                            if emulator.regs.read32(CQ_INTR_CTRL).unwrap_or(0) != 0 {
                                hook();
                            }
                        }
                    }
                    Err(e) => error!("Emulated firmware failed: {e}"),
                }
            }
        });
        EmulatorTask { stop, task }
    }

    fn sq_slot(&self, counter: u32) -> u64 {
        let header = self.layout.header();
        u64::from(self.layout.ring_base)
            + u64::from(header.sq_offset)
            + u64::from(counter & (header.slot_num - 1)) * u64::from(header.sq_slot_size)
    }

    fn cq_slot(&self, counter: u32) -> u64 {
        let header = self.layout.header();
        u64::from(self.layout.ring_base)
            + u64::from(header.cq_offset)
            + u64::from(counter & (header.slot_num - 1)) * CQ_ENTRY_SIZE as u64
    }

    /// Handle every submission the host has produced. Returns how many completions were
    /// written.
    pub async fn step(&self) -> Result<usize, AccessError> {
        let mut produced = self.flush()?;
        let ring_base = u64::from(self.layout.ring_base);
        let host_produced = self.regs.read32(SQ_PRODUCED_REG)?;
        loop {
            let slot = {
                let mut cursors = lock(&self.cursors, "emulator cursors");
                if cursors.sq_consumed == host_produced {
                    break;
                }
                cursors.sq_consumed = cursors.sq_consumed.wrapping_add(1);
                self.payload
                    .write32(ring_base + HDR_SQ_CONSUMED, cursors.sq_consumed)?;
                self.sq_slot(cursors.sq_consumed)
            };
            let word0 = self.payload.read32(slot)?;
            let count = ((word0 >> 16) & 0x7fff) as usize;
            let len = (SQ_HEADER_SIZE + count).min(self.layout.sq_slot_size as usize);
            let mut record = vec![0u8; len];
            self.payload.read_bytes(slot, &mut record)?;

            let delay = lock(&self.behaviour, "emulator behaviour").response_delay;
            if let Some(completion) = self.handle(&record) {
                if !delay.is_zero() {
                    sleep(delay).await;
                }
                lock(&self.cursors, "emulator cursors")
                    .backlog
                    .push_back(completion);
                produced += self.flush()?;
            }
        }
        Ok(produced)
    }

    /// Write backlogged completions while the host has room for them.
    fn flush(&self) -> Result<usize, AccessError> {
        let ring_base = u64::from(self.layout.ring_base);
        let mut cursors = lock(&self.cursors, "emulator cursors");
        let mut written = 0;
        while !cursors.backlog.is_empty() {
            let host_consumed = self.payload.read32(ring_base + HDR_CQ_CONSUMED)?;
            if cursors.cq_produced.wrapping_sub(host_consumed) >= self.layout.slot_num {
                break;
            }
            let Some(completion) = cursors.backlog.pop_front() else {
                break;
            };
            cursors.cq_produced = cursors.cq_produced.wrapping_add(1);
            let slot = self.cq_slot(cursors.cq_produced);
            let entry = completion.encode();
            self.payload.write_bytes(slot + 4, &entry[4..])?;
            self.payload.write_bytes(slot, &entry[..4])?;
            self.regs.write32(CQ_PRODUCED_REG, cursors.cq_produced)?;
            written += 1;
        }
        Ok(written)
    }

    fn handle(&self, record: &[u8]) -> Option<Completion> {
        let (cid, command) = match Command::decode(record) {
            Ok(decoded) => decoded,
            Err(DecodeError::UnknownOpcode { cid, code }) => {
                debug!("Emulated firmware does not know opcode {code:#x}");
                return Some(Completion::failure(cid, -EOPNOTSUPP));
            }
            Err(DecodeError::Truncated { cid: Some(cid) }) | Err(DecodeError::BadField { cid, .. }) => {
                return Some(Completion::failure(cid, -EINVAL));
            }
            Err(e) => {
                error!("Emulated firmware dropped a record: {e}");
                return None;
            }
        };
        let opcode = command.opcode();
        let mut behaviour = lock(&self.behaviour, "emulator behaviour");
        let mut received = ReceivedCommand {
            cid,
            command,
            data: Vec::new(),
        };
        let outcome = self.execute(&mut behaviour, &mut received);
        lock(&self.received, "emulator received").push(received);

        if behaviour.unresponsive.contains(&opcode) {
            debug!("Emulated firmware ignores cmd id: {cid} op: {opcode}");
            return None;
        }
        if let Some(rcode) = behaviour.failures.get(&opcode) {
            let _ = self.log(&format!("cmd id: {cid} op: {opcode} failed with {rcode}"));
            return Some(Completion::failure(cid, *rcode));
        }
        Some(match outcome {
            Ok(result) => Completion::success(cid, result),
            Err(rcode) => Completion::failure(cid, rcode),
        })
    }

    fn stage(&self, address: u64, data: &[u8]) -> Result<(), i32> {
        self.payload.write_bytes(address, data).map_err(|_| -EFAULT)
    }

    fn execute(
        &self,
        behaviour: &mut EmulatorBehaviour,
        received: &mut ReceivedCommand,
    ) -> Result<[u32; 2], i32> {
        match received.command {
            Command::Identify => Ok([behaviour.version.to_word(), 0]),
            Command::Transfer(t) => {
                let mut data = vec![0u8; t.size as usize];
                self.payload
                    .read_bytes(t.address, &mut data)
                    .map_err(|_| -EFAULT)?;
                received.data = data;
                if t.kind == TransferKind::ScFirmware {
                    behaviour.status.has_ext_scfw = true;
                }
                Ok([0, 0])
            }
            Command::LogPage(l) => {
                let page = behaviour.log_pages.get(&l.kind).cloned().unwrap_or_default();
                let start = (l.offset as usize).min(page.len());
                let end = (start + l.size as usize).min(page.len());
                self.stage(l.address, &page[start..end])?;
                Ok([(end - start) as u32, 0])
            }
            Command::Clock(c) => match c.request {
                ClockRequest::Get => behaviour
                    .clock_freqs
                    .get(c.count as usize)
                    .map(|freq| [*freq, 0])
                    .ok_or(-EINVAL),
                ClockRequest::Scale => {
                    let count = (c.count as usize).min(MAX_CLOCK_FREQS);
                    behaviour.clock_freqs[..count].copy_from_slice(&c.freqs[..count]);
                    Ok([0, 0])
                }
            },
            Command::ClockThrottling(t) => match t.action {
                ThrottlingAction::Read => Ok(behaviour.clock_scaling.to_result()),
                ThrottlingAction::Configure => {
                    let scaling = &mut behaviour.clock_scaling;
                    if t.reset {
                        *scaling = EmulatorBehaviour::default().clock_scaling;
                    } else {
                        scaling.enabled = t.enable;
                        scaling.power_override = t.power_limit.is_some();
                        scaling.temp_override = t.temp_limit.is_some();
                        if let Some(limit) = t.power_limit {
                            scaling.power_limit = limit;
                        }
                        if let Some(limit) = t.temp_limit {
                            scaling.temp_limit = limit;
                        }
                    }
                    Ok([0, 0])
                }
            },
            Command::Sensor(s) => {
                let len = behaviour.sensor_report.len().min(s.size as usize);
                self.stage(s.address, &behaviour.sensor_report[..len])?;
                Ok([len as u32, 0])
            }
            Command::VmrControl(v) => match v.request {
                VmrControlRequest::Query => Ok(behaviour.status.to_result()),
                VmrControlRequest::BootDefault | VmrControlRequest::BootBackup => {
                    let backup = v.request == VmrControlRequest::BootBackup;
                    behaviour.status.boot_on_backup = backup;
                    behaviour.status.boot_on_default = !backup;
                    Ok([0, 0])
                }
                VmrControlRequest::EemiSrst => Ok([0, 0]),
            },
        }
    }
}
