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

//! Binary layout of submission and completion records.
//!
//! Every submission record starts with a two word header followed by an opcode specific
//! payload, all little-endian 32-bit words:
//!
//! ```text
//! word0   [15:0] opcode   [30:16] payload bytes   [31] new
//! word1   [15:0] command id
//! word2.. payload
//! ```
//!
//! Completion records are always four words:
//!
//! ```text
//! word0   [15:0] command id   [29:16] completion state   [30] command specific   [31] new
//! word1   inline result
//! word2   inline result
//! word3   rcode (i32)
//! ```
//!
//! Commands are built as [`Command`] values, one variant per payload family, so the encoder is
//! an exhaustive match and an opcode can never be paired with the wrong payload.

use std::fmt;
use std::str::FromStr;

pub const SQ_HEADER_SIZE: usize = 8;
pub const CQ_ENTRY_SIZE: usize = 16;
/// Set by the producer on a fresh record, cleared by the host after reading a completion.
pub const ENTRY_NEW: u32 = 1 << 31;
pub const ADDR_TYPE_AP_OFFSET: u32 = 0x1;
pub const MAX_CLOCK_FREQS: usize = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(u16)]
pub enum Opcode {
    LoadXclbin = 0x1,
    GetLogPage = 0x8,
    DownloadPdi = 0xa,
    Clock = 0xb,
    Sensor = 0xc,
    LoadApubin = 0xd,
    VmrControl = 0xe,
    ProgramScfw = 0xf,
    ClkThrottling = 0x10,
    ProgramVmr = 0x11,
    Identify = 0x202,
}

impl Opcode {
    pub const ALL: [Opcode; 11] = [
        Opcode::LoadXclbin,
        Opcode::GetLogPage,
        Opcode::DownloadPdi,
        Opcode::Clock,
        Opcode::Sensor,
        Opcode::LoadApubin,
        Opcode::VmrControl,
        Opcode::ProgramScfw,
        Opcode::ClkThrottling,
        Opcode::ProgramVmr,
        Opcode::Identify,
    ];

    pub fn code(self) -> u16 {
        self as u16
    }

    pub fn from_code(code: u16) -> Option<Opcode> {
        Opcode::ALL.into_iter().find(|op| op.code() == code)
    }

    pub fn name(self) -> &'static str {
        match self {
            Opcode::LoadXclbin => "LOAD_XCLBIN",
            Opcode::GetLogPage => "GET_LOG_PAGE",
            Opcode::DownloadPdi => "DOWNLOAD_PDI",
            Opcode::Clock => "CLOCK",
            Opcode::Sensor => "SENSOR",
            Opcode::LoadApubin => "LOAD_APUBIN",
            Opcode::VmrControl => "VMR_CONTROL",
            Opcode::ProgramScfw => "PROGRAM_SCFW",
            Opcode::ClkThrottling => "CLK_THROTTLING",
            Opcode::ProgramVmr => "PROGRAM_VMR",
            Opcode::Identify => "IDENTIFY",
        }
    }

    /// Operations that stay available while the channel is attaching or halted, so a card
    /// running unsupported firmware can still be queried and reflashed.
    pub fn is_basic(self) -> bool {
        matches!(
            self,
            Opcode::DownloadPdi | Opcode::ProgramScfw | Opcode::VmrControl | Opcode::Identify
        )
    }

    /// Reprogramming the management firmware is the recovery path for a halted channel.
    pub fn bypasses_halt(self) -> bool {
        self == Opcode::ProgramVmr
    }
}

impl fmt::Display for Opcode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeoutClass {
    Control,
    Download,
    Flash,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u32)]
pub enum FlashType {
    #[default]
    Default = 0,
    NoBackup = 1,
    ToLegacy = 2,
}

impl FlashType {
    fn from_code(code: u32) -> FlashType {
        match code {
            1 => FlashType::NoBackup,
            2 => FlashType::ToLegacy,
            _ => FlashType::Default,
        }
    }
}

/// Which image a data transfer carries. Each maps to its own opcode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferKind {
    Xclbin,
    Pdi,
    ApuBin,
    ScFirmware,
    VmrImage,
}

impl TransferKind {
    fn opcode(self) -> Opcode {
        match self {
            TransferKind::Xclbin => Opcode::LoadXclbin,
            TransferKind::Pdi => Opcode::DownloadPdi,
            TransferKind::ApuBin => Opcode::LoadApubin,
            TransferKind::ScFirmware => Opcode::ProgramScfw,
            TransferKind::VmrImage => Opcode::ProgramVmr,
        }
    }
}

/// An image staged in the data region, described by its arena address.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DataTransfer {
    pub kind: TransferKind,
    pub address: u64,
    pub size: u32,
    pub flash_type: FlashType,
    /// Opaque to the transport. Carries the target slot for xclbin downloads.
    pub private: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum LogPageKind {
    AfCheck = 0x0,
    Firmware = 0x1,
    Info = 0x2,
    AfClear = 0x3,
    Endpoint = 0x4,
    TaskStats = 0x5,
    MemStats = 0x6,
    SystemDtb = 0x7,
    PlmLog = 0x8,
    ApuLog = 0x9,
    ShellInterfaceUuid = 0xa,
    DefaultFpt = 0xb,
    BackupFpt = 0xc,
}

impl LogPageKind {
    pub const ALL: [LogPageKind; 13] = [
        LogPageKind::AfCheck,
        LogPageKind::Firmware,
        LogPageKind::Info,
        LogPageKind::AfClear,
        LogPageKind::Endpoint,
        LogPageKind::TaskStats,
        LogPageKind::MemStats,
        LogPageKind::SystemDtb,
        LogPageKind::PlmLog,
        LogPageKind::ApuLog,
        LogPageKind::ShellInterfaceUuid,
        LogPageKind::DefaultFpt,
        LogPageKind::BackupFpt,
    ];

    pub fn code(self) -> u32 {
        self as u32
    }

    pub fn from_code(code: u32) -> Option<LogPageKind> {
        LogPageKind::ALL.into_iter().find(|k| k.code() == code)
    }

    pub fn name(self) -> &'static str {
        match self {
            LogPageKind::AfCheck => "af_check",
            LogPageKind::Firmware => "firmware",
            LogPageKind::Info => "info",
            LogPageKind::AfClear => "af_clear",
            LogPageKind::Endpoint => "endpoint",
            LogPageKind::TaskStats => "task_stats",
            LogPageKind::MemStats => "mem_stats",
            LogPageKind::SystemDtb => "system_dtb",
            LogPageKind::PlmLog => "plm_log",
            LogPageKind::ApuLog => "apu_log",
            LogPageKind::ShellInterfaceUuid => "shell_interface_uuid",
            LogPageKind::DefaultFpt => "default_fpt",
            LogPageKind::BackupFpt => "backup_fpt",
        }
    }
}

impl FromStr for LogPageKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        LogPageKind::ALL
            .into_iter()
            .find(|k| k.name() == s)
            .ok_or_else(|| format!("unknown log page '{s}'"))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LogPageRequest {
    pub kind: LogPageKind,
    pub address: u64,
    pub size: u32,
    pub offset: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum ClockRequest {
    Get = 0x0,
    Scale = 0x1,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClockCommand {
    pub request: ClockRequest,
    pub region: u32,
    /// Number of frequencies for `Scale`, index of the clock to read for `Get`.
    pub count: u32,
    pub freqs: [u32; MAX_CLOCK_FREQS],
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum ThrottlingAction {
    Read = 0x1,
    Configure = 0x2,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClockThrottling {
    pub action: ThrottlingAction,
    pub reset: bool,
    pub enable: bool,
    pub power_limit: Option<u16>,
    pub temp_limit: Option<u8>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum SensorRequest {
    Sdr = 0x1,
    AllSdr = 0x2,
    SingleSdr = 0x3,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SensorQuery {
    pub request: SensorRequest,
    pub repo_id: u8,
    pub sensor_id: u8,
    pub address: u64,
    pub size: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum VmrControlRequest {
    Query = 0x0,
    BootDefault = 0x1,
    BootBackup = 0x2,
    EemiSrst = 0x3,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VmrControl {
    pub request: VmrControlRequest,
    pub debug_level: u8,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    Identify,
    Transfer(DataTransfer),
    LogPage(LogPageRequest),
    Clock(ClockCommand),
    ClockThrottling(ClockThrottling),
    Sensor(SensorQuery),
    VmrControl(VmrControl),
}

fn lo(v: u64) -> u32 {
    v as u32
}

fn hi(v: u64) -> u32 {
    (v >> 32) as u32
}

fn join(lo: u32, hi: u32) -> u64 {
    u64::from(lo) | (u64::from(hi) << 32)
}

impl Command {
    pub fn opcode(&self) -> Opcode {
        match self {
            Command::Identify => Opcode::Identify,
            Command::Transfer(t) => t.kind.opcode(),
            Command::LogPage(_) => Opcode::GetLogPage,
            Command::Clock(_) => Opcode::Clock,
            Command::ClockThrottling(_) => Opcode::ClkThrottling,
            Command::Sensor(_) => Opcode::Sensor,
            Command::VmrControl(_) => Opcode::VmrControl,
        }
    }

    pub fn timeout_class(&self) -> TimeoutClass {
        match self {
            Command::Transfer(DataTransfer {
                kind: TransferKind::ScFirmware | TransferKind::VmrImage,
                ..
            }) => TimeoutClass::Flash,
            Command::Transfer(_) => TimeoutClass::Download,
            _ => TimeoutClass::Control,
        }
    }

    fn payload_words(&self) -> Vec<u32> {
        match self {
            Command::Identify => Vec::new(),
            Command::Transfer(t) => vec![
                lo(t.address),
                hi(t.address),
                t.size,
                (ADDR_TYPE_AP_OFFSET & 0xf) | ((t.flash_type as u32 & 0xf) << 4),
                lo(t.private),
                hi(t.private),
            ],
            Command::LogPage(l) => vec![
                lo(l.address),
                hi(l.address),
                l.size,
                l.offset,
                l.kind.code(),
                0,
            ],
            Command::Clock(c) => {
                let mut words = vec![c.region, c.request as u32, c.count];
                words.extend_from_slice(&c.freqs);
                words
            }
            Command::ClockThrottling(t) => vec![
                (t.action as u32 & 0xff)
                    | (u32::from(t.enable) << 8)
                    | (u32::from(t.power_limit.is_some()) << 9)
                    | (u32::from(t.temp_limit.is_some()) << 10)
                    | (u32::from(t.reset) << 11),
                u32::from(t.power_limit.unwrap_or(0))
                    | (u32::from(t.temp_limit.unwrap_or(0)) << 16),
            ],
            Command::Sensor(s) => vec![
                lo(s.address),
                hi(s.address),
                s.size,
                (s.request as u32 & 0xff)
                    | (u32::from(s.repo_id) << 8)
                    | (u32::from(s.sensor_id) << 16),
            ],
            Command::VmrControl(v) => {
                vec![(v.request as u32 & 0xff) | (u32::from(v.debug_level) << 8)]
            }
        }
    }

    /// Serialise the command as a submission record carrying `cid`.
    pub fn encode(&self, cid: u16) -> Vec<u8> {
        let payload = self.payload_words();
        let count = (payload.len() * 4) as u32;
        let word0 = u32::from(self.opcode().code()) | ((count & 0x7fff) << 16) | ENTRY_NEW;
        let mut record = Vec::with_capacity(SQ_HEADER_SIZE + payload.len() * 4);
        record.extend_from_slice(&word0.to_le_bytes());
        record.extend_from_slice(&u32::from(cid).to_le_bytes());
        for word in payload {
            record.extend_from_slice(&word.to_le_bytes());
        }
        record
    }

    /// Parse a submission record back into its command id and command.
    ///
    /// This is what the firmware side does with a record; the emulator relies on it.
    pub fn decode(record: &[u8]) -> Result<(u16, Command), DecodeError> {
        let words: Vec<u32> = record
            .chunks_exact(4)
            .map(|c| u32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect();
        if words.len() < 2 {
            return Err(DecodeError::Truncated { cid: None });
        }
        let code = (words[0] & 0xffff) as u16;
        let count = ((words[0] >> 16) & 0x7fff) as usize;
        let cid = (words[1] & 0xffff) as u16;
        let opcode = Opcode::from_code(code).ok_or(DecodeError::UnknownOpcode { cid, code })?;
        let p = &words[2..];
        if p.len() * 4 < count {
            return Err(DecodeError::Truncated { cid: Some(cid) });
        }
        let need = |n: usize| {
            if count < n * 4 {
                Err(DecodeError::Truncated { cid: Some(cid) })
            } else {
                Ok(())
            }
        };
        let transfer = |kind| -> Result<Command, DecodeError> {
            need(6)?;
            Ok(Command::Transfer(DataTransfer {
                kind,
                address: join(p[0], p[1]),
                size: p[2],
                flash_type: FlashType::from_code((p[3] >> 4) & 0xf),
                private: join(p[4], p[5]),
            }))
        };
        let command = match opcode {
            Opcode::Identify => Command::Identify,
            Opcode::LoadXclbin => transfer(TransferKind::Xclbin)?,
            Opcode::DownloadPdi => transfer(TransferKind::Pdi)?,
            Opcode::LoadApubin => transfer(TransferKind::ApuBin)?,
            Opcode::ProgramScfw => transfer(TransferKind::ScFirmware)?,
            Opcode::ProgramVmr => transfer(TransferKind::VmrImage)?,
            Opcode::GetLogPage => {
                need(5)?;
                let kind = LogPageKind::from_code(p[4])
                    .ok_or(DecodeError::BadField { cid, field: "pid" })?;
                Command::LogPage(LogPageRequest {
                    kind,
                    address: join(p[0], p[1]),
                    size: p[2],
                    offset: p[3],
                })
            }
            Opcode::Clock => {
                need(3 + MAX_CLOCK_FREQS)?;
                let request = match p[1] {
                    0 => ClockRequest::Get,
                    1 => ClockRequest::Scale,
                    _ => return Err(DecodeError::BadField { cid, field: "req_type" }),
                };
                let mut freqs = [0; MAX_CLOCK_FREQS];
                freqs.copy_from_slice(&p[3..3 + MAX_CLOCK_FREQS]);
                Command::Clock(ClockCommand {
                    request,
                    region: p[0],
                    count: p[2],
                    freqs,
                })
            }
            Opcode::ClkThrottling => {
                need(2)?;
                let action = match p[0] & 0xff {
                    1 => ThrottlingAction::Read,
                    2 => ThrottlingAction::Configure,
                    _ => return Err(DecodeError::BadField { cid, field: "aid" }),
                };
                Command::ClockThrottling(ClockThrottling {
                    action,
                    enable: p[0] & (1 << 8) != 0,
                    power_limit: (p[0] & (1 << 9) != 0).then_some((p[1] & 0xffff) as u16),
                    temp_limit: (p[0] & (1 << 10) != 0).then_some(((p[1] >> 16) & 0xff) as u8),
                    reset: p[0] & (1 << 11) != 0,
                })
            }
            Opcode::Sensor => {
                need(4)?;
                let request = match p[3] & 0xff {
                    1 => SensorRequest::Sdr,
                    2 => SensorRequest::AllSdr,
                    3 => SensorRequest::SingleSdr,
                    _ => return Err(DecodeError::BadField { cid, field: "aid" }),
                };
                Command::Sensor(SensorQuery {
                    request,
                    repo_id: ((p[3] >> 8) & 0xff) as u8,
                    sensor_id: ((p[3] >> 16) & 0xff) as u8,
                    address: join(p[0], p[1]),
                    size: p[2],
                })
            }
            Opcode::VmrControl => {
                need(1)?;
                let request = match p[0] & 0xff {
                    0 => VmrControlRequest::Query,
                    1 => VmrControlRequest::BootDefault,
                    2 => VmrControlRequest::BootBackup,
                    3 => VmrControlRequest::EemiSrst,
                    _ => return Err(DecodeError::BadField { cid, field: "req_type" }),
                };
                Command::VmrControl(VmrControl {
                    request,
                    debug_level: ((p[0] >> 8) & 0xff) as u8,
                })
            }
        };
        Ok((cid, command))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DecodeError {
    #[error("DecodeError::UnknownOpcode: command {cid} carries unknown opcode {code:#x}")]
    UnknownOpcode { cid: u16, code: u16 },
    #[error("DecodeError::Truncated: record for command {cid:?} is shorter than its payload")]
    Truncated { cid: Option<u16> },
    #[error("DecodeError::BadField: command {cid} has an invalid {field}")]
    BadField { cid: u16, field: &'static str },
}

/// A decoded completion record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Completion {
    pub cid: u16,
    pub cstate: u16,
    pub rcode: i32,
    /// The two inline result words, interpreted per opcode.
    pub result: [u32; 2],
}

impl Completion {
    pub fn success(cid: u16, result: [u32; 2]) -> Self {
        Completion {
            cid,
            cstate: 0,
            rcode: 0,
            result,
        }
    }

    pub fn failure(cid: u16, rcode: i32) -> Self {
        Completion {
            cid,
            cstate: 0,
            rcode,
            result: [0; 2],
        }
    }

    pub fn is_success(&self) -> bool {
        self.rcode == 0
    }

    pub fn decode(entry: &[u8; CQ_ENTRY_SIZE]) -> Self {
        let word = |i: usize| {
            u32::from_le_bytes([entry[4 * i], entry[4 * i + 1], entry[4 * i + 2], entry[4 * i + 3]])
        };
        let word0 = word(0);
        Completion {
            cid: (word0 & 0xffff) as u16,
            cstate: ((word0 >> 16) & 0x3fff) as u16,
            rcode: word(3) as i32,
            result: [word(1), word(2)],
        }
    }

    /// Serialise as the device would, with the new flag set.
    pub fn encode(&self) -> [u8; CQ_ENTRY_SIZE] {
        let word0 = u32::from(self.cid) | ((u32::from(self.cstate) & 0x3fff) << 16) | ENTRY_NEW;
        let mut entry = [0u8; CQ_ENTRY_SIZE];
        for (i, word) in [word0, self.result[0], self.result[1], self.rcode as u32]
            .into_iter()
            .enumerate()
        {
            entry[4 * i..4 * i + 4].copy_from_slice(&word.to_le_bytes());
        }
        entry
    }
}
