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

//! Error types for the XGQ channel and the daemon surfaces above it.
//!
//! Each layer of the command queue has its own small error enum so that callers can match on
//! exactly the failures that layer can produce. [`XgqdError`] wraps all of them for the DBus
//! and CLI facing code, and converts into `zbus::fdo::Error` the same way every other daemon
//! error does: log it, then map it onto the closest DBus error name.

use crate::xgq::arena::RegionKind;
use crate::xgq::record::Opcode;
use log::error;
use std::path::PathBuf;
use std::time::Duration;
use zbus::fdo;

/// A single 32-bit device memory access that could not be carried out.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum AccessError {
    #[error("AccessError::OutOfBounds: access of {len} bytes at {offset:#x} exceeds region of {size:#x} bytes")]
    OutOfBounds { offset: u64, len: u64, size: u64 },
    #[error("AccessError::Unaligned: offset {offset:#x} is not 4-byte aligned")]
    Unaligned { offset: u64 },
}

/// Reasons the host side could not attach to the rings published by the firmware.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AttachError {
    #[error("AttachError::NotReady: firmware did not publish a ready descriptor within {waited:?}")]
    NotReady { waited: Duration },
    #[error("AttachError::BadMagic: expected {expected:#x} but found {found:#x}")]
    BadMagic { expected: u32, found: u32 },
    #[error("AttachError::UnsupportedMajor: ring layout version {major}.{minor} is not supported")]
    UnsupportedMajor { major: u16, minor: u16 },
    #[error("AttachError::BadGeometry: {0}")]
    BadGeometry(String),
    #[error("AttachError::Access: {0}")]
    Access(#[from] AccessError),
}

/// Reasons a command was refused before it reached the submission queue.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SubmitError {
    #[error("SubmitError::Halted: channel is halted, {opcode} was not submitted")]
    Halted { opcode: Opcode },
    #[error("SubmitError::QueueFull: no free submission slot for {opcode}")]
    QueueFull { opcode: Opcode },
    #[error("SubmitError::OutOfIds: every command id is outstanding")]
    OutOfIds,
    #[error("SubmitError::RecordTooLarge: record of {len} bytes does not fit a {slot_size} byte slot")]
    RecordTooLarge { len: usize, slot_size: u32 },
    #[error("SubmitError::Access: {0}")]
    Access(#[from] AccessError),
}

/// Failures while reserving or using a region of the shared arena.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ArenaError {
    #[error("ArenaError::Busy: the {region} region is still held by another operation")]
    Busy { region: RegionKind },
    #[error("ArenaError::TooLarge: {requested} bytes requested but the {region} region holds {available}")]
    TooLarge {
        region: RegionKind,
        requested: u64,
        available: u64,
    },
    #[error("ArenaError::Access: {0}")]
    Access(#[from] AccessError),
}

/// A completion the host cannot reconcile with its outstanding set.
///
/// Any of these means host and device disagree about the queue contents, so the channel is
/// taken offline as soon as one is seen.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProtocolViolation {
    #[error("ProtocolViolation::SentinelId: device completed the reserved id {cid:#x}")]
    SentinelId { cid: u16 },
    #[error("ProtocolViolation::UnknownId: device completed id {cid} which is not outstanding")]
    UnknownId { cid: u16 },
}

#[derive(Debug, thiserror::Error)]
pub enum XgqdError {
    #[error("XgqdError::Argument: {0}")]
    Argument(String),
    #[error("XgqdError::IORead: An IO error occurred when reading from {file:?}: {e}")]
    IORead { file: PathBuf, e: std::io::Error },
    #[error("XgqdError::IOWrite: An IO error occurred when writing to {file:?}: {e}")]
    IOWrite { file: PathBuf, e: std::io::Error },
    #[error("XgqdError::IOMap: Failed to map {file:?}: {e}")]
    IOMap { file: PathBuf, e: std::io::Error },
    #[error("XgqdError::Attach: {0}")]
    Attach(#[from] AttachError),
    #[error("XgqdError::Submit: {0}")]
    Submit(#[from] SubmitError),
    #[error("XgqdError::Arena: {0}")]
    Arena(#[from] ArenaError),
    #[error("XgqdError::Access: {0}")]
    Access(#[from] AccessError),
    #[error("XgqdError::Protocol: {0}")]
    Protocol(#[from] ProtocolViolation),
    #[error("XgqdError::VersionUnsupported: firmware interface {major}.{minor} is not supported, only basic operations are allowed")]
    VersionUnsupported { major: u16, minor: u16 },
    #[error("XgqdError::TimedOut: {opcode} did not complete before its deadline")]
    TimedOut { opcode: Opcode },
    #[error("XgqdError::Aborted: {opcode} was abandoned while the channel stopped")]
    Aborted { opcode: Opcode },
    #[error("XgqdError::Device: {opcode} failed on the device with rcode {rcode}")]
    Device { opcode: Opcode, rcode: i32 },
    #[error("XgqdError::State: {0}")]
    State(String),
    #[error("XgqdError::Internal: An Internal error occurred: {0}")]
    Internal(String),
}

impl From<XgqdError> for fdo::Error {
    fn from(err: XgqdError) -> Self {
        error!("{err}");
        match err {
            XgqdError::Argument(..) => fdo::Error::InvalidArgs(err.to_string()),
            XgqdError::IORead { .. } => fdo::Error::IOError(err.to_string()),
            XgqdError::IOWrite { .. } => fdo::Error::IOError(err.to_string()),
            XgqdError::IOMap { .. } => fdo::Error::IOError(err.to_string()),
            XgqdError::Access(..) => fdo::Error::IOError(err.to_string()),
            XgqdError::TimedOut { .. } => fdo::Error::TimedOut(err.to_string()),
            XgqdError::Arena(ArenaError::Busy { .. }) => fdo::Error::LimitsExceeded(err.to_string()),
            XgqdError::Submit(SubmitError::QueueFull { .. }) => {
                fdo::Error::LimitsExceeded(err.to_string())
            }
            XgqdError::VersionUnsupported { .. } => fdo::Error::NotSupported(err.to_string()),
            _ => fdo::Error::Failed(err.to_string()),
        }
    }
}
