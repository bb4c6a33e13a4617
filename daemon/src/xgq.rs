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

//! XGQ transport: the command queue between the host and the card's management firmware.
//!
//! The pieces stack bottom-up:
//!
//! - [`record`]: binary layout of submission and completion records
//! - [`ring`]: the shared submission and completion rings and their doorbells
//! - [`descriptor`] and [`vmr_log`]: the firmware's published descriptor and log
//! - [`arena`]: exclusive access to the shared data window for bulk transfers
//! - [`lifecycle`]: command ids, the outstanding set and per-command delivery
//! - [`workers`]: the completion drainer and the health monitor
//! - [`service`]: [`DeviceChannel`](service::DeviceChannel), which ties everything together
//!   and owns the start/halt/stop state machine
//!
//! # Examples
//!
//! ```rust,no_run
//! # use std::sync::Arc;
//! # use xgqd::config::ChannelConfig;
//! # use xgqd::device_memory::MappedRegion;
//! # use xgqd::xgq::service::DeviceChannel;
//! # async fn example() -> Result<(), xgqd::error::XgqdError> {
//! let payload = Arc::new(MappedRegion::open("/sys/bus/pci/devices/0000:c1:00.1/resource2".as_ref())?);
//! let regs = Arc::new(MappedRegion::open("/sys/bus/pci/devices/0000:c1:00.1/resource0".as_ref())?);
//! let channel = DeviceChannel::new("xgq_vmr", payload, regs, ChannelConfig::default());
//! channel.start_services().await?;
//! println!("{:?}", channel.query_status().await?);
//! channel.stop_services().await;
//! # Ok(())
//! # }
//! ```

pub mod arena;
pub mod descriptor;
pub mod lifecycle;
pub mod record;
pub mod ring;
pub mod service;
pub mod vmr_log;
mod workers;

use log::warn;
use std::sync::{Mutex, MutexGuard};

/// Lock a std mutex, carrying on with the data if a previous holder panicked.
pub(crate) fn lock<'a, T>(mutex: &'a Mutex<T>, what: &str) -> MutexGuard<'a, T> {
    mutex.lock().unwrap_or_else(|poisoned| {
        warn!("{what} lock was poisoned, recovering");
        poisoned.into_inner()
    })
}
