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

//! Host-side service for the XGQ command queue of PCIe FPGA accelerator cards.
//!
//! The card's management firmware is reached through a pair of rings in shared device memory.
//! This crate implements the host end of that transport and the operations built on it:
//!
//! - [`device_memory`]: the only place device memory is touched
//! - [`xgq`]: rings, descriptor, arena, command lifecycle, workers and the channel itself
//! - [`vmr`]: management operations such as image downloads, log pages and clock scaling
//! - [`subdev`]: the start/stop contract a parent device drives
//! - [`comm`]: the DBus interfaces the `xgqd` daemon serves
//! - [`emulator`] (feature `emulator`): an in-process firmware stand-in

pub mod comm;
pub mod config;
pub mod device_memory;
#[cfg(feature = "emulator")]
pub mod emulator;
pub mod error;
pub mod subdev;
pub mod system_io;
pub mod vmr;
pub mod xgq;
