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

//! DBus proxy interfaces for the xgqd daemon.
//!
//! - **Service Name**: `com.canonical.xgqd`
//! - **Control Interface**: `com.canonical.xgqd.control` at `/com/canonical/xgqd/control`
//! - **Status Interface**: `com.canonical.xgqd.status` at `/com/canonical/xgqd/status`
//!
//! The command handlers ([`load`], [`set`], [`status`]) open a system bus connection and call
//! through these proxies.
//!
//! [`load`]: ../load/index.html
//! [`set`]: ../set/index.html
//! [`status`]: ../status/index.html

pub mod control_proxy;
pub mod status_proxy;
