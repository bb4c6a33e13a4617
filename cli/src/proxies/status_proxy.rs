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

use zbus::{Result, proxy};
#[proxy(
    default_service = "com.canonical.xgqd",
    interface = "com.canonical.xgqd.status",
    default_path = "/com/canonical/xgqd/status"
)]
pub trait Status {
    async fn get_service_state(&self) -> Result<String>;
    async fn get_version(&self) -> Result<String>;
    async fn get_vmr_status(&self) -> Result<String>;
    async fn get_sc_status(&self) -> Result<String>;
    async fn get_clock_scaling(&self) -> Result<String>;
    async fn get_clock_frequency(&self, region: u32, clock: u32) -> Result<String>;
    async fn get_log_page(&self, page: &str) -> Result<String>;
    async fn check_firewall(&self) -> Result<String>;
    async fn get_last_diagnostic(&self) -> Result<String>;
}
