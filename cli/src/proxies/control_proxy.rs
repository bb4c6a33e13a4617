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
    interface = "com.canonical.xgqd.control",
    default_path = "/com/canonical/xgqd/control"
)]
pub trait Control {
    async fn start_services(&self) -> Result<String>;
    async fn stop_services(&self) -> Result<String>;
    async fn restart_services(&self) -> Result<String>;
    async fn load_xclbin(&self, image_path_str: &str, slot: u32) -> Result<String>;
    async fn download_pdi(&self, image_path_str: &str) -> Result<String>;
    async fn download_apu_bin(&self, image_path_str: &str) -> Result<String>;
    async fn program_scfw(&self) -> Result<String>;
    async fn program_vmr(&self, image_path_str: &str) -> Result<String>;
    async fn enable_multiboot(&self, backup: bool) -> Result<String>;
    async fn eemi_srst(&self) -> Result<String>;
    async fn configure_clock_scaling(
        &self,
        enable: bool,
        power_limit: u32,
        temp_limit: u32,
    ) -> Result<String>;
    async fn reset_clock_scaling(&self) -> Result<String>;
    async fn scale_clocks(&self, region: u32, freqs: Vec<u32>) -> Result<String>;
}
