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

use crate::comm::dbus::read_image;
use crate::error::XgqdError;
use crate::subdev;
use crate::xgq::service::DeviceChannel;
use log::info;
use std::sync::Arc;
use zbus::{fdo, interface};

/// Limits arrive as `u32` on the bus with 0 meaning "leave at the firmware default".
fn optional_limit<T: TryFrom<u32>>(name: &str, value: u32) -> Result<Option<T>, XgqdError> {
    if value == 0 {
        return Ok(None);
    }
    T::try_from(value)
        .map(Some)
        .map_err(|_| XgqdError::Argument(format!("{name} {value} is out of range")))
}

pub struct ControlInterface {
    pub channel: Arc<DeviceChannel>,
}

#[interface(name = "com.canonical.xgqd.control")]
impl ControlInterface {
    async fn start_services(&self) -> Result<String, fdo::Error> {
        info!("start_services called");
        self.channel.start_services().await?;
        Ok(format!("{} is {}", self.channel.name(), self.channel.state()))
    }

    async fn stop_services(&self) -> Result<String, fdo::Error> {
        info!("stop_services called");
        let report = self.channel.stop_services().await;
        Ok(format!("{} stopped: {report}", self.channel.name()))
    }

    async fn restart_services(&self) -> Result<String, fdo::Error> {
        info!("restart_services called");
        let report = subdev::restart(self.channel.as_ref()).await?;
        Ok(format!("{} restarted: {report}", self.channel.name()))
    }

    async fn load_xclbin(&self, image_path_str: &str, slot: u32) -> Result<String, fdo::Error> {
        info!("load_xclbin called with path: {image_path_str} and slot: {slot}");
        let image = read_image(image_path_str)?;
        self.channel.load_xclbin(&image, slot).await?;
        Ok(format!("{image_path_str} loaded into slot {slot}"))
    }

    async fn download_pdi(&self, image_path_str: &str) -> Result<String, fdo::Error> {
        info!("download_pdi called with path: {image_path_str}");
        let image = read_image(image_path_str)?;
        self.channel.download_pdi(&image).await?;
        Ok(format!("{image_path_str} downloaded"))
    }

    async fn download_apu_bin(&self, image_path_str: &str) -> Result<String, fdo::Error> {
        info!("download_apu_bin called with path: {image_path_str}");
        let image = read_image(image_path_str)?;
        self.channel.download_apu_bin(&image).await?;
        Ok(format!("{image_path_str} downloaded"))
    }

    async fn program_scfw(&self) -> Result<String, fdo::Error> {
        info!("program_scfw called");
        self.channel.program_scfw().await?;
        self.channel.wait_for_sc_ready().await?;
        Ok("Satellite controller firmware programmed".to_string())
    }

    async fn program_vmr(&self, image_path_str: &str) -> Result<String, fdo::Error> {
        info!("program_vmr called with path: {image_path_str}");
        let image = read_image(image_path_str)?;
        self.channel.program_vmr(&image).await?;
        Ok(format!(
            "{image_path_str} programmed, restart services to run it"
        ))
    }

    async fn enable_multiboot(&self, backup: bool) -> Result<String, fdo::Error> {
        info!("enable_multiboot called with backup: {backup}");
        self.channel.enable_multiboot(backup).await?;
        let partition = if backup { "backup" } else { "default" };
        Ok(format!("Next boot uses the {partition} partition"))
    }

    async fn eemi_srst(&self) -> Result<String, fdo::Error> {
        info!("eemi_srst called");
        self.channel.eemi_srst().await?;
        Ok("Processing system reset requested".to_string())
    }

    async fn configure_clock_scaling(
        &self,
        enable: bool,
        power_limit: u32,
        temp_limit: u32,
    ) -> Result<String, fdo::Error> {
        info!(
            "configure_clock_scaling called with enable: {enable}, power_limit: {power_limit}, temp_limit: {temp_limit}"
        );
        let power_limit = optional_limit::<u16>("power limit", power_limit)?;
        let temp_limit = optional_limit::<u8>("temperature limit", temp_limit)?;
        self.channel
            .configure_clock_scaling(enable, power_limit, temp_limit)
            .await?;
        Ok(self.channel.clock_scaling_status().await?.to_string())
    }

    async fn reset_clock_scaling(&self) -> Result<String, fdo::Error> {
        info!("reset_clock_scaling called");
        self.channel.reset_clock_scaling().await?;
        Ok(self.channel.clock_scaling_status().await?.to_string())
    }

    async fn scale_clocks(&self, region: u32, freqs: Vec<u32>) -> Result<String, fdo::Error> {
        info!("scale_clocks called with region: {region} and freqs: {freqs:?}");
        self.channel.scale_clocks(region, &freqs).await?;
        Ok(format!("Clocks of region {region} set to {freqs:?} MHz"))
    }
}
