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

use crate::comm::dbus::{parse_log_page, parse_sensor_request, to_hex};
use crate::xgq::service::DeviceChannel;
use log::info;
use std::sync::Arc;
use zbus::{fdo, interface};

pub struct StatusInterface {
    pub channel: Arc<DeviceChannel>,
}

#[interface(name = "com.canonical.xgqd.status")]
impl StatusInterface {
    async fn get_service_state(&self) -> Result<String, fdo::Error> {
        info!("get_service_state called");
        Ok(self.channel.state().to_string())
    }

    async fn get_version(&self) -> Result<String, fdo::Error> {
        info!("get_version called");
        Ok(self
            .channel
            .version()
            .map(|v| v.to_string())
            .unwrap_or_else(|| "unknown".into()))
    }

    async fn get_vmr_status(&self) -> Result<String, fdo::Error> {
        info!("get_vmr_status called");
        Ok(self.channel.query_status().await?.to_string())
    }

    async fn get_sc_status(&self) -> Result<String, fdo::Error> {
        info!("get_sc_status called");
        let ready = self.channel.sc_status().await?;
        Ok(if ready { "ready" } else { "not ready" }.to_string())
    }

    async fn get_clock_scaling(&self) -> Result<String, fdo::Error> {
        info!("get_clock_scaling called");
        Ok(self.channel.clock_scaling_status().await?.to_string())
    }

    async fn get_clock_frequency(&self, region: u32, clock: u32) -> Result<String, fdo::Error> {
        info!("get_clock_frequency called with region: {region}, clock: {clock}");
        let freq = self.channel.clock_frequency(region, clock).await?;
        Ok(format!("{freq} MHz"))
    }

    async fn get_log_page(&self, page: &str) -> Result<String, fdo::Error> {
        info!("get_log_page called with page: {page}");
        let kind = parse_log_page(page)?;
        let data = self.channel.read_log_page(kind).await?;
        Ok(String::from_utf8_lossy(&data).into_owned())
    }

    async fn check_firewall(&self) -> Result<String, fdo::Error> {
        info!("check_firewall called");
        let report = self.channel.check_firewall().await?;
        if report.tripped {
            Ok(format!("tripped: {}", report.detail))
        } else {
            Ok("clear".to_string())
        }
    }

    async fn get_sensors(
        &self,
        request: &str,
        repo_id: u8,
        sensor_id: u8,
    ) -> Result<String, fdo::Error> {
        info!("get_sensors called with request: {request}, repo_id: {repo_id}, sensor_id: {sensor_id}");
        let request = parse_sensor_request(request)?;
        let report = self
            .channel
            .collect_sensors(request, repo_id, sensor_id)
            .await?;
        Ok(to_hex(&report))
    }

    async fn get_last_diagnostic(&self) -> Result<String, fdo::Error> {
        info!("get_last_diagnostic called");
        Ok(match self.channel.last_diagnostic() {
            Some(snapshot) => {
                let mut out = format!("fault: {}\n", snapshot.fault);
                for record in snapshot.records {
                    out += &record;
                    out.push('\n');
                }
                out
            }
            None => String::new(),
        })
    }
}
