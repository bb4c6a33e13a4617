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


use crate::StatusSubcommand;
use crate::proxies::status_proxy;
use zbus::Connection;

async fn status_proxy() -> Result<status_proxy::StatusProxy<'static>, zbus::Error> {
    let connection = Connection::system().await?;
    status_proxy::StatusProxy::new(&connection).await
}

/// Service state, interface version and firmware status as one report
async fn get_full_status_message() -> Result<String, zbus::Error> {
    let proxy = status_proxy().await?;
    let state = proxy.get_service_state().await?;
    let version = proxy.get_version().await?;
    let mut ret_string = format!(
        "---- SERVICE ----\n\
        | state | version |\n\
        | {state} | {version} |\n"
    );
    // firmware queries are refused while the channel is not running
    if state == "running" {
        ret_string += "\n---- VMR ----\n";
        ret_string += &proxy.get_vmr_status().await?;
        ret_string += "\n\n---- CLOCK SCALING ----\n";
        ret_string += &proxy.get_clock_scaling().await?;
        ret_string.push('\n');
    }
    Ok(ret_string)
}

/// Argument parser for the status command
pub async fn status_handler(sub_command: &Option<StatusSubcommand>) -> Result<String, zbus::Error> {
    let Some(sub_command) = sub_command else {
        return get_full_status_message().await;
    };
    let proxy = status_proxy().await?;
    match sub_command {
        StatusSubcommand::Vmr => proxy.get_vmr_status().await,
        StatusSubcommand::Sc => proxy.get_sc_status().await,
        StatusSubcommand::ClockScaling => proxy.get_clock_scaling().await,
        StatusSubcommand::Clock { region, clock } => {
            proxy.get_clock_frequency(*region, *clock).await
        }
        StatusSubcommand::LogPage { page } => proxy.get_log_page(page).await,
        StatusSubcommand::Firewall => proxy.check_firewall().await,
        StatusSubcommand::Diagnostic => proxy.get_last_diagnostic().await,
    }
}
