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


use crate::{ServicesAction, SetSubcommand};
use crate::proxies::control_proxy;
use zbus::Connection;

/// Argument parser for the set command
pub async fn set_handler(sub_command: &SetSubcommand) -> Result<String, zbus::Error> {
    let connection = Connection::system().await?;
    let proxy = control_proxy::ControlProxy::new(&connection).await?;
    match sub_command {
        SetSubcommand::Services { action } => match action {
            ServicesAction::Start => proxy.start_services().await,
            ServicesAction::Stop => proxy.stop_services().await,
            ServicesAction::Restart => proxy.restart_services().await,
        },
        SetSubcommand::Multiboot { backup } => proxy.enable_multiboot(*backup).await,
        SetSubcommand::Srst => proxy.eemi_srst().await,
        SetSubcommand::Scfw => proxy.program_scfw().await,
        SetSubcommand::ClockScaling {
            disable,
            power_limit,
            temp_limit,
        } => {
            proxy
                .configure_clock_scaling(
                    !*disable,
                    power_limit.unwrap_or(0),
                    temp_limit.unwrap_or(0),
                )
                .await
        }
        SetSubcommand::ClockScalingDefaults => proxy.reset_clock_scaling().await,
        SetSubcommand::Clocks { region, freqs } => proxy.scale_clocks(*region, freqs.clone()).await,
    }
}
