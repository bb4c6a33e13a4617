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


use crate::LoadSubcommand;
use crate::proxies::control_proxy;
use std::path::Path;
use zbus::Connection;

/// The daemon resolves paths in its own working directory, so send it an absolute one.
fn absolute_path(file: &str) -> Result<String, zbus::Error> {
    let path = std::fs::canonicalize(Path::new(file))
        .map_err(|e| zbus::Error::Failure(format!("Cannot resolve {file}: {e}")))?;
    path.to_str()
        .map(str::to_string)
        .ok_or_else(|| zbus::Error::Failure(format!("{path:?} is not valid unicode")))
}

/// Argument parser for the load command
pub async fn load_handler(sub_command: &LoadSubcommand) -> Result<String, zbus::Error> {
    let connection = Connection::system().await?;
    let proxy = control_proxy::ControlProxy::new(&connection).await?;
    match sub_command {
        LoadSubcommand::Xclbin { file, slot } => {
            proxy.load_xclbin(&absolute_path(file)?, *slot).await
        }
        LoadSubcommand::Pdi { file } => proxy.download_pdi(&absolute_path(file)?).await,
        LoadSubcommand::ApuBin { file } => proxy.download_apu_bin(&absolute_path(file)?).await,
        LoadSubcommand::Vmr { file } => proxy.program_vmr(&absolute_path(file)?).await,
    }
}
