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

pub mod control_interface;
pub mod status_interface;

use crate::error::XgqdError;
use crate::system_io::fs_read_bytes;
use crate::xgq::record::{LogPageKind, SensorRequest};
use std::path::Path;

/// Read an image file named by a DBus caller.
pub(crate) fn read_image(image_path_str: &str) -> Result<Vec<u8>, XgqdError> {
    let path = Path::new(image_path_str);
    if !path.exists() || path.is_dir() {
        return Err(XgqdError::Argument(format!(
            "{image_path_str} is not a valid path to an image file."
        )));
    }
    fs_read_bytes(path)
}

pub(crate) fn parse_log_page(name: &str) -> Result<LogPageKind, XgqdError> {
    name.parse().map_err(XgqdError::Argument)
}

pub(crate) fn parse_sensor_request(name: &str) -> Result<SensorRequest, XgqdError> {
    match name {
        "sdr" => Ok(SensorRequest::Sdr),
        "all" => Ok(SensorRequest::AllSdr),
        "single" => Ok(SensorRequest::SingleSdr),
        _ => Err(XgqdError::Argument(format!(
            "Unknown sensor request '{name}', expected one of sdr, all, single"
        ))),
    }
}

/// Render bytes as lowercase hex, the way binary reports travel over the bus.
pub(crate) fn to_hex(data: &[u8]) -> String {
    data.iter().map(|b| format!("{b:02x}")).collect()
}
