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

//! The service contract every management subdevice offers its parent device.
//!
//! The parent calls [`Subdevice::start_services`] after bring-up or after the card has been
//! reflashed, and [`Subdevice::stop_services`] before a reset or teardown. [`restart`] is the
//! stop-then-start cycle used for live firmware upgrades.

use crate::error::XgqdError;
use crate::xgq::service::{DeviceChannel, DrainReport};
use log::info;
use std::future::Future;

pub trait Subdevice {
    fn name(&self) -> &str;

    fn start_services(&self) -> impl Future<Output = Result<(), XgqdError>> + Send;

    fn stop_services(&self) -> impl Future<Output = DrainReport> + Send;

    /// Only basic operations are available while this is true.
    fn is_halted(&self) -> bool;
}

impl Subdevice for DeviceChannel {
    fn name(&self) -> &str {
        DeviceChannel::name(self)
    }

    fn start_services(&self) -> impl Future<Output = Result<(), XgqdError>> + Send {
        DeviceChannel::start_services(self)
    }

    fn stop_services(&self) -> impl Future<Output = DrainReport> + Send {
        DeviceChannel::stop_services(self)
    }

    fn is_halted(&self) -> bool {
        DeviceChannel::is_halted(self)
    }
}

/// Stop a subdevice and start it again.
///
/// # Returns: `Result<DrainReport, XgqdError>`
/// * `Ok(DrainReport)` - How the stop drained, the subdevice is running again
/// * `Err(XgqdError)` - The start failed, see [`Subdevice::start_services`]
pub async fn restart<S: Subdevice + Sync>(subdevice: &S) -> Result<DrainReport, XgqdError> {
    info!("{}: restarting services", subdevice.name());
    let report = subdevice.stop_services().await;
    subdevice.start_services().await?;
    Ok(report)
}
