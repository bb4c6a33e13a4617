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

//! XGQ daemon (xgqd) - System service for the management firmware of PCIe FPGA cards.
//!
//! The daemon maps the card's shared payload memory and queue registers, brings up the XGQ
//! channel to the management firmware and serves it over DBus:
//!
//! - **Service Name**: `com.canonical.xgqd`
//! - **Status Interface**: `/com/canonical/xgqd/status` - Read-only queries
//! - **Control Interface**: `/com/canonical/xgqd/control` - Downloads, flashing and service control
//!
//! # Environment Variables
//!
//! - `RUST_LOG` - Controls logging level (`trace`, `debug`, `info`, `warn`, `error`
//!   or `off`). Defaults to `info`
//! - `XGQD_PAYLOAD_RESOURCE` - PCI resource file of the shared payload memory
//! - `XGQD_REGISTER_RESOURCE` - PCI resource file of the queue registers
//! - `XGQD_EMULATE` - Set to `1` to serve an emulated card instead
//!
//! The daemon keeps serving when bring-up fails so that basic operations, reflashing and
//! `restart_services` stay reachable.

use log::{error, info, warn};
use std::env;
use std::error::Error;
use std::path::Path;
use std::sync::Arc;
use xgqd::comm::dbus::{control_interface::ControlInterface, status_interface::StatusInterface};
use xgqd::config::{self, ChannelConfig};
use xgqd::device_memory::{DeviceMemory, MappedRegion};
use xgqd::error::XgqdError;
use xgqd::xgq::service::DeviceChannel;
use zbus::connection;

/// Something that has to live as long as the channel: the emulator task when emulating.
type Keepalive = Option<Box<dyn std::any::Any + Send>>;

fn resource(var: &str) -> Result<Arc<dyn DeviceMemory>, XgqdError> {
    let path = env::var(var)
        .map_err(|_| XgqdError::Argument(format!("{var} must name a PCI resource file")))?;
    Ok(Arc::new(MappedRegion::open(Path::new(&path))?))
}

#[cfg(feature = "emulator")]
fn emulated() -> Result<(Arc<dyn DeviceMemory>, Arc<dyn DeviceMemory>, Keepalive), XgqdError> {
    use xgqd::emulator::{EmulatorBehaviour, EmulatorLayout, VmrEmulator};
    let emulator = VmrEmulator::new(EmulatorLayout::default(), EmulatorBehaviour::default());
    emulator.boot()?;
    let task: Box<dyn std::any::Any + Send> =
        Box::new(emulator.serve(std::time::Duration::from_millis(1)));
    Ok((emulator.payload(), emulator.regs(), Some(task)))
}

#[cfg(not(feature = "emulator"))]
fn emulated() -> Result<(Arc<dyn DeviceMemory>, Arc<dyn DeviceMemory>, Keepalive), XgqdError> {
    Err(XgqdError::Argument(
        "xgqd was built without the emulator feature".into(),
    ))
}

/// Open the channel's memory from the environment.
fn open_memory() -> Result<(Arc<dyn DeviceMemory>, Arc<dyn DeviceMemory>, Keepalive), XgqdError> {
    if env::var(config::EMULATE_ENV).is_ok_and(|v| v == "1") {
        warn!("Serving an emulated card");
        return emulated();
    }
    Ok((
        resource(config::PAYLOAD_RESOURCE_ENV)?,
        resource(config::REGISTER_RESOURCE_ENV)?,
        None,
    ))
}

/// Main entry point for the xgqd daemon.
///
/// Initializes the daemon by:
/// 1. Setting up logging via `env_logger` (defaults to "info" level)
/// 2. Mapping the card, or starting the emulator
/// 3. Starting the XGQ services
/// 4. Connecting to the system DBus and advertising the service
/// 5. Serving until interrupted, then stopping the XGQ services
///
/// # Returns: `Result<(), Box<dyn Error>>`
/// * `Ok(())` - Interrupted and shut down cleanly
/// * `Err(Box<dyn Error>)` - Initialization error (mapping failed, DBus connection failed, etc.)
#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let (payload, regs, _keepalive) = open_memory()?;
    let channel = Arc::new(DeviceChannel::new(
        config::CHANNEL_NAME,
        payload,
        regs,
        ChannelConfig::default(),
    ));
    if let Err(e) = channel.start_services().await {
        error!("{}: bring-up failed: {e}", channel.name());
    }

    let status_interface = StatusInterface {
        channel: channel.clone(),
    };
    let control_interface = ControlInterface {
        channel: channel.clone(),
    };

    let _conn = connection::Builder::system()?
        .name(config::DBUS_SERVICE_NAME)?
        .serve_at(config::DBUS_STATUS_PATH, status_interface)?
        .serve_at(config::DBUS_CONTROL_PATH, control_interface)?
        .build()
        .await?;

    info!("Started {} dbus service", config::DBUS_SERVICE_NAME);
    tokio::signal::ctrl_c().await?;

    info!("Shutting down");
    channel.stop_services().await;
    Ok(())
}
