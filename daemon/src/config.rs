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

use crate::vmr::{FlashType, VmrVersion};
use std::time::Duration;

/// The well-known bus name the daemon claims on the system bus.
pub static DBUS_SERVICE_NAME: &str = "com.canonical.xgqd";

/// Object path of the read-only status interface.
pub static DBUS_STATUS_PATH: &str = "/com/canonical/xgqd/status";

/// Object path of the control interface.
pub static DBUS_CONTROL_PATH: &str = "/com/canonical/xgqd/control";

/// Name of the environment variable holding the PCI resource file that maps the shared payload
/// memory, e.g. `/sys/bus/pci/devices/0000:c1:00.0/resource2`.
pub static PAYLOAD_RESOURCE_ENV: &str = "XGQD_PAYLOAD_RESOURCE";

/// Name of the environment variable holding the PCI resource file that maps the queue doorbell
/// registers.
pub static REGISTER_RESOURCE_ENV: &str = "XGQD_REGISTER_RESOURCE";

/// When set to `1` the daemon serves an in-process firmware emulator instead of real hardware.
pub static EMULATE_ENV: &str = "XGQD_EMULATE";

/// Name given to the single channel the daemon manages.
pub static CHANNEL_NAME: &str = "xgq_vmr";

/// Firmware interface versions this host understands. Anything else only gets basic operations.
pub static SUPPORTED_VERSIONS: &[VmrVersion] = &[VmrVersion { major: 1, minor: 0 }];

/// Deadline for commands that only touch firmware state.
pub static CONTROL_TIMEOUT: Duration = Duration::from_secs(30);

/// Deadline for commands that move an image into device memory.
pub static DOWNLOAD_TIMEOUT: Duration = Duration::from_secs(300);

/// Deadline for commands that write flash.
pub static FLASH_TIMEOUT: Duration = Duration::from_secs(600);

/// How often the health monitor scans the outstanding set for expired commands.
pub static HEALTH_INTERVAL: Duration = Duration::from_secs(10);

/// Sleep between passes while draining outstanding commands on stop.
pub static DRAIN_INTERVAL: Duration = Duration::from_secs(1);

/// Passes before every remaining outstanding command is force-expired.
pub static DRAIN_MAX_PASSES: u32 = 30;

/// Completion poll cadence while commands are outstanding and interrupts are not in use.
pub static POLL_INTERVAL: Duration = Duration::from_millis(1);

pub static READY_RETRIES: u32 = 100;
pub static READY_INTERVAL: Duration = Duration::from_millis(100);

/// How long a caller may wait for an arena region before giving up with `Busy`.
pub static ARENA_WAIT: Duration = Duration::from_secs(60);

/// Concurrent holders allowed per arena region.
pub static ARENA_PERMITS: usize = 1;

/// Extra time a waiter gives the health monitor before resolving its own command as timed out.
pub static WAITER_GRACE: Duration = Duration::from_secs(30);

pub static SC_READY_TIMEOUT: Duration = Duration::from_secs(200);
pub static SC_READY_INTERVAL: Duration = Duration::from_secs(1);

/// Deadlines per class of command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeoutClasses {
    pub control: Duration,
    pub download: Duration,
    pub flash: Duration,
}

impl Default for TimeoutClasses {
    fn default() -> Self {
        TimeoutClasses {
            control: CONTROL_TIMEOUT,
            download: DOWNLOAD_TIMEOUT,
            flash: FLASH_TIMEOUT,
        }
    }
}

/// Everything tunable about one channel.
///
/// `Default` gives the production values above. Tests shrink the intervals so a full
/// start/fault/stop cycle runs in milliseconds against the emulator.
#[derive(Debug, Clone)]
pub struct ChannelConfig {
    pub ready_retries: u32,
    pub ready_interval: Duration,
    /// Poll the completion queue instead of waiting for interrupts.
    pub polling: bool,
    pub poll_interval: Duration,
    pub health_interval: Duration,
    pub drain_interval: Duration,
    pub drain_max_passes: u32,
    pub waiter_grace: Duration,
    pub arena_wait: Duration,
    pub arena_permits: usize,
    pub timeouts: TimeoutClasses,
    pub supported_versions: Vec<VmrVersion>,
    pub flash_type: FlashType,
    pub sc_ready_timeout: Duration,
    pub sc_ready_interval: Duration,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        ChannelConfig {
            ready_retries: READY_RETRIES,
            ready_interval: READY_INTERVAL,
            polling: true,
            poll_interval: POLL_INTERVAL,
            health_interval: HEALTH_INTERVAL,
            drain_interval: DRAIN_INTERVAL,
            drain_max_passes: DRAIN_MAX_PASSES,
            waiter_grace: WAITER_GRACE,
            arena_wait: ARENA_WAIT,
            arena_permits: ARENA_PERMITS,
            timeouts: TimeoutClasses::default(),
            supported_versions: SUPPORTED_VERSIONS.to_vec(),
            flash_type: FlashType::Default,
            sc_ready_timeout: SC_READY_TIMEOUT,
            sc_ready_interval: SC_READY_INTERVAL,
        }
    }
}
