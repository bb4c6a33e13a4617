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

//! Management firmware operations built on the XGQ channel.
//!
//! Each operation here builds one command, moves any bulk data through the shared arena, and
//! interprets the inline result words of the completion. Images and reports larger than an
//! arena region are refused rather than split.
//!
//! # Examples
//!
//! ```rust,no_run
//! # use xgqd::xgq::service::DeviceChannel;
//! # use xgqd::xgq::record::LogPageKind;
//! # async fn example(channel: &DeviceChannel) -> Result<(), xgqd::error::XgqdError> {
//! let status = channel.query_status().await?;
//! if status.has_ext_scfw {
//!     channel.wait_for_sc_ready().await?;
//! }
//! let uuid = channel.read_log_page(LogPageKind::ShellInterfaceUuid).await?;
//! # Ok(())
//! # }
//! ```

use crate::error::XgqdError;
use crate::xgq::arena::ArenaPermit;
use crate::xgq::record::{
    ClockCommand, ClockRequest, ClockThrottling, Command, DataTransfer, LogPageKind,
    LogPageRequest, MAX_CLOCK_FREQS, SensorQuery, SensorRequest, ThrottlingAction, TransferKind,
    VmrControl, VmrControlRequest,
};
use crate::xgq::service::DeviceChannel;
use log::{debug, info, trace, warn};
use std::fmt;
use tokio::time::{Instant, sleep};

pub use crate::xgq::record::FlashType;

/// Interface version reported by the identify handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct VmrVersion {
    pub major: u16,
    pub minor: u16,
}

impl VmrVersion {
    fn from_word(word: u32) -> Self {
        VmrVersion {
            minor: (word & 0xffff) as u16,
            major: (word >> 16) as u16,
        }
    }

    pub fn to_word(self) -> u32 {
        u32::from(self.minor) | (u32::from(self.major) << 16)
    }
}

impl fmt::Display for VmrVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.major, self.minor)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct VmrStatus {
    pub boot_on_default: bool,
    pub boot_on_backup: bool,
    pub boot_on_recovery: bool,
    pub has_fpt: bool,
    pub has_ext_scfw: bool,
    pub sc_is_ready: bool,
    pub ps_is_ready: bool,
    /// Progress of the current flash operation, in percent.
    pub program_progress: u32,
}

impl VmrStatus {
    pub const BOOT_ON_DEFAULT: u32 = 1 << 0;
    pub const BOOT_ON_BACKUP: u32 = 1 << 1;
    pub const BOOT_ON_RECOVERY: u32 = 1 << 2;
    pub const HAS_FPT: u32 = 1 << 3;
    pub const HAS_EXT_SCFW: u32 = 1 << 4;
    pub const SC_IS_READY: u32 = 1 << 5;
    pub const PS_IS_READY: u32 = 1 << 6;

    pub fn from_result(result: [u32; 2]) -> Self {
        let bits = result[0];
        VmrStatus {
            boot_on_default: bits & Self::BOOT_ON_DEFAULT != 0,
            boot_on_backup: bits & Self::BOOT_ON_BACKUP != 0,
            boot_on_recovery: bits & Self::BOOT_ON_RECOVERY != 0,
            has_fpt: bits & Self::HAS_FPT != 0,
            has_ext_scfw: bits & Self::HAS_EXT_SCFW != 0,
            sc_is_ready: bits & Self::SC_IS_READY != 0,
            ps_is_ready: bits & Self::PS_IS_READY != 0,
            program_progress: result[1],
        }
    }

    pub fn to_result(self) -> [u32; 2] {
        let mut bits = 0;
        for (set, bit) in [
            (self.boot_on_default, Self::BOOT_ON_DEFAULT),
            (self.boot_on_backup, Self::BOOT_ON_BACKUP),
            (self.boot_on_recovery, Self::BOOT_ON_RECOVERY),
            (self.has_fpt, Self::HAS_FPT),
            (self.has_ext_scfw, Self::HAS_EXT_SCFW),
            (self.sc_is_ready, Self::SC_IS_READY),
            (self.ps_is_ready, Self::PS_IS_READY),
        ] {
            if set {
                bits |= bit;
            }
        }
        [bits, self.program_progress]
    }
}

impl fmt::Display for VmrStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "boot_on_default: {}", u8::from(self.boot_on_default))?;
        writeln!(f, "boot_on_backup: {}", u8::from(self.boot_on_backup))?;
        writeln!(f, "boot_on_recovery: {}", u8::from(self.boot_on_recovery))?;
        writeln!(f, "has_fpt: {}", u8::from(self.has_fpt))?;
        writeln!(f, "has_ext_scfw: {}", u8::from(self.has_ext_scfw))?;
        writeln!(f, "sc_is_ready: {}", u8::from(self.sc_is_ready))?;
        writeln!(f, "ps_is_ready: {}", u8::from(self.ps_is_ready))?;
        write!(f, "program_progress: {}", self.program_progress)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ClockScalingStatus {
    pub supported: bool,
    pub enabled: bool,
    pub power_override: bool,
    pub temp_override: bool,
    pub power_limit: u16,
    pub temp_limit: u8,
}

impl ClockScalingStatus {
    pub fn from_result(result: [u32; 2]) -> Self {
        ClockScalingStatus {
            supported: result[0] & 0x1 != 0,
            enabled: result[0] & 0x2 != 0,
            power_override: result[0] & 0x4 != 0,
            temp_override: result[0] & 0x8 != 0,
            power_limit: (result[1] & 0xffff) as u16,
            temp_limit: ((result[1] >> 16) & 0xff) as u8,
        }
    }

    pub fn to_result(self) -> [u32; 2] {
        [
            u32::from(self.supported)
                | (u32::from(self.enabled) << 1)
                | (u32::from(self.power_override) << 2)
                | (u32::from(self.temp_override) << 3),
            u32::from(self.power_limit) | (u32::from(self.temp_limit) << 16),
        ]
    }
}

impl fmt::Display for ClockScalingStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "has_clk_scaling: {}", u8::from(self.supported))?;
        writeln!(f, "clk_scaling_en: {}", u8::from(self.enabled))?;
        writeln!(f, "pwr_scaling_ovrd_limit: {}", self.power_limit)?;
        write!(f, "temp_scaling_ovrd_limit: {}", self.temp_limit)
    }
}

/// Result of the accelerator firewall check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FirewallReport {
    pub tripped: bool,
    pub detail: String,
}

fn byte_len(data: &[u8]) -> Result<u32, XgqdError> {
    u32::try_from(data.len())
        .map_err(|_| XgqdError::Argument(format!("{} bytes do not fit one transfer", data.len())))
}

impl DeviceChannel {
    /// Identify handshake. A basic operation, so it works while attaching or halted.
    pub async fn identify(&self) -> Result<VmrVersion, XgqdError> {
        let completion = self.execute(&Command::Identify).await?;
        let version = VmrVersion::from_word(completion.result[0]);
        debug!("{}: firmware reports interface {version}", self.name());
        Ok(version)
    }

    async fn transfer(
        &self,
        kind: TransferKind,
        image: &[u8],
        private: u64,
    ) -> Result<(), XgqdError> {
        if image.is_empty() {
            return Err(XgqdError::Argument(format!("{kind:?} image is empty")));
        }
        let size = byte_len(image)?;
        let permit: ArenaPermit = self.acquire_data().await?;
        permit.write(0, image)?;
        trace!(
            "{}: staged {size} bytes of {kind:?} at {:#x}",
            self.name(),
            permit.address()
        );
        let command = Command::Transfer(DataTransfer {
            kind,
            address: permit.address(),
            size,
            flash_type: self.config().flash_type,
            private,
        });
        self.execute(&command).await?;
        permit.release();
        Ok(())
    }

    /// Download an xclbin into `slot`.
    pub async fn load_xclbin(&self, image: &[u8], slot: u32) -> Result<(), XgqdError> {
        info!("{}: loading xclbin of {} bytes into slot {slot}", self.name(), image.len());
        self.transfer(TransferKind::Xclbin, image, u64::from(slot)).await
    }

    pub async fn download_pdi(&self, image: &[u8]) -> Result<(), XgqdError> {
        info!("{}: downloading pdi of {} bytes", self.name(), image.len());
        self.transfer(TransferKind::Pdi, image, 0).await
    }

    pub async fn download_apu_bin(&self, image: &[u8]) -> Result<(), XgqdError> {
        info!("{}: downloading apu image of {} bytes", self.name(), image.len());
        self.transfer(TransferKind::ApuBin, image, 0).await
    }

    /// Ask the firmware to flash the satellite controller from the image it already holds.
    ///
    /// No data is staged. The request carries a zero address and size, so it does not wait
    /// on the data region.
    pub async fn program_scfw(&self) -> Result<(), XgqdError> {
        info!("{}: programming sc firmware", self.name());
        let command = Command::Transfer(DataTransfer {
            kind: TransferKind::ScFirmware,
            address: 0,
            size: 0,
            flash_type: self.config().flash_type,
            private: 0,
        });
        self.execute(&command).await?;
        Ok(())
    }

    /// Flash a new management firmware image. Admitted even while the channel is halted.
    pub async fn program_vmr(&self, image: &[u8]) -> Result<(), XgqdError> {
        info!("{}: programming vmr image of {} bytes", self.name(), image.len());
        self.transfer(TransferKind::VmrImage, image, 0).await
    }

    /// Read one chunk of a log page.
    ///
    /// # Arguments
    ///
    /// * `kind` - Which page to read
    /// * `offset` - Byte offset into the page
    /// * `len` - Maximum bytes wanted, clipped to the log region
    ///
    /// # Returns: `Result<Vec<u8>, XgqdError>`
    /// * `Ok(Vec<u8>)` - What the firmware returned, possibly shorter than `len`
    /// * `Err(XgqdError)` - The command failed or the log region stayed busy
    pub async fn get_log_page(
        &self,
        kind: LogPageKind,
        offset: u32,
        len: u32,
    ) -> Result<Vec<u8>, XgqdError> {
        let permit = self.acquire_log().await?;
        let size = u64::from(len).min(permit.len()) as u32;
        let command = Command::LogPage(LogPageRequest {
            kind,
            address: permit.address(),
            size,
            offset,
        });
        let completion = self.execute(&command).await?;
        let count = completion.result[0].min(size);
        let data = permit.read(0, u64::from(count))?;
        permit.release();
        Ok(data)
    }

    /// Read a whole log page, chunk by chunk, until the firmware returns a short chunk.
    pub async fn read_log_page(&self, kind: LogPageKind) -> Result<Vec<u8>, XgqdError> {
        let chunk = crate::xgq::arena::LOG_PAGE_SIZE as u32;
        let mut page = Vec::new();
        loop {
            let offset = byte_len(&page)?;
            let data = self.get_log_page(kind, offset, chunk).await?;
            let done = (data.len() as u32) < chunk;
            page.extend_from_slice(&data);
            if done {
                return Ok(page);
            }
        }
    }

    async fn vmr_control(&self, request: VmrControlRequest) -> Result<[u32; 2], XgqdError> {
        let completion = self
            .execute(&Command::VmrControl(VmrControl {
                request,
                debug_level: 0,
            }))
            .await?;
        Ok(completion.result)
    }

    pub async fn query_status(&self) -> Result<VmrStatus, XgqdError> {
        Ok(VmrStatus::from_result(
            self.vmr_control(VmrControlRequest::Query).await?,
        ))
    }

    /// Select which flash partition the card boots from next.
    pub async fn enable_multiboot(&self, backup: bool) -> Result<(), XgqdError> {
        let request = if backup {
            VmrControlRequest::BootBackup
        } else {
            VmrControlRequest::BootDefault
        };
        self.vmr_control(request).await.map(|_| ())
    }

    /// Request a system reset of the processing system through the firmware.
    pub async fn eemi_srst(&self) -> Result<(), XgqdError> {
        warn!("{}: requesting processing system reset", self.name());
        self.vmr_control(VmrControlRequest::EemiSrst).await.map(|_| ())
    }

    pub async fn sc_status(&self) -> Result<bool, XgqdError> {
        Ok(self.query_status().await?.sc_is_ready)
    }

    /// Poll until the satellite controller reports ready, within the configured bound.
    pub async fn wait_for_sc_ready(&self) -> Result<(), XgqdError> {
        let deadline = Instant::now() + self.config().sc_ready_timeout;
        loop {
            let status = self.query_status().await?;
            if !status.has_ext_scfw || status.sc_is_ready {
                return Ok(());
            }
            if Instant::now() >= deadline {
                return Err(XgqdError::Internal(format!(
                    "satellite controller not ready after {:?}",
                    self.config().sc_ready_timeout
                )));
            }
            sleep(self.config().sc_ready_interval).await;
        }
    }

    pub async fn check_firewall(&self) -> Result<FirewallReport, XgqdError> {
        let detail = self
            .get_log_page(LogPageKind::AfCheck, 0, crate::xgq::arena::LOG_PAGE_SIZE as u32)
            .await?;
        Ok(FirewallReport {
            tripped: !detail.is_empty(),
            detail: String::from_utf8_lossy(&detail).trim_end_matches('\0').to_string(),
        })
    }

    async fn clock_throttling(&self, throttling: ClockThrottling) -> Result<[u32; 2], XgqdError> {
        Ok(self
            .execute(&Command::ClockThrottling(throttling))
            .await?
            .result)
    }

    /// Enable or disable clock scaling, optionally overriding its power and temperature limits.
    pub async fn configure_clock_scaling(
        &self,
        enable: bool,
        power_limit: Option<u16>,
        temp_limit: Option<u8>,
    ) -> Result<(), XgqdError> {
        self.clock_throttling(ClockThrottling {
            action: ThrottlingAction::Configure,
            reset: false,
            enable,
            power_limit,
            temp_limit,
        })
        .await
        .map(|_| ())
    }

    pub async fn clock_scaling_status(&self) -> Result<ClockScalingStatus, XgqdError> {
        Ok(ClockScalingStatus::from_result(
            self.clock_throttling(ClockThrottling {
                action: ThrottlingAction::Read,
                reset: false,
                enable: false,
                power_limit: None,
                temp_limit: None,
            })
            .await?,
        ))
    }

    /// Put clock scaling back to its firmware defaults.
    pub async fn reset_clock_scaling(&self) -> Result<(), XgqdError> {
        self.clock_throttling(ClockThrottling {
            action: ThrottlingAction::Configure,
            reset: true,
            enable: false,
            power_limit: None,
            temp_limit: None,
        })
        .await
        .map(|_| ())
    }

    /// Set the frequencies, in MHz, of the clocks in `region`.
    pub async fn scale_clocks(&self, region: u32, freqs: &[u32]) -> Result<(), XgqdError> {
        if freqs.is_empty() || freqs.len() > MAX_CLOCK_FREQS {
            return Err(XgqdError::Argument(format!(
                "between 1 and {MAX_CLOCK_FREQS} clock frequencies are required, got {}",
                freqs.len()
            )));
        }
        let mut padded = [0; MAX_CLOCK_FREQS];
        padded[..freqs.len()].copy_from_slice(freqs);
        self.execute(&Command::Clock(ClockCommand {
            request: ClockRequest::Scale,
            region,
            count: freqs.len() as u32,
            freqs: padded,
        }))
        .await
        .map(|_| ())
    }

    /// Read the current frequency of one clock, in MHz.
    ///
    /// # Arguments
    ///
    /// * `region` - Clock region
    /// * `clock` - Index of the clock in the region, below `MAX_CLOCK_FREQS`
    pub async fn clock_frequency(&self, region: u32, clock: u32) -> Result<u32, XgqdError> {
        if clock as usize >= MAX_CLOCK_FREQS {
            return Err(XgqdError::Argument(format!(
                "clock index {clock} is out of range, a region has {MAX_CLOCK_FREQS} clocks"
            )));
        }
        let completion = self
            .execute(&Command::Clock(ClockCommand {
                request: ClockRequest::Get,
                region,
                count: clock,
                freqs: [0; MAX_CLOCK_FREQS],
            }))
            .await?;
        trace!(
            "{}: clock {clock} of region {region} runs at {} MHz",
            self.name(),
            completion.result[0]
        );
        Ok(completion.result[0])
    }

    /// Fetch a sensor data record report. The firmware fills the log region and returns the
    /// report length inline.
    pub async fn collect_sensors(
        &self,
        request: SensorRequest,
        repo_id: u8,
        sensor_id: u8,
    ) -> Result<Vec<u8>, XgqdError> {
        let permit = self.acquire_log().await?;
        let size = permit.len() as u32;
        let completion = self
            .execute(&Command::Sensor(SensorQuery {
                request,
                repo_id,
                sensor_id,
                address: permit.address(),
                size,
            }))
            .await?;
        let data = permit.read(0, u64::from(completion.result[0].min(size)))?;
        permit.release();
        Ok(data)
    }
}
