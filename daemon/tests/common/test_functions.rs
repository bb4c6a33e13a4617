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

use googletest::prelude::*;
use std::fmt::Debug;
use std::sync::Arc;
use std::time::Duration;
use xgqd::config::{ChannelConfig, TimeoutClasses};
use xgqd::emulator::{EmulatorBehaviour, EmulatorLayout, EmulatorTask, VmrEmulator};
use xgqd::error::XgqdError;
use xgqd::xgq::lifecycle::ServiceState;
use xgqd::xgq::service::DeviceChannel;

/// Check a result against either an expected value or an expected error message fragment.
pub fn compare_result<T: PartialEq + Debug>(res: &Result<T, XgqdError>, exp: &Result<T, &str>) {
    match (res, exp) {
        (Ok(res_v), Ok(exp_v)) => {
            assert_that!(res_v, eq(exp_v), "Mismatched value");
        }
        (Err(res_err), Err(exp_err)) => {
            assert_that!(
                res_err.to_string(),
                contains_substring(*exp_err),
                "Mismatched error signature"
            );
        }
        (res, exp) => {
            panic!("Result mismatch: got {res:?}, expected {exp:?}");
        }
    }
}

/// Production semantics on a millisecond scale.
pub fn fast_config() -> ChannelConfig {
    ChannelConfig {
        ready_retries: 20,
        ready_interval: Duration::from_millis(5),
        poll_interval: Duration::from_millis(1),
        health_interval: Duration::from_millis(20),
        drain_interval: Duration::from_millis(5),
        drain_max_passes: 3,
        waiter_grace: Duration::from_millis(500),
        arena_wait: Duration::from_millis(50),
        timeouts: TimeoutClasses {
            control: Duration::from_secs(5),
            download: Duration::from_secs(5),
            flash: Duration::from_secs(5),
        },
        sc_ready_timeout: Duration::from_millis(50),
        sc_ready_interval: Duration::from_millis(5),
        ..Default::default()
    }
}

/// A channel wired to a booted, serving emulator.
pub struct Harness {
    pub emulator: Arc<VmrEmulator>,
    pub channel: Arc<DeviceChannel>,
    task: Option<EmulatorTask>,
}

impl Harness {
    pub fn new(behaviour: EmulatorBehaviour, config: ChannelConfig) -> Self {
        let emulator = VmrEmulator::new(EmulatorLayout::default(), behaviour);
        emulator.boot().expect("emulator failed to boot");
        let task = emulator.serve(Duration::from_millis(1));
        let channel = Arc::new(DeviceChannel::new(
            "test",
            emulator.payload(),
            emulator.regs(),
            config,
        ));
        Harness {
            emulator,
            channel,
            task: Some(task),
        }
    }

    /// Start with default firmware behaviour and the fast config.
    pub async fn running() -> Self {
        Self::started(EmulatorBehaviour::default(), fast_config()).await
    }

    pub async fn started(behaviour: EmulatorBehaviour, config: ChannelConfig) -> Self {
        let harness = Self::new(behaviour, config);
        harness
            .channel
            .start_services()
            .await
            .expect("channel failed to start");
        harness
    }

    /// Wait for the channel to reach `state`, for at most a second.
    pub async fn wait_for_state(&self, state: ServiceState) {
        for _ in 0..200 {
            if self.channel.state() == state {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!(
            "channel stayed {} instead of reaching {state}",
            self.channel.state()
        );
    }

    pub async fn shutdown(mut self) {
        self.channel.stop_services().await;
        if let Some(task) = self.task.take() {
            task.shutdown().await;
        }
    }
}
