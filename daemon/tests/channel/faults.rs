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

use crate::common::test_functions::{Harness, compare_result, fast_config};
use googletest::prelude::*;
use std::time::Duration;
use xgqd::config::{ChannelConfig, TimeoutClasses};
use xgqd::emulator::EmulatorBehaviour;
use xgqd::error::ProtocolViolation;
use xgqd::xgq::lifecycle::ServiceState;
use xgqd::xgq::record::{Completion, LogPageKind, Opcode};
use xgqd::xgq::service::Fault;

fn short_timeouts() -> ChannelConfig {
    ChannelConfig {
        timeouts: TimeoutClasses {
            control: Duration::from_millis(30),
            download: Duration::from_millis(30),
            flash: Duration::from_millis(30),
        },
        ..fast_config()
    }
}

#[gtest]
#[tokio::test]
async fn test_timeout_takes_channel_offline() {
    let harness = Harness::started(EmulatorBehaviour::default(), short_timeouts()).await;
    harness.emulator.log("loading page before the hang").unwrap();
    harness.emulator.update(|b| {
        b.unresponsive.insert(Opcode::GetLogPage);
    });

    compare_result(
        &harness.channel.read_log_page(LogPageKind::Info).await,
        &Err("XgqdError::TimedOut"),
    );
    harness.wait_for_state(ServiceState::Halted).await;

    let diagnostic = harness
        .channel
        .last_diagnostic()
        .expect("no diagnostic was captured");
    assert!(
        matches!(
            diagnostic.fault,
            Fault::Timeout {
                opcode: Opcode::GetLogPage,
                ..
            }
        ),
        "unexpected fault {:?}",
        diagnostic.fault
    );
    expect_that!(
        diagnostic.records.join("\n"),
        contains_substring("loading page before the hang")
    );
    expect_that!(diagnostic.records.first().cloned(), eq(&Some("vmr 1.0 booted".to_string())));

    compare_result(
        &harness.channel.query_status().await.map(|_| ()),
        &Err("SubmitError::Halted"),
    );
    harness.shutdown().await;
}

#[gtest]
#[tokio::test]
async fn test_restart_recovers_from_timeout() {
    let harness = Harness::started(EmulatorBehaviour::default(), short_timeouts()).await;
    harness.emulator.update(|b| {
        b.unresponsive.insert(Opcode::VmrControl);
    });
    compare_result(
        &harness.channel.query_status().await.map(|_| ()),
        &Err("XgqdError::TimedOut"),
    );
    harness.wait_for_state(ServiceState::Halted).await;

    harness.emulator.update(|b| b.unresponsive.clear());
    harness.channel.start_services().await.unwrap();
    expect_that!(harness.channel.state(), eq(ServiceState::Running));
    let res = harness.channel.query_status().await;
    expect_that!(&res, ok(anything()));
    harness.shutdown().await;
}

#[gtest]
#[tokio::test]
async fn test_sentinel_completion_takes_channel_offline() {
    let harness = Harness::running().await;
    harness
        .emulator
        .inject_completion(Completion::success(0xffff, [0, 0]))
        .unwrap();

    let res = harness.channel.query_status().await;
    expect_that!(&res, err(anything()));
    harness.wait_for_state(ServiceState::Halted).await;

    let diagnostic = harness
        .channel
        .last_diagnostic()
        .expect("no diagnostic was captured");
    expect_that!(
        diagnostic.fault,
        eq(&Fault::Protocol(ProtocolViolation::SentinelId { cid: 0xffff }))
    );
    harness.shutdown().await;
}

#[gtest]
#[tokio::test]
async fn test_unknown_completion_takes_channel_offline() {
    let harness = Harness::running().await;
    harness
        .emulator
        .inject_completion(Completion::success(4000, [0, 0]))
        .unwrap();

    let res = harness.channel.clock_scaling_status().await;
    expect_that!(&res, err(anything()));
    harness.wait_for_state(ServiceState::Halted).await;

    let diagnostic = harness
        .channel
        .last_diagnostic()
        .expect("no diagnostic was captured");
    expect_that!(
        diagnostic.fault,
        eq(&Fault::Protocol(ProtocolViolation::UnknownId { cid: 4000 }))
    );
    harness.shutdown().await;
}

#[gtest]
#[tokio::test]
async fn test_clean_stop_captures_no_diagnostic() {
    let harness = Harness::running().await;
    harness.channel.stop_services().await;
    expect_that!(harness.channel.last_diagnostic().is_none(), eq(true));
    harness.shutdown().await;
}
