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
use rstest::*;
use std::time::Duration;
use xgqd::config::ChannelConfig;
use xgqd::emulator::{EmulatorBehaviour, EmulatorLayout, VmrEmulator};
use xgqd::error::{AttachError, SubmitError, XgqdError};
use xgqd::subdev;
use xgqd::vmr::VmrVersion;
use xgqd::xgq::lifecycle::{CommandOutcome, ServiceState};
use xgqd::xgq::record::{
    Command, LogPageKind, LogPageRequest, Opcode, TransferKind, VmrControl, VmrControlRequest,
};
use xgqd::xgq::service::{DeviceChannel, DrainReport};

fn log_page_command() -> Command {
    Command::LogPage(LogPageRequest {
        kind: LogPageKind::Info,
        address: 0,
        size: 0,
        offset: 0,
    })
}

#[gtest]
#[tokio::test]
async fn test_start_reports_version() {
    let harness = Harness::running().await;
    expect_that!(harness.channel.state(), eq(ServiceState::Running));
    expect_that!(
        harness.channel.version(),
        eq(Some(VmrVersion { major: 1, minor: 0 }))
    );
    expect_that!(harness.channel.is_halted(), eq(false));
    let received = harness.emulator.received();
    expect_that!(received.len(), eq(1));
    expect_that!(received[0].command, eq(Command::Identify));
    harness.shutdown().await;
}

#[gtest]
#[tokio::test]
async fn test_start_twice_is_a_no_op() {
    let harness = Harness::running().await;
    harness.channel.start_services().await.unwrap();
    expect_that!(harness.emulator.received().len(), eq(1));
    harness.shutdown().await;
}

#[gtest]
#[tokio::test]
async fn test_start_without_firmware_is_not_ready() {
    let emulator = VmrEmulator::new(EmulatorLayout::default(), EmulatorBehaviour::default());
    let config = ChannelConfig {
        ready_retries: 3,
        ..fast_config()
    };
    let channel = DeviceChannel::new("test", emulator.payload(), emulator.regs(), config);
    let res = channel.start_services().await;
    assert!(
        matches!(res, Err(XgqdError::Attach(AttachError::NotReady { .. }))),
        "unexpected result {res:?}"
    );
    expect_that!(channel.state(), eq(ServiceState::Uninitialized));
    expect_that!(channel.version(), eq(None));
}

#[gtest]
#[tokio::test]
#[rstest]
#[case::current(1, 0, Ok(()))]
#[case::minor_bump(1, 1, Err("XgqdError::VersionUnsupported: firmware interface 1.1"))]
#[case::major_bump(2, 0, Err("XgqdError::VersionUnsupported: firmware interface 2.0"))]
async fn test_version_gate(
    #[case] major: u16,
    #[case] minor: u16,
    #[case] expected: Result<(), &str>,
) {
    let harness = Harness::new(
        EmulatorBehaviour {
            version: VmrVersion { major, minor },
            ..Default::default()
        },
        fast_config(),
    );
    let res = harness.channel.start_services().await;
    compare_result(&res, &expected);
    if expected.is_err() {
        expect_that!(harness.channel.state(), eq(ServiceState::Halted));
        expect_that!(
            harness.channel.version(),
            eq(Some(VmrVersion { major, minor }))
        );
    }
    harness.shutdown().await;
}

#[gtest]
#[tokio::test]
async fn test_unsupported_version_still_serves_basic_operations() {
    let harness = Harness::new(
        EmulatorBehaviour {
            version: VmrVersion { major: 2, minor: 0 },
            ..Default::default()
        },
        fast_config(),
    );
    assert!(harness.channel.start_services().await.is_err());

    let res = harness.channel.program_scfw().await;
    expect_that!(&res, ok(anything()));
    compare_result(
        &harness.channel.identify().await,
        &Ok(VmrVersion { major: 2, minor: 0 }),
    );
    let res = harness.channel.clock_scaling_status().await;
    assert!(
        matches!(
            res,
            Err(XgqdError::Submit(SubmitError::Halted {
                opcode: Opcode::ClkThrottling
            }))
        ),
        "unexpected result {res:?}"
    );
    harness.shutdown().await;
}

#[gtest]
#[tokio::test]
async fn test_stop_expires_overdue_commands_in_one_pass() {
    let config = ChannelConfig {
        health_interval: Duration::from_secs(60),
        ..fast_config()
    };
    let harness = Harness::started(EmulatorBehaviour::default(), config).await;
    harness.emulator.update(|b| {
        b.unresponsive.insert(Opcode::GetLogPage);
    });

    let pending: Vec<_> = (0..3)
        .map(|_| {
            harness
                .channel
                .submit(&log_page_command(), Duration::ZERO)
                .unwrap()
        })
        .collect();
    expect_that!(harness.channel.outstanding(), eq(3));

    let report = harness.channel.stop_services().await;
    expect_that!(
        report,
        eq(DrainReport {
            passes: 1,
            expired: 3,
            aborted: 0
        })
    );
    for command in pending {
        expect_that!(command.wait().await, eq(CommandOutcome::TimedOut));
    }
    expect_that!(harness.channel.state(), eq(ServiceState::Halted));
    expect_that!(harness.channel.outstanding(), eq(0));
    harness.shutdown().await;
}

#[gtest]
#[tokio::test]
async fn test_stop_aborts_commands_that_never_expire() {
    let harness = Harness::running().await;
    harness.emulator.update(|b| {
        b.unresponsive.insert(Opcode::GetLogPage);
    });
    let pending = harness
        .channel
        .submit(&log_page_command(), Duration::from_secs(60))
        .unwrap();

    let report = harness.channel.stop_services().await;
    let passes = harness.channel.config().drain_max_passes;
    expect_that!(
        report,
        eq(DrainReport {
            passes,
            expired: 0,
            aborted: 1
        })
    );
    expect_that!(pending.wait().await, eq(CommandOutcome::Aborted));
    harness.shutdown().await;
}

fn status_query_command() -> Command {
    Command::VmrControl(VmrControl {
        request: VmrControlRequest::Query,
        debug_level: 0,
    })
}

#[gtest]
#[tokio::test]
async fn test_halting_admits_only_basic_operations() {
    let config = ChannelConfig {
        drain_max_passes: 100,
        ..fast_config()
    };
    let harness = Harness::started(EmulatorBehaviour::default(), config).await;
    harness.emulator.update(|b| {
        b.unresponsive.insert(Opcode::GetLogPage);
    });
    let stuck = harness
        .channel
        .submit(&log_page_command(), Duration::from_secs(60))
        .unwrap();

    let channel = harness.channel.clone();
    let stop = tokio::spawn(async move { channel.stop_services().await });
    harness.wait_for_state(ServiceState::Halting).await;

    let res = harness.channel.query_status().await;
    expect_that!(&res, ok(anything()));
    let res = harness.channel.clock_scaling_status().await;
    assert!(
        matches!(
            res,
            Err(XgqdError::Submit(SubmitError::Halted {
                opcode: Opcode::ClkThrottling
            }))
        ),
        "unexpected result {res:?}"
    );

    let report = stop.await.unwrap();
    expect_that!(report.aborted, eq(1));
    expect_that!(stuck.wait().await, eq(CommandOutcome::Aborted));
    expect_that!(harness.channel.state(), eq(ServiceState::Halted));
    expect_that!(harness.channel.outstanding(), eq(0));
    harness.shutdown().await;
}

#[gtest]
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_stop_leaves_nothing_outstanding_under_concurrent_submits() {
    let harness = Harness::running().await;
    harness.emulator.update(|b| {
        b.unresponsive.insert(Opcode::VmrControl);
    });

    let channel = harness.channel.clone();
    let submitter = tokio::spawn(async move {
        let mut pending = Vec::new();
        loop {
            match channel.submit(&status_query_command(), Duration::from_secs(60)) {
                Ok(command) => pending.push(command),
                Err(SubmitError::QueueFull { .. } | SubmitError::OutOfIds) => {}
                Err(_) => return pending,
            }
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
    });
    tokio::time::sleep(Duration::from_millis(10)).await;

    let report = harness.channel.stop_services().await;
    let pending = submitter.await.unwrap();
    expect_that!(harness.channel.state(), eq(ServiceState::Halted));
    expect_that!(harness.channel.outstanding(), eq(0));
    expect_that!(report.aborted, eq(pending.len()));
    for command in pending {
        let outcome = tokio::time::timeout(Duration::from_secs(1), command.wait()).await;
        assert_that!(outcome, ok(eq(&CommandOutcome::Aborted)));
    }
    harness.shutdown().await;
}

#[gtest]
#[tokio::test]
async fn test_stop_lets_in_flight_commands_finish() {
    let config = ChannelConfig {
        drain_max_passes: 200,
        ..fast_config()
    };
    let harness = Harness::started(EmulatorBehaviour::default(), config).await;
    harness
        .emulator
        .update(|b| b.response_delay = Duration::from_millis(10));
    let pending = harness
        .channel
        .submit(&log_page_command(), Duration::from_secs(60))
        .unwrap();

    let report = harness.channel.stop_services().await;
    expect_that!(report.aborted, eq(0));
    expect_that!(report.expired, eq(0));
    let outcome = pending.wait().await;
    assert!(
        matches!(outcome, CommandOutcome::Completed(c) if c.is_success()),
        "unexpected outcome {outcome:?}"
    );
    harness.shutdown().await;
}

#[gtest]
#[tokio::test]
async fn test_halted_channel_refuses_commands() {
    let harness = Harness::running().await;
    harness.channel.stop_services().await;
    expect_that!(harness.channel.is_halted(), eq(true));
    compare_result(
        &harness.channel.query_status().await.map(|_| ()),
        &Err("SubmitError::Halted"),
    );
    expect_that!(harness.emulator.received().len(), eq(1));
    harness.shutdown().await;
}

#[gtest]
#[tokio::test]
async fn test_restart_after_firmware_update() {
    let harness = Harness::running().await;
    let image: Vec<u8> = (0..=255u8).cycle().take(64 * 1024).collect();
    harness.channel.program_vmr(&image).await.unwrap();

    harness.emulator.boot().unwrap();
    let report = subdev::restart(harness.channel.as_ref()).await.unwrap();
    expect_that!(report, eq(DrainReport::default()));
    expect_that!(harness.channel.state(), eq(ServiceState::Running));
    let res = harness.channel.query_status().await;
    expect_that!(&res, ok(anything()));

    let received = harness.emulator.received();
    let flashed = received
        .iter()
        .find(|r| matches!(r.command, Command::Transfer(t) if t.kind == TransferKind::VmrImage))
        .expect("vmr image was never transferred");
    expect_that!(&flashed.data, eq(&image));
    expect_that!(
        received
            .iter()
            .filter(|r| r.command == Command::Identify)
            .count(),
        eq(2)
    );
    harness.shutdown().await;
}

#[gtest]
#[tokio::test]
async fn test_program_vmr_while_halted() {
    let harness = Harness::new(
        EmulatorBehaviour {
            version: VmrVersion { major: 2, minor: 0 },
            ..Default::default()
        },
        fast_config(),
    );
    assert!(harness.channel.start_services().await.is_err());
    let res = harness.channel.program_vmr(&[1, 2, 3, 4]).await;
    expect_that!(&res, ok(anything()));

    harness
        .emulator
        .update(|b| b.version = VmrVersion { major: 1, minor: 0 });
    harness.emulator.boot().unwrap();
    harness.channel.start_services().await.unwrap();
    expect_that!(harness.channel.state(), eq(ServiceState::Running));
    let res = harness.channel.clock_scaling_status().await;
    expect_that!(&res, ok(anything()));
    harness.shutdown().await;
}
