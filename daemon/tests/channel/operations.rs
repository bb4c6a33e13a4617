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
use std::sync::Arc;
use std::time::Duration;
use xgqd::config::ChannelConfig;
use xgqd::emulator::{EmulatorBehaviour, EmulatorLayout, VmrEmulator};
use xgqd::vmr::ClockScalingStatus;
use xgqd::xgq::record::{
    ClockRequest, Command, LogPageKind, Opcode, SensorRequest, TransferKind, VmrControlRequest,
};
use xgqd::xgq::service::DeviceChannel;

fn image(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i * 7 % 251) as u8).collect()
}

#[gtest]
#[tokio::test]
#[rstest]
#[case::xclbin(TransferKind::Xclbin)]
#[case::pdi(TransferKind::Pdi)]
#[case::apu_bin(TransferKind::ApuBin)]
#[case::vmr_image(TransferKind::VmrImage)]
async fn test_transfer_stages_image(#[case] kind: TransferKind) {
    let harness = Harness::running().await;
    let data = image(300_001);
    let channel = &harness.channel;
    let res = match kind {
        TransferKind::Xclbin => channel.load_xclbin(&data, 0).await,
        TransferKind::Pdi => channel.download_pdi(&data).await,
        TransferKind::ApuBin => channel.download_apu_bin(&data).await,
        TransferKind::ScFirmware => unreachable!("sc firmware carries no image"),
        TransferKind::VmrImage => channel.program_vmr(&data).await,
    };
    expect_that!(&res, ok(anything()));

    let received = harness.emulator.received();
    let last = received.last().expect("nothing was received");
    match last.command {
        Command::Transfer(t) => {
            expect_that!(t.kind, eq(kind));
            expect_that!(t.size as usize, eq(data.len()));
        }
        other => panic!("expected a transfer, got {other:?}"),
    }
    expect_that!(&last.data, eq(&data));
    harness.shutdown().await;
}

#[gtest]
#[tokio::test]
async fn test_program_scfw_stages_nothing() {
    let harness = Harness::running().await;
    let res = harness.channel.program_scfw().await;
    expect_that!(&res, ok(anything()));

    let received = harness.emulator.received();
    let last = received.last().expect("nothing was received");
    match last.command {
        Command::Transfer(t) => {
            expect_that!(t.kind, eq(TransferKind::ScFirmware));
            expect_that!(t.address, eq(0));
            expect_that!(t.size, eq(0));
        }
        other => panic!("expected a transfer, got {other:?}"),
    }
    expect_that!(&last.data, is_empty());
    harness.shutdown().await;
}

#[gtest]
#[tokio::test]
async fn test_program_scfw_does_not_wait_for_the_data_region() {
    let harness = Harness::running().await;
    let held = harness.channel.acquire_data().await.unwrap();
    let res = harness.channel.program_scfw().await;
    expect_that!(&res, ok(anything()));
    held.release();
    harness.shutdown().await;
}

#[gtest]
#[tokio::test]
async fn test_xclbin_slot_is_forwarded() {
    let harness = Harness::running().await;
    harness.channel.load_xclbin(&image(64), 3).await.unwrap();
    let received = harness.emulator.received();
    match received.last().map(|r| r.command) {
        Some(Command::Transfer(t)) => expect_that!(t.private, eq(3)),
        other => panic!("expected a transfer, got {other:?}"),
    }
    harness.shutdown().await;
}

#[gtest]
#[tokio::test]
async fn test_empty_image_is_refused() {
    let harness = Harness::running().await;
    compare_result(
        &harness.channel.download_pdi(&[]).await,
        &Err("XgqdError::Argument"),
    );
    expect_that!(harness.emulator.received().len(), eq(1));
    harness.shutdown().await;
}

#[gtest]
#[tokio::test]
#[rstest]
#[case::uuid(LogPageKind::ShellInterfaceUuid, b"a3e2c7f0-0000-4000-8000-00000000beef".to_vec())]
#[case::info(LogPageKind::Info, b"vmr emulator\n".to_vec())]
#[case::absent(LogPageKind::DefaultFpt, Vec::new())]
async fn test_read_log_page(#[case] kind: LogPageKind, #[case] expected: Vec<u8>) {
    let harness = Harness::running().await;
    compare_result(&harness.channel.read_log_page(kind).await, &Ok(expected));
    harness.shutdown().await;
}

#[gtest]
#[tokio::test]
async fn test_log_page_offset() {
    let harness = Harness::running().await;
    compare_result(
        &harness.channel.get_log_page(LogPageKind::Info, 4, 3).await,
        &Ok(b"emu".to_vec()),
    );
    harness.shutdown().await;
}

#[gtest]
#[tokio::test]
async fn test_query_status() {
    let harness = Harness::running().await;
    let status = harness.channel.query_status().await.unwrap();
    expect_that!(status.boot_on_default, eq(true));
    expect_that!(status.boot_on_backup, eq(false));
    expect_that!(status.sc_is_ready, eq(true));
    expect_that!(status.program_progress, eq(100));
    expect_that!(status.to_string(), contains_substring("has_fpt: 1"));
    harness.shutdown().await;
}

#[gtest]
#[tokio::test]
#[rstest]
#[case::backup(true)]
#[case::default(false)]
async fn test_enable_multiboot(#[case] backup: bool) {
    let harness = Harness::running().await;
    harness.channel.enable_multiboot(backup).await.unwrap();
    let status = harness.channel.query_status().await.unwrap();
    expect_that!(status.boot_on_backup, eq(backup));
    expect_that!(status.boot_on_default, eq(!backup));
    harness.shutdown().await;
}

#[gtest]
#[tokio::test]
#[rstest]
#[case::no_sc_firmware(false, false, Ok(()))]
#[case::ready(true, true, Ok(()))]
#[case::never_ready(true, false, Err("satellite controller not ready"))]
async fn test_wait_for_sc_ready(
    #[case] has_ext_scfw: bool,
    #[case] sc_is_ready: bool,
    #[case] expected: Result<(), &str>,
) {
    let mut behaviour = EmulatorBehaviour::default();
    behaviour.status.has_ext_scfw = has_ext_scfw;
    behaviour.status.sc_is_ready = sc_is_ready;
    let harness = Harness::started(behaviour, fast_config()).await;
    compare_result(&harness.channel.wait_for_sc_ready().await, &expected);
    compare_result(&harness.channel.sc_status().await, &Ok(sc_is_ready));
    harness.shutdown().await;
}

#[gtest]
#[tokio::test]
async fn test_clock_scaling_configure_and_reset() {
    let harness = Harness::running().await;
    let channel = &harness.channel;
    channel
        .configure_clock_scaling(true, Some(200), Some(90))
        .await
        .unwrap();
    let status = channel.clock_scaling_status().await.unwrap();
    expect_that!(
        status,
        eq(ClockScalingStatus {
            supported: true,
            enabled: true,
            power_override: true,
            temp_override: true,
            power_limit: 200,
            temp_limit: 90,
        })
    );

    channel.configure_clock_scaling(false, None, None).await.unwrap();
    let status = channel.clock_scaling_status().await.unwrap();
    expect_that!(status.enabled, eq(false));
    expect_that!(status.power_limit, eq(200));
    expect_that!(status.power_override, eq(false));

    channel.reset_clock_scaling().await.unwrap();
    let status = channel.clock_scaling_status().await.unwrap();
    expect_that!(status, eq(EmulatorBehaviour::default().clock_scaling));
    harness.shutdown().await;
}

#[gtest]
#[tokio::test]
#[rstest]
#[case::one(vec![300], Ok(()))]
#[case::four(vec![300, 250, 100, 50], Ok(()))]
#[case::none(vec![], Err("XgqdError::Argument"))]
#[case::five(vec![1, 2, 3, 4, 5], Err("XgqdError::Argument"))]
async fn test_scale_clocks(#[case] freqs: Vec<u32>, #[case] expected: Result<(), &str>) {
    let harness = Harness::running().await;
    compare_result(&harness.channel.scale_clocks(2, &freqs).await, &expected);
    if expected.is_ok() {
        match harness.emulator.received().last().map(|r| r.command) {
            Some(Command::Clock(c)) => {
                expect_that!(c.request, eq(ClockRequest::Scale));
                expect_that!(c.region, eq(2));
                expect_that!(c.count as usize, eq(freqs.len()));
                expect_that!(&c.freqs[..freqs.len()], eq(&freqs[..]));
            }
            other => panic!("expected a clock command, got {other:?}"),
        }
    }
    harness.shutdown().await;
}

#[gtest]
#[tokio::test]
#[rstest]
#[case::first(0, Ok(300))]
#[case::second(1, Ok(500))]
#[case::out_of_range(4, Err("clock index 4 is out of range"))]
async fn test_clock_frequency(#[case] clock: u32, #[case] expected: Result<u32, &str>) {
    let harness = Harness::running().await;
    compare_result(&harness.channel.clock_frequency(1, clock).await, &expected);
    if expected.is_ok() {
        match harness.emulator.received().last().map(|r| r.command) {
            Some(Command::Clock(c)) => {
                expect_that!(c.request, eq(ClockRequest::Get));
                expect_that!(c.region, eq(1));
                expect_that!(c.count, eq(clock));
            }
            other => panic!("expected a clock command, got {other:?}"),
        }
    }
    harness.shutdown().await;
}

#[gtest]
#[tokio::test]
async fn test_scaled_clocks_read_back() {
    let harness = Harness::running().await;
    harness.channel.scale_clocks(0, &[250, 400]).await.unwrap();
    compare_result(&harness.channel.clock_frequency(0, 0).await, &Ok(250));
    compare_result(&harness.channel.clock_frequency(0, 1).await, &Ok(400));
    harness.shutdown().await;
}

#[gtest]
#[tokio::test]
async fn test_collect_sensors() {
    let harness = Harness::running().await;
    compare_result(
        &harness
            .channel
            .collect_sensors(SensorRequest::SingleSdr, 4, 9)
            .await,
        &Ok(vec![0x5a; 64]),
    );
    match harness.emulator.received().last().map(|r| r.command) {
        Some(Command::Sensor(s)) => {
            expect_that!(s.request, eq(SensorRequest::SingleSdr));
            expect_that!(s.repo_id, eq(4));
            expect_that!(s.sensor_id, eq(9));
        }
        other => panic!("expected a sensor query, got {other:?}"),
    }
    harness.shutdown().await;
}

#[gtest]
#[tokio::test]
async fn test_check_firewall() {
    let harness = Harness::running().await;
    let report = harness.channel.check_firewall().await.unwrap();
    expect_that!(report.tripped, eq(false));

    harness.emulator.update(|b| {
        b.log_pages.insert(
            LogPageKind::AfCheck,
            b"firewall 0 tripped, status 0x80000".to_vec(),
        );
    });
    let report = harness.channel.check_firewall().await.unwrap();
    expect_that!(report.tripped, eq(true));
    expect_that!(report.detail, contains_substring("firewall 0 tripped"));
    harness.shutdown().await;
}

#[gtest]
#[tokio::test]
async fn test_device_failure_reports_rcode() {
    let harness = Harness::running().await;
    harness.emulator.update(|b| {
        b.failures.insert(Opcode::Clock, -22);
    });
    compare_result(
        &harness.channel.scale_clocks(0, &[100]).await,
        &Err("with rcode -22"),
    );
    expect_that!(harness.channel.state(), eq(xgqd::xgq::lifecycle::ServiceState::Running));
    let res = harness.channel.query_status().await;
    expect_that!(&res, ok(anything()));
    harness.shutdown().await;
}

#[gtest]
#[tokio::test]
async fn test_data_region_is_exclusive() {
    let harness = Harness::running().await;
    let held = harness.channel.acquire_data().await.unwrap();
    compare_result(
        &harness.channel.load_xclbin(&image(16), 0).await,
        &Err("ArenaError::Busy: the data region"),
    );

    let res = harness.channel.read_log_page(LogPageKind::Info).await;
    expect_that!(&res, ok(anything()));

    held.release();
    let res = harness.channel.load_xclbin(&image(16), 0).await;
    expect_that!(&res, ok(anything()));
    harness.shutdown().await;
}

#[gtest]
#[tokio::test]
async fn test_concurrent_commands_complete() {
    let harness = Harness::running().await;
    let channel = &harness.channel;
    let (status, scaling, uuid) = tokio::join!(
        channel.query_status(),
        channel.clock_scaling_status(),
        channel.read_log_page(LogPageKind::ShellInterfaceUuid),
    );
    expect_that!(&status, ok(anything()));
    expect_that!(&scaling, ok(anything()));
    expect_that!(&uuid, ok(anything()));
    expect_that!(channel.outstanding(), eq(0));
    harness.shutdown().await;
}

#[gtest]
#[tokio::test]
async fn test_interrupt_driven_completions() {
    let emulator = VmrEmulator::new(EmulatorLayout::default(), EmulatorBehaviour::default());
    emulator.boot().unwrap();
    let config = ChannelConfig {
        polling: false,
        poll_interval: Duration::from_secs(30),
        ..fast_config()
    };
    let channel = Arc::new(DeviceChannel::new(
        "test",
        emulator.payload(),
        emulator.regs(),
        config,
    ));
    let raised = channel.clone();
    let task = emulator.serve_with_interrupts(Duration::from_millis(1), move || {
        raised.notify_interrupt()
    });

    let started = tokio::time::timeout(Duration::from_secs(5), channel.start_services()).await;
    assert_that!(started, ok(ok(anything())));
    let status = tokio::time::timeout(Duration::from_secs(5), channel.query_status()).await;
    assert_that!(status, ok(ok(anything())));

    channel.stop_services().await;
    task.shutdown().await;
}

#[gtest]
#[tokio::test]
async fn test_eemi_srst() {
    let harness = Harness::running().await;
    let res = harness.channel.eemi_srst().await;
    expect_that!(&res, ok(anything()));
    match harness.emulator.received().last().map(|r| r.command) {
        Some(Command::VmrControl(v)) => {
            expect_that!(v.request, eq(VmrControlRequest::EemiSrst))
        }
        other => panic!("expected a vmr control command, got {other:?}"),
    }
    harness.shutdown().await;
}
