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

//! Background tasks that keep a channel alive.
//!
//! Two tasks run per attached channel:
//!
//! - the **completion drainer** moves completions from the completion ring to their waiters.
//!   It sleeps while nothing is outstanding, polls at `poll_interval` while something is (or
//!   waits for an interrupt when interrupts are enabled), and takes the channel offline on a
//!   protocol violation.
//! - the **health monitor** wakes every `health_interval` and takes the channel offline if
//!   any outstanding command is past its deadline.
//!
//! Both watch a shared stop flag. A task that itself triggers the stop is never joined by the
//! stop path; it simply exits once the flag is set.

use crate::xgq::service::{ChannelInner, Fault};
use log::{debug, error, info};
use std::fmt;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{Instant, sleep};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Worker {
    Drainer,
    HealthMonitor,
}

impl fmt::Display for Worker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Worker::Drainer => f.write_str("completion drainer"),
            Worker::HealthMonitor => f.write_str("health monitor"),
        }
    }
}

#[derive(Debug)]
pub(crate) struct WorkerPool {
    stop: watch::Sender<bool>,
    handles: Vec<(Worker, JoinHandle<()>)>,
}

impl WorkerPool {
    pub(crate) fn spawn(inner: &Arc<ChannelInner>) -> Self {
        let (stop, rx) = watch::channel(false);
        let handles = vec![
            (
                Worker::Drainer,
                tokio::spawn(run_drainer(inner.clone(), rx.clone())),
            ),
            (
                Worker::HealthMonitor,
                tokio::spawn(run_health_monitor(inner.clone(), rx)),
            ),
        ];
        WorkerPool { stop, handles }
    }

    /// Raise the stop flag without waiting for anything.
    pub(crate) fn signal(&self) {
        self.stop.send_replace(true);
    }

    /// Raise the stop flag and join every task except `origin`, the caller itself.
    pub(crate) async fn stop(self, origin: Option<Worker>) {
        self.signal();
        for (worker, handle) in self.handles {
            if Some(worker) == origin {
                debug!("Not joining the {worker}, it is the one stopping the channel");
                continue;
            }
            if let Err(e) = handle.await {
                error!("The {worker} ended abnormally: {e}");
            }
        }
    }
}

fn stopping(stop: &watch::Receiver<bool>) -> bool {
    *stop.borrow()
}

async fn run_drainer(inner: Arc<ChannelInner>, mut stop: watch::Receiver<bool>) {
    info!("{}: {} started", inner.name, Worker::Drainer);
    while !stopping(&stop) {
        match inner.drain_completions() {
            Ok(0) => {}
            Ok(n) => {
                debug!("{}: drained {n} completions", inner.name);
                continue;
            }
            Err(fault) => {
                error!("{}: {fault}", inner.name);
                inner.offline(fault, Some(Worker::Drainer)).await;
                break;
            }
        }

        let idle = inner.lifecycle.is_idle();
        let polling = inner.config.polling;
        tokio::select! {
            changed = stop.changed() => {
                if changed.is_err() {
                    break;
                }
            }
            _ = inner.lifecycle.submissions().notified(), if idle => {}
            _ = inner.interrupt.notified(), if !polling => {}
            _ = sleep(inner.config.poll_interval), if !idle => {}
        }
    }
    info!("{}: {} stopped", inner.name, Worker::Drainer);
}

async fn run_health_monitor(inner: Arc<ChannelInner>, mut stop: watch::Receiver<bool>) {
    info!("{}: {} started", inner.name, Worker::HealthMonitor);
    while !stopping(&stop) {
        tokio::select! {
            changed = stop.changed() => {
                if changed.is_err() {
                    break;
                }
                continue;
            }
            _ = sleep(inner.config.health_interval) => {}
        }
        if let Some((id, opcode)) = inner.lifecycle.first_expired(Instant::now()) {
            error!(
                "{}: cmd id: {id} op: {opcode} timed out, hot reset is required",
                inner.name
            );
            inner
                .offline(Fault::Timeout { id, opcode }, Some(Worker::HealthMonitor))
                .await;
            break;
        }
    }
    info!("{}: {} stopped", inner.name, Worker::HealthMonitor);
}
