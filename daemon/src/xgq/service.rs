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

//! One XGQ channel to one card, and its service lifecycle.
//!
//! A [`DeviceChannel`] is created per card at bring-up and owns everything about the channel:
//! the memory accessors, the rings, the arena, the outstanding set and the two workers. Its
//! service state moves through:
//!
//! ```text
//! Uninitialized -> Attaching -> Running -> Halting -> Halted -> Attaching -> ...
//! ```
//!
//! - **Attaching**: wait for the firmware descriptor, attach the rings, start the workers and
//!   run the identify handshake. Only basic operations are admitted.
//! - **Running**: every operation is admitted.
//! - **Halting**: a stop is draining the outstanding set. Only basic operations are admitted.
//! - **Halted**: the channel is stopped, or is attached to firmware whose interface version is
//!   not supported, in which case basic operations still work.
//!
//! A command timeout or a protocol violation takes the channel offline: it is gated to basic
//! operations at once, the firmware log is captured the first time it happens in an episode,
//! and the channel is stopped. [`DeviceChannel::start_services`] brings it back, for example
//! after the management firmware has been reflashed.

use crate::config::ChannelConfig;
use crate::device_memory::DeviceMemory;
use crate::error::{AccessError, ProtocolViolation, SubmitError, XgqdError};
use crate::vmr::VmrVersion;
use crate::xgq::arena::{ArenaPermit, SharedArena};
use crate::xgq::descriptor::{SharedDescriptor, wait_ready};
use crate::xgq::lifecycle::{
    CommandId, CommandLifecycle, CommandOutcome, ExpireReason, PendingCommand, ServiceState,
};
use crate::xgq::lock;
use crate::xgq::record::{Command, Completion, Opcode, TimeoutClass};
use crate::xgq::ring::{self, CompletionRing};
use crate::xgq::vmr_log::{self, VMR_LOG_MAX_RECS};
use crate::xgq::workers::{Worker, WorkerPool};
use log::{debug, error, info, trace, warn};
use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime};
use tokio::sync::Notify;
use tokio::time::{Instant, sleep};

/// Firmware log records dumped at debug level when a command fails on the device.
const FAILURE_LOG_RECS: u32 = 20;

/// Why a channel was taken offline.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Fault {
    Timeout { id: CommandId, opcode: Opcode },
    Protocol(ProtocolViolation),
    Access(AccessError),
}

impl fmt::Display for Fault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Fault::Timeout { id, opcode } => write!(f, "cmd id: {id} op: {opcode} timed out"),
            Fault::Protocol(v) => write!(f, "{v}"),
            Fault::Access(e) => write!(f, "{e}"),
        }
    }
}

/// Firmware log captured when a channel first went offline in a halt episode.
#[derive(Debug, Clone)]
pub struct DiagnosticSnapshot {
    pub fault: Fault,
    pub captured_at: SystemTime,
    pub records: Vec<String>,
}

/// What a stop had to do with the commands still outstanding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DrainReport {
    pub passes: u32,
    /// Commands removed because their deadline had passed.
    pub expired: usize,
    /// Commands force-expired after the last pass.
    pub aborted: usize,
}

impl fmt::Display for DrainReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} passes, {} timed out, {} aborted",
            self.passes, self.expired, self.aborted
        )
    }
}

#[derive(Debug, Clone)]
struct Attachment {
    descriptor: SharedDescriptor,
    arena: Arc<SharedArena>,
}

#[derive(Debug)]
pub(crate) struct ChannelInner {
    pub(crate) name: String,
    pub(crate) config: ChannelConfig,
    payload: Arc<dyn DeviceMemory>,
    regs: Arc<dyn DeviceMemory>,
    pub(crate) lifecycle: Arc<CommandLifecycle>,
    cq: Mutex<Option<CompletionRing>>,
    attachment: Mutex<Option<Attachment>>,
    workers: tokio::sync::Mutex<Option<WorkerPool>>,
    pub(crate) interrupt: Notify,
    transition: tokio::sync::Mutex<()>,
    version: Mutex<Option<VmrVersion>>,
    last_diagnostic: Mutex<Option<DiagnosticSnapshot>>,
}

impl ChannelInner {
    fn attachment(&self) -> Option<Attachment> {
        lock(&self.attachment, "attachment").clone()
    }

    /// Move every ready completion to its waiter.
    ///
    /// # Returns: `Result<usize, Fault>`
    /// * `Ok(usize)` - Number of completions delivered
    /// * `Err(Fault)` - A completion could not be correlated, or the ring could not be read
    pub(crate) fn drain_completions(&self) -> Result<usize, Fault> {
        let mut drained = 0;
        loop {
            let mut cq = lock(&self.cq, "completion ring");
            let Some(ring) = cq.as_mut() else {
                return Ok(drained);
            };
            let Some(entry) = ring.consume().map_err(Fault::Access)? else {
                return Ok(drained);
            };
            let completion = Completion::decode(&entry);
            let delivered = self.lifecycle.complete(completion);
            ring.notify_consumed().map_err(Fault::Access)?;
            drop(cq);

            let opcode = delivered.map_err(Fault::Protocol)?;
            trace!(
                "{}: cmd id: {} op: {opcode} completed with rcode {}",
                self.name, completion.cid, completion.rcode
            );
            drained += 1;
        }
    }

    async fn attach(&self) -> Result<(), XgqdError> {
        let descriptor = wait_ready(
            self.payload.as_ref(),
            self.config.ready_retries,
            self.config.ready_interval,
        )
        .await?;
        let (sq, cq) = ring::attach(
            self.payload.clone(),
            self.regs.clone(),
            u64::from(descriptor.ring_buffer_off),
        )?;
        cq.set_interrupts(!self.config.polling)?;
        let arena = SharedArena::from_descriptor(
            self.payload.clone(),
            &descriptor,
            self.config.arena_wait,
            self.config.arena_permits,
        )?;
        self.lifecycle.install(sq);
        *lock(&self.cq, "completion ring") = Some(cq);
        *lock(&self.attachment, "attachment") = Some(Attachment {
            descriptor,
            arena: Arc::new(arena),
        });
        Ok(())
    }

    fn detach(&self) {
        self.lifecycle.detach();
        if let Some(cq) = lock(&self.cq, "completion ring").take() {
            if let Err(e) = cq.set_interrupts(false) {
                warn!("{}: failed to mask completion interrupts: {e}", self.name);
            }
        }
        if let Some(attachment) = lock(&self.attachment, "attachment").take() {
            attachment.arena.close();
        }
    }

    /// Expire overdue commands pass by pass, then abort whatever is left.
    async fn drain(&self) -> DrainReport {
        let mut report = DrainReport::default();
        while !self.lifecycle.is_idle() && report.passes < self.config.drain_max_passes {
            report.passes += 1;
            report.expired += self.lifecycle.expire_overdue(Instant::now());
            if self.lifecycle.is_idle() {
                break;
            }
            sleep(self.config.drain_interval).await;
        }
        report.aborted = self.lifecycle.expire_all(ExpireReason::Aborted);
        if report.aborted > 0 {
            warn!(
                "{}: aborted {} commands still outstanding after {} passes",
                self.name, report.aborted, report.passes
            );
        }
        report
    }

    /// The second half of every stop. The caller has already moved the state to `Halting`.
    ///
    /// Basic commands are still admitted while the drain runs. The submission ring is taken
    /// away before the workers stop, and anything that slipped in after the last drain pass
    /// is aborted once they are gone, so the outstanding set is empty when `Halted` is set.
    async fn stop_inner(&self, origin: Option<Worker>) -> DrainReport {
        info!("{}: stopping xgq services", self.name);
        let mut report = self.drain().await;
        self.lifecycle.detach();
        let pool = self.workers.lock().await.take();
        if let Some(pool) = pool {
            pool.stop(origin).await;
        }
        let late = self.lifecycle.expire_all(ExpireReason::Aborted);
        if late > 0 {
            warn!(
                "{}: aborted {late} commands submitted during the drain",
                self.name
            );
            report.aborted += late;
        }
        self.detach();
        self.lifecycle.set_state(ServiceState::Halted);
        info!("{}: xgq services are stopped, {report}", self.name);
        report
    }

    /// The unhealthy channel path shared by the health monitor and the drainer.
    pub(crate) async fn offline(&self, fault: Fault, origin: Option<Worker>) {
        let Some(previous) = self.lifecycle.begin_halt() else {
            debug!("{}: already going offline, ignoring {fault}", self.name);
            return;
        };
        warn!("{}: xgq services are going offline: {fault}", self.name);
        if previous != ServiceState::Halted {
            self.capture_diagnostics(fault);
        }
        self.stop_inner(origin).await;
    }

    fn capture_diagnostics(&self, fault: Fault) {
        let Some(attachment) = self.attachment() else {
            return;
        };
        match vmr_log::read_recent(
            self.payload.as_ref(),
            &attachment.descriptor,
            VMR_LOG_MAX_RECS,
        ) {
            Ok(records) => {
                warn!("=== start dumping vmr log ===");
                for record in &records {
                    warn!("{record}");
                }
                warn!("=== end dumping vmr log ===");
                *lock(&self.last_diagnostic, "diagnostics") = Some(DiagnosticSnapshot {
                    fault,
                    captured_at: SystemTime::now(),
                    records,
                });
            }
            Err(e) => error!("{}: failed to read the firmware log: {e}", self.name),
        }
    }

    fn dump_recent_log(&self, count: u32) {
        let Some(attachment) = self.attachment() else {
            return;
        };
        if let Ok(records) =
            vmr_log::read_recent(self.payload.as_ref(), &attachment.descriptor, count)
        {
            for record in records {
                debug!("{}: {record}", self.name);
            }
        }
    }

    /// Wait for a stop running elsewhere to finish.
    async fn settle(&self) {
        for _ in 0..=self.config.drain_max_passes.saturating_add(1) {
            if self.lifecycle.state() != ServiceState::Halting {
                return;
            }
            sleep(self.config.drain_interval).await;
        }
        warn!("{}: still halting after the drain bound", self.name);
    }
}

/// The host end of one card's XGQ channel.
#[derive(Debug)]
pub struct DeviceChannel {
    inner: Arc<ChannelInner>,
}

impl DeviceChannel {
    /// Create a channel in the `Uninitialized` state. Nothing touches the card until
    /// [`start_services`](DeviceChannel::start_services).
    ///
    /// # Arguments
    ///
    /// * `name` - Name used in log messages
    /// * `payload` - Shared payload memory holding the descriptor, rings, log and arena
    /// * `regs` - The queue doorbell registers
    /// * `config` - Timeouts, polling cadence and the supported firmware versions
    pub fn new(
        name: impl Into<String>,
        payload: Arc<dyn DeviceMemory>,
        regs: Arc<dyn DeviceMemory>,
        config: ChannelConfig,
    ) -> Self {
        DeviceChannel {
            inner: Arc::new(ChannelInner {
                name: name.into(),
                lifecycle: Arc::new(CommandLifecycle::new(config.waiter_grace)),
                config,
                payload,
                regs,
                cq: Mutex::new(None),
                attachment: Mutex::new(None),
                workers: tokio::sync::Mutex::new(None),
                interrupt: Notify::new(),
                transition: tokio::sync::Mutex::new(()),
                version: Mutex::new(None),
                last_diagnostic: Mutex::new(None),
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn config(&self) -> &ChannelConfig {
        &self.inner.config
    }

    pub fn state(&self) -> ServiceState {
        self.inner.lifecycle.state()
    }

    /// Anything other than `Running` counts as halted.
    pub fn is_halted(&self) -> bool {
        self.state() != ServiceState::Running
    }

    /// Firmware interface version reported by the last identify handshake.
    pub fn version(&self) -> Option<VmrVersion> {
        *lock(&self.inner.version, "version")
    }

    pub fn outstanding(&self) -> usize {
        self.inner.lifecycle.outstanding()
    }

    pub fn last_diagnostic(&self) -> Option<DiagnosticSnapshot> {
        lock(&self.inner.last_diagnostic, "diagnostics").clone()
    }

    /// Called from the completion interrupt handler.
    pub fn notify_interrupt(&self) {
        self.inner.interrupt.notify_one();
    }

    /// Bring the channel up, or back up after a halt.
    ///
    /// Waits for the firmware to become ready, attaches the rings, starts the workers and runs
    /// the identify handshake. A channel left halted by an earlier version mismatch is stopped
    /// first so the handshake runs against a fresh attach.
    ///
    /// # Returns: `Result<(), XgqdError>`
    /// * `Ok(())` - The channel is `Running`
    /// * `Err(XgqdError::Attach)` - The firmware never became ready or published bad rings
    /// * `Err(XgqdError::VersionUnsupported)` - Attached, but only basic operations work
    /// * `Err(XgqdError::State)` - Another transition is under way
    pub async fn start_services(&self) -> Result<(), XgqdError> {
        let inner = &self.inner;
        let _transition = inner.transition.lock().await;
        match inner.lifecycle.state() {
            ServiceState::Running => {
                info!("{}: xgq services are already running", inner.name);
                return Ok(());
            }
            state @ (ServiceState::Attaching | ServiceState::Halting) => {
                return Err(XgqdError::State(format!(
                    "{} is {state}, try again later",
                    inner.name
                )));
            }
            ServiceState::Halted => {
                if inner.lifecycle.begin_halt().is_some() {
                    inner.stop_inner(None).await;
                }
            }
            ServiceState::Uninitialized => {}
        }

        let fallback = inner.lifecycle.state();
        inner.lifecycle.set_state(ServiceState::Attaching);
        info!("{}: starting xgq services", inner.name);
        if let Err(e) = inner.attach().await {
            inner.detach();
            inner.lifecycle.set_state(fallback);
            return Err(e);
        }
        *inner.workers.lock().await = Some(WorkerPool::spawn(inner));

        let version = match self.identify().await {
            Ok(version) => version,
            Err(e) => {
                error!("{}: identify handshake failed: {e}", inner.name);
                inner
                    .lifecycle
                    .transition(ServiceState::Attaching, ServiceState::Halted);
                return Err(e);
            }
        };
        *lock(&inner.version, "version") = Some(version);
        if !inner.config.supported_versions.contains(&version) {
            warn!(
                "{}: firmware interface {version} is not supported, only basic operations are allowed",
                inner.name
            );
            inner
                .lifecycle
                .transition(ServiceState::Attaching, ServiceState::Halted);
            return Err(XgqdError::VersionUnsupported {
                major: version.major,
                minor: version.minor,
            });
        }
        if !inner
            .lifecycle
            .transition(ServiceState::Attaching, ServiceState::Running)
        {
            return Err(XgqdError::State(format!(
                "{} went offline while starting",
                inner.name
            )));
        }
        info!(
            "{}: xgq services are running, firmware interface {version}",
            inner.name
        );
        Ok(())
    }

    /// Stop the channel. Always terminates: overdue commands are timed out pass by pass and
    /// anything still outstanding after the last pass is aborted.
    pub async fn stop_services(&self) -> DrainReport {
        let inner = &self.inner;
        let _transition = inner.transition.lock().await;
        match inner.lifecycle.begin_halt() {
            Some(_) => inner.stop_inner(None).await,
            None => {
                inner.settle().await;
                DrainReport::default()
            }
        }
    }

    /// Timeout for `command` from its class.
    pub fn timeout_for(&self, command: &Command) -> Duration {
        let timeouts = &self.inner.config.timeouts;
        match command.timeout_class() {
            TimeoutClass::Control => timeouts.control,
            TimeoutClass::Download => timeouts.download,
            TimeoutClass::Flash => timeouts.flash,
        }
    }

    pub fn submit(
        &self,
        command: &Command,
        timeout: Duration,
    ) -> Result<PendingCommand, SubmitError> {
        self.inner.lifecycle.submit(command, timeout)
    }

    /// Submit `command` with its class timeout and wait for the outcome.
    ///
    /// # Returns: `Result<Completion, XgqdError>`
    /// * `Ok(Completion)` - The device completed the command with rcode 0
    /// * `Err(XgqdError::Device)` - The device completed it with a non-zero rcode
    /// * `Err(XgqdError::TimedOut)` / `Err(XgqdError::Aborted)` - It never completed
    /// * `Err(XgqdError::Submit)` - It was never submitted
    pub async fn execute(&self, command: &Command) -> Result<Completion, XgqdError> {
        let opcode = command.opcode();
        let pending = self.submit(command, self.timeout_for(command))?;
        match pending.wait().await {
            CommandOutcome::Completed(completion) if completion.is_success() => Ok(completion),
            CommandOutcome::Completed(completion) => {
                self.inner.dump_recent_log(FAILURE_LOG_RECS);
                Err(XgqdError::Device {
                    opcode,
                    rcode: completion.rcode,
                })
            }
            CommandOutcome::TimedOut => Err(XgqdError::TimedOut { opcode }),
            CommandOutcome::Aborted => Err(XgqdError::Aborted { opcode }),
        }
    }

    fn arena(&self) -> Result<Arc<SharedArena>, XgqdError> {
        self.inner
            .attachment()
            .map(|a| a.arena)
            .ok_or_else(|| XgqdError::State(format!("{} is not attached", self.inner.name)))
    }

    pub async fn acquire_log(&self) -> Result<ArenaPermit, XgqdError> {
        Ok(self.arena()?.acquire_log().await?)
    }

    pub async fn acquire_data(&self) -> Result<ArenaPermit, XgqdError> {
        Ok(self.arena()?.acquire_data().await?)
    }
}

impl Drop for DeviceChannel {
    fn drop(&mut self) {
        if let Ok(workers) = self.inner.workers.try_lock() {
            if let Some(pool) = workers.as_ref() {
                pool.signal();
            }
        }
    }
}
