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

//! Command ids, the outstanding set and the per-command lifecycle.
//!
//! Every command passes through `New -> Submitted -> {Completed | Expired}`. Once submitted a
//! command lives in the outstanding set until exactly one of two things removes it:
//!
//! - the completion drainer delivering a matching completion,
//! - an expiry, either from the health monitor, from draining on stop, or from the waiter's
//!   own backstop.
//!
//! A caller cannot withdraw a submitted command: the firmware may still complete it, and a
//! completion for an id that left the set is a protocol violation.
//!
//! Removal and delivery to the waiter happen together under one lock, so whichever of these
//! gets there first wins and the others find nothing to do.
//!
//! The same lock also covers the service state and the submission ring, so the halted gate,
//! id allocation, the ring write and the insertion into the outstanding set are one atomic
//! step. The lock is never held across an `.await`.

use crate::error::{ProtocolViolation, SubmitError};
use crate::xgq::record::{Command, Completion, Opcode};
use crate::xgq::lock;
use crate::xgq::ring::SubmissionRing;
use log::{debug, trace, warn};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::{Notify, oneshot};
use tokio::time::{Instant, timeout_at};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct CommandId(u16);

impl CommandId {
    /// Never handed out. A completion carrying it cannot be correlated.
    pub const SENTINEL: CommandId = CommandId(0xffff);

    pub const fn new(raw: u16) -> Self {
        CommandId(raw)
    }

    pub fn raw(self) -> u16 {
        self.0
    }
}

impl fmt::Display for CommandId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceState {
    Uninitialized,
    Attaching,
    Running,
    Halting,
    Halted,
}

impl ServiceState {
    /// Whether a command with `opcode` may be submitted in this state.
    pub fn admits(self, opcode: Opcode) -> bool {
        match self {
            ServiceState::Running => true,
            ServiceState::Uninitialized => false,
            ServiceState::Attaching | ServiceState::Halting | ServiceState::Halted => {
                opcode.is_basic() || opcode.bypasses_halt()
            }
        }
    }
}

impl fmt::Display for ServiceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ServiceState::Uninitialized => "uninitialized",
            ServiceState::Attaching => "attaching",
            ServiceState::Running => "running",
            ServiceState::Halting => "halting",
            ServiceState::Halted => "halted",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandState {
    New,
    Submitted,
    Completed,
    Expired,
}

/// What a waiter gets back, exactly once per submitted command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandOutcome {
    Completed(Completion),
    /// The deadline passed with no completion.
    TimedOut,
    /// Abandoned while the channel was stopping, before its deadline.
    Aborted,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExpireReason {
    TimedOut,
    Aborted,
}

#[derive(Debug)]
struct Outstanding {
    opcode: Opcode,
    deadline: Instant,
    state: CommandState,
    waiter: oneshot::Sender<CommandOutcome>,
}

impl Outstanding {
    fn resolve(mut self, outcome: CommandOutcome) {
        self.state = match outcome {
            CommandOutcome::Completed(_) => CommandState::Completed,
            CommandOutcome::TimedOut | CommandOutcome::Aborted => CommandState::Expired,
        };
        trace!("{} reached {:?}", self.opcode, self.state);
        if self.waiter.send(outcome).is_err() {
            debug!("Waiter for {} is gone, dropping {outcome:?}", self.opcode);
        }
    }
}

/// The outstanding set together with the id cursor.
#[derive(Debug, Default)]
pub(crate) struct CommandTable {
    outstanding: BTreeMap<CommandId, Outstanding>,
    next_id: u16,
}

impl CommandTable {
    /// Next id after the cursor that is neither the sentinel nor outstanding.
    pub(crate) fn allocate_id(&mut self) -> Result<CommandId, SubmitError> {
        for _ in 0..CommandId::SENTINEL.raw() {
            let id = CommandId(self.next_id);
            self.next_id = self.next_id.wrapping_add(1);
            if self.next_id == CommandId::SENTINEL.raw() {
                self.next_id = 0;
            }
            if !self.outstanding.contains_key(&id) {
                return Ok(id);
            }
        }
        Err(SubmitError::OutOfIds)
    }

    fn insert(
        &mut self,
        id: CommandId,
        opcode: Opcode,
        deadline: Instant,
    ) -> oneshot::Receiver<CommandOutcome> {
        let (waiter, rx) = oneshot::channel();
        let mut entry = Outstanding {
            opcode,
            deadline,
            state: CommandState::New,
            waiter,
        };
        entry.state = CommandState::Submitted;
        self.outstanding.insert(id, entry);
        rx
    }

    fn expire(&mut self, id: CommandId, reason: ExpireReason) -> bool {
        match self.outstanding.remove(&id) {
            Some(entry) => {
                entry.resolve(match reason {
                    ExpireReason::TimedOut => CommandOutcome::TimedOut,
                    ExpireReason::Aborted => CommandOutcome::Aborted,
                });
                true
            }
            None => false,
        }
    }

    fn expire_where(&mut self, reason: ExpireReason, pred: impl Fn(&Outstanding) -> bool) -> usize {
        let ids: Vec<CommandId> = self
            .outstanding
            .iter()
            .filter(|(_, entry)| pred(entry))
            .map(|(id, _)| *id)
            .collect();
        for id in &ids {
            if let Some(entry) = self.outstanding.get(id) {
                warn!("cmd id: {id} op: {} expired as {reason:?}", entry.opcode);
            }
            self.expire(*id, reason);
        }
        ids.len()
    }
}

#[derive(Debug)]
struct Core {
    state: ServiceState,
    table: CommandTable,
    sq: Option<SubmissionRing>,
}

/// Owner of every in-flight command on one channel.
#[derive(Debug)]
pub struct CommandLifecycle {
    core: Mutex<Core>,
    submitted: Notify,
    waiter_grace: Duration,
}

impl CommandLifecycle {
    pub fn new(waiter_grace: Duration) -> Self {
        CommandLifecycle {
            core: Mutex::new(Core {
                state: ServiceState::Uninitialized,
                table: CommandTable::default(),
                sq: None,
            }),
            submitted: Notify::new(),
            waiter_grace,
        }
    }

    fn lock(&self) -> MutexGuard<'_, Core> {
        lock(&self.core, "command lifecycle")
    }

    pub fn state(&self) -> ServiceState {
        self.lock().state
    }

    pub(crate) fn set_state(&self, state: ServiceState) {
        let mut core = self.lock();
        debug!("Channel state {} -> {state}", core.state);
        core.state = state;
    }

    /// Move from `from` to `to`, unless something else changed the state first.
    pub(crate) fn transition(&self, from: ServiceState, to: ServiceState) -> bool {
        let mut core = self.lock();
        if core.state != from {
            return false;
        }
        debug!("Channel state {from} -> {to}");
        core.state = to;
        true
    }

    /// Enter `Halting` unless a stop is already under way or nothing was ever attached.
    /// Returns the state that was left.
    pub(crate) fn begin_halt(&self) -> Option<ServiceState> {
        let mut core = self.lock();
        match core.state {
            ServiceState::Halting | ServiceState::Uninitialized => None,
            previous => {
                debug!("Channel state {previous} -> halting");
                core.state = ServiceState::Halting;
                Some(previous)
            }
        }
    }

    pub(crate) fn install(&self, sq: SubmissionRing) {
        self.lock().sq = Some(sq);
    }

    pub(crate) fn detach(&self) -> Option<SubmissionRing> {
        self.lock().sq.take()
    }

    pub(crate) fn submissions(&self) -> &Notify {
        &self.submitted
    }

    #[cfg(test)]
    pub(crate) fn set_next_id(&self, next: u16) {
        self.lock().table.next_id = next;
    }

    /// Gate, allocate an id, write the record and start tracking the command.
    ///
    /// # Arguments
    ///
    /// * `command` - The command to send
    /// * `timeout` - Time from now until the command counts as timed out
    ///
    /// # Returns: `Result<PendingCommand, SubmitError>`
    /// * `Ok(PendingCommand)` - The command is on the ring and outstanding
    /// * `Err(SubmitError::Halted)` - The current state does not admit this opcode
    /// * `Err(SubmitError::QueueFull)` - No free submission slot, nothing was changed
    /// * `Err(SubmitError::OutOfIds)` - Every id is outstanding
    pub fn submit(
        self: &Arc<Self>,
        command: &Command,
        timeout: Duration,
    ) -> Result<PendingCommand, SubmitError> {
        let opcode = command.opcode();
        let mut guard = self.lock();
        let Core { state, table, sq } = &mut *guard;
        if !state.admits(opcode) {
            debug!("Refusing {opcode} while {state}");
            return Err(SubmitError::Halted { opcode });
        }
        let Some(sq) = sq.as_mut() else {
            return Err(SubmitError::Halted { opcode });
        };
        let id = table.allocate_id()?;
        sq.produce(opcode, &command.encode(id.raw()))?;
        let deadline = Instant::now() + timeout;
        let rx = table.insert(id, opcode, deadline);
        drop(guard);

        trace!("Submitted cmd id: {id} op: {opcode}");
        self.submitted.notify_one();
        Ok(PendingCommand {
            id,
            opcode,
            deadline,
            rx,
            lifecycle: self.clone(),
        })
    }

    /// Hand a completion to its waiter.
    ///
    /// # Returns: `Result<Opcode, ProtocolViolation>`
    /// * `Ok(Opcode)` - The completed command's opcode
    /// * `Err(ProtocolViolation)` - The id is the sentinel or not outstanding
    pub fn complete(&self, completion: Completion) -> Result<Opcode, ProtocolViolation> {
        let id = CommandId(completion.cid);
        if id == CommandId::SENTINEL {
            return Err(ProtocolViolation::SentinelId { cid: completion.cid });
        }
        let entry = self.lock().table.outstanding.remove(&id);
        match entry {
            Some(entry) => {
                let opcode = entry.opcode;
                entry.resolve(CommandOutcome::Completed(completion));
                Ok(opcode)
            }
            None => Err(ProtocolViolation::UnknownId { cid: completion.cid }),
        }
    }

    /// Remove `id` and resolve its waiter. Does nothing if it already left the set.
    pub fn expire_now(&self, id: CommandId, reason: ExpireReason) -> bool {
        self.lock().table.expire(id, reason)
    }

    /// The first outstanding command whose deadline has passed, if any.
    pub fn first_expired(&self, now: Instant) -> Option<(CommandId, Opcode)> {
        self.lock()
            .table
            .outstanding
            .iter()
            .find(|(_, entry)| entry.deadline <= now)
            .map(|(id, entry)| (*id, entry.opcode))
    }

    /// Time out every command whose deadline has passed. Returns how many were removed.
    pub fn expire_overdue(&self, now: Instant) -> usize {
        self.lock()
            .table
            .expire_where(ExpireReason::TimedOut, |entry| entry.deadline <= now)
    }

    pub fn expire_all(&self, reason: ExpireReason) -> usize {
        self.lock().table.expire_where(reason, |_| true)
    }

    pub fn outstanding(&self) -> usize {
        self.lock().table.outstanding.len()
    }

    pub fn is_idle(&self) -> bool {
        self.outstanding() == 0
    }
}

/// A submitted command waiting for its outcome.
#[derive(Debug)]
pub struct PendingCommand {
    id: CommandId,
    opcode: Opcode,
    deadline: Instant,
    rx: oneshot::Receiver<CommandOutcome>,
    lifecycle: Arc<CommandLifecycle>,
}

impl PendingCommand {
    pub fn id(&self) -> CommandId {
        self.id
    }

    pub fn opcode(&self) -> Opcode {
        self.opcode
    }

    /// Wait for the command to complete or expire.
    ///
    /// Expiry is normally the health monitor's job. If it has not happened by the deadline
    /// plus the configured grace, the waiter expires its own command so it cannot wait
    /// forever on a channel whose workers are gone.
    pub async fn wait(mut self) -> CommandOutcome {
        let backstop = self.deadline + self.lifecycle.waiter_grace;
        match timeout_at(backstop, &mut self.rx).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(_)) => CommandOutcome::Aborted,
            Err(_) => {
                warn!(
                    "cmd id: {} op: {} was not resolved in time, expiring it",
                    self.id, self.opcode
                );
                self.lifecycle.expire_now(self.id, ExpireReason::TimedOut);
                (&mut self.rx).await.unwrap_or(CommandOutcome::Aborted)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device_memory::{DeviceMemory, SimulatedMemory};
    use crate::xgq::record::{LogPageKind, LogPageRequest, VmrControl, VmrControlRequest};
    use crate::xgq::ring::{self, SQ_PRODUCED_REG, XGQ_REG_SPAN, XgqHeader};
    use std::collections::HashSet;

    const LONG: Duration = Duration::from_secs(60);

    fn lifecycle(slots: u32) -> (Arc<CommandLifecycle>, Arc<dyn DeviceMemory>) {
        let payload: Arc<dyn DeviceMemory> = Arc::new(SimulatedMemory::new(0x10000));
        let regs: Arc<dyn DeviceMemory> = Arc::new(SimulatedMemory::new(XGQ_REG_SPAN));
        XgqHeader::layout(slots, 128)
            .publish(payload.as_ref(), regs.as_ref(), 0)
            .unwrap();
        let (sq, _cq) = ring::attach(payload, regs.clone(), 0).unwrap();
        let lifecycle = Arc::new(CommandLifecycle::new(Duration::from_millis(20)));
        lifecycle.install(sq);
        lifecycle.set_state(ServiceState::Running);
        (lifecycle, regs)
    }

    fn log_page() -> Command {
        Command::LogPage(LogPageRequest {
            kind: LogPageKind::Firmware,
            address: 0,
            size: 16,
            offset: 0,
        })
    }

    fn query() -> Command {
        Command::VmrControl(VmrControl {
            request: VmrControlRequest::Query,
            debug_level: 0,
        })
    }

    #[test]
    fn test_ids_skip_sentinel_and_outstanding() {
        let mut table = CommandTable {
            next_id: 0xfffe,
            ..Default::default()
        };
        assert_eq!(table.allocate_id().unwrap(), CommandId(0xfffe));
        table.insert(CommandId(0), Opcode::Identify, Instant::now());
        assert_eq!(
            table.allocate_id().unwrap(),
            CommandId(1),
            "Wraps past the sentinel and skips the outstanding id 0"
        );
    }

    #[test]
    fn test_ids_run_out_when_all_outstanding() {
        let mut table = CommandTable::default();
        for raw in 0..CommandId::SENTINEL.raw() {
            table.insert(CommandId(raw), Opcode::Identify, Instant::now());
        }
        assert_eq!(table.allocate_id(), Err(SubmitError::OutOfIds));
    }

    #[tokio::test]
    async fn test_outstanding_ids_are_unique() {
        let (lifecycle, _) = lifecycle(64);
        let mut seen = HashSet::new();
        let mut pending = Vec::new();
        for _ in 0..40 {
            let p = lifecycle.submit(&log_page(), LONG).unwrap();
            assert!(seen.insert(p.id()), "Id {} handed out twice", p.id());
            pending.push(p);
        }
        assert_eq!(lifecycle.outstanding(), 40);
    }

    #[tokio::test]
    async fn test_out_of_order_completions_reach_the_right_waiters() {
        let (lifecycle, _) = lifecycle(8);
        lifecycle.set_next_id(5);
        let pending: Vec<PendingCommand> = (0..3)
            .map(|_| lifecycle.submit(&log_page(), LONG).unwrap())
            .collect();
        let ids: Vec<u16> = pending.iter().map(|p| p.id().raw()).collect();
        assert_eq!(ids, vec![5, 6, 7]);

        for cid in [7, 5, 6] {
            lifecycle
                .complete(Completion::success(cid, [u32::from(cid) * 100, 0]))
                .unwrap();
        }
        for (p, cid) in pending.into_iter().zip([5u32, 6, 7]) {
            match p.wait().await {
                CommandOutcome::Completed(c) => {
                    assert_eq!(c.result[0], cid * 100, "Waiter {cid} got someone else's result")
                }
                other => panic!("Expected a completion for {cid}, got {other:?}"),
            }
        }
        assert!(lifecycle.is_idle());
    }

    #[tokio::test]
    async fn test_completion_and_expiry_deliver_once() {
        let (lifecycle, _) = lifecycle(8);
        let first = lifecycle.submit(&log_page(), LONG).unwrap();
        let first_id = first.id();
        lifecycle.complete(Completion::success(first_id.raw(), [1, 0])).unwrap();
        assert!(
            !lifecycle.expire_now(first_id, ExpireReason::TimedOut),
            "Expiry after completion is a no-op"
        );
        assert!(matches!(first.wait().await, CommandOutcome::Completed(_)));

        let second = lifecycle.submit(&log_page(), LONG).unwrap();
        let second_id = second.id();
        assert!(lifecycle.expire_now(second_id, ExpireReason::TimedOut));
        assert_eq!(
            lifecycle.complete(Completion::success(second_id.raw(), [0, 0])),
            Err(ProtocolViolation::UnknownId {
                cid: second_id.raw()
            })
        );
        assert_eq!(second.wait().await, CommandOutcome::TimedOut);
    }

    #[test]
    fn test_sentinel_completion_is_a_violation() {
        let (lifecycle, _) = lifecycle(8);
        assert_eq!(
            lifecycle.complete(Completion::success(0xffff, [0, 0])),
            Err(ProtocolViolation::SentinelId { cid: 0xffff })
        );
    }

    #[tokio::test]
    async fn test_halted_gate_never_touches_the_ring() {
        let (lifecycle, regs) = lifecycle(8);
        lifecycle.set_state(ServiceState::Halted);
        assert_eq!(
            lifecycle.submit(&log_page(), LONG).unwrap_err(),
            SubmitError::Halted {
                opcode: Opcode::GetLogPage
            }
        );
        assert_eq!(regs.read32(SQ_PRODUCED_REG).unwrap(), 0, "Doorbell untouched");
        assert!(lifecycle.is_idle());

        lifecycle.submit(&query(), LONG).unwrap();
        assert_eq!(regs.read32(SQ_PRODUCED_REG).unwrap(), 1);
    }

    #[tokio::test]
    async fn test_detached_ring_refuses_basic_commands_while_halting() {
        let (lifecycle, regs) = lifecycle(8);
        lifecycle.set_state(ServiceState::Halting);
        lifecycle.submit(&query(), LONG).unwrap();
        assert!(lifecycle.detach().is_some());
        assert_eq!(
            lifecycle.submit(&query(), LONG).unwrap_err(),
            SubmitError::Halted {
                opcode: Opcode::VmrControl
            }
        );
        assert_eq!(regs.read32(SQ_PRODUCED_REG).unwrap(), 1);
        assert_eq!(lifecycle.outstanding(), 1);
    }

    #[tokio::test]
    async fn test_failed_produce_leaves_nothing_outstanding() {
        let (lifecycle, _) = lifecycle(2);
        let _a = lifecycle.submit(&log_page(), LONG).unwrap();
        let _b = lifecycle.submit(&log_page(), LONG).unwrap();
        assert!(matches!(
            lifecycle.submit(&log_page(), LONG),
            Err(SubmitError::QueueFull { .. })
        ));
        assert_eq!(lifecycle.outstanding(), 2);
    }

    #[tokio::test]
    async fn test_overdue_commands_expire_together() {
        let (lifecycle, _) = lifecycle(8);
        let pending: Vec<PendingCommand> = (0..3)
            .map(|_| lifecycle.submit(&log_page(), Duration::ZERO).unwrap())
            .collect();
        let _late = lifecycle.submit(&log_page(), LONG).unwrap();
        assert!(lifecycle.first_expired(Instant::now()).is_some());
        assert_eq!(lifecycle.expire_overdue(Instant::now()), 3);
        for p in pending {
            assert_eq!(p.wait().await, CommandOutcome::TimedOut);
        }
        assert_eq!(lifecycle.expire_all(ExpireReason::Aborted), 1);
        assert!(lifecycle.is_idle());
    }

    #[tokio::test]
    async fn test_waiter_backstop_resolves_unattended_command() {
        let (lifecycle, _) = lifecycle(8);
        let pending = lifecycle
            .submit(&log_page(), Duration::from_millis(10))
            .unwrap();
        assert_eq!(pending.wait().await, CommandOutcome::TimedOut);
        assert!(lifecycle.is_idle());
    }
}
