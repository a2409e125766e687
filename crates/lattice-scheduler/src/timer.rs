//! Timer service
//!
//! Every armed timer runs as its own concurrent unit: periodic timers
//! fire until stopped, absolute timers fire once and clean themselves
//! up. Expiry is delivered as a [`EventBody::TimerExpired`] message to
//! the owner task's mailbox.
//!
//! Cleanup always takes the owner's task lock before the scheduler
//! registry, the same order every other path uses; `kill_timer` releases
//! the task lock before awaiting the unit's acknowledgment so the unit
//! can take it.

use std::sync::Arc;
use std::time::Duration;

use lattice_core::{Error, Result};
use tokio::sync::{mpsc, oneshot};
use tracing::debug;

use crate::message::{EventBody, Message};
use crate::registry::{bookkeeping_fault, StopReceiver, StopSender, TaskHandle, TimerCtl, TimerId};
use crate::scheduler::Scheduler;
use crate::task::{TaskShared, MAX_TASK_TIMERS};

// ----------------------------------------------------------------------------
// Descriptors
// ----------------------------------------------------------------------------

/// How a timer fires.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerKind {
    /// Fires once after its duration, then cleans itself up.
    Absolute,
    /// Fires every duration until stopped.
    Periodic,
}

/// Parameters for one timer.
#[derive(Debug, Clone)]
pub struct TimerDescriptor {
    pub name: String,
    pub kind: TimerKind,
    pub duration: Duration,
    /// Id chosen by the owner, echoed back in the expiry event.
    pub user_id: u32,
    /// Opaque payload echoed back in the expiry event.
    pub extra: Option<Vec<u8>>,
}

impl TimerDescriptor {
    pub fn absolute(name: impl Into<String>, duration: Duration, user_id: u32) -> Self {
        Self {
            name: name.into(),
            kind: TimerKind::Absolute,
            duration,
            user_id,
            extra: None,
        }
    }

    pub fn periodic(name: impl Into<String>, duration: Duration, user_id: u32) -> Self {
        Self {
            name: name.into(),
            kind: TimerKind::Periodic,
            duration,
            user_id,
            extra: None,
        }
    }

    pub fn with_extra(mut self, extra: Vec<u8>) -> Self {
        self.extra = Some(extra);
        self
    }
}

// ----------------------------------------------------------------------------
// Timer Operations
// ----------------------------------------------------------------------------

impl Scheduler {
    /// Allocate a timer slot for `owner` without arming it. Returns the
    /// per-task slot id used by `start_timer`/`kill_timer` and echoed to
    /// nobody else.
    pub fn get_timer(&self, owner: TaskHandle, desc: TimerDescriptor) -> Result<usize> {
        if desc.duration.is_zero() {
            return Err(Error::parameter("timer duration must be non-zero"));
        }
        let shared = self.task_shared(owner)?;
        // ensure the owner can receive expiry events at all
        self.task_mailbox(owner)?;

        // task lock before scheduler lock
        let mut table = shared.timers.lock();
        let tid = table
            .free_slot()
            .ok_or_else(|| Error::resource("task timer table full"))?;
        let (stop_tx, stop_rx) = mpsc::channel(1);
        let id = {
            let mut reg = self.registry();
            reg.alloc_timer(TimerCtl {
                name: desc.name,
                kind: desc.kind,
                duration: desc.duration,
                user_id: desc.user_id,
                extra: desc.extra,
                owner,
                armed: false,
                stop_tx,
                stop_rx: Some(stop_rx),
            })?
        };
        table.insert(tid, id);
        Ok(tid)
    }

    /// Arm a timer previously allocated with `get_timer`.
    pub fn start_timer(&self, owner: TaskHandle, tid: usize) -> Result<()> {
        if tid >= MAX_TASK_TIMERS {
            return Err(Error::parameter(format!("timer slot out of range: {tid}")));
        }
        let shared = self.task_shared(owner)?;
        let mailbox = self.task_mailbox(owner)?;

        let table = shared.timers.lock();
        let id = table
            .get(tid)
            .ok_or_else(|| Error::not_found(format!("timer slot empty: {tid}")))?;
        let (name, kind, duration, user_id, extra, stop_rx) = {
            let mut reg = self.registry();
            let ctl = reg
                .timer_ctl_mut(id)
                .ok_or_else(|| Error::not_found("timer node gone"))?;
            if ctl.armed {
                return Err(Error::mismatched("timer already armed"));
            }
            ctl.armed = true;
            let stop_rx = ctl
                .stop_rx
                .take()
                .unwrap_or_else(|| bookkeeping_fault("unarmed timer without stop end"));
            (
                ctl.name.clone(),
                ctl.kind,
                ctl.duration,
                ctl.user_id,
                ctl.extra.clone(),
                stop_rx,
            )
        };
        drop(table);

        tokio::spawn(run_timer(
            self.clone(),
            owner,
            shared,
            mailbox,
            id,
            name,
            kind,
            duration,
            user_id,
            extra,
            stop_rx,
        ));
        Ok(())
    }

    /// Allocate and arm in one step.
    pub fn set_timer(&self, owner: TaskHandle, desc: TimerDescriptor) -> Result<usize> {
        let tid = self.get_timer(owner, desc)?;
        self.start_timer(owner, tid)?;
        Ok(tid)
    }

    /// Stop a timer. Idempotent: a slot that is already empty, or a
    /// timer that expired before the stop arrived, reports success. The
    /// owner may still observe an expiry event that was already in its
    /// mailbox.
    pub async fn kill_timer(&self, owner: TaskHandle, tid: usize) -> Result<()> {
        if tid >= MAX_TASK_TIMERS {
            return Err(Error::parameter(format!("timer slot out of range: {tid}")));
        }
        let shared = self.task_shared(owner)?;

        let stop_tx: Option<StopSender> = {
            let mut table = shared.timers.lock();
            match table.get(tid) {
                None => None,
                Some(id) => {
                    let mut reg = self.registry();
                    match reg.timer_ctl(id).map(|ctl| (ctl.armed, ctl.stop_tx.clone())) {
                        None => {
                            // stale table entry for a node already freed
                            table.remove_id(id);
                            None
                        }
                        Some((false, _)) => {
                            // never armed: no unit to wait for
                            table.remove_id(id);
                            reg.release_timer(id);
                            None
                        }
                        Some((true, stop_tx)) => Some(stop_tx),
                    }
                }
            }
        };

        // task lock released; the unit needs it to clean up
        if let Some(stop_tx) = stop_tx {
            let (ack_tx, ack_rx) = oneshot::channel();
            if stop_tx.send(ack_tx).await.is_err() {
                // unit already expired and cleaned up
                return Ok(());
            }
            let _ = ack_rx.await;
        }
        Ok(())
    }

    /// Stop every timer a task owns; used during task teardown.
    pub async fn kill_all_task_timers(&self, owner: TaskHandle) -> Result<()> {
        let shared = self.task_shared(owner)?;
        let tids = { shared.timers.lock().occupied() };
        for tid in tids {
            self.kill_timer(owner, tid).await?;
        }
        Ok(())
    }

    /// Number of live timers across all tasks.
    pub fn live_timer_count(&self) -> usize {
        self.registry().live_timer_count()
    }
}

// ----------------------------------------------------------------------------
// Timer Unit
// ----------------------------------------------------------------------------

#[allow(clippy::too_many_arguments)]
async fn run_timer(
    sched: Scheduler,
    owner: TaskHandle,
    shared: Arc<TaskShared>,
    mailbox: mpsc::Sender<Message>,
    id: TimerId,
    name: String,
    kind: TimerKind,
    duration: Duration,
    user_id: u32,
    extra: Option<Vec<u8>>,
    mut stop_rx: StopReceiver,
) {
    match kind {
        TimerKind::Periodic => {
            let first = tokio::time::Instant::now() + duration;
            let mut ticker = tokio::time::interval_at(first, duration);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let msg = Message::new(
                            TaskHandle::TIMER,
                            owner,
                            EventBody::TimerExpired { user_id, extra: extra.clone() },
                        );
                        if mailbox.send(msg).await.is_err() {
                            debug!(timer = %name, user_id, "periodic timer owner gone, cleaning up");
                            detach_timer(&sched, &shared, id);
                            return;
                        }
                    }
                    ack = stop_rx.recv() => {
                        detach_timer(&sched, &shared, id);
                        if let Some(ack) = ack {
                            let _ = ack.send(true);
                        }
                        return;
                    }
                }
            }
        }
        TimerKind::Absolute => {
            tokio::select! {
                _ = tokio::time::sleep(duration) => {
                    let msg = Message::new(
                        TaskHandle::TIMER,
                        owner,
                        EventBody::TimerExpired { user_id, extra },
                    );
                    if mailbox.send(msg).await.is_err() {
                        debug!(timer = %name, user_id, "absolute timer owner gone");
                    }
                    detach_timer(&sched, &shared, id);
                }
                ack = stop_rx.recv() => {
                    detach_timer(&sched, &shared, id);
                    if let Some(ack) = ack {
                        let _ = ack.send(true);
                    }
                }
            }
        }
    }
}

/// Remove a timer from its owner's slot table and the scheduler's
/// arena. Task lock first, then the registry.
fn detach_timer(sched: &Scheduler, shared: &TaskShared, id: TimerId) {
    let mut table = shared.timers.lock();
    table.remove_id(id);
    let mut reg = sched.registry();
    reg.release_timer(id);
}
