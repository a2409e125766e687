//! Task and timer arenas
//!
//! The scheduler owns two fixed pools: task slots and timer slots. Both
//! hand out copyable handles carrying a generation counter, so a handle
//! to a released node turns into `NotFound` instead of reaching whatever
//! was recycled into the slot. The registry as a whole is the
//! "scheduler lock" level, the bottom of the lock order.

use std::any::Any;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use lattice_core::{Error, Result};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::error;

use crate::message::{ExitCode, Message};
use crate::task::{DieCallback, TaskLogic, TaskShared, WatchdogConfig};
use crate::timer::TimerKind;

/// Terminate on a broken bookkeeping invariant. Arena and free-list
/// corruption cannot be repaired in place; continuing would hand out
/// aliased slots.
pub(crate) fn bookkeeping_fault(what: &str) -> ! {
    error!("scheduler bookkeeping corrupted: {what}");
    std::process::abort();
}

// ----------------------------------------------------------------------------
// Handles
// ----------------------------------------------------------------------------

/// Opaque identifier of a registered task; stable for its lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TaskHandle {
    pub(crate) index: u32,
    pub(crate) gen: u32,
}

impl TaskHandle {
    /// Pseudo-handle used as the sender of scheduler-originated
    /// messages (power-on, power-off).
    pub const SCHEDULER: TaskHandle = TaskHandle {
        index: u32::MAX,
        gen: 0,
    };

    /// Pseudo-handle used as the sender of timer-expiry messages.
    pub const TIMER: TaskHandle = TaskHandle {
        index: u32::MAX - 1,
        gen: 0,
    };
}

/// Opaque identifier of a timer node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TimerId {
    pub(crate) index: u32,
    pub(crate) gen: u32,
}

// ----------------------------------------------------------------------------
// Task Slots
// ----------------------------------------------------------------------------

/// Lifecycle state of a task slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum TaskState {
    Free,
    Suspended,
    Running,
    Stopping,
}

/// Pieces handed to the dispatcher when it is spawned; held in the slot
/// until then.
pub(crate) struct SpawnParts {
    pub logic: Box<dyn TaskLogic>,
    pub mailbox_rx: Option<mpsc::Receiver<Message>>,
    pub done_rx: mpsc::Receiver<ExitCode>,
    pub stopped_tx: oneshot::Sender<ExitCode>,
    pub on_die: Option<DieCallback>,
}

/// Control block of a registered task.
pub(crate) struct TaskCtl {
    pub name: String,
    pub mailbox: Option<mpsc::Sender<Message>>,
    pub done_tx: mpsc::Sender<ExitCode>,
    pub stopped_rx: Option<oneshot::Receiver<ExitCode>>,
    pub spawn: Option<SpawnParts>,
    pub watchdog: WatchdogConfig,
    pub shared: Arc<TaskShared>,
    pub user_data: Option<Arc<dyn Any + Send + Sync>>,
    pub join: Option<JoinHandle<()>>,
}

pub(crate) struct TaskSlot {
    pub gen: u32,
    pub state: TaskState,
    pub ctl: Option<TaskCtl>,
}

// ----------------------------------------------------------------------------
// Timer Slots
// ----------------------------------------------------------------------------

/// Stop-request channel of one timer unit: the killer passes an ack
/// sender, the unit fires it once cleanup finished.
pub(crate) type StopSender = mpsc::Sender<oneshot::Sender<bool>>;
pub(crate) type StopReceiver = mpsc::Receiver<oneshot::Sender<bool>>;

/// Control block of a timer node.
pub(crate) struct TimerCtl {
    pub name: String,
    pub kind: TimerKind,
    pub duration: Duration,
    pub user_id: u32,
    pub extra: Option<Vec<u8>>,
    pub owner: TaskHandle,
    pub armed: bool,
    pub stop_tx: StopSender,
    /// Held here until the timer is armed, then moved into the unit.
    pub stop_rx: Option<StopReceiver>,
}

pub(crate) struct TimerSlot {
    pub gen: u32,
    pub ctl: Option<TimerCtl>,
}

// ----------------------------------------------------------------------------
// Registry
// ----------------------------------------------------------------------------

pub(crate) struct Registry {
    task_slots: Vec<TaskSlot>,
    task_free: Vec<u32>,
    busy: HashSet<u32>,
    names: HashMap<String, TaskHandle>,
    timer_slots: Vec<TimerSlot>,
    timer_free: Vec<u32>,
    /// Global timer index: every live timer is reachable from here.
    timer_owners: HashMap<TimerId, TaskHandle>,
}

impl Registry {
    pub fn new(task_pool_size: usize, timer_pool_size: usize) -> Self {
        let task_slots = (0..task_pool_size)
            .map(|_| TaskSlot {
                gen: 0,
                state: TaskState::Free,
                ctl: None,
            })
            .collect();
        let timer_slots = (0..timer_pool_size)
            .map(|_| TimerSlot { gen: 0, ctl: None })
            .collect();
        Self {
            task_slots,
            task_free: (0..task_pool_size as u32).rev().collect(),
            busy: HashSet::new(),
            names: HashMap::new(),
            timer_slots,
            timer_free: (0..timer_pool_size as u32).rev().collect(),
            timer_owners: HashMap::new(),
        }
    }

    // ── Task pool ───────────────────────────────────────────────────────

    pub fn alloc_task(&mut self) -> Result<TaskHandle> {
        let index = self
            .task_free
            .pop()
            .ok_or_else(|| Error::resource("task pool exhausted"))?;
        let slot = &mut self.task_slots[index as usize];
        assert!(
            slot.state == TaskState::Free && slot.ctl.is_none(),
            "task free list corrupted at slot {index}"
        );
        slot.state = TaskState::Suspended;
        Ok(TaskHandle {
            index,
            gen: slot.gen,
        })
    }

    /// Undo an allocation that never registered a control block.
    pub fn rollback_alloc(&mut self, handle: TaskHandle) {
        let slot = &mut self.task_slots[handle.index as usize];
        slot.gen = slot.gen.wrapping_add(1);
        slot.state = TaskState::Free;
        slot.ctl = None;
        self.task_free.push(handle.index);
    }

    pub fn task_slot(&self, handle: TaskHandle) -> Result<&TaskSlot> {
        let slot = self
            .task_slots
            .get(handle.index as usize)
            .ok_or_else(|| Error::not_found("task handle out of range"))?;
        if slot.gen != handle.gen || slot.state == TaskState::Free {
            return Err(Error::not_found("task handle stale"));
        }
        Ok(slot)
    }

    pub fn task_slot_mut(&mut self, handle: TaskHandle) -> Result<&mut TaskSlot> {
        let slot = self
            .task_slots
            .get_mut(handle.index as usize)
            .ok_or_else(|| Error::not_found("task handle out of range"))?;
        if slot.gen != handle.gen || slot.state == TaskState::Free {
            return Err(Error::not_found("task handle stale"));
        }
        Ok(slot)
    }

    pub fn ctl(&self, handle: TaskHandle) -> Result<&TaskCtl> {
        Ok(self
            .task_slot(handle)?
            .ctl
            .as_ref()
            .unwrap_or_else(|| bookkeeping_fault("live task slot without control block")))
    }

    pub fn ctl_mut(&mut self, handle: TaskHandle) -> Result<&mut TaskCtl> {
        Ok(self
            .task_slot_mut(handle)?
            .ctl
            .as_mut()
            .unwrap_or_else(|| bookkeeping_fault("live task slot without control block")))
    }

    /// Return a reaped task's slot to the free list and drop its name.
    pub fn finalize_release(&mut self, handle: TaskHandle) {
        let slot = &mut self.task_slots[handle.index as usize];
        if slot.gen != handle.gen {
            return;
        }
        assert!(
            slot.state != TaskState::Free,
            "double release of task slot {}",
            handle.index
        );
        if let Some(ctl) = slot.ctl.take() {
            if !ctl.name.is_empty() {
                self.names.remove(&ctl.name);
            }
        }
        slot.gen = slot.gen.wrapping_add(1);
        slot.state = TaskState::Free;
        self.busy.remove(&handle.index);
        self.task_free.push(handle.index);
    }

    // ── Busy set ────────────────────────────────────────────────────────

    pub fn busy_insert(&mut self, index: u32) {
        self.busy.insert(index);
    }

    pub fn busy_remove(&mut self, index: u32) -> Result<()> {
        if !self.busy.remove(&index) {
            return Err(Error::internal(format!(
                "task {index} missing from busy set"
            )));
        }
        Ok(())
    }

    pub fn busy_handles(&self) -> Vec<TaskHandle> {
        self.busy
            .iter()
            .map(|&index| TaskHandle {
                index,
                gen: self.task_slots[index as usize].gen,
            })
            .collect()
    }

    // ── Name map ────────────────────────────────────────────────────────

    pub fn register_name(&mut self, name: &str, handle: TaskHandle) -> Result<()> {
        if self.names.contains_key(name) {
            return Err(Error::duplicated(format!("task name: {name}")));
        }
        self.names.insert(name.to_string(), handle);
        Ok(())
    }

    pub fn lookup_name(&self, name: &str) -> Option<TaskHandle> {
        self.names.get(name).copied()
    }

    // ── Timer pool ──────────────────────────────────────────────────────

    pub fn alloc_timer(&mut self, ctl: TimerCtl) -> Result<TimerId> {
        let index = self
            .timer_free
            .pop()
            .ok_or_else(|| Error::resource("timer pool exhausted"))?;
        let slot = &mut self.timer_slots[index as usize];
        assert!(
            slot.ctl.is_none(),
            "timer free list corrupted at slot {index}"
        );
        let id = TimerId {
            index,
            gen: slot.gen,
        };
        self.timer_owners.insert(id, ctl.owner);
        slot.ctl = Some(ctl);
        Ok(id)
    }

    pub fn timer_ctl(&self, id: TimerId) -> Option<&TimerCtl> {
        let slot = self.timer_slots.get(id.index as usize)?;
        if slot.gen != id.gen {
            return None;
        }
        slot.ctl.as_ref()
    }

    pub fn timer_ctl_mut(&mut self, id: TimerId) -> Option<&mut TimerCtl> {
        let slot = self.timer_slots.get_mut(id.index as usize)?;
        if slot.gen != id.gen {
            return None;
        }
        slot.ctl.as_mut()
    }

    /// Clear a timer node and return it to the free list; idempotent.
    pub fn release_timer(&mut self, id: TimerId) {
        let Some(slot) = self.timer_slots.get_mut(id.index as usize) else {
            return;
        };
        if slot.gen != id.gen || slot.ctl.is_none() {
            return;
        }
        slot.ctl = None;
        slot.gen = slot.gen.wrapping_add(1);
        self.timer_owners.remove(&id);
        self.timer_free.push(id.index);
    }

    // ── Introspection ───────────────────────────────────────────────────

    pub fn free_task_count(&self) -> usize {
        self.task_free.len()
    }

    pub fn busy_task_count(&self) -> usize {
        self.busy.len()
    }

    pub fn live_timer_count(&self) -> usize {
        self.timer_owners.len()
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------
