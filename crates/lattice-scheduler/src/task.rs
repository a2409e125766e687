//! Task descriptors, the user-task trait and the per-task context
//!
//! A task is described once, registered with the scheduler, and from then
//! on driven purely by messages. The entry point is the [`TaskLogic`]
//! trait; ordinary tasks implement [`TaskLogic::handle`], long-loop tasks
//! (descriptors with a zero-size mailbox) implement
//! [`TaskLogic::run_long`] instead.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use lattice_core::{Error, Result};
use parking_lot::Mutex;
use std::collections::HashMap;

use crate::message::{EventBody, ExitCode, Message};
use crate::registry::{TaskHandle, TimerId};
use crate::scheduler::Scheduler;
use crate::timer::TimerDescriptor;

/// Number of timer slots each task owns.
pub const MAX_TASK_TIMERS: usize = 16;

// ----------------------------------------------------------------------------
// User-Task Trait
// ----------------------------------------------------------------------------

/// Entry points of a scheduler task.
#[async_trait]
pub trait TaskLogic: Send + 'static {
    /// Handle one mailbox message. Errors are logged by the dispatcher
    /// and do not terminate the task.
    async fn handle(&mut self, ctx: &TaskContext, msg: Message) -> Result<()>;

    /// Entry of a long-loop task (mailbox size 0): invoked once in its
    /// own concurrent unit instead of a dispatch loop. Returning ends
    /// the task.
    async fn run_long(&mut self, _ctx: &TaskContext) -> Result<()> {
        Err(Error::mismatched("task has no long-loop entry"))
    }
}

/// Callback invoked while a task is being torn down. Failures are logged
/// and do not stop the teardown.
pub type DieCallback = Box<dyn FnMut(TaskHandle) -> Result<()> + Send>;

// ----------------------------------------------------------------------------
// Watchdog
// ----------------------------------------------------------------------------

/// Liveness-check parameters for one task. The scheduler maintains the
/// "in handler" flag; an external monitor interprets cycle and threshold.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WatchdogConfig {
    pub enabled: bool,
    pub cycle: Duration,
    pub die_threshold: u32,
}

impl Default for WatchdogConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            cycle: Duration::from_secs(10),
            die_threshold: 2,
        }
    }
}

// ----------------------------------------------------------------------------
// Task Descriptor
// ----------------------------------------------------------------------------

/// Lifecycle flag at creation time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CreateFlag {
    /// The dispatcher is spawned later, by `start_task`.
    SuspendedOnCreate,
    /// The dispatcher is spawned immediately.
    RunningOnCreate,
}

/// Everything the scheduler needs to register one task.
pub struct TaskDescriptor {
    /// Task name; empty names are allowed but such tasks cannot be found
    /// by name.
    pub name: String,
    /// Mailbox capacity. `None` uses the scheduler default; `Some(0)`
    /// declares a long-loop task without a mailbox.
    pub mailbox_size: Option<usize>,
    pub watchdog: WatchdogConfig,
    pub flag: CreateFlag,
    pub on_die: Option<DieCallback>,
    pub logic: Box<dyn TaskLogic>,
}

impl TaskDescriptor {
    pub fn new(name: impl Into<String>, logic: impl TaskLogic) -> Self {
        Self {
            name: name.into(),
            mailbox_size: None,
            watchdog: WatchdogConfig::default(),
            flag: CreateFlag::RunningOnCreate,
            on_die: None,
            logic: Box::new(logic),
        }
    }

    pub fn with_mailbox(mut self, size: usize) -> Self {
        self.mailbox_size = Some(size);
        self
    }

    /// Declare a long-loop task: no mailbox, entry invoked once.
    pub fn long_loop(mut self) -> Self {
        self.mailbox_size = Some(0);
        self
    }

    pub fn suspended(mut self) -> Self {
        self.flag = CreateFlag::SuspendedOnCreate;
        self
    }

    pub fn with_watchdog(mut self, watchdog: WatchdogConfig) -> Self {
        self.watchdog = watchdog;
        self
    }

    pub fn with_die_callback(mut self, on_die: DieCallback) -> Self {
        self.on_die = Some(on_die);
        self
    }
}

// ----------------------------------------------------------------------------
// Per-Task Shared Block
// ----------------------------------------------------------------------------

/// Timer slot table of one task: slot -> timer node, plus the reverse
/// index used by cleanup paths.
#[derive(Debug)]
pub(crate) struct TimerTable {
    slots: [Option<TimerId>; MAX_TASK_TIMERS],
    index: HashMap<TimerId, usize>,
}

impl Default for TimerTable {
    fn default() -> Self {
        Self {
            slots: [None; MAX_TASK_TIMERS],
            index: HashMap::new(),
        }
    }
}

impl TimerTable {
    pub(crate) fn free_slot(&self) -> Option<usize> {
        self.slots.iter().position(|slot| slot.is_none())
    }

    pub(crate) fn get(&self, tid: usize) -> Option<TimerId> {
        self.slots.get(tid).copied().flatten()
    }

    pub(crate) fn insert(&mut self, tid: usize, id: TimerId) {
        self.slots[tid] = Some(id);
        self.index.insert(id, tid);
    }

    pub(crate) fn remove_id(&mut self, id: TimerId) {
        if let Some(tid) = self.index.remove(&id) {
            self.slots[tid] = None;
        }
    }

    pub(crate) fn occupied(&self) -> Vec<usize> {
        self.slots
            .iter()
            .enumerate()
            .filter_map(|(tid, slot)| slot.map(|_| tid))
            .collect()
    }
}

/// State shared between a task's dispatcher, its timers and the
/// scheduler. This is the "task lock" level: when both this lock and the
/// scheduler registry are needed, this one is taken first.
#[derive(Debug)]
pub struct TaskShared {
    pub(crate) timers: Mutex<TimerTable>,
    in_handler: AtomicBool,
    watchdog_enabled: bool,
}

impl TaskShared {
    pub(crate) fn new(watchdog_enabled: bool) -> Self {
        Self {
            timers: Mutex::new(TimerTable::default()),
            in_handler: AtomicBool::new(false),
            watchdog_enabled,
        }
    }

    pub(crate) fn enter_handler(&self) {
        if self.watchdog_enabled {
            self.in_handler.store(true, Ordering::Release);
        }
    }

    pub(crate) fn exit_handler(&self) {
        if self.watchdog_enabled {
            self.in_handler.store(false, Ordering::Release);
        }
    }

    /// Whether the task is currently inside a message handler; sampled
    /// by watchdog monitors.
    pub fn in_handler(&self) -> bool {
        self.in_handler.load(Ordering::Acquire)
    }
}

// ----------------------------------------------------------------------------
// Task Context
// ----------------------------------------------------------------------------

/// Handle a task uses to talk back to its scheduler.
#[derive(Clone)]
pub struct TaskContext {
    handle: TaskHandle,
    sched: Scheduler,
}

impl TaskContext {
    pub(crate) fn new(handle: TaskHandle, sched: Scheduler) -> Self {
        Self { handle, sched }
    }

    /// Handle of the task this context belongs to.
    pub fn handle(&self) -> TaskHandle {
        self.handle
    }

    pub fn scheduler(&self) -> &Scheduler {
        &self.sched
    }

    /// Send a message to another task; the sender is this task.
    pub async fn send(&self, to: TaskHandle, body: EventBody) -> Result<()> {
        self.sched
            .send_message(Message::new(self.handle, to, body))
            .await
    }

    /// Send a message to a task looked up by name.
    pub async fn send_to_name(&self, name: &str, body: EventBody) -> Result<()> {
        let to = self.sched.get_task_by_name(name)?;
        self.send(to, body).await
    }

    /// Report this task done. Must only be called by the task on itself;
    /// it does not wait for the teardown (that would deadlock).
    pub fn done(&self, code: ExitCode) -> Result<()> {
        self.sched.task_done(self.handle, code)
    }

    /// Allocate and arm a timer owned by this task.
    pub fn set_timer(&self, desc: TimerDescriptor) -> Result<usize> {
        self.sched.set_timer(self.handle, desc)
    }

    /// Stop one of this task's timers.
    pub async fn kill_timer(&self, tid: usize) -> Result<()> {
        self.sched.kill_timer(self.handle, tid).await
    }
}
