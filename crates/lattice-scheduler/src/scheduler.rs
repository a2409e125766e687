//! Scheduler core
//!
//! Owns the task and timer arenas, routes messages by task identity and
//! orchestrates power-on and power-off. Each running task gets a private
//! dispatcher that selects over its mailbox and its done channel;
//! in-flight handlers always run to completion, stop signals are
//! observed between messages.

use std::any::Any;
use std::collections::HashMap;
use std::sync::Arc;

use lattice_core::config::SchedulerConfig;
use lattice_core::{Error, Result};
use parking_lot::{Mutex, MutexGuard};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info, warn};

use crate::message::{EventBody, ExitCode, Message};
use crate::registry::{bookkeeping_fault, Registry, SpawnParts, TaskCtl, TaskHandle, TaskState};
use crate::task::{CreateFlag, DieCallback, TaskContext, TaskDescriptor, TaskShared};

// ----------------------------------------------------------------------------
// Scheduler
// ----------------------------------------------------------------------------

/// Handle to one scheduler instance. Cheap to clone; all clones share
/// the same registry.
#[derive(Clone)]
pub struct Scheduler {
    inner: Arc<SchedInner>,
}

struct SchedInner {
    cfg: SchedulerConfig,
    registry: Mutex<Registry>,
}

impl Scheduler {
    /// Create a scheduler with validated configuration.
    pub fn new(cfg: SchedulerConfig) -> Result<Self> {
        cfg.validate().map_err(Error::Parameter)?;
        let registry = Registry::new(cfg.task_pool_size, cfg.timer_pool_size);
        Ok(Self {
            inner: Arc::new(SchedInner {
                cfg,
                registry: Mutex::new(registry),
            }),
        })
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.inner.cfg
    }

    pub(crate) fn registry(&self) -> MutexGuard<'_, Registry> {
        self.inner.registry.lock()
    }

    pub(crate) fn task_shared(&self, handle: TaskHandle) -> Result<Arc<TaskShared>> {
        Ok(self.registry().ctl(handle)?.shared.clone())
    }

    pub(crate) fn task_mailbox(&self, handle: TaskHandle) -> Result<mpsc::Sender<Message>> {
        self.registry()
            .ctl(handle)?
            .mailbox
            .clone()
            .ok_or_else(|| Error::parameter("task has no mailbox"))
    }

    // ── Task lifecycle ──────────────────────────────────────────────────

    /// Register a task. With [`CreateFlag::RunningOnCreate`] the
    /// dispatcher is spawned immediately; otherwise the task stays
    /// suspended until `start_task`.
    pub fn create_task(&self, desc: TaskDescriptor) -> Result<TaskHandle> {
        let TaskDescriptor {
            name,
            mailbox_size,
            watchdog,
            flag,
            on_die,
            logic,
        } = desc;
        let name = name.trim().to_string();
        let mailbox_size = mailbox_size.unwrap_or(self.inner.cfg.default_mailbox_size);

        let (mailbox_tx, mailbox_rx) = if mailbox_size > 0 {
            let (tx, rx) = mpsc::channel(mailbox_size);
            (Some(tx), Some(rx))
        } else {
            // long-loop task: entry invoked once, no dispatch loop
            (None, None)
        };
        let (done_tx, done_rx) = mpsc::channel(1);
        let (stopped_tx, stopped_rx) = oneshot::channel();
        let shared = Arc::new(TaskShared::new(watchdog.enabled));

        let handle = {
            let mut reg = self.registry();
            let handle = reg.alloc_task()?;
            if !name.is_empty() {
                if let Err(e) = reg.register_name(&name, handle) {
                    reg.rollback_alloc(handle);
                    return Err(e);
                }
            }
            let slot = reg.task_slot_mut(handle)?;
            slot.ctl = Some(TaskCtl {
                name: name.clone(),
                mailbox: mailbox_tx,
                done_tx,
                stopped_rx: Some(stopped_rx),
                spawn: Some(SpawnParts {
                    logic,
                    mailbox_rx,
                    done_rx,
                    stopped_tx,
                    on_die,
                }),
                watchdog,
                shared,
                user_data: None,
                join: None,
            });
            reg.busy_insert(handle.index);
            handle
        };

        debug!(task = %name, ?handle, "task created");
        if flag == CreateFlag::RunningOnCreate {
            self.spawn_dispatcher(handle)?;
        }
        Ok(handle)
    }

    /// Start a suspended task by name.
    pub fn start_task(&self, name: &str) -> Result<()> {
        let handle = self.get_task_by_name(name)?;
        self.start_task_handle(handle)
    }

    /// Start a suspended task by handle. Any other state is rejected.
    pub fn start_task_handle(&self, handle: TaskHandle) -> Result<()> {
        self.spawn_dispatcher(handle)
    }

    fn spawn_dispatcher(&self, handle: TaskHandle) -> Result<()> {
        let (parts, shared, name) = {
            let mut reg = self.registry();
            let slot = reg.task_slot_mut(handle)?;
            if slot.state != TaskState::Suspended {
                return Err(Error::mismatched(format!(
                    "task not suspended: {:?}",
                    slot.state
                )));
            }
            let ctl = slot
                .ctl
                .as_mut()
                .unwrap_or_else(|| bookkeeping_fault("live task slot without control block"));
            let parts = ctl
                .spawn
                .take()
                .unwrap_or_else(|| bookkeeping_fault("suspended task without spawn parts"));
            let shared = ctl.shared.clone();
            let name = ctl.name.clone();
            slot.state = TaskState::Running;
            (parts, shared, name)
        };

        let sched = self.clone();
        let join = tokio::spawn(run_dispatch(sched, handle, name, shared, parts));
        let mut reg = self.registry();
        if let Ok(ctl) = reg.ctl_mut(handle) {
            ctl.join = Some(join);
        }
        Ok(())
    }

    /// Stop a task by name. Must never be called by the task on itself.
    pub async fn stop_task(&self, name: &str) -> Result<ExitCode> {
        let handle = self.get_task_by_name(name)?;
        self.stop_task_handle(handle).await
    }

    /// Stop a task by handle: signal its done channel and block until
    /// the dispatcher acknowledges through the stopped channel.
    pub async fn stop_task_handle(&self, handle: TaskHandle) -> Result<ExitCode> {
        enum Stop {
            Signal {
                done: mpsc::Sender<ExitCode>,
                stopped: oneshot::Receiver<ExitCode>,
            },
            ReapSuspended {
                name: String,
                parts: Box<SpawnParts>,
            },
        }

        let action = {
            let mut reg = self.registry();
            let slot = reg.task_slot_mut(handle)?;
            let state = slot.state;
            let ctl = slot
                .ctl
                .as_mut()
                .unwrap_or_else(|| bookkeeping_fault("live task slot without control block"));
            match state {
                TaskState::Suspended => {
                    let parts = ctl
                        .spawn
                        .take()
                        .unwrap_or_else(|| bookkeeping_fault("suspended task without spawn parts"));
                    let name = ctl.name.clone();
                    slot.state = TaskState::Stopping;
                    Stop::ReapSuspended {
                        name,
                        parts: Box::new(parts),
                    }
                }
                TaskState::Running => {
                    let stopped = ctl
                        .stopped_rx
                        .take()
                        .ok_or_else(|| Error::mismatched("task already being stopped"))?;
                    let done = ctl.done_tx.clone();
                    slot.state = TaskState::Stopping;
                    Stop::Signal { done, stopped }
                }
                TaskState::Stopping => return Err(Error::mismatched("task already stopping")),
                TaskState::Free => return Err(Error::not_found("task slot free")),
            }
        };

        match action {
            Stop::Signal { done, stopped } => {
                let _ = done.send(ExitCode::Killed).await;
                Ok(stopped.await.unwrap_or(ExitCode::Fault))
            }
            Stop::ReapSuspended { name, parts } => {
                let mut parts = *parts;
                let _ = parts.stopped_tx.send(ExitCode::Killed);
                reap(self, handle, &name, parts.on_die.as_mut()).await;
                Ok(ExitCode::Killed)
            }
        }
    }

    /// Alias for [`Scheduler::stop_task`].
    pub async fn delete_task(&self, name: &str) -> Result<ExitCode> {
        self.stop_task(name).await
    }

    /// Report a task done. Called by a task on itself; never waits for
    /// the teardown (the dispatcher drains the done channel only after
    /// the current handler returns).
    pub fn task_done(&self, handle: TaskHandle, code: ExitCode) -> Result<()> {
        let done = { self.registry().ctl(handle)?.done_tx.clone() };
        match done.try_send(code) {
            Ok(()) => Ok(()),
            // someone already signaled; first signal wins
            Err(mpsc::error::TrySendError::Full(_)) => Ok(()),
            Err(mpsc::error::TrySendError::Closed(_)) => {
                Err(Error::not_found("task already torn down"))
            }
        }
    }

    // ── Messaging ───────────────────────────────────────────────────────

    /// Deliver a message to its receiver's mailbox. Blocks when the
    /// mailbox is full (bounded backpressure).
    pub async fn send_message(&self, msg: Message) -> Result<()> {
        let tx = {
            let reg = self.registry();
            let ctl = reg.ctl(msg.receiver)?;
            ctl.mailbox
                .clone()
                .ok_or_else(|| Error::parameter("receiver is a long-loop task"))?
        };
        tx.send(msg)
            .await
            .map_err(|_| Error::not_found("receiver mailbox closed"))
    }

    // ── Lookup and user data ────────────────────────────────────────────

    pub fn get_task_by_name(&self, name: &str) -> Result<TaskHandle> {
        self.registry()
            .lookup_name(name)
            .ok_or_else(|| Error::not_found(format!("task name: {name}")))
    }

    pub fn task_name(&self, handle: TaskHandle) -> Result<String> {
        Ok(self.registry().ctl(handle)?.name.clone())
    }

    pub fn set_user_data(
        &self,
        handle: TaskHandle,
        data: Arc<dyn Any + Send + Sync>,
    ) -> Result<()> {
        self.registry().ctl_mut(handle)?.user_data = Some(data);
        Ok(())
    }

    pub fn get_user_data(&self, handle: TaskHandle) -> Result<Option<Arc<dyn Any + Send + Sync>>> {
        Ok(self.registry().ctl(handle)?.user_data.clone())
    }

    /// Whether the task is currently inside a message handler
    /// (watchdog flag).
    pub fn task_in_handler(&self, handle: TaskHandle) -> Result<bool> {
        Ok(self.task_shared(handle)?.in_handler())
    }

    /// Watchdog parameters a task was registered with, for external
    /// monitors.
    pub fn task_watchdog(&self, handle: TaskHandle) -> Result<crate::task::WatchdogConfig> {
        Ok(self.registry().ctl(handle)?.watchdog)
    }

    // ── Power orchestration ─────────────────────────────────────────────

    /// Create every static task and power the system on. Tasks whose
    /// descriptor says [`CreateFlag::RunningOnCreate`] receive a
    /// power-on message; suspended entries get a dispatcher but no
    /// power-on. Every name in `power_on` is sent power-on explicitly.
    pub async fn start(
        &self,
        tasks: Vec<TaskDescriptor>,
        power_on: &[&str],
    ) -> Result<HashMap<String, TaskHandle>> {
        if tasks.is_empty() {
            return Err(Error::parameter("static task table is empty"));
        }
        info!("starting scheduler with {} static task(s)", tasks.len());

        let mut by_name = HashMap::new();
        for mut desc in tasks {
            let wants_power_on = desc.flag == CreateFlag::RunningOnCreate;
            // static tasks always get their dispatcher; the flag only
            // decides whether power-on is delivered now
            desc.flag = CreateFlag::RunningOnCreate;
            let name = desc.name.trim().to_string();
            let handle = self.create_task(desc)?;
            if !name.is_empty() {
                by_name.insert(name, handle);
            }
            if wants_power_on {
                self.send_message(Message::new(
                    TaskHandle::SCHEDULER,
                    handle,
                    EventBody::PowerOn,
                ))
                .await?;
            }
        }

        for name in power_on {
            let handle = self.get_task_by_name(name)?;
            self.send_message(Message::new(
                TaskHandle::SCHEDULER,
                handle,
                EventBody::PowerOn,
            ))
            .await?;
        }

        info!("scheduler running");
        Ok(by_name)
    }

    /// Broadcast power-off to every live task and wait for each to
    /// report itself done. Tasks that miss the grace period are
    /// aborted and their slots reclaimed.
    pub async fn stop(&self) -> Result<()> {
        info!("scheduler powering off");

        enum Pending {
            Running {
                handle: TaskHandle,
                name: String,
                mailbox: Option<mpsc::Sender<Message>>,
                done: mpsc::Sender<ExitCode>,
                stopped: Option<oneshot::Receiver<ExitCode>>,
                join: Option<tokio::task::JoinHandle<()>>,
            },
            Suspended {
                handle: TaskHandle,
                name: String,
                parts: Box<SpawnParts>,
            },
        }

        let mut pending = Vec::new();
        {
            let mut reg = self.registry();
            for handle in reg.busy_handles() {
                let Ok(slot) = reg.task_slot_mut(handle) else {
                    continue;
                };
                let state = slot.state;
                let Some(ctl) = slot.ctl.as_mut() else {
                    continue;
                };
                match state {
                    TaskState::Suspended => {
                        if let Some(parts) = ctl.spawn.take() {
                            let name = ctl.name.clone();
                            slot.state = TaskState::Stopping;
                            pending.push(Pending::Suspended {
                                handle,
                                name,
                                parts: Box::new(parts),
                            });
                        }
                    }
                    TaskState::Running => {
                        pending.push(Pending::Running {
                            handle,
                            name: ctl.name.clone(),
                            mailbox: ctl.mailbox.clone(),
                            done: ctl.done_tx.clone(),
                            stopped: ctl.stopped_rx.take(),
                            join: ctl.join.take(),
                        });
                    }
                    TaskState::Stopping | TaskState::Free => {}
                }
            }
        }

        for entry in &pending {
            if let Pending::Running {
                handle,
                name,
                mailbox,
                done,
                ..
            } = entry
            {
                match mailbox {
                    Some(mailbox) => {
                        let msg =
                            Message::new(TaskHandle::SCHEDULER, *handle, EventBody::PowerOff);
                        if mailbox.try_send(msg).is_err() {
                            // mailbox jammed; fall back to the done channel
                            warn!(task = %name, "power-off undeliverable, signaling done");
                            let _ = done.try_send(ExitCode::PowerOff);
                        }
                    }
                    None => {
                        // long-loop task: no mailbox to observe power-off on
                        let _ = done.try_send(ExitCode::PowerOff);
                    }
                }
            }
        }

        let grace = self.inner.cfg.stop_grace;
        for entry in pending {
            match entry {
                Pending::Running {
                    handle,
                    name,
                    stopped,
                    join,
                    ..
                } => {
                    let acked = match stopped {
                        Some(stopped) => tokio::time::timeout(grace, stopped).await.is_ok(),
                        // someone else is stopping this task; let them
                        None => true,
                    };
                    if !acked {
                        warn!(task = %name, "task missed power-off grace period, aborting");
                        if let Some(join) = join {
                            join.abort();
                        }
                        let mut reg = self.registry();
                        reg.finalize_release(handle);
                    }
                }
                Pending::Suspended {
                    handle,
                    name,
                    parts,
                } => {
                    let mut parts = *parts;
                    let _ = parts.stopped_tx.send(ExitCode::PowerOff);
                    reap(self, handle, &name, parts.on_die.as_mut()).await;
                }
            }
        }

        info!("scheduler stopped");
        Ok(())
    }

    // ── Introspection ───────────────────────────────────────────────────

    pub fn task_pool_size(&self) -> usize {
        self.inner.cfg.task_pool_size
    }

    pub fn free_task_count(&self) -> usize {
        self.registry().free_task_count()
    }

    pub fn busy_task_count(&self) -> usize {
        self.registry().busy_task_count()
    }
}

// ----------------------------------------------------------------------------
// Dispatcher
// ----------------------------------------------------------------------------

async fn run_dispatch(
    sched: Scheduler,
    handle: TaskHandle,
    name: String,
    shared: Arc<TaskShared>,
    parts: SpawnParts,
) {
    let ctx = TaskContext::new(handle, sched.clone());
    let SpawnParts {
        mut logic,
        mailbox_rx,
        mut done_rx,
        stopped_tx,
        mut on_die,
    } = parts;

    let exit = match mailbox_rx {
        Some(mut mailbox_rx) => {
            let code = loop {
                tokio::select! {
                    maybe = mailbox_rx.recv() => match maybe {
                        Some(msg) => {
                            shared.enter_handler();
                            if let Err(e) = logic.handle(&ctx, msg).await {
                                debug!(task = %name, error = %e, "task handler returned error");
                            }
                            shared.exit_handler();
                        }
                        None => break ExitCode::Fault,
                    },
                    code = done_rx.recv() => break code.unwrap_or(ExitCode::Fault),
                }
            };
            // closing the mailbox lets blocked senders (timers included)
            // fail fast while the task unwinds
            drop(mailbox_rx);
            code
        }
        None => {
            // long-loop task: run the entry once, watch for completion
            let long_ctx = ctx.clone();
            let mut unit = tokio::spawn(async move { logic.run_long(&long_ctx).await });
            tokio::select! {
                res = &mut unit => match res {
                    Ok(Ok(())) => ExitCode::Normal,
                    Ok(Err(e)) => {
                        debug!(task = %name, error = %e, "long-loop task failed");
                        ExitCode::Fault
                    }
                    Err(e) => {
                        error!(task = %name, error = %e, "long-loop task panicked");
                        ExitCode::Fault
                    }
                },
                code = done_rx.recv() => {
                    unit.abort();
                    let _ = unit.await;
                    code.unwrap_or(ExitCode::Fault)
                }
            }
        }
    };

    debug!(task = %name, ?exit, "task leaving dispatch loop");
    // unblock an external stop_task first, then clean up
    let _ = stopped_tx.send(exit);
    reap(&sched, handle, &name, on_die.as_mut()).await;
}

/// Tear a task down: busy dequeue, die callback, kill owned timers,
/// reset the slot and return it to the free list.
pub(crate) async fn reap(
    sched: &Scheduler,
    handle: TaskHandle,
    name: &str,
    on_die: Option<&mut DieCallback>,
) {
    {
        let mut reg = sched.registry();
        if let Err(e) = reg.busy_remove(handle.index) {
            error!(task = %name, error = %e, "busy dequeue failed during reap");
            if matches!(e, Error::Internal(_)) {
                // busy-set corruption is unrecoverable
                std::process::abort();
            }
        }
        if let Ok(slot) = reg.task_slot_mut(handle) {
            slot.state = TaskState::Stopping;
        }
    }

    if let Some(cb) = on_die {
        if let Err(e) = cb(handle) {
            warn!(task = %name, error = %e, "die callback failed");
        }
    }

    if let Err(e) = sched.kill_all_task_timers(handle).await {
        warn!(task = %name, error = %e, "killing task timers failed");
    }

    let mut reg = sched.registry();
    reg.finalize_release(handle);
    debug!(task = %name, "task reaped");
}
