//! Scheduler lifecycle integration tests
//!
//! Exercises task creation, message ordering, timers and the power-off
//! sweep through the public scheduler API, with probe-recording tasks
//! standing in for real managers.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use lattice_core::config::SchedulerConfig;
use lattice_core::Result;
use lattice_scheduler::{
    EventBody, ExitCode, Message, Scheduler, TaskContext, TaskDescriptor, TaskLogic,
    TimerDescriptor,
};
use parking_lot::Mutex;
use tokio::time::{sleep, timeout};

// ----------------------------------------------------------------------------
// Test Tasks
// ----------------------------------------------------------------------------

/// Records every probe and timer event it sees; self-dones on power-off.
struct Recorder {
    log: Arc<Mutex<Vec<u64>>>,
}

#[async_trait]
impl TaskLogic for Recorder {
    async fn handle(&mut self, ctx: &TaskContext, msg: Message) -> Result<()> {
        match msg.body {
            EventBody::PowerOn => {}
            EventBody::PowerOff => ctx.done(ExitCode::PowerOff)?,
            EventBody::Probe(n) => self.log.lock().push(n),
            EventBody::TimerExpired { user_id, .. } => self.log.lock().push(u64::from(user_id)),
            _ => {}
        }
        Ok(())
    }
}

/// Long-loop task that never returns on its own.
struct Spinner;

#[async_trait]
impl TaskLogic for Spinner {
    async fn handle(&mut self, _ctx: &TaskContext, _msg: Message) -> Result<()> {
        Ok(())
    }

    async fn run_long(&mut self, _ctx: &TaskContext) -> Result<()> {
        loop {
            sleep(Duration::from_millis(20)).await;
        }
    }
}

fn recorder() -> (Recorder, Arc<Mutex<Vec<u64>>>) {
    let log = Arc::new(Mutex::new(Vec::new()));
    (Recorder { log: log.clone() }, log)
}

fn test_scheduler() -> Scheduler {
    Scheduler::new(SchedulerConfig::testing()).expect("valid testing config")
}

/// Poll until every slot is back on the free list or the deadline hits.
async fn wait_all_free(sched: &Scheduler) {
    timeout(Duration::from_secs(5), async {
        while sched.free_task_count() != sched.task_pool_size() {
            sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("tasks should all be reaped");
}

// ----------------------------------------------------------------------------
// Power Orchestration
// ----------------------------------------------------------------------------

#[tokio::test]
async fn test_static_start_then_power_off_returns_all_slots() {
    let sched = test_scheduler();
    let pool = sched.task_pool_size();

    let mut tasks = Vec::new();
    let mut logs = Vec::new();
    for i in 0..4 {
        let (logic, log) = recorder();
        logs.push(log);
        tasks.push(TaskDescriptor::new(format!("mgr{i}"), logic).with_mailbox(8));
    }

    let by_name = sched.start(tasks, &[]).await.unwrap();
    assert_eq!(by_name.len(), 4);
    assert_eq!(sched.busy_task_count(), 4);
    assert_eq!(sched.free_task_count(), pool - 4);

    sched.stop().await.unwrap();
    wait_all_free(&sched).await;
    assert_eq!(sched.busy_task_count(), 0);
    assert_eq!(sched.live_timer_count(), 0);
}

#[tokio::test]
async fn test_power_on_list_reaches_suspended_flag_tasks() {
    let sched = test_scheduler();
    let (powered, powered_log) = recorder();
    let (quiet, quiet_log) = recorder();

    // both entries get dispatchers; only the power-on list entry hears
    // power-on, which we make visible by probing right after
    let tasks = vec![
        TaskDescriptor::new("powered", powered).suspended(),
        TaskDescriptor::new("quiet", quiet).suspended(),
    ];
    let by_name = sched.start(tasks, &["powered"]).await.unwrap();

    let handle = by_name["powered"];
    sched
        .send_message(Message::new(handle, handle, EventBody::Probe(7)))
        .await
        .unwrap();

    sleep(Duration::from_millis(50)).await;
    assert_eq!(powered_log.lock().as_slice(), &[7]);
    assert!(quiet_log.lock().is_empty());

    sched.stop().await.unwrap();
    wait_all_free(&sched).await;
}

// ----------------------------------------------------------------------------
// Messaging
// ----------------------------------------------------------------------------

#[tokio::test]
async fn test_messages_are_fifo_per_task() {
    let sched = test_scheduler();
    let (logic, log) = recorder();
    let handle = sched
        .create_task(TaskDescriptor::new("fifo", logic).with_mailbox(16))
        .unwrap();

    for n in 0..100u64 {
        sched
            .send_message(Message::new(handle, handle, EventBody::Probe(n)))
            .await
            .unwrap();
    }

    timeout(Duration::from_secs(5), async {
        while log.lock().len() < 100 {
            sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("all probes delivered");

    let seen = log.lock().clone();
    assert_eq!(seen, (0..100).collect::<Vec<u64>>());

    sched.stop_task_handle(handle).await.unwrap();
    wait_all_free(&sched).await;
}

#[tokio::test]
async fn test_duplicate_names_and_stale_handles() {
    let sched = test_scheduler();
    let (a, _) = recorder();
    let (b, _) = recorder();

    let handle = sched.create_task(TaskDescriptor::new("only", a)).unwrap();
    assert!(sched.create_task(TaskDescriptor::new("only", b)).is_err());

    assert_eq!(sched.stop_task("only").await.unwrap(), ExitCode::Killed);
    wait_all_free(&sched).await;

    // handle now points at a reaped slot
    assert!(sched
        .send_message(Message::new(handle, handle, EventBody::Probe(0)))
        .await
        .is_err());
    assert!(sched.get_task_by_name("only").is_err());
}

#[tokio::test]
async fn test_suspended_task_queues_until_started() {
    let sched = test_scheduler();
    let (logic, log) = recorder();
    let handle = sched
        .create_task(TaskDescriptor::new("later", logic).suspended().with_mailbox(4))
        .unwrap();

    sched
        .send_message(Message::new(handle, handle, EventBody::Probe(1)))
        .await
        .unwrap();
    sleep(Duration::from_millis(30)).await;
    assert!(log.lock().is_empty());

    sched.start_task("later").unwrap();
    timeout(Duration::from_secs(2), async {
        while log.lock().is_empty() {
            sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("queued message delivered after start");

    // a running task cannot be started again
    assert!(sched.start_task_handle(handle).is_err());

    sched.stop_task_handle(handle).await.unwrap();
    wait_all_free(&sched).await;
}

// ----------------------------------------------------------------------------
// Timers
// ----------------------------------------------------------------------------

#[tokio::test]
async fn test_periodic_timer_fires_until_killed() {
    let sched = test_scheduler();
    let (logic, log) = recorder();
    let handle = sched
        .create_task(TaskDescriptor::new("ticker", logic).with_mailbox(16))
        .unwrap();

    let tid = sched
        .set_timer(
            handle,
            TimerDescriptor::periodic("beat", Duration::from_millis(20), 5),
        )
        .unwrap();
    assert_eq!(sched.live_timer_count(), 1);

    timeout(Duration::from_secs(2), async {
        while log.lock().len() < 3 {
            sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("periodic timer fired repeatedly");

    sched.kill_timer(handle, tid).await.unwrap();
    assert_eq!(sched.live_timer_count(), 0);
    // killing a dead slot is a successful no-op
    sched.kill_timer(handle, tid).await.unwrap();

    sched.stop_task_handle(handle).await.unwrap();
    wait_all_free(&sched).await;
}

#[tokio::test]
async fn test_absolute_timer_fires_once_and_cleans_up() {
    let sched = test_scheduler();
    let (logic, log) = recorder();
    let handle = sched
        .create_task(TaskDescriptor::new("oneshot", logic).with_mailbox(4))
        .unwrap();

    sched
        .set_timer(
            handle,
            TimerDescriptor::absolute("boom", Duration::from_millis(30), 9)
                .with_extra(vec![1, 2, 3]),
        )
        .unwrap();

    timeout(Duration::from_secs(2), async {
        while log.lock().is_empty() {
            sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("absolute timer fired");
    assert_eq!(log.lock().as_slice(), &[9]);

    // auto-cleaned after expiry
    timeout(Duration::from_secs(2), async {
        while sched.live_timer_count() != 0 {
            sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("absolute timer cleaned up");

    sched.stop_task_handle(handle).await.unwrap();
    wait_all_free(&sched).await;
}

#[tokio::test]
async fn test_task_stop_kills_owned_timers() {
    let sched = test_scheduler();
    let (logic, _log) = recorder();
    let handle = sched
        .create_task(TaskDescriptor::new("owner", logic).with_mailbox(16))
        .unwrap();

    for user_id in 0..3 {
        sched
            .set_timer(
                handle,
                TimerDescriptor::periodic("beat", Duration::from_millis(15), user_id),
            )
            .unwrap();
    }
    assert_eq!(sched.live_timer_count(), 3);

    sched.stop_task_handle(handle).await.unwrap();
    wait_all_free(&sched).await;
    assert_eq!(sched.live_timer_count(), 0);
}

// ----------------------------------------------------------------------------
// Long-Loop Tasks and Self-Termination
// ----------------------------------------------------------------------------

#[tokio::test]
async fn test_long_loop_task_stopped_externally() {
    let sched = test_scheduler();
    let handle = sched
        .create_task(TaskDescriptor::new("spinner", Spinner).long_loop())
        .unwrap();

    // messages cannot reach a long-loop task
    assert!(sched
        .send_message(Message::new(handle, handle, EventBody::Probe(0)))
        .await
        .is_err());

    sleep(Duration::from_millis(50)).await;
    assert_eq!(sched.stop_task_handle(handle).await.unwrap(), ExitCode::Killed);
    wait_all_free(&sched).await;
}

#[tokio::test]
async fn test_self_done_reaps_without_external_stop() {
    struct OneShot;

    #[async_trait]
    impl TaskLogic for OneShot {
        async fn handle(&mut self, ctx: &TaskContext, msg: Message) -> Result<()> {
            if let EventBody::Probe(_) = msg.body {
                ctx.done(ExitCode::Normal)?;
            }
            Ok(())
        }
    }

    let sched = test_scheduler();
    let handle = sched
        .create_task(TaskDescriptor::new("oneshot", OneShot).with_mailbox(2))
        .unwrap();
    sched
        .send_message(Message::new(handle, handle, EventBody::Probe(1)))
        .await
        .unwrap();

    wait_all_free(&sched).await;
    assert!(sched.get_task_by_name("oneshot").is_err());
}

#[tokio::test]
async fn test_die_callback_runs_on_teardown() {
    let sched = test_scheduler();
    let (logic, _) = recorder();
    let died = Arc::new(Mutex::new(false));
    let died_flag = died.clone();

    let desc = TaskDescriptor::new("mortal", logic).with_die_callback(Box::new(move |_| {
        *died_flag.lock() = true;
        Ok(())
    }));
    let handle = sched.create_task(desc).unwrap();

    sched.stop_task_handle(handle).await.unwrap();
    wait_all_free(&sched).await;
    assert!(*died.lock());
}
