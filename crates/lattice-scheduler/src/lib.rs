//! Cooperative message-passing scheduler
//!
//! Tasks are registered by name, own a bounded mailbox and up to
//! [`task::MAX_TASK_TIMERS`] timers, and run one concurrent dispatcher
//! each: messages for a single task are handled strictly in send order,
//! and a task suspends only between messages. Timers are independent
//! concurrent units delivering expiry back through the owner's mailbox.
//!
//! The scheduler hands out integer [`TaskHandle`]s backed by a slot arena
//! with generation counters; a handle to a reaped task fails with
//! `NotFound` instead of aliasing a recycled slot.

pub mod message;
pub mod registry;
pub mod scheduler;
pub mod task;
pub mod timer;

pub use message::{EventBody, ExitCode, Message};
pub use registry::{TaskHandle, TimerId};
pub use scheduler::Scheduler;
pub use task::{
    CreateFlag, DieCallback, TaskContext, TaskDescriptor, TaskLogic, WatchdogConfig,
    MAX_TASK_TIMERS,
};
pub use timer::{TimerDescriptor, TimerKind};

// ----------------------------------------------------------------------------
// Well-Known Task Names
// ----------------------------------------------------------------------------

/// Chain shell manager.
pub const SHELL_MGR_NAME: &str = "shMgr";
/// Peer manager (collaborator).
pub const PEER_MGR_NAME: &str = "peMgr";
/// Routing table manager (collaborator).
pub const TAB_MGR_NAME: &str = "tabMgr";
/// Neighbor manager (collaborator).
pub const NGB_MGR_NAME: &str = "ngbMgr";
/// UDP discovery listener manager.
pub const NGB_LSN_NAME: &str = "ngbLsn";
/// UDP datagram reader.
pub const UDP_READER_NAME: &str = "udpReader";
