//! Listener manager and datagram reader tasks
//!
//! The manager owns the UDP socket and its state machine; the reader is
//! a long-loop task draining the socket. Stopping goes through the
//! manager: it stops the reader task and drops its socket handle.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use lattice_core::config::{NetworkConfig, NetworkType};
use lattice_core::discovery::{DiscoveryMessage, MAX_DATAGRAM_SIZE};
use lattice_core::messages::{UdpDataRequest, UdpMsgIndication};
use lattice_core::{Error, Result};
use lattice_scheduler::{
    EventBody, ExitCode, Message, TaskContext, TaskDescriptor, TaskHandle, TaskLogic,
    NGB_MGR_NAME, UDP_READER_NAME,
};
use tokio::net::UdpSocket;
use tokio::sync::watch;
use tokio::time::timeout;
use tracing::{debug, info, trace, warn};

// ----------------------------------------------------------------------------
// Listener State
// ----------------------------------------------------------------------------

/// State machine of the listener manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListenerState {
    /// Not configured yet.
    Null,
    /// Configured but the socket is not bound.
    Inited,
    /// Socket bound, reader running.
    Started,
    /// Stopped; the configuration stays valid for a restart.
    Stopped,
}

// ----------------------------------------------------------------------------
// Listener Manager
// ----------------------------------------------------------------------------

/// Scheduler task owning the discovery UDP socket.
pub struct ListenerManager {
    cfg: NetworkConfig,
    state: ListenerState,
    socket: Option<Arc<UdpSocket>>,
    reader: Option<TaskHandle>,
    local_addr: watch::Sender<Option<SocketAddr>>,
}

impl ListenerManager {
    pub fn new(cfg: NetworkConfig) -> Self {
        let (local_addr, _) = watch::channel(None);
        Self {
            cfg,
            state: ListenerState::Null,
            socket: None,
            reader: None,
            local_addr,
        }
    }

    pub fn state(&self) -> ListenerState {
        self.state
    }

    /// Watch the address the socket actually bound to; `None` until the
    /// listener starts. Lets callers bind to port 0 and learn the real
    /// port.
    pub fn local_addr_watch(&self) -> watch::Receiver<Option<SocketAddr>> {
        self.local_addr.subscribe()
    }

    async fn power_on(&mut self, ctx: &TaskContext) -> Result<()> {
        if self.cfg.network_type == NetworkType::Static {
            // static peer lists need no discovery
            info!("static network, discovery listener not needed");
            return ctx.done(ExitCode::Normal);
        }
        self.state = ListenerState::Inited;
        ctx.send(ctx.handle(), EventBody::ListenerStart).await
    }

    async fn power_off(&mut self, ctx: &TaskContext) -> Result<()> {
        debug!("discovery listener powering off");
        if self.state == ListenerState::Started {
            if let Err(e) = self.proc_stop(ctx).await {
                warn!(error = %e, "listener stop during power-off failed");
            }
        }
        ctx.done(ExitCode::PowerOff)
    }

    async fn proc_start(&mut self, ctx: &TaskContext) -> Result<()> {
        if self.state != ListenerState::Inited && self.state != ListenerState::Stopped {
            return Err(Error::mismatched(format!(
                "listener cannot start from {:?}",
                self.state
            )));
        }

        let bind_addr = SocketAddr::new(self.cfg.local.ip, self.cfg.local.udp_port);
        let socket = Arc::new(UdpSocket::bind(bind_addr).await?);
        let local_addr = socket.local_addr()?;
        info!(addr = %local_addr, "discovery listener bound");

        let reader = UdpReader {
            socket: Arc::clone(&socket),
            read_timeout: self.cfg.udp_read_timeout,
        };
        let handle = ctx
            .scheduler()
            .create_task(TaskDescriptor::new(UDP_READER_NAME, reader).long_loop())?;

        self.socket = Some(socket);
        let _ = self.local_addr.send(Some(local_addr));
        self.reader = Some(handle);
        self.state = ListenerState::Started;
        Ok(())
    }

    async fn proc_stop(&mut self, ctx: &TaskContext) -> Result<()> {
        if self.state != ListenerState::Started {
            return Err(Error::mismatched(format!(
                "listener cannot stop from {:?}",
                self.state
            )));
        }
        self.socket = None;
        if let Some(reader) = self.reader.take() {
            ctx.scheduler().stop_task_handle(reader).await?;
        }
        self.state = ListenerState::Stopped;
        info!("discovery listener stopped");
        Ok(())
    }

    /// Write one datagram with the configured deadline.
    async fn send_datagram(&self, req: &UdpDataRequest) -> Result<()> {
        let socket = self
            .socket
            .as_ref()
            .ok_or_else(|| Error::mismatched("listener not started"))?;
        if req.payload.is_empty() {
            return Err(Error::parameter("empty datagram"));
        }
        if req.payload.len() > MAX_DATAGRAM_SIZE {
            return Err(Error::parameter(format!(
                "datagram too large: {} bytes",
                req.payload.len()
            )));
        }

        let sent = timeout(
            self.cfg.udp_write_timeout,
            socket.send_to(&req.payload, req.target),
        )
        .await
        .map_err(|_| {
            Error::Os(std::io::Error::new(
                std::io::ErrorKind::TimedOut,
                "datagram write deadline exceeded",
            ))
        })??;

        if sent != req.payload.len() {
            return Err(Error::Os(std::io::Error::new(
                std::io::ErrorKind::WriteZero,
                format!("short datagram write: {sent} of {}", req.payload.len()),
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl TaskLogic for ListenerManager {
    async fn handle(&mut self, ctx: &TaskContext, msg: Message) -> Result<()> {
        match msg.body {
            EventBody::PowerOn => self.power_on(ctx).await,
            EventBody::PowerOff => self.power_off(ctx).await,
            EventBody::ListenerStart => self.proc_start(ctx).await,
            EventBody::ListenerStop => self.proc_stop(ctx).await,
            EventBody::UdpDataReq(req) => self.send_datagram(&req).await,
            other => {
                debug!(event = other.kind(), "unexpected listener event");
                Err(Error::mismatched(format!("listener event: {}", other.kind())))
            }
        }
    }
}

// ----------------------------------------------------------------------------
// Datagram Reader
// ----------------------------------------------------------------------------

/// Long-loop task reading discovery datagrams off the shared socket.
pub struct UdpReader {
    socket: Arc<UdpSocket>,
    read_timeout: Duration,
}

impl UdpReader {
    async fn dispatch(&self, ctx: &TaskContext, ngb_mgr: TaskHandle, buf: &[u8], from: SocketAddr) {
        let message = match DiscoveryMessage::decode(buf) {
            Ok(message) => message,
            Err(e) => {
                debug!(%from, error = %e, "undecodable discovery datagram dropped");
                return;
            }
        };
        trace!(%from, kind = message.kind(), "discovery datagram");
        let ind = UdpMsgIndication { message, from };
        if let Err(e) = ctx.send(ngb_mgr, EventBody::UdpMsgInd(ind)).await {
            debug!(error = %e, "neighbor manager unreachable, indication dropped");
        }
    }
}

#[async_trait]
impl TaskLogic for UdpReader {
    async fn handle(&mut self, _ctx: &TaskContext, _msg: Message) -> Result<()> {
        Err(Error::parameter("datagram reader takes no messages"))
    }

    async fn run_long(&mut self, ctx: &TaskContext) -> Result<()> {
        let ngb_mgr = ctx.scheduler().get_task_by_name(NGB_MGR_NAME)?;
        let mut buf = vec![0u8; MAX_DATAGRAM_SIZE];
        debug!("datagram reader running");

        loop {
            match timeout(self.read_timeout, self.socket.recv_from(&mut buf)).await {
                // deadline: loop again so stop requests are observed
                Err(_) => continue,
                Ok(Ok((len, from))) => {
                    self.dispatch(ctx, ngb_mgr, &buf[..len], from).await;
                }
                Ok(Err(e)) if e.kind() == std::io::ErrorKind::WouldBlock => continue,
                Ok(Err(e)) => {
                    warn!(error = %e, "datagram read broken, reader exiting");
                    return Err(Error::Os(e));
                }
            }
        }
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_initial_state() {
        let mgr = ListenerManager::new(NetworkConfig::testing());
        assert_eq!(mgr.state(), ListenerState::Null);
        assert!(mgr.local_addr_watch().borrow().is_none());
    }
}
