//! Shell manager task
//!
//! The scheduler task multiplexing chain traffic over active peer
//! sessions. Broadcast requests are deduplicated against the known-key
//! set, then negotiated per peer with check-key/report-key before the
//! payload is sent; inbound frames are filtered by a per-peer rx worker
//! before they reach the upstream inbox.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use lattice_core::config::{DedupConfig, NetworkConfig};
use lattice_core::frame::{BroadcastKind, GetChainData, PutChainData};
use lattice_core::messages::{
    BroadcastRequest, CloseReason, GetChainInfoRequest, GetChainInfoResponse, InboundFrame,
    PeerActiveInd, PeerAskToCloseInd, PeerCloseConfirm, PeerCloseRequest, ReconfigRequest,
};
use lattice_core::{
    ChainFrame, ContentKey, Error, FrameKind, KeyStatus, PeerKey, PeerStatus, Result,
};
use lattice_scheduler::{
    EventBody, ExitCode, Message, Scheduler, TaskContext, TaskHandle, TaskLogic, NGB_MGR_NAME,
    PEER_MGR_NAME, TAB_MGR_NAME,
};
use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info, trace, warn};

use crate::peer::{PeerEntry, PeerSnapshot};
use crate::timers::{EvictTarget, PendingKey, TickTimers, TimerToken};

// ----------------------------------------------------------------------------
// Outcomes and Statistics
// ----------------------------------------------------------------------------

/// Result of probing or populating the known-key set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyMapOutcome {
    /// The key was not known (and, for the set operation, now is).
    Ok,
    /// The key is already known; the payload is a duplicate.
    Duplicated,
    /// The eviction timer could not be armed; the key was not recorded.
    Failed,
}

/// Counters over all broadcast submissions.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BroadcastStats {
    pub requests: u64,
    pub events: u64,
    pub transactions: u64,
    pub block_headers: u64,
    pub blocks: u64,
    pub skm_ok: u64,
    pub skm_failed: u64,
    pub excluded: u64,
    pub inactive: u64,
    pub send_ok: u64,
    pub send_failed: u64,
    pub chkk_ok: u64,
    pub chkk_failed: u64,
}

/// Per-submission tally folded into [`BroadcastStats`].
#[derive(Debug, Default, Clone, Copy)]
struct BroadcastTally {
    skm_ok: u64,
    skm_failed: u64,
    excluded: u64,
    inactive: u64,
    send_ok: u64,
    send_failed: u64,
    chkk_ok: u64,
    chkk_failed: u64,
}

/// Per-peer rx worker counters, dumped on a sampling interval.
#[derive(Debug, Default, Clone, Copy)]
struct RxStats {
    rx: u64,
    chkk_ok: u64,
    chkk_failed: u64,
    rptk_ok: u64,
    rptk_failed: u64,
    gcd_ok: u64,
    gcd_failed: u64,
    pcd_ok: u64,
    pcd_failed: u64,
    upstream: u64,
    skm_ok: u64,
    skm_failed: u64,
}

// ----------------------------------------------------------------------------
// Dedup State
// ----------------------------------------------------------------------------

/// One in-flight check-key negotiation, waiting for the peer's report.
struct PendingCheck {
    request: BroadcastRequest,
    timer: TimerToken,
}

/// Pending-check map plus its eviction timers, guarded as one unit so a
/// map entry and its timer live and die together.
struct DedupState {
    pending: HashMap<PendingKey, PendingCheck>,
    timers: TickTimers,
}

// ----------------------------------------------------------------------------
// Shared Shell State
// ----------------------------------------------------------------------------

/// State shared between the shell manager task, the per-peer rx workers
/// and the tick driver.
///
/// Lock order when several are taken: `peers`, then `dedup`, then
/// `known_keys`.
pub struct ShellShared {
    cfg: DedupConfig,
    peers: Mutex<HashMap<PeerKey, PeerEntry>>,
    dedup: Mutex<DedupState>,
    known_keys: Mutex<HashMap<ContentKey, TimerToken>>,
    rx_tx: mpsc::Sender<InboundFrame>,
    stats: Mutex<BroadcastStats>,
}

impl ShellShared {
    fn new(cfg: DedupConfig, rx_tx: mpsc::Sender<InboundFrame>) -> Self {
        let timers = TickTimers::new(cfg.tick, cfg.max_timers);
        Self {
            cfg,
            peers: Mutex::new(HashMap::new()),
            dedup: Mutex::new(DedupState {
                pending: HashMap::new(),
                timers,
            }),
            known_keys: Mutex::new(HashMap::new()),
            rx_tx,
            stats: Mutex::new(BroadcastStats::default()),
        }
    }

    fn dedup_enabled(&self) -> bool {
        self.cfg.enabled
    }

    // ── Key map ─────────────────────────────────────────────────────────

    /// Read-only duplicate probe.
    pub fn check_key_map(&self, key: &ContentKey) -> KeyMapOutcome {
        if self.known_keys.lock().contains_key(key) {
            KeyMapOutcome::Duplicated
        } else {
            KeyMapOutcome::Ok
        }
    }

    /// Record a key as seen and arm its eviction timer.
    pub fn set_key_map(&self, key: ContentKey) -> KeyMapOutcome {
        if self.known_keys.lock().contains_key(&key) {
            return KeyMapOutcome::Duplicated;
        }

        let token = {
            let mut dedup = self.dedup.lock();
            let token = match dedup
                .timers
                .create(self.cfg.key_ttl, EvictTarget::KnownKey(key))
            {
                Ok(token) => token,
                Err(e) => {
                    error!(key = %key, error = %e, "known-key eviction timer allocation failed");
                    return KeyMapOutcome::Failed;
                }
            };
            if let Err(e) = dedup.timers.start(token) {
                error!(key = %key, error = %e, "known-key eviction timer start failed");
                dedup.timers.kill(token);
                return KeyMapOutcome::Failed;
            }
            token
        };

        self.known_keys.lock().insert(key, token);
        KeyMapOutcome::Ok
    }

    // ── Broadcast path ──────────────────────────────────────────────────

    /// Fan a broadcast request out to every active peer.
    pub fn broadcast(&self, req: BroadcastRequest) -> Result<()> {
        let kind = req.kind;
        let mut tally = BroadcastTally::default();
        let outcome = self.broadcast_inner(req, &mut tally);
        self.merge_stats(kind, &tally);
        outcome
    }

    fn broadcast_inner(&self, req: BroadcastRequest, tally: &mut BroadcastTally) -> Result<()> {
        let key = ContentKey::from_bytes(&req.key);

        if self.dedup_enabled() {
            match self.set_key_map(key) {
                KeyMapOutcome::Ok => tally.skm_ok += 1,
                KeyMapOutcome::Duplicated => {
                    debug!(key = %key, "broadcast rejected, key already known");
                    tally.skm_failed += 1;
                    return Err(Error::duplicated(format!("broadcast key: {key}")));
                }
                KeyMapOutcome::Failed => {
                    tally.skm_failed += 1;
                    return Err(Error::resource("known-key eviction timer unavailable"));
                }
            }
        }

        let mut peers = self.peers.lock();
        for (peer_key, entry) in peers.iter_mut() {
            if entry.status != PeerStatus::Active {
                trace!(peer = %peer_key, key = %key, "skipping peer not active");
                tally.inactive += 1;
                continue;
            }
            if req.exclude.as_ref() == Some(&peer_key.node) {
                trace!(peer = %peer_key, key = %key, "skipping excluded origin peer");
                tally.excluded += 1;
                continue;
            }
            if !self.dedup_enabled() {
                match send_broadcast_frame(entry, &req) {
                    Ok(()) => tally.send_ok += 1,
                    Err(e) => {
                        trace!(peer = %peer_key, key = %key, error = %e, "direct send failed");
                        tally.send_failed += 1;
                    }
                }
            } else {
                match self.check_key(entry, *peer_key, &req, key) {
                    Ok(()) => tally.chkk_ok += 1,
                    Err(e) => {
                        trace!(peer = %peer_key, key = %key, error = %e, "check-key failed");
                        tally.chkk_failed += 1;
                    }
                }
            }
        }
        Ok(())
    }

    /// Open a check-key negotiation with one peer. Caller holds the
    /// peer table lock; this takes the dedup lock below it.
    fn check_key(
        &self,
        entry: &mut PeerEntry,
        peer: PeerKey,
        req: &BroadcastRequest,
        key: ContentKey,
    ) -> Result<()> {
        let mut dedup = self.dedup.lock();
        let pending_key = PendingKey { key, peer };
        if dedup.pending.contains_key(&pending_key) {
            return Err(Error::duplicated(format!(
                "check already in flight: {key} -> {peer}"
            )));
        }

        entry.enqueue(ChainFrame::check_key(&key)?)?;

        let token = dedup
            .timers
            .create(self.cfg.check_ttl, EvictTarget::PendingCheck(pending_key))?;
        dedup.pending.insert(
            pending_key,
            PendingCheck {
                request: req.clone(),
                timer: token,
            },
        );
        dedup.timers.start(token)?;
        Ok(())
    }

    // ── Inbound dedup opcodes ───────────────────────────────────────────

    /// A peer asks whether we hold a key; answer with a report frame.
    fn handle_check_key(&self, peer: PeerKey, frame: &ChainFrame) -> Result<()> {
        let body = frame.decode_check_key()?;
        let key = ContentKey::from_bytes(&body.key);

        let mut peers = self.peers.lock();
        let entry = peers
            .get_mut(&peer)
            .ok_or_else(|| Error::not_found(format!("peer not active: {peer}")))?;
        if entry.status != PeerStatus::Active {
            return Err(Error::not_found(format!("peer not active: {peer}")));
        }

        let status = match self.check_key_map(&key) {
            KeyMapOutcome::Duplicated => KeyStatus::Exist,
            _ => KeyStatus::NotExist,
        };
        entry.enqueue(ChainFrame::report_key(&key, status)?)
    }

    /// A peer answered our check: clear the pending entry and deliver
    /// the saved payload only if the peer does not hold the key.
    fn handle_report_key(&self, peer: PeerKey, frame: &ChainFrame) -> Result<()> {
        let body = frame.decode_report_key()?;
        let key = ContentKey::from_bytes(&body.key);

        let mut peers = self.peers.lock();
        let entry = peers
            .get_mut(&peer)
            .ok_or_else(|| Error::not_found(format!("peer not active: {peer}")))?;
        if entry.status != PeerStatus::Active {
            return Err(Error::not_found(format!("peer not active: {peer}")));
        }

        let saved = {
            let mut dedup = self.dedup.lock();
            let pending_key = PendingKey { key, peer };
            match dedup.pending.remove(&pending_key) {
                None => {
                    return Err(Error::not_found(format!(
                        "no pending check: {key} -> {peer}"
                    )))
                }
                Some(pending) => {
                    dedup.timers.kill(pending.timer);
                    pending.request
                }
            }
        };

        match body.status {
            KeyStatus::NotExist => send_broadcast_frame(entry, &saved),
            KeyStatus::Exist => Ok(()),
        }
    }

    /// Get-chain-data frames only pass upstream while the peer is still
    /// active.
    fn handle_get_chain_data(&self, peer: PeerKey) -> Result<()> {
        let peers = self.peers.lock();
        match peers.get(&peer) {
            Some(entry) if entry.status == PeerStatus::Active => Ok(()),
            _ => Err(Error::not_found(format!("peer not active: {peer}"))),
        }
    }

    /// Put-chain-data frames always pass upstream; acceptance is the
    /// upper layer's call.
    fn handle_put_chain_data(&self, _peer: PeerKey) -> Result<()> {
        Ok(())
    }

    // ── Peer lifecycle ──────────────────────────────────────────────────

    /// Register a newly active peer and spawn its rx worker.
    fn peer_active(self: &Arc<Self>, ind: PeerActiveInd) -> Result<()> {
        let key = ind.handshake.peer_key();
        {
            let mut peers = self.peers.lock();
            if peers.contains_key(&key) {
                debug!(peer = %key, "duplicated peer-active indication");
                return Err(Error::duplicated(format!("peer already active: {key}")));
            }
            peers.insert(key, PeerEntry::new(key, ind.handshake.clone(), ind.tx));
        }
        info!(peer = %key, ip = %ind.handshake.ip, port = ind.handshake.tcp_port, "peer active");

        let shared = Arc::clone(self);
        tokio::spawn(rx_worker(shared, key, ind.rx));
        Ok(())
    }

    /// Remove a peer, but only when we previously moved it to closing.
    fn peer_close_confirm(&self, cfm: &PeerCloseConfirm) -> Result<()> {
        let key = PeerKey {
            subnet: cfm.subnet,
            dir: cfm.dir,
            node: cfm.node,
        };
        let mut peers = self.peers.lock();
        match peers.get(&key) {
            None => {
                debug!(peer = %key, "close confirm for unknown peer");
                Err(Error::not_found(format!("peer: {key}")))
            }
            Some(entry) if entry.status != PeerStatus::Closing => {
                debug!(peer = %key, status = %entry.status, "close confirm in wrong state");
                Err(Error::mismatched(format!(
                    "peer {key} not closing: {}",
                    entry.status
                )))
            }
            Some(_) => {
                peers.remove(&key);
                info!(peer = %key, "peer closed");
                Ok(())
            }
        }
    }

    /// Move an active peer to closing and produce the close request for
    /// the peer manager.
    fn peer_ask_to_close(&self, ind: &PeerAskToCloseInd) -> Result<PeerCloseRequest> {
        let key = PeerKey {
            subnet: ind.subnet,
            dir: ind.dir,
            node: ind.node,
        };
        let mut peers = self.peers.lock();
        match peers.get_mut(&key) {
            None => {
                debug!(peer = %key, why = %ind.why, "ask-to-close for unknown peer");
                Err(Error::not_found(format!("peer: {key}")))
            }
            Some(entry) if entry.status != PeerStatus::Active => {
                debug!(peer = %key, status = %entry.status, "ask-to-close in wrong state");
                Err(Error::mismatched(format!(
                    "peer {key} not active: {}",
                    entry.status
                )))
            }
            Some(entry) => {
                info!(peer = %key, why = %ind.why, "peer moving to closing");
                entry.status = PeerStatus::Closing;
                Ok(PeerCloseRequest {
                    subnet: key.subnet,
                    node: key.node,
                    dir: key.dir,
                    reason: CloseReason::AskedTo,
                })
            }
        }
    }

    // ── Chain-info routing ──────────────────────────────────────────────

    /// Fan a chain-info request out to every active peer. Reports
    /// `Resource` when it reached none of them.
    fn get_chain_info_req(&self, req: &GetChainInfoRequest) -> Result<()> {
        let mut peers = self.peers.lock();
        let total = peers.len();
        let mut failed = 0usize;
        for (peer_key, entry) in peers.iter_mut() {
            if entry.status != PeerStatus::Active {
                continue;
            }
            let body = GetChainData {
                seq: req.seq,
                kind: req.kind.clone(),
                key: req.key.clone(),
            };
            match ChainFrame::get_chain_data(&body).and_then(|frame| entry.enqueue(frame)) {
                Ok(()) => {}
                Err(e) => {
                    debug!(peer = %peer_key, error = %e, "get-chain-data send failed");
                    failed += 1;
                }
            }
        }
        if failed == total {
            return Err(Error::resource("chain-info request reached no peer"));
        }
        Ok(())
    }

    /// Route a chain-info response back to the requesting peer.
    fn get_chain_info_rsp(&self, rsp: &GetChainInfoResponse) -> Result<()> {
        let mut peers = self.peers.lock();
        let entry = peers
            .get_mut(&rsp.peer)
            .ok_or_else(|| Error::not_found(format!("peer: {}", rsp.peer)))?;
        let body = PutChainData {
            seq: rsp.seq,
            kind: rsp.kind.clone(),
            key: rsp.key.clone(),
            data: rsp.data.clone(),
        };
        entry.enqueue(ChainFrame::put_chain_data(&body)?)
    }

    // ── Eviction tick ───────────────────────────────────────────────────

    /// One eviction pass. Runs with the dedup state borrowed; known-key
    /// eviction is applied afterwards under the key lock, and only if
    /// the expiring timer still owns the entry.
    fn tick(&self) {
        let mut known_evict: Vec<(ContentKey, TimerToken)> = Vec::new();
        {
            let mut dedup = self.dedup.lock();
            let fired = dedup.timers.advance();
            for (token, target) in fired {
                match target {
                    EvictTarget::PendingCheck(pending_key) => {
                        if dedup.pending.remove(&pending_key).is_some() {
                            trace!(
                                key = %pending_key.key,
                                peer = %pending_key.peer,
                                "pending check expired"
                            );
                        } else {
                            warn!(
                                key = %pending_key.key,
                                peer = %pending_key.peer,
                                "expired timer had no pending check"
                            );
                        }
                    }
                    EvictTarget::KnownKey(key) => known_evict.push((key, token)),
                }
            }
        }

        if !known_evict.is_empty() {
            let mut known = self.known_keys.lock();
            for (key, token) in known_evict {
                if known.get(&key) == Some(&token) {
                    known.remove(&key);
                    trace!(key = %key, "known key evicted");
                }
            }
        }
    }

    // ── Observability ───────────────────────────────────────────────────

    /// Immutable view of the active peer table.
    pub fn active_peer_snapshot(&self) -> Vec<PeerSnapshot> {
        self.peers.lock().values().map(PeerEntry::snapshot).collect()
    }

    pub fn broadcast_stats(&self) -> BroadcastStats {
        *self.stats.lock()
    }

    /// Number of in-flight check negotiations.
    pub fn pending_check_count(&self) -> usize {
        self.dedup.lock().pending.len()
    }

    /// Number of keys currently known.
    pub fn known_key_count(&self) -> usize {
        self.known_keys.lock().len()
    }

    fn merge_stats(&self, kind: BroadcastKind, tally: &BroadcastTally) {
        let mut stats = self.stats.lock();
        stats.requests += 1;
        match kind {
            BroadcastKind::Event => stats.events += 1,
            BroadcastKind::Transaction => stats.transactions += 1,
            BroadcastKind::BlockHeader => stats.block_headers += 1,
            BroadcastKind::Block => stats.blocks += 1,
        }
        stats.skm_ok += tally.skm_ok;
        stats.skm_failed += tally.skm_failed;
        stats.excluded += tally.excluded;
        stats.inactive += tally.inactive;
        stats.send_ok += tally.send_ok;
        stats.send_failed += tally.send_failed;
        stats.chkk_ok += tally.chkk_ok;
        stats.chkk_failed += tally.chkk_failed;
        if stats.requests & 0x3f == 0 {
            debug!(stats = ?*stats, "broadcast statistics");
        }
    }
}

fn send_broadcast_frame(entry: &mut PeerEntry, req: &BroadcastRequest) -> Result<()> {
    entry.enqueue(ChainFrame::broadcast(
        req.kind,
        req.key.clone(),
        req.data.clone(),
    ))
}

// ----------------------------------------------------------------------------
// Per-Peer Rx Worker
// ----------------------------------------------------------------------------

/// Drain one peer's rx channel, answering dedup opcodes and filtering
/// chain payloads before they go upstream. Exits when the session drops
/// its sender.
async fn rx_worker(shared: Arc<ShellShared>, peer: PeerKey, mut rx: mpsc::Receiver<InboundFrame>) {
    let mut stats = RxStats::default();
    debug!(peer = %peer, "rx worker started");

    while let Some(inbound) = rx.recv().await {
        stats.rx += 1;
        if stats.rx & 0x3f == 0 {
            debug!(peer = %peer, stats = ?stats, "rx statistics");
        }

        if !shared.dedup_enabled() {
            if shared.rx_tx.send(inbound).await.is_ok() {
                stats.upstream += 1;
            }
            continue;
        }

        match inbound.frame.kind {
            FrameKind::CheckKey => match shared.handle_check_key(peer, &inbound.frame) {
                Ok(()) => stats.chkk_ok += 1,
                Err(e) => {
                    debug!(peer = %peer, error = %e, "check-key from peer discarded");
                    stats.chkk_failed += 1;
                }
            },
            FrameKind::ReportKey => match shared.handle_report_key(peer, &inbound.frame) {
                Ok(()) => stats.rptk_ok += 1,
                Err(e) => {
                    debug!(peer = %peer, error = %e, "report-key from peer discarded");
                    stats.rptk_failed += 1;
                }
            },
            FrameKind::GetChainData => match shared.handle_get_chain_data(peer) {
                Ok(()) => {
                    if shared.rx_tx.send(inbound).await.is_ok() {
                        stats.gcd_ok += 1;
                        stats.upstream += 1;
                    }
                }
                Err(e) => {
                    debug!(peer = %peer, error = %e, "get-chain-data discarded");
                    stats.gcd_failed += 1;
                }
            },
            FrameKind::PutChainData => match shared.handle_put_chain_data(peer) {
                Ok(()) => {
                    if shared.rx_tx.send(inbound).await.is_ok() {
                        stats.pcd_ok += 1;
                        stats.upstream += 1;
                    }
                }
                Err(e) => {
                    debug!(peer = %peer, error = %e, "put-chain-data discarded");
                    stats.pcd_failed += 1;
                }
            },
            _ => {
                // chain payload: only the first sighting goes upstream
                let key = inbound.frame.content_key();
                match shared.check_key_map(&key) {
                    KeyMapOutcome::Ok => {
                        if shared.rx_tx.send(inbound).await.is_ok() {
                            stats.skm_ok += 1;
                            stats.upstream += 1;
                        }
                    }
                    _ => {
                        trace!(peer = %peer, key = %key, "duplicated inbound payload dropped");
                        stats.skm_failed += 1;
                    }
                }
            }
        }
    }

    debug!(peer = %peer, "rx worker exiting");
}

// ----------------------------------------------------------------------------
// Shell Manager Task
// ----------------------------------------------------------------------------

/// The shell manager scheduler task.
pub struct ShellManager {
    shared: Arc<ShellShared>,
    peer_mgr: Option<TaskHandle>,
    tab_mgr: Option<TaskHandle>,
    ngb_mgr: Option<TaskHandle>,
    tick_stop: Option<oneshot::Sender<()>>,
}

impl ShellManager {
    /// Build a shell manager from the node configuration. Returns the
    /// manager plus the upstream rx channel inbound frames are
    /// delivered on.
    pub fn new(cfg: &NetworkConfig) -> (Self, mpsc::Receiver<InboundFrame>) {
        let (rx_tx, rx_rx) = mpsc::channel(cfg.dedup.rx_channel_size);
        let shared = Arc::new(ShellShared::new(cfg.dedup.clone(), rx_tx));
        (
            Self {
                shared,
                peer_mgr: None,
                tab_mgr: None,
                ngb_mgr: None,
                tick_stop: None,
            },
            rx_rx,
        )
    }

    /// Shared state handle, for observability and tests.
    pub fn shared(&self) -> Arc<ShellShared> {
        Arc::clone(&self.shared)
    }

    fn power_on(&mut self, ctx: &TaskContext) -> Result<()> {
        let sched: &Scheduler = ctx.scheduler();
        self.peer_mgr = sched.get_task_by_name(PEER_MGR_NAME).ok();
        self.tab_mgr = sched.get_task_by_name(TAB_MGR_NAME).ok();
        self.ngb_mgr = sched.get_task_by_name(NGB_MGR_NAME).ok();

        if self.shared.dedup_enabled() {
            self.start_tick_driver();
        }
        info!(dedup = self.shared.dedup_enabled(), "shell manager powered on");
        Ok(())
    }

    fn start_tick_driver(&mut self) {
        let shared = Arc::clone(&self.shared);
        let (stop_tx, mut stop_rx) = oneshot::channel::<()>();
        let tick = shared.cfg.tick;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(tick);
            // the immediate first tick would shorten every ttl by one
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = ticker.tick() => shared.tick(),
                    _ = &mut stop_rx => break,
                }
            }
            debug!("dedup tick driver stopped");
        });
        self.tick_stop = Some(stop_tx);
    }

    fn power_off(&mut self, ctx: &TaskContext) -> Result<()> {
        debug!("shell manager powering off");
        if let Some(stop) = self.tick_stop.take() {
            let _ = stop.send(());
        }
        ctx.done(ExitCode::PowerOff)
    }

    async fn reconfig(&self, ctx: &TaskContext, req: ReconfigRequest) -> Result<()> {
        for target in [self.peer_mgr, self.ngb_mgr, self.tab_mgr].into_iter().flatten() {
            ctx.send(target, EventBody::Reconfig(req.clone())).await?;
        }
        Ok(())
    }
}

#[async_trait]
impl TaskLogic for ShellManager {
    async fn handle(&mut self, ctx: &TaskContext, msg: Message) -> Result<()> {
        trace!(event = msg.body.kind(), "shell manager event");
        match msg.body {
            EventBody::PowerOn => self.power_on(ctx),
            EventBody::PowerOff => self.power_off(ctx),
            EventBody::PeerActive(ind) => self.shared.peer_active(ind),
            EventBody::PeerCloseConfirm(cfm) => self.shared.peer_close_confirm(&cfm),
            EventBody::PeerCloseInd(ind) => {
                // peers never close unilaterally; ask-to-close is the
                // only sanctioned path
                error!(subnet = %ind.subnet, node = %ind.node, "unexpected peer close indication");
                Err(Error::mismatched("peer close indication"))
            }
            EventBody::PeerAskToClose(ind) => {
                let req = self.shared.peer_ask_to_close(&ind)?;
                if let Some(peer_mgr) = self.peer_mgr {
                    ctx.send(peer_mgr, EventBody::PeerCloseRequest(req)).await?;
                }
                Ok(())
            }
            EventBody::Broadcast(req) => self.shared.broadcast(req),
            EventBody::GetChainInfoReq(req) => self.shared.get_chain_info_req(&req),
            EventBody::GetChainInfoRsp(rsp) => self.shared.get_chain_info_rsp(&rsp),
            EventBody::Reconfig(req) => self.reconfig(ctx, req).await,
            EventBody::SubnetUpdate => {
                debug!("subnet update acknowledged");
                Ok(())
            }
            other => {
                debug!(event = other.kind(), "unexpected shell manager event");
                Err(Error::parameter(format!("shell event: {}", other.kind())))
            }
        }
    }
}
