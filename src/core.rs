//! The assembled core runtime.
//!
//! [`Core`] owns one of everything: the host cache, the background
//! scheduler, the global search queue and the per-peer queues. It is a
//! plain synchronous object driven by [`Core::tick`] once per second;
//! instantiate several in one process and they are fully isolated.
//!
//! [`CoreHandle`] wraps a `Core` in an actor task with a 1 Hz driver so
//! async callers can talk to it through a cheap-to-clone handle.

use std::collections::HashMap;
use std::net::IpAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tokio::sync::{broadcast, mpsc, oneshot};
use tracing::{debug, warn};

use crate::clock::{unix_now, Periodic};
use crate::config::Settings;
use crate::host::{Host, HostGate};
use crate::hostcache::{CacheStats, HostCache, HostKind, NewHost};
use crate::scheduler::{
    BgScheduler, BgSignal, BgStats, BgStatus, DaemonHooks, DoneFn, SigHandler, StepFn, TaskHandle,
    WorkItem,
};
use crate::squeue::{
    NodeId, PeerMode, QueryHashVec, QueryPeer, SearchBackend, SearchHandle, SearchQueue,
};
use crate::stats::{CoreStats, StatsSnapshot};

/// Host caches are persisted on this cadence, one kind per firing.
const SAVE_PERIOD_SECS: u32 = 63;

/// Point-in-time view over every observable counter.
#[derive(Debug, Clone)]
pub struct CoreSnapshot {
    pub stats: StatsSnapshot,
    pub bg: BgStats,
    pub caches: Vec<CacheStats>,
    pub global_queue: QueueStats,
    pub peer_queues: Vec<QueueStats>,
}

#[derive(Debug, Clone, Copy)]
pub struct QueueStats {
    pub node: Option<NodeId>,
    pub pending: usize,
    pub sent: u64,
    pub dropped: u64,
}

pub struct Core {
    settings: Settings,
    stats: Arc<CoreStats>,
    hcache: HostCache,
    bg: BgScheduler,
    global_queue: SearchQueue,
    peer_queues: HashMap<NodeId, SearchQueue>,
    peers: HashMap<NodeId, Box<dyn QueryPeer + Send>>,
    backend: Box<dyn SearchBackend + Send>,
    mode: PeerMode,
    config_dir: PathBuf,
    save_cadence: Periodic,
    save_rotation: u8,
}

impl Core {
    pub fn new(
        settings: Settings,
        gate: Arc<dyn HostGate>,
        backend: Box<dyn SearchBackend + Send>,
        config_dir: PathBuf,
    ) -> Self {
        let stats = Arc::new(CoreStats::default());
        let hcache = HostCache::new(Arc::clone(&stats), gate);
        Self {
            settings,
            stats,
            hcache,
            bg: BgScheduler::new(),
            global_queue: SearchQueue::new(None, unix_now()),
            peer_queues: HashMap::new(),
            peers: HashMap::new(),
            backend,
            mode: PeerMode::Legacy,
            config_dir,
            save_cadence: Periodic::new(SAVE_PERIOD_SECS),
            save_rotation: 0,
        }
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn stats(&self) -> Arc<CoreStats> {
        Arc::clone(&self.stats)
    }

    /// Direct access for embedders; the wrappers below cover the common
    /// operations.
    pub fn host_cache(&mut self) -> &mut HostCache {
        &mut self.hcache
    }

    pub fn scheduler(&mut self) -> &mut BgScheduler {
        &mut self.bg
    }

    // ========================================================================
    // Host cache operations
    // ========================================================================

    pub fn add_caught(&mut self, kind: HostKind, host: Host, origin: &str) -> bool {
        self.hcache.add_caught(kind, host, origin, &self.settings)
    }

    pub fn add_valid(&mut self, kind: HostKind, host: Host, origin: &str) -> bool {
        self.hcache.add_valid(kind, host, origin, &self.settings)
    }

    pub fn purge_host(&mut self, host: &Host) {
        self.hcache.purge(host);
    }

    pub fn get_caught(&mut self, kind: HostKind) -> Option<Host> {
        self.hcache.get_caught(kind, &self.settings)
    }

    pub fn fill_caught(&self, kind: HostKind, count: usize) -> Vec<Host> {
        self.hcache.fill_caught(kind, count)
    }

    pub fn node_is_bad(&mut self, addr: IpAddr) -> bool {
        self.hcache.node_is_bad(addr)
    }

    pub fn subscribe_new_hosts(&self) -> broadcast::Receiver<NewHost> {
        self.hcache.subscribe()
    }

    /// Load the persisted host files. Call once at startup.
    pub fn retrieve_hosts(&mut self) -> Result<()> {
        self.hcache.retrieve_all(&self.config_dir, &self.settings)
    }

    // ========================================================================
    // Background tasks
    // ========================================================================

    pub fn spawn_task(
        &mut self,
        name: impl Into<String>,
        steps: Vec<StepFn>,
        done: Option<DoneFn>,
    ) -> TaskHandle {
        self.bg.task_create(name, steps, done)
    }

    pub fn spawn_daemon(
        &mut self,
        name: impl Into<String>,
        steps: Vec<StepFn>,
        hooks: DaemonHooks,
    ) -> TaskHandle {
        self.bg.daemon_create(name, steps, hooks)
    }

    pub fn daemon_enqueue(&mut self, handle: TaskHandle, item: WorkItem) -> bool {
        self.bg.daemon_enqueue(handle, item)
    }

    pub fn cancel_task(&mut self, handle: TaskHandle) {
        self.bg.cancel(handle);
    }

    pub fn signal_task(&mut self, handle: TaskHandle, sig: BgSignal) -> bool {
        self.bg.send_signal(handle, sig)
    }

    pub fn install_task_signal(
        &mut self,
        handle: TaskHandle,
        sig: BgSignal,
        handler: Option<SigHandler>,
    ) -> Option<SigHandler> {
        self.bg.install_signal(handle, sig, handler)
    }

    pub fn task_exit_status(&mut self, handle: TaskHandle) -> Option<BgStatus> {
        self.bg.exit_status(handle)
    }

    // ========================================================================
    // Search queues
    // ========================================================================

    /// Bind a peer; it gets its own search queue.
    pub fn register_peer(&mut self, peer: Box<dyn QueryPeer + Send>) {
        let id = peer.id();
        self.peer_queues
            .entry(id)
            .or_insert_with(|| SearchQueue::new(Some(id), unix_now()));
        self.peers.insert(id, peer);
    }

    /// Unbind a peer, discarding whatever its queue still holds.
    pub fn remove_peer(&mut self, id: NodeId) {
        if let Some(mut queue) = self.peer_queues.remove(&id) {
            queue.clear();
        }
        self.peers.remove(&id);
    }

    pub fn put_query(&mut self, node: NodeId, search: SearchHandle, payload: Vec<u8>) {
        let Some(queue) = self.peer_queues.get_mut(&node) else {
            debug!(node = node.0, "query for unknown peer dropped");
            return;
        };
        queue.put(search, payload, &self.settings);
    }

    pub fn put_global_query(
        &mut self,
        search: SearchHandle,
        payload: Vec<u8>,
        qhv: QueryHashVec,
    ) {
        self.global_queue
            .put_with(search, payload, Some(qhv), &self.settings);
    }

    /// Sweep a closed search out of every queue.
    pub fn search_closed(&mut self, search: SearchHandle) {
        for queue in self.peer_queues.values_mut() {
            queue.search_closed(search);
        }
        self.global_queue.search_closed(search);
    }

    pub fn peer_mode(&self) -> PeerMode {
        self.mode
    }

    /// Change role. Leaving ultrapeer mode drops the queued dynamic
    /// queries; the searches re-issue them as a leaf at their next retry.
    pub fn set_peer_mode(&mut self, mode: PeerMode) {
        self.mode = mode;
        if mode != PeerMode::Ultra {
            self.global_queue.clear();
        }
    }

    // ========================================================================
    // Driver
    // ========================================================================

    /// One second of core time: expire bad hosts, schedule background
    /// work, pace the search queues, and every 63rd call persist one host
    /// cache kind (rotating regular, ultra, GUESS).
    pub fn tick(&mut self, now: u64) {
        self.hcache.expire(now);
        self.bg.timer();

        let Core {
            peer_queues,
            peers,
            backend,
            settings,
            mode,
            global_queue,
            ..
        } = self;
        for (id, queue) in peer_queues.iter_mut() {
            let Some(peer) = peers.get_mut(id) else {
                continue;
            };
            queue.process(now, *mode, Some(peer.as_mut()), backend.as_mut(), settings);
        }
        global_queue.process(now, *mode, None, backend.as_mut(), settings);

        if self.save_cadence.fire() {
            let kind = match self.save_rotation {
                0 => HostKind::Any,
                1 => HostKind::Ultra,
                _ => HostKind::Guess,
            };
            self.save_rotation = (self.save_rotation + 1) % 3;
            if let Err(error) = self.hcache.store_if_dirty(kind, &self.config_dir) {
                warn!(%error, ?kind, "failed to persist host cache");
            }
        }
    }

    /// Flush the host caches to disk and tear everything down.
    pub fn shutdown(&mut self) {
        if let Err(error) = self.hcache.store_all(&self.config_dir) {
            warn!(%error, "failed to store host caches at shutdown");
        }
        for queue in self.peer_queues.values_mut() {
            queue.clear();
        }
        self.global_queue.clear();
        self.hcache.close();
        self.bg.close();
    }

    pub fn snapshot(&self) -> CoreSnapshot {
        let queue_stats = |q: &SearchQueue| QueueStats {
            node: q.node(),
            pending: q.len(),
            sent: q.sent(),
            dropped: q.dropped(),
        };
        CoreSnapshot {
            stats: self.stats.snapshot(),
            bg: self.bg.stats(),
            caches: self.hcache.cache_stats(),
            global_queue: queue_stats(&self.global_queue),
            peer_queues: self.peer_queues.values().map(queue_stats).collect(),
        }
    }
}

// ============================================================================
// Commands sent from CoreHandle to the actor
// ============================================================================

enum Command {
    AddCaught {
        kind: HostKind,
        host: Host,
        origin: String,
    },
    AddValid {
        kind: HostKind,
        host: Host,
        origin: String,
    },
    Purge(Host),
    GetCaught {
        kind: HostKind,
        reply: oneshot::Sender<Option<Host>>,
    },
    FillCaught {
        kind: HostKind,
        count: usize,
        reply: oneshot::Sender<Vec<Host>>,
    },
    NodeIsBad {
        addr: IpAddr,
        reply: oneshot::Sender<bool>,
    },
    RegisterPeer(Box<dyn QueryPeer + Send>),
    RemovePeer(NodeId),
    PutQuery {
        node: NodeId,
        search: SearchHandle,
        payload: Vec<u8>,
    },
    PutGlobalQuery {
        search: SearchHandle,
        payload: Vec<u8>,
        qhv: QueryHashVec,
    },
    SearchClosed(SearchHandle),
    SetPeerMode(PeerMode),
    SpawnTask {
        name: String,
        steps: Vec<StepFn>,
        done: Option<DoneFn>,
        reply: oneshot::Sender<TaskHandle>,
    },
    Snapshot(oneshot::Sender<CoreSnapshot>),
    Quit,
}

// ============================================================================
// CoreHandle (public async API - cheap to clone)
// ============================================================================

#[derive(Clone)]
pub struct CoreHandle {
    cmd_tx: mpsc::Sender<Command>,
}

impl CoreHandle {
    /// Build a core, load its persisted hosts, and run it on a 1 Hz actor
    /// task until `quit()` or the last handle drops.
    pub fn spawn(
        settings: Settings,
        gate: Arc<dyn HostGate>,
        backend: Box<dyn SearchBackend + Send>,
        config_dir: PathBuf,
    ) -> Self {
        let (cmd_tx, cmd_rx) = mpsc::channel(256);

        let mut core = Core::new(settings, gate, backend, config_dir);
        if let Err(error) = core.retrieve_hosts() {
            warn!(%error, "failed to load persisted host caches");
        }
        tokio::spawn(run_core(core, cmd_rx));

        Self { cmd_tx }
    }

    pub async fn add_caught(&self, kind: HostKind, host: Host, origin: &str) {
        let _ = self
            .cmd_tx
            .send(Command::AddCaught {
                kind,
                host,
                origin: origin.to_string(),
            })
            .await;
    }

    pub async fn add_valid(&self, kind: HostKind, host: Host, origin: &str) {
        let _ = self
            .cmd_tx
            .send(Command::AddValid {
                kind,
                host,
                origin: origin.to_string(),
            })
            .await;
    }

    pub async fn purge(&self, host: Host) {
        let _ = self.cmd_tx.send(Command::Purge(host)).await;
    }

    pub async fn get_caught(&self, kind: HostKind) -> Option<Host> {
        let (tx, rx) = oneshot::channel();
        if self
            .cmd_tx
            .send(Command::GetCaught { kind, reply: tx })
            .await
            .is_err()
        {
            return None;
        }
        rx.await.unwrap_or(None)
    }

    pub async fn fill_caught(&self, kind: HostKind, count: usize) -> Vec<Host> {
        let (tx, rx) = oneshot::channel();
        if self
            .cmd_tx
            .send(Command::FillCaught {
                kind,
                count,
                reply: tx,
            })
            .await
            .is_err()
        {
            return Vec::new();
        }
        rx.await.unwrap_or_default()
    }

    pub async fn node_is_bad(&self, addr: IpAddr) -> bool {
        let (tx, rx) = oneshot::channel();
        if self
            .cmd_tx
            .send(Command::NodeIsBad { addr, reply: tx })
            .await
            .is_err()
        {
            return false;
        }
        rx.await.unwrap_or(false)
    }

    pub async fn register_peer(&self, peer: Box<dyn QueryPeer + Send>) {
        let _ = self.cmd_tx.send(Command::RegisterPeer(peer)).await;
    }

    pub async fn remove_peer(&self, id: NodeId) {
        let _ = self.cmd_tx.send(Command::RemovePeer(id)).await;
    }

    pub async fn put_query(&self, node: NodeId, search: SearchHandle, payload: Vec<u8>) {
        let _ = self
            .cmd_tx
            .send(Command::PutQuery {
                node,
                search,
                payload,
            })
            .await;
    }

    pub async fn put_global_query(
        &self,
        search: SearchHandle,
        payload: Vec<u8>,
        qhv: QueryHashVec,
    ) {
        let _ = self
            .cmd_tx
            .send(Command::PutGlobalQuery {
                search,
                payload,
                qhv,
            })
            .await;
    }

    pub async fn search_closed(&self, search: SearchHandle) {
        let _ = self.cmd_tx.send(Command::SearchClosed(search)).await;
    }

    pub async fn set_peer_mode(&self, mode: PeerMode) {
        let _ = self.cmd_tx.send(Command::SetPeerMode(mode)).await;
    }

    pub async fn spawn_task(
        &self,
        name: &str,
        steps: Vec<StepFn>,
        done: Option<DoneFn>,
    ) -> Option<TaskHandle> {
        let (tx, rx) = oneshot::channel();
        if self
            .cmd_tx
            .send(Command::SpawnTask {
                name: name.to_string(),
                steps,
                done,
                reply: tx,
            })
            .await
            .is_err()
        {
            return None;
        }
        rx.await.ok()
    }

    pub async fn snapshot(&self) -> Option<CoreSnapshot> {
        let (tx, rx) = oneshot::channel();
        if self.cmd_tx.send(Command::Snapshot(tx)).await.is_err() {
            return None;
        }
        rx.await.ok()
    }

    /// Store the caches and stop the actor.
    pub async fn quit(&self) {
        let _ = self.cmd_tx.send(Command::Quit).await;
    }
}

async fn run_core(mut core: Core, mut cmd_rx: mpsc::Receiver<Command>) {
    let mut ticker = tokio::time::interval(Duration::from_secs(1));
    ticker.tick().await; // Skip initial tick

    loop {
        tokio::select! {
            cmd = cmd_rx.recv() => {
                match cmd {
                    Some(Command::AddCaught { kind, host, origin }) => {
                        core.add_caught(kind, host, &origin);
                    }
                    Some(Command::AddValid { kind, host, origin }) => {
                        core.add_valid(kind, host, &origin);
                    }
                    Some(Command::Purge(host)) => core.purge_host(&host),
                    Some(Command::GetCaught { kind, reply }) => {
                        let _ = reply.send(core.get_caught(kind));
                    }
                    Some(Command::FillCaught { kind, count, reply }) => {
                        let _ = reply.send(core.fill_caught(kind, count));
                    }
                    Some(Command::NodeIsBad { addr, reply }) => {
                        let _ = reply.send(core.node_is_bad(addr));
                    }
                    Some(Command::RegisterPeer(peer)) => core.register_peer(peer),
                    Some(Command::RemovePeer(id)) => core.remove_peer(id),
                    Some(Command::PutQuery { node, search, payload }) => {
                        core.put_query(node, search, payload);
                    }
                    Some(Command::PutGlobalQuery { search, payload, qhv }) => {
                        core.put_global_query(search, payload, qhv);
                    }
                    Some(Command::SearchClosed(search)) => core.search_closed(search),
                    Some(Command::SetPeerMode(mode)) => core.set_peer_mode(mode),
                    Some(Command::SpawnTask { name, steps, done, reply }) => {
                        let _ = reply.send(core.spawn_task(name, steps, done));
                    }
                    Some(Command::Snapshot(reply)) => {
                        let _ = reply.send(core.snapshot());
                    }
                    Some(Command::Quit) | None => {
                        core.shutdown();
                        break;
                    }
                }
            }

            _ = ticker.tick() => {
                core.tick(unix_now());
            }
        }
    }

    debug!("core actor shutting down");
}
