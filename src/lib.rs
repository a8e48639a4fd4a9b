mod clock;
mod config;
mod core;
mod host;
mod hostcache;
mod hostlist;
mod persist;
mod scheduler;
mod squeue;
mod stats;

pub use crate::core::{Core, CoreHandle, CoreSnapshot, QueueStats};
pub use config::Settings;
pub use host::{Host, HostGate, OpenGate};
pub use hostcache::{
    CacheClass, CacheStats, CacheType, HostCache, HostEntry, HostKind, NewHost, HOST_EXPIRY_SECS,
    MIN_RESERVE_SIZE,
};
pub use scheduler::{
    BgScheduler, BgSignal, BgStats, BgStatus, DaemonHooks, DoneFn, ItemHook, NotifyFn, SigHandler,
    StepFn, StepOutcome, StepResult, TaskControl, TaskExit, TaskHandle, WorkItem,
};
pub use squeue::{
    NodeId, PeerMode, QueryHashVec, QueryPeer, SearchBackend, SearchHandle, SearchQueue, SentNote,
};
pub use stats::{CoreStats, StatsSnapshot};
