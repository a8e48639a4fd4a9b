//! Multi-class host cache.
//!
//! Candidate peer addresses flow in from the protocol layer and are sorted
//! into named caches: the regular and ultrapeer pools (each split into a
//! "fresh" half that is drained first and a "valid" half spliced in when
//! fresh runs dry), four bad-host caches that quarantine misbehaving
//! addresses for half an hour, and two GUESS pools for the UDP query
//! mechanism.
//!
//! Admission is probability-gated so floods cannot monopolize the pools,
//! promotion moves a host between caches when better information arrives,
//! and the GUESS caches carry two mitigations against pong-cache poisoning:
//! re-announcing a cached host *removes* it (ID smearing), and eviction
//! under pressure replaces the most recent entry 70% of the time.

use std::collections::HashMap;
use std::net::IpAddr;
use std::path::Path;
use std::sync::atomic::AtomicU32;
use std::sync::Arc;

use anyhow::Result;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::Serialize;
use tokio::sync::broadcast;
use tracing::{debug, warn};

use crate::clock::unix_now;
use crate::config::Settings;
use crate::host::{Host, HostGate};
use crate::hostlist::HostList;
use crate::persist;
use crate::stats::{gauge_add, gauge_set, gauge_sub, CoreStats};

/// Hosts in the bad caches (and stale on-disk entries) expire after this.
pub const HOST_EXPIRY_SECS: u64 = 60 * 30;

/// Below this pool size we consider ourselves short on host addresses.
pub const MIN_RESERVE_SIZE: usize = 1024;

const HOSTS_FILE: &str = "hosts";
const ULTRAS_FILE: &str = "ultras";
const GUESS_FILE: &str = "guess";

const NEW_HOST_EVENT_CAPACITY: usize = 64;

/// The individual caches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum CacheType {
    FreshAny,
    ValidAny,
    FreshUltra,
    ValidUltra,
    Timeout,
    Busy,
    Unstable,
    Alien,
    Guess,
    GuessIntro,
}

pub const CACHE_TYPES: [CacheType; 10] = [
    CacheType::FreshAny,
    CacheType::ValidAny,
    CacheType::FreshUltra,
    CacheType::ValidUltra,
    CacheType::Timeout,
    CacheType::Busy,
    CacheType::Unstable,
    CacheType::Alien,
    CacheType::Guess,
    CacheType::GuessIntro,
];

/// Which host-key table a cache uses. A host appears in at most one cache
/// per class.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheClass {
    Host,
    Guess,
}

/// The caller-facing grouping of caches a host can be caught into.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum HostKind {
    Any,
    Ultra,
    Guess,
}

impl CacheType {
    pub fn class(self) -> CacheClass {
        match self {
            CacheType::Guess | CacheType::GuessIntro => CacheClass::Guess,
            _ => CacheClass::Host,
        }
    }

    /// The four caches holding peers we expect to connect to.
    pub fn is_good(self) -> bool {
        matches!(
            self,
            CacheType::FreshAny
                | CacheType::ValidAny
                | CacheType::FreshUltra
                | CacheType::ValidUltra
        )
    }

    pub fn is_bad(self) -> bool {
        matches!(
            self,
            CacheType::Timeout | CacheType::Busy | CacheType::Unstable | CacheType::Alien
        )
    }

    /// Caches keyed by address only; the port is stripped on admission.
    fn addr_only(self) -> bool {
        matches!(
            self,
            CacheType::Timeout | CacheType::Busy | CacheType::Unstable
        )
    }

    pub fn label(self) -> &'static str {
        match self {
            CacheType::FreshAny => "fresh regular",
            CacheType::ValidAny => "valid regular",
            CacheType::FreshUltra => "fresh ultra",
            CacheType::ValidUltra => "valid ultra",
            CacheType::Timeout => "timeout",
            CacheType::Busy => "busy",
            CacheType::Unstable => "unstable",
            CacheType::Alien => "alien",
            CacheType::Guess => "guess",
            CacheType::GuessIntro => "guess intro",
        }
    }

    fn index(self) -> usize {
        self as usize
    }
}

/// Metadata attached to a cached host.
///
/// `Bare` marks membership-only entries (no cache/time known); everything
/// the cache admits itself carries `Meta`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HostEntry {
    Meta { cache: CacheType, added: u64 },
    Bare,
}

/// Event emitted when a host passes validation and is offered a slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NewHost {
    pub cache: CacheType,
    pub host: Host,
}

/// Per-cache observable counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct CacheStats {
    pub cache: CacheType,
    pub host_count: usize,
    pub hits: u64,
    pub misses: u64,
}

struct Bucket {
    ty: CacheType,
    list: HostList,
    hits: u64,
    misses: u64,
    dirty: bool,
    mass_update: u32,
}

impl Bucket {
    fn new(ty: CacheType) -> Self {
        Self {
            ty,
            list: HostList::new(),
            hits: 0,
            misses: 0,
            dirty: false,
            mass_update: 0,
        }
    }
}

pub struct HostCache {
    buckets: Vec<Bucket>,
    tables: [HashMap<Host, HostEntry>; 2],
    low_on_pongs: bool,
    close_running: bool,
    rng: StdRng,
    stats: Arc<CoreStats>,
    gate: Arc<dyn HostGate>,
    new_hosts: broadcast::Sender<NewHost>,
}

fn catcher_gauge(stats: &CoreStats, ty: CacheType) -> &AtomicU32 {
    match ty {
        CacheType::FreshAny | CacheType::ValidAny => &stats.hosts_in_catcher,
        CacheType::FreshUltra | CacheType::ValidUltra => &stats.hosts_in_ultra_catcher,
        CacheType::Timeout | CacheType::Busy | CacheType::Unstable | CacheType::Alien => {
            &stats.hosts_in_bad_catcher
        }
        CacheType::Guess => &stats.hosts_in_guess_catcher,
        CacheType::GuessIntro => &stats.hosts_in_guess_intro_catcher,
    }
}

impl HostCache {
    pub fn new(stats: Arc<CoreStats>, gate: Arc<dyn HostGate>) -> Self {
        Self::with_rng(stats, gate, StdRng::from_entropy())
    }

    /// Construct with a caller-supplied RNG, for reproducible runs.
    pub fn with_rng(stats: Arc<CoreStats>, gate: Arc<dyn HostGate>, rng: StdRng) -> Self {
        let (new_hosts, _) = broadcast::channel(NEW_HOST_EVENT_CAPACITY);
        Self {
            buckets: CACHE_TYPES.iter().map(|ty| Bucket::new(*ty)).collect(),
            tables: [HashMap::new(), HashMap::new()],
            // An empty cache is by definition short on hosts.
            low_on_pongs: true,
            close_running: false,
            rng,
            stats,
            gate,
            new_hosts,
        }
    }

    /// Subscribe to admissions; fires for every host that passes validation,
    /// whether or not the slot filter stored it.
    pub fn subscribe(&self) -> broadcast::Receiver<NewHost> {
        self.new_hosts.subscribe()
    }

    // ========================================================================
    // Accessors
    // ========================================================================

    fn bucket(&self, ty: CacheType) -> &Bucket {
        &self.buckets[ty.index()]
    }

    fn bucket_mut(&mut self, ty: CacheType) -> &mut Bucket {
        &mut self.buckets[ty.index()]
    }

    fn two_buckets(&mut self, a: CacheType, b: CacheType) -> (&mut Bucket, &mut Bucket) {
        let (ai, bi) = (a.index(), b.index());
        debug_assert_ne!(ai, bi);
        if ai < bi {
            let (left, right) = self.buckets.split_at_mut(bi);
            (&mut left[ai], &mut right[0])
        } else {
            let (left, right) = self.buckets.split_at_mut(ai);
            (&mut right[0], &mut left[bi])
        }
    }

    fn table(&self, class: CacheClass) -> &HashMap<Host, HostEntry> {
        &self.tables[class as usize]
    }

    fn table_mut(&mut self, class: CacheClass) -> &mut HashMap<Host, HostEntry> {
        &mut self.tables[class as usize]
    }

    /// Which cache currently holds the host, if any.
    pub fn cache_of(&self, class: CacheClass, host: &Host) -> Option<CacheType> {
        match self.table(class).get(host) {
            Some(HostEntry::Meta { cache, .. }) => Some(*cache),
            _ => None,
        }
    }

    pub fn len_of(&self, ty: CacheType) -> usize {
        self.bucket(ty).list.len()
    }

    pub fn is_dirty(&self, ty: CacheType) -> bool {
        self.bucket(ty).dirty
    }

    /// Total hosts of a kind, both halves combined.
    pub fn size(&self, kind: HostKind) -> usize {
        match kind {
            HostKind::Any => self.len_of(CacheType::FreshAny) + self.len_of(CacheType::ValidAny),
            HostKind::Ultra => {
                self.len_of(CacheType::FreshUltra) + self.len_of(CacheType::ValidUltra)
            }
            HostKind::Guess => self.len_of(CacheType::Guess) + self.len_of(CacheType::GuessIntro),
        }
    }

    /// Do we hold fewer hosts than we like to keep in reserve?
    pub fn is_low(&self, kind: HostKind) -> bool {
        self.size(kind) < MIN_RESERVE_SIZE
    }

    pub fn low_on_pongs(&self) -> bool {
        self.low_on_pongs
    }

    pub fn cache_stats(&self) -> Vec<CacheStats> {
        self.buckets
            .iter()
            .map(|b| CacheStats {
                cache: b.ty,
                host_count: b.list.len(),
                hits: b.hits,
                misses: b.misses,
            })
            .collect()
    }

    fn update_low_on_pongs(&mut self, settings: &Settings) {
        self.low_on_pongs = self.size(HostKind::Any) < settings.max_hosts_cached / 8;
    }

    // ========================================================================
    // Capacity
    // ========================================================================

    fn slots_max(ty: CacheType, settings: &Settings) -> usize {
        match ty {
            CacheType::FreshAny | CacheType::ValidAny => settings.max_hosts_cached,
            CacheType::FreshUltra | CacheType::ValidUltra => settings.max_ultra_hosts_cached,
            CacheType::Timeout | CacheType::Busy | CacheType::Unstable | CacheType::Alien => {
                settings.max_bad_hosts_cached
            }
            CacheType::Guess => settings.max_guess_hosts_cached,
            CacheType::GuessIntro => settings.max_guess_intro_hosts_cached,
        }
    }

    /// Slots remaining for this cache. The fresh and valid halves of a kind
    /// share one pool, so adding to one eats the other's headroom.
    fn slots_left(&self, ty: CacheType, settings: &Settings) -> i64 {
        let limit = Self::slots_max(ty, settings) as i64;
        let current = match ty {
            CacheType::FreshAny | CacheType::ValidAny => self.size(HostKind::Any),
            CacheType::FreshUltra | CacheType::ValidUltra => self.size(HostKind::Ultra),
            _ => self.len_of(ty),
        } as i64;
        limit - current
    }

    /// Probability filter on free slots: always admit while half empty,
    /// then admit with probability proportional to the room left. Keeps a
    /// flood from instantly displacing the whole cache.
    fn request_slot(&mut self, ty: CacheType, settings: &Settings) -> bool {
        let limit = Self::slots_max(ty, settings);
        let left = self.slots_left(ty, settings);
        if limit == 0 || left <= 0 {
            return false;
        }
        let left = left as usize;
        left > limit / 2 || (self.rng.gen::<u32>() as usize % limit) < left
    }

    // ========================================================================
    // Admission
    // ========================================================================

    /// Register a host in the cache of the given type.
    ///
    /// Returns whether the address and port passed the sanity checks,
    /// regardless of whether a slot was actually taken.
    pub fn add(&mut self, ty: CacheType, host: Host, origin: &str, settings: &Settings) -> bool {
        self.add_at(ty, unix_now(), host, origin, settings)
    }

    /// Catch a fresh host of the given kind.
    pub fn add_caught(
        &mut self,
        kind: HostKind,
        host: Host,
        origin: &str,
        settings: &Settings,
    ) -> bool {
        let ty = match kind {
            HostKind::Any => CacheType::FreshAny,
            HostKind::Ultra => CacheType::FreshUltra,
            HostKind::Guess => CacheType::Guess,
        };
        self.add(ty, host, origin, settings)
    }

    /// Register a host we have successfully talked to.
    pub fn add_valid(
        &mut self,
        kind: HostKind,
        host: Host,
        origin: &str,
        settings: &Settings,
    ) -> bool {
        let ty = match kind {
            HostKind::Any => CacheType::ValidAny,
            HostKind::Ultra => CacheType::ValidUltra,
            HostKind::Guess => CacheType::GuessIntro,
        };
        self.add(ty, host, origin, settings)
    }

    pub(crate) fn add_at(
        &mut self,
        ty: CacheType,
        added: u64,
        host: Host,
        origin: &str,
        settings: &Settings,
    ) -> bool {
        if settings.stop_host_get {
            return false;
        }

        // Unstable monitoring shuts off entirely when we are short on
        // hosts, lest we quarantine the last few addresses we have.
        if ty == CacheType::Unstable
            && (!settings.node_monitor_unstable_ip || self.low_on_pongs)
        {
            return false;
        }

        if self.gate.is_own_address(&host) {
            gauge_add(&self.stats.local_instance_rejects, 1);
            return false;
        }

        if ty.is_good() && self.gate.is_connected(&host) {
            gauge_add(&self.stats.already_connected_rejects, 1);
            return false;
        }

        let addr_only = ty.addr_only();
        if !host.is_routable() && (!addr_only || !host.has_valid_port()) {
            gauge_add(&self.stats.invalid_host_rejects, 1);
            return false;
        }

        if self.gate.is_bogus(&host.addr) || self.gate.is_hostile(&host.addr) {
            gauge_add(&self.stats.invalid_host_rejects, 1);
            return false;
        }

        // Ports 6346-6350 are mostly outdated servents and frequently
        // blocked or throttled, so most of them get vetoed.
        if (6346..=6350).contains(&host.port)
            && !self.low_on_pongs
            && self.rng.gen::<u8>() as u16 >= settings.legacy_port_pass_odds
        {
            return false;
        }

        let stored = if addr_only { host.addr_only() } else { host };
        let class = ty.class();

        if let Some(entry) = self.table(class).get(&stored).copied() {
            self.bucket_mut(ty).hits += 1;

            let current = match entry {
                HostEntry::Meta { cache, .. } => cache,
                // Membership-only entries carry nothing worth moving.
                HostEntry::Bare => return true,
            };

            let do_move = match ty {
                CacheType::Timeout | CacheType::Busy | CacheType::Unstable | CacheType::Alien => {
                    !current.is_bad()
                }
                CacheType::FreshUltra | CacheType::ValidUltra => {
                    matches!(current, CacheType::FreshAny | CacheType::ValidAny)
                }
                CacheType::Guess | CacheType::GuessIntro => {
                    // SECURITY: ID smearing against pong-cache poisoning;
                    // re-announcing a cached GUESS host removes it.
                    debug!(host = %stored, cache = current.label(), "smearing host out of cache");
                    self.unlink_host(current, &stored);
                    return true;
                }
                _ => false,
            };

            if !do_move {
                return true;
            }

            self.bucket_mut(current).list.remove(&stored);
            self.bucket_mut(ty).list.prepend(stored);
            self.bucket_mut(current).dirty = true;
            self.bucket_mut(ty).dirty = true;

            // Keep the population gauges honest when the move crosses
            // catcher groups (regular -> ultra, good -> bad).
            let from_gauge = catcher_gauge(&self.stats, current) as *const AtomicU32;
            let to_gauge = catcher_gauge(&self.stats, ty) as *const AtomicU32;
            if !std::ptr::eq(from_gauge, to_gauge) {
                if self.bucket(current).mass_update == 0 {
                    gauge_sub(catcher_gauge(&self.stats, current), 1);
                }
                if self.bucket(ty).mass_update == 0 {
                    gauge_add(catcher_gauge(&self.stats, ty), 1);
                }
            }

            self.table_mut(class)
                .insert(stored, HostEntry::Meta { cache: ty, added });
            return true;
        }

        // The host is new and checked out; tell anyone waiting for one,
        // even if the slot filter ends up not storing it.
        let _ = self.new_hosts.send(NewHost {
            cache: ty,
            host: stored,
        });

        if !self.request_slot(ty, settings) {
            return true;
        }

        self.table_mut(class)
            .insert(stored, HostEntry::Meta { cache: ty, added });
        {
            let bucket = self.bucket_mut(ty);
            // Newest at the head: extraction serves the freshest hosts and
            // expiry can stop at the first live entry from the tail.
            bucket.list.prepend(stored);
            bucket.misses += 1;
            bucket.dirty = true;
        }
        if self.bucket(ty).mass_update == 0 {
            gauge_add(catcher_gauge(&self.stats, ty), 1);
        }

        self.prune(ty, settings);
        self.update_low_on_pongs(settings);

        debug!(
            cache = ty.label(),
            host = %stored,
            origin,
            low_on_pongs = self.low_on_pongs,
            "cached host"
        );
        true
    }

    // ========================================================================
    // Removal
    // ========================================================================

    fn unlink_host(&mut self, ty: CacheType, host: &Host) {
        let (removed, mass) = {
            let bucket = self.bucket_mut(ty);
            let removed = bucket.list.remove(host);
            if removed {
                bucket.dirty = true;
            }
            (removed, bucket.mass_update)
        };

        if !removed {
            warn!(cache = ty.label(), %host, "attempt to remove host not in cache");
        } else if mass == 0 {
            gauge_sub(catcher_gauge(&self.stats, ty), 1);
        }

        self.table_mut(ty.class()).remove(host);

        // Never re-splice while draining for close; it would refill caches
        // that were already emptied.
        if !self.close_running {
            self.require_caught(ty);
        }
    }

    fn remove_known(&mut self, class: CacheClass, host: &Host) {
        match self.table(class).get(host).copied() {
            Some(HostEntry::Meta { cache, .. }) => self.unlink_host(cache, host),
            Some(HostEntry::Bare) => {
                self.table_mut(class).remove(host);
            }
            None => warn!(%host, "attempt to remove unknown host"),
        }
    }

    /// Drop the host from the good caches, if present.
    pub fn purge(&mut self, host: &Host) {
        if let Some(HostEntry::Meta { cache, .. }) =
            self.table(CacheClass::Host).get(host).copied()
        {
            if cache.is_good() {
                self.remove_known(CacheClass::Host, host);
            }
        }
    }

    fn remove_all(&mut self, ty: CacheType) {
        if self.len_of(ty) == 0 {
            return;
        }
        self.start_mass_update(ty);
        while let Some(host) = self.bucket(ty).list.head() {
            self.unlink_host(ty, &host);
        }
        self.stop_mass_update(ty);
    }

    /// Drop every host of a single cache.
    pub fn clear(&mut self, ty: CacheType) {
        self.remove_all(ty);
    }

    /// Drop both halves of a kind.
    pub fn clear_host_kind(&mut self, kind: HostKind) {
        let (a, b) = match kind {
            HostKind::Any => (CacheType::FreshAny, CacheType::ValidAny),
            HostKind::Ultra => (CacheType::FreshUltra, CacheType::ValidUltra),
            HostKind::Guess => (CacheType::Guess, CacheType::GuessIntro),
        };
        self.remove_all(a);
        self.remove_all(b);
    }

    /// Two-phase drain: empty every cache with the re-splice disabled, then
    /// the structures are dead weight. The instance is unusable afterwards.
    pub fn close(&mut self) {
        debug_assert!(!self.close_running);
        self.close_running = true;
        for ty in CACHE_TYPES {
            self.remove_all(ty);
        }
        debug_assert!(self.table(CacheClass::Host).is_empty());
        debug_assert!(self.table(CacheClass::Guess).is_empty());
    }

    // ========================================================================
    // Mass updates
    // ========================================================================

    fn start_mass_update(&mut self, ty: CacheType) {
        self.bucket_mut(ty).mass_update += 1;
    }

    fn stop_mass_update(&mut self, ty: CacheType) {
        {
            let bucket = self.bucket_mut(ty);
            debug_assert!(bucket.mass_update > 0);
            bucket.mass_update -= 1;
            if bucket.mass_update > 0 {
                return;
            }
        }
        let value = match ty {
            CacheType::FreshAny | CacheType::ValidAny => self.size(HostKind::Any),
            CacheType::FreshUltra | CacheType::ValidUltra => self.size(HostKind::Ultra),
            CacheType::Timeout | CacheType::Busy | CacheType::Unstable | CacheType::Alien => {
                self.len_of(CacheType::Timeout)
                    + self.len_of(CacheType::Busy)
                    + self.len_of(CacheType::Unstable)
                    + self.len_of(CacheType::Alien)
            }
            CacheType::Guess | CacheType::GuessIntro => self.len_of(ty),
        };
        gauge_set(catcher_gauge(&self.stats, ty), value as u32);
    }

    // ========================================================================
    // Promotion and pruning
    // ========================================================================

    /// Move every entry of `from` into the empty cache `to`, rewriting the
    /// metadata so each host now belongs to `to`.
    fn move_entries(&mut self, to: CacheType, from: CacheType) {
        if to == from {
            return;
        }
        debug_assert_eq!(to.class(), from.class());
        debug_assert!(self.bucket(to).list.is_empty());

        {
            let (to_bucket, from_bucket) = self.two_buckets(to, from);
            HostList::swap(&mut to_bucket.list, &mut from_bucket.list);
        }

        let moved: Vec<Host> = self.bucket(to).list.iter().copied().collect();
        let class = to.class();
        for host in moved {
            if let Some(HostEntry::Meta { cache, .. }) = self.table_mut(class).get_mut(&host) {
                *cache = to;
            }
        }
    }

    /// Make sure the fresh half has hosts, splicing the valid half in when
    /// it ran dry. Returns whether the cache has any hosts afterwards.
    fn require_caught(&mut self, ty: CacheType) -> bool {
        match ty {
            CacheType::FreshAny | CacheType::ValidAny => {
                if self.bucket(ty).list.is_empty() {
                    self.move_entries(ty, CacheType::ValidAny);
                }
                !self.bucket(ty).list.is_empty()
            }
            CacheType::FreshUltra | CacheType::ValidUltra => {
                if self.bucket(ty).list.is_empty() {
                    self.move_entries(ty, CacheType::ValidUltra);
                }
                !self.bucket(ty).list.is_empty()
            }
            _ => !self.bucket(ty).list.is_empty(),
        }
    }

    /// Evict hosts while the cache sits over its limit.
    ///
    /// For the split kinds the longer half is the one pruned, so a bloated
    /// valid half cannot starve the fresh one. The GUESS cache replaces the
    /// entry just after the head 70% of the time instead of the oldest.
    pub fn prune(&mut self, ty: CacheType, settings: &Settings) {
        let mut target = ty;
        let sibling = match ty {
            CacheType::ValidAny => Some(CacheType::FreshAny),
            CacheType::FreshAny => Some(CacheType::ValidAny),
            CacheType::ValidUltra => Some(CacheType::FreshUltra),
            CacheType::FreshUltra => Some(CacheType::ValidUltra),
            _ => None,
        };
        if let Some(sibling) = sibling {
            if self.len_of(target) < self.len_of(sibling) {
                target = sibling;
            }
        }

        let extra = self.slots_left(target, settings);
        if extra >= 0 {
            return;
        }

        self.start_mass_update(target);
        self.require_caught(target);

        let mut over = (-extra) as usize;
        while over > 0 {
            over -= 1;

            let victim = if target == CacheType::Guess && self.rng.gen_range(0..100) < 70 {
                // SECURITY: biased MRU replacement resists pong-cache
                // poisoning; spare the entry we just admitted, evict the
                // one after it.
                let bucket = self.bucket(target);
                bucket.list.after_head().or_else(|| bucket.list.head())
            } else {
                self.bucket(target).list.tail()
            };

            match victim {
                Some(host) => self.remove_known(target.class(), &host),
                None => {
                    warn!(cache = target.label(), "asked to prune an empty host cache");
                    break;
                }
            }
        }

        self.stop_mass_update(target);
    }

    // ========================================================================
    // Queries and extraction
    // ========================================================================

    /// Is the address sitting in one of the bad-host caches?
    ///
    /// Always answers no while we are low on hosts; discarding addresses we
    /// cannot replace would push us back to the web caches.
    pub fn node_is_bad(&mut self, addr: IpAddr) -> bool {
        if self.low_on_pongs {
            return false;
        }
        let probe = Host::new(addr, 0);
        match self.table(CacheClass::Host).get(&probe).copied() {
            Some(HostEntry::Meta { cache, .. }) => {
                self.bucket_mut(cache).hits += 1;
                cache.is_bad()
            }
            _ => false,
        }
    }

    fn catch_source(&self, kind: HostKind) -> CacheType {
        match kind {
            HostKind::Any => CacheType::FreshAny,
            HostKind::Ultra => CacheType::FreshUltra,
            HostKind::Guess => {
                if self.len_of(CacheType::Guess) == 0 {
                    CacheType::GuessIntro
                } else {
                    CacheType::Guess
                }
            }
        }
    }

    /// Extract a host for an outbound connection; freshest first.
    pub fn get_caught(&mut self, kind: HostKind, settings: &Settings) -> Option<Host> {
        let ty = self.catch_source(kind);
        let available = self.require_caught(ty);
        self.update_low_on_pongs(settings);
        if !available {
            return None;
        }

        if settings.use_netmasks && self.gate.local_networks() > 0 && kind != HostKind::Guess {
            if let Some(host) = self.find_nearby_in(ty) {
                return Some(host);
            }
        }

        let host = self.bucket(ty).list.head()?;
        self.unlink_host(ty, &host);
        Some(host)
    }

    /// Copy up to `count` hosts without removing them.
    pub fn fill_caught(&self, kind: HostKind, count: usize) -> Vec<Host> {
        let ty = self.catch_source(kind);
        self.bucket(ty).list.iter().take(count).copied().collect()
    }

    /// First host within one of our local networks; removed on success.
    pub fn find_nearby(&mut self, kind: HostKind) -> Option<Host> {
        let ty = match kind {
            HostKind::Any => CacheType::FreshAny,
            HostKind::Ultra => CacheType::FreshUltra,
            HostKind::Guess => CacheType::Guess,
        };
        self.find_nearby_in(ty)
    }

    fn find_nearby_in(&mut self, ty: CacheType) -> Option<Host> {
        let found = self
            .bucket(ty)
            .list
            .iter()
            .find(|h| self.gate.is_nearby(&h.addr))
            .copied();
        if let Some(host) = found {
            self.unlink_host(ty, &host);
            return Some(host);
        }
        None
    }

    // ========================================================================
    // Expiry
    // ========================================================================

    /// Walk the behavior-keyed bad caches from the oldest entry, dropping
    /// everything past the expiry horizon. Lists are sorted by insertion
    /// time, so the walk stops at the first live entry.
    pub fn expire(&mut self, now: u64) -> usize {
        let mut expired = 0;
        for ty in [CacheType::Timeout, CacheType::Busy, CacheType::Unstable] {
            loop {
                let Some(tail) = self.bucket(ty).list.tail() else {
                    break;
                };
                let added = match self.table(CacheClass::Host).get(&tail) {
                    Some(HostEntry::Meta { added, .. }) => *added,
                    _ => 0,
                };
                if now.saturating_sub(added) > HOST_EXPIRY_SECS {
                    self.unlink_host(ty, &tail);
                    expired += 1;
                } else {
                    break;
                }
            }
        }
        if expired > 0 {
            debug!(expired, "expired bad hosts");
        }
        expired
    }

    // ========================================================================
    // Persistence
    // ========================================================================

    /// Re-sort a cache so newest entries sit at the head; entries without
    /// metadata go last.
    pub fn sort_by_added_time(&mut self, ty: CacheType) {
        let class = ty.class();
        let mut hosts = self.bucket_mut(ty).list.take_all();
        hosts.sort_by_key(|h| match self.table(class).get(h).copied() {
            Some(HostEntry::Meta { added, .. }) => (0u8, std::cmp::Reverse(added)),
            _ => (1u8, std::cmp::Reverse(0)),
        });
        self.bucket_mut(ty).list.refill(hosts);
    }

    fn store_plan(kind: HostKind) -> (CacheType, CacheType, &'static str) {
        match kind {
            HostKind::Any => (CacheType::ValidAny, CacheType::FreshAny, HOSTS_FILE),
            HostKind::Ultra => (CacheType::ValidUltra, CacheType::FreshUltra, ULTRAS_FILE),
            HostKind::Guess => (CacheType::GuessIntro, CacheType::Guess, GUESS_FILE),
        }
    }

    fn persisted_pairs(&self, first: CacheType, second: CacheType) -> Vec<(Host, u64)> {
        let class = first.class();
        let mut out = Vec::new();
        for ty in [first, second] {
            let mut half: Vec<(Host, u64)> = self
                .bucket(ty)
                .list
                .iter()
                .filter_map(|h| match self.table(class).get(h) {
                    Some(HostEntry::Meta { added, .. }) => Some((*h, *added)),
                    _ => None,
                })
                .collect();
            half.sort_by_key(|(_, added)| std::cmp::Reverse(*added));
            out.extend(half);
        }
        out
    }

    /// Persist a kind if either half changed since the last write. Dirty
    /// flags clear only on success so a failed write retries next period.
    pub fn store_if_dirty(&mut self, kind: HostKind, dir: &Path) -> Result<()> {
        let (first, second, file) = Self::store_plan(kind);
        if !self.bucket(first).dirty && !self.bucket(second).dirty {
            return Ok(());
        }
        persist::write_hosts(&dir.join(file), self.persisted_pairs(first, second))?;
        self.bucket_mut(first).dirty = false;
        self.bucket_mut(second).dirty = false;
        Ok(())
    }

    /// Unconditional store of all three kinds, for shutdown.
    pub fn store_all(&mut self, dir: &Path) -> Result<()> {
        for kind in [HostKind::Any, HostKind::Ultra, HostKind::Guess] {
            let (first, second, file) = Self::store_plan(kind);
            persist::write_hosts(&dir.join(file), self.persisted_pairs(first, second))?;
            self.bucket_mut(first).dirty = false;
            self.bucket_mut(second).dirty = false;
        }
        Ok(())
    }

    /// Load the persisted host files back into the fresh caches.
    pub fn retrieve_all(&mut self, dir: &Path, settings: &Settings) -> Result<()> {
        self.load_file(CacheType::FreshAny, &dir.join(HOSTS_FILE), settings)?;
        self.load_file(CacheType::FreshUltra, &dir.join(ULTRAS_FILE), settings)?;
        self.load_file(CacheType::Guess, &dir.join(GUESS_FILE), settings)?;
        Ok(())
    }

    fn load_file(&mut self, ty: CacheType, path: &Path, settings: &Settings) -> Result<()> {
        let now = unix_now();
        for (host, stamp) in persist::read_hosts(path)? {
            // Unparsable, future or stale stamps are clamped to the expiry
            // horizon so those entries die at the first expiry pass.
            let added = match stamp {
                Some(t) if t <= now && now - t <= HOST_EXPIRY_SECS => t,
                _ => now.saturating_sub(HOST_EXPIRY_SECS),
            };
            self.add_at(ty, added, host, "on-disk cache", settings);
            if self.slots_left(ty, settings) < 1 {
                break;
            }
        }
        self.sort_by_added_time(ty);
        Ok(())
    }
}
