//! Search queues: pacing of outgoing query messages.
//!
//! Each connected peer gets its own queue, and queries trickle out at a
//! fixed spacing so the overlay is not flooded. An ultrapeer running its
//! own dynamic queries additionally keeps one global queue whose entries
//! are handed to the dynamic-query launcher instead of a peer.
//!
//! Dispatch is LIFO: the most recently enqueued query goes out first, on
//! the theory that the freshest search is the one the user cares about.

use std::collections::{HashSet, VecDeque};

use tracing::debug;

use crate::config::Settings;

/// Handle to the search that issued a query.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SearchHandle(pub u32);

/// Identity of a connected peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NodeId(pub u32);

/// Our current role in the overlay.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerMode {
    Leaf,
    Legacy,
    Ultra,
}

/// Query routing-table hash words carried by a dynamic query.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueryHashVec(pub Vec<u32>);

/// Attached to a dispatched query when we are a leaf, so the search layer
/// hears about it once the transport actually processes the message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SentNote {
    pub search: SearchHandle,
    pub node: NodeId,
}

/// The peer a per-node queue feeds into.
pub trait QueryPeer {
    fn id(&self) -> NodeId;
    /// Has the peer sent us anything yet? Before the handshake ping there
    /// is no point pushing queries at it.
    fn has_received(&self) -> bool;
    /// Hops-flow: a peer may refuse hops=0 queries as back-pressure.
    fn allows_zero_hop(&self) -> bool;
    fn is_writable(&self) -> bool;
    fn in_flow_control(&self) -> bool;
    /// Hand the query to the peer's outbound message queue. The `note`,
    /// when present, must be delivered back through
    /// [`SearchBackend::notify_sent`] once the message is processed.
    fn push_query(&mut self, payload: Vec<u8>, note: Option<SentNote>);
}

/// The search subsystem and dynamic-query machinery the queues report to.
pub trait SearchBackend {
    /// May this search still emit queries right now?
    fn query_allowed(&self, search: SearchHandle) -> bool;
    /// A query for `note.search` was processed by the transport.
    fn notify_sent(&mut self, note: SentNote);
    /// Launch a locally issued dynamic query (global queue only).
    fn launch_dynamic(&mut self, search: SearchHandle, payload: Vec<u8>, qhv: QueryHashVec);
    /// How many ultrapeer connections we still want; gates the global queue.
    fn missing_ultra(&self) -> u32;
}

struct QueuedQuery {
    search: SearchHandle,
    payload: Vec<u8>,
    qhv: Option<QueryHashVec>,
}

/// A paced queue of outgoing queries, bound to a peer or global.
pub struct SearchQueue {
    node: Option<NodeId>,
    /// Front is the newest entry.
    entries: VecDeque<QueuedQuery>,
    handles: HashSet<SearchHandle>,
    sent: u64,
    dropped: u64,
    last_sent: u64,
}

impl SearchQueue {
    /// Create a queue. `last_sent` starts at the current time so a fresh
    /// connection stays quiet for the first spacing interval; if it does
    /// not live that long the query would have been wasted anyway.
    pub fn new(node: Option<NodeId>, now: u64) -> Self {
        Self {
            node,
            entries: VecDeque::new(),
            handles: HashSet::new(),
            sent: 0,
            dropped: 0,
            last_sent: now,
        }
    }

    pub fn node(&self) -> Option<NodeId> {
        self.node
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn sent(&self) -> u64 {
        self.sent
    }

    pub fn dropped(&self) -> u64 {
        self.dropped
    }

    /// Enqueue a query for a search (LIFO). A search already queued here
    /// is silently ignored.
    pub fn put(&mut self, search: SearchHandle, payload: Vec<u8>, settings: &Settings) {
        self.put_with(search, payload, None, settings);
    }

    /// Enqueue a dynamic query with its hash vector (global queue).
    pub fn put_with(
        &mut self,
        search: SearchHandle,
        payload: Vec<u8>,
        qhv: Option<QueryHashVec>,
        settings: &Settings,
    ) {
        if self.handles.contains(&search) {
            return;
        }
        self.entries.push_front(QueuedQuery {
            search,
            payload,
            qhv,
        });
        self.handles.insert(search);
        if self.entries.len() > settings.search_queue_size {
            self.cap(settings);
        }
    }

    /// Drop the oldest entries until the queue fits the configured cap.
    fn cap(&mut self, settings: &Settings) {
        while self.entries.len() > settings.search_queue_size {
            let Some(entry) = self.entries.pop_back() else {
                break;
            };
            self.handles.remove(&entry.search);
            self.dropped += 1;
            debug!(
                node = ?self.node,
                search = entry.search.0,
                left = self.entries.len(),
                dropped = self.dropped,
                "query dropped by queue cap"
            );
        }
    }

    /// Try to dispatch one message.
    ///
    /// For a per-peer queue, `peer` must be the bound node; the global
    /// queue passes `None` and hands off to the dynamic-query launcher. A
    /// query whose search vetoes emission is discarded and the next entry
    /// tried immediately, so the spacing is not wasted on it; the loop is
    /// bounded because every iteration removes an entry.
    pub fn process(
        &mut self,
        now: u64,
        mode: PeerMode,
        mut peer: Option<&mut dyn QueryPeer>,
        backend: &mut dyn SearchBackend,
        settings: &Settings,
    ) {
        loop {
            if self.entries.is_empty() {
                return;
            }
            if (now as i64 - self.last_sent as i64) < settings.search_queue_spacing as i64 {
                return;
            }

            match peer.as_deref_mut() {
                Some(p) => {
                    if !p.has_received()
                        || !p.allows_zero_hop()
                        || !p.is_writable()
                        || p.in_flow_control()
                    {
                        return;
                    }
                }
                None => {
                    if mode != PeerMode::Ultra {
                        return;
                    }
                    // Launching dynamic queries with too few ultrapeers
                    // around wastes them.
                    if backend.missing_ultra() * 3 > 2 * settings.up_connections {
                        return;
                    }
                }
            }

            let Some(entry) = self.entries.pop_front() else {
                return;
            };
            self.handles.remove(&entry.search);

            let dispatched = match peer.as_deref_mut() {
                None => {
                    debug_assert!(entry.qhv.is_some(), "global entry without hash vector");
                    let qhv = entry.qhv.unwrap_or_else(|| QueryHashVec(Vec::new()));
                    debug!(
                        search = entry.search.0,
                        left = self.entries.len(),
                        sent = self.sent,
                        "launching dynamic query"
                    );
                    backend.launch_dynamic(entry.search, entry.payload, qhv);
                    true
                }
                Some(p) => {
                    debug_assert!(entry.qhv.is_none(), "per-peer entry with hash vector");
                    if backend.query_allowed(entry.search) {
                        // As a leaf we run leaf-guided dynamic queries and
                        // need to hear about every physical query that
                        // actually leaves, so tag the message.
                        let note = (mode == PeerMode::Leaf).then(|| SentNote {
                            search: entry.search,
                            node: p.id(),
                        });
                        debug!(
                            node = p.id().0,
                            search = entry.search.0,
                            left = self.entries.len(),
                            sent = self.sent,
                            "queueing query to node"
                        );
                        p.push_query(entry.payload, note);
                        true
                    } else {
                        debug!(
                            node = p.id().0,
                            search = entry.search.0,
                            left = self.entries.len(),
                            "query vetoed by search, ignored"
                        );
                        false
                    }
                }
            };

            if dispatched {
                self.sent += 1;
                self.last_sent = now;
                return;
            }
            // Vetoed: retry with the next (older) entry.
        }
    }

    /// Drop every queued entry. Counters survive.
    pub fn clear(&mut self) {
        debug!(
            node = ?self.node,
            sent = self.sent,
            dropped = self.dropped,
            cleared = self.entries.len(),
            "clearing search queue"
        );
        self.entries.clear();
        self.handles.clear();
    }

    /// A search was closed: sweep out anything it still has queued.
    pub fn search_closed(&mut self, search: SearchHandle) {
        let before = self.entries.len();
        self.entries.retain(|e| e.search != search);
        self.handles.remove(&search);
        if self.entries.len() != before {
            debug!(
                node = ?self.node,
                search = search.0,
                left = self.entries.len(),
                "dropped queued query on search close"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct MockPeer {
        id: NodeId,
        received: bool,
        zero_hop_ok: bool,
        writable: bool,
        flow_controlled: bool,
        pushed: Vec<(Vec<u8>, Option<SentNote>)>,
    }

    impl MockPeer {
        fn healthy(id: u32) -> Self {
            Self {
                id: NodeId(id),
                received: true,
                zero_hop_ok: true,
                writable: true,
                flow_controlled: false,
                pushed: Vec::new(),
            }
        }
    }

    impl QueryPeer for MockPeer {
        fn id(&self) -> NodeId {
            self.id
        }
        fn has_received(&self) -> bool {
            self.received
        }
        fn allows_zero_hop(&self) -> bool {
            self.zero_hop_ok
        }
        fn is_writable(&self) -> bool {
            self.writable
        }
        fn in_flow_control(&self) -> bool {
            self.flow_controlled
        }
        fn push_query(&mut self, payload: Vec<u8>, note: Option<SentNote>) {
            self.pushed.push((payload, note));
        }
    }

    #[derive(Default)]
    struct MockBackend {
        vetoed: HashSet<SearchHandle>,
        launched: Vec<(SearchHandle, Vec<u8>, QueryHashVec)>,
        notes: Vec<SentNote>,
        missing: u32,
    }

    impl SearchBackend for MockBackend {
        fn query_allowed(&self, search: SearchHandle) -> bool {
            !self.vetoed.contains(&search)
        }
        fn notify_sent(&mut self, note: SentNote) {
            self.notes.push(note);
        }
        fn launch_dynamic(&mut self, search: SearchHandle, payload: Vec<u8>, qhv: QueryHashVec) {
            self.launched.push((search, payload, qhv));
        }
        fn missing_ultra(&self) -> u32 {
            self.missing
        }
    }

    fn settings() -> Settings {
        Settings {
            search_queue_spacing: 0,
            search_queue_size: 4,
            up_connections: 32,
            ..Settings::default()
        }
    }

    #[test]
    fn dispatch_is_lifo() {
        let s = settings();
        let mut q = SearchQueue::new(Some(NodeId(1)), 100);
        let mut peer = MockPeer::healthy(1);
        let mut backend = MockBackend::default();

        q.put(SearchHandle(1), b"q1".to_vec(), &s);
        q.put(SearchHandle(2), b"q2".to_vec(), &s);

        q.process(101, PeerMode::Ultra, Some(&mut peer), &mut backend, &s);
        q.process(102, PeerMode::Ultra, Some(&mut peer), &mut backend, &s);

        let payloads: Vec<&[u8]> = peer.pushed.iter().map(|(p, _)| p.as_slice()).collect();
        assert_eq!(payloads, vec![b"q2".as_slice(), b"q1".as_slice()]);
        assert_eq!(q.sent(), 2);
        assert!(q.is_empty());
    }

    #[test]
    fn duplicate_search_is_silently_ignored() {
        let s = settings();
        let mut q = SearchQueue::new(Some(NodeId(1)), 100);

        q.put(SearchHandle(1), b"first".to_vec(), &s);
        q.put(SearchHandle(1), b"second".to_vec(), &s);
        assert_eq!(q.len(), 1);

        let mut peer = MockPeer::healthy(1);
        let mut backend = MockBackend::default();
        q.process(101, PeerMode::Ultra, Some(&mut peer), &mut backend, &s);
        assert_eq!(peer.pushed[0].0, b"first".to_vec());
    }

    #[test]
    fn spacing_paces_dispatch() {
        let mut s = settings();
        s.search_queue_spacing = 10;
        let mut q = SearchQueue::new(Some(NodeId(1)), 100);
        let mut peer = MockPeer::healthy(1);
        let mut backend = MockBackend::default();

        q.put(SearchHandle(1), b"q1".to_vec(), &s);
        q.put(SearchHandle(2), b"q2".to_vec(), &s);

        // Queue was created at t=100: nothing before t=110.
        q.process(105, PeerMode::Ultra, Some(&mut peer), &mut backend, &s);
        assert_eq!(q.sent(), 0);

        q.process(110, PeerMode::Ultra, Some(&mut peer), &mut backend, &s);
        assert_eq!(q.sent(), 1);

        // And again nothing until ten more seconds pass.
        q.process(115, PeerMode::Ultra, Some(&mut peer), &mut backend, &s);
        assert_eq!(q.sent(), 1);
        q.process(120, PeerMode::Ultra, Some(&mut peer), &mut backend, &s);
        assert_eq!(q.sent(), 2);
    }

    #[test]
    fn unready_peers_block_dispatch() {
        let s = settings();
        let mut backend = MockBackend::default();

        let configs: Vec<Box<dyn Fn(&mut MockPeer)>> = vec![
            Box::new(|p| p.received = false),
            Box::new(|p| p.zero_hop_ok = false),
            Box::new(|p| p.writable = false),
            Box::new(|p| p.flow_controlled = true),
        ];

        for config in configs {
            let mut q = SearchQueue::new(Some(NodeId(1)), 100);
            q.put(SearchHandle(1), b"q".to_vec(), &s);
            let mut peer = MockPeer::healthy(1);
            config(&mut peer);
            q.process(200, PeerMode::Ultra, Some(&mut peer), &mut backend, &s);
            assert!(peer.pushed.is_empty());
            assert_eq!(q.len(), 1, "blocked query must stay queued");
        }
    }

    #[test]
    fn leaf_mode_tags_queries_with_a_note() {
        let s = settings();
        let mut q = SearchQueue::new(Some(NodeId(7)), 100);
        let mut peer = MockPeer::healthy(7);
        let mut backend = MockBackend::default();

        q.put(SearchHandle(3), b"q".to_vec(), &s);
        q.process(101, PeerMode::Leaf, Some(&mut peer), &mut backend, &s);

        assert_eq!(
            peer.pushed[0].1,
            Some(SentNote {
                search: SearchHandle(3),
                node: NodeId(7)
            })
        );

        // Ultrapeers do not tag.
        q.put(SearchHandle(4), b"q".to_vec(), &s);
        q.process(102, PeerMode::Ultra, Some(&mut peer), &mut backend, &s);
        assert_eq!(peer.pushed[1].1, None);
    }

    #[test]
    fn vetoed_query_is_discarded_and_next_tried() {
        let s = settings();
        let mut q = SearchQueue::new(Some(NodeId(1)), 100);
        let mut peer = MockPeer::healthy(1);
        let mut backend = MockBackend::default();
        backend.vetoed.insert(SearchHandle(2));

        q.put(SearchHandle(1), b"q1".to_vec(), &s);
        q.put(SearchHandle(2), b"q2".to_vec(), &s);

        // The newest entry is vetoed; the older one goes out in the same
        // call so the spacing window is not wasted.
        q.process(101, PeerMode::Ultra, Some(&mut peer), &mut backend, &s);

        assert_eq!(peer.pushed.len(), 1);
        assert_eq!(peer.pushed[0].0, b"q1".to_vec());
        assert_eq!(q.sent(), 1);
        assert!(q.is_empty());
    }

    #[test]
    fn all_vetoed_sends_nothing() {
        let s = settings();
        let mut q = SearchQueue::new(Some(NodeId(1)), 100);
        let mut peer = MockPeer::healthy(1);
        let mut backend = MockBackend::default();
        backend.vetoed.insert(SearchHandle(1));
        backend.vetoed.insert(SearchHandle(2));

        q.put(SearchHandle(1), b"q1".to_vec(), &s);
        q.put(SearchHandle(2), b"q2".to_vec(), &s);
        q.process(101, PeerMode::Ultra, Some(&mut peer), &mut backend, &s);

        assert!(peer.pushed.is_empty());
        assert!(q.is_empty());
        assert_eq!(q.sent(), 0);
    }

    #[test]
    fn cap_drops_the_oldest_entries() {
        let s = settings();
        let mut q = SearchQueue::new(Some(NodeId(1)), 100);

        for n in 1..=6 {
            q.put(SearchHandle(n), format!("q{n}").into_bytes(), &s);
        }

        assert_eq!(q.len(), 4);
        assert_eq!(q.dropped(), 2);

        // Oldest searches are the ones that fell off.
        let mut peer = MockPeer::healthy(1);
        let mut backend = MockBackend::default();
        for t in 0..4 {
            q.process(101 + t, PeerMode::Ultra, Some(&mut peer), &mut backend, &s);
        }
        let payloads: Vec<&[u8]> = peer.pushed.iter().map(|(p, _)| p.as_slice()).collect();
        assert_eq!(
            payloads,
            vec![b"q6".as_slice(), b"q5".as_slice(), b"q4".as_slice(), b"q3".as_slice()]
        );
    }

    #[test]
    fn search_closed_sweeps_queued_entries() {
        let s = settings();
        let mut q = SearchQueue::new(Some(NodeId(1)), 100);

        q.put(SearchHandle(1), b"q1".to_vec(), &s);
        q.put(SearchHandle(2), b"q2".to_vec(), &s);
        q.search_closed(SearchHandle(1));

        assert_eq!(q.len(), 1);
        // The handle is free again.
        q.put(SearchHandle(1), b"q1-again".to_vec(), &s);
        assert_eq!(q.len(), 2);
    }

    #[test]
    fn global_queue_requires_ultra_mode() {
        let s = settings();
        let mut q = SearchQueue::new(None, 100);
        let mut backend = MockBackend::default();

        q.put_with(
            SearchHandle(1),
            b"q".to_vec(),
            Some(QueryHashVec(vec![0xabc])),
            &s,
        );

        q.process(101, PeerMode::Leaf, None, &mut backend, &s);
        assert!(backend.launched.is_empty());

        q.process(102, PeerMode::Ultra, None, &mut backend, &s);
        assert_eq!(backend.launched.len(), 1);
        assert_eq!(backend.launched[0].0, SearchHandle(1));
        assert_eq!(backend.launched[0].2, QueryHashVec(vec![0xabc]));
    }

    #[test]
    fn global_queue_waits_for_enough_ultrapeers() {
        let mut s = settings();
        s.up_connections = 9;
        let mut q = SearchQueue::new(None, 100);
        let mut backend = MockBackend::default();
        q.put_with(SearchHandle(1), b"q".to_vec(), Some(QueryHashVec(vec![1])), &s);

        // Missing 7 of 9: 21 > 18, hold back.
        backend.missing = 7;
        q.process(101, PeerMode::Ultra, None, &mut backend, &s);
        assert!(backend.launched.is_empty());

        // Missing 6 of 9: 18 > 18 is false, go.
        backend.missing = 6;
        q.process(102, PeerMode::Ultra, None, &mut backend, &s);
        assert_eq!(backend.launched.len(), 1);
    }

    #[test]
    fn clear_empties_but_keeps_counters() {
        let s = settings();
        let mut q = SearchQueue::new(Some(NodeId(1)), 100);
        let mut peer = MockPeer::healthy(1);
        let mut backend = MockBackend::default();

        q.put(SearchHandle(1), b"q1".to_vec(), &s);
        q.process(101, PeerMode::Ultra, Some(&mut peer), &mut backend, &s);
        q.put(SearchHandle(2), b"q2".to_vec(), &s);
        q.clear();

        assert!(q.is_empty());
        assert_eq!(q.sent(), 1);
        // Cleared handles are reusable.
        q.put(SearchHandle(2), b"q2".to_vec(), &s);
        assert_eq!(q.len(), 1);
    }

    #[test]
    fn last_sent_is_monotonic() {
        let s = settings();
        let mut q = SearchQueue::new(Some(NodeId(1)), 100);
        let mut peer = MockPeer::healthy(1);
        let mut backend = MockBackend::default();

        let mut last = 0;
        for (t, n) in [(110u64, 1u32), (125, 2), (140, 3)] {
            q.put(SearchHandle(n), b"q".to_vec(), &s);
            q.process(t, PeerMode::Ultra, Some(&mut peer), &mut backend, &s);
            assert_eq!(q.sent() as u32, n);
            assert!(q.last_sent >= last);
            last = q.last_sent;
        }
    }
}
