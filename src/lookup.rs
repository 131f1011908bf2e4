//! Iterative FIND_NODE / FIND_VALUE lookups.
//!
//! A lookup walks the ID space toward its target:
//!
//! 1. Seed the shortlist with the closest contacts from the routing table.
//! 2. Query up to α unqueried shortlist members concurrently, each RPC bounded
//!    by its own timeout.
//! 3. Merge returned contacts into the routing table and the candidate set,
//!    re-sort by distance. The shortlist is the closest k live candidates; a
//!    failed contact drops out for good and the next one moves up.
//! 4. Stop when a round brings nothing closer than the best contact seen so far,
//!    when a verified value arrives (FIND_VALUE), when the caller cancels, or
//!    after `max_rounds` rounds.
//!
//! Each RPC runs in its own task. A lookup that returns early never aborts those
//! tasks: late replies still refresh the routing table, only their answer is
//! dropped.

use std::collections::HashSet;

use tokio::sync::{mpsc, watch};
use tokio::time::Duration;
use tracing::{debug, warn};

use crate::config::DhtConfig;
use crate::core::{cmp_by_distance, short_hex, verify_key_value_pair, Contact, Distance, NodeId};
use crate::error::{DhtError, Result};
use crate::network::{DhtNetwork, FindValueResponse};
use crate::peers::{timed_rpc, PeerTracker};

// ─────────────────────────────────────────────────────────────────────────────
// Public types
// ─────────────────────────────────────────────────────────────────────────────

/// Which RPC a lookup issues.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LookupMode {
    FindNode,
    FindValue,
}

/// Lifecycle of a single lookup. A lookup is done once its state has been
/// turned into a [`LookupResult`], which records how it ended.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LookupPhase {
    Init,
    Probing,
    Converged,
    ValueFound,
}

/// A value returned by a FIND_VALUE lookup, already checked against its key.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FoundValue {
    pub value: Vec<u8>,
    pub holder: Contact,
}

/// What a finished lookup learned.
#[derive(Clone, Debug)]
pub struct LookupResult {
    /// Set only for FIND_VALUE lookups that found the value.
    pub value: Option<FoundValue>,
    /// Closest contacts known at the end, nearest first, at most k.
    pub closest: Vec<Contact>,
    /// How the lookup ended: [`LookupPhase::Converged`] or [`LookupPhase::ValueFound`].
    pub phase: LookupPhase,
    pub rounds: usize,
    pub queried: usize,
}

/// Caller side of a lookup cancellation.
#[derive(Debug)]
pub struct CancelHandle {
    tx: watch::Sender<bool>,
}

impl CancelHandle {
    /// Stop the lookup from issuing further RPCs.
    pub fn cancel(&self) {
        let _ = self.tx.send(true);
    }
}

/// Lookup side of a cancellation; pass to [`LookupCoordinator::lookup`].
#[derive(Clone, Debug)]
pub struct CancelToken {
    rx: watch::Receiver<bool>,
}

impl CancelToken {
    pub fn is_cancelled(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolves once cancelled. Never resolves if the handle was dropped first.
    pub async fn cancelled(&mut self) {
        loop {
            if *self.rx.borrow_and_update() {
                return;
            }
            if self.rx.changed().await.is_err() {
                std::future::pending::<()>().await;
            }
        }
    }
}

/// Create a linked cancel handle and token.
pub fn cancel_pair() -> (CancelHandle, CancelToken) {
    let (tx, rx) = watch::channel(false);
    (CancelHandle { tx }, CancelToken { rx })
}

async fn wait_cancelled(token: &mut Option<CancelToken>) {
    match token {
        Some(token) => token.cancelled().await,
        None => std::future::pending::<()>().await,
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Lookup state
// ─────────────────────────────────────────────────────────────────────────────

enum QueryReply {
    Nodes(Vec<Contact>),
    Value(Vec<u8>),
}

impl QueryReply {
    fn contacts(&self) -> &[Contact] {
        match self {
            QueryReply::Nodes(nodes) => nodes,
            QueryReply::Value(_) => &[],
        }
    }
}

type QueryMessage = (Contact, std::result::Result<QueryReply, DhtError>);

/// Ephemeral per-lookup state; created at start, consumed by [`Self::finish`].
struct LookupState {
    target: NodeId,
    local_id: NodeId,
    k: usize,
    phase: LookupPhase,
    /// Every contact seen and not failed, nearest first. Only the first k are
    /// queried, but the tail keeps live responders around in case closer
    /// contacts turn out to be dead.
    candidates: Vec<Contact>,
    seen: HashSet<NodeId>,
    queried: HashSet<NodeId>,
    failed: HashSet<NodeId>,
    responded: usize,
    best_distance: Option<Distance>,
    rounds: usize,
}

impl LookupState {
    fn new(target: NodeId, local_id: NodeId, k: usize, seeds: Vec<Contact>) -> Self {
        let mut state = Self {
            target,
            local_id,
            k,
            phase: LookupPhase::Init,
            candidates: Vec::with_capacity(k),
            seen: HashSet::new(),
            queried: HashSet::new(),
            failed: HashSet::new(),
            responded: 0,
            best_distance: None,
            rounds: 0,
        };
        state.merge(&seeds);
        state
    }

    /// The closest k live contacts.
    fn shortlist(&self) -> &[Contact] {
        &self.candidates[..self.candidates.len().min(self.k)]
    }

    /// Merge contacts into the candidate set. Returns true if one of them is
    /// closer than anything seen before.
    fn merge(&mut self, contacts: &[Contact]) -> bool {
        for contact in contacts {
            if contact.id == self.local_id || self.failed.contains(&contact.id) {
                continue;
            }
            if self.seen.insert(contact.id) {
                self.candidates.push(contact.clone());
            }
        }

        let target = self.target;
        self.candidates
            .sort_by(|a, b| cmp_by_distance(&target, &a.id, &b.id));

        match self.candidates.first().map(|c| c.distance_to(&target)) {
            Some(nearest) if self.best_distance.map_or(true, |best| nearest < best) => {
                self.best_distance = Some(nearest);
                true
            }
            _ => false,
        }
    }

    fn next_candidates(&self, alpha: usize) -> Vec<Contact> {
        self.shortlist()
            .iter()
            .filter(|c| !self.queried.contains(&c.id))
            .take(alpha)
            .cloned()
            .collect()
    }

    fn record_response(&mut self, contacts: &[Contact]) -> bool {
        self.responded += 1;
        self.merge(contacts)
    }

    fn record_failure(&mut self, id: &NodeId) {
        self.failed.insert(*id);
        self.candidates.retain(|c| &c.id != id);
    }

    fn finish(mut self, value: Option<FoundValue>) -> LookupResult {
        self.candidates.truncate(self.k);
        LookupResult {
            value,
            closest: self.candidates,
            phase: self.phase,
            rounds: self.rounds,
            queried: self.queried.len(),
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Coordinator
// ─────────────────────────────────────────────────────────────────────────────

/// Drives iterative lookups against the routing table and network.
pub struct LookupCoordinator<N: DhtNetwork> {
    local_id: NodeId,
    tracker: PeerTracker<N>,
    bucket_size: usize,
    alpha: usize,
    rpc_timeout: Duration,
    max_rounds: usize,
}

impl<N: DhtNetwork> Clone for LookupCoordinator<N> {
    fn clone(&self) -> Self {
        Self {
            local_id: self.local_id,
            tracker: self.tracker.clone(),
            bucket_size: self.bucket_size,
            alpha: self.alpha,
            rpc_timeout: self.rpc_timeout,
            max_rounds: self.max_rounds,
        }
    }
}

impl<N: DhtNetwork> LookupCoordinator<N> {
    pub(crate) fn new(local_id: NodeId, tracker: PeerTracker<N>, config: &DhtConfig) -> Self {
        Self {
            local_id,
            tracker,
            bucket_size: config.bucket_size,
            alpha: config.alpha,
            rpc_timeout: config.rpc_timeout(),
            max_rounds: config.max_rounds,
        }
    }

    /// The k closest reachable contacts to `target`.
    pub async fn find_node(&self, target: NodeId) -> Result<Vec<Contact>> {
        let result = self.lookup(target, LookupMode::FindNode, None).await?;
        Ok(result.closest)
    }

    /// Look up a value; `None` when the lookup converged without finding it.
    pub async fn find_value(&self, key: NodeId) -> Result<Option<FoundValue>> {
        let result = self.lookup(key, LookupMode::FindValue, None).await?;
        Ok(result.value)
    }

    /// Run one iterative lookup.
    ///
    /// Errors only with [`DhtError::LookupFailed`] when every queried contact
    /// failed, or [`DhtError::Cancelled`]. An empty routing table is not an
    /// error: the lookup converges at once with nothing found.
    pub async fn lookup(
        &self,
        target: NodeId,
        mode: LookupMode,
        mut cancel: Option<CancelToken>,
    ) -> Result<LookupResult> {
        let seeds = self
            .tracker
            .routing()
            .closest_peers(&target, self.bucket_size);
        let mut state = LookupState::new(target, self.local_id, self.bucket_size, seeds);

        if state.candidates.is_empty() {
            debug!(target = %short_hex(&target), "no route known, lookup converged empty");
            state.phase = LookupPhase::Converged;
            return Ok(state.finish(None));
        }

        state.phase = LookupPhase::Probing;
        let (tx, mut rx) = mpsc::unbounded_channel::<QueryMessage>();

        loop {
            if state.rounds >= self.max_rounds {
                warn!(
                    target = %short_hex(&target),
                    rounds = state.rounds,
                    "lookup hit round limit, returning current shortlist"
                );
                break;
            }
            if cancel.as_ref().is_some_and(CancelToken::is_cancelled) {
                return Err(DhtError::Cancelled);
            }

            let candidates = state.next_candidates(self.alpha);
            if candidates.is_empty() {
                break;
            }
            state.rounds += 1;

            for contact in &candidates {
                state.queried.insert(contact.id);
                self.spawn_query(contact.clone(), target, mode, tx.clone());
            }

            let mut outstanding = candidates.len();
            let mut responded = 0usize;
            let mut closer = false;
            while outstanding > 0 {
                let message = tokio::select! {
                    biased;
                    _ = wait_cancelled(&mut cancel) => {
                        debug!(target = %short_hex(&target), "lookup cancelled");
                        return Err(DhtError::Cancelled);
                    }
                    message = rx.recv() => message,
                };
                // The lookup holds a sender, so the channel cannot close here.
                let Some((contact, reply)) = message else {
                    break;
                };
                outstanding -= 1;

                match reply {
                    Ok(QueryReply::Value(value)) => {
                        if verify_key_value_pair(&target, &value) {
                            debug!(
                                target = %short_hex(&target),
                                holder = %contact,
                                round = state.rounds,
                                "value found"
                            );
                            state.phase = LookupPhase::ValueFound;
                            return Ok(state.finish(Some(FoundValue {
                                value,
                                holder: contact,
                            })));
                        }
                        warn!(
                            peer = %contact,
                            key = %short_hex(&target),
                            "peer returned a value that does not match its key"
                        );
                        self.tracker.flag_unreachable(&contact.id);
                        state.record_failure(&contact.id);
                    }
                    Ok(QueryReply::Nodes(nodes)) => {
                        responded += 1;
                        closer |= state.record_response(&nodes);
                    }
                    Err(err) => {
                        debug!(peer = %contact, error = %err, "lookup query failed");
                        state.record_failure(&contact.id);
                    }
                }
            }

            // Responders are never dropped, so an empty candidate set means
            // every contact queried so far has failed.
            if state.candidates.is_empty() {
                debug_assert_eq!(state.responded, 0);
                return Err(DhtError::LookupFailed {
                    attempted: state.queried.len(),
                });
            }

            // Once converged, keep going only to sweep unqueried members of the
            // closest k; the loop ends when none are left.
            if state.phase == LookupPhase::Probing && responded > 0 && !closer {
                debug!(
                    target = %short_hex(&target),
                    round = state.rounds,
                    "no closer contacts, sweeping remaining closest"
                );
                state.phase = LookupPhase::Converged;
            }
        }

        state.phase = LookupPhase::Converged;
        debug!(
            target = %short_hex(&target),
            rounds = state.rounds,
            queried = state.queried.len(),
            found = state.shortlist().len(),
            "lookup converged"
        );
        Ok(state.finish(None))
    }

    fn spawn_query(
        &self,
        contact: Contact,
        target: NodeId,
        mode: LookupMode,
        tx: mpsc::UnboundedSender<QueryMessage>,
    ) {
        let tracker = self.tracker.clone();
        let timeout = self.rpc_timeout;
        tokio::spawn(async move {
            let network = tracker.network().clone();
            let reply = match mode {
                LookupMode::FindNode => {
                    timed_rpc(&contact, timeout, network.find_node(&contact, target))
                        .await
                        .map(QueryReply::Nodes)
                }
                LookupMode::FindValue => {
                    timed_rpc(&contact, timeout, network.find_value(&contact, target))
                        .await
                        .map(|response| match response {
                            FindValueResponse::Found(value) => QueryReply::Value(value),
                            FindValueResponse::Closer(nodes) => QueryReply::Nodes(nodes),
                        })
                }
            };

            // Routing updates apply even if the lookup has already returned.
            match &reply {
                Ok(reply) => {
                    tracker.observe(contact.clone());
                    for node in reply.contacts() {
                        tracker.observe(node.clone());
                    }
                }
                Err(_) => tracker.flag_unreachable(&contact.id),
            }
            let _ = tx.send((contact, reply));
        });
    }
}
