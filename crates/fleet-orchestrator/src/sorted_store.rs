use async_trait::async_trait;
use fleet_core::{FleetError, FleetResult};
use parking_lot::Mutex;
use std::cmp::Ordering;
use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering as AtomicOrdering};

/// Position of a member in a sorted set.
///
/// Orders by priority descending, then by sequence ascending, so the
/// smallest score is the next one to pop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Score {
    /// Message priority, 1..=10.
    pub priority: u8,
    /// Store-assigned insertion order, see [`SortedStore::next_sequence`].
    pub sequence: u64,
}

impl Ord for Score {
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .priority
            .cmp(&self.priority)
            .then(self.sequence.cmp(&other.sequence))
    }
}

impl PartialOrd for Score {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Durable sorted-set storage behind the task queue.
///
/// Each operation on a key must be atomic with respect to other operations on
/// the same key; in particular `pop_top` never hands the same member to two
/// callers. Sequence numbers come from the store so that every queue sharing
/// it agrees on insertion order.
#[async_trait]
pub trait SortedStore: Send + Sync {
    /// Next insertion sequence for `key`, strictly greater than any handed
    /// out before by this store.
    async fn next_sequence(&self, key: &str) -> FleetResult<u64>;

    /// Insert `member`, replacing its score if already present.
    async fn insert(&self, key: &str, member: String, score: Score) -> FleetResult<()>;

    /// Up to `n` members in pop order, without removing them.
    async fn top(&self, key: &str, n: usize) -> FleetResult<Vec<String>>;

    /// Remove and return up to `n` members in pop order.
    async fn pop_top(&self, key: &str, n: usize) -> FleetResult<Vec<String>>;

    /// Remove one member. Returns whether it was present.
    async fn remove(&self, key: &str, member: &str) -> FleetResult<bool>;

    /// Number of members under `key`.
    async fn len(&self, key: &str) -> FleetResult<usize>;

    /// Drop every member under `key`, returning how many there were.
    async fn clear(&self, key: &str) -> FleetResult<usize>;
}

// Ordered by (score, member) so equal scores never shadow each other.
#[derive(Default)]
struct SortedSet {
    ordered: BTreeSet<(Score, String)>,
    scores: HashMap<String, Score>,
}

impl SortedSet {
    fn insert(&mut self, member: String, score: Score) {
        if let Some(old) = self.scores.insert(member.clone(), score) {
            self.ordered.remove(&(old, member.clone()));
        }
        self.ordered.insert((score, member));
    }

    fn pop_first(&mut self) -> Option<String> {
        let (_, member) = self.ordered.pop_first()?;
        self.scores.remove(&member);
        Some(member)
    }

    fn remove(&mut self, member: &str) -> bool {
        match self.scores.remove_entry(member) {
            Some((member, score)) => {
                self.ordered.remove(&(score, member));
                true
            }
            None => false,
        }
    }

    fn is_empty(&self) -> bool {
        self.scores.is_empty()
    }
}

/// Process-local [`SortedStore`].
///
/// Can be switched offline to exercise the queue's unavailability handling.
#[derive(Default)]
pub struct InMemorySortedStore {
    sets: Mutex<HashMap<String, SortedSet>>,
    sequence: AtomicU64,
    offline: AtomicBool,
}

impl InMemorySortedStore {
    /// An empty, online store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent operation fail with `QueueUnavailable`.
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, AtomicOrdering::SeqCst);
    }

    /// Number of keys currently holding members.
    pub fn key_count(&self) -> usize {
        self.sets.lock().len()
    }

    fn check_online(&self) -> FleetResult<()> {
        if self.offline.load(AtomicOrdering::SeqCst) {
            Err(FleetError::QueueUnavailable("in-memory store offline".into()))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl SortedStore for InMemorySortedStore {
    async fn next_sequence(&self, _key: &str) -> FleetResult<u64> {
        self.check_online()?;
        Ok(self.sequence.fetch_add(1, AtomicOrdering::SeqCst))
    }

    async fn insert(&self, key: &str, member: String, score: Score) -> FleetResult<()> {
        self.check_online()?;
        self.sets
            .lock()
            .entry(key.to_string())
            .or_default()
            .insert(member, score);
        Ok(())
    }

    async fn top(&self, key: &str, n: usize) -> FleetResult<Vec<String>> {
        self.check_online()?;
        let sets = self.sets.lock();
        Ok(sets
            .get(key)
            .map(|set| set.ordered.iter().take(n).map(|(_, m)| m.clone()).collect())
            .unwrap_or_default())
    }

    async fn pop_top(&self, key: &str, n: usize) -> FleetResult<Vec<String>> {
        self.check_online()?;
        let mut sets = self.sets.lock();
        let Some(set) = sets.get_mut(key) else {
            return Ok(Vec::new());
        };
        let mut popped = Vec::with_capacity(n.min(set.scores.len()));
        while popped.len() < n {
            match set.pop_first() {
                Some(member) => popped.push(member),
                None => break,
            }
        }
        if set.is_empty() {
            sets.remove(key);
        }
        Ok(popped)
    }

    async fn remove(&self, key: &str, member: &str) -> FleetResult<bool> {
        self.check_online()?;
        let mut sets = self.sets.lock();
        let Some(set) = sets.get_mut(key) else {
            return Ok(false);
        };
        let removed = set.remove(member);
        if set.is_empty() {
            sets.remove(key);
        }
        Ok(removed)
    }

    async fn len(&self, key: &str) -> FleetResult<usize> {
        self.check_online()?;
        Ok(self.sets.lock().get(key).map_or(0, |set| set.scores.len()))
    }

    async fn clear(&self, key: &str) -> FleetResult<usize> {
        self.check_online()?;
        Ok(self
            .sets
            .lock()
            .remove(key)
            .map_or(0, |set| set.scores.len()))
    }
}
