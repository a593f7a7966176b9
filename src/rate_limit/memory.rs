use super::clock::Clock;
use super::store::{RateLimitStore, StoreError, StoreOp, WindowSlot};
use async_trait::async_trait;
use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::debug;

/// Sorted set with an optional expiry
#[derive(Debug, Default)]
struct ScoredSet {
    members: Vec<(i64, String)>,
    expires_at_ms: Option<i64>,
}

impl ScoredSet {
    fn remove_below(&mut self, max_exclusive: i64) -> i64 {
        let before = self.members.len();
        self.members.retain(|(score, _)| *score >= max_exclusive);
        (before - self.members.len()) as i64
    }

    fn add(&mut self, score: i64, member: &str) -> i64 {
        match self.members.iter_mut().find(|(_, m)| m == member) {
            Some(existing) => {
                existing.0 = score;
                0
            }
            None => {
                self.members.push((score, member.to_string()));
                1
            }
        }
    }

    fn remove(&mut self, member: &str) -> bool {
        let before = self.members.len();
        self.members.retain(|(_, m)| m != member);
        before != self.members.len()
    }
}

/// All keys plus an index of their expiry times
///
/// Every key with a TTL has exactly one `(expires_at_ms, key)` entry in
/// `expiries`, so sweeping is a walk from the front of the index.
#[derive(Debug, Default)]
struct Keyspace {
    sets: HashMap<String, ScoredSet>,
    expiries: BTreeSet<(i64, String)>,
}

impl Keyspace {
    /// Drop every key whose TTL has elapsed
    fn sweep(&mut self, now_ms: i64) {
        let mut evicted = 0usize;
        while self
            .expiries
            .first()
            .is_some_and(|(expires_at, _)| *expires_at <= now_ms)
        {
            if let Some((_, key)) = self.expiries.pop_first() {
                self.sets.remove(&key);
                evicted += 1;
            }
        }
        if evicted > 0 {
            debug!(evicted, remaining = self.sets.len(), "Evicted expired keys");
        }
    }

    fn remove_key(&mut self, key: &str) {
        if let Some(set) = self.sets.remove(key) {
            if let Some(expires_at) = set.expires_at_ms {
                self.expiries.remove(&(expires_at, key.to_string()));
            }
        }
    }

    /// Empty sorted sets cease to exist, as in Redis
    fn drop_if_empty(&mut self, key: &str) {
        if self.sets.get(key).is_some_and(|set| set.members.is_empty()) {
            self.remove_key(key);
        }
    }

    fn set_expiry(&mut self, key: &str, expires_at_ms: i64) -> i64 {
        let Some(set) = self.sets.get_mut(key) else {
            return 0;
        };
        if let Some(previous) = set.expires_at_ms.replace(expires_at_ms) {
            self.expiries.remove(&(previous, key.to_string()));
        }
        self.expiries.insert((expires_at_ms, key.to_string()));
        1
    }

    fn apply(&mut self, op: &StoreOp, now_ms: i64) -> i64 {
        match op {
            StoreOp::ZRemRangeByScore { key, max_exclusive } => {
                let removed = self
                    .sets
                    .get_mut(key)
                    .map_or(0, |set| set.remove_below(*max_exclusive));
                self.drop_if_empty(key);
                removed
            }
            StoreOp::ZCard { key } => self.sets.get(key).map_or(0, |set| set.members.len() as i64),
            StoreOp::ZAdd { key, score, member } => {
                self.sets.entry(key.clone()).or_default().add(*score, member)
            }
            StoreOp::Expire { key, seconds } => {
                let ttl_ms = i64::try_from(*seconds)
                    .unwrap_or(i64::MAX)
                    .saturating_mul(1000);
                self.set_expiry(key, now_ms.saturating_add(ttl_ms))
            }
        }
    }
}

/// In-process rate-limit store with sorted-set and TTL semantics
///
/// Every operation runs under a single lock, so pipelines and scripts are
/// atomic across keys. Expired keys are swept whenever the lock is taken.
/// Used for tests and single-node deployments.
pub struct MemoryStore {
    clock: Arc<dyn Clock>,
    keyspace: Mutex<Keyspace>,
    available: AtomicBool,
}

impl MemoryStore {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            clock,
            keyspace: Mutex::new(Keyspace::default()),
            available: AtomicBool::new(true),
        }
    }

    /// Simulate an outage: while unavailable every call fails
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    /// Number of live members under `key`
    pub fn cardinality(&self, key: &str) -> usize {
        match self.lock() {
            Ok(keyspace) => keyspace.sets.get(key).map_or(0, |set| set.members.len()),
            Err(_) => 0,
        }
    }

    /// Number of live keys
    pub fn key_count(&self) -> usize {
        match self.lock() {
            Ok(keyspace) => keyspace.sets.len(),
            Err(_) => 0,
        }
    }

    /// Take the lock and sweep expired keys
    fn lock(&self) -> Result<MutexGuard<'_, Keyspace>, StoreError> {
        if !self.available.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("memory store marked unavailable".into()));
        }
        let mut keyspace = self
            .keyspace
            .lock()
            .map_err(|_| StoreError::Unavailable("memory store lock poisoned".into()))?;
        keyspace.sweep(self.clock.now_ms());
        Ok(keyspace)
    }
}

#[async_trait]
impl RateLimitStore for MemoryStore {
    async fn pipeline(&self, ops: Vec<StoreOp>) -> Result<Vec<i64>, StoreError> {
        let mut keyspace = self.lock()?;
        let now = self.clock.now_ms();
        Ok(ops.iter().map(|op| keyspace.apply(op, now)).collect())
    }

    async fn zrem(&self, key: &str, member: &str) -> Result<(), StoreError> {
        let mut keyspace = self.lock()?;
        if let Some(set) = keyspace.sets.get_mut(key) {
            set.remove(member);
        }
        keyspace.drop_if_empty(key);
        Ok(())
    }

    async fn check_windows_atomic(
        &self,
        windows: &[WindowSlot],
        now_ms: i64,
    ) -> Result<Vec<u64>, StoreError> {
        let mut keyspace = self.lock()?;
        let clock_now = self.clock.now_ms();

        let mut counts = Vec::with_capacity(windows.len());
        let mut admit = true;
        for slot in windows {
            let window_ms = i64::try_from(slot.window_secs)
                .unwrap_or(i64::MAX)
                .saturating_mul(1000);
            let prune = StoreOp::ZRemRangeByScore {
                key: slot.key.clone(),
                max_exclusive: now_ms.saturating_sub(window_ms),
            };
            keyspace.apply(&prune, clock_now);
            let count = keyspace.apply(&StoreOp::ZCard { key: slot.key.clone() }, clock_now);
            if count as u64 + 1 > u64::from(slot.max_requests) {
                admit = false;
            }
            counts.push(count as u64);
        }

        for slot in windows {
            if admit {
                let add = StoreOp::ZAdd {
                    key: slot.key.clone(),
                    score: now_ms,
                    member: slot.member.clone(),
                };
                keyspace.apply(&add, clock_now);
            }
            let expire = StoreOp::Expire {
                key: slot.key.clone(),
                seconds: slot.window_secs,
            };
            keyspace.apply(&expire, clock_now);
        }

        Ok(counts)
    }

    async fn ping(&self) -> Result<(), StoreError> {
        self.lock().map(|_| ())
    }
}
