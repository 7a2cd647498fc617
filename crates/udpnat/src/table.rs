//! The NAT table — flow key → session, with LRU/TTL eviction.
//!
//! Per-key atomicity comes from the dashmap entry API: the shard lock is held
//! across the existence check and the insert, so only one creation wins per
//! key. Evicted sessions are closed after their entry is gone and the shard
//! lock is released.
//!
//! Expiry is enforced whatever the key: every lookup sweeps the whole table
//! once per sweep interval, so idle flows go away with or without the
//! background sweeper.

use std::fmt::Debug;
use std::hash::Hash;
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use udpnat_core::NatConfig;

use crate::error::CloseReason;
use crate::session::NatSession;

struct TableEntry {
    session: Arc<NatSession>,
    last_access: Instant,
}

impl TableEntry {
    fn new(session: Arc<NatSession>, now: Instant) -> Self {
        Self {
            session,
            last_access: now,
        }
    }

    fn is_expired(&self, now: Instant, max_age: Duration) -> bool {
        now.saturating_duration_since(self.last_access) > max_age
    }
}

pub struct NatTable<K: Eq + Hash> {
    entries: DashMap<K, TableEntry>,
    max_age: Duration,
    refresh_on_access: bool,
    /// 0 = unlimited.
    max_flows: usize,
    sweep_interval: Duration,
    last_sweep: Mutex<Instant>,
}

impl<K: Eq + Hash> NatTable<K> {
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains_key(&self, key: &K) -> bool {
        self.entries.contains_key(key)
    }

    pub fn max_age(&self) -> Duration {
        self.max_age
    }

    /// Remove every entry and close its session. Returns how many were open.
    pub fn close_all(&self) -> usize {
        let mut sessions = Vec::new();
        self.entries.retain(|_, entry| {
            sessions.push(entry.session.clone());
            false
        });
        for session in &sessions {
            if let Err(e) = session.close_with(CloseReason::TableClosed) {
                tracing::debug!(error = %e, "write-back close failed on teardown");
            }
        }
        sessions.len()
    }
}

impl<K> NatTable<K>
where
    K: Eq + Hash + Clone + Debug,
{
    pub fn new(config: &NatConfig) -> Self {
        Self {
            entries: DashMap::new(),
            max_age: config.max_age(),
            refresh_on_access: config.refresh_on_access,
            max_flows: config.max_flows,
            sweep_interval: config.sweep_interval(),
            last_sweep: Mutex::new(Instant::now()),
        }
    }

    /// Return the live session for `key`, creating it with `create` if the
    /// key is absent or its entry has expired.
    ///
    /// `create` runs under the key's shard lock and must not call back into
    /// the table. The bool is true when an existing session was returned.
    pub(crate) fn lookup_or_create<F>(&self, key: K, create: F) -> (Arc<NatSession>, bool)
    where
        F: FnOnce() -> Arc<NatSession>,
    {
        self.sweep_if_due();

        if self.max_flows > 0
            && self.entries.len() >= self.max_flows
            && !self.entries.contains_key(&key)
        {
            self.evict_oldest();
        }

        let now = Instant::now();
        let mut expired = None;
        let result = match self.entries.entry(key.clone()) {
            Entry::Occupied(mut occupied) => {
                if occupied.get().is_expired(now, self.max_age) {
                    let session = create();
                    let old = occupied.insert(TableEntry::new(session.clone(), now));
                    expired = Some(old.session);
                    (session, false)
                } else {
                    let entry = occupied.get_mut();
                    if self.refresh_on_access {
                        entry.last_access = now;
                    }
                    (entry.session.clone(), true)
                }
            }
            Entry::Vacant(vacant) => {
                let session = create();
                vacant.insert(TableEntry::new(session.clone(), now));
                (session, false)
            }
        };

        if let Some(session) = expired {
            close_evicted(&key, &session);
        }
        result
    }

    /// Current session for `key`, without touching its access time.
    pub fn get(&self, key: &K) -> Option<Arc<NatSession>> {
        self.entries.get(key).map(|entry| entry.session.clone())
    }

    /// Remove `key` if present. The session is returned, not closed.
    pub fn remove(&self, key: &K) -> Option<Arc<NatSession>> {
        self.entries.remove(key).map(|(_, entry)| entry.session)
    }

    /// Remove `key` only while it still maps to `session`.
    ///
    /// A flow that finishes after its key was re-created must not take the
    /// new flow's entry with it.
    pub fn remove_session(&self, key: &K, session: &NatSession) -> bool {
        self.entries
            .remove_if(key, |_, entry| std::ptr::eq(Arc::as_ptr(&entry.session), session))
            .is_some()
    }

    /// Evict every entry idle for longer than max age. Returns the count.
    pub fn evict_expired(&self) -> usize {
        let now = Instant::now();
        let mut evicted = Vec::new();
        self.entries.retain(|key, entry| {
            if entry.is_expired(now, self.max_age) {
                evicted.push((key.clone(), entry.session.clone()));
                false
            } else {
                true
            }
        });
        for (key, session) in &evicted {
            close_evicted(key, session);
        }
        evicted.len()
    }

    /// Run `evict_expired` if a sweep interval has passed since the last
    /// lookup-driven sweep. Skipped while another lookup is sweeping.
    fn sweep_if_due(&self) {
        let now = Instant::now();
        let due = match self.last_sweep.try_lock() {
            Ok(mut last) if now.saturating_duration_since(*last) >= self.sweep_interval => {
                *last = now;
                true
            }
            _ => false,
        };
        if due {
            let evicted = self.evict_expired();
            if evicted > 0 {
                tracing::trace!(evicted, "expired flows evicted on lookup");
            }
        }
    }

    /// Evict the least recently accessed entry.
    fn evict_oldest(&self) {
        let oldest = self
            .entries
            .iter()
            .min_by_key(|entry| entry.value().last_access)
            .map(|entry| entry.key().clone());
        if let Some(key) = oldest {
            if let Some((key, entry)) = self.entries.remove(&key) {
                close_evicted(&key, &entry.session);
            }
        }
    }
}

impl<K> NatTable<K>
where
    K: Eq + Hash + Clone + Debug + Send + Sync + 'static,
{
    /// Run `evict_expired` every `period` until `shutdown` fires or the table
    /// is dropped.
    pub fn spawn_sweeper(
        self: &Arc<Self>,
        period: Duration,
        shutdown: CancellationToken,
    ) -> JoinHandle<()> {
        let table: Weak<Self> = Arc::downgrade(self);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => {
                        tracing::debug!("nat sweeper shutting down");
                        return;
                    }
                    _ = interval.tick() => {
                        let Some(table) = table.upgrade() else {
                            return;
                        };
                        let evicted = table.evict_expired();
                        if evicted > 0 {
                            tracing::debug!(evicted, remaining = table.len(), "nat table sweep");
                        }
                    }
                }
            }
        })
    }
}

impl<K: Eq + Hash> Drop for NatTable<K> {
    fn drop(&mut self) {
        self.close_all();
    }
}

fn close_evicted<K: Debug>(key: &K, session: &NatSession) {
    tracing::debug!(key = ?key, "flow evicted");
    if let Err(e) = session.close_with(CloseReason::Evicted) {
        tracing::debug!(key = ?key, error = %e, "write-back close failed on eviction");
    }
}
