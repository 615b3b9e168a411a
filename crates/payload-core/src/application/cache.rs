//! # Payload Cache
//!
//! Registry mapping key hash to entry. The single place entries are created,
//! looked up and evicted. Entries of different payload types share one map
//! behind [`CachedEntry`]; typed access downcasts and reports
//! [`PayloadError::TypeMismatch`] if the stored type differs.
//!
//! Lock order is cache map, then entry. Entries never call back into the
//! cache while holding their own lock.

use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::{Arc, Weak};
use tracing::{debug, info};

use payload_telemetry::{CACHE_ENTRIES, ENTRIES_EVICTED};

use super::entry::{CachedEntry, PayloadEntry};
use crate::adapters::Environment;
use crate::domain::{PayloadError, PayloadKey, PayloadResult};
use crate::options::PayloadOptions;
use crate::ports::Scheduler;

type SuccessHook = Arc<dyn Fn(&str) + Send + Sync>;
type ErrorHook = Arc<dyn Fn(&str, &PayloadError) + Send + Sync>;

/// Cache-wide callbacks, run after the entry's observers were notified.
#[derive(Clone, Default)]
pub struct CacheHooks {
    /// Called with the entry hash after every successful fetch.
    pub on_success: Option<SuccessHook>,
    /// Called with the entry hash when a fetch settles in error.
    pub on_error: Option<ErrorHook>,
}

impl CacheHooks {
    pub(crate) fn success(&self, hash: &str) {
        if let Some(hook) = &self.on_success {
            hook(hash);
        }
    }

    pub(crate) fn error(&self, hash: &str, error: &PayloadError) {
        if let Some(hook) = &self.on_error {
            hook(hash, error);
        }
    }
}

impl std::fmt::Debug for CacheHooks {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheHooks")
            .field("on_success", &self.on_success.is_some())
            .field("on_error", &self.on_error.is_some())
            .finish()
    }
}

/// Hash-keyed registry of payload entries.
pub struct PayloadCache {
    entries: RwLock<HashMap<String, Arc<dyn CachedEntry>>>,
    scheduler: Arc<dyn Scheduler>,
    environment: Arc<Environment>,
    hooks: CacheHooks,
    this: Weak<PayloadCache>,
}

impl PayloadCache {
    /// Create an empty cache.
    pub fn new(
        scheduler: Arc<dyn Scheduler>,
        environment: Arc<Environment>,
        hooks: CacheHooks,
    ) -> Arc<Self> {
        Arc::new_cyclic(|this| Self {
            entries: RwLock::new(HashMap::new()),
            scheduler,
            environment,
            hooks,
            this: this.clone(),
        })
    }

    pub(crate) fn hooks(&self) -> &CacheHooks {
        &self.hooks
    }

    /// Return the entry for `key`, creating it with `options` if absent.
    ///
    /// An existing entry merges `options` (see [`PayloadEntry::merge_options`]).
    pub fn get_or_create<T>(
        &self,
        key: &PayloadKey,
        options: PayloadOptions<T>,
    ) -> PayloadResult<Arc<PayloadEntry<T>>>
    where
        T: Send + Sync + 'static,
    {
        let hash = key.hash();
        let existing = self.entries.read().get(&hash).cloned();
        if let Some(existing) = existing {
            let entry = downcast::<T>(existing, &hash)?;
            entry.merge_options(options);
            return Ok(entry);
        }

        let mut entries = self.entries.write();
        let raced = entries.get(&hash).cloned();
        if let Some(existing) = raced {
            drop(entries);
            let entry = downcast::<T>(existing, &hash)?;
            entry.merge_options(options);
            return Ok(entry);
        }

        let entry = PayloadEntry::new(
            key.clone(),
            options,
            Arc::clone(&self.scheduler),
            Arc::clone(&self.environment),
            self.this.clone(),
        );
        entries.insert(hash.clone(), entry.clone() as Arc<dyn CachedEntry>);
        CACHE_ENTRIES.set(entries.len() as f64);
        debug!(payload = %hash, entries = entries.len(), "Entry registered");
        Ok(entry)
    }

    /// Typed lookup.
    pub fn get<T>(&self, key: &PayloadKey) -> PayloadResult<Option<Arc<PayloadEntry<T>>>>
    where
        T: Send + Sync + 'static,
    {
        let hash = key.hash();
        let existing = self.entries.read().get(&hash).cloned();
        existing.map(|entry| downcast::<T>(entry, &hash)).transpose()
    }

    /// Type-erased lookup by hash.
    pub fn get_by_hash(&self, hash: &str) -> Option<Arc<dyn CachedEntry>> {
        self.entries.read().get(hash).cloned()
    }

    /// Remove an entry. Without `force`, an entry with subscribers is kept.
    ///
    /// Returns true if the entry was removed.
    pub fn remove(&self, hash: &str, force: bool) -> bool {
        let removed = {
            let mut entries = self.entries.write();
            let removable = entries
                .get(hash)
                .is_some_and(|entry| force || entry.observer_count() == 0);
            if removable {
                let removed = entries.remove(hash);
                CACHE_ENTRIES.set(entries.len() as f64);
                removed
            } else {
                None
            }
        };
        match removed {
            Some(entry) => {
                entry.teardown();
                ENTRIES_EVICTED.inc();
                info!(payload = %hash, force, "Entry removed");
                true
            }
            None => false,
        }
    }

    /// Evict `hash` if it is unobserved and its retention window elapsed.
    pub(crate) fn evict_if_idle(&self, hash: &str) -> bool {
        let now = self.scheduler.now();
        let removed = {
            let mut entries = self.entries.write();
            let idle = entries
                .get(hash)
                .is_some_and(|entry| entry.is_evictable(now));
            if idle {
                let removed = entries.remove(hash);
                CACHE_ENTRIES.set(entries.len() as f64);
                removed
            } else {
                None
            }
        };
        match removed {
            Some(entry) => {
                entry.teardown();
                ENTRIES_EVICTED.inc();
                info!(payload = %hash, "Entry evicted");
                true
            }
            None => false,
        }
    }

    /// Evict every unobserved entry whose retention window elapsed.
    /// Returns the number evicted.
    pub fn sweep(&self) -> usize {
        let now = self.scheduler.now();
        let evicted: Vec<Arc<dyn CachedEntry>> = {
            let mut entries = self.entries.write();
            let idle: Vec<String> = entries
                .iter()
                .filter(|(_, entry)| entry.is_evictable(now))
                .map(|(hash, _)| hash.clone())
                .collect();
            let evicted: Vec<_> = idle.iter().filter_map(|hash| entries.remove(hash)).collect();
            CACHE_ENTRIES.set(entries.len() as f64);
            evicted
        };

        for entry in &evicted {
            entry.teardown();
            ENTRIES_EVICTED.inc();
        }
        if !evicted.is_empty() {
            info!(evicted = evicted.len(), "Cache sweep evicted entries");
        }
        evicted.len()
    }

    /// Every entry matching `predicate`. Linear in the number of entries.
    pub fn find<F>(&self, predicate: F) -> Vec<Arc<dyn CachedEntry>>
    where
        F: Fn(&dyn CachedEntry) -> bool,
    {
        self.entries
            .read()
            .values()
            .filter(|entry| predicate(entry.as_ref()))
            .cloned()
            .collect()
    }

    /// Every entry whose key starts with `prefix`.
    pub fn find_by_prefix(&self, prefix: &PayloadKey) -> Vec<Arc<dyn CachedEntry>> {
        self.find(|entry| entry.key().starts_with(prefix))
    }

    /// All entries.
    pub fn all(&self) -> Vec<Arc<dyn CachedEntry>> {
        self.entries.read().values().cloned().collect()
    }

    /// Number of entries.
    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    /// True if the cache holds no entries.
    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    /// Remove every entry regardless of subscribers.
    pub fn clear(&self) {
        let drained: Vec<Arc<dyn CachedEntry>> = {
            let mut entries = self.entries.write();
            let drained = entries.drain().map(|(_, entry)| entry).collect();
            CACHE_ENTRIES.set(0.0);
            drained
        };
        for entry in drained {
            entry.teardown();
        }
    }

    /// Forward a focus event to every observer.
    pub fn notify_focus(&self) {
        for entry in self.all() {
            entry.notify_focus();
        }
    }

    /// Forward a reconnect event to every observer.
    pub fn notify_online(&self) {
        for entry in self.all() {
            entry.notify_online();
        }
    }
}

impl std::fmt::Debug for PayloadCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PayloadCache")
            .field("entries", &self.len())
            .field("hooks", &self.hooks)
            .finish()
    }
}

fn downcast<T>(entry: Arc<dyn CachedEntry>, hash: &str) -> PayloadResult<Arc<PayloadEntry<T>>>
where
    T: Send + Sync + 'static,
{
    entry
        .as_any()
        .downcast::<PayloadEntry<T>>()
        .map_err(|_| PayloadError::TypeMismatch {
            hash: hash.to_string(),
        })
}
