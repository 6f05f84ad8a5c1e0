//! Shared activity registry.
//!
//! One concurrent map, keyed by activity name, written by the samplers and
//! read (and pruned) by the monitors. Entries carry a TTL so a workload
//! that stops being observed (a destroyed VM, an exited process, a removed
//! interface) ages out on its own within a minute.

use std::sync::Arc;
use std::time::Duration;

use moka::notification::RemovalCause;
use moka::sync::Cache;

use crate::activity::Activity;

/// TTL applied to every entry; samplers refresh well within this.
pub const ENTRY_TTL: Duration = Duration::from_secs(60);

/// Callback invoked when an entry leaves the registry without being
/// overwritten (TTL expiry or explicit removal).
pub type EvictionListener = Box<dyn Fn(&str, &Activity, RemovalCause) + Send + Sync + 'static>;

/// Concurrent name → [`Activity`] map with TTL expiry.
///
/// All operations are atomic per key; [`items`](Registry::items) returns a
/// point-in-time snapshot that is safe to iterate while samplers keep
/// writing. Values are cloned out, so shared per-entry state (fair-usage
/// phase, NIC rung) lives behind `Arc` inside the activity records.
pub struct Registry {
    cache: Cache<String, Activity>,
}

impl Registry {
    /// Creates a registry with the default TTL and a debug-log eviction hook.
    pub fn new() -> Self {
        Self::with_listener(
            ENTRY_TTL,
            Box::new(|name, _activity, cause| {
                tracing::debug!("registry entry '{name}' evicted ({cause:?})");
            }),
        )
    }

    /// Creates a registry with an explicit TTL and eviction listener.
    pub fn with_listener(ttl: Duration, listener: EvictionListener) -> Self {
        let cache = Cache::builder()
            .time_to_live(ttl)
            .eviction_listener(move |key: Arc<String>, value, cause| {
                listener(key.as_str(), &value, cause);
            })
            .build();
        Self { cache }
    }

    /// Inserts or refreshes an entry. Refreshing resets the TTL.
    pub fn insert(&self, name: impl Into<String>, activity: Activity) {
        self.cache.insert(name.into(), activity);
    }

    /// Returns a clone of the named entry, if present.
    pub fn get(&self, name: &str) -> Option<Activity> {
        self.cache.get(name)
    }

    /// Removes an entry (after a successful kill, or on shutdown).
    pub fn remove(&self, name: &str) {
        self.cache.invalidate(name);
    }

    /// Point-in-time snapshot of all entries.
    pub fn items(&self) -> Vec<(String, Activity)> {
        self.cache
            .iter()
            .map(|(name, activity)| (name.as_ref().clone(), activity))
            .collect()
    }

    /// Number of live entries.
    pub fn count(&self) -> u64 {
        self.cache.entry_count()
    }

    /// Drains pending expiry work so TTL evictions (and their callbacks)
    /// happen promptly. Called once per sampler tick.
    pub fn maintain(&self) {
        self.cache.run_pending_tasks();
    }
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::activity::{NicActivity, NicStats};
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn nic(name: &str) -> Activity {
        Activity::Nic(NicActivity::new(name, NicStats::default()))
    }

    #[test]
    fn insert_get_remove_roundtrip() {
        let registry = Registry::new();
        registry.insert("vxlan0", nic("vxlan0"));

        let fetched = registry.get("vxlan0").expect("entry present");
        assert_eq!(fetched.name(), "vxlan0");

        registry.remove("vxlan0");
        registry.maintain();
        assert!(registry.get("vxlan0").is_none());
    }

    #[test]
    fn items_is_a_snapshot() {
        let registry = Registry::new();
        registry.insert("vxlan0", nic("vxlan0"));
        registry.insert("vxlan1", nic("vxlan1"));
        registry.maintain();

        let mut names: Vec<_> = registry.items().into_iter().map(|(n, _)| n).collect();
        names.sort();
        assert_eq!(names, vec!["vxlan0", "vxlan1"]);
        assert_eq!(registry.count(), 2);
    }

    #[test]
    fn refresh_keeps_a_single_slot_per_name() {
        let registry = Registry::new();
        registry.insert("vxlan0", nic("vxlan0"));
        registry.insert("vxlan0", nic("vxlan0"));
        registry.maintain();
        assert_eq!(registry.count(), 1);
    }

    #[test]
    fn ttl_expiry_fires_the_eviction_hook() {
        let evictions = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&evictions);
        let registry = Registry::with_listener(
            Duration::from_millis(20),
            Box::new(move |_, _, cause| {
                if cause == RemovalCause::Expired {
                    counter.fetch_add(1, Ordering::SeqCst);
                }
            }),
        );

        registry.insert("vxlan0", nic("vxlan0"));
        std::thread::sleep(Duration::from_millis(60));
        registry.maintain();

        assert!(registry.get("vxlan0").is_none());
        assert_eq!(evictions.load(Ordering::SeqCst), 1);
    }
}
