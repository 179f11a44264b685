//! Process-wide statistics registry.
//!
//! Components that want observability create a [Stats] node, register it
//! with [GlobalStats], and bump named counters. The registry holds weak
//! references: a node disappears from subsequent dumps when its owner
//! drops it, and an empty node (no counters anywhere in its subtree) is
//! omitted from the dump entirely.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, OnceLock, Weak};

/// One named statistics node: counters plus child nodes.
#[derive(Debug)]
pub struct Stats {
    name: String,
    inner: Mutex<StatsInner>,
}

#[derive(Debug, Default)]
struct StatsInner {
    counters: BTreeMap<String, u64>,
    children: Vec<Arc<Stats>>,
}

impl Stats {
    pub fn new<S: Into<String>>(name: S) -> Arc<Self> {
        Arc::new(Stats {
            name: name.into(),
            inner: Mutex::new(StatsInner::default()),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn add_counter(&self, name: &str, delta: u64) {
        let mut inner = self.inner.lock().unwrap();
        *inner.counters.entry(name.to_owned()).or_insert(0) += delta;
    }

    pub fn counter(&self, name: &str) -> u64 {
        let inner = self.inner.lock().unwrap();
        inner.counters.get(name).copied().unwrap_or(0)
    }

    pub fn create_child<S: Into<String>>(&self, name: S) -> Arc<Stats> {
        let child = Stats::new(name);
        let mut inner = self.inner.lock().unwrap();
        inner.children.push(Arc::clone(&child));
        child
    }

    /// Drops all counters and children.
    pub fn reset(&self) {
        let mut inner = self.inner.lock().unwrap();
        *inner = StatsInner::default();
    }

    fn is_empty(&self) -> bool {
        let inner = self.inner.lock().unwrap();
        inner.counters.is_empty()
            && inner.children.iter().all(|c| c.is_empty())
    }

    fn to_json(&self) -> serde_json::Value {
        let inner = self.inner.lock().unwrap();
        let children = inner
            .children
            .iter()
            .filter(|c| !c.is_empty())
            .map(|c| c.to_json())
            .collect::<Vec<_>>();
        serde_json::json!({
            "name": &self.name,
            "counters": &inner.counters,
            "children": children,
        })
    }
}

/// The process-lifetime registry of [Stats] nodes.
#[derive(Debug, Default)]
pub struct GlobalStats {
    registered: Mutex<Vec<Weak<Stats>>>,
}

impl GlobalStats {
    pub fn register(&self, stats: &Arc<Stats>) {
        let mut registered = self.registered.lock().unwrap();
        registered.push(Arc::downgrade(stats));
    }

    /// Renders every registered, live, non-empty node to a JSON array
    /// string. Dead weak references are pruned as a side effect.
    pub fn dump(&self) -> String {
        let mut registered = self.registered.lock().unwrap();
        registered.retain(|w| w.strong_count() > 0);
        let nodes = registered
            .iter()
            .filter_map(Weak::upgrade)
            .filter(|s| !s.is_empty())
            .map(|s| s.to_json())
            .collect::<Vec<_>>();
        serde_json::to_string_pretty(&serde_json::Value::Array(nodes))
            .unwrap_or_else(|_| "[]".to_owned())
    }

    /// Resets every live registered node.
    pub fn reset(&self) {
        let registered = self.registered.lock().unwrap();
        for stats in registered.iter().filter_map(Weak::upgrade) {
            stats.reset();
        }
    }
}

/// The registry shared by the whole process.
pub fn all_stats() -> &'static GlobalStats {
    static ALL_STATS: OnceLock<GlobalStats> = OnceLock::new();
    ALL_STATS.get_or_init(GlobalStats::default)
}
