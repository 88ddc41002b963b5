//! Named event counters for cache, compile and admission activity.

use std::collections::BTreeMap;
use std::sync::Mutex;

use serde::Serialize;

pub const CACHE_HIT: &str = "cache.hit";
pub const CACHE_MISS: &str = "cache.miss";
pub const COMPILE: &str = "compile";
pub const FORK: &str = "fork";
pub const LOAD: &str = "load";
pub const EVICT: &str = "evict";
pub const TRIM: &str = "trim";
pub const FAST_PATH: &str = "pipeline.fast_path";

#[derive(Default)]
pub struct Profiler {
    events: Mutex<BTreeMap<&'static str, u64>>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ProfileSnapshot {
    pub events: BTreeMap<String, u64>,
}

impl Profiler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cache_event(&self, name: &'static str) {
        // Counters are advisory; a poisoned lock just drops the sample.
        if let Ok(mut events) = self.events.lock() {
            *events.entry(name).or_insert(0) += 1;
        }
    }

    pub fn count(&self, name: &str) -> u64 {
        self.events
            .lock()
            .ok()
            .and_then(|events| events.get(name).copied())
            .unwrap_or(0)
    }

    pub fn snapshot(&self) -> ProfileSnapshot {
        let events = self
            .events
            .lock()
            .map(|events| {
                events
                    .iter()
                    .map(|(name, count)| (name.to_string(), *count))
                    .collect()
            })
            .unwrap_or_default();
        ProfileSnapshot { events }
    }
}

impl ProfileSnapshot {
    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counts_accumulate_per_name() {
        let profiler = Profiler::new();
        profiler.cache_event(CACHE_MISS);
        profiler.cache_event(CACHE_HIT);
        profiler.cache_event(CACHE_HIT);
        assert_eq!(profiler.count(CACHE_HIT), 2);
        assert_eq!(profiler.count(EVICT), 0);
        let json = profiler.snapshot().to_json().unwrap();
        assert!(json.contains("\"cache.hit\": 2"));
    }
}
