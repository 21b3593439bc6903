use crate::{Error, Result};
use chrono::Utc;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::{
    collections::BTreeMap,
    io::BufRead,
    sync::{
        RwLock,
        atomic::{AtomicI64, Ordering},
    },
};
use tracing::debug;

/// One fixed-size statistics bucket for one resource.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct TimeWindowStat {
    /// Window start, epoch millis
    pub start_time: i64,
    pub total: i64,
    pub comp_reqs: i64,
    pub peak_concurrent_requests: i64,
    /// Requests per second, absent when the engine did not compute it
    pub rps: Option<Decimal>,
    pub block_requests: i64,
    pub errors: i64,
    /// Response times in millis
    pub avg_rt: i64,
    pub min: i64,
    pub max: i64,
}

/// Windows of one resource, ordered by start time.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceTimeWindowStat {
    pub resource_id: String,
    pub windows: Vec<TimeWindowStat>,
}

/// Read-only query interface of the in-process statistics engine.
pub trait StatsSource: Send + Sync {
    /// The engine's notion of "now", epoch millis.
    fn current_time_slot_id(&self) -> i64;

    /// Completed windows whose start lies in `[start, end)`.
    ///
    /// `resource` restricts the result to a single resource when set.
    /// Resources without windows in range are omitted; no data yields an
    /// empty vector.
    fn resource_time_window_stats(
        &self,
        resource: Option<&str>,
        start: i64,
        end: i64,
        window_secs: u32,
    ) -> Vec<ResourceTimeWindowStat>;
}

#[derive(Debug, Deserialize)]
struct WindowLine {
    resource: String,
    window: TimeWindowStat,
}

/// In-process store of completed windows, keyed by resource then start time.
#[derive(Debug, Default)]
pub struct MemoryStats {
    windows: RwLock<BTreeMap<String, BTreeMap<i64, TimeWindowStat>>>,
    // 0 means wall clock
    pinned_slot: AtomicI64,
}

impl MemoryStats {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store whose current slot is fixed, for replays and tests.
    pub fn pinned(slot: i64) -> Self {
        let stats = Self::default();
        stats.pin_slot(slot);
        stats
    }

    pub fn pin_slot(&self, slot: i64) {
        self.pinned_slot.store(slot, Ordering::Relaxed);
    }

    /// Record a completed window, replacing any window with the same start.
    pub fn record(&self, resource: impl Into<String>, window: TimeWindowStat) {
        let mut windows = self.windows.write().unwrap_or_else(|e| e.into_inner());
        windows
            .entry(resource.into())
            .or_default()
            .insert(window.start_time, window);
    }

    /// Drop every window starting before `cutoff`. Returns the number removed.
    pub fn evict_before(&self, cutoff: i64) -> usize {
        let mut windows = self.windows.write().unwrap_or_else(|e| e.into_inner());
        let mut removed = 0;
        windows.retain(|_, by_start| {
            let kept = by_start.split_off(&cutoff);
            removed += by_start.len();
            *by_start = kept;
            !by_start.is_empty()
        });
        removed
    }

    /// Seed windows from JSON lines of `{"resource": .., "window": {..}}`.
    ///
    /// Blank lines are ignored. Returns the number of windows recorded.
    pub fn load_jsonl<R: BufRead>(&self, reader: R) -> Result<usize> {
        let mut loaded = 0;
        for (idx, line) in reader.lines().enumerate() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            let entry: WindowLine = serde_json::from_str(&line).map_err(|source| {
                Error::JsonLine {
                    line: idx + 1,
                    source,
                }
            })?;
            self.record(entry.resource, entry.window);
            loaded += 1;
        }
        debug!(loaded, "seeded flow stat windows");
        Ok(loaded)
    }
}

impl StatsSource for MemoryStats {
    fn current_time_slot_id(&self) -> i64 {
        match self.pinned_slot.load(Ordering::Relaxed) {
            0 => Utc::now().timestamp() * 1000,
            slot => slot,
        }
    }

    fn resource_time_window_stats(
        &self,
        resource: Option<&str>,
        start: i64,
        end: i64,
        _window_secs: u32,
    ) -> Vec<ResourceTimeWindowStat> {
        if start >= end {
            return Vec::new();
        }
        let windows = self.windows.read().unwrap_or_else(|e| e.into_inner());
        windows
            .iter()
            .filter(|(id, _)| resource.is_none_or(|r| r == id.as_str()))
            .filter_map(|(id, by_start)| {
                let in_range: Vec<_> = by_start.range(start..end).map(|(_, w)| w.clone()).collect();
                (!in_range.is_empty()).then(|| ResourceTimeWindowStat {
                    resource_id: id.clone(),
                    windows: in_range,
                })
            })
            .collect()
    }
}
