//! Alignment of the reporting range to the statistics engine's 10 second grid.

use chrono::{DateTime, Local, TimeZone, Timelike, Utc};

/// Length of one statistics window.
pub const WINDOW_SIZE_SECS: u32 = 10;
pub const WINDOW_SIZE_MILLIS: i64 = WINDOW_SIZE_SECS as i64 * 1000;

/// Half-open `[start, end)` range, in epoch millis, covering one settled window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReportWindow {
    pub start: i64,
    pub end: i64,
}

impl ReportWindow {
    /// Compute the most recently completed window for the engine's current slot.
    pub fn settled_before(current_slot: i64) -> Self {
        let offset = settle_offset_secs(second_of_minute(current_slot));
        let end = current_slot - offset * 1000;
        Self {
            start: end - WINDOW_SIZE_MILLIS,
            end,
        }
    }
}

/// Seconds elapsed since the last 10 second boundary inside the 0-49 cycle.
///
/// The cascade is kept literal for the 50-59 bucket.
pub fn settle_offset_secs(second: u32) -> i64 {
    let second = i64::from(second);
    match second {
        50.. => second - 50,
        40..=49 => second - 40,
        30..=39 => second - 30,
        20..=29 => second - 20,
        10..=19 => second - 10,
        1..=9 => second,
        _ => 0,
    }
}

/// Seconds-within-minute of an epoch millis timestamp.
pub fn second_of_minute(epoch_millis: i64) -> u32 {
    match Utc.timestamp_millis_opt(epoch_millis).single() {
        Some(ts) => ts.second(),
        None => epoch_millis.div_euclid(1000).rem_euclid(60) as u32,
    }
}

/// `yyyy-MM-dd HH:mm:ss` in local time, used in log lines.
pub fn format_slot(epoch_millis: i64) -> String {
    match Local.timestamp_millis_opt(epoch_millis).single() {
        Some(ts) => ts.format("%Y-%m-%d %H:%M:%S").to_string(),
        None => DateTime::<Utc>::from_timestamp_millis(epoch_millis)
            .map(|ts| ts.format("%Y-%m-%d %H:%M:%S").to_string())
            .unwrap_or_else(|| epoch_millis.to_string()),
    }
}
