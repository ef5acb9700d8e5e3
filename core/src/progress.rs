//! Result tallies and run progress

use std::collections::BTreeMap;
use std::ops::{Index, IndexMut};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Outcome of running one message through a [`crate::Filter`].
///
/// `MaxCountReached` is never produced by evaluating a message; it marks the
/// point where a stream filter stopped because the quota was met.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FilterResult {
    Ok,
    Date,
    Type,
    Content,
    User,
    MaxCountReached,
}

impl FilterResult {
    /// All outcomes, in summary order.
    pub const ALL: [FilterResult; 6] = [
        FilterResult::Ok,
        FilterResult::Date,
        FilterResult::Type,
        FilterResult::Content,
        FilterResult::User,
        FilterResult::MaxCountReached,
    ];

    /// Name used in human and JSON summaries.
    pub fn as_str(&self) -> &'static str {
        match self {
            FilterResult::Ok => "ok",
            FilterResult::Date => "date",
            FilterResult::Type => "type",
            FilterResult::Content => "content",
            FilterResult::User => "user",
            FilterResult::MaxCountReached => "limit reached",
        }
    }
}

impl std::fmt::Display for FilterResult {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Per-outcome counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tally {
    pub ok: usize,
    pub date: usize,
    #[serde(rename = "type")]
    pub wrong_type: usize,
    pub content: usize,
    pub user: usize,
    pub max_count_reached: usize,
}

impl Tally {
    /// Bump the counter for `result` by one.
    pub fn record(&mut self, result: FilterResult) {
        self[result] += 1;
    }

    /// Add every counter of `other` into `self`.
    pub fn merge(&mut self, other: &Tally) {
        for result in FilterResult::ALL {
            self[result] += other[result];
        }
    }

    /// Number of messages that went through evaluation.
    pub fn evaluated(&self) -> usize {
        self.ok + self.date + self.wrong_type + self.content + self.user
    }

    /// Iterate `(outcome, count)` pairs in summary order.
    pub fn iter(&self) -> impl Iterator<Item = (FilterResult, usize)> + '_ {
        FilterResult::ALL.into_iter().map(move |r| (r, self[r]))
    }

    /// Counters keyed by outcome name, for summaries.
    pub fn by_name(&self) -> BTreeMap<&'static str, usize> {
        self.iter().map(|(r, n)| (r.as_str(), n)).collect()
    }
}

impl Index<FilterResult> for Tally {
    type Output = usize;

    fn index(&self, result: FilterResult) -> &usize {
        match result {
            FilterResult::Ok => &self.ok,
            FilterResult::Date => &self.date,
            FilterResult::Type => &self.wrong_type,
            FilterResult::Content => &self.content,
            FilterResult::User => &self.user,
            FilterResult::MaxCountReached => &self.max_count_reached,
        }
    }
}

impl IndexMut<FilterResult> for Tally {
    fn index_mut(&mut self, result: FilterResult) -> &mut usize {
        match result {
            FilterResult::Ok => &mut self.ok,
            FilterResult::Date => &mut self.date,
            FilterResult::Type => &mut self.wrong_type,
            FilterResult::Content => &mut self.content,
            FilterResult::User => &mut self.user,
            FilterResult::MaxCountReached => &mut self.max_count_reached,
        }
    }
}

/// Throughput counters reported by one bucket fetch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FetchStats {
    pub lines: usize,
    pub bytes: usize,
    pub parse_errors: usize,
}

/// Snapshot of a search run, updated by the orchestrator after every bucket.
///
/// # Fields
/// - `total_results`: Outcome counters summed over all buckets so far.
/// - `count_lines`: Archive lines read.
/// - `count_bytes`: Bytes of successfully parsed lines.
/// - `count_parse_errors`: Lines skipped because they did not parse.
/// - `begin_time`: Wall-clock start of the run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProgressState {
    pub total_results: Tally,
    pub count_lines: usize,
    pub count_bytes: usize,
    pub count_parse_errors: usize,
    pub begin_time: DateTime<Utc>,
}

impl Default for ProgressState {
    fn default() -> Self {
        Self::new()
    }
}

impl ProgressState {
    /// Start a fresh run clock.
    pub fn new() -> Self {
        Self {
            total_results: Tally::default(),
            count_lines: 0,
            count_bytes: 0,
            count_parse_errors: 0,
            begin_time: Utc::now(),
        }
    }

    /// Matches found so far.
    pub fn found(&self) -> usize {
        self.total_results.ok
    }

    /// Fold one bucket's results into the run totals.
    pub fn absorb(&mut self, tally: &Tally, stats: &FetchStats) {
        self.total_results.merge(tally);
        self.count_lines += stats.lines;
        self.count_bytes += stats.bytes;
        self.count_parse_errors += stats.parse_errors;
    }

    /// Seconds since the run started, at least one.
    pub fn elapsed_secs(&self) -> i64 {
        (Utc::now() - self.begin_time).num_seconds().max(1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tally_index_and_merge() {
        let mut a = Tally::default();
        a.record(FilterResult::Ok);
        a.record(FilterResult::Ok);
        a.record(FilterResult::Content);

        let mut b = Tally::default();
        b.record(FilterResult::Ok);
        b[FilterResult::MaxCountReached] = 1;

        a.merge(&b);
        assert_eq!(a.ok, 3);
        assert_eq!(a[FilterResult::Content], 1);
        assert_eq!(a.max_count_reached, 1);
        assert_eq!(a.evaluated(), 4);
    }

    #[test]
    fn test_tally_names() {
        let mut t = Tally::default();
        t.record(FilterResult::Type);
        let names = t.by_name();
        assert_eq!(names["type"], 1);
        assert_eq!(names["limit reached"], 0);
        assert_eq!(names.len(), 6);
    }

    #[test]
    fn test_progress_absorb() {
        let mut progress = ProgressState::new();
        let mut tally = Tally::default();
        tally.record(FilterResult::Ok);
        progress.absorb(
            &tally,
            &FetchStats {
                lines: 10,
                bytes: 400,
                parse_errors: 1,
            },
        );
        progress.absorb(&tally, &FetchStats::default());
        assert_eq!(progress.found(), 2);
        assert_eq!(progress.count_lines, 10);
        assert_eq!(progress.count_bytes, 400);
        assert_eq!(progress.count_parse_errors, 1);
        assert!(progress.elapsed_secs() >= 1);
    }

    #[test]
    fn test_progress_serializes() {
        let progress = ProgressState::new();
        let json = serde_json::to_value(&progress).unwrap();
        assert_eq!(json["total_results"]["ok"], 0);
        assert_eq!(json["total_results"]["type"], 0);
        assert!(json["begin_time"].is_string());
    }
}
