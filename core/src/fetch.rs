//! Bucket fetch orchestrator
//!
//! Walks a [`LogSource`] backwards from the window end, one bucket at a time.
//! For each bucket a producer reads and parses the response body line by line
//! while the [`Filter`] consumes the parsed messages; the two meet at a
//! one-slot channel so the body is never read faster than it is filtered.
//!
//! Each bucket gets a child of the run's cancellation token. The filter
//! cancels it when the rest of the bucket is not needed, which stops the
//! producer and drops the response body.

use chrono::{DateTime, Utc};
use tokio::io::AsyncBufReadExt;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::archive::{AvailableLog, LineReader, LogSource, Transport};
use crate::error::Result;
use crate::filter::{Filter, FilterReport, Termination};
use crate::message::Message;
use crate::progress::{FetchStats, FilterResult, ProgressState, Tally};

/// Capacity of the producer → filter and filter → caller hand-offs.
pub const HANDOFF_CAPACITY: usize = 1;

/// Receives progress and matches from a search run.
pub trait SearchObserver {
    /// Called before each bucket is fetched.
    fn on_bucket(&mut self, _source: &LogSource, _cursor: DateTime<Utc>, _progress: &ProgressState) {}

    /// Called for every match, in archive order.
    fn on_match(&mut self, msg: Message);
}

impl SearchObserver for Vec<Message> {
    fn on_match(&mut self, msg: Message) {
        self.push(msg);
    }
}

/// Why a search run ended without an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    /// Every bucket overlapping the window was searched.
    WindowExhausted,
    /// The result quota was met.
    MaxCountReached,
    /// The run token was cancelled from outside.
    Cancelled,
}

/// Everything one bucket fetch produced.
#[derive(Debug)]
pub struct BucketRun {
    pub report: FilterReport,
    pub stats: FetchStats,
    pub result: Result<()>,
}

impl BucketRun {
    fn failed(error: crate::Error) -> Self {
        Self {
            report: FilterReport {
                tally: Tally::default(),
                termination: Termination::Exhausted,
            },
            stats: FetchStats::default(),
            result: Err(error),
        }
    }
}

/// Drives searches over one archive transport with one filter.
pub struct Searcher<'a, T: Transport + ?Sized> {
    transport: &'a T,
    filter: &'a Filter,
}

impl<'a, T: Transport + ?Sized> Searcher<'a, T> {
    pub fn new(transport: &'a T, filter: &'a Filter) -> Self {
        Self { transport, filter }
    }

    /// Search `source` from the window end back to the window start.
    ///
    /// `progress` is updated after every bucket, including the one that
    /// failed, so counters gathered before an error are kept.
    ///
    /// # Errors
    /// Returns `Error::Fetch` (naming the source and bucket) when a bucket
    /// cannot be opened or its body breaks off mid-stream. Matches delivered
    /// to `observer` before the failure stay delivered.
    pub async fn search<O: SearchObserver + ?Sized>(
        &self,
        source: &LogSource,
        progress: &mut ProgressState,
        observer: &mut O,
        run_cancel: &CancellationToken,
    ) -> Result<StopReason> {
        let mut cursor = self.filter.end();
        info!(
            target = %source.target(),
            start = %self.filter.start(),
            end = %self.filter.end(),
            "searching"
        );

        loop {
            if run_cancel.is_cancelled() {
                return Ok(StopReason::Cancelled);
            }
            if self.filter.quota_reached(progress.found()) {
                progress.total_results[FilterResult::MaxCountReached] = 1;
                return Ok(StopReason::MaxCountReached);
            }

            observer.on_bucket(source, cursor, progress);
            let run = self
                .fetch_bucket(source, cursor, progress.found(), observer, run_cancel)
                .await;
            progress.absorb(&run.report.tally, &run.stats);
            debug!(
                target = %source.target(),
                bucket = %cursor.format("%Y-%m-%d"),
                lines = run.stats.lines,
                matches = run.report.tally.ok,
                termination = ?run.report.termination,
                "bucket done"
            );

            if let Err(e) = run.result {
                return Err(e.in_bucket(source.target(), cursor.format("%Y-%m-%d").to_string()));
            }

            match run.report.termination {
                Termination::MaxCountReached => return Ok(StopReason::MaxCountReached),
                Termination::WindowStartReached => return Ok(StopReason::WindowExhausted),
                Termination::Abandoned => return Ok(StopReason::Cancelled),
                Termination::Exhausted => {}
            }
            if run_cancel.is_cancelled() {
                return Ok(StopReason::Cancelled);
            }

            cursor = source.next_bucket(cursor);
            let (_, bucket_end) = source.bucket_bounds(cursor);
            if bucket_end < self.filter.start() {
                return Ok(StopReason::WindowExhausted);
            }
        }
    }

    /// Fetch and filter the bucket of a listing entry.
    pub async fn fetch_log_entry<O: SearchObserver + ?Sized>(
        &self,
        source: &LogSource,
        entry: &AvailableLog,
        found_so_far: usize,
        observer: &mut O,
        run_cancel: &CancellationToken,
    ) -> Result<BucketRun> {
        let date = entry.to_date()?;
        Ok(self
            .fetch_bucket(source, date, found_so_far, observer, run_cancel)
            .await)
    }

    /// Fetch and filter the bucket containing `date`.
    ///
    /// Matches go to `observer` as they are found. The bucket's token is a
    /// child of `run_cancel` and is cancelled before returning.
    pub async fn fetch_bucket<O: SearchObserver + ?Sized>(
        &self,
        source: &LogSource,
        date: DateTime<Utc>,
        found_so_far: usize,
        observer: &mut O,
        run_cancel: &CancellationToken,
    ) -> BucketRun {
        let url = source.make_url(date);
        let bucket_cancel = run_cancel.child_token();

        let opened = tokio::select! {
            biased;
            _ = bucket_cancel.cancelled() => None,
            opened = self.transport.open(&url) => Some(opened),
        };
        let reader = match opened {
            None => {
                return BucketRun {
                    report: FilterReport {
                        tally: Tally::default(),
                        termination: Termination::Exhausted,
                    },
                    stats: FetchStats::default(),
                    result: Ok(()),
                }
            }
            Some(Err(e)) => return BucketRun::failed(e),
            Some(Ok(reader)) => reader,
        };

        let (line_tx, line_rx) = mpsc::channel(HANDOFF_CAPACITY);
        let (match_tx, mut match_rx) = mpsc::channel(HANDOFF_CAPACITY);

        let producer = produce(reader, line_tx, bucket_cancel.clone(), &url);
        let consumer = self
            .filter
            .stream_filter(line_rx, match_tx, found_so_far, &bucket_cancel);
        let deliver = async {
            while let Some(msg) = match_rx.recv().await {
                observer.on_match(msg);
            }
        };

        let ((stats, result), report, ()) = tokio::join!(producer, consumer, deliver);
        bucket_cancel.cancel();

        BucketRun {
            report,
            stats,
            result,
        }
    }
}

/// Read `reader` line by line, parse, and hand messages to `tx`.
///
/// Malformed lines (including ones that are not UTF-8) are logged, counted
/// and skipped. Stops at end of body, when `cancel` fires, or when the
/// consumer goes away; the body is dropped on return either way.
async fn produce(
    mut reader: LineReader,
    tx: mpsc::Sender<Message>,
    cancel: CancellationToken,
    url: &str,
) -> (FetchStats, Result<()>) {
    let mut stats = FetchStats::default();
    let mut buf = Vec::new();

    loop {
        buf.clear();
        let read = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            read = reader.read_until(b'\n', &mut buf) => read,
        };
        match read {
            Ok(0) => break,
            Ok(_) => {}
            Err(e) => return (stats, Err(e.into())),
        }
        stats.lines += 1;

        let line = trim_line_end(&buf);
        let msg = match std::str::from_utf8(line) {
            Ok(line) => Message::parse(line).map_err(|e| e.to_string()),
            Err(e) => Err(format!("line is not valid UTF-8: {}", e)),
        };
        let msg = match msg {
            Ok(msg) => msg,
            Err(e) => {
                stats.parse_errors += 1;
                warn!(url, error = %e, "skipping malformed line");
                continue;
            }
        };
        stats.bytes += msg.raw.len();

        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            sent = tx.send(msg) => {
                if sent.is_err() {
                    break;
                }
            }
        }
    }

    (stats, Ok(()))
}

fn trim_line_end(line: &[u8]) -> &[u8] {
    let line = line.strip_suffix(b"\n").unwrap_or(line);
    line.strip_suffix(b"\r").unwrap_or(line)
}
