//! Match filter
//!
//! [`Filter::evaluate`] runs the predicate chain on a single message;
//! [`Filter::stream_filter`] drives it over a bucket's message stream and
//! decides when the bucket can be abandoned.
//!
//! Evaluation order (first failing check wins):
//! 1. date window
//! 2. command allow-list
//! 3. body regex (against the last argument)
//! 4. username include/exclude

use std::collections::HashSet;

use chrono::{DateTime, Utc};
use regex::Regex;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::error::{Error, Result};
use crate::message::Message;
use crate::progress::{FilterResult, Tally};

/// How the sender of a message is matched.
#[derive(Debug, Clone, Default)]
pub enum UserMatch {
    /// Every sender passes.
    #[default]
    None,
    /// Sender must match `include` (if set) and must not match `exclude` (if set).
    Regex {
        include: Option<Regex>,
        exclude: Option<Regex>,
    },
    /// Same as `Regex`, with string equality. Callers normalize case.
    Exact {
        include: Option<String>,
        exclude: Option<String>,
    },
}

impl UserMatch {
    fn passes(&self, user: &str) -> bool {
        match self {
            UserMatch::None => true,
            UserMatch::Regex { include, exclude } => {
                if include.as_ref().is_some_and(|re| !re.is_match(user)) {
                    return false;
                }
                !exclude.as_ref().is_some_and(|re| re.is_match(user))
            }
            UserMatch::Exact { include, exclude } => {
                if include.as_deref().is_some_and(|name| name != user) {
                    return false;
                }
                !exclude.as_deref().is_some_and(|name| name == user)
            }
        }
    }
}

/// Why a stream filter stopped consuming its input.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Termination {
    /// The producer closed the stream.
    Exhausted,
    /// The result quota was met before the stream ended.
    MaxCountReached,
    /// A message older than the window start was seen.
    WindowStartReached,
    /// Nobody is listening for matches anymore.
    Abandoned,
}

/// Outcome of one [`Filter::stream_filter`] pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FilterReport {
    pub tally: Tally,
    pub termination: Termination,
}

/// Immutable match predicates for one search run.
#[derive(Debug, Clone)]
pub struct Filter {
    start: DateTime<Utc>,
    end: DateTime<Utc>,
    message_types: Option<HashSet<String>>,
    message_regex: Option<Regex>,
    user_match: UserMatch,
    count: usize,
}

impl Filter {
    /// Create a filter that only checks the time window.
    ///
    /// # Errors
    /// Returns `Error::Config` if `start` is after `end`.
    pub fn new(start: DateTime<Utc>, end: DateTime<Utc>) -> Result<Self> {
        if start > end {
            return Err(Error::Config(format!(
                "start of the time window ({}) is after its end ({})",
                start.to_rfc3339(),
                end.to_rfc3339()
            )));
        }
        Ok(Self {
            start,
            end,
            message_types: None,
            message_regex: None,
            user_match: UserMatch::None,
            count: 0,
        })
    }

    /// Only accept messages whose command is in `types`.
    pub fn with_message_types<I, S>(mut self, types: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.message_types = Some(types.into_iter().map(Into::into).collect());
        self
    }

    /// Only accept messages whose body matches `regex`.
    pub fn with_message_regex(mut self, regex: Regex) -> Self {
        self.message_regex = Some(regex);
        self
    }

    pub fn with_user_match(mut self, user_match: UserMatch) -> Self {
        self.user_match = user_match;
        self
    }

    /// Stop after `count` matches. `0` means unlimited.
    pub fn with_count(mut self, count: usize) -> Self {
        self.count = count;
        self
    }

    pub fn start(&self) -> DateTime<Utc> {
        self.start
    }

    pub fn end(&self) -> DateTime<Utc> {
        self.end
    }

    pub fn count(&self) -> usize {
        self.count
    }

    /// Whether a run that has found `found` matches has met its quota.
    pub fn quota_reached(&self, found: usize) -> bool {
        self.count != 0 && found >= self.count
    }

    /// Run every check against `msg`.
    ///
    /// A message without a timestamp is treated as older than the window.
    /// The body regex sees `""` for a message without arguments.
    pub fn evaluate(&self, msg: &Message) -> FilterResult {
        match msg.timestamp {
            Some(ts) if ts > self.end => return FilterResult::Date,
            Some(ts) if ts < self.start => return FilterResult::Date,
            None => return FilterResult::Date,
            Some(_) => {}
        }

        if let Some(types) = &self.message_types {
            if !types.contains(&msg.command) {
                return FilterResult::Type;
            }
        }

        if let Some(regex) = &self.message_regex {
            if !regex.is_match(msg.body()) {
                return FilterResult::Content;
            }
        }

        if !self.user_match.passes(&msg.user) {
            return FilterResult::User;
        }

        FilterResult::Ok
    }

    /// True if `msg` is older than the window start.
    fn before_window(&self, msg: &Message) -> bool {
        msg.timestamp.map_or(true, |ts| ts < self.start)
    }

    /// Filter a bucket's messages as they arrive.
    ///
    /// Matches are forwarded to `output` in arrival order. `found_so_far` is
    /// the number of matches earlier buckets produced; together with this
    /// pass's own matches it is checked against the quota before each message.
    ///
    /// `cancel` is triggered when the rest of the bucket is not needed: the
    /// quota was met, or a message older than the window start arrived.
    /// Messages newer than the window end are counted and skipped.
    ///
    /// `output` is dropped on return, so the receiving side always sees the
    /// end of the stream.
    pub async fn stream_filter(
        &self,
        mut input: mpsc::Receiver<Message>,
        output: mpsc::Sender<Message>,
        found_so_far: usize,
        cancel: &CancellationToken,
    ) -> FilterReport {
        let mut tally = Tally::default();
        let mut termination = Termination::Exhausted;

        while let Some(msg) = input.recv().await {
            if self.quota_reached(found_so_far + tally.ok) {
                tally[FilterResult::MaxCountReached] = 1;
                termination = Termination::MaxCountReached;
                cancel.cancel();
                break;
            }

            let result = self.evaluate(&msg);
            tally.record(result);

            match result {
                FilterResult::Ok => {
                    if output.send(msg).await.is_err() {
                        termination = Termination::Abandoned;
                        cancel.cancel();
                        break;
                    }
                }
                FilterResult::Date if self.before_window(&msg) => {
                    debug!(
                        timestamp = ?msg.timestamp,
                        "message older than window start, stopping bucket"
                    );
                    termination = Termination::WindowStartReached;
                    cancel.cancel();
                    break;
                }
                _ => {}
            }
        }

        FilterReport { tally, termination }
    }
}
