//! chatgrep core - streaming search over chat log archives
//!
//! This crate provides:
//! - The archive line parser and serializer (`message`)
//! - The match filter and its streaming driver (`filter`)
//! - Outcome tallies and run progress (`progress`)
//! - The archive HTTP client and bucket addressing (`archive`)
//! - The backward bucket walk that ties them together (`fetch`)

pub mod archive;
pub mod config;
pub mod error;
pub mod fetch;
pub mod filter;
pub mod message;
pub mod progress;

pub use archive::{
    clip_to_range, ArchiveClient, AvailableLog, BucketDate, BucketKind, Channel, LineReader,
    LogSource, LogsList, Transport, UserRef,
};
pub use config::ArchiveConfig;
pub use error::{Error, ParseError, Result};
pub use fetch::{BucketRun, SearchObserver, Searcher, StopReason};
pub use filter::{Filter, FilterReport, Termination, UserMatch};
pub use message::Message;
pub use progress::{FetchStats, FilterResult, ProgressState, Tally};

/// Re-export commonly used items
pub mod prelude {
    pub use crate::archive::{ArchiveClient, LogSource, Transport, UserRef};
    pub use crate::error::{Error, Result};
    pub use crate::fetch::{SearchObserver, Searcher, StopReason};
    pub use crate::filter::{Filter, UserMatch};
    pub use crate::message::Message;
    pub use crate::progress::{FilterResult, ProgressState};
}
