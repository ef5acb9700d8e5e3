//! `chatgrep search`: flag handling, output and progress reporting.

use std::collections::BTreeMap;
use std::io::{self, Write};

use anyhow::{bail, Context, Result};
use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use clap::{Args, ValueEnum};
use regex::Regex;
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use chatgrep_core::{
    ArchiveClient, ArchiveConfig, Filter, LogSource, Message, ProgressState, SearchObserver,
    Searcher, StopReason, UserMatch, UserRef,
};

const PROGRESS_BAR_WIDTH: usize = 50;

#[derive(Args, Debug)]
pub struct SearchArgs {
    /// Channels to search, comma separated
    #[arg(long, value_delimiter = ',', required_unless_present = "recursive")]
    pub channel: Vec<String>,

    /// Search every channel the archive logs
    #[arg(short, long, conflicts_with = "channel")]
    pub recursive: bool,

    /// Only messages from this user
    #[arg(long)]
    pub user: Option<String>,

    /// Skip messages from this user
    #[arg(long)]
    pub notuser: Option<String>,

    /// Treat --user and --notuser as regexes
    #[arg(long)]
    pub uregex: bool,

    /// Only messages with these commands, comma separated
    #[arg(long, value_delimiter = ',')]
    pub msg_types: Vec<String>,

    /// Only chat messages (same as --msg-types PRIVMSG)
    #[arg(long, hide = true)]
    pub msg_only: bool,

    /// Regex the message text must match
    #[arg(long)]
    pub regex: Option<String>,

    /// Oldest time to search ("2021-09-01", "2021-09-01 12:00:00", RFC 3339)
    #[arg(long)]
    pub start: String,

    /// Newest time to search (default: now)
    #[arg(long)]
    pub end: Option<String>,

    /// Stop after this many matches, 0 for unlimited
    #[arg(long, default_value = "0")]
    pub max: usize,

    /// Emit JSON progress events on stderr
    #[arg(long)]
    pub progress_json: bool,

    /// How matches are printed
    #[arg(long, value_enum, default_value = "raw")]
    pub format: OutputFormat,
}

#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputFormat {
    /// The archive line as received
    Raw,
    /// The line re-serialized with sorted tags
    Irc,
    /// One JSON record per match
    Json,
}

/// Parse a user-supplied time. Times without an offset are UTC.
pub fn parse_time(input: &str) -> Result<DateTime<Utc>> {
    let input = input.trim();
    if let Ok(naive) = NaiveDateTime::parse_from_str(input, "%Y-%m-%d %H:%M:%S") {
        return Ok(naive.and_utc());
    }
    if let Ok(ts) = DateTime::parse_from_str(input, "%Y-%m-%d %H:%M:%S%:z") {
        return Ok(ts.with_timezone(&Utc));
    }
    if let Ok(ts) = DateTime::parse_from_rfc3339(input) {
        return Ok(ts.with_timezone(&Utc));
    }
    if let Ok(day) = NaiveDate::parse_from_str(input, "%Y-%m-%d") {
        if let Some(midnight) = day.and_hms_opt(0, 0, 0) {
            return Ok(midnight.and_utc());
        }
    }
    bail!("invalid time: {:?}", input)
}

fn compile(pattern: Option<&str>, what: &str) -> Result<Option<Regex>> {
    match pattern.filter(|p| !p.is_empty()) {
        Some(p) => Ok(Some(
            Regex::new(p).with_context(|| format!("Invalid {} regex", what))?,
        )),
        None => Ok(None),
    }
}

/// Username matching for the given flags. Exact names are lower-cased.
pub fn user_match(user: Option<&str>, notuser: Option<&str>, regex: bool) -> Result<UserMatch> {
    let user = user.filter(|u| !u.is_empty());
    let notuser = notuser.filter(|u| !u.is_empty());
    if regex {
        return Ok(UserMatch::Regex {
            include: compile(user, "username")?,
            exclude: compile(notuser, "negative username")?,
        });
    }
    if user.is_none() && notuser.is_none() {
        return Ok(UserMatch::None);
    }
    Ok(UserMatch::Exact {
        include: user.map(str::to_lowercase),
        exclude: notuser.map(str::to_lowercase),
    })
}

impl SearchArgs {
    fn window(&self) -> Result<(DateTime<Utc>, DateTime<Utc>)> {
        let start = parse_time(&self.start).context("--start")?;
        let end = match &self.end {
            Some(end) => parse_time(end).context("--end")?,
            None => Utc::now(),
        };
        Ok((start, end))
    }

    fn filter(&self) -> Result<Filter> {
        let (start, end) = self.window()?;
        let mut filter = Filter::new(start, end)?
            .with_user_match(user_match(
                self.user.as_deref(),
                self.notuser.as_deref(),
                self.uregex,
            )?)
            .with_count(self.max);

        if !self.msg_types.is_empty() {
            filter = filter.with_message_types(self.msg_types.iter().map(|t| t.to_uppercase()));
        } else if self.msg_only {
            filter = filter.with_message_types(["PRIVMSG"]);
        }
        if let Some(regex) = compile(self.regex.as_deref(), "message")? {
            filter = filter.with_message_regex(regex);
        }
        Ok(filter)
    }

    fn source(&self, client: &ArchiveClient, channel: &str) -> LogSource {
        match self.user.as_deref().filter(|u| !u.is_empty()) {
            Some(user) if !self.uregex => {
                client.user_logs(channel, UserRef::Name(user.to_lowercase()))
            }
            _ => client.channel_logs(channel),
        }
    }
}

/// Progress lines written to stderr in `--progress-json` mode.
#[derive(Serialize)]
#[serde(tag = "type", rename_all = "camelCase")]
enum ProgressEvent<'a> {
    NextChannel {
        found: usize,
        channel: &'a str,
        current_channel_num: usize,
        count_channels: usize,
        progress: &'a ProgressState,
    },
    NextStep {
        found: usize,
        channel: &'a str,
        next_date: String,
        total_steps: f64,
        left_steps: f64,
        progress: &'a ProgressState,
    },
    FetchError {
        error: String,
        network: bool,
        progress: &'a ProgressState,
    },
    SummaryFinished {
        results: BTreeMap<&'static str, usize>,
        progress: &'a ProgressState,
    },
}

fn emit(event: &ProgressEvent<'_>) {
    let mut stderr = io::stderr().lock();
    if serde_json::to_writer(&mut stderr, event).is_ok() {
        let _ = writeln!(stderr);
    }
}

/// `[=====>     ] 50.00%`
pub fn progress_bar(total_steps: f64, steps_left: f64) -> String {
    let done = if total_steps <= 0.0 {
        0.0
    } else {
        (1.0 - steps_left / total_steps).clamp(0.0, 1.0)
    };
    let filled = (PROGRESS_BAR_WIDTH as f64 * done).floor() as usize;
    let empty = (PROGRESS_BAR_WIDTH as f64 * (1.0 - done)).ceil() as usize;
    format!(
        "[{}>{}] {:.2}%",
        "=".repeat(filled),
        " ".repeat(empty),
        done * 100.0
    )
}

/// Whole bucket-sized steps between `start` and `cursor`.
fn steps(source: &LogSource, start: DateTime<Utc>, cursor: DateTime<Utc>) -> f64 {
    let step = source.approximate_offset().as_secs().max(1) as f64;
    ((cursor - start).num_seconds().max(0) as f64 / step).floor()
}

/// Prints matches to stdout and progress to stderr.
struct Reporter<W: Write> {
    out: W,
    format: OutputFormat,
    verbose: bool,
    progress_json: bool,
    start: DateTime<Utc>,
    end: DateTime<Utc>,
    cancel: CancellationToken,
    write_error: Option<io::Error>,
}

impl<W: Write> Reporter<W> {
    fn write_match(&mut self, msg: &Message) -> io::Result<()> {
        match self.format {
            OutputFormat::Raw => writeln!(self.out, "{}", msg.raw),
            OutputFormat::Irc => writeln!(self.out, "{}", msg.serialize().trim_end()),
            OutputFormat::Json => {
                serde_json::to_writer(&mut self.out, msg)?;
                writeln!(self.out)
            }
        }
    }
}

impl<W: Write> SearchObserver for Reporter<W> {
    fn on_bucket(&mut self, source: &LogSource, cursor: DateTime<Utc>, progress: &ProgressState) {
        let total_steps = steps(source, self.start, self.end);
        let left_steps = steps(source, self.start, cursor);

        if self.verbose {
            let elapsed = progress.elapsed_secs().max(1) as f64;
            let megabytes = progress.count_bytes as f64 / 1_000_000.0;
            eprintln!(
                "Found {} matching messages... Downloading {} at {} {}. {:.0}/s ({:.2} MB/s before compression). \
                 Processed {:.2} MB ({} lines and counting)",
                progress.found(),
                source.target(),
                cursor.format("%Y-%m-%d"),
                progress_bar(total_steps, left_steps),
                progress.count_lines as f64 / elapsed,
                megabytes / elapsed,
                megabytes,
                progress.count_lines,
            );
        }
        if self.progress_json {
            emit(&ProgressEvent::NextStep {
                found: progress.found(),
                channel: source.channel_name(),
                next_date: cursor.to_rfc3339(),
                total_steps,
                left_steps,
                progress,
            });
        }
    }

    fn on_match(&mut self, msg: Message) {
        if self.write_error.is_some() {
            return;
        }
        if let Err(e) = self.write_match(&msg) {
            debug!(error = %e, "stdout closed, stopping search");
            self.write_error = Some(e);
            self.cancel.cancel();
        }
    }
}

async fn channel_list(args: &SearchArgs, client: &ArchiveClient) -> Result<Vec<String>> {
    if !args.recursive {
        return Ok(args
            .channel
            .iter()
            .map(|c| c.trim().to_string())
            .filter(|c| !c.is_empty())
            .collect());
    }
    let channels = client
        .list_channels()
        .await
        .context("Failed to fetch channel list from the archive")?;
    Ok(channels.into_iter().map(|c| c.name).collect())
}

/// Run a search. Returns whether any channel failed to fetch.
pub async fn run(args: SearchArgs, config: &ArchiveConfig, verbose: bool) -> Result<bool> {
    let filter = args.filter()?;
    let client = ArchiveClient::new(config)?;
    let channels = channel_list(&args, &client).await?;
    if channels.is_empty() {
        bail!("no channels to search");
    }

    let cancel = CancellationToken::new();
    let on_interrupt = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("interrupted, stopping search");
            on_interrupt.cancel();
        }
    });

    let mut reporter = Reporter {
        out: io::BufWriter::new(io::stdout().lock()),
        format: args.format,
        verbose,
        progress_json: args.progress_json,
        start: filter.start(),
        end: filter.end(),
        cancel: cancel.clone(),
        write_error: None,
    };
    let mut progress = ProgressState::new();
    let searcher = Searcher::new(&client, &filter);
    let mut failed = false;

    for (index, channel) in channels.iter().enumerate() {
        if verbose {
            eprintln!("Now scanning #{} {}/{}", channel, index + 1, channels.len());
        }
        if args.progress_json {
            emit(&ProgressEvent::NextChannel {
                found: progress.found(),
                channel,
                current_channel_num: index,
                count_channels: channels.len(),
                progress: &progress,
            });
        }

        let source = args.source(&client, channel);
        let outcome = searcher
            .search(&source, &mut progress, &mut reporter, &cancel)
            .await;
        reporter.out.flush().ok();

        match outcome {
            Ok(StopReason::WindowExhausted) => {}
            Ok(StopReason::MaxCountReached) => break,
            Ok(StopReason::Cancelled) => break,
            Err(e) => {
                failed = true;
                if args.progress_json {
                    emit(&ProgressEvent::FetchError {
                        error: e.to_string(),
                        network: e.is_network(),
                        progress: &progress,
                    });
                } else {
                    eprintln!("Error while fetching logs: {}", e);
                    if e.is_network() {
                        eprintln!("Is the archive reachable at {}? Try --url", config.url);
                    }
                }
            }
        }
    }

    if verbose {
        eprintln!("Summary:");
        for (result, count) in progress.total_results.iter() {
            eprintln!(" - {} => {}", result, count);
        }
    }
    if args.progress_json {
        emit(&ProgressEvent::SummaryFinished {
            results: progress.total_results.by_name(),
            progress: &progress,
        });
    }

    if let Some(e) = reporter.write_error {
        if e.kind() != io::ErrorKind::BrokenPipe {
            return Err(e).context("Failed to write results");
        }
    }
    Ok(failed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_parse_time_formats() {
        let expected = Utc.with_ymd_and_hms(2021, 9, 19, 13, 42, 15).unwrap();
        assert_eq!(parse_time("2021-09-19 13:42:15").unwrap(), expected);
        assert_eq!(parse_time("2021-09-19 15:42:15+02:00").unwrap(), expected);
        assert_eq!(parse_time("2021-09-19T13:42:15Z").unwrap(), expected);
        assert_eq!(
            parse_time("2021-09-19").unwrap(),
            Utc.with_ymd_and_hms(2021, 9, 19, 0, 0, 0).unwrap()
        );
        assert!(parse_time("yesterday").is_err());
    }

    #[test]
    fn test_progress_bar() {
        let half = progress_bar(10.0, 5.0);
        assert_eq!(half, format!("[{}>{}] 50.00%", "=".repeat(25), " ".repeat(25)));
        assert!(progress_bar(0.0, 0.0).ends_with("0.00%"));
        assert!(progress_bar(10.0, 0.0).ends_with("100.00%"));
    }

    #[test]
    fn test_user_match_modes() {
        assert!(matches!(user_match(None, None, false).unwrap(), UserMatch::None));
        match user_match(Some("Mm2PL"), None, false).unwrap() {
            UserMatch::Exact { include, exclude } => {
                assert_eq!(include.as_deref(), Some("mm2pl"));
                assert_eq!(exclude, None);
            }
            other => panic!("unexpected {:?}", other),
        }
        match user_match(Some("^mm"), Some(""), true).unwrap() {
            UserMatch::Regex { include, exclude } => {
                assert!(include.unwrap().is_match("mm2pl"));
                assert!(exclude.is_none());
            }
            other => panic!("unexpected {:?}", other),
        }
        assert!(user_match(Some("("), None, true).is_err());
    }

    fn args(extra: &[&str]) -> SearchArgs {
        use clap::Parser;

        #[derive(Parser)]
        struct Wrapper {
            #[command(flatten)]
            search: SearchArgs,
        }

        let mut argv = vec!["chatgrep", "--start", "2021-09-01"];
        argv.extend_from_slice(extra);
        Wrapper::try_parse_from(argv).unwrap().search
    }

    #[test]
    fn test_channel_or_recursive_required() {
        use clap::Parser;

        #[derive(Parser, Debug)]
        struct Wrapper {
            #[command(flatten)]
            search: SearchArgs,
        }

        assert!(Wrapper::try_parse_from(["chatgrep", "--start", "2021-09-01"]).is_err());
        assert!(Wrapper::try_parse_from([
            "chatgrep", "--start", "2021-09-01", "--channel", "a", "-r"
        ])
        .is_err());
        assert_eq!(args(&["--channel", "a,b"]).channel, vec!["a", "b"]);
        assert!(args(&["-r"]).recursive);
    }

    #[test]
    fn test_source_selection() {
        let client = ArchiveClient::new(&ArchiveConfig::default()).unwrap();

        let by_user = args(&["--channel", "c", "--user", "MM2PL"]);
        assert_eq!(by_user.source(&client, "c").target(), "#c/mm2pl");

        let by_regex = args(&["--channel", "c", "--user", "^mm", "--uregex"]);
        assert_eq!(by_regex.source(&client, "c").target(), "#c");
    }

    #[test]
    fn test_filter_from_flags() {
        let filter = args(&["--channel", "c", "--end", "2021-09-02", "--max", "5"])
            .filter()
            .unwrap();
        assert_eq!(filter.count(), 5);
        assert_eq!(filter.end(), Utc.with_ymd_and_hms(2021, 9, 2, 0, 0, 0).unwrap());

        let inverted = args(&["--channel", "c", "--end", "2021-08-01"]).filter();
        assert!(inverted.is_err());

        let bad_regex = args(&["--channel", "c", "--regex", "("]).filter();
        assert!(bad_regex.is_err());
    }

    #[test]
    fn test_reporter_formats() {
        let msg = Message::parse("@b=2;a=1 :u!u@x PRIVMSG #c :hi").unwrap();
        let mut reporter = Reporter {
            out: Vec::new(),
            format: OutputFormat::Irc,
            verbose: false,
            progress_json: false,
            start: Utc::now(),
            end: Utc::now(),
            cancel: CancellationToken::new(),
            write_error: None,
        };
        reporter.on_match(msg.clone());
        reporter.format = OutputFormat::Raw;
        reporter.on_match(msg);
        let text = String::from_utf8(reporter.out).unwrap();
        let lines: Vec<_> = text.lines().collect();
        assert_eq!(lines[0], "@a=1;b=2 :u!u@x PRIVMSG #c :hi");
        assert_eq!(lines[1], "@b=2;a=1 :u!u@x PRIVMSG #c :hi");
    }

    #[test]
    fn test_fetch_error_event_marks_network_errors() {
        let progress = ProgressState::new();
        let err = chatgrep_core::Error::Io(io::Error::new(io::ErrorKind::ConnectionReset, "reset"))
            .in_bucket("#c", "2021-09-19");
        let event = ProgressEvent::FetchError {
            error: err.to_string(),
            network: err.is_network(),
            progress: &progress,
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "fetchError");
        assert_eq!(json["network"], true);
        assert!(json["error"].as_str().unwrap().contains("#c"));
    }

    #[test]
    fn test_progress_event_shape() {
        let progress = ProgressState::new();
        let event = ProgressEvent::NextChannel {
            found: 3,
            channel: "pajlada",
            current_channel_num: 0,
            count_channels: 2,
            progress: &progress,
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "nextChannel");
        assert_eq!(json["current_channel_num"], 0);
        assert_eq!(json["count_channels"], 2);
        assert!(json["progress"].is_object());
    }
}
