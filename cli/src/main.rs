//! chatgrep CLI
//!
//! Searches a chat log archive from newest to oldest and streams matches to
//! stdout. Diagnostics and progress go to stderr.
//!
//! Commands:
//! - chatgrep search --channel forsen --start "2021-09-01" --regex "hello"
//! - chatgrep list --channel forsen [--user mm2pl] [--fetch]
//! - chatgrep channels
//! - chatgrep to-json | to-text | extract --ts --user --text   # stdin filters

mod convert;
mod search;

use std::io::{self, Write};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::debug;
use tracing_subscriber::EnvFilter;

use chatgrep_core::{
    clip_to_range, ArchiveClient, ArchiveConfig, AvailableLog, Filter, LogSource, Message,
    ProgressState, SearchObserver, Searcher, UserRef,
};

use crate::convert::ExtractColumns;
use crate::search::SearchArgs;

#[derive(Parser)]
#[command(name = "chatgrep")]
#[command(about = "Search chat log archives for matching messages")]
#[command(version)]
struct Cli {
    /// Log archive URL (overrides config file and CHATGREP_URL)
    #[arg(long, global = true)]
    url: Option<String>,

    /// Log more to stderr
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Search channel logs for matching messages
    Search(SearchArgs),

    /// Show which log files the archive has for a channel or user
    List {
        /// Channel to list
        #[arg(long)]
        channel: String,

        /// Only list files for this user
        #[arg(long, conflicts_with = "user_id")]
        user: Option<String>,

        /// Only list files for this user id
        #[arg(long)]
        user_id: Option<String>,

        /// Drop files that end before this time
        #[arg(long)]
        start: Option<String>,

        /// Drop files that begin after this time
        #[arg(long)]
        end: Option<String>,

        /// Print the lines of every listed file that fall inside --start/--end
        #[arg(long)]
        fetch: bool,
    },

    /// List channels logged by the archive
    Channels {
        /// Print user ids next to channel names
        #[arg(long)]
        ids: bool,
    },

    /// Convert archive lines on stdin to JSON records
    ToJson,

    /// Convert archive lines on stdin to readable chat log text
    ToText,

    /// Extract selected fields of archive lines on stdin as CSV
    Extract(ExtractColumns),
}

fn init_logging(verbose: bool) -> Result<()> {
    let level = if verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_writer(io::stderr)
        .with_env_filter(
            EnvFilter::from_default_env()
                .add_directive(format!("chatgrep={}", level).parse()?)
                .add_directive(format!("chatgrep_core={}", level).parse()?),
        )
        .init();
    Ok(())
}

fn load_config(url: Option<String>) -> Result<ArchiveConfig> {
    let mut config = ArchiveConfig::load_default().context("Failed to load configuration")?;
    if let Some(url) = url {
        config.url = url;
    }
    Ok(config)
}

/// Writes every delivered line to stdout as received.
struct RawLines<W: Write>(W);

impl<W: Write> SearchObserver for RawLines<W> {
    fn on_match(&mut self, msg: Message) {
        let _ = writeln!(self.0, "{}", msg.raw);
    }
}

/// Dump the lines of each listed file, newest file first.
async fn print_listed(
    client: &ArchiveClient,
    source: &LogSource,
    logs: &[AvailableLog],
    early: DateTime<Utc>,
    late: DateTime<Utc>,
) -> Result<()> {
    let filter = Filter::new(early, late)?;
    let searcher = Searcher::new(client, &filter);
    let cancel = CancellationToken::new();
    let mut progress = ProgressState::new();
    let mut out = RawLines(io::BufWriter::new(io::stdout().lock()));

    for log in logs {
        let run = searcher
            .fetch_log_entry(source, log, progress.found(), &mut out, &cancel)
            .await?;
        progress.absorb(&run.report.tally, &run.stats);
        run.result.with_context(|| {
            format!(
                "Failed to fetch {}-{} for {}",
                log.raw_year,
                log.raw_month,
                source.target()
            )
        })?;
    }
    out.0.flush()?;
    debug!(
        lines = progress.count_lines,
        printed = progress.found(),
        parse_errors = progress.count_parse_errors,
        "fetched listed logs"
    );
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose)?;

    match cli.command {
        Commands::Search(args) => {
            let config = load_config(cli.url)?;
            let failed = search::run(args, &config, cli.verbose).await?;
            if failed {
                std::process::exit(1);
            }
        }

        Commands::List {
            channel,
            user,
            user_id,
            start,
            end,
            fetch,
        } => {
            let config = load_config(cli.url)?;
            let client = ArchiveClient::new(&config)?;
            let source = match (user, user_id) {
                (Some(name), _) => client.user_logs(&channel, UserRef::Name(name.to_lowercase())),
                (None, Some(id)) => client.user_logs(&channel, UserRef::Id(id)),
                (None, None) => client.channel_logs(&channel),
            };

            let mut logs = source
                .list_available(&client)
                .await
                .with_context(|| format!("Failed to list logs for {}", source.target()))?;

            let early = match &start {
                Some(s) => search::parse_time(s).context("--start")?,
                None => DateTime::<Utc>::MIN_UTC,
            };
            let late = match &end {
                Some(e) => search::parse_time(e).context("--end")?,
                None => Utc::now(),
            };
            if early > late {
                anyhow::bail!("--start ({}) is after --end ({})", early, late);
            }
            if start.is_some() || end.is_some() {
                logs = clip_to_range(&logs, early, late)?;
            }

            if logs.is_empty() {
                eprintln!("No logs found for {}", source.target());
            }
            if fetch {
                print_listed(&client, &source, &logs, early, late).await?;
            } else {
                for log in logs {
                    match &log.raw_day {
                        Some(day) => println!("{}-{}-{}", log.raw_year, log.raw_month, day),
                        None => println!("{}-{}", log.raw_year, log.raw_month),
                    }
                }
            }
        }

        Commands::Channels { ids } => {
            let config = load_config(cli.url)?;
            let client = ArchiveClient::new(&config)?;
            let channels = client
                .list_channels()
                .await
                .context("Failed to fetch channel list")?;
            for channel in channels {
                if ids {
                    println!("{} {}", channel.user_id, channel.name);
                } else {
                    println!("{}", channel.name);
                }
            }
        }

        Commands::ToJson => {
            convert::to_json(io::stdin().lock(), io::stdout().lock())?;
        }

        Commands::ToText => {
            convert::to_text(io::stdin().lock(), io::stdout().lock())?;
        }

        Commands::Extract(columns) => {
            convert::extract(&columns, io::stdin().lock(), io::stdout().lock())?;
        }
    }

    Ok(())
}
