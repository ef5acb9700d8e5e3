//! Stdin filters over raw archive lines: JSON, readable text and CSV.

use std::io::{BufRead, Write};

use anyhow::{Context, Result};
use clap::Args;
use tracing::warn;

use chatgrep_core::Message;

fn parse_line(line: &str, number: usize) -> Result<Message> {
    Message::parse(line).with_context(|| format!("line {}: failed to parse message", number))
}

/// One JSON record per input line.
pub fn to_json(input: impl BufRead, mut output: impl Write) -> Result<()> {
    for (i, line) in input.lines().enumerate() {
        let line = line?;
        if line.is_empty() {
            continue;
        }
        let msg = parse_line(&line, i + 1)?;
        serde_json::to_writer(&mut output, &msg)?;
        writeln!(output)?;
    }
    output.flush()?;
    Ok(())
}

/// Human-readable chat log text.
pub fn to_text(input: impl BufRead, mut output: impl Write) -> Result<()> {
    for (i, line) in input.lines().enumerate() {
        let line = line?;
        if line.is_empty() {
            continue;
        }
        let msg = parse_line(&line, i + 1)?;
        if let Some(text) = format_text(&msg) {
            writeln!(output, "{}", text)?;
        }
    }
    output.flush()?;
    Ok(())
}

/// Render a message the way chat log viewers show it.
///
/// Only chat messages, notices and chat clears have a text form.
pub fn format_text(msg: &Message) -> Option<String> {
    let ts = msg
        .timestamp
        .map(|ts| ts.format("%Y-%m-%d %H:%M:%S").to_string())
        .unwrap_or_else(|| "-".to_string());
    let channel = msg.channel().unwrap_or("");
    let head = format!("[{}] {}", ts, channel);

    let line = match msg.command.as_str() {
        "PRIVMSG" => format!("{} {}: {}", head, msg.user, msg.body()),
        "NOTICE" => format!("{} NOTICE {}", head, msg.body()),
        "CLEARCHAT" => match msg.args.get(1) {
            None => format!("{} Chat has been cleared", head),
            Some(target) => match msg.tag("ban-duration").filter(|d| !d.is_empty()) {
                Some(duration) => {
                    format!("{} {} was timed out for {} seconds", head, target, duration)
                }
                None => format!("{} {} was permanently banned", head, target),
            },
        },
        _ => return None,
    };
    Some(line)
}

/// Columns to pull out of each message.
#[derive(Args, Debug, Clone, Default)]
pub struct ExtractColumns {
    /// Message timestamp (RFC 3339)
    #[arg(long)]
    pub ts: bool,

    /// Message command
    #[arg(long)]
    pub action: bool,

    /// Sender login
    #[arg(long)]
    pub user: bool,

    /// Chat message text
    #[arg(long)]
    pub text: bool,

    /// Chat message channel
    #[arg(long)]
    pub channel: bool,

    /// Tag values, comma separated
    #[arg(long, value_delimiter = ',')]
    pub tags: Vec<String>,

    /// Keep rows where every selected column is empty
    #[arg(long)]
    pub keep_empty: bool,
}

impl ExtractColumns {
    /// The row for `msg`, or `None` if it carries nothing worth keeping.
    ///
    /// Text and channel columns are only filled for chat messages.
    pub fn row(&self, msg: &Message) -> Option<Vec<String>> {
        let mut row = Vec::new();
        let mut meaningful = false;
        let is_chat = msg.command == "PRIVMSG";

        if self.ts {
            row.push(msg.timestamp.map(|ts| ts.to_rfc3339()).unwrap_or_default());
            meaningful |= msg.timestamp.is_some();
        }
        if self.action {
            row.push(msg.command.clone());
            meaningful = true;
        }
        if self.user {
            row.push(msg.user.clone());
            meaningful |= !msg.user.is_empty();
        }
        if self.text {
            row.push(if is_chat { msg.body().to_string() } else { String::new() });
            meaningful |= is_chat;
        }
        if self.channel {
            let channel = msg.channel().filter(|_| is_chat).unwrap_or("");
            row.push(channel.to_string());
            meaningful |= is_chat;
        }
        for tag in &self.tags {
            let value = msg.tag(tag).unwrap_or("");
            meaningful |= !value.is_empty();
            row.push(value.to_string());
        }

        (meaningful || self.keep_empty).then_some(row)
    }
}

/// CSV rows of the selected columns. Malformed lines are skipped.
pub fn extract(columns: &ExtractColumns, input: impl BufRead, output: impl Write) -> Result<()> {
    let mut writer = csv::WriterBuilder::new()
        .flexible(false)
        .from_writer(output);

    for (i, line) in input.lines().enumerate() {
        let line = line?;
        if line.is_empty() {
            continue;
        }
        let msg = match Message::parse(&line) {
            Ok(msg) => msg,
            Err(e) => {
                warn!(line = i + 1, error = %e, "skipping malformed line");
                continue;
            }
        };
        if let Some(row) = columns.row(&msg) {
            writer.write_record(&row)?;
        }
    }
    writer.flush()?;
    Ok(())
}
