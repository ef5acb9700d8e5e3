//! Archive line parser
//!
//! Turns one raw archive line (an IRC-style protocol message with optional
//! IRCv3 tags) into a [`Message`], and renders a [`Message`] back to its wire
//! form.
//!
//! Line shape:
//!
//! ```text
//! [@tag=value;tag2=value2 ][:prefix ]COMMAND[ arg1 arg2 ...][ :trailing body]
//! ```
//!
//! Timestamps come from the `tmi-sent-ts` tag (milliseconds since epoch),
//! falling back to the RFC3339 `time` tag.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::ParseError;

/// Tag carrying the send time in milliseconds since the Unix epoch.
pub const SENT_TS_TAG: &str = "tmi-sent-ts";

/// Tag carrying the send time as an RFC3339 string.
pub const TIME_TAG: &str = "time";

/// One parsed archive line.
///
/// # Fields
/// - `raw`: The original line, kept for output fidelity.
/// - `prefix`: Origin of the message, empty if absent.
/// - `user`: Sender login taken from `prefix` (text before `!`), empty if absent.
/// - `command`: Message verb (`PRIVMSG`, `CLEARCHAT`, ...). Never empty.
/// - `args`: Parameters; the last one is the body for body-bearing commands.
/// - `tags`: Unescaped IRCv3 tags.
/// - `timestamp`: Send time, `None` when the line carries no time tag.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub raw: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub prefix: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub user: String,
    pub command: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub args: Vec<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub tags: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<DateTime<Utc>>,
}

impl Message {
    /// Parse a single archive line.
    ///
    /// # Errors
    /// Returns a [`ParseError`] for empty input, a tag or prefix segment
    /// without a terminating space, a tag without `=`, a missing command, or
    /// a time tag that does not parse.
    pub fn parse(line: &str) -> Result<Self, ParseError> {
        if line.is_empty() {
            return Err(ParseError::EmptyInput);
        }

        let mut msg = Message {
            raw: line.to_string(),
            ..Default::default()
        };
        let mut rest = line;

        if let Some(tagged) = rest.strip_prefix('@') {
            let (tags_raw, after) = tagged
                .split_once(' ')
                .ok_or(ParseError::UnterminatedTags)?;
            for pair in tags_raw.split(';') {
                let (key, value) = pair
                    .split_once('=')
                    .ok_or_else(|| ParseError::InvalidTag(pair.to_string()))?;
                msg.tags.insert(key.to_string(), unescape_value(value));
            }
            rest = after;
        }

        if rest.starts_with(':') {
            let (prefix, after) = rest[1..]
                .split_once(' ')
                .ok_or(ParseError::UnterminatedPrefix)?;
            if let Some((user, _)) = prefix.split_once('!') {
                msg.user = user.to_string();
            }
            msg.prefix = prefix.to_string();
            rest = after;
        }

        let params = match rest.split_once(' ') {
            Some((command, params)) => {
                msg.command = command.to_string();
                params
            }
            None => {
                msg.command = rest.to_string();
                ""
            }
        };
        if msg.command.is_empty() {
            return Err(ParseError::MissingCommand);
        }
        msg.args = split_args(params);
        msg.timestamp = timestamp_from_tags(&msg.tags)?;

        Ok(msg)
    }

    /// Render the message back to a CRLF-terminated line.
    ///
    /// Tags are written sorted by key so the output is deterministic.
    pub fn serialize(&self) -> String {
        let mut out = String::with_capacity(self.raw.len() + 2);

        if !self.tags.is_empty() {
            out.push('@');
            let mut first = true;
            for (key, value) in &self.tags {
                if !first {
                    out.push(';');
                }
                first = false;
                out.push_str(key);
                out.push('=');
                out.push_str(&escape_value(value));
            }
            out.push(' ');
        }

        if !self.prefix.is_empty() {
            out.push(':');
            out.push_str(&self.prefix);
            out.push(' ');
        }

        out.push_str(&self.command);

        if let Some((last, middle)) = self.args.split_last() {
            for arg in middle {
                out.push(' ');
                out.push_str(arg);
            }
            out.push_str(" :");
            out.push_str(last);
        }

        out.push_str("\r\n");
        out
    }

    /// The message body: the last argument, or `""` when there are none.
    pub fn body(&self) -> &str {
        self.args.last().map(String::as_str).unwrap_or("")
    }

    /// First argument, which is the target channel for channel commands.
    pub fn channel(&self) -> Option<&str> {
        self.args.first().map(String::as_str)
    }

    /// Look up a tag value.
    pub fn tag(&self, key: &str) -> Option<&str> {
        self.tags.get(key).map(String::as_str)
    }
}

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Message{{Prefix: {:?}, Command: {:?}, Args: {:?}, Timestamp: {}}}",
            self.prefix,
            self.command,
            self.args,
            self.timestamp
                .map(|ts| ts.to_rfc3339())
                .unwrap_or_else(|| "unset".to_string())
        )
    }
}

/// Split the parameter part of a line into arguments.
///
/// A token starting with `:` swallows the rest of the line (sans the `:`)
/// as the final argument. Runs of spaces separate tokens.
fn split_args(mut params: &str) -> Vec<String> {
    let mut args = Vec::new();
    while !params.is_empty() {
        if let Some(body) = params.strip_prefix(':') {
            args.push(body.to_string());
            break;
        }
        match params.split_once(' ') {
            Some((arg, tail)) => {
                if !arg.is_empty() {
                    args.push(arg.to_string());
                }
                params = tail;
            }
            None => {
                args.push(params.to_string());
                break;
            }
        }
    }
    args
}

fn timestamp_from_tags(
    tags: &BTreeMap<String, String>,
) -> Result<Option<DateTime<Utc>>, ParseError> {
    if let Some(raw) = tags.get(SENT_TS_TAG) {
        let millis: i64 = raw
            .parse()
            .map_err(|_| ParseError::InvalidSentTimestamp(raw.clone()))?;
        let secs = millis.div_euclid(1000);
        let nanos = (millis.rem_euclid(1000) * 1_000_000) as u32;
        return DateTime::from_timestamp(secs, nanos)
            .map(Some)
            .ok_or_else(|| ParseError::InvalidSentTimestamp(raw.clone()));
    }

    if let Some(raw) = tags.get(TIME_TAG) {
        return DateTime::parse_from_rfc3339(raw)
            .map(|ts| Some(ts.with_timezone(&Utc)))
            .map_err(|_| ParseError::InvalidTime(raw.clone()));
    }

    Ok(None)
}

/// Undo IRCv3 tag value escaping.
///
/// `\:` is `;`, `\s` is a space, `\r` and `\n` are CR and LF. Any other
/// escaped character stands for itself and a trailing lone backslash is
/// dropped.
pub fn unescape_value(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    let mut chars = value.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some(':') => out.push(';'),
            Some('s') => out.push(' '),
            Some('r') => out.push('\r'),
            Some('n') => out.push('\n'),
            Some(other) => out.push(other),
            None => {}
        }
    }
    out
}

/// Escape a tag value for the wire. Inverse of [`unescape_value`].
pub fn escape_value(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for c in value.chars() {
        match c {
            ';' => out.push_str("\\:"),
            ' ' => out.push_str("\\s"),
            '\r' => out.push_str("\\r"),
            '\n' => out.push_str("\\n"),
            '\\' => out.push_str("\\\\"),
            other => out.push(other),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    const FULL_LINE: &str = "@badge-info=subscriber/15;badges=subscriber/12,glhf-pledge/1;color=#DAA520;display-name=Mm2PL;emotes=;flags=;id=1d7e0b34-fe74-4895-92ae-dd912046e637;mod=0;room-id=11148817;subscriber=1;tmi-sent-ts=1632058935165;turbo=0;user-id=117691339;user-type= :mm2pl!mm2pl@mm2pl.tmi.twitch.tv PRIVMSG #pajlada :-tags many words asdasd";

    #[test]
    fn test_parse_full_privmsg() {
        let m = Message::parse(FULL_LINE).unwrap();
        assert_eq!(m.command, "PRIVMSG");
        assert_eq!(m.prefix, "mm2pl!mm2pl@mm2pl.tmi.twitch.tv");
        assert_eq!(m.user, "mm2pl");
        assert_eq!(m.args, vec!["#pajlada", "-tags many words asdasd"]);
        assert_eq!(m.tags.len(), 14);
        assert_eq!(m.tag("display-name"), Some("Mm2PL"));
        assert_eq!(m.tag("emotes"), Some(""));
        assert_eq!(m.tag("user-type"), Some(""));
        assert_eq!(m.raw, FULL_LINE);
    }

    #[test]
    fn test_parse_sent_timestamp() {
        let m = Message::parse(
            "@tmi-sent-ts=1632058935165 :mm2pl!mm2pl@x PRIVMSG #pajlada :hello world",
        )
        .unwrap();
        assert_eq!(m.command, "PRIVMSG");
        assert_eq!(m.user, "mm2pl");
        assert_eq!(m.args, vec!["#pajlada", "hello world"]);
        let expected = Utc.with_ymd_and_hms(2021, 9, 19, 13, 42, 15).unwrap()
            + chrono::Duration::milliseconds(165);
        assert_eq!(m.timestamp, Some(expected));
        assert_eq!(m.timestamp.unwrap().timestamp_millis(), 1632058935165);
    }

    #[test]
    fn test_parse_time_tag() {
        let m = Message::parse("@time=2021-09-19T13:42:15.165Z :nick!u@h NOTICE #c :hi").unwrap();
        assert_eq!(
            m.timestamp.unwrap().timestamp_millis(),
            1632058935165
        );
    }

    #[test]
    fn test_sent_ts_wins_over_time_tag() {
        let m = Message::parse("@time=2000-01-01T00:00:00Z;tmi-sent-ts=1000 PING").unwrap();
        assert_eq!(m.timestamp.unwrap().timestamp(), 1);
    }

    #[test]
    fn test_parse_invalid_timestamps() {
        assert!(matches!(
            Message::parse("@tmi-sent-ts=soon PING"),
            Err(ParseError::InvalidSentTimestamp(_))
        ));
        assert!(matches!(
            Message::parse("@time=yesterday PING"),
            Err(ParseError::InvalidTime(_))
        ));
    }

    #[test]
    fn test_negative_sent_timestamp() {
        let m = Message::parse("@tmi-sent-ts=-1 PING").unwrap();
        assert_eq!(m.timestamp.unwrap().timestamp_millis(), -1);
    }

    #[test]
    fn test_no_timestamp_is_unset() {
        let m = Message::parse(":tmi.twitch.tv PING").unwrap();
        assert_eq!(m.timestamp, None);
    }

    #[test]
    fn test_parse_escaped_tags_without_args() {
        let m = Message::parse(r"@tag=spaces\sexist\sas\sdo\nnew\rlines\sand\:semicolons TEST").unwrap();
        assert_eq!(m.command, "TEST");
        assert_eq!(m.prefix, "");
        assert!(m.args.is_empty());
        assert_eq!(
            m.tag("tag"),
            Some("spaces exist as do\nnew\rlines and;semicolons")
        );
    }

    #[test]
    fn test_parse_errors() {
        assert_eq!(Message::parse(""), Err(ParseError::EmptyInput));
        assert_eq!(Message::parse("@a=b"), Err(ParseError::UnterminatedTags));
        assert!(matches!(
            Message::parse("@novalue PING"),
            Err(ParseError::InvalidTag(_))
        ));
        assert_eq!(
            Message::parse(":nick!u@h"),
            Err(ParseError::UnterminatedPrefix)
        );
        assert_eq!(Message::parse("@a=b "), Err(ParseError::MissingCommand));
    }

    #[test]
    fn test_args_without_trailing_body() {
        let m = Message::parse("MODE #chan +o nick").unwrap();
        assert_eq!(m.args, vec!["#chan", "+o", "nick"]);

        let m = Message::parse("JOIN #c").unwrap();
        assert_eq!(m.args, vec!["#c"]);

        let m = Message::parse("JOIN a").unwrap();
        assert_eq!(m.args, vec!["a"]);
    }

    #[test]
    fn test_trailing_body_keeps_colons_and_spaces() {
        let m = Message::parse("PRIVMSG #c :a :b  c ").unwrap();
        assert_eq!(m.args, vec!["#c", "a :b  c "]);

        let m = Message::parse("PRIVMSG #c :").unwrap();
        assert_eq!(m.args, vec!["#c", ""]);
    }

    #[test]
    fn test_user_requires_bang() {
        let m = Message::parse(":tmi.twitch.tv CLEARCHAT #c").unwrap();
        assert_eq!(m.prefix, "tmi.twitch.tv");
        assert_eq!(m.user, "");
    }

    #[test]
    fn test_serialize_round_trip() {
        for line in [
            FULL_LINE,
            r"@tag=spaces\sexist\sas\sdo\nnew\rlines\sand\:semicolons TEST",
            ":tmi.twitch.tv CLEARCHAT #pajlada :someone",
            "PING :tmi.twitch.tv",
        ] {
            let m = Message::parse(line).unwrap();
            assert_eq!(m.serialize(), format!("{}\r\n", line));

            let mut again = Message::parse(m.serialize().trim_end_matches("\r\n")).unwrap();
            let mut first = m.clone();
            again.raw.clear();
            first.raw.clear();
            assert_eq!(again, first);
        }

        // tag order in the input is not preserved, every field still is
        let unsorted = Message::parse("@z=1;a=2 :u!u@h PRIVMSG #c middle :last arg").unwrap();
        let mut again = Message::parse(unsorted.serialize().trim_end_matches("\r\n")).unwrap();
        assert_eq!(again.user, "u");
        assert_eq!(again.prefix, "u!u@h");
        let mut first = unsorted;
        again.raw.clear();
        first.raw.clear();
        assert_eq!(again, first);
    }

    #[test]
    fn test_serialize_sorts_tags() {
        let m = Message::parse("@z=1;a=2;m=3 PING").unwrap();
        assert_eq!(m.serialize(), "@a=2;m=3;z=1 PING\r\n");
    }

    #[test]
    fn test_escape_round_trip() {
        for s in [
            "",
            "plain",
            "a;b c\r\nd",
            r"back\slash",
            "trailing\\",
            r"\\s",
            "unicode ✓; ok",
        ] {
            assert_eq!(unescape_value(&escape_value(s)), s, "value {:?}", s);
        }
    }

    #[test]
    fn test_unescape_unknown_and_trailing() {
        assert_eq!(unescape_value(r"a\b"), "ab");
        assert_eq!(unescape_value("a\\"), "a");
        assert_eq!(unescape_value(r"\\"), "\\");
    }

    #[test]
    fn test_json_omits_empty_fields() {
        let m = Message::parse("PING").unwrap();
        let json = serde_json::to_value(&m).unwrap();
        assert_eq!(json["command"], "PING");
        assert!(json.get("prefix").is_none());
        assert!(json.get("tags").is_none());
        assert!(json.get("args").is_none());
        assert!(json.get("timestamp").is_none());
    }

    #[test]
    fn test_body_of_argless_message() {
        let m = Message::parse("PING").unwrap();
        assert_eq!(m.body(), "");
        assert_eq!(m.channel(), None);
    }
}
