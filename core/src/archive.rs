//! Log archive client
//!
//! The archive serves one file per bucket: a channel-day for channel logs,
//! a channel-user-month for user logs. [`LogSource`] knows how to address
//! buckets of either kind; [`ArchiveClient`] does the HTTP.
//!
//! Endpoints:
//! - `GET {base}/channel/{channel}/{year}/{month}/{day}?raw&reverse`
//! - `GET {base}/channel/{channel}/user/{user}/{year}/{month}?raw&reverse`
//! - `GET {base}/channel/{channel}/userid/{id}/{year}/{month}?raw&reverse`
//! - `GET {base}/list?channel={channel}[&user={user}|&userid={id}]`
//! - `GET {base}/channels`

use std::pin::Pin;
use std::sync::OnceLock;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Datelike, Months, NaiveDate, TimeDelta, Utc};
use futures_util::TryStreamExt;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio::io::AsyncBufRead;
use tokio_util::io::StreamReader;
use tracing::debug;

use crate::config::ArchiveConfig;
use crate::error::{Error, Result};

/// Line-oriented body of one bucket response.
pub type LineReader = Pin<Box<dyn AsyncBufRead + Send>>;

/// Opens bucket bodies for the fetch orchestrator.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Start a GET for `url` and hand back its body once the status is known good.
    async fn open(&self, url: &str) -> Result<LineReader>;
}

/// Who a user-scoped source is about.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UserRef {
    Name(String),
    Id(String),
}

impl UserRef {
    fn path_segment(&self) -> &'static str {
        match self {
            UserRef::Name(_) => "user",
            UserRef::Id(_) => "userid",
        }
    }

    fn value(&self) -> &str {
        match self {
            UserRef::Name(v) | UserRef::Id(v) => v,
        }
    }
}

/// Granularity of the archive files a [`LogSource`] walks.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BucketKind {
    /// One file per channel per day.
    Channel,
    /// One file per user per channel per month.
    User(UserRef),
}

/// Address of a channel (or a user inside a channel) on the archive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogSource {
    base_url: String,
    channel: String,
    kind: BucketKind,
}

impl LogSource {
    /// Whole-channel logs, one bucket per day.
    pub fn channel(base_url: impl Into<String>, channel: impl Into<String>) -> Self {
        Self::new(base_url, channel, BucketKind::Channel)
    }

    /// A single user's logs in a channel, one bucket per month.
    pub fn user(base_url: impl Into<String>, channel: impl Into<String>, user: UserRef) -> Self {
        Self::new(base_url, channel, BucketKind::User(user))
    }

    fn new(base_url: impl Into<String>, channel: impl Into<String>, kind: BucketKind) -> Self {
        let base_url = base_url.into().trim_end_matches('/').to_string();
        let channel = channel.into().trim_start_matches('#').to_string();
        Self {
            base_url,
            channel,
            kind,
        }
    }

    pub fn channel_name(&self) -> &str {
        &self.channel
    }

    /// Human label for logs and errors: `#channel` or `#channel/user`.
    pub fn target(&self) -> String {
        match &self.kind {
            BucketKind::Channel => format!("#{}", self.channel),
            BucketKind::User(user) => format!("#{}/{}", self.channel, user.value()),
        }
    }

    /// URL of the bucket containing `date`, newest lines first.
    pub fn make_url(&self, date: DateTime<Utc>) -> String {
        match &self.kind {
            BucketKind::Channel => format!(
                "{}/channel/{}/{}/{}/{}?raw&reverse",
                self.base_url,
                self.channel,
                date.year(),
                date.month(),
                date.day()
            ),
            BucketKind::User(user) => format!(
                "{}/channel/{}/{}/{}/{}/{}?raw&reverse",
                self.base_url,
                self.channel,
                user.path_segment(),
                user.value(),
                date.year(),
                date.month()
            ),
        }
    }

    /// Step back one bucket: a calendar day or a calendar month.
    ///
    /// Month steps clamp the day (March 31st steps back to February 28th/29th).
    pub fn next_bucket(&self, date: DateTime<Utc>) -> DateTime<Utc> {
        let previous = match self.kind {
            BucketKind::Channel => date.checked_sub_signed(TimeDelta::days(1)),
            BucketKind::User(_) => date.checked_sub_months(Months::new(1)),
        };
        previous.unwrap_or(DateTime::<Utc>::MIN_UTC)
    }

    /// Rough bucket length, for progress estimates only.
    pub fn approximate_offset(&self) -> Duration {
        match self.kind {
            BucketKind::Channel => Duration::from_secs(24 * 60 * 60),
            BucketKind::User(_) => Duration::from_secs(30 * 24 * 60 * 60),
        }
    }

    /// First and last second of the bucket containing `date`.
    pub fn bucket_bounds(&self, date: DateTime<Utc>) -> (DateTime<Utc>, DateTime<Utc>) {
        let day = date.date_naive();
        match self.kind {
            BucketKind::Channel => day_bounds(day),
            BucketKind::User(_) => month_bounds(day.with_day(1).unwrap_or(day)),
        }
    }

    /// Ask the archive which buckets exist for this source.
    ///
    /// # Errors
    /// Returns `Error::Http` on transport failure, `Error::Status` on a
    /// non-200 response, `Error::Serialization` on an unexpected body.
    pub async fn list_available(&self, client: &ArchiveClient) -> Result<LogsList> {
        let mut query = vec![("channel", self.channel.as_str())];
        if let BucketKind::User(user) = &self.kind {
            query.push((user.path_segment(), user.value()));
        }
        let url = format!("{}/list", self.base_url);
        let response: AvailableLogsResponse = client.get_json(&url, &query).await?;
        debug!(
            target = %self.target(),
            count = response.available_logs.len(),
            "listed available logs"
        );
        Ok(response.available_logs)
    }
}

fn midnight(day: NaiveDate) -> DateTime<Utc> {
    day.and_hms_opt(0, 0, 0)
        .map(|dt| dt.and_utc())
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}

fn bounds_until(begin: DateTime<Utc>, next: Option<NaiveDate>) -> (DateTime<Utc>, DateTime<Utc>) {
    let end = next
        .map(|n| midnight(n) - TimeDelta::seconds(1))
        .unwrap_or(DateTime::<Utc>::MAX_UTC);
    (begin, end)
}

fn day_bounds(day: NaiveDate) -> (DateTime<Utc>, DateTime<Utc>) {
    bounds_until(midnight(day), day.succ_opt())
}

fn month_bounds(first: NaiveDate) -> (DateTime<Utc>, DateTime<Utc>) {
    bounds_until(midnight(first), first.checked_add_months(Months::new(1)))
}

/// Parsed form of an [`AvailableLog`]'s date fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BucketDate {
    pub year: i32,
    pub month: u32,
    /// Only present for channel (daily) listings.
    pub day: Option<u32>,
}

/// One element of the archive's `/list` response.
///
/// Year, month and day arrive as strings; they are parsed on first use and
/// the result is cached.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AvailableLog {
    #[serde(rename = "year")]
    pub raw_year: String,
    #[serde(rename = "month")]
    pub raw_month: String,
    #[serde(rename = "day", default, skip_serializing_if = "Option::is_none")]
    pub raw_day: Option<String>,
    #[serde(skip)]
    parsed: OnceLock<BucketDate>,
}

impl PartialEq for AvailableLog {
    fn eq(&self, other: &Self) -> bool {
        self.raw_year == other.raw_year
            && self.raw_month == other.raw_month
            && self.raw_day == other.raw_day
    }
}

impl Eq for AvailableLog {}

impl AvailableLog {
    /// A month-granularity entry.
    pub fn month(year: impl Into<String>, month: impl Into<String>) -> Self {
        Self {
            raw_year: year.into(),
            raw_month: month.into(),
            ..Default::default()
        }
    }

    /// A day-granularity entry.
    pub fn day(year: impl Into<String>, month: impl Into<String>, day: impl Into<String>) -> Self {
        Self {
            raw_day: Some(day.into()),
            ..Self::month(year, month)
        }
    }

    /// Parse (once) the textual date fields.
    ///
    /// # Errors
    /// Returns `Error::InvalidLogEntry` for non-numeric fields or a date
    /// that does not exist.
    pub fn parse(&self) -> Result<BucketDate> {
        if let Some(parsed) = self.parsed.get() {
            return Ok(*parsed);
        }
        let invalid = || {
            Error::InvalidLogEntry(format!(
                "{}-{}-{}",
                self.raw_year,
                self.raw_month,
                self.raw_day.as_deref().unwrap_or("")
            ))
        };
        let year: i32 = self.raw_year.trim().parse().map_err(|_| invalid())?;
        let month: u32 = self.raw_month.trim().parse().map_err(|_| invalid())?;
        let day = match self.raw_day.as_deref().filter(|d| !d.is_empty()) {
            Some(d) => Some(d.trim().parse::<u32>().map_err(|_| invalid())?),
            None => None,
        };
        if NaiveDate::from_ymd_opt(year, month, day.unwrap_or(1)).is_none() {
            return Err(invalid());
        }
        let parsed = BucketDate { year, month, day };
        Ok(*self.parsed.get_or_init(|| parsed))
    }

    fn first_day(&self) -> Result<NaiveDate> {
        let parsed = self.parse()?;
        NaiveDate::from_ymd_opt(parsed.year, parsed.month, parsed.day.unwrap_or(1))
            .ok_or_else(|| Error::InvalidLogEntry(format!("{:?}", parsed)))
    }

    /// Midnight UTC at the start of the bucket (the 1st for monthly entries).
    pub fn to_date(&self) -> Result<DateTime<Utc>> {
        Ok(midnight(self.first_day()?))
    }

    /// First and last second covered by this entry.
    pub fn bounds(&self) -> Result<(DateTime<Utc>, DateTime<Utc>)> {
        let first = self.first_day()?;
        Ok(match self.parse()?.day {
            Some(_) => day_bounds(first),
            None => month_bounds(first),
        })
    }
}

/// The archive's bucket listing.
pub type LogsList = Vec<AvailableLog>;

/// Keep only the entries whose interval overlaps `[early, late]`.
///
/// # Panics
/// If `early` is after `late`; callers validate the window first.
///
/// # Errors
/// Returns `Error::InvalidLogEntry` if an entry's date fields do not parse.
pub fn clip_to_range(
    logs: &[AvailableLog],
    early: DateTime<Utc>,
    late: DateTime<Utc>,
) -> Result<LogsList> {
    assert!(
        early <= late,
        "clip_to_range called with early ({}) after late ({})",
        early,
        late
    );
    let mut out = Vec::new();
    for log in logs {
        let (begin, end) = log.bounds()?;
        if begin <= late && end >= early {
            out.push(log.clone());
        }
    }
    Ok(out)
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct AvailableLogsResponse {
    #[serde(default)]
    available_logs: LogsList,
}

/// One entry of the archive's `/channels` response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Channel {
    #[serde(rename = "userID")]
    pub user_id: String,
    pub name: String,
}

#[derive(Deserialize)]
struct ChannelsResponse {
    #[serde(default)]
    channels: Vec<Channel>,
}

/// HTTP client for one archive instance.
#[derive(Debug, Clone)]
pub struct ArchiveClient {
    http: reqwest::Client,
    base_url: String,
}

impl ArchiveClient {
    /// Build a client from configuration.
    ///
    /// # Errors
    /// Returns `Error::Http` if the HTTP client cannot be constructed.
    pub fn new(config: &ArchiveConfig) -> Result<Self> {
        let http = reqwest::Client::builder()
            .user_agent(config.user_agent.clone())
            .connect_timeout(Duration::from_secs(config.timeout_secs))
            .build()?;
        Ok(Self {
            http,
            base_url: config.url.trim_end_matches('/').to_string(),
        })
    }

    /// Channel-scoped source on this archive.
    pub fn channel_logs(&self, channel: &str) -> LogSource {
        LogSource::channel(self.base_url.clone(), channel)
    }

    /// User-scoped source on this archive.
    pub fn user_logs(&self, channel: &str, user: UserRef) -> LogSource {
        LogSource::user(self.base_url.clone(), channel, user)
    }

    /// Every channel the archive logs.
    pub async fn list_channels(&self) -> Result<Vec<Channel>> {
        let url = format!("{}/channels", self.base_url);
        let response: ChannelsResponse = self.get_json(&url, &[]).await?;
        Ok(response.channels)
    }

    async fn get_json<T: DeserializeOwned>(&self, url: &str, query: &[(&str, &str)]) -> Result<T> {
        debug!(url, "GET");
        let response = self.http.get(url).query(query).send().await?;
        let response = check_status(response, url).await?;
        let body = response.bytes().await?;
        Ok(serde_json::from_slice(&body)?)
    }
}

#[async_trait]
impl Transport for ArchiveClient {
    async fn open(&self, url: &str) -> Result<LineReader> {
        debug!(url, "opening bucket");
        let response = self.http.get(url).send().await?;
        let response = check_status(response, url).await?;
        let body = response.bytes_stream().map_err(std::io::Error::other);
        Ok(Box::pin(StreamReader::new(body)))
    }
}

/// Turn a non-200 response into `Error::Status` carrying the body's first line.
async fn check_status(response: reqwest::Response, url: &str) -> Result<reqwest::Response> {
    let status = response.status();
    if status == reqwest::StatusCode::OK {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    Err(Error::Status {
        status,
        url: url.to_string(),
        detail: first_line(&body).to_string(),
    })
}

fn first_line(body: &str) -> &str {
    body.lines()
        .next()
        .unwrap_or("")
        .trim_matches(|c| c == '\r' || c == '\n')
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(y: i32, m: u32, d: u32, h: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, m, d, h, 0, 0).unwrap()
    }

    #[test]
    fn test_channel_url() {
        let source = LogSource::channel("https://logs.example.com/", "#pajlada");
        assert_eq!(
            source.make_url(at(2021, 9, 5, 13)),
            "https://logs.example.com/channel/pajlada/2021/9/5?raw&reverse"
        );
        assert_eq!(source.target(), "#pajlada");
    }

    #[test]
    fn test_user_urls() {
        let by_name = LogSource::user("http://l", "pajlada", UserRef::Name("mm2pl".into()));
        assert_eq!(
            by_name.make_url(at(2021, 9, 5, 13)),
            "http://l/channel/pajlada/user/mm2pl/2021/9?raw&reverse"
        );
        let by_id = LogSource::user("http://l", "pajlada", UserRef::Id("117691339".into()));
        assert_eq!(
            by_id.make_url(at(2021, 9, 5, 13)),
            "http://l/channel/pajlada/userid/117691339/2021/9?raw&reverse"
        );
    }

    #[test]
    fn test_next_bucket() {
        let channel = LogSource::channel("http://l", "c");
        assert_eq!(channel.next_bucket(at(2021, 3, 1, 5)), at(2021, 2, 28, 5));

        let user = LogSource::user("http://l", "c", UserRef::Name("u".into()));
        assert_eq!(user.next_bucket(at(2021, 3, 31, 5)), at(2021, 2, 28, 5));
        assert_eq!(user.next_bucket(at(2021, 1, 15, 5)), at(2020, 12, 15, 5));
    }

    #[test]
    fn test_approximate_offset() {
        let channel = LogSource::channel("http://l", "c");
        let user = LogSource::user("http://l", "c", UserRef::Id("1".into()));
        assert_eq!(channel.approximate_offset().as_secs(), 86_400);
        assert_eq!(user.approximate_offset().as_secs(), 30 * 86_400);
    }

    #[test]
    fn test_bucket_bounds() {
        let channel = LogSource::channel("http://l", "c");
        let (begin, end) = channel.bucket_bounds(at(2021, 2, 28, 17));
        assert_eq!(begin, at(2021, 2, 28, 0));
        assert_eq!(end, at(2021, 3, 1, 0) - TimeDelta::seconds(1));

        let user = LogSource::user("http://l", "c", UserRef::Name("u".into()));
        let (begin, end) = user.bucket_bounds(at(2020, 2, 14, 17));
        assert_eq!(begin, at(2020, 2, 1, 0));
        assert_eq!(end, at(2020, 3, 1, 0) - TimeDelta::seconds(1));
    }

    #[test]
    fn test_available_log_to_date() {
        let month = AvailableLog::month("2022", "7");
        assert_eq!(month.to_date().unwrap(), at(2022, 7, 1, 0));
        assert_eq!(month.parse().unwrap().day, None);

        let day = AvailableLog::day("2022", "7", "19");
        assert_eq!(day.to_date().unwrap(), at(2022, 7, 19, 0));
    }

    #[test]
    fn test_available_log_invalid() {
        assert!(matches!(
            AvailableLog::month("twenty", "7").parse(),
            Err(Error::InvalidLogEntry(_))
        ));
        assert!(AvailableLog::month("2022", "13").to_date().is_err());
        assert!(AvailableLog::day("2022", "2", "30").to_date().is_err());
    }

    #[test]
    fn test_available_log_json() {
        let body = r#"{"availableLogs":[{"year":"2022","month":"12","day":"3"},{"year":"2022","month":"11"}]}"#;
        let parsed: AvailableLogsResponse = serde_json::from_str(body).unwrap();
        assert_eq!(parsed.available_logs.len(), 2);
        assert_eq!(parsed.available_logs[0], AvailableLog::day("2022", "12", "3"));
        assert_eq!(parsed.available_logs[1], AvailableLog::month("2022", "11"));
    }

    #[test]
    fn test_clip_months() {
        let logs: LogsList = (1..=12)
            .rev()
            .map(|m| AvailableLog::month("2022", m.to_string()))
            .collect();
        let clipped = clip_to_range(&logs, at(2022, 4, 1, 0), at(2022, 10, 1, 0)).unwrap();
        let months: Vec<_> = clipped.iter().map(|l| l.raw_month.as_str()).collect();
        assert_eq!(months, vec!["10", "9", "8", "7", "6", "5", "4"]);
    }

    #[test]
    fn test_clip_partial_overlap() {
        let logs = vec![
            AvailableLog::day("2022", "5", "1"),
            AvailableLog::day("2022", "5", "2"),
            AvailableLog::day("2022", "5", "3"),
            AvailableLog::day("2022", "5", "4"),
        ];
        // window from the middle of May 2nd to the middle of May 3rd
        let clipped = clip_to_range(&logs, at(2022, 5, 2, 12), at(2022, 5, 3, 12)).unwrap();
        let days: Vec<_> = clipped
            .iter()
            .map(|l| l.raw_day.clone().unwrap())
            .collect();
        assert_eq!(days, vec!["2", "3"]);

        // a window strictly inside one month keeps that month
        let months = vec![AvailableLog::month("2022", "5"), AvailableLog::month("2022", "6")];
        let clipped = clip_to_range(&months, at(2022, 5, 10, 0), at(2022, 5, 11, 0)).unwrap();
        assert_eq!(clipped, vec![AvailableLog::month("2022", "5")]);
    }

    #[test]
    #[should_panic]
    fn test_clip_inverted_range_panics() {
        let _ = clip_to_range(&[], at(2022, 5, 2, 0), at(2022, 5, 1, 0));
    }

    #[test]
    fn test_first_line() {
        assert_eq!(first_line("channel not found\r\nmore"), "channel not found");
        assert_eq!(first_line(""), "");
    }

    #[test]
    fn test_channels_json() {
        let body = r#"{"channels":[{"userID":"11148817","name":"pajlada"}]}"#;
        let parsed: ChannelsResponse = serde_json::from_str(body).unwrap();
        assert_eq!(
            parsed.channels,
            vec![Channel {
                user_id: "11148817".into(),
                name: "pajlada".into()
            }]
        );
    }
}
