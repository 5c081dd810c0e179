//! FanFicFare's `--json-meta` output.
//!
//! Standard output is human-readable progress text, then a JSON object whose
//! opening brace sits alone on its own line. Parsing happens in two stages:
//! [`parse`] splits the text from the payload at the first `"\n{\n"`, and
//! [`Output::decode`] turns the payload into [`UpdaterMetadata`]. The payload
//! is only worth decoding when the progress text says an update happened.

use crate::calibre::UpdateMetadata;
use crate::error::{AppError, Result};
use crate::library::timestamp;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer};
use serde_json::Value;

/// Separates the progress text from the JSON payload.
pub const DELIMITER: &str = "\n{\n";

/// Progress line prefix printed when FanFicFare applies an update.
pub const UPDATE_SENTINEL: &str = "Do update -";

/// Updater stdout, split in two.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Output {
    /// Progress text before the delimiter.
    pub message: String,
    /// Everything after the delimiter, missing its opening brace.
    pub payload: String,
}

/// Split updater stdout for `path` into progress text and payload.
pub fn parse(stdout: &str, path: &str) -> Result<Output> {
    let stdout = stdout.replace('\r', "");
    match stdout.split_once(DELIMITER) {
        Some((message, payload)) => Ok(Output {
            message: message.to_string(),
            payload: payload.to_string(),
        }),
        None => Err(AppError::Protocol {
            path: path.to_string(),
            output: stdout,
        }),
    }
}

impl Output {
    /// Whether the progress text announces an update.
    pub fn is_updating(&self) -> bool {
        self.message
            .lines()
            .any(|line| line.starts_with(UPDATE_SENTINEL))
    }

    /// Decode the payload.
    pub fn decode(&self) -> Result<UpdaterMetadata> {
        let json = format!("{{{}", self.payload);
        serde_json::from_str(&json).map_err(|source| AppError::Metadata {
            source,
            payload: json,
        })
    }
}

/// Story metadata as reported by FanFicFare.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct UpdaterMetadata {
    /// Story author.
    #[serde(deserialize_with = "lenient_string")]
    pub author: String,
    /// Output format name.
    #[serde(rename = "formatname", deserialize_with = "lenient_string")]
    pub format_name: String,
    /// Story summary.
    #[serde(deserialize_with = "lenient_string")]
    pub description: String,
    /// Source's own "last updated" text.
    #[serde(rename = "lastupdate", deserialize_with = "lenient_string")]
    pub last_update: String,
    /// Chapter count, as text.
    #[serde(rename = "numChapters", deserialize_with = "lenient_string")]
    pub num_chapters: String,
    /// Publishing site name.
    #[serde(deserialize_with = "lenient_string")]
    pub publisher: String,
    /// First publication.
    #[serde(rename = "datePublished", deserialize_with = "timestamp::deserialize")]
    pub published: Option<DateTime<Utc>>,
    /// Series name.
    #[serde(deserialize_with = "lenient_string")]
    pub series: String,
    /// Site domain.
    #[serde(deserialize_with = "lenient_string")]
    pub site: String,
    /// Completion status.
    #[serde(deserialize_with = "lenient_string")]
    pub status: String,
    /// Canonical story URL.
    #[serde(rename = "storyUrl", deserialize_with = "lenient_string")]
    pub story_url: String,
    /// Story title.
    #[serde(deserialize_with = "lenient_string")]
    pub title: String,
    /// Last update on the source.
    #[serde(rename = "dateUpdated", deserialize_with = "timestamp::deserialize")]
    pub updated: Option<DateTime<Utc>>,
    /// Chapter list.
    #[serde(rename = "zchapters")]
    pub chapters: Vec<Chapter>,
}

impl UpdaterMetadata {
    /// Library fields to write back.
    pub fn to_update(&self) -> UpdateMetadata {
        UpdateMetadata {
            authors: vec![self.author.clone()],
            comments: self.description.clone(),
            published: self.published,
            publisher: self.publisher.clone(),
            series: self.series.clone(),
            timestamp: self.updated,
        }
    }
}

/// One chapter, encoded as `[number, {details}]`.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(from = "ChapterEntry")]
pub struct Chapter {
    /// Chapter number.
    pub number: i64,
    /// Chapter details.
    pub detail: ChapterDetail,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum ChapterEntry {
    Numbered(i64, ChapterDetail),
    Bare(ChapterDetail),
}

impl From<ChapterEntry> for Chapter {
    fn from(entry: ChapterEntry) -> Self {
        match entry {
            ChapterEntry::Numbered(number, detail) => Chapter { number, detail },
            ChapterEntry::Bare(detail) => Chapter { number: 0, detail },
        }
    }
}

/// Per-chapter details. Decoded but not otherwise used.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct ChapterDetail {
    /// Chapter date.
    #[serde(deserialize_with = "timestamp::deserialize")]
    pub date: Option<DateTime<Utc>>,
    /// Word count in thousands.
    #[serde(deserialize_with = "lenient_string")]
    pub kwords: String,
    /// Chapter title.
    #[serde(deserialize_with = "lenient_string")]
    pub title: String,
    /// Chapter URL.
    #[serde(deserialize_with = "lenient_string")]
    pub url: String,
    /// Word count.
    #[serde(deserialize_with = "lenient_string")]
    pub words: String,
}

/// Accept any scalar as text; `null` becomes empty.
fn lenient_string<'de, D>(deserializer: D) -> std::result::Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    match Value::deserialize(deserializer)? {
        Value::Null => Ok(String::new()),
        Value::String(text) => Ok(text),
        Value::Number(n) => Ok(n.to_string()),
        Value::Bool(b) => Ok(b.to_string()),
        other => Err(serde::de::Error::custom(format!(
            "expected a string, found {}",
            other
        ))),
    }
}
