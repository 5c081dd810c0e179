//! Access to the Calibre library through its command line tools.

use crate::config::CalibreConfig;
use crate::error::{AppError, Result};
use crate::library::{Book, timestamp};
use crate::process::{CommandRunner, Invocation};
use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Deserializer};
use serde_json::Value;
use std::collections::HashMap;
use std::io::ErrorKind;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;

/// Environment variable both tools read their settings location from.
pub const CONFIG_DIR_ENV: &str = "CALIBRE_CONFIG_DIRECTORY";

const SETTINGS_SCRIPT: &str = "import calibre.constants; print(calibre.config_dir)";
const LIBRARY_SCRIPT: &str =
    "import calibre.library; print(calibre.library.current_library_path())";

/// Handle on a Calibre installation and library.
#[derive(Clone)]
pub struct Calibre {
    /// Library root as seen from this process.
    pub library: Option<PathBuf>,
    /// Calibre settings directory.
    pub settings: Option<PathBuf>,
    calibredb: String,
    calibre_debug: String,
    runner: Arc<dyn CommandRunner>,
}

impl std::fmt::Debug for Calibre {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Calibre")
            .field("library", &self.library)
            .field("settings", &self.settings)
            .field("calibredb", &self.calibredb)
            .field("calibre_debug", &self.calibre_debug)
            .finish_non_exhaustive()
    }
}

impl Calibre {
    /// Create a handle using the default program names.
    pub fn new(runner: Arc<dyn CommandRunner>) -> Self {
        Self {
            library: None,
            settings: None,
            calibredb: "calibredb".to_string(),
            calibre_debug: "calibre-debug".to_string(),
            runner,
        }
    }

    /// Create a handle from configuration.
    pub fn from_config(config: &CalibreConfig, runner: Arc<dyn CommandRunner>) -> Self {
        Self {
            library: config.library.clone(),
            settings: config.settings.clone(),
            calibredb: config.calibredb.clone(),
            calibre_debug: config.calibre_debug.clone(),
            runner,
        }
    }

    /// Set the library root.
    pub fn with_library(mut self, library: impl Into<PathBuf>) -> Self {
        self.library = Some(library.into());
        self
    }

    /// Set the settings directory.
    pub fn with_settings(mut self, settings: impl Into<PathBuf>) -> Self {
        self.settings = Some(settings.into());
        self
    }

    /// `--library-path=...` argument, when a library root is known.
    pub fn library_arg(&self) -> Option<String> {
        self.library
            .as_ref()
            .map(|root| format!("--library-path={}", root.display()))
    }

    /// Ask Calibre for whichever of the settings and library paths are unset.
    pub async fn find_paths(&mut self) -> Result<()> {
        if self.settings.is_none() {
            let output = self
                .run_debug(["--command", SETTINGS_SCRIPT])
                .await
                .map_err(|e| AppError::Config(format!("could not find settings path: {}", e)))?;
            self.settings = Some(clean_path(output.trim()));
        }

        if self.library.is_none() {
            let output = self
                .run_debug(["--command", LIBRARY_SCRIPT])
                .await
                .map_err(|e| AppError::Config(format!("could not find library path: {}", e)))?;
            let library = clean_path(output.trim());
            tracing::debug!(library = %library.display(), "Auto-detected library path");
            self.library = Some(library);
        }

        Ok(())
    }

    /// Run a program with the settings directory exported, returning stdout.
    pub async fn run<I, S>(&self, program: &str, args: I) -> Result<String>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut invocation = Invocation::new(program).args(args);
        if let Some(settings) = &self.settings {
            invocation = invocation.env(CONFIG_DIR_ENV, settings.display().to_string());
        }
        self.runner.run(&invocation).await
    }

    /// Run `calibre-debug` with the given arguments.
    pub async fn run_debug<I, S>(&self, args: I) -> Result<String>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.run(&self.calibre_debug, args).await
    }

    /// Run `calibredb` against the configured library.
    async fn run_db<I, S>(&self, args: I) -> Result<String>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let args = self
            .library_arg()
            .into_iter()
            .chain(args.into_iter().map(Into::into));
        self.run(&self.calibredb, args).await
    }

    /// Read a full snapshot of the library.
    pub async fn list_books(&self) -> Result<Vec<Book>> {
        let data = self
            .run_db(["list", "--for-machine", "--fields=all"])
            .await?;
        let records: Vec<BookRecord> = serde_json::from_str(&data)?;

        let books = records
            .into_iter()
            .map(|record| record.into_book(self.library.as_deref()))
            .collect::<Result<Vec<_>>>()?;

        tracing::debug!(books = books.len(), "Read library snapshot");
        Ok(books)
    }

    /// Write metadata for one book. Empty fields are left untouched.
    pub async fn update_book(&self, id: i64, meta: &UpdateMetadata) -> Result<()> {
        let args = std::iter::once("set_metadata".to_string())
            .chain(meta.to_arguments())
            .chain(std::iter::once(id.to_string()));

        self.run_db(args)
            .await
            .map(|_| ())
            .map_err(|e| AppError::UpdateBook {
                id,
                source: Box::new(e),
            })
    }
}

/// One element of `calibredb list --for-machine`.
#[derive(Debug, Deserialize)]
struct BookRecord {
    id: i64,
    #[serde(default, deserialize_with = "null_default")]
    uuid: String,
    #[serde(default)]
    publisher: Option<String>,
    #[serde(default, deserialize_with = "null_default")]
    size: u64,
    #[serde(default, deserialize_with = "null_default")]
    identifiers: HashMap<String, String>,
    #[serde(default, deserialize_with = "null_default")]
    formats: Vec<String>,
    #[serde(default, deserialize_with = "null_default")]
    title: String,
    #[serde(default)]
    authors: Option<Value>,
    #[serde(default, deserialize_with = "null_default")]
    author_sort: String,
    #[serde(default, deserialize_with = "timestamp::deserialize")]
    timestamp: Option<DateTime<Utc>>,
    #[serde(default, deserialize_with = "timestamp::deserialize")]
    pubdate: Option<DateTime<Utc>>,
    #[serde(default, deserialize_with = "timestamp::deserialize")]
    last_modified: Option<DateTime<Utc>>,
    #[serde(default, deserialize_with = "null_default")]
    tags: Vec<String>,
    #[serde(default, deserialize_with = "null_default")]
    comments: String,
    #[serde(default, deserialize_with = "null_default")]
    languages: Vec<String>,
    #[serde(default)]
    cover: Option<String>,
    #[serde(default)]
    series: Option<String>,
    #[serde(default)]
    series_index: Option<f64>,
}

impl BookRecord {
    fn into_book(self, library: Option<&Path>) -> Result<Book> {
        let authors = decode_authors(&self.title, self.authors)?;

        let formats = self
            .formats
            .iter()
            .filter_map(|stored| locate(Path::new(stored), library))
            .collect();
        let cover = self
            .cover
            .filter(|stored| !stored.is_empty())
            .and_then(|stored| locate(Path::new(&stored), library));

        Ok(Book {
            id: self.id,
            uuid: self.uuid,
            title: self.title,
            authors,
            author_sort: self.author_sort,
            identifiers: self.identifiers,
            formats,
            cover,
            publisher: self.publisher.filter(|p| !p.is_empty()),
            series: self.series.filter(|s| !s.is_empty()),
            series_index: self.series_index,
            timestamp: self.timestamp,
            pubdate: self.pubdate,
            last_modified: self.last_modified,
            tags: self.tags,
            comments: self.comments,
            languages: self.languages,
            size: self.size,
        })
    }
}

/// Treat JSON `null` like a missing field.
fn null_default<'de, D, T>(deserializer: D) -> std::result::Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}

/// Normalize the `authors` field, which is either a list or a bare string.
pub fn decode_authors(title: &str, value: Option<Value>) -> Result<Vec<String>> {
    let invalid = |detail: String| AppError::Authors {
        title: title.to_string(),
        detail,
    };

    let authors = match value {
        None | Some(Value::Null) => return Err(invalid("could not find authors".to_string())),
        Some(Value::Array(items)) => items
            .into_iter()
            .map(|item| match item {
                Value::String(author) => Ok(author),
                other => Err(invalid(format!(
                    "invalid author ({}) {}",
                    json_type(&other),
                    other
                ))),
            })
            .collect::<Result<Vec<_>>>()?,
        Some(Value::String(author)) => vec![author],
        Some(other) => {
            return Err(invalid(format!(
                "invalid authors ({}) {}",
                json_type(&other),
                other
            )));
        }
    };

    if authors.is_empty() {
        return Err(invalid("author list is empty".to_string()));
    }
    Ok(authors)
}

fn json_type(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

fn locate(stored: &Path, library: Option<&Path>) -> Option<PathBuf> {
    match library {
        Some(root) => resolve_path(stored, root),
        None => stored.is_file().then(|| stored.to_path_buf()),
    }
}

/// Find `stored` under `root`, where some leading part of `stored` was a
/// different library root.
///
/// Suffixes of `stored` are tried from the file name outwards; the first
/// one that names a regular file under `root` wins.
pub fn resolve_path(stored: &Path, root: &Path) -> Option<PathBuf> {
    let cleaned = clean_path(&stored.to_string_lossy());
    let segments: Vec<_> = cleaned
        .components()
        .filter_map(|c| match c {
            Component::Normal(segment) => Some(segment),
            _ => None,
        })
        .collect();

    for start in (0..segments.len()).rev() {
        let candidate = segments[start..]
            .iter()
            .fold(root.to_path_buf(), |path, segment| path.join(segment));

        match std::fs::metadata(&candidate) {
            Ok(meta) if meta.is_file() => return Some(candidate),
            Ok(_) => tracing::debug!(path = %candidate.display(), "Skipping directory"),
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => {
                tracing::warn!(path = %candidate.display(), error = %e, "Could not check path, ignoring")
            }
        }
    }

    tracing::debug!(
        stored = %stored.display(),
        root = %root.display(),
        "Could not find file in library"
    );
    None
}

/// Lexically clean a path: drop `.` and empty segments, resolve `..`.
pub fn clean_path(input: &str) -> PathBuf {
    let mut cleaned = PathBuf::new();
    for component in Path::new(input).components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                if !cleaned.pop() {
                    cleaned.push("..");
                }
            }
            other => cleaned.push(other.as_os_str()),
        }
    }
    cleaned
}

/// Metadata to write back into the library.
///
/// Every field is optional; empty ones are not sent.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct UpdateMetadata {
    /// Authors.
    pub authors: Vec<String>,
    /// Comments / description.
    pub comments: String,
    /// Publication date.
    pub published: Option<DateTime<Utc>>,
    /// Publisher.
    pub publisher: String,
    /// Series name.
    pub series: String,
    /// When the source was last updated.
    pub timestamp: Option<DateTime<Utc>>,
}

type FieldValue = fn(&UpdateMetadata) -> String;

/// Calibre field names, in the order they are written.
const FIELDS: [(&str, FieldValue); 6] = [
    ("authors", authors_field),
    ("comments", comments_field),
    ("pubdate", pubdate_field),
    ("publisher", publisher_field),
    ("series", series_field),
    ("timestamp", timestamp_field),
];

fn authors_field(meta: &UpdateMetadata) -> String {
    join_list(&meta.authors)
}

fn comments_field(meta: &UpdateMetadata) -> String {
    meta.comments.clone()
}

fn pubdate_field(meta: &UpdateMetadata) -> String {
    format_time(meta.published)
}

fn publisher_field(meta: &UpdateMetadata) -> String {
    meta.publisher.clone()
}

fn series_field(meta: &UpdateMetadata) -> String {
    meta.series.clone()
}

fn timestamp_field(meta: &UpdateMetadata) -> String {
    format_time(meta.timestamp)
}

impl UpdateMetadata {
    /// `--field=name:value` arguments for every non-empty field.
    pub fn to_arguments(&self) -> Vec<String> {
        FIELDS
            .iter()
            .filter_map(|(name, value)| {
                let value = value(self);
                (!value.is_empty()).then(|| format!("--field={}:{}", name, value))
            })
            .collect()
    }

    /// Whether no field would be written.
    pub fn is_empty(&self) -> bool {
        self.to_arguments().is_empty()
    }
}

fn join_list(items: &[String]) -> String {
    items
        .iter()
        .filter(|item| !item.is_empty())
        .map(String::as_str)
        .collect::<Vec<_>>()
        .join(",")
}

fn format_time(time: Option<DateTime<Utc>>) -> String {
    time.map(|t| timestamp::normalize(t).to_rfc3339_opts(SecondsFormat::Secs, true))
        .unwrap_or_default()
}
