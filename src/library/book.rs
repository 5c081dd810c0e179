//! Book metadata model.

use crate::config::BookFormat;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use url::Url;

/// A book as recorded in the Calibre library.
///
/// Values are snapshots: a fresh list is read from the library on every
/// poll, nothing here is mutated afterwards.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Book {
    /// Calibre's numeric id.
    pub id: i64,

    /// Stable unique identifier.
    pub uuid: String,

    /// Book title.
    pub title: String,

    /// Authors, never empty.
    pub authors: Vec<String>,

    /// Author sort key.
    pub author_sort: String,

    /// External identifiers; `url` is the story's source.
    pub identifiers: HashMap<String, String>,

    /// Local paths of every available format. Each exists on disk.
    pub formats: Vec<PathBuf>,

    /// Local path of the cover image, if one exists on disk.
    pub cover: Option<PathBuf>,

    /// Publisher name.
    pub publisher: Option<String>,

    /// Series name.
    pub series: Option<String>,

    /// Position in series.
    pub series_index: Option<f64>,

    /// When the book was added to the library.
    pub timestamp: Option<DateTime<Utc>>,

    /// Publication date.
    pub pubdate: Option<DateTime<Utc>>,

    /// Last metadata change.
    pub last_modified: Option<DateTime<Utc>>,

    /// Tags.
    pub tags: Vec<String>,

    /// Free-form comments (HTML).
    pub comments: String,

    /// Language codes.
    pub languages: Vec<String>,

    /// Size in bytes of the largest format.
    pub size: u64,
}

impl Book {
    /// Create a book with only an id, a title and one author.
    pub fn new(id: i64, title: impl Into<String>, author: impl Into<String>) -> Self {
        Self {
            id,
            uuid: String::new(),
            title: title.into(),
            authors: vec![author.into()],
            author_sort: String::new(),
            identifiers: HashMap::new(),
            formats: Vec::new(),
            cover: None,
            publisher: None,
            series: None,
            series_index: None,
            timestamp: None,
            pubdate: None,
            last_modified: None,
            tags: Vec::new(),
            comments: String::new(),
            languages: Vec::new(),
            size: 0,
        }
    }

    /// Source URL of the story, if recorded and well-formed.
    pub fn source_url(&self) -> Option<Url> {
        self.identifiers
            .get("url")
            .and_then(|raw| Url::parse(raw).ok())
    }

    /// Path of the first EPUB format.
    pub fn epub_path(&self) -> Option<&Path> {
        self.formats
            .iter()
            .find(|path| format_of(path) == Some(BookFormat::Epub))
            .map(PathBuf::as_path)
    }

    /// Get display name for authors.
    pub fn authors_display(&self) -> String {
        self.authors.join(", ")
    }
}

/// Detect a book format from a file's extension.
pub fn format_of(path: &Path) -> Option<BookFormat> {
    path.extension()
        .and_then(|ext| ext.to_str())
        .and_then(BookFormat::from_extension)
}
