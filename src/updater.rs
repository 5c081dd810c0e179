//! Per-book updates through FanFicFare.

pub mod protocol;
pub mod sites;

pub use sites::{SiteRegistry, registrable_domain};

use crate::calibre::Calibre;
use crate::error::{AppError, Result};
use crate::library::Book;
use std::sync::Arc;

/// FanFicFare, run as a Calibre plugin.
#[derive(Debug, Clone)]
pub struct FanFicFare {
    calibre: Arc<Calibre>,
}

impl FanFicFare {
    /// Wrap a Calibre handle.
    pub fn new(calibre: Arc<Calibre>) -> Self {
        Self { calibre }
    }

    /// The Calibre installation the plugin runs in.
    pub fn calibre(&self) -> &Calibre {
        &self.calibre
    }

    /// Run the plugin non-interactively, returning stdout.
    pub async fn run<I, S>(&self, args: I) -> Result<String>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let full_args = ["--run-plugin=FanFicFare", "--", "--non-interactive"]
            .into_iter()
            .map(String::from)
            .chain(self.calibre.library_arg())
            .chain(args.into_iter().map(Into::into));
        self.calibre.run_debug(full_args).await
    }
}

/// Why a book was left alone.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    /// The book records no source URL.
    NoUrl,
    /// The source site is not supported.
    Unsupported,
}

/// Result of processing one book.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// Nothing was attempted.
    Skipped(SkipReason),
    /// The updater ran and found nothing new.
    NoUpdate,
    /// The book was updated and its metadata written back.
    Updated,
}

impl Outcome {
    /// Whether the library was changed.
    pub fn is_updated(&self) -> bool {
        matches!(self, Outcome::Updated)
    }
}

/// Brings single books up to date with their source.
#[derive(Debug, Clone)]
pub struct UpdateProcessor {
    fanficfare: FanFicFare,
    sites: Arc<SiteRegistry>,
}

impl UpdateProcessor {
    /// Create a processor for the given supported sites.
    pub fn new(fanficfare: FanFicFare, sites: Arc<SiteRegistry>) -> Self {
        Self { fanficfare, sites }
    }

    /// Update one book if its source has anything new.
    pub async fn process(&self, book: &Book) -> Result<Outcome> {
        let Some(url) = book.source_url() else {
            tracing::info!("Skipping {}, no URL", book.title);
            return Ok(Outcome::Skipped(SkipReason::NoUrl));
        };

        let domain = url
            .domain()
            .and_then(registrable_domain)
            .ok_or_else(|| {
                AppError::InvalidFormat(format!("could not get registrable domain for {}", url))
            })?;

        if !self.sites.is_supported(&domain) {
            tracing::info!("Skipping {}, not supported", url);
            return Ok(Outcome::Skipped(SkipReason::Unsupported));
        }

        tracing::info!("Updating {}: {}", book.title, url);
        let source = book
            .epub_path()
            .ok_or_else(|| AppError::NotFound(format!("no EPUB for {}", book.title)))?;

        // Work on a copy so a failed run cannot damage the library file.
        // The copy is removed when `work` drops.
        let work = tempfile::Builder::new()
            .prefix("ficsync-")
            .suffix(".epub")
            .tempfile()?
            .into_temp_path();
        tokio::fs::copy(source, &work).await?;
        let work_path = work.to_string_lossy().into_owned();

        let stdout = self
            .fanficfare
            .run(["--json-meta", "--update-epub", work_path.as_str()])
            .await?;

        let output = protocol::parse(&stdout, &source.to_string_lossy()).inspect_err(|e| {
            if let AppError::Protocol { output, .. } = e {
                tracing::error!("{}", output);
            }
        })?;
        tracing::info!("{}", output.message);

        if !output.is_updating() {
            return Ok(Outcome::NoUpdate);
        }

        let meta = output.decode().inspect_err(|e| {
            if let AppError::Metadata { payload, .. } = e {
                tracing::debug!("{}", payload);
            }
        })?;

        self.fanficfare
            .calibre()
            .update_book(book.id, &meta.to_update())
            .await?;

        tracing::info!(id = book.id, title = %book.title, "Updated book");
        Ok(Outcome::Updated)
    }
}
