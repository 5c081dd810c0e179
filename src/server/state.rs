//! Application state shared across handlers.

use crate::calibre::Calibre;
use crate::config::Config;
use crate::error::Result;
use crate::library::Book;
use crate::scheduler::SnapshotSource;
use async_trait::async_trait;
use std::sync::Arc;

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    /// Application configuration.
    pub config: Arc<Config>,
    /// Library access.
    pub calibre: Arc<Calibre>,
    /// Latest library snapshot.
    books: Arc<parking_lot::RwLock<Vec<Book>>>,
}

impl AppState {
    /// Create application state with an empty snapshot.
    pub fn new(config: Config, calibre: Arc<Calibre>) -> Self {
        Self {
            config: Arc::new(config),
            calibre,
            books: Arc::new(parking_lot::RwLock::new(Vec::new())),
        }
    }

    /// Read the library and keep the result as the served snapshot.
    pub async fn refresh(&self) -> Result<Vec<Book>> {
        let books = self.calibre.list_books().await?;
        self.replace_books(books.clone());
        Ok(books)
    }

    /// Replace the served snapshot.
    pub fn replace_books(&self, books: Vec<Book>) {
        let count = books.len();
        *self.books.write() = books;
        tracing::debug!(books = count, "Catalog snapshot replaced");
    }

    /// Get all books.
    pub fn get_all_books(&self) -> Vec<Book> {
        self.books.read().clone()
    }

    /// Get book by ID.
    pub fn get_book(&self, id: i64) -> Option<Book> {
        self.books.read().iter().find(|b| b.id == id).cloned()
    }

    /// Get book count.
    pub fn book_count(&self) -> usize {
        self.books.read().len()
    }
}

#[async_trait]
impl SnapshotSource for AppState {
    async fn list_books(&self) -> Result<Vec<Book>> {
        self.refresh().await
    }
}
