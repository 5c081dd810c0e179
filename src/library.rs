/// Book model.
pub mod book;
/// Lenient timestamp handling.
pub mod timestamp;

pub use book::Book;
