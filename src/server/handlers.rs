//! HTTP request handlers.

use crate::config::BookFormat;
use crate::error::{AppError, Result};
use crate::library::Book;
use crate::opds::{self, OPDS_MIME};
use crate::server::AppState;
use axum::{
    body::Body,
    extract::{Path, State},
    http::{StatusCode, header},
    response::{IntoResponse, Response},
};
use std::io::ErrorKind;
use tokio_util::io::ReaderStream;

/// Build a response, returning 500 on error (which shouldn't happen).
fn build_response(status: StatusCode, content_type: &str, body: impl Into<Body>) -> Response<Body> {
    Response::builder()
        .status(status)
        .header(header::CONTENT_TYPE, content_type)
        .body(body.into())
        .unwrap_or_else(|_| {
            Response::builder()
                .status(StatusCode::INTERNAL_SERVER_ERROR)
                .body(Body::from("Internal error"))
                .unwrap_or_default()
        })
}

/// Catalog of every book.
pub async fn catalog(State(state): State<AppState>) -> impl IntoResponse {
    let books = state.get_all_books();
    let feed = opds::catalog(&books, &state.config.server.title, "");
    build_response(StatusCode::OK, OPDS_MIME, feed.build())
}

/// Look up a book from a path segment.
fn find_book(state: &AppState, id: &str) -> Result<Book> {
    let id: i64 = id
        .parse()
        .map_err(|_| AppError::InvalidFormat(format!("Failed to convert {} to book id", id)))?;

    state
        .get_book(id)
        .ok_or_else(|| AppError::NotFound(format!("Could not find book with id {}", id)))
}

/// Map a missing file to 404, anything else to 500.
fn open_error(e: std::io::Error, what: &str, id: i64) -> AppError {
    if e.kind() == ErrorKind::NotFound {
        AppError::NotFound(format!("Missing {} for book id {}", what, id))
    } else {
        AppError::Internal(format!("Could not read {} for book id {}: {}", what, id, e))
    }
}

/// EPUB download.
pub async fn book_download(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Response<Body>> {
    let book = find_book(&state, &id)?;
    let path = book
        .epub_path()
        .ok_or_else(|| AppError::NotFound(format!("Could not find epub for book id {}", book.id)))?;

    let file = tokio::fs::File::open(path)
        .await
        .map_err(|e| open_error(e, "epub", book.id))?;
    let length = file.metadata().await.map(|m| m.len()).ok();
    let body = Body::from_stream(ReaderStream::new(file));

    let filename = path
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("book.epub");

    let mut response = Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, BookFormat::Epub.mime_type())
        .header(
            header::CONTENT_DISPOSITION,
            format!("attachment; filename=\"{}\"", filename),
        );
    if let Some(length) = length {
        response = response.header(header::CONTENT_LENGTH, length);
    }

    response
        .body(body)
        .map_err(|e| AppError::Internal(e.to_string()))
}

/// Read a book's cover image.
async fn read_cover(book: &Book) -> Result<Vec<u8>> {
    let cover = book
        .cover
        .as_ref()
        .ok_or_else(|| AppError::NotFound(format!("Missing cover for book id {}", book.id)))?;

    tokio::fs::read(cover)
        .await
        .map_err(|e| open_error(e, "cover", book.id))
}

/// Book cover image.
pub async fn book_cover(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Response<Body>> {
    let book = find_book(&state, &id)?;
    let data = read_cover(&book).await?;

    let content_type = book
        .cover
        .as_ref()
        .and_then(|path| image::ImageFormat::from_path(path).ok())
        .map(|format| format.to_mime_type())
        .unwrap_or("application/octet-stream");

    Ok(Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, content_type)
        .header(header::CACHE_CONTROL, "public, max-age=3600")
        .body(Body::from(data))
        .unwrap_or_else(|_| Response::default()))
}

/// Book thumbnail image, scaled to fit the configured box.
pub async fn book_thumbnail(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Response<Body>> {
    let book = find_book(&state, &id)?;
    let data = read_cover(&book).await?;

    let thumb_data = make_thumbnail(
        &data,
        state.config.server.thumbnail_width,
        state.config.server.thumbnail_height,
    )?;

    Ok(Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, "image/jpeg")
        .header(header::CACHE_CONTROL, "public, max-age=3600")
        .body(Body::from(thumb_data))
        .unwrap_or_else(|_| Response::default()))
}

/// Decode an image and re-encode it as a JPEG no larger than `width`x`height`.
pub fn make_thumbnail(data: &[u8], width: u32, height: u32) -> Result<Vec<u8>> {
    let img = image::load_from_memory(data)?;
    let thumb = image::DynamicImage::ImageRgb8(img.thumbnail(width, height).to_rgb8());

    let mut thumb_data = Vec::new();
    thumb.write_to(
        &mut std::io::Cursor::new(&mut thumb_data),
        image::ImageFormat::Jpeg,
    )?;
    Ok(thumb_data)
}
