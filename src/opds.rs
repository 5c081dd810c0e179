//! OPDS catalog generation.

use crate::config::BookFormat;
use crate::library::Book;
use chrono::{DateTime, SecondsFormat, Utc};
use quick_xml::Writer;
use quick_xml::events::{BytesDecl, BytesEnd, BytesStart, BytesText, Event};
use std::io::Cursor;

/// OPDS acquisition feed MIME type.
pub const OPDS_MIME: &str = "application/atom+xml;profile=opds-catalog;kind=acquisition";

/// OPDS feed link.
#[derive(Debug, Clone, PartialEq)]
pub struct Link {
    /// Link relation type (e.g., "self", "start", "http://opds-spec.org/acquisition").
    pub rel: String,
    /// URL of the linked resource.
    pub href: String,
    /// MIME type of the linked resource.
    pub link_type: String,
    /// Size of the linked resource in bytes.
    pub length: Option<u64>,
    /// Modification time of the linked resource.
    pub mtime: Option<DateTime<Utc>>,
}

impl Link {
    fn new(rel: impl Into<String>, href: impl Into<String>, link_type: impl Into<String>) -> Self {
        Self {
            rel: rel.into(),
            href: href.into(),
            link_type: link_type.into(),
            length: None,
            mtime: None,
        }
    }
}

/// OPDS feed entry.
#[derive(Debug, Clone, PartialEq)]
pub struct Entry {
    /// Unique identifier for the entry.
    pub id: String,
    /// Entry title.
    pub title: String,
    /// Last update timestamp.
    pub updated: DateTime<Utc>,
    /// When the book entered the library.
    pub published: Option<DateTime<Utc>>,
    /// Publication date of the work itself.
    pub issued: Option<DateTime<Utc>>,
    /// Authors list.
    pub authors: Vec<String>,
    /// Full content/description, as HTML.
    pub content: Option<String>,
    /// Links associated with this entry.
    pub links: Vec<Link>,
    /// Categories/tags.
    pub categories: Vec<String>,
}

impl Entry {
    /// Build the entry for one book.
    pub fn for_book(book: &Book, base_url: &str) -> Self {
        let mut links = Vec::new();

        if book.epub_path().is_some() {
            links.push(Link {
                length: Some(book.size),
                mtime: book.last_modified,
                ..Link::new(
                    "http://opds-spec.org/acquisition",
                    format!("{}/get/epub/{}", base_url, book.id),
                    BookFormat::Epub.mime_type(),
                )
            });
        }

        if let Some(cover) = &book.cover {
            let image_type = image::ImageFormat::from_path(cover)
                .map(|f| f.to_mime_type())
                .unwrap_or("image/jpeg");
            let cover_href = format!("{}/get/cover/{}", base_url, book.id);
            let thumb_href = format!("{}/get/thumb/{}", base_url, book.id);

            links.push(Link::new("http://opds-spec.org/cover", &cover_href, image_type));
            links.push(Link::new("http://opds-spec.org/thumbnail", &thumb_href, "image/jpeg"));
            links.push(Link::new("http://opds-spec.org/image", &cover_href, image_type));
            links.push(Link::new(
                "http://opds-spec.org/image/thumbnail",
                &thumb_href,
                "image/jpeg",
            ));
        }

        let mut tags = book.tags.clone();
        tags.sort();
        let content = format!("TAGS: {}<br/>{}", tags.join(", "), book.comments);

        Self {
            id: format!("urn:uuid:{}", book.uuid),
            title: book.title.clone(),
            updated: book.last_modified.unwrap_or_else(Utc::now),
            published: book.timestamp,
            issued: book.pubdate,
            authors: book.authors.clone(),
            content: Some(content),
            links,
            categories: tags,
        }
    }
}

/// OPDS feed builder.
#[derive(Debug)]
pub struct FeedBuilder {
    id: String,
    title: String,
    updated: DateTime<Utc>,
    author_name: Option<String>,
    links: Vec<Link>,
    entries: Vec<Entry>,
}

impl FeedBuilder {
    /// Create a new feed builder.
    pub fn new(id: impl Into<String>, title: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            title: title.into(),
            updated: Utc::now(),
            author_name: None,
            links: Vec::new(),
            entries: Vec::new(),
        }
    }

    /// Override the feed's update time.
    pub fn updated(mut self, updated: DateTime<Utc>) -> Self {
        self.updated = updated;
        self
    }

    /// Set the feed author.
    pub fn author(mut self, name: impl Into<String>) -> Self {
        self.author_name = Some(name.into());
        self
    }

    /// Add a self link.
    pub fn self_link(mut self, href: impl Into<String>) -> Self {
        self.links.push(Link::new("self", href, OPDS_MIME));
        self
    }

    /// Add a start link.
    pub fn start_link(mut self, href: impl Into<String>) -> Self {
        self.links.push(Link::new("start", href, OPDS_MIME));
        self
    }

    /// Add a book entry.
    pub fn book_entry(mut self, book: &Book, base_url: &str) -> Self {
        self.entries.push(Entry::for_book(book, base_url));
        self
    }

    /// Build the XML feed.
    pub fn build(self) -> String {
        let mut writer = Writer::new(Cursor::new(Vec::new()));

        // XML declaration - writing to Vec can't fail
        let _ = writer.write_event(Event::Decl(BytesDecl::new("1.0", Some("UTF-8"), None)));

        let mut feed = BytesStart::new("feed");
        feed.push_attribute(("xmlns", "http://www.w3.org/2005/Atom"));
        feed.push_attribute(("xmlns:opds", "http://opds-spec.org/2010/catalog"));
        feed.push_attribute(("xmlns:dc", "http://purl.org/dc/terms/"));
        let _ = writer.write_event(Event::Start(feed));

        write_text_element(&mut writer, "id", &self.id);
        write_text_element(&mut writer, "title", &self.title);
        write_text_element(&mut writer, "updated", &rfc3339(&self.updated));

        if let Some(name) = &self.author_name {
            let _ = writer.write_event(Event::Start(BytesStart::new("author")));
            write_text_element(&mut writer, "name", name);
            let _ = writer.write_event(Event::End(BytesEnd::new("author")));
        }

        for link in &self.links {
            write_link(&mut writer, link);
        }

        for entry in &self.entries {
            write_entry(&mut writer, entry);
        }

        let _ = writer.write_event(Event::End(BytesEnd::new("feed")));

        String::from_utf8(writer.into_inner().into_inner()).unwrap_or_default()
    }
}

/// Build the acquisition feed listing every book.
pub fn catalog(books: &[Book], title: &str, base_url: &str) -> FeedBuilder {
    books.iter().fold(
        FeedBuilder::new("ficsync:all", title)
            .author("ficsync")
            .self_link(format!("{}/opds", base_url))
            .start_link(format!("{}/opds", base_url)),
        |feed, book| feed.book_entry(book, base_url),
    )
}

fn rfc3339(time: &DateTime<Utc>) -> String {
    time.to_rfc3339_opts(SecondsFormat::Secs, true)
}

/// Write a simple text element.
fn write_text_element<W: std::io::Write>(writer: &mut Writer<W>, name: &str, text: &str) {
    let _ = writer.write_event(Event::Start(BytesStart::new(name)));
    let _ = writer.write_event(Event::Text(BytesText::new(text)));
    let _ = writer.write_event(Event::End(BytesEnd::new(name)));
}

/// Write a link element.
fn write_link<W: std::io::Write>(writer: &mut Writer<W>, link: &Link) {
    let mut elem = BytesStart::new("link");
    elem.push_attribute(("rel", link.rel.as_str()));
    elem.push_attribute(("href", link.href.as_str()));
    elem.push_attribute(("type", link.link_type.as_str()));
    if let Some(length) = link.length {
        elem.push_attribute(("length", length.to_string().as_str()));
    }
    if let Some(mtime) = &link.mtime {
        elem.push_attribute(("mtime", rfc3339(mtime).as_str()));
    }
    let _ = writer.write_event(Event::Empty(elem));
}

/// Write an entry element.
fn write_entry<W: std::io::Write>(writer: &mut Writer<W>, entry: &Entry) {
    let _ = writer.write_event(Event::Start(BytesStart::new("entry")));

    write_text_element(writer, "id", &entry.id);
    write_text_element(writer, "title", &entry.title);
    write_text_element(writer, "updated", &rfc3339(&entry.updated));
    if let Some(published) = &entry.published {
        write_text_element(writer, "published", &rfc3339(published));
    }
    if let Some(issued) = &entry.issued {
        write_text_element(writer, "dc:date", &rfc3339(issued));
    }

    for author in &entry.authors {
        let _ = writer.write_event(Event::Start(BytesStart::new("author")));
        write_text_element(writer, "name", author);
        let _ = writer.write_event(Event::End(BytesEnd::new("author")));
    }

    if let Some(content) = &entry.content {
        let mut elem = BytesStart::new("content");
        elem.push_attribute(("type", "html"));
        let _ = writer.write_event(Event::Start(elem));
        let _ = writer.write_event(Event::Text(BytesText::new(content)));
        let _ = writer.write_event(Event::End(BytesEnd::new("content")));
    }

    for link in &entry.links {
        write_link(writer, link);
    }

    for category in &entry.categories {
        let mut elem = BytesStart::new("category");
        elem.push_attribute(("term", category.as_str()));
        elem.push_attribute(("label", category.as_str()));
        let _ = writer.write_event(Event::Empty(elem));
    }

    let _ = writer.write_event(Event::End(BytesEnd::new("entry")));
}
