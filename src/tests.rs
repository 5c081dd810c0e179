use crate::calibre::{self, CONFIG_DIR_ENV, Calibre, UpdateMetadata};
use crate::config::{BookFormat, Cli, Command, Config};
use crate::error::{AppError, Result};
use crate::library::{Book, timestamp};
use crate::opds;
use crate::process::{CommandRunner, Invocation};
use crate::scheduler::{BatchScheduler, BookProcessor, SnapshotSource};
use crate::server::{AppState, handlers};
use crate::updater::{FanFicFare, Outcome, SiteRegistry, SkipReason, UpdateProcessor, protocol};
use async_trait::async_trait;
use axum::extract::{Path as UrlPath, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use chrono::{TimeZone, Utc};
use clap::Parser;
use parking_lot::Mutex;
use serde_json::json;
use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Records every invocation and answers with scripted output.
struct FakeRunner {
    calls: Mutex<Vec<Invocation>>,
    responses: Mutex<VecDeque<Result<String>>>,
}

impl FakeRunner {
    fn with_responses(responses: impl IntoIterator<Item = Result<String>>) -> Arc<Self> {
        Arc::new(Self {
            calls: Mutex::new(Vec::new()),
            responses: Mutex::new(responses.into_iter().collect()),
        })
    }

    fn calls(&self) -> Vec<Invocation> {
        self.calls.lock().clone()
    }
}

#[async_trait]
impl CommandRunner for FakeRunner {
    async fn run(&self, invocation: &Invocation) -> Result<String> {
        self.calls.lock().push(invocation.clone());
        self.responses
            .lock()
            .pop_front()
            .unwrap_or_else(|| Ok(String::new()))
    }
}

fn command_failed(program: &str) -> AppError {
    AppError::Command {
        program: program.to_string(),
        message: "exit status: 1".to_string(),
    }
}

fn fake_calibre(responses: impl IntoIterator<Item = Result<String>>) -> (Arc<FakeRunner>, Calibre) {
    let runner = FakeRunner::with_responses(responses);
    let calibre = Calibre::new(runner.clone());
    (runner, calibre)
}

fn touch(path: &Path) {
    std::fs::create_dir_all(path.parent().unwrap()).unwrap();
    std::fs::write(path, b"data").unwrap();
}

fn story(id: i64, url: Option<&str>, epub: Option<PathBuf>) -> Book {
    let mut book = Book::new(id, format!("Story {}", id), "someone");
    if let Some(url) = url {
        book.identifiers.insert("url".to_string(), url.to_string());
    }
    book.formats.extend(epub);
    book
}

// Authors

#[test]
fn authors_bare_string() {
    let authors = calibre::decode_authors("Title", Some(json!("someone"))).unwrap();
    assert_eq!(authors, vec!["someone"]);
}

#[test]
fn authors_list() {
    let authors = calibre::decode_authors("Title", Some(json!(["one", "two"]))).unwrap();
    assert_eq!(authors, vec!["one", "two"]);
}

#[test]
fn authors_null_names_the_title() {
    let err = calibre::decode_authors("Some Title", Some(json!(null))).unwrap_err();
    assert!(matches!(err, AppError::Authors { .. }));
    assert_eq!(
        err.to_string(),
        "could not parse authors of Some Title: could not find authors"
    );
}

#[test]
fn authors_wrong_element_type() {
    let err = calibre::decode_authors("Title", Some(json!(["one", 2]))).unwrap_err();
    assert!(err.to_string().contains("invalid author (number) 2"));

    let err = calibre::decode_authors("Title", Some(json!({"name": "x"}))).unwrap_err();
    assert!(err.to_string().contains("invalid authors (object)"));
}

#[test]
fn authors_empty_list_rejected() {
    assert!(calibre::decode_authors("Title", Some(json!([]))).is_err());
}

// Paths

#[test]
fn resolve_path_matches_suffix_under_new_root() {
    let root = tempfile::tempdir().unwrap();
    let expected = root.path().join("Author/Story (1)/Story.epub");
    touch(&expected);

    let found = calibre::resolve_path(
        Path::new("/old/library/Author/Story (1)/Story.epub"),
        root.path(),
    );
    assert_eq!(found, Some(expected));
}

#[test]
fn resolve_path_skips_directories() {
    let root = tempfile::tempdir().unwrap();
    std::fs::create_dir_all(root.path().join("cover.jpg")).unwrap();
    let expected = root.path().join("Author/cover.jpg");
    touch(&expected);

    let found = calibre::resolve_path(Path::new("/old/Author/cover.jpg"), root.path());
    assert_eq!(found, Some(expected));
}

#[test]
fn resolve_path_no_match() {
    let root = tempfile::tempdir().unwrap();
    assert_eq!(
        calibre::resolve_path(Path::new("/old/Author/missing.epub"), root.path()),
        None
    );
}

#[test]
fn resolve_path_cleans_parent_segments() {
    let root = tempfile::tempdir().unwrap();
    let expected = root.path().join("Author/Story/Story.epub");
    touch(&expected);

    let found = calibre::resolve_path(
        Path::new("/old/Author/Extra/../Story/Story.epub"),
        root.path(),
    );
    assert_eq!(found, Some(expected));
}

#[test]
fn clean_path_resolves_lexically() {
    assert_eq!(
        calibre::clean_path("/path//to/settings/../library/directory"),
        PathBuf::from("/path/to/library/directory")
    );
    assert_eq!(calibre::clean_path("/a/./b/"), PathBuf::from("/a/b"));
}

// Calibre commands

#[tokio::test]
async fn find_paths_asks_calibre() {
    let (runner, mut calibre) = fake_calibre([
        Ok("/config\n".to_string()),
        Ok("  /path//to/settings/../library/directory  \n".to_string()),
    ]);

    calibre.find_paths().await.unwrap();

    assert_eq!(calibre.settings, Some(PathBuf::from("/config")));
    assert_eq!(
        calibre.library,
        Some(PathBuf::from("/path/to/library/directory"))
    );

    let calls = runner.calls();
    assert_eq!(calls.len(), 2);
    assert!(calls.iter().all(|c| c.program == "calibre-debug"));
    assert_eq!(calls[0].args[0], "--command");
    assert!(calls[0].envs.is_empty());
    assert_eq!(
        calls[1].envs,
        vec![(CONFIG_DIR_ENV.to_string(), "/config".to_string())]
    );
}

#[tokio::test]
async fn find_paths_keeps_known_paths() {
    let (runner, calibre) = fake_calibre([]);
    let mut calibre = calibre.with_settings("/config").with_library("/books");

    calibre.find_paths().await.unwrap();

    assert!(runner.calls().is_empty());
    assert_eq!(calibre.library, Some(PathBuf::from("/books")));
}

#[tokio::test]
async fn find_paths_failure() {
    let (_, mut calibre) = fake_calibre([Err(command_failed("calibre-debug"))]);

    let err = calibre.find_paths().await.unwrap_err();
    assert!(matches!(err, AppError::Config(_)));
    assert!(err.to_string().contains("could not find settings path"));
}

#[tokio::test]
async fn list_books_reads_snapshot() {
    let root = tempfile::tempdir().unwrap();
    let epub = root.path().join("someone/Story (7)/Story - someone.epub");
    touch(&epub);

    let listing = json!([{
        "id": 7,
        "uuid": "0b7c4e1a",
        "title": "Story",
        "authors": "someone",
        "author_sort": "someone",
        "identifiers": {"url": "https://www.alpha.com/s/1"},
        "formats": ["/calibre/someone/Story (7)/Story - someone.epub"],
        "cover": "/calibre/someone/Story (7)/cover.jpg",
        "publisher": null,
        "series": "",
        "timestamp": "2020-01-02T03:04:05+00:00",
        "pubdate": "0101-01-01T00:00:00+00:00",
        "last_modified": "2021-06-07T08:09:10.750000+00:00",
        "tags": ["fic"],
        "comments": null,
        "languages": ["eng"],
        "size": 1234
    }]);

    let (runner, calibre) = fake_calibre([Ok(listing.to_string())]);
    let calibre = calibre.with_settings("/config").with_library(root.path());

    let books = calibre.list_books().await.unwrap();
    assert_eq!(books.len(), 1);

    let book = &books[0];
    assert_eq!(book.id, 7);
    assert_eq!(book.authors, vec!["someone"]);
    assert_eq!(book.formats, vec![epub.clone()]);
    assert_eq!(book.epub_path(), Some(epub.as_path()));
    assert_eq!(book.cover, None);
    assert_eq!(book.publisher, None);
    assert_eq!(book.series, None);
    assert_eq!(book.comments, "");
    assert_eq!(
        book.source_url().map(|u| u.to_string()),
        Some("https://www.alpha.com/s/1".to_string())
    );
    assert_eq!(
        book.last_modified,
        Some(Utc.with_ymd_and_hms(2021, 6, 7, 8, 9, 11).unwrap())
    );

    let library_arg = format!("--library-path={}", root.path().display());
    let calls = runner.calls();
    assert_eq!(
        calls[0].argv(),
        vec![
            "calibredb",
            library_arg.as_str(),
            "list",
            "--for-machine",
            "--fields=all"
        ]
    );
    assert_eq!(
        calls[0].envs,
        vec![(CONFIG_DIR_ENV.to_string(), "/config".to_string())]
    );
}

#[tokio::test]
async fn list_books_rejects_missing_authors() {
    let listing = json!([{"id": 1, "title": "Broken", "authors": null}]);
    let (_, calibre) = fake_calibre([Ok(listing.to_string())]);

    let err = calibre.list_books().await.unwrap_err();
    assert!(err.to_string().contains("Broken"));
}

#[tokio::test]
async fn update_book_writes_fields_in_order() {
    let (runner, calibre) = fake_calibre([]);
    let meta = UpdateMetadata {
        authors: vec!["foo".to_string(), "bar".to_string()],
        comments: "some comment".to_string(),
        published: Some(Utc.with_ymd_and_hms(2006, 1, 2, 15, 4, 5).unwrap()),
        publisher: "hydraulic press".to_string(),
        series: "112358".to_string(),
        timestamp: Some(Utc.with_ymd_and_hms(1234, 5, 6, 7, 8, 9).unwrap()),
    };

    calibre.update_book(42, &meta).await.unwrap();

    let calls = runner.calls();
    assert_eq!(
        calls[0].argv(),
        vec![
            "calibredb",
            "set_metadata",
            "--field=authors:foo,bar",
            "--field=comments:some comment",
            "--field=pubdate:2006-01-02T15:04:05Z",
            "--field=publisher:hydraulic press",
            "--field=series:112358",
            "--field=timestamp:1234-05-06T07:08:09Z",
            "42",
        ]
    );
}

#[tokio::test]
async fn update_book_with_empty_metadata() {
    let (runner, calibre) = fake_calibre([]);
    let meta = UpdateMetadata::default();
    assert!(meta.is_empty());

    calibre.update_book(42, &meta).await.unwrap();
    assert_eq!(runner.calls()[0].argv(), vec!["calibredb", "set_metadata", "42"]);
}

#[tokio::test]
async fn update_book_wraps_failure() {
    let (_, calibre) = fake_calibre([Err(command_failed("calibredb"))]);

    let err = calibre
        .update_book(42, &UpdateMetadata::default())
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::UpdateBook { id: 42, .. }));
    assert_eq!(
        err.to_string(),
        "could not update database for book #42: `calibredb` failed: exit status: 1"
    );
}

// Sites

const SITES_LISTING: &str = "\
alpha.com
\tExample URLs:
\t\t* https://alpha.com/s/1234/1/
beta.co.uk
\tExample URLs:
\t\t* https://www.beta.co.uk/story.php?sid=1
\t\t* http://archive.beta.co.uk/story.php?sid=1
gamma.org
\tExample URLs:
\t\t* https://gamma.org/works/1
\t\t* not a url at all
\t\t* https://127.0.0.1/works/1
";

#[test]
fn sites_from_listing() {
    let sites = SiteRegistry::from_listing(SITES_LISTING);
    assert_eq!(sites.sorted(), vec!["alpha.com", "beta.co.uk", "gamma.org"]);
    assert!(sites.is_supported("beta.co.uk"));
    assert!(!sites.is_supported("www.beta.co.uk"));
}

#[test]
fn registrable_domain_of_hosts() {
    use crate::updater::registrable_domain;
    assert_eq!(registrable_domain("www.Alpha.com."), Some("alpha.com".to_string()));
    assert_eq!(
        registrable_domain("archive.beta.co.uk"),
        Some("beta.co.uk".to_string())
    );
    assert_eq!(registrable_domain("co.uk"), None);
}

#[tokio::test]
async fn sites_discovery_runs_plugin() {
    let (runner, calibre) = fake_calibre([Ok(SITES_LISTING.to_string())]);
    let fanficfare = FanFicFare::new(Arc::new(calibre.with_library("/books")));

    let sites = SiteRegistry::discover(&fanficfare).await.unwrap();
    assert_eq!(sites.len(), 3);
    assert_eq!(
        runner.calls()[0].argv(),
        vec![
            "calibre-debug",
            "--run-plugin=FanFicFare",
            "--",
            "--non-interactive",
            "--library-path=/books",
            "--sites-list"
        ]
    );
}

#[tokio::test]
async fn sites_discovery_failure() {
    let (_, calibre) = fake_calibre([Err(command_failed("calibre-debug"))]);
    let fanficfare = FanFicFare::new(Arc::new(calibre));

    assert!(matches!(
        SiteRegistry::discover(&fanficfare).await,
        Err(AppError::Command { .. })
    ));
}

// Updater protocol

#[test]
fn protocol_without_sentinel() {
    let output = protocol::parse("Not updating Story\r\n{\r\n}\r\n", "story.epub").unwrap();
    assert_eq!(output.message, "Not updating Story");
    assert!(!output.is_updating());
}

#[test]
fn protocol_with_sentinel_and_payload() {
    let stdout = "Updating Story\nDo update - Story\n{\n\"author\": \"someone\",\n\"numChapters\": 12,\n\"datePublished\": \"2006-01-02 15:04:05\",\n\"series\": null\n}\n";
    let output = protocol::parse(stdout, "story.epub").unwrap();
    assert!(output.is_updating());

    let meta = output.decode().unwrap();
    assert_eq!(meta.author, "someone");
    assert_eq!(meta.num_chapters, "12");
    assert_eq!(meta.series, "");
    assert_eq!(
        meta.published,
        Some(Utc.with_ymd_and_hms(2006, 1, 2, 15, 4, 5).unwrap())
    );

    let update = meta.to_update();
    assert_eq!(update.authors, vec!["someone"]);
    assert_eq!(update.to_arguments(), vec![
        "--field=authors:someone".to_string(),
        "--field=pubdate:2006-01-02T15:04:05Z".to_string(),
    ]);
}

#[test]
fn protocol_missing_delimiter() {
    let err = protocol::parse("Story is up to date.\n", "story.epub").unwrap_err();
    assert_eq!(
        err.to_string(),
        "could not read JSON output when updating story.epub"
    );
    match err {
        AppError::Protocol { output, .. } => assert_eq!(output, "Story is up to date.\n"),
        other => panic!("unexpected error: {}", other),
    }
}

#[test]
fn protocol_bad_payload() {
    let output = protocol::parse("Do update - Story\n{\nnot json", "story.epub").unwrap();
    match output.decode().unwrap_err() {
        AppError::Metadata { payload, .. } => assert_eq!(payload, "{not json"),
        other => panic!("unexpected error: {}", other),
    }
}

#[test]
fn protocol_chapter_tuples() {
    let stdout = "Do update - Story\n{\n\"zchapters\": [[1, {\"title\": \"One\", \"date\": \"2020-01-02\"}], [2, {\"title\": \"Two\", \"words\": 3100}]]}";
    let meta = protocol::parse(stdout, "story.epub")
        .unwrap()
        .decode()
        .unwrap();

    assert_eq!(meta.chapters.len(), 2);
    assert_eq!(meta.chapters[0].number, 1);
    assert_eq!(
        meta.chapters[0].detail.date,
        Some(Utc.with_ymd_and_hms(2020, 1, 2, 0, 0, 0).unwrap())
    );
    assert_eq!(meta.chapters[1].detail.title, "Two");
    assert_eq!(meta.chapters[1].detail.words, "3100");
}

// Update processor

struct ProcessorFixture {
    runner: Arc<FakeRunner>,
    processor: UpdateProcessor,
    _dir: tempfile::TempDir,
    epub: PathBuf,
}

fn processor_fixture(responses: impl IntoIterator<Item = Result<String>>) -> ProcessorFixture {
    let dir = tempfile::tempdir().unwrap();
    let epub = dir.path().join("Story.epub");
    touch(&epub);

    let (runner, calibre) = fake_calibre(responses);
    let fanficfare = FanFicFare::new(Arc::new(calibre));
    let sites = Arc::new(SiteRegistry::new(["alpha.com"]));

    ProcessorFixture {
        runner,
        processor: UpdateProcessor::new(fanficfare, sites),
        _dir: dir,
        epub,
    }
}

#[tokio::test]
async fn processor_skips_book_without_url() {
    let fx = processor_fixture([]);
    let book = story(1, None, Some(fx.epub.clone()));

    let outcome = fx.processor.process(&book).await.unwrap();
    assert_eq!(outcome, Outcome::Skipped(SkipReason::NoUrl));
    assert!(fx.runner.calls().is_empty());
}

#[tokio::test]
async fn processor_rejects_host_without_domain() {
    let fx = processor_fixture([]);
    let book = story(1, Some("http://127.0.0.1/s/1"), Some(fx.epub.clone()));

    assert!(matches!(
        fx.processor.process(&book).await,
        Err(AppError::InvalidFormat(_))
    ));
    assert!(fx.runner.calls().is_empty());
}

#[tokio::test]
async fn processor_skips_unsupported_site() {
    let fx = processor_fixture([]);
    let book = story(1, Some("https://www.delta.net/s/1"), Some(fx.epub.clone()));

    let outcome = fx.processor.process(&book).await.unwrap();
    assert_eq!(outcome, Outcome::Skipped(SkipReason::Unsupported));
    assert!(fx.runner.calls().is_empty());
}

#[tokio::test]
async fn processor_no_update() {
    let fx = processor_fixture([Ok("Not updating Story 1\n{\n}\n".to_string())]);
    let book = story(1, Some("https://www.alpha.com/s/1"), Some(fx.epub.clone()));

    let outcome = fx.processor.process(&book).await.unwrap();
    assert_eq!(outcome, Outcome::NoUpdate);

    let calls = fx.runner.calls();
    assert_eq!(calls.len(), 1);
    assert_eq!(
        &calls[0].args[..5],
        &[
            "--run-plugin=FanFicFare",
            "--",
            "--non-interactive",
            "--json-meta",
            "--update-epub"
        ]
    );

    // Worked on a temporary copy, which is gone again.
    let work = PathBuf::from(&calls[0].args[5]);
    assert_ne!(work, fx.epub);
    assert!(work.to_string_lossy().ends_with(".epub"));
    assert!(!work.exists());
}

#[tokio::test]
async fn processor_update_writes_back() {
    let fx = processor_fixture([
        Ok("Do update - Story 7\n{\n\"author\": \"someone\"}".to_string()),
        Ok(String::new()),
    ]);
    let book = story(7, Some("https://www.alpha.com/s/7"), Some(fx.epub.clone()));

    let outcome = fx.processor.process(&book).await.unwrap();
    assert_eq!(outcome, Outcome::Updated);

    let calls = fx.runner.calls();
    assert_eq!(calls.len(), 2);
    assert_eq!(
        calls[1].argv(),
        vec!["calibredb", "set_metadata", "--field=authors:someone", "7"]
    );
}

#[tokio::test]
async fn processor_write_back_failure() {
    let fx = processor_fixture([
        Ok("Do update - Story 7\n{\n\"author\": \"someone\"}".to_string()),
        Err(command_failed("calibredb")),
    ]);
    let book = story(7, Some("https://www.alpha.com/s/7"), Some(fx.epub.clone()));

    assert!(matches!(
        fx.processor.process(&book).await,
        Err(AppError::UpdateBook { id: 7, .. })
    ));
}

#[tokio::test]
async fn processor_protocol_error() {
    let fx = processor_fixture([Ok("Traceback (most recent call last):\n".to_string())]);
    let book = story(1, Some("https://www.alpha.com/s/1"), Some(fx.epub.clone()));

    assert!(matches!(
        fx.processor.process(&book).await,
        Err(AppError::Protocol { .. })
    ));
}

#[tokio::test]
async fn processor_requires_epub() {
    let fx = processor_fixture([]);
    let book = story(1, Some("https://www.alpha.com/s/1"), None);

    assert!(matches!(
        fx.processor.process(&book).await,
        Err(AppError::NotFound(_))
    ));
}

// Scheduler

/// Returns the same books on every call.
struct Snapshots {
    books: Vec<Book>,
    reads: AtomicUsize,
}

impl Snapshots {
    fn of(ids: impl IntoIterator<Item = i64>) -> Arc<Self> {
        Arc::new(Self {
            books: ids.into_iter().map(|id| story(id, None, None)).collect(),
            reads: AtomicUsize::new(0),
        })
    }
}

#[async_trait]
impl SnapshotSource for Snapshots {
    async fn list_books(&self) -> Result<Vec<Book>> {
        self.reads.fetch_add(1, Ordering::SeqCst);
        Ok(self.books.clone())
    }
}

struct BrokenSource;

#[async_trait]
impl SnapshotSource for BrokenSource {
    async fn list_books(&self) -> Result<Vec<Book>> {
        Err(command_failed("calibredb"))
    }
}

/// Remembers which books it saw; fails on `fail_on`.
#[derive(Default)]
struct Recorder {
    seen: Mutex<Vec<i64>>,
    fail_on: Option<i64>,
}

#[async_trait]
impl BookProcessor for Recorder {
    async fn process(&self, book: &Book) -> Result<Outcome> {
        self.seen.lock().push(book.id);
        if Some(book.id) == self.fail_on {
            return Err(AppError::Internal("boom".to_string()));
        }
        Ok(Outcome::NoUpdate)
    }
}

const HOUR: Duration = Duration::from_secs(60 * 60);

#[tokio::test(start_paused = true)]
async fn scheduler_cuts_batches_across_snapshots() {
    let source = Snapshots::of(1..=5);
    let recorder = Arc::new(Recorder::default());
    let token = CancellationToken::new();

    let scheduler = BatchScheduler::new(2, HOUR);
    let handle = tokio::spawn({
        let (source, recorder, token) = (source.clone(), recorder.clone(), token.clone());
        async move { scheduler.run(source, recorder, token).await }
    });

    tokio::time::sleep(3 * HOUR + Duration::from_secs(60)).await;
    assert_eq!(*recorder.seen.lock(), vec![1, 2, 3, 4, 5, 1]);

    token.cancel();
    tokio_test::assert_ok!(handle.await.unwrap());
    assert!(source.reads.load(Ordering::SeqCst) >= 2);
}

#[tokio::test(start_paused = true)]
async fn scheduler_whole_library_per_cycle() {
    let source = Snapshots::of([1, 2, 3]);
    let recorder = Arc::new(Recorder {
        fail_on: Some(2),
        ..Default::default()
    });
    let token = CancellationToken::new();

    let handle = tokio::spawn({
        let (recorder, token) = (recorder.clone(), token.clone());
        async move { BatchScheduler::new(0, HOUR).run(source, recorder, token).await }
    });

    // Nothing happens before the first interval has passed.
    tokio::time::sleep(HOUR / 2).await;
    assert!(recorder.seen.lock().is_empty());

    tokio::time::sleep(HOUR).await;
    assert_eq!(*recorder.seen.lock(), vec![1, 2, 3]);

    token.cancel();
    tokio_test::assert_ok!(handle.await.unwrap());
}

/// One book per snapshot, its id the minute the snapshot was read.
struct Stamped {
    start: tokio::time::Instant,
    reads: AtomicUsize,
}

#[async_trait]
impl SnapshotSource for Stamped {
    async fn list_books(&self) -> Result<Vec<Book>> {
        self.reads.fetch_add(1, Ordering::SeqCst);
        let minute = self.start.elapsed().as_secs() / 60;
        Ok(vec![story(minute as i64, None, None)])
    }
}

#[tokio::test(start_paused = true)]
async fn scheduler_reads_library_after_each_handoff() {
    let source = Arc::new(Stamped {
        start: tokio::time::Instant::now(),
        reads: AtomicUsize::new(0),
    });
    let recorder = Arc::new(Recorder::default());
    let token = CancellationToken::new();

    let handle = tokio::spawn({
        let (source, recorder, token) = (source.clone(), recorder.clone(), token.clone());
        async move { BatchScheduler::new(0, HOUR).run(source, recorder, token).await }
    });

    tokio::time::sleep(HOUR / 2).await;
    assert_eq!(source.reads.load(Ordering::SeqCst), 1);

    tokio::time::sleep(2 * HOUR).await;
    // The second cycle works on the snapshot read when the first one woke.
    assert_eq!(*recorder.seen.lock(), vec![0, 60]);

    token.cancel();
    tokio_test::assert_ok!(handle.await.unwrap());
}

#[tokio::test(start_paused = true)]
async fn scheduler_stops_while_waiting() {
    let recorder = Arc::new(Recorder::default());
    let token = CancellationToken::new();

    let handle = tokio::spawn({
        let (recorder, token) = (recorder.clone(), token.clone());
        async move {
            BatchScheduler::new(0, HOUR)
                .run(Snapshots::of([1]), recorder, token)
                .await
        }
    });

    // First batch is queued; the producer is waiting for the slot to free up.
    tokio::time::sleep(Duration::from_secs(600)).await;
    token.cancel();

    let joined = tokio::time::timeout(Duration::from_secs(5), handle)
        .await
        .expect("scheduler did not stop");
    tokio_test::assert_ok!(joined.unwrap());
    assert!(recorder.seen.lock().is_empty());
}

#[tokio::test(start_paused = true)]
async fn scheduler_source_failure_is_fatal() {
    let token = CancellationToken::new();
    let result = BatchScheduler::new(0, HOUR)
        .run(
            Arc::new(BrokenSource),
            Arc::new(Recorder::default()),
            token.clone(),
        )
        .await;

    assert!(matches!(result, Err(AppError::Command { .. })));
    assert!(token.is_cancelled());
}

// OPDS

fn catalog_book() -> Book {
    let mut book = story(7, Some("https://www.alpha.com/s/7"), None);
    book.uuid = "0b7c4e1a".to_string();
    book.formats = vec![PathBuf::from("/books/Story 7.epub")];
    book.cover = Some(PathBuf::from("/books/cover.png"));
    book.tags = vec!["b".to_string(), "a".to_string()];
    book.comments = "<p>Hi</p>".to_string();
    book.size = 1234;
    book.timestamp = Some(Utc.with_ymd_and_hms(2020, 1, 2, 3, 4, 5).unwrap());
    book.last_modified = Some(Utc.with_ymd_and_hms(2021, 6, 7, 8, 9, 10).unwrap());
    book
}

#[test]
fn opds_feed_entry_content() {
    let feed = opds::catalog(&[catalog_book()], "Fics", "")
        .updated(Utc.with_ymd_and_hms(2022, 1, 1, 0, 0, 0).unwrap())
        .build();

    assert!(feed.contains("<title>Fics</title>"));
    assert!(feed.contains("<updated>2022-01-01T00:00:00Z</updated>"));
    assert!(feed.contains("<id>urn:uuid:0b7c4e1a</id>"));
    assert!(feed.contains("<updated>2021-06-07T08:09:10Z</updated>"));
    assert!(feed.contains("<published>2020-01-02T03:04:05Z</published>"));
    assert!(feed.contains("<name>someone</name>"));
    assert!(feed.contains(
        r#"rel="http://opds-spec.org/acquisition" href="/get/epub/7" type="application/epub+zip" length="1234" mtime="2021-06-07T08:09:10Z""#
    ));
    assert!(feed.contains(r#"rel="http://opds-spec.org/image" href="/get/cover/7" type="image/png""#));
    assert!(feed.contains(
        r#"rel="http://opds-spec.org/image/thumbnail" href="/get/thumb/7" type="image/jpeg""#
    ));
    assert!(feed.contains("TAGS: a, b&lt;br/&gt;&lt;p&gt;Hi&lt;/p&gt;"));
}

#[test]
fn opds_entry_without_files() {
    let mut book = catalog_book();
    book.formats.clear();
    book.cover = None;

    let entry = opds::Entry::for_book(&book, "");
    assert!(entry.links.is_empty());
    assert_eq!(entry.categories, vec!["a", "b"]);
}

// HTTP

fn state_with(books: Vec<Book>) -> AppState {
    let (_, calibre) = fake_calibre([]);
    let state = AppState::new(Config::default(), Arc::new(calibre));
    state.replace_books(books);
    state
}

#[tokio::test]
async fn http_rejects_bad_ids() {
    let state = state_with(vec![story(1, None, None)]);

    let response = handlers::book_download(State(state.clone()), UrlPath("abc".to_string()))
        .await
        .into_response();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);

    let response = handlers::book_download(State(state.clone()), UrlPath("99".to_string()))
        .await
        .into_response();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);

    // Known book without an epub or cover.
    let response = handlers::book_download(State(state.clone()), UrlPath("1".to_string()))
        .await
        .into_response();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);

    let response = handlers::book_cover(State(state), UrlPath("1".to_string()))
        .await
        .into_response();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn http_serves_epub() {
    let dir = tempfile::tempdir().unwrap();
    let epub = dir.path().join("Story 1.epub");
    touch(&epub);

    let state = state_with(vec![story(1, None, Some(epub))]);
    let response = handlers::book_download(State(state), UrlPath("1".to_string()))
        .await
        .into_response();

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        response.headers()["content-type"],
        BookFormat::Epub.mime_type()
    );
    let body = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    assert_eq!(&body[..], b"data");
}

#[tokio::test]
async fn http_catalog_lists_snapshot() {
    let state = state_with(vec![catalog_book()]);
    let response = handlers::catalog(State(state)).await.into_response();

    assert_eq!(response.headers()["content-type"], opds::OPDS_MIME);
    let body = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let feed = String::from_utf8_lossy(&body);
    assert!(feed.contains("urn:uuid:0b7c4e1a"));
    assert!(feed.contains(r#"href="/get/epub/7""#));
    assert!(feed.contains(r#"href="/opds""#));
}

#[test]
fn thumbnail_fits_box() {
    let image = image::RgbImage::from_pixel(200, 100, image::Rgb([200, 10, 10]));
    let mut png = Vec::new();
    image
        .write_to(&mut std::io::Cursor::new(&mut png), image::ImageFormat::Png)
        .unwrap();

    let thumb = handlers::make_thumbnail(&png, 60, 80).unwrap();
    let decoded = image::load_from_memory(&thumb).unwrap();
    assert_eq!((decoded.width(), decoded.height()), (60, 30));
    assert_eq!(
        image::guess_format(&thumb).unwrap(),
        image::ImageFormat::Jpeg
    );
}

// Timestamps

#[test]
fn timestamp_layouts() {
    let expected = Utc.with_ymd_and_hms(2006, 1, 2, 15, 4, 5).unwrap();

    assert_eq!(timestamp::parse("2006-01-02T15:04:05Z"), Some(expected));
    assert_eq!(timestamp::parse("2006-01-02T08:04:05-07:00"), Some(expected));
    assert_eq!(timestamp::parse("2006-01-02 15:04:05"), Some(expected));
    assert_eq!(
        timestamp::parse("Mon Jan 02 08:04:05 -0700 2006"),
        Some(expected)
    );
    assert_eq!(
        timestamp::parse("Mon, 02 Jan 2006 08:04:05 -0700"),
        Some(expected)
    );
    assert_eq!(
        timestamp::parse("2006-01-02"),
        Some(Utc.with_ymd_and_hms(2006, 1, 2, 0, 0, 0).unwrap())
    );
    assert_eq!(timestamp::parse("sometime last week"), None);
}

#[test]
fn timestamp_rounds_to_seconds() {
    assert_eq!(
        timestamp::parse("2006-01-02T15:04:05.6Z"),
        Some(Utc.with_ymd_and_hms(2006, 1, 2, 15, 4, 6).unwrap())
    );
}

// Config

#[test]
fn config_parse_toml() {
    let toml = r#"
[server]
bind = "127.0.0.1:9090"
title = "Fics"

[calibre]
library = "/books"
calibredb = "/opt/calibre/calibredb"

[update]
interval = "30m"
batch_size = 5
"#;
    let config: Config = toml::from_str(toml).unwrap();
    assert_eq!(config.server.bind.port(), 9090);
    assert_eq!(config.server.title, "Fics");
    assert_eq!(config.server.thumbnail_width, 60);
    assert_eq!(config.calibre.library, Some(PathBuf::from("/books")));
    assert_eq!(config.calibre.settings, None);
    assert_eq!(config.calibre.calibre_debug, "calibre-debug");
    assert_eq!(config.update.interval, Duration::from_secs(30 * 60));
    assert_eq!(config.update.batch_size, 5);
}

#[test]
fn config_default_values() {
    let config = Config::default();
    assert_eq!(config.server.bind.port(), 8080);
    assert_eq!(
        (config.server.thumbnail_width, config.server.thumbnail_height),
        (60, 80)
    );
    assert_eq!(config.update.interval, 8 * HOUR);
    assert_eq!(config.update.batch_size, 0);

    let generated: Config = toml::from_str(&Config::generate_default()).unwrap();
    assert_eq!(generated.update.interval, config.update.interval);
}

#[test]
fn cli_verbosity_and_serve_flags() {
    assert_eq!(Cli::parse_from(["ficsync"]).log_level(), tracing::Level::INFO);
    assert_eq!(Cli::parse_from(["ficsync", "-v"]).log_level(), tracing::Level::DEBUG);
    assert_eq!(Cli::parse_from(["ficsync", "-qqq"]).log_level(), tracing::Level::ERROR);

    let cli = Cli::parse_from(["ficsync", "serve", "-b", "3", "-i", "90m"]);
    let Some(Command::Serve(args)) = cli.command else {
        panic!("expected serve");
    };

    let mut config = Config::default();
    args.apply(&mut config);
    assert_eq!(config.update.batch_size, 3);
    assert_eq!(config.update.interval, Duration::from_secs(90 * 60));
}

#[test]
fn book_format_from_extension() {
    assert_eq!(BookFormat::from_extension("epub"), Some(BookFormat::Epub));
    assert_eq!(BookFormat::from_extension("PDF"), Some(BookFormat::Pdf));
    assert_eq!(BookFormat::from_extension("azw3"), Some(BookFormat::Azw3));
    assert_eq!(BookFormat::from_extension("unknown"), None);
}
