use clap::{ArgAction, Args, Parser, Subcommand};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

/// Keep a Calibre library in sync with its web sources and serve it over OPDS.
#[derive(Parser, Debug, Clone)]
#[command(name = "ficsync")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Path to config file.
    #[arg(short, long, env = "FICSYNC_CONFIG", global = true)]
    pub config: Option<PathBuf>,

    /// Produce more detailed messages (repeatable).
    #[arg(short, long, action = ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Produce fewer messages (repeatable).
    #[arg(short, long, action = ArgAction::Count, global = true)]
    pub quiet: u8,

    /// Subcommand to run.
    #[command(subcommand)]
    pub command: Option<Command>,
}

impl Cli {
    /// Default log level after applying `-v` and `-q`.
    pub fn log_level(&self) -> tracing::Level {
        const LEVELS: [tracing::Level; 5] = [
            tracing::Level::ERROR,
            tracing::Level::WARN,
            tracing::Level::INFO,
            tracing::Level::DEBUG,
            tracing::Level::TRACE,
        ];
        let index = (2 + i32::from(self.verbose) - i32::from(self.quiet)).clamp(0, 4);
        LEVELS[index as usize]
    }
}

/// CLI subcommands.
#[derive(Subcommand, Debug, Clone)]
pub enum Command {
    /// Serve the catalog and keep the library updated (default).
    Serve(ServeArgs),

    /// Print the sites the updater supports.
    Sites(CalibreArgs),

    /// Print the books in the library.
    List(CalibreArgs),

    /// Create a default config file.
    Init {
        /// Force overwrite existing config.
        #[arg(short, long)]
        force: bool,
    },
}

/// Where to find Calibre.
#[derive(Args, Debug, Clone, Default)]
pub struct CalibreArgs {
    /// Path to Calibre settings directory.
    #[arg(short, long, value_parser = existing_dir)]
    pub settings: Option<PathBuf>,

    /// Path to Calibre library directory.
    #[arg(short, long, value_parser = existing_dir)]
    pub library: Option<PathBuf>,
}

/// Options for `serve`.
#[derive(Args, Debug, Clone, Default)]
pub struct ServeArgs {
    /// Calibre locations.
    #[command(flatten)]
    pub calibre: CalibreArgs,

    /// Update in chunks with the given chunk size (0 for whole library).
    #[arg(short, long)]
    pub batch_size: Option<usize>,

    /// Interval between successive updates, e.g. "8h" or "30m".
    #[arg(short = 'i', long, value_parser = humantime::parse_duration)]
    pub update_interval: Option<Duration>,

    /// Address to bind the server to.
    #[arg(long)]
    pub bind: Option<SocketAddr>,
}

/// Accept only paths to existing directories, made absolute.
fn existing_dir(input: &str) -> Result<PathBuf, String> {
    let path = std::path::absolute(input).map_err(|e| e.to_string())?;
    if !path.is_dir() {
        return Err(format!("{} is not a directory", path.display()));
    }
    Ok(path)
}

/// Main configuration from TOML file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Server configuration.
    #[serde(default)]
    pub server: ServerConfig,

    /// Calibre configuration.
    #[serde(default)]
    pub calibre: CalibreConfig,

    /// Update scheduling.
    #[serde(default)]
    pub update: UpdateConfig,
}

/// Server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Address to bind to.
    #[serde(default = "default_bind")]
    pub bind: SocketAddr,

    /// Catalog title.
    #[serde(default = "default_title")]
    pub title: String,

    /// Thumbnail bounding box width in pixels.
    #[serde(default = "default_thumbnail_width")]
    pub thumbnail_width: u32,

    /// Thumbnail bounding box height in pixels.
    #[serde(default = "default_thumbnail_height")]
    pub thumbnail_height: u32,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            title: default_title(),
            thumbnail_width: default_thumbnail_width(),
            thumbnail_height: default_thumbnail_height(),
        }
    }
}

fn default_bind() -> SocketAddr {
    SocketAddr::new(
        std::net::IpAddr::V4(std::net::Ipv4Addr::new(0, 0, 0, 0)),
        8080,
    )
}

fn default_title() -> String {
    "Library".to_string()
}

fn default_thumbnail_width() -> u32 {
    60
}

fn default_thumbnail_height() -> u32 {
    80
}

/// Calibre configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CalibreConfig {
    /// Settings directory; asked from Calibre when unset.
    #[serde(default)]
    pub settings: Option<PathBuf>,

    /// Library directory; asked from Calibre when unset.
    #[serde(default)]
    pub library: Option<PathBuf>,

    /// `calibredb` executable.
    #[serde(default = "default_calibredb")]
    pub calibredb: String,

    /// `calibre-debug` executable.
    #[serde(default = "default_calibre_debug")]
    pub calibre_debug: String,
}

impl Default for CalibreConfig {
    fn default() -> Self {
        Self {
            settings: None,
            library: None,
            calibredb: default_calibredb(),
            calibre_debug: default_calibre_debug(),
        }
    }
}

fn default_calibredb() -> String {
    "calibredb".to_string()
}

fn default_calibre_debug() -> String {
    "calibre-debug".to_string()
}

/// Update scheduling configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpdateConfig {
    /// Time between update cycles.
    #[serde(
        default = "default_interval",
        serialize_with = "serialize_duration",
        deserialize_with = "deserialize_duration"
    )]
    pub interval: Duration,

    /// Books per cycle (0 for the whole library).
    #[serde(default)]
    pub batch_size: usize,
}

impl Default for UpdateConfig {
    fn default() -> Self {
        Self {
            interval: default_interval(),
            batch_size: 0,
        }
    }
}

fn default_interval() -> Duration {
    crate::scheduler::DEFAULT_INTERVAL
}

fn serialize_duration<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_str(&humantime::format_duration(*value).to_string())
}

fn deserialize_duration<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
    let text = String::deserialize(deserializer)?;
    humantime::parse_duration(&text).map_err(serde::de::Error::custom)
}

impl CalibreArgs {
    /// Override config values with CLI flags.
    pub fn apply(&self, config: &mut CalibreConfig) {
        if let Some(settings) = &self.settings {
            config.settings = Some(settings.clone());
        }
        if let Some(library) = &self.library {
            config.library = Some(library.clone());
        }
    }
}

impl ServeArgs {
    /// Override config values with CLI flags.
    pub fn apply(&self, config: &mut Config) {
        self.calibre.apply(&mut config.calibre);
        if let Some(batch_size) = self.batch_size {
            config.update.batch_size = batch_size;
        }
        if let Some(interval) = self.update_interval {
            config.update.interval = interval;
        }
        if let Some(bind) = self.bind {
            config.server.bind = bind;
        }
    }
}

impl Config {
    /// Load configuration from file.
    pub fn load(path: &PathBuf) -> crate::error::Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            crate::error::AppError::Config(format!("Failed to read config file: {}", e))
        })?;

        toml::from_str(&content).map_err(|e| {
            crate::error::AppError::Config(format!("Failed to parse config file: {}", e))
        })
    }

    /// Find config file in default locations.
    pub fn find_config_file() -> Option<PathBuf> {
        let candidates = [
            PathBuf::from("config.toml"),
            PathBuf::from("ficsync.toml"),
            dirs::config_dir()
                .map(|p| p.join("ficsync").join("config.toml"))
                .unwrap_or_default(),
            PathBuf::from("/etc/ficsync/config.toml"),
        ];

        candidates.into_iter().find(|p| p.is_file())
    }

    /// Generate default config file content.
    pub fn generate_default() -> String {
        r#"# ficsync configuration

[server]
bind = "0.0.0.0:8080"
title = "Library"
# Thumbnails are scaled to fit this box
thumbnail_width = 60
thumbnail_height = 80

[calibre]
# Both are asked from Calibre when left out
# settings = "/config"
# library = "/books"
# calibredb = "calibredb"
# calibre_debug = "calibre-debug"

[update]
# Time between update cycles
interval = "8h"
# Books per cycle (0 for the whole library)
batch_size = 0
"#
        .to_string()
    }
}

/// Book formats Calibre stores that we know how to serve.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BookFormat {
    /// EPUB format (Electronic Publication).
    Epub,
    /// PDF format (Portable Document Format).
    Pdf,
    /// MOBI format (Mobipocket eBook).
    Mobi,
    /// AZW3 format (Kindle Format 8).
    Azw3,
    /// FB2 format (FictionBook).
    Fb2,
    /// Plain text format.
    Txt,
    /// HTML format.
    Html,
}

impl BookFormat {
    /// Get the MIME type for this format.
    pub fn mime_type(&self) -> &'static str {
        match self {
            BookFormat::Epub => "application/epub+zip",
            BookFormat::Pdf => "application/pdf",
            BookFormat::Mobi => "application/x-mobipocket-ebook",
            BookFormat::Azw3 => "application/vnd.amazon.ebook",
            BookFormat::Fb2 => "application/x-fictionbook+xml",
            BookFormat::Txt => "text/plain",
            BookFormat::Html => "text/html",
        }
    }

    /// Try to detect format from file extension.
    pub fn from_extension(ext: &str) -> Option<Self> {
        match ext.to_lowercase().as_str() {
            "epub" => Some(BookFormat::Epub),
            "pdf" => Some(BookFormat::Pdf),
            "mobi" | "azw" => Some(BookFormat::Mobi),
            "azw3" => Some(BookFormat::Azw3),
            "fb2" => Some(BookFormat::Fb2),
            "txt" => Some(BookFormat::Txt),
            "html" | "htm" => Some(BookFormat::Html),
            _ => None,
        }
    }
}
