use std::path::PathBuf;

use clap::{Args, Parser, Subcommand, ValueHint, builder::BoolishValueParser};

use crate::domain::render::ImageFormat;

/// Command-line arguments for the pagesnap binary.
#[derive(Debug, Parser)]
#[command(
    name = "pagesnap",
    version,
    about = "Render web pages to images through a headless browser worker"
)]
pub struct CliArgs {
    /// Optional path to a configuration file.
    #[arg(long = "config-file", env = "PAGESNAP_CONFIG_FILE", value_name = "PATH")]
    pub config_file: Option<PathBuf>,

    #[command(flatten)]
    pub overrides: SettingsOverrides,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand, Clone)]
pub enum Command {
    /// Render a single page to an image file.
    Render(Box<RenderArgs>),
    /// Render every page listed in a TOML manifest through one worker.
    Batch(BatchArgs),
}

#[derive(Debug, Args, Default, Clone)]
pub struct SettingsOverrides {
    /// Override the worker executable (a path or a name on PATH).
    #[arg(long = "worker-executable", value_name = "PATH", global = true)]
    pub worker_executable: Option<PathBuf>,

    /// Override the script handed to the worker executable.
    #[arg(
        long = "worker-script",
        value_name = "PATH",
        value_hint = ValueHint::FilePath,
        global = true
    )]
    pub worker_script: Option<PathBuf>,

    /// Override the default page-load timeout.
    #[arg(long = "page-load-seconds", value_name = "SECONDS", global = true)]
    pub page_load_seconds: Option<f64>,

    /// Override the base log level (trace|debug|info|warn|error).
    #[arg(long = "log-level", value_name = "LEVEL", global = true)]
    pub log_level: Option<String>,

    /// Toggle JSON logging.
    #[arg(
        long = "log-json",
        value_name = "BOOL",
        value_parser = BoolishValueParser::new(),
        global = true
    )]
    pub log_json: Option<bool>,
}

#[derive(Debug, Args, Clone)]
pub struct RenderArgs {
    /// Page to render; with --html-file this is the base URL for the markup.
    #[arg(value_name = "URL", required_unless_present = "html_file")]
    pub url: Option<String>,

    /// Where to write the decoded image.
    #[arg(short, long, value_name = "FILE", value_hint = ValueHint::FilePath)]
    pub output: PathBuf,

    /// Render this markup instead of fetching the URL. May be given without
    /// a URL.
    #[arg(long = "html-file", value_name = "FILE", value_hint = ValueHint::FilePath)]
    pub html_file: Option<PathBuf>,

    /// Image format (PNG, JPEG or GIF).
    #[arg(long, value_name = "FORMAT")]
    pub format: Option<ImageFormat>,

    /// Viewport width in pixels.
    #[arg(long, value_name = "PIXELS")]
    pub width: Option<u32>,

    /// Viewport height in pixels.
    #[arg(long, value_name = "PIXELS")]
    pub height: Option<u32>,

    /// Page-load timeout for this render.
    #[arg(long = "timeout-seconds", value_name = "SECONDS")]
    pub timeout_seconds: Option<f64>,

    /// User agent presented by the worker.
    #[arg(long = "user-agent", value_name = "STRING")]
    pub user_agent: Option<String>,

    /// Extra request header, repeatable.
    #[arg(long = "header", value_name = "NAME:VALUE", value_parser = parse_header)]
    pub headers: Vec<(String, String)>,

    /// Cookie to install before loading, repeatable.
    #[arg(long = "cookie", value_name = "NAME=VALUE", value_parser = parse_cookie)]
    pub cookies: Vec<(String, String)>,
}

#[derive(Debug, Args, Clone)]
pub struct BatchArgs {
    /// Manifest listing the pages to render.
    #[arg(value_name = "MANIFEST", value_hint = ValueHint::FilePath)]
    pub manifest: PathBuf,
}

fn parse_header(raw: &str) -> Result<(String, String), String> {
    split_pair(raw, ':').ok_or_else(|| format!("expected NAME:VALUE, got `{raw}`"))
}

fn parse_cookie(raw: &str) -> Result<(String, String), String> {
    split_pair(raw, '=').ok_or_else(|| format!("expected NAME=VALUE, got `{raw}`"))
}

fn split_pair(raw: &str, separator: char) -> Option<(String, String)> {
    let (name, value) = raw.split_once(separator)?;
    let name = name.trim();
    if name.is_empty() {
        return None;
    }
    Some((name.to_string(), value.trim().to_string()))
}
