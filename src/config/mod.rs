//! Configuration layer: typed settings with layered precedence (file → env → CLI).

mod cli;

use std::{collections::BTreeMap, path::PathBuf, str::FromStr, time::Duration};

use clap::Parser;
use config::{Config, Environment, File};
use serde::Deserialize;
use thiserror::Error;
use tracing::level_filters::LevelFilter;

pub use cli::{BatchArgs, CliArgs, Command, RenderArgs, SettingsOverrides};

const DEFAULT_CONFIG_BASENAME: &str = "config/default";
const LOCAL_CONFIG_BASENAME: &str = "pagesnap";
pub const DEFAULT_WORKER_EXECUTABLE: &str = "phantomjs";
pub const DEFAULT_WORKER_SCRIPT: &str = "render.js";
const DEFAULT_PROCESS_STARTUP_SECS: f64 = 10.0;
const DEFAULT_INITIAL_RENDER_RESPONSE_SECS: f64 = 30.0;
const DEFAULT_RENDER_RESPONSE_SECS: f64 = 10.0;
const DEFAULT_PAGE_LOAD_SECS: f64 = 30.0;
const DEFAULT_SHUTDOWN_GRACE_SECS: f64 = 1.0;

/// Fully-resolved settings after precedence resolution and validation.
#[derive(Debug, Clone)]
pub struct Settings {
    pub logging: LoggingSettings,
    pub worker: WorkerSettings,
}

#[derive(Debug, Clone)]
pub struct LoggingSettings {
    pub level: LevelFilter,
    pub format: LogFormat,
}

#[derive(Debug, Clone, Copy)]
pub enum LogFormat {
    Json,
    Compact,
}

/// Everything a worker session needs to launch and talk to its worker.
#[derive(Debug, Clone, PartialEq)]
pub struct WorkerSettings {
    /// Executable path or a bare name resolved on `PATH`.
    pub executable: PathBuf,
    /// Script passed as the final argument.
    pub script: PathBuf,
    /// Arguments placed between the executable and the script.
    pub args: Vec<String>,
    /// When set, the worker gets exactly this environment.
    pub env: Option<BTreeMap<String, String>>,
    pub timeouts: WorkerTimeouts,
}

impl WorkerSettings {
    pub fn new(executable: impl Into<PathBuf>, script: impl Into<PathBuf>) -> Self {
        Self {
            executable: executable.into(),
            script: script.into(),
            args: Vec::new(),
            env: None,
            timeouts: WorkerTimeouts::default(),
        }
    }
}

/// Deadlines applied to the worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkerTimeouts {
    pub process_startup: Duration,
    /// Protocol allowance on top of the page-load timeout for the first
    /// response of a freshly started worker.
    pub initial_render_response: Duration,
    /// Protocol allowance on top of the page-load timeout for later responses.
    pub render_response: Duration,
    /// Default page-load timeout for requests that do not set their own.
    pub page_load: Duration,
    /// How long shutdown waits for the worker to exit on its own.
    pub shutdown_grace: Duration,
}

impl Default for WorkerTimeouts {
    fn default() -> Self {
        Self {
            process_startup: Duration::from_secs_f64(DEFAULT_PROCESS_STARTUP_SECS),
            initial_render_response: Duration::from_secs_f64(DEFAULT_INITIAL_RENDER_RESPONSE_SECS),
            render_response: Duration::from_secs_f64(DEFAULT_RENDER_RESPONSE_SECS),
            page_load: Duration::from_secs_f64(DEFAULT_PAGE_LOAD_SECS),
            shutdown_grace: Duration::from_secs_f64(DEFAULT_SHUTDOWN_GRACE_SECS),
        }
    }
}

#[derive(Debug, Error)]
pub enum LoadError {
    #[error("failed to build configuration: {0}")]
    Build(#[from] config::ConfigError),
    #[error("invalid configuration for `{key}`: {reason}")]
    Invalid { key: &'static str, reason: String },
}

impl LoadError {
    fn invalid(key: &'static str, reason: impl Into<String>) -> Self {
        Self::Invalid {
            key,
            reason: reason.into(),
        }
    }
}

/// Load settings using the configured precedence (file → environment → CLI).
pub fn load(cli: &CliArgs) -> Result<Settings, LoadError> {
    let mut builder = Config::builder()
        .add_source(File::with_name(DEFAULT_CONFIG_BASENAME).required(false))
        .add_source(File::with_name(LOCAL_CONFIG_BASENAME).required(false));

    if let Some(path) = cli.config_file.as_ref() {
        builder = builder.add_source(File::from(path.as_path()).required(true));
    }

    builder = builder.add_source(Environment::with_prefix("PAGESNAP").separator("__"));

    let mut raw: RawSettings = builder.build()?.try_deserialize()?;
    raw.apply_overrides(&cli.overrides);

    Settings::from_raw(raw)
}

/// Resolve configuration using the process arguments, returning both for downstream use.
pub fn load_with_cli() -> Result<(CliArgs, Settings), LoadError> {
    let args = CliArgs::parse();
    let settings = load(&args)?;
    Ok((args, settings))
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawSettings {
    logging: RawLoggingSettings,
    worker: RawWorkerSettings,
}

impl RawSettings {
    fn apply_overrides(&mut self, overrides: &SettingsOverrides) {
        if let Some(path) = overrides.worker_executable.as_ref() {
            self.worker.executable = Some(path.clone());
        }
        if let Some(path) = overrides.worker_script.as_ref() {
            self.worker.script = Some(path.clone());
        }
        if let Some(seconds) = overrides.page_load_seconds {
            self.worker.timeouts.page_load_seconds = Some(seconds);
        }
        if let Some(level) = overrides.log_level.as_ref() {
            self.logging.level = Some(level.clone());
        }
        if let Some(json) = overrides.log_json {
            self.logging.json = Some(json);
        }
    }
}

impl Settings {
    fn from_raw(raw: RawSettings) -> Result<Self, LoadError> {
        let RawSettings { logging, worker } = raw;

        let logging = build_logging_settings(logging)?;
        let worker = build_worker_settings(worker)?;

        Ok(Self { logging, worker })
    }
}

fn build_logging_settings(logging: RawLoggingSettings) -> Result<LoggingSettings, LoadError> {
    let level = match logging.level {
        Some(level) => LevelFilter::from_str(level.as_str()).map_err(|err| {
            LoadError::invalid("logging.level", format!("failed to parse: {err}"))
        })?,
        None => LevelFilter::INFO,
    };

    let format = if logging.json.unwrap_or(false) {
        LogFormat::Json
    } else {
        LogFormat::Compact
    };

    Ok(LoggingSettings { level, format })
}

fn build_worker_settings(worker: RawWorkerSettings) -> Result<WorkerSettings, LoadError> {
    let executable = worker
        .executable
        .unwrap_or_else(|| PathBuf::from(DEFAULT_WORKER_EXECUTABLE));
    if executable.as_os_str().is_empty() {
        return Err(LoadError::invalid(
            "worker.executable",
            "path must not be empty",
        ));
    }

    let script = worker
        .script
        .unwrap_or_else(|| PathBuf::from(DEFAULT_WORKER_SCRIPT));
    if script.as_os_str().is_empty() {
        return Err(LoadError::invalid("worker.script", "path must not be empty"));
    }

    let env = (!worker.env.is_empty()).then_some(worker.env);

    Ok(WorkerSettings {
        executable,
        script,
        args: worker.args,
        env,
        timeouts: build_worker_timeouts(worker.timeouts)?,
    })
}

fn build_worker_timeouts(timeouts: RawWorkerTimeouts) -> Result<WorkerTimeouts, LoadError> {
    Ok(WorkerTimeouts {
        process_startup: positive_seconds(
            timeouts
                .process_startup_seconds
                .unwrap_or(DEFAULT_PROCESS_STARTUP_SECS),
            "worker.timeouts.process_startup_seconds",
        )?,
        initial_render_response: positive_seconds(
            timeouts
                .initial_render_response_seconds
                .unwrap_or(DEFAULT_INITIAL_RENDER_RESPONSE_SECS),
            "worker.timeouts.initial_render_response_seconds",
        )?,
        render_response: positive_seconds(
            timeouts
                .render_response_seconds
                .unwrap_or(DEFAULT_RENDER_RESPONSE_SECS),
            "worker.timeouts.render_response_seconds",
        )?,
        page_load: positive_seconds(
            timeouts.page_load_seconds.unwrap_or(DEFAULT_PAGE_LOAD_SECS),
            "worker.timeouts.page_load_seconds",
        )?,
        shutdown_grace: seconds(
            timeouts
                .shutdown_grace_seconds
                .unwrap_or(DEFAULT_SHUTDOWN_GRACE_SECS),
            "worker.timeouts.shutdown_grace_seconds",
        )?,
    })
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawLoggingSettings {
    level: Option<String>,
    json: Option<bool>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawWorkerSettings {
    executable: Option<PathBuf>,
    script: Option<PathBuf>,
    args: Vec<String>,
    env: BTreeMap<String, String>,
    timeouts: RawWorkerTimeouts,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawWorkerTimeouts {
    process_startup_seconds: Option<f64>,
    initial_render_response_seconds: Option<f64>,
    render_response_seconds: Option<f64>,
    page_load_seconds: Option<f64>,
    shutdown_grace_seconds: Option<f64>,
}

fn positive_seconds(value: f64, key: &'static str) -> Result<Duration, LoadError> {
    let duration = seconds(value, key)?;
    if duration.is_zero() {
        return Err(LoadError::invalid(key, "must be greater than zero"));
    }
    Ok(duration)
}

fn seconds(value: f64, key: &'static str) -> Result<Duration, LoadError> {
    Duration::try_from_secs_f64(value)
        .map_err(|err| LoadError::invalid(key, format!("`{value}` is not a valid duration: {err}")))
}
