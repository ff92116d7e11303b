use std::{io, process, time::Duration};

use pagesnap::{
    application::{batch, error::AppError, render::Renderer},
    config::{self, RenderArgs},
    domain::render::{Cookie, RenderRequest},
    infra::{error::InfraError, telemetry, worker::WorkerSession},
};
use serde_json::Number;
use tracing::{Dispatch, Level, dispatcher, error, info, warn};
use tracing_subscriber::fmt as tracing_fmt;

/// Conventional status for a process stopped by SIGINT.
const INTERRUPTED_EXIT_CODE: i32 = 130;

enum Exit {
    Success,
    /// The command ran but at least one render failed.
    RenderFailed,
    Interrupted,
}

#[tokio::main]
async fn main() {
    match run().await {
        Ok(Exit::Success) => {}
        Ok(Exit::RenderFailed) => process::exit(1),
        Ok(Exit::Interrupted) => process::exit(INTERRUPTED_EXIT_CODE),
        Err(error) => {
            report_application_error(&error);
            process::exit(1);
        }
    }
}

fn report_application_error(error: &AppError) {
    let chain = error.chain().join(": ");
    if dispatcher::has_been_set() {
        error!(error = %chain, "application error");
        return;
    }

    let subscriber = tracing_fmt()
        .with_max_level(Level::ERROR)
        .with_writer(io::stderr)
        .finish();
    let dispatch = Dispatch::new(subscriber);
    dispatcher::with_default(&dispatch, || {
        error!(error = %chain, "application error");
    });
}

async fn run() -> Result<Exit, AppError> {
    let (cli_args, settings) = config::load_with_cli().map_err(|err| {
        AppError::from(InfraError::configuration(format!(
            "failed to load configuration: {err}"
        )))
    })?;

    telemetry::init(&settings.logging)?;

    let session = WorkerSession::new(settings.worker)?;
    let renderer: &dyn Renderer = &session;
    let mut signals = ShutdownSignals::register().map_err(InfraError::Io)?;

    // Pinned so a signal arriving mid-render leaves the exchange in flight;
    // shutdown then finds the guard held and kills the worker outright.
    let work = async {
        match cli_args.command {
            config::Command::Render(args) => run_render(renderer, *args).await,
            config::Command::Batch(args) => run_batch(renderer, args).await,
        }
    };
    tokio::pin!(work);

    tokio::select! {
        result = &mut work => {
            renderer.shutdown(None).await;
            result
        }
        signal = signals.recv() => {
            warn!(
                target = "pagesnap::main",
                signal,
                "Received shutdown signal; stopping worker"
            );
            renderer.shutdown(Some(Duration::ZERO)).await;
            Ok(Exit::Interrupted)
        }
    }
}

async fn run_render(renderer: &dyn Renderer, args: RenderArgs) -> Result<Exit, AppError> {
    let request = build_request(&args).await?;
    let response = renderer.render(&request).await?;

    if !response.is_ok() {
        error!(
            target = "pagesnap::render",
            url = response.target(),
            status = %response.status,
            error = response.error.as_deref().unwrap_or("no error reported"),
            "Render failed"
        );
        return Ok(Exit::RenderFailed);
    }

    let image = batch::save_image(&response, &args.output).await?;
    info!(
        target = "pagesnap::render",
        url = response.target(),
        output = %args.output.display(),
        bytes = image.bytes,
        width = image.width,
        height = image.height,
        load_time = response.load_time.as_ref().and_then(Number::as_f64),
        paint_time = response.paint_time.as_ref().and_then(Number::as_f64),
        "Render completed"
    );
    Ok(Exit::Success)
}

async fn build_request(args: &RenderArgs) -> Result<RenderRequest, AppError> {
    let markup = match args.html_file.as_ref() {
        Some(path) => Some(tokio::fs::read(path).await.map_err(InfraError::Io)?),
        None => None,
    };
    let mut request = match (args.url.as_ref(), markup) {
        (Some(url), Some(markup)) => RenderRequest::new(url.clone()).with_html_bytes(&markup),
        (Some(url), None) => RenderRequest::new(url.clone()),
        (None, Some(markup)) => RenderRequest::from_html_bytes(&markup),
        (None, None) => {
            return Err(AppError::validation(
                "render needs a URL, --html-file, or both",
            ));
        }
    };
    if let Some(format) = args.format {
        request = request.with_format(format);
    }
    let width = args.width.unwrap_or(request.width);
    let height = args.height.unwrap_or(request.height);
    request = request.with_viewport(width, height);
    if let Some(seconds) = args.timeout_seconds {
        let timeout = Duration::try_from_secs_f64(seconds)
            .ok()
            .filter(|timeout| !timeout.is_zero())
            .ok_or_else(|| {
                AppError::validation(format!("--timeout-seconds `{seconds}` must be positive"))
            })?;
        request = request.with_page_load_timeout(timeout);
    }
    if let Some(user_agent) = args.user_agent.as_ref() {
        request = request.with_user_agent(user_agent.clone());
    }
    for (name, value) in &args.headers {
        request = request.with_header(name.clone(), value.clone());
    }
    for (name, value) in &args.cookies {
        request = request.with_cookie(Cookie::new(name.clone(), value.clone()));
    }

    request.validate()?;
    Ok(request)
}

async fn run_batch(renderer: &dyn Renderer, args: config::BatchArgs) -> Result<Exit, AppError> {
    let jobs = batch::load_manifest(&args.manifest).await?;
    info!(
        target = "pagesnap::batch",
        manifest = %args.manifest.display(),
        pages = jobs.len(),
        "Starting batch"
    );

    let report = batch::run(renderer, &jobs).await;
    let encoded = serde_json::to_string_pretty(&report)
        .map_err(|err| AppError::unexpected(format!("failed to encode report: {err}")))?;
    println!("{encoded}");

    Ok(if report.all_ok() {
        Exit::Success
    } else {
        Exit::RenderFailed
    })
}

/// Process signals that should stop the worker before exiting.
struct ShutdownSignals {
    #[cfg(unix)]
    interrupt: tokio::signal::unix::Signal,
    #[cfg(unix)]
    terminate: tokio::signal::unix::Signal,
}

impl ShutdownSignals {
    #[cfg(unix)]
    fn register() -> io::Result<Self> {
        use tokio::signal::unix::{SignalKind, signal};

        Ok(Self {
            interrupt: signal(SignalKind::interrupt())?,
            terminate: signal(SignalKind::terminate())?,
        })
    }

    #[cfg(not(unix))]
    fn register() -> io::Result<Self> {
        Ok(Self {})
    }

    /// Wait for the next signal and return its name.
    #[cfg(unix)]
    async fn recv(&mut self) -> &'static str {
        tokio::select! {
            _ = self.interrupt.recv() => "SIGINT",
            _ = self.terminate.recv() => "SIGTERM",
        }
    }

    #[cfg(not(unix))]
    async fn recv(&mut self) -> &'static str {
        match tokio::signal::ctrl_c().await {
            Ok(()) => "ctrl-c",
            Err(_) => std::future::pending().await,
        }
    }
}
