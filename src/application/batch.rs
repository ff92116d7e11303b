//! Render a list of pages from a TOML manifest through one renderer.

use std::{
    collections::BTreeMap,
    io,
    path::{Path, PathBuf},
    time::{Duration, Instant},
};

use serde::{Deserialize, Serialize};
use serde_json::Number;
use thiserror::Error;
use tracing::{info, warn};

use crate::{
    application::render::Renderer,
    domain::render::{Cookie, ImageFormat, RenderRequest, RenderResponse, RenderStatus, millis},
};

#[derive(Debug, Error)]
pub enum BatchError {
    #[error("failed to access `{path}`: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("invalid manifest `{path}`: {source}")]
    Manifest {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
    #[error("manifest page {index}: {message}")]
    Page { index: usize, message: String },
    #[error("worker returned an undecodable image for {url}: {source}")]
    Decode {
        url: String,
        #[source]
        source: base64::DecodeError,
    },
    #[error("worker reported success for {url} without an image")]
    MissingImage { url: String },
}

impl BatchError {
    fn io(path: &Path, source: io::Error) -> Self {
        Self::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}

/// One render with its destination file.
#[derive(Debug, Clone, PartialEq)]
pub struct PageJob {
    pub request: RenderRequest,
    pub output: PathBuf,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawManifest {
    #[serde(default)]
    defaults: RawDefaults,
    #[serde(default)]
    pages: Vec<RawPage>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct RawDefaults {
    format: Option<String>,
    width: Option<u32>,
    height: Option<u32>,
    timeout_seconds: Option<f64>,
    user_agent: Option<String>,
    headers: BTreeMap<String, String>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawPage {
    url: Option<String>,
    output: PathBuf,
    html_file: Option<PathBuf>,
    format: Option<String>,
    width: Option<u32>,
    height: Option<u32>,
    timeout_seconds: Option<f64>,
    user_agent: Option<String>,
    #[serde(default)]
    headers: BTreeMap<String, String>,
    #[serde(default)]
    cookies: Vec<Cookie>,
}

/// Read a manifest and turn every page into a [`PageJob`].
///
/// Relative `output` and `html_file` paths resolve against the manifest's
/// directory. Page values override `[defaults]`; header maps are merged.
pub async fn load_manifest(path: &Path) -> Result<Vec<PageJob>, BatchError> {
    let text = tokio::fs::read_to_string(path)
        .await
        .map_err(|err| BatchError::io(path, err))?;
    let raw: RawManifest = toml::from_str(&text).map_err(|source| BatchError::Manifest {
        path: path.to_path_buf(),
        source,
    })?;
    let base = path.parent().unwrap_or_else(|| Path::new(""));

    let mut jobs = Vec::with_capacity(raw.pages.len());
    for (index, page) in raw.pages.into_iter().enumerate() {
        jobs.push(build_job(index, page, &raw.defaults, base).await?);
    }
    Ok(jobs)
}

async fn build_job(
    index: usize,
    page: RawPage,
    defaults: &RawDefaults,
    base: &Path,
) -> Result<PageJob, BatchError> {
    let page_error = |message: String| BatchError::Page { index, message };

    let markup = match page.html_file {
        Some(html_file) => {
            let html_file = base.join(html_file);
            let markup = tokio::fs::read(&html_file)
                .await
                .map_err(|err| BatchError::io(&html_file, err))?;
            Some(markup)
        }
        None => None,
    };
    let mut request = match (page.url, markup) {
        (Some(url), Some(markup)) => RenderRequest::new(url).with_html_bytes(&markup),
        (Some(url), None) => RenderRequest::new(url),
        (None, Some(markup)) => RenderRequest::from_html_bytes(&markup),
        (None, None) => return Err(page_error("needs `url`, `html_file`, or both".to_string())),
    };

    if let Some(format) = page.format.as_ref().or(defaults.format.as_ref()) {
        let format: ImageFormat = format.parse().map_err(|err| page_error(format!("{err}")))?;
        request = request.with_format(format);
    }

    let width = page.width.or(defaults.width).unwrap_or(request.width);
    let height = page.height.or(defaults.height).unwrap_or(request.height);
    request = request.with_viewport(width, height);

    if let Some(seconds) = page.timeout_seconds.or(defaults.timeout_seconds) {
        let timeout = Duration::try_from_secs_f64(seconds)
            .ok()
            .filter(|timeout| !timeout.is_zero())
            .ok_or_else(|| page_error(format!("timeout_seconds `{seconds}` must be positive")))?;
        request = request.with_page_load_timeout(timeout);
    }

    if let Some(user_agent) = page.user_agent.or_else(|| defaults.user_agent.clone()) {
        request = request.with_user_agent(user_agent);
    }

    let mut headers = defaults.headers.clone();
    headers.extend(page.headers);
    for (name, value) in headers {
        request = request.with_header(name, value);
    }

    for cookie in page.cookies {
        request = request.with_cookie(cookie);
    }

    request
        .validate()
        .map_err(|err| page_error(err.to_string()))?;

    Ok(PageJob {
        request,
        output: base.join(page.output),
    })
}

/// Outcome of one page in a batch.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct PageReport {
    /// `null` for markup-only pages.
    pub url: Option<String>,
    pub output: PathBuf,
    pub status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub load_time: Option<Number>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub paint_time: Option<Number>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub image: Option<SavedImage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, PartialEq, Eq)]
pub struct BatchReport {
    pub succeeded: usize,
    pub failed: usize,
    pub pages: Vec<PageReport>,
}

impl BatchReport {
    pub fn all_ok(&self) -> bool {
        self.failed == 0
    }
}

/// Image written to disk, with the dimensions read back from its header.
#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
pub struct SavedImage {
    pub bytes: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub width: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub height: Option<usize>,
}

/// Render every job in order through `renderer`.
///
/// Failed pages are recorded and the batch carries on; a transport failure
/// only costs the page it happened on since the next render starts a fresh
/// worker.
pub async fn run(renderer: &dyn Renderer, jobs: &[PageJob]) -> BatchReport {
    let started_at = Instant::now();
    let mut report = BatchReport::default();

    for job in jobs {
        let page = render_page(renderer, job).await;
        if page.status == RenderStatus::Ok.as_str() && page.error.is_none() {
            report.succeeded += 1;
        } else {
            report.failed += 1;
        }
        report.pages.push(page);
    }

    info!(
        target = "application::batch",
        op = "batch::run",
        pages = jobs.len(),
        succeeded = report.succeeded,
        failed = report.failed,
        elapsed_ms = millis(started_at.elapsed()),
        "Batch finished"
    );

    report
}

async fn render_page(renderer: &dyn Renderer, job: &PageJob) -> PageReport {
    let response = match renderer.render(&job.request).await {
        Ok(response) => response,
        Err(err) => {
            warn!(
                target = "application::batch",
                op = "batch::render_page",
                url = job.request.target(),
                result = "error",
                error = %err,
                "Render failed"
            );
            RenderResponse::failed(&job.request, err.to_string())
        }
    };

    let mut page = PageReport {
        url: response.url.clone(),
        output: job.output.clone(),
        status: response.status.to_string(),
        load_time: response.load_time.clone(),
        paint_time: response.paint_time.clone(),
        image: None,
        error: response.error.clone(),
    };

    if response.is_ok() {
        match save_image(&response, &job.output).await {
            Ok(image) => page.image = Some(image),
            Err(err) => {
                warn!(
                    target = "application::batch",
                    op = "batch::save_image",
                    url = response.target(),
                    output = %job.output.display(),
                    error = %err,
                    "Failed to save rendered image"
                );
                page.error = Some(err.to_string());
            }
        }
    }

    page
}

/// Decode a successful response's payload and write it to `output`.
pub async fn save_image(response: &RenderResponse, output: &Path) -> Result<SavedImage, BatchError> {
    let bytes = response
        .decode_image()
        .map_err(|source| BatchError::Decode {
            url: response.target().to_string(),
            source,
        })?
        .ok_or_else(|| BatchError::MissingImage {
            url: response.target().to_string(),
        })?;

    if let Some(parent) = output.parent().filter(|parent| !parent.as_os_str().is_empty()) {
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|err| BatchError::io(parent, err))?;
    }
    tokio::fs::write(output, &bytes)
        .await
        .map_err(|err| BatchError::io(output, err))?;

    let size = imagesize::blob_size(&bytes).ok();
    Ok(SavedImage {
        bytes: bytes.len(),
        width: size.map(|size| size.width),
        height: size.map(|size| size.height),
    })
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use async_trait::async_trait;
    use base64::{Engine, engine::general_purpose::STANDARD};
    use tempfile::TempDir;

    use super::*;
    use crate::application::render::RenderError;

    /// 3x2 PNG: signature plus IHDR, enough for header sniffing.
    fn png_header() -> Vec<u8> {
        let mut bytes = vec![0x89, b'P', b'N', b'G', 0x0D, 0x0A, 0x1A, 0x0A];
        bytes.extend_from_slice(&13_u32.to_be_bytes());
        bytes.extend_from_slice(b"IHDR");
        bytes.extend_from_slice(&3_u32.to_be_bytes());
        bytes.extend_from_slice(&2_u32.to_be_bytes());
        bytes.extend_from_slice(&[8, 6, 0, 0, 0]);
        bytes
    }

    struct ScriptedRenderer {
        seen: Mutex<Vec<RenderRequest>>,
    }

    #[async_trait]
    impl Renderer for ScriptedRenderer {
        async fn render(&self, request: &RenderRequest) -> Result<RenderResponse, RenderError> {
            self.seen.lock().expect("lock").push(request.clone());
            let mut response = RenderResponse::for_request(request);
            if request.target().contains("broken") {
                return Err(RenderError::transport(
                    "read response",
                    io::Error::new(io::ErrorKind::UnexpectedEof, "worker closed its output stream"),
                ));
            }
            if request.target().contains("slow") {
                response.error = Some("Render request has timed out.".to_string());
                return Ok(response);
            }
            response.status = RenderStatus::Ok;
            response.load_time = Some(Number::from(12_u64));
            response.base64 = Some(STANDARD.encode(png_header()));
            Ok(response)
        }

        async fn shutdown(&self, _timeout: Option<Duration>) {}
    }

    async fn write_manifest(dir: &TempDir, body: &str) -> PathBuf {
        let path = dir.path().join("pages.toml");
        tokio::fs::write(&path, body).await.expect("write manifest");
        path
    }

    #[tokio::test]
    async fn manifest_merges_defaults_and_resolves_paths() {
        let dir = TempDir::new().expect("tmp dir");
        tokio::fs::write(dir.path().join("page.html"), b"<h1>caf\xe9</h1>")
            .await
            .expect("write markup");
        let manifest = write_manifest(
            &dir,
            r#"
[defaults]
format = "jpeg"
width = 800
timeout_seconds = 5
headers = { "Accept-Language" = "en" }

[[pages]]
url = "http://example.com/"
output = "shots/home.jpg"
height = 600
headers = { "X-Trace" = "1" }

[[pages]]
url = "http://example.com/base/"
output = "/abs/inline.png"
html_file = "page.html"
format = "png"
cookies = [{ name = "session", value = "abc", secure = true }]

[[pages]]
output = "markup.png"
html_file = "page.html"
"#,
        )
        .await;

        let jobs = load_manifest(&manifest).await.expect("manifest loads");
        assert_eq!(jobs.len(), 3);

        let home = &jobs[0];
        assert_eq!(home.output, dir.path().join("shots/home.jpg"));
        assert_eq!(home.request.format, ImageFormat::Jpeg);
        assert_eq!((home.request.width, home.request.height), (800, 600));
        assert_eq!(home.request.page_load_timeout, Some(Duration::from_secs(5)));
        let headers = home.request.headers.as_ref().expect("headers");
        assert_eq!(headers.get("Accept-Language").map(String::as_str), Some("en"));
        assert_eq!(headers.get("X-Trace").map(String::as_str), Some("1"));

        let inline = &jobs[1];
        assert_eq!(inline.output, PathBuf::from("/abs/inline.png"));
        assert_eq!(inline.request.format, ImageFormat::Png);
        assert_eq!(inline.request.html.as_deref(), Some("<h1>caf\u{FFFD}</h1>"));
        let cookies = inline.request.cookies.as_ref().expect("cookies");
        assert_eq!(cookies[0].name, "session");
        assert_eq!(cookies[0].secure, Some(true));

        let markup_only = &jobs[2];
        assert_eq!(markup_only.request.url, None);
        assert_eq!(markup_only.request.html.as_deref(), Some("<h1>caf\u{FFFD}</h1>"));
    }

    #[tokio::test]
    async fn manifest_rejects_bad_pages() {
        let dir = TempDir::new().expect("tmp dir");
        let manifest = write_manifest(
            &dir,
            r#"
[[pages]]
url = "http://example.com/"
output = "a.png"
format = "bmp"
"#,
        )
        .await;
        let err = load_manifest(&manifest).await.expect_err("bmp is unsupported");
        assert!(matches!(err, BatchError::Page { index: 0, .. }));

        let manifest = write_manifest(&dir, "[[pages]]\noutput = \"a.png\"\n").await;
        let err = load_manifest(&manifest).await.expect_err("no target");
        assert!(matches!(err, BatchError::Page { index: 0, .. }));

        let manifest = write_manifest(&dir, "[[pages]]\nurl = 3\n").await;
        assert!(matches!(
            load_manifest(&manifest).await,
            Err(BatchError::Manifest { .. })
        ));
    }

    #[tokio::test]
    async fn run_records_every_outcome_and_writes_images() {
        let dir = TempDir::new().expect("tmp dir");
        let job = |url: &str, name: &str| PageJob {
            request: RenderRequest::new(url),
            output: dir.path().join("out").join(name),
        };
        let jobs = vec![
            job("http://example.com/ok", "ok.png"),
            job("http://example.com/slow", "slow.png"),
            job("http://example.com/broken", "broken.png"),
        ];
        let renderer = ScriptedRenderer {
            seen: Mutex::new(Vec::new()),
        };

        let report = run(&renderer, &jobs).await;

        assert_eq!(report.succeeded, 1);
        assert_eq!(report.failed, 2);
        assert!(!report.all_ok());
        assert_eq!(renderer.seen.lock().expect("lock").len(), 3);

        let ok = &report.pages[0];
        assert_eq!(ok.status, "ok");
        assert_eq!(ok.load_time, Some(Number::from(12_u64)));
        assert_eq!(
            ok.image,
            Some(SavedImage {
                bytes: png_header().len(),
                width: Some(3),
                height: Some(2),
            })
        );
        let written = tokio::fs::read(dir.path().join("out/ok.png"))
            .await
            .expect("image written");
        assert_eq!(written, png_header());

        assert_eq!(report.pages[1].status, "fail");
        assert_eq!(
            report.pages[1].error.as_deref(),
            Some("Render request has timed out.")
        );
        assert!(
            report.pages[2]
                .error
                .as_deref()
                .is_some_and(|error| error.contains("worker closed its output stream"))
        );
        assert!(!dir.path().join("out/slow.png").exists());
    }

    #[tokio::test]
    async fn save_image_requires_a_payload() {
        let dir = TempDir::new().expect("tmp dir");
        let mut response = RenderResponse::for_request(&RenderRequest::new("http://example.com"));
        response.status = RenderStatus::Ok;

        let err = save_image(&response, &dir.path().join("x.png"))
            .await
            .expect_err("no payload");
        assert!(matches!(err, BatchError::MissingImage { .. }));

        response.base64 = Some("***".to_string());
        let err = save_image(&response, &dir.path().join("x.png"))
            .await
            .expect_err("bad payload");
        assert!(matches!(err, BatchError::Decode { .. }));
    }
}
