use std::{collections::BTreeMap, fmt, str::FromStr, time::Duration};

use base64::{Engine as _, engine::general_purpose::STANDARD};
use serde::{Deserialize, Serialize};
use serde_json::Number;
use url::Url;

use super::error::DomainError;

pub const DEFAULT_WIDTH: u32 = 1280;
pub const DEFAULT_HEIGHT: u32 = 1024;

/// Whole milliseconds in `duration`, saturating at `u64::MAX`.
pub fn millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

/// Stand-in for the URL in logs and errors when only markup was supplied.
const INLINE_MARKUP: &str = "<inline markup>";

/// Image encodings the worker can produce.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ImageFormat {
    #[default]
    Png,
    Jpeg,
    Gif,
}

impl ImageFormat {
    pub fn as_str(self) -> &'static str {
        match self {
            ImageFormat::Png => "PNG",
            ImageFormat::Jpeg => "JPEG",
            ImageFormat::Gif => "GIF",
        }
    }

    pub fn extension(self) -> &'static str {
        match self {
            ImageFormat::Png => "png",
            ImageFormat::Jpeg => "jpg",
            ImageFormat::Gif => "gif",
        }
    }
}

impl fmt::Display for ImageFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ImageFormat {
    type Err = DomainError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_uppercase().as_str() {
            "PNG" => Ok(ImageFormat::Png),
            "JPEG" | "JPG" => Ok(ImageFormat::Jpeg),
            "GIF" => Ok(ImageFormat::Gif),
            other => Err(DomainError::validation(format!(
                "unsupported image format `{other}` (expected PNG, JPEG or GIF)"
            ))),
        }
    }
}

/// Cookie installed in the page before loading, in the shape the worker expects.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Cookie {
    pub name: String,
    pub value: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub domain: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub httponly: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secure: Option<bool>,
    /// Expiry as a unix timestamp in milliseconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires: Option<i64>,
}

impl Cookie {
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
            domain: None,
            path: None,
            httponly: None,
            secure: None,
            expires: None,
        }
    }
}

/// A single page render: a target URL, inline markup, or markup loaded
/// against a base URL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenderRequest {
    pub url: Option<String>,
    pub html: Option<String>,
    pub format: ImageFormat,
    pub width: u32,
    pub height: u32,
    /// Falls back to the configured page-load timeout when unset.
    pub page_load_timeout: Option<Duration>,
    pub user_agent: Option<String>,
    pub headers: Option<BTreeMap<String, String>>,
    pub cookies: Option<Vec<Cookie>>,
}

impl RenderRequest {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: Some(url.into()),
            ..Self::blank()
        }
    }

    /// Render markup with no base URL.
    pub fn from_html(html: impl Into<String>) -> Self {
        Self::blank().with_html(html)
    }

    /// Render markup that arrived as raw bytes, with no base URL.
    pub fn from_html_bytes(html: &[u8]) -> Self {
        Self::blank().with_html_bytes(html)
    }

    fn blank() -> Self {
        Self {
            url: None,
            html: None,
            format: ImageFormat::default(),
            width: DEFAULT_WIDTH,
            height: DEFAULT_HEIGHT,
            page_load_timeout: None,
            user_agent: None,
            headers: None,
            cookies: None,
        }
    }

    /// The URL, or a placeholder for markup-only requests.
    pub fn target(&self) -> &str {
        self.url.as_deref().unwrap_or(INLINE_MARKUP)
    }

    pub fn with_html(mut self, html: impl Into<String>) -> Self {
        self.html = Some(html.into());
        self
    }

    /// Attach markup that arrived as raw bytes. Invalid UTF-8 sequences are
    /// replaced with U+FFFD so the wire line is always valid text.
    pub fn with_html_bytes(mut self, html: &[u8]) -> Self {
        self.html = Some(String::from_utf8_lossy(html).into_owned());
        self
    }

    pub fn with_format(mut self, format: ImageFormat) -> Self {
        self.format = format;
        self
    }

    pub fn with_viewport(mut self, width: u32, height: u32) -> Self {
        self.width = width;
        self.height = height;
        self
    }

    pub fn with_page_load_timeout(mut self, timeout: Duration) -> Self {
        self.page_load_timeout = Some(timeout);
        self
    }

    pub fn with_user_agent(mut self, user_agent: impl Into<String>) -> Self {
        self.user_agent = Some(user_agent.into());
        self
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers
            .get_or_insert_with(BTreeMap::new)
            .insert(name.into(), value.into());
        self
    }

    pub fn with_cookie(mut self, cookie: Cookie) -> Self {
        self.cookies.get_or_insert_with(Vec::new).push(cookie);
        self
    }

    /// Reject requests the worker could never satisfy before any I/O happens.
    pub fn validate(&self) -> Result<(), DomainError> {
        match self.url.as_deref().map(str::trim) {
            Some("") => return Err(DomainError::validation("render url must not be empty")),
            Some(url) => {
                Url::parse(url).map_err(|err| {
                    DomainError::validation(format!("invalid render url `{url}`: {err}"))
                })?;
            }
            None if self.html.is_none() => {
                return Err(DomainError::validation(
                    "render request needs a url, html markup, or both",
                ));
            }
            None => {}
        }
        if self.width == 0 || self.height == 0 {
            return Err(DomainError::validation(format!(
                "viewport must be non-zero, got {}x{}",
                self.width, self.height
            )));
        }
        Ok(())
    }
}

/// Outcome reported by the worker. Unknown statuses are preserved verbatim.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum RenderStatus {
    Ok,
    #[default]
    Fail,
    Other(String),
}

impl RenderStatus {
    pub fn as_str(&self) -> &str {
        match self {
            RenderStatus::Ok => "ok",
            RenderStatus::Fail => "fail",
            RenderStatus::Other(status) => status.as_str(),
        }
    }
}

impl From<String> for RenderStatus {
    fn from(value: String) -> Self {
        match value.as_str() {
            "ok" => RenderStatus::Ok,
            "fail" => RenderStatus::Fail,
            _ => RenderStatus::Other(value),
        }
    }
}

impl fmt::Display for RenderStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Structured result of one render call.
///
/// Fields the worker did not report are `None`; `status` defaults to
/// [`RenderStatus::Fail`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenderResponse {
    pub url: Option<String>,
    pub format: ImageFormat,
    pub status: RenderStatus,
    /// Page load time in milliseconds, exactly as the worker reported it.
    pub load_time: Option<Number>,
    /// Paint time in milliseconds, exactly as the worker reported it.
    pub paint_time: Option<Number>,
    pub base64: Option<String>,
    pub error: Option<String>,
}

impl RenderResponse {
    /// Response skeleton for `request` with every worker-supplied field absent.
    pub fn for_request(request: &RenderRequest) -> Self {
        Self {
            url: request.url.clone(),
            format: request.format,
            status: RenderStatus::Fail,
            load_time: None,
            paint_time: None,
            base64: None,
            error: None,
        }
    }

    pub fn failed(request: &RenderRequest, error: impl Into<String>) -> Self {
        Self {
            error: Some(error.into()),
            ..Self::for_request(request)
        }
    }

    pub fn is_ok(&self) -> bool {
        self.status == RenderStatus::Ok
    }

    pub fn target(&self) -> &str {
        self.url.as_deref().unwrap_or(INLINE_MARKUP)
    }

    /// Decode the image payload, if the worker returned one.
    pub fn decode_image(&self) -> Result<Option<Vec<u8>>, base64::DecodeError> {
        self.base64
            .as_deref()
            .map(|payload| STANDARD.decode(payload.trim()))
            .transpose()
    }
}
