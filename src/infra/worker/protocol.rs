//! Line-delimited JSON wire format spoken with the worker.
//!
//! One request object per line in, one response object per line out, and the
//! literal `exit` line to ask the worker to quit.

use std::{collections::BTreeMap, time::Duration};

use serde::{Deserialize, Serialize};
use serde_json::Number;

use crate::domain::render::{
    Cookie, ImageFormat, RenderRequest, RenderResponse, RenderStatus, millis,
};

pub const EXIT_COMMAND: &[u8] = b"exit\n";
pub const TIMEOUT_MESSAGE: &str = "Render request has timed out.";

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct WireRequest<'a> {
    /// Always present; `null` for markup-only renders.
    url: Option<&'a str>,
    width: u32,
    height: u32,
    format: ImageFormat,
    #[serde(skip_serializing_if = "Option::is_none")]
    html: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    user_agent: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    headers: Option<&'a BTreeMap<String, String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    cookies: Option<&'a [Cookie]>,
    /// Milliseconds.
    timeout: u64,
}

/// Encode `request` as a single newline-terminated line.
pub fn encode_request(
    request: &RenderRequest,
    page_load_timeout: Duration,
) -> Result<String, serde_json::Error> {
    let wire = WireRequest {
        url: request.url.as_deref(),
        width: request.width,
        height: request.height,
        format: request.format,
        html: request.html.as_deref(),
        user_agent: request.user_agent.as_deref(),
        headers: request.headers.as_ref(),
        cookies: request.cookies.as_deref(),
        timeout: millis(page_load_timeout),
    };
    // serde_json escapes control characters, so the encoded object never
    // contains a raw newline.
    let mut line = serde_json::to_string(&wire)?;
    line.push('\n');
    Ok(line)
}

/// Response object as sent by the worker. Every key is optional.
#[derive(Debug, Default, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WireResponse {
    #[serde(default)]
    pub status: Option<String>,
    /// Any JSON number; the worker's value is passed through untouched.
    #[serde(default)]
    pub load_time: Option<Number>,
    #[serde(default)]
    pub paint_time: Option<Number>,
    #[serde(default)]
    pub base64: Option<String>,
    #[serde(default)]
    pub error: Option<String>,
}

impl WireResponse {
    pub fn parse(line: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(line.trim_end_matches(['\r', '\n']))
    }

    /// Copy every field the worker reported onto `response`, leaving the rest
    /// absent. A missing status is a failure.
    pub fn apply_to(self, response: &mut RenderResponse) {
        response.status = self
            .status
            .map(RenderStatus::from)
            .unwrap_or(RenderStatus::Fail);
        response.load_time = self.load_time;
        response.paint_time = self.paint_time;
        response.base64 = self.base64;
        response.error = self.error;
    }

    /// JSON form for debug logging with the image payload left out.
    pub fn redacted(&self) -> String {
        let mut shown = self.clone();
        if shown.base64.is_some() {
            shown.base64 = Some("<omitted>".to_string());
        }
        serde_json::to_string(&shown).unwrap_or_else(|err| format!("<unprintable: {err}>"))
    }
}
