//! Proxied request executor.
//!
//! Requests go through the daemon's local SOCKS port with `socks5h`, so name
//! resolution happens on the far side of the proxy as well.

use std::borrow::Cow;
use std::collections::BTreeMap;
use std::time::Duration;

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, CONTENT_TYPE};
use serde_json::{json, Value};

use torbridge_core::{BridgeError, HttpMethod};

const OCTET_STREAM: &str = "application/octet-stream";

/// One host request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxiedRequest {
    pub url: String,
    pub method: HttpMethod,
    /// Only sent for POST. Base64 when the content type is octet-stream.
    pub body: String,
    pub headers: BTreeMap<String, String>,
    /// Skips certificate validation. Unsafe; meant for local/test daemons.
    pub trust_invalid_certificates: bool,
}

impl ProxiedRequest {
    pub fn new(url: impl Into<String>, method: HttpMethod) -> Self {
        Self {
            url: url.into(),
            method,
            body: String::new(),
            headers: BTreeMap::new(),
            trust_invalid_certificates: false,
        }
    }

    pub fn body(mut self, body: impl Into<String>) -> Self {
        self.body = body.into();
        self
    }

    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    pub fn trust_invalid_certificates(mut self, trust: bool) -> Self {
        self.trust_invalid_certificates = trust;
        self
    }

    /// Reject a malformed URL before any network work happens.
    pub fn parsed_url(&self) -> Result<reqwest::Url, BridgeError> {
        reqwest::Url::parse(&self.url).map_err(|_| BridgeError::UrlParseError(self.url.clone()))
    }

    fn content_type(&self) -> Option<&str> {
        self.headers
            .iter()
            .find(|(name, _)| name.eq_ignore_ascii_case("content-type"))
            .map(|(_, value)| value.as_str())
    }
}

/// Normalized 2xx response.
#[derive(Debug, Clone, PartialEq)]
pub struct RequestResult {
    pub status: u16,
    pub headers: BTreeMap<String, String>,
    pub body: Vec<u8>,
    /// Media type without parameters, lowercased.
    pub mime_type: Option<String>,
    /// Parsed body, present only for JSON-like media types that parsed.
    pub json: Option<Value>,
}

impl RequestResult {
    pub fn body_text(&self) -> Cow<'_, str> {
        String::from_utf8_lossy(&self.body)
    }

    /// The object shape the mobile hosts resolve with.
    pub fn host_payload(&self) -> Value {
        json!({
            "b64Data": STANDARD.encode(&self.body),
            "mimeType": self.mime_type,
            "headers": self.headers,
            "respCode": self.status,
            "json": self.json,
        })
    }
}

/// Execute `request` through the SOCKS proxy on `127.0.0.1:socks_port`.
pub async fn execute(
    socks_port: u16,
    client_timeout: Duration,
    request: &ProxiedRequest,
) -> Result<RequestResult, BridgeError> {
    let url = request.parsed_url()?;
    let client = build_client(
        socks_port,
        client_timeout,
        &request.headers,
        request.trust_invalid_certificates,
    )?;

    let builder = match request.method {
        HttpMethod::Get => client.get(url),
        HttpMethod::Delete => client.delete(url),
        HttpMethod::Post => client
            .post(url)
            .body(encode_body(request.content_type(), &request.body)?),
    };

    tracing::debug!(method = %request.method, url = %request.url, "sending proxied request");
    let response = builder
        .send()
        .await
        .map_err(|err| BridgeError::Network(err.to_string()))?;

    let status = response.status().as_u16();
    let headers = collect_headers(response.headers());
    let mime_type = response
        .headers()
        .get(CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
        .map(media_type);
    let body = response
        .bytes()
        .await
        .map_err(|err| BridgeError::Network(err.to_string()))?
        .to_vec();

    if !(200..=299).contains(&status) {
        return Err(BridgeError::RequestError {
            status,
            body: String::from_utf8_lossy(&body).into_owned(),
        });
    }

    let json = match mime_type.as_deref() {
        Some(mime) if is_json_like(mime) => match serde_json::from_slice(&body) {
            Ok(value) => Some(value),
            Err(err) => {
                tracing::debug!(error = %err, "response declared JSON but did not parse");
                None
            }
        },
        _ => None,
    };

    Ok(RequestResult {
        status,
        headers,
        body,
        mime_type,
        json,
    })
}

fn build_client(
    socks_port: u16,
    timeout: Duration,
    headers: &BTreeMap<String, String>,
    trust_invalid_certificates: bool,
) -> Result<reqwest::Client, BridgeError> {
    let proxy = reqwest::Proxy::all(format!("socks5h://127.0.0.1:{socks_port}"))
        .map_err(|err| BridgeError::ClientBuild(err.to_string()))?;

    let mut builder = reqwest::Client::builder()
        .proxy(proxy)
        .timeout(timeout)
        .default_headers(header_map(headers)?);

    if trust_invalid_certificates {
        tracing::warn!("certificate validation disabled for this request; only use with local/test daemons");
        builder = builder.danger_accept_invalid_certs(true);
    }

    builder
        .build()
        .map_err(|err| BridgeError::ClientBuild(err.to_string()))
}

fn header_map(headers: &BTreeMap<String, String>) -> Result<HeaderMap, BridgeError> {
    let mut map = HeaderMap::new();
    for (name, value) in headers {
        let name = HeaderName::from_bytes(name.as_bytes())
            .map_err(|_| BridgeError::ClientBuild(format!("invalid header name '{name}'")))?;
        let value = HeaderValue::from_str(value)
            .map_err(|_| BridgeError::ClientBuild(format!("invalid value for header '{name}'")))?;
        map.insert(name, value);
    }
    Ok(map)
}

/// Octet-stream bodies travel base64-encoded from the host; everything else
/// is sent as the UTF-8 text it already is.
pub(crate) fn encode_body(content_type: Option<&str>, body: &str) -> Result<Vec<u8>, BridgeError> {
    match content_type.map(media_type) {
        Some(mime) if mime == OCTET_STREAM => STANDARD
            .decode(body.trim())
            .map_err(|err| BridgeError::BodyDecode(err.to_string())),
        _ => Ok(body.as_bytes().to_vec()),
    }
}

fn media_type(content_type: &str) -> String {
    content_type
        .split(';')
        .next()
        .unwrap_or_default()
        .trim()
        .to_ascii_lowercase()
}

pub(crate) fn is_json_like(mime: &str) -> bool {
    matches!(
        mime,
        "application/json" | "application/javascript" | "text/json"
    ) || mime.ends_with("+json")
}

fn collect_headers(headers: &HeaderMap) -> BTreeMap<String, String> {
    let mut out: BTreeMap<String, String> = BTreeMap::new();
    for (name, value) in headers {
        let value = String::from_utf8_lossy(value.as_bytes()).into_owned();
        out.entry(name.as_str().to_string())
            .and_modify(|existing| {
                existing.push_str(", ");
                existing.push_str(&value);
            })
            .or_insert(value);
    }
    out
}
