//! Forwarded-call seam between the worker dispatcher and the domain
//! backends.
//!
//! A worker does not know what a backend is, only that something can
//! turn a [`RequestEnvelope`] into a [`ReplyEnvelope`] or fail with a
//! classified [`Fault`]. That something is a [`Forward`] implementation:
//!
//! - [`HttpForwarder`]: plain JSON calls (GET/POST/PUT/DELETE)
//! - [`MultipartForwarder`]: multipart file uploads, the binary-payload
//!   variant carrying a base64 [`FilePayload`] inside the envelope
//!
//! Faults never cross the bridge as errors; the worker folds them into
//! a 500 reply so the caller always receives a uniform envelope.

use serde::{Deserialize, Serialize};

use crate::envelope::{ReplyEnvelope, RequestEnvelope};

#[cfg(feature = "http")]
use crate::envelope::Method;

/// Classification of a failed forwarded call, carried verbatim in the
/// reply `content` under the `error` key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FaultKind {
    /// The request envelope itself could not be decoded.
    Envelope,
    /// The forwarded call never completed (connect, send, or body read
    /// failure).
    Network,
    /// The envelope decoded, but its payload was unusable (e.g. a
    /// malformed base64 file).
    Payload,
}

impl std::fmt::Display for FaultKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            FaultKind::Envelope => "envelope",
            FaultKind::Network => "network",
            FaultKind::Payload => "payload",
        };
        f.write_str(name)
    }
}

/// A failed forwarded call: what went wrong and where.
///
/// Serializes as `{"kind": "network", "message": "..."}` so callers can
/// branch on the kind instead of parsing a free-form string.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Fault {
    pub kind: FaultKind,
    pub message: String,
}

impl Fault {
    /// The request envelope could not be decoded.
    pub fn envelope(message: impl ToString) -> Self {
        Self {
            kind: FaultKind::Envelope,
            message: message.to_string(),
        }
    }

    /// The forwarded call failed at the network level.
    pub fn network(message: impl ToString) -> Self {
        Self {
            kind: FaultKind::Network,
            message: message.to_string(),
        }
    }

    /// The envelope's payload was unusable.
    pub fn payload(message: impl ToString) -> Self {
        Self {
            kind: FaultKind::Payload,
            message: message.to_string(),
        }
    }
}

impl std::fmt::Display for Fault {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} fault: {}", self.kind, self.message)
    }
}

impl std::error::Error for Fault {}

/// Trait implemented by forwarded-call backends.
///
/// Implementations must not panic on bad input; every failure mode is a
/// [`Fault`] so the worker can answer the caller instead of dropping
/// the request.
#[async_trait::async_trait]
pub trait Forward {
    /// Perform the call described by `request` and report the outcome.
    async fn forward(&self, request: &RequestEnvelope) -> Result<ReplyEnvelope, Fault>;
}

/// Binary file carried inside a request envelope's `json` field.
///
/// The broker payload is JSON end to end, so file content travels
/// base64-encoded. [`FilePayload::new`] encodes on the way in;
/// [`FilePayload::bytes`] decodes on the worker side before the
/// multipart call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FilePayload {
    pub filename: String,
    /// Base64-encoded file content.
    pub content: String,
    pub content_type: String,
}

impl FilePayload {
    /// Encode raw file bytes into an envelope-ready payload.
    pub fn new(
        filename: impl Into<String>,
        content_type: impl Into<String>,
        bytes: &[u8],
    ) -> Self {
        use base64::Engine as _;

        Self {
            filename: filename.into(),
            content: base64::engine::general_purpose::STANDARD.encode(bytes),
            content_type: content_type.into(),
        }
    }

    /// Extract the payload from a request envelope's `json` field.
    pub fn from_request(request: &RequestEnvelope) -> Result<Self, Fault> {
        let json = request
            .json
            .as_ref()
            .ok_or_else(|| Fault::payload("file upload request carries no json field"))?;

        serde_json::from_value(json.clone())
            .map_err(|err| Fault::payload(format!("malformed file payload: {err}")))
    }

    /// Decode the base64 content back into raw bytes.
    pub fn bytes(&self) -> Result<Vec<u8>, Fault> {
        use base64::Engine as _;

        base64::engine::general_purpose::STANDARD
            .decode(&self.content)
            .map_err(|err| Fault::payload(format!("invalid base64 file content: {err}")))
    }
}

/// JSON-call forwarder backed by a shared `reqwest::Client`.
///
/// Verb mapping follows the envelope contract: GET sends `params` as
/// the query string, the mutating verbs send `json` as the body, and
/// `headers` apply to any verb.
#[cfg(feature = "http")]
#[derive(Clone, Default)]
pub struct HttpForwarder {
    client: reqwest::Client,
}

#[cfg(feature = "http")]
impl HttpForwarder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Use a preconfigured client (timeouts, proxies, TLS settings).
    pub fn with_client(client: reqwest::Client) -> Self {
        Self { client }
    }
}

#[cfg(feature = "http")]
#[async_trait::async_trait]
impl Forward for HttpForwarder {
    #[tracing::instrument(skip_all, fields(method = %request.method, endpoint = %request.endpoint))]
    async fn forward(&self, request: &RequestEnvelope) -> Result<ReplyEnvelope, Fault> {
        let mut builder = match request.method {
            Method::Get => self.client.get(&request.endpoint),
            Method::Post => self.client.post(&request.endpoint),
            Method::Put => self.client.put(&request.endpoint),
            Method::Delete => self.client.delete(&request.endpoint),
        };

        match request.method {
            Method::Get => {
                if let Some(params) = &request.params {
                    builder = builder.query(params);
                }
            }
            Method::Post | Method::Put | Method::Delete => {
                if let Some(json) = &request.json {
                    builder = builder.json(json);
                }
            }
        }

        if let Some(headers) = &request.headers {
            for (name, value) in headers {
                builder = builder.header(name.as_str(), value.as_str());
            }
        }

        let response = builder.send().await.map_err(Fault::network)?;
        reply_from_response(response).await
    }
}

/// Multipart file-upload forwarder, the worker variant for binary
/// payloads. Always POSTs, with the decoded file as a form part named
/// `file`.
#[cfg(feature = "http")]
#[derive(Clone, Default)]
pub struct MultipartForwarder {
    client: reqwest::Client,
}

#[cfg(feature = "http")]
impl MultipartForwarder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_client(client: reqwest::Client) -> Self {
        Self { client }
    }
}

#[cfg(feature = "http")]
#[async_trait::async_trait]
impl Forward for MultipartForwarder {
    #[tracing::instrument(skip_all, fields(endpoint = %request.endpoint))]
    async fn forward(&self, request: &RequestEnvelope) -> Result<ReplyEnvelope, Fault> {
        let file = FilePayload::from_request(request)?;
        let bytes = file.bytes()?;

        let part = reqwest::multipart::Part::bytes(bytes)
            .file_name(file.filename.clone())
            .mime_str(&file.content_type)
            .map_err(|err| {
                Fault::payload(format!("invalid content type {:?}: {err}", file.content_type))
            })?;
        let form = reqwest::multipart::Form::new().part("file", part);

        let response = self
            .client
            .post(&request.endpoint)
            .multipart(form)
            .send()
            .await
            .map_err(Fault::network)?;
        reply_from_response(response).await
    }
}

#[cfg(feature = "http")]
async fn reply_from_response(response: reqwest::Response) -> Result<ReplyEnvelope, Fault> {
    let status_code = response.status().as_u16();

    let mut headers = std::collections::HashMap::new();
    for (name, value) in response.headers() {
        headers.insert(
            name.to_string(),
            String::from_utf8_lossy(value.as_bytes()).into_owned(),
        );
    }

    let body = response.bytes().await.map_err(Fault::network)?;
    Ok(reply_from_parts(status_code, headers, &body))
}

/// Build a reply from raw response parts, parsing the body as JSON and
/// falling back to the raw text when the backend answered with
/// something unstructured.
#[cfg(feature = "http")]
fn reply_from_parts(
    status_code: u16,
    headers: std::collections::HashMap<String, String>,
    body: &[u8],
) -> ReplyEnvelope {
    let content = match serde_json::from_slice(body) {
        Ok(value) => value,
        Err(_) => serde_json::Value::String(String::from_utf8_lossy(body).into_owned()),
    };

    ReplyEnvelope {
        status_code,
        headers,
        content,
    }
}
