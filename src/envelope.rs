use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::forward::Fault;

/// HTTP-style verb carried inside a [`RequestEnvelope`].
///
/// Serialized as the uppercase verb name, which is also what the worker
/// side uses to pick the forwarding shape (query parameters for GET,
/// JSON body for the mutating verbs).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Method {
    #[serde(rename = "GET")]
    Get,
    #[serde(rename = "POST")]
    Post,
    #[serde(rename = "PUT")]
    Put,
    #[serde(rename = "DELETE")]
    Delete,
}

impl std::fmt::Display for Method {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Method::Get => "GET",
            Method::Post => "POST",
            Method::Put => "PUT",
            Method::Delete => "DELETE",
        };
        f.write_str(name)
    }
}

/// Request payload published to a domain's durable request queue.
///
/// The envelope is the unit the bridge moves around; everything beyond
/// `method` and `endpoint` is opaque to it and handed to the downstream
/// service untouched.
///
/// Optional fields are omitted from the serialized JSON when absent, so
/// a minimal request is just `{"method": "GET", "endpoint": "..."}`.
///
/// ## Example
///
/// ```rust
/// use courier::{Method, RequestEnvelope};
///
/// let request = RequestEnvelope::new(Method::Post, "http://localhost:8002/credits/add_credits")
///     .with_json(serde_json::json!({"user_id": 7, "amount": 25}));
///
/// assert_eq!(request.method, Method::Post);
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestEnvelope {
    /// Verb of the forwarded operation.
    pub method: Method,
    /// Absolute URL of the backend operation to invoke.
    pub endpoint: String,
    /// Request body, opaque to the bridge.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub json: Option<Value>,
    /// Query parameters, opaque to the bridge.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<HashMap<String, String>>,
    /// Header map, opaque to the bridge.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub headers: Option<HashMap<String, String>>,
}

impl RequestEnvelope {
    /// Create an envelope with only the mandatory fields set.
    pub fn new(method: Method, endpoint: impl Into<String>) -> Self {
        Self {
            method,
            endpoint: endpoint.into(),
            json: None,
            params: None,
            headers: None,
        }
    }

    /// Attach a JSON body.
    pub fn with_json(mut self, json: Value) -> Self {
        self.json = Some(json);
        self
    }

    /// Attach query parameters.
    pub fn with_params(mut self, params: HashMap<String, String>) -> Self {
        self.params = Some(params);
        self
    }

    /// Attach headers.
    pub fn with_headers(mut self, headers: HashMap<String, String>) -> Self {
        self.headers = Some(headers);
        self
    }
}

/// Reply payload published back to the caller's private reply queue.
///
/// Every call resolves to this shape: a passthrough of the downstream
/// response, a 500 wrapping a [`Fault`] built on the worker side, or a
/// 504 synthesized by the client when all attempts timed out. Callers
/// never have to branch on anything but `status_code`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReplyEnvelope {
    /// HTTP-style status of the forwarded call (or 500/504 for bridge
    /// failures).
    pub status_code: u16,
    /// Response headers; empty when the reply was synthesized.
    #[serde(default)]
    pub headers: HashMap<String, String>,
    /// Response body, or an error description for 500/504 replies.
    pub content: Value,
}

impl ReplyEnvelope {
    /// Reply synthesized by the client after exhausting its retry budget.
    pub fn gateway_timeout(attempts: u32, max_retries: u32) -> Self {
        Self {
            status_code: 504,
            headers: HashMap::new(),
            content: json!({
                "error": format!("RPC request timed out after {attempts}/{max_retries} retries"),
            }),
        }
    }

    /// Reply built on the worker side when the forwarded call could not
    /// be completed. The fault's tagged taxonomy ends up under the
    /// `error` key of `content`.
    pub fn fault(fault: &Fault) -> Self {
        Self {
            status_code: 500,
            headers: HashMap::new(),
            content: json!({ "error": fault }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn minimal_request_serializes_without_optional_keys() {
        let request = RequestEnvelope::new(Method::Get, "http://svc/x");
        let value = serde_json::to_value(&request).unwrap();

        assert_eq!(value, json!({"method": "GET", "endpoint": "http://svc/x"}));
    }

    #[test]
    fn request_round_trips_with_all_fields() {
        let request = RequestEnvelope::new(Method::Post, "http://svc/x")
            .with_json(json!({"a": 1}))
            .with_params(HashMap::from([("q".to_owned(), "7".to_owned())]))
            .with_headers(HashMap::from([(
                "authorization".to_owned(),
                "Bearer t".to_owned(),
            )]));

        let bytes = serde_json::to_vec(&request).unwrap();
        let decoded: RequestEnvelope = serde_json::from_slice(&bytes).unwrap();

        assert_eq!(decoded, request);
    }

    #[test]
    fn reply_decodes_with_missing_headers() {
        let decoded: ReplyEnvelope =
            serde_json::from_value(json!({"status_code": 200, "content": {"a": 1}})).unwrap();

        assert_eq!(decoded.status_code, 200);
        assert!(decoded.headers.is_empty());
        assert_eq!(decoded.content, json!({"a": 1}));
    }

    #[test]
    fn gateway_timeout_reports_attempt_count() {
        let reply = ReplyEnvelope::gateway_timeout(5, 5);

        assert_eq!(reply.status_code, 504);
        assert_eq!(
            reply.content,
            json!({"error": "RPC request timed out after 5/5 retries"})
        );
    }
}
