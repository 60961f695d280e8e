//! Client side of the bridge: correlated request/reply calls.
//!
//! An [`RpcClient`] turns the broker's asynchronous publish/subscribe
//! primitives into a bounded, retryable point-to-point call:
//!
//! - Each attempt publishes the request with a **fresh correlation id**
//!   and waits for a matching reply against a deadline.
//! - A timed-out attempt is abandoned; a late reply carrying the old id
//!   is discarded, never handed to a later attempt's waiter.
//! - Exhausting the retry budget yields a synthetic 504
//!   [`ReplyEnvelope`], so callers always receive a uniform reply shape
//!   and never see a timeout as an error.
//!
//! One client instance issues calls strictly sequentially. For shared,
//! cloneable access from request handlers, wrap the client in a
//! [`CallService`].

use std::{
    future::Future,
    pin::Pin,
    sync::Arc,
    task::{Context, Poll},
    time::Duration,
};

use tower::Service;
use tracing_error::SpanTrace;
use uuid::Uuid;

use crate::{
    envelope::{ReplyEnvelope, RequestEnvelope},
    transport::CallTransport,
};

/// Default number of publish attempts per call.
pub const DEFAULT_MAX_RETRIES: u32 = 5;

/// Default wall-clock budget for one attempt.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);

/// RPC client for one logical backend domain.
///
/// Constructed once per process and domain, holding one bound transport
/// (and with it one private reply queue) for its whole lifetime.
///
/// Retried calls publish with a new correlation id each time, and the
/// bridge offers no deduplication across attempts: a non-idempotent
/// forwarded call (e.g. a POST) can be executed more than once by the
/// backend if a worker succeeded but its reply was lost. Callers that
/// cannot tolerate this must carry an idempotency key inside the
/// forwarded request itself.
pub struct RpcClient<T> {
    transport: T,
    max_retries: u32,
    timeout: Duration,
}

impl<T> RpcClient<T>
where
    T: CallTransport,
    T::Error: Into<tower::BoxError>,
{
    /// Create a client over a bound transport with the default retry
    /// budget (5 attempts of 5 seconds each).
    pub fn new(transport: T) -> Self {
        Self {
            transport,
            max_retries: DEFAULT_MAX_RETRIES,
            timeout: DEFAULT_TIMEOUT,
        }
    }

    /// Override the number of publish attempts per call.
    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    /// Override the per-attempt timeout.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Issue a call and wait for its reply.
    ///
    /// Returns the decoded reply of the first attempt whose correlation
    /// id was matched, or a 504 [`ReplyEnvelope`] after `max_retries`
    /// attempts without a match. Errors only for transport failures and
    /// for replies that matched but could not be decoded.
    #[tracing::instrument(skip_all, fields(method = %request.method, endpoint = %request.endpoint))]
    pub async fn call(&mut self, request: &RequestEnvelope) -> Result<ReplyEnvelope, CallError> {
        let payload = serde_json::to_vec(request).map_err(CallError::codec)?;

        for attempt in 1..=self.max_retries {
            let correlation_id = Uuid::new_v4().to_string();
            self.transport
                .publish_request(&correlation_id, &payload)
                .await
                .map_err(|err| CallError::transport(err.into()))?;

            let deadline = tokio::time::sleep(self.timeout);
            tokio::pin!(deadline);

            loop {
                tokio::select! {
                    _ = &mut deadline => {
                        tracing::debug!(attempt, max_retries = self.max_retries, "attempt timed out");
                        break;
                    }
                    delivery = self.transport.next_reply() => {
                        match delivery.map_err(|err| CallError::transport(err.into()))? {
                            Some(reply)
                                if reply.correlation_id.as_deref()
                                    == Some(correlation_id.as_str()) =>
                            {
                                return serde_json::from_slice(&reply.payload)
                                    .map_err(CallError::codec);
                            }
                            Some(stale) => {
                                // Reply for an abandoned attempt.
                                tracing::debug!(
                                    correlation_id = ?stale.correlation_id,
                                    "discarding stale reply"
                                );
                            }
                            None => {
                                return Err(CallError::transport("reply queue closed".into()));
                            }
                        }
                    }
                }
            }
        }

        Ok(ReplyEnvelope::gateway_timeout(
            self.max_retries,
            self.max_retries,
        ))
    }

    /// Wrap this client into a cloneable [`CallService`] handle.
    pub fn into_service(self) -> CallService<T> {
        CallService {
            client: Arc::new(tokio::sync::Mutex::new(self)),
        }
    }
}

/// Cloneable `tower::Service` handle over an [`RpcClient`].
///
/// Applications construct their clients at startup, convert them with
/// [`RpcClient::into_service`], and hand clones to request handlers.
/// The handle serializes calls: the underlying client issues one call
/// at a time, matching the strictly sequential ordering of a single
/// client instance.
pub struct CallService<T> {
    client: Arc<tokio::sync::Mutex<RpcClient<T>>>,
}

impl<T> Clone for CallService<T> {
    fn clone(&self) -> Self {
        Self {
            client: Arc::clone(&self.client),
        }
    }
}

impl<T> Service<RequestEnvelope> for CallService<T>
where
    T: CallTransport + Send + 'static,
    T::Error: Into<tower::BoxError>,
{
    type Response = ReplyEnvelope;
    type Error = CallError;
    type Future = Pin<Box<dyn Future<Output = Result<ReplyEnvelope, CallError>> + Send>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, request: RequestEnvelope) -> Self::Future {
        let client = Arc::clone(&self.client);
        Box::pin(async move { client.lock().await.call(&request).await })
    }
}

/// Error returned by [`RpcClient::call`].
///
/// Captures the underlying kind and a tracing span backtrace for
/// diagnostics. Attempt timeouts are not errors; they surface as a 504
/// reply.
#[derive(Debug)]
pub struct CallError {
    context: SpanTrace,
    kind: CallErrorKind,
}

/// Call error kinds.
#[derive(Debug)]
pub enum CallErrorKind {
    /// Publishing failed or the reply queue is gone.
    Transport(tower::BoxError),
    /// The request failed to serialize, or a matched reply failed to
    /// decode.
    Codec(serde_json::Error),
}

impl CallError {
    fn transport(err: tower::BoxError) -> Self {
        Self {
            context: SpanTrace::capture(),
            kind: CallErrorKind::Transport(err),
        }
    }

    fn codec(err: serde_json::Error) -> Self {
        Self {
            context: SpanTrace::capture(),
            kind: CallErrorKind::Codec(err),
        }
    }

    /// The underlying error kind.
    pub fn kind(&self) -> &CallErrorKind {
        &self.kind
    }
}

impl std::fmt::Display for CallError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.kind {
            CallErrorKind::Transport(err) => writeln!(f, "Transport error: {err}"),
            CallErrorKind::Codec(err) => writeln!(f, "Codec error: {err}"),
        }?;
        self.context.fmt(f)
    }
}

impl std::error::Error for CallError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match &self.kind {
            CallErrorKind::Transport(err) => Some(err.as_ref()),
            CallErrorKind::Codec(err) => Some(err),
        }
    }
}
