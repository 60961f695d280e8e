//! Worker side of the bridge: queue consumption and request dispatch.
//!
//! A [`Worker`] fronts one domain backend. It:
//!
//! - Consumes the domain's durable request queue one delivery at a time
//! - Rewrites loopback endpoint hosts for container-network addressing
//! - Performs the forwarded call through a [`Forward`] backend
//! - Publishes the outcome to the caller's reply queue, then
//!   acknowledges the delivery
//!
//! Acknowledgement is unconditional on the forwarded call's outcome: a
//! permanently failing call is answered with a 500 fault reply and
//! acknowledged, never left to redeliver forever. Horizontal scale-out
//! is a matter of running more worker processes against the same queue.
//!
//! The loop runs until:
//! - A [`CancellationToken`] is triggered
//! - The request queue stream ends
//! - The transport fails (consume, publish, or ack)

use tokio_util::sync::CancellationToken;
use tracing_error::SpanTrace;

use crate::{
    envelope::{ReplyEnvelope, RequestEnvelope},
    forward::{Fault, Forward},
    transport::{RequestDelivery, WorkTransport},
};

/// Worker dispatcher for one logical backend domain.
///
/// Generic parameters:
/// - `T`: worker-side broker transport
/// - `F`: forwarded-call backend
/// - `HK`: hook implementation for lifecycle events
pub struct Worker<T, F, HK = DefaultWorkerHook> {
    transport: T,
    forwarder: F,
    hook: HK,
    internal_host: Option<String>,
}

impl<T, F> Worker<T, F, DefaultWorkerHook>
where
    T: WorkTransport,
    F: Forward,
{
    /// Create a worker with the default hook implementation.
    pub fn new(transport: T, forwarder: F) -> Self {
        Self {
            transport,
            forwarder,
            hook: DefaultWorkerHook,
            internal_host: None,
        }
    }
}

impl<T, F, HK> Worker<T, F, HK>
where
    T: WorkTransport,
    T::Error: Into<tower::BoxError>,
    F: Forward,
    HK: WorkerHook,
{
    /// Replace the worker hook while keeping all other generics
    /// unchanged.
    pub fn with_hook<HK2: WorkerHook>(self, hook: HK2) -> Worker<T, F, HK2> {
        Worker {
            transport: self.transport,
            forwarder: self.forwarder,
            hook,
            internal_host: self.internal_host,
        }
    }

    /// Rewrite loopback endpoint hosts to the given internal hostname
    /// before forwarding. Deployment-topology concern: inside a
    /// container network, a gateway-supplied `localhost` endpoint must
    /// resolve to the backend's service name instead. A `localhost`
    /// override disables rewriting.
    pub fn with_internal_host(mut self, host: impl Into<String>) -> Self {
        self.internal_host = Some(host.into());
        self
    }

    /// Run the dispatch loop.
    ///
    /// Each delivery is decoded, forwarded, answered, and acknowledged
    /// exactly once, in that order. Per-delivery failures become fault
    /// replies; only broker-level failures end the loop.
    #[tracing::instrument(skip(self))]
    pub async fn run(mut self, cancel: CancellationToken) -> Result<(), WorkerRunError> {
        self.hook.on_startup();

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    self.hook.on_shutdown();
                    break;
                }
                delivery = self.transport.next_request() => {
                    match delivery {
                        Ok(Some(delivery)) => self.process(delivery).await?,
                        Ok(None) => {
                            self.hook.on_stream_end();
                            return Ok(());
                        }
                        Err(err) => {
                            let err = err.into();
                            self.hook.on_transport_error(err.as_ref());
                            return Err(WorkerRunError::transport(err));
                        }
                    }
                }
            }
        }

        Ok(())
    }

    async fn process(&mut self, delivery: RequestDelivery) -> Result<(), WorkerRunError> {
        let reply = self.dispatch(&delivery.payload).await;
        let payload = serde_json::to_vec(&reply).map_err(WorkerRunError::codec)?;

        if let Some(reply_to) = &delivery.reply_to {
            // A missing correlation id can never be matched, but the
            // reply queue owner still gets to observe the outcome.
            let correlation_id = delivery.correlation_id.as_deref().unwrap_or_default();
            self.transport
                .publish_reply(reply_to, correlation_id, &payload)
                .await
                .map_err(|err| WorkerRunError::transport(err.into()))?;
            self.hook.on_reply_published(&reply);
        } else {
            tracing::warn!("delivery carries no reply-to address, dropping reply");
        }

        self.transport
            .ack(delivery.delivery_tag)
            .await
            .map_err(|err| WorkerRunError::transport(err.into()))?;

        Ok(())
    }

    /// Turn one request payload into a reply envelope. Infallible:
    /// every failure mode folds into a fault reply.
    async fn dispatch(&self, payload: &[u8]) -> ReplyEnvelope {
        let mut request: RequestEnvelope = match serde_json::from_slice(payload) {
            Ok(request) => request,
            Err(err) => {
                let fault = Fault::envelope(format!("malformed request envelope: {err}"));
                self.hook.on_fault(&fault);
                return ReplyEnvelope::fault(&fault);
            }
        };
        self.hook.on_request(&request);

        if let Some(host) = &self.internal_host {
            request.endpoint = rewrite_endpoint(&request.endpoint, host);
        }

        match self.forwarder.forward(&request).await {
            Ok(reply) => reply,
            Err(fault) => {
                self.hook.on_fault(&fault);
                ReplyEnvelope::fault(&fault)
            }
        }
    }
}

/// The internal hostname override from `RESPONSIBLE_HOST`, if set.
///
/// Deployments pass the backend's service name here so workers can
/// rewrite gateway-supplied loopback endpoints; see
/// [`Worker::with_internal_host`].
pub fn internal_host_from_env() -> Option<String> {
    std::env::var("RESPONSIBLE_HOST").ok()
}

/// Substitute a loopback endpoint host with the internal hostname.
///
/// Only the host component changes; scheme, port, path, and query pass
/// through. Endpoints that are not loopback, or that do not parse as
/// URLs, are returned unchanged (an unusable endpoint then fails in the
/// forwarder and is reported as a fault).
fn rewrite_endpoint(endpoint: &str, internal_host: &str) -> String {
    if internal_host == "localhost" {
        return endpoint.to_owned();
    }

    let Ok(mut url) = url::Url::parse(endpoint) else {
        return endpoint.to_owned();
    };

    match url.host_str() {
        Some("localhost") | Some("127.0.0.1") => {
            if url.set_host(Some(internal_host)).is_ok() {
                url.to_string()
            } else {
                endpoint.to_owned()
            }
        }
        _ => endpoint.to_owned(),
    }
}

/// Hook trait for observing worker lifecycle events.
///
/// Hooks are invoked synchronously and should avoid heavy or blocking
/// work. Typical use cases include logging, metrics, and tracing
/// integration.
pub trait WorkerHook: Send + Sync {
    fn on_startup(&self);
    fn on_shutdown(&self);
    fn on_request(&self, request: &RequestEnvelope);
    fn on_reply_published(&self, reply: &ReplyEnvelope);
    fn on_fault(&self, fault: &Fault);
    fn on_transport_error(&self, error: &dyn std::error::Error);
    fn on_stream_end(&self);
}

/// Default worker hook implementation.
///
/// Logs lifecycle events using `tracing`.
pub struct DefaultWorkerHook;

impl WorkerHook for DefaultWorkerHook {
    fn on_startup(&self) {
        tracing::info!("Worker is starting up, awaiting requests");
    }

    fn on_shutdown(&self) {
        tracing::info!("Worker is shutting down");
    }

    fn on_request(&self, request: &RequestEnvelope) {
        tracing::debug!(method = %request.method, endpoint = %request.endpoint, "Request received");
    }

    fn on_reply_published(&self, reply: &ReplyEnvelope) {
        tracing::info!(status_code = reply.status_code, "Reply published");
    }

    fn on_fault(&self, fault: &Fault) {
        tracing::error!(%fault, "Forwarded call failed");
    }

    fn on_transport_error(&self, error: &dyn std::error::Error) {
        tracing::error!(?error, "Broker transport failed");
    }

    fn on_stream_end(&self) {
        tracing::info!("Request queue stream ended");
    }
}

/// Error returned when the worker loop fails.
#[derive(Debug)]
pub struct WorkerRunError {
    context: SpanTrace,
    kind: WorkerRunErrorKind,
}

/// Classification of worker runtime errors.
#[derive(Debug)]
pub enum WorkerRunErrorKind {
    /// Errors originating from the broker transport.
    Transport(tower::BoxError),
    /// A reply envelope failed to serialize.
    Codec(serde_json::Error),
}

impl WorkerRunError {
    fn transport(err: tower::BoxError) -> Self {
        Self {
            context: SpanTrace::capture(),
            kind: WorkerRunErrorKind::Transport(err),
        }
    }

    fn codec(err: serde_json::Error) -> Self {
        Self {
            context: SpanTrace::capture(),
            kind: WorkerRunErrorKind::Codec(err),
        }
    }
}

impl std::fmt::Display for WorkerRunError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.kind {
            WorkerRunErrorKind::Transport(err) => writeln!(f, "Transport error: {err}"),
            WorkerRunErrorKind::Codec(err) => writeln!(f, "Codec error: {err}"),
        }?;
        self.context.fmt(f)
    }
}

impl std::error::Error for WorkerRunError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match &self.kind {
            WorkerRunErrorKind::Transport(err) => Some(err.as_ref()),
            WorkerRunErrorKind::Codec(err) => Some(err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        client::RpcClient,
        envelope::Method,
        forward::FaultKind,
        transport::{CallTransport as _, InMemoryBroker},
    };
    use serde_json::json;
    use std::{
        collections::VecDeque,
        sync::{Arc, Mutex},
    };

    struct EchoForward;

    #[async_trait::async_trait]
    impl Forward for EchoForward {
        async fn forward(&self, request: &RequestEnvelope) -> Result<ReplyEnvelope, Fault> {
            Ok(ReplyEnvelope {
                status_code: 200,
                headers: Default::default(),
                content: json!({"echo": request.endpoint}),
            })
        }
    }

    struct FailForward;

    #[async_trait::async_trait]
    impl Forward for FailForward {
        async fn forward(&self, _request: &RequestEnvelope) -> Result<ReplyEnvelope, Fault> {
            Err(Fault::network("connection refused"))
        }
    }

    /// Scripted transport feeding fixed deliveries, recording what the
    /// worker publishes and acknowledges. Ends the stream when drained.
    struct ScriptedTransport {
        deliveries: VecDeque<RequestDelivery>,
        replies: Arc<Mutex<Vec<(String, String, Vec<u8>)>>>,
        acked: Arc<Mutex<Vec<u64>>>,
    }

    #[async_trait::async_trait]
    impl WorkTransport for ScriptedTransport {
        type Error = std::io::Error;

        async fn next_request(&mut self) -> Result<Option<RequestDelivery>, Self::Error> {
            Ok(self.deliveries.pop_front())
        }

        async fn publish_reply(
            &mut self,
            reply_to: &str,
            correlation_id: &str,
            payload: &[u8],
        ) -> Result<(), Self::Error> {
            self.replies.lock().unwrap().push((
                reply_to.to_owned(),
                correlation_id.to_owned(),
                payload.to_vec(),
            ));
            Ok(())
        }

        async fn ack(&mut self, delivery_tag: u64) -> Result<(), Self::Error> {
            self.acked.lock().unwrap().push(delivery_tag);
            Ok(())
        }
    }

    fn request_bytes(endpoint: &str) -> Vec<u8> {
        serde_json::to_vec(&RequestEnvelope::new(Method::Get, endpoint)).unwrap()
    }

    #[tokio::test]
    async fn forwards_and_replies_end_to_end() {
        let broker = InMemoryBroker::new();
        let cancel = CancellationToken::new();

        let worker = Worker::new(broker.worker(), EchoForward);
        let handle = tokio::spawn(worker.run(cancel.clone()));

        let mut client = RpcClient::new(broker.caller());
        let reply = client
            .call(&RequestEnvelope::new(Method::Get, "http://svc/x"))
            .await
            .unwrap();

        assert_eq!(reply.status_code, 200);
        assert_eq!(reply.content, json!({"echo": "http://svc/x"}));

        // Cancellation is only observed between deliveries, so joining
        // the worker guarantees the delivery was fully processed.
        cancel.cancel();
        handle.await.unwrap().unwrap();
        assert_eq!(broker.acked_tags().len(), 1);
    }

    #[tokio::test]
    async fn failed_forward_becomes_fault_reply_and_is_acked() {
        let broker = InMemoryBroker::new();
        let cancel = CancellationToken::new();

        let worker = Worker::new(broker.worker(), FailForward);
        let handle = tokio::spawn(worker.run(cancel.clone()));

        let mut client = RpcClient::new(broker.caller());
        let reply = client
            .call(&RequestEnvelope::new(Method::Post, "http://svc/x"))
            .await
            .unwrap();

        assert_eq!(reply.status_code, 500);
        assert_eq!(
            reply.content,
            json!({"error": {"kind": "network", "message": "connection refused"}})
        );

        cancel.cancel();
        handle.await.unwrap().unwrap();
        // Acknowledged despite the failure: no broker-level redelivery.
        assert_eq!(broker.acked_tags().len(), 1);
    }

    #[tokio::test]
    async fn malformed_request_envelope_is_answered_with_envelope_fault() {
        let broker = InMemoryBroker::new();
        let cancel = CancellationToken::new();

        let worker = Worker::new(broker.worker(), EchoForward);
        let handle = tokio::spawn(worker.run(cancel.clone()));

        let mut caller = broker.caller();
        caller
            .publish_request("corr-1", b"not an envelope")
            .await
            .unwrap();

        let delivery = caller.next_reply().await.unwrap().unwrap();
        assert_eq!(delivery.correlation_id.as_deref(), Some("corr-1"));

        let reply: ReplyEnvelope = serde_json::from_slice(&delivery.payload).unwrap();
        assert_eq!(reply.status_code, 500);
        let fault: Fault = serde_json::from_value(reply.content["error"].clone()).unwrap();
        assert_eq!(fault.kind, FaultKind::Envelope);

        cancel.cancel();
        handle.await.unwrap().unwrap();
        assert_eq!(broker.acked_tags().len(), 1);
    }

    #[tokio::test]
    async fn delivery_without_reply_to_is_acked_and_dropped() {
        let replies = Arc::new(Mutex::new(Vec::new()));
        let acked = Arc::new(Mutex::new(Vec::new()));
        let transport = ScriptedTransport {
            deliveries: VecDeque::from([RequestDelivery {
                delivery_tag: 7,
                correlation_id: Some("corr-1".to_owned()),
                reply_to: None,
                payload: request_bytes("http://svc/x"),
            }]),
            replies: Arc::clone(&replies),
            acked: Arc::clone(&acked),
        };

        let worker = Worker::new(transport, EchoForward);
        worker.run(CancellationToken::new()).await.unwrap();

        assert!(replies.lock().unwrap().is_empty());
        assert_eq!(*acked.lock().unwrap(), vec![7]);
    }

    #[tokio::test]
    async fn rewrites_loopback_endpoint_before_forwarding() {
        let seen = Arc::new(Mutex::new(Vec::new()));

        struct RecordingForward(Arc<Mutex<Vec<String>>>);

        #[async_trait::async_trait]
        impl Forward for RecordingForward {
            async fn forward(&self, request: &RequestEnvelope) -> Result<ReplyEnvelope, Fault> {
                self.0.lock().unwrap().push(request.endpoint.clone());
                Ok(ReplyEnvelope {
                    status_code: 200,
                    headers: Default::default(),
                    content: json!(null),
                })
            }
        }

        let replies = Arc::new(Mutex::new(Vec::new()));
        let acked = Arc::new(Mutex::new(Vec::new()));
        let transport = ScriptedTransport {
            deliveries: VecDeque::from([RequestDelivery {
                delivery_tag: 1,
                correlation_id: Some("corr-1".to_owned()),
                reply_to: Some("amq.gen-0".to_owned()),
                payload: request_bytes("http://localhost:8002/credits/add_credits"),
            }]),
            replies,
            acked,
        };

        let worker = Worker::new(transport, RecordingForward(Arc::clone(&seen)))
            .with_internal_host("credits-svc");
        worker.run(CancellationToken::new()).await.unwrap();

        assert_eq!(
            *seen.lock().unwrap(),
            vec!["http://credits-svc:8002/credits/add_credits".to_owned()]
        );
    }

    #[test]
    fn rewrite_substitutes_loopback_hosts_only() {
        assert_eq!(
            rewrite_endpoint("http://localhost:8002/credits/add_credits", "credits-svc"),
            "http://credits-svc:8002/credits/add_credits"
        );
        assert_eq!(
            rewrite_endpoint("http://127.0.0.1:8002/credits", "credits-svc"),
            "http://credits-svc:8002/credits"
        );
        assert_eq!(
            rewrite_endpoint("http://review-svc:8001/reviews", "credits-svc"),
            "http://review-svc:8001/reviews"
        );
    }

    #[test]
    fn rewrite_is_disabled_for_localhost_override() {
        assert_eq!(
            rewrite_endpoint("http://localhost:8002/credits", "localhost"),
            "http://localhost:8002/credits"
        );
    }

    #[test]
    fn rewrite_leaves_unparseable_endpoints_alone() {
        assert_eq!(rewrite_endpoint("not a url", "credits-svc"), "not a url");
    }
}
