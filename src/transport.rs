//! Broker seam for both sides of the bridge.
//!
//! The client and worker never talk to a broker crate directly; they
//! talk to these traits, keeping the call/dispatch logic independent of
//! the concrete backend (in-memory for tests and local pipelines,
//! RabbitMQ in deployments).
//!
//! ## Key components
//!
//! - [`CallTransport`]: client side, publishing correlated requests and
//!   receiving deliveries from a private reply queue
//! - [`WorkTransport`]: worker side, consuming requests, publishing
//!   replies, and acknowledging deliveries
//! - [`ReplyDelivery`] / [`RequestDelivery`]: broker-agnostic views of
//!   a delivery and the metadata the bridge needs from it

pub mod inmemory;

#[cfg(feature = "rabbitmq")]
pub mod rabbitmq;

pub use inmemory::InMemoryBroker;

/// A delivery observed on a client's private reply queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplyDelivery {
    /// Correlation id echoed by the worker, if any.
    pub correlation_id: Option<String>,
    /// Serialized reply envelope.
    pub payload: Vec<u8>,
}

/// A delivery observed on a domain's durable request queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestDelivery {
    /// Broker-assigned tag used to acknowledge this delivery.
    pub delivery_tag: u64,
    /// Correlation id set by the publishing client, if any.
    pub correlation_id: Option<String>,
    /// Address of the caller's private reply queue, if any.
    pub reply_to: Option<String>,
    /// Serialized request envelope.
    pub payload: Vec<u8>,
}

/// Client-side transport: one private reply queue, publishes to one
/// domain's fixed request queue.
///
/// Implementations own the reply queue for the lifetime of the value;
/// it is created at bind time and reused across calls.
#[async_trait::async_trait]
pub trait CallTransport {
    /// Backend-specific error type.
    type Error: Into<tower::BoxError>;

    /// Publish one request envelope to the domain's request queue,
    /// marked persistent and tagged with this transport's reply-to
    /// address and the given correlation id.
    async fn publish_request(
        &mut self,
        correlation_id: &str,
        payload: &[u8],
    ) -> Result<(), Self::Error>;

    /// Wait for the next delivery on the private reply queue.
    ///
    /// Returns `Ok(None)` when the queue is gone (connection closed).
    async fn next_reply(&mut self) -> Result<Option<ReplyDelivery>, Self::Error>;
}

/// Worker-side transport: consumes one domain's durable request queue
/// with at most one unacknowledged delivery in flight.
#[async_trait::async_trait]
pub trait WorkTransport {
    /// Backend-specific error type.
    type Error: Into<tower::BoxError>;

    /// Wait for the next request delivery.
    ///
    /// Returns `Ok(None)` when the queue is gone (connection closed).
    async fn next_request(&mut self) -> Result<Option<RequestDelivery>, Self::Error>;

    /// Publish a reply envelope to the caller's reply queue, echoing
    /// the caller's correlation id.
    async fn publish_reply(
        &mut self,
        reply_to: &str,
        correlation_id: &str,
        payload: &[u8],
    ) -> Result<(), Self::Error>;

    /// Acknowledge a delivery. Must be called exactly once per
    /// delivery, after the reply has been published.
    async fn ack(&mut self, delivery_tag: u64) -> Result<(), Self::Error>;
}
