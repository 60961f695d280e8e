#![doc = include_str!("../README.md")]

pub mod client;
pub mod domain;
pub mod envelope;
pub mod forward;
pub mod transport;
pub mod worker;

#[doc(inline)]
pub use envelope::{Method, ReplyEnvelope, RequestEnvelope};

#[doc(inline)]
pub use domain::Domain;

#[doc(inline)]
pub use client::{CallError, CallErrorKind, CallService, RpcClient};

#[doc(inline)]
pub use forward::{Fault, FaultKind, FilePayload, Forward};

#[doc(inline)]
pub use transport::{CallTransport, InMemoryBroker, WorkTransport};

#[doc(inline)]
pub use worker::{DefaultWorkerHook, Worker, WorkerHook, WorkerRunError, WorkerRunErrorKind};
