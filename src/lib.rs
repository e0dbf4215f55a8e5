//! Service connectivity runtime.
//!
//! Two halves:
//!
//! * [`rpc`]: named, long-lived gRPC channels with a shared interceptor
//!   chain, and typed clients built from them through a [`rpc::ClientRegistry`].
//! * [`messaging`]: a broker handle that declares its topology up front and
//!   hands out a serialized [`messaging::Publisher`] and a
//!   [`messaging::Consumer`] with ack/requeue semantics.
//!
//! Configuration lives in [`config`]; correlation ids flow through both
//! halves via [`correlation`].

pub mod config;
pub mod correlation;
pub mod messaging;
pub mod rpc;

pub use correlation::{current_correlation_id, with_correlation_id, CorrelationId};
pub use messaging::{Broker, BrokerError};
pub use rpc::errors::BoxError;
pub use rpc::{ClientRegistry, ConnectionError, ConnectionManager, RpcChannel};
