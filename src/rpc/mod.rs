//! gRPC side of the runtime: one managed channel per backend service, an
//! interceptor chain around every call, and a registry of typed client
//! factories.

pub mod channel;
pub mod connection;
pub mod dialer;
pub mod errors;
pub mod interceptor;
pub mod registry;

pub use channel::{BoxBody, RpcChannel, Transport};
pub use connection::ConnectionManager;
pub use dialer::{Dialer, TonicDialer};
pub use errors::{BoxError, ChannelClosed, ConnectionError, RegistryError};
pub use registry::ClientRegistry;
