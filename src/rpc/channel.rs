use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};

use bytes::Bytes;
use futures::future::BoxFuture;
use http_body_util::{BodyExt, Full};
use tower::util::BoxCloneSyncService;
use tower::Service;

use super::errors::{BoxError, ChannelClosed};

pub type BoxBody = tonic::body::BoxBody;

/// A dialed connection to one backend, before or after interception.
pub type Transport =
    BoxCloneSyncService<http::Request<BoxBody>, http::Response<BoxBody>, BoxError>;

/// Convert any `Bytes` body into the boxed body tonic clients speak.
pub fn into_box_body<B>(body: B) -> BoxBody
where
    B: http_body::Body<Data = Bytes> + Send + 'static,
    B::Error: Into<BoxError>,
{
    body.map_err(|e| tonic::Status::from_error(e.into()))
        .boxed_unsync()
}

pub(crate) fn full_body(bytes: Bytes) -> BoxBody {
    into_box_body(Full::new(bytes))
}

struct ChannelState {
    service: String,
    target: String,
    closed: AtomicBool,
}

/// Long-lived, intercepted channel to one backend service.
///
/// Clones share the same underlying connection and the same closed flag, so
/// typed clients built from a channel stop working once the channel closes.
#[derive(Clone)]
pub struct RpcChannel {
    inner: Transport,
    state: Arc<ChannelState>,
}

impl RpcChannel {
    pub fn new(service: impl Into<String>, target: impl Into<String>, inner: Transport) -> Self {
        Self {
            inner,
            state: Arc::new(ChannelState {
                service: service.into(),
                target: target.into(),
                closed: AtomicBool::new(false),
            }),
        }
    }

    pub fn service(&self) -> &str {
        &self.state.service
    }

    pub fn target(&self) -> &str {
        &self.state.target
    }

    /// True if both handles refer to the same established channel.
    pub fn same_channel(&self, other: &RpcChannel) -> bool {
        Arc::ptr_eq(&self.state, &other.state)
    }

    pub fn is_closed(&self) -> bool {
        self.state.closed.load(Ordering::Acquire)
    }

    /// Close the channel for every clone. Closing twice is an error.
    pub fn close(&self) -> Result<(), ChannelClosed> {
        if self.state.closed.swap(true, Ordering::AcqRel) {
            return Err(self.closed_error());
        }
        Ok(())
    }

    fn closed_error(&self) -> ChannelClosed {
        ChannelClosed {
            service: self.state.service.clone(),
        }
    }
}

impl fmt::Debug for RpcChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RpcChannel")
            .field("service", &self.state.service)
            .field("target", &self.state.target)
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl Service<http::Request<BoxBody>> for RpcChannel {
    type Response = http::Response<BoxBody>;
    type Error = BoxError;
    type Future = BoxFuture<'static, Result<Self::Response, Self::Error>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        if self.is_closed() {
            return Poll::Ready(Err(Box::new(self.closed_error())));
        }
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, request: http::Request<BoxBody>) -> Self::Future {
        if self.is_closed() {
            let err: BoxError = Box::new(self.closed_error());
            return Box::pin(async move { Err(err) });
        }
        Box::pin(self.inner.call(request))
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;

    /// A transport that answers every call with an empty 200 response.
    pub(crate) fn ok_transport() -> Transport {
        BoxCloneSyncService::new(tower::service_fn(|_req: http::Request<BoxBody>| async {
            Ok::<_, BoxError>(http::Response::new(full_body(Bytes::new())))
        }))
    }

    pub(crate) fn echo_channel(service: &str) -> RpcChannel {
        RpcChannel::new(service, format!("{service}.test:50051"), ok_transport())
    }
}

#[cfg(test)]
mod tests {
    use super::testing::echo_channel;
    use super::*;
    use tower::ServiceExt;

    fn request() -> http::Request<BoxBody> {
        http::Request::builder()
            .uri("http://svc.test/pkg.Service/Method")
            .body(full_body(Bytes::new()))
            .unwrap()
    }

    #[tokio::test]
    async fn clones_share_identity_and_closed_flag() {
        let channel = echo_channel("users");
        let clone = channel.clone();
        assert!(channel.same_channel(&clone));
        assert!(!echo_channel("users").same_channel(&channel));

        channel.close().unwrap();
        assert!(clone.is_closed());

        let err = clone.oneshot(request()).await.unwrap_err();
        assert!(err.downcast_ref::<ChannelClosed>().is_some());
    }

    #[test]
    fn closing_twice_fails() {
        let channel = echo_channel("orders");
        channel.close().unwrap();
        let err = channel.close().unwrap_err();
        assert_eq!(err.service, "orders");
    }

    #[tokio::test]
    async fn open_channel_forwards_calls() {
        let response = echo_channel("users").oneshot(request()).await.unwrap();
        assert_eq!(response.status(), http::StatusCode::OK);
    }
}
