//! Per-service interception of RPC calls.
//!
//! A service implementation declares at registration time whether it
//! intercepts unary calls, streaming calls, both, or neither. The
//! [`Intercepted`] wrapper resolves every call against that declaration
//! and hands the interceptor a [`Next`] continuation to the real handler.

use std::convert::Infallible;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use async_trait::async_trait;
use http::header::CONTENT_TYPE;
use http::HeaderValue;
use tonic::body::Body;
use tonic::server::NamedService;
use tower::util::BoxCloneService;
use tower::{Service, ServiceExt};

use super::registration::{MethodDescriptor, ServiceDescriptor};

type BoxFuture<T> = Pin<Box<dyn Future<Output = T> + Send + 'static>>;

/// Metadata of the call being intercepted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallInfo {
    /// Fully qualified service name, e.g. `grpc.health.v1.Health`.
    pub service: String,
    pub method: String,
    pub client_streaming: bool,
    pub server_streaming: bool,
}

impl CallInfo {
    fn new(service: &str, method: &MethodDescriptor) -> Self {
        Self {
            service: service.to_string(),
            method: method.name.clone(),
            client_streaming: method.client_streaming,
            server_streaming: method.server_streaming,
        }
    }

    /// `/<service>/<method>`, the call's request path.
    #[must_use]
    pub fn full_method(&self) -> String {
        format!("/{}/{}", self.service, self.method)
    }

    #[must_use]
    pub fn is_unary(&self) -> bool {
        !self.client_streaming && !self.server_streaming
    }
}

/// Continuation to the wrapped handler.
///
/// Cloneable so an interceptor may call it more than once (retries).
#[derive(Clone)]
pub struct Next {
    inner: BoxCloneService<http::Request<Body>, http::Response<Body>, Infallible>,
}

impl Next {
    fn new<S>(service: S) -> Self
    where
        S: Service<http::Request<Body>, Response = http::Response<Body>, Error = Infallible>
            + Clone
            + Send
            + 'static,
        S::Future: Send + 'static,
    {
        Self {
            inner: BoxCloneService::new(service),
        }
    }

    /// Invokes the handler.
    pub async fn run(self, request: http::Request<Body>) -> http::Response<Body> {
        match self.inner.oneshot(request).await {
            Ok(response) => response,
            Err(never) => match never {},
        }
    }
}

impl fmt::Debug for Next {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Next").finish_non_exhaustive()
    }
}

/// Hook around unary calls.
#[async_trait]
pub trait UnaryInterceptor: Send + Sync + 'static {
    /// Decides whether and when to call `next`; may short-circuit with its
    /// own response (see [`status_response`]).
    async fn intercept_unary(
        &self,
        request: http::Request<Body>,
        call: &CallInfo,
        next: Next,
    ) -> http::Response<Body>;
}

/// Hook around client-, server- and bidi-streaming calls.
#[async_trait]
pub trait StreamInterceptor: Send + Sync + 'static {
    async fn intercept_stream(
        &self,
        request: http::Request<Body>,
        call: &CallInfo,
        next: Next,
    ) -> http::Response<Body>;
}

/// Interception capability of a service implementation.
#[derive(Clone, Default)]
pub enum Interception {
    #[default]
    Plain,
    Unary(Arc<dyn UnaryInterceptor>),
    Stream(Arc<dyn StreamInterceptor>),
    Both {
        unary: Arc<dyn UnaryInterceptor>,
        stream: Arc<dyn StreamInterceptor>,
    },
}

impl Interception {
    #[must_use]
    pub fn both<I>(interceptor: Arc<I>) -> Self
    where
        I: UnaryInterceptor + StreamInterceptor,
    {
        Self::Both {
            unary: interceptor.clone(),
            stream: interceptor,
        }
    }

    fn unary(&self) -> Option<&Arc<dyn UnaryInterceptor>> {
        match self {
            Self::Unary(unary) | Self::Both { unary, .. } => Some(unary),
            Self::Plain | Self::Stream(_) => None,
        }
    }

    fn stream(&self) -> Option<&Arc<dyn StreamInterceptor>> {
        match self {
            Self::Stream(stream) | Self::Both { stream, .. } => Some(stream),
            Self::Plain | Self::Unary(_) => None,
        }
    }

    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Plain => "plain",
            Self::Unary(_) => "unary",
            Self::Stream(_) => "stream",
            Self::Both { .. } => "both",
        }
    }
}

impl fmt::Debug for Interception {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Wraps a service so every call goes through its declared interceptors.
///
/// Calls to methods missing from the descriptor pass straight through.
#[derive(Clone)]
pub struct Intercepted<S> {
    inner: S,
    descriptor: Arc<ServiceDescriptor>,
    interception: Interception,
}

impl<S> Intercepted<S> {
    #[must_use]
    pub fn new(inner: S, descriptor: Arc<ServiceDescriptor>, interception: Interception) -> Self {
        Self {
            inner,
            descriptor,
            interception,
        }
    }
}

impl<S: NamedService> NamedService for Intercepted<S> {
    const NAME: &'static str = S::NAME;
}

impl<S> Service<http::Request<Body>> for Intercepted<S>
where
    S: Service<http::Request<Body>, Response = http::Response<Body>, Error = Infallible>
        + Clone
        + Send
        + 'static,
    S::Future: Send + 'static,
{
    type Response = http::Response<Body>;
    type Error = Infallible;
    type Future = BoxFuture<Result<Self::Response, Self::Error>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, request: http::Request<Body>) -> Self::Future {
        // Take the service that was driven to readiness, leave a clone behind.
        let clone = self.inner.clone();
        let inner = std::mem::replace(&mut self.inner, clone);

        let method = request
            .uri()
            .path()
            .rsplit('/')
            .next()
            .and_then(|name| self.descriptor.method(name));
        let Some(method) = method else {
            let mut inner = inner;
            return Box::pin(inner.call(request));
        };

        let call = CallInfo::new(&self.descriptor.name, method);
        let next = Next::new(inner);
        if call.is_unary() {
            if let Some(interceptor) = self.interception.unary().cloned() {
                return Box::pin(async move {
                    Ok(interceptor.intercept_unary(request, &call, next).await)
                });
            }
        } else if let Some(interceptor) = self.interception.stream().cloned() {
            return Box::pin(async move {
                Ok(interceptor.intercept_stream(request, &call, next).await)
            });
        }
        Box::pin(async move { Ok(next.run(request).await) })
    }
}

/// Builds a trailers-only RPC response carrying `status`.
///
/// Lets an interceptor reject a call without reaching the handler.
#[must_use]
pub fn status_response(status: &tonic::Status) -> http::Response<Body> {
    let mut response = http::Response::new(Body::empty());
    let headers = response.headers_mut();
    headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/grpc"));
    headers.insert("grpc-status", HeaderValue::from(status.code() as i32));
    if let Ok(message) = HeaderValue::from_str(status.message()) {
        headers.insert("grpc-message", message);
    }
    response
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use parking_lot::Mutex;
    use tonic::Code;

    use super::*;

    #[derive(Clone)]
    struct Echo;

    impl NamedService for Echo {
        const NAME: &'static str = "test.Echo";
    }

    impl Service<http::Request<Body>> for Echo {
        type Response = http::Response<Body>;
        type Error = Infallible;
        type Future = std::future::Ready<Result<Self::Response, Infallible>>;

        fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Infallible>> {
            Poll::Ready(Ok(()))
        }

        fn call(&mut self, req: http::Request<Body>) -> Self::Future {
            let mut response = http::Response::new(Body::empty());
            response
                .headers_mut()
                .insert("x-handled", HeaderValue::from_str(req.uri().path()).unwrap());
            std::future::ready(Ok(response))
        }
    }

    fn descriptor() -> Arc<ServiceDescriptor> {
        Arc::new(
            ServiceDescriptor::new("test.Echo")
                .unary("Say")
                .bidi_streaming("Chat"),
        )
    }

    /// Records calls; rejects methods named in `deny`.
    #[derive(Default)]
    struct Recorder {
        calls: Mutex<Vec<String>>,
        deny: Option<&'static str>,
        retries: AtomicU32,
    }

    #[async_trait]
    impl UnaryInterceptor for Recorder {
        async fn intercept_unary(
            &self,
            request: http::Request<Body>,
            call: &CallInfo,
            next: Next,
        ) -> http::Response<Body> {
            self.calls.lock().push(format!("unary {}", call.full_method()));
            if self.deny == Some(call.method.as_str()) {
                return status_response(&tonic::Status::permission_denied("no"));
            }
            self.retries.fetch_add(1, Ordering::SeqCst);
            next.run(request).await
        }
    }

    #[async_trait]
    impl StreamInterceptor for Recorder {
        async fn intercept_stream(
            &self,
            request: http::Request<Body>,
            call: &CallInfo,
            next: Next,
        ) -> http::Response<Body> {
            self.calls.lock().push(format!("stream {}", call.full_method()));
            next.run(request).await
        }
    }

    fn request(path: &str) -> http::Request<Body> {
        http::Request::builder()
            .uri(path)
            .body(Body::empty())
            .unwrap()
    }

    #[tokio::test]
    async fn plain_services_are_untouched() {
        let svc = Intercepted::new(Echo, descriptor(), Interception::Plain);
        let response = svc.oneshot(request("/test.Echo/Say")).await.unwrap();
        assert_eq!(response.headers()["x-handled"], "/test.Echo/Say");
    }

    #[tokio::test]
    async fn unary_and_stream_hooks_see_their_calls() {
        let recorder = Arc::new(Recorder::default());
        let svc = Intercepted::new(Echo, descriptor(), Interception::both(recorder.clone()));

        svc.clone().oneshot(request("/test.Echo/Say")).await.unwrap();
        svc.clone().oneshot(request("/test.Echo/Chat")).await.unwrap();

        assert_eq!(
            *recorder.calls.lock(),
            vec!["unary /test.Echo/Say", "stream /test.Echo/Chat"]
        );
    }

    #[tokio::test]
    async fn unary_only_leaves_streams_alone() {
        let recorder = Arc::new(Recorder::default());
        let svc = Intercepted::new(Echo, descriptor(), Interception::Unary(recorder.clone()));

        let response = svc.oneshot(request("/test.Echo/Chat")).await.unwrap();

        assert_eq!(response.headers()["x-handled"], "/test.Echo/Chat");
        assert!(recorder.calls.lock().is_empty());
    }

    #[tokio::test]
    async fn interceptor_can_short_circuit() {
        let recorder = Arc::new(Recorder {
            deny: Some("Say"),
            ..Recorder::default()
        });
        let svc = Intercepted::new(Echo, descriptor(), Interception::Unary(recorder.clone()));

        let response = svc.oneshot(request("/test.Echo/Say")).await.unwrap();

        assert!(!response.headers().contains_key("x-handled"));
        assert_eq!(
            response.headers()["grpc-status"],
            HeaderValue::from(Code::PermissionDenied as i32)
        );
        assert_eq!(recorder.retries.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn unknown_methods_pass_through() {
        let recorder = Arc::new(Recorder::default());
        let svc = Intercepted::new(Echo, descriptor(), Interception::both(recorder.clone()));

        let response = svc.oneshot(request("/test.Echo/Missing")).await.unwrap();

        assert_eq!(response.headers()["x-handled"], "/test.Echo/Missing");
        assert!(recorder.calls.lock().is_empty());
    }

    #[test]
    fn name_is_forwarded() {
        assert_eq!(<Intercepted<Echo> as NamedService>::NAME, "test.Echo");
    }
}
