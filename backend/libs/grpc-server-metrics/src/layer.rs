//! Tower layer instrumenting a whole tonic server
//!
//! Works at the HTTP level, so no service needs to change:
//! - the method identity comes from the request path
//! - the call shape comes from the [`ServiceDirectory`]; paths it does not
//!   list pass through uninstrumented, so clients cannot mint new series
//! - messages are counted from the gRPC framing of the request and response bodies
//! - the status comes from `grpc-status` in the response headers or trailers
//!
//! ```rust,ignore
//! use grpc_server_metrics::{ServerMetrics, ServerMetricsConfig, ServiceDirectory};
//!
//! let directory = ServiceDirectory::from_encoded_file_descriptor_set(FILE_DESCRIPTOR_SET)?;
//! let metrics = ServerMetrics::new(ServerMetricsConfig::from_env()?)?;
//! metrics.initialize_metrics(&directory);
//!
//! Server::builder()
//!     .layer(metrics.layer(directory))
//!     .add_service(my_service)
//!     .serve(addr)
//!     .await?;
//! ```

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{ready, Context, Poll};

use bytes::Bytes;
use http::{Request, Response};
use http_body::Body;
use pin_project::pin_project;
use tonic::body::BoxBody;
use tonic::Code;
use tower::{Layer, Service};
use tracing::debug;

use crate::body::{grpc_status, InboundBody, OutboundBody};
use crate::directory::ServiceDirectory;
use crate::labels::MethodIdentity;
use crate::reporter::{CallReporter, MessageCounters};
use crate::server_metrics::ServerMetrics;

#[derive(Clone)]
pub struct GrpcMetricsLayer {
    metrics: ServerMetrics,
    directory: Arc<ServiceDirectory>,
}

impl GrpcMetricsLayer {
    pub fn new(metrics: ServerMetrics, directory: ServiceDirectory) -> Self {
        Self {
            metrics,
            directory: Arc::new(directory),
        }
    }
}

impl<S> Layer<S> for GrpcMetricsLayer {
    type Service = GrpcMetricsService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        GrpcMetricsService {
            inner,
            metrics: self.metrics.clone(),
            directory: self.directory.clone(),
        }
    }
}

#[derive(Clone)]
pub struct GrpcMetricsService<S> {
    inner: S,
    metrics: ServerMetrics,
    directory: Arc<ServiceDirectory>,
}

impl<S> GrpcMetricsService<S> {
    /// Reporter for a call to a listed method, `None` for anything else
    fn reporter_for(&self, path: &str) -> Option<CallReporter> {
        let identity = MethodIdentity::from_path(path);
        match self.directory.shape_of(&identity) {
            Some(shape) => Some(self.metrics.reporter(shape, identity)),
            None => {
                debug!(method = %identity, "Method not in service directory, not instrumented");
                None
            }
        }
    }
}

impl<S, ReqBody, ResBody> Service<Request<ReqBody>> for GrpcMetricsService<S>
where
    S: Service<Request<BoxBody>, Response = Response<ResBody>>,
    ReqBody: Body<Data = Bytes> + Send + 'static,
    ReqBody::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
    ResBody: Body<Data = Bytes>,
{
    type Response = Response<OutboundBody<ResBody>>;
    type Error = S::Error;
    type Future = GrpcMetricsFuture<S::Future>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, req: Request<ReqBody>) -> Self::Future {
        let Some(reporter) = self.reporter_for(req.uri().path()) else {
            let req = req.map(tonic::body::boxed);
            return GrpcMetricsFuture {
                inner: self.inner.call(req),
                counters: None,
                reporter: None,
            };
        };

        let counters = reporter.message_counters();
        let inbound = counters.clone();
        let req = req.map(|body| tonic::body::boxed(InboundBody::new(body, inbound)));

        GrpcMetricsFuture {
            inner: self.inner.call(req),
            counters: Some(counters),
            reporter: Some(reporter),
        }
    }
}

#[pin_project]
pub struct GrpcMetricsFuture<F> {
    #[pin]
    inner: F,
    counters: Option<MessageCounters>,
    reporter: Option<CallReporter>,
}

impl<F, B, E> Future for GrpcMetricsFuture<F>
where
    F: Future<Output = Result<Response<B>, E>>,
{
    type Output = Result<Response<OutboundBody<B>>, E>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.project();
        let result = ready!(this.inner.poll(cx));
        let mut reporter = this.reporter.take();

        match result {
            Ok(response) => {
                // Trailers-only response: the status is already final and the
                // empty body may never be polled
                if let Some(label) = grpc_status(response.headers()) {
                    if let Some(reporter) = reporter.take() {
                        reporter.handled_with_label(&label);
                    }
                }

                let counters = this.counters.take();
                let response = response.map(|body| OutboundBody::new(body, counters, reporter));
                Poll::Ready(Ok(response))
            }
            Err(e) => {
                if let Some(reporter) = reporter {
                    reporter.handled(Code::Unknown);
                }
                Poll::Ready(Err(e))
            }
        }
    }
}
