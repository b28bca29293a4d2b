//! Handler-level interceptors
//!
//! Wrap a unary or streaming handler so the call is reported without the
//! handler knowing. The handler's response and error are returned untouched.
//!
//! ```rust,no_run
//! use grpc_server_metrics::{ServerMetrics, ServerMetricsConfig, UnaryServerInfo};
//! use tonic::{Request, Response, Status};
//!
//! # async fn example(
//! #     metrics: ServerMetrics,
//! #     request: Request<String>,
//! # ) -> Result<Response<String>, Status> {
//! let info = UnaryServerInfo::new("/nova.content.v2.ContentService/GetPost");
//! metrics
//!     .unary(&info, request, |req| async move {
//!         Ok(Response::new(req.into_inner()))
//!     })
//!     .await
//! # }
//! ```

use std::convert::Infallible;
use std::error::Error as StdError;
use std::future::Future;

use tonic::{Code, Status};

use crate::labels::{CallShape, MethodIdentity};
use crate::server_metrics::ServerMetrics;
use crate::stream::{MonitoredServerStream, ServerStream};

/// Anything a handler can fail with that carries a gRPC status code
pub trait StatusCodeSource {
    fn status_code(&self) -> Code;
}

impl StatusCodeSource for Status {
    fn status_code(&self) -> Code {
        self.code()
    }
}

/// Finds a `Status` anywhere in the source chain, `Unknown` otherwise
impl StatusCodeSource for Box<dyn StdError + Send + Sync> {
    fn status_code(&self) -> Code {
        let root: &(dyn StdError + 'static) = &**self;
        let mut current = Some(root);
        while let Some(err) = current {
            if let Some(status) = err.downcast_ref::<Status>() {
                return status.code();
            }
            current = err.source();
        }
        Code::Unknown
    }
}

impl StatusCodeSource for Infallible {
    fn status_code(&self) -> Code {
        match *self {}
    }
}

/// Static information about a unary method
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnaryServerInfo {
    /// Fully qualified path, `/package.Service/Method`
    pub full_method: String,
}

impl UnaryServerInfo {
    pub fn new(full_method: impl Into<String>) -> Self {
        Self {
            full_method: full_method.into(),
        }
    }
}

/// Static information about a streaming method
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamServerInfo {
    /// Fully qualified path, `/package.Service/Method`
    pub full_method: String,
    pub is_client_stream: bool,
    pub is_server_stream: bool,
}

impl StreamServerInfo {
    pub fn new(
        full_method: impl Into<String>,
        is_client_stream: bool,
        is_server_stream: bool,
    ) -> Self {
        Self {
            full_method: full_method.into(),
            is_client_stream,
            is_server_stream,
        }
    }

    /// Shape of a streaming call. A method streaming in neither direction
    /// never reaches a stream handler, so it counts as bidi.
    pub fn shape(&self) -> CallShape {
        match CallShape::from_streaming(self.is_client_stream, self.is_server_stream) {
            CallShape::Unary => CallShape::BidiStream,
            shape => shape,
        }
    }
}

impl ServerMetrics {
    /// Report a unary call around `handler`.
    ///
    /// The request counts as received before the handler runs. The call is
    /// marked handled first, then the response counts as sent if the handler
    /// succeeded.
    pub async fn unary<Req, Resp, E, F, Fut>(
        &self,
        info: &UnaryServerInfo,
        request: Req,
        handler: F,
    ) -> Result<Resp, E>
    where
        F: FnOnce(Req) -> Fut,
        Fut: Future<Output = Result<Resp, E>>,
        E: StatusCodeSource,
    {
        let identity = MethodIdentity::from_path(&info.full_method);
        let reporter = self.reporter(CallShape::Unary, identity);
        reporter.received_message();

        let result = handler(request).await;

        match &result {
            Ok(_) => {
                let counters = reporter.message_counters();
                reporter.handled(Code::Ok);
                counters.sent_message();
            }
            Err(e) => reporter.handled(e.status_code()),
        }

        result
    }

    /// Report a streaming call around `handler`.
    ///
    /// The handler receives `stream` wrapped in a [`MonitoredServerStream`],
    /// which counts every message successfully sent or received.
    pub async fn stream<S, T, E, F, Fut>(
        &self,
        info: &StreamServerInfo,
        stream: S,
        handler: F,
    ) -> Result<T, E>
    where
        S: ServerStream,
        F: FnOnce(MonitoredServerStream<S>) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: StatusCodeSource,
    {
        let identity = MethodIdentity::from_path(&info.full_method);
        let reporter = self.reporter(info.shape(), identity);
        let monitored = MonitoredServerStream::new(stream, reporter.message_counters());

        let result = handler(monitored).await;

        let code = match &result {
            Ok(_) => Code::Ok,
            Err(e) => e.status_code(),
        };
        reporter.handled(code);

        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ServerMetricsConfig;
    use crate::labels::code_label;
    use crate::registry::{MetricKind, SeriesId};
    use crate::stream::mock::MockStream;

    const GET: &str = "/pkg.Users/Get";

    fn metrics() -> ServerMetrics {
        ServerMetrics::new(ServerMetricsConfig::default()).unwrap()
    }

    fn get_identity() -> MethodIdentity {
        MethodIdentity::new("pkg.Users", "Get")
    }

    #[derive(Debug)]
    struct Wrapped(Status);

    impl std::fmt::Display for Wrapped {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            write!(f, "wrapped: {}", self.0)
        }
    }

    impl StdError for Wrapped {
        fn source(&self) -> Option<&(dyn StdError + 'static)> {
            Some(&self.0)
        }
    }

    #[test]
    fn test_status_code_from_boxed_errors() {
        let direct: Box<dyn StdError + Send + Sync> = Box::new(Status::not_found("gone"));
        assert_eq!(direct.status_code(), Code::NotFound);

        let nested: Box<dyn StdError + Send + Sync> =
            Box::new(Wrapped(Status::permission_denied("no")));
        assert_eq!(nested.status_code(), Code::PermissionDenied);

        let plain: Box<dyn StdError + Send + Sync> = "boom".into();
        assert_eq!(plain.status_code(), Code::Unknown);
    }

    #[test]
    fn test_stream_info_shape() {
        assert_eq!(
            StreamServerInfo::new(GET, true, false).shape(),
            CallShape::ClientStream
        );
        assert_eq!(
            StreamServerInfo::new(GET, false, true).shape(),
            CallShape::ServerStream
        );
        assert_eq!(
            StreamServerInfo::new(GET, true, true).shape(),
            CallShape::BidiStream
        );
        assert_eq!(
            StreamServerInfo::new(GET, false, false).shape(),
            CallShape::BidiStream
        );
    }

    #[tokio::test]
    async fn test_unary_success() {
        let metrics = metrics();
        let info = UnaryServerInfo::new(GET);

        let response = metrics
            .unary(&info, 21, |n: i32| async move { Ok::<_, Status>(n * 2) })
            .await;

        assert_eq!(response.unwrap(), 42);
        let registry = metrics.registry();
        let identity = get_identity();
        let shape = CallShape::Unary;
        assert_eq!(
            registry.counter_value(&SeriesId::started(shape, &identity)),
            Some(1)
        );
        assert_eq!(
            registry.counter_value(&SeriesId::msg_received(shape, &identity)),
            Some(1)
        );
        assert_eq!(
            registry.counter_value(&SeriesId::msg_sent(shape, &identity)),
            Some(1)
        );
        assert_eq!(
            registry.counter_value(&SeriesId::handled(shape, &identity, "OK")),
            Some(1)
        );
    }

    #[tokio::test]
    async fn test_unary_error_is_passed_through() {
        let metrics = metrics();
        let info = UnaryServerInfo::new(GET);

        let result: Result<i32, Status> = metrics
            .unary(&info, (), |_| async {
                Err(Status::not_found("no such user"))
            })
            .await;

        let status = result.unwrap_err();
        assert_eq!(status.code(), Code::NotFound);
        assert_eq!(status.message(), "no such user");

        let registry = metrics.registry();
        let identity = get_identity();
        let shape = CallShape::Unary;
        assert_eq!(
            registry.counter_value(&SeriesId::msg_sent(shape, &identity)),
            Some(0)
        );
        assert_eq!(
            registry.counter_value(&SeriesId::handled(shape, &identity, "NotFound")),
            Some(1)
        );
        assert_eq!(
            registry.counter_value(&SeriesId::handled(shape, &identity, "OK")),
            None
        );
    }

    #[tokio::test]
    async fn test_unary_cancelled_future_records_cancelled() {
        let metrics = metrics();
        let info = UnaryServerInfo::new(GET);

        let call = metrics.unary(&info, (), |_| async {
            std::future::pending::<Result<(), Status>>().await
        });
        let timed_out = tokio::time::timeout(std::time::Duration::from_millis(10), call).await;
        assert!(timed_out.is_err());

        assert_eq!(
            metrics.registry().counter_value(&SeriesId::handled(
                CallShape::Unary,
                &get_identity(),
                code_label(Code::Cancelled)
            )),
            Some(1)
        );
    }

    #[tokio::test]
    async fn test_stream_counts_messages_and_error_code() {
        let metrics = metrics();
        let info = StreamServerInfo::new("/pkg.Users/Sync", true, true);
        let stream = MockStream::new(vec![Ok("a".into()), Ok("b".into())]);

        let result: Result<(), Status> = metrics
            .stream(&info, stream, |mut s| async move {
                while let Some(msg) = s.recv_msg().await? {
                    s.send_msg(msg.to_uppercase()).await?;
                }
                s.send_msg("done".into()).await?;
                Err::<(), _>(Status::aborted("conflict"))
            })
            .await;

        assert_eq!(result.unwrap_err().code(), Code::Aborted);

        let registry = metrics.registry();
        let identity = MethodIdentity::new("pkg.Users", "Sync");
        let shape = CallShape::BidiStream;
        assert_eq!(
            registry.counter_value(&SeriesId::msg_sent(shape, &identity)),
            Some(3)
        );
        assert_eq!(
            registry.counter_value(&SeriesId::msg_received(shape, &identity)),
            Some(2)
        );
        assert_eq!(
            registry.counter_value(&SeriesId::handled(shape, &identity, "Aborted")),
            Some(1)
        );
        assert_eq!(registry.series_count(MetricKind::Handled), 1);
    }

    #[tokio::test]
    async fn test_stream_returns_handler_value() {
        let metrics = metrics();
        let info = StreamServerInfo::new("/pkg.Uploads/Put", true, false);
        let stream = MockStream::new(vec![Ok("x".into()), Ok("y".into()), Ok("z".into())]);

        let count = metrics
            .stream(&info, stream, |mut s| async move {
                let mut n = 0;
                while s.recv_msg().await?.is_some() {
                    n += 1;
                }
                s.send_msg(format!("{n} chunks")).await?;
                Ok::<_, Status>(n)
            })
            .await
            .unwrap();

        assert_eq!(count, 3);
        let identity = MethodIdentity::new("pkg.Uploads", "Put");
        let shape = CallShape::ClientStream;
        let registry = metrics.registry();
        assert_eq!(
            registry.counter_value(&SeriesId::msg_received(shape, &identity)),
            Some(3)
        );
        assert_eq!(
            registry.counter_value(&SeriesId::msg_sent(shape, &identity)),
            Some(1)
        );
        assert_eq!(
            registry.counter_value(&SeriesId::handled(shape, &identity, "OK")),
            Some(1)
        );
    }
}
