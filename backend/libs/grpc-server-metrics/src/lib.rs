//! gRPC Server Metrics - Prometheus instrumentation for tonic servers
//!
//! Counts, times and labels every inbound call, unary or streaming, without
//! per-endpoint code. It maintains:
//! - `grpc_server_started_total{grpc_type, grpc_service, grpc_method}`
//! - `grpc_server_handled_total{grpc_type, grpc_service, grpc_method, grpc_code}`
//! - `grpc_server_msg_received_total{grpc_type, grpc_service, grpc_method}`
//! - `grpc_server_msg_sent_total{grpc_type, grpc_service, grpc_method}`
//! - `grpc_server_handling_seconds{grpc_type, grpc_service, grpc_method}` (optional histogram)
//!
//! ## Core Components
//!
//! - **ServerMetrics**: the explicitly constructed metrics object, cloned into
//!   whatever needs it
//! - **GrpcMetricsLayer**: tower layer instrumenting a whole tonic server
//! - **unary / stream**: handler-level interceptors for code that wraps its
//!   own handlers
//! - **initialize_metrics**: pre-registers every series at zero so dashboards
//!   never show gaps before traffic arrives
//!
//! ## Usage
//!
//! ```rust,ignore
//! use grpc_server_metrics::{ServerMetrics, ServerMetricsConfig, ServiceDirectory, MethodInfo};
//!
//! let directory = ServiceDirectory::new().with_service(
//!     "nova.chat.v1.ChatService",
//!     [MethodInfo::unary("GetRoom"), MethodInfo::bidi_stream("Sync")],
//! );
//!
//! let metrics = ServerMetrics::new(ServerMetricsConfig::with_histogram())?;
//! metrics.initialize_metrics(&directory);
//!
//! Server::builder()
//!     .layer(metrics.layer(directory))
//!     .add_service(chat_service)
//!     .serve(addr)
//!     .await?;
//!
//! // On the /metrics endpoint
//! let body = metrics.registry().encode_text()?;
//! ```
//!
//! Instrumentation never changes a call's outcome: backend failures are
//! logged and swallowed, and responses, errors and payloads pass through
//! untouched.

mod body;
mod config;
mod directory;
mod error;
mod interceptor;
mod labels;
mod layer;
mod registry;
mod reporter;
mod server_metrics;
mod stream;

pub use body::{InboundBody, OutboundBody};
pub use config::{ServerMetricsConfig, DEFAULT_HISTOGRAM_BUCKETS};
pub use directory::{MethodInfo, ServiceDirectory};
pub use error::{MetricsError, Result};
pub use interceptor::{StatusCodeSource, StreamServerInfo, UnaryServerInfo};
pub use labels::{code_label, status_label_from_header, CallShape, MethodIdentity, ALL_CODES};
pub use layer::{GrpcMetricsFuture, GrpcMetricsLayer, GrpcMetricsService};
pub use registry::{MetricKind, MetricRegistry, SeriesId, CALL_LABELS, HANDLED_LABELS};
pub use reporter::{CallReporter, MessageCounters};
pub use server_metrics::ServerMetrics;
pub use stream::{MonitoredServerStream, ServerStream, TonicServerStream};

// Re-export tonic Code for convenience
pub use tonic::Code;
