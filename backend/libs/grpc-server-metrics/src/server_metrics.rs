//! Server metrics object and metric pre-registration

use tracing::info;

use crate::config::ServerMetricsConfig;
use crate::directory::{MethodInfo, ServiceDirectory};
use crate::error::Result;
use crate::labels::{code_label, CallShape, MethodIdentity, ALL_CODES};
use crate::layer::GrpcMetricsLayer;
use crate::registry::{MetricRegistry, SeriesId};
use crate::reporter::CallReporter;

/// Metrics for every call a gRPC server handles.
///
/// Construct one per server and clone it into the interceptors or the tower
/// layer; clones share the same series.
#[derive(Clone, Debug)]
pub struct ServerMetrics {
    registry: MetricRegistry,
}

impl ServerMetrics {
    /// Create the metrics in a private prometheus registry
    pub fn new(config: ServerMetricsConfig) -> Result<Self> {
        Ok(Self {
            registry: MetricRegistry::new(&config)?,
        })
    }

    /// Create the metrics inside an existing prometheus registry
    pub fn with_registry(
        registry: prometheus::Registry,
        config: ServerMetricsConfig,
    ) -> Result<Self> {
        Ok(Self {
            registry: MetricRegistry::with_registry(registry, &config)?,
        })
    }

    pub fn registry(&self) -> &MetricRegistry {
        &self.registry
    }

    pub fn histogram_enabled(&self) -> bool {
        self.registry.histogram_enabled()
    }

    /// Start reporting one call
    pub fn reporter(&self, shape: CallShape, identity: MethodIdentity) -> CallReporter {
        CallReporter::new(self.registry.clone(), shape, identity)
    }

    /// Tower layer instrumenting every call of a tonic server
    pub fn layer(&self, directory: ServiceDirectory) -> GrpcMetricsLayer {
        GrpcMetricsLayer::new(self.clone(), directory)
    }

    /// Pre-initialize every series the server can emit, at zero.
    ///
    /// Call after all services are registered and before the server accepts
    /// traffic, so dashboards never see a missing series for a code that has
    /// simply not happened yet. Nothing is incremented; calling it again is
    /// harmless.
    pub fn initialize_metrics(&self, directory: &ServiceDirectory) {
        for (service, methods) in directory.services() {
            for method in methods {
                self.pre_register_method(service, method);
            }
        }

        info!(
            services = directory.services().count(),
            methods = directory.method_count(),
            histogram = self.histogram_enabled(),
            "gRPC server metrics initialized"
        );
    }

    fn pre_register_method(&self, service: &str, method: &MethodInfo) {
        let shape = method.shape();
        let identity = MethodIdentity::new(service, method.name.as_str());

        // Lookups allocate the series without touching their values
        self.registry.counter(&SeriesId::started(shape, &identity));
        self.registry.counter(&SeriesId::msg_received(shape, &identity));
        self.registry.counter(&SeriesId::msg_sent(shape, &identity));
        if self.histogram_enabled() {
            self.registry
                .histogram(&SeriesId::handling_seconds(shape, &identity));
        }
        for code in ALL_CODES {
            self.registry
                .counter(&SeriesId::handled(shape, &identity, code_label(code)));
        }
    }
}
