//! Metric registry adapter
//!
//! Get-or-create access to the five gRPC server metric families, keyed by a
//! structured series identity. Looking a series up never increments it; the
//! first lookup of an identity allocates the series at zero so exporters see
//! it immediately.

use std::fmt;
use std::sync::Arc;

use prometheus::proto::MetricFamily;
use prometheus::{
    Encoder, Histogram, HistogramOpts, HistogramVec, IntCounter, IntCounterVec, Opts, Registry,
    TextEncoder,
};
use tracing::warn;

use crate::config::ServerMetricsConfig;
use crate::error::Result;
use crate::labels::{CallShape, MethodIdentity};

/// Labels carried by every per-call series
pub const CALL_LABELS: &[&str] = &["grpc_type", "grpc_service", "grpc_method"];

/// Labels carried by the handled counter
pub const HANDLED_LABELS: &[&str] = &["grpc_type", "grpc_service", "grpc_method", "grpc_code"];

/// One metric family exposed by the server
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MetricKind {
    Started,
    Handled,
    MsgReceived,
    MsgSent,
    HandlingSeconds,
}

impl MetricKind {
    pub const ALL: [MetricKind; 5] = [
        MetricKind::Started,
        MetricKind::Handled,
        MetricKind::MsgReceived,
        MetricKind::MsgSent,
        MetricKind::HandlingSeconds,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            MetricKind::Started => "grpc_server_started_total",
            MetricKind::Handled => "grpc_server_handled_total",
            MetricKind::MsgReceived => "grpc_server_msg_received_total",
            MetricKind::MsgSent => "grpc_server_msg_sent_total",
            MetricKind::HandlingSeconds => "grpc_server_handling_seconds",
        }
    }

    pub fn help(&self) -> &'static str {
        match self {
            MetricKind::Started => "Total number of RPCs started on the server.",
            MetricKind::Handled => {
                "Total number of RPCs completed on the server, regardless of success or failure."
            }
            MetricKind::MsgReceived => {
                "Total number of RPC stream messages received on the server."
            }
            MetricKind::MsgSent => "Total number of gRPC stream messages sent by the server.",
            MetricKind::HandlingSeconds => {
                "Histogram of response latency (seconds) of gRPC that had been application-level handled by the server."
            }
        }
    }

    pub fn label_names(&self) -> &'static [&'static str] {
        match self {
            MetricKind::Handled => HANDLED_LABELS,
            _ => CALL_LABELS,
        }
    }

    pub fn is_histogram(&self) -> bool {
        matches!(self, MetricKind::HandlingSeconds)
    }
}

/// Identity of one time series: metric kind plus label values in
/// [`MetricKind::label_names`] order.
///
/// Rendered through `Display` as the canonical
/// `name{label="value",...}` string.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SeriesId {
    kind: MetricKind,
    values: Vec<String>,
}

impl SeriesId {
    fn call(kind: MetricKind, shape: CallShape, identity: &MethodIdentity) -> Self {
        Self {
            kind,
            values: vec![
                shape.as_label().to_string(),
                identity.service.clone(),
                identity.method.clone(),
            ],
        }
    }

    pub fn started(shape: CallShape, identity: &MethodIdentity) -> Self {
        Self::call(MetricKind::Started, shape, identity)
    }

    pub fn msg_received(shape: CallShape, identity: &MethodIdentity) -> Self {
        Self::call(MetricKind::MsgReceived, shape, identity)
    }

    pub fn msg_sent(shape: CallShape, identity: &MethodIdentity) -> Self {
        Self::call(MetricKind::MsgSent, shape, identity)
    }

    pub fn handling_seconds(shape: CallShape, identity: &MethodIdentity) -> Self {
        Self::call(MetricKind::HandlingSeconds, shape, identity)
    }

    pub fn handled(shape: CallShape, identity: &MethodIdentity, code: &str) -> Self {
        let mut id = Self::call(MetricKind::Handled, shape, identity);
        id.values.push(code.to_string());
        id
    }

    pub fn kind(&self) -> MetricKind {
        self.kind
    }

    pub fn label_values(&self) -> Vec<&str> {
        self.values.iter().map(String::as_str).collect()
    }

    /// (label name, label value) pairs
    pub fn labels(&self) -> impl Iterator<Item = (&'static str, &str)> {
        self.kind
            .label_names()
            .iter()
            .copied()
            .zip(self.values.iter().map(String::as_str))
    }
}

impl fmt::Display for SeriesId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.kind.name())?;
        f.write_str("{")?;
        for (i, (name, value)) in self.labels().enumerate() {
            if i > 0 {
                f.write_str(",")?;
            }
            write!(f, "{name}=\"")?;
            for ch in value.chars() {
                match ch {
                    '\\' => f.write_str("\\\\")?,
                    '"' => f.write_str("\\\"")?,
                    '\n' => f.write_str("\\n")?,
                    c => write!(f, "{c}")?,
                }
            }
            f.write_str("\"")?;
        }
        f.write_str("}")
    }
}

/// Get-or-create accessor over a prometheus registry.
///
/// Cheap to clone; clones share the same families.
#[derive(Clone)]
pub struct MetricRegistry {
    inner: Arc<Inner>,
}

struct Inner {
    registry: Registry,
    started: IntCounterVec,
    handled: IntCounterVec,
    msg_received: IntCounterVec,
    msg_sent: IntCounterVec,
    handling_seconds: Option<HistogramVec>,
    /// Handed out when the backend rejects a lookup; never registered
    detached_counter: IntCounter,
    detached_histogram: Histogram,
}

impl MetricRegistry {
    /// Create the metric families in a fresh prometheus registry
    pub fn new(config: &ServerMetricsConfig) -> Result<Self> {
        Self::with_registry(Registry::new(), config)
    }

    /// Create the metric families inside an existing registry, e.g. the one a
    /// service already serves on `/metrics`
    pub fn with_registry(registry: Registry, config: &ServerMetricsConfig) -> Result<Self> {
        config.validate()?;

        let counter_vec = |kind: MetricKind| -> Result<IntCounterVec> {
            let vec = IntCounterVec::new(Opts::new(kind.name(), kind.help()), kind.label_names())?;
            registry.register(Box::new(vec.clone()))?;
            Ok(vec)
        };

        let started = counter_vec(MetricKind::Started)?;
        let handled = counter_vec(MetricKind::Handled)?;
        let msg_received = counter_vec(MetricKind::MsgReceived)?;
        let msg_sent = counter_vec(MetricKind::MsgSent)?;

        let handling_seconds = if config.enable_histogram {
            let kind = MetricKind::HandlingSeconds;
            let vec = HistogramVec::new(
                HistogramOpts::new(kind.name(), kind.help())
                    .buckets(config.histogram_buckets.clone()),
                kind.label_names(),
            )?;
            registry.register(Box::new(vec.clone()))?;
            Some(vec)
        } else {
            None
        };

        let detached_counter = IntCounter::new(
            "grpc_server_detached_total",
            "Sink for updates the registry could not accept",
        )?;
        let detached_histogram = Histogram::with_opts(HistogramOpts::new(
            "grpc_server_detached_seconds",
            "Sink for observations the registry could not accept",
        ))?;

        Ok(Self {
            inner: Arc::new(Inner {
                registry,
                started,
                handled,
                msg_received,
                msg_sent,
                handling_seconds,
                detached_counter,
                detached_histogram,
            }),
        })
    }

    /// Return the counter for `id`, creating it at zero on first use.
    ///
    /// Never fails: a series the backend cannot provide is replaced by a
    /// detached counter and the problem is logged.
    pub fn counter(&self, id: &SeriesId) -> IntCounter {
        let vec = match id.kind() {
            MetricKind::Started => &self.inner.started,
            MetricKind::Handled => &self.inner.handled,
            MetricKind::MsgReceived => &self.inner.msg_received,
            MetricKind::MsgSent => &self.inner.msg_sent,
            MetricKind::HandlingSeconds => {
                warn!(series = %id, "Requested a counter for a histogram series");
                return self.inner.detached_counter.clone();
            }
        };

        match vec.get_metric_with_label_values(&id.label_values()) {
            Ok(counter) => counter,
            Err(e) => {
                warn!(series = %id, error = %e, "Failed to get or create counter");
                self.inner.detached_counter.clone()
            }
        }
    }

    /// Return the histogram for `id`, creating it on first use.
    ///
    /// With histograms disabled nothing is created and a detached histogram
    /// is returned.
    pub fn histogram(&self, id: &SeriesId) -> Histogram {
        let Some(vec) = self.inner.handling_seconds.as_ref() else {
            return self.inner.detached_histogram.clone();
        };

        if !id.kind().is_histogram() {
            warn!(series = %id, "Requested a histogram for a counter series");
            return self.inner.detached_histogram.clone();
        }

        match vec.get_metric_with_label_values(&id.label_values()) {
            Ok(histogram) => histogram,
            Err(e) => {
                warn!(series = %id, error = %e, "Failed to get or create histogram");
                self.inner.detached_histogram.clone()
            }
        }
    }

    pub fn histogram_enabled(&self) -> bool {
        self.inner.handling_seconds.is_some()
    }

    /// Underlying prometheus registry
    pub fn prometheus_registry(&self) -> &Registry {
        &self.inner.registry
    }

    /// Snapshot of every family in the registry
    pub fn gather(&self) -> Vec<MetricFamily> {
        self.inner.registry.gather()
    }

    /// Registry contents in the prometheus text exposition format
    pub fn encode_text(&self) -> Result<String> {
        let mut buffer = Vec::new();
        TextEncoder::new().encode(&self.gather(), &mut buffer)?;
        Ok(String::from_utf8(buffer)?)
    }

    /// Current value of a counter series, `None` if it was never created.
    ///
    /// Reads a snapshot and never allocates the series.
    pub fn counter_value(&self, id: &SeriesId) -> Option<u64> {
        self.find_metric(id, |metric| metric.get_counter().get_value() as u64)
    }

    /// Observation count of a histogram series, `None` if it was never created
    pub fn histogram_sample_count(&self, id: &SeriesId) -> Option<u64> {
        self.find_metric(id, |metric| metric.get_histogram().get_sample_count())
    }

    /// Number of series currently allocated for a metric kind
    pub fn series_count(&self, kind: MetricKind) -> usize {
        self.gather()
            .iter()
            .find(|family| family.get_name() == kind.name())
            .map(|family| family.get_metric().len())
            .unwrap_or(0)
    }

    fn find_metric<T>(
        &self,
        id: &SeriesId,
        read: impl Fn(&prometheus::proto::Metric) -> T,
    ) -> Option<T> {
        let families = self.gather();
        let family = families
            .iter()
            .find(|family| family.get_name() == id.kind().name())?;

        family
            .get_metric()
            .iter()
            .find(|metric| {
                let pairs = metric.get_label();
                pairs.len() == id.kind().label_names().len()
                    && id.labels().all(|(name, value)| {
                        pairs
                            .iter()
                            .any(|pair| pair.get_name() == name && pair.get_value() == value)
                    })
            })
            .map(read)
    }
}

impl fmt::Debug for MetricRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MetricRegistry")
            .field("histogram_enabled", &self.histogram_enabled())
            .finish_non_exhaustive()
    }
}
