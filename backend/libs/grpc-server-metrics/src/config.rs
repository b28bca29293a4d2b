//! Server metrics configuration

use serde::{Deserialize, Serialize};

use crate::error::{MetricsError, Result};

/// Latency buckets in seconds, matching the prometheus client defaults
pub const DEFAULT_HISTOGRAM_BUCKETS: &[f64] = &[
    0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0,
];

/// Configuration for [`ServerMetrics`](crate::ServerMetrics)
///
/// Fixed at construction time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerMetricsConfig {
    /// Create and update `grpc_server_handling_seconds`.
    ///
    /// Off by default: one histogram per method multiplies the exported
    /// series count by the number of buckets.
    pub enable_histogram: bool,

    /// Upper bounds of the handling-time histogram buckets, in seconds
    pub histogram_buckets: Vec<f64>,
}

impl Default for ServerMetricsConfig {
    fn default() -> Self {
        Self {
            enable_histogram: false,
            histogram_buckets: DEFAULT_HISTOGRAM_BUCKETS.to_vec(),
        }
    }
}

impl ServerMetricsConfig {
    /// Counters plus the handling-time histogram
    pub fn with_histogram() -> Self {
        Self {
            enable_histogram: true,
            ..Self::default()
        }
    }

    /// Create configuration from environment variables
    ///
    /// Environment variables:
    /// - `GRPC_METRICS_HISTOGRAM_ENABLED`: enable the handling-time histogram (true/false)
    /// - `GRPC_METRICS_HISTOGRAM_BUCKETS`: comma-separated bucket bounds in seconds
    pub fn from_env() -> Result<Self> {
        let defaults = Self::default();

        let enable_histogram = match std::env::var("GRPC_METRICS_HISTOGRAM_ENABLED") {
            Ok(raw) => raw.trim().parse::<bool>().map_err(|_| {
                MetricsError::invalid_config(format!(
                    "GRPC_METRICS_HISTOGRAM_ENABLED must be true or false, got {raw:?}"
                ))
            })?,
            Err(_) => defaults.enable_histogram,
        };

        let histogram_buckets = match std::env::var("GRPC_METRICS_HISTOGRAM_BUCKETS") {
            Ok(raw) => parse_buckets(&raw)?,
            Err(_) => defaults.histogram_buckets,
        };

        let config = Self {
            enable_histogram,
            histogram_buckets,
        };
        config.validate()?;
        Ok(config)
    }

    /// Bucket bounds must be non-empty, finite and strictly increasing
    pub fn validate(&self) -> Result<()> {
        if !self.enable_histogram {
            return Ok(());
        }

        if self.histogram_buckets.is_empty() {
            return Err(MetricsError::invalid_config(
                "histogram_buckets must not be empty when the histogram is enabled",
            ));
        }

        if self.histogram_buckets.iter().any(|b| !b.is_finite()) {
            return Err(MetricsError::invalid_config(
                "histogram_buckets must be finite",
            ));
        }

        if self.histogram_buckets.windows(2).any(|w| w[0] >= w[1]) {
            return Err(MetricsError::invalid_config(
                "histogram_buckets must be strictly increasing",
            ));
        }

        Ok(())
    }
}

fn parse_buckets(raw: &str) -> Result<Vec<f64>> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|s| {
            s.parse::<f64>().map_err(|_| {
                MetricsError::invalid_config(format!("invalid histogram bucket {s:?}"))
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    fn clear_env() {
        std::env::remove_var("GRPC_METRICS_HISTOGRAM_ENABLED");
        std::env::remove_var("GRPC_METRICS_HISTOGRAM_BUCKETS");
    }

    #[test]
    fn test_default_disables_histogram() {
        let config = ServerMetricsConfig::default();
        assert!(!config.enable_histogram);
        assert_eq!(config.histogram_buckets, DEFAULT_HISTOGRAM_BUCKETS);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_unsorted_buckets() {
        let config = ServerMetricsConfig {
            enable_histogram: true,
            histogram_buckets: vec![0.1, 0.05, 1.0],
        };
        assert!(matches!(
            config.validate(),
            Err(MetricsError::InvalidConfig(_))
        ));
    }

    #[test]
    fn test_validate_ignores_buckets_when_disabled() {
        let config = ServerMetricsConfig {
            enable_histogram: false,
            histogram_buckets: vec![],
        };
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_deserialize_partial_config() {
        let config: ServerMetricsConfig =
            serde_json::from_str(r#"{"enable_histogram": true}"#).unwrap();
        assert!(config.enable_histogram);
        assert_eq!(config.histogram_buckets, DEFAULT_HISTOGRAM_BUCKETS);
    }

    #[test]
    #[serial]
    fn test_from_env_defaults() {
        clear_env();
        let config = ServerMetricsConfig::from_env().unwrap();
        assert_eq!(config, ServerMetricsConfig::default());
    }

    #[test]
    #[serial]
    fn test_from_env_overrides() {
        clear_env();
        std::env::set_var("GRPC_METRICS_HISTOGRAM_ENABLED", "true");
        std::env::set_var("GRPC_METRICS_HISTOGRAM_BUCKETS", "0.01, 0.1,1");

        let config = ServerMetricsConfig::from_env().unwrap();
        assert!(config.enable_histogram);
        assert_eq!(config.histogram_buckets, vec![0.01, 0.1, 1.0]);

        clear_env();
    }

    #[test]
    #[serial]
    fn test_from_env_rejects_bad_flag() {
        clear_env();
        std::env::set_var("GRPC_METRICS_HISTOGRAM_ENABLED", "yes please");

        assert!(ServerMetricsConfig::from_env().is_err());

        clear_env();
    }
}
