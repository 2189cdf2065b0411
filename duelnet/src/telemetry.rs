//! Structured logging for DuelNet.
//!
//! Console output (compact or JSON) through `tracing-subscriber`, with
//! optional OTLP span export behind the `otlp` feature.
//!
//! # Example
//!
//! ```rust,ignore
//! use duelnet::telemetry::{init_tracing, TracingConfig};
//!
//! let _guard = init_tracing(TracingConfig::new("duelnet").with_level("info,duelnet=debug"))?;
//! ```

use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

use crate::config::TelemetryConfig;
use crate::error::{DuelError, Result};

/// Tracing configuration.
#[derive(Clone, Debug)]
pub struct TracingConfig {
    /// Service name for exported spans.
    pub service_name: String,
    /// OTLP endpoint (e.g., "http://localhost:4317"). Only used with the `otlp` feature.
    pub otlp_endpoint: Option<String>,
    /// Log level filter (e.g., "info", "duelnet=debug,reqwest=warn").
    /// `RUST_LOG` takes precedence when set.
    pub log_level: String,
    /// Output logs as JSON.
    pub json_output: bool,
}

impl Default for TracingConfig {
    fn default() -> Self {
        Self {
            service_name: "duelnet".into(),
            otlp_endpoint: None,
            log_level: "info".into(),
            json_output: false,
        }
    }
}

impl TracingConfig {
    pub fn new(service_name: impl Into<String>) -> Self {
        Self {
            service_name: service_name.into(),
            ..Default::default()
        }
    }

    pub fn with_otlp(mut self, endpoint: impl Into<String>) -> Self {
        self.otlp_endpoint = Some(endpoint.into());
        self
    }

    pub fn with_level(mut self, level: impl Into<String>) -> Self {
        self.log_level = level.into();
        self
    }

    pub fn with_json(mut self) -> Self {
        self.json_output = true;
        self
    }
}

impl From<&TelemetryConfig> for TracingConfig {
    fn from(config: &TelemetryConfig) -> Self {
        Self {
            service_name: "duelnet".into(),
            otlp_endpoint: config.otlp_endpoint.clone(),
            log_level: config.log_level.clone(),
            json_output: config.json,
        }
    }
}

/// Install the global subscriber. Call once at startup.
pub fn init_tracing(config: TracingConfig) -> Result<TracingGuard> {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    let fmt_layer = if config.json_output {
        fmt::layer()
            .json()
            .with_target(true)
            .with_thread_ids(true)
            .with_file(true)
            .with_line_number(true)
            .boxed()
    } else {
        fmt::layer().with_target(true).compact().boxed()
    };

    let registry = tracing_subscriber::registry().with(fmt_layer).with(env_filter);

    #[cfg(feature = "otlp")]
    {
        use opentelemetry::trace::TracerProvider as _;

        let provider = match &config.otlp_endpoint {
            Some(endpoint) => Some(otlp::init_tracer(&config.service_name, endpoint)?),
            None => None,
        };
        let otel_layer = provider
            .as_ref()
            .map(|p| tracing_opentelemetry::layer().with_tracer(p.tracer("duelnet")));

        registry
            .with(otel_layer)
            .try_init()
            .map_err(|e| DuelError::config(format!("tracing init: {}", e)))?;

        Ok(TracingGuard { provider })
    }

    #[cfg(not(feature = "otlp"))]
    {
        if config.otlp_endpoint.is_some() {
            eprintln!("otlp endpoint ignored: built without the `otlp` feature");
        }
        registry
            .try_init()
            .map_err(|e| DuelError::config(format!("tracing init: {}", e)))?;

        Ok(TracingGuard {})
    }
}

#[cfg(feature = "otlp")]
mod otlp {
    use opentelemetry::KeyValue;
    use opentelemetry_otlp::WithExportConfig;
    use opentelemetry_sdk::{
        runtime,
        trace::{Config as TraceConfig, Sampler, TracerProvider},
        Resource,
    };

    use crate::error::{DuelError, Result};

    pub(super) fn init_tracer(service_name: &str, endpoint: &str) -> Result<TracerProvider> {
        let exporter = opentelemetry_otlp::new_exporter()
            .tonic()
            .with_endpoint(endpoint)
            .build_span_exporter()
            .map_err(|e| DuelError::config(format!("otlp exporter: {}", e)))?;

        let resource = Resource::new(vec![
            KeyValue::new("service.name", service_name.to_string()),
            KeyValue::new("service.version", env!("CARGO_PKG_VERSION").to_string()),
        ]);

        Ok(TracerProvider::builder()
            .with_batch_exporter(exporter, runtime::Tokio)
            .with_config(
                TraceConfig::default()
                    .with_sampler(Sampler::AlwaysOn)
                    .with_resource(resource),
            )
            .build())
    }
}

/// Flushes exported spans on drop.
pub struct TracingGuard {
    #[cfg(feature = "otlp")]
    provider: Option<opentelemetry_sdk::trace::TracerProvider>,
}

impl Drop for TracingGuard {
    fn drop(&mut self) {
        #[cfg(feature = "otlp")]
        if let Some(provider) = self.provider.take() {
            if let Err(e) = provider.shutdown() {
                eprintln!("Error shutting down tracer provider: {:?}", e);
            }
        }
    }
}
