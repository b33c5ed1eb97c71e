//! Provides helper functions for initializing telemetry collection and publication.
use anyhow::Result;
use opentelemetry_otlp::WithExportConfig;
use opentelemetry_sdk::{runtime, Resource};
use tracing_subscriber::{prelude::*, EnvFilter, Registry};

/// Initialize tracing.
///
/// Logs are always written to stderr; if an `otlp_endpoint` is provided spans
/// are additionally exported over OTLP. The `default_directive` applies when
/// `RUST_LOG` is not set.
pub async fn init_tracing(otlp_endpoint: Option<String>, default_directive: &str) -> Result<()> {
    // Setup log filter
    let log_filter = EnvFilter::builder()
        .with_default_directive(default_directive.parse()?)
        .from_env()?;

    // If we have an otlp_endpoint setup export of traces
    if let Some(otlp_endpoint) = otlp_endpoint {
        let tracer = opentelemetry_otlp::new_pipeline()
            .tracing()
            .with_exporter(
                opentelemetry_otlp::new_exporter()
                    .tonic()
                    .with_endpoint(otlp_endpoint.clone()),
            )
            .with_trace_config(
                opentelemetry_sdk::trace::config().with_resource(Resource::new(vec![
                    opentelemetry::KeyValue::new(
                        "hostname",
                        gethostname::gethostname()
                            .into_string()
                            .expect("hostname should be valid utf-8"),
                    ),
                    opentelemetry::KeyValue::new("service.name", "stampede"),
                ])),
            )
            .install_batch(runtime::Tokio)?;

        // Setup otlp export filter
        let otlp_filter = EnvFilter::builder()
            .with_default_directive(default_directive.parse()?)
            .from_env()?;

        // Setup tracing layers
        let telemetry = tracing_opentelemetry::layer()
            .with_tracer(tracer)
            .with_filter(otlp_filter);
        // Setup logging to stderr
        let logger = tracing_subscriber::fmt::layer()
            .with_ansi(true)
            .compact()
            .with_filter(log_filter);

        let collector = Registry::default().with(telemetry).with(logger);

        tracing::subscriber::set_global_default(collector)?;
    } else {
        // Setup basic log only tracing
        let logger = tracing_subscriber::fmt::layer()
            .with_ansi(true)
            .compact()
            .with_filter(log_filter);
        tracing_subscriber::registry().with(logger).init()
    }
    Ok(())
}
