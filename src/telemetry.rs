use opentelemetry::trace::TraceId;
use tracing_subscriber::{prelude::*, EnvFilter, Registry};

/// Output format of the log lines
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, clap::ValueEnum)]
pub enum LogFormat {
    #[default]
    Compact,
    Json,
}

/// Fetch an opentelemetry::trace::TraceId as hex through the full tracing stack
pub fn get_trace_id() -> Option<TraceId> {
    use opentelemetry::trace::TraceContextExt as _; // opentelemetry::Context -> opentelemetry::trace::Span
    use tracing_opentelemetry::OpenTelemetrySpanExt as _; // tracing::Span to opentelemetry::Context

    match tracing::Span::current()
        .context()
        .span()
        .span_context()
        .trace_id()
    {
        TraceId::INVALID => None,
        valid => Some(valid),
    }
}

#[cfg(feature = "telemetry")]
fn init_tracer() -> anyhow::Result<opentelemetry::sdk::trace::Tracer> {
    use anyhow::Context as _;
    use opentelemetry::sdk::{trace, Resource};
    use opentelemetry::KeyValue;
    use opentelemetry_otlp::WithExportConfig;

    let otlp_endpoint = std::env::var("OPENTELEMETRY_ENDPOINT_URL")
        .context("an otel collector must be configured via OPENTELEMETRY_ENDPOINT_URL")?;

    let tracer = opentelemetry_otlp::new_pipeline()
        .tracing()
        .with_exporter(
            opentelemetry_otlp::new_exporter()
                .tonic()
                .with_endpoint(otlp_endpoint),
        )
        .with_trace_config(trace::config().with_resource(Resource::new(vec![KeyValue::new(
            "service.name",
            "switchyard-reconciler",
        )])))
        .install_batch(opentelemetry::runtime::Tokio)?;
    Ok(tracer)
}

/// Initialize tracing
pub fn init(format: LogFormat) -> anyhow::Result<()> {
    #[cfg(feature = "telemetry")]
    let telemetry = tracing_opentelemetry::layer().with_tracer(init_tracer()?);

    let (compact, json) = match format {
        LogFormat::Compact => (Some(tracing_subscriber::fmt::layer().compact()), None),
        LogFormat::Json => (None, Some(tracing_subscriber::fmt::layer().json())),
    };
    let env_filter = EnvFilter::try_from_default_env().or_else(|_| EnvFilter::try_new("info"))?;

    #[cfg(feature = "telemetry")]
    let collector = Registry::default()
        .with(telemetry)
        .with(compact)
        .with(json)
        .with(env_filter);
    #[cfg(not(feature = "telemetry"))]
    let collector = Registry::default().with(compact).with(json).with(env_filter);

    tracing::subscriber::set_global_default(collector)?;
    Ok(())
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn no_trace_id_outside_an_exported_span() {
        assert_eq!(get_trace_id(), None);
    }

    // requires OPENTELEMETRY_ENDPOINT_URL pointing to a collector
    #[cfg(feature = "telemetry")]
    #[tokio::test]
    #[ignore = "requires a trace exporter"]
    async fn get_trace_id_returns_valid_traces() {
        super::init(LogFormat::Compact).unwrap();
        #[tracing::instrument(name = "test_span")]
        fn test_trace_id() -> Option<TraceId> {
            get_trace_id()
        }
        assert_ne!(test_trace_id(), None, "valid trace");
        assert_ne!(test_trace_id(), Some(TraceId::INVALID), "valid trace");
    }
}
