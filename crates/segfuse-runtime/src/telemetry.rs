//! Logging and trace export.
//!
//! Call [`init_tracing`] once at process startup.  Pipeline stages are
//! instrumented with spans (`FusionPipeline::process`, `ChannelDecoder::decode`,
//! `estimate`), so an OTLP collector shows per-frame timings.
//!
//! # Environment variables
//!
//! | Variable | Effect |
//! |---|---|
//! | `OTEL_EXPORTER_OTLP_ENDPOINT` | OTLP/HTTP collector URL (e.g. `http://localhost:4318`). Enables span export. |
//! | `RUST_LOG` | Log filter (default `"info"`). |
//! | `SEGFUSE_LOG_FORMAT` | `json` for newline-delimited JSON, anything else for compact text. |
//!
//! # Example
//!
//! ```rust,no_run
//! let _guard = segfuse_runtime::telemetry::init_tracing("segfuse");
//! ```

use opentelemetry::trace::TracerProvider as _;
use opentelemetry_otlp::WithExportConfig;
use opentelemetry_sdk::{Resource, trace::SdkTracerProvider};
use tracing_subscriber::{EnvFilter, Layer, layer::SubscriberExt, util::SubscriberInitExt};

pub const LOG_FORMAT_VAR: &str = "SEGFUSE_LOG_FORMAT";
pub const OTLP_ENDPOINT_VAR: &str = "OTEL_EXPORTER_OTLP_ENDPOINT";

const DEFAULT_FILTER: &str = "info";

/// Console log layout.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    #[default]
    Compact,
    Json,
}

impl LogFormat {
    /// Interpret the value of [`LOG_FORMAT_VAR`].
    pub fn from_setting(value: Option<&str>) -> Self {
        match value.map(str::trim) {
            Some(v) if v.eq_ignore_ascii_case("json") => LogFormat::Json,
            _ => LogFormat::Compact,
        }
    }
}

/// Install the global `tracing` subscriber.
///
/// Logs go to stderr so stdout stays free for command output.  When
/// [`OTLP_ENDPOINT_VAR`] is set, spans are exported over OTLP/HTTP as well.
///
/// Hold the returned [`TracerProviderGuard`] for the lifetime of the
/// process; dropping it flushes pending spans.
pub fn init_tracing(service_name: &str) -> TracerProviderGuard {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));
    let format = LogFormat::from_setting(std::env::var(LOG_FORMAT_VAR).ok().as_deref());
    let provider = build_provider(service_name, std::env::var(OTLP_ENDPOINT_VAR).ok());

    let otel = provider
        .as_ref()
        .map(|p| tracing_opentelemetry::layer().with_tracer(p.tracer("segfuse")));
    let console = tracing_subscriber::fmt::layer().with_writer(std::io::stderr);
    let console = match format {
        LogFormat::Json => console.json().boxed(),
        LogFormat::Compact => console.compact().boxed(),
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(otel)
        .with(console)
        .init();

    TracerProviderGuard(provider)
}

/// Shuts the OTel [`SdkTracerProvider`] down on drop, flushing pending
/// spans.
pub struct TracerProviderGuard(Option<SdkTracerProvider>);

impl Drop for TracerProviderGuard {
    fn drop(&mut self) {
        if let Some(provider) = self.0.take()
            && let Err(e) = provider.shutdown()
        {
            eprintln!("[segfuse] trace provider shutdown failed: {e}");
        }
    }
}

/// Build a provider exporting to `endpoint`, or `None` without one.
///
/// Exporter errors are reported on stderr and also yield `None`; the
/// process then logs to the console only.
fn build_provider(service_name: &str, endpoint: Option<String>) -> Option<SdkTracerProvider> {
    let exporter = opentelemetry_otlp::SpanExporter::builder()
        .with_http()
        .with_endpoint(endpoint?)
        .build()
        .map_err(|e| eprintln!("[segfuse] OTLP exporter init failed: {e}"))
        .ok()?;

    // Simple exporter: the CLI builds its Tokio runtime after this call, so
    // nothing may spawn tasks here.
    let provider = SdkTracerProvider::builder()
        .with_resource(Resource::builder().with_service_name(service_name.to_string()).build())
        .with_simple_exporter(exporter)
        .build();
    Some(provider)
}
