use std::{path::PathBuf, sync::OnceLock};
use anyhow::Context;
use opentelemetry::global;
use opentelemetry_appender_tracing::layer::OpenTelemetryTracingBridge;
use opentelemetry_otlp::{LogExporter, MetricExporter, Protocol, WithExportConfig};
use opentelemetry_sdk::{logs::SdkLoggerProvider, metrics::SdkMeterProvider, Resource};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, prelude::*, EnvFilter, Layer, Registry};

pub const LOG_FILE_PREFIX: &str = "eipflow.log";

/// How the process reports what it is doing.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct LogSettings {
    /// An `EnvFilter` directive such as `info` or `eipflow=debug,warn`.
    pub log_level: String,
    /// Daily rolling log files are written here when set.
    pub log_dir: Option<PathBuf>,
    /// Base URL of an OTLP/HTTP collector for logs and metrics.
    pub otel_endpoint: Option<String>,
    /// Newline-delimited JSON on stdout instead of the human format.
    pub json: bool,
}

impl Default for LogSettings {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            log_dir: None,
            otel_endpoint: None,
            json: false,
        }
    }
}

impl LogSettings {
    pub fn new(log_level: impl Into<String>) -> Self {
        Self {
            log_level: log_level.into(),
            ..Self::default()
        }
    }

    pub fn with_log_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.log_dir = Some(dir.into());
        self
    }

    pub fn with_otel_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.otel_endpoint = Some(endpoint.into());
        self
    }

    pub fn json(mut self, json: bool) -> Self {
        self.json = json;
        self
    }
}

static RESOURCE: OnceLock<Resource> = OnceLock::new();
fn get_resource() -> Resource {
    RESOURCE
        .get_or_init(|| Resource::builder().with_service_name("eipflow").build())
        .clone()
}

fn signal_endpoint(base: &str, signal: &str) -> String {
    format!("{}/v1/{}", base.trim_end_matches('/'), signal)
}

fn init_logs(endpoint: &str) -> anyhow::Result<SdkLoggerProvider> {
    let exporter = LogExporter::builder()
        .with_http()
        .with_protocol(Protocol::HttpBinary)
        .with_endpoint(signal_endpoint(endpoint, "logs"))
        .build()
        .context("building OTLP log exporter")?;
    Ok(SdkLoggerProvider::builder()
        .with_batch_exporter(exporter)
        .with_resource(get_resource())
        .build())
}

fn init_metrics(endpoint: &str) -> anyhow::Result<SdkMeterProvider> {
    let exporter = MetricExporter::builder()
        .with_http()
        .with_protocol(Protocol::HttpBinary)
        .with_endpoint(signal_endpoint(endpoint, "metrics"))
        .build()
        .context("building OTLP metric exporter")?;
    Ok(SdkMeterProvider::builder()
        .with_periodic_exporter(exporter)
        .with_resource(get_resource())
        .build())
}

fn level_filter(level: &str) -> anyhow::Result<EnvFilter> {
    EnvFilter::try_new(level).with_context(|| format!("invalid log level `{}`", level))
}

/// Keeps exporters and the file writer alive; call `shutdown` before exit
/// so buffered records are flushed.
pub struct Telemetry {
    logger_provider: Option<SdkLoggerProvider>,
    meter_provider: Option<SdkMeterProvider>,
    file_guard: Option<WorkerGuard>,
}

impl Telemetry {
    pub fn exports_otel(&self) -> bool {
        self.logger_provider.is_some()
    }

    pub fn shutdown(mut self) {
        if let Some(provider) = self.meter_provider.take() {
            if let Err(e) = provider.shutdown() {
                warn!("meter provider shutdown failed: {}", e);
            }
        }
        if let Some(provider) = self.logger_provider.take() {
            if let Err(e) = provider.shutdown() {
                warn!("logger provider shutdown failed: {}", e);
            }
        }
        drop(self.file_guard.take());
    }
}

/// Install the global `tracing` subscriber. Fails if one is already set.
pub fn init_tracing(settings: &LogSettings) -> anyhow::Result<Telemetry> {
    let mut layers: Vec<Box<dyn Layer<Registry> + Send + Sync>> = Vec::new();

    let stdout: Box<dyn Layer<Registry> + Send + Sync> = if settings.json {
        fmt::layer().json().with_target(true).with_filter(level_filter(&settings.log_level)?).boxed()
    } else {
        fmt::layer()
            .with_thread_names(true)
            .with_filter(level_filter(&settings.log_level)?)
            .boxed()
    };
    layers.push(stdout);

    let mut file_guard = None;
    if let Some(dir) = &settings.log_dir {
        std::fs::create_dir_all(dir).with_context(|| format!("creating log directory {}", dir.display()))?;
        let appender = tracing_appender::rolling::daily(dir, LOG_FILE_PREFIX);
        let (writer, guard) = tracing_appender::non_blocking(appender);
        file_guard = Some(guard);
        layers.push(
            fmt::layer()
                .with_writer(writer)
                .with_ansi(false)
                .with_filter(level_filter(&settings.log_level)?)
                .boxed(),
        );
    }

    let mut logger_provider = None;
    let mut meter_provider = None;
    if let Some(endpoint) = &settings.otel_endpoint {
        let logs = init_logs(endpoint)?;
        let filter = level_filter(&settings.log_level)?
            .add_directive("hyper=off".parse()?)
            .add_directive("tonic=off".parse()?)
            .add_directive("h2=off".parse()?)
            .add_directive("reqwest=off".parse()?);
        layers.push(OpenTelemetryTracingBridge::new(&logs).with_filter(filter).boxed());
        logger_provider = Some(logs);

        let metrics = init_metrics(endpoint)?;
        global::set_meter_provider(metrics.clone());
        meter_provider = Some(metrics);
    }

    Registry::default()
        .with(layers)
        .try_init()
        .context("installing tracing subscriber")?;

    info!(
        level = %settings.log_level,
        log_dir = ?settings.log_dir,
        otel = settings.otel_endpoint.is_some(),
        "logging initialised"
    );
    Ok(Telemetry {
        logger_provider,
        meter_provider,
        file_guard,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_signal_endpoint() {
        assert_eq!(signal_endpoint("http://localhost:4318/", "logs"), "http://localhost:4318/v1/logs");
        assert_eq!(signal_endpoint("http://collector", "metrics"), "http://collector/v1/metrics");
    }

    #[test]
    fn test_bad_level_is_rejected() {
        assert!(level_filter("info").is_ok());
        assert!(level_filter("eipflow=loud").is_err());
    }

    #[test]
    fn test_file_logging() {
        let dir = tempfile::tempdir().unwrap();
        let settings = LogSettings::new("info").with_log_dir(dir.path());
        let telemetry = init_tracing(&settings).unwrap();
        assert!(!telemetry.exports_otel());
        info!("written to the rolling file");
        telemetry.shutdown();

        let logs: Vec<_> = std::fs::read_dir(dir.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().starts_with(LOG_FILE_PREFIX))
            .collect();
        assert_eq!(logs.len(), 1);
        let text = std::fs::read_to_string(logs[0].path()).unwrap();
        assert!(text.contains("written to the rolling file"));

        // Only one global subscriber per process.
        assert!(init_tracing(&LogSettings::default()).is_err());
    }
}
