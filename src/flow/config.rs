use std::{collections::HashMap, path::Path, sync::Arc, time::Duration};
use anyhow::Context;
use eip_adapter::{
    file::{FileExistsMode, FileSink, FileSource, DEFAULT_FILE_NAME_TEMPLATE},
    memory::LogSink,
    SinkAdapter, SourceAdapter,
};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{
    channel::ChannelSpec,
    config::{resolve_value, ConfigManager},
    endpoint::{Aggregator, ExpiryPolicy, Filter, LateArrivalPolicy, Reducer, ReleaseStrategy, Splitter, Transformer},
    error::FlowError,
    flow::{Flow, FlowBuilder, ShutdownPolicy},
    poller::Poller,
    registry::HandlerRegistry,
};

fn default_pattern() -> String {
    "*".to_string()
}

fn default_true() -> bool {
    true
}

fn default_drain_timeout_ms() -> u64 {
    5_000
}

fn default_max_messages() -> usize {
    1
}

fn default_log_sink() -> String {
    "log".to_string()
}

/// Declarative description of one flow, loaded from YAML or JSON.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct FlowConfig {
    pub name: String,
    /// Channels referenced by name below; undeclared names get default
    /// point-to-point channels.
    #[serde(default)]
    pub channels: Vec<ChannelSpec>,
    pub source: SourceConfig,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub poller: Option<PollerConfig>,
    #[serde(default)]
    pub endpoints: Vec<EndpointConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sink: Option<SinkConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_channel: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub discard_channel: Option<String>,
    #[serde(default = "default_drain_timeout_ms")]
    pub drain_timeout_ms: u64,
    #[serde(default)]
    pub shutdown: ShutdownPolicy,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SourceConfig {
    /// Poll a directory for files matching a wildcard pattern.
    File {
        directory: String,
        #[serde(default = "default_pattern")]
        pattern: String,
        #[serde(default = "default_true")]
        auto_create: bool,
    },
    /// Messages are sent to this channel by the embedding program.
    Channel { channel: String },
    /// A source registered under this name.
    Ref { name: String },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct PollerConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fixed_delay_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fixed_rate_ms: Option<u64>,
    #[serde(default)]
    pub initial_delay_ms: u64,
    #[serde(default = "default_max_messages")]
    pub max_messages_per_poll: usize,
}

impl Default for PollerConfig {
    fn default() -> Self {
        Self {
            fixed_delay_ms: Some(1_000),
            fixed_rate_ms: None,
            initial_delay_ms: 0,
            max_messages_per_poll: 1,
        }
    }
}

impl PollerConfig {
    fn to_poller(&self) -> Result<Poller, FlowError> {
        let poller = match (self.fixed_delay_ms, self.fixed_rate_ms) {
            (Some(delay), None) => Poller::fixed_delay(Duration::from_millis(delay)),
            (None, Some(rate)) => Poller::fixed_rate(Duration::from_millis(rate)),
            (None, None) => Poller::fixed_delay(Duration::from_millis(1_000)),
            (Some(_), Some(_)) => {
                return Err(FlowError::Config(
                    "poller takes either fixed_delay_ms or fixed_rate_ms, not both".into(),
                ));
            }
        };
        Ok(poller
            .initial_delay(Duration::from_millis(self.initial_delay_ms))
            .max_messages_per_poll(self.max_messages_per_poll))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct EndpointConfig {
    #[serde(flatten)]
    pub endpoint: EndpointSpec,
    /// Channel between this endpoint and the next one (or the flow end).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_channel: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub concurrency: Option<usize>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum EndpointSpec {
    Transformer(TransformOp),
    Filter(FilterRule),
    Splitter(SplitRule),
    Aggregator(AggregateConfig),
    ServiceActivator { service: String },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum TransformOp {
    UpperCase,
    LowerCase,
    Trim,
    /// `"[<epoch millis>] <payload>"`
    Stamp,
    Prefix { value: String },
    Suffix { value: String },
    Replace { from: String, to: String },
    Header { name: String, value: Value },
    Ref { name: String },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(tag = "rule", rename_all = "snake_case")]
pub enum FilterRule {
    NonEmpty,
    NonBlank,
    MinLength { min: usize },
    Matches { pattern: String },
    HeaderPresent { name: String },
    HeaderEquals { name: String, value: Value },
    Ref { name: String },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(tag = "rule", rename_all = "snake_case")]
pub enum SplitRule {
    Delimiter { delimiter: String },
    Lines,
    Array,
    Ref { name: String },
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize, JsonSchema)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ReleaseConfig {
    #[default]
    SequenceComplete,
    Count { count: usize },
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize, JsonSchema)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ReducerConfig {
    #[default]
    Concat,
    Join { separator: String },
    Collect,
    Ref { name: String },
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize, JsonSchema)]
pub struct AggregateConfig {
    #[serde(default)]
    pub release: ReleaseConfig,
    #[serde(default)]
    pub reducer: ReducerConfig,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
    #[serde(default)]
    pub expiry: ExpiryPolicy,
    #[serde(default)]
    pub late_arrival: LateArrivalPolicy,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retention_ms: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SinkConfig {
    File {
        directory: String,
        #[serde(default)]
        exists_mode: FileExistsMode,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        file_name: Option<String>,
    },
    Log {
        #[serde(default = "default_log_sink")]
        name: String,
    },
    /// Leave the flow open, ending in this channel.
    Channel { channel: String },
    Ref { name: String },
}

fn missing(what: &str, name: &str) -> FlowError {
    FlowError::Config(format!("no {} registered as `{}`", what, name))
}

impl FlowConfig {
    /// Parse YAML (or JSON, which is valid YAML) after `${KEY}` substitution.
    pub async fn from_yaml_str(text: &str, config: &ConfigManager) -> Result<FlowConfig, FlowError> {
        let raw: Value = serde_yaml_bw::from_str(text)
            .map_err(|e| FlowError::Config(format!("invalid flow file: {}", e)))?;
        Self::from_value(raw, config).await
    }

    pub async fn from_json_str(text: &str, config: &ConfigManager) -> Result<FlowConfig, FlowError> {
        let raw: Value = serde_json::from_str(text)
            .map_err(|e| FlowError::Config(format!("invalid flow file: {}", e)))?;
        Self::from_value(raw, config).await
    }

    async fn from_value(raw: Value, config: &ConfigManager) -> Result<FlowConfig, FlowError> {
        let resolved = resolve_value(raw, config).await?;
        serde_json::from_value(resolved).map_err(|e| FlowError::Config(format!("invalid flow file: {}", e)))
    }

    /// Load by extension: `.json` as JSON, anything else as YAML.
    pub async fn load(path: &Path, config: &ConfigManager) -> anyhow::Result<FlowConfig> {
        let text = tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("reading flow file {}", path.display()))?;
        let parsed = match path.extension().and_then(|e| e.to_str()) {
            Some("json") => Self::from_json_str(&text, config).await,
            _ => Self::from_yaml_str(&text, config).await,
        };
        parsed.with_context(|| format!("loading flow file {}", path.display()))
    }

    pub fn json_schema() -> Value {
        serde_json::to_value(schemars::schema_for!(FlowConfig)).unwrap_or(Value::Null)
    }

    /// Resolve handlers and assemble the flow. Nothing is started.
    pub fn build(&self, registry: &HandlerRegistry) -> Result<Flow, FlowError> {
        for spec in &self.channels {
            spec.validate()?;
        }
        let declared: HashMap<&str, &ChannelSpec> = self.channels.iter().map(|c| (c.name.as_str(), c)).collect();
        let channel = |name: &str| -> ChannelSpec {
            declared
                .get(name)
                .map(|spec| (*spec).clone())
                .unwrap_or_else(|| ChannelSpec::point_to_point(name))
        };

        let mut builder = FlowBuilder::new(self.name.clone())
            .drain_timeout(Duration::from_millis(self.drain_timeout_ms))
            .shutdown_policy(self.shutdown);

        builder = match &self.source {
            SourceConfig::Channel { channel: name } => builder.from_channel(channel(name)),
            SourceConfig::File { directory, pattern, auto_create } => {
                let source = FileSource::new(directory, pattern, *auto_create)
                    .map_err(|e| FlowError::Config(format!("file source `{}`: {}", directory, e)))?;
                builder.from_source(Arc::new(source), self.poller.clone().unwrap_or_default().to_poller()?)
            }
            SourceConfig::Ref { name } => {
                let source: Arc<dyn SourceAdapter> = registry.sources.get(name).ok_or_else(|| missing("source", name))?;
                builder.from_source(source, self.poller.clone().unwrap_or_default().to_poller()?)
            }
        };

        for ep in &self.endpoints {
            builder = match &ep.endpoint {
                EndpointSpec::Transformer(op) => builder.transform(op.build(registry)?),
                EndpointSpec::Filter(rule) => builder.filter(rule.build(registry)?),
                EndpointSpec::Splitter(rule) => builder.split(rule.build(registry)?),
                EndpointSpec::Aggregator(agg) => builder.aggregate(agg.build(registry)?),
                EndpointSpec::ServiceActivator { service } => {
                    builder.service_activator(registry.services.get(service).ok_or_else(|| missing("service", service))?)
                }
            };
            if let Some(n) = ep.concurrency {
                builder = builder.concurrency(n);
            }
            if let Some(name) = &ep.output_channel {
                builder = builder.channel(channel(name));
            }
        }

        builder = match &self.sink {
            None => builder,
            Some(SinkConfig::Channel { channel: name }) => builder.to_channel(channel(name)),
            Some(SinkConfig::Log { name }) => builder.handle(Arc::new(LogSink::new(name.clone()))),
            Some(SinkConfig::File { directory, exists_mode, file_name }) => {
                let sink = FileSink::new(directory, *exists_mode)
                    .with_file_name_template(file_name.as_deref().unwrap_or(DEFAULT_FILE_NAME_TEMPLATE));
                builder.handle(Arc::new(sink))
            }
            Some(SinkConfig::Ref { name }) => {
                let sink: Arc<dyn SinkAdapter> = registry.sinks.get(name).ok_or_else(|| missing("sink", name))?;
                builder.handle(sink)
            }
        };

        if let Some(name) = &self.error_channel {
            builder = builder.error_channel(channel(name));
        }
        if let Some(name) = &self.discard_channel {
            builder = builder.discard_channel(channel(name));
        }
        builder.build()
    }
}

impl TransformOp {
    fn build(&self, registry: &HandlerRegistry) -> Result<Transformer, FlowError> {
        Ok(match self {
            TransformOp::UpperCase => Transformer::upper_case(),
            TransformOp::LowerCase => Transformer::lower_case(),
            TransformOp::Trim => Transformer::trim(),
            TransformOp::Stamp => Transformer::stamp(),
            TransformOp::Prefix { value } => Transformer::prefix(value.clone()),
            TransformOp::Suffix { value } => Transformer::suffix(value.clone()),
            TransformOp::Replace { from, to } => Transformer::replace(from.clone(), to.clone()),
            TransformOp::Header { name, value } => Transformer::header(name.clone(), value.clone()),
            TransformOp::Ref { name } => registry.transformers.get(name).ok_or_else(|| missing("transformer", name))?,
        })
    }
}

impl FilterRule {
    fn build(&self, registry: &HandlerRegistry) -> Result<Filter, FlowError> {
        Ok(match self {
            FilterRule::NonEmpty => Filter::non_empty(),
            FilterRule::NonBlank => Filter::non_blank(),
            FilterRule::MinLength { min } => Filter::min_length(*min),
            FilterRule::Matches { pattern } => Filter::matches(pattern)?,
            FilterRule::HeaderPresent { name } => Filter::header_present(name.clone()),
            FilterRule::HeaderEquals { name, value } => Filter::header_equals(name.clone(), value.clone()),
            FilterRule::Ref { name } => registry.filters.get(name).ok_or_else(|| missing("filter", name))?,
        })
    }
}

impl SplitRule {
    fn build(&self, registry: &HandlerRegistry) -> Result<Splitter, FlowError> {
        Ok(match self {
            SplitRule::Delimiter { delimiter } => Splitter::delimiter(delimiter.clone()),
            SplitRule::Lines => Splitter::lines(),
            SplitRule::Array => Splitter::array(),
            SplitRule::Ref { name } => registry.splitters.get(name).ok_or_else(|| missing("splitter", name))?,
        })
    }
}

impl AggregateConfig {
    fn build(&self, registry: &HandlerRegistry) -> Result<Aggregator, FlowError> {
        let release = match self.release {
            ReleaseConfig::SequenceComplete => ReleaseStrategy::SequenceComplete,
            ReleaseConfig::Count { count } => ReleaseStrategy::Count(count),
        };
        let reducer = match &self.reducer {
            ReducerConfig::Concat => Reducer::Concat,
            ReducerConfig::Join { separator } => Reducer::Join(separator.clone()),
            ReducerConfig::Collect => Reducer::Collect,
            ReducerConfig::Ref { name } => registry.reducers.get(name).ok_or_else(|| missing("reducer", name))?,
        };
        let mut agg = Aggregator::new();
        if let Some(ms) = self.retention_ms {
            agg = agg.retention(Duration::from_millis(ms));
        }
        agg = agg
            .release(release)
            .reducer(reducer)
            .on_expiry(self.expiry)
            .on_late_arrival(self.late_arrival);
        if let Some(ms) = self.timeout_ms {
            agg = agg.timeout(Duration::from_millis(ms));
        }
        Ok(agg)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const FILE_FLOW: &str = r#"
name: csv-lines
source:
  type: file
  directory: ${IN_DIR}
  pattern: "*.csv"
poller:
  fixed_delay_ms: 250
endpoints:
  - kind: splitter
    rule: lines
  - kind: filter
    rule: non_empty
  - kind: transformer
    op: stamp
  - kind: transformer
    op: upper_case
    concurrency: 1
  - kind: aggregator
    reducer:
      type: join
      separator: "\n"
    timeout_ms: 5000
sink:
  type: file
  directory: ${OUT_DIR}
  exists_mode: append
error_channel: errors
channels:
  - name: errors
    mode: publish_subscribe
"#;

    fn manager(dir: &Path) -> ConfigManager {
        ConfigManager::map([
            ("IN_DIR", dir.join("in").display().to_string()),
            ("OUT_DIR", dir.join("out").display().to_string()),
        ])
    }

    #[tokio::test]
    async fn test_parse_file_flow() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = FlowConfig::from_yaml_str(FILE_FLOW, &manager(dir.path())).await.unwrap();

        assert_eq!(cfg.name, "csv-lines");
        assert!(matches!(&cfg.source, SourceConfig::File { pattern, auto_create: true, .. } if pattern == "*.csv"));
        assert_eq!(cfg.endpoints.len(), 5);
        assert_eq!(cfg.endpoints[2].endpoint, EndpointSpec::Transformer(TransformOp::Stamp));
        assert_eq!(cfg.endpoints[3].concurrency, Some(1));
        let EndpointSpec::Aggregator(agg) = &cfg.endpoints[4].endpoint else {
            panic!("expected aggregator");
        };
        assert_eq!(agg.reducer, ReducerConfig::Join { separator: "\n".into() });
        assert_eq!(agg.expiry, ExpiryPolicy::Discard);
        assert_eq!(cfg.drain_timeout_ms, 5_000);
    }

    #[tokio::test]
    async fn test_build_file_flow() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = FlowConfig::from_yaml_str(FILE_FLOW, &manager(dir.path())).await.unwrap();
        let flow = cfg.build(&HandlerRegistry::new()).unwrap();

        // The filter is fused into the splitter.
        assert_eq!(flow.stage_names().len(), 5);
        assert!(flow.channel("errors").is_some());
        assert!(dir.path().join("in").is_dir());
    }

    #[tokio::test]
    async fn test_unknown_ref_and_placeholder() {
        let yaml = "name: f\nsource: {type: channel, channel: in}\nendpoints:\n  - kind: transformer\n    op: ref\n    name: nope\n";
        let cfg = FlowConfig::from_yaml_str(yaml, &ConfigManager::map(Vec::<(String, String)>::new())).await.unwrap();
        let err = cfg.build(&HandlerRegistry::new()).unwrap_err();
        assert_eq!(err, FlowError::Config("no transformer registered as `nope`".into()));

        let err = FlowConfig::from_yaml_str(FILE_FLOW, &ConfigManager::map(Vec::<(String, String)>::new()))
            .await
            .unwrap_err();
        assert!(matches!(err, FlowError::Config(ref m) if m.contains("unresolved placeholder")));
    }

    #[tokio::test]
    async fn test_json_flow_with_registered_service() {
        let json = r#"{
            "name": "svc",
            "source": {"type": "channel", "channel": "in"},
            "endpoints": [{"kind": "service_activator", "service": "len", "output_channel": "lengths"}]
        }"#;
        let registry = HandlerRegistry::new().with_service(
            "len",
            crate::endpoint::ServiceActivator::new(|m| Ok(m.payload_str().map(|s| Value::from(s.len())))),
        );
        let cfg = FlowConfig::from_json_str(json, &ConfigManager::map(Vec::<(String, String)>::new())).await.unwrap();
        let flow = cfg.build(&registry).unwrap();
        assert_eq!(flow.channel_names(), vec!["in", "lengths"]);
    }

    #[tokio::test]
    async fn test_zero_capacity_channel_is_rejected() {
        let yaml = "name: f\nchannels:\n  - name: in\n    capacity: 0\nsource: {type: channel, channel: in}\nendpoints:\n  - kind: transformer\n    op: trim\n";
        let cfg = FlowConfig::from_yaml_str(yaml, &ConfigManager::map(Vec::<(String, String)>::new())).await.unwrap();
        let err = cfg.build(&HandlerRegistry::new()).unwrap_err();
        assert_eq!(err, FlowError::Config("channel `in`: capacity must be at least 1".into()));
    }

    #[tokio::test]
    async fn test_demo_flow_builds() {
        let dir = tempfile::tempdir().unwrap();
        let config = ConfigManager::map([
            ("INBOX", dir.path().join("in").display().to_string()),
            ("OUTBOX", dir.path().join("out").display().to_string()),
        ]);
        let cfg = FlowConfig::from_yaml_str(include_str!("../../demos/file_flow.yaml"), &config)
            .await
            .unwrap();
        assert_eq!(cfg.shutdown, ShutdownPolicy::Drain);
        let flow = cfg.build(&HandlerRegistry::new()).unwrap();
        assert_eq!(flow.name(), "csv-records");
    }

    #[test]
    fn test_schema_mentions_endpoints() {
        let schema = FlowConfig::json_schema().to_string();
        assert!(schema.contains("endpoints"));
        assert!(schema.contains("fixed_delay_ms"));
    }
}
